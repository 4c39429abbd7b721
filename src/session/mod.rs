// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per server session state
//!
//! A [`ThdNdb`] belongs to one server session. It owns the cluster
//! transaction every handler of the session defines its operations into,
//! the counters of pending work, the batch arena and, for replication
//! applier sessions, the [`Applier`].
//!
//! Handlers reach their session through a [`SharedSession`] and hold the
//! lock for the duration of one handler call.

pub mod arena;
mod executor;
pub mod statement;
pub mod trans_stats;
pub mod warning;

pub use arena::BatchArena;
pub use executor::ndb_to_mysql_error;
pub use statement::StatementContext;
pub use trans_stats::{TableTransStats, TransTableStats};
pub use warning::{Warning, WarningLevel};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::error::NDB_ERR_CLUSTER_FAILURE;
use crate::cluster::types::TransactionHint;
use crate::cluster::{AbortOption, ExecType, NdbClient, NdbTransaction};
use crate::config::SessionConfig;
use crate::conflict::{Applier, OPS_DEFINED};
use crate::core::{Error, Result};
use crate::stats::{NullStatsPublisher, SessionCounters, StatsPublisher};

/// Session handle shared by the handlers opened in the session
pub type SharedSession = Arc<Mutex<ThdNdb>>;

/// Statement scoped transaction options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransOption {
    /// Commit as rows are written; used to fragment a copying ALTER
    TransactionsOff,
    /// Changes are not written to the binlog
    NoLogging,
}

impl TransOption {
    fn bit(self) -> u32 {
        match self {
            TransOption::TransactionsOff => 1 << 1,
            TransOption::NoLogging => 1 << 3,
        }
    }
}

pub struct ThdNdb {
    client: Arc<dyn NdbClient>,
    config: SessionConfig,
    /// Open cluster transaction, if any
    pub(crate) trans: Option<Box<dyn NdbTransaction>>,
    /// Estimated bytes of operations defined but not executed
    pub(crate) unsent_bytes: usize,
    /// Blob operations are pending; scans must flush before advancing
    pub(crate) unsent_blob_ops: bool,
    pub(crate) counters: SessionCounters,
    trans_options: u32,
    pub(crate) applier: Option<Applier>,
    pub(crate) arena: BatchArena,
    pub(crate) warnings: Vec<Warning>,
    pub(crate) trans_stats: TransTableStats,
    pub(crate) statement: StatementContext,
    connect_count: u64,
    publisher: Arc<dyn StatsPublisher>,
}

impl std::fmt::Debug for ThdNdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThdNdb")
            .field("has_transaction", &self.trans.is_some())
            .field("unsent_bytes", &self.unsent_bytes)
            .field("unsent_blob_ops", &self.unsent_blob_ops)
            .field("counters", &self.counters)
            .field("trans_options", &self.trans_options)
            .field("applier", &self.applier)
            .field("arena", &self.arena)
            .field("statement", &self.statement)
            .finish()
    }
}

impl ThdNdb {
    pub fn new(client: Arc<dyn NdbClient>, config: SessionConfig) -> Self {
        let connect_count = client.connect_count();
        let arena = BatchArena::new(config.batch_mem_limit);
        Self {
            client,
            config,
            trans: None,
            unsent_bytes: 0,
            unsent_blob_ops: false,
            counters: SessionCounters::default(),
            trans_options: 0,
            applier: None,
            arena,
            warnings: Vec::new(),
            trans_stats: TransTableStats::new(),
            statement: StatementContext::default(),
            connect_count,
            publisher: Arc::new(NullStatsPublisher),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatsPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Make this an applier session
    pub fn with_applier(mut self, applier: Applier) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn client(&self) -> &Arc<dyn NdbClient> {
        &self.client
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn last_commit_epoch(&self) -> u64 {
        self.counters.last_commit_epoch_session
    }

    pub fn unsent_bytes(&self) -> usize {
        self.unsent_bytes
    }

    pub fn has_unsent_blob_ops(&self) -> bool {
        self.unsent_blob_ops
    }

    pub fn arena(&self) -> &BatchArena {
        &self.arena
    }

    pub fn trans_stats(&self) -> &TransTableStats {
        &self.trans_stats
    }

    pub fn statement(&self) -> &StatementContext {
        &self.statement
    }

    /// Install the context of the statement about to run
    pub fn start_statement(&mut self, statement: StatementContext) {
        self.statement = statement;
    }

    /// Warnings pushed since the last [`clear_warnings`](Self::clear_warnings)
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    pub fn push_warning(&mut self, code: i32, message: impl Into<String>) {
        warning::push_warning(&mut self.warnings, WarningLevel::Warning, code, message);
    }

    // ---- Transaction ----

    pub fn has_transaction(&self) -> bool {
        self.trans.is_some()
    }

    /// Client reconnected since the session was created
    pub fn is_connection_stale(&self) -> bool {
        self.connect_count != self.client.connect_count()
    }

    /// Start a transaction unless one is open
    pub fn acquire_transaction(
        &mut self,
        hint: Option<&TransactionHint>,
    ) -> Result<&mut (dyn NdbTransaction + 'static)> {
        if self.trans.is_none() {
            if self.is_connection_stale() {
                tracing::info!(
                    old = self.connect_count,
                    new = self.client.connect_count(),
                    "cluster reconnected, refreshing session"
                );
                self.connect_count = self.client.connect_count();
            }
            let trans = self.client.start_transaction(hint).map_err(|err| {
                if err.code == NDB_ERR_CLUSTER_FAILURE {
                    Error::NoConnection(err.message.clone())
                } else {
                    let code = ndb_to_mysql_error(&err, &mut self.warnings);
                    tracing::warn!(code = err.code, handler_code = code, "failed to start transaction");
                    Error::from_ndb(err)
                }
            })?;
            tracing::debug!(hinted = hint.is_some(), "transaction started");
            self.trans = Some(trans);
        }
        self.transaction()
    }

    /// The open transaction
    pub fn transaction(&mut self) -> Result<&mut (dyn NdbTransaction + 'static)> {
        self.trans
            .as_deref_mut()
            .ok_or_else(|| Error::internal("no transaction started"))
    }

    pub fn check_trans_option(&self, option: TransOption) -> bool {
        self.trans_options & option.bit() != 0
    }

    pub fn set_trans_option(&mut self, option: TransOption) {
        self.trans_options |= option.bit();
    }

    pub fn clear_trans_option(&mut self, option: TransOption) {
        self.trans_options &= !option.bit();
    }

    /// Statement ended; statement scoped options reset
    pub fn end_statement(&mut self) {
        self.trans_options = 0;
    }

    // ---- Batching ----

    fn batch_size(&self) -> usize {
        if self.applier.is_some() {
            self.config.replica_batch_size
        } else {
            self.config.batch_size
        }
    }

    /// Account `bytes` of a defined operation; true when the batch is full
    pub fn add_row_check_if_batch_full(&mut self, bytes: usize) -> bool {
        if self.unsent_bytes == 0 {
            self.arena.clear();
        }
        self.unsent_bytes += bytes;
        self.unsent_bytes >= self.batch_size()
    }

    /// Copy bytes that must stay valid until the batch is executed
    pub fn copy_to_batch_mem(&mut self, bytes: &[u8]) -> Result<Arc<[u8]>> {
        self.arena.copy(bytes)
    }

    pub fn get_blob_write_batch_size(&self) -> usize {
        if self.applier.is_some() {
            self.config.replica_blob_write_batch_bytes
        } else {
            self.config.blob_write_batch_bytes
        }
    }

    // ---- Applier ----

    pub fn get_applier(&self) -> Option<&Applier> {
        self.applier.as_ref()
    }

    pub fn get_applier_mut(&mut self) -> Option<&mut Applier> {
        self.applier.as_mut()
    }

    pub fn is_applier(&self) -> bool {
        self.applier.is_some()
    }

    // ---- Commit and rollback ----

    fn close_transaction(&mut self) {
        self.trans = None;
        self.unsent_bytes = 0;
        self.unsent_blob_ops = false;
        self.arena.clear();
    }

    /// Commit the open transaction
    pub fn commit(&mut self) -> Result<()> {
        if self.trans.is_none() {
            return Ok(());
        }
        let force_send = self.config.force_send;
        let result = self.execute_commit(force_send, false);
        match result {
            Ok(_) => {
                self.trans_stats.commit();
                tracing::debug!(epoch = self.counters.last_commit_epoch_session, "committed");
            }
            Err(ref err) => {
                self.trans_stats.invalidate();
                tracing::warn!(error = %err, "commit failed");
            }
        }
        self.publisher.publish_session(&self.counters);
        self.close_transaction();
        result.map(|_| ()).map_err(|err| self.map_error(err))
    }

    /// Abort the open transaction
    pub fn rollback(&mut self) -> Result<()> {
        let Some(trans) = self.trans.as_deref_mut() else {
            return Ok(());
        };
        let result = trans.execute(
            ExecType::Rollback,
            AbortOption::IgnoreError,
            self.config.force_send,
        );
        if let Some(applier) = self.applier.as_mut() {
            // A failed execute already ran the abort hook and cleared the flags
            if applier.has_flag(OPS_DEFINED) {
                applier.at_transaction_abort();
            }
        }
        self.trans_stats.invalidate();
        self.close_transaction();
        tracing::debug!("rolled back");
        result.map_err(|err| self.map_error(Error::Cluster(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::NdbError;

    fn session(config: SessionConfig) -> (MemoryCluster, ThdNdb) {
        let cluster = MemoryCluster::new();
        let thd = ThdNdb::new(Arc::new(cluster.clone()), config);
        (cluster, thd)
    }

    #[test]
    fn test_batch_full_threshold() {
        let (_, mut thd) = session(SessionConfig::default().with_batch_size(100));
        assert!(!thd.add_row_check_if_batch_full(60));
        assert!(thd.add_row_check_if_batch_full(60));
        assert_eq!(thd.unsent_bytes(), 120);
    }

    #[test]
    fn test_applier_uses_replica_sizes() {
        let config = SessionConfig::default()
            .with_batch_size(10)
            .with_replica_batch_size(1000);
        let (_, thd) = session(config);
        let mut thd = thd.with_applier(Applier::new("default", 1));
        assert!(!thd.add_row_check_if_batch_full(500));
        assert_eq!(
            thd.get_blob_write_batch_size(),
            thd.config().replica_blob_write_batch_bytes
        );
    }

    #[test]
    fn test_trans_options_are_statement_scoped() {
        let (_, mut thd) = session(SessionConfig::default());
        thd.set_trans_option(TransOption::TransactionsOff);
        assert!(thd.check_trans_option(TransOption::TransactionsOff));
        assert!(!thd.check_trans_option(TransOption::NoLogging));
        thd.end_statement();
        assert!(!thd.check_trans_option(TransOption::TransactionsOff));
    }

    #[test]
    fn test_acquire_transaction_failure() {
        let (cluster, mut thd) = session(SessionConfig::default());
        cluster.fail_next_start_transaction(NdbError::cluster_failure());
        assert!(matches!(
            thd.acquire_transaction(None),
            Err(Error::NoConnection(_))
        ));
        assert!(!thd.has_transaction());

        thd.acquire_transaction(None).unwrap();
        assert!(thd.has_transaction());
    }

    #[test]
    fn test_copy_to_batch_mem_cleared_with_batch() {
        let (_, mut thd) = session(SessionConfig::default());
        thd.add_row_check_if_batch_full(10);
        let copy = thd.copy_to_batch_mem(b"blob").unwrap();
        assert_eq!(&copy[..], b"blob");
        assert_eq!(thd.arena().used(), 4);
        thd.unsent_bytes = 0;
        thd.add_row_check_if_batch_full(10);
        assert!(thd.arena().is_empty());
    }

    #[test]
    fn test_rollback_without_transaction() {
        let (_, mut thd) = session(SessionConfig::default());
        thd.rollback().unwrap();
        thd.commit().unwrap();
        assert_eq!(thd.counters().execute_count, 0);
    }
}
