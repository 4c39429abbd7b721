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

//! Pushed joins, handler side
//!
//! The join planner prepares a [`PushedJoinDef`] and hands every table of
//! the join a [`PushedJoin`] naming its member. The root handler binds the
//! key of its lookup and creates the query; the data nodes then resolve
//! every child lookup, and child handlers only fetch their member's row.

use std::sync::Arc;

use parking_lot::Mutex;

use super::Ha;
use crate::cluster::{LockMode, PushedJoinDef, QueryId, ScanStep};
use crate::core::{Error, PushedAccess, ReadFlag, Result, Row, Value};
use crate::session::ThdNdb;

/// A pushed join shared by the handlers of its members
#[derive(Debug)]
pub struct PushedJoinPlan {
    def: PushedJoinDef,
    /// How the root member is read
    root_access: PushedAccess,
    /// Root index, `None` for table scans
    root_index: Option<usize>,
    /// Query instantiated by the root, read by the children
    query: Mutex<Option<QueryId>>,
}

/// The part one table plays in a pushed join
#[derive(Debug, Clone)]
pub struct PushedJoin {
    plan: Arc<PushedJoinPlan>,
    member: usize,
}

impl PushedJoin {
    /// Handles for every member of `def`, root first
    pub fn prepare(def: PushedJoinDef, root_access: PushedAccess, root_index: Option<usize>) -> Vec<PushedJoin> {
        let members = def.members.len();
        let plan = Arc::new(PushedJoinPlan {
            def,
            root_access,
            root_index,
            query: Mutex::new(None),
        });
        (0..members)
            .map(|member| PushedJoin {
                plan: Arc::clone(&plan),
                member,
            })
            .collect()
    }

    pub fn member(&self) -> usize {
        self.member
    }

    pub fn is_root(&self) -> bool {
        self.member == 0
    }

    fn query(&self) -> Option<QueryId> {
        *self.plan.query.lock()
    }
}

impl Ha {
    /// Install this table's part of a prepared pushed join
    pub fn assign_pushed_join(&mut self, join: PushedJoin) {
        if join.is_root() {
            self.session.lock().counters.pushed_queries_defined += 1;
        }
        tracing::debug!(
            table = %self.table.name,
            member = join.member(),
            "pushed join assigned"
        );
        self.pushed = Some(join);
    }

    /// True when a read with `access` on `idx` can execute the pushed join
    pub fn check_if_pushable(&self, access: PushedAccess, idx: Option<usize>) -> bool {
        let thd = self.session.lock();
        self.is_pushable(&thd, access, idx)
    }

    fn is_pushable(&self, thd: &ThdNdb, access: PushedAccess, idx: Option<usize>) -> bool {
        let Some(join) = &self.pushed else {
            return false;
        };
        join.is_root()
            && thd.config().join_pushdown
            && !self.disable_pushed_join
            && self.lock_mode() == LockMode::CommittedRead
            && join.plan.root_access == access
            && join.plan.root_index == idx
    }

    /// Decide whether a root lookup goes through the pushed join, counting
    /// joins that had to be dropped
    pub(crate) fn pushed_root_lookup(
        &self,
        thd: &mut ThdNdb,
        access: PushedAccess,
        idx: Option<usize>,
    ) -> bool {
        if self.is_pushable(thd, access, idx) {
            return true;
        }
        if self.pushed.as_ref().is_some_and(PushedJoin::is_root) {
            thd.counters.pushed_queries_dropped += 1;
            tracing::debug!(table = %self.table.name, "pushed join not executable, reading alone");
        }
        false
    }

    /// This child table's rows come from the query created by the root
    pub fn check_is_pushed(&self) -> bool {
        match &self.pushed {
            Some(join) => !join.is_root() && !self.disable_pushed_join && join.query().is_some(),
            None => false,
        }
    }

    pub(crate) fn pushed_query_open(&self) -> bool {
        self.pushed
            .as_ref()
            .is_some_and(|j| j.is_root() && j.query().is_some())
    }

    pub(crate) fn close_pushed_query(&mut self, thd: &mut ThdNdb) {
        let Some(join) = self.pushed.as_ref().filter(|j| j.is_root()) else {
            return;
        };
        let query = join.plan.query.lock().take();
        if let (Some(query), Ok(trans)) = (query, thd.transaction()) {
            trans.close_query(query);
        }
    }

    /// Create the pushed query for a root key lookup and fetch the root row
    ///
    /// `key` holds the key parts in server key order.
    pub(crate) fn pushed_root_read(&mut self, thd: &mut ThdNdb, key: &[Value], row: &mut Row) -> Result<()> {
        let join = self
            .pushed
            .clone()
            .ok_or_else(|| Error::internal("pushed read without pushed join"))?;
        let idx = join
            .plan
            .root_index
            .ok_or_else(|| Error::internal("pushed lookup without index"))?;
        let params = self.indexes[idx]
            .unique_key_record()
            .map(|r| r.key_values(key))
            .ok_or_else(|| Error::index_offline(self.indexes[idx].name()))?;

        if join.plan.root_access == PushedAccess::PrimaryKey {
            self.start_transaction_key(thd, &params)?;
        } else {
            self.start_transaction_part(thd, None)?;
        }
        // Pending changes must be visible to the lookups
        if thd.unsent_bytes > 0 {
            if let Err(err) = thd.execute_no_commit(self.ignore_no_key) {
                return Err(self.ndb_err(thd, err));
            }
        }
        self.close_pushed_query(thd);

        let created = thd.transaction()?.create_query(&join.plan.def, params);
        let query = created.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))?;
        *join.plan.query.lock() = Some(query);
        thd.counters.pushed_queries_executed += 1;

        if !self.fetch_pushed(thd, &join, row)? {
            return Err(Error::KeyNotFound);
        }
        Ok(())
    }

    /// Next row of this table's member; false when there is none
    fn fetch_pushed(&mut self, thd: &mut ThdNdb, join: &PushedJoin, row: &mut Row) -> Result<bool> {
        let Some(query) = join.query() else {
            return Ok(false);
        };
        loop {
            let step = thd.transaction()?.query_next(query, join.member(), true);
            match step.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))? {
                ScanStep::Row(found) => {
                    thd.counters.pushed_reads += 1;
                    self.prepare_row(row);
                    self.row_record.unpack(&found.values, row)?;
                    self.capture_position_extras(&found.extra);
                    if self.condition_holds(row) {
                        return Ok(true);
                    }
                }
                ScanStep::NoMoreRecords | ScanStep::NoMoreCached => return Ok(false),
            }
        }
    }

    /// Read this child's row of the pushed join, or fall back to a key read
    pub fn index_read_pushed(&mut self, row: &mut Row, key: &[Value]) -> Result<()> {
        if !self.check_is_pushed() {
            return self.index_read(row, key, ReadFlag::KeyExact);
        }
        self.next_pushed(row)
    }

    pub fn index_next_pushed(&mut self, row: &mut Row) -> Result<()> {
        if !self.check_is_pushed() {
            return self.index_next(row);
        }
        self.next_pushed(row)
    }

    fn next_pushed(&mut self, row: &mut Row) -> Result<()> {
        let Some(join) = self.pushed.clone() else {
            return Err(Error::EndOfFile);
        };
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if self.fetch_pushed(&mut thd, &join, row)? {
            Ok(())
        } else {
            Err(Error::EndOfFile)
        }
    }
}
