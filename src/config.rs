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

//! Session configuration
//!

/// Role of this cluster in an active-active replication setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConflictRole {
    /// Role not set; functions that need a role refuse to run
    #[default]
    None,
    Primary,
    Secondary,
    /// Conflict detection disabled, rows applied as received
    Pass,
}

impl ConflictRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictRole::None => "NONE",
            ConflictRole::Primary => "PRIMARY",
            ConflictRole::Secondary => "SECONDARY",
            ConflictRole::Pass => "PASS",
        }
    }
}

/// Per session configuration of the handler
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes of pending operations that trigger a flush
    /// Default: 32768 (32KB)
    pub batch_size: usize,

    /// Batch size used by replication applier sessions
    /// Default: 2097152 (2MB)
    pub replica_batch_size: usize,

    /// Blob bytes read per round trip
    /// Default: 65536 (64KB)
    pub blob_read_batch_bytes: usize,

    /// Blob bytes written per round trip
    /// Default: 65536 (64KB)
    pub blob_write_batch_bytes: usize,

    /// Blob bytes written per round trip by applier sessions
    /// Default: 2097152 (2MB)
    pub replica_blob_write_batch_bytes: usize,

    /// Send operations to the data nodes immediately on execute
    /// Default: true
    pub force_send: bool,

    /// Count rows exactly instead of estimating
    /// Default: false
    pub use_exact_count: bool,

    /// Define an empty update after exclusive reads so they reach the binlog
    /// Default: false
    pub log_exclusive_reads: bool,

    /// Check constraints at commit instead of per operation
    /// Default: false
    pub deferred_constraints: bool,

    /// Allow joins to be pushed to the data nodes
    /// Default: true
    pub join_pushdown: bool,

    /// Auto-increment values prefetched per reservation
    /// Default: 1
    pub autoincrement_prefetch_sz: u32,

    /// Bytes the batch arena may hold before reporting out of memory
    /// Default: 67108864 (64MB)
    pub batch_mem_limit: usize,

    /// Foreign key checks enabled for the session
    /// Default: true
    pub foreign_key_checks: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 32 * 1024,                          // 32KB
            replica_batch_size: 2 * 1024 * 1024,            // 2MB
            blob_read_batch_bytes: 64 * 1024,               // 64KB
            blob_write_batch_bytes: 64 * 1024,              // 64KB
            replica_blob_write_batch_bytes: 2 * 1024 * 1024, // 2MB
            force_send: true,
            use_exact_count: false,
            log_exclusive_reads: false,
            deferred_constraints: false,
            join_pushdown: true,
            autoincrement_prefetch_sz: 1,
            batch_mem_limit: 64 * 1024 * 1024, // 64MB
            foreign_key_checks: true,
        }
    }
}

impl SessionConfig {
    /// Creates a new SessionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the batch size
    pub fn with_batch_size(mut self, bytes: usize) -> Self {
        self.batch_size = bytes;
        self
    }

    /// Builder method to set the applier batch size
    pub fn with_replica_batch_size(mut self, bytes: usize) -> Self {
        self.replica_batch_size = bytes;
        self
    }

    pub fn with_blob_write_batch_bytes(mut self, bytes: usize) -> Self {
        self.blob_write_batch_bytes = bytes;
        self
    }

    pub fn with_force_send(mut self, force_send: bool) -> Self {
        self.force_send = force_send;
        self
    }

    pub fn with_use_exact_count(mut self, exact: bool) -> Self {
        self.use_exact_count = exact;
        self
    }

    /// Builder method to log exclusive reads through an empty update
    pub fn with_log_exclusive_reads(mut self, enabled: bool) -> Self {
        self.log_exclusive_reads = enabled;
        self
    }

    pub fn with_deferred_constraints(mut self, enabled: bool) -> Self {
        self.deferred_constraints = enabled;
        self
    }

    pub fn with_join_pushdown(mut self, enabled: bool) -> Self {
        self.join_pushdown = enabled;
        self
    }

    pub fn with_autoincrement_prefetch(mut self, values: u32) -> Self {
        self.autoincrement_prefetch_sz = values;
        self
    }

    /// Builder method to cap the batch arena
    pub fn with_batch_mem_limit(mut self, bytes: usize) -> Self {
        self.batch_mem_limit = bytes;
        self
    }

    pub fn with_foreign_key_checks(mut self, enabled: bool) -> Self {
        self.foreign_key_checks = enabled;
        self
    }
}
