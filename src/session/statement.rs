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

//! What the server tells the handler about the running statement

use crate::core::SqlCommand;

/// Statement level state set by the server before row calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementContext {
    pub command: SqlCommand,
    /// Statement runs in autocommit mode
    pub autocommit: bool,
    /// Server allows batching row changes across calls (`transaction_allow_batching`)
    pub allow_batch: bool,
    /// Rows come from the binlog applier
    pub applying_binlog: bool,
    /// Statement touches a single table
    pub single_table: bool,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`
    pub on_duplicate_key_update: bool,
}

impl Default for StatementContext {
    fn default() -> Self {
        Self {
            command: SqlCommand::Select,
            autocommit: true,
            allow_batch: false,
            applying_binlog: false,
            single_table: true,
            on_duplicate_key_update: false,
        }
    }
}

impl StatementContext {
    pub fn new(command: SqlCommand) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn with_allow_batch(mut self, allow: bool) -> Self {
        self.allow_batch = allow;
        self
    }

    pub fn with_applying_binlog(mut self, applying: bool) -> Self {
        self.applying_binlog = applying;
        self
    }

    pub fn with_single_table(mut self, single: bool) -> Self {
        self.single_table = single;
        self
    }

    pub fn with_on_duplicate_key_update(mut self, odku: bool) -> Self {
        self.on_duplicate_key_update = odku;
        self
    }

    pub fn is_copying_alter(&self) -> bool {
        self.command == SqlCommand::AlterTable
    }

    /// Autocommit statement on one table, where errors of a removed
    /// read surface at commit
    pub fn is_simple_autocommit(&self) -> bool {
        self.autocommit && self.single_table
    }

    pub fn is_replace(&self) -> bool {
        self.command == SqlCommand::Replace
    }
}
