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

//! # ndb-handler - DML core of a cluster storage engine handler
//!
//! The handler translates the row calls of a SQL server (key reads, scans,
//! inserts, updates and deletes) into batched operations on a
//! shared-nothing in-memory cluster, and resolves replication conflicts for
//! rows applied from another cluster.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use ndb_handler::cluster::memory::MemoryCluster;
//! use ndb_handler::core::{FieldType, SqlCommand, TableDefBuilder, Value};
//! use ndb_handler::{Ha, NdbShare, Row, SessionConfig, StatementContext, ThdNdb};
//!
//! let cluster = MemoryCluster::new();
//! let def = TableDefBuilder::new("test", "users")
//!     .add("id", FieldType::Integer)
//!     .add_nullable("age", FieldType::Integer)
//!     .primary_key(&["id"])
//!     .build()
//!     .unwrap();
//! cluster.create_table(&def).unwrap();
//!
//! let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default()).into_shared();
//! let share = Arc::new(NdbShare::new("test", "users"));
//! let mut ha = Ha::open(&session, share, Arc::new(def)).unwrap();
//!
//! session.lock().start_statement(StatementContext::new(SqlCommand::Insert));
//! let mut row = Row::from_values(vec![Value::integer(1), Value::integer(30)]);
//! ha.write_row(&mut row).unwrap();
//! session.lock().commit().unwrap();
//! assert_eq!(cluster.row_count("test", "users"), 1);
//! ```
//!
//! ## Modules
//!
//! - [`core`] - Core types ([`Value`], [`Row`], [`FieldBitmap`], [`TableDef`], [`Error`])
//! - [`cluster`] - Cluster client contract and the in-memory cluster
//! - [`session`] - Per connection state, batching and transaction execution
//! - [`handler`] - The table handler ([`Ha`])
//! - [`conflict`] - Conflict detection and resolution for replicated rows
//! - [`share`] - Metadata shared by every handler of a table
//! - [`stats`] - Session counters and their publisher
//! - [`config`] - Session configuration

pub mod cluster;
pub mod config;
pub mod conflict;
pub mod core;
pub mod handler;
pub mod session;
pub mod share;
pub mod stats;

pub use crate::core::{Error, FieldBitmap, Result, Row, TableDef, Value};

pub use config::{ConflictRole, SessionConfig};

pub use handler::{Ha, HaStats, PartitionPruning};

pub use session::{SharedSession, StatementContext, ThdNdb, TransOption, Warning};

pub use share::NdbShare;

pub use conflict::{Applier, ConflictingOpType};

pub use stats::{SessionCounters, StatsPublisher};
