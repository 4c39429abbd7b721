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

//! Extra row info attached to replicated row events
//!
//! Layout (little endian):
//!
//! ```text
//! [len: u8][format: u8][flags: u16][trans id: u64]?[conflict flags: u16]?
//! ```
//!
//! `len` covers the whole buffer including the two header bytes. The
//! transaction id is present when `FLAG_TRANSID` is set, the conflict flags
//! when `FLAG_CFT_FLAGS` is set.

use crate::core::{Error, Result};

/// Transaction id used when the event carries none
pub const INVALID_TRANSACTION_ID: u64 = u64::MAX;

/// Format byte written by the cluster binlog
pub const FORMAT_NDB: u8 = 0;

pub const FLAG_TRANSID: u16 = 0x1;
pub const FLAG_CFT_FLAGS: u16 = 0x2;

/// Operation is reflected back from the primary
pub const CFT_REFLECT_OP: u16 = 0x1;
/// Operation is a refresh generated by conflict handling upstream
pub const CFT_REFRESH_OP: u16 = 0x2;
/// Operation was an exclusive read upstream
pub const CFT_READ_OP: u16 = 0x4;

const HEADER_LEN: usize = 2;

/// Parsed extra row info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraRowInfo {
    flags: u16,
    transaction_id: u64,
    conflict_flags: u16,
}

impl Default for ExtraRowInfo {
    fn default() -> Self {
        Self {
            flags: 0,
            transaction_id: INVALID_TRANSACTION_ID,
            conflict_flags: 0,
        }
    }
}

impl ExtraRowInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transaction_id(mut self, id: u64) -> Self {
        self.flags |= FLAG_TRANSID;
        self.transaction_id = id;
        self
    }

    pub fn with_conflict_flags(mut self, flags: u16) -> Self {
        self.flags |= FLAG_CFT_FLAGS;
        self.conflict_flags = flags;
        self
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Transaction id, [`INVALID_TRANSACTION_ID`] when absent
    pub fn transaction_id(&self) -> u64 {
        if self.flags & FLAG_TRANSID != 0 {
            self.transaction_id
        } else {
            INVALID_TRANSACTION_ID
        }
    }

    pub fn conflict_flags(&self) -> u16 {
        if self.flags & FLAG_CFT_FLAGS != 0 {
            self.conflict_flags
        } else {
            0
        }
    }

    /// Parse a buffer received with a row event
    pub fn load(buf: &[u8]) -> Result<Self> {
        let malformed = |what: &str| Error::replica_corrupt_event(format!("extra row info {}", what));
        if buf.len() < HEADER_LEN {
            return Err(malformed("truncated"));
        }
        let len = buf[0] as usize;
        if len != buf.len() {
            return Err(malformed("length mismatch"));
        }
        if buf[1] != FORMAT_NDB {
            return Err(malformed("has unknown format"));
        }
        let mut payload = &buf[HEADER_LEN..];
        let flags = take_u16(&mut payload).ok_or_else(|| malformed("missing flags"))?;
        let mut info = ExtraRowInfo {
            flags,
            ..Default::default()
        };
        if flags & FLAG_TRANSID != 0 {
            info.transaction_id =
                take_u64(&mut payload).ok_or_else(|| malformed("missing transaction id"))?;
        }
        if flags & FLAG_CFT_FLAGS != 0 {
            info.conflict_flags =
                take_u16(&mut payload).ok_or_else(|| malformed("missing conflict flags"))?;
        }
        if !payload.is_empty() {
            return Err(malformed("has trailing bytes"));
        }
        Ok(info)
    }

    /// Serialise in the layout [`ExtraRowInfo::load`] reads
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0, FORMAT_NDB];
        out.extend_from_slice(&self.flags.to_le_bytes());
        if self.flags & FLAG_TRANSID != 0 {
            out.extend_from_slice(&self.transaction_id.to_le_bytes());
        }
        if self.flags & FLAG_CFT_FLAGS != 0 {
            out.extend_from_slice(&self.conflict_flags.to_le_bytes());
        }
        out[0] = out.len() as u8;
        out
    }
}

fn take_u16(buf: &mut &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    let (head, rest) = buf.split_at(2);
    *buf = rest;
    Some(u16::from_le_bytes([head[0], head[1]]))
}

fn take_u64(buf: &mut &[u8]) -> Option<u64> {
    if buf.len() < 8 {
        return None;
    }
    let (head, rest) = buf.split_at(8);
    *buf = rest;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(head);
    Some(u64::from_le_bytes(bytes))
}
