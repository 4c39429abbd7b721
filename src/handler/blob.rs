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

//! Blob readback and blob write preparation
//!
//! Blob columns are not part of the row image the cluster returns. After a
//! read or a scan step the cluster raises one activation per blob of the
//! current row; the handler sizes them all, grows its buffer once and then
//! copies every blob into it at 8-byte aligned offsets.

use std::sync::Arc;

use smallvec::SmallVec;

use super::Ha;
use crate::cluster::{AttrId, BlobActivation};
use crate::core::error::{ER_OUTOFMEMORY, WARN_DATA_TRUNCATED};
use crate::core::{Error, FieldType, Result, Row, Value};
use crate::session::ThdNdb;

/// Round a blob length up to the buffer alignment
pub(crate) fn aligned_len(len: usize) -> usize {
    len.div_ceil(8) * 8
}

/// Length of `data` cut to at most `max` bytes without splitting a character
///
/// Stops at the end of the last well-formed UTF-8 character before `max`.
pub(crate) fn char_safe_len(data: &[u8], max: usize) -> usize {
    let max = max.min(data.len());
    match std::str::from_utf8(&data[..max]) {
        Ok(text) => text.len(),
        Err(err) => err.valid_up_to(),
    }
}

/// Buffer holding the blobs of the current row
///
/// Grows when a row needs more room and never shrinks until released.
#[derive(Debug, Default)]
pub struct BlobBuffer {
    buf: Vec<u8>,
    expected: usize,
    completed: usize,
    total_size: usize,
}

impl BlobBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Aligned bytes needed by the blobs of the current row
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Blobs announced for the current row
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Blobs of the current row that have been sized
    pub fn completed(&self) -> usize {
        self.completed
    }

    fn start_row(&mut self, expected: usize) {
        self.expected = expected;
        self.completed = 0;
        self.total_size = 0;
    }

    fn reserve(&mut self, total: usize) -> Result<()> {
        if total <= self.buf.len() {
            return Ok(());
        }
        self.buf
            .try_reserve_exact(total - self.buf.len())
            .map_err(|e| Error::out_of_memory(format!("blob buffer of {} bytes: {}", total, e)))?;
        self.buf.resize(total, 0);
        Ok(())
    }

    /// Free the buffer
    pub fn release(&mut self) {
        self.buf = Vec::new();
        self.start_row(0);
    }
}

impl Ha {
    /// Blob attributes of the read set
    pub(crate) fn blob_read_attrs(&self) -> Vec<AttrId> {
        self.table_def
            .blob_fields()
            .filter(|f| self.read_set.is_set(*f))
            .filter_map(|f| self.column_map.attr(f))
            .collect()
    }

    /// Copy the blobs of the current row into the row buffer
    pub(crate) fn get_blob_values(&mut self, thd: &mut ThdNdb, row: &mut Row) -> Result<()> {
        let activations = thd.transaction()?.take_blob_activations();
        if activations.is_empty() {
            return Ok(());
        }
        self.blob.start_row(activations.len());

        let mut sized: SmallVec<[(BlobActivation, Option<usize>); 4]> = SmallVec::new();
        {
            let trans = thd.transaction()?;
            let mut total = 0;
            for act in activations {
                let info = trans
                    .blob_info(act.source, act.attr)
                    .map_err(Error::from_ndb)?;
                let len = (!info.is_null).then_some(info.length as usize);
                total += len.map_or(0, aligned_len);
                self.blob.completed += 1;
                sized.push((act, len));
            }
            self.blob.total_size = total;
        }

        if let Err(err) = self.blob.reserve(self.blob.total_size) {
            tracing::warn!(
                table = %self.table_def.name,
                bytes = self.blob.total_size,
                "failed to grow blob buffer"
            );
            thd.push_warning(ER_OUTOFMEMORY, err.to_string());
            return Err(err);
        }

        let mut truncated = Vec::new();
        {
            let trans = thd.transaction()?;
            let mut offset = 0;
            for (act, len) in sized {
                let Some(field) = self.column_map.field(act.attr) else {
                    continue;
                };
                let Some(len) = len else {
                    row.set_null(field);
                    continue;
                };
                let end = offset + len;
                let read = trans
                    .read_blob(act.source, act.attr, &mut self.blob.buf[offset..end])
                    .map_err(Error::from_ndb)?;
                let mut data = &self.blob.buf[offset..offset + read];
                let def = &self.table_def.fields[field];
                if def.field_type == FieldType::Text
                    && def.max_length > 0
                    && data.len() > def.max_length
                {
                    data = &data[..char_safe_len(data, def.max_length)];
                    truncated.push(def.name.clone());
                }
                row.set(field, Value::bytes(data.to_vec()))?;
                offset += aligned_len(len);
            }
        }
        for name in truncated {
            thd.push_warning(
                WARN_DATA_TRUNCATED,
                format!("Truncated value from TEXT field '{}'", name),
            );
        }
        Ok(())
    }

    /// Blob values of the write set
    ///
    /// When the operation is batched the payload is copied into the batch
    /// arena so it outlives the caller's row buffer. Also returns the total
    /// payload size.
    pub(crate) fn prepare_blob_writes(
        &self,
        thd: &mut ThdNdb,
        row: &Row,
        batched: bool,
    ) -> Result<(Vec<(AttrId, Option<Arc<[u8]>>)>, usize)> {
        let mut writes = Vec::new();
        let mut bytes = 0;
        for field in self.table_def.blob_fields() {
            if !self.write_set.is_set(field) {
                continue;
            }
            let Some(attr) = self.column_map.attr(field) else {
                continue;
            };
            let data = match row.value(field) {
                Value::Null => None,
                Value::Bytes(b) => Some(self.blob_payload(thd, b, batched)?),
                other => Some(self.blob_payload(thd, other.to_string().as_bytes(), batched)?),
            };
            bytes += data.as_ref().map_or(0, |d| d.len());
            writes.push((attr, data));
        }
        Ok((writes, bytes))
    }

    fn blob_payload(&self, thd: &mut ThdNdb, data: &[u8], batched: bool) -> Result<Arc<[u8]>> {
        if batched {
            thd.copy_to_batch_mem(data)
        } else {
            Ok(Arc::from(data))
        }
    }
}
