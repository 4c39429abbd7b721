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

//! Batch scratch memory
//!
//! Values bound to operations that are not executed right away must stay
//! alive until the batch is sent. The arena keeps them, accounts their size
//! against a limit and drops everything when the batch completes.

use std::sync::Arc;

use crate::cluster::types::CustomData;
use crate::core::{Error, Result};

#[derive(Default)]
pub struct BatchArena {
    limit: usize,
    used: usize,
    blocks: Vec<Arc<[u8]>>,
    objects: Vec<CustomData>,
}

impl BatchArena {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn reserve(&mut self, size: usize) -> Result<()> {
        let used = self.used.saturating_add(size);
        if used > self.limit {
            return Err(Error::out_of_memory(format!(
                "batch memory exhausted: {} of {} bytes in use, {} requested",
                self.used, self.limit, size
            )));
        }
        self.used = used;
        Ok(())
    }

    /// Copy `data` into the arena; the copy lives until the next [`clear`](Self::clear)
    pub fn copy(&mut self, data: &[u8]) -> Result<Arc<[u8]>> {
        self.reserve(data.len())?;
        let block: Arc<[u8]> = Arc::from(data);
        self.blocks.push(Arc::clone(&block));
        Ok(block)
    }

    /// Keep an operation payload of `size` bytes alive until the next clear
    pub fn park(&mut self, object: CustomData, size: usize) -> Result<CustomData> {
        self.reserve(size)?;
        self.objects.push(Arc::clone(&object));
        Ok(object)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn allocations(&self) -> usize {
        self.blocks.len() + self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0 && self.allocations() == 0
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.objects.clear();
        self.used = 0;
    }
}

impl std::fmt::Debug for BatchArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchArena")
            .field("limit", &self.limit)
            .field("used", &self.used)
            .field("allocations", &self.allocations())
            .finish()
    }
}
