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

//! Transactions of the in-process cluster

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::store::{hash_fragment, StoredRow, TableData, View, WriteSet};
use super::{ClusterState, LoggedExecute, LoggedOperation};
use crate::cluster::client::NdbTransaction;
use crate::cluster::dictionary::NdbTable;
use crate::cluster::error::{NdbError, ERROR_CONFLICT_FN_VIOLATION};
use crate::cluster::types::{
    AbortOption, AttrId, AttrValues, BlobActivation, BlobInfo, BlobSource, CommitStatus,
    CompletedOp, ExecType, ExtraColumn, IndexBound, KeyAccess, KeySource, LockMode, OpId,
    OperationDef, OperationKind, OperationOptions, PseudoColumn, PushedJoinDef, QueryId, ScanDef,
    ScanFlags, ScanId, ScanRow, ScanStep,
};
use crate::core::{FieldBitmap, Value};

type BlobKey = (BlobSource, AttrId);

struct PendingOp {
    id: OpId,
    def: OperationDef,
}

/// Effect of one operation, applied after the read view is released
#[derive(Default)]
struct Outcome {
    change: Option<(Vec<Value>, Option<StoredRow>)>,
    refreshed: Option<Vec<Value>>,
    deferred_check: Option<Vec<Value>>,
    values: Option<AttrValues>,
    extra: Vec<(ExtraColumn, Value)>,
    blobs: Vec<(AttrId, Option<Vec<u8>>)>,
}

struct ScanState {
    def: ScanDef,
    rows: Option<Vec<StoredRow>>,
    pos: usize,
    cached: usize,
    current: Option<Vec<Value>>,
}

struct QueryState {
    rows: Vec<Option<ScanRow>>,
    delivered: Vec<bool>,
}

/// A transaction on a [`super::MemoryCluster`]
pub struct MemoryTransaction {
    state: Arc<ClusterState>,
    id: u64,
    next_handle: u64,
    pending: Vec<PendingOp>,
    completed: Vec<CompletedOp>,
    last_defined: Option<OpId>,
    writes: WriteSet,
    refreshed: FxHashSet<(String, Vec<Value>)>,
    deferred_checks: Vec<(Arc<NdbTable>, Vec<Value>)>,
    error: NdbError,
    status: CommitStatus,
    gci: Option<u64>,
    scans: FxHashMap<ScanId, ScanState>,
    queries: FxHashMap<QueryId, QueryState>,
    activations: Vec<BlobActivation>,
    blob_data: FxHashMap<BlobKey, Option<Vec<u8>>>,
}

fn compare_keys(a: &[Value], b: &[Value]) -> CmpOrdering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.compare(y) {
            CmpOrdering::Equal => continue,
            other => return other,
        }
    }
    CmpOrdering::Equal
}

fn in_bound(key: &[Value], bound: &IndexBound) -> bool {
    if !bound.low.is_empty() {
        let ord = compare_keys(key, &bound.low);
        let ok = if bound.low_inclusive {
            ord != CmpOrdering::Less
        } else {
            ord == CmpOrdering::Greater
        };
        if !ok {
            return false;
        }
    }
    if !bound.high.is_empty() {
        let ord = compare_keys(key, &bound.high);
        let ok = if bound.high_inclusive {
            ord != CmpOrdering::Greater
        } else {
            ord == CmpOrdering::Less
        };
        if !ok {
            return false;
        }
    }
    true
}

fn masked_values(table: &NdbTable, row: &StoredRow, mask: Option<&FieldBitmap>) -> AttrValues {
    table
        .columns
        .iter()
        .filter(|c| !c.is_blob())
        .filter(|c| mask.map_or(true, |m| m.is_set(c.attr_id as usize)))
        .map(|c| (c.attr_id, row.attr(c.attr_id)))
        .collect()
}

fn blob_bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Bytes(b) => Some(b),
        other => Some(other.to_string().into_bytes()),
    }
}

impl MemoryTransaction {
    pub(crate) fn new(state: Arc<ClusterState>, id: u64) -> Self {
        Self {
            state,
            id,
            next_handle: 1,
            pending: Vec::new(),
            completed: Vec::new(),
            last_defined: None,
            writes: WriteSet::default(),
            refreshed: FxHashSet::default(),
            deferred_checks: Vec::new(),
            error: NdbError::default(),
            status: CommitStatus::NotStarted,
            gci: None,
            scans: FxHashMap::default(),
            queries: FxHashMap::default(),
            activations: Vec::new(),
            blob_data: FxHashMap::default(),
        }
    }

    /// Id used in the cluster logs
    pub fn id(&self) -> u64 {
        self.id
    }

    fn next_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn push_pending(&mut self, def: OperationDef) -> OpId {
        let id = OpId(self.next_handle());
        self.state.op_log.lock().push(LoggedOperation {
            transaction: self.id,
            kind: def.kind,
            table: def.table.name.clone(),
            key: def.key.clone(),
            lock_mode: def.lock_mode,
            any_value: def.options.any_value,
            partition_id: def.options.partition_id,
            interpreted: def.options.interpreted_code.is_some(),
            set_values: def.options.extra_set_values.to_vec(),
            deferred_constraints: def.options.deferred_constraints,
            disable_fk: def.options.disable_fk,
        });
        self.pending.push(PendingOp { id, def });
        self.last_defined = Some(id);
        id
    }

    fn abort(&mut self) {
        self.writes = WriteSet::default();
        self.refreshed.clear();
        self.deferred_checks.clear();
        self.status = CommitStatus::Aborted;
    }

    fn complete(&mut self, op: &PendingOp, error: NdbError, outcome: Outcome) {
        self.completed.push(CompletedOp {
            id: op.id,
            kind: op.def.kind,
            table: op.def.table.name.clone(),
            access: op.def.access,
            error,
            values: outcome.values,
            extra: outcome.extra,
            custom_data: op.def.options.custom_data.clone(),
        });
    }

    /// Resolve the primary key an operation addresses
    fn resolve_pk(&self, view: &View<'_>, def: &OperationDef) -> Result<Option<Vec<Value>>, NdbError> {
        match def.access {
            KeyAccess::PrimaryKey => Ok(Some(def.key.clone())),
            KeyAccess::UniqueIndex(object_id) => {
                let index = self
                    .state
                    .index(object_id)
                    .ok_or_else(|| NdbError::internal(4243, "Index not found"))?;
                Ok(view
                    .find_unique(&def.table, &index, &def.key)
                    .map(|row| row.key(&def.table.primary_key)))
            }
        }
    }

    fn run_program(def: &OperationDef, row: &StoredRow) -> Result<(), NdbError> {
        let Some(code) = &def.options.interpreted_code else {
            return Ok(());
        };
        code.evaluate(|column| row.column(column)).map_err(|code| {
            if code == ERROR_CONFLICT_FN_VIOLATION {
                NdbError::conflict_fn_violation()
            } else {
                NdbError::internal(code, "Interpreted program exited with error")
            }
        })
    }

    /// Apply written values, blobs and pseudo columns to a row image
    fn build_row(def: &OperationDef, pk: &[Value], base: Option<StoredRow>) -> StoredRow {
        let table = &def.table;
        let mut row = base.unwrap_or_else(|| StoredRow::new(table.attr_count()));
        for (attr, value) in table.primary_key.iter().zip(pk.iter()) {
            row.set_attr(*attr, value.clone());
        }
        for (attr, value) in &def.values {
            row.set_attr(*attr, value.clone());
        }
        for (attr, data) in &def.blob_writes {
            let value = data
                .as_ref()
                .map_or(Value::Null, |d| Value::bytes(d.to_vec()));
            row.set_attr(*attr, value);
        }
        row.author = 0;
        for sv in &def.options.extra_set_values {
            match sv.column {
                ExtraColumn::Attr(a) => row.set_attr(a, sv.value.clone()),
                ExtraColumn::Pseudo(PseudoColumn::RowAuthor) => {
                    row.author = sv.value.as_u64().unwrap_or(0)
                }
                ExtraColumn::Pseudo(PseudoColumn::PartitionFunction) => {
                    row.partition_function = sv.value.as_i64()
                }
                ExtraColumn::Pseudo(_) => {}
            }
        }
        row.fragment = def
            .options
            .partition_id
            .unwrap_or_else(|| hash_fragment(pk, table.partition_count));
        row
    }

    fn check_unique(&self, view: &View<'_>, table: &NdbTable, row: &StoredRow, pk: &[Value]) -> Result<(), NdbError> {
        for index in self.state.unique_indexes(&table.name) {
            if view.unique_conflict(table, &index, row, pk) {
                return Err(NdbError::unique_violation(index.object_id));
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&self, view: &View<'_>, table: &NdbTable, row: &StoredRow) -> Result<(), NdbError> {
        for fk in self.state.foreign_keys.read().iter() {
            if fk.child_table != table.name {
                continue;
            }
            let values = row.key(&fk.child_attrs);
            if values.iter().any(Value::is_null) {
                continue;
            }
            let found = view
                .rows(&fk.parent_table)
                .iter()
                .any(|(_, parent)| parent.key(&fk.parent_attrs) == values);
            if !found {
                return Err(NdbError::foreign_key_no_parent(fk.id));
            }
        }
        Ok(())
    }

    fn read_outcome(def: &OperationDef, row: &StoredRow, outcome: &mut Outcome) {
        outcome.extra = def
            .options
            .extra_get_values
            .iter()
            .map(|c| (*c, row.column(*c)))
            .collect();
        outcome.blobs = def
            .blob_reads
            .iter()
            .map(|a| (*a, blob_bytes(row.attr(*a))))
            .collect();
    }

    fn apply_op(&self, data: &FxHashMap<String, TableData>, def: &OperationDef) -> Result<Outcome, NdbError> {
        let view = View {
            committed: data,
            writes: &self.writes,
        };
        let table = &def.table;
        let mut outcome = Outcome::default();

        let pk = match self.resolve_pk(&view, def)? {
            Some(pk) => pk,
            None => return Err(NdbError::no_data_found()),
        };
        if self.refreshed.contains(&(table.name.clone(), pk.clone())) {
            return Err(NdbError::op_after_refresh());
        }
        if let Some(err) = self.state.key_fault(&table.name, &pk) {
            return Err(err);
        }
        let existing = view.get(&table.name, &pk);

        match def.kind {
            OperationKind::Read | OperationKind::LockCurrent => {
                let row = existing.ok_or_else(NdbError::no_data_found)?;
                outcome.values = Some(masked_values(table, &row, def.read_mask.as_ref()));
                Self::read_outcome(def, &row, &mut outcome);
            }
            OperationKind::Insert | OperationKind::Write => {
                if let Some(current) = &existing {
                    if def.kind == OperationKind::Insert {
                        return Err(NdbError::tuple_exists());
                    }
                    Self::run_program(def, current)?;
                }
                let row = Self::build_row(def, &pk, None);
                self.check_unique(&view, table, &row, &pk)?;
                if def.options.deferred_constraints {
                    outcome.deferred_check = Some(pk.clone());
                } else if !def.options.disable_fk {
                    self.check_foreign_keys(&view, table, &row)?;
                }
                Self::read_outcome(def, &row, &mut outcome);
                outcome.change = Some((pk, Some(row)));
            }
            OperationKind::Update | OperationKind::UpdateCurrent => {
                let current = existing.ok_or_else(NdbError::no_data_found)?;
                Self::run_program(def, &current)?;
                let row = Self::build_row(def, &pk, Some(current));
                self.check_unique(&view, table, &row, &pk)?;
                if def.options.deferred_constraints {
                    outcome.deferred_check = Some(pk.clone());
                } else if !def.options.disable_fk {
                    self.check_foreign_keys(&view, table, &row)?;
                }
                Self::read_outcome(def, &row, &mut outcome);
                outcome.change = Some((pk, Some(row)));
            }
            OperationKind::Delete | OperationKind::DeleteCurrent => {
                let current = existing.ok_or_else(NdbError::no_data_found)?;
                Self::run_program(def, &current)?;
                Self::read_outcome(def, &current, &mut outcome);
                outcome.change = Some((pk, None));
            }
            OperationKind::Refresh => {
                if table.has_blobs() {
                    return Err(NdbError::refresh_on_blob_table());
                }
                if let Some(current) = existing {
                    let mut row = current;
                    row.author = 0;
                    for sv in &def.options.extra_set_values {
                        if sv.column == ExtraColumn::Pseudo(PseudoColumn::RowAuthor) {
                            row.author = sv.value.as_u64().unwrap_or(0);
                        }
                    }
                    outcome.change = Some((pk.clone(), Some(row)));
                }
                outcome.refreshed = Some(pk);
            }
        }
        Ok(outcome)
    }

    fn record_outcome(&mut self, op: &PendingOp, mut outcome: Outcome) {
        let table = &op.def.table;
        if let Some((pk, row)) = outcome.change.take() {
            self.writes.put(&table.name, pk, row);
        }
        if let Some(pk) = outcome.refreshed.take() {
            self.refreshed.insert((table.name.clone(), pk));
        }
        if let Some(pk) = outcome.deferred_check.take() {
            self.deferred_checks.push((Arc::clone(table), pk));
        }
        for (attr, data) in std::mem::take(&mut outcome.blobs) {
            let source = BlobSource::Operation(op.id);
            self.blob_data.insert((source, attr), data);
            self.activations.push(BlobActivation { source, attr });
        }
        self.complete(op, NdbError::default(), outcome);
    }

    fn check_deferred(&self, data: &FxHashMap<String, TableData>) -> Result<(), NdbError> {
        let view = View {
            committed: data,
            writes: &self.writes,
        };
        for (table, pk) in &self.deferred_checks {
            if let Some(row) = view.get(&table.name, pk) {
                self.check_foreign_keys(&view, table, &row)?;
            }
        }
        Ok(())
    }

    fn commit_writes(&mut self, data: &mut FxHashMap<String, TableData>) {
        let writes = std::mem::take(&mut self.writes);
        if writes.is_empty() {
            self.gci = None;
        } else {
            let epoch = self.state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            for (table, changes) in writes.changes {
                if changes.is_empty() {
                    continue;
                }
                let t = data.entry(table).or_default();
                t.commit_count += 1;
                for (pk, change) in changes {
                    match change {
                        Some(mut row) => {
                            row.gci = epoch;
                            t.rows.insert(pk, row);
                        }
                        None => {
                            t.rows.remove(&pk);
                        }
                    }
                }
            }
            self.gci = Some(epoch);
        }
        self.refreshed.clear();
        self.deferred_checks.clear();
        self.status = CommitStatus::Committed;
    }

    fn materialize(&self, def: &ScanDef) -> Result<Vec<StoredRow>, NdbError> {
        let data = self.state.data.lock();
        let view = View {
            committed: &data,
            writes: &self.writes,
        };
        let mut rows: Vec<StoredRow> = view
            .rows(&def.table.name)
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        if let Some(partition) = def.partition_id {
            rows.retain(|r| r.fragment == partition);
        }
        if let Some(filter) = &def.filter {
            rows.retain(|r| {
                filter
                    .iter()
                    .all(|(a, v)| r.attr(*a).compare(v) == CmpOrdering::Equal)
            });
        }
        if let Some(object_id) = def.index {
            let index = self
                .state
                .index(object_id)
                .ok_or_else(|| NdbError::internal(4243, "Index not found"))?;
            if let Some(bound) = &def.bound {
                rows.retain(|r| in_bound(&r.key(&index.columns), bound));
            }
            let pk = &def.table.primary_key;
            rows.sort_by(|a, b| {
                compare_keys(&a.key(&index.columns), &b.key(&index.columns))
                    .then_with(|| compare_keys(&a.key(pk), &b.key(pk)))
            });
            if def.flags.contains(ScanFlags::DESCENDING) {
                rows.reverse();
            }
        }
        Ok(rows)
    }

    fn current_key(&self, scan: ScanId) -> Result<(Arc<NdbTable>, Vec<Value>), NdbError> {
        let st = self
            .scans
            .get(&scan)
            .ok_or_else(|| NdbError::internal(4284, "Scan is not open"))?;
        let key = st
            .current
            .clone()
            .ok_or_else(|| NdbError::internal(4609, "No current tuple on scan"))?;
        Ok((Arc::clone(&st.def.table), key))
    }

    fn lookup(
        &self,
        view: &View<'_>,
        table: &NdbTable,
        access: KeyAccess,
        key: &[Value],
    ) -> Option<StoredRow> {
        match access {
            KeyAccess::PrimaryKey => view.get(&table.name, key),
            KeyAccess::UniqueIndex(object_id) => {
                let index = self.state.index(object_id)?;
                view.find_unique(table, &index, key)
            }
        }
    }
}

impl NdbTransaction for MemoryTransaction {
    fn define_operation(&mut self, op: OperationDef) -> Result<OpId, NdbError> {
        if self.status == CommitStatus::Committed {
            return Err(NdbError::internal(4116, "Operation defined on committed transaction"));
        }
        if op.kind == OperationKind::Refresh && op.table.has_blobs() {
            return Err(NdbError::refresh_on_blob_table());
        }
        Ok(self.push_pending(op))
    }

    fn execute(
        &mut self,
        exec_type: ExecType,
        abort_option: AbortOption,
        _force_send: bool,
    ) -> Result<(), NdbError> {
        let pending = std::mem::take(&mut self.pending);
        self.state.exec_log.lock().push(LoggedExecute {
            transaction: self.id,
            exec_type,
            abort_option,
            pending: pending.len(),
        });

        if exec_type == ExecType::Rollback {
            self.abort();
            return Ok(());
        }
        if self.status == CommitStatus::Aborted {
            let err = if self.error.is_error() {
                self.error.clone()
            } else {
                NdbError::internal(4350, "Transaction already aborted")
            };
            for op in &pending {
                self.complete(op, err.clone(), Outcome::default());
            }
            return Err(err);
        }
        // The error reports this execute only
        self.error = NdbError::default();
        let injected = self.state.faults.lock().execute.pop_front();
        if let Some(err) = injected {
            for op in &pending {
                self.complete(op, err.clone(), Outcome::default());
            }
            self.error = err.clone();
            self.abort();
            return Err(err);
        }

        let state = Arc::clone(&self.state);
        let mut data = state.data.lock();
        for op in pending {
            match self.apply_op(&data, &op.def) {
                Ok(outcome) => self.record_outcome(&op, outcome),
                Err(err) => {
                    self.complete(&op, err.clone(), Outcome::default());
                    if !self.error.is_error() {
                        self.error = err.clone();
                    }
                    let ao = op.def.options.abort_option.unwrap_or(abort_option);
                    if ao == AbortOption::AbortOnError {
                        self.abort();
                        return Err(err);
                    }
                }
            }
        }
        if self.status == CommitStatus::NotStarted {
            self.status = CommitStatus::Started;
        }
        if exec_type == ExecType::Commit {
            if let Err(err) = self.check_deferred(&data) {
                self.error = err.clone();
                self.abort();
                return Err(err);
            }
            self.commit_writes(&mut data);
        }
        Ok(())
    }

    fn error(&self) -> NdbError {
        self.error.clone()
    }

    fn commit_status(&self) -> CommitStatus {
        self.status
    }

    fn gci(&self) -> Option<u64> {
        self.gci
    }

    fn completed_operations(&self) -> Vec<CompletedOp> {
        self.completed.clone()
    }

    fn operation(&self, op: OpId) -> Option<CompletedOp> {
        self.completed.iter().find(|c| c.id == op).cloned()
    }

    fn last_defined_operation(&self) -> Option<OpId> {
        self.last_defined
    }

    fn release_completed_operations(&mut self) {
        let released: FxHashSet<OpId> = self.completed.drain(..).map(|c| c.id).collect();
        self.blob_data
            .retain(|(source, _), _| !matches!(source, BlobSource::Operation(id) if released.contains(id)));
        self.queries.clear();
    }

    fn restart(&mut self) -> Result<(), NdbError> {
        if self.status == CommitStatus::Started {
            return Err(NdbError::internal(4117, "Transaction restart while active"));
        }
        self.pending.clear();
        self.completed.clear();
        self.last_defined = None;
        self.writes = WriteSet::default();
        self.refreshed.clear();
        self.deferred_checks.clear();
        self.error = NdbError::default();
        self.status = CommitStatus::NotStarted;
        self.gci = None;
        // Open scans outlive the restart
        self.queries.clear();
        self.activations.clear();
        self.blob_data.clear();
        Ok(())
    }

    fn scan(&mut self, def: ScanDef) -> Result<ScanId, NdbError> {
        if let Some(object_id) = def.index {
            if self.state.index(object_id).is_none() {
                return Err(NdbError::internal(4243, "Index not found"));
            }
        }
        let id = ScanId(self.next_handle());
        self.scans.insert(
            id,
            ScanState {
                def,
                rows: None,
                pos: 0,
                cached: 0,
                current: None,
            },
        );
        Ok(id)
    }

    fn next_result(
        &mut self,
        scan: ScanId,
        fetch_allowed: bool,
        _force_send: bool,
    ) -> Result<ScanStep, NdbError> {
        let needs_rows = match self.scans.get(&scan) {
            Some(st) => st.rows.is_none(),
            None => return Err(NdbError::internal(4284, "Scan is not open")),
        };
        if needs_rows {
            let def = self.scans.get(&scan).map(|st| st.def.clone());
            if let Some(def) = def {
                let rows = self.materialize(&def)?;
                if let Some(st) = self.scans.get_mut(&scan) {
                    st.rows = Some(rows);
                }
            }
        }
        let batch = self.state.scan_batch;
        let (row, table, mask, extra_cols, blob_reads) = {
            let Some(st) = self.scans.get_mut(&scan) else {
                return Err(NdbError::internal(4284, "Scan is not open"));
            };
            let total = st.rows.as_ref().map_or(0, Vec::len);
            if st.pos >= total {
                st.current = None;
                return Ok(ScanStep::NoMoreRecords);
            }
            if st.cached == 0 {
                if !fetch_allowed {
                    return Ok(ScanStep::NoMoreCached);
                }
                st.cached = batch.min(total - st.pos);
            }
            let row = match st.rows.as_ref().and_then(|r| r.get(st.pos)) {
                Some(r) => r.clone(),
                None => return Ok(ScanStep::NoMoreRecords),
            };
            st.pos += 1;
            st.cached -= 1;
            st.current = Some(row.key(&st.def.table.primary_key));
            (
                row,
                Arc::clone(&st.def.table),
                st.def.read_mask.clone(),
                st.def.extra_get_values.clone(),
                st.def.blob_reads.clone(),
            )
        };

        for attr in blob_reads {
            let source = BlobSource::Scan(scan);
            self.blob_data.insert((source, attr), blob_bytes(row.attr(attr)));
            self.activations.push(BlobActivation { source, attr });
        }
        Ok(ScanStep::Row(ScanRow {
            values: masked_values(&table, &row, Some(&mask)),
            extra: extra_cols.iter().map(|c| (*c, row.column(*c))).collect(),
        }))
    }

    fn lock_current_tuple(
        &mut self,
        scan: ScanId,
        options: OperationOptions,
    ) -> Result<OpId, NdbError> {
        let (table, key) = self.current_key(scan)?;
        let attrs = table.attr_count();
        let mut def = OperationDef::read(
            table,
            KeyAccess::PrimaryKey,
            key,
            FieldBitmap::new(attrs),
            LockMode::Exclusive,
        )
        .with_options(options);
        def.kind = OperationKind::LockCurrent;
        Ok(self.push_pending(def))
    }

    fn update_current_tuple(
        &mut self,
        scan: ScanId,
        values: AttrValues,
        blob_writes: Vec<(AttrId, Option<Arc<[u8]>>)>,
        options: OperationOptions,
    ) -> Result<OpId, NdbError> {
        let (table, key) = self.current_key(scan)?;
        let mut def =
            OperationDef::update(table, KeyAccess::PrimaryKey, key, values).with_options(options);
        def.kind = OperationKind::UpdateCurrent;
        def.blob_writes = blob_writes;
        Ok(self.push_pending(def))
    }

    fn delete_current_tuple(
        &mut self,
        scan: ScanId,
        options: OperationOptions,
    ) -> Result<OpId, NdbError> {
        let (table, key) = self.current_key(scan)?;
        let mut def = OperationDef::delete(table, KeyAccess::PrimaryKey, key).with_options(options);
        def.kind = OperationKind::DeleteCurrent;
        Ok(self.push_pending(def))
    }

    fn close_scan(&mut self, scan: ScanId) {
        self.scans.remove(&scan);
        self.close_blobs(BlobSource::Scan(scan));
    }

    fn take_blob_activations(&mut self) -> Vec<BlobActivation> {
        std::mem::take(&mut self.activations)
    }

    fn blob_info(&self, source: BlobSource, attr: AttrId) -> Result<BlobInfo, NdbError> {
        match self.blob_data.get(&(source, attr)) {
            Some(Some(data)) => Ok(BlobInfo {
                is_null: false,
                length: data.len() as u64,
            }),
            Some(None) => Ok(BlobInfo {
                is_null: true,
                length: 0,
            }),
            None => Err(NdbError::internal(4264, "Invalid usage of blob attribute")),
        }
    }

    fn read_blob(
        &mut self,
        source: BlobSource,
        attr: AttrId,
        buf: &mut [u8],
    ) -> Result<usize, NdbError> {
        match self.blob_data.get(&(source, attr)) {
            Some(Some(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(None) => Ok(0),
            None => Err(NdbError::internal(4264, "Invalid usage of blob attribute")),
        }
    }

    fn close_blobs(&mut self, source: BlobSource) {
        self.blob_data.retain(|(s, _), _| *s != source);
    }

    fn create_query(
        &mut self,
        def: &PushedJoinDef,
        params: Vec<Value>,
    ) -> Result<QueryId, NdbError> {
        let mut found: Vec<Option<StoredRow>> = Vec::with_capacity(def.members.len());
        {
            let data = self.state.data.lock();
            let view = View {
                committed: &data,
                writes: &self.writes,
            };
            for member in &def.members {
                let mut key = Vec::with_capacity(member.key.len());
                let mut complete = true;
                for source in &member.key {
                    let value = match source {
                        KeySource::Param(i) => params.get(*i).cloned(),
                        KeySource::Parent { member, attr } => found
                            .get(*member)
                            .and_then(|r| r.as_ref())
                            .map(|r| r.attr(*attr)),
                    };
                    match value {
                        Some(v) => key.push(v),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                let row = if complete {
                    self.lookup(&view, &member.table, member.access, &key)
                } else {
                    None
                };
                found.push(row);
            }
        }
        let rows: Vec<Option<ScanRow>> = def
            .members
            .iter()
            .zip(found)
            .map(|(member, row)| {
                row.map(|r| ScanRow {
                    values: masked_values(&member.table, &r, Some(&member.read_mask)),
                    extra: Vec::new(),
                })
            })
            .collect();
        let id = QueryId(self.next_handle());
        let delivered = vec![false; rows.len()];
        self.queries.insert(id, QueryState { rows, delivered });
        Ok(id)
    }

    fn query_next(
        &mut self,
        query: QueryId,
        member: usize,
        _fetch_allowed: bool,
    ) -> Result<ScanStep, NdbError> {
        let q = self
            .queries
            .get_mut(&query)
            .ok_or_else(|| NdbError::internal(4801, "Query is not defined"))?;
        let Some(done) = q.delivered.get_mut(member) else {
            return Err(NdbError::internal(4802, "Query member out of range"));
        };
        if *done {
            return Ok(ScanStep::NoMoreRecords);
        }
        *done = true;
        Ok(match q.rows.get(member).cloned().flatten() {
            Some(row) => ScanStep::Row(row),
            None => ScanStep::NoMoreRecords,
        })
    }

    fn close_query(&mut self, query: QueryId) {
        self.queries.remove(&query);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::NdbClient;
    use crate::cluster::dictionary::NdbDictionary;
    use crate::cluster::interpreted::{Condition, InterpretedCode};
    use crate::cluster::memory::MemoryCluster;
    use crate::core::{FieldType, TableDefBuilder};

    fn setup() -> (MemoryCluster, Arc<NdbTable>) {
        let cluster = MemoryCluster::with_scan_batch(2);
        let def = TableDefBuilder::new("test", "t")
            .add("id", FieldType::Integer)
            .add_nullable("u", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .unique_key("uk_u", &["u"])
            .index("ix_v", &["v"])
            .build()
            .unwrap();
        let table = cluster.create_table(&def).unwrap();
        (cluster, table)
    }

    fn insert(table: &Arc<NdbTable>, id: i64, u: i64, v: i64) -> OperationDef {
        OperationDef::insert(
            Arc::clone(table),
            vec![Value::integer(id)],
            vec![(1, Value::integer(u)), (2, Value::integer(v))],
        )
    }

    #[test]
    fn test_insert_commit_and_errors() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1, 10, 100)).unwrap();
        trans.define_operation(insert(&table, 1, 11, 100)).unwrap();
        trans.define_operation(insert(&table, 2, 10, 100)).unwrap();
        trans
            .execute(ExecType::Commit, AbortOption::IgnoreError, true)
            .unwrap();
        let ops = trans.completed_operations();
        assert!(ops[0].succeeded());
        assert_eq!(ops[1].error.code, 630);
        assert_eq!(ops[2].error.code, 893);
        let uk = cluster.get_index(&table, "uk_u$unique").unwrap();
        assert_eq!(ops[2].error.details, Some(uk.object_id));
        assert_eq!(trans.error().code, 630);
        assert_eq!(trans.commit_status(), CommitStatus::Committed);
        assert!(trans.gci().is_some());
        assert_eq!(cluster.row_count("test", "t"), 1);
        assert_eq!(cluster.table_commit_count(&table).unwrap(), 1);
    }

    #[test]
    fn test_abort_on_error_discards_writes() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1, 10, 100)).unwrap();
        trans
            .define_operation(OperationDef::delete(
                Arc::clone(&table),
                KeyAccess::PrimaryKey,
                vec![Value::integer(5)],
            ))
            .unwrap();
        let err = trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap_err();
        assert_eq!(err.code, 626);
        assert_eq!(trans.commit_status(), CommitStatus::Aborted);
        assert_eq!(cluster.row_count("test", "t"), 0);
    }

    #[test]
    fn test_unique_read_and_program() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1, 10, 100)).unwrap();
        trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap();

        let uk = cluster.get_index(&table, "uk_u$unique").unwrap();
        let mut trans = cluster.start_transaction(None).unwrap();
        let read = trans
            .define_operation(OperationDef::read(
                Arc::clone(&table),
                KeyAccess::UniqueIndex(uk.object_id),
                vec![Value::integer(10)],
                FieldBitmap::all(3),
                LockMode::Read,
            ))
            .unwrap();

        let mut code = InterpretedCode::new();
        code.load_const(0, Value::integer(50))
            .read_attr(1, ExtraColumn::Attr(2))
            .branch(Condition::Gt, 0, 1, 0)
            .interpret_exit_nok(ERROR_CONFLICT_FN_VIOLATION)
            .def_label(0)
            .interpret_exit_ok();
        code.finalise().unwrap();
        let options = OperationOptions {
            interpreted_code: Some(Arc::new(code)),
            ..Default::default()
        };
        let upd = trans
            .define_operation(
                OperationDef::update(
                    Arc::clone(&table),
                    KeyAccess::PrimaryKey,
                    vec![Value::integer(1)],
                    vec![(2, Value::integer(50))],
                )
                .with_options(options),
            )
            .unwrap();
        trans
            .execute(ExecType::NoCommit, AbortOption::IgnoreError, true)
            .unwrap();
        let r = trans.operation(read).unwrap();
        assert_eq!(r.values.unwrap()[0], (0, Value::integer(1)));
        assert_eq!(trans.operation(upd).unwrap().error.code, 9999);
    }

    #[test]
    fn test_refresh_then_op_fails() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        trans
            .define_operation(OperationDef::refresh(Arc::clone(&table), vec![Value::integer(1)]))
            .unwrap();
        trans.define_operation(insert(&table, 1, 10, 100)).unwrap();
        trans
            .execute(ExecType::NoCommit, AbortOption::IgnoreError, true)
            .unwrap();
        let ops = trans.completed_operations();
        assert!(ops[0].succeeded());
        assert_eq!(ops[1].error.code, 920);
    }

    #[test]
    fn test_ordered_scan_batches() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        for (id, v) in [(1, 30), (2, 10), (3, 20)] {
            trans.define_operation(insert(&table, id, id, v)).unwrap();
        }
        trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap();

        let ix = cluster.get_index(&table, "ix_v").unwrap();
        let mut trans = cluster.start_transaction(None).unwrap();
        let scan = trans
            .scan(ScanDef {
                table: Arc::clone(&table),
                index: Some(ix.object_id),
                bound: Some(IndexBound {
                    low: vec![Value::integer(10)],
                    low_inclusive: false,
                    high: Vec::new(),
                    high_inclusive: false,
                }),
                read_mask: FieldBitmap::all(3),
                lock_mode: LockMode::CommittedRead,
                flags: ScanFlags::empty(),
                partition_id: None,
                extra_get_values: Default::default(),
                blob_reads: Vec::new(),
                filter: None,
            })
            .unwrap();
        assert_eq!(trans.next_result(scan, false, true).unwrap(), ScanStep::NoMoreCached);
        let ids: Vec<Value> = (0..2)
            .map(|_| match trans.next_result(scan, true, true).unwrap() {
                ScanStep::Row(r) => r.values[0].1.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![Value::integer(3), Value::integer(1)]);
        assert_eq!(trans.next_result(scan, false, true).unwrap(), ScanStep::NoMoreRecords);
    }

    #[test]
    fn test_delete_current_tuple() {
        let (cluster, table) = setup();
        let mut trans = cluster.start_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1, 1, 1)).unwrap();
        trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap();

        let mut trans = cluster.start_transaction(None).unwrap();
        let scan = trans
            .scan(ScanDef {
                table: Arc::clone(&table),
                index: None,
                bound: None,
                read_mask: FieldBitmap::all(3),
                lock_mode: LockMode::Exclusive,
                flags: ScanFlags::KEY_INFO,
                partition_id: None,
                extra_get_values: Default::default(),
                blob_reads: Vec::new(),
                filter: None,
            })
            .unwrap();
        assert!(matches!(trans.next_result(scan, true, true).unwrap(), ScanStep::Row(_)));
        trans
            .delete_current_tuple(scan, OperationOptions::default())
            .unwrap();
        trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap();
        assert_eq!(cluster.row_count("test", "t"), 0);
    }

    #[test]
    fn test_injected_execute_failure() {
        let (cluster, table) = setup();
        cluster.fail_next_execute(NdbError::timeout());
        let mut trans = cluster.start_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1, 1, 1)).unwrap();
        let err = trans
            .execute(ExecType::NoCommit, AbortOption::IgnoreError, true)
            .unwrap_err();
        assert!(err.is_temporary());
        assert_eq!(trans.error().code, 266);
        assert_eq!(trans.commit_status(), CommitStatus::Aborted);
    }
}
