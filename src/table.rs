use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use log::{debug, info};

use crate::constants::*;
use crate::errors::DatabaseError;
use crate::helpers::{is_tombstone, now_seconds, schema_encoding, schema_has_column};
use crate::index::Index;
use crate::page::Page;

/// Record identifier, unique within a table and shared between base and tail
/// records.
pub type RID = u64;

/// One row as returned by the select paths. `columns` has one entry per user
/// column; unprojected columns are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub rid: RID,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

/// All mutable table state. The mutex wrapping this struct is the table's
/// merge lock: writers hold it for their critical sections, readers for the
/// duration of one query, the merge for its snapshot and switchover phases.
pub(crate) struct TableStorage {
    pub(crate) num_columns: usize,
    pub(crate) key_column: usize,

    /// `4 + num_columns` column arrays of base pages.
    pub(crate) base_pages: Vec<Vec<Page>>,

    /// `5 + num_columns` column arrays of tail pages.
    pub(crate) tail_pages: Vec<Vec<Page>>,

    /// RID to `(page_index, slot)`, for base and tail records alike.
    pub(crate) page_directory: HashMap<RID, (usize, usize)>,

    /// Currently live base RIDs.
    pub(crate) base_rids: HashSet<RID>,

    pub(crate) next_rid: RID,
    pub(crate) next_base_position: usize,
    pub(crate) next_tail_position: usize,
    pub(crate) updates_since_merge: usize,

    pub(crate) index: Index,
}

impl TableStorage {
    pub(crate) fn new(num_columns: usize, key_column: usize) -> Self {
        TableStorage {
            num_columns,
            key_column,
            base_pages: (0..NUM_BASE_METADATA_COLS + num_columns)
                .map(|_| vec![Page::new()])
                .collect(),
            tail_pages: (0..NUM_TAIL_METADATA_COLS + num_columns)
                .map(|_| vec![Page::new()])
                .collect(),
            page_directory: HashMap::new(),
            base_rids: HashSet::new(),
            next_rid: 0,
            next_base_position: 0,
            next_tail_position: 0,
            updates_since_merge: 0,
            index: Index::new(num_columns, key_column),
        }
    }

    fn location(&self, rid: RID) -> Result<(usize, usize), DatabaseError> {
        self.page_directory
            .get(&rid)
            .copied()
            .ok_or_else(|| DatabaseError::NotFound(format!("rid {} not in page directory", rid)))
    }

    fn read_base(&self, column: usize, loc: (usize, usize)) -> i64 {
        self.base_pages[column][loc.0].read(loc.1)
    }

    fn read_tail(&self, column: usize, loc: (usize, usize)) -> i64 {
        self.tail_pages[column][loc.0].read(loc.1)
    }

    fn ensure_base_page(&mut self, page_index: usize) {
        if page_index >= self.base_pages[0].len() {
            for column in self.base_pages.iter_mut() {
                column.push(Page::new());
            }
        }
    }

    fn ensure_tail_page(&mut self, page_index: usize) {
        if page_index >= self.tail_pages[0].len() {
            for column in self.tail_pages.iter_mut() {
                column.push(Page::new());
            }
        }
    }

    /// Append a base record and register it everywhere. The caller has
    /// validated the value count and key uniqueness.
    pub(crate) fn insert_record(&mut self, values: &[i64]) -> RID {
        let rid = self.next_rid;
        self.next_rid += 1;

        let position = self.next_base_position;
        self.next_base_position += 1;
        let page_index = position / SLOTS_PER_PAGE;
        let slot = position % SLOTS_PER_PAGE;
        self.ensure_base_page(page_index);

        self.base_pages[INDIRECTION_COLUMN][page_index].write(NO_INDIRECTION as i64);
        self.base_pages[RID_COLUMN][page_index].write(rid as i64);
        self.base_pages[TIMESTAMP_COLUMN][page_index].write(now_seconds());
        self.base_pages[SCHEMA_ENCODING_COLUMN][page_index].write(0);
        for (i, value) in values.iter().enumerate() {
            self.base_pages[NUM_BASE_METADATA_COLS + i][page_index].write(*value);
        }

        self.page_directory.insert(rid, (page_index, slot));
        self.base_rids.insert(rid);

        for column in 0..self.num_columns {
            if self.index.is_indexed(column) {
                self.index.insert_entry(column, values[column], rid);
            }
        }

        rid
    }

    /// Append a tail record for `base_rid` and splice it onto the head of the
    /// record's version chain. Called with the merge lock held.
    pub(crate) fn create_tail_record(
        &mut self,
        base_rid: RID,
        values: &[Option<i64>],
    ) -> Result<RID, DatabaseError> {
        let base_loc = self.location(base_rid)?;

        // Maintain indexes on the updated columns before the chain changes.
        for (column, value) in values.iter().enumerate() {
            if let Some(new_value) = value {
                if self.index.is_indexed(column) {
                    let old_value = self.latest_value(base_rid, column)?;
                    self.index.delete_entry(column, old_value, base_rid);
                    self.index.insert_entry(column, *new_value, base_rid);
                }
            }
        }

        let rid = self.next_rid;
        self.next_rid += 1;

        // The new tail inherits the base's current indirection, preserving the
        // reverse chain.
        let indirection = self.read_base(INDIRECTION_COLUMN, base_loc);
        let schema = schema_encoding(values);

        let position = self.next_tail_position;
        self.next_tail_position += 1;
        let page_index = position / SLOTS_PER_PAGE;
        let slot = position % SLOTS_PER_PAGE;
        self.ensure_tail_page(page_index);

        self.tail_pages[INDIRECTION_COLUMN][page_index].write(indirection);
        self.tail_pages[RID_COLUMN][page_index].write(rid as i64);
        self.tail_pages[TIMESTAMP_COLUMN][page_index].write(now_seconds());
        self.tail_pages[SCHEMA_ENCODING_COLUMN][page_index].write(schema);
        self.tail_pages[BASE_RID_COLUMN][page_index].write(base_rid as i64);
        for (i, value) in values.iter().enumerate() {
            self.tail_pages[NUM_TAIL_METADATA_COLS + i][page_index].write(value.unwrap_or(0));
        }

        self.page_directory.insert(rid, (page_index, slot));

        // Splice: base indirection points at the new head, base schema
        // accumulates the update bits.
        let old_schema = self.read_base(SCHEMA_ENCODING_COLUMN, base_loc);
        self.base_pages[INDIRECTION_COLUMN][base_loc.0].update(base_loc.1, rid as i64);
        self.base_pages[SCHEMA_ENCODING_COLUMN][base_loc.0].update(base_loc.1, old_schema | schema);

        self.updates_since_merge += 1;

        Ok(rid)
    }

    /// Tombstone a base record and its whole tail chain, and drop its index
    /// entries for the latest (pre-delete) values.
    pub(crate) fn delete_record(&mut self, rid: RID) -> Result<(), DatabaseError> {
        if !self.base_rids.contains(&rid) {
            return Err(DatabaseError::NotFound(format!("rid {} is not live", rid)));
        }

        let latest = self.latest_values(rid)?;
        let base_loc = self.location(rid)?;

        // Invalidate tail records newest to oldest.
        let mut current = self.read_base(INDIRECTION_COLUMN, base_loc) as u64;
        let mut hops = 0usize;
        while current != NO_INDIRECTION {
            let tail_loc = match self.page_directory.get(&current) {
                Some(loc) => *loc,
                None => break,
            };
            let next = self.read_tail(INDIRECTION_COLUMN, tail_loc) as u64;
            self.tail_pages[RID_COLUMN][tail_loc.0].update(tail_loc.1, RID_TOMBSTONE as i64);
            current = next;

            hops += 1;
            if hops > self.page_directory.len() {
                return Err(DatabaseError::InvariantViolation(format!(
                    "indirection chain loop at base rid {}",
                    rid
                )));
            }
        }

        self.base_pages[RID_COLUMN][base_loc.0].update(base_loc.1, RID_TOMBSTONE as i64);
        self.base_rids.remove(&rid);

        for column in 0..self.num_columns {
            if self.index.is_indexed(column) {
                self.index.delete_entry(column, latest[column], rid);
            }
        }

        Ok(())
    }

    /// Undo of `delete_record` for transaction rollback: un-tombstone the base
    /// slot and the captured chain, then re-register the record.
    pub(crate) fn restore_deleted(
        &mut self,
        rid: RID,
        values: &[i64],
        indirection: u64,
        schema: i64,
        chain: &[RID],
    ) -> Result<(), DatabaseError> {
        let base_loc = self.location(rid)?;

        self.base_pages[RID_COLUMN][base_loc.0].update(base_loc.1, rid as i64);
        self.base_pages[INDIRECTION_COLUMN][base_loc.0].update(base_loc.1, indirection as i64);
        self.base_pages[SCHEMA_ENCODING_COLUMN][base_loc.0].update(base_loc.1, schema);

        for &tail_rid in chain {
            if let Some(&tail_loc) = self.page_directory.get(&tail_rid) {
                self.tail_pages[RID_COLUMN][tail_loc.0].update(tail_loc.1, tail_rid as i64);
            }
        }

        self.base_rids.insert(rid);
        for column in 0..self.num_columns {
            if self.index.is_indexed(column) {
                self.index.insert_entry(column, values[column], rid);
            }
        }

        Ok(())
    }

    /// The record's tail chain, newest first. Tombstoned tails are traversed
    /// but not reported. A chain longer than the directory is a loop.
    pub(crate) fn tail_chain(&self, base_rid: RID) -> Result<Vec<RID>, DatabaseError> {
        let base_loc = self.location(base_rid)?;
        let mut chain = Vec::new();

        let mut current = self.read_base(INDIRECTION_COLUMN, base_loc) as u64;
        let mut hops = 0usize;
        while current != NO_INDIRECTION {
            let tail_loc = match self.page_directory.get(&current) {
                Some(loc) => *loc,
                None => break,
            };

            if !is_tombstone(self.read_tail(RID_COLUMN, tail_loc)) {
                chain.push(current);
            }
            current = self.read_tail(INDIRECTION_COLUMN, tail_loc) as u64;

            hops += 1;
            if hops > self.page_directory.len() {
                return Err(DatabaseError::InvariantViolation(format!(
                    "indirection chain loop at base rid {}",
                    base_rid
                )));
            }
        }

        Ok(chain)
    }

    /// Resolve the projected columns of a record at a relative version.
    /// `version_skip` is how many chain entries (newest first) to ignore;
    /// zero reads the latest version. Unresolved columns come from the base
    /// slot.
    pub(crate) fn resolve_columns(
        &self,
        base_rid: RID,
        projection: &[usize],
        version_skip: usize,
    ) -> Result<Vec<Option<i64>>, DatabaseError> {
        let base_loc = self.location(base_rid)?;
        let mut result: Vec<Option<i64>> = vec![None; self.num_columns];

        let mut needed: HashSet<usize> = projection
            .iter()
            .take(self.num_columns)
            .enumerate()
            .filter(|(_, &p)| p != 0)
            .map(|(column, _)| column)
            .collect();

        if needed.is_empty() {
            return Ok(result);
        }

        let chain = self.tail_chain(base_rid)?;
        for &tail_rid in chain.iter().skip(version_skip) {
            if needed.is_empty() {
                break;
            }
            let tail_loc = self.location(tail_rid)?;
            let schema = self.read_tail(SCHEMA_ENCODING_COLUMN, tail_loc);

            let resolved: Vec<usize> = needed
                .iter()
                .copied()
                .filter(|&column| schema_has_column(schema, column))
                .collect();
            for column in resolved {
                result[column] =
                    Some(self.read_tail(NUM_TAIL_METADATA_COLS + column, tail_loc));
                needed.remove(&column);
            }
        }

        for column in needed {
            result[column] = Some(self.read_base(NUM_BASE_METADATA_COLS + column, base_loc));
        }

        Ok(result)
    }

    /// Latest value of a single column.
    pub(crate) fn latest_value(&self, base_rid: RID, column: usize) -> Result<i64, DatabaseError> {
        let mut projection = vec![0; self.num_columns];
        projection[column] = 1;
        let resolved = self.resolve_columns(base_rid, &projection, 0)?;
        resolved[column].ok_or_else(|| {
            DatabaseError::InvariantViolation(format!("column {} unresolved", column))
        })
    }

    /// Latest values of every user column.
    pub(crate) fn latest_values(&self, base_rid: RID) -> Result<Vec<i64>, DatabaseError> {
        let projection = vec![1; self.num_columns];
        let resolved = self.resolve_columns(base_rid, &projection, 0)?;
        Ok(resolved.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    /// Candidate base RIDs for `value` in `search_column`: the index when one
    /// exists, otherwise a linear scan over live records' latest values.
    pub(crate) fn find_rids(
        &self,
        search_column: usize,
        value: i64,
    ) -> Result<Vec<RID>, DatabaseError> {
        if self.index.is_indexed(search_column) {
            return Ok(self.index.locate(search_column, value));
        }

        let mut rids = Vec::new();
        for &rid in &self.base_rids {
            if self.latest_value(rid, search_column)? == value {
                rids.push(rid);
            }
        }
        Ok(rids)
    }

    /// Build an index over `column` from each live record's latest value.
    pub(crate) fn create_index(&mut self, column: usize) -> Result<(), DatabaseError> {
        let mut entries = Vec::with_capacity(self.base_rids.len());
        for &rid in &self.base_rids {
            entries.push((self.latest_value(rid, column)?, rid));
        }
        self.index.install(column, entries);
        Ok(())
    }
}

/// A table of fixed-width integer columns with versioned updates: immutable
/// base records, append-only tail records linked through the indirection
/// column, and a background merge that folds historical tails back into the
/// base pages.
pub struct Table {
    pub name: String,
    pub num_columns: usize,
    pub key_column: usize,

    merge_threshold: usize,

    /// The merge lock of the design: every reader and writer critical section
    /// runs under this mutex.
    storage: Mutex<TableStorage>,

    /// Serializes the transaction layer's "peek next RID, then insert" pair.
    insert_lock: Mutex<()>,

    /// Transactions hold this shared for a whole attempt; the merge takes it
    /// exclusively, so it can never materialise tails a live transaction
    /// might still roll back.
    merge_gate: RwLock<()>,

    merge_running: AtomicBool,
}

impl Table {
    pub fn new(name: &str, num_columns: usize, key_column: usize) -> Self {
        Self::with_merge_threshold(name, num_columns, key_column, MERGE_THRESHOLD)
    }

    pub fn with_merge_threshold(
        name: &str,
        num_columns: usize,
        key_column: usize,
        merge_threshold: usize,
    ) -> Self {
        Table {
            name: name.to_string(),
            num_columns,
            key_column,
            merge_threshold,
            storage: Mutex::new(TableStorage::new(num_columns, key_column)),
            insert_lock: Mutex::new(()),
            merge_gate: RwLock::new(()),
            merge_running: AtomicBool::new(false),
        }
    }

    /// Rebuild a table around loaded storage, as the database loader does.
    pub(crate) fn from_storage(name: &str, storage: TableStorage) -> Self {
        Table {
            name: name.to_string(),
            num_columns: storage.num_columns,
            key_column: storage.key_column,
            merge_threshold: MERGE_THRESHOLD,
            storage: Mutex::new(storage),
            insert_lock: Mutex::new(()),
            merge_gate: RwLock::new(()),
            merge_running: AtomicBool::new(false),
        }
    }

    pub(crate) fn storage(&self) -> MutexGuard<'_, TableStorage> {
        self.storage.lock().unwrap()
    }

    pub(crate) fn insert_guard(&self) -> MutexGuard<'_, ()> {
        self.insert_lock.lock().unwrap()
    }

    pub(crate) fn merge_gate(&self) -> &RwLock<()> {
        &self.merge_gate
    }

    /// Create a base record. Fails on a wrong column count or a duplicate
    /// primary key.
    pub fn insert(self: &Arc<Self>, values: &[i64]) -> Result<RID, DatabaseError> {
        let mut storage = self.storage();

        if values.len() != self.num_columns {
            return Err(DatabaseError::InvariantViolation(format!(
                "expected {} columns, got {}",
                self.num_columns,
                values.len()
            )));
        }
        if !storage
            .find_rids(self.key_column, values[self.key_column])?
            .is_empty()
        {
            return Err(DatabaseError::InvariantViolation(format!(
                "duplicate key {}",
                values[self.key_column]
            )));
        }

        Ok(storage.insert_record(values))
    }

    /// Append a tail record for the base record with primary key `key`.
    /// `values[k]` of `None` leaves column `k` unchanged.
    pub fn update(self: &Arc<Self>, key: i64, values: &[Option<i64>]) -> Result<RID, DatabaseError> {
        let rid = {
            let mut storage = self.storage();

            if values.len() != self.num_columns {
                return Err(DatabaseError::InvariantViolation(format!(
                    "expected {} columns, got {}",
                    self.num_columns,
                    values.len()
                )));
            }

            let rids = storage.find_rids(self.key_column, key)?;
            let base_rid = *rids
                .first()
                .ok_or_else(|| DatabaseError::NotFound(format!("key {} not found", key)))?;
            if !storage.base_rids.contains(&base_rid) {
                return Err(DatabaseError::NotFound(format!("key {} is deleted", key)));
            }

            storage.create_tail_record(base_rid, values)?
        };

        // Outside the merge lock.
        self.trigger_merge();
        Ok(rid)
    }

    /// Tombstone the record with primary key `key` and its tail chain.
    pub fn delete(self: &Arc<Self>, key: i64) -> Result<RID, DatabaseError> {
        let mut storage = self.storage();

        let rids = storage.find_rids(self.key_column, key)?;
        let base_rid = *rids
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("key {} not found", key)))?;

        storage.delete_record(base_rid)?;
        Ok(base_rid)
    }

    /// Select the latest version of all records matching `search_key` in
    /// `search_column`, projected by `projection` (one flag per user column).
    pub fn select(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[usize],
    ) -> Result<Vec<Record>, DatabaseError> {
        self.select_version(search_key, search_column, projection, 0)
    }

    /// As `select`, but `relative_version <= 0` steps back along the tail
    /// chain: `-k` ignores the `k` newest updates.
    pub fn select_version(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[usize],
        relative_version: i64,
    ) -> Result<Vec<Record>, DatabaseError> {
        let storage = self.storage();
        if search_column >= storage.num_columns {
            return Err(DatabaseError::NotFound(format!(
                "column {} out of range",
                search_column
            )));
        }
        let version_skip = relative_version.unsigned_abs() as usize;

        let mut records = Vec::new();
        for rid in storage.find_rids(search_column, search_key)? {
            if !storage.base_rids.contains(&rid) {
                continue;
            }
            let columns = storage.resolve_columns(rid, projection, version_skip)?;
            records.push(Record {
                rid,
                key: search_key,
                columns,
            });
        }

        Ok(records)
    }

    /// Sum the latest value of `agg_column` over all live records whose
    /// primary key lies in `[start, end]`. `NotFound` when the range is empty.
    pub fn sum(&self, start: i64, end: i64, agg_column: usize) -> Result<i64, DatabaseError> {
        self.sum_version(start, end, agg_column, 0)
    }

    pub fn sum_version(
        &self,
        start: i64,
        end: i64,
        agg_column: usize,
        relative_version: i64,
    ) -> Result<i64, DatabaseError> {
        let storage = self.storage();
        if agg_column >= storage.num_columns {
            return Err(DatabaseError::NotFound(format!(
                "column {} out of range",
                agg_column
            )));
        }
        let version_skip = relative_version.unsigned_abs() as usize;

        let mut projection = vec![0; storage.num_columns];
        projection[agg_column] = 1;

        let rids = if storage.index.is_indexed(storage.key_column) {
            storage.index.locate_range(storage.key_column, start, end)
        } else {
            let mut rids = Vec::new();
            for &rid in &storage.base_rids {
                let key = storage.latest_value(rid, storage.key_column)?;
                if start <= key && key <= end {
                    rids.push(rid);
                }
            }
            rids
        };

        let mut total = 0i64;
        let mut found_any = false;
        for rid in rids {
            if !storage.base_rids.contains(&rid) {
                continue;
            }
            found_any = true;
            let resolved = storage.resolve_columns(rid, &projection, version_skip)?;
            total += resolved[agg_column].unwrap_or(0);
        }

        if !found_any {
            return Err(DatabaseError::NotFound(format!(
                "no records with keys in [{}, {}]",
                start, end
            )));
        }
        Ok(total)
    }

    /// Index lookup used by the transaction layer for lock targeting.
    pub fn locate(&self, column: usize, value: i64) -> Vec<RID> {
        self.storage().index.locate(column, value)
    }

    pub fn locate_range(&self, column: usize, begin: i64, end: i64) -> Vec<RID> {
        self.storage().index.locate_range(column, begin, end)
    }

    pub fn create_index(&self, column: usize) -> Result<(), DatabaseError> {
        if column >= self.num_columns {
            return Err(DatabaseError::NotFound(format!(
                "column {} out of range",
                column
            )));
        }
        self.storage().create_index(column)
    }

    pub fn drop_index(&self, column: usize) -> bool {
        self.storage().index.drop_index(column)
    }

    pub fn is_indexed(&self, column: usize) -> bool {
        self.storage().index.is_indexed(column)
    }

    /// Base metadata pre-read for the transaction rollback log.
    pub(crate) fn base_metadata(&self, rid: RID) -> Result<(u64, i64), DatabaseError> {
        let storage = self.storage();
        let loc = storage.location(rid)?;
        Ok((
            storage.read_base(INDIRECTION_COLUMN, loc) as u64,
            storage.read_base(SCHEMA_ENCODING_COLUMN, loc),
        ))
    }

    /// Restore base indirection and schema, the rollback of an update.
    pub(crate) fn restore_base_metadata(
        &self,
        rid: RID,
        indirection: u64,
        schema: i64,
    ) -> Result<(), DatabaseError> {
        let mut storage = self.storage();
        let loc = storage.location(rid)?;
        storage.base_pages[INDIRECTION_COLUMN][loc.0].update(loc.1, indirection as i64);
        storage.base_pages[SCHEMA_ENCODING_COLUMN][loc.0].update(loc.1, schema);
        Ok(())
    }

    pub(crate) fn delete_record_by_rid(&self, rid: RID) -> Result<(), DatabaseError> {
        self.storage().delete_record(rid)
    }

    /// Revert the index maintenance done by an aborted update: for every
    /// column the update touched, swap the new value back for the old one.
    pub(crate) fn revert_update_index(
        &self,
        rid: RID,
        old_values: &[i64],
        updated: &[Option<i64>],
    ) {
        let mut storage = self.storage();
        for (column, value) in updated.iter().enumerate() {
            if let Some(new_value) = value {
                if storage.index.is_indexed(column) {
                    storage.index.delete_entry(column, *new_value, rid);
                    storage.index.insert_entry(column, old_values[column], rid);
                }
            }
        }
    }

    pub(crate) fn restore_deleted(
        &self,
        rid: RID,
        values: &[i64],
        indirection: u64,
        schema: i64,
        chain: &[RID],
    ) -> Result<(), DatabaseError> {
        self.storage().restore_deleted(rid, values, indirection, schema, chain)
    }

    pub(crate) fn latest_values(&self, rid: RID) -> Result<Vec<i64>, DatabaseError> {
        self.storage().latest_values(rid)
    }

    pub(crate) fn tail_chain(&self, rid: RID) -> Result<Vec<RID>, DatabaseError> {
        self.storage().tail_chain(rid)
    }

    pub(crate) fn peek_next_rid(&self) -> RID {
        self.storage().next_rid
    }

    pub fn next_tail_position(&self) -> usize {
        self.storage().next_tail_position
    }

    pub fn updates_since_merge(&self) -> usize {
        self.storage().updates_since_merge
    }

    pub fn merge_in_progress(&self) -> bool {
        self.merge_running.load(Ordering::SeqCst)
    }

    /// Start a background merge iff the update threshold is crossed and no
    /// merge is already running for this table.
    pub fn trigger_merge(self: &Arc<Self>) {
        {
            let storage = self.storage();
            if storage.updates_since_merge < self.merge_threshold {
                return;
            }
        }

        if self
            .merge_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let table = Arc::clone(self);
        thread::spawn(move || {
            run_merge(&table);
            table.merge_running.store(false, Ordering::SeqCst);
        });
    }
}

/// State captured under the merge lock before the off-lock fold.
struct MergeSnapshot {
    merge_cutoff: usize,
    base_cutoff: usize,
    base_pages: Vec<Vec<Page>>,
    tail_pages: Vec<Vec<Page>>,
    page_directory: HashMap<RID, (usize, usize)>,
    base_rids: HashSet<RID>,
}

/// Consolidate historical tail records into the base pages and compact the
/// tail storage, while readers and writers keep running against the live
/// pages. Only the snapshot and the switchover hold the merge lock.
fn run_merge(table: &Arc<Table>) {
    // Option (a) of the rollback design: wait out open transactions.
    let _gate = table.merge_gate.write().unwrap();

    let num_columns = table.num_columns;

    // Step 1: snapshot under the merge lock.
    let snapshot = {
        let storage = table.storage();
        if storage.next_tail_position == 0 {
            return;
        }
        MergeSnapshot {
            merge_cutoff: storage.next_tail_position,
            base_cutoff: storage.next_base_position,
            base_pages: storage.base_pages.clone(),
            tail_pages: storage.tail_pages.clone(),
            page_directory: storage.page_directory.clone(),
            base_rids: storage.base_rids.clone(),
        }
    };

    info!(
        "merge start on table {}: {} tail records",
        table.name, snapshot.merge_cutoff
    );

    // Step 3: the current head tail of each live base record survives the
    // merge so in-flight version reads keep a consistent chain.
    let mut preserved: HashSet<RID> = HashSet::new();
    for &base_rid in &snapshot.base_rids {
        if let Some(&loc) = snapshot.page_directory.get(&base_rid) {
            let head = snapshot.base_pages[INDIRECTION_COLUMN][loc.0].read(loc.1) as u64;
            if head != NO_INDIRECTION {
                preserved.insert(head);
            }
        }
    }

    // Step 4: walk tail positions newest to oldest collecting, per base
    // record, the newest historical value of every updated column.
    let mut record_updates: HashMap<RID, HashMap<usize, i64>> = HashMap::new();
    let mut merged: HashSet<RID> = HashSet::new();

    for position in (0..snapshot.merge_cutoff).rev() {
        let loc = (position / SLOTS_PER_PAGE, position % SLOTS_PER_PAGE);

        let tail_rid_value = snapshot.tail_pages[RID_COLUMN][loc.0].read(loc.1);
        if is_tombstone(tail_rid_value) {
            continue;
        }
        let tail_rid = tail_rid_value as u64;

        let base_rid = snapshot.tail_pages[BASE_RID_COLUMN][loc.0].read(loc.1) as u64;
        if !snapshot.page_directory.contains_key(&base_rid)
            || !snapshot.base_rids.contains(&base_rid)
        {
            continue;
        }
        if preserved.contains(&tail_rid) {
            continue;
        }

        merged.insert(tail_rid);

        let schema = snapshot.tail_pages[SCHEMA_ENCODING_COLUMN][loc.0].read(loc.1);
        let updates = record_updates.entry(base_rid).or_default();
        for column in 0..num_columns {
            if schema_has_column(schema, column) && !updates.contains_key(&column) {
                let value =
                    snapshot.tail_pages[NUM_TAIL_METADATA_COLS + column][loc.0].read(loc.1);
                updates.insert(column, value);
            }
        }
    }

    // Step 5: materialise the collected values into the base copy.
    let mut new_base_pages = snapshot.base_pages;
    for (base_rid, updates) in &record_updates {
        let loc = match snapshot.page_directory.get(base_rid) {
            Some(loc) => *loc,
            None => continue,
        };
        for (&column, &value) in updates {
            new_base_pages[NUM_BASE_METADATA_COLS + column][loc.0].update(loc.1, value);
        }
    }

    // Steps 6 and 7: switchover and tail compaction under the merge lock.
    let mut storage = table.storage();

    // Re-absorb base records inserted while we worked off-lock.
    for position in snapshot.base_cutoff..storage.next_base_position {
        let loc = (position / SLOTS_PER_PAGE, position % SLOTS_PER_PAGE);
        for column in 0..NUM_BASE_METADATA_COLS + num_columns {
            if loc.0 >= new_base_pages[column].len() {
                new_base_pages[column].push(Page::new());
            }
            let value = storage.base_pages[column][loc.0].read(loc.1);
            new_base_pages[column][loc.0].write(value);
        }
    }

    // Re-sync metadata with the live pages: deletes tombstoned RID slots and
    // updates moved the indirection head while we worked. An indirection that
    // points at a merged tail is materialised now, so it resets to zero.
    for position in 0..snapshot.base_cutoff {
        let loc = (position / SLOTS_PER_PAGE, position % SLOTS_PER_PAGE);

        let rid_value = storage.base_pages[RID_COLUMN][loc.0].read(loc.1);
        new_base_pages[RID_COLUMN][loc.0].update(loc.1, rid_value);

        let current_head = storage.base_pages[INDIRECTION_COLUMN][loc.0].read(loc.1) as u64;
        if current_head != NO_INDIRECTION && merged.contains(&current_head) {
            new_base_pages[INDIRECTION_COLUMN][loc.0].update(loc.1, NO_INDIRECTION as i64);
            new_base_pages[SCHEMA_ENCODING_COLUMN][loc.0].update(loc.1, 0);
        } else {
            new_base_pages[INDIRECTION_COLUMN][loc.0].update(loc.1, current_head as i64);
            let schema = storage.base_pages[SCHEMA_ENCODING_COLUMN][loc.0].read(loc.1);
            new_base_pages[SCHEMA_ENCODING_COLUMN][loc.0].update(loc.1, schema);
        }
    }

    storage.base_pages = new_base_pages;

    // Step 7: compact the tail storage, keeping every non-merged,
    // non-tombstoned tail in position order and remapping the directory.
    let mut new_tail_pages: Vec<Vec<Page>> = (0..NUM_TAIL_METADATA_COLS + num_columns)
        .map(|_| vec![Page::new()])
        .collect();
    let mut new_locations: HashMap<RID, (usize, usize)> = HashMap::new();
    let mut compacted = 0usize;

    for position in 0..storage.next_tail_position {
        let loc = (position / SLOTS_PER_PAGE, position % SLOTS_PER_PAGE);

        let tail_rid_value = storage.tail_pages[RID_COLUMN][loc.0].read(loc.1);
        if is_tombstone(tail_rid_value) {
            continue;
        }
        let tail_rid = tail_rid_value as u64;
        if merged.contains(&tail_rid) {
            continue;
        }

        let new_loc = (compacted / SLOTS_PER_PAGE, compacted % SLOTS_PER_PAGE);
        if new_loc.0 >= new_tail_pages[0].len() {
            for column in new_tail_pages.iter_mut() {
                column.push(Page::new());
            }
        }

        for column in 0..NUM_TAIL_METADATA_COLS + num_columns {
            let mut value = storage.tail_pages[column][loc.0].read(loc.1);
            if column == INDIRECTION_COLUMN {
                let previous = value as u64;
                if previous != NO_INDIRECTION && merged.contains(&previous) {
                    value = NO_INDIRECTION as i64;
                }
            }
            new_tail_pages[column][new_loc.0].write(value);
        }

        new_locations.insert(tail_rid, new_loc);
        compacted += 1;
    }

    // Directory: keep live base entries, remap surviving tails, drop the rest.
    let base_rids = storage.base_rids.clone();
    storage
        .page_directory
        .retain(|rid, _| base_rids.contains(rid) || new_locations.contains_key(rid));
    for (tail_rid, new_loc) in new_locations {
        storage.page_directory.insert(tail_rid, new_loc);
    }

    storage.tail_pages = new_tail_pages;
    storage.next_tail_position = compacted;
    storage.updates_since_merge = 0;

    debug!(
        "merge done on table {}: {} tails folded, {} kept",
        table.name,
        merged.len(),
        compacted
    );
}
