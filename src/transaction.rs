use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use rand::Rng;

use crate::constants::RETRY_LIMIT;
use crate::errors::DatabaseError;
use crate::table::{Table, RID};

/// Stable opaque identity of a running transaction.
pub type TransactionId = u64;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// The process-wide lock table.
pub static LOCK_MANAGER: Lazy<LockManager> = Lazy::new(LockManager::new);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockType {
    Shared,
    Exclusive,
}

struct LockEntry {
    lock_type: LockType,
    holders: HashSet<TransactionId>,
}

/// Record-level shared/exclusive locks. `try_lock` is a single non-blocking
/// attempt: denials never queue, the caller aborts and retries instead, which
/// is also how deadlocks resolve.
pub struct LockManager {
    locks: Mutex<HashMap<RID, LockEntry>>,
}

impl LockManager {
    fn new() -> Self {
        LockManager {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_lock(&self, txn: TransactionId, rid: RID, requested: LockType) -> bool {
        let mut locks = self.locks.lock().unwrap();

        match locks.get_mut(&rid) {
            None => {
                locks.insert(
                    rid,
                    LockEntry {
                        lock_type: requested,
                        holders: HashSet::from([txn]),
                    },
                );
                true
            }
            Some(entry) => {
                let sole_holder = entry.holders.len() == 1 && entry.holders.contains(&txn);
                match (entry.lock_type, requested) {
                    (LockType::Shared, LockType::Shared) => {
                        entry.holders.insert(txn);
                        true
                    }
                    // Upgrade is allowed only for a sole holder.
                    (LockType::Shared, LockType::Exclusive) => {
                        if sole_holder {
                            entry.lock_type = LockType::Exclusive;
                        }
                        sole_holder
                    }
                    (LockType::Exclusive, _) => sole_holder,
                }
            }
        }
    }

    /// Release every lock held by `txn`; emptied locks are deleted.
    pub fn release_all(&self, txn: TransactionId) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, entry| {
            entry.holders.remove(&txn);
            !entry.holders.is_empty()
        });
    }
}

/// One queued operation. Reads take shared locks on their candidate records,
/// writes take exclusive locks and log rollback state first.
#[derive(Clone)]
enum QueryRequest {
    Insert {
        values: Vec<i64>,
    },
    Update {
        key: i64,
        values: Vec<Option<i64>>,
    },
    Delete {
        key: i64,
    },
    Select {
        key: i64,
        column: usize,
        projection: Vec<usize>,
    },
    SelectVersion {
        key: i64,
        column: usize,
        projection: Vec<usize>,
        relative_version: i64,
    },
    Sum {
        start: i64,
        end: i64,
        column: usize,
    },
    SumVersion {
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    },
    Increment {
        key: i64,
        column: usize,
    },
}

enum RollbackEntry {
    Insert {
        table: Arc<Table>,
        rid: RID,
    },
    Update {
        table: Arc<Table>,
        rid: RID,
        old_indirection: u64,
        old_schema: i64,
        old_values: Vec<i64>,
        updated: Vec<Option<i64>>,
    },
    Delete {
        table: Arc<Table>,
        rid: RID,
        old_values: Vec<i64>,
        old_indirection: u64,
        old_schema: i64,
        chain: Vec<RID>,
    },
}

/// A sequence of queries executed under strict two-phase locking: all locks
/// are acquired as operations run and released only at commit or abort. An
/// abort rolls back logged side effects in reverse and the whole transaction
/// retries, up to `retry_limit` times with a randomized growing backoff.
pub struct Transaction {
    id: TransactionId,
    queries: Vec<(QueryRequest, Arc<Table>)>,
    rollback_log: Vec<RollbackEntry>,
    held_locks: HashMap<RID, LockType>,
    attempts: usize,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst),
            queries: Vec::new(),
            rollback_log: Vec::new(),
            held_locks: HashMap::new(),
            attempts: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Number of attempts the last `run` took.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn add_insert(&mut self, table: &Arc<Table>, values: Vec<i64>) {
        self.queries
            .push((QueryRequest::Insert { values }, Arc::clone(table)));
    }

    pub fn add_update(&mut self, table: &Arc<Table>, key: i64, values: Vec<Option<i64>>) {
        self.queries
            .push((QueryRequest::Update { key, values }, Arc::clone(table)));
    }

    pub fn add_delete(&mut self, table: &Arc<Table>, key: i64) {
        self.queries
            .push((QueryRequest::Delete { key }, Arc::clone(table)));
    }

    pub fn add_select(&mut self, table: &Arc<Table>, key: i64, column: usize, projection: Vec<usize>) {
        self.queries.push((
            QueryRequest::Select {
                key,
                column,
                projection,
            },
            Arc::clone(table),
        ));
    }

    pub fn add_select_version(
        &mut self,
        table: &Arc<Table>,
        key: i64,
        column: usize,
        projection: Vec<usize>,
        relative_version: i64,
    ) {
        self.queries.push((
            QueryRequest::SelectVersion {
                key,
                column,
                projection,
                relative_version,
            },
            Arc::clone(table),
        ));
    }

    pub fn add_sum(&mut self, table: &Arc<Table>, start: i64, end: i64, column: usize) {
        self.queries
            .push((QueryRequest::Sum { start, end, column }, Arc::clone(table)));
    }

    pub fn add_sum_version(
        &mut self,
        table: &Arc<Table>,
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    ) {
        self.queries.push((
            QueryRequest::SumVersion {
                start,
                end,
                column,
                relative_version,
            },
            Arc::clone(table),
        ));
    }

    pub fn add_increment(&mut self, table: &Arc<Table>, key: i64, column: usize) {
        self.queries
            .push((QueryRequest::Increment { key, column }, Arc::clone(table)));
    }

    pub fn run(&mut self) -> bool {
        self.run_with_limit(RETRY_LIMIT)
    }

    pub fn run_with_limit(&mut self, retry_limit: usize) -> bool {
        let mut attempt = 0usize;

        loop {
            self.rollback_log.clear();
            self.held_locks.clear();

            let outcome = {
                // Hold a shared stake on every involved table's merge gate
                // for the whole attempt, so no merge materialises tails this
                // transaction may still roll back.
                let tables = self.involved_tables();
                let _gates: Vec<_> = tables
                    .iter()
                    .map(|table| table.merge_gate().read().unwrap())
                    .collect();

                match self.execute_all() {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.rollback();
                        Err(err)
                    }
                }
            };

            attempt += 1;

            match outcome {
                Ok(()) => {
                    self.rollback_log.clear();
                    self.release_locks();
                    self.attempts = attempt;
                    return true;
                }
                Err(err) => {
                    debug!(
                        "transaction {} aborted on attempt {}: {}",
                        self.id, attempt, err
                    );
                    self.release_locks();

                    if attempt >= retry_limit {
                        self.attempts = attempt;
                        return false;
                    }

                    let ceiling = 1_000 + 2_000 * attempt as u64;
                    let backoff = rand::thread_rng().gen_range(500..ceiling);
                    thread::sleep(Duration::from_micros(backoff));
                }
            }
        }
    }

    fn involved_tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = Vec::new();
        for (_, table) in &self.queries {
            if !tables.iter().any(|t| Arc::ptr_eq(t, table)) {
                tables.push(Arc::clone(table));
            }
        }
        tables
    }

    fn execute_all(&mut self) -> Result<(), DatabaseError> {
        for i in 0..self.queries.len() {
            let (request, table) = self.queries[i].clone();
            match request {
                QueryRequest::Insert { values } => self.handle_insert(&table, &values)?,
                QueryRequest::Update { key, values } => self.handle_update(&table, key, &values)?,
                QueryRequest::Delete { key } => self.handle_delete(&table, key)?,
                QueryRequest::Increment { key, column } => {
                    self.handle_increment(&table, key, column)?
                }
                read => self.handle_read(&table, &read)?,
            }
        }
        Ok(())
    }

    fn acquire_lock(&mut self, rid: RID, requested: LockType) -> Result<(), DatabaseError> {
        if let Some(&held) = self.held_locks.get(&rid) {
            if held == LockType::Exclusive || held == requested {
                return Ok(());
            }
        }

        if LOCK_MANAGER.try_lock(self.id, rid, requested) {
            self.held_locks.insert(rid, requested);
            Ok(())
        } else {
            Err(DatabaseError::Conflict(rid))
        }
    }

    fn release_locks(&mut self) {
        if !self.held_locks.is_empty() {
            LOCK_MANAGER.release_all(self.id);
            self.held_locks.clear();
        }
    }

    /// The insert lock makes "peek the next RID, then insert" one critical
    /// section, so the logged RID is the one the insert will use.
    fn handle_insert(&mut self, table: &Arc<Table>, values: &[i64]) -> Result<(), DatabaseError> {
        let _guard = table.insert_guard();

        let rid = table.peek_next_rid();
        self.acquire_lock(rid, LockType::Exclusive)?;

        table.insert(values)?;
        self.rollback_log.push(RollbackEntry::Insert {
            table: Arc::clone(table),
            rid,
        });
        Ok(())
    }

    fn handle_update(
        &mut self,
        table: &Arc<Table>,
        key: i64,
        values: &[Option<i64>],
    ) -> Result<(), DatabaseError> {
        let rid = self.write_target(table, key)?;
        let (old_indirection, old_schema) = table.base_metadata(rid)?;
        let old_values = table.latest_values(rid)?;

        table.update(key, values)?;
        self.rollback_log.push(RollbackEntry::Update {
            table: Arc::clone(table),
            rid,
            old_indirection,
            old_schema,
            old_values,
            updated: values.to_vec(),
        });
        Ok(())
    }

    fn handle_increment(
        &mut self,
        table: &Arc<Table>,
        key: i64,
        column: usize,
    ) -> Result<(), DatabaseError> {
        let rid = self.write_target(table, key)?;
        let (old_indirection, old_schema) = table.base_metadata(rid)?;
        let old_values = table.latest_values(rid)?;

        let mut values = vec![None; table.num_columns];
        values[column] = Some(old_values[column] + 1);

        table.update(key, &values)?;
        self.rollback_log.push(RollbackEntry::Update {
            table: Arc::clone(table),
            rid,
            old_indirection,
            old_schema,
            old_values,
            updated: values,
        });
        Ok(())
    }

    /// Deletes capture the resolved pre-delete values and the tail chain, so
    /// rollback can re-insert index entries and un-tombstone the chain.
    fn handle_delete(&mut self, table: &Arc<Table>, key: i64) -> Result<(), DatabaseError> {
        let rid = self.write_target(table, key)?;
        let (old_indirection, old_schema) = table.base_metadata(rid)?;
        let old_values = table.latest_values(rid)?;
        let chain = table.tail_chain(rid)?;

        table.delete(key)?;
        self.rollback_log.push(RollbackEntry::Delete {
            table: Arc::clone(table),
            rid,
            old_values,
            old_indirection,
            old_schema,
            chain,
        });
        Ok(())
    }

    /// Locate the base record for a keyed write and lock it exclusively.
    fn write_target(&mut self, table: &Arc<Table>, key: i64) -> Result<RID, DatabaseError> {
        let rids = table.locate(table.key_column, key);
        let rid = *rids
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("key {} not found", key)))?;
        self.acquire_lock(rid, LockType::Exclusive)?;
        Ok(rid)
    }

    fn handle_read(
        &mut self,
        table: &Arc<Table>,
        request: &QueryRequest,
    ) -> Result<(), DatabaseError> {
        let candidates = match request {
            QueryRequest::Select { key, column, .. }
            | QueryRequest::SelectVersion { key, column, .. } => table.locate(*column, *key),
            QueryRequest::Sum { start, end, .. } | QueryRequest::SumVersion { start, end, .. } => {
                table.locate_range(table.key_column, *start, *end)
            }
            _ => unreachable!("write request dispatched to read handler"),
        };

        for rid in candidates {
            self.acquire_lock(rid, LockType::Shared)?;
        }

        match request {
            QueryRequest::Select {
                key,
                column,
                projection,
            } => {
                table.select(*key, *column, projection)?;
            }
            QueryRequest::SelectVersion {
                key,
                column,
                projection,
                relative_version,
            } => {
                table.select_version(*key, *column, projection, *relative_version)?;
            }
            QueryRequest::Sum { start, end, column } => {
                table.sum(*start, *end, *column)?;
            }
            QueryRequest::SumVersion {
                start,
                end,
                column,
                relative_version,
            } => {
                table.sum_version(*start, *end, *column, *relative_version)?;
            }
            _ => unreachable!(),
        }

        Ok(())
    }

    /// Undo logged side effects, newest first.
    fn rollback(&mut self) {
        for entry in self.rollback_log.drain(..).rev() {
            let result = match entry {
                RollbackEntry::Insert { table, rid } => table.delete_record_by_rid(rid),
                RollbackEntry::Update {
                    table,
                    rid,
                    old_indirection,
                    old_schema,
                    old_values,
                    updated,
                } => {
                    table.revert_update_index(rid, &old_values, &updated);
                    table.restore_base_metadata(rid, old_indirection, old_schema)
                }
                RollbackEntry::Delete {
                    table,
                    rid,
                    old_values,
                    old_indirection,
                    old_schema,
                    chain,
                } => table.restore_deleted(rid, &old_values, old_indirection, old_schema, &chain),
            };

            if let Err(err) = result {
                warn!("rollback step failed for transaction {}: {}", self.id, err);
            }
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let manager = LockManager::new();
        assert!(manager.try_lock(1, 7, LockType::Shared));
        assert!(manager.try_lock(2, 7, LockType::Shared));

        // Upgrade is denied while another holder exists.
        assert!(!manager.try_lock(1, 7, LockType::Exclusive));

        manager.release_all(2);
        assert!(manager.try_lock(1, 7, LockType::Exclusive));
    }

    #[test]
    fn exclusive_lock_excludes_others() {
        let manager = LockManager::new();
        assert!(manager.try_lock(1, 3, LockType::Exclusive));
        assert!(!manager.try_lock(2, 3, LockType::Shared));
        assert!(!manager.try_lock(2, 3, LockType::Exclusive));

        // Reentrant for the holder.
        assert!(manager.try_lock(1, 3, LockType::Exclusive));
        assert!(manager.try_lock(1, 3, LockType::Shared));

        manager.release_all(1);
        assert!(manager.try_lock(2, 3, LockType::Shared));
    }
}
