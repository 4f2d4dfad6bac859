use std::sync::Arc;

use crate::errors::DatabaseError;
use crate::table::{Record, Table, RID};

/// Operation facade over one table. Failures come back as `Err` (the engine
/// never panics into the caller); transactions map `Conflict` errors to
/// abort-and-retry and treat everything else as a plain abort.
pub struct Query {
    pub table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Query { table }
    }

    /// Insert a record with one value per user column.
    pub fn insert(&self, values: &[i64]) -> Result<RID, DatabaseError> {
        self.table.insert(values)
    }

    /// Update the record with primary key `key`; `None` entries leave the
    /// column unchanged.
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> Result<RID, DatabaseError> {
        self.table.update(key, values)
    }

    /// Delete the record with primary key `key`.
    pub fn delete(&self, key: i64) -> Result<RID, DatabaseError> {
        self.table.delete(key)
    }

    /// Read the latest version of all records with `search_key` in
    /// `search_column`. `projection` holds one 0/1 flag per user column.
    pub fn select(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[usize],
    ) -> Result<Vec<Record>, DatabaseError> {
        self.table.select(search_key, search_column, projection)
    }

    /// Read a historical version: `relative_version <= 0` skips that many of
    /// the newest updates.
    pub fn select_version(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[usize],
        relative_version: i64,
    ) -> Result<Vec<Record>, DatabaseError> {
        self.table
            .select_version(search_key, search_column, projection, relative_version)
    }

    /// Sum `agg_column` over records with primary keys in `[start, end]`.
    pub fn sum(&self, start: i64, end: i64, agg_column: usize) -> Result<i64, DatabaseError> {
        self.table.sum(start, end, agg_column)
    }

    pub fn sum_version(
        &self,
        start: i64,
        end: i64,
        agg_column: usize,
        relative_version: i64,
    ) -> Result<i64, DatabaseError> {
        self.table
            .sum_version(start, end, agg_column, relative_version)
    }

    /// Add one to `column` of the record with primary key `key`. Select then
    /// update; fails if the record is absent.
    pub fn increment(&self, key: i64, column: usize) -> Result<RID, DatabaseError> {
        if column >= self.table.num_columns {
            return Err(DatabaseError::NotFound(format!(
                "column {} out of range",
                column
            )));
        }

        let projection = vec![1; self.table.num_columns];
        let records = self.select(key, self.table.key_column, &projection)?;
        let record = records
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("key {} not found", key)))?;

        let current = record.columns[column].ok_or_else(|| {
            DatabaseError::InvariantViolation(format!("column {} unresolved", column))
        })?;

        let mut values = vec![None; self.table.num_columns];
        values[column] = Some(current + 1);
        self.update(key, &values)
    }
}
