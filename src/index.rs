use std::collections::BTreeMap;
use std::ops::Bound::Included;

use crate::table::RID;

/// Per-column ordered multimaps from column value to the RIDs holding it.
/// RID lists keep insertion order. Only the primary key column is indexed at
/// creation; others are built on demand.
pub struct Index {
    indices: Vec<Option<BTreeMap<i64, Vec<RID>>>>,
}

impl Index {
    pub fn new(num_columns: usize, key_column: usize) -> Self {
        let mut indices: Vec<Option<BTreeMap<i64, Vec<RID>>>> = Vec::new();
        indices.resize_with(num_columns, || None);
        indices[key_column] = Some(BTreeMap::new());

        Index { indices }
    }

    pub fn is_indexed(&self, column: usize) -> bool {
        self.indices.get(column).map_or(false, |i| i.is_some())
    }

    /// Columns currently carrying an index, in ascending order.
    pub fn indexed_columns(&self) -> Vec<usize> {
        self.indices
            .iter()
            .enumerate()
            .filter(|(_, index)| index.is_some())
            .map(|(column, _)| column)
            .collect()
    }

    /// RIDs whose latest value in `column` equals `value`. Empty when the
    /// column is unindexed; callers fall back to a scan.
    pub fn locate(&self, column: usize, value: i64) -> Vec<RID> {
        match self.indices.get(column) {
            Some(Some(tree)) => tree.get(&value).cloned().unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// RIDs for every key in `[begin, end]`, in ascending key order.
    pub fn locate_range(&self, column: usize, begin: i64, end: i64) -> Vec<RID> {
        let tree = match self.indices.get(column) {
            Some(Some(tree)) => tree,
            _ => return Vec::new(),
        };

        let mut rids = Vec::new();
        for (_, bucket) in tree.range((Included(&begin), Included(&end))) {
            rids.extend(bucket.iter().copied());
        }
        rids
    }

    /// Append `rid` under `value`, creating the bucket if absent. No-op on an
    /// unindexed column.
    pub fn insert_entry(&mut self, column: usize, value: i64, rid: RID) {
        if let Some(Some(tree)) = self.indices.get_mut(column) {
            tree.entry(value).or_default().push(rid);
        }
    }

    /// Remove one occurrence of `rid` under `value`; drops the key when its
    /// bucket empties. No-op on an unindexed column or absent pair.
    pub fn delete_entry(&mut self, column: usize, value: i64, rid: RID) {
        if let Some(Some(tree)) = self.indices.get_mut(column) {
            if let Some(bucket) = tree.get_mut(&value) {
                if let Some(pos) = bucket.iter().position(|&r| r == rid) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    tree.remove(&value);
                }
            }
        }
    }

    /// Install a freshly built index for `column` from `(value, rid)` entries.
    /// The table resolves each record's latest value before calling this, so a
    /// new index agrees with latest-version reads immediately.
    pub fn install(&mut self, column: usize, entries: Vec<(i64, RID)>) {
        let mut tree: BTreeMap<i64, Vec<RID>> = BTreeMap::new();
        for (value, rid) in entries {
            tree.entry(value).or_default().push(rid);
        }
        self.indices[column] = Some(tree);
    }

    pub fn drop_index(&mut self, column: usize) -> bool {
        if column >= self.indices.len() {
            return false;
        }
        self.indices[column] = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_on_unindexed_column_is_empty() {
        let index = Index::new(3, 0);
        assert!(index.locate(1, 42).is_empty());
        assert!(index.locate_range(2, 0, 100).is_empty());
    }

    #[test]
    fn insert_and_delete_entries() {
        let mut index = Index::new(2, 0);
        index.insert_entry(0, 10, 1);
        index.insert_entry(0, 10, 2);
        index.insert_entry(0, 20, 3);

        assert_eq!(index.locate(0, 10), vec![1, 2]);
        assert_eq!(index.locate_range(0, 0, 30), vec![1, 2, 3]);

        index.delete_entry(0, 10, 1);
        assert_eq!(index.locate(0, 10), vec![2]);

        index.delete_entry(0, 10, 2);
        assert!(index.locate(0, 10).is_empty());
        assert_eq!(index.locate_range(0, 0, 30), vec![3]);
    }

    #[test]
    fn range_is_ascending_by_key() {
        let mut index = Index::new(1, 0);
        index.insert_entry(0, 30, 3);
        index.insert_entry(0, 10, 1);
        index.insert_entry(0, 20, 2);
        assert_eq!(index.locate_range(0, 10, 30), vec![1, 2, 3]);
    }
}
