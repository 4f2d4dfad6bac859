mod common;

use std::sync::Arc;

use lstore::{Query, Table};

const GRADES_KEY: i64 = 906659671;

/// A five-column grades table with a merge threshold high enough that no
/// background merge interferes with the assertions.
fn grades_table() -> (Arc<Table>, Query) {
    common::setup();
    let table = Arc::new(Table::with_merge_threshold("Grades", 5, 0, 10_000));
    let query = Query::new(Arc::clone(&table));
    (table, query)
}

fn insert_grades(query: &Query) {
    query
        .insert(&[GRADES_KEY, 93, 85, 90, 88])
        .expect("insert should succeed");
}

#[test]
fn insert_then_select_returns_the_row() {
    let (_table, query) = grades_table();
    insert_grades(&query);

    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].columns,
        vec![Some(GRADES_KEY), Some(93), Some(85), Some(90), Some(88)]
    );
    assert_eq!(records[0].key, GRADES_KEY);
}

#[test]
fn update_single_column() {
    let (table, query) = grades_table();
    insert_grades(&query);

    query
        .update(GRADES_KEY, &[None, Some(95), None, None, None])
        .unwrap();

    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(
        records[0].columns,
        vec![Some(GRADES_KEY), Some(95), Some(85), Some(90), Some(88)]
    );
    assert_eq!(table.next_tail_position(), 1);
}

#[test]
fn updates_accumulate_across_tail_records() {
    let (table, query) = grades_table();
    insert_grades(&query);

    query
        .update(GRADES_KEY, &[None, Some(95), None, None, None])
        .unwrap();
    query
        .update(GRADES_KEY, &[None, None, Some(92), Some(95), None])
        .unwrap();

    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(
        records[0].columns,
        vec![Some(GRADES_KEY), Some(95), Some(92), Some(95), Some(88)]
    );
    assert_eq!(table.next_tail_position(), 2);
}

#[test]
fn update_missing_key_fails_and_changes_nothing() {
    let (table, query) = grades_table();
    insert_grades(&query);

    assert!(query
        .update(999_999, &[None, Some(100), None, None, None])
        .is_err());

    assert_eq!(table.next_tail_position(), 0);
    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(
        records[0].columns,
        vec![Some(GRADES_KEY), Some(93), Some(85), Some(90), Some(88)]
    );
}

#[test]
fn projection_masks_unrequested_columns() {
    let (_table, query) = grades_table();
    insert_grades(&query);

    let records = query.select(GRADES_KEY, 0, &[0, 1, 0, 0, 1]).unwrap();
    assert_eq!(
        records[0].columns,
        vec![None, Some(93), None, None, Some(88)]
    );
}

#[test]
fn select_version_steps_back_through_the_chain() {
    let (_table, query) = grades_table();
    insert_grades(&query);

    query
        .update(GRADES_KEY, &[None, Some(95), None, None, None])
        .unwrap();
    query
        .update(GRADES_KEY, &[None, Some(98), None, None, None])
        .unwrap();

    let all = [1, 1, 1, 1, 1];

    // Version 0 is the latest, identical to a plain select.
    let latest = query.select_version(GRADES_KEY, 0, &all, 0).unwrap();
    let plain = query.select(GRADES_KEY, 0, &all).unwrap();
    assert_eq!(latest[0].columns, plain[0].columns);
    assert_eq!(latest[0].columns[1], Some(98));

    // -1 skips the newest update.
    let previous = query.select_version(GRADES_KEY, 0, &all, -1).unwrap();
    assert_eq!(previous[0].columns[1], Some(95));

    // Skipping past the whole chain resolves everything from the base slot.
    let oldest = query.select_version(GRADES_KEY, 0, &all, -2).unwrap();
    assert_eq!(oldest[0].columns[1], Some(93));
    let ancient = query.select_version(GRADES_KEY, 0, &all, -10).unwrap();
    assert_eq!(ancient[0].columns, oldest[0].columns);
}

#[test]
fn noop_update_leaves_selects_unchanged() {
    let (_table, query) = grades_table();
    insert_grades(&query);

    query
        .update(GRADES_KEY, &[None, Some(95), None, None, None])
        .unwrap();
    let before = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();

    query
        .update(GRADES_KEY, &[None, None, None, None, None])
        .unwrap();
    let after = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();

    assert_eq!(before[0].columns, after[0].columns);
}

#[test]
fn delete_hides_the_record_everywhere() {
    let (_table, query) = grades_table();
    insert_grades(&query);
    query
        .update(GRADES_KEY, &[None, Some(95), None, None, None])
        .unwrap();

    query.delete(GRADES_KEY).unwrap();

    assert!(query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap().is_empty());
    assert!(query.sum(GRADES_KEY, GRADES_KEY, 1).is_err());
    assert!(query.update(GRADES_KEY, &[None, Some(1), None, None, None]).is_err());
    assert!(query.delete(GRADES_KEY).is_err());
}

#[test]
fn deleted_key_can_be_reinserted() {
    let (_table, query) = grades_table();
    insert_grades(&query);
    query.delete(GRADES_KEY).unwrap();

    query.insert(&[GRADES_KEY, 1, 2, 3, 4]).unwrap();
    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].columns,
        vec![Some(GRADES_KEY), Some(1), Some(2), Some(3), Some(4)]
    );
}

#[test]
fn sum_over_key_range() {
    let (_table, query) = grades_table();
    for i in 0..10 {
        query.insert(&[i, i * 10, 0, 0, 0]).unwrap();
    }

    assert_eq!(query.sum(0, 9, 1).unwrap(), 450);
    assert_eq!(query.sum(3, 5, 1).unwrap(), 120);
    assert_eq!(query.sum(0, 9, 0).unwrap(), 45);

    // Updates are reflected in sums.
    query.update(4, &[None, Some(1_000), None, None, None]).unwrap();
    assert_eq!(query.sum(3, 5, 1).unwrap(), 1_080);

    // An empty range is a false-kind result, not zero.
    assert!(query.sum(100, 200, 1).is_err());
}

#[test]
fn sum_version_skips_recent_updates() {
    let (_table, query) = grades_table();
    query.insert(&[1, 10, 0, 0, 0]).unwrap();
    query.insert(&[2, 20, 0, 0, 0]).unwrap();

    query.update(1, &[None, Some(11), None, None, None]).unwrap();
    query.update(2, &[None, Some(22), None, None, None]).unwrap();

    assert_eq!(query.sum_version(1, 2, 1, 0).unwrap(), 33);
    assert_eq!(query.sum_version(1, 2, 1, -1).unwrap(), 30);
}

#[test]
fn increment_is_select_then_update() {
    let (table, query) = grades_table();
    insert_grades(&query);

    query.increment(GRADES_KEY, 2).unwrap();
    query.increment(GRADES_KEY, 2).unwrap();

    let records = query.select(GRADES_KEY, 0, &[1, 1, 1, 1, 1]).unwrap();
    assert_eq!(records[0].columns[2], Some(87));
    assert_eq!(table.next_tail_position(), 2);

    assert!(query.increment(424242, 2).is_err());
}

#[test]
fn insert_validations() {
    let (_table, query) = grades_table();
    insert_grades(&query);

    // Duplicate primary key.
    assert!(query.insert(&[GRADES_KEY, 0, 0, 0, 0]).is_err());

    // Wrong column count.
    assert!(query.insert(&[1, 2, 3]).is_err());
    assert!(query.update(GRADES_KEY, &[None, None]).is_err());
}

#[test]
fn select_on_unindexed_column_scans() {
    let (table, query) = grades_table();
    query.insert(&[1, 7, 100, 0, 0]).unwrap();
    query.insert(&[2, 7, 200, 0, 0]).unwrap();
    query.insert(&[3, 8, 300, 0, 0]).unwrap();

    assert!(!table.is_indexed(1));
    let mut rids: Vec<_> = query
        .select(7, 1, &[1, 1, 1, 1, 1])
        .unwrap()
        .iter()
        .map(|r| r.rid)
        .collect();
    rids.sort_unstable();
    assert_eq!(rids.len(), 2);

    // The scan sees latest values, so an update moves records between keys.
    query.update(3, &[None, Some(7), None, None, None]).unwrap();
    assert_eq!(query.select(7, 1, &[1, 1, 1, 1, 1]).unwrap().len(), 3);
    assert!(query.select(8, 1, &[1, 1, 1, 1, 1]).unwrap().is_empty());
}

#[test]
fn create_index_resolves_latest_values() {
    let (table, query) = grades_table();
    query.insert(&[1, 10, 0, 0, 0]).unwrap();
    query.insert(&[2, 20, 0, 0, 0]).unwrap();
    query.update(1, &[None, Some(30), None, None, None]).unwrap();

    // Built after the update, the index must reflect the tail value, not the
    // base snapshot.
    table.create_index(1).unwrap();
    assert!(table.is_indexed(1));

    assert!(query.select(10, 1, &[1, 1, 1, 1, 1]).unwrap().is_empty());
    assert_eq!(query.select(30, 1, &[1, 1, 1, 1, 1]).unwrap().len(), 1);
    assert_eq!(query.select(20, 1, &[1, 1, 1, 1, 1]).unwrap().len(), 1);

    // Maintained by subsequent updates and deletes.
    query.update(2, &[None, Some(30), None, None, None]).unwrap();
    assert_eq!(query.select(30, 1, &[1, 1, 1, 1, 1]).unwrap().len(), 2);
    query.delete(1).unwrap();
    assert_eq!(query.select(30, 1, &[1, 1, 1, 1, 1]).unwrap().len(), 1);

    assert!(table.drop_index(1));
    assert!(!table.is_indexed(1));
}
