mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lstore::{Query, Table};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_COLUMNS: usize = 3;
const KEY_SPACE: i64 = 50;

/// Drive a random insert/update/delete trace against a table and a plain
/// in-memory model, then check that every read agrees with the model.
fn run_random_trace(merge_threshold: usize, seed: u64) {
    common::setup();
    let table = Arc::new(Table::with_merge_threshold(
        "randomized",
        NUM_COLUMNS,
        0,
        merge_threshold,
    ));
    let query = Query::new(Arc::clone(&table));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut model: HashMap<i64, Vec<i64>> = HashMap::new();

    for step in 0..600 {
        let key = rng.gen_range(0..KEY_SPACE);
        let present = model.contains_key(&key);

        match rng.gen_range(0..10) {
            // Insert a fresh record.
            0..=2 => {
                let row: Vec<i64> = std::iter::once(key)
                    .chain((1..NUM_COLUMNS).map(|_| rng.gen_range(-100..100)))
                    .collect();
                if present {
                    assert!(query.insert(&row).is_err(), "duplicate insert at {}", step);
                } else {
                    query.insert(&row).unwrap();
                    model.insert(key, row);
                }
            }
            // Update a random subset of the non-key columns.
            3..=8 => {
                let mut values: Vec<Option<i64>> = vec![None; NUM_COLUMNS];
                for column in 1..NUM_COLUMNS {
                    if rng.gen_bool(0.6) {
                        values[column] = Some(rng.gen_range(-100..100));
                    }
                }
                if present {
                    query.update(key, &values).unwrap();
                    let row = model.get_mut(&key).unwrap();
                    for (column, value) in values.iter().enumerate() {
                        if let Some(v) = value {
                            row[column] = *v;
                        }
                    }
                } else {
                    assert!(query.update(key, &values).is_err());
                }
            }
            // Delete.
            _ => {
                if present {
                    query.delete(key).unwrap();
                    model.remove(&key);
                } else {
                    assert!(query.delete(key).is_err());
                }
            }
        }
    }

    // Let any in-flight merge settle before the final sweep; reads are legal
    // during a merge, this just makes failures easier to attribute.
    common::wait_for_merge(&table, Duration::from_secs(5));

    let projection = vec![1; NUM_COLUMNS];
    for key in 0..KEY_SPACE {
        let records = query.select(key, 0, &projection).unwrap();
        match model.get(&key) {
            Some(row) => {
                assert_eq!(records.len(), 1, "key {}", key);
                let got: Vec<i64> = records[0].columns.iter().map(|c| c.unwrap()).collect();
                assert_eq!(&got, row, "key {}", key);
            }
            None => assert!(records.is_empty(), "key {}", key),
        }
    }

    if model.is_empty() {
        assert!(query.sum(0, KEY_SPACE, 1).is_err());
    } else {
        let expected: i64 = model.values().map(|row| row[1]).sum();
        assert_eq!(query.sum(0, KEY_SPACE, 1).unwrap(), expected);
    }
}

#[test]
fn randomized_trace_matches_model() {
    run_random_trace(10_000, 0xC0FFEE);
}

#[test]
fn randomized_trace_matches_model_with_merge_churn() {
    run_random_trace(5, 0xBEEF);
}

#[test]
fn secondary_index_agrees_with_latest_values() {
    common::setup();
    let table = Arc::new(Table::with_merge_threshold("indexed", NUM_COLUMNS, 0, 10_000));
    let query = Query::new(Arc::clone(&table));

    let mut rng = StdRng::seed_from_u64(7);
    let mut model: HashMap<i64, Vec<i64>> = HashMap::new();

    for key in 0..KEY_SPACE {
        let row = vec![key, rng.gen_range(0..10), rng.gen_range(0..10)];
        query.insert(&row).unwrap();
        model.insert(key, row);
    }

    // Build the secondary index after a first burst of updates so it has to
    // resolve tail values, then keep mutating under index maintenance.
    for _ in 0..100 {
        let key = rng.gen_range(0..KEY_SPACE);
        let value = rng.gen_range(0..10);
        query.update(key, &[None, Some(value), None]).unwrap();
        model.get_mut(&key).unwrap()[1] = value;
    }

    table.create_index(1).unwrap();

    for _ in 0..100 {
        let key = rng.gen_range(0..KEY_SPACE);
        if rng.gen_bool(0.1) {
            query.delete(key).ok();
            model.remove(&key);
            continue;
        }
        let value = rng.gen_range(0..10);
        query.update(key, &[None, Some(value), None]).ok();
        if let Some(row) = model.get_mut(&key) {
            row[1] = value;
        }
    }

    // Index lookups return exactly the records whose latest value matches.
    for value in 0..10 {
        let mut got: Vec<i64> = query
            .select(value, 1, &vec![1; NUM_COLUMNS])
            .unwrap()
            .iter()
            .map(|record| record.columns[0].unwrap())
            .collect();
        got.sort_unstable();

        let mut expected: Vec<i64> = model
            .iter()
            .filter(|(_, row)| row[1] == value)
            .map(|(&key, _)| key)
            .collect();
        expected.sort_unstable();

        assert_eq!(got, expected, "value {}", value);
    }
}
