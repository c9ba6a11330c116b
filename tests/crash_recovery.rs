//! Recovery-equivalence tests: a database that is dropped without ever
//! checkpointing (simulating a crash) must reopen into the same state a
//! clean run that made the same commits would have reached, because the
//! WAL alone carries every committed mutation.

use strata::storage::{PropertyDef, Value};
use strata::types::PhysicalType;
use strata::{Config, Database};

fn int_column(name: &str) -> Vec<PropertyDef> {
    vec![PropertyDef {
        name: name.into(),
        physical_type: PhysicalType::Int64,
    }]
}

#[test]
fn uncheckpointed_commits_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        // auto_checkpoint stays on by default, but nothing here grows the
        // WAL past checkpoint_threshold, so the WAL is what carries every
        // row across the "crash" (the db is dropped without an explicit
        // checkpoint() call).
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let counters = db.create_node_table("counters", int_column("value"), None).unwrap();

        for batch in 0..5i64 {
            let mut txn = db.begin_transaction();
            for i in 0..20i64 {
                txn.insert(counters, vec![Value::Int64(batch * 20 + i)]).unwrap();
            }
            txn.commit().unwrap();
        }
        // db dropped here without checkpointing; only the WAL is durable.
    }

    let db = Database::open(dir.path(), Config::default()).unwrap();
    let counters = db.table_id("counters").expect("table recovered from WAL");
    let (_, _, row_count) = db
        .table_summaries()
        .into_iter()
        .find(|(id, _, _)| *id == counters)
        .unwrap();
    assert_eq!(row_count, 100);

    let txn = db.begin_transaction();
    let mut seen = Vec::new();
    for offset in 0..row_count {
        if let Some(row) = txn.get(counters, offset).unwrap() {
            seen.push(row[0].clone());
        }
    }
    txn.rollback().unwrap();

    let expected: Vec<Value> = (0..100i64).map(Value::Int64).collect();
    assert_eq!(seen, expected);
}

#[test]
fn dropped_uncommitted_transaction_never_appears_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let counters = db.create_node_table("counters", int_column("value"), None).unwrap();

        let mut txn = db.begin_transaction();
        txn.insert(counters, vec![Value::Int64(1)]).unwrap();
        txn.commit().unwrap();

        // Never committed or rolled back explicitly; dropping it must
        // behave exactly like an explicit rollback, both before and after
        // a simulated crash.
        let mut abandoned = db.begin_transaction();
        abandoned.insert(counters, vec![Value::Int64(999)]).unwrap();
        drop(abandoned);
    }

    let db = Database::open(dir.path(), Config::default()).unwrap();
    let counters = db.table_id("counters").unwrap();
    let (_, _, row_count) = db
        .table_summaries()
        .into_iter()
        .find(|(id, _, _)| *id == counters)
        .unwrap();
    assert_eq!(row_count, 1);
}

#[test]
fn catalog_and_rows_recover_across_repeated_reopens() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let a = db.create_node_table("a", int_column("v"), None).unwrap();
        let mut txn = db.begin_transaction();
        txn.insert(a, vec![Value::Int64(1)]).unwrap();
        txn.commit().unwrap();
    }
    {
        let mut db = Database::open(dir.path(), Config::default()).unwrap();
        let a = db.table_id("a").unwrap();
        let b = db.create_node_table("b", int_column("v"), None).unwrap();
        let mut txn = db.begin_transaction();
        txn.insert(a, vec![Value::Int64(2)]).unwrap();
        txn.insert(b, vec![Value::Int64(10)]).unwrap();
        txn.commit().unwrap();
    }

    let db = Database::open(dir.path(), Config::default()).unwrap();
    let counts: std::collections::HashMap<_, _> = db
        .table_summaries()
        .into_iter()
        .map(|(id, name, rows)| (name, (id, rows)))
        .collect();
    assert_eq!(counts["a"].1, 2);
    assert_eq!(counts["b"].1, 1);
}
