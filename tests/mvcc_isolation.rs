//! Transaction isolation properties: a transaction's own buffered writes
//! aren't visible until commit, concurrent transactions never observe each
//! other's uncommitted state, and rollback leaves no trace.

use strata::storage::{PropertyDef, Value};
use strata::types::PhysicalType;
use strata::{Config, Database};

fn open_with_counters(dir: &std::path::Path) -> (Database, strata::types::TableId) {
    let mut db = Database::open(dir, Config::default()).unwrap();
    let table = db
        .create_node_table(
            "counters",
            vec![PropertyDef {
                name: "value".into(),
                physical_type: PhysicalType::Int64,
            }],
            None,
        )
        .unwrap();
    (db, table)
}

#[test]
fn uncommitted_writes_are_visible_to_their_own_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_with_counters(dir.path());

    let mut txn = db.begin_transaction();
    txn.insert(table, vec![Value::Int64(42)]).unwrap();
    // Row offsets aren't assigned until commit, so a transaction's own
    // pending insert isn't reachable through an offset-addressed read yet —
    // not a visibility rule, just a consequence of offsets being assigned
    // at commit time.
    assert_eq!(txn.get(table, 0).unwrap(), None);
    txn.commit().unwrap();

    // An update to an already-committed row has a real offset, so the
    // transaction that makes it must see it immediately, before commit.
    let mut txn2 = db.begin_transaction();
    txn2.update(table, 0, 0, Value::Int64(100)).unwrap();
    assert_eq!(txn2.get(table, 0).unwrap(), Some(vec![Value::Int64(100)]));
    txn2.rollback().unwrap();

    // Rolling back discarded the update; a fresh transaction sees the
    // original committed value.
    let txn3 = db.begin_transaction();
    assert_eq!(txn3.get(table, 0).unwrap(), Some(vec![Value::Int64(42)]));
    txn3.rollback().unwrap();

    // A delete, likewise, is visible to its own transaction before commit.
    let mut txn4 = db.begin_transaction();
    txn4.delete(table, 0).unwrap();
    assert_eq!(txn4.get(table, 0).unwrap(), None);
    txn4.commit().unwrap();

    let txn5 = db.begin_transaction();
    assert_eq!(txn5.get(table, 0).unwrap(), None);
    txn5.rollback().unwrap();
}

#[test]
fn concurrent_transaction_does_not_see_uncommitted_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_with_counters(dir.path());

    let mut writer = db.begin_transaction();
    writer.insert(table, vec![Value::Int64(7)]).unwrap();

    // A second, concurrently active transaction reads through the same
    // committed-state view; it must not see `writer`'s buffered insert.
    let reader = db.begin_transaction();
    assert_eq!(reader.get(table, 0).unwrap(), None);

    writer.commit().unwrap();

    // Only a transaction begun after the commit sees the row.
    assert_eq!(reader.get(table, 0).unwrap(), None);
    reader.rollback().unwrap();

    let after = db.begin_transaction();
    assert_eq!(after.get(table, 0).unwrap(), Some(vec![Value::Int64(7)]));
    after.rollback().unwrap();
}

#[test]
fn rollback_discards_every_buffered_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_with_counters(dir.path());

    let mut txn = db.begin_transaction();
    txn.insert(table, vec![Value::Int64(1)]).unwrap();
    txn.insert(table, vec![Value::Int64(2)]).unwrap();
    txn.rollback().unwrap();

    let (_, _, row_count) = db
        .table_summaries()
        .into_iter()
        .find(|(id, _, _)| *id == table)
        .unwrap();
    assert_eq!(row_count, 0);

    let txn = db.begin_transaction();
    assert_eq!(txn.get(table, 0).unwrap(), None);
    txn.rollback().unwrap();
}

#[test]
fn commit_id_visibility_advances_past_completed_writers() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_with_counters(dir.path());

    let before = db.oldest_visible_commit();

    let mut txn = db.begin_transaction();
    txn.insert(table, vec![Value::Int64(1)]).unwrap();
    txn.commit().unwrap();

    let after = db.oldest_visible_commit();
    assert!(after >= before);
}

#[test]
fn duplicate_primary_key_across_concurrent_transactions_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(dir.path(), Config::default()).unwrap();
    let table = db
        .create_node_table(
            "people",
            vec![PropertyDef {
                name: "id".into(),
                physical_type: PhysicalType::Int64,
            }],
            Some(0),
        )
        .unwrap();

    let mut first = db.begin_transaction();
    first.insert(table, vec![Value::Int64(1)]).unwrap();
    first.commit().unwrap();

    let mut second = db.begin_transaction();
    second.insert(table, vec![Value::Int64(1)]).unwrap();
    assert!(second.commit().is_err());

    let txn = db.begin_transaction();
    assert_eq!(txn.get(table, 0).unwrap(), Some(vec![Value::Int64(1)]));
    assert_eq!(txn.get(table, 1).unwrap(), None);
    txn.rollback().unwrap();
}
