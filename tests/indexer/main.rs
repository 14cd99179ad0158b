use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use transactional_rust::{Connection, Indexer, Operation, Phase, Value};

fn values(indexer: &Indexer, key: &str) -> Vec<Option<Value>> {
    indexer.lookup_metadata(key, "value")
}

// =============================================================================
// Index lifecycle follows the connection buffer
// =============================================================================

#[test]
fn committed_operations_leave_the_index() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    let op = connection.add_metadata("value", "v1").unwrap();
    indexer.index(&op, Some("k"));
    assert_eq!(indexer.lookup("k"), vec![op.clone()]);

    connection.commit_transaction().unwrap();
    assert!(indexer.lookup("k").is_empty());
    assert!(indexer.is_empty());
}

#[test]
fn rolled_back_operations_leave_the_index() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    let op = connection.add_metadata("value", "v1").unwrap();
    indexer.index(&op, Some("k"));
    connection.rollback_transaction().unwrap();

    assert!(!indexer.contains("k", &op));
}

#[test]
fn removed_operations_leave_the_index() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    let op = connection.add_metadata("value", "v1").unwrap();
    indexer.index(&op, Some("k"));
    connection.remove_operation(&op).unwrap();

    assert!(indexer.lookup("k").is_empty());
}

#[test]
fn nested_commit_keeps_entries_until_outer_resolution() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    connection.start_transaction();
    let op = connection.add_metadata("value", "v1").unwrap();
    indexer.index(&op, Some("k"));

    connection.commit_transaction().unwrap();
    assert!(indexer.contains("k", &op));

    connection.commit_transaction().unwrap();
    assert!(!indexer.contains("k", &op));
}

#[test]
fn value_store_across_nested_transactions() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    for (value, key) in [("value1", "test1"), ("value2", "test1"), ("value1", "test2"), ("value2", "test2")] {
        let op = connection.add_metadata("value", value).unwrap();
        indexer.index(&op, Some(key));
    }
    assert_eq!(
        values(&indexer, "test1"),
        vec![Some(json!("value1")), Some(json!("value2"))]
    );

    connection.start_transaction();
    for key in ["test1", "test2"] {
        let op = connection.add_metadata("value", "value3").unwrap();
        indexer.index(&op, Some(key));
    }
    assert_eq!(
        values(&indexer, "test2"),
        vec![Some(json!("value1")), Some(json!("value2")), Some(json!("value3"))]
    );

    connection.rollback_transaction().unwrap();
    assert_eq!(
        values(&indexer, "test1"),
        vec![Some(json!("value1")), Some(json!("value2"))]
    );
    assert_eq!(
        values(&indexer, "test2"),
        vec![Some(json!("value1")), Some(json!("value2"))]
    );

    connection.commit_transaction().unwrap();
    assert!(values(&indexer, "test1").is_empty());
    assert!(values(&indexer, "test2").is_empty());
    assert!(indexer.keys().is_empty());
}

#[test]
fn lookup_metadata_reports_missing_entries() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    connection.start_transaction();
    let with = connection.add_metadata("value", "present").unwrap();
    let without = connection.add_metadata("other", 1).unwrap();
    indexer.index(&with, Some("k"));
    indexer.index(&without, Some("k"));

    assert_eq!(values(&indexer, "k"), vec![Some(json!("present")), None]);
}

// =============================================================================
// Indexing from lifecycle callbacks
// =============================================================================

#[test]
fn buffer_callback_indexes_its_operation() {
    let printed = Rc::new(RefCell::new(Vec::new()));
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);

    let make = |name: &'static str, key: &'static str| {
        let op = Operation::new();
        let commit_log = Rc::clone(&printed);
        let rollback_log = Rc::clone(&printed);
        let indexer = indexer.clone();
        op.on_commit(move |_, _| {
            commit_log.borrow_mut().push(format!("{} committed", name));
            Ok(Value::Null)
        })
        .on_rollback(move |_, _| {
            rollback_log.borrow_mut().push(format!("{} rolled back", name));
            Ok(Value::Null)
        })
        .on_buffer(move |op, _| {
            Ok(json!(indexer.index(op, Some(key))))
        })
        .set_metadata("value", name);
        op
    };

    // Outside a transaction nothing is buffered, so nothing is indexed.
    connection.add_operation(&make("test1", "test1")).unwrap();

    connection.start_transaction();
    let second = make("test2", "test2");
    connection.add_operation(&second).unwrap();
    assert_eq!(second.result_of(Phase::Buffer), Some(json!(true)));

    connection.start_transaction();
    connection.add_operation(&make("test3", "test3")).unwrap();
    connection.add_operation(&make("test3 - second", "test3")).unwrap();

    assert!(indexer.lookup("test1").is_empty());
    assert_eq!(values(&indexer, "test2"), vec![Some(json!("test2"))]);
    assert_eq!(
        values(&indexer, "test3"),
        vec![Some(json!("test3")), Some(json!("test3 - second"))]
    );

    connection.rollback_transaction().unwrap();
    assert!(indexer.lookup("test3").is_empty());
    assert_eq!(indexer.len(), 1);

    connection.commit_transaction().unwrap();
    assert!(indexer.is_empty());
    assert_eq!(
        *printed.borrow(),
        vec![
            "test1 committed",
            "test3 rolled back",
            "test3 - second rolled back",
            "test2 committed",
        ]
    );
}

#[test]
fn reindexed_operation_survives_its_own_rollback() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);
    let op = Operation::new();
    {
        let indexer = indexer.clone();
        op.on_rollback(move |op, connection| {
            if connection.depth() > 0 {
                connection.add_operation(op)?;
                indexer.index(op, Some("pending"));
            }
            Ok(Value::Null)
        });
    }

    connection.start_transaction();
    connection.start_transaction();
    connection.add_operation(&op).unwrap();
    indexer.index(&op, Some("pending"));
    let first = op.position(&connection);

    connection.rollback_transaction().unwrap();
    let entries = indexer.lookup_positions("pending");
    assert_eq!(entries.len(), 1);
    assert_ne!(Some(entries[0].0), first);
    assert_eq!(Some(entries[0].0), op.position(&connection));

    connection.rollback_transaction().unwrap();
    assert!(indexer.lookup("pending").is_empty());
    assert!(indexer.is_empty());
    assert_eq!(op.callback_count(Phase::Remove), 1);
}

#[test]
fn readded_operation_is_not_indexed_implicitly() {
    let mut connection = Connection::new();
    let indexer = Indexer::new(&connection);
    let op = Operation::new();
    op.on_rollback(|op, connection| {
        if connection.depth() > 0 {
            connection.add_operation(op)?;
        }
        Ok(Value::Null)
    });

    connection.start_transaction();
    connection.start_transaction();
    connection.add_operation(&op).unwrap();
    indexer.index(&op, Some("k"));

    connection.rollback_transaction().unwrap();
    assert!(connection.has_operation(&op));
    assert!(indexer.lookup("k").is_empty());
}

// =============================================================================
// Multiple connections
// =============================================================================

#[test]
fn hooks_ignore_other_connections() {
    let mut primary = Connection::with_id("primary");
    let mut secondary = Connection::with_id("secondary");
    let indexer = Indexer::new(&primary);
    let op = Operation::new();

    primary.start_transaction();
    secondary.start_transaction();
    primary.add_operation(&op).unwrap();
    secondary.add_operation(&op).unwrap();
    indexer.index(&op, Some("k"));

    secondary.rollback_transaction().unwrap();
    assert!(indexer.contains("k", &op));

    primary.commit_transaction().unwrap();
    assert!(!indexer.contains("k", &op));
}

#[test]
fn operation_buffered_elsewhere_is_not_indexed() {
    let mut primary = Connection::with_id("primary");
    let other = Connection::with_id("other");
    let indexer = Indexer::new(&other);

    primary.start_transaction();
    let op = primary.add_metadata("value", "v1").unwrap();

    assert!(!indexer.index(&op, Some("k")));
    assert!(indexer.is_empty());
}
