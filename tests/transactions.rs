//! Transaction semantics: nesting, rollback, implicit wrapping.

use cellstore::{Cell, CellKind, CellSchema, Store, TablesSchema};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

fn notification_count(store: &Store) -> Rc<RefCell<usize>> {
    let count = Rc::new(RefCell::new(0));
    let sink = count.clone();
    store.add_cell_listener(None, None, None, false, move |_, _, _, _, _, _| {
        *sink.borrow_mut() += 1;
    });
    let sink = count.clone();
    store.add_value_listener(None, false, move |_, _, _, _| {
        *sink.borrow_mut() += 1;
    });
    count
}

#[test]
fn test_every_mutation_is_implicitly_transactional() {
    let store = Store::new();
    let count = notification_count(&store);

    store.set_cell("t1", "r1", "c1", 1);
    assert_eq!(*count.borrow(), 1);
    store.set_value("v1", true);
    assert_eq!(*count.borrow(), 2);
}

#[test]
fn test_nested_transactions_fold_into_outer() {
    let store = Store::new();
    let count = notification_count(&store);

    store.transaction(|store| {
        store.set_cell("t1", "r1", "c1", 1);
        store.transaction(|store| {
            store.set_cell("t1", "r1", "c2", 2);
            store.set_value("v1", 3);
        });
        // Inner transaction closed; nothing has been delivered yet.
        assert_eq!(*count.borrow(), 0);
    });
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn test_reads_inside_transaction_see_pending_writes() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);

    store.transaction(|store| {
        store.set_cell("t1", "r1", "c1", 2);
        assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(2)));
        store.del_cell("t1", "r1", "c1");
        assert!(!store.has_cell("t1", "r1", "c1"));
    });
}

#[test]
fn test_rollback_restores_snapshot_and_suppresses_notifications() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);
    store.set_value("v1", "before");
    let count = notification_count(&store);

    store.transaction_with_rollback(
        |store| {
            store.set_cell("t1", "r1", "c1", 99);
            store.set_cell("t2", "r1", "c1", 1);
            store.set_value("v1", "after");
            store.del_value("v1");
        },
        |changed_cells, _, changed_values, _| {
            assert_eq!(changed_cells.len(), 2);
            assert_eq!(
                changed_cells[&("t1".into(), "r1".into(), "c1".into())],
                (Some(Cell::from(1)), Some(Cell::from(99)))
            );
            assert_eq!(
                changed_values["v1"],
                (Some(Cell::from("before")), None)
            );
            true
        },
    );

    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    assert!(!store.has_table("t2"));
    assert_eq!(store.get_value("v1"), Some(Cell::from("before")));
    assert_eq!(*count.borrow(), 0);
}

#[test]
fn test_rollback_declined_keeps_changes() {
    let store = Store::new();
    let count = notification_count(&store);

    store.transaction_with_rollback(
        |store| {
            store.set_cell("t1", "r1", "c1", 1);
        },
        |_, _, _, _| false,
    );
    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_rollback_sees_invalid_writes() {
    let store = Store::new();
    let mut cells = BTreeMap::new();
    cells.insert("c1".to_string(), CellSchema::new(CellKind::Number));
    let mut schema = TablesSchema::new();
    schema.insert("t1".to_string(), cells);
    store.set_tables_schema(schema);

    let consulted = Rc::new(RefCell::new(false));
    let seen = consulted.clone();
    store.transaction_with_rollback(
        |store| {
            store.set_cell("t1", "r1", "c1", "wrong");
        },
        move |changed_cells, invalid_cells, _, _| {
            *seen.borrow_mut() = true;
            assert!(changed_cells.is_empty());
            let raws = &invalid_cells[&("t1".into(), "r1".into(), "c1".into())];
            assert_eq!(raws, &vec![Cell::from("wrong")]);
            false
        },
    );
    assert!(*consulted.borrow());
}

#[test]
fn test_rollback_of_net_zero_transaction() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);

    store.transaction_with_rollback(
        |store| {
            store.set_cell("t1", "r1", "c1", 2);
            store.set_cell("t1", "r1", "c1", 1);
        },
        |changed_cells, _, _, _| {
            // Writes that cancel out never surface in the diff.
            assert!(changed_cells.is_empty());
            true
        },
    );
    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
}

#[test]
fn test_rollback_reverts_schema_changes_too() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);

    store.transaction_with_rollback(
        |store| {
            let mut cells = BTreeMap::new();
            cells.insert("c1".to_string(), CellSchema::new(CellKind::Bool));
            let mut schema = TablesSchema::new();
            schema.insert("t1".to_string(), cells);
            store.set_tables_schema(schema);
        },
        |_, _, _, _| true,
    );

    // The number survived because the bool schema was rolled back with
    // everything else.
    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    store.set_cell("t1", "r1", "c1", 2);
    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(2)));
}
