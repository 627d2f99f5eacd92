//! Property tests: serialization fidelity and net-diff collapse.

use cellstore::{Cell, Store};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

fn id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "a".to_string(),
        "b".to_string(),
        "c".to_string(),
        "d".to_string(),
    ])
}

fn cell_strategy() -> impl Strategy<Value = Cell> {
    prop_oneof![
        any::<bool>().prop_map(Cell::from),
        (-1000i32..1000).prop_map(Cell::from),
        "[a-z]{0,6}".prop_map(Cell::from),
    ]
}

fn cell_write_strategy() -> impl Strategy<Value = (String, String, String, Cell)> {
    (id_strategy(), id_strategy(), id_strategy(), cell_strategy())
}

fn populate(store: &Store, cells: &[(String, String, String, Cell)], values: &[(String, Cell)]) {
    store.transaction(|store| {
        for (t, r, c, cell) in cells {
            store.set_cell(t, r, c, cell.clone());
        }
        for (v, value) in values {
            store.set_value(v, value.clone());
        }
    });
}

proptest! {
    #[test]
    fn test_json_round_trip_is_lossless(
        cells in prop::collection::vec(cell_write_strategy(), 0..20),
        values in prop::collection::vec((id_strategy(), cell_strategy()), 0..8),
    ) {
        let store = Store::new();
        populate(&store, &cells, &values);

        let restored = Store::new();
        restored.set_json(&store.get_json()).unwrap();
        prop_assert_eq!(restored.get_tables(), store.get_tables());
        prop_assert_eq!(restored.get_values(), store.get_values());
        prop_assert_eq!(restored.get_json(), store.get_json());
    }

    #[test]
    fn test_reverted_transaction_is_silent(
        initial_cells in prop::collection::vec(cell_write_strategy(), 0..10),
        initial_values in prop::collection::vec((id_strategy(), cell_strategy()), 0..4),
        churn in prop::collection::vec(cell_write_strategy(), 0..20),
    ) {
        let store = Store::new();
        populate(&store, &initial_cells, &initial_values);
        let snapshot = store.get_json();

        let notified = Rc::new(RefCell::new(0u32));
        let sink = notified.clone();
        store.add_cell_listener(None, None, None, false, move |_, _, _, _, _, _| {
            *sink.borrow_mut() += 1;
        });
        let sink = notified.clone();
        store.add_tables_listener(false, move |_| {
            *sink.borrow_mut() += 1;
        });
        let sink = notified.clone();
        store.add_values_listener(false, move |_| {
            *sink.borrow_mut() += 1;
        });

        store.transaction(|store| {
            for (t, r, c, cell) in &churn {
                store.set_cell(t, r, c, cell.clone());
            }
            store.del_tables();
            store.del_values();
            store.set_json(&snapshot).unwrap();
        });

        prop_assert_eq!(store.get_json(), snapshot);
        prop_assert_eq!(*notified.borrow(), 0);
    }

    #[test]
    fn test_last_write_wins_within_transaction(
        writes in prop::collection::vec(cell_strategy(), 1..10),
    ) {
        let store = Store::new();
        store.transaction(|store| {
            for cell in &writes {
                store.set_cell("t", "r", "c", cell.clone());
            }
        });
        prop_assert_eq!(store.get_cell("t", "r", "c"), writes.last().cloned());
    }
}
