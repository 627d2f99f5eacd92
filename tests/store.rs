//! Store surface: getters, containment, row helpers, JSON.

use cellstore::{Cell, Row, Store, Values};

fn row(cells: &[(&str, Cell)]) -> Row {
    cells
        .iter()
        .map(|(c, cell)| (c.to_string(), cell.clone()))
        .collect()
}

#[test]
fn test_empty_store() {
    let store = Store::new();
    assert!(!store.has_tables());
    assert!(!store.has_values());
    assert!(store.get_table_ids().is_empty());
    assert_eq!(store.get_table("t1"), None);
    assert_eq!(store.get_row("t1", "r1"), None);
    assert_eq!(store.get_cell("t1", "r1", "c1"), None);
    assert_eq!(store.get_json(), "[{},{}]");
}

#[test]
fn test_id_getters_are_sorted() {
    let store = Store::new();
    store.set_cell("zebra", "r1", "c1", 1);
    store.set_cell("apple", "r1", "c1", 1);
    store.set_cell("apple", "r1", "b", 2);
    store.set_value("z", 1);
    store.set_value("a", 2);

    assert_eq!(store.get_table_ids(), vec!["apple", "zebra"]);
    assert_eq!(store.get_cell_ids("apple", "r1"), vec!["b", "c1"]);
    assert_eq!(store.get_value_ids(), vec!["a", "z"]);
}

#[test]
fn test_partial_row_merges() {
    let store = Store::new();
    store.set_row(
        "t1",
        "r1",
        row(&[("c1", Cell::from(1)), ("c2", Cell::from(2))]),
    );

    store.set_partial_row("t1", "r1", row(&[("c2", Cell::from(9))]));
    assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    assert_eq!(store.get_cell("t1", "r1", "c2"), Some(Cell::from(9)));

    // A full row write deletes unmentioned cells.
    store.set_row("t1", "r1", row(&[("c2", Cell::from(3))]));
    assert!(!store.has_cell("t1", "r1", "c1"));
}

#[test]
fn test_partial_values_merge() {
    let store = Store::new();
    store.set_value("a", 1).set_value("b", 2);

    let mut update = Values::new();
    update.insert("b".to_string(), Cell::from(9));
    store.set_partial_values(update.clone());
    assert_eq!(store.get_value("a"), Some(Cell::from(1)));
    assert_eq!(store.get_value("b"), Some(Cell::from(9)));

    // A full values write deletes unmentioned ids.
    store.set_values(update);
    assert!(!store.has_value("a"));
}

#[test]
fn test_value_map_update() {
    let store = Store::new();
    store.set_value("count", 10);
    store.set_value_map("count", |old| {
        Cell::from(old.and_then(Cell::as_number).unwrap_or(0.0) + 1.0)
    });
    assert_eq!(store.get_value("count"), Some(Cell::from(11)));
}

#[test]
fn test_del_tables_and_del_values() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);
    store.set_cell("t2", "r1", "c1", 2);
    store.set_value("v1", 3);

    store.del_tables();
    assert!(!store.has_tables());
    assert!(store.has_value("v1"));

    store.del_values();
    assert!(!store.has_values());
}

#[test]
fn test_for_each_visits_in_order() {
    let store = Store::new();
    store.set_cell("t1", "r1", "b", 1);
    store.set_cell("t1", "r1", "a", 2);
    store.set_cell("t2", "r1", "c", 3);

    let mut visited = Vec::new();
    store.for_each_table(|t, _| visited.push(t.to_string()));
    assert_eq!(visited, vec!["t1", "t2"]);

    let mut cells = Vec::new();
    store.for_each_cell("t1", "r1", |c, cell| {
        cells.push((c.to_string(), cell.clone()));
    });
    assert_eq!(
        cells,
        vec![("a".into(), Cell::from(2)), ("b".into(), Cell::from(1))]
    );
}

#[test]
fn test_scalar_kinds_survive_json() {
    let store = Store::new();
    store.set_cell("t1", "r1", "b", true);
    store.set_cell("t1", "r1", "n", 1.5);
    store.set_cell("t1", "r1", "s", "x");

    let other = Store::new();
    other.set_json(&store.get_json()).unwrap();
    assert_eq!(other.get_cell("t1", "r1", "b"), Some(Cell::Bool(true)));
    assert_eq!(other.get_cell("t1", "r1", "n"), Some(Cell::Number(1.5)));
    assert_eq!(
        other.get_cell("t1", "r1", "s"),
        Some(Cell::String("x".into()))
    );
}

#[test]
fn test_set_json_with_empty_containers_clears() {
    let store = Store::new();
    store.set_cell("t1", "r1", "c1", 1);
    store.set_value("v1", 2);

    store.set_json("[{},{}]").unwrap();
    assert!(!store.has_tables());
    assert!(!store.has_values());
}

#[test]
fn test_add_row_ids_are_decimal_strings() {
    let store = Store::new();
    let first = store.add_row("t1", row(&[("c1", Cell::from(1))]));
    let second = store.add_row("t1", row(&[("c1", Cell::from(2))]));
    assert_eq!(first.as_deref(), Some("0"));
    assert_eq!(second.as_deref(), Some("1"));

    // Non-numeric row ids never collide with generated ones.
    store.set_row("t1", "abc", row(&[("c1", Cell::from(3))]));
    assert_eq!(
        store.add_row("t1", row(&[("c1", Cell::from(4))])).as_deref(),
        Some("2")
    );
}

#[test]
fn test_store_handles_share_state() {
    let store = Store::new();
    let alias = store.clone();
    store.set_cell("t1", "r1", "c1", 1);
    assert_eq!(alias.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    assert_eq!(alias.store_id(), store.store_id());
}
