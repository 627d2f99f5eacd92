//! Contract for derived structures built on top of a store.
//!
//! Aggregations, indexes, relationship graphs, checkpoint histories and
//! query layers all hold a store handle, register listeners to maintain
//! their own state incrementally, and otherwise observe the store
//! read-only. One instance exists per (component kind, store instance);
//! requesting a second returns the first.

use crate::listeners::ListenerStats;
use crate::store::Store;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A component derived purely from a store's public listener/mutation API.
pub trait DerivedComponent {
    /// The store this component observes.
    fn store(&self) -> &Store;

    /// Live listener counts for this component's own registrations.
    fn listener_stats(&self) -> ListenerStats;

    /// Remove every listener this component registered, returning the
    /// store's listener stats to their pre-registration values.
    fn destroy(&self);
}

thread_local! {
    /// Side table of live component singletons, keyed by component kind and
    /// store identity. Weak handles, so dropped components vacate their slot.
    static COMPONENTS: RefCell<HashMap<(TypeId, u64), Weak<dyn Any>>> =
        RefCell::new(HashMap::new());
}

/// Get or create the singleton instance of component `T` for `store`.
///
/// `create` runs only when no live instance exists for this (kind, store)
/// pair.
pub fn instance<T>(store: &Store, create: impl FnOnce(Store) -> T) -> Rc<T>
where
    T: DerivedComponent + 'static,
{
    let key = (TypeId::of::<T>(), store.store_id());
    COMPONENTS.with(|components| {
        let mut components = components.borrow_mut();
        if let Some(existing) = components
            .get(&key)
            .and_then(Weak::upgrade)
            .and_then(|any| any.downcast::<T>().ok())
        {
            return existing;
        }
        let created = Rc::new(create(store.clone()));
        let as_any: Rc<dyn Any> = created.clone();
        components.insert(key, Rc::downgrade(&as_any));
        created
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::ListenerId;
    use crate::types::Cell;
    use std::cell::Cell as StdCell;

    /// Minimal derived component: counts cell changes in one table.
    struct ChangeCounter {
        store: Store,
        listener: ListenerId,
        count: Rc<StdCell<u64>>,
    }

    impl ChangeCounter {
        fn new(store: Store) -> Self {
            let count = Rc::new(StdCell::new(0));
            let counter = count.clone();
            let listener = store.add_cell_listener(Some("t1"), None, None, false, {
                move |_: &Store, _: &str, _: &str, _: &str, _: Option<&Cell>, _: Option<&Cell>| {
                    counter.set(counter.get() + 1);
                }
            });
            Self {
                store,
                listener,
                count,
            }
        }
    }

    impl DerivedComponent for ChangeCounter {
        fn store(&self) -> &Store {
            &self.store
        }

        fn listener_stats(&self) -> ListenerStats {
            ListenerStats {
                cell: 1,
                ..Default::default()
            }
        }

        fn destroy(&self) {
            self.store.del_listener(self.listener);
        }
    }

    #[test]
    fn test_singleton_per_store() {
        let store = Store::new();
        let a = instance(&store, ChangeCounter::new);
        let b = instance(&store, ChangeCounter::new);
        assert!(Rc::ptr_eq(&a, &b));

        let other = Store::new();
        let c = instance(&other, ChangeCounter::new);
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_component_maintains_state_and_destroys_cleanly() {
        let store = Store::new();
        let baseline = store.listener_stats();

        let counter = instance(&store, ChangeCounter::new);
        store.set_cell("t1", "r1", "c1", 1);
        store.set_cell("t1", "r1", "c1", 2);
        store.set_cell("t2", "r1", "c1", 3);
        assert_eq!(counter.count.get(), 2);

        counter.destroy();
        assert_eq!(store.listener_stats(), baseline);

        store.set_cell("t1", "r1", "c1", 9);
        assert_eq!(counter.count.get(), 2);
    }

    #[test]
    fn test_dropped_component_vacates_slot() {
        let store = Store::new();
        let first = instance(&store, ChangeCounter::new);
        first.destroy();
        drop(first);

        let second = instance(&store, ChangeCounter::new);
        assert_eq!(second.count.get(), 0);
        second.destroy();
    }
}
