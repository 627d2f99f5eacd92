//! Persisters: save and load a store's content to an external medium.
//!
//! A persister is built from a store handle plus a [`PersisterMedium`]
//! supplying the three primitive operations: fetch persisted content, write
//! persisted content, and (optionally) notify when the medium changes
//! underneath us. On top of those it offers one-shot load/save plus
//! auto-load and auto-save lifecycles with the invariant that a load in
//! flight suppresses the save it would trigger, and vice versa.

mod file;

pub use file::FileMedium;

use crate::error::{Result, StoreError};
use crate::listeners::ListenerId;
use crate::store::Store;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// The three primitives a persistence medium must supply.
pub trait PersisterMedium {
    /// Fetch the saved content, if any. Content is the store's
    /// `[Tables, Values]` JSON.
    fn get_persisted(&mut self) -> Result<Option<String>>;

    /// Write the store's content to the medium. A medium with change
    /// detection may report its own write synchronously through the
    /// installed callback; the persister suppresses the echo.
    fn set_persisted(&mut self, content: &str) -> Result<()>;

    /// Whether this medium can report external changes.
    fn supports_change_events(&self) -> bool {
        false
    }

    /// Install (or clear, with `None`) the external-change callback. Media
    /// without change detection may ignore this.
    fn set_on_change(&mut self, _on_change: Option<Box<dyn FnMut()>>) {}
}

/// Operation counters, exposed via [`Persister::stats`]. Failures bump
/// `errors` and never stop the auto lifecycles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersisterStats {
    pub loads: u64,
    pub saves: u64,
    pub errors: u64,
}

/// Flags are `Cell`s and the medium sits in its own `RefCell`: a change
/// event fired from inside `set_persisted` must be able to consult
/// `in_flight` while the medium itself is still borrowed.
struct PersisterState<M: PersisterMedium> {
    store: Store,
    medium: RefCell<M>,
    stats: RefCell<PersisterStats>,
    auto_save_listeners: RefCell<Vec<ListenerId>>,
    auto_loading: Cell<bool>,
    /// Set while a load applies to the store, so the auto-save listener
    /// skips the echo; and while a save runs, so a change event does not
    /// trigger a concurrent load.
    in_flight: Cell<bool>,
    on_error: RefCell<Option<Box<dyn Fn(&StoreError)>>>,
    queue: RefCell<Vec<Box<dyn FnOnce(&Persister<M>)>>>,
    draining: Cell<bool>,
}

/// A persistence adapter for one store. Cheap to clone.
pub struct Persister<M: PersisterMedium> {
    state: Rc<PersisterState<M>>,
}

impl<M: PersisterMedium> Clone for Persister<M> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<M: PersisterMedium + 'static> Persister<M> {
    pub fn new(store: Store, medium: M) -> Self {
        Self {
            state: Rc::new(PersisterState {
                store,
                medium: RefCell::new(medium),
                stats: RefCell::new(PersisterStats::default()),
                auto_save_listeners: RefCell::new(Vec::new()),
                auto_loading: Cell::new(false),
                in_flight: Cell::new(false),
                on_error: RefCell::new(None),
                queue: RefCell::new(Vec::new()),
                draining: Cell::new(false),
            }),
        }
    }

    /// Install a diagnostic callback for persistence failures.
    pub fn set_on_error(&self, f: impl Fn(&StoreError) + 'static) -> &Self {
        *self.state.on_error.borrow_mut() = Some(Box::new(f));
        self
    }

    /// Fetch persisted content and replace the store's content with it.
    /// Missing content leaves the store as is.
    pub fn load(&self) -> &Self {
        if self.state.in_flight.replace(true) {
            return self;
        }
        let fetched = self.state.medium.borrow_mut().get_persisted();
        let result = match fetched {
            Ok(Some(content)) => self.state.store.set_json(&content),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.state.in_flight.set(false);
        match result {
            Ok(()) => {
                self.state.stats.borrow_mut().loads += 1;
                debug!("persister loaded");
            }
            Err(e) => self.report(e, "load"),
        }
        self
    }

    /// Write the store's content to the medium.
    pub fn save(&self) -> &Self {
        if self.state.in_flight.replace(true) {
            return self;
        }
        let content = self.state.store.get_json();
        let result = self.state.medium.borrow_mut().set_persisted(&content);
        self.state.in_flight.set(false);
        match result {
            Ok(()) => {
                self.state.stats.borrow_mut().saves += 1;
                debug!("persister saved");
            }
            Err(e) => self.report(e, "save"),
        }
        self
    }

    fn report(&self, e: StoreError, operation: &str) {
        self.state.stats.borrow_mut().errors += 1;
        warn!(error = %e, operation, "persistence failed");
        if let Some(on_error) = self.state.on_error.borrow().as_ref() {
            on_error(&e);
        }
    }

    /// Load once, then reload whenever the medium reports an external
    /// change. A no-op on media without change events beyond the initial
    /// load.
    pub fn start_auto_load(&self) -> &Self {
        self.load();
        if self.state.auto_loading.replace(true) {
            return self;
        }
        if self.state.medium.borrow().supports_change_events() {
            let weak = Rc::downgrade(&self.state);
            self.state
                .medium
                .borrow_mut()
                .set_on_change(Some(Box::new(move || on_medium_change(&weak))));
        }
        self
    }

    pub fn stop_auto_load(&self) -> &Self {
        if self.state.auto_loading.replace(false) {
            self.state.medium.borrow_mut().set_on_change(None);
        }
        self
    }

    /// Save now, then save again after every settled store change.
    pub fn start_auto_save(&self) -> &Self {
        if self.is_auto_saving() {
            return self;
        }
        self.save();
        let store = self.state.store.clone();
        let weak_tables = Rc::downgrade(&self.state);
        let weak_values = Rc::downgrade(&self.state);
        let tables_listener = store.add_tables_listener(false, move |_| {
            on_store_change(&weak_tables);
        });
        let values_listener = store.add_values_listener(false, move |_| {
            on_store_change(&weak_values);
        });
        *self.state.auto_save_listeners.borrow_mut() = vec![tables_listener, values_listener];
        self
    }

    pub fn stop_auto_save(&self) -> &Self {
        for id in self.state.auto_save_listeners.borrow_mut().drain(..) {
            self.state.store.del_listener(id);
        }
        self
    }

    pub fn is_auto_loading(&self) -> bool {
        self.state.auto_loading.get()
    }

    pub fn is_auto_saving(&self) -> bool {
        !self.state.auto_save_listeners.borrow().is_empty()
    }

    /// Queue an action against this persister. Actions run strictly in
    /// order; an action scheduled while another runs waits its turn.
    pub fn schedule(&self, action: impl FnOnce(&Persister<M>) + 'static) -> &Self {
        self.state.queue.borrow_mut().push(Box::new(action));
        if self.state.draining.replace(true) {
            return self;
        }
        loop {
            let next = {
                let mut queue = self.state.queue.borrow_mut();
                match queue.is_empty() {
                    true => {
                        self.state.draining.set(false);
                        break;
                    }
                    false => queue.remove(0),
                }
            };
            next(self);
        }
        self
    }

    pub fn stats(&self) -> PersisterStats {
        self.state.stats.borrow().clone()
    }

    /// The store this persister serves.
    pub fn store(&self) -> Store {
        self.state.store.clone()
    }

    /// Stop both auto lifecycles and detach from the store.
    pub fn destroy(&self) {
        self.stop_auto_load();
        self.stop_auto_save();
    }
}

fn on_medium_change<M: PersisterMedium + 'static>(weak: &Weak<PersisterState<M>>) {
    let Some(state) = weak.upgrade() else {
        return;
    };
    // in_flight set by save(): the medium is reporting the write we just
    // made, possibly while set_persisted is still on the stack.
    if state.in_flight.get() || !state.auto_loading.get() {
        return;
    }
    Persister { state }.load();
}

fn on_store_change<M: PersisterMedium + 'static>(weak: &Weak<PersisterState<M>>) {
    let Some(state) = weak.upgrade() else {
        return;
    };
    // in_flight set by load(): the change this listener is reacting to came
    // from the medium itself, so writing it back would be an echo.
    if state.in_flight.get() {
        return;
    }
    Persister { state }.save();
}
