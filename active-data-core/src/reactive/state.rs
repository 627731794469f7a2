//! Updatable State
//!
//! [`StateCore`] is the bookkeeping shared by every memoized computation:
//! updatables, reactions and computed properties. The typed handles own the
//! cached value and the computation; the core owns the flags, the set of
//! dependents and the read registrations.
//!
//! # Call Protocol
//!
//! 1. Deactivated: run the computation directly, uncached.
//! 2. Already computing: the graph is cyclic. Warn and return no value.
//! 3. Record the caller on top of the call stack as a dependent.
//! 4. Valid: return the cached value.
//! 5. Otherwise drop every read registration, push onto the call stack,
//!    compute, pop, and cache. The state only becomes valid if nothing it
//!    read was written during its own execution.
//!
//! # Invalidation
//!
//! Invalidating a state always fires its `on_invalidate` hook, but only
//! cascades to its dependents when it was valid. An invalid state has no
//! cached result anyone could be relying on.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use crate::graph::{DependencyIndex, Registration, StateId};
use crate::runtime::{bump, ManagerInner};
use crate::value::{DataSourceId, Key};

/// Internal hook receiving the id of the state it is attached to.
pub(crate) type StateHook = Box<dyn Fn(StateId)>;

#[derive(Default)]
pub(crate) struct StateHooks {
    pub on_invalidate: Option<StateHook>,
    pub on_uninit: Option<StateHook>,
}

pub(crate) struct StateCore {
    id: StateId,
    manager: Weak<ManagerInner>,

    active: Cell<bool>,
    valid: Cell<bool>,
    computing: Cell<bool>,
    invalid_iteration: Cell<bool>,

    /// States that called this one while it was on the call stack.
    deps: RefCell<IndexSet<StateId>>,

    /// Every bucket this state sits in, grouped by data source.
    uninit_map: RefCell<IndexMap<DataSourceId, Registration>>,

    hooks: StateHooks,
}

impl StateCore {
    /// Allocate a state and enter it into the manager's registry.
    pub fn new(manager: &Rc<ManagerInner>, hooks: StateHooks) -> Rc<Self> {
        let state = Rc::new(Self {
            id: manager.next_state_id(),
            manager: Rc::downgrade(manager),
            active: Cell::new(true),
            valid: Cell::new(false),
            computing: Cell::new(false),
            invalid_iteration: Cell::new(false),
            deps: RefCell::new(IndexSet::new()),
            uninit_map: RefCell::new(IndexMap::new()),
            hooks,
        });
        manager.register_state(&state);
        state
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub fn dependent_count(&self) -> usize {
        self.deps.borrow().len()
    }

    /// Run the call protocol against `cache`.
    ///
    /// Returns `None` only when the call is re-entrant.
    pub fn call_with<T: Clone>(&self, cache: &RefCell<Option<T>>, compute: impl FnOnce() -> T) -> Option<T> {
        let manager = match self.manager.upgrade() {
            Some(manager) if self.active.get() => manager,
            _ => return Some(compute()),
        };

        if self.computing.get() {
            tracing::warn!(state = %self.id, "cyclic computation detected; returning no value");
            bump(&manager.counters.cyclic_computations);
            return None;
        }

        if let Some(caller) = manager.call_stack.current() {
            self.deps.borrow_mut().insert(caller);
        }

        if self.valid.get() {
            if let Some(value) = cache.borrow().as_ref() {
                return Some(value.clone());
            }
        }

        self.computing.set(true);
        let _computing = ResetOnDrop(&self.computing);

        self.release();
        let _frame = manager.call_stack.enter(self.id);
        self.invalid_iteration.set(false);

        let value = compute();

        self.valid.set(!self.invalid_iteration.get());
        *cache.borrow_mut() = Some(value.clone());
        Some(value)
    }

    /// Record that this state read `key` of the data source behind `index`.
    pub fn register_read(&self, source: DataSourceId, index: &Rc<RefCell<DependencyIndex>>, key: &Key) {
        if !index.borrow_mut().register(key, self.id) {
            return;
        }
        tracing::trace!(state = %self.id, %key, "registered read");

        let mut uninit_map = self.uninit_map.borrow_mut();
        let registration = uninit_map
            .entry(source)
            .or_insert_with(|| Registration::new(index));
        if !registration.targets(index) {
            *registration = Registration::new(index);
        }
        registration.record(key.clone());
    }

    /// Something this state depends on changed.
    pub fn invalidate(&self) {
        if !self.active.get() {
            return;
        }
        self.invalid_iteration.set(true);

        if let Some(hook) = &self.hooks.on_invalidate {
            hook(self.id);
        }

        if self.valid.replace(false) {
            let dependents: Vec<StateId> = self.deps.borrow_mut().drain(..).collect();
            tracing::trace!(state = %self.id, dependents = dependents.len(), "invalidated");

            if let Some(manager) = self.manager.upgrade() {
                for id in dependents {
                    if let Some(dependent) = manager.state(id) {
                        dependent.invalidate();
                    }
                }
            }
        }
        self.deps.borrow_mut().clear();
    }

    /// Clear the valid flag without notifying anyone.
    pub fn mark_invalid(&self) {
        self.valid.set(false);
    }

    /// Remove this state from every bucket it is registered in.
    pub fn release(&self) {
        let registrations = std::mem::take(&mut *self.uninit_map.borrow_mut());
        for (_, registration) in registrations {
            registration.release(self.id);
        }
    }

    /// Permanently deactivate. Safe to call more than once; the hook fires once.
    pub fn uninit(&self) {
        self.release();
        if !self.active.replace(false) {
            return;
        }
        self.valid.set(false);
        self.deps.borrow_mut().clear();
        tracing::trace!(state = %self.id, "deactivated");

        if let Some(hook) = &self.hooks.on_uninit {
            hook(self.id);
        }
    }
}

impl Drop for StateCore {
    fn drop(&mut self) {
        self.release();
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_state(self.id);
        }
    }
}

impl fmt::Debug for StateCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCore")
            .field("id", &self.id)
            .field("active", &self.active.get())
            .field("valid", &self.valid.get())
            .field("dependents", &self.deps.borrow().len())
            .finish()
    }
}

struct ResetOnDrop<'a>(&'a Cell<bool>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Manager;

    #[test]
    fn caches_until_invalidated() {
        let manager = Manager::new();
        let state = StateCore::new(manager.inner(), StateHooks::default());
        let cache = RefCell::new(None);
        let runs = Cell::new(0);

        let compute = || {
            runs.set(runs.get() + 1);
            runs.get()
        };
        assert_eq!(state.call_with(&cache, compute), Some(1));
        assert_eq!(state.call_with(&cache, compute), Some(1));

        state.invalidate();
        assert!(!state.is_valid());
        assert_eq!(state.call_with(&cache, compute), Some(2));
    }

    #[test]
    fn reentrant_call_yields_none() {
        let manager = Manager::new();
        let state = StateCore::new(manager.inner(), StateHooks::default());
        let cache: RefCell<Option<Option<i32>>> = RefCell::new(None);

        let outer = state.call_with(&cache, || state.call_with(&cache, || Some(1)).flatten());
        assert_eq!(outer, Some(None));
        assert_eq!(manager.diagnostics().cyclic_computations, 1);
    }

    #[test]
    fn caller_becomes_dependent_and_cascade_reaches_it() {
        let manager = Manager::new();
        let inner = StateCore::new(manager.inner(), StateHooks::default());
        let outer = StateCore::new(manager.inner(), StateHooks::default());
        let inner_cache = RefCell::new(None);
        let outer_cache = RefCell::new(None);

        outer.call_with(&outer_cache, || inner.call_with(&inner_cache, || 1));
        assert_eq!(inner.dependent_count(), 1);
        assert!(outer.is_valid());

        inner.invalidate();
        assert!(!outer.is_valid());
        assert_eq!(inner.dependent_count(), 0);
    }

    #[test]
    fn invalidate_hook_fires_even_when_already_invalid() {
        let manager = Manager::new();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let state = StateCore::new(
            manager.inner(),
            StateHooks {
                on_invalidate: Some(Box::new(move |_| counter.set(counter.get() + 1))),
                on_uninit: None,
            },
        );

        state.invalidate();
        state.invalidate();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn uninit_is_idempotent() {
        let manager = Manager::new();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let state = StateCore::new(
            manager.inner(),
            StateHooks {
                on_invalidate: None,
                on_uninit: Some(Box::new(move |_| counter.set(counter.get() + 1))),
            },
        );

        state.uninit();
        state.uninit();
        assert_eq!(fired.get(), 1);
        assert!(!state.is_active());

        // deactivated states compute directly
        let cache = RefCell::new(None);
        assert_eq!(state.call_with(&cache, || 5), Some(5));
        assert!(cache.borrow().is_none());
    }

    #[test]
    fn dropped_state_leaves_registry() {
        let manager = Manager::new();
        let state = StateCore::new(manager.inner(), StateHooks::default());
        let id = state.id();
        assert!(manager.inner().state(id).is_some());

        drop(state);
        assert!(manager.inner().state(id).is_none());
    }
}
