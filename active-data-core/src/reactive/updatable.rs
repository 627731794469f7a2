//! Updatable Implementation
//!
//! An [`Updatable`] is a memoized derived value. It runs its computation on
//! first call, caches the result, and recomputes only after something it read
//! has changed.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = Manager::new();
//! let point = manager.observe(&DataSource::object().with("x", 2));
//!
//! let doubled = manager.updatable({
//!     let point = point.clone();
//!     move || point.get("x").as_f64().unwrap_or(0.0) * 2.0
//! });
//!
//! assert_eq!(doubled.call(), Some(4.0));
//! point.set("x", 5);
//! assert_eq!(doubled.call(), Some(10.0));
//! ```
//!
//! Updatables are lazy: invalidation only clears the cached value. Use a
//! [`Reaction`](crate::Reaction) for work that must happen eagerly.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::state::{StateCore, StateHooks};
use crate::graph::StateId;
use crate::runtime::ManagerInner;

/// User hooks attached to an updatable.
#[derive(Default)]
pub struct UpdatableSettings {
    on_invalidate: Option<Box<dyn Fn()>>,
    on_uninit: Option<Box<dyn Fn()>>,
}

impl UpdatableSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called every time the updatable is invalidated, valid or not.
    pub fn on_invalidate<F>(mut self, hook: F) -> Self
    where
        F: Fn() + 'static,
    {
        self.on_invalidate = Some(Box::new(hook));
        self
    }

    /// Called once, when the updatable is deactivated.
    pub fn on_uninit<F>(mut self, hook: F) -> Self
    where
        F: Fn() + 'static,
    {
        self.on_uninit = Some(Box::new(hook));
        self
    }

    fn into_hooks(self) -> StateHooks {
        StateHooks {
            on_invalidate: self
                .on_invalidate
                .map(|hook| Box::new(move |_: StateId| hook()) as Box<dyn Fn(StateId)>),
            on_uninit: self
                .on_uninit
                .map(|hook| Box::new(move |_: StateId| hook()) as Box<dyn Fn(StateId)>),
        }
    }
}

struct UpdatableInner<T> {
    state: Rc<StateCore>,
    cache: RefCell<Option<T>>,
    compute: Box<dyn Fn() -> T>,
}

/// A memoized computation.
///
/// Cloning yields another handle to the same computation. The state is
/// dropped from the manager when the last handle goes away.
pub struct Updatable<T: Clone + 'static> {
    inner: Rc<UpdatableInner<T>>,
}

impl<T: Clone + 'static> Updatable<T> {
    pub(crate) fn new<F>(manager: &Rc<ManagerInner>, compute: F, settings: UpdatableSettings) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self {
            inner: Rc::new(UpdatableInner {
                state: StateCore::new(manager, settings.into_hooks()),
                cache: RefCell::new(None),
                compute: Box::new(compute),
            }),
        }
    }

    /// Get the value, recomputing if necessary.
    ///
    /// Returns `None` if this updatable is already computing further up the
    /// call stack.
    pub fn call(&self) -> Option<T> {
        let inner = &self.inner;
        inner.state.call_with(&inner.cache, || (inner.compute)())
    }

    /// Drop the cached value on the next call. Dependents are not notified.
    pub fn invalidate(&self) {
        self.inner.state.mark_invalid();
    }

    /// Stop tracking. Later calls run the computation directly.
    pub fn uninit(&self) {
        self.inner.state.uninit();
        self.inner.cache.borrow_mut().take();
    }

    pub fn is_valid(&self) -> bool {
        self.inner.state.is_valid()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.is_active()
    }

    /// Whether a cached value is held.
    pub fn has_value(&self) -> bool {
        self.inner.cache.borrow().is_some()
    }

    /// Number of states that will be invalidated along with this one.
    pub fn dependent_count(&self) -> usize {
        self.inner.state.dependent_count()
    }

    pub fn id(&self) -> StateId {
        self.inner.state.id()
    }
}

impl<T: Clone + 'static> Clone for Updatable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Updatable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updatable")
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{DataSource, Manager};

    #[test]
    fn recomputes_after_observed_write() {
        let manager = Manager::new();
        let point = manager.observe(&DataSource::object().with("x", 2));
        let runs = Rc::new(Cell::new(0));

        let doubled = manager.updatable({
            let point = point.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                point.get("x").as_f64().unwrap_or(0.0) * 2.0
            }
        });

        assert_eq!(doubled.call(), Some(4.0));
        assert_eq!(doubled.call(), Some(4.0));
        assert_eq!(runs.get(), 1);

        point.set("x", 5);
        assert!(!doubled.is_valid());
        assert_eq!(doubled.call(), Some(10.0));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn invalidate_only_clears_valid_flag() {
        let manager = Manager::new();
        let fired = Rc::new(Cell::new(false));
        let hook = fired.clone();
        let value = manager.updatable_with(|| 1, UpdatableSettings::new().on_invalidate(move || hook.set(true)));

        value.call();
        value.invalidate();
        assert!(!value.is_valid());
        assert!(!fired.get());
        assert_eq!(value.call(), Some(1));
    }

    #[test]
    fn uninit_runs_hook_and_stops_caching() {
        let manager = Manager::new();
        let runs = Rc::new(Cell::new(0));
        let uninits = Rc::new(Cell::new(0));

        let value = manager.updatable_with(
            {
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    runs.get()
                }
            },
            UpdatableSettings::new().on_uninit({
                let uninits = uninits.clone();
                move || uninits.set(uninits.get() + 1)
            }),
        );

        value.call();
        value.uninit();
        value.uninit();
        assert_eq!(uninits.get(), 1);
        assert!(!value.is_active());
        assert!(!value.has_value());

        assert_eq!(value.call(), Some(2));
        assert_eq!(value.call(), Some(3));
    }
}
