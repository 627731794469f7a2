//! Reaction Implementation
//!
//! A Reaction is a side-effecting computation that re-runs whenever something
//! it read changes.
//!
//! # How Reactions Work
//!
//! 1. On registration the reaction runs (or is queued) to establish its
//!    initial dependencies.
//!
//! 2. When a dependency changes, invalidation adds the reaction to the
//!    manager's pending set instead of running it.
//!
//! 3. The scheduler drains the pending set, either right after the write
//!    that caused it or on a deferred pass.
//!
//! 4. Each run drops the previous read registrations and records new ones.
//!
//! A reaction stays registered with its manager until [`Reaction::uninit`] is
//! called, even if every handle to it is dropped.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::state::{StateCore, StateHooks};
use crate::error::BoxError;
use crate::graph::StateId;
use crate::runtime::ManagerInner;

type Body = Box<dyn Fn() -> Result<(), BoxError>>;

pub(crate) struct ReactionInner {
    state: Rc<StateCore>,
    cache: RefCell<Option<()>>,
    body: Body,
}

impl ReactionInner {
    pub fn id(&self) -> StateId {
        self.state.id()
    }

    /// Run the body through the call protocol. Nothing runs while the
    /// reaction is still valid.
    pub fn execute(&self) -> Result<(), BoxError> {
        let mut outcome = Ok(());
        self.state.call_with(&self.cache, || {
            if let Err(err) = (self.body)() {
                outcome = Err(err);
            }
        });
        outcome
    }
}

/// Handle to a registered reaction.
#[derive(Clone)]
pub struct Reaction {
    manager: Weak<ManagerInner>,
    inner: Rc<ReactionInner>,
}

impl Reaction {
    /// Create a reaction and enter it into `manager`'s registry. It is not run.
    pub(crate) fn new<F>(manager: &Rc<ManagerInner>, body: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + 'static,
    {
        let hooks = StateHooks {
            on_invalidate: Some(Box::new({
                let manager = Rc::downgrade(manager);
                move |id| {
                    if let Some(manager) = manager.upgrade() {
                        manager.enqueue(id);
                    }
                }
            })),
            on_uninit: Some(Box::new({
                let manager = Rc::downgrade(manager);
                move |id| {
                    if let Some(manager) = manager.upgrade() {
                        manager.dequeue(id);
                        drop(manager.unregister_reaction(id));
                    }
                }
            })),
        };

        let inner = Rc::new(ReactionInner {
            state: StateCore::new(manager, hooks),
            cache: RefCell::new(None),
            body: Box::new(body),
        });
        manager.register_reaction(Rc::clone(&inner));
        tracing::trace!(reaction = %inner.id(), "reaction registered");

        Self {
            manager: Rc::downgrade(manager),
            inner,
        }
    }

    pub(crate) fn inner(&self) -> &Rc<ReactionInner> {
        &self.inner
    }

    /// Run now if invalid. Errors from the body are returned, not logged.
    pub fn call(&self) -> Result<(), BoxError> {
        self.inner.execute()
    }

    /// Mark the reaction as needing a run without queueing it.
    pub fn invalidate(&self) {
        self.inner.state.mark_invalid();
    }

    /// Force a run on the next drain and request one.
    pub fn schedule(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if !self.inner.state.is_active() {
            return;
        }
        self.inner.state.mark_invalid();
        manager.enqueue(self.id());
        manager.request_flush();
    }

    /// Stop reacting. The reaction leaves the pending set and the registry.
    pub fn uninit(&self) {
        self.inner.state.uninit();
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.is_active()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.state.is_valid()
    }

    /// Whether the reaction is waiting for the next drain.
    pub fn is_pending(&self) -> bool {
        self.manager
            .upgrade()
            .map_or(false, |manager| manager.is_pending(self.id()))
    }

    pub fn id(&self) -> StateId {
        self.inner.id()
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{Manager, OptionsPatch};

    #[test]
    fn invalidation_queues_instead_of_running() {
        let manager = Manager::new();
        let runs = Rc::new(Cell::new(0));
        let reaction = manager.reaction_with(
            {
                let runs = runs.clone();
                move || runs.set(runs.get() + 1)
            },
            false,
        );

        assert_eq!(runs.get(), 0);
        assert!(!reaction.is_pending());

        reaction.schedule();
        assert!(reaction.is_pending());
        assert_eq!(runs.get(), 0);

        manager.run().unwrap();
        assert_eq!(runs.get(), 1);
        assert!(!reaction.is_pending());
    }

    #[test]
    fn call_runs_only_when_invalid() {
        let manager = Manager::with_options(OptionsPatch::new().enabled(false));
        let runs = Rc::new(Cell::new(0));
        let reaction = manager.reaction_with(
            {
                let runs = runs.clone();
                move || runs.set(runs.get() + 1)
            },
            false,
        );

        reaction.call().unwrap();
        reaction.call().unwrap();
        assert_eq!(runs.get(), 1);

        reaction.invalidate();
        reaction.call().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn uninit_leaves_pending_set() {
        let manager = Manager::with_options(OptionsPatch::new().enabled(false));
        let reaction = manager.reaction(|| {});
        reaction.schedule();
        assert_eq!(manager.pending_count(), 1);

        reaction.uninit();
        assert!(!reaction.is_active());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn body_errors_are_returned_from_call() {
        let manager = Manager::with_options(OptionsPatch::new().enabled(false));
        let reaction = manager.try_reaction(|| Err("boom".into()), false);

        let err = reaction.call().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
