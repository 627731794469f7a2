//! Reaction Scheduler
//!
//! The scheduler drains the pending reaction set.
//!
//! # Algorithm
//!
//! A drain runs in passes:
//!
//! 1. Snapshot the pending set
//! 2. For each reaction in the snapshot, remove it from the pending set and
//!    run it. Reactions invalidated while the pass runs (including the one
//!    running) are queued for the next pass.
//! 3. Repeat until the pending set is empty
//!
//! A graph that keeps re-queueing itself is cut off after `max_iterations`
//! passes: the pending set is cleared and the drain fails with
//! [`EngineError::RunawayReactionGraph`].
//!
//! Each pass also has a time budget. Once `time_limit` milliseconds have
//! gone by, the drain stops after the current reaction and hands the rest to
//! a deferred drain, so a long cascade cannot block the host. The pass count
//! carries over into that drain and is reset only once the pending set is
//! empty, so a slow graph that never settles still hits `max_iterations`.
//!
//! A failing reaction (an `Err` from its body, or a panic) is logged and
//! counted but does not stop the pass.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use super::{bump, ManagerInner};
use crate::error::{EngineError, Result};
use crate::graph::StateId;
use crate::reactive::ReactionInner;

impl ManagerInner {
    pub(crate) fn run(self: &Rc<Self>) -> Result<()> {
        self.run_with(|| {})
    }

    pub(crate) fn run_with(self: &Rc<Self>, action: impl FnOnce()) -> Result<()> {
        let (enabled, max_iterations, time_limit, clock) = {
            let options = self.options.borrow();
            (
                options.enabled,
                options.max_iterations,
                options.time_limit,
                options.get_time.clone(),
            )
        };
        if !enabled {
            return Ok(());
        }

        let _section = self.enter_run_section();
        action();
        self.run_scheduled.set(false);

        while !self.pending.borrow().is_empty() {
            let iterations = self.iterations.get();
            if iterations >= max_iterations {
                self.iterations.set(0);
                let dropped = {
                    let mut pending = self.pending.borrow_mut();
                    let dropped = pending.len();
                    pending.clear();
                    dropped
                };
                bump(&self.counters.runaway_graphs);
                tracing::error!(iterations, dropped, "reaction graph did not settle");
                return Err(EngineError::RunawayReactionGraph { iterations, dropped });
            }

            self.iterations.set(iterations + 1);
            bump(&self.counters.passes);

            let started = clock.now();
            let batch: Vec<StateId> = self.pending.borrow().iter().copied().collect();
            tracing::debug!(pass = iterations + 1, reactions = batch.len(), "draining reactions");

            for id in batch {
                if !self.pending.borrow_mut().shift_remove(&id) {
                    // uninit'ed by an earlier reaction of this pass
                    continue;
                }
                let reaction = self.reactions.borrow().get(&id).cloned();
                if let Some(reaction) = reaction {
                    self.invoke(&reaction);
                }

                if clock.now() - started > time_limit && !self.pending.borrow().is_empty() {
                    tracing::debug!(
                        elapsed_ms = clock.now() - started,
                        remaining = self.pending.borrow().len(),
                        "time limit reached; yielding to a deferred drain"
                    );
                    self.run_deferred(Duration::ZERO);
                    return Ok(());
                }
            }
        }
        self.iterations.set(0);

        let after_run = self.options.borrow().after_run.clone();
        if let Some(after_run) = after_run {
            after_run();
        }
        self.collect_garbage();
        Ok(())
    }

    /// Run one reaction with its failures contained.
    pub(crate) fn invoke(&self, reaction: &ReactionInner) {
        let outcome = self
            .call_stack
            .untracked(|| panic::catch_unwind(AssertUnwindSafe(|| reaction.execute())));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                bump(&self.counters.reaction_failures);
                tracing::error!(reaction = %reaction.id(), error = %err, "reaction failed");
            }
            Err(payload) => {
                bump(&self.counters.reaction_failures);
                tracing::error!(
                    reaction = %reaction.id(),
                    panic = panic_message(payload.as_ref()),
                    "reaction panicked"
                );
            }
        }
    }

    pub(crate) fn run_deferred(self: &Rc<Self>, delay: Duration) {
        self.run_deferred_with(|| {}, delay);
    }

    pub(crate) fn run_deferred_with(self: &Rc<Self>, action: impl FnOnce(), delay: Duration) {
        if !self.options.borrow().enabled {
            return;
        }

        let _section = self.enter_run_section();
        if !self.run_scheduled.replace(true) {
            tracing::debug!(?delay, "scheduling deferred drain");
            let manager = Rc::downgrade(self);
            self.executor.defer(
                delay,
                Box::new(move || {
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    manager.run_scheduled.set(false);
                    if let Err(err) = manager.run() {
                        tracing::error!(error = %err, "deferred drain failed");
                    }
                }),
            );
        }
        action();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use crate::options::Clock;
    use crate::{DataSource, EngineError, Manager, OptionsPatch};

    use super::*;

    #[test]
    fn runaway_graph_stops_after_max_iterations() {
        let manager = Manager::new();
        let data = manager.observe(&DataSource::object().with("count", 0));
        let runs = Rc::new(Cell::new(0));

        let reaction = manager.reaction_with(
            {
                let data = data.clone();
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    let count = data.get("count").as_f64().unwrap_or(0.0);
                    data.set("count", count + 1.0);
                }
            },
            false,
        );
        reaction.schedule();

        let err = manager.run().unwrap_err();
        assert!(matches!(
            err,
            EngineError::RunawayReactionGraph { iterations: 10, dropped: 1 }
        ));
        assert_eq!(runs.get(), 10);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.diagnostics().runaway_graphs, 1);
    }

    #[test]
    fn failing_reactions_do_not_abort_the_pass() {
        let manager = Manager::with_options(OptionsPatch::new().enabled(false));
        let ran = Rc::new(Cell::new(false));

        manager.try_reaction(|| Err("broken".into()), true);
        manager.reaction(|| panic!("exploded"));
        manager.reaction({
            let ran = ran.clone();
            move || ran.set(true)
        });
        assert_eq!(manager.pending_count(), 3);

        manager.set_options(OptionsPatch::new().enabled(true));
        manager.run().unwrap();
        assert!(ran.get());
        assert_eq!(manager.diagnostics().reaction_failures, 2);
    }

    #[test]
    fn time_limit_yields_to_deferred_drain() {
        let now = Rc::new(Cell::new(0.0));
        let clock = Clock::new({
            let now = now.clone();
            move || now.get()
        });
        let manager = Manager::with_options(OptionsPatch::new().enabled(false).time_limit(5.0).get_time(clock));

        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            let now = now.clone();
            manager.reaction(move || {
                order.borrow_mut().push(n);
                now.set(now.get() + 10.0);
            });
        }

        manager.set_options(OptionsPatch::new().enabled(true));
        manager.run().unwrap();
        assert_eq!(*order.borrow(), vec![0]);
        assert_eq!(manager.pending_count(), 2);
        assert!(manager.is_run_scheduled());

        // every turn starts a new budget and runs one reaction
        manager.tick();
        assert_eq!(*order.borrow(), vec![0, 1]);
        manager.tick();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn slow_runaway_graph_is_cut_off_across_deferred_drains() {
        let now = Rc::new(Cell::new(0.0));
        let clock = Clock::new({
            let now = now.clone();
            move || now.get()
        });
        let manager = Manager::with_options(OptionsPatch::new().time_limit(50.0).get_time(clock));
        let data = manager.observe(&DataSource::object().with("n", 0));
        let runs = Rc::new(Cell::new(0));

        let reaction = manager.reaction_with(
            {
                let data = data.clone();
                let runs = runs.clone();
                let now = now.clone();
                move || {
                    runs.set(runs.get() + 1);
                    now.set(now.get() + 100.0);
                    let n = data.get("n").as_f64().unwrap_or(0.0);
                    data.set("n", n + 1.0);
                }
            },
            false,
        );
        reaction.schedule();
        // the write in the body requests a deferred drain; run one directly
        manager.run().unwrap();
        assert_eq!(manager.pending_count(), 1);

        for _ in 0..50 {
            if manager.tick() == 0 {
                break;
            }
        }

        assert_eq!(runs.get(), 10);
        assert_eq!(manager.diagnostics().runaway_graphs, 1);
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.is_run_scheduled());
    }

    #[test]
    fn pass_count_resets_once_settled() {
        let manager = Manager::with_options(OptionsPatch::new().max_iterations(2));
        let data = manager.observe(&DataSource::object().with("x", 0));
        let runs = Rc::new(Cell::new(0));
        manager.reaction({
            let data = data.clone();
            let runs = runs.clone();
            move || {
                data.get("x");
                runs.set(runs.get() + 1);
            }
        });

        for n in 1..=5 {
            manager.run_with(|| data.set("x", n)).unwrap();
        }
        assert_eq!(runs.get(), 6);
        assert_eq!(manager.diagnostics().runaway_graphs, 0);
    }

    #[test]
    fn after_run_fires_per_completed_drain() {
        let calls = Rc::new(Cell::new(0));
        let manager = Manager::with_options(OptionsPatch::new().after_run({
            let calls = calls.clone();
            move || calls.set(calls.get() + 1)
        }));

        manager.run().unwrap();
        manager.run_with(|| {}).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn deferred_requests_coalesce() {
        let manager = Manager::new();
        manager.run_deferred(Duration::ZERO);
        manager.run_deferred(Duration::ZERO);
        assert!(manager.is_run_scheduled());

        assert_eq!(manager.tick(), 1);
        assert!(!manager.is_run_scheduled());
    }

    #[test]
    fn disabled_manager_keeps_pending_reactions() {
        let manager = Manager::with_options(OptionsPatch::new().enabled(false));
        let runs = Rc::new(Cell::new(0));
        manager.reaction({
            let runs = runs.clone();
            move || runs.set(runs.get() + 1)
        });

        manager.run().unwrap();
        manager.run_deferred(Duration::ZERO);
        assert_eq!(manager.tick(), 0);
        assert_eq!(runs.get(), 0);
        assert_eq!(manager.pending_count(), 1);

        manager.set_options(OptionsPatch::new().enabled(true));
        manager.run().unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
