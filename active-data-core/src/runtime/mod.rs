//! Manager Runtime
//!
//! The [`Manager`] is the central coordinator that connects observables,
//! updatables and reactions. It owns the registries, the call stack used for
//! dependency tracking, and the pending reaction set.
//!
//! # How It Works
//!
//! 1. Wrapping a container registers one observable for it, keyed by the
//!    container's identity.
//!
//! 2. Every updatable, reaction and computed property registers its state
//!    under a [`StateId`]. Dependency edges refer to states by id only.
//!
//! 3. When an observable key changes, the manager looks up each dependent by
//!    id and invalidates it. Invalidated reactions join the pending set.
//!
//! 4. The outermost write of a batch flushes the pending set, right away in
//!    immediate mode or on a deferred pass otherwise (see `scheduler`).
//!
//! # Threading
//!
//! A manager is confined to the thread that created it. Cloning a `Manager`
//! clones a handle to the same runtime; [`Manager::new`] creates an
//! independent one, and [`Manager::global`] returns this thread's default.

mod executor;
mod scheduler;

pub use executor::{DeferredExecutor, DeferredTask, TimerQueue, TokioExecutor};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use indexmap::IndexSet;
use serde::Serialize;

use crate::error::{BoxError, Result};
use crate::graph::StateId;
use crate::options::{Options, OptionsPatch};
use crate::reactive::{
    CallStack, Observable, ObservableCore, Reaction, ReactionInner, StateCore, Updatable, UpdatableSettings,
};
use crate::value::{Accessor, DataSource, DataSourceId, Key, Value};

pub(crate) fn bump(counter: &Cell<u64>) {
    counter.set(counter.get() + 1);
}

#[derive(Default)]
pub(crate) struct Counters {
    pub cyclic_computations: Cell<u64>,
    pub reaction_failures: Cell<u64>,
    pub runaway_graphs: Cell<u64>,
    pub passes: Cell<u64>,
}

/// Snapshot of a manager's diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Re-entrant calls of a computing state.
    pub cyclic_computations: u64,
    /// Reaction runs that returned an error or panicked.
    pub reaction_failures: u64,
    /// Drains aborted because the graph did not settle.
    pub runaway_graphs: u64,
    /// Drain passes executed.
    pub passes: u64,
}

pub(crate) struct ManagerInner {
    options: RefCell<Options>,
    /// Cached `Key` forms of the watch and deep watch keys.
    watch_keys: RefCell<(Key, Key)>,

    next_id: Cell<u64>,
    intent_to_run: Cell<u32>,
    in_run_section: Cell<bool>,
    ignore_write: Cell<bool>,
    run_scheduled: Cell<bool>,
    /// Passes run since the pending set was last empty. Carried across
    /// time-sliced continuations.
    pub(crate) iterations: Cell<usize>,

    pub(crate) call_stack: CallStack,
    pub(crate) counters: Counters,

    states: RefCell<HashMap<StateId, Weak<StateCore>>>,
    observables: RefCell<HashMap<DataSourceId, Rc<ObservableCore>>>,
    reactions: RefCell<HashMap<StateId, Rc<ReactionInner>>>,
    pending: RefCell<IndexSet<StateId>>,

    executor: Rc<dyn DeferredExecutor>,
}

impl ManagerInner {
    fn new(options: Options, executor: Rc<dyn DeferredExecutor>) -> Self {
        let watch_keys = (Key::from(&options.watch_key), Key::from(&options.watch_deep_key));
        Self {
            options: RefCell::new(options),
            watch_keys: RefCell::new(watch_keys),
            next_id: Cell::new(0),
            intent_to_run: Cell::new(0),
            in_run_section: Cell::new(false),
            ignore_write: Cell::new(false),
            run_scheduled: Cell::new(false),
            iterations: Cell::new(0),
            call_stack: CallStack::default(),
            counters: Counters::default(),
            states: RefCell::new(HashMap::new()),
            observables: RefCell::new(HashMap::new()),
            reactions: RefCell::new(HashMap::new()),
            pending: RefCell::new(IndexSet::new()),
            executor,
        }
    }

    pub fn watch_keys(&self) -> (Key, Key) {
        self.watch_keys.borrow().clone()
    }

    // State registry

    pub fn next_state_id(&self) -> StateId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        StateId::new(id)
    }

    pub fn register_state(&self, state: &Rc<StateCore>) {
        self.states.borrow_mut().insert(state.id(), Rc::downgrade(state));
    }

    pub fn forget_state(&self, id: StateId) {
        if let Ok(mut states) = self.states.try_borrow_mut() {
            states.remove(&id);
        }
    }

    pub fn state(&self, id: StateId) -> Option<Rc<StateCore>> {
        self.states.borrow().get(&id).and_then(Weak::upgrade)
    }

    /// The state on top of the call stack.
    pub fn current_state(&self) -> Option<Rc<StateCore>> {
        self.call_stack.current().and_then(|id| self.state(id))
    }

    pub fn invalidate_states(&self, ids: Vec<StateId>) {
        for id in ids {
            if let Some(state) = self.state(id) {
                state.invalidate();
            }
        }
    }

    // Observable registry

    pub fn observe(self: &Rc<Self>, source: &DataSource) -> Observable {
        if let Some(core) = self.observables.borrow().get(&source.id()) {
            return Observable::from_core(Rc::clone(core));
        }
        let core = Rc::new(ObservableCore::new(self, source.clone()));
        self.observables
            .borrow_mut()
            .insert(source.id(), Rc::clone(&core));
        Observable::from_core(core)
    }

    /// Wrap containers as observables of this manager.
    pub fn wrap(self: &Rc<Self>, value: Value) -> Value {
        match value {
            Value::Data(source) => Value::Observable(self.observe(&source)),
            Value::Observable(observable) if !observable.belongs_to(self) => {
                Value::Observable(self.observe(&observable.data_source()))
            }
            other => other,
        }
    }

    /// Drop observables nothing else refers to. Returns how many went.
    pub fn collect_garbage(&self) -> usize {
        let removed: Vec<Rc<ObservableCore>> = {
            let Ok(mut observables) = self.observables.try_borrow_mut() else {
                return 0;
            };
            let dead: Vec<DataSourceId> = observables
                .iter()
                .filter(|(_, core)| core.is_collectable())
                .map(|(id, _)| *id)
                .collect();
            dead.iter().filter_map(|id| observables.remove(id)).collect()
        };
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "collected unreferenced observables");
        }
        removed.len()
    }

    // Reactions

    pub fn register_reaction(&self, reaction: Rc<ReactionInner>) {
        self.reactions.borrow_mut().insert(reaction.id(), reaction);
    }

    pub fn unregister_reaction(&self, id: StateId) -> Option<Rc<ReactionInner>> {
        self.reactions.borrow_mut().remove(&id)
    }

    pub fn enqueue(&self, id: StateId) {
        self.pending.borrow_mut().insert(id);
    }

    pub fn dequeue(&self, id: StateId) {
        self.pending.borrow_mut().shift_remove(&id);
    }

    pub fn is_pending(&self, id: StateId) -> bool {
        self.pending.borrow().contains(&id)
    }

    // Write batching

    pub fn intend(&self) -> IntentGuard<'_> {
        self.intent_to_run.set(self.intent_to_run.get() + 1);
        IntentGuard(&self.intent_to_run)
    }

    pub fn enter_run_section(&self) -> RunSection<'_> {
        let previous = self.in_run_section.replace(true);
        RunSection {
            flag: &self.in_run_section,
            previous,
        }
    }

    /// Flush after a write, unless the write is nested, ignored, or made
    /// from inside a drain.
    pub fn maybe_flush(self: &Rc<Self>) {
        if self.intent_to_run.get() != 1 || self.ignore_write.get() {
            return;
        }
        self.request_flush();
    }

    pub fn request_flush(self: &Rc<Self>) {
        if self.in_run_section.get() {
            return;
        }
        let immediate = self.options.borrow().immediate_reaction;
        if immediate {
            if let Err(err) = self.run() {
                tracing::error!(error = %err, "write-triggered run failed");
            }
        } else {
            self.run_deferred(Duration::ZERO);
        }
    }
}

pub(crate) struct IntentGuard<'a>(&'a Cell<u32>);

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

pub(crate) struct RunSection<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for RunSection<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

struct IgnoreWrite<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for IgnoreWrite<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Handle to a reactive runtime.
///
/// # Example
///
/// ```rust,ignore
/// let manager = Manager::new();
/// let state = manager.observe(&DataSource::object().with("count", 0));
///
/// let log = Rc::new(RefCell::new(Vec::new()));
/// manager.reaction({
///     let state = state.clone();
///     let log = log.clone();
///     move || log.borrow_mut().push(state.get("count").to_string())
/// });
///
/// state.set("count", 1);
/// manager.tick();
/// assert_eq!(*log.borrow(), ["0", "1"]);
/// ```
#[derive(Clone)]
pub struct Manager {
    inner: Rc<ManagerInner>,
}

thread_local! {
    static DEFAULT_MANAGER: Manager = Manager::new();
}

impl Manager {
    /// Manager with default options and a [`TimerQueue`] executor.
    pub fn new() -> Self {
        Self::with_options(OptionsPatch::new())
    }

    pub fn with_options(patch: OptionsPatch) -> Self {
        Self::with_executor(patch, Rc::new(TimerQueue::new()))
    }

    /// Manager deferring its passes to `executor`.
    pub fn with_executor(patch: OptionsPatch, executor: Rc<dyn DeferredExecutor>) -> Self {
        let mut options = Options::default();
        patch.apply_to(&mut options);
        Self {
            inner: Rc::new(ManagerInner::new(options, executor)),
        }
    }

    /// This thread's default manager.
    pub fn global() -> Self {
        DEFAULT_MANAGER.with(Manager::clone)
    }

    pub(crate) fn from_inner(inner: Rc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<ManagerInner> {
        &self.inner
    }

    /// Whether both handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Manager) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // Configuration

    pub fn set_options(&self, patch: OptionsPatch) {
        let mut options = self.inner.options.borrow_mut();
        patch.apply_to(&mut options);
        *self.inner.watch_keys.borrow_mut() =
            (Key::from(&options.watch_key), Key::from(&options.watch_deep_key));
        tracing::debug!(options = ?&*options, "manager options updated");
    }

    pub fn options(&self) -> Options {
        self.inner.options.borrow().clone()
    }

    // Observables

    /// Wrap containers as observables. Observables of this manager and
    /// primitives are returned unchanged.
    pub fn observable(&self, value: impl Into<Value>) -> Value {
        self.inner.wrap(value.into())
    }

    /// The observable of `source`, created on first use.
    pub fn observe(&self, source: &DataSource) -> Observable {
        self.inner.observe(source)
    }

    pub fn is_observable(&self, value: &Value) -> bool {
        matches!(value, Value::Observable(observable) if observable.belongs_to(&self.inner))
    }

    /// The container behind a value, tracked or not.
    pub fn data_source(&self, value: &Value) -> Option<DataSource> {
        value.data_source()
    }

    // Computations

    pub fn updatable<T, F>(&self, compute: F) -> Updatable<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
    {
        self.updatable_with(compute, UpdatableSettings::new())
    }

    pub fn updatable_with<T, F>(&self, compute: F, settings: UpdatableSettings) -> Updatable<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
    {
        Updatable::new(&self.inner, compute, settings)
    }

    /// Install a memoized accessor on `target`.
    pub fn computed(&self, target: &Observable, key: impl Into<Key>, accessor: Accessor) {
        target.define_property(key, accessor);
    }

    /// Expose properties of `source` on `target` as accessors reading and
    /// writing through to `source`. With `keys` unset every current key of
    /// `source` is mapped.
    pub fn map_properties(&self, source: &Observable, target: &Observable, keys: Option<&[Key]>) {
        let keys = keys.map_or_else(|| source.keys(), <[Key]>::to_vec);

        let _intent = self.inner.intend();
        for key in keys {
            let accessor = Accessor::new({
                let source = source.clone();
                let key = key.clone();
                move |_| source.get(&key)
            })
            .with_setter({
                let source = source.clone();
                let key = key.clone();
                move |_, value| source.set(&key, value)
            });
            target.define_property(key, accessor);
        }
        self.inner.maybe_flush();
    }

    // Reactions

    /// Register a reaction and run it.
    pub fn reaction<F>(&self, body: F) -> Reaction
    where
        F: Fn() + 'static,
    {
        self.reaction_with(body, true)
    }

    pub fn reaction_with<F>(&self, body: F, run_now: bool) -> Reaction
    where
        F: Fn() + 'static,
    {
        self.try_reaction(
            move || {
                body();
                Ok(())
            },
            run_now,
        )
    }

    /// Register a reaction whose body may fail. Failures during drains are
    /// logged and counted in [`diagnostics`](Self::diagnostics).
    pub fn try_reaction<F>(&self, body: F, run_now: bool) -> Reaction
    where
        F: Fn() -> std::result::Result<(), BoxError> + 'static,
    {
        let reaction = Reaction::new(&self.inner, body);
        if run_now {
            self.start(&reaction);
        }
        reaction
    }

    fn start(&self, reaction: &Reaction) {
        let (enabled, immediate) = {
            let options = self.inner.options.borrow();
            (options.enabled, options.immediate_reaction)
        };

        if !enabled {
            self.inner.enqueue(reaction.id());
            return;
        }

        if immediate {
            self.inner.enqueue(reaction.id());
            if let Err(err) = self.inner.run() {
                tracing::error!(error = %err, reaction = %reaction.id(), "initial run failed");
            }
            return;
        }

        {
            let _section = self.inner.enter_run_section();
            self.inner.invoke(reaction.inner());
        }
        if !self.inner.pending.borrow().is_empty() {
            self.inner.run_deferred(Duration::ZERO);
        }
    }

    // Scheduling

    /// Drain the pending set now.
    pub fn run(&self) -> Result<()> {
        self.inner.run()
    }

    /// Run `action` as one batch, then drain.
    pub fn run_with(&self, action: impl FnOnce()) -> Result<()> {
        self.inner.run_with(action)
    }

    /// Schedule a drain on the executor after `delay`.
    pub fn run_deferred(&self, delay: Duration) {
        self.inner.run_deferred(delay);
    }

    /// Run `action` now as one batch and schedule a drain for later.
    pub fn run_deferred_with(&self, action: impl FnOnce(), delay: Duration) {
        self.inner.run_deferred_with(action, delay);
    }

    /// Whether a deferred drain is waiting on the executor.
    pub fn is_run_scheduled(&self) -> bool {
        self.inner.run_scheduled.get()
    }

    /// Run due deferred work on the executor. One event-loop turn.
    pub fn tick(&self) -> usize {
        self.inner.executor.run_pending()
    }

    /// Run `f` without letting its writes trigger a flush. Writes still
    /// invalidate.
    pub fn ignore_write<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.inner.ignore_write.replace(true);
        let _restore = IgnoreWrite {
            flag: &self.inner.ignore_write,
            previous,
        };
        f()
    }

    /// Run `f` without attributing its reads to the running computation.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.call_stack.untracked(f)
    }

    // Introspection

    pub fn collect_garbage(&self) -> usize {
        self.inner.collect_garbage()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub fn observable_count(&self) -> usize {
        self.inner.observables.borrow().len()
    }

    /// Number of live reactions.
    pub fn reaction_count(&self) -> usize {
        self.inner.reactions.borrow().len()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let counters = &self.inner.counters;
        Diagnostics {
            cyclic_computations: counters.cyclic_computations.get(),
            reaction_failures: counters.reaction_failures.get(),
            runaway_graphs: counters.runaway_graphs.get(),
            passes: counters.passes.get(),
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("observables", &self.observable_count())
            .field("reactions", &self.reaction_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}
