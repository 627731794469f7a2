//! Observable Implementation
//!
//! An Observable is the tracked view of a [`DataSource`]. Reads made through
//! it while an updatable or reaction is computing register that computation
//! as a dependent of the key; writes invalidate the dependents of the key.
//!
//! # How Observables Work
//!
//! 1. `get` registers the running state (if any) in this observable's
//!    dependency index under the key, then returns the value. Nested
//!    containers come back wrapped as observables of the same manager.
//!
//! 2. `set` compares the new value to the old one with strict equality. Only
//!    a real change is written, and only a real change invalidates.
//!
//! 3. Array mutators (`push`, `splice`, `sort`, ...) invalidate every
//!    dependent of every key before mutating.
//!
//! 4. The outermost write of a batch asks the manager to flush reactions.
//!
//! # Watch Keys
//!
//! Two virtual keys make a state depend on more than one property:
//!
//! - the watch key (`$$watch` by default) is invalidated by any write to the
//!   container
//! - the deep watch key (`$$watchDeep`) additionally walks every nested
//!   container and watches each of them
//!
//! Reading either returns the observable itself.
//!
//! # Computed Properties
//!
//! Accessor properties are read through a memoized state per key, so a
//! getter runs once per change of what it reads, no matter how many readers
//! it has.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Bound, Range, RangeBounds};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::state::{StateCore, StateHooks};
use crate::graph::DependencyIndex;
use crate::runtime::{Manager, ManagerInner};
use crate::value::{Accessor, DataSource, Getter, Key, Property, Slot, Value};

/// Memoized accessor of one observable key.
pub(crate) struct ComputedProperty {
    state: Rc<StateCore>,
    cache: RefCell<Option<Value>>,
    getter: Getter,
}

impl ComputedProperty {
    fn new(manager: &Rc<ManagerInner>, getter: Getter) -> Self {
        Self {
            state: StateCore::new(manager, StateHooks::default()),
            cache: RefCell::new(None),
            getter,
        }
    }

    /// Evaluate through the call protocol. A cyclic read yields `Undefined`.
    fn call(&self, owner: &Observable) -> Value {
        self.state
            .call_with(&self.cache, || (self.getter)(owner))
            .unwrap_or_default()
    }
}

pub(crate) struct ObservableCore {
    manager: Weak<ManagerInner>,
    source: DataSource,
    index: Rc<RefCell<DependencyIndex>>,
    computed: RefCell<IndexMap<Key, Rc<ComputedProperty>>>,
    watch_deep_section: Cell<bool>,
}

impl ObservableCore {
    pub fn new(manager: &Rc<ManagerInner>, source: DataSource) -> Self {
        Self {
            manager: Rc::downgrade(manager),
            source,
            index: Rc::new(RefCell::new(DependencyIndex::default())),
            computed: RefCell::new(IndexMap::new()),
            watch_deep_section: Cell::new(false),
        }
    }

    /// Nothing outside the registry refers to this observable or its source.
    pub fn is_collectable(self: &Rc<Self>) -> bool {
        Rc::strong_count(self) == 1 && self.source.strong_count() == 1
    }
}

/// Tracked wrapper around a [`DataSource`].
///
/// Obtained from [`Manager::observe`] or [`Manager::observable`]. Each data
/// source has exactly one observable per manager, so handles compare equal
/// when they wrap the same container.
#[derive(Clone)]
pub struct Observable(Rc<ObservableCore>);

impl Observable {
    pub(crate) fn from_core(core: Rc<ObservableCore>) -> Self {
        Self(core)
    }

    fn core_manager(&self) -> Option<Rc<ManagerInner>> {
        self.0.manager.upgrade()
    }

    pub(crate) fn belongs_to(&self, manager: &Rc<ManagerInner>) -> bool {
        std::ptr::eq(self.0.manager.as_ptr(), Rc::as_ptr(manager))
    }

    /// The wrapped container.
    pub fn data_source(&self) -> DataSource {
        self.0.source.clone()
    }

    /// The manager this observable reports to, if it is still alive.
    pub fn manager(&self) -> Option<Manager> {
        self.core_manager().map(Manager::from_inner)
    }

    pub fn is_array(&self) -> bool {
        self.0.source.is_array()
    }

    /// Tracked read.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        let Some(manager) = self.core_manager() else {
            return self.0.source.get(key);
        };

        if let Some(state) = manager.current_state() {
            self.register_read(&manager, &state, &key);
        }

        let (watch, watch_deep) = manager.watch_keys();
        if key == watch || key == watch_deep {
            return Value::Observable(self.clone());
        }

        match self.0.source.read(&key) {
            Slot::Value(value) => manager.wrap(value),
            Slot::Accessor(accessor) => {
                let value = self.computed_property(&manager, &key, &accessor).call(self);
                manager.wrap(value)
            }
            Slot::Missing => Value::Undefined,
        }
    }

    /// Tracked write. Writing the value already stored is a no-op, except
    /// for `length` on arrays.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into().into_stored();
        let Some(manager) = self.core_manager() else {
            self.0.source.insert(key, value);
            return;
        };

        let _intent = manager.intend();
        match self.0.source.read(&key) {
            Slot::Accessor(accessor) => {
                if let Some(setter) = &accessor.set {
                    setter(self, value);
                    self.invalidate_key(&manager, &key);
                }
            }
            Slot::Value(old) if old.same_value(&value) && !(key.is_length() && self.is_array()) => {}
            _ => self.write(&manager, &key, value),
        }
        manager.maybe_flush();
    }

    fn write(&self, manager: &Rc<ManagerInner>, key: &Key, value: Value) {
        let source = &self.0.source;
        if !source.is_array() {
            if source.write(key, value) {
                self.invalidate_key(manager, key);
                self.invalidate_key(manager, &manager.watch_keys().0);
            }
            return;
        }

        let before = source.len();
        if !source.write(key, value) {
            return;
        }
        if key.is_length() {
            // truncation drops elements that may have readers
            self.invalidate_all(manager);
            return;
        }
        self.invalidate_key(manager, key);
        if source.len() != before {
            self.invalidate_key(manager, &Key::length());
        }
        self.invalidate_key(manager, &manager.watch_keys().0);
    }

    /// Remove a property and notify its readers.
    pub fn delete(&self, key: impl Into<Key>) {
        let key = key.into();
        let Some(manager) = self.core_manager() else {
            self.0.source.remove(key);
            return;
        };

        let _intent = manager.intend();
        self.drop_computed(&key);
        self.0.source.remove(&key);
        self.invalidate_key(&manager, &key);
        self.invalidate_key(&manager, &manager.watch_keys().0);
        manager.maybe_flush();
    }

    /// Install a plain value or an accessor under `key`.
    pub fn define_property(&self, key: impl Into<Key>, property: impl Into<Property>) {
        let key = key.into();
        let property = property.into();
        let Some(manager) = self.core_manager() else {
            self.0.source.define(&key, property);
            return;
        };

        let _intent = manager.intend();
        self.drop_computed(&key);
        if self.0.source.define(&key, property) {
            self.invalidate_key(&manager, &key);
            self.invalidate_key(&manager, &manager.watch_keys().0);
        }
        manager.maybe_flush();
    }

    /// Depend on every property of this container.
    pub fn watch(&self) -> &Self {
        if let Some(manager) = self.core_manager() {
            self.get(manager.watch_keys().0);
        }
        self
    }

    /// Depend on every property of every container reachable from this one.
    pub fn watch_deep(&self) -> &Self {
        if let Some(manager) = self.core_manager() {
            self.get(manager.watch_keys().1);
        }
        self
    }

    /// Tracked size: element count of arrays, property count of objects.
    pub fn len(&self) -> usize {
        if self.is_array() {
            return self
                .get(Key::length())
                .as_f64()
                .map_or(0, |length| length as usize);
        }
        self.watch();
        self.0.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Own keys, untracked.
    pub fn keys(&self) -> Vec<Key> {
        self.0.source.keys()
    }

    /// Tracked read of every value, in key order.
    pub fn values(&self) -> Vec<Value> {
        self.watch();
        self.keys().into_iter().map(|key| self.get(key)).collect()
    }

    /// Number of states registered under `key`.
    pub fn subscriber_count(&self, key: impl Into<Key>) -> usize {
        self.0.index.borrow().subscriber_count(&key.into())
    }

    /// Number of keys with at least one registered state.
    pub fn tracked_keys(&self) -> usize {
        self.0.index.borrow().key_count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.0.source.to_json()
    }

    // Array mutators. On objects they do nothing and return the empty answer.

    /// Append a value, returning the new length.
    pub fn push(&self, value: impl Into<Value>) -> usize {
        let value = value.into().into_stored();
        self.mutate_array(|items| {
            items.push(value);
            items.len()
        })
        .unwrap_or(0)
    }

    pub fn pop(&self) -> Option<Value> {
        let value = self.mutate_array(Vec::pop).flatten()?;
        Some(self.wrap(value))
    }

    pub fn shift(&self) -> Option<Value> {
        let value = self
            .mutate_array(|items| (!items.is_empty()).then(|| items.remove(0)))
            .flatten()?;
        Some(self.wrap(value))
    }

    /// Prepend values, returning the new length.
    pub fn unshift<I, V>(&self, values: I) -> usize
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(|v| v.into().into_stored()).collect();
        self.mutate_array(|items| {
            let tail = std::mem::replace(items, values);
            items.extend(tail);
            items.len()
        })
        .unwrap_or(0)
    }

    /// Remove `delete_count` elements at `start` and insert `items` in their
    /// place. Returns the removed elements.
    pub fn splice<I, V>(&self, start: usize, delete_count: usize, items: I) -> Vec<Value>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let inserted: Vec<Value> = items.into_iter().map(|v| v.into().into_stored()).collect();
        let removed = self
            .mutate_array(|elements| {
                let start = start.min(elements.len());
                let end = start.saturating_add(delete_count).min(elements.len());
                elements.splice(start..end, inserted).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        removed.into_iter().map(|value| self.wrap(value)).collect()
    }

    /// Sort by string representation, `undefined` last.
    pub fn sort(&self) {
        self.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    }

    /// Sort with a comparator. `undefined` elements always go last and are
    /// never passed to `compare`.
    pub fn sort_by<F>(&self, mut compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.mutate_array(|items| {
            items.sort_by(|a, b| match (a.is_undefined(), b.is_undefined()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare(a, b),
            })
        });
    }

    pub fn reverse(&self) {
        self.mutate_array(|items| items.reverse());
    }

    /// Overwrite the elements in `range` with `value`.
    pub fn fill(&self, value: impl Into<Value>, range: impl RangeBounds<usize>) {
        let value = value.into().into_stored();
        self.mutate_array(|items| {
            let range = clamp_range(&range, items.len());
            for slot in &mut items[range] {
                *slot = value.clone();
            }
        });
    }

    /// Copy the elements in `source` to the positions starting at `dest`,
    /// without growing the array.
    pub fn copy_within(&self, source: impl RangeBounds<usize>, dest: usize) {
        self.mutate_array(|items| {
            let len = items.len();
            let source = clamp_range(&source, len);
            if dest >= len {
                return;
            }
            let count = source.len().min(len - dest);
            let copied: Vec<Value> = items[source.start..source.start + count].to_vec();
            items[dest..dest + count].clone_from_slice(&copied);
        });
    }

    fn mutate_array<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        if !self.is_array() {
            return None;
        }
        let Some(manager) = self.core_manager() else {
            return self.0.source.with_array_mut(f);
        };

        let _intent = manager.intend();
        self.invalidate_all(&manager);
        let result = self.0.source.with_array_mut(f);
        manager.maybe_flush();
        result
    }

    fn wrap(&self, value: Value) -> Value {
        match self.core_manager() {
            Some(manager) => manager.wrap(value),
            None => value,
        }
    }

    fn register_read(&self, manager: &Rc<ManagerInner>, state: &StateCore, key: &Key) {
        let (watch, watch_deep) = manager.watch_keys();

        if *key == watch_deep {
            if !self.0.watch_deep_section.replace(true) {
                let _section = LeaveSection(&self.0.watch_deep_section);
                for child in self.0.source.children() {
                    manager.observe(&child).register_read(manager, state, &watch_deep);
                }
            }
            // a deep watch is also a shallow watch of this container
            self.register_read(manager, state, &watch);
            return;
        }

        state.register_read(self.0.source.id(), &self.0.index, key);

        if *key == watch {
            for (name, accessor) in self.0.source.accessors() {
                self.computed_property(manager, &name, &accessor).call(self);
            }
        }
    }

    fn computed_property(&self, manager: &Rc<ManagerInner>, key: &Key, accessor: &Accessor) -> Rc<ComputedProperty> {
        if let Some(existing) = self.0.computed.borrow().get(key) {
            return Rc::clone(existing);
        }
        let property = Rc::new(ComputedProperty::new(manager, Rc::clone(&accessor.get)));
        self.0
            .computed
            .borrow_mut()
            .insert(key.clone(), Rc::clone(&property));
        property
    }

    fn drop_computed(&self, key: &Key) {
        let removed = self.0.computed.borrow_mut().shift_remove(key);
        if let Some(property) = removed {
            property.state.uninit();
        }
    }

    fn invalidate_key(&self, manager: &Rc<ManagerInner>, key: &Key) {
        let dependents = self.0.index.borrow().dependents(key);
        if dependents.is_empty() {
            return;
        }
        tracing::trace!(source = ?self.0.source.id(), %key, dependents = dependents.len(), "invalidating key");
        manager.invalidate_states(dependents);
    }

    fn invalidate_all(&self, manager: &Rc<ManagerInner>) {
        let dependents = self.0.index.borrow().all();
        if dependents.is_empty() {
            return;
        }
        tracing::trace!(source = ?self.0.source.id(), dependents = dependents.len(), "invalidating every key");
        manager.invalidate_states(dependents);
    }
}

impl PartialEq for Observable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Observable {}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("source", &self.0.source)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

struct LeaveSection<'a>(&'a Cell<bool>);

impl Drop for LeaveSection<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn clamp_range(range: &impl RangeBounds<usize>, len: usize) -> Range<usize> {
    let start = match range.start_bound() {
        Bound::Included(&start) => start,
        Bound::Excluded(&start) => start.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&end) => end.saturating_add(1),
        Bound::Excluded(&end) => end,
        Bound::Unbounded => len,
    };
    let end = end.min(len);
    start.min(end)..end
}
