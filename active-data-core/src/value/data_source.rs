//! Data Sources
//!
//! A [`DataSource`] is the plain mutable container an observable wraps. It is
//! a cheap handle (`Rc`) so the same container can be referenced from several
//! places; identity is the allocation, exposed as [`DataSourceId`].
//!
//! Objects keep insertion order and may carry accessor properties (a getter
//! with an optional setter). Accessors receive the observable they are read
//! through, which lets a computed property read its siblings without the
//! getter owning a reference to its own container.
//!
//! All methods here are untracked. Go through an
//! [`Observable`](crate::Observable) to participate in dependency tracking.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::{Key, Value};
use crate::reactive::Observable;

/// Getter of an accessor property.
pub type Getter = Rc<dyn Fn(&Observable) -> Value>;

/// Setter of an accessor property.
pub type Setter = Rc<dyn Fn(&Observable, Value)>;

/// A computed property definition: a getter and an optional setter.
#[derive(Clone)]
pub struct Accessor {
    pub(crate) get: Getter,
    pub(crate) set: Option<Setter>,
}

impl Accessor {
    /// Accessor with a getter only. Writes to it are ignored.
    pub fn new<G>(get: G) -> Self
    where
        G: Fn(&Observable) -> Value + 'static,
    {
        Self {
            get: Rc::new(get),
            set: None,
        }
    }

    /// Attach a setter.
    pub fn with_setter<S>(mut self, set: S) -> Self
    where
        S: Fn(&Observable, Value) + 'static,
    {
        self.set = Some(Rc::new(set));
        self
    }

    pub fn has_setter(&self) -> bool {
        self.set.is_some()
    }
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("has_setter", &self.has_setter())
            .finish()
    }
}

/// A property slot of an object.
#[derive(Clone, Debug)]
pub enum Property {
    Value(Value),
    Accessor(Accessor),
}

impl From<Value> for Property {
    fn from(value: Value) -> Self {
        Property::Value(value)
    }
}

impl From<Accessor> for Property {
    fn from(accessor: Accessor) -> Self {
        Property::Accessor(accessor)
    }
}

/// What a raw read found.
pub(crate) enum Slot {
    Value(Value),
    Accessor(Accessor),
    Missing,
}

/// Object or array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Object,
    Array,
}

/// Identity of a data source. Stable for as long as the container is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataSourceId(usize);

enum Container {
    Object(IndexMap<Key, Property>),
    Array(Vec<Value>),
}

/// A plain mutable object or array with reference identity.
#[derive(Clone)]
pub struct DataSource(Rc<RefCell<Container>>);

impl DataSource {
    /// New empty object.
    pub fn object() -> Self {
        Self(Rc::new(RefCell::new(Container::Object(IndexMap::new()))))
    }

    /// New empty array.
    pub fn array() -> Self {
        Self::from_values(std::iter::empty::<Value>())
    }

    /// New array holding `values`.
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let items = values.into_iter().map(|v| v.into().into_stored()).collect();
        Self(Rc::new(RefCell::new(Container::Array(items))))
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder form of [`define_accessor`](Self::define_accessor).
    pub fn with_accessor(self, key: impl Into<Key>, accessor: Accessor) -> Self {
        self.define_accessor(key, accessor);
        self
    }

    pub fn id(&self) -> DataSourceId {
        DataSourceId(Rc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn kind(&self) -> ContainerKind {
        match &*self.0.borrow() {
            Container::Object(_) => ContainerKind::Object,
            Container::Array(_) => ContainerKind::Array,
        }
    }

    pub fn is_array(&self) -> bool {
        self.kind() == ContainerKind::Array
    }

    /// Number of properties (objects) or elements (arrays).
    pub fn len(&self) -> usize {
        match &*self.0.borrow() {
            Container::Object(map) => map.len(),
            Container::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Own keys in order. Array keys are the indices.
    pub fn keys(&self) -> Vec<Key> {
        match &*self.0.borrow() {
            Container::Object(map) => map.keys().cloned().collect(),
            Container::Array(items) => (0..items.len()).map(Key::from).collect(),
        }
    }

    /// Plain read. Accessor properties read as `Undefined` here; read them
    /// through an observable.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        match self.read(&key.into()) {
            Slot::Value(value) => value,
            Slot::Accessor(_) | Slot::Missing => Value::Undefined,
        }
    }

    /// The raw property slot, if present.
    pub fn property(&self, key: impl Into<Key>) -> Option<Property> {
        match self.read(&key.into()) {
            Slot::Value(value) => Some(Property::Value(value)),
            Slot::Accessor(accessor) => Some(Property::Accessor(accessor)),
            Slot::Missing => None,
        }
    }

    /// Plain, untracked write. Returns false when an array rejects the key.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        self.write(&key.into(), value.into().into_stored())
    }

    /// Install an accessor property. Arrays do not take accessors.
    pub fn define_accessor(&self, key: impl Into<Key>, accessor: Accessor) -> bool {
        self.define(&key.into(), Property::Accessor(accessor))
    }

    /// Remove a property. Array elements become `Undefined` holes.
    pub fn remove(&self, key: impl Into<Key>) -> Option<Property> {
        let key = key.into();
        match &mut *self.0.borrow_mut() {
            Container::Object(map) => map.shift_remove(&key),
            Container::Array(items) => {
                let slot = items.get_mut(key.as_index()?)?;
                Some(Property::Value(std::mem::take(slot)))
            }
        }
    }

    pub fn ptr_eq(&self, other: &DataSource) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Plain JSON rendering. Cyclic references render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_guarded(&mut HashSet::new())
    }

    fn to_json_guarded(&self, visiting: &mut HashSet<DataSourceId>) -> serde_json::Value {
        if !visiting.insert(self.id()) {
            return serde_json::Value::Null;
        }
        let json = match &*self.0.borrow() {
            Container::Object(map) => {
                let mut entries = serde_json::Map::new();
                for (key, property) in map {
                    if let Property::Value(value) = property {
                        entries.insert(key.to_string(), value_to_json(value, visiting));
                    }
                }
                serde_json::Value::Object(entries)
            }
            Container::Array(items) => serde_json::Value::Array(
                items.iter().map(|value| value_to_json(value, visiting)).collect(),
            ),
        };
        visiting.remove(&self.id());
        json
    }

    pub(crate) fn read(&self, key: &Key) -> Slot {
        match &*self.0.borrow() {
            Container::Object(map) => match map.get(key) {
                Some(Property::Value(value)) => Slot::Value(value.clone()),
                Some(Property::Accessor(accessor)) => Slot::Accessor(accessor.clone()),
                None => Slot::Missing,
            },
            Container::Array(items) => {
                if key.is_length() {
                    return Slot::Value(Value::from(items.len()));
                }
                match key.as_index().and_then(|index| items.get(index)) {
                    Some(value) => Slot::Value(value.clone()),
                    None => Slot::Missing,
                }
            }
        }
    }

    pub(crate) fn write(&self, key: &Key, value: Value) -> bool {
        match &mut *self.0.borrow_mut() {
            Container::Object(map) => {
                map.insert(key.clone(), Property::Value(value));
                true
            }
            Container::Array(items) => {
                if key.is_length() {
                    return match value.as_f64() {
                        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= MAX_LENGTH as f64 => {
                            resize(items, n as usize)
                        }
                        _ => false,
                    };
                }
                let Some(index) = key.as_index().filter(|&index| index < MAX_LENGTH) else {
                    return false;
                };
                if index >= items.len() && !resize(items, index + 1) {
                    return false;
                }
                items[index] = value;
                true
            }
        }
    }

    pub(crate) fn define(&self, key: &Key, property: Property) -> bool {
        match property {
            Property::Value(value) => self.write(key, value.into_stored()),
            Property::Accessor(accessor) => match &mut *self.0.borrow_mut() {
                Container::Object(map) => {
                    map.insert(key.clone(), Property::Accessor(accessor));
                    true
                }
                Container::Array(_) => false,
            },
        }
    }

    pub(crate) fn accessors(&self) -> Vec<(Key, Accessor)> {
        match &*self.0.borrow() {
            Container::Object(map) => map
                .iter()
                .filter_map(|(key, property)| match property {
                    Property::Accessor(accessor) => Some((key.clone(), accessor.clone())),
                    Property::Value(_) => None,
                })
                .collect(),
            Container::Array(_) => Vec::new(),
        }
    }

    /// Containers directly referenced by this one.
    pub(crate) fn children(&self) -> Vec<DataSource> {
        let values: Vec<Value> = match &*self.0.borrow() {
            Container::Object(map) => map
                .values()
                .filter_map(|property| match property {
                    Property::Value(value) => Some(value.clone()),
                    Property::Accessor(_) => None,
                })
                .collect(),
            Container::Array(items) => items.clone(),
        };
        values.iter().filter_map(Value::data_source).collect()
    }

    /// Run `f` on the array's elements. The elements are moved out for the
    /// duration of the call, so `f` may freely read other containers.
    pub(crate) fn with_array_mut<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let items = match &mut *self.0.borrow_mut() {
            Container::Array(items) => std::mem::take(items),
            Container::Object(_) => return None,
        };
        // put the elements back even if `f` unwinds
        let mut taken = Taken { source: self, items };
        Some(f(&mut taken.items))
    }

    pub(crate) fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

/// Largest array length; indices run below it.
const MAX_LENGTH: usize = u32::MAX as usize;

/// Grow or shrink to `len`, padding with `Undefined`. Returns false if the
/// memory cannot be reserved.
fn resize(items: &mut Vec<Value>, len: usize) -> bool {
    if len > items.len() && items.try_reserve(len - items.len()).is_err() {
        return false;
    }
    items.resize(len, Value::Undefined);
    true
}

struct Taken<'a> {
    source: &'a DataSource,
    items: Vec<Value>,
}

impl Drop for Taken<'_> {
    fn drop(&mut self) {
        if let Ok(mut container) = self.source.0.try_borrow_mut() {
            if let Container::Array(slot) = &mut *container {
                *slot = std::mem::take(&mut self.items);
            }
        }
    }
}

fn value_to_json(value: &Value, visiting: &mut HashSet<DataSourceId>) -> serde_json::Value {
    match value.data_source() {
        Some(source) => source.to_json_guarded(visiting),
        None => value.to_json(),
    }
}

impl PartialEq for DataSource {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for DataSource {}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_insert_and_get() {
        let source = DataSource::object().with("a", 1).with("b", "two");
        assert_eq!(source.get("a"), Value::from(1));
        assert_eq!(source.get("b"), Value::from("two"));
        assert!(source.get("missing").is_undefined());
        assert_eq!(source.keys(), vec![Key::from("a"), Key::from("b")]);
    }

    #[test]
    fn array_index_and_length_writes() {
        let source = DataSource::from_values([1, 2]);
        assert_eq!(source.get("length"), Value::from(2));

        assert!(source.insert(4usize, 5));
        assert_eq!(source.len(), 5);
        assert!(source.get(2usize).is_undefined());

        assert!(source.insert("length", 1));
        assert_eq!(source.len(), 1);
        assert!(!source.insert("name", "x"));
    }

    #[test]
    fn oversized_array_writes_are_rejected() {
        let source = DataSource::from_values([1, 2]);

        assert!(!source.insert("length", 1e300));
        assert!(!source.insert("length", f64::INFINITY));
        assert!(!source.insert("length", 4_294_967_296.0));
        assert!(!source.insert("4294967295", 1));
        assert!(!source.insert("length", -1));
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn unwinding_array_edit_keeps_elements() {
        let source = DataSource::from_values([1, 2, 3]);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            source.with_array_mut(|items| {
                items.pop();
                panic!("edit failed");
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(source.len(), 2);
        assert_eq!(source.get(1usize), Value::from(2));
    }

    #[test]
    fn identity() {
        let a = DataSource::object();
        let b = a.clone();
        let c = DataSource::object();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
    }

    #[test]
    fn accessors_are_not_plain_data() {
        let source = DataSource::object()
            .with("a", 1)
            .with_accessor("double", Accessor::new(|_| Value::from(2)));
        assert!(source.get("double").is_undefined());
        assert!(matches!(source.property("double"), Some(Property::Accessor(_))));
        assert_eq!(source.accessors().len(), 1);
        assert_eq!(source.to_json(), json!({"a": 1.0}));
    }

    #[test]
    fn remove_leaves_array_holes() {
        let source = DataSource::from_values([1, 2, 3]);
        source.remove(1usize);
        assert_eq!(source.len(), 3);
        assert!(source.get(1usize).is_undefined());

        let object = DataSource::object().with("a", 1);
        assert!(object.remove("a").is_some());
        assert!(object.is_empty());
    }

    #[test]
    fn cyclic_json_is_cut() {
        let parent = DataSource::object();
        let child = DataSource::object().with("parent", parent.clone());
        parent.insert("child", child.clone());

        assert_eq!(parent.to_json(), json!({"child": {"parent": null}}));

        // break the cycle so the test does not leak
        child.remove("parent");
    }

    #[test]
    fn children_lists_nested_containers() {
        let nested = DataSource::object();
        let source = DataSource::object().with("n", nested.clone()).with("x", 1);
        assert_eq!(source.children(), vec![nested]);
    }
}
