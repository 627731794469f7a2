//! Dynamic Data Model
//!
//! Observables wrap plain mutable containers. Because Rust has no proxy
//! objects, the containers are an explicit dynamic model:
//!
//! - [`DataSource`]: a shared, identity-carrying object or array
//! - [`Value`]: anything that can sit in a container slot
//! - [`Key`]: a property key (array indices are decimal keys, plus `length`)
//!
//! # Equality
//!
//! Write detection uses strict equality: primitives compare by value,
//! containers by identity, and `NaN` never equals itself. `PartialEq` on
//! [`Value`] follows the same rule.

mod data_source;

pub use data_source::{Accessor, ContainerKind, DataSource, DataSourceId, Getter, Property, Setter};
pub(crate) use data_source::Slot;

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::reactive::Observable;

/// A property key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Rc<str>);

impl Key {
    /// Create a key from a name.
    pub fn new(name: &str) -> Self {
        Self(Rc::from(name))
    }

    /// The `length` key of arrays.
    pub fn length() -> Self {
        Self::new("length")
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the key as a canonical array index (`"0"`, `"17"`, never `"007"`).
    pub fn as_index(&self) -> Option<usize> {
        let text = self.as_str();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if text.len() > 1 && text.starts_with('0') {
            return None;
        }
        text.parse().ok()
    }

    /// Whether this is the `length` key.
    pub fn is_length(&self) -> bool {
        self.as_str() == "length"
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self(Rc::from(name))
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self::from(index.to_string())
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Key {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Key {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value stored in, or read from, a container.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    /// A plain, untracked container.
    Data(DataSource),
    /// A tracked container. Reads through an observable return nested
    /// containers in this form.
    Observable(Observable),
}

impl Value {
    /// A new empty object.
    pub fn object() -> Self {
        Value::Data(DataSource::object())
    }

    /// A new array holding `values`.
    pub fn array<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Data(DataSource::from_values(values))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// `null` or `undefined`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Whether the value is an object or array, tracked or not.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Data(_) | Value::Observable(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The number as an integer, if it has no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_observable(&self) -> Option<&Observable> {
        match self {
            Value::Observable(observable) => Some(observable),
            _ => None,
        }
    }

    pub fn into_observable(self) -> Option<Observable> {
        match self {
            Value::Observable(observable) => Some(observable),
            _ => None,
        }
    }

    /// The underlying container, whether tracked or not.
    pub fn data_source(&self) -> Option<DataSource> {
        match self {
            Value::Data(source) => Some(source.clone()),
            Value::Observable(observable) => Some(observable.data_source()),
            _ => None,
        }
    }

    /// Strict equality: primitives by value, containers by identity.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => match (self.data_source(), other.data_source()) {
                (Some(a), Some(b)) => a.ptr_eq(&b),
                _ => false,
            },
        }
    }

    /// Plain JSON rendering. `undefined` becomes `null`, accessors are skipped.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Data(source) => source.to_json(),
            Value::Observable(observable) => observable.data_source().to_json(),
        }
    }

    /// Containers are stored unwrapped so a data source never holds a tracker.
    pub(crate) fn into_stored(self) -> Value {
        match self {
            Value::Observable(observable) => Value::Data(observable.data_source()),
            other => other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        f.write_str("NaN")
    } else if n.is_infinite() {
        f.write_str(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => format_number(*n, f),
            Value::String(s) => f.write_str(s),
            Value::Data(_) | Value::Observable(_) => {
                let Some(source) = self.data_source() else {
                    return Ok(());
                };
                f.write_str(&join_elements(&source, &mut HashSet::new()))
            }
        }
    }
}

/// Array-to-string conversion. An array met again while it is being joined
/// contributes an empty string.
fn join_elements(source: &DataSource, visiting: &mut HashSet<DataSourceId>) -> String {
    if !source.is_array() {
        return String::from("[object Object]");
    }
    if !visiting.insert(source.id()) {
        return String::new();
    }
    let items: Vec<String> = source
        .keys()
        .into_iter()
        .map(|key| match source.get(key) {
            value if value.is_nullish() => String::new(),
            value => match value.data_source() {
                Some(nested) => join_elements(&nested, visiting),
                None => value.to_string(),
            },
        })
        .collect();
    visiting.remove(&source.id());
    items.join(",")
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<DataSource> for Value {
    fn from(source: DataSource) -> Self {
        Value::Data(source)
    }
}

impl From<Observable> for Value {
    fn from(observable: Observable) -> Self {
        Value::Observable(observable)
    }
}

impl From<&Observable> for Value {
    fn from(observable: &Observable) -> Self {
        Value::Observable(observable.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::Data(DataSource::from_values(items.into_iter().map(Value::from)))
            }
            serde_json::Value::Object(entries) => {
                let source = DataSource::object();
                for (key, value) in entries {
                    source.insert(key, Value::from(value));
                }
                Value::Data(source)
            }
        }
    }
}
