//! Active Data Core
//!
//! This crate provides the core runtime for active-data, a dependency
//! tracking engine for plain mutable data. It implements:
//!
//! - Observable containers (tracked reads, change-detecting writes)
//! - Memoized updatables and computed properties
//! - Reactions re-run in batched, time-sliced passes
//! - Path helpers for binding to nested data
//!
//! The engine is single-threaded. A [`Manager`] owns one dependency graph;
//! all handles created from it stay on its thread.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: the dynamic data model (containers, values, keys)
//! - `graph`: dependency bookkeeping between keys and states
//! - `reactive`: observables, updatables and reactions
//! - `runtime`: the manager, its scheduler and deferred executors
//! - `path`: dotted-path access and bindings
//!
//! # Example
//!
//! ```rust,ignore
//! use active_data_core::{DataSource, Manager, OptionsPatch};
//!
//! let manager = Manager::with_options(OptionsPatch::new().immediate_reaction(true));
//! let state = manager.observe(&DataSource::object().with("count", 0));
//!
//! // Create a derived value
//! let doubled = manager.updatable({
//!     let state = state.clone();
//!     move || state.get("count").as_f64().unwrap_or(0.0) * 2.0
//! });
//!
//! // Create a reaction
//! manager.reaction({
//!     let state = state.clone();
//!     let doubled = doubled.clone();
//!     move || println!("count: {}, doubled: {:?}", state.get("count"), doubled.call())
//! });
//!
//! // Update the data
//! state.set("count", 5);
//! // The reaction runs again, prints: "count: 5, doubled: Some(10.0)"
//! ```

pub mod error;
pub mod graph;
pub mod options;
pub mod path;
pub mod reactive;
pub mod runtime;
pub mod value;

pub use error::{BoxError, EngineError, Result};
pub use graph::StateId;
pub use options::{Clock, Options, OptionsPatch};
pub use reactive::{Observable, Reaction, Updatable, UpdatableSettings};
pub use runtime::{DeferredExecutor, DeferredTask, Diagnostics, Manager, TimerQueue, TokioExecutor};
pub use value::{Accessor, ContainerKind, DataSource, DataSourceId, Key, Property, Value};

/// Wrap a value with this thread's default manager.
pub fn observable(value: impl Into<Value>) -> Value {
    Manager::global().observable(value)
}

/// Register a reaction with this thread's default manager and run it.
pub fn reaction<F>(body: F) -> Reaction
where
    F: Fn() + 'static,
{
    Manager::global().reaction(body)
}

/// Install a computed property through this thread's default manager.
pub fn computed(target: &Observable, key: impl Into<Key>, accessor: Accessor) {
    Manager::global().computed(target, key, accessor);
}

/// Create an updatable with this thread's default manager.
pub fn updatable<T, F>(compute: F) -> Updatable<T>
where
    T: Clone + 'static,
    F: Fn() -> T + 'static,
{
    Manager::global().updatable(compute)
}
