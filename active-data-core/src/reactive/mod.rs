//! Reactive Primitives
//!
//! This module implements the tracked side of the engine: observables,
//! updatables and reactions.
//!
//! # Concepts
//!
//! ## Observables
//!
//! An Observable wraps a mutable container. When one of its properties is
//! read while a computation is running, the computation is registered as a
//! dependent of that property. When the property is written, all dependents
//! are invalidated.
//!
//! ## Updatables
//!
//! An Updatable is a derived value that caches its result. It re-evaluates
//! only after something it read has changed, and only when it is called
//! again. Accessor properties of observed containers are backed by the same
//! machinery.
//!
//! ## Reactions
//!
//! A Reaction is a side-effecting computation. Invalidating it queues it on
//! its manager, which re-runs queued reactions in batches.
//!
//! # Implementation Notes
//!
//! Each manager keeps an explicit call stack of the computations currently
//! running. A tracked read attributes itself to the top of that stack.
//! Dependency edges are stored as ids and resolved through the manager's
//! registry, so dropping a handle never leaves dangling edges behind.

mod context;
mod observable;
mod reaction;
mod state;
mod updatable;

pub(crate) use context::CallStack;
pub(crate) use observable::ObservableCore;
pub(crate) use reaction::ReactionInner;
pub(crate) use state::StateCore;

pub use observable::Observable;
pub use reaction::Reaction;
pub use updatable::{Updatable, UpdatableSettings};
