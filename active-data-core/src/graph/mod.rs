//! Dependency Graph
//!
//! This module holds the bookkeeping side of the dependency graph: the
//! identifiers of updatable states and the per-observable index recording
//! which states read which keys.
//!
//! # Overview
//!
//! The graph has two kinds of edges:
//!
//! - Read edges, from a property key of a data source to the states that read
//!   it. These live in a [`DependencyIndex`] owned by the observable.
//! - Dependent edges, from one updatable state to the states that called it.
//!   These live on the state itself (see `reactive::state`).
//!
//! Each state keeps a [`Registration`] per data source listing every bucket
//! it sits in. Recomputing or disposing a state releases all of them, so an
//! index never holds entries for states that no longer depend on it.

mod index;

pub(crate) use index::{DependencyIndex, Registration};

use std::fmt;

/// Identifier of an updatable state.
///
/// Ids increase monotonically within a manager and double as a stable
/// ordering for debugging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
