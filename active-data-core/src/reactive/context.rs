//! Reactive Context
//!
//! The call stack tracks which updatable state is currently computing. This
//! enables automatic dependency tracking: when an observable property is read,
//! the state on top of the stack is registered as its dependent.
//!
//! # Implementation
//!
//! Each manager owns one stack. Entering a computation pushes its id and
//! returns a [`Frame`] guard that pops it again, so the stack stays balanced
//! even when a computation panics.
//!
//! Nested computations (a computed value reading another computed value)
//! simply push on top; the innermost state is the one that gets attributed.

use std::cell::RefCell;

use crate::graph::StateId;

/// LIFO stack of states currently computing.
#[derive(Debug, Default)]
pub(crate) struct CallStack {
    frames: RefCell<Vec<StateId>>,
}

impl CallStack {
    /// Push `state` for the lifetime of the returned guard.
    pub fn enter(&self, state: StateId) -> Frame<'_> {
        self.frames.borrow_mut().push(state);
        Frame { stack: self, state }
    }

    /// The state on top of the stack, if any.
    pub fn current(&self) -> Option<StateId> {
        self.frames.borrow().last().copied()
    }

    pub fn is_active(&self) -> bool {
        !self.frames.borrow().is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Run `f` with an empty stack, so nothing it reads is attributed.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = std::mem::take(&mut *self.frames.borrow_mut());
        let _restore = Restore { stack: self, saved };
        f()
    }
}

/// Guard that pops its frame when dropped.
pub(crate) struct Frame<'a> {
    stack: &'a CallStack,
    state: StateId,
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let popped = self.stack.frames.borrow_mut().pop();

        // A mismatch means a frame escaped its computation.
        debug_assert_eq!(
            popped,
            Some(self.state),
            "call stack mismatch: expected {:?}, got {:?}",
            self.state,
            popped
        );
    }
}

struct Restore<'a> {
    stack: &'a CallStack,
    saved: Vec<StateId>,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        *self.stack.frames.borrow_mut() = std::mem::take(&mut self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tracks_state() {
        let stack = CallStack::default();
        let id = StateId::new(1);

        assert!(!stack.is_active());
        assert!(stack.current().is_none());

        {
            let _frame = stack.enter(id);

            assert!(stack.is_active());
            assert_eq!(stack.current(), Some(id));
        }

        // Frame should be popped after drop
        assert!(!stack.is_active());
        assert!(stack.current().is_none());
    }

    #[test]
    fn nested_frames() {
        let stack = CallStack::default();
        let outer = StateId::new(1);
        let inner = StateId::new(2);

        {
            let _outer = stack.enter(outer);
            assert_eq!(stack.current(), Some(outer));

            {
                let _inner = stack.enter(inner);
                assert_eq!(stack.current(), Some(inner));
                assert_eq!(stack.depth(), 2);
            }

            // After inner frame drops, outer should be current
            assert_eq!(stack.current(), Some(outer));
        }

        assert!(stack.current().is_none());
    }

    #[test]
    fn untracked_hides_and_restores_frames() {
        let stack = CallStack::default();
        let _frame = stack.enter(StateId::new(3));

        let seen = stack.untracked(|| stack.current());
        assert_eq!(seen, None);
        assert_eq!(stack.current(), Some(StateId::new(3)));
    }

    #[test]
    fn frame_pops_during_unwind() {
        let stack = CallStack::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _frame = stack.enter(StateId::new(9));
            panic!("computation failed");
        }));

        assert!(result.is_err());
        assert!(!stack.is_active());
    }
}
