//! Per-observable dependency index.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::StateId;
use crate::value::Key;

/// Maps property keys to the states currently depending on them.
///
/// Buckets are created on first registration and dropped as soon as they
/// become empty.
#[derive(Debug, Default)]
pub(crate) struct DependencyIndex {
    buckets: HashMap<Key, IndexSet<StateId>>,
}

impl DependencyIndex {
    /// Add `state` to the bucket for `key`. Returns false if it was already there.
    pub fn register(&mut self, key: &Key, state: StateId) -> bool {
        self.buckets.entry(key.clone()).or_default().insert(state)
    }

    pub fn unregister(&mut self, key: &Key, state: StateId) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.shift_remove(&state);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
    }

    /// States depending on `key`, in registration order.
    pub fn dependents(&self, key: &Key) -> Vec<StateId> {
        self.buckets
            .get(key)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every state depending on any key.
    pub fn all(&self) -> Vec<StateId> {
        let mut all = IndexSet::new();
        for bucket in self.buckets.values() {
            all.extend(bucket.iter().copied());
        }
        all.into_iter().collect()
    }

    pub fn subscriber_count(&self, key: &Key) -> usize {
        self.buckets.get(key).map_or(0, |bucket| bucket.len())
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

/// The buckets one state occupies in one index.
pub(crate) struct Registration {
    index: Weak<RefCell<DependencyIndex>>,
    keys: SmallVec<[Key; 4]>,
}

impl Registration {
    pub fn new(index: &Rc<RefCell<DependencyIndex>>) -> Self {
        Self {
            index: Rc::downgrade(index),
            keys: SmallVec::new(),
        }
    }

    /// Whether this record points at `index`.
    pub fn targets(&self, index: &Rc<RefCell<DependencyIndex>>) -> bool {
        std::ptr::eq(self.index.as_ptr(), Rc::as_ptr(index))
    }

    pub fn record(&mut self, key: Key) {
        self.keys.push(key);
    }

    /// Remove `state` from every recorded bucket. Safe to call after the
    /// index is gone, or while it is borrowed elsewhere.
    pub fn release(self, state: StateId) {
        let Some(index) = self.index.upgrade() else {
            return;
        };
        let Ok(mut index) = index.try_borrow_mut() else {
            tracing::trace!(%state, "dependency index busy; leaving registration in place");
            return;
        };
        for key in &self.keys {
            index.unregister(key, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_created_and_dropped() {
        let mut index = DependencyIndex::default();
        let a = StateId::new(1);
        let key = Key::from("x");

        assert!(index.register(&key, a));
        assert!(!index.register(&key, a));
        assert_eq!(index.subscriber_count(&key), 1);
        assert_eq!(index.key_count(), 1);

        index.unregister(&key, a);
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn all_deduplicates_across_keys() {
        let mut index = DependencyIndex::default();
        let a = StateId::new(1);
        let b = StateId::new(2);
        index.register(&Key::from("x"), a);
        index.register(&Key::from("y"), a);
        index.register(&Key::from("y"), b);

        let mut all = index.all();
        all.sort();
        assert_eq!(all, vec![a, b]);
    }

    #[test]
    fn registration_releases_every_key() {
        let index = Rc::new(RefCell::new(DependencyIndex::default()));
        let state = StateId::new(7);
        let mut registration = Registration::new(&index);

        for name in ["a", "b", "c"] {
            let key = Key::from(name);
            index.borrow_mut().register(&key, state);
            registration.record(key);
        }
        assert!(registration.targets(&index));
        assert_eq!(index.borrow().key_count(), 3);

        registration.release(state);
        assert_eq!(index.borrow().key_count(), 0);
    }

    #[test]
    fn release_after_index_dropped_is_silent() {
        let index = Rc::new(RefCell::new(DependencyIndex::default()));
        let mut registration = Registration::new(&index);
        registration.record(Key::from("a"));
        drop(index);
        registration.release(StateId::new(1));
    }
}
