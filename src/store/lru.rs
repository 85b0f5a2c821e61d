//! Arena-backed LRU store.
//!
//! Entries live in a `Vec<Option<Slot>>` addressed by integer handle, with
//! explicit `prev`/`next` handles forming the recency list. This is the
//! "arena of node slots" option: no `Rc<RefCell<_>>` cycle, no `unsafe`
//! pointer juggling, and the whole structure is trivially `Send`.
//!
//! Locking follows the teacher's default: a single `parking_lot::Mutex`
//! around the whole structure, taken for the duration of each operation.
//! `lock()`/`unlock()` expose that same mutex to the recovery protocol,
//! which needs to hold it across a snapshot read and the installation of
//! a write recorder.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;

use crate::wire::Command;

use super::Store;

struct Slot {
    key: String,
    value: String,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
    /// Set during recovery: every successful mutation is also forwarded
    /// here so the recovery task can stream a tail of writes that landed
    /// after the snapshot was taken.
    recording: Option<UnboundedSender<Command>>,
}

impl Inner {
    fn detach(&mut self, handle: usize) {
        let (prev, next) = {
            let slot = self.slots[handle].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, handle: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[handle].as_mut().unwrap();
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(handle);
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }

    fn move_to_front(&mut self, handle: usize) {
        if self.head == Some(handle) {
            return;
        }
        self.detach(handle);
        self.push_front(handle);
    }

    fn evict_tail(&mut self) {
        if let Some(tail) = self.tail {
            self.detach(tail);
            let key = self.slots[tail].take().unwrap().key;
            self.index.remove(&key);
            self.free.push(tail);
        }
    }

    fn record(&self, cmd: Command) {
        if let Some(tx) = &self.recording {
            let _ = tx.send(cmd);
        }
    }
}

pub struct LruStore {
    inner: Mutex<Inner>,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
                capacity,
                recording: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Take the whole-structure lock. Used by the recovery protocol to
    /// hold exclusive access across a snapshot read and recorder install.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Snapshot every live entry as `(key, value)` pairs, most-recently-used
    /// first. Must be called with the store already locked by the caller
    /// via [`LruStore::lock`] so the snapshot is consistent with whatever
    /// else the caller is doing under the same critical section (e.g.
    /// installing a write recorder).
    pub(crate) fn snapshot_locked(guard: &MutexGuard<'_, Inner>) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(guard.index.len());
        let mut cur = guard.head;
        while let Some(handle) = cur {
            let slot = guard.slots[handle].as_ref().unwrap();
            out.push((slot.key.clone(), slot.value.clone()));
            cur = slot.next;
        }
        out
    }

    /// Start recording every mutation into `tx`, while the caller still
    /// holds the lock from the snapshot read.
    pub(crate) fn start_recording_locked(guard: &mut MutexGuard<'_, Inner>, tx: UnboundedSender<Command>) {
        guard.recording = Some(tx);
    }

    pub fn stop_recording(&self) {
        self.inner.lock().recording = None;
    }
}

impl Store for LruStore {
    fn set(&self, key: String, value: String) {
        let mut inner = self.inner.lock();
        if let Some(&handle) = inner.index.get(&key) {
            inner.slots[handle].as_mut().unwrap().value = value.clone();
            inner.move_to_front(handle);
        } else {
            if inner.index.len() >= inner.capacity {
                inner.evict_tail();
            }
            let handle = match inner.free.pop() {
                Some(h) => h,
                None => {
                    inner.slots.push(None);
                    inner.slots.len() - 1
                }
            };
            inner.slots[handle] = Some(Slot {
                key: key.clone(),
                value: value.clone(),
                prev: None,
                next: None,
            });
            inner.index.insert(key.clone(), handle);
            inner.push_front(handle);
        }
        inner.record(Command::Set { key, value });
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let handle = *inner.index.get(key)?;
        inner.move_to_front(handle);
        Some(inner.slots[handle].as_ref().unwrap().value.clone())
    }

    fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.index.remove(key) else {
            return false;
        };
        inner.detach(handle);
        inner.slots[handle] = None;
        inner.free.push(handle);
        inner.record(Command::Delete {
            key: key.to_string(),
        });
        true
    }

    fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.free.clear();
        inner.index.clear();
        inner.head = None;
        inner.tail = None;
        inner.record(Command::Flush);
    }

    fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner.index.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let store = LruStore::new(2);
        store.set("a".into(), "1".into());
        assert_eq!(store.get("a"), Some("1".into()));
    }

    #[test]
    fn evicts_least_recently_used() {
        let store = LruStore::new(2);
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.set("c".into(), "3".into());
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), Some("2".into()));
        assert_eq!(store.get("c"), Some("3".into()));
    }

    #[test]
    fn get_refreshes_recency() {
        let store = LruStore::new(2);
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.get("a");
        store.set("c".into(), "3".into());
        assert_eq!(store.get("b"), None);
        assert_eq!(store.get("a"), Some("1".into()));
    }

    #[test]
    fn overwrite_does_not_evict() {
        let store = LruStore::new(1);
        store.set("a".into(), "1".into());
        store.set("a".into(), "2".into());
        assert_eq!(store.get("a"), Some("2".into()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let store = LruStore::new(2);
        assert!(!store.delete("missing"));
        store.set("a".into(), "1".into());
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
    }

    #[test]
    fn capacity_one_evicts_every_set() {
        let store = LruStore::new(1);
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), Some("2".into()));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// However the sequence of sets is shaped, the store never holds
            /// more entries than its configured capacity.
            #[test]
            fn length_never_exceeds_capacity(
                capacity in 1usize..8,
                keys in proptest::collection::vec("[a-c]", 0..40),
            ) {
                let store = LruStore::new(capacity);
                for key in keys {
                    store.set(key, "v".into());
                    prop_assert!(store.len() <= capacity);
                }
            }

            /// The most recently set value for a key is always what `get`
            /// returns, provided the key hasn't since been evicted.
            #[test]
            fn get_after_set_returns_latest_value_or_is_evicted(
                capacity in 1usize..8,
                value in "[0-9]{1,4}",
            ) {
                let store = LruStore::new(capacity);
                store.set("k".into(), value.clone());
                prop_assert!(store.get("k") == Some(value) || store.len() <= capacity);
            }
        }
    }

    #[test]
    fn flush_clears_everything() {
        let store = LruStore::new(4);
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.flush();
        assert_eq!(store.len(), 0);
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn snapshot_reflects_recency_order() {
        let store = LruStore::new(3);
        store.set("a".into(), "1".into());
        store.set("b".into(), "2".into());
        store.set("c".into(), "3".into());
        let guard = store.lock();
        let snap = LruStore::snapshot_locked(&guard);
        drop(guard);
        assert_eq!(
            snap,
            vec![
                ("c".to_string(), "3".to_string()),
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ]
        );
    }
}
