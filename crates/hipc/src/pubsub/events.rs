// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Token-based event callback registry.
//!
//! The lock is released before user callbacks run, so a callback may
//! register or remove callbacks (including itself) without deadlocking.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Token returned by `add`, used for removal.
pub type EventToken = usize;

/// Registry of callbacks for one event type.
pub struct EventCallbacks<E> {
    callbacks: Mutex<HashMap<EventToken, Arc<dyn Fn(&E) + Send + Sync>>>,
    next_token: AtomicUsize,
}

impl<E> Default for EventCallbacks<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventCallbacks<E> {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
        }
    }

    pub fn add(&self, cb: Arc<dyn Fn(&E) + Send + Sync>) -> EventToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(token, cb);
        token
    }

    pub fn remove(&self, token: EventToken) {
        self.callbacks.lock().remove(&token);
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<_> = self.callbacks.lock().values().cloned().collect();
        for cb in snapshot {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notify_reaches_all_callbacks() {
        let events: EventCallbacks<u32> = EventCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            events.add(Arc::new(move |v: &u32| {
                hits.fetch_add(*v as usize, Ordering::SeqCst);
            }));
        }

        events.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn removed_callback_is_silent() {
        let events: EventCallbacks<u32> = EventCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = events.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        events.notify(&1);
        events.remove(token);
        events.notify(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_remove_itself() {
        let events: Arc<EventCallbacks<u32>> = Arc::new(EventCallbacks::new());
        let registry = Arc::clone(&events);
        let token = Arc::new(AtomicUsize::new(0));
        let token_cell = Arc::clone(&token);
        let t = events.add(Arc::new(move |_| {
            registry.remove(token_cell.load(Ordering::SeqCst));
        }));
        token.store(t, Ordering::SeqCst);

        events.notify(&1);
        events.notify(&1);
    }
}
