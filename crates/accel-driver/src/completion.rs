// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Completion events for in-flight kernel calls.
//!
//! A [`Completion`] is handed out at enqueue time and signalled exactly
//! once by the queue worker. Waiting is cheap (condvar, no spinning) and
//! any number of clones may wait on the same event.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

struct CompletionState {
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    complete: bool,
    callbacks: Vec<Callback>,
}

/// One kernel call's completion event.
#[derive(Clone)]
pub struct Completion {
    state: Arc<CompletionState>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(CompletionState {
                inner: Mutex::new(Inner {
                    complete: false,
                    callbacks: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Blocks until the call has finished on the device.
    pub fn wait(&self) {
        let mut inner = self.state.inner.lock();
        while !inner.complete {
            self.state.cv.wait(&mut inner);
        }
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        self.state.inner.lock().complete
    }

    /// Runs `f` once the call completes. Runs immediately when the call
    /// has already finished.
    pub fn on_complete(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut inner = self.state.inner.lock();
            if inner.complete {
                true
            } else {
                inner.callbacks.push(Box::new(f));
                return;
            }
        };
        if run_now {
            f();
        }
    }

    /// Runs the registered callbacks, then marks the call complete and
    /// wakes every waiter. A waiter never observes completion before
    /// the call's callbacks have run. Callbacks run on the signalling
    /// thread, outside the lock.
    pub(crate) fn signal(&self) {
        loop {
            let callbacks = {
                let mut inner = self.state.inner.lock();
                if inner.callbacks.is_empty() {
                    inner.complete = true;
                    break;
                }
                std::mem::take(&mut inner.callbacks)
            };
            for cb in callbacks {
                cb();
            }
        }
        self.state.cv.notify_all();
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_blocks_until_signal() {
        let completion = Completion::new();
        let remote = completion.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.signal();
        });

        assert!(!completion.is_complete());
        completion.wait();
        assert!(completion.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_callback_before_signal() {
        let completion = Completion::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        completion.on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        completion.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_observes_callbacks() {
        let completion = Completion::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        completion.on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let waiter = {
            let c = completion.clone();
            let h = hits.clone();
            std::thread::spawn(move || {
                c.wait();
                h.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(5));
        completion.signal();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_callback_after_signal_runs_immediately() {
        let completion = Completion::new();
        completion.signal();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        completion.on_complete(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_waiters() {
        let completion = Completion::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = completion.clone();
            handles.push(std::thread::spawn(move || c.wait()));
        }
        completion.signal();
        for h in handles {
            h.join().unwrap();
        }
    }
}
