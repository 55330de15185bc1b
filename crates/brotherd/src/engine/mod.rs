// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Cooperative task plumbing.
//!
//! Every long-lived component (the device handler, one data channel per
//! device) runs on its own OS thread and owns its state outright. Peers talk
//! to it through a [`Mailbox`]: a bounded FIFO command queue paired with a
//! binary wake semaphore. The owning thread drains pending commands at the
//! top of each loop iteration and parks on the semaphore while it has
//! nothing to do, so a command posted from outside is always observed before
//! the next protocol step runs.

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Command slots per task. Commands are tiny and consumed every loop
/// iteration; a full queue means the task thread is wedged.
const MAILBOX_CAPACITY: usize = 32;

/// Binary semaphore parking a paused task.
///
/// A post that lands before the wait sticks in the flag, so a kick racing
/// ahead of the pause is never lost. Posts coalesce; one wait consumes them
/// all.
#[derive(Default)]
struct Wake {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wake {
    fn post(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Park until posted or `timeout` elapses; consumes the flag. `true`
    /// when a post was seen.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

/// Sending half handed to other tasks.
pub struct Post<T> {
    tx: Sender<T>,
    wake: Arc<Wake>,
}

// Derived Clone would require T: Clone.
impl<T> Clone for Post<T> {
    fn clone(&self) -> Self {
        Post {
            tx: self.tx.clone(),
            wake: Arc::clone(&self.wake),
        }
    }
}

impl<T> Post<T> {
    /// Enqueue a command and wake the owning task. Fails only when the task
    /// is gone or its queue has backed up.
    pub fn send(&self, cmd: T) -> Result<(), T> {
        match self.tx.try_send(cmd) {
            Ok(()) => {
                self.wake.post();
                Ok(())
            }
            Err(TrySendError::Full(cmd)) | Err(TrySendError::Disconnected(cmd)) => Err(cmd),
        }
    }
}

/// Receiving half owned by the task thread.
pub struct Mailbox<T> {
    rx: Receiver<T>,
    wake: Arc<Wake>,
}

impl<T> Mailbox<T> {
    /// Pop one pending command, if any.
    pub fn take(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Park until a command is posted or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !self.rx.is_empty() {
            return true;
        }
        self.wake.wait_timeout(timeout)
    }
}

/// Create a connected command queue pair.
pub fn mailbox<T>() -> (Post<T>, Mailbox<T>) {
    let (tx, rx) = bounded(MAILBOX_CAPACITY);
    let wake = Arc::new(Wake::default());
    (
        Post {
            tx,
            wake: Arc::clone(&wake),
        },
        Mailbox { rx, wake },
    )
}
