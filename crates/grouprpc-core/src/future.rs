//! Single-assignment completion cell for RPC replies.
//!
//! A [`FutureMessage`] is created pending when a request is sent and is
//! resolved exactly once by the delivery loop, either with the reply
//! [`Message`] or with a [`Fault`]. Callers can await it, block on it from a
//! plain thread, poll it, or attach callbacks.
//!
//! # Callback ordering
//!
//! Callbacks run in registration order, each exactly once, and never before
//! the future resolves. At any time at most one context drains the callback
//! queue, so a callback registered while another context is still running
//! earlier callbacks is queued behind them instead of overtaking them.

use crate::error::{Fault, Result, RpcError};
use crate::message::Message;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::error;

/// Observable state of a [`FutureMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Completed,
    Failed,
}

type Callback = Box<dyn FnOnce(&FutureMessage) + Send + 'static>;

enum Outcome {
    Completed(Message),
    Failed(Fault),
}

impl Outcome {
    fn state(&self) -> FutureState {
        match self {
            Outcome::Completed(_) => FutureState::Completed,
            Outcome::Failed(_) => FutureState::Failed,
        }
    }

    fn to_result(&self) -> Result<Message> {
        match self {
            Outcome::Completed(message) => Ok(message.clone()),
            Outcome::Failed(fault) => Err(RpcError::Fault(fault.clone())),
        }
    }
}

struct Slot {
    outcome: Option<Outcome>,
    callbacks: VecDeque<Callback>,
    /// Set while some context is draining `callbacks`.
    draining: bool,
}

struct Inner {
    slot: Mutex<Slot>,
    /// Wakes `wait_blocking` callers.
    resolved: Condvar,
    /// Wakes `wait` callers.
    notify: Notify,
}

/// Handle to the eventual reply of one RPC.
///
/// Cloning is cheap; all clones share the same cell.
#[derive(Clone)]
pub struct FutureMessage {
    inner: Arc<Inner>,
}

impl Default for FutureMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FutureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureMessage")
            .field("state", &self.state())
            .finish()
    }
}

impl FutureMessage {
    /// Create a pending future.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    callbacks: VecDeque::new(),
                    draining: false,
                }),
                resolved: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // Callbacks run outside the lock, so a poisoned slot still holds
        // consistent data.
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> FutureState {
        self.slot()
            .outcome
            .as_ref()
            .map_or(FutureState::Pending, Outcome::state)
    }

    pub fn is_completed(&self) -> bool {
        self.state() == FutureState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == FutureState::Failed
    }

    /// Reply message if the future completed successfully, without blocking.
    ///
    /// Returns `None` both while pending and after a failure; use
    /// [`error`](Self::error) to tell the two apart.
    pub fn get(&self) -> Option<Message> {
        match &self.slot().outcome {
            Some(Outcome::Completed(message)) => Some(message.clone()),
            _ => None,
        }
    }

    /// Fault if the future failed, without blocking.
    pub fn error(&self) -> Option<Fault> {
        match &self.slot().outcome {
            Some(Outcome::Failed(fault)) => Some(fault.clone()),
            _ => None,
        }
    }

    fn try_result(&self) -> Option<Result<Message>> {
        self.slot().outcome.as_ref().map(Outcome::to_result)
    }

    /// Wait until the future resolves.
    ///
    /// Any number of tasks may wait concurrently; all observe the same
    /// outcome. A failure is returned as [`RpcError::Fault`].
    pub async fn wait(&self) -> Result<Message> {
        loop {
            // Registered before the check so a concurrent resolve cannot slip
            // between the check and the await.
            let notified = self.inner.notify.notified();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Blocking counterpart of [`wait`](Self::wait) for plain OS threads.
    ///
    /// Must not be called from inside an async task: it parks the thread.
    pub fn wait_blocking(&self) -> Result<Message> {
        let mut slot = self.slot();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.to_result();
            }
            slot = self
                .inner
                .resolved
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Register `callback` to run with this future once it has resolved.
    ///
    /// If the future has already resolved the callback runs right away on the
    /// calling thread, unless another context is still running earlier
    /// callbacks, in which case that context runs it next. Returns `self` so
    /// registrations can be chained.
    pub fn add_callback<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&FutureMessage) + Send + 'static,
    {
        let resolved = {
            let mut slot = self.slot();
            slot.callbacks.push_back(Box::new(callback));
            slot.outcome.is_some()
        };
        if resolved {
            self.run_callbacks();
        }
        self
    }

    /// Alias of [`add_callback`](Self::add_callback).
    pub fn then<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&FutureMessage) + Send + 'static,
    {
        self.add_callback(callback)
    }

    /// Resolve with a reply. Fails if the future already resolved.
    pub fn set_result(&self, message: Message) -> Result<()> {
        self.resolve(Outcome::Completed(message))
    }

    /// Resolve with a fault. Fails if the future already resolved.
    pub fn set_error(&self, fault: Fault) -> Result<()> {
        self.resolve(Outcome::Failed(fault))
    }

    fn resolve(&self, outcome: Outcome) -> Result<()> {
        {
            let mut slot = self.slot();
            if let Some(existing) = &slot.outcome {
                return Err(RpcError::AlreadyCompleted {
                    state: existing.state(),
                });
            }
            slot.outcome = Some(outcome);
        }
        self.inner.resolved.notify_all();
        self.inner.notify.notify_waiters();
        self.run_callbacks();
        Ok(())
    }

    fn run_callbacks(&self) {
        {
            let mut slot = self.slot();
            if slot.draining || slot.callbacks.is_empty() {
                return;
            }
            slot.draining = true;
        }

        loop {
            let next = {
                let mut slot = self.slot();
                match slot.callbacks.pop_front() {
                    Some(callback) => callback,
                    None => {
                        slot.draining = false;
                        return;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(|| next(self))).is_err() {
                error!("FutureMessage callback panicked; continuing with the remaining callbacks");
            }
        }
    }
}
