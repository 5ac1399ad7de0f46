//! Manually reset signal with timed and multi-handle waits.
//!
//! A [`WaitHandle`] stays signaled after [`WaitHandle::set`] until
//! [`WaitHandle::reset`] is called. Each wait subscribes its own receiver, so
//! any number of tasks may wait on the same handle at once, including several
//! concurrent [`WaitHandle::wait_any`] calls that share handles.
//!
//! A waiter that is woken by `set()` re-reads the state before returning. If
//! another task calls `set()` then `reset()` back to back, the waiter may not
//! observe the signal at all; a woken return means "check state", not "the
//! handle is still set".

use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::watch;

/// Manually reset binary signal.
#[derive(Debug)]
pub struct WaitHandle {
    tx: watch::Sender<bool>,
}

impl WaitHandle {
    /// Create a handle in the unset state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal the handle and wake every current waiter.
    pub fn set(&self) {
        self.tx.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        });
    }

    /// Clear the handle.
    pub fn reset(&self) {
        self.tx.send_if_modified(|set| {
            if *set {
                *set = false;
                true
            } else {
                false
            }
        });
    }

    /// Whether the handle is currently signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the handle is signaled.
    ///
    /// `None` waits forever, `Some(Duration::ZERO)` only checks the current
    /// state. Returns whether the handle was signaled.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        Self::wait_any(&[self], timeout).await.is_some()
    }

    /// Wait until at least one of `handles` is signaled.
    ///
    /// Returns the index of the signaled handle, preferring the lowest index
    /// when several are set, or `None` on timeout. Timeout semantics match
    /// [`WaitHandle::wait`]. An empty slice never signals.
    pub async fn wait_any(handles: &[&WaitHandle], timeout: Option<Duration>) -> Option<usize> {
        if handles.is_empty() {
            return None;
        }

        let mut receivers: Vec<watch::Receiver<bool>> =
            handles.iter().map(|h| h.tx.subscribe()).collect();

        if let Some(index) = first_set(handles) {
            return Some(index);
        }
        if timeout == Some(Duration::ZERO) {
            return None;
        }

        let waits = receivers.iter_mut().enumerate().map(|(index, rx)| {
            Box::pin(async move {
                // The sender outlives the borrow of its handle, so this only
                // returns once the value is observed as set.
                let _ = rx.wait_for(|set| *set).await;
                index
            })
        });
        let any = select_all(waits);

        let woken = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, any).await.ok()?.0,
            None => any.await.0,
        };

        Some(first_set(handles).unwrap_or(woken))
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn first_set(handles: &[&WaitHandle]) -> Option<usize> {
    handles.iter().position(|h| h.is_set())
}
