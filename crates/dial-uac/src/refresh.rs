// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registration auto-refresh policy and task handle.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Seconds subtracted from the server-granted expiry before re-registering.
pub const REFRESH_GUARD: Duration = Duration::from_secs(60);

/// Smallest interval the scheduler will wait between refreshes.
pub const REFRESH_FLOOR: Duration = Duration::from_secs(5);

/// Fallback interval after a transient refresh failure.
pub const FAILURE_RETRY: Duration = Duration::from_secs(30);

/// When the next refresh fires: `max(granted − guard, floor)`, unless the
/// application pinned an explicit interval.
pub fn next_refresh_delay(granted: Duration, interval_override: Option<Duration>) -> Duration {
    match interval_override {
        Some(interval) => interval.max(REFRESH_FLOOR),
        None => granted
            .saturating_sub(REFRESH_GUARD)
            .max(REFRESH_FLOOR),
    }
}

/// Handle to the running refresh task. Dropping or cancelling it guarantees
/// no further REGISTER fires from the scheduler.
pub(crate) struct RefreshHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub(crate) fn new(cancel: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            cancel: Some(cancel),
            task,
        }
    }

    /// Stops the scheduler synchronously: after this returns the task has
    /// been aborted and cannot issue another REGISTER.
    pub(crate) fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.task.abort();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.task.abort();
    }
}
