// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Activity Monitor
//!
//! Turns raw interaction events into throttled liveness pulses. At most one
//! pulse leaves per throttle window; events arriving inside the window are
//! coalesced into a single trailing pulse stamped with the *last* event's
//! time, so the inactivity deadline is always measured from the real last
//! interaction.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::locks::resilient_write;
use crate::config::ActivityConfig;

/// Kinds of user interaction that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Key,
    Scroll,
    Touch,
}

/// Receiver of liveness pulses.
pub trait ActivitySink: Send + Sync + 'static {
    fn pulse(&self, at: Instant);
}

#[derive(Default)]
struct Throttle {
    last_emit: Option<Instant>,
    pending: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
}

/// Debounces activity into pulses for an [`ActivitySink`].
pub struct ActivityMonitor<S> {
    sink: Arc<S>,
    window: Duration,
    throttle: Arc<RwLock<Throttle>>,
}

impl<S: ActivitySink> ActivityMonitor<S> {
    pub fn new(config: &ActivityConfig, sink: Arc<S>) -> Self {
        Self {
            sink,
            window: Duration::from_millis(config.throttle_ms),
            throttle: Arc::new(RwLock::new(Throttle::default())),
        }
    }

    /// Record an interaction happening now.
    pub fn observe(&self, kind: ActivityKind) {
        self.observe_at(kind, Instant::now());
    }

    /// Record an interaction that happened at `at`.
    pub fn observe_at(&self, kind: ActivityKind, at: Instant) {
        tracing::trace!(?kind, "activity");
        let mut throttle = resilient_write(&self.throttle);

        let due = match throttle.last_emit {
            None => true,
            Some(last) => at.saturating_duration_since(last) >= self.window,
        };

        if due {
            throttle.last_emit = Some(at);
            throttle.pending = None;
            if let Some(handle) = throttle.trailing.take() {
                handle.abort();
            }
            drop(throttle);
            self.sink.pulse(at);
            return;
        }

        throttle.pending = Some(at);
        if throttle.trailing.is_none() {
            let flush_at = throttle.last_emit.map_or(at, |last| last + self.window);
            let shared = Arc::clone(&self.throttle);
            let sink = Arc::clone(&self.sink);
            throttle.trailing = Some(tokio::spawn(async move {
                tokio::time::sleep_until(flush_at).await;
                let pending = {
                    let mut throttle = resilient_write(&shared);
                    throttle.trailing = None;
                    let pending = throttle.pending.take();
                    if pending.is_some() {
                        throttle.last_emit = Some(flush_at);
                    }
                    pending
                };
                if let Some(at) = pending {
                    sink.pulse(at);
                }
            }));
        }
    }

    /// Drop any trailing pulse not yet delivered.
    pub fn stop(&self) {
        let mut throttle = resilient_write(&self.throttle);
        throttle.pending = None;
        if let Some(handle) = throttle.trailing.take() {
            handle.abort();
        }
    }
}

impl<S> Drop for ActivityMonitor<S> {
    fn drop(&mut self) {
        if let Some(handle) = resilient_write(&self.throttle).trailing.take() {
            handle.abort();
        }
    }
}
