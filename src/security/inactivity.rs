// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inactivity Timer
//!
//! Two staged deadlines measured from the last activity pulse:
//!
//! - `T_warn = last + timeout - window`: the warning opens and a 1 Hz
//!   countdown starts at the window in whole seconds (never below 1).
//! - `T_logout = last + timeout`: the session is terminated with
//!   [`TerminationReason::InactivityTimeout`].
//!
//! Both deadlines are scheduled tasks stored by handle. Every reset aborts
//! the previous handles before spawning new ones, so a timeline never has
//! two pending firings. The logout task is independent of the warning task:
//! dismissing the warning at the boundary cannot save a session whose hard
//! deadline has passed.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::activity::ActivitySink;
use super::locks::{resilient_read, resilient_write};
use super::SessionTerminator;
use crate::audit::{SecurityEvent, TerminationReason};
use crate::config::InactivityConfig;

/// What the warning overlay shows.
///
/// `warning_visible` is true exactly while `seconds_remaining > 0` inside an
/// open warning window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InactivityState {
    pub warning_visible: bool,
    pub seconds_remaining: u64,
}

impl InactivityState {
    const HIDDEN: Self = Self {
        warning_visible: false,
        seconds_remaining: 0,
    };
}

#[derive(Default)]
struct Timers {
    armed: bool,
    /// Bumped on every reset; a task whose generation is stale does nothing.
    generation: u64,
    /// Hard deadline of the current schedule.
    logout_at: Option<Instant>,
    warn: Option<JoinHandle<()>>,
    logout: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel(&mut self) {
        if let Some(handle) = self.warn.take() {
            handle.abort();
        }
        if let Some(handle) = self.logout.take() {
            handle.abort();
        }
    }
}

struct Inner<T> {
    terminator: Arc<T>,
    timeout: Option<Duration>,
    window: Duration,
    timers: RwLock<Timers>,
    state: watch::Sender<InactivityState>,
}

/// Inactivity deadlines for one authenticated session.
pub struct InactivityTimer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for InactivityTimer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SessionTerminator> InactivityTimer<T> {
    pub fn new(config: &InactivityConfig, terminator: Arc<T>) -> Self {
        let (state, _) = watch::channel(InactivityState::HIDDEN);
        Self {
            inner: Arc::new(Inner {
                terminator,
                timeout: config.effective_timeout(),
                window: config.warning_window(),
                timers: RwLock::new(Timers::default()),
                state,
            }),
        }
    }

    /// Whether the feature is switched on at all.
    pub fn is_enabled(&self) -> bool {
        self.inner.timeout.is_some()
    }

    pub fn is_armed(&self) -> bool {
        resilient_read(&self.inner.timers).armed
    }

    pub fn state(&self) -> InactivityState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InactivityState> {
        self.inner.state.subscribe()
    }

    /// Start tracking for a freshly authenticated session.
    ///
    /// Both deadlines are measured from now. Any timeline left over from a
    /// previous session is replaced, not merged.
    ///
    /// No-op when inactivity logout is disabled.
    ///
    /// # Session Termination
    ///
    /// Satisfies AC-12: once armed, the session ends at the hard deadline
    /// unless activity arrives first, whatever the warning overlay shows.
    pub fn arm(&self) {
        if self.inner.timeout.is_none() {
            tracing::debug!("inactivity logout disabled; timer not armed");
            return;
        }
        let mut timers = resilient_write(&self.inner.timers);
        timers.armed = true;
        Self::schedule(&self.inner, &mut timers, Instant::now());
    }

    /// Stop tracking. Cancels both deadlines synchronously.
    pub fn disarm(&self) {
        let mut timers = resilient_write(&self.inner.timers);
        timers.armed = false;
        timers.generation += 1;
        timers.logout_at = None;
        timers.cancel();
        drop(timers);
        self.hide_warning();
    }

    /// Cancel every pending deadline. Safe to call any number of times.
    pub fn clear_timers(&self) {
        self.disarm();
    }

    /// Restart both deadlines from `at`.
    ///
    /// Once the hard deadline has been reached the logout stands: activity
    /// or a dismissal arriving at or after it, but before the logout task
    /// has run, does not reschedule anything.
    pub fn record_activity(&self, at: Instant) {
        let mut timers = resilient_write(&self.inner.timers);
        if !timers.armed {
            return;
        }
        if timers
            .logout_at
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            tracing::debug!("activity at or after the inactivity deadline; logout stands");
            return;
        }
        Self::schedule(&self.inner, &mut timers, at);
    }

    /// "Stay signed in" from the warning overlay: full reset of both deadlines.
    pub fn stay_active(&self) {
        self.record_activity(Instant::now());
    }

    fn hide_warning(&self) {
        self.inner
            .state
            .send_if_modified(|s| std::mem::replace(s, InactivityState::HIDDEN) != InactivityState::HIDDEN);
    }

    fn schedule(inner: &Arc<Inner<T>>, timers: &mut Timers, at: Instant) {
        let Some(timeout) = inner.timeout else {
            return;
        };

        timers.cancel();
        timers.generation += 1;
        let generation = timers.generation;

        inner
            .state
            .send_if_modified(|s| std::mem::replace(s, InactivityState::HIDDEN) != InactivityState::HIDDEN);

        let logout_at = at + timeout;
        timers.logout_at = Some(logout_at);
        let window = inner.window;

        if !window.is_zero() {
            let task_inner = Arc::clone(inner);
            let warn_at = logout_at - window;
            timers.warn = Some(tokio::spawn(async move {
                tokio::time::sleep_until(warn_at).await;
                Self::run_countdown(task_inner, generation, window).await;
            }));
        }

        let task_inner = Arc::clone(inner);
        timers.logout = Some(tokio::spawn(async move {
            tokio::time::sleep_until(logout_at).await;
            Self::fire_logout(task_inner, generation).await;
        }));
    }

    async fn run_countdown(inner: Arc<Inner<T>>, generation: u64, window: Duration) {
        // Whole seconds, never more than the window itself.
        let mut seconds = window.as_secs().max(1);

        SecurityEvent::InactivityWarning {
            expires_in_secs: seconds,
        }
        .emit();

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while seconds > 0 {
            ticker.tick().await;
            if resilient_read(&inner.timers).generation != generation {
                return;
            }
            inner.state.send_replace(InactivityState {
                warning_visible: true,
                seconds_remaining: seconds,
            });
            seconds -= 1;
        }
    }

    async fn fire_logout(inner: Arc<Inner<T>>, generation: u64) {
        {
            let mut timers = resilient_write(&inner.timers);
            if !timers.armed || timers.generation != generation {
                return;
            }
            // Detach this task's own handle so a disarm racing with the
            // termination below cannot abort it halfway.
            timers.logout = None;
            if let Some(handle) = timers.warn.take() {
                handle.abort();
            }
            timers.armed = false;
            timers.generation += 1;
        }
        inner.state.send_replace(InactivityState::HIDDEN);

        tracing::info!("inactivity deadline reached; ending session");
        inner
            .terminator
            .terminate(TerminationReason::InactivityTimeout)
            .await;
    }
}

impl<T: SessionTerminator> ActivitySink for InactivityTimer<T> {
    fn pulse(&self, at: Instant) {
        self.record_activity(at);
    }
}
