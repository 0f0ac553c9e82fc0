// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One console session: the session machine plus every component that
//! reacts to it.
//!
//! A watcher task follows the session snapshot. Becoming authenticated arms
//! the inactivity timer and starts the contract gate; losing the session
//! disarms the timer, stops the gate and drops the screen lock. An explicit
//! [`ConsoleSession::logout`] does the same teardown synchronously before
//! the session is cleared.

use anyhow::Result;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::activity::{ActivityKind, ActivityMonitor};
use super::contract_gate::ContractGate;
use super::inactivity::{InactivityState, InactivityTimer};
use super::lock_guard::{Clock, InputTarget, KeyChord, KeyDisposition, LockGuard, SystemClock};
use super::lock_store::{FileLockStore, LockStore, MemoryLockStore, TabId};
use super::locks::{resilient_read, resilient_write};
use super::route_policy::{decide, role_home, RouteDecision};
use super::session::{AuthSessionMachine, AuthState, NavigationEvent, Session, LOGIN_PATH};
use crate::api::{AuthApi, EntitlementApi};
use crate::config::ConsoleConfig;

type Timer<A> = InactivityTimer<AuthSessionMachine<A>>;

pub struct ConsoleSession<A, E> {
    machine: Arc<AuthSessionMachine<A>>,
    timer: Arc<Timer<A>>,
    activity: Arc<ActivityMonitor<Timer<A>>>,
    lock: Arc<LockGuard<A>>,
    gate: Arc<ContractGate<A, E>>,
    return_to: RwLock<Option<String>>,
    watcher: RwLock<Option<JoinHandle<()>>>,
}

impl<A: AuthApi, E: EntitlementApi> ConsoleSession<A, E> {
    /// Wire every component for one session. The configuration is
    /// validated first, so out-of-range values are clamped here too.
    pub fn new(
        mut config: ConsoleConfig,
        auth: Arc<A>,
        entitlements: Arc<E>,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        config.validate();
        let machine = Arc::new(AuthSessionMachine::new(auth));
        let timer = Arc::new(InactivityTimer::new(
            &config.inactivity_timeout,
            Arc::clone(&machine),
        ));
        let activity = Arc::new(ActivityMonitor::new(&config.activity, Arc::clone(&timer)));
        let lock = Arc::new(LockGuard::new(
            Arc::clone(&machine),
            store,
            clock,
            config.lockout,
        ));
        let gate = Arc::new(ContractGate::new(
            Arc::clone(&machine),
            entitlements,
            config.session.interval(),
        ));

        Self {
            machine,
            timer,
            activity,
            lock,
            gate,
            return_to: RwLock::new(None),
            watcher: RwLock::new(None),
        }
    }

    /// Session whose lock state lives only in memory.
    pub fn in_memory(config: ConsoleConfig, auth: Arc<A>, entitlements: Arc<E>) -> Self {
        Self::new(
            config,
            auth,
            entitlements,
            Arc::new(MemoryLockStore::default()),
            Arc::new(SystemClock),
        )
    }

    /// Session whose lock state survives a restart of the same tab.
    pub fn for_current_tab(config: ConsoleConfig, auth: Arc<A>, entitlements: Arc<E>) -> Result<Self> {
        let store = FileLockStore::for_tab(&TabId::current())?;
        tracing::debug!(path = ?store.path(), "lock state file");
        Ok(Self::new(
            config,
            auth,
            entitlements,
            Arc::new(store),
            Arc::new(SystemClock),
        ))
    }

    pub fn machine(&self) -> &Arc<AuthSessionMachine<A>> {
        &self.machine
    }

    pub fn lock_guard(&self) -> &Arc<LockGuard<A>> {
        &self.lock
    }

    pub fn gate(&self) -> &Arc<ContractGate<A, E>> {
        &self.gate
    }

    pub fn timer(&self) -> &Arc<Timer<A>> {
        &self.timer
    }

    pub fn session(&self) -> Session {
        self.machine.snapshot()
    }

    pub fn navigation(&self) -> broadcast::Receiver<NavigationEvent> {
        self.machine.navigation()
    }

    /// Restore persisted lock state, start following the session and run
    /// the start-up session check.
    pub async fn start(&self) -> AuthState {
        self.lock.restore();
        self.spawn_watcher();

        let state = self.machine.check_auth_status().await;
        if state == AuthState::Anonymous {
            // A persisted lock without a session has nothing to protect.
            self.lock.clear();
        }
        state
    }

    fn spawn_watcher(&self) {
        let mut sessions = self.machine.subscribe();
        let timer = Arc::clone(&self.timer);
        let activity = Arc::clone(&self.activity);
        let gate = Arc::clone(&self.gate);
        let lock = Arc::clone(&self.lock);

        let handle = tokio::spawn(async move {
            let mut current = sessions.borrow_and_update().user.as_ref().map(|u| u.id.clone());
            if current.is_some() {
                timer.arm();
                gate.start();
            }

            while sessions.changed().await.is_ok() {
                let next = sessions.borrow_and_update().user.as_ref().map(|u| u.id.clone());
                if next == current {
                    continue;
                }
                match (&current, &next) {
                    (_, Some(user)) => {
                        tracing::debug!(user = %user, "session established; arming timers");
                        timer.arm();
                        gate.start();
                    }
                    (Some(user), None) => {
                        tracing::debug!(user = %user, "session ended; tearing down timers");
                        timer.disarm();
                        activity.stop();
                        gate.stop();
                        lock.clear();
                    }
                    (None, None) => {}
                }
                current = next;
            }
        });

        if let Some(previous) = resilient_write(&self.watcher).replace(handle) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Decide a navigation for the current role, remembering where an
    /// anonymous user wanted to go.
    pub fn navigate(&self, path: &str) -> RouteDecision {
        let decision = decide(self.machine.current_role(), path);
        if let RouteDecision::Redirect {
            to,
            return_to: Some(original),
        } = &decision
        {
            if to == LOGIN_PATH {
                *resilient_write(&self.return_to) = Some(original.clone());
            }
        }
        decision
    }

    /// Where to go right after signing in: the remembered destination if
    /// the new role may enter it, the role home otherwise.
    pub fn post_login_destination(&self) -> String {
        let Some(role) = self.machine.current_role() else {
            return LOGIN_PATH.to_string();
        };
        let remembered = resilient_write(&self.return_to).take();
        match remembered {
            Some(path) if decide(Some(role), &path) == RouteDecision::Allow => path,
            _ => role_home(role).to_string(),
        }
    }

    pub fn pending_return_to(&self) -> Option<String> {
        resilient_read(&self.return_to).clone()
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    pub fn record_activity(&self, kind: ActivityKind) {
        self.activity.observe(kind);
    }

    /// Route a key press through the lock filter. Every press counts as
    /// activity.
    pub fn handle_key(&self, chord: KeyChord, target: InputTarget) -> KeyDisposition {
        self.activity.observe(ActivityKind::Key);
        self.lock.handle_key(chord, target)
    }

    pub fn stay_active(&self) {
        self.timer.stay_active();
    }

    /// Inactivity warning as it should be shown. Hidden while the screen
    /// lock is up; the deadlines keep running underneath.
    pub fn presented_inactivity(&self) -> InactivityState {
        if self.lock.is_locked() {
            InactivityState::default()
        } else {
            self.timer.state()
        }
    }

    pub fn subscribe_inactivity(&self) -> watch::Receiver<InactivityState> {
        self.timer.subscribe()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// User-initiated logout.
    pub async fn logout(&self) {
        self.timer.disarm();
        self.activity.stop();
        self.gate.stop();
        self.lock.clear();
        *resilient_write(&self.return_to) = None;
        self.machine.logout().await;
    }

    /// Stop every background task without touching the session or the
    /// persisted lock.
    pub fn shutdown(&self) {
        if let Some(handle) = resilient_write(&self.watcher).take() {
            handle.abort();
        }
        self.timer.disarm();
        self.activity.stop();
        self.gate.stop();
    }
}

impl<A, E> Drop for ConsoleSession<A, E> {
    fn drop(&mut self) {
        if let Some(handle) = resilient_write(&self.watcher).take() {
            handle.abort();
        }
    }
}
