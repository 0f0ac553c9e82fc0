// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock Guard
//!
//! Manual screen lock for an authenticated session. Locking does not end the
//! session; it gates interaction until the account password is entered
//! again.
//!
//! ```text
//! Unlocked --lock()--> Locked
//! Locked --unlock ok--> Unlocked
//! Locked --unlock fail--> Locked (failed_attempts += 1)
//!        failed_attempts == max --> lockout_until = now + duration
//! lockout_until passed --> failed_attempts = 0, lockout_until = None
//! ```
//!
//! Verification goes through [`AuthSessionMachine::reauthenticate`], so the
//! same password policy applies as for the primary login. Transport
//! failures count as failed attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::lock_store::LockStore;
use super::locks::{resilient_read, resilient_write};
use super::session::{AuthSessionMachine, UnlockGrant};
use crate::api::AuthApi;
use crate::audit::SecurityEvent;
use crate::config::LockoutPolicy;
use crate::errors::{AuthError, UnlockError};

/// Source of wall-clock time for lockout deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock moved by hand, for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *resilient_write(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *resilient_read(&self.now)
    }
}

/// Screen-lock state. Persisted per tab.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockState {
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub lockout_until: Option<DateTime<Utc>>,
}

impl LockState {
    /// State used when a persisted file cannot be read.
    pub(crate) fn corrupt_fallback() -> Self {
        Self {
            locked: true,
            locked_at: Some(Utc::now()),
            failed_attempts: 0,
            lockout_until: None,
        }
    }

    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lockout_until, Some(until) if now < until)
    }

    /// Whole seconds until the lockout ends, rounded up.
    pub fn lockout_remaining_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let until = self.lockout_until?;
        let ms = (until - now).num_milliseconds();
        (ms > 0).then(|| ((ms + 999) / 1000) as u64)
    }

    /// Reset both counters together once the lockout deadline has passed.
    fn expire_lockout(&mut self, now: DateTime<Utc>) -> bool {
        match self.lockout_until {
            Some(until) if now >= until => {
                self.failed_attempts = 0;
                self.lockout_until = None;
                true
            }
            _ => false,
        }
    }
}

/// A key press as seen by the global input filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChord {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub key: char,
}

impl KeyChord {
    pub fn plain(key: char) -> Self {
        Self {
            ctrl: false,
            shift: false,
            alt: false,
            key,
        }
    }

    pub fn ctrl_shift(key: char) -> Self {
        Self {
            ctrl: true,
            shift: true,
            alt: false,
            key,
        }
    }

    /// Ctrl+Shift+L.
    pub fn is_lock_shortcut(&self) -> bool {
        self.ctrl && self.shift && !self.alt && self.key.eq_ignore_ascii_case(&'l')
    }
}

/// Where a key press is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputTarget {
    /// The password field of the unlock form.
    UnlockPassword,
    Other,
}

/// What the input layer must do with a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDisposition {
    Pass,
    Suppress,
    /// The press locked the screen and must not be forwarded.
    Lock,
}

/// Screen lock for the current session.
pub struct LockGuard<A> {
    machine: Arc<AuthSessionMachine<A>>,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    policy: LockoutPolicy,
    state: Arc<watch::Sender<LockState>>,
    verifying: Mutex<()>,
    lockout_timer: RwLock<Option<JoinHandle<()>>>,
}

impl<A: AuthApi> LockGuard<A> {
    pub fn new(
        machine: Arc<AuthSessionMachine<A>>,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        policy: LockoutPolicy,
    ) -> Self {
        let (state, _) = watch::channel(LockState::default());
        Self {
            machine,
            store,
            clock,
            policy,
            state: Arc::new(state),
            verifying: Mutex::new(()),
            lockout_timer: RwLock::new(None),
        }
    }

    pub fn state(&self) -> LockState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.subscribe()
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().locked
    }

    /// Seconds left in the current lockout, if any.
    pub fn lockout_remaining_secs(&self) -> Option<u64> {
        self.state.borrow().lockout_remaining_secs(self.clock.now())
    }

    /// Reload the persisted state for this tab.
    ///
    /// A load failure restores as locked.
    pub fn restore(&self) {
        let restored = match self.store.load() {
            Ok(Some(state)) => state,
            Ok(None) => LockState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load lock state; restoring as locked");
                LockState::corrupt_fallback()
            }
        };
        if restored.locked {
            tracing::info!("screen lock restored from previous run");
        }
        self.state.send_replace(restored);
    }

    /// Lock the screen. Idempotent while already locked.
    pub fn lock(&self) -> Result<(), UnlockError> {
        let user = self.machine.current_user().ok_or(UnlockError::NoSession)?;
        if self.is_locked() {
            return Ok(());
        }

        let next = LockState {
            locked: true,
            locked_at: Some(self.clock.now()),
            failed_attempts: 0,
            lockout_until: None,
        };
        self.persist(&next);
        self.state.send_replace(next);

        SecurityEvent::ScreenLocked { user_id: user.id }.emit();
        Ok(())
    }

    /// Try to unlock with the account password.
    ///
    /// Expired lockouts are reset before the attempt is judged. Only one
    /// verification runs at a time.
    ///
    /// # Arguments
    ///
    /// * `password` - The password typed into the unlock form
    ///
    /// # Errors
    ///
    /// * [`UnlockError::NoSession`] - nobody is signed in, or the session
    ///   ended while the password was being checked
    /// * [`UnlockError::NotLocked`] - the screen is not locked
    /// * [`UnlockError::LockedOut`] - the lockout deadline has not passed
    /// * [`UnlockError::InFlight`] - another attempt is still being verified
    /// * [`UnlockError::Rejected`] - wrong password or unreachable backend;
    ///   the attempt is counted and may start a lockout
    ///
    /// # Session Lock
    ///
    /// Satisfies AC-7 and AC-11: re-authentication uses the primary
    /// password policy and failures are rate limited.
    pub async fn unlock(&self, password: &str) -> Result<(), UnlockError> {
        let user = self.machine.current_user().ok_or(UnlockError::NoSession)?;
        let now = self.clock.now();

        self.expire_if_due(now);

        let current = self.state();
        if !current.locked {
            return Err(UnlockError::NotLocked);
        }
        if let Some(remaining_secs) = current.lockout_remaining_secs(now) {
            return Err(UnlockError::LockedOut { remaining_secs });
        }

        let _verifying = self.verifying.try_lock().map_err(|_| UnlockError::InFlight)?;

        match self
            .machine
            .reauthenticate(password, UnlockGrant::issue())
            .await
        {
            Ok(()) => {
                self.cancel_lockout_timer();
                self.state.send_replace(LockState::default());
                if let Err(e) = self.store.clear() {
                    tracing::warn!(error = %e, "failed to clear persisted lock state");
                }
                SecurityEvent::ScreenUnlocked { user_id: user.id }.emit();
                Ok(())
            }
            Err(AuthError::NotAuthenticated) => Err(UnlockError::NoSession),
            Err(e) => {
                tracing::debug!(error = %e, "unlock verification failed");
                // The session may have ended or the lock been dropped while
                // the password was in flight; nothing left to count against.
                let still_ours = self
                    .machine
                    .current_user()
                    .is_some_and(|current| current.id == user.id);
                if !still_ours || !self.is_locked() {
                    return Err(UnlockError::NoSession);
                }
                Err(self.record_failure(&user.id))
            }
        }
    }

    fn record_failure(&self, user_id: &str) -> UnlockError {
        let now = self.clock.now();
        let mut next = self.state();
        next.failed_attempts += 1;

        SecurityEvent::UnlockFailed {
            user_id: user_id.to_string(),
            failed_attempts: next.failed_attempts,
        }
        .emit();

        let error = if next.failed_attempts >= self.policy.max_attempts {
            let duration = self.policy.lockout_duration();
            next.lockout_until = Some(now + duration);
            SecurityEvent::LockoutStarted {
                user_id: user_id.to_string(),
                duration_secs: duration.num_seconds().max(0) as u64,
            }
            .emit();
            self.schedule_lockout_expiry(duration);
            UnlockError::LockedOut {
                remaining_secs: next.lockout_remaining_secs(now).unwrap_or(0),
            }
        } else {
            UnlockError::Rejected {
                attempts_remaining: self.policy.max_attempts - next.failed_attempts,
            }
        };

        self.persist(&next);
        self.state.send_replace(next);
        error
    }

    fn expire_if_due(&self, now: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        self.state.send_if_modified(|s| {
            let expired = s.expire_lockout(now);
            if expired {
                tracing::info!("unlock lockout expired; attempts reset");
                if let Err(e) = store.save(s) {
                    tracing::warn!(error = %e, "failed to persist lock state");
                }
            }
            expired
        });
    }

    fn schedule_lockout_expiry(&self, duration: chrono::Duration) {
        let Ok(wait) = duration.to_std() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let now = clock.now();
            state.send_if_modified(|s| {
                let expired = s.expire_lockout(now);
                if expired {
                    tracing::info!("unlock lockout expired; attempts reset");
                    if let Err(e) = store.save(s) {
                        tracing::warn!(error = %e, "failed to persist lock state");
                    }
                }
                expired
            });
        });

        if let Some(previous) = resilient_write(&self.lockout_timer).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_lockout_timer(&self) {
        if let Some(handle) = resilient_write(&self.lockout_timer).take() {
            handle.abort();
        }
    }

    /// Drop all lock state. Called when the session ends.
    pub fn clear(&self) {
        self.cancel_lockout_timer();
        self.state
            .send_if_modified(|s| std::mem::take(s) != LockState::default());
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear persisted lock state");
        }
    }

    /// Global key filter.
    ///
    /// While locked only keys aimed at the unlock password field get through.
    /// While unlocked, Ctrl+Shift+L locks the screen.
    pub fn handle_key(&self, chord: KeyChord, target: InputTarget) -> KeyDisposition {
        if self.is_locked() {
            return match target {
                InputTarget::UnlockPassword => KeyDisposition::Pass,
                InputTarget::Other => KeyDisposition::Suppress,
            };
        }
        if chord.is_lock_shortcut() && self.lock().is_ok() {
            return KeyDisposition::Lock;
        }
        KeyDisposition::Pass
    }

    fn persist(&self, state: &LockState) {
        if let Err(e) = self.store.save(state) {
            tracing::warn!(error = %e, "failed to persist lock state");
        }
    }
}

impl<A> Drop for LockGuard<A> {
    fn drop(&mut self) {
        if let Some(handle) = resilient_write(&self.lockout_timer).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TerminationReason;
    use crate::errors::ApiError;
    use crate::security::lock_store::MemoryLockStore;
    use std::time::Duration;
    use crate::security::testing::{clinic_user, established, ScriptedAuthApi};
    use crate::types::Credentials;

    struct Fixture {
        api: Arc<ScriptedAuthApi>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryLockStore>,
        guard: LockGuard<ScriptedAuthApi>,
    }

    async fn signed_in() -> Fixture {
        signed_in_with(ScriptedAuthApi::default()).await
    }

    async fn signed_in_with(api: ScriptedAuthApi) -> Fixture {
        let api = Arc::new(api);
        api.push_step(Ok(established(clinic_user())));
        let machine = Arc::new(AuthSessionMachine::new(api.clone()));
        machine
            .login(&Credentials::new("clinic@example.org", "pw"))
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryLockStore::default());
        let guard = LockGuard::new(
            machine,
            store.clone(),
            clock.clone(),
            LockoutPolicy::default(),
        );
        Fixture {
            api,
            clock,
            store,
            guard,
        }
    }

    fn wrong_password(api: &ScriptedAuthApi) {
        api.push_step(Err(ApiError::Rejected {
            message: "Invalid password".into(),
            attempts_remaining: None,
        }));
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let f = signed_in().await;
        f.guard.lock().unwrap();
        assert!(f.guard.is_locked());
        assert!(f.store.load().unwrap().unwrap().locked);

        f.api.push_step(Ok(established(clinic_user())));
        f.guard.unlock("pw").await.unwrap();
        assert!(!f.guard.is_locked());
        assert!(f.store.load().unwrap().is_none());
        assert!(f.api.calls().contains(&"login(unlock=true)".to_string()));
    }

    #[tokio::test]
    async fn test_unlock_when_not_locked() {
        let f = signed_in().await;
        assert_eq!(f.guard.unlock("pw").await, Err(UnlockError::NotLocked));
    }

    #[tokio::test]
    async fn test_failures_count_down_then_lock_out() {
        let f = signed_in().await;
        f.guard.lock().unwrap();

        wrong_password(&f.api);
        assert_eq!(
            f.guard.unlock("x").await,
            Err(UnlockError::Rejected { attempts_remaining: 2 })
        );
        wrong_password(&f.api);
        assert_eq!(
            f.guard.unlock("x").await,
            Err(UnlockError::Rejected { attempts_remaining: 1 })
        );
        wrong_password(&f.api);
        assert_eq!(
            f.guard.unlock("x").await,
            Err(UnlockError::LockedOut { remaining_secs: 30 })
        );

        // Fourth attempt inside the window never reaches the backend.
        let calls_before = f.api.calls().len();
        f.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(
            f.guard.unlock("pw").await,
            Err(UnlockError::LockedOut { remaining_secs: 20 })
        );
        assert_eq!(f.api.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_lockout_expiry_resets_counters() {
        let f = signed_in().await;
        f.guard.lock().unwrap();
        for _ in 0..3 {
            wrong_password(&f.api);
            let _ = f.guard.unlock("x").await;
        }
        assert!(f.guard.state().lockout_until.is_some());

        f.clock.advance(chrono::Duration::seconds(30));
        f.api.push_step(Ok(established(clinic_user())));
        f.guard.unlock("pw").await.unwrap();

        let state = f.guard.state();
        assert_eq!(state.failed_attempts, 0);
        assert_eq!(state.lockout_until, None);
    }

    #[tokio::test]
    async fn test_attempt_after_expiry_starts_fresh_count() {
        let f = signed_in().await;
        f.guard.lock().unwrap();
        for _ in 0..3 {
            wrong_password(&f.api);
            let _ = f.guard.unlock("x").await;
        }
        f.clock.advance(chrono::Duration::seconds(31));

        wrong_password(&f.api);
        assert_eq!(
            f.guard.unlock("x").await,
            Err(UnlockError::Rejected { attempts_remaining: 2 })
        );
    }

    #[tokio::test]
    async fn test_transport_failure_counts_as_failed_attempt() {
        let f = signed_in().await;
        f.guard.lock().unwrap();
        f.api.push_step(Err(ApiError::Transport("unreachable".into())));
        assert_eq!(
            f.guard.unlock("pw").await,
            Err(UnlockError::Rejected { attempts_remaining: 2 })
        );
        assert!(f.guard.is_locked());
    }

    #[tokio::test]
    async fn test_key_filter_while_locked() {
        let f = signed_in().await;
        assert_eq!(
            f.guard.handle_key(KeyChord::ctrl_shift('L'), InputTarget::Other),
            KeyDisposition::Lock
        );
        assert!(f.guard.is_locked());

        assert_eq!(
            f.guard.handle_key(KeyChord::plain('a'), InputTarget::Other),
            KeyDisposition::Suppress
        );
        assert_eq!(
            f.guard.handle_key(KeyChord::plain('a'), InputTarget::UnlockPassword),
            KeyDisposition::Pass
        );
    }

    #[tokio::test]
    async fn test_restore_picks_up_persisted_lock() {
        let f = signed_in().await;
        f.store
            .save(&LockState {
                locked: true,
                locked_at: Some(Utc::now()),
                failed_attempts: 1,
                lockout_until: None,
            })
            .unwrap();
        f.guard.restore();
        assert!(f.guard.is_locked());
        assert_eq!(f.guard.state().failed_attempts, 1);
    }

    #[tokio::test]
    async fn test_clear_drops_lock() {
        let f = signed_in().await;
        f.guard.lock().unwrap();
        f.guard.clear();
        assert!(!f.guard.is_locked());
        assert!(f.store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_after_forced_logout_is_not_counted() {
        let f = signed_in_with(ScriptedAuthApi::default().with_delay(Duration::from_millis(500)))
            .await;
        f.guard.lock().unwrap();
        wrong_password(&f.api);

        let logout = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.guard
                .machine
                .force_logout(TerminationReason::InactivityTimeout)
                .await;
        };
        let (result, ()) = tokio::join!(f.guard.unlock("wrong"), logout);

        assert!(matches!(result, Err(UnlockError::NoSession)));
        assert_eq!(f.guard.state().failed_attempts, 0);
        assert_eq!(f.store.load().unwrap().unwrap().failed_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_after_lock_cleared_leaves_nothing_persisted() {
        let f = signed_in_with(ScriptedAuthApi::default().with_delay(Duration::from_millis(500)))
            .await;
        f.guard.lock().unwrap();
        wrong_password(&f.api);

        let teardown = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.guard
                .machine
                .force_logout(TerminationReason::Deactivated)
                .await;
            f.guard.clear();
        };
        let (result, ()) = tokio::join!(f.guard.unlock("wrong"), teardown);

        assert!(matches!(result, Err(UnlockError::NoSession)));
        assert_eq!(f.guard.state(), LockState::default());
        assert!(f.store.load().unwrap().is_none());
    }

    #[test]
    fn test_remaining_secs_rounds_up() {
        let now = Utc::now();
        let state = LockState {
            lockout_until: Some(now + chrono::Duration::milliseconds(1_200)),
            ..Default::default()
        };
        assert_eq!(state.lockout_remaining_secs(now), Some(2));
        assert!(state.is_locked_out(now));
    }
}
