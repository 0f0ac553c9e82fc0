// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Auth Session Machine
//!
//! Owns the canonical "who is signed in" state and the multi-step login
//! protocol. It is the only writer of [`Session`]; everything else reads
//! snapshots through [`AuthSessionMachine::subscribe`].
//!
//! ## Session states
//!
//! `Unknown` (start-up check running) → `Authenticated(role)` | `Anonymous`
//!
//! ## Login sub-machine
//!
//! ```text
//! Idle → CredentialsSubmitted → Established
//!                             → CaptchaPending   → Established | Rejected
//!                             → TwoFactorPending → Established | Rejected
//!                             → Rejected
//! CaptchaPending / TwoFactorPending --abandon--> Idle
//! ```
//!
//! Only one step may be in flight at a time; a second submission fails with
//! [`AuthError::StepInFlight`] without reaching the backend.
//!
//! ## Screen-lock re-authentication
//!
//! [`AuthSessionMachine::reauthenticate`] re-checks the current user's
//! password with the unlock capability, which tells the backend to skip
//! captcha and second factor. It needs an [`UnlockGrant`], which only the
//! lock guard can create, and it never changes the session identity.

use chrono::Utc;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch, Mutex};

use super::locks::{resilient_read, resilient_write};
use crate::api::AuthApi;
use crate::audit::{SecurityEvent, TerminationReason};
use crate::errors::{ApiError, AuthError};
use crate::types::{
    CaptchaAnswer, Credentials, LoginOptions, LoginResponse, LoginStatus, Role, UserIdentity,
};

/// Entry screen used for hard navigations.
pub const LOGIN_PATH: &str = "/login";

/// Capacity of the navigation broadcast channel.
const NAVIGATION_CHANNEL_CAPACITY: usize = 16;

/// Client-side session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: Option<UserIdentity>,
    pub loading: bool,
    pub last_error: Option<String>,
}

impl Session {
    /// Process-start state: nobody signed in, start-up check pending.
    fn unknown() -> Self {
        Self {
            user: None,
            loading: true,
            last_error: None,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        match (&self.user, self.loading) {
            (Some(user), _) => AuthState::Authenticated(user.role),
            (None, true) => AuthState::Unknown,
            (None, false) => AuthState::Anonymous,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Coarse authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unknown,
    Anonymous,
    Authenticated(Role),
}

/// Step of the login attempt currently pending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CredentialChallenge {
    #[default]
    None,
    CaptchaRequired { session_id: String },
    TwoFactorRequired,
    /// A backup code was accepted and the identity is being fetched.
    BackupCodeAccepted,
}

/// Position in the login sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginPhase {
    #[default]
    Idle,
    CredentialsSubmitted,
    CaptchaPending,
    TwoFactorPending,
    Established,
    Rejected,
}

/// Result of a login step: the next thing the user has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Established(UserIdentity),
    CaptchaRequired { session_id: String, prompt: Option<String> },
    TwoFactorRequired,
}

/// Navigation that bypasses in-app routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    Hard {
        path: String,
        reason: TerminationReason,
    },
}

/// Capability allowing one password re-check without captcha or second
/// factor. Constructible only inside the `security` module.
#[derive(Debug)]
pub struct UnlockGrant {
    _private: (),
}

impl UnlockGrant {
    pub(in crate::security) fn issue() -> Self {
        Self { _private: () }
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Account deactivated, session gone, or the check itself failed.
    Inactive,
}

#[derive(Debug, Default)]
struct LoginAttempt {
    id: String,
    phase: LoginPhase,
    challenge: CredentialChallenge,
}

/// Which challenge a submission answers.
#[derive(Debug, Clone, Copy)]
enum Step {
    Password,
    Captcha,
    TwoFactor,
    BackupCode,
}

/// The single owner of [`Session`].
pub struct AuthSessionMachine<A> {
    api: Arc<A>,
    session: watch::Sender<Session>,
    attempt: RwLock<LoginAttempt>,
    in_flight: Mutex<()>,
    navigation: broadcast::Sender<NavigationEvent>,
}

impl<A: AuthApi> AuthSessionMachine<A> {
    pub fn new(api: Arc<A>) -> Self {
        let (session, _) = watch::channel(Session::unknown());
        let (navigation, _) = broadcast::channel(NAVIGATION_CHANNEL_CAPACITY);
        Self {
            api,
            session,
            attempt: RwLock::new(LoginAttempt::default()),
            in_flight: Mutex::new(()),
            navigation,
        }
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Receive every session change.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    /// Receive hard navigations (forced logout).
    pub fn navigation(&self) -> broadcast::Receiver<NavigationEvent> {
        self.navigation.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.borrow().auth_state()
    }

    pub fn current_user(&self) -> Option<UserIdentity> {
        self.session.borrow().user.clone()
    }

    pub fn current_role(&self) -> Option<Role> {
        self.session.borrow().role()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.borrow().is_authenticated()
    }

    pub fn pending_challenge(&self) -> CredentialChallenge {
        resilient_read(&self.attempt).challenge.clone()
    }

    pub fn login_phase(&self) -> LoginPhase {
        resilient_read(&self.attempt).phase
    }

    /// Whether a login step is awaiting the backend. Views disable their
    /// submit controls while this is true.
    pub fn is_step_in_flight(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    // ------------------------------------------------------------------
    // Start-up check
    // ------------------------------------------------------------------

    /// Ask the backend whether a session already exists.
    ///
    /// Never fails: every error collapses to `Anonymous`.
    pub async fn check_auth_status(&self) -> AuthState {
        self.session.send_modify(|s| s.loading = true);

        match self.api.check_session().await {
            Ok(Some(user)) if user.is_active => {
                SecurityEvent::SessionRestored {
                    user_id: user.id.clone(),
                    role: user.role,
                }
                .emit();
                self.establish_session(user);
            }
            Ok(Some(user)) => {
                tracing::warn!(user = %user.id, "existing session belongs to an inactive account");
                self.clear_session(None);
            }
            Ok(None) => self.clear_session(None),
            Err(e) => {
                SecurityEvent::SessionCheckFailed {
                    detail: e.to_string(),
                }
                .emit();
                self.clear_session(None);
            }
        }

        self.auth_state()
    }

    // ------------------------------------------------------------------
    // Login protocol
    // ------------------------------------------------------------------

    /// Submit e-mail and password from the primary login form.
    ///
    /// Always sends `is_unlock = false`.
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginOutcome, AuthError> {
        let _flight = self.in_flight.try_lock().map_err(|_| AuthError::StepInFlight)?;

        {
            let mut attempt = resilient_write(&self.attempt);
            *attempt = LoginAttempt {
                id: new_attempt_id(),
                phase: LoginPhase::CredentialsSubmitted,
                challenge: CredentialChallenge::None,
            };
        }

        let result = self.api.login(credentials, LoginOptions::default()).await;
        self.complete_step(credentials, Step::Password, result).await
    }

    /// Answer the pending captcha.
    pub async fn submit_captcha(
        &self,
        credentials: &Credentials,
        answer: &CaptchaAnswer,
    ) -> Result<LoginOutcome, AuthError> {
        let _flight = self.in_flight.try_lock().map_err(|_| AuthError::StepInFlight)?;
        self.require_pending(Step::Captcha)?;

        let result = self.api.submit_captcha(credentials, answer).await;
        self.complete_step(credentials, Step::Captcha, result).await
    }

    /// Answer the pending second-factor challenge with a code.
    pub async fn submit_two_factor(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let _flight = self.in_flight.try_lock().map_err(|_| AuthError::StepInFlight)?;
        self.require_pending(Step::TwoFactor)?;

        let result = self.api.submit_two_factor(credentials, code).await;
        self.complete_step(credentials, Step::TwoFactor, result).await
    }

    /// Answer the pending second-factor challenge with a backup code.
    pub async fn submit_backup_code(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let _flight = self.in_flight.try_lock().map_err(|_| AuthError::StepInFlight)?;
        self.require_pending(Step::BackupCode)?;

        let result = self.api.submit_backup_code(credentials, code).await;
        self.complete_step(credentials, Step::BackupCode, result).await
    }

    /// Drop a pending challenge and go back to `Idle`.
    ///
    /// Returns `false` if nothing was pending or a step is in flight.
    pub fn abandon_login(&self) -> bool {
        if self.is_step_in_flight() {
            return false;
        }
        let mut attempt = resilient_write(&self.attempt);
        if !matches!(
            attempt.phase,
            LoginPhase::CaptchaPending | LoginPhase::TwoFactorPending
        ) {
            return false;
        }
        SecurityEvent::LoginAbandoned {
            attempt: attempt.id.clone(),
        }
        .emit();
        *attempt = LoginAttempt::default();
        true
    }

    fn require_pending(&self, step: Step) -> Result<(), AuthError> {
        let attempt = resilient_read(&self.attempt);
        let ok = match step {
            Step::Captcha => matches!(attempt.challenge, CredentialChallenge::CaptchaRequired { .. }),
            Step::TwoFactor | Step::BackupCode => {
                attempt.challenge == CredentialChallenge::TwoFactorRequired
            }
            Step::Password => true,
        };
        if ok {
            Ok(())
        } else {
            Err(AuthError::NoPendingChallenge)
        }
    }

    async fn complete_step(
        &self,
        credentials: &Credentials,
        step: Step,
        result: Result<LoginResponse, ApiError>,
    ) -> Result<LoginOutcome, AuthError> {
        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(self.reject(credentials, e.into())),
        };

        match response.status {
            LoginStatus::Established => {
                if let Step::BackupCode = step {
                    let attempt_id = {
                        let mut attempt = resilient_write(&self.attempt);
                        attempt.challenge = CredentialChallenge::BackupCodeAccepted;
                        attempt.id.clone()
                    };
                    SecurityEvent::BackupCodeUsed {
                        attempt: attempt_id,
                        codes_remaining: response.backup_codes_remaining,
                    }
                    .emit();
                    if matches!(response.backup_codes_remaining, Some(n) if n <= 2) {
                        tracing::warn!(
                            remaining = ?response.backup_codes_remaining,
                            "few backup codes left; the user should generate new ones"
                        );
                    }
                }

                let user = match response.user {
                    Some(user) => user,
                    // Some steps only set the cookie; fetch the identity it unlocked.
                    None => match self.api.check_session().await {
                        Ok(Some(user)) => user,
                        Ok(None) => {
                            return Err(self.reject(
                                credentials,
                                AuthError::Rejected {
                                    message: "Sign-in could not be completed.".to_string(),
                                    attempts_remaining: None,
                                },
                            ))
                        }
                        Err(e) => return Err(self.reject(credentials, e.into())),
                    },
                };

                if !user.is_active {
                    return Err(self.reject(
                        credentials,
                        AuthError::Rejected {
                            message: "This account has been deactivated.".to_string(),
                            attempts_remaining: None,
                        },
                    ));
                }

                let attempt_id = {
                    let mut attempt = resilient_write(&self.attempt);
                    let id = attempt.id.clone();
                    attempt.phase = LoginPhase::Established;
                    attempt.challenge = CredentialChallenge::None;
                    id
                };
                SecurityEvent::LoginEstablished {
                    attempt: attempt_id,
                    user_id: user.id.clone(),
                    role: user.role,
                }
                .emit();

                self.establish_session(user.clone());
                Ok(LoginOutcome::Established(user))
            }
            LoginStatus::CaptchaRequired => {
                let challenge = response.challenge.unwrap_or_default();
                let Some(session_id) = challenge.session_id else {
                    return Err(self.reject(
                        credentials,
                        ApiError::Decode("captcha challenge without session id".to_string()).into(),
                    ));
                };
                self.set_pending(
                    LoginPhase::CaptchaPending,
                    CredentialChallenge::CaptchaRequired {
                        session_id: session_id.clone(),
                    },
                    "captcha",
                );
                Ok(LoginOutcome::CaptchaRequired {
                    session_id,
                    prompt: challenge.prompt,
                })
            }
            LoginStatus::TwoFactorRequired => {
                self.set_pending(
                    LoginPhase::TwoFactorPending,
                    CredentialChallenge::TwoFactorRequired,
                    "two_factor",
                );
                Ok(LoginOutcome::TwoFactorRequired)
            }
        }
    }

    fn set_pending(&self, phase: LoginPhase, challenge: CredentialChallenge, name: &'static str) {
        let attempt_id = {
            let mut attempt = resilient_write(&self.attempt);
            attempt.phase = phase;
            attempt.challenge = challenge;
            attempt.id.clone()
        };
        SecurityEvent::ChallengeIssued {
            attempt: attempt_id,
            challenge: name,
        }
        .emit();
    }

    fn reject(&self, credentials: &Credentials, err: AuthError) -> AuthError {
        let attempt_id = {
            let mut attempt = resilient_write(&self.attempt);
            attempt.phase = LoginPhase::Rejected;
            attempt.challenge = CredentialChallenge::None;
            attempt.id.clone()
        };
        SecurityEvent::LoginRejected {
            attempt: attempt_id,
            email: credentials.email.clone(),
            detail: format!("{:?}", err),
        }
        .emit();

        let message = err.to_string();
        self.session.send_modify(|s| s.last_error = Some(message));
        err
    }

    // ------------------------------------------------------------------
    // Screen-lock re-authentication
    // ------------------------------------------------------------------

    /// Re-check the signed-in user's password with the unlock capability.
    ///
    /// The session identity is left untouched whatever the outcome.
    ///
    /// # Arguments
    ///
    /// * `password` - Password for the account that is already signed in
    /// * `_grant` - Proof that the caller is the screen lock
    ///
    /// # Returns
    ///
    /// `Ok(())` when the backend accepts the password and does not name a
    /// different user.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] without a session. Any challenge or
    /// a different identity in the answer is treated as a failure.
    pub async fn reauthenticate(&self, password: &str, _grant: UnlockGrant) -> Result<(), AuthError> {
        let current = self.current_user().ok_or(AuthError::NotAuthenticated)?;
        let credentials = Credentials::new(current.email.clone(), password);

        let response = self
            .api
            .login(&credentials, LoginOptions { is_unlock: true })
            .await
            .map_err(AuthError::from)?;

        match response.status {
            LoginStatus::Established => match response.user {
                Some(user) if user.id != current.id => {
                    tracing::warn!(
                        expected = %current.id,
                        got = %user.id,
                        "unlock verification resolved to a different user"
                    );
                    Err(AuthError::Rejected {
                        message: "Verification failed.".to_string(),
                        attempts_remaining: None,
                    })
                }
                _ => Ok(()),
            },
            // The backend must honor the unlock capability; anything else
            // is treated as a failed verification.
            LoginStatus::CaptchaRequired | LoginStatus::TwoFactorRequired => {
                tracing::warn!("backend asked for a challenge during unlock verification");
                Err(AuthError::Rejected {
                    message: "Verification failed.".to_string(),
                    attempts_remaining: None,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Re-fetch the current user's active flag.
    ///
    /// Fails closed: a failed check counts as inactive.
    pub async fn verify_liveness(&self) -> Liveness {
        let Some(current) = self.current_user() else {
            return Liveness::Inactive;
        };

        match self.api.check_session().await {
            Ok(Some(user)) if user.is_active && user.id == current.id => {
                if user != current {
                    // Same account, refreshed snapshot.
                    self.session.send_if_modified(|s| match &s.user {
                        Some(existing) if existing.id == user.id => {
                            s.user = Some(user);
                            true
                        }
                        _ => false,
                    });
                }
                Liveness::Active
            }
            Ok(Some(user)) => {
                tracing::warn!(user = %user.id, active = user.is_active, "status check: account no longer usable");
                Liveness::Inactive
            }
            Ok(None) => {
                tracing::warn!(user = %current.id, "status check: session no longer recognized");
                Liveness::Inactive
            }
            Err(e) => {
                tracing::warn!(user = %current.id, error = %e, "status check failed; treating as inactive");
                Liveness::Inactive
            }
        }
    }

    // ------------------------------------------------------------------
    // Logout
    // ------------------------------------------------------------------

    /// End the session. Local state is cleared even if the backend call fails.
    pub async fn logout(&self) {
        let user_id = self.current_user().map(|u| u.id);
        self.clear_session(None);
        SecurityEvent::LoggedOut {
            user_id: user_id.clone(),
        }
        .emit();

        if let Err(e) = self.api.logout().await {
            tracing::warn!(user = ?user_id, error = %e, "remote logout failed; local session already cleared");
        }
    }

    /// End the session and navigate to the entry screen, bypassing in-app
    /// routing state. No-op when nobody is signed in.
    ///
    /// # Arguments
    ///
    /// * `reason` - Recorded in the audit line and shown on the entry screen
    pub async fn force_logout(&self, reason: TerminationReason) {
        let Some(user) = self.current_user() else {
            tracing::debug!(reason = %reason, "forced logout requested without a session; ignoring");
            return;
        };

        self.clear_session(Some(format!("Signed out: {}", reason)));
        SecurityEvent::ForcedLogout {
            user_id: Some(user.id.clone()),
            reason,
        }
        .emit();

        // Receivers may all be gone (no view mounted); nothing to do then.
        let _ = self.navigation.send(NavigationEvent::Hard {
            path: LOGIN_PATH.to_string(),
            reason,
        });

        if let Err(e) = self.api.logout().await {
            tracing::warn!(user = %user.id, error = %e, "remote logout failed during forced logout");
        }
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    /// Confirm an e-mail address. Session state is not affected.
    pub async fn verify_email(&self, token: &str) -> Result<String, AuthError> {
        self.api.verify_email(token).await.map_err(AuthError::from)
    }

    fn establish_session(&self, user: UserIdentity) {
        self.session.send_modify(|s| {
            s.user = Some(user);
            s.loading = false;
            s.last_error = None;
        });
    }

    fn clear_session(&self, last_error: Option<String>) {
        *resilient_write(&self.attempt) = LoginAttempt::default();
        self.session.send_modify(|s| {
            s.user = None;
            s.loading = false;
            s.last_error = last_error;
        });
    }
}

fn new_attempt_id() -> String {
    format!("att_{}_{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>())
}
