// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end session behavior with an in-memory backend and paused time.
//!
//! Timers are driven by tokio's test clock, so every deadline is checked to
//! the millisecond without sleeping for real.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clinicgate::api::{AuthApi, EntitlementApi};
use clinicgate::audit::TerminationReason;
use clinicgate::config::{ConsoleConfig, InactivityConfig};
use clinicgate::errors::{ApiError, UnlockError};
use clinicgate::security::{
    ActivityKind, AuthState, ConsoleSession, FileLockStore, InputTarget, KeyChord,
    KeyDisposition, LockStore, ManualClock, MemoryLockStore, NavigationEvent, RouteDecision,
    LOGIN_PATH,
};
use clinicgate::types::{
    CaptchaAnswer, ContractInfo, Credentials, LoginOptions, LoginResponse, LoginStatus,
    RenewalRequest, RenewalResponse, Role, UserIdentity,
};

const PASSWORD: &str = "s3cret";

/// Backend with one account whose password, active flag and contract can be
/// changed mid-test.
struct FakeBackend {
    user: UserIdentity,
    signed_in: AtomicBool,
    active: AtomicBool,
    contract: Mutex<Result<ContractInfo, ApiError>>,
}

impl FakeBackend {
    fn new(role: Role, signed_in: bool) -> Arc<Self> {
        Arc::new(Self {
            user: UserIdentity {
                id: "u-7".to_string(),
                username: "dr.ana".to_string(),
                email: "ana@example.org".to_string(),
                role,
                is_active: true,
            },
            signed_in: AtomicBool::new(signed_in),
            active: AtomicBool::new(true),
            contract: Mutex::new(Ok(ContractInfo {
                is_valid: true,
                is_in_grace_period: false,
                days_until_expiry: Some(90),
                grace_period_days: None,
                contract_status: Some("active".to_string()),
                contract_start_date: None,
                contract_end_date: None,
            })),
        })
    }

    fn current_user(&self) -> UserIdentity {
        UserIdentity {
            is_active: self.active.load(Ordering::SeqCst),
            ..self.user.clone()
        }
    }
}

impl AuthApi for FakeBackend {
    async fn check_session(&self) -> Result<Option<UserIdentity>, ApiError> {
        if self.signed_in.load(Ordering::SeqCst) {
            Ok(Some(self.current_user()))
        } else {
            Ok(None)
        }
    }

    async fn login(
        &self,
        credentials: &Credentials,
        _options: LoginOptions,
    ) -> Result<LoginResponse, ApiError> {
        if credentials.password != PASSWORD {
            return Err(ApiError::Rejected {
                message: "Invalid password".to_string(),
                attempts_remaining: None,
            });
        }
        self.signed_in.store(true, Ordering::SeqCst);
        Ok(LoginResponse {
            status: LoginStatus::Established,
            user: Some(self.current_user()),
            challenge: None,
            backup_codes_remaining: None,
        })
    }

    async fn submit_captcha(
        &self,
        _credentials: &Credentials,
        _answer: &CaptchaAnswer,
    ) -> Result<LoginResponse, ApiError> {
        Err(ApiError::Decode("not scripted".to_string()))
    }

    async fn submit_two_factor(
        &self,
        _credentials: &Credentials,
        _code: &str,
    ) -> Result<LoginResponse, ApiError> {
        Err(ApiError::Decode("not scripted".to_string()))
    }

    async fn submit_backup_code(
        &self,
        _credentials: &Credentials,
        _code: &str,
    ) -> Result<LoginResponse, ApiError> {
        Err(ApiError::Decode("not scripted".to_string()))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.signed_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn verify_email(&self, _token: &str) -> Result<String, ApiError> {
        Ok("ok".to_string())
    }
}

impl EntitlementApi for FakeBackend {
    async fn get_contract_status(&self) -> Result<ContractInfo, ApiError> {
        self.contract.lock().unwrap().clone()
    }

    async fn request_renewal(&self, _request: &RenewalRequest) -> Result<RenewalResponse, ApiError> {
        Ok(RenewalResponse {
            success: true,
            message: "submitted".to_string(),
        })
    }
}

fn config(timeout_ms: u64, warning_ms: u64) -> ConsoleConfig {
    ConsoleConfig {
        inactivity_timeout: InactivityConfig {
            timeout: Some(timeout_ms as i64),
            warning_time: warning_ms,
            enabled: true,
        },
        ..Default::default()
    }
}

type Console = ConsoleSession<FakeBackend, FakeBackend>;

fn console(backend: &Arc<FakeBackend>, config: ConsoleConfig) -> Console {
    ConsoleSession::in_memory(config, backend.clone(), backend.clone())
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_logout_lands_exactly_timeout_after_last_activity() {
    let backend = FakeBackend::new(Role::Doctor, true);
    let console = console(&backend, config(60_000, 10_000));
    console.start().await;
    advance(1).await;

    // Keep interacting through several warning windows.
    for _ in 0..3 {
        advance(55_000).await;
        assert!(console.presented_inactivity().warning_visible);
        console.record_activity(ActivityKind::Pointer);
        assert!(!console.presented_inactivity().warning_visible);
    }

    advance(59_990).await;
    assert!(console.machine().is_authenticated());
    advance(20).await;
    assert_eq!(console.machine().auth_state(), AuthState::Anonymous);
    assert!(!backend.signed_in.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_deactivation_mid_session_forces_logout() {
    let backend = FakeBackend::new(Role::Clinic, true);
    let console = console(&backend, config(900_000, 120_000));
    let mut navigation = console.navigation();
    console.start().await;
    advance(1).await;

    backend.active.store(false, Ordering::SeqCst);
    advance(30_000).await;

    assert_eq!(console.machine().auth_state(), AuthState::Anonymous);
    assert_eq!(
        navigation.recv().await.unwrap(),
        NavigationEvent::Hard {
            path: LOGIN_PATH.to_string(),
            reason: TerminationReason::Deactivated,
        }
    );
    advance(1).await;
    assert!(!console.timer().is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_contract_failure_never_cancels_inactivity() {
    let backend = FakeBackend::new(Role::Clinic, true);
    let console = console(&backend, config(100_000, 10_000));
    console.start().await;
    advance(1).await;

    *backend.contract.lock().unwrap() = Err(ApiError::Transport("down".to_string()));
    advance(60_000).await;
    assert!(console.machine().is_authenticated());
    assert!(console.timer().is_armed());

    advance(40_000).await;
    assert_eq!(console.machine().auth_state(), AuthState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn test_super_admin_never_sees_contract_gate() {
    let backend = FakeBackend::new(Role::SuperAdmin, true);
    *backend.contract.lock().unwrap() = Ok(ContractInfo {
        is_valid: false,
        is_in_grace_period: false,
        days_until_expiry: None,
        grace_period_days: None,
        contract_status: Some("expired".to_string()),
        contract_start_date: None,
        contract_end_date: None,
    });
    let console = console(&backend, config(900_000, 120_000));

    console.start().await;
    advance(90_000).await;
    assert!(!console.gate().blocks_action_screens());
    assert!(console.gate().advisory().is_none());
    assert!(console.machine().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_lockout_then_fresh_attempt() {
    let backend = FakeBackend::new(Role::Doctor, true);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let console = ConsoleSession::new(
        config(900_000, 120_000),
        backend.clone(),
        backend.clone(),
        Arc::new(MemoryLockStore::default()),
        clock.clone(),
    );
    console.start().await;
    let guard = console.lock_guard();

    assert_eq!(
        console.handle_key(KeyChord::ctrl_shift('l'), InputTarget::Other),
        KeyDisposition::Lock
    );
    for _ in 0..2 {
        assert!(matches!(guard.unlock("nope").await, Err(UnlockError::Rejected { .. })));
    }
    assert_eq!(
        guard.unlock("nope").await,
        Err(UnlockError::LockedOut { remaining_secs: 30 })
    );
    assert!(matches!(
        guard.unlock(PASSWORD).await,
        Err(UnlockError::LockedOut { .. })
    ));

    clock.advance(chrono::Duration::seconds(30));
    guard.unlock(PASSWORD).await.unwrap();
    assert_eq!(guard.state().failed_attempts, 0);
    assert!(console.machine().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_input_suppressed_while_locked() {
    let backend = FakeBackend::new(Role::Doctor, true);
    let console = console(&backend, config(900_000, 120_000));
    console.start().await;

    console.lock_guard().lock().unwrap();
    assert_eq!(
        console.handle_key(KeyChord::plain('x'), InputTarget::Other),
        KeyDisposition::Suppress
    );
    assert_eq!(
        console.handle_key(KeyChord::plain('x'), InputTarget::UnlockPassword),
        KeyDisposition::Pass
    );
}

#[tokio::test(start_paused = true)]
async fn test_lock_survives_restart_of_same_tab_only() {
    let dir = tempfile::tempdir().unwrap();
    let tab_a = dir.path().join("tab-a.json");
    let tab_b = dir.path().join("tab-b.json");
    let backend = FakeBackend::new(Role::Clinic, true);

    let first = ConsoleSession::new(
        config(900_000, 120_000),
        backend.clone(),
        backend.clone(),
        Arc::new(FileLockStore::at(&tab_a)),
        Arc::new(ManualClock::new(Utc::now())),
    );
    first.start().await;
    first.lock_guard().lock().unwrap();
    first.shutdown();
    drop(first);

    let reloaded = ConsoleSession::new(
        config(900_000, 120_000),
        backend.clone(),
        backend.clone(),
        Arc::new(FileLockStore::at(&tab_a)),
        Arc::new(ManualClock::new(Utc::now())),
    );
    reloaded.start().await;
    assert!(reloaded.lock_guard().is_locked());

    let other_tab = ConsoleSession::new(
        config(900_000, 120_000),
        backend.clone(),
        backend.clone(),
        Arc::new(FileLockStore::at(&tab_b)),
        Arc::new(ManualClock::new(Utc::now())),
    );
    other_tab.start().await;
    assert!(!other_tab.lock_guard().is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_logout_clears_persisted_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileLockStore::at(dir.path().join("tab.json")));
    let backend = FakeBackend::new(Role::Clinic, true);
    let console = ConsoleSession::new(
        config(900_000, 120_000),
        backend.clone(),
        backend.clone(),
        store.clone(),
        Arc::new(ManualClock::new(Utc::now())),
    );
    console.start().await;
    console.lock_guard().lock().unwrap();

    console.logout().await;
    assert!(store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_navigation_returns_after_login() {
    let backend = FakeBackend::new(Role::Clinic, false);
    let console = console(&backend, config(900_000, 120_000));
    assert_eq!(console.start().await, AuthState::Anonymous);

    assert_eq!(
        console.navigate("/patients/12"),
        RouteDecision::Redirect {
            to: LOGIN_PATH.to_string(),
            return_to: Some("/patients/12".to_string()),
        }
    );

    console
        .machine()
        .login(&Credentials::new("ana@example.org", PASSWORD))
        .await
        .unwrap();
    assert_eq!(console.post_login_destination(), "/patients/12");
    assert_eq!(console.navigate("/patients/12"), RouteDecision::Allow);
}
