// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::SessionTerminator;
use crate::api::{AuthApi, EntitlementApi};
use crate::audit::TerminationReason;
use crate::errors::ApiError;
use crate::types::{
    CaptchaAnswer, ContractInfo, Credentials, LoginOptions, LoginResponse, LoginStatus,
    RenewalRequest, RenewalResponse, Role, UserIdentity,
};

pub(crate) fn clinic_user() -> UserIdentity {
    UserIdentity {
        id: "u-clinic-1".to_string(),
        username: "northside".to_string(),
        email: "clinic@example.org".to_string(),
        role: Role::Clinic,
        is_active: true,
    }
}

pub(crate) fn super_admin() -> UserIdentity {
    UserIdentity {
        id: "u-root".to_string(),
        username: "root".to_string(),
        email: "root@example.org".to_string(),
        role: Role::SuperAdmin,
        is_active: true,
    }
}

pub(crate) fn established(user: UserIdentity) -> LoginResponse {
    LoginResponse {
        status: LoginStatus::Established,
        user: Some(user),
        challenge: None,
        backup_codes_remaining: None,
    }
}

pub(crate) fn valid_contract() -> ContractInfo {
    ContractInfo {
        is_valid: true,
        is_in_grace_period: false,
        days_until_expiry: Some(200),
        grace_period_days: None,
        contract_status: Some("active".to_string()),
        contract_start_date: None,
        contract_end_date: None,
    }
}

/// Auth backend answering from queues.
#[derive(Default)]
pub(crate) struct ScriptedAuthApi {
    steps: Mutex<VecDeque<Result<LoginResponse, ApiError>>>,
    sessions: Mutex<VecDeque<Result<Option<UserIdentity>, ApiError>>>,
    default_session: Mutex<Option<Result<Option<UserIdentity>, ApiError>>>,
    calls: Mutex<Vec<String>>,
    logout_fails: AtomicBool,
    delay: Option<Duration>,
}

impl ScriptedAuthApi {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn push_step(&self, response: Result<LoginResponse, ApiError>) {
        self.steps.lock().unwrap().push_back(response);
    }

    pub(crate) fn push_session(&self, response: Result<Option<UserIdentity>, ApiError>) {
        self.sessions.lock().unwrap().push_back(response);
    }

    /// Answer for `check_session` once the queue is empty.
    pub(crate) fn set_default_session(&self, response: Result<Option<UserIdentity>, ApiError>) {
        *self.default_session.lock().unwrap() = Some(response);
    }

    pub(crate) fn fail_logout(&self) {
        self.logout_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    async fn next_step(&self, call: String) -> Result<LoginResponse, ApiError> {
        self.record(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.steps.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ApiError::Transport("no scripted response".to_string())))
    }
}

impl AuthApi for ScriptedAuthApi {
    async fn check_session(&self) -> Result<Option<UserIdentity>, ApiError> {
        self.record("check_session");
        let queued = self.sessions.lock().unwrap().pop_front();
        match queued {
            Some(response) => response,
            None => self.default_session.lock().unwrap().clone().unwrap_or(Ok(None)),
        }
    }

    async fn login(
        &self,
        _credentials: &Credentials,
        options: LoginOptions,
    ) -> Result<LoginResponse, ApiError> {
        self.next_step(format!("login(unlock={})", options.is_unlock)).await
    }

    async fn submit_captcha(
        &self,
        _credentials: &Credentials,
        _answer: &CaptchaAnswer,
    ) -> Result<LoginResponse, ApiError> {
        self.next_step("captcha".to_string()).await
    }

    async fn submit_two_factor(
        &self,
        _credentials: &Credentials,
        _code: &str,
    ) -> Result<LoginResponse, ApiError> {
        self.next_step("two_factor".to_string()).await
    }

    async fn submit_backup_code(
        &self,
        _credentials: &Credentials,
        _code: &str,
    ) -> Result<LoginResponse, ApiError> {
        self.next_step("backup_code".to_string()).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record("logout");
        if self.logout_fails.load(Ordering::SeqCst) {
            Err(ApiError::Transport("connection reset".to_string()))
        } else {
            Ok(())
        }
    }

    async fn verify_email(&self, token: &str) -> Result<String, ApiError> {
        self.record(format!("verify_email({})", token));
        Ok("Email verified".to_string())
    }
}

/// Entitlement backend answering from a queue, then a default.
pub(crate) struct ScriptedEntitlements {
    contracts: Mutex<VecDeque<Result<ContractInfo, ApiError>>>,
    default_contract: Mutex<Result<ContractInfo, ApiError>>,
    renewal: Mutex<Result<RenewalResponse, ApiError>>,
    pub(crate) contract_calls: AtomicUsize,
    pub(crate) renewal_requests: Mutex<Vec<RenewalRequest>>,
}

impl Default for ScriptedEntitlements {
    fn default() -> Self {
        Self {
            contracts: Mutex::new(VecDeque::new()),
            default_contract: Mutex::new(Ok(valid_contract())),
            renewal: Mutex::new(Ok(RenewalResponse {
                success: true,
                message: "Renewal request submitted".to_string(),
            })),
            contract_calls: AtomicUsize::new(0),
            renewal_requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedEntitlements {
    pub(crate) fn push_contract(&self, response: Result<ContractInfo, ApiError>) {
        self.contracts.lock().unwrap().push_back(response);
    }

    pub(crate) fn set_default_contract(&self, response: Result<ContractInfo, ApiError>) {
        *self.default_contract.lock().unwrap() = response;
    }

    pub(crate) fn set_renewal(&self, response: Result<RenewalResponse, ApiError>) {
        *self.renewal.lock().unwrap() = response;
    }

    pub(crate) fn contract_calls(&self) -> usize {
        self.contract_calls.load(Ordering::SeqCst)
    }
}

impl EntitlementApi for ScriptedEntitlements {
    async fn get_contract_status(&self) -> Result<ContractInfo, ApiError> {
        self.contract_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.contracts.lock().unwrap().pop_front();
        match queued {
            Some(response) => response,
            None => self.default_contract.lock().unwrap().clone(),
        }
    }

    async fn request_renewal(&self, request: &RenewalRequest) -> Result<RenewalResponse, ApiError> {
        self.renewal_requests.lock().unwrap().push(request.clone());
        self.renewal.lock().unwrap().clone()
    }
}

/// Terminator that only records what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingTerminator {
    reasons: Mutex<Vec<TerminationReason>>,
}

impl RecordingTerminator {
    pub(crate) fn reasons(&self) -> Vec<TerminationReason> {
        self.reasons.lock().unwrap().clone()
    }
}

impl SessionTerminator for RecordingTerminator {
    async fn terminate(&self, reason: TerminationReason) {
        self.reasons.lock().unwrap().push(reason);
    }
}
