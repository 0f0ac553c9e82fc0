// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborator contracts for the backend.
//!
//! The session core only talks to the backend through these two traits.
//! [`http::HttpBackend`] implements both over HTTP; tests use in-memory
//! implementations.

use std::future::Future;

use crate::errors::ApiError;
use crate::types::{
    CaptchaAnswer, ContractInfo, Credentials, LoginOptions, LoginResponse, RenewalRequest,
    RenewalResponse, UserIdentity,
};

pub mod http;

pub use http::HttpBackend;

/// Authentication endpoints.
pub trait AuthApi: Send + Sync + 'static {
    /// Look up the session the backend already knows about, if any.
    ///
    /// `Ok(None)` means "no session"; transport problems are `Err`.
    fn check_session(
        &self,
    ) -> impl Future<Output = Result<Option<UserIdentity>, ApiError>> + Send;

    /// Submit e-mail and password.
    fn login(
        &self,
        credentials: &Credentials,
        options: LoginOptions,
    ) -> impl Future<Output = Result<LoginResponse, ApiError>> + Send;

    /// Answer a captcha challenge.
    fn submit_captcha(
        &self,
        credentials: &Credentials,
        answer: &CaptchaAnswer,
    ) -> impl Future<Output = Result<LoginResponse, ApiError>> + Send;

    /// Submit a second-factor code.
    fn submit_two_factor(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> impl Future<Output = Result<LoginResponse, ApiError>> + Send;

    /// Submit a single-use backup code in place of the second factor.
    fn submit_backup_code(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> impl Future<Output = Result<LoginResponse, ApiError>> + Send;

    /// Invalidate the server-side session. Best effort.
    fn logout(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Confirm an e-mail address. Returns the server's message.
    fn verify_email(&self, token: &str) -> impl Future<Output = Result<String, ApiError>> + Send;
}

/// Organization entitlement endpoints.
pub trait EntitlementApi: Send + Sync + 'static {
    /// Current contract snapshot. Fails with [`ApiError::NotApplicable`] for
    /// roles without an organization.
    fn get_contract_status(&self) -> impl Future<Output = Result<ContractInfo, ApiError>> + Send;

    /// Ask for a contract renewal.
    fn request_renewal(
        &self,
        request: &RenewalRequest,
    ) -> impl Future<Output = Result<RenewalResponse, ApiError>> + Send;
}
