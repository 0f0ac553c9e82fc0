// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP implementation of the backend collaborators.
//!
//! The backend keeps the session in a cookie, so one `reqwest::Client` with
//! a cookie jar is shared by every call.
//!
//! # Endpoints (relative to `api.baseUrl`)
//!
//! - `GET  /auth/me`
//! - `POST /auth/login`, `/auth/verify-captcha`, `/auth/verify-2fa`, `/auth/verify-backup-code`
//! - `POST /auth/logout`
//! - `GET  /auth/verify-email?token=...`
//! - `GET  /contracts/status`
//! - `POST /contracts/renewal-request`

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{AuthApi, EntitlementApi};
use crate::config::ApiConfig;
use crate::errors::ApiError;
use crate::types::{
    CaptchaAnswer, ContractInfo, Credentials, LoginOptions, LoginResponse, RenewalRequest,
    RenewalResponse, UserIdentity,
};

/// Error code the backend uses for "this endpoint has no meaning for your role".
const NOT_APPLICABLE_CODE: &str = "NOT_APPLICABLE";

/// Error body returned by the backend on non-success statuses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "attempts_remaining")]
    attempts_remaining: Option<u32>,
}

impl ErrorBody {
    fn text(&self) -> Option<String> {
        self.message.clone().or_else(|| self.error.clone())
    }
}

/// `/auth/me` answers either with the identity itself or wrapped in `user`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MeResponse {
    // Tried first: a missing `user` field would otherwise match `Wrapped`.
    Bare(UserIdentity),
    Wrapped { user: Option<UserIdentity> },
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
    is_unlock: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptchaBody<'a> {
    email: &'a str,
    password: &'a str,
    session_id: &'a str,
    answer: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CodeBody<'a> {
    email: &'a str,
    password: &'a str,
    code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupCodeBody<'a> {
    email: &'a str,
    password: &'a str,
    backup_code: &'a str,
}

/// Backend client implementing [`AuthApi`] and [`EntitlementApi`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Build a client for the configured backend.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .cookie_store(true)
            .user_agent(concat!("clinicgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Transport("request timed out".to_string())
            } else if e.is_connect() {
                ApiError::Transport(format!("connection failed: {}", e))
            } else {
                ApiError::Transport(e.to_string())
            }
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn error_from(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        classify_error(status, body)
    }

    async fn login_step<B: Serialize>(&self, path: &str, body: &B) -> Result<LoginResponse, ApiError> {
        let response = self.send(self.client.post(self.url(path)).json(body)).await?;
        Self::decode(response).await
    }
}

fn classify_error(status: StatusCode, body: ErrorBody) -> ApiError {
    if body.code.as_deref() == Some(NOT_APPLICABLE_CODE) {
        return ApiError::NotApplicable;
    }

    let message = body
        .text()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string());

    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::LOCKED
        | StatusCode::TOO_MANY_REQUESTS => ApiError::Rejected {
            message,
            attempts_remaining: body.attempts_remaining,
        },
        _ => ApiError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

impl AuthApi for HttpBackend {
    async fn check_session(&self) -> Result<Option<UserIdentity>, ApiError> {
        let response = self.send(self.client.get(self.url("/auth/me"))).await?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Ok(None);
        }
        match Self::decode::<MeResponse>(response).await? {
            MeResponse::Wrapped { user } => Ok(user),
            MeResponse::Bare(user) => Ok(Some(user)),
        }
    }

    async fn login(
        &self,
        credentials: &Credentials,
        options: LoginOptions,
    ) -> Result<LoginResponse, ApiError> {
        let body = LoginBody {
            email: &credentials.email,
            password: &credentials.password,
            is_unlock: options.is_unlock,
        };
        self.login_step("/auth/login", &body).await
    }

    async fn submit_captcha(
        &self,
        credentials: &Credentials,
        answer: &CaptchaAnswer,
    ) -> Result<LoginResponse, ApiError> {
        let body = CaptchaBody {
            email: &credentials.email,
            password: &credentials.password,
            session_id: &answer.session_id,
            answer: &answer.answer,
        };
        self.login_step("/auth/verify-captcha", &body).await
    }

    async fn submit_two_factor(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> Result<LoginResponse, ApiError> {
        let body = CodeBody {
            email: &credentials.email,
            password: &credentials.password,
            code,
        };
        self.login_step("/auth/verify-2fa", &body).await
    }

    async fn submit_backup_code(
        &self,
        credentials: &Credentials,
        code: &str,
    ) -> Result<LoginResponse, ApiError> {
        let body = BackupCodeBody {
            email: &credentials.email,
            password: &credentials.password,
            backup_code: code,
        };
        self.login_step("/auth/verify-backup-code", &body).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        let response = self.send(self.client.post(self.url("/auth/logout"))).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn verify_email(&self, token: &str) -> Result<String, ApiError> {
        let request = self
            .client
            .get(self.url("/auth/verify-email"))
            .query(&[("token", token)]);
        let response = self.send(request).await?;
        let body: MessageResponse = Self::decode(response).await?;
        Ok(body.message)
    }
}

impl EntitlementApi for HttpBackend {
    async fn get_contract_status(&self) -> Result<ContractInfo, ApiError> {
        let response = self.send(self.client.get(self.url("/contracts/status"))).await?;
        Self::decode(response).await
    }

    async fn request_renewal(&self, request: &RenewalRequest) -> Result<RenewalResponse, ApiError> {
        let response = self
            .send(self.client.post(self.url("/contracts/renewal-request")).json(request))
            .await?;
        Self::decode(response).await
    }
}
