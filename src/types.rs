// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types shared by the session core and its collaborators.
//!
//! Identities and contract snapshots are immutable values: every successful
//! transition replaces them wholesale instead of patching fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User role as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Platform-level operator. Owns no organization.
    #[serde(alias = "super_admin", alias = "superAdmin")]
    SuperAdmin,
    /// Organization administrator.
    Admin,
    /// Clinic account (organization owner).
    Clinic,
    /// Clinician working inside a clinic.
    Doctor,
}

impl Role {
    /// Every role, in display order.
    pub const ALL: [Role; 4] = [Role::SuperAdmin, Role::Admin, Role::Clinic, Role::Doctor];

    /// Whether the role belongs to an organization with a usage contract.
    ///
    /// Roles without an organization are exempt from the contract gate.
    pub fn owns_organization(&self) -> bool {
        !matches!(self, Role::SuperAdmin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "superadmin",
            Role::Admin => "admin",
            Role::Clinic => "clinic",
            Role::Doctor => "doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "superadmin" => Ok(Role::SuperAdmin),
            "admin" => Ok(Role::Admin),
            "clinic" => Ok(Role::Clinic),
            "doctor" => Ok(Role::Doctor),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Snapshot of the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    #[serde(alias = "is_active", default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// E-mail and password pair submitted with every login step.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

// Never print the password, not even in debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Answer to a captcha challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaAnswer {
    pub session_id: String,
    pub answer: String,
}

/// Options forwarded to the backend credential check.
///
/// `is_unlock` is only ever set by the screen-lock re-authentication path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOptions {
    pub is_unlock: bool,
}

/// Status field of a login-step response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Established,
    CaptchaRequired,
    TwoFactorRequired,
}

/// Challenge payload attached to a pending login step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeData {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Captcha question or image reference, when the backend sends one.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Wire shape shared by every login step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub status: LoginStatus,
    #[serde(default)]
    pub user: Option<UserIdentity>,
    #[serde(default)]
    pub challenge: Option<ChallengeData>,
    /// Remaining backup codes, reported after a backup code was consumed.
    #[serde(default)]
    pub backup_codes_remaining: Option<u32>,
}

/// Organization usage-contract snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    pub is_valid: bool,
    #[serde(default)]
    pub is_in_grace_period: bool,
    #[serde(default)]
    pub days_until_expiry: Option<i64>,
    #[serde(default)]
    pub grace_period_days: Option<i64>,
    #[serde(default)]
    pub contract_status: Option<String>,
    #[serde(default)]
    pub contract_start_date: Option<String>,
    #[serde(default)]
    pub contract_end_date: Option<String>,
}

/// Contract renewal request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRequest {
    pub message: String,
    pub requested_duration_months: u32,
}

/// Backend answer to a renewal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}
