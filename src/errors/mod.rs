// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the session core.
//!
//! - [`ApiError`]: what a collaborator call can fail with.
//! - [`AuthError`]: what a login step can fail with. A pending challenge is
//!   not an error; see [`crate::security::LoginOutcome`].
//! - [`UnlockError`]: screen-lock re-authentication failures, including the
//!   policy-imposed lockout.
//! - [`RenewalError`]: contract renewal request failures.
//!
//! `Display` texts are written for inline display next to the form that
//! triggered them. They never include credentials.

use thiserror::Error;

/// Failure of a remote collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Backend unreachable, timed out, or the connection dropped.
    #[error("Unable to reach the server: {0}")]
    Transport(String),

    /// Credentials or challenge answer refused.
    #[error("{message}")]
    Rejected {
        message: String,
        attempts_remaining: Option<u32>,
    },

    /// The requested resource has no meaning for the caller's role.
    #[error("Not applicable for this role")]
    NotApplicable,

    /// Any other non-success status.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The response body did not match the expected shape.
    #[error("Unexpected response from server: {0}")]
    Decode(String),
}

impl ApiError {
    /// Transport failures are the ones that must fail closed.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Failure of a login step on the session machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Bad credentials or a wrong challenge answer.
    #[error("{}", rejected_message(.message, .attempts_remaining))]
    Rejected {
        message: String,
        attempts_remaining: Option<u32>,
    },

    /// Server unreachable.
    #[error("Unable to reach the server. Please try again.")]
    Transport(String),

    /// Another step of the same login attempt is still awaiting a response.
    #[error("A sign-in step is already in progress")]
    StepInFlight,

    /// A challenge answer was submitted but no such challenge is pending.
    #[error("No verification step is pending. Please sign in again.")]
    NoPendingChallenge,

    /// The operation needs an established session.
    #[error("Not signed in")]
    NotAuthenticated,
}

fn rejected_message(message: &str, attempts_remaining: &Option<u32>) -> String {
    match attempts_remaining {
        Some(1) => format!("{} 1 attempt remaining.", message),
        Some(n) => format!("{} {} attempts remaining.", message, n),
        None => message.to_string(),
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Rejected {
                message,
                attempts_remaining,
            } => AuthError::Rejected {
                message,
                attempts_remaining,
            },
            ApiError::Transport(detail) => AuthError::Transport(detail),
            // Anything else on a credential endpoint is a refusal as far as
            // the user is concerned.
            ApiError::NotApplicable => AuthError::Rejected {
                message: "Sign-in is not available for this account.".to_string(),
                attempts_remaining: None,
            },
            ApiError::Server { message, .. } | ApiError::Decode(message) => AuthError::Rejected {
                message,
                attempts_remaining: None,
            },
        }
    }
}

/// Failure to unlock the screen lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnlockError {
    /// Too many failures; further attempts are refused until the deadline.
    #[error("Too many failed attempts. Try again in {remaining_secs} seconds.")]
    LockedOut { remaining_secs: u64 },

    /// Wrong password (or the check could not be performed).
    #[error("{}", unlock_rejected_message(.attempts_remaining))]
    Rejected { attempts_remaining: u32 },

    /// The screen is not locked.
    #[error("Screen is not locked")]
    NotLocked,

    /// There is no session to unlock into.
    #[error("Session has ended. Please sign in again.")]
    NoSession,

    /// An unlock attempt is already being verified.
    #[error("Verification in progress")]
    InFlight,
}

fn unlock_rejected_message(attempts_remaining: &u32) -> String {
    if *attempts_remaining == 1 {
        "Incorrect password. 1 attempt remaining.".to_string()
    } else {
        format!("Incorrect password. {} attempts remaining.", attempts_remaining)
    }
}

/// Failure of a contract renewal request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    #[error("Invalid renewal request: {0}")]
    Invalid(String),

    #[error("Renewal request was not accepted: {0}")]
    Refused(String),

    #[error("Renewals are not available for this account")]
    NotApplicable,

    #[error("Unable to submit renewal request: {0}")]
    Failed(String),
}

impl From<ApiError> for RenewalError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NotApplicable => RenewalError::NotApplicable,
            ApiError::Rejected { message, .. } => RenewalError::Refused(message),
            other => RenewalError::Failed(other.to_string()),
        }
    }
}
