// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security audit events for the session core.
//!
//! Every authentication, lock and termination transition is written as a
//! single pipe-delimited line on the `clinicgate::audit` target:
//!
//! `2025-01-15 10:23:45 UTC | LOGIN_REJECTED | attempt=att_3f2a91c0 email=d***@clinic.org`
//!
//! Audit lines never carry passwords, captcha answers or one-time codes.
//! E-mail addresses are masked and free text goes through [`redact_secrets`].

use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;

use crate::types::Role;

/// JUSTIFICATION for .expect(): static patterns, validated by the tests below.
static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)(password|passwd|pwd)\s*[=:]\s*\S+").expect("password regex is valid"),
            "password=[REDACTED]",
        ),
        (
            Regex::new(r"(?i)(otp|code|token|answer)\s*[=:]\s*\S+").expect("code regex is valid"),
            "$1=[REDACTED]",
        ),
        (
            Regex::new(r"Bearer [a-zA-Z0-9\-._~+/]+=*").expect("bearer regex is valid"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"\b[A-Za-z0-9]{32,}\b").expect("generic key regex is valid"),
            "[REDACTED_KEY]",
        ),
    ]
});

/// Redact secrets from free text before it reaches a log line.
pub fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, replacement) in REDACTION_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

/// Mask an e-mail address down to its first character and domain.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        _ => "***".to_string(),
    }
}

/// Why a session was ended without the user asking for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Hard inactivity deadline reached.
    InactivityTimeout,
    /// Status check reported the account inactive (or could not confirm it).
    Deactivated,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::InactivityTimeout => "inactivity_timeout",
            TerminationReason::Deactivated => "account_deactivated",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Security-relevant transitions.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    SessionRestored { user_id: String, role: Role },
    SessionCheckFailed { detail: String },
    LoginEstablished { attempt: String, user_id: String, role: Role },
    ChallengeIssued { attempt: String, challenge: &'static str },
    BackupCodeUsed { attempt: String, codes_remaining: Option<u32> },
    LoginRejected { attempt: String, email: String, detail: String },
    LoginAbandoned { attempt: String },
    LoggedOut { user_id: Option<String> },
    ForcedLogout { user_id: Option<String>, reason: TerminationReason },
    ScreenLocked { user_id: String },
    ScreenUnlocked { user_id: String },
    UnlockFailed { user_id: String, failed_attempts: u32 },
    LockoutStarted { user_id: String, duration_secs: u64 },
    InactivityWarning { expires_in_secs: u64 },
    ContractBlocked { user_id: String, closable: bool, status: String },
}

impl SecurityEvent {
    /// Format event for the audit log.
    pub fn to_audit_string(&self) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        match self {
            SecurityEvent::SessionRestored { user_id, role } => {
                format!("{} | SESSION_RESTORED | user={} role={}", timestamp, user_id, role)
            }
            SecurityEvent::SessionCheckFailed { detail } => {
                format!("{} | SESSION_CHECK_FAILED | detail={}", timestamp, redact_secrets(detail))
            }
            SecurityEvent::LoginEstablished { attempt, user_id, role } => {
                format!(
                    "{} | LOGIN_ESTABLISHED | attempt={} user={} role={}",
                    timestamp, attempt, user_id, role
                )
            }
            SecurityEvent::ChallengeIssued { attempt, challenge } => {
                format!(
                    "{} | CHALLENGE_ISSUED | attempt={} challenge={}",
                    timestamp, attempt, challenge
                )
            }
            SecurityEvent::BackupCodeUsed { attempt, codes_remaining } => {
                let remaining = codes_remaining
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "{} | BACKUP_CODE_USED | attempt={} remaining={}",
                    timestamp, attempt, remaining
                )
            }
            SecurityEvent::LoginRejected { attempt, email, detail } => {
                format!(
                    "{} | LOGIN_REJECTED | attempt={} email={} detail={}",
                    timestamp,
                    attempt,
                    mask_email(email),
                    redact_secrets(detail)
                )
            }
            SecurityEvent::LoginAbandoned { attempt } => {
                format!("{} | LOGIN_ABANDONED | attempt={}", timestamp, attempt)
            }
            SecurityEvent::LoggedOut { user_id } => {
                format!(
                    "{} | LOGGED_OUT | user={}",
                    timestamp,
                    user_id.as_deref().unwrap_or("-")
                )
            }
            SecurityEvent::ForcedLogout { user_id, reason } => {
                format!(
                    "{} | FORCED_LOGOUT | user={} reason={}",
                    timestamp,
                    user_id.as_deref().unwrap_or("-"),
                    reason
                )
            }
            SecurityEvent::ScreenLocked { user_id } => {
                format!("{} | SCREEN_LOCKED | user={}", timestamp, user_id)
            }
            SecurityEvent::ScreenUnlocked { user_id } => {
                format!("{} | SCREEN_UNLOCKED | user={}", timestamp, user_id)
            }
            SecurityEvent::UnlockFailed { user_id, failed_attempts } => {
                format!(
                    "{} | UNLOCK_FAILED | user={} failed_attempts={}",
                    timestamp, user_id, failed_attempts
                )
            }
            SecurityEvent::LockoutStarted { user_id, duration_secs } => {
                format!(
                    "{} | LOCKOUT_STARTED | user={} duration={}s",
                    timestamp, user_id, duration_secs
                )
            }
            SecurityEvent::InactivityWarning { expires_in_secs } => {
                format!("{} | INACTIVITY_WARNING | expires_in={}s", timestamp, expires_in_secs)
            }
            SecurityEvent::ContractBlocked { user_id, closable, status } => {
                format!(
                    "{} | CONTRACT_BLOCKED | user={} closable={} status={}",
                    timestamp, user_id, closable, status
                )
            }
        }
    }

    /// Emit the event at the level matching its severity.
    pub fn emit(&self) {
        let line = self.to_audit_string();
        match self {
            SecurityEvent::LoginRejected { .. }
            | SecurityEvent::UnlockFailed { .. }
            | SecurityEvent::LockoutStarted { .. }
            | SecurityEvent::ForcedLogout { .. }
            | SecurityEvent::SessionCheckFailed { .. }
            | SecurityEvent::InactivityWarning { .. }
            | SecurityEvent::ContractBlocked { .. } => {
                tracing::warn!(target: "clinicgate::audit", "{}", line)
            }
            _ => tracing::info!(target: "clinicgate::audit", "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_patterns_compile() {
        assert!(!REDACTION_PATTERNS.is_empty());
    }

    #[test]
    fn test_redact_password_and_codes() {
        let out = redact_secrets("login failed password=hunter2 otp: 123456");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("123456"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("doctor@clinic.org"), "d***@clinic.org");
        assert_eq!(mask_email("not-an-email"), "***");
        assert_eq!(mask_email("@x.org"), "***");
    }

    #[test]
    fn test_rejected_login_audit_masks_email() {
        let event = SecurityEvent::LoginRejected {
            attempt: "att_1".to_string(),
            email: "ana@clinic.org".to_string(),
            detail: "Invalid credentials".to_string(),
        };
        let line = event.to_audit_string();
        assert!(line.contains("LOGIN_REJECTED"));
        assert!(line.contains("a***@clinic.org"));
        assert!(!line.contains("ana@clinic.org"));
    }

    #[test]
    fn test_forced_logout_audit_names_reason() {
        let event = SecurityEvent::ForcedLogout {
            user_id: Some("u-7".to_string()),
            reason: TerminationReason::Deactivated,
        };
        let line = event.to_audit_string();
        assert!(line.contains("FORCED_LOGOUT"));
        assert!(line.contains("reason=account_deactivated"));
    }
}
