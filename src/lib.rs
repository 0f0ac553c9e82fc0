// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! clinicgate - session security core for the clinic console
//!
//! Sign-in, inactivity logout, screen lock, route authorization and
//! contract enforcement for a cookie-session backend.
//!
//! # Core Modules
//!
//! - [`security`] - Session machine, timers, lock guard, contract gate, route policy
//! - [`api`] - Backend collaborator traits and the HTTP implementation
//! - [`config`] - Console configuration (JSON file plus environment)
//! - [`audit`] - Security audit events
//! - [`errors`] - Error taxonomy
//! - [`types`] - Identities, credentials and contract snapshots

pub mod api;
pub mod audit;
pub mod config;
pub mod errors;
pub mod security;
pub mod types;

pub use api::{AuthApi, EntitlementApi, HttpBackend};
pub use config::{load_config, ConsoleConfig};
pub use errors::{ApiError, AuthError, RenewalError, UnlockError};
pub use security::{
    AuthSessionMachine, AuthState, ConsoleSession, ContractGate, InactivityTimer, LockGuard,
    LoginOutcome, RouteDecision, Session,
};
pub use types::{Credentials, Role, UserIdentity};
