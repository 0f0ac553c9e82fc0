// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session security core.
//!
//! ## Components
//!
//! - [`session`]: the auth session machine, sole owner of [`Session`]
//! - [`inactivity`]: warning countdown and hard inactivity logout
//! - [`activity`]: throttled user-activity pulses feeding the timer
//! - [`lock_guard`]: manual screen lock with lockout policy
//! - [`lock_store`]: per-tab persistence of the lock state
//! - [`contract_gate`]: liveness polling and contract advisories
//! - [`route_policy`]: role-based route authorization
//! - [`runtime`]: wiring of all of the above for one console session
//!
//! ## Controls
//!
//! - **Session timeout**: forced logout after the configured inactivity
//!   period (default 15 minutes), preceded by a countdown warning
//! - **Session lock**: manual lock requiring the account password, with a
//!   lockout after repeated failures
//! - **Fail closed**: a liveness check that cannot complete ends the session
//! - **Audit logging**: every transition is written to `clinicgate::audit`
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use clinicgate::api::HttpBackend;
//! use clinicgate::config::ConsoleConfig;
//! use clinicgate::security::ConsoleSession;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ConsoleConfig::default();
//! let backend = Arc::new(HttpBackend::new(&config.api)?);
//! let console = ConsoleSession::in_memory(config, backend.clone(), backend);
//! console.start().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use crate::audit::TerminationReason;

pub mod activity;
pub mod contract_gate;
pub mod inactivity;
pub mod lock_guard;
pub mod lock_store;
pub mod locks;
pub mod route_policy;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{ActivityKind, ActivityMonitor, ActivitySink};
pub use contract_gate::{ContractAdvisory, ContractGate, GateOutcome, RENEWAL_MONTHS};
pub use inactivity::{InactivityState, InactivityTimer};
pub use lock_guard::{
    Clock, InputTarget, KeyChord, KeyDisposition, LockGuard, LockState, ManualClock, SystemClock,
};
pub use lock_store::{FileLockStore, LockStore, MemoryLockStore, TabId};
pub use locks::{resilient_read, resilient_write};
pub use route_policy::{
    authorize, decide, default_landing, role_home, RouteDecision, RouteRule, ROUTES,
};
pub use runtime::ConsoleSession;
pub use session::{
    AuthSessionMachine, AuthState, CredentialChallenge, Liveness, LoginOutcome, LoginPhase,
    NavigationEvent, Session, UnlockGrant, LOGIN_PATH,
};

/// Something that can end the current session on the user's behalf.
///
/// The inactivity timer and the contract gate only need this narrow view of
/// the session machine.
pub trait SessionTerminator: Send + Sync + 'static {
    /// End the session for `reason` and send the user to the entry screen.
    fn terminate(&self, reason: TerminationReason) -> impl Future<Output = ()> + Send;
}

impl<A: crate::api::AuthApi> SessionTerminator for AuthSessionMachine<A> {
    async fn terminate(&self, reason: TerminationReason) {
        self.force_logout(reason).await
    }
}
