// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Contract/Status Gate
//!
//! For organization-owning roles, re-validates the session and the
//! organization's usage contract right after authentication and then on a
//! fixed interval.
//!
//! | Check result                         | Effect                          |
//! |--------------------------------------|---------------------------------|
//! | user inactive, or check failed       | forced logout (fail closed)     |
//! | contract valid, > 30 days left       | nothing                         |
//! | contract valid, <= 30 days left      | soft warning in the log         |
//! | contract invalid, in grace period    | blocking advisory, closable     |
//! | contract invalid, no grace           | blocking advisory, not closable |
//! | contract endpoint not applicable     | suppressed                      |
//!
//! Contract fetch failures other than "not applicable" leave the previous
//! advisory in place; they never touch the inactivity timers.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::locks::{resilient_read, resilient_write};
use super::session::{AuthSessionMachine, Liveness};
use crate::api::{AuthApi, EntitlementApi};
use crate::audit::{SecurityEvent, TerminationReason};
use crate::errors::{ApiError, RenewalError};
use crate::types::{ContractInfo, RenewalRequest, RenewalResponse, UserIdentity};

/// Days before expiry at which a valid contract is logged as expiring.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Allowed renewal durations, in months.
pub const RENEWAL_MONTHS: std::ops::RangeInclusive<u32> = 1..=36;

/// Shortest accepted time between two status checks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Blocking notice about an invalid contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractAdvisory {
    /// Only true while the contract is in its grace period.
    pub closable: bool,
    pub dismissed: bool,
    pub contract: ContractInfo,
}

impl ContractAdvisory {
    pub fn is_blocking(&self) -> bool {
        !self.dismissed
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Nobody signed in, or the session changed mid-check.
    Skipped,
    /// Role has no organization.
    Exempt,
    Valid,
    ExpiringSoon { days: i64 },
    Blocked { closable: bool },
    /// Contract endpoint reported "not applicable".
    Suppressed,
    /// Contract could not be fetched; previous advisory kept.
    Unavailable,
    /// Liveness failed; the session was ended.
    Terminated,
}

pub struct ContractGate<A, E> {
    machine: Arc<AuthSessionMachine<A>>,
    entitlements: Arc<E>,
    interval: Duration,
    contract: RwLock<Option<ContractInfo>>,
    advisory: watch::Sender<Option<ContractAdvisory>>,
    poller: RwLock<Option<JoinHandle<()>>>,
}

impl<A: AuthApi, E: EntitlementApi> ContractGate<A, E> {
    /// Create a stopped gate.
    ///
    /// # Arguments
    ///
    /// * `machine` - Session machine whose user is checked and, on a failed
    ///   liveness check, logged out
    /// * `entitlements` - Contract endpoints
    /// * `interval` - Time between checks. Values below [`MIN_POLL_INTERVAL`]
    ///   are raised to it.
    pub fn new(machine: Arc<AuthSessionMachine<A>>, entitlements: Arc<E>, interval: Duration) -> Self {
        if interval < MIN_POLL_INTERVAL {
            tracing::warn!(
                requested_ms = interval.as_millis() as u64,
                "status check interval too short; using {}ms",
                MIN_POLL_INTERVAL.as_millis()
            );
        }
        let (advisory, _) = watch::channel(None);
        Self {
            machine,
            entitlements,
            interval: interval.max(MIN_POLL_INTERVAL),
            contract: RwLock::new(None),
            advisory,
            poller: RwLock::new(None),
        }
    }

    pub fn contract(&self) -> Option<ContractInfo> {
        resilient_read(&self.contract).clone()
    }

    pub fn advisory(&self) -> Option<ContractAdvisory> {
        self.advisory.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ContractAdvisory>> {
        self.advisory.subscribe()
    }

    /// Whether action-taking screens must be blocked for the current user.
    pub fn blocks_action_screens(&self) -> bool {
        self.advisory
            .borrow()
            .as_ref()
            .is_some_and(ContractAdvisory::is_blocking)
    }

    pub fn is_running(&self) -> bool {
        resilient_read(&self.poller).is_some()
    }

    /// Start polling. The first check runs immediately. Restarting replaces
    /// the previous poller.
    pub fn start(self: &Arc<Self>) {
        let gate = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gate.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if gate.evaluate().await == GateOutcome::Terminated {
                    break;
                }
            }
        });

        if let Some(previous) = resilient_write(&self.poller).replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling and forget the contract snapshot.
    pub fn stop(&self) {
        if let Some(handle) = resilient_write(&self.poller).take() {
            handle.abort();
        }
        *resilient_write(&self.contract) = None;
        self.advisory.send_if_modified(|a| a.take().is_some());
    }

    /// Run one liveness and contract check.
    pub async fn evaluate(&self) -> GateOutcome {
        let Some(user) = self.machine.current_user() else {
            return GateOutcome::Skipped;
        };
        if !user.role.owns_organization() {
            return GateOutcome::Exempt;
        }

        if self.machine.verify_liveness().await == Liveness::Inactive {
            self.terminate().await;
            return GateOutcome::Terminated;
        }
        if !self.still_current(&user) {
            return GateOutcome::Skipped;
        }

        match self.entitlements.get_contract_status().await {
            Ok(info) => {
                if !self.still_current(&user) {
                    return GateOutcome::Skipped;
                }
                self.apply(&user, info)
            }
            Err(ApiError::NotApplicable) => {
                tracing::debug!(user = %user.id, "contract status not applicable for this account");
                self.advisory.send_if_modified(|a| a.take().is_some());
                GateOutcome::Suppressed
            }
            Err(e) => {
                tracing::warn!(user = %user.id, error = %e, "contract status check failed");
                GateOutcome::Unavailable
            }
        }
    }

    /// Run the forced logout on its own task so stopping the poller (which
    /// the logout itself triggers) cannot cut it short.
    async fn terminate(&self) {
        let machine = Arc::clone(&self.machine);
        let task = tokio::spawn(async move {
            machine.force_logout(TerminationReason::Deactivated).await;
        });
        if let Err(e) = task.await {
            tracing::error!(error = %e, "forced logout task failed");
        }
    }

    fn still_current(&self, user: &UserIdentity) -> bool {
        self.machine
            .current_user()
            .is_some_and(|current| current.id == user.id)
    }

    fn apply(&self, user: &UserIdentity, info: ContractInfo) -> GateOutcome {
        *resilient_write(&self.contract) = Some(info.clone());

        if info.is_valid {
            self.advisory.send_if_modified(|a| a.take().is_some());
            return match info.days_until_expiry {
                Some(days) if days <= EXPIRY_WARNING_DAYS => {
                    tracing::warn!(
                        user = %user.id,
                        days_until_expiry = days,
                        "organization contract expires soon"
                    );
                    GateOutcome::ExpiringSoon { days }
                }
                _ => GateOutcome::Valid,
            };
        }

        let closable = info.is_in_grace_period;
        let status = info
            .contract_status
            .clone()
            .unwrap_or_else(|| if closable { "grace" } else { "expired" }.to_string());

        let raised = self.advisory.send_if_modified(|current| {
            // A dismissed grace advisory stays dismissed until the contract
            // state changes.
            let dismissed = matches!(
                current,
                Some(existing) if existing.dismissed && existing.closable && closable
            );
            let next = ContractAdvisory {
                closable,
                dismissed,
                contract: info,
            };
            if current.as_ref() == Some(&next) {
                false
            } else {
                *current = Some(next);
                true
            }
        });

        if raised {
            SecurityEvent::ContractBlocked {
                user_id: user.id.clone(),
                closable,
                status,
            }
            .emit();
        }
        GateOutcome::Blocked { closable }
    }

    /// Close the advisory. Only works while it is closable.
    pub fn dismiss_advisory(&self) -> bool {
        self.advisory.send_if_modified(|a| match a {
            Some(advisory) if advisory.closable && !advisory.dismissed => {
                advisory.dismissed = true;
                true
            }
            _ => false,
        })
    }

    /// Ask for a contract renewal. On success the contract is re-fetched.
    pub async fn request_renewal(
        &self,
        message: &str,
        months: u32,
    ) -> Result<RenewalResponse, RenewalError> {
        if !RENEWAL_MONTHS.contains(&months) {
            return Err(RenewalError::Invalid(format!(
                "duration must be between {} and {} months",
                RENEWAL_MONTHS.start(),
                RENEWAL_MONTHS.end()
            )));
        }
        let user = self
            .machine
            .current_user()
            .ok_or_else(|| RenewalError::Failed("not signed in".to_string()))?;
        if !user.role.owns_organization() {
            return Err(RenewalError::NotApplicable);
        }

        let request = RenewalRequest {
            message: message.trim().to_string(),
            requested_duration_months: months,
        };
        let response = self.entitlements.request_renewal(&request).await?;
        if !response.success {
            return Err(RenewalError::Refused(response.message));
        }

        tracing::info!(user = %user.id, months, "contract renewal requested");

        match self.entitlements.get_contract_status().await {
            Ok(info) if self.still_current(&user) => {
                self.apply(&user, info);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "contract refresh after renewal failed"),
        }
        Ok(response)
    }
}

impl<A, E> Drop for ContractGate<A, E> {
    fn drop(&mut self) {
        if let Some(handle) = resilient_write(&self.poller).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::session::AuthState;
    use crate::security::testing::{
        clinic_user, established, super_admin, valid_contract, ScriptedAuthApi,
        ScriptedEntitlements,
    };
    use crate::types::Credentials;

    fn contract(is_valid: bool, grace: bool, days: Option<i64>) -> ContractInfo {
        ContractInfo {
            is_valid,
            is_in_grace_period: grace,
            days_until_expiry: days,
            grace_period_days: grace.then_some(7),
            ..valid_contract()
        }
    }

    async fn gate_for(
        user: UserIdentity,
    ) -> (
        Arc<ScriptedAuthApi>,
        Arc<ScriptedEntitlements>,
        Arc<AuthSessionMachine<ScriptedAuthApi>>,
        Arc<ContractGate<ScriptedAuthApi, ScriptedEntitlements>>,
    ) {
        let api = Arc::new(ScriptedAuthApi::default());
        api.push_step(Ok(established(user.clone())));
        api.set_default_session(Ok(Some(user)));
        let machine = Arc::new(AuthSessionMachine::new(api.clone()));
        machine
            .login(&Credentials::new("x@example.org", "pw"))
            .await
            .unwrap();
        let entitlements = Arc::new(ScriptedEntitlements::default());
        let gate = Arc::new(ContractGate::new(
            machine.clone(),
            entitlements.clone(),
            Duration::from_secs(30),
        ));
        (api, entitlements, machine, gate)
    }

    #[tokio::test]
    async fn test_grace_period_advisory_is_closable() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Ok(contract(false, true, None)));

        assert_eq!(gate.evaluate().await, GateOutcome::Blocked { closable: true });
        assert!(gate.blocks_action_screens());
        assert!(gate.dismiss_advisory());
        assert!(!gate.blocks_action_screens());
    }

    #[tokio::test]
    async fn test_expired_advisory_is_not_closable() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Ok(contract(false, false, None)));

        assert_eq!(gate.evaluate().await, GateOutcome::Blocked { closable: false });
        assert!(!gate.dismiss_advisory());
        assert!(gate.blocks_action_screens());
    }

    #[tokio::test]
    async fn test_dismissed_grace_advisory_stays_dismissed() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.set_default_contract(Ok(contract(false, true, None)));

        gate.evaluate().await;
        gate.dismiss_advisory();
        gate.evaluate().await;
        assert!(gate.advisory().unwrap().dismissed);
    }

    #[tokio::test]
    async fn test_expiring_contract_only_warns() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Ok(contract(true, false, Some(12))));

        assert_eq!(gate.evaluate().await, GateOutcome::ExpiringSoon { days: 12 });
        assert!(gate.advisory().is_none());
    }

    #[tokio::test]
    async fn test_super_admin_is_exempt() {
        let (_, ent, _, gate) = gate_for(super_admin()).await;
        ent.push_contract(Ok(contract(false, false, None)));

        assert_eq!(gate.evaluate().await, GateOutcome::Exempt);
        assert_eq!(ent.contract_calls(), 0);
        assert!(!gate.blocks_action_screens());
    }

    #[tokio::test]
    async fn test_not_applicable_is_suppressed() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Err(ApiError::NotApplicable));
        assert_eq!(gate.evaluate().await, GateOutcome::Suppressed);
        assert!(gate.advisory().is_none());
    }

    #[tokio::test]
    async fn test_contract_fetch_failure_keeps_previous_advisory() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Ok(contract(false, false, None)));
        ent.push_contract(Err(ApiError::Transport("down".into())));

        gate.evaluate().await;
        assert_eq!(gate.evaluate().await, GateOutcome::Unavailable);
        assert!(gate.blocks_action_screens());
    }

    #[tokio::test]
    async fn test_liveness_failure_forces_logout() {
        let (api, _, machine, gate) = gate_for(clinic_user()).await;
        api.push_session(Err(ApiError::Transport("timeout".into())));

        assert_eq!(gate.evaluate().await, GateOutcome::Terminated);
        assert_eq!(machine.auth_state(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn test_renewal_validates_duration() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        assert!(matches!(
            gate.request_renewal("please", 0).await,
            Err(RenewalError::Invalid(_))
        ));
        assert!(matches!(
            gate.request_renewal("please", 37).await,
            Err(RenewalError::Invalid(_))
        ));
        assert!(ent.renewal_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_renewal_refetches_contract() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.push_contract(Ok(contract(false, false, None)));
        gate.evaluate().await;
        assert!(gate.blocks_action_screens());

        ent.push_contract(Ok(contract(true, false, Some(365))));
        gate.request_renewal("Renew for a year", 12).await.unwrap();

        assert!(!gate.blocks_action_screens());
        let sent = ent.renewal_requests.lock().unwrap().clone();
        assert_eq!(sent[0].requested_duration_months, 12);
    }

    #[tokio::test]
    async fn test_refused_renewal_surfaces_message() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        ent.set_renewal(Ok(RenewalResponse {
            success: false,
            message: "A request is already pending".into(),
        }));
        assert_eq!(
            gate.request_renewal("again", 6).await,
            Err(RenewalError::Refused("A request is already pending".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_runs_on_interval_until_stopped() {
        let (_, ent, _, gate) = gate_for(clinic_user()).await;
        gate.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ent.contract_calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ent.contract_calls(), 3);

        gate.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ent.contract_calls(), 3);
        assert!(!gate.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let (api, _, machine, _) = gate_for(clinic_user()).await;
        let entitlements = Arc::new(ScriptedEntitlements::default());
        let gate = Arc::new(ContractGate::new(
            machine.clone(),
            entitlements.clone(),
            Duration::ZERO,
        ));
        gate.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entitlements.contract_calls(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(entitlements.contract_calls(), 4);
        assert!(gate.is_running());

        // The poller is still alive, so a deactivation is still caught.
        api.push_session(Err(ApiError::Transport("down".into())));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(machine.auth_state(), AuthState::Anonymous);
    }
}
