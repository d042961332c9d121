//! Authorization gate: caller clearance versus script risk.
//!
//! The decision itself is a pure function ([`authorize`]). The
//! [`AuthorizationSource`](crate::AuthorizationSource) implementations here
//! only decide where the caller's clearance comes from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Caller, PermissionLevel, RiskLevel, SecurityAnalysis};
use crate::AuthorizationSource;

/// Outcome of the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    /// The execution may proceed.
    Allowed,
    /// The caller's clearance is below the script's risk.
    Denied {
        /// Why.
        reason: String,
    },
    /// Clearance suffices but the risk demands a fresh step-up verification.
    RequiresStepUpVerification,
}

impl AuthorizationDecision {
    /// True for `Allowed`.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Decide whether a caller with `permission` may run a script with this
/// analysis.
///
/// Permission below risk is a denial. Otherwise `High` and `Critical` scripts
/// need a recent step-up verification.
pub fn authorize(
    permission: PermissionLevel,
    analysis: &SecurityAnalysis,
    has_recent_step_up: bool,
) -> AuthorizationDecision {
    let risk = analysis.risk_score;
    if permission < risk {
        return AuthorizationDecision::Denied {
            reason: format!("caller permission '{permission}' is below script risk '{risk}'"),
        };
    }
    if risk >= RiskLevel::High && !has_recent_step_up {
        return AuthorizationDecision::RequiresStepUpVerification;
    }
    AuthorizationDecision::Allowed
}

/// Trusts the clearance carried on the [`Caller`].
///
/// Suitable when an upstream service has already resolved the caller's
/// permission level and hands it to the engine with the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyGate;

#[async_trait::async_trait]
impl AuthorizationSource for PolicyGate {
    async fn check_permission(
        &self,
        caller: &Caller,
        analysis: &SecurityAnalysis,
    ) -> AuthorizationDecision {
        authorize(caller.permission_level, analysis, caller.has_recent_step_up)
    }
}

/// Looks the caller's clearance up in a fixed table, ignoring the level the
/// caller claims. Unknown callers get `default_level`.
#[derive(Debug, Clone)]
pub struct StaticPolicyGate {
    levels: HashMap<String, PermissionLevel>,
    default_level: PermissionLevel,
}

impl StaticPolicyGate {
    /// An empty table where everyone gets `default_level`.
    pub fn new(default_level: PermissionLevel) -> Self {
        Self {
            levels: HashMap::new(),
            default_level,
        }
    }

    /// Grant `level` to `caller_id`.
    pub fn grant(mut self, caller_id: impl Into<String>, level: PermissionLevel) -> Self {
        self.levels.insert(caller_id.into(), level);
        self
    }

    /// The clearance the table assigns to `caller_id`.
    pub fn level_of(&self, caller_id: &str) -> PermissionLevel {
        self.levels
            .get(caller_id)
            .copied()
            .unwrap_or(self.default_level)
    }
}

#[async_trait::async_trait]
impl AuthorizationSource for StaticPolicyGate {
    async fn check_permission(
        &self,
        caller: &Caller,
        analysis: &SecurityAnalysis,
    ) -> AuthorizationDecision {
        authorize(
            self.level_of(&caller.id),
            analysis,
            caller.has_recent_step_up,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Finding, Location};

    fn analysis(risk: RiskLevel) -> SecurityAnalysis {
        let findings = if risk == RiskLevel::Low {
            vec![]
        } else {
            vec![Finding {
                severity: risk,
                rule: "test".into(),
                description: "test rule".into(),
                location: Location { line: 1, column: 1 },
            }]
        };
        SecurityAnalysis {
            risk_score: risk,
            findings,
        }
    }

    #[test]
    fn low_risk_allowed_for_everyone() {
        assert!(authorize(RiskLevel::Low, &analysis(RiskLevel::Low), false).is_allowed());
    }

    #[test]
    fn permission_below_risk_is_denied() {
        let decision = authorize(RiskLevel::High, &analysis(RiskLevel::Critical), true);
        match decision {
            AuthorizationDecision::Denied { reason } => {
                assert!(reason.contains("critical"), "reason: {reason}");
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }

    #[test]
    fn denial_wins_over_step_up() {
        // insufficient clearance is a denial even without a step-up
        let decision = authorize(RiskLevel::Medium, &analysis(RiskLevel::High), false);
        assert!(matches!(decision, AuthorizationDecision::Denied { .. }));
    }

    #[test]
    fn high_risk_without_step_up_requires_verification() {
        assert_eq!(
            authorize(RiskLevel::High, &analysis(RiskLevel::High), false),
            AuthorizationDecision::RequiresStepUpVerification
        );
        assert_eq!(
            authorize(RiskLevel::Critical, &analysis(RiskLevel::Critical), false),
            AuthorizationDecision::RequiresStepUpVerification
        );
    }

    #[test]
    fn high_risk_with_step_up_is_allowed() {
        assert!(authorize(RiskLevel::Critical, &analysis(RiskLevel::High), true).is_allowed());
    }

    #[test]
    fn medium_risk_needs_no_step_up() {
        assert!(authorize(RiskLevel::Medium, &analysis(RiskLevel::Medium), false).is_allowed());
    }

    #[tokio::test]
    async fn policy_gate_uses_caller_level() {
        let caller = Caller::new("alice", RiskLevel::Medium);
        let decision = PolicyGate
            .check_permission(&caller, &analysis(RiskLevel::Critical))
            .await;
        assert!(matches!(decision, AuthorizationDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn static_gate_ignores_claimed_level() {
        let gate = StaticPolicyGate::new(RiskLevel::Low).grant("ops", RiskLevel::Critical);
        let claimed = Caller::new("mallory", RiskLevel::Critical).with_step_up();
        let decision = gate
            .check_permission(&claimed, &analysis(RiskLevel::High))
            .await;
        assert!(matches!(decision, AuthorizationDecision::Denied { .. }));

        let ops = Caller::new("ops", RiskLevel::Low).with_step_up();
        let decision = gate.check_permission(&ops, &analysis(RiskLevel::High)).await;
        assert!(decision.is_allowed());
    }
}
