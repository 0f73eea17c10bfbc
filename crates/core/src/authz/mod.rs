use serde::{Deserialize, Serialize};

use crate::domain::identity::{Principal, UserRole};
use crate::domain::level::ApprovalLevel;

/// Role-gated operation a caller is trying to perform. Level-scoped operations
/// (deciding, reading a level queue) go through [`AccessPolicy::evaluate_level`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessRequest {
    ManageApprovers { level: ApprovalLevel },
    AssignRoles { target: Principal },
    ViewProfile { owner: Principal },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessFailure {
    AdminRequired { caller: Principal, role: UserRole },
    NotLevelApprover { caller: Principal, level: ApprovalLevel },
    NotProfileOwner { caller: Principal, owner: Principal },
}

impl AccessFailure {
    pub fn reason(&self) -> String {
        match self {
            Self::AdminRequired { caller, role } => {
                format!("caller `{caller}` holds role `{role}` but `admin` is required")
            }
            Self::NotLevelApprover { caller, level } => {
                format!("caller `{caller}` is not an approver for level {level}")
            }
            Self::NotProfileOwner { caller, owner } => {
                format!("caller `{caller}` may not read the profile of `{owner}`")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    pub failure: Option<AccessFailure>,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into(), failure: None }
    }

    fn deny(failure: AccessFailure) -> Self {
        Self { allowed: false, reason: failure.reason(), failure: Some(failure) }
    }

    pub fn into_result(self) -> Result<(), AccessFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Pure authorization rules. Evaluating a request never touches storage; the caller
/// gathers role and membership facts first.
#[derive(Clone, Debug, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    pub fn evaluate(
        &self,
        caller: &Principal,
        caller_role: UserRole,
        request: &AccessRequest,
    ) -> AccessDecision {
        match request {
            AccessRequest::ManageApprovers { level } => {
                if !caller_role.is_admin() {
                    return AccessDecision::deny(AccessFailure::AdminRequired {
                        caller: caller.clone(),
                        role: caller_role,
                    });
                }
                AccessDecision::allow(format!("admin `{caller}` may manage level {level} approvers"))
            }
            AccessRequest::AssignRoles { target } => {
                if !caller_role.is_admin() {
                    return AccessDecision::deny(AccessFailure::AdminRequired {
                        caller: caller.clone(),
                        role: caller_role,
                    });
                }
                AccessDecision::allow(format!("admin `{caller}` may assign a role to `{target}`"))
            }
            AccessRequest::ViewProfile { owner } => {
                if owner != caller && !caller_role.is_admin() {
                    return AccessDecision::deny(AccessFailure::NotProfileOwner {
                        caller: caller.clone(),
                        owner: owner.clone(),
                    });
                }
                AccessDecision::allow(format!("`{caller}` may read the profile of `{owner}`"))
            }
        }
    }

    /// Deciding at a level or reading its queue depends on membership alone; roles,
    /// admin included, grant nothing here.
    pub fn evaluate_level(
        &self,
        caller: &Principal,
        level: ApprovalLevel,
        is_member: bool,
    ) -> AccessDecision {
        if !is_member {
            return AccessDecision::deny(AccessFailure::NotLevelApprover {
                caller: caller.clone(),
                level,
            });
        }
        AccessDecision::allow(format!("`{caller}` is an approver for level {level}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessFailure, AccessPolicy, AccessRequest};
    use crate::domain::identity::{Principal, UserRole};
    use crate::domain::level::ApprovalLevel;

    fn caller() -> Principal {
        Principal::new("u-caller")
    }

    #[test]
    fn approver_management_requires_admin() {
        let request = AccessRequest::ManageApprovers { level: ApprovalLevel::FIRST };

        let denied = AccessPolicy.evaluate(&caller(), UserRole::User, &request);
        assert!(!denied.allowed);
        assert_eq!(
            denied.failure,
            Some(AccessFailure::AdminRequired { caller: caller(), role: UserRole::User })
        );

        assert!(AccessPolicy.evaluate(&caller(), UserRole::Admin, &request).allowed);
    }

    #[test]
    fn level_access_requires_membership() {
        let decision = AccessPolicy.evaluate_level(&caller(), ApprovalLevel::FINAL, false);

        assert_eq!(
            decision.into_result(),
            Err(AccessFailure::NotLevelApprover { caller: caller(), level: ApprovalLevel::FINAL })
        );
    }

    #[test]
    fn level_members_are_allowed() {
        let decision = AccessPolicy.evaluate_level(&caller(), ApprovalLevel::FIRST, true);
        assert!(decision.into_result().is_ok());
    }

    #[test]
    fn profiles_are_visible_to_owner_and_admins_only() {
        let other = Principal::new("u-other");
        let request = AccessRequest::ViewProfile { owner: other.clone() };

        let denied = AccessPolicy.evaluate(&caller(), UserRole::User, &request);
        assert!(denied.reason.contains("u-other"));
        assert!(!denied.allowed);

        assert!(AccessPolicy.evaluate(&caller(), UserRole::Admin, &request).allowed);
        assert!(AccessPolicy
            .evaluate(&other, UserRole::Guest, &AccessRequest::ViewProfile { owner: other.clone() })
            .allowed);
    }
}
