use std::collections::BTreeSet;
use std::sync::Arc;

use nsmr_core::audit::CallContext;
use nsmr_core::authz::AccessRequest;
use nsmr_core::clock::Clock;
use nsmr_core::domain::identity::Principal;
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::errors::WorkflowError;
use nsmr_db::repositories::ApproverRepository;

use crate::roles::RoleRegistry;

/// Per-level approver sets. Every mutation is admin-gated before the store is touched.
#[derive(Clone)]
pub struct ApproverRegistry {
    approvers: Arc<dyn ApproverRepository>,
    roles: RoleRegistry,
    clock: Arc<dyn Clock>,
}

impl ApproverRegistry {
    pub fn new(
        approvers: Arc<dyn ApproverRepository>,
        roles: RoleRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { approvers, roles, clock }
    }

    async fn authorize(&self, context: &CallContext, level: ApprovalLevel) -> Result<(), WorkflowError> {
        self.roles.require_admin(&context.caller, &AccessRequest::ManageApprovers { level }).await
    }

    /// Returns `true` if the approver was newly added.
    pub async fn assign(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, WorkflowError> {
        self.authorize(context, level).await?;
        Ok(self.approvers.assign(level, approver, self.clock.now()).await?)
    }

    /// Returns `true` if the approver was present.
    pub async fn remove(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, WorkflowError> {
        self.authorize(context, level).await?;
        Ok(self.approvers.remove(level, approver).await?)
    }

    pub async fn reassign(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approvers: impl IntoIterator<Item = Principal>,
    ) -> Result<BTreeSet<Principal>, WorkflowError> {
        let approvers: BTreeSet<Principal> = approvers.into_iter().collect();
        self.authorize(context, level).await?;
        self.approvers.reassign(level, &approvers, self.clock.now()).await?;
        Ok(approvers)
    }

    pub async fn is_approver(
        &self,
        level: ApprovalLevel,
        identity: &Principal,
    ) -> Result<bool, WorkflowError> {
        Ok(self.approvers.is_approver(level, identity).await?)
    }

    pub async fn approvers_of(
        &self,
        level: ApprovalLevel,
    ) -> Result<BTreeSet<Principal>, WorkflowError> {
        Ok(self.approvers.approvers_of(level).await?)
    }
}
