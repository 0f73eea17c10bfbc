use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use nsmr_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, CallContext};
use nsmr_core::authz::{AccessPolicy, AccessRequest};
use nsmr_core::clock::{Clock, MonotonicClock};
use nsmr_core::domain::identity::{Principal, UserProfile, UserRole};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{ManufacturingRequest, RequestId};
use nsmr_core::errors::WorkflowError;
use nsmr_core::flows::{
    normalize_comment, Decision, DecisionEvent, FlowAction, FlowEngine, LinearApprovalFlow,
    TransitionOutcome,
};
use nsmr_db::repositories::{
    ApproverRepository, InMemoryApproverRepository, InMemoryProfileRepository,
    InMemoryRequestRepository, InMemoryRoleRepository, ProfileRepository, RequestRepository,
    RoleRepository, SqlApproverRepository, SqlProfileRepository, SqlRequestRepository,
    SqlRoleRepository,
};
use nsmr_db::DbPool;

use crate::approvers::ApproverRegistry;
use crate::roles::RoleRegistry;

/// Storage backends the service runs on.
#[derive(Clone)]
pub struct WorkflowStores {
    pub requests: Arc<dyn RequestRepository>,
    pub approvers: Arc<dyn ApproverRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
}

impl WorkflowStores {
    pub fn in_memory() -> Self {
        Self {
            requests: Arc::new(InMemoryRequestRepository::default()),
            approvers: Arc::new(InMemoryApproverRepository::default()),
            roles: Arc::new(InMemoryRoleRepository::default()),
            profiles: Arc::new(InMemoryProfileRepository::default()),
        }
    }

    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            requests: Arc::new(SqlRequestRepository::new(pool.clone())),
            approvers: Arc::new(SqlApproverRepository::new(pool.clone())),
            roles: Arc::new(SqlRoleRepository::new(pool.clone())),
            profiles: Arc::new(SqlProfileRepository::new(pool)),
        }
    }
}

/// Entry point for every mutation and query on manufacturing requests.
pub struct WorkflowService {
    requests: Arc<dyn RequestRepository>,
    profiles: Arc<dyn ProfileRepository>,
    approvers: ApproverRegistry,
    roles: RoleRegistry,
    flow: FlowEngine<LinearApprovalFlow>,
    policy: AccessPolicy,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl WorkflowService {
    pub fn new(stores: WorkflowStores, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        let roles = RoleRegistry::new(stores.roles, clock.clone());
        let approvers = ApproverRegistry::new(stores.approvers, roles.clone(), clock.clone());
        Self {
            requests: stores.requests,
            profiles: stores.profiles,
            approvers,
            roles,
            flow: FlowEngine::default(),
            policy: AccessPolicy,
            clock,
            audit,
        }
    }

    pub fn in_memory(audit: Arc<dyn AuditSink>) -> Self {
        Self::new(WorkflowStores::in_memory(), Arc::new(MonotonicClock::default()), audit)
    }

    pub fn sqlite(pool: DbPool, audit: Arc<dyn AuditSink>) -> Self {
        Self::new(WorkflowStores::sqlite(pool), Arc::new(MonotonicClock::default()), audit)
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn approvers(&self) -> &ApproverRegistry {
        &self.approvers
    }

    pub async fn bootstrap_admins(&self, admins: &[Principal]) -> Result<usize, WorkflowError> {
        let granted = self.roles.bootstrap_admins(admins).await?;
        for admin in admins {
            self.audit.emit(
                AuditEvent::new(
                    None,
                    "bootstrap",
                    "role.bootstrapped",
                    AuditCategory::System,
                    admin.as_str(),
                    AuditOutcome::Success,
                )
                .with_metadata("role", UserRole::Admin.as_str()),
            );
        }
        Ok(granted)
    }

    // Intake

    pub async fn submit(
        &self,
        context: &CallContext,
        content: &str,
    ) -> Result<ManufacturingRequest, WorkflowError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(WorkflowError::InvalidArgument(
                "request content must not be blank".to_owned(),
            ));
        }

        let request = self.requests.create(&context.caller, content, self.clock.now()).await?;

        info!(
            event_name = "workflow.request.submitted",
            correlation_id = %context.correlation_id,
            request_id = %request.id,
            creator = %request.creator,
            "manufacturing request submitted"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                context.correlation_id.clone(),
                "request.submitted",
                AuditCategory::Intake,
                context.caller.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("level", request.current_approval_level.to_string()),
        );

        Ok(request)
    }

    // Decisions

    pub async fn approve(
        &self,
        context: &CallContext,
        id: &RequestId,
        comment: Option<String>,
    ) -> Result<ManufacturingRequest, WorkflowError> {
        self.decide(context, id, DecisionEvent::Approve, comment).await
    }

    pub async fn reject(
        &self,
        context: &CallContext,
        id: &RequestId,
        comment: Option<String>,
    ) -> Result<ManufacturingRequest, WorkflowError> {
        self.decide(context, id, DecisionEvent::Reject, comment).await
    }

    /// Arguments, then existence, then lifecycle state, then level membership. The
    /// outcome is computed on the loaded snapshot and written with a version check, so
    /// a decision that raced another one fails without effect.
    async fn decide(
        &self,
        context: &CallContext,
        id: &RequestId,
        event: DecisionEvent,
        comment: Option<String>,
    ) -> Result<ManufacturingRequest, WorkflowError> {
        let comment = normalize_comment(event, comment)?;

        let request = self
            .requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| WorkflowError::request_not_found(id.as_str()))?;

        let decision = Decision {
            event,
            approver: context.caller.clone(),
            comment,
            decided_at: self.clock.now().max(request.updated_at),
        };
        let outcome =
            self.flow.apply_with_audit(&request, &decision, self.audit.as_ref(), context)?;

        let level = outcome.from_level;
        let is_member = self.approvers.is_approver(level, &context.caller).await?;
        let access = self.policy.evaluate_level(&context.caller, level, is_member);
        if let Err(failure) = access.into_result() {
            warn!(
                event_name = "workflow.request.decision_denied",
                correlation_id = %context.correlation_id,
                request_id = %id,
                level = %level,
                caller = %context.caller,
                "decision refused: caller is not an approver of the current level"
            );
            self.audit.emit(
                AuditEvent::new(
                    Some(id.clone()),
                    context.correlation_id.clone(),
                    "request.decision_denied",
                    AuditCategory::Decision,
                    context.caller.as_str(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("level", level.to_string())
                .with_metadata("event", decision_label(event)),
            );
            return Err(failure.into());
        }

        let updated = match self.requests.append_decision(&outcome).await {
            Ok(updated) => updated,
            Err(error) => {
                let error = WorkflowError::from(error);
                warn!(
                    event_name = "workflow.request.decision_failed",
                    correlation_id = %context.correlation_id,
                    request_id = %id,
                    level = %level,
                    error_class = error.error_class(),
                    error = %error,
                    "decision could not be recorded"
                );
                return Err(error);
            }
        };

        self.record_decision(context, &outcome);
        Ok(updated)
    }

    fn record_decision(&self, context: &CallContext, outcome: &TransitionOutcome) {
        let event_type = match outcome.action {
            FlowAction::Escalate => "request.escalated",
            FlowAction::CompleteWorkflow => "request.approved",
            FlowAction::TerminateWorkflow => "request.rejected",
        };

        info!(
            event_name = %format!("workflow.{event_type}"),
            correlation_id = %context.correlation_id,
            request_id = %outcome.request_id,
            from_level = %outcome.from_level,
            to_level = %outcome.to_level,
            to_status = outcome.to_status.as_str(),
            approver = %outcome.record.approver,
            "decision recorded"
        );

        let mut event = AuditEvent::new(
            Some(outcome.request_id.clone()),
            context.correlation_id.clone(),
            event_type,
            AuditCategory::Decision,
            context.caller.as_str(),
            AuditOutcome::Success,
        )
        .with_metadata("action", outcome.action.as_str())
        .with_metadata("from_level", outcome.from_level.to_string())
        .with_metadata("to_level", outcome.to_level.to_string())
        .with_metadata("to_status", outcome.to_status.as_str());
        if let Some(comment) = &outcome.record.comment {
            event = event.with_metadata("comment", comment.clone());
        }
        self.audit.emit(event);
    }

    // Queries

    pub async fn get_request(&self, id: &RequestId) -> Result<ManufacturingRequest, WorkflowError> {
        self.requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| WorkflowError::request_not_found(id.as_str()))
    }

    pub async fn get_all_requests(&self) -> Result<Vec<ManufacturingRequest>, WorkflowError> {
        Ok(self.requests.list_all().await?)
    }

    pub async fn get_user_requests(
        &self,
        identity: &Principal,
    ) -> Result<Vec<ManufacturingRequest>, WorkflowError> {
        Ok(self.requests.list_by_creator(identity).await?)
    }

    /// Active requests waiting at `level`. Only approvers of that level may look.
    pub async fn get_requests_by_level(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
    ) -> Result<Vec<ManufacturingRequest>, WorkflowError> {
        let is_member = self.approvers.is_approver(level, &context.caller).await?;
        self.policy.evaluate_level(&context.caller, level, is_member).into_result()?;

        Ok(self.requests.list_active_at_level(level).await?)
    }

    /// Every active request the caller could decide right now, across all levels.
    pub async fn my_approvals(
        &self,
        context: &CallContext,
    ) -> Result<Vec<ManufacturingRequest>, WorkflowError> {
        let mut queue = Vec::new();
        for level in ApprovalLevel::all() {
            match self.get_requests_by_level(context, level).await {
                Ok(requests) => queue.extend(requests),
                Err(error) if error.is_permission_denied() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(queue)
    }

    // Approver registry

    pub async fn approvers_of(
        &self,
        level: ApprovalLevel,
    ) -> Result<BTreeSet<Principal>, WorkflowError> {
        self.approvers.approvers_of(level).await
    }

    pub async fn assign_approver(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, WorkflowError> {
        let result = self.approvers.assign(context, level, approver).await;
        self.record_registry_change(context, "approvers.assigned", level, approver.as_str(), &result);
        result
    }

    pub async fn remove_approver(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, WorkflowError> {
        let result = self.approvers.remove(context, level, approver).await;
        self.record_registry_change(context, "approvers.removed", level, approver.as_str(), &result);
        result
    }

    pub async fn reassign_approvers(
        &self,
        context: &CallContext,
        level: ApprovalLevel,
        approvers: Vec<Principal>,
    ) -> Result<BTreeSet<Principal>, WorkflowError> {
        let result = self.approvers.reassign(context, level, approvers).await;
        let subject = match &result {
            Ok(set) => set.iter().map(Principal::as_str).collect::<Vec<_>>().join(","),
            Err(_) => String::new(),
        };
        self.record_registry_change(context, "approvers.reassigned", level, &subject, &result);
        result
    }

    fn record_registry_change<T>(
        &self,
        context: &CallContext,
        event_type: &str,
        level: ApprovalLevel,
        subject: &str,
        result: &Result<T, WorkflowError>,
    ) {
        let outcome = match result {
            Ok(_) => {
                info!(
                    event_name = %format!("registry.{event_type}"),
                    correlation_id = %context.correlation_id,
                    level = %level,
                    subject = %subject,
                    actor = %context.caller,
                    "approver registry updated"
                );
                AuditOutcome::Success
            }
            Err(error) => {
                warn!(
                    event_name = %format!("registry.{event_type}"),
                    correlation_id = %context.correlation_id,
                    level = %level,
                    actor = %context.caller,
                    error_class = error.error_class(),
                    "approver registry change refused"
                );
                AuditOutcome::Rejected
            }
        };

        self.audit.emit(
            AuditEvent::new(
                None,
                context.correlation_id.clone(),
                event_type,
                AuditCategory::Registry,
                context.caller.as_str(),
                outcome,
            )
            .with_metadata("level", level.to_string())
            .with_metadata("subject", subject),
        );
    }

    // Identity

    pub async fn caller_role(&self, context: &CallContext) -> Result<UserRole, WorkflowError> {
        self.roles.role_of(&context.caller).await
    }

    pub async fn is_caller_admin(&self, context: &CallContext) -> Result<bool, WorkflowError> {
        self.roles.is_admin(&context.caller).await
    }

    pub async fn assign_role(
        &self,
        context: &CallContext,
        target: &Principal,
        role: UserRole,
    ) -> Result<(), WorkflowError> {
        let result = self.roles.set_role(context, target, role).await;
        let outcome = if result.is_ok() { AuditOutcome::Success } else { AuditOutcome::Rejected };
        if result.is_ok() {
            info!(
                event_name = "identity.role.assigned",
                correlation_id = %context.correlation_id,
                target = %target,
                role = role.as_str(),
                actor = %context.caller,
                "role assigned"
            );
        }
        self.audit.emit(
            AuditEvent::new(
                None,
                context.correlation_id.clone(),
                "role.assigned",
                AuditCategory::Identity,
                context.caller.as_str(),
                outcome,
            )
            .with_metadata("target", target.as_str())
            .with_metadata("role", role.as_str()),
        );
        result
    }

    // Profiles

    pub async fn save_caller_profile(
        &self,
        context: &CallContext,
        name: &str,
    ) -> Result<UserProfile, WorkflowError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkflowError::InvalidArgument("profile name must not be blank".to_owned()));
        }

        let profile = UserProfile { name: name.to_owned() };
        self.profiles.save(&context.caller, profile.clone(), self.clock.now()).await?;
        Ok(profile)
    }

    pub async fn caller_profile(
        &self,
        context: &CallContext,
    ) -> Result<Option<UserProfile>, WorkflowError> {
        Ok(self.profiles.find(&context.caller).await?)
    }

    pub async fn user_profile(
        &self,
        context: &CallContext,
        user: &Principal,
    ) -> Result<Option<UserProfile>, WorkflowError> {
        let role = self.roles.role_of(&context.caller).await?;
        self.policy
            .evaluate(&context.caller, role, &AccessRequest::ViewProfile { owner: user.clone() })
            .into_result()?;
        Ok(self.profiles.find(user).await?)
    }
}

fn decision_label(event: DecisionEvent) -> &'static str {
    match event {
        DecisionEvent::Approve => "approve",
        DecisionEvent::Reject => "reject",
    }
}
