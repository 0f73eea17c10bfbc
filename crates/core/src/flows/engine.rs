use thiserror::Error;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, CallContext};
use crate::domain::level::ApprovalLevel;
use crate::domain::request::{ApprovalRecord, DecisionStatus, ManufacturingRequest, RequestStatus};
use crate::flows::states::{Decision, DecisionEvent, FlowAction, TransitionOutcome};

pub trait FlowDefinition {
    fn transition(
        &self,
        request: &ManufacturingRequest,
        decision: &Decision,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Strictly linear chain: level 0 through the final level, one approval per level,
/// any rejection ends the workflow.
#[derive(Clone, Debug, Default)]
pub struct LinearApprovalFlow;

impl FlowDefinition for LinearApprovalFlow {
    fn transition(
        &self,
        request: &ManufacturingRequest,
        decision: &Decision,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_linear(request, decision)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn apply(
        &self,
        request: &ManufacturingRequest,
        decision: &Decision,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(request, decision)
    }

    pub fn apply_with_audit<S>(
        &self,
        request: &ManufacturingRequest,
        decision: &Decision,
        sink: &S,
        context: &CallContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(request, decision);
        if let Err(error) = &result {
            sink.emit(
                AuditEvent::new(
                    Some(request.id.clone()),
                    context.correlation_id.clone(),
                    "flow.transition_rejected",
                    AuditCategory::Decision,
                    context.caller.as_str(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("status", request.status.as_str())
                .with_metadata("level", request.current_approval_level.to_string())
                .with_metadata("error", error.to_string()),
            );
        }
        result
    }
}

impl Default for FlowEngine<LinearApprovalFlow> {
    fn default() -> Self {
        Self::new(LinearApprovalFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("a rejection must carry a non-blank comment")]
    MissingRejectionComment,
    #[error("request `{request_id}` is {status:?} and no longer accepts decisions")]
    TerminalState { request_id: String, status: RequestStatus },
    #[error("request `{request_id}` has not been submitted for approval")]
    NotSubmitted { request_id: String },
    #[error("request `{request_id}` already carries a decision for level {level}")]
    LevelAlreadyDecided { request_id: String, level: ApprovalLevel },
}

/// Trims a decision comment; blank comments collapse to `None`. Rejections must keep one.
pub fn normalize_comment(
    event: DecisionEvent,
    comment: Option<String>,
) -> Result<Option<String>, FlowTransitionError> {
    let comment = comment.map(|raw| raw.trim().to_owned()).filter(|value| !value.is_empty());
    if event == DecisionEvent::Reject && comment.is_none() {
        return Err(FlowTransitionError::MissingRejectionComment);
    }
    Ok(comment)
}

fn transition_linear(
    request: &ManufacturingRequest,
    decision: &Decision,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use DecisionEvent::{Approve, Reject};
    use FlowAction::{CompleteWorkflow, Escalate, TerminateWorkflow};

    let comment = normalize_comment(decision.event, decision.comment.clone())?;

    match request.status {
        RequestStatus::Submitted | RequestStatus::InApproval => {}
        RequestStatus::Draft => {
            return Err(FlowTransitionError::NotSubmitted { request_id: request.id.0.clone() });
        }
        status @ (RequestStatus::Approved | RequestStatus::Rejected) => {
            return Err(FlowTransitionError::TerminalState {
                request_id: request.id.0.clone(),
                status,
            });
        }
    }

    let level = request.current_approval_level;
    if request.decision_at(level).is_some() {
        return Err(FlowTransitionError::LevelAlreadyDecided {
            request_id: request.id.0.clone(),
            level,
        });
    }

    let (to_status, to_level, action, status) = match (decision.event, level.next()) {
        (Approve, Some(next)) => (RequestStatus::InApproval, next, Escalate, DecisionStatus::Approved),
        (Approve, None) => (RequestStatus::Approved, level, CompleteWorkflow, DecisionStatus::Approved),
        (Reject, _) => (RequestStatus::Rejected, level, TerminateWorkflow, DecisionStatus::Rejected),
    };

    Ok(TransitionOutcome {
        request_id: request.id.clone(),
        from_status: request.status,
        to_status,
        from_level: level,
        to_level,
        expected_version: request.version,
        record: ApprovalRecord {
            level,
            status,
            comment,
            approver: decision.approver.clone(),
            timestamp: decision.decided_at,
        },
        action,
    })
}
