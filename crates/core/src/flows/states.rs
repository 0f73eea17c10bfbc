use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::Principal;
use crate::domain::level::ApprovalLevel;
use crate::domain::request::{ApprovalRecord, ManufacturingRequest, RequestId, RequestStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEvent {
    Approve,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub event: DecisionEvent,
    pub approver: Principal,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    Escalate,
    CompleteWorkflow,
    TerminateWorkflow,
}

impl FlowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::CompleteWorkflow => "complete_workflow",
            Self::TerminateWorkflow => "terminate_workflow",
        }
    }
}

/// A computed, not yet persisted, decision against one request snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub request_id: RequestId,
    pub from_status: RequestStatus,
    pub to_status: RequestStatus,
    pub from_level: ApprovalLevel,
    pub to_level: ApprovalLevel,
    /// Version of the snapshot the outcome was computed from.
    pub expected_version: u32,
    pub record: ApprovalRecord,
    pub action: FlowAction,
}

impl TransitionOutcome {
    /// Applies the outcome in place. Callers must have checked `expected_version`.
    pub fn apply_to(&self, request: &mut ManufacturingRequest) {
        request.approval_records.push(self.record.clone());
        request.status = self.to_status;
        request.current_approval_level = self.to_level;
        request.updated_at = self.record.timestamp;
        request.version = self.expected_version + 1;
    }
}
