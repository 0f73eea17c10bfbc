use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::identity::Principal;
use crate::domain::level::ApprovalLevel;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("NSMR-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    /// Reserved; no operation creates a draft.
    Draft,
    Submitted,
    InApproval,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::InApproval => "in_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "in_approval" | "inapproval" => Some(Self::InApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Queued at some level and still accepting decisions.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::InApproval)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Approved,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub level: ApprovalLevel,
    pub status: DecisionStatus,
    pub comment: Option<String>,
    pub approver: Principal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturingRequest {
    pub id: RequestId,
    pub status: RequestStatus,
    pub creator: Principal,
    pub content: String,
    pub current_approval_level: ApprovalLevel,
    pub approval_records: Vec<ApprovalRecord>,
    /// Bumped on every accepted decision; used for compare-and-swap updates.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManufacturingRequest {
    pub fn submitted(
        id: RequestId,
        creator: Principal,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: RequestStatus::Submitted,
            creator,
            content: content.into(),
            current_approval_level: ApprovalLevel::FIRST,
            approval_records: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn decision_at(&self, level: ApprovalLevel) -> Option<&ApprovalRecord> {
        self.approval_records.iter().find(|record| record.level == level)
    }

    pub fn latest_decision(&self) -> Option<&ApprovalRecord> {
        self.approval_records.last()
    }

    /// Checks the audit trail against the lifecycle state.
    ///
    /// Records must cover levels `0..n` in order, every record but the last must be an
    /// approval, and the status has to agree with the final record.
    pub fn verify_audit_trail(&self) -> Result<(), DomainError> {
        let violation = |detail: String| {
            Err(DomainError::InvariantViolation(format!("request `{}`: {detail}", self.id)))
        };

        for (position, record) in self.approval_records.iter().enumerate() {
            if usize::from(record.level.value()) != position {
                return violation(format!(
                    "record #{position} was taken at level {} (expected {position})",
                    record.level
                ));
            }
            let is_last = position + 1 == self.approval_records.len();
            if !is_last && record.status == DecisionStatus::Rejected {
                return violation(format!("rejection at level {} is not the last record", record.level));
            }
        }

        let recorded = self.approval_records.len();
        let level = usize::from(self.current_approval_level.value());
        match self.status {
            RequestStatus::Draft | RequestStatus::Submitted if recorded != 0 || level != 0 => {
                violation(format!("{} request carries {recorded} records at level {level}", self.status.as_str()))
            }
            RequestStatus::InApproval if recorded != level => violation(format!(
                "in-approval request at level {level} carries {recorded} records"
            )),
            RequestStatus::Approved
                if recorded != usize::from(ApprovalLevel::FINAL.value()) + 1
                    || !self.current_approval_level.is_final() =>
            {
                violation(format!("approved request carries {recorded} records at level {level}"))
            }
            RequestStatus::Rejected
                if recorded != level + 1
                    || self.latest_decision().map(|record| record.status)
                        != Some(DecisionStatus::Rejected) =>
            {
                violation(format!("rejected request at level {level} lacks a closing rejection"))
            }
            _ => Ok(()),
        }
    }
}
