use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use nsmr_core::domain::identity::{Principal, UserProfile, UserRole};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{ManufacturingRequest, RequestId};
use nsmr_core::errors::WorkflowError;
use nsmr_core::flows::TransitionOutcome;

pub mod approver;
pub mod memory;
pub mod profile;
pub mod request;
pub mod role;

pub use approver::SqlApproverRepository;
pub use memory::{
    InMemoryApproverRepository, InMemoryProfileRepository, InMemoryRequestRepository,
    InMemoryRoleRepository,
};
pub use profile::SqlProfileRepository;
pub use request::SqlRequestRepository;
pub use role::SqlRoleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("request `{0}` does not exist")]
    NotFound(String),
    #[error("request `{id}` changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict { id: String, expected: u32, actual: u32 },
}

impl From<RepositoryError> for WorkflowError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(id) => WorkflowError::request_not_found(id),
            RepositoryError::VersionConflict { .. } => WorkflowError::InvalidState(value.to_string()),
            RepositoryError::Database(_) | RepositoryError::Decode(_) => {
                WorkflowError::Persistence(value.to_string())
            }
        }
    }
}

/// Durable request storage. `append_decision` is the only mutator after creation.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn create(
        &self,
        creator: &Principal,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ManufacturingRequest, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<ManufacturingRequest>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<ManufacturingRequest>, RepositoryError>;

    async fn list_by_creator(
        &self,
        creator: &Principal,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError>;

    /// Active (`submitted` or `inApproval`) requests queued at `level`.
    async fn list_active_at_level(
        &self,
        level: ApprovalLevel,
    ) -> Result<Vec<ManufacturingRequest>, RepositoryError>;

    /// Applies `outcome` only if the stored version still equals `outcome.expected_version`
    /// and the request is active.
    async fn append_decision(
        &self,
        outcome: &TransitionOutcome,
    ) -> Result<ManufacturingRequest, RepositoryError>;
}

#[async_trait]
pub trait ApproverRepository: Send + Sync {
    /// Returns `false` when the approver was already assigned.
    async fn assign(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Returns `false` when the approver was not assigned.
    async fn remove(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, RepositoryError>;

    async fn reassign(
        &self,
        level: ApprovalLevel,
        approvers: &BTreeSet<Principal>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn is_approver(
        &self,
        level: ApprovalLevel,
        identity: &Principal,
    ) -> Result<bool, RepositoryError>;

    async fn approvers_of(
        &self,
        level: ApprovalLevel,
    ) -> Result<BTreeSet<Principal>, RepositoryError>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn role_of(&self, identity: &Principal) -> Result<Option<UserRole>, RepositoryError>;

    async fn set_role(
        &self,
        identity: &Principal,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn find(&self, identity: &Principal) -> Result<Option<UserProfile>, RepositoryError>;

    async fn save(
        &self,
        identity: &Principal,
        profile: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{field} `{raw}`: {error}")))
}

pub(crate) fn parse_level(field: &str, raw: i64) -> Result<ApprovalLevel, RepositoryError> {
    ApprovalLevel::try_from(raw).map_err(|error| RepositoryError::Decode(format!("{field}: {error}")))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use nsmr_core::errors::WorkflowError;

    use super::{format_timestamp, parse_level, parse_timestamp, RepositoryError};

    #[test]
    fn timestamps_keep_nanosecond_precision() {
        let value = Utc.timestamp_nanos(1_760_000_000_123_456_789);
        let formatted = format_timestamp(value);

        assert_eq!(formatted, "2025-10-09T08:53:20.123456789Z");
        assert_eq!(parse_timestamp("created_at", &formatted).expect("parse"), value);
    }

    #[test]
    fn invalid_stored_values_surface_as_decode_errors() {
        assert!(matches!(parse_timestamp("updated_at", "yesterday"), Err(RepositoryError::Decode(_))));
        assert!(matches!(parse_level("level", 12), Err(RepositoryError::Decode(_))));
    }

    #[test]
    fn repository_errors_map_onto_workflow_taxonomy() {
        let conflict = RepositoryError::VersionConflict { id: "NSMR-1".into(), expected: 2, actual: 3 };
        assert!(matches!(WorkflowError::from(conflict), WorkflowError::InvalidState(_)));
        assert!(matches!(
            WorkflowError::from(RepositoryError::NotFound("NSMR-1".into())),
            WorkflowError::NotFound { .. }
        ));
        assert!(matches!(
            WorkflowError::from(RepositoryError::Decode("bad".into())),
            WorkflowError::Persistence(_)
        ));
    }
}
