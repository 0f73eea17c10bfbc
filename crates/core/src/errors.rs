use thiserror::Error;

use crate::authz::AccessFailure;
use crate::domain::level::LevelOutOfRange;
use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failure taxonomy surfaced to every caller of the workflow engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkflowError {
    pub fn request_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "request", id: id.into() }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Persistence(_) => "persistence",
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

impl From<FlowTransitionError> for WorkflowError {
    fn from(value: FlowTransitionError) -> Self {
        match value {
            FlowTransitionError::MissingRejectionComment => Self::InvalidArgument(value.to_string()),
            FlowTransitionError::TerminalState { .. }
            | FlowTransitionError::NotSubmitted { .. }
            | FlowTransitionError::LevelAlreadyDecided { .. } => Self::InvalidState(value.to_string()),
        }
    }
}

impl From<DomainError> for WorkflowError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::FlowTransition(error) => Self::from(error),
            DomainError::InvariantViolation(message) => Self::InvalidState(message),
        }
    }
}

impl From<AccessFailure> for WorkflowError {
    fn from(value: AccessFailure) -> Self {
        Self::PermissionDenied(value.reason())
    }
}

impl From<LevelOutOfRange> for WorkflowError {
    fn from(value: LevelOutOfRange) -> Self {
        Self::InvalidArgument(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unauthenticated { .. } => "A verified caller identity is required.",
            Self::Forbidden { .. } => "You are not allowed to perform this operation.",
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Conflict { .. } => {
                "The request is no longer in a state that allows this operation."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "invalid_argument",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden { .. } => "permission_denied",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "invalid_state",
            Self::ServiceUnavailable { .. } => "service_unavailable",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unauthenticated { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Unauthenticated { message, .. }
            | Self::Forbidden { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::ServiceUnavailable { message, .. } => message,
        }
    }
}

impl WorkflowError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Unauthenticated { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<WorkflowError> for InterfaceError {
    fn from(value: WorkflowError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            WorkflowError::NotFound { .. } => Self::NotFound { message, correlation_id },
            WorkflowError::PermissionDenied(_) => Self::Forbidden { message, correlation_id },
            WorkflowError::InvalidState(_) => Self::Conflict { message, correlation_id },
            WorkflowError::InvalidArgument(_) => Self::BadRequest { message, correlation_id },
            WorkflowError::Persistence(_) => Self::ServiceUnavailable { message, correlation_id },
        }
    }
}
