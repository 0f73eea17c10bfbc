pub mod audit;
pub mod authz;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, CallContext};
pub use authz::{AccessDecision, AccessFailure, AccessPolicy, AccessRequest};
pub use clock::{Clock, MonotonicClock};
pub use domain::identity::{Principal, UserProfile, UserRole, DEFAULT_ROLE};
pub use domain::level::{ApprovalLevel, LevelOutOfRange, LEVEL_COUNT};
pub use domain::request::{
    ApprovalRecord, DecisionStatus, ManufacturingRequest, RequestId, RequestStatus,
};
pub use errors::{DomainError, InterfaceError, WorkflowError};
pub use flows::{
    Decision, DecisionEvent, FlowAction, FlowEngine, FlowTransitionError, LinearApprovalFlow,
    TransitionOutcome,
};
