//! Manufacturing request workflow: role and approver registries plus the service that
//! drives requests through the eight approval levels.

pub mod approvers;
pub mod roles;
pub mod service;

pub use approvers::ApproverRegistry;
pub use roles::RoleRegistry;
pub use service::{WorkflowService, WorkflowStores};
