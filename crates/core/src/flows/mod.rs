pub mod engine;
pub mod states;

pub use engine::{normalize_comment, FlowDefinition, FlowEngine, FlowTransitionError, LinearApprovalFlow};
pub use states::{Decision, DecisionEvent, FlowAction, TransitionOutcome};
