//! Context objects
//!
//! [`WorkflowContext`] is what workflow functions see; [`OperationContext`]
//! is what operation implementations see, on both sides of a process
//! boundary.

mod operation;
pub mod serialize;
mod workflow;

pub use operation::OperationContext;
pub use serialize::{context_from_envelope, context_to_envelope, ContextEnvelope};
pub use workflow::WorkflowContext;
