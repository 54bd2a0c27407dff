//! Execution engine for workflows.

mod conditions;
mod executor;
mod locks;
mod steps;
mod wait;

pub use conditions::{evaluate, evaluate_answers, render_operands, Evaluation};
pub use executor::{Executor, StartedInstance, TransitionResult, Trigger};
pub use locks::InstanceLocks;
pub use wait::quorum;
