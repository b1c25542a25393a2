//! Core type definitions
//!
//! - Instruction: the user's natural-language request
//! - Task: one bound capability invocation with its state
//! - Plan: a DAG of tasks built from one instruction

mod instruction;
mod plan;
mod task;

pub use instruction::Instruction;
pub use plan::{Plan, PlanValidationError};
pub use task::{InputBinding, Task, TaskError, TaskErrorKind, TaskId, TaskStatus};
