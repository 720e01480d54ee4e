//! Step orchestration for the iterative assignment/modeling pipeline.
//!
//! Every unit of computation is a [`Step`]; the fixed `run_step` protocol
//! records substep transitions in a durable SQLite log so that a crashed or
//! killed run resumes at the earliest missing substep. The [`pipeline`]
//! module drives the outer sigma-schedule loop.

pub mod pipeline;
pub mod registry;
mod step;
mod steplog;
pub mod steps;

pub use step::{run_step, step_uid, Step, StepContext};
pub use steplog::{StepLog, StepRecord};
