//! Service layer
//!
//! Services contain business logic for the worker. The execution service
//! turns a claimed job into a sequence of step runs.
//!
//! Services are trait-based so the scheduler can be tested without real
//! workflows.

mod execution;

pub use execution::{ExecutionService, StandardExecutionService};
