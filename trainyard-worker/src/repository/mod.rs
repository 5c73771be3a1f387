//! Repository layer
//!
//! Durable side effects of a running job that live outside the job record.
//! Job records and workflow definitions are handled by the core store.

mod logs;

pub use logs::{DurableLogWriter, RetryPolicy};
