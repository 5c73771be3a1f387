//! Scheduler layer for the worker
//!
//! This layer handles polling the store for new jobs and coordinating job
//! execution. It manages the lifecycle of jobs from claiming to their
//! terminal state, and reclaims jobs abandoned by crashed workers.

pub mod poller;
pub mod reclaim;

pub use poller::JobPoller;
