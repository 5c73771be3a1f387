//! Core domain types
//!
//! This module contains the core domain structures used across Trainyard.
//! These types represent the fundamental business entities and are shared
//! between the enqueuer (CLI/API) and the workers that execute jobs.

pub mod failure;
pub mod job;
pub mod log;
pub mod workflow;
