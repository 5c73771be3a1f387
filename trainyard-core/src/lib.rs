//! Trainyard Core
//!
//! Core types and abstractions for the Trainyard ML job engine.
//!
//! This crate contains:
//! - Domain types: jobs, workflows, failure classification, log entries
//! - Graph: dependency ordering of workflow steps
//! - Store: the file-backed job queue and workflow definitions
//! - DTOs: requests used by the enqueuing side

pub mod domain;
pub mod dto;
pub mod graph;
pub mod store;
