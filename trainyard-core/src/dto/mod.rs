//! Data Transfer Objects
//!
//! Requests issued by the enqueuing side (CLI or an external API) that the
//! engine turns into domain records.

pub mod job;
