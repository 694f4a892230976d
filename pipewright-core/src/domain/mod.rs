//! Core domain types
//!
//! This module contains the core structures shared by the engine and the
//! CLI: the declarative pipeline definition, the records that flow between
//! steps, and the status values a run reports.

pub mod definition;
pub mod log;
pub mod record;
pub mod status;
