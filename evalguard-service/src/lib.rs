//! Service layer for anonymous course evaluations.
//!
//! Accepts evaluations through [`submission::SubmissionService`], answers
//! admin aggregate queries through [`stats::StatisticsService`], and exposes
//! the privacy audit. [`platform::Platform`] wires these around a
//! [`store::DocumentStore`] and the loaded [`config::Config`]; the
//! `evalguard` binary is a thin CLI on top.

pub mod config;
pub mod lookup;
pub mod platform;
pub mod stats;
pub mod store;
pub mod submission;
