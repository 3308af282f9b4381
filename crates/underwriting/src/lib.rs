//! Underwriting decision pipeline for vehicle-loan applications.
//!
//! The [`workflows::underwriting`] module holds the staged rule evaluators, the
//! orchestrator that sequences them into an auditable decision trail, and the
//! ports through which the pipeline reaches history, installment, registry,
//! identity, bureau, scoring, configuration and persistence collaborators.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
