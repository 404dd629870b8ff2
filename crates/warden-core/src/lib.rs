//! Warden Core
//!
//! Shared types for the Warden sandboxed execution subsystem.
//!
//! # Overview
//!
//! This crate carries the pieces every other Warden crate leans on:
//! - Error type and result alias
//! - Explicit limits and defaults, with units in their names
//! - Telemetry (tracing subscriber) initialization
//! - Audit records and the sink interface they are delivered through

pub mod audit;
pub mod constants;
pub mod error;
pub mod telemetry;

pub use audit::{
    AuditActor, AuditDetails, AuditOutcome, AuditRecord, AuditResource, AuditSeverity, AuditSink,
    MemoryAuditSink, TracingAuditSink,
};
pub use constants::*;
pub use error::{Error, Result};
pub use telemetry::{init_telemetry, TelemetryConfig};
