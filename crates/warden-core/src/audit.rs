//! Audit records
//!
//! Structured audit entries for forensics and compliance. The sandbox
//! executor emits one record per execution when a user id is known; where the
//! record goes is decided by the injected [`AuditSink`].

use crate::constants::AUDIT_RECORDS_COUNT_MAX;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// Event type carried by every sandbox record
pub const AUDIT_EVENT_TYPE_SANDBOX: &str = "sandbox";

/// Action carried by sandbox execution records
pub const AUDIT_ACTION_EXECUTE: &str = "execute";

/// Audit severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Timeout,
    Error,
}

impl AuditOutcome {
    /// Severity implied by the outcome
    pub fn severity(&self) -> AuditSeverity {
        match self {
            Self::Success => AuditSeverity::Info,
            Self::Failure | Self::Timeout => AuditSeverity::Warning,
            Self::Error => AuditSeverity::Error,
        }
    }
}

/// Who performed the action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditActor {
    pub user_id: String,
}

/// What the action touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
}

/// Execution details attached to a sandbox record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub actor: AuditActor,
    pub resource: AuditResource,
    pub action: String,
    pub outcome: AuditOutcome,
    pub details: AuditDetails,
}

impl AuditRecord {
    /// Build the record for one sandbox execution
    ///
    /// `resource_name` is the language for code requests and the command for
    /// command requests.
    pub fn sandbox_execution(
        user_id: impl Into<String>,
        resource_name: impl Into<String>,
        outcome: AuditOutcome,
        details: AuditDetails,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: AUDIT_EVENT_TYPE_SANDBOX.to_string(),
            severity: outcome.severity(),
            actor: AuditActor {
                user_id: user_id.into(),
            },
            resource: AuditResource {
                resource_type: AUDIT_EVENT_TYPE_SANDBOX.to_string(),
                name: resource_name.into(),
            },
            action: AUDIT_ACTION_EXECUTE.to_string(),
            outcome,
            details,
        }
    }
}

/// Destination for audit records
///
/// Implementations must not block; the executor calls `record` inline after
/// every audited execution.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Sink that forwards records to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let payload = serde_json::to_string(&record).unwrap_or_default();
        tracing::info!(
            target: "audit",
            event_id = %record.event_id,
            user_id = %record.actor.user_id,
            resource = %record.resource.name,
            outcome = ?record.outcome,
            payload = %payload,
            "Audit log entry"
        );
    }
}

/// Bounded in-memory sink, oldest records evicted first
#[derive(Debug)]
pub struct MemoryAuditSink {
    records: Mutex<VecDeque<AuditRecord>>,
    max_records: usize,
}

impl MemoryAuditSink {
    /// Create with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(AUDIT_RECORDS_COUNT_MAX)
    }

    /// Create with custom capacity
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_records.min(1000))),
            max_records: max_records.max(1),
        }
    }

    /// Most recent records, newest first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(count).cloned().collect()
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record);
    }
}
