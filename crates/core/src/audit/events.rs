use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Admission
    JobSubmitted {
        job_id: String,
        fingerprint: String,
        original_filename: String,
        dataset_type: Option<String>,
        /// True when a reprocess was forced for content already seen.
        forced: bool,
    },
    DuplicateSubmission {
        job_id: String,
        fingerprint: String,
        /// Status of the job the submission resolved to.
        existing_status: String,
        usage_count: u64,
    },

    // Lifecycle
    JobStateChanged {
        job_id: String,
        from_state: String,
        to_state: String,
        attempt: u32,
        reason: Option<String>,
    },
    JobCancelRequested {
        job_id: String,
        previous_state: String,
    },
    /// A running attempt was reclaimed by the staleness sweep or at startup.
    OrphanReclaimed {
        job_id: String,
        attempt: u32,
        last_heartbeat: Option<DateTime<Utc>>,
    },
    /// A transition was rejected by the store.
    InvalidTransition {
        job_id: String,
        from_state: String,
        to_state: String,
        reason: String,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::JobSubmitted { .. } => "job_submitted",
            Self::DuplicateSubmission { .. } => "duplicate_submission",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobCancelRequested { .. } => "job_cancel_requested",
            Self::OrphanReclaimed { .. } => "orphan_reclaimed",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Extract job_id if this event is job-related
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::DuplicateSubmission { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobCancelRequested { job_id, .. }
            | Self::OrphanReclaimed { job_id, .. }
            | Self::InvalidTransition { job_id, .. } => Some(job_id),
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
        }
    }

    /// Extract the content fingerprint for admission events
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::JobSubmitted { fingerprint, .. }
            | Self::DuplicateSubmission { fingerprint, .. } => Some(fingerprint),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub job_id: Option<String>,
    pub fingerprint: Option<String>,
    pub data: AuditEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_service_started() {
        let event = AuditEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc123".to_string(),
        };
        assert_eq!(event.event_type(), "service_started");
        assert_eq!(event.job_id(), None);
        assert_eq!(event.fingerprint(), None);
    }

    #[test]
    fn test_event_type_job_submitted() {
        let event = AuditEvent::JobSubmitted {
            job_id: "job-1".to_string(),
            fingerprint: "ba7816bf".to_string(),
            original_filename: "sales.csv".to_string(),
            dataset_type: Some("csv".to_string()),
            forced: false,
        };
        assert_eq!(event.event_type(), "job_submitted");
        assert_eq!(event.job_id(), Some("job-1"));
        assert_eq!(event.fingerprint(), Some("ba7816bf"));
    }

    #[test]
    fn test_event_type_state_changed() {
        let event = AuditEvent::JobStateChanged {
            job_id: "job-1".to_string(),
            from_state: "running".to_string(),
            to_state: "retrying".to_string(),
            attempt: 1,
            reason: Some("disk full".to_string()),
        };
        assert_eq!(event.event_type(), "job_state_changed");
        assert_eq!(event.job_id(), Some("job-1"));
        assert_eq!(event.fingerprint(), None);
    }

    #[test]
    fn test_serialize_deserialize_orphan_reclaimed() {
        let event = AuditEvent::OrphanReclaimed {
            job_id: "job-9".to_string(),
            attempt: 2,
            last_heartbeat: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"orphan_reclaimed\""));

        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_audit_record_serialize() {
        let record = AuditRecord {
            id: 1,
            timestamp: Utc::now(),
            event_type: "job_cancel_requested".to_string(),
            job_id: Some("job-1".to_string()),
            fingerprint: None,
            data: AuditEvent::JobCancelRequested {
                job_id: "job-1".to_string(),
                previous_state: "queued".to_string(),
            },
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("job_cancel_requested"));
        assert!(json.contains("\"previous_state\":\"queued\""));
    }
}
