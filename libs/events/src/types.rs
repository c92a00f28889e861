//! Event and job status types.

use chrono::{DateTime, Utc};
use corral_id::{HostId, JobId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Job Status
// =============================================================================

/// Runtime status of a job on its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Done,
    Crashed,
    Failed,
}

impl JobStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Crashed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Crashed => "crashed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Start,
    Stop,
    Error,
}

impl EventKind {
    /// Returns whether `self` may follow `previous` for the same job.
    pub fn may_follow(self, previous: Option<EventKind>) -> bool {
        matches!(
            (previous, self),
            (None, EventKind::Create)
                | (Some(EventKind::Create), EventKind::Start)
                | (Some(EventKind::Create), EventKind::Error)
                | (Some(EventKind::Start), EventKind::Stop)
        )
    }

    /// The status a job has after this event.
    pub fn resulting_status(self, details: Option<&EventDetails>) -> JobStatus {
        match self {
            EventKind::Create => JobStatus::Starting,
            EventKind::Start => JobStatus::Running,
            EventKind::Error => JobStatus::Failed,
            EventKind::Stop => match details {
                Some(d) if d.exit_code == Some(0) && d.signal.is_none() => JobStatus::Done,
                _ => JobStatus::Crashed,
            },
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Create => "create",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Optional payload attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An externally observable job lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: JobId,
    pub host_id: HostId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<EventDetails>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(kind: EventKind, job_id: JobId, host_id: HostId) -> Self {
        Self {
            kind,
            job_id,
            host_id,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: EventDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// The job status this event moves the job into.
    pub fn status(&self) -> JobStatus {
        self.kind.resulting_status(self.details.as_ref())
    }

    /// Encodes the event as one line of newline-delimited JSON.
    pub fn to_ndjson(&self) -> Result<String, EventError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes one line of newline-delimited JSON.
    pub fn from_ndjson(line: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Checks that a sequence of event kinds for one job is a valid lifecycle prefix.
pub fn validate_sequence(kinds: &[EventKind]) -> Result<(), EventError> {
    let mut previous = None;
    for &kind in kinds {
        if !kind.may_follow(previous) {
            return Err(EventError::InvalidTransition { previous, kind });
        }
        previous = Some(kind);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn job() -> JobId {
        JobId::parse("j1").unwrap()
    }

    fn host() -> HostId {
        HostId::parse("h1").unwrap()
    }

    #[test]
    fn test_event_kind_serialization() {
        assert_eq!(serde_json::to_string(&EventKind::Stop).unwrap(), "\"stop\"");
        assert_eq!(
            serde_json::to_string(&JobStatus::Crashed).unwrap(),
            "\"crashed\""
        );
    }

    #[test]
    fn test_ndjson_line_shape() {
        let event = Event::new(EventKind::Stop, job(), host()).with_details(EventDetails {
            exit_code: Some(7),
            ..Default::default()
        });
        let line = event.to_ndjson().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "stop");
        assert_eq!(value["details"]["exit_code"], 7);
        assert!(value["details"].get("error").is_none());
        assert_eq!(Event::from_ndjson(&line).unwrap(), event);
    }

    #[rstest]
    #[case(Some(0), None, JobStatus::Done)]
    #[case(Some(7), None, JobStatus::Crashed)]
    #[case(None, Some(9), JobStatus::Crashed)]
    #[case(Some(0), Some(15), JobStatus::Crashed)]
    fn test_stop_status(
        #[case] exit_code: Option<i32>,
        #[case] signal: Option<i32>,
        #[case] expected: JobStatus,
    ) {
        let details = EventDetails {
            exit_code,
            signal,
            error: None,
        };
        assert_eq!(
            EventKind::Stop.resulting_status(Some(&details)),
            expected
        );
    }

    #[rstest]
    #[case(&[EventKind::Create], true)]
    #[case(&[EventKind::Create, EventKind::Start, EventKind::Stop], true)]
    #[case(&[EventKind::Create, EventKind::Error], true)]
    #[case(&[EventKind::Start], false)]
    #[case(&[EventKind::Create, EventKind::Start, EventKind::Error], false)]
    #[case(&[EventKind::Create, EventKind::Start, EventKind::Stop, EventKind::Start], false)]
    fn test_validate_sequence(#[case] kinds: &[EventKind], #[case] valid: bool) {
        assert_eq!(validate_sequence(kinds).is_ok(), valid);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Starting.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Crashed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
