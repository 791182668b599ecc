use serde::Serialize;

use super::{JobSnapshot, JobStatus};

/// Payload of an `item_update` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemProgress {
    pub index: usize,
    pub url: String,
    pub progress: u8,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub job_progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_count: Option<usize>,
}

/// Event published to a job's observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Whole-job state, sent when the job starts and on (re)subscription
    Update(JobSnapshot),
    ItemUpdate(ItemProgress),
    /// The job finished completed or cancelled
    Complete(JobSnapshot),
    /// The job finished failed
    Error(JobSnapshot),
}

impl ProgressEvent {
    /// Event for a job that has reached a terminal status
    pub fn finished(snapshot: JobSnapshot) -> Self {
        if snapshot.status == JobStatus::Failed {
            ProgressEvent::Error(snapshot)
        } else {
            ProgressEvent::Complete(snapshot)
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Update(_) => "update",
            ProgressEvent::ItemUpdate(_) => "item_update",
            ProgressEvent::Complete(_) => "complete",
            ProgressEvent::Error(_) => "error",
        }
    }

    /// No events follow this one
    pub fn is_final(&self) -> bool {
        matches!(self, ProgressEvent::Complete(_) | ProgressEvent::Error(_))
    }

    /// The event's payload as JSON
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            ProgressEvent::Update(snapshot) | ProgressEvent::Complete(snapshot) | ProgressEvent::Error(snapshot) => {
                serde_json::to_string(snapshot)
            }
            ProgressEvent::ItemUpdate(item) => serde_json::to_string(item),
        }
    }
}
