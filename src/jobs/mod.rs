//! Jobs: batches of URLs driven through download, chunking and transcription.
//!
//! A [`Job`] owns its items behind a single lock. Job status and progress are
//! never stored independently of the items; they are derived whenever an item
//! changes (status) or whenever they are read (progress). The only exception
//! is an explicit [`Job::cancel`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub mod broadcaster;
pub mod events;
pub mod manager;
pub mod runner;

pub use broadcaster::{ProgressBroadcaster, SseFrame, Subscription};
pub use events::{ItemProgress, ProgressEvent};
pub use manager::{CreatedJob, JobManager, RejectedUrl};
pub use runner::{AudioSource, JobRunner, RunnerSettings};

use crate::extractors::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does with each URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Fetch audio only
    Download,
    /// Fetch audio and transcribe it, discarding the audio
    Transcribe,
    /// Fetch, transcribe, and keep the audio when an output directory is set
    #[default]
    Full,
}

impl JobType {
    pub fn transcribes(self) -> bool {
        !matches!(self, JobType::Download)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Download => f.write_str("download"),
            JobType::Transcribe => f.write_str("transcribe"),
            JobType::Full => f.write_str("full"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} has no item {index}")]
    ItemNotFound { job_id: String, index: usize },

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job is not pending (status: {0})")]
    NotPending(JobStatus),

    #[error("No URLs provided")]
    NoUrls,

    #[error("Maximum {max} URLs per job, got {count}")]
    TooManyUrls { count: usize, max: usize },

    #[error("No valid URLs provided ({} rejected)", .0.len())]
    NoValidUrls(Vec<RejectedUrl>),
}

/// One URL's progress through a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobItem {
    pub url: String,
    pub platform: Option<Platform>,
    pub video_id: Option<String>,
    pub status: JobStatus,
    /// 0 to 100
    pub progress: u8,
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
    pub transcript: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobItem {
    pub fn new(url: impl Into<String>, platform: Option<Platform>, video_id: Option<String>) -> Self {
        Self {
            url: url.into(),
            platform,
            video_id,
            status: JobStatus::Pending,
            progress: 0,
            title: None,
            audio_path: None,
            transcript: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Changes to apply to an item in one step. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub title: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub transcript: Option<String>,
    pub error: Option<String>,
}

impl ItemUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn completed(transcript: Option<String>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            transcript,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_audio_path(mut self, path: Option<PathBuf>) -> Self {
        self.audio_path = path;
        self
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    items: Vec<JobItem>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn progress(&self) -> u8 {
        if self.items.is_empty() {
            return 0;
        }
        let total: usize = self.items.iter().map(|item| item.progress as usize).sum();
        (total / self.items.len()) as u8
    }

    fn count(&self, status: JobStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    /// Completed or failed once every item is, failed only if all items failed
    fn derive_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }

        let all_done = self
            .items
            .iter()
            .all(|item| matches!(item.status, JobStatus::Completed | JobStatus::Failed));

        if all_done && !self.items.is_empty() {
            let all_failed = self.items.iter().all(|item| item.status == JobStatus::Failed);
            self.status = if all_failed { JobStatus::Failed } else { JobStatus::Completed };
            self.completed_at.get_or_insert_with(Utc::now);
        } else if self.status == JobStatus::Pending && self.items.iter().any(|item| item.status != JobStatus::Pending) {
            self.status = JobStatus::Running;
            self.started_at.get_or_insert_with(Utc::now);
        }
    }
}

/// Serializable view of a job at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub item_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items: Vec<JobItem>,
}

/// A batch of URLs processed together
#[derive(Debug)]
pub struct Job {
    id: String,
    job_type: JobType,
    language: String,
    created_at: DateTime<Utc>,
    /// Insertion order, used to list jobs newest first
    seq: u64,
    cancel: CancellationToken,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        job_type: JobType,
        language: impl Into<String>,
        items: Vec<JobItem>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_seq(id, job_type, language, items, cancel, 0)
    }

    pub(crate) fn with_seq(
        id: impl Into<String>,
        job_type: JobType,
        language: impl Into<String>,
        items: Vec<JobItem>,
        cancel: CancellationToken,
        seq: u64,
    ) -> Self {
        Self {
            id: id.into(),
            job_type,
            language: language.into(),
            created_at: Utc::now(),
            seq,
            cancel,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                items,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Token cancelled when the job is cancelled or the process shuts down
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn status(&self) -> JobStatus {
        self.state.lock().await.status
    }

    /// Mean of item progress, floored
    pub async fn progress(&self) -> u8 {
        self.state.lock().await.progress()
    }

    pub async fn item_count(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn item(&self, index: usize) -> Option<JobItem> {
        self.state.lock().await.items.get(index).cloned()
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().await;
        JobSnapshot {
            id: self.id.clone(),
            job_type: self.job_type,
            status: state.status,
            progress: state.progress(),
            item_count: state.items.len(),
            completed_count: state.count(JobStatus::Completed),
            failed_count: state.count(JobStatus::Failed),
            language: self.language.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            items: state.items.clone(),
        }
    }

    /// Move a pending job to running. Starting a running job is a no-op.
    pub async fn start(&self) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        match state.status {
            JobStatus::Pending => {
                state.status = JobStatus::Running;
                state.started_at.get_or_insert_with(Utc::now);
                Ok(())
            }
            JobStatus::Running => Ok(()),
            other => Err(JobError::NotPending(other)),
        }
    }

    /// Cancel a pending or running job, returning false if it already finished.
    ///
    /// Items that have not finished are cancelled with it.
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(state.status, JobStatus::Pending | JobStatus::Running) {
            return false;
        }

        let now = Utc::now();
        state.status = JobStatus::Cancelled;
        state.completed_at = Some(now);
        for item in state.items.iter_mut().filter(|item| !item.status.is_terminal()) {
            item.status = JobStatus::Cancelled;
            item.completed_at = Some(now);
        }
        drop(state);

        self.cancel.cancel();
        tracing::info!("Job {} cancelled", self.id);
        true
    }

    /// Apply `update` to item `index` and re-derive the job status.
    ///
    /// The first update moves a pending item to running. Terminal items reject
    /// further updates, and items can only be cancelled through [`Job::cancel`].
    pub async fn update_item(&self, index: usize, update: ItemUpdate) -> Result<ItemProgress, JobError> {
        let mut state = self.state.lock().await;
        let item = state.items.get_mut(index).ok_or_else(|| JobError::ItemNotFound {
            job_id: self.id.clone(),
            index,
        })?;

        let from = item.status;
        let to = update.status.unwrap_or(match from {
            JobStatus::Pending => JobStatus::Running,
            other => other,
        });

        if from.is_terminal() || matches!(to, JobStatus::Pending | JobStatus::Cancelled) {
            return Err(JobError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        item.status = to;
        if let Some(progress) = update.progress {
            item.progress = progress.min(100);
        }
        if update.title.is_some() {
            item.title = update.title;
        }
        if update.audio_path.is_some() {
            item.audio_path = update.audio_path;
        }
        if update.transcript.is_some() {
            item.transcript = update.transcript;
        }
        if update.error.is_some() {
            item.error = update.error;
        }

        item.started_at.get_or_insert(now);
        match to {
            JobStatus::Completed => {
                item.progress = 100;
                item.completed_at.get_or_insert(now);
            }
            JobStatus::Failed => {
                item.progress = 0;
                item.completed_at.get_or_insert(now);
            }
            _ => {}
        }

        let item = item.clone();
        state.derive_status();

        Ok(ItemProgress {
            index,
            url: item.url,
            progress: item.progress,
            status: item.status,
            title: item.title,
            transcript: item.transcript.filter(|_| to == JobStatus::Completed),
            error: item.error.filter(|_| to == JobStatus::Failed),
            job_progress: state.progress(),
            completed_count: (to == JobStatus::Completed).then(|| state.count(JobStatus::Completed)),
            failed_count: (to == JobStatus::Failed).then(|| state.count(JobStatus::Failed)),
        })
    }
}
