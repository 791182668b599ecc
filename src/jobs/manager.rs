use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Job, JobError, JobItem, JobType};
use crate::extractors::{is_local_file, validate_url, Platform};

pub const MAX_URLS_PER_JOB: usize = 100;
pub const MAX_LIST_LIMIT: usize = 100;

/// A URL left out of a job, and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedUrl {
    pub url: String,
    pub error: String,
}

#[derive(Debug)]
pub struct CreatedJob {
    pub job: Arc<Job>,
    /// Inputs that failed validation and were not added
    pub rejected: Vec<RejectedUrl>,
}

/// In-memory registry of jobs.
///
/// Every job's cancel token is a child of the manager's root token, so
/// cancelling the root stops all of them.
pub struct JobManager {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    root: CancellationToken,
    next_seq: AtomicU64,
}

impl JobManager {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            root,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Validate `urls` and register a pending job for the valid ones
    pub async fn create_job(&self, urls: &[String], job_type: JobType, language: &str) -> Result<CreatedJob, JobError> {
        if urls.is_empty() {
            return Err(JobError::NoUrls);
        }
        if urls.len() > MAX_URLS_PER_JOB {
            return Err(JobError::TooManyUrls {
                count: urls.len(),
                max: MAX_URLS_PER_JOB,
            });
        }

        let mut items = Vec::new();
        let mut rejected = Vec::new();

        for url in urls {
            let url = url.trim();
            if is_local_file(url) {
                items.push(JobItem::new(url, Some(Platform::Local), None));
                continue;
            }

            let validation = validate_url(url);
            if validation.valid {
                items.push(JobItem::new(validation.url, validation.platform, validation.video_id));
            } else {
                rejected.push(RejectedUrl {
                    url: url.to_string(),
                    error: validation.error.unwrap_or_else(|| "Invalid URL".to_string()),
                });
            }
        }

        if items.is_empty() {
            return Err(JobError::NoValidUrls(rejected));
        }

        let id = Uuid::new_v4().to_string()[..8].to_string();
        let language = crate::utils::normalize_language_code(language);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::with_seq(
            id.clone(),
            job_type,
            language,
            items,
            self.root.child_token(),
            seq,
        ));

        tracing::info!(
            "Created {} job {} with {} items ({} rejected)",
            job_type,
            id,
            job.item_count().await,
            rejected.len()
        );

        self.jobs.write().await.insert(id, job.clone());
        Ok(CreatedJob { job, rejected })
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Most recent jobs first, at most `limit` (capped at 100)
    pub async fn list_jobs(&self, limit: usize) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.seq().cmp(&a.seq()));
        jobs.truncate(limit.min(MAX_LIST_LIMIT));
        jobs
    }

    /// Remove a job, cancelling it first if it is still going
    pub async fn delete_job(&self, job_id: &str) -> bool {
        let removed = self.jobs.write().await.remove(job_id);
        match removed {
            Some(job) => {
                job.cancel().await;
                true
            }
            None => false,
        }
    }

    /// Cancel a pending or running job; false if unknown or already finished
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        match self.get_job(job_id).await {
            Some(job) => job.cancel().await,
            None => false,
        }
    }

    /// Move a pending job to running
    pub async fn start_job(&self, job_id: &str) -> Result<Arc<Job>, JobError> {
        let job = self
            .get_job(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let status = job.status().await;
        if status != super::JobStatus::Pending {
            return Err(JobError::NotPending(status));
        }
        job.start().await?;
        Ok(job)
    }

    /// Cancel every job that is still pending or running
    pub async fn shutdown(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        for job in jobs {
            job.cancel().await;
        }
        self.root.cancel();
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
