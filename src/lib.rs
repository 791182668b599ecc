//! MultiFetch - download media from social platforms and transcribe it
//!
//! Audio is fetched through yt-dlp (or read from disk), split into chunks that
//! fit the hosted Whisper API's upload limits, transcribed concurrently under a
//! shared rate limit, and stitched back together in order. Batches of inputs
//! run as jobs whose progress can be observed while they run.

pub mod audio;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod extractors;
pub mod jobs;
pub mod output;
pub mod transcribe;
pub mod utils;

pub use audio::{AudioAsset, AudioFormat};
pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use extractors::{DownloadedMedia, ExtractorRegistry, MediaExtractor, Platform};
pub use jobs::{Job, JobManager, JobRunner, JobSnapshot, JobStatus, JobType, ProgressBroadcaster, ProgressEvent};
pub use transcribe::{Tier, Transcription, TranscriptionPipeline};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Errors surfaced to the command line
#[derive(thiserror::Error, Debug)]
pub enum MultiFetchError {
    #[error("Could not create job: {0}")]
    Job(#[from] jobs::JobError),

    #[error("Every item in job {job_id} failed")]
    JobFailed { job_id: String },

    #[error("Interrupted")]
    Interrupted,
}
