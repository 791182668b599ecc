use serde::Serialize;
use tokio::sync::mpsc;

/// Phase of a single asset's transcription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Chunking,
    Transcribing,
    Retrying,
    Reassembling,
}

/// Progress reported by the pipeline while it works on one asset
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Update {
        stage: Stage,
        message: String,
    },
    ChunkProgress {
        index: usize,
        completed: usize,
        total: usize,
        succeeded: bool,
    },
    Complete {
        chunks: usize,
        failed: usize,
    },
    Error {
        message: String,
    },
}

impl PipelineEvent {
    pub fn update(stage: Stage, message: impl Into<String>) -> Self {
        PipelineEvent::Update {
            stage,
            message: message.into(),
        }
    }
}

/// Where pipeline events go; a sink without a channel drops them
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            // The observer going away must not stop the pipeline
            let _ = tx.send(event);
        }
    }
}
