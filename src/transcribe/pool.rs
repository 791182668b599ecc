use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::client::TranscriptionClient;
use super::error::TranscribeError;
use super::progress::{PipelineEvent, ProgressSink, Stage};
use super::rate_limiter::RateLimiter;
use super::reassemble::ChunkResult;
use super::retry::RetryPolicy;
use super::tier::Tier;
use crate::chunking::AudioChunk;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub tier: Tier,
    /// Policy for the concurrent first pass
    pub first_pass: RetryPolicy,
    /// Policy for the sequential pass over failed chunks
    pub retry_pass: RetryPolicy,
    /// Pause between the two passes
    pub retry_cooldown: Duration,
}

impl PoolSettings {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            first_pass: RetryPolicy::default(),
            retry_pass: RetryPolicy::default().with_max_retries(3),
            retry_cooldown: Duration::from_secs(30),
        }
    }
}

/// Transcribes a chunk plan with a bounded number of concurrent workers.
///
/// Chunks that fail the concurrent pass get one more sequential pass after a
/// cooldown, since failures under load tend to share a cause.
pub struct TranscriptionWorkerPool {
    client: Arc<dyn TranscriptionClient>,
    limiter: Arc<RateLimiter>,
    settings: PoolSettings,
}

impl TranscriptionWorkerPool {
    pub fn new(client: Arc<dyn TranscriptionClient>, limiter: Arc<RateLimiter>, settings: PoolSettings) -> Self {
        Self {
            client,
            limiter,
            settings,
        }
    }

    /// Transcribe `chunks` with up to `workers` requests in flight.
    ///
    /// Results come back sorted by chunk index. Chunks that were never
    /// dispatched because of cancellation have no entry.
    pub async fn run(
        &self,
        chunks: &[AudioChunk],
        workers: usize,
        language: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Vec<ChunkResult> {
        let total = chunks.len();
        let mut results: BTreeMap<usize, ChunkResult> = BTreeMap::new();

        tracing::info!("Using {} workers for {} chunks", workers.max(1), total);

        let mut completions = stream::iter(chunks)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|chunk| self.transcribe_chunk(chunk, language, &self.settings.first_pass))
            .buffer_unordered(workers.max(1))
            .boxed();

        while let Some(result) = completions.next().await {
            progress.emit(PipelineEvent::ChunkProgress {
                index: result.index,
                completed: results.len() + 1,
                total,
                succeeded: result.is_success(),
            });
            results.insert(result.index, result);
        }
        drop(completions);

        if cancel.is_cancelled() {
            tracing::warn!("Cancellation requested, stopping after {} of {} chunks", results.len(), total);
            return results.into_values().collect();
        }

        let failed: Vec<&AudioChunk> = chunks
            .iter()
            .filter(|chunk| results.get(&chunk.index).map_or(false, |r| !r.is_success()))
            .collect();

        if !failed.is_empty() {
            self.retry_failed(&failed, language, cancel, progress, &mut results).await;
        }

        results.into_values().collect()
    }

    async fn retry_failed(
        &self,
        failed: &[&AudioChunk],
        language: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
        results: &mut BTreeMap<usize, ChunkResult>,
    ) {
        tracing::info!(
            "Retrying {} failed chunks sequentially after {}s cooldown",
            failed.len(),
            self.settings.retry_cooldown.as_secs()
        );
        progress.emit(PipelineEvent::update(
            Stage::Retrying,
            format!("Retrying {} failed chunks", failed.len()),
        ));

        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_cooldown) => {}
            _ = cancel.cancelled() => return,
        }

        for chunk in failed {
            if cancel.is_cancelled() {
                break;
            }

            let result = self.transcribe_chunk(chunk, language, &self.settings.retry_pass).await;
            if result.is_success() {
                tracing::info!("Chunk {} transcribed on retry", chunk.index);
                progress.emit(PipelineEvent::update(
                    Stage::Retrying,
                    format!("Chunk {} transcribed on retry", chunk.index),
                ));
            }
            results.insert(chunk.index, result);
        }
    }

    async fn transcribe_chunk(&self, chunk: &AudioChunk, language: &str, policy: &RetryPolicy) -> ChunkResult {
        let outcome = self.send_chunk(chunk, language, policy).await;

        match &outcome {
            Ok(text) => {
                tracing::info!(
                    "Chunk {} transcribed successfully - {} words",
                    chunk.index,
                    text.split_whitespace().count()
                );
                if !chunk.is_source {
                    if let Err(e) = tokio::fs::remove_file(&chunk.path).await {
                        tracing::debug!("Could not remove {}: {}", chunk.path.display(), e);
                    }
                }
            }
            Err(e) => {
                // The file stays on disk so a later pass can pick it up again
                tracing::warn!("Error transcribing chunk {}: {}", chunk.index, e);
            }
        }

        ChunkResult {
            index: chunk.index,
            outcome,
        }
    }

    async fn send_chunk(&self, chunk: &AudioChunk, language: &str, policy: &RetryPolicy) -> Result<String, TranscribeError> {
        let tier = self.settings.tier;
        if chunk.byte_size > tier.limits().advisory_cap_bytes {
            return Err(TranscribeError::PayloadTooLarge {
                size_mb: chunk.size_mb(),
                tier,
            });
        }

        let audio = tokio::fs::read(&chunk.path)
            .await
            .map_err(|e| TranscribeError::Io(format!("{}: {}", chunk.path.display(), e)))?;
        let file_name = chunk.file_name();
        let file_name = file_name.as_str();

        policy
            .run(|attempt| {
                let audio = audio.clone();
                async move {
                    self.limiter.acquire().await;
                    tracing::debug!(
                        "Sending chunk {} ({:.1}MB, attempt {}/{})",
                        chunk.index,
                        chunk.size_mb(),
                        attempt + 1,
                        policy.max_retries
                    );
                    self.client.transcribe(audio, file_name, language).await
                }
            })
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::EchoClient;
    use super::*;
    use crate::transcribe::reassemble::reassemble;
    use tempfile::TempDir;

    async fn write_chunks(dir: &TempDir, count: usize) -> Vec<AudioChunk> {
        let mut chunks = Vec::new();
        for index in 0..count {
            let path = dir.path().join(format!("chunk_{index:04}.mp3"));
            tokio::fs::write(&path, format!("part{index}")).await.unwrap();
            chunks.push(AudioChunk {
                index,
                start_ms: index as u64 * 1000,
                end_ms: (index as u64 + 1) * 1000,
                byte_size: 5,
                path,
                oversized: false,
                is_source: false,
            });
        }
        chunks
    }

    fn pool(client: Arc<dyn TranscriptionClient>) -> TranscriptionWorkerPool {
        TranscriptionWorkerPool::new(client, Arc::new(RateLimiter::new(400)), PoolSettings::for_tier(Tier::Free))
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_ordered_despite_out_of_order_completion() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 8).await;

        // Earlier chunks take longer, so they finish last
        fn earlier_is_slower(text: &str) -> u64 {
            let index: u64 = text.trim_start_matches("part").parse().unwrap();
            (8 - index) * 1_000
        }
        let client = Arc::new(EchoClient {
            delay_ms: Some(earlier_is_slower as fn(&str) -> u64),
            ..Default::default()
        });

        let (sink, mut rx) = ProgressSink::channel();
        let results = pool(client).run(&chunks, 4, "en", &CancellationToken::new(), &sink).await;

        let mut completion_order = Vec::new();
        while let Ok(PipelineEvent::ChunkProgress { index, .. }) = rx.try_recv() {
            completion_order.push(index);
        }
        assert_ne!(completion_order, (0..8).collect::<Vec<_>>());

        let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(
            reassemble(8, &results).as_deref(),
            Some("part0 part1 part2 part3 part4 part5 part6 part7")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_chunks_are_deleted_failed_are_kept() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 3).await;
        // Fails all 5 first-pass attempts and all 3 retry-pass attempts
        let client = Arc::new(EchoClient::failing("part1", 8));

        let results = pool(client.clone())
            .run(&chunks, 2, "en", &CancellationToken::new(), &ProgressSink::none())
            .await;

        assert!(results[0].is_success() && results[2].is_success());
        assert!(!results[1].is_success());
        assert!(!chunks[0].path.exists());
        assert!(chunks[1].path.exists());
        assert!(!chunks[2].path.exists());
        let part1_calls = client.calls.lock().unwrap().iter().filter(|t| *t == "part1").count();
        assert_eq!(part1_calls, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pass_recovers_failed_chunk() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 3).await;
        // Exhausts the first pass, then succeeds on the first sequential retry
        let client = Arc::new(EchoClient::failing("part2", 5));

        let results = pool(client)
            .run(&chunks, 3, "en", &CancellationToken::new(), &ProgressSink::none())
            .await;

        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(reassemble(3, &results).as_deref(), Some("part0 part1 part2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 5).await;
        let client = Arc::new(EchoClient::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = pool(client.clone()).run(&chunks, 2, "en", &cancel, &ProgressSink::none()).await;

        assert!(results.is_empty());
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_chunk_is_rejected_without_request() {
        let dir = TempDir::new().unwrap();
        let mut chunks = write_chunks(&dir, 1).await;
        chunks[0].byte_size = 40 * 1024 * 1024;
        let client = Arc::new(EchoClient::default());

        let results = pool(client.clone())
            .run(&chunks, 1, "en", &CancellationToken::new(), &ProgressSink::none())
            .await;

        assert!(matches!(
            results[0].error(),
            Some(TranscribeError::PayloadTooLarge { tier: Tier::Free, .. })
        ));
        assert!(client.calls.lock().unwrap().is_empty());
        assert!(chunks[0].path.exists());
    }
}
