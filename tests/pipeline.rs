use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use multifetch::chunking::ChunkEncoder;
use multifetch::transcribe::{
    PipelineEvent, PipelineSettings, ProgressSink, Tier, TranscribeError, TranscriptionClient, TranscriptionPipeline,
};
use multifetch::{AudioAsset, AudioFormat};

const MB: u64 = 1024 * 1024;
const MINUTE: u64 = 60_000;

/// Writes the chunk's time range as its content
struct RangeEncoder;

#[async_trait]
impl ChunkEncoder for RangeEncoder {
    async fn encode(&self, _source: &Path, start_ms: u64, end_ms: u64, bitrate_kbps: u32, dest: &Path) -> Result<u64> {
        tokio::fs::write(dest, format!("[{}-{}]", start_ms, end_ms)).await?;
        Ok((end_ms - start_ms) * bitrate_kbps as u64 / 8)
    }
}

/// Echoes the payload after a fixed delay, tracking peak concurrency
#[derive(Default)]
struct SlowEcho {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl TranscriptionClient for SlowEcho {
    async fn transcribe(&self, audio: Vec<u8>, _file_name: &str, language: &str) -> Result<String, TranscribeError> {
        assert_eq!(language, "en");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(2)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(&audio).into_owned();
        self.calls.lock().unwrap().push(text.clone());
        Ok(text)
    }
}

fn pipeline(client: Arc<SlowEcho>, scratch: &TempDir) -> TranscriptionPipeline {
    let mut settings = PipelineSettings::for_tier(Tier::Free);
    settings.temp_dir = Some(scratch.path().to_path_buf());
    TranscriptionPipeline::new(client, Arc::new(RangeEncoder), settings)
}

#[tokio::test(start_paused = true)]
async fn long_asset_at_the_ceiling_is_chunked_and_reassembled_in_order() {
    let scratch = TempDir::new().unwrap();
    let source = scratch.path().join("lecture.mp3");
    std::fs::write(&source, b"source").unwrap();
    let asset = AudioAsset::new(&source, 90 * MINUTE, 25 * MB, AudioFormat::Mp3);

    let client = Arc::new(SlowEcho::default());
    let pipeline = pipeline(client.clone(), &scratch);
    let (sink, mut rx) = ProgressSink::channel();

    let transcription = pipeline
        .transcribe(&asset, "en", &CancellationToken::new(), &sink)
        .await
        .unwrap();
    drop(sink);

    assert!(transcription.chunked);
    assert!(transcription.chunk_count > 1);
    assert!(transcription.workers > 1);
    assert!(transcription.failed_chunks.is_empty());
    assert!(!transcription.text.is_empty());
    assert!(client.peak.load(Ordering::SeqCst) > 1);
    assert_eq!(client.calls.lock().unwrap().len(), transcription.chunk_count);

    // Segments come back in chunk order whatever order they finished in
    let starts: Vec<u64> = transcription
        .text
        .split_whitespace()
        .map(|segment| segment.trim_matches(|c| c == '[' || c == ']'))
        .map(|range| range.split('-').next().unwrap().parse().unwrap())
        .collect();
    assert_eq!(starts.len(), transcription.chunk_count);
    assert!(starts.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(transcription.text.ends_with(&format!("-{}]", 90 * MINUTE)));

    let mut chunk_events = 0;
    let mut completed = false;
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::ChunkProgress { total, succeeded, .. } => {
                assert_eq!(total, transcription.chunk_count);
                assert!(succeeded);
                chunk_events += 1;
            }
            PipelineEvent::Complete { failed, .. } => {
                assert_eq!(failed, 0);
                completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(chunk_events, transcription.chunk_count);
    assert!(completed);

    // Chunk files are gone, the source is untouched
    assert!(source.exists());
    let leftovers: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path() != source)
        .collect();
    assert!(leftovers.is_empty(), "leftover scratch entries: {leftovers:?}");
}

#[tokio::test(start_paused = true)]
async fn short_asset_is_sent_directly() {
    let scratch = TempDir::new().unwrap();
    let source = scratch.path().join("clip.mp3");
    std::fs::write(&source, b"short clip").unwrap();
    let asset = AudioAsset::new(&source, 5 * MINUTE, 4 * MB, AudioFormat::Mp3);

    let client = Arc::new(SlowEcho::default());
    let transcription = pipeline(client.clone(), &scratch)
        .transcribe(&asset, "en", &CancellationToken::new(), &ProgressSink::none())
        .await
        .unwrap();

    assert!(!transcription.chunked);
    assert_eq!(transcription.chunk_count, 1);
    assert_eq!(transcription.text, "short clip");
    assert!(source.exists());
}
