use futures_util::stream::{self, Stream};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use super::{Job, JobSnapshot, ProgressEvent};

/// Idle time after which a subscriber is sent a keepalive
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

/// One frame of a progress stream
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Event(ProgressEvent),
    Keepalive,
}

impl SseFrame {
    /// Server-sent events wire format
    pub fn to_sse(&self) -> String {
        match self {
            SseFrame::Event(event) => {
                let data = event.data_json().unwrap_or_else(|e| {
                    tracing::warn!("Failed to serialize {} event: {}", event.event_name(), e);
                    "{}".to_string()
                });
                format!("event: {}\ndata: {}\n\n", event.event_name(), data)
            }
            SseFrame::Keepalive => ": keepalive\n\n".to_string(),
        }
    }
}

/// Per-job publish/subscribe hub for progress events
pub struct ProgressBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    keepalive: Duration,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::with_keepalive(KEEPALIVE_INTERVAL)
    }

    pub fn with_keepalive(keepalive: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            keepalive,
        }
    }

    /// Send `event` to every current subscriber of `job_id`
    pub async fn publish(&self, job_id: &str, event: ProgressEvent) {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(job_id) {
            // No receivers is fine; late subscribers replay a snapshot instead
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a job's events.
    ///
    /// The subscription first replays the job's current state, so observers
    /// joining late see everything they missed.
    pub async fn subscribe(&self, job: &Arc<Job>) -> Subscription {
        let rx = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(job.id().to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        // Snapshot after subscribing so nothing falls between the two
        let snapshot = job.snapshot().await;
        let finished = snapshot.status.is_terminal();

        let mut pending = VecDeque::from([SseFrame::Event(ProgressEvent::Update(snapshot.clone()))]);
        if finished {
            pending.push_back(SseFrame::Event(ProgressEvent::Complete(snapshot)));
        }

        Subscription {
            job: Arc::downgrade(job),
            rx,
            pending,
            finished,
            keepalive: self.keepalive,
        }
    }

    /// Drop the job's channel. Subscribers drain what was already sent, then end.
    pub async fn close(&self, job_id: &str) {
        self.channels.lock().await.remove(job_id);
    }

    pub async fn subscriber_count(&self, job_id: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(job_id)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// A single observer's view of one job
pub struct Subscription {
    job: Weak<Job>,
    rx: broadcast::Receiver<ProgressEvent>,
    pending: VecDeque<SseFrame>,
    finished: bool,
    keepalive: Duration,
}

impl Subscription {
    /// Next frame, or `None` once the job has finished or disappeared
    pub async fn next(&mut self) -> Option<SseFrame> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Ok(event)) => {
                self.finished = event.is_final();
                Some(SseFrame::Event(event))
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!("Progress subscriber fell behind by {} events, resyncing", skipped);
                let snapshot = self.current()?.snapshot().await;
                Some(SseFrame::Event(self.resync(snapshot)))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                self.finished = true;
                let job = self.current()?;
                let snapshot = job.snapshot().await;
                snapshot
                    .status
                    .is_terminal()
                    .then(|| SseFrame::Event(ProgressEvent::Complete(snapshot)))
            }
            Err(_) => {
                // Idle: re-check the job so a missed final event cannot hang the stream
                match self.current() {
                    None => self.finished = true,
                    Some(job) => {
                        let snapshot = job.snapshot().await;
                        if snapshot.status.is_terminal() {
                            self.pending.push_back(SseFrame::Event(ProgressEvent::Complete(snapshot)));
                            self.finished = true;
                        }
                    }
                }
                Some(SseFrame::Keepalive)
            }
        }
    }

    /// Frames as a stream, ending with the job
    pub fn into_stream(self) -> impl Stream<Item = SseFrame> {
        stream::unfold(self, |mut sub| async move { sub.next().await.map(|frame| (frame, sub)) })
    }

    fn current(&mut self) -> Option<Arc<Job>> {
        let job = self.job.upgrade();
        if job.is_none() {
            self.finished = true;
        }
        job
    }

    fn resync(&mut self, snapshot: JobSnapshot) -> ProgressEvent {
        if snapshot.status.is_terminal() {
            self.finished = true;
            ProgressEvent::Complete(snapshot)
        } else {
            ProgressEvent::Update(snapshot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::Platform;
    use crate::jobs::{ItemUpdate, JobItem, JobStatus, JobType};
    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn job(urls: usize) -> Arc<Job> {
        let items = (0..urls)
            .map(|i| JobItem::new(format!("https://youtu.be/video{i:06}"), Some(Platform::Youtube), None))
            .collect();
        Arc::new(Job::new("job00001", JobType::Full, "en", items, CancellationToken::new()))
    }

    async fn publish_item(broadcaster: &ProgressBroadcaster, job: &Job, index: usize, update: ItemUpdate) {
        let progress = job.update_item(index, update).await.unwrap();
        broadcaster.publish(job.id(), ProgressEvent::ItemUpdate(progress)).await;
    }

    #[test]
    fn test_sse_wire_format() {
        assert_eq!(SseFrame::Keepalive.to_sse(), ": keepalive\n\n");
    }

    #[tokio::test]
    async fn test_replays_snapshot_then_live_events() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(2);
        publish_item(&broadcaster, &job, 0, ItemUpdate::progress(40)).await;

        let mut sub = broadcaster.subscribe(&job).await;
        match sub.next().await {
            Some(SseFrame::Event(ProgressEvent::Update(snapshot))) => {
                assert_eq!(snapshot.items[0].progress, 40);
                assert_eq!(snapshot.progress, 20);
            }
            other => panic!("expected replay, got {other:?}"),
        }

        publish_item(&broadcaster, &job, 1, ItemUpdate::failed("nope")).await;
        match sub.next().await {
            Some(SseFrame::Event(ProgressEvent::ItemUpdate(item))) => {
                assert_eq!(item.index, 1);
                assert_eq!(item.status, JobStatus::Failed);
            }
            other => panic!("expected item update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_after_final_event() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(1);
        let sub = broadcaster.subscribe(&job).await;

        publish_item(&broadcaster, &job, 0, ItemUpdate::completed(Some("hi".into()))).await;
        broadcaster
            .publish(job.id(), ProgressEvent::finished(job.snapshot().await))
            .await;
        broadcaster.close(job.id()).await;

        let names: Vec<&str> = sub
            .into_stream()
            .map(|frame| match frame {
                SseFrame::Event(event) => event.event_name(),
                SseFrame::Keepalive => "keepalive",
            })
            .collect()
            .await;
        assert_eq!(names, vec!["update", "item_update", "complete"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_to_finished_job() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(1);
        job.update_item(0, ItemUpdate::failed("gone")).await.unwrap();

        let frames: Vec<SseFrame> = broadcaster.subscribe(&job).await.into_stream().collect().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[1], SseFrame::Event(ProgressEvent::Complete(s)) if s.status == JobStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_when_idle_then_completes() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(1);
        let mut sub = broadcaster.subscribe(&job).await;
        sub.next().await;

        assert_eq!(sub.next().await, Some(SseFrame::Keepalive));

        // Finished without a final event reaching the channel
        job.update_item(0, ItemUpdate::completed(None)).await.unwrap();
        assert_eq!(sub.next().await, Some(SseFrame::Keepalive));
        assert!(matches!(sub.next().await, Some(SseFrame::Event(ProgressEvent::Complete(_)))));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(1);
        let mut sub = broadcaster.subscribe(&job).await;
        sub.next().await;

        for progress in 0..(CHANNEL_CAPACITY + 10) {
            publish_item(&broadcaster, &job, 0, ItemUpdate::progress((progress % 100) as u8)).await;
        }

        match sub.next().await {
            Some(SseFrame::Event(ProgressEvent::Update(snapshot))) => {
                assert_eq!(snapshot.status, JobStatus::Running);
            }
            other => panic!("expected resync snapshot, got {other:?}"),
        }
        assert_eq!(broadcaster.subscriber_count(job.id()).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_job_ends_stream() {
        let broadcaster = ProgressBroadcaster::new();
        let job = job(1);
        let mut sub = broadcaster.subscribe(&job).await;
        sub.next().await;

        broadcaster.close(job.id()).await;
        drop(job);
        assert_eq!(sub.next().await, None);
    }
}
