use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const SAFETY_BUFFER: Duration = Duration::from_millis(100);

/// Sliding-window admission control for requests to the transcription service.
///
/// `acquire` parks the caller until a request may be sent: at most `rpm`
/// admissions in any trailing 60 seconds, spaced at least `60 / rpm` apart.
/// The lock only guards the timestamp window and is released before sleeping.
pub struct RateLimiter {
    rpm: usize,
    min_interval: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        let rpm = rpm.max(1);
        Self::with_min_interval(rpm, WINDOW / rpm)
    }

    /// Limiter with a custom spacing between consecutive requests
    pub fn with_min_interval(rpm: u32, min_interval: Duration) -> Self {
        Self {
            rpm: rpm.max(1) as usize,
            min_interval,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub fn rpm(&self) -> usize {
        self.rpm
    }

    /// Wait until a request may be sent, then record it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut requests = self.requests.lock().await;
                let now = Instant::now();

                while let Some(&oldest) = requests.front() {
                    if now.duration_since(oldest) >= WINDOW {
                        requests.pop_front();
                    } else {
                        break;
                    }
                }

                match self.admission_delay(&requests, now) {
                    Some(wait) => wait,
                    None => {
                        requests.push_back(now);
                        return;
                    }
                }
            };

            tracing::debug!("Rate limit wait: {:.2}s", wait.as_secs_f64());
            sleep(wait).await;
        }
    }

    /// Requests admitted in the trailing window
    pub async fn in_flight_window(&self) -> usize {
        let requests = self.requests.lock().await;
        let now = Instant::now();
        requests
            .iter()
            .filter(|&&t| now.duration_since(t) < WINDOW)
            .count()
    }

    fn admission_delay(&self, requests: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        if requests.len() >= self.rpm {
            let oldest = *requests.front()?;
            let wait = WINDOW.saturating_sub(now.duration_since(oldest)) + SAFETY_BUFFER;
            return Some(wait);
        }

        let last = *requests.back()?;
        let since_last = now.duration_since(last);
        if since_last < self.min_interval {
            Some(self.min_interval - since_last)
        } else {
            None
        }
    }
}
