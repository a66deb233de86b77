//! Shared bandwidth cap
//!
//! One token bucket for the whole queue. Every worker asks for tokens before
//! writing a chunk, so the configured rate is divided between whichever tasks
//! are IN_PROGRESS at the moment. The bucket holds at most one second of
//! tokens, which bounds bursts after an idle period.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; `None` means unlimited
    rate: Option<u64>,
    /// May go negative: a large chunk borrows from the next refill
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        }
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    pub fn new(rate: Option<u64>) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: rate.filter(|r| *r > 0),
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub async fn rate(&self) -> Option<u64> {
        self.bucket.lock().await.rate
    }

    /// Change the cap; takes effect for the next chunk of every worker
    pub async fn set_rate(&self, rate: Option<u64>) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.rate = rate.filter(|r| *r > 0);
        if let Some(rate) = bucket.rate {
            bucket.tokens = bucket.tokens.min(rate as f64);
        } else {
            bucket.tokens = 0.0;
        }
        debug!("Bandwidth limit set to {:?} bytes/s", bucket.rate);
    }

    /// Wait until `bytes` may be written.
    ///
    /// The reservation is taken immediately and the caller sleeps off any
    /// deficit, so concurrent callers queue behind each other fairly.
    pub async fn acquire(&self, bytes: usize) {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let Some(rate) = bucket.rate else {
                return;
            };
            bucket.refill(Instant::now());
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / rate as f64)
        };

        trace!("Throttling {} bytes for {:?}", bytes, wait);
        sleep(wait).await;
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
