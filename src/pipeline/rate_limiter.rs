//! Per-service sliding-window rate limiter
//!
//! Each service keeps the admission times of its recent requests. A caller is
//! admitted only while fewer than `max_requests` admissions fall inside the
//! trailing `time_window`; otherwise it sleeps until the oldest admission
//! leaves the window. Bursts inside a single second get a short smoothing
//! delay instead of a rejection.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{Result, WorkspaceError};

/// Horizon used for burst detection
const BURST_HORIZON: Duration = Duration::from_secs(1);

/// Snapshot of a limiter's window
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitStats {
    pub active_requests: usize,
    pub max_requests: usize,
    pub time_window_secs: u64,
    pub utilization: f64,
}

/// Sliding-window limiter for one named service
pub struct RateLimiter {
    service: String,
    limits: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
}

enum Admission {
    Granted,
    WaitForWindow(Duration),
    SmoothBurst,
}

impl RateLimiter {
    pub fn new(service: impl Into<String>, limits: RateLimitConfig) -> Self {
        Self {
            service: service.into(),
            limits,
            window: Mutex::new(VecDeque::with_capacity(limits.max_requests)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn limits(&self) -> &RateLimitConfig {
        &self.limits
    }

    /// Wait until a request may be sent, then record it.
    ///
    /// The admission timestamp is written only at the instant of admission,
    /// so dropping this future while it sleeps leaves the window untouched.
    pub async fn acquire(&self) -> Result<()> {
        let mut window_waits = 0u32;
        let mut smoothed = false;

        loop {
            match self.try_admit(smoothed).await {
                Admission::Granted => return Ok(()),
                Admission::WaitForWindow(wait) => {
                    if window_waits >= self.limits.max_wait_retries {
                        warn!(
                            service = %self.service,
                            retries = window_waits,
                            "Rate limiter gave up waiting for window capacity"
                        );
                        return Err(WorkspaceError::rate_limit(
                            format!(
                                "Local rate limit for {} still saturated after {} waits",
                                self.service, window_waits
                            ),
                            wait.max(Duration::from_secs(1)),
                        )
                        .with_detail("service", self.service.clone().into()));
                    }
                    window_waits += 1;
                    warn!(
                        service = %self.service,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting for window capacity"
                    );
                    tokio::time::sleep(wait).await;
                }
                Admission::SmoothBurst => {
                    smoothed = true;
                    debug!(service = %self.service, "Burst detected, smoothing");
                    tokio::time::sleep(self.limits.burst_delay).await;
                }
            }
        }
    }

    async fn try_admit(&self, smoothed: bool) -> Admission {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        self.purge(&mut window, now);

        if window.len() >= self.limits.max_requests {
            // Oldest admission leaves the window at `oldest + time_window`
            let wait = window
                .front()
                .map(|oldest| (*oldest + self.limits.time_window).saturating_duration_since(now))
                .unwrap_or_default();
            return Admission::WaitForWindow(wait.max(Duration::from_millis(1)));
        }

        if !smoothed && window.len() >= self.limits.burst_limit {
            let horizon = now.checked_sub(BURST_HORIZON);
            let recent = window
                .iter()
                .rev()
                .take_while(|t| horizon.map_or(true, |h| **t > h))
                .count();
            if recent >= self.limits.burst_limit {
                return Admission::SmoothBurst;
            }
        }

        window.push_back(now);
        Admission::Granted
    }

    fn purge(&self, window: &mut VecDeque<Instant>, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.limits.time_window) {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
    }

    /// Current window utilisation
    pub async fn stats(&self) -> RateLimitStats {
        let mut window = self.window.lock().await;
        self.purge(&mut window, Instant::now());
        let active = window.len();
        RateLimitStats {
            active_requests: active,
            max_requests: self.limits.max_requests,
            time_window_secs: self.limits.time_window.as_secs(),
            utilization: active as f64 / self.limits.max_requests as f64,
        }
    }

    /// Admission timestamps currently inside the window, oldest first
    pub async fn admissions(&self) -> Vec<Instant> {
        let mut window = self.window.lock().await;
        self.purge(&mut window, Instant::now());
        window.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limits(max: usize, window_secs: u64, burst: usize) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: max,
            time_window: Duration::from_secs(window_secs),
            burst_limit: burst,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_below_limit_without_waiting() {
        let limiter = RateLimiter::new("drive", limits(5, 60, 10));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.stats().await.active_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::new("sheets", limits(2, 10, 10));
        limiter.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.acquire().await.unwrap();

        let start = Instant::now();
        limiter.acquire().await.unwrap();
        // First admission was at t=0, so capacity frees at t=10 (7s from now)
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_adds_smoothing_delay() {
        let limiter = RateLimiter::new("docs", limits(100, 60, 3));
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        let start = Instant::now();
        limiter.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_max() {
        let limiter = Arc::new(RateLimiter::new("forms", limits(4, 5, 100)));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await.unwrap();
                Instant::now()
            }));
        }
        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();
        for (i, t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|u| u.duration_since(*t) < Duration::from_secs(5))
                .count();
            assert!(in_window <= 4, "window starting at admission {} held {}", i, in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_leaves_no_timestamp() {
        let limiter = RateLimiter::new("gmail", limits(1, 60, 10));
        limiter.acquire().await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_secs(5), limiter.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(limiter.admissions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let config = RateLimitConfig {
            max_wait_retries: 0,
            ..limits(1, 60, 10)
        };
        let limiter = RateLimiter::new("slides", config);
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RateLimit);
        assert!(err.retry_after().is_some());
    }
}
