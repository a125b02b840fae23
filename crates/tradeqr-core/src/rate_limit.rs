//! Rate limiting of session creation per network origin.
//!
//! Sliding window: each origin may have at most `creations_per_window`
//! admitted requests whose timestamps fall inside the trailing window.
//! The check and the record happen under one lock, so concurrent requests
//! from the same origin can never be over-admitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

/// Errors from the limiter's own storage. Callers must fail closed.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),
}

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum session creations per window per origin.
    pub creations_per_window: u32,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            creations_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// Budget check consulted before a session is created.
#[async_trait]
pub trait CreationLimiter: Send + Sync {
    /// Check the budget for `origin` and, if admitted, consume one unit.
    async fn allow(&self, origin: &str) -> Result<Admission, RateLimitError>;
}

/// In-process sliding-window limiter.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    /// Admission timestamps per origin, oldest first.
    trackers: Mutex<HashMap<String, VecDeque<Instant>>>,
    /// Origins that bypass the limiter.
    allowlist: RwLock<HashSet<String>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
            allowlist: RwLock::new(HashSet::new()),
        }
    }

    pub async fn add_to_allowlist(&self, origin: String) {
        info!(origin = %origin, "Added origin to rate limit allowlist");
        self.allowlist.write().await.insert(origin);
    }

    pub async fn remove_from_allowlist(&self, origin: &str) {
        info!(origin = %origin, "Removed origin from rate limit allowlist");
        self.allowlist.write().await.remove(origin);
    }

    pub async fn is_allowlisted(&self, origin: &str) -> bool {
        self.allowlist.read().await.contains(origin)
    }

    /// Drop origins with no admissions left inside the window.
    /// Returns the number of origins removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut trackers = self.trackers.lock().await;
        let before = trackers.len();
        trackers.retain(|_, admitted| {
            while admitted
                .front()
                .is_some_and(|&t| now.duration_since(t) >= window)
            {
                admitted.pop_front();
            }
            !admitted.is_empty()
        });
        before - trackers.len()
    }

    /// Forget everything recorded for `origin`.
    pub async fn reset(&self, origin: &str) {
        self.trackers.lock().await.remove(origin);
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[async_trait]
impl CreationLimiter for SlidingWindowLimiter {
    async fn allow(&self, origin: &str) -> Result<Admission, RateLimitError> {
        if self.is_allowlisted(origin).await {
            return Ok(Admission::Allowed);
        }

        let now = Instant::now();
        let window = self.config.window;
        let limit = self.config.creations_per_window as usize;

        let mut trackers = self.trackers.lock().await;
        let admitted = trackers.entry(origin.to_string()).or_default();

        while admitted
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            admitted.pop_front();
        }

        if admitted.len() >= limit {
            let retry_after_secs = admitted
                .front()
                .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(window)
                .as_secs()
                .max(1);

            warn!(
                origin = %origin,
                admitted = admitted.len(),
                retry_after_secs,
                "Session creation rate limit exceeded"
            );

            return Ok(Admission::Limited { retry_after_secs });
        }

        admitted.push_back(now);
        Ok(Admission::Allowed)
    }
}
