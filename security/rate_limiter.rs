//! Authentication Throttling
//!
//! Fixed-window attempt counter with one window per key. A key moves
//! Empty → Counting → Exhausted inside its window and returns to Empty once
//! the window has elapsed. Expiry is lazy: an elapsed window reads as zero
//! attempts regardless of what is stored, and the periodic cleanup only
//! reclaims memory.
//!
//! Windows live in a sharded map, so attempts for unrelated keys never
//! contend on the same lock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, SecurityError};
use crate::metrics::METRICS;

/// How the limiter key is derived from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// One window per source address
    PeerAddress,

    /// One window per source address and submitted identity
    PeerAddressAndIdentity,
}

/// Derives a limiter key from the caller
pub trait RateLimitKey: Send + Sync {
    /// Key for an attempt from `peer`, optionally naming an identity
    fn key(&self, peer: IpAddr, identity: Option<&str>) -> String;
}

impl RateLimitKey for KeyPolicy {
    fn key(&self, peer: IpAddr, identity: Option<&str>) -> String {
        match (self, identity) {
            (KeyPolicy::PeerAddressAndIdentity, Some(identity)) => {
                format!("{}|{}", peer, identity.trim().to_lowercase())
            }
            _ => peer.to_string(),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum attempts per window
    pub max_attempts: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Key derivation policy
    pub key_policy: KeyPolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 60,
            key_policy: KeyPolicy::PeerAddress,
        }
    }
}

impl RateLimiterConfig {
    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Reject zero attempts or a zero-length window
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SecurityError::Config(
                "Rate limiter needs at least one attempt per window".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(SecurityError::Config(
                "Rate limiter window cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rate limiter result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Attempt allowed
    Allowed {
        /// Attempts left in the current window
        remaining: u32,
    },

    /// Attempt denied until the window resets
    Denied {
        /// Time until the window resets
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// True when the attempt may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Convert into the error the edge reports
    pub fn into_result(self) -> Result<u32> {
        match self {
            RateLimitResult::Allowed { remaining } => Ok(remaining),
            RateLimitResult::Denied { retry_after } => {
                Err(SecurityError::RateLimitExceeded { retry_after })
            }
        }
    }
}

/// Attempt counter for one key
#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    fn elapsed(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

/// Per-key fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    /// Create new rate limiter
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Boolean form: true when the attempt is allowed
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Count an attempt for `key`
    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    /// Count an attempt for `key` at a given instant
    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        let window = self.config.window();

        // The entry guard holds this key's shard lock for the whole
        // read-modify-write, so concurrent attempts cannot lose increments.
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                window_start: now,
            });

        if entry.elapsed(now, window) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.config.max_attempts {
            let used = now.saturating_duration_since(entry.window_start);
            let retry_after = window.saturating_sub(used);
            METRICS.rate_limit_rejections_total.inc();
            warn!("Rate limit exceeded for key {}", key);
            return RateLimitResult::Denied { retry_after };
        }

        entry.count += 1;
        debug!(
            "Rate limit attempt {}/{} for key {}",
            entry.count, self.config.max_attempts, key
        );

        RateLimitResult::Allowed {
            remaining: self.config.max_attempts - entry.count,
        }
    }

    /// Attempts counted for `key` in its live window
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts_at(key, Instant::now())
    }

    /// Attempts counted for `key` at a given instant
    pub fn attempts_at(&self, key: &str, now: Instant) -> u32 {
        self.windows
            .get(key)
            .filter(|w| !w.elapsed(now, self.config.window()))
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Forget a key's window
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Evict windows that have elapsed
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    /// Evict windows that have elapsed at a given instant
    pub fn cleanup_at(&self, now: Instant) {
        let window = self.config.window();
        self.windows.retain(|_, w| !w.elapsed(now, window));

        info!("Rate limiter cleanup: {} keys tracked", self.windows.len());
    }

    /// Start cleanup task
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                self.cleanup();
            }
        })
    }
}
