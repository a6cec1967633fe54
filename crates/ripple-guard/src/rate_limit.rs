//! Per-socket and per-user message rate limiting.
//!
//! Fixed-window counters: the first message in a window sets the
//! reset deadline, subsequent messages count against the cap until the
//! window rolls over. State is in-memory and resets with the process.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Messages admitted per window. Zero disables limiting.
    pub max: u32,
    /// Window length.
    pub window: Duration,
    /// Scope keys by channel as well.
    pub per_channel: bool,
    /// Prefer the user identity over the socket id when known.
    pub per_user: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: 100,
            window: Duration::from_secs(60),
            per_channel: false,
            per_user: false,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Message admitted.
    Admitted,
    /// Message blocked; retry once this much time has passed.
    Blocked { retry_in: Duration },
}

impl RateDecision {
    /// Whether the message was blocked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, RateDecision::Blocked { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window rate limiter.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Assemble the bucket key for a message.
    ///
    /// `user:{id}` when per-user limiting applies and the user is
    /// known, else `socket:{id}`; `:channel:{name}` appended when
    /// per-channel limiting applies.
    #[must_use]
    pub fn key(&self, socket_id: &str, user_id: Option<&str>, channel: Option<&str>) -> String {
        let mut key = match (self.config.per_user, user_id) {
            (true, Some(user)) => format!("user:{user}"),
            _ => format!("socket:{socket_id}"),
        };
        if self.config.per_channel {
            if let Some(channel) = channel {
                key.push_str(":channel:");
                key.push_str(channel);
            }
        }
        key
    }

    /// Count a message against its bucket.
    pub fn check(&self, key: &str) -> RateDecision {
        if self.config.max == 0 {
            return RateDecision::Admitted;
        }

        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at: now + self.config.window,
        });

        if now >= bucket.reset_at {
            bucket.count = 1;
            bucket.reset_at = now + self.config.window;
            return RateDecision::Admitted;
        }

        if bucket.count >= self.config.max {
            trace!(key = %key, "Rate limit exceeded");
            return RateDecision::Blocked {
                retry_in: bucket.reset_at.saturating_duration_since(now),
            };
        }

        bucket.count += 1;
        RateDecision::Admitted
    }

    /// Drop buckets whose window has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| bucket.reset_at > now);
    }

    /// Drop every bucket belonging to a socket.
    pub fn forget_socket(&self, socket_id: &str) {
        let prefix = format!("socket:{socket_id}");
        self.buckets.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max,
            window: Duration::from_millis(window_ms),
            per_channel: false,
            per_user: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_cap_is_monotonic() {
        let limiter = limiter(3, 1000);

        for _ in 0..3 {
            assert_eq!(limiter.check("socket:s1"), RateDecision::Admitted);
        }
        // Once the cap is hit nothing is admitted until the reset.
        for _ in 0..5 {
            assert!(limiter.check("socket:s1").is_blocked());
        }

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(limiter.check("socket:s1"), RateDecision::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_in_reflects_window_remainder() {
        let limiter = limiter(1, 1000);
        limiter.check("socket:s1");

        tokio::time::advance(Duration::from_millis(400)).await;
        match limiter.check("socket:s1") {
            RateDecision::Blocked { retry_in } => {
                assert_eq!(retry_in, Duration::from_millis(600));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_key_assembly() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_channel: true,
            per_user: true,
            ..RateLimitConfig::default()
        });

        assert_eq!(
            limiter.key("s1", Some("u1"), Some("news")),
            "user:u1:channel:news"
        );
        assert_eq!(limiter.key("s1", None, Some("news")), "socket:s1:channel:news");

        let plain = RateLimiter::new(RateLimitConfig::default());
        assert_eq!(plain.key("s1", Some("u1"), Some("news")), "socket:s1");
    }

    #[tokio::test]
    async fn test_zero_max_disables() {
        let limiter = limiter(0, 1000);
        for _ in 0..100 {
            assert_eq!(limiter.check("socket:s1"), RateDecision::Admitted);
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_buckets() {
        let limiter = limiter(3, 1000);
        limiter.check("socket:s1");
        limiter.check("socket:s2");
        assert_eq!(limiter.bucket_count(), 2);

        tokio::time::advance(Duration::from_millis(1500)).await;
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_forget_socket() {
        let limiter = limiter(3, 1000);
        limiter.check("socket:s1");
        limiter.check("socket:s2");
        limiter.forget_socket("s1");
        assert_eq!(limiter.bucket_count(), 1);
    }
}
