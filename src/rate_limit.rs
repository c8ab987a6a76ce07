//! The outer per-IP request cap: a fixed-window counter guarding every HTTP
//! route, independent of anything session- or intent-level.
//!
//! No teacher analogue; shaped like [`crate::ranked::accept::AcceptCoordinator`]
//! as a plain `Mutex`-guarded map, since a fixed-window counter only ever
//! needs to see one IP's bucket at a time.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use chrono::{DateTime, TimeDelta, Utc};

use tokio::sync::Mutex;

use crate::app::AppState;
use crate::app::error::{AppError, AppErrorKind};
use crate::config::RateLimitConfig;

struct Bucket {
    window_start: DateTime<Utc>,
    count: u32,
}

/// A generic per-IP fixed-window limiter, independent of any particular
/// session or intent — the "outer HTTP layer" cap every request passes
/// through before it reaches a route.
pub struct RateLimiter {
    window: TimeDelta,
    limit: u32,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> RateLimiter {
        RateLimiter {
            window: config.window,
            limit: config.requests_per_window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request from `ip`, returning `false` once its window's
    /// budget is exhausted. Stale buckets roll over to a fresh window
    /// rather than accumulating indefinitely.
    async fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Utc::now();

        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            window_start: now,
            count: 0,
        });

        if now - bucket.window_start >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count += 1;
        bucket.count <= self.limit
    }

    /// Drops buckets whose window has long since rolled over, so a fleet of
    /// one-off callers doesn't grow this map forever. Call periodically;
    /// cheap relative to the window length.
    pub async fn sweep(&self) {
        let cutoff = Utc::now() - self.window * 2;
        self.buckets
            .lock()
            .await
            .retain(|_, bucket| bucket.window_start > cutoff);
    }
}

/// Rejects a request once its source IP has exceeded the configured
/// per-window cap, logging the address so an operator can tell a runaway
/// client from an attack.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.rate_limiter.check(addr.ip()).await {
        tracing::warn!(ip = %addr.ip(), "dropping request: source ip exceeded rate limit");
        return Err(AppError::new(AppErrorKind::RateExceeded));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_window: 3,
            window: TimeDelta::seconds(60),
        }
    }

    #[tokio::test]
    async fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(&test_config());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn distinct_ips_get_independent_budgets() {
        let limiter = RateLimiter::new(&test_config());
        let a: IpAddr = "203.0.113.9".parse().unwrap();
        let b: IpAddr = "203.0.113.10".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check(a).await);
        }
        assert!(!limiter.check(a).await);
        assert!(limiter.check(b).await);
    }

    #[tokio::test]
    async fn a_rolled_over_window_resets_the_budget() {
        let limiter = RateLimiter::new(&test_config());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check(ip).await);
        }
        assert!(!limiter.check(ip).await);

        {
            let mut buckets = limiter.buckets.lock().await;
            buckets.get_mut(&ip).unwrap().window_start = Utc::now() - TimeDelta::seconds(120);
        }

        assert!(limiter.check(ip).await);
    }

    #[tokio::test]
    async fn sweep_drops_long_stale_buckets() {
        let limiter = RateLimiter::new(&test_config());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        limiter.check(ip).await;

        {
            let mut buckets = limiter.buckets.lock().await;
            buckets.get_mut(&ip).unwrap().window_start = Utc::now() - TimeDelta::seconds(600);
        }

        limiter.sweep().await;
        assert!(limiter.buckets.lock().await.is_empty());
    }
}
