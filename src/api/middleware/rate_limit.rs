//! Per-client rate limiting for the chunk route.
//!
//! Clients are keyed by the peer address from `ConnectInfo`. `X-Forwarded-For`
//! is only read when `trust_forwarded_for` is set, since any client can send it.

use crate::AppState;
use crate::api::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    DefaultKeyedRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::time::Duration;

/// Token buckets keyed by client address. Cheap to clone.
#[derive(Clone)]
pub struct ChunkRateLimiter {
    inner: Option<Arc<LimiterInner>>,
}

struct LimiterInner {
    limiter: DefaultKeyedRateLimiter<String>,
    trust_forwarded_for: bool,
    connect_info_warned: AtomicBool,
}

impl ChunkRateLimiter {
    /// `per_minute == 0` disables limiting.
    pub fn new(per_minute: u32, trust_forwarded_for: bool) -> Self {
        let inner = NonZeroU32::new(per_minute).map(|quota| {
            Arc::new(LimiterInner {
                limiter: RateLimiter::keyed(Quota::per_minute(quota)),
                trust_forwarded_for,
                connect_info_warned: AtomicBool::new(false),
            })
        });
        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Takes one token from `client`'s bucket.
    pub fn check(&self, client: &str) -> Result<(), AppError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        inner
            .limiter
            .check_key(&client.to_string())
            .map_err(|not_until| {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                AppError::TooManyRequests {
                    retry_after_secs: wait.as_secs() + 1,
                }
            })
    }

    /// Drops buckets that have refilled completely. Returns how many went.
    pub fn sweep(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let before = inner.limiter.len();
        inner.limiter.retain_recent();
        inner.limiter.shrink_to_fit();
        before.saturating_sub(inner.limiter.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.limiter.len())
    }

    fn client_key(&self, req: &Request) -> String {
        let Some(inner) = &self.inner else {
            return "unknown".to_string();
        };

        if inner.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|ip| ip.trim())
                .filter(|ip| !ip.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }

        match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => addr.ip().to_string(),
            None => {
                if !inner.connect_info_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "No peer address on request; every client shares one rate limit bucket"
                    );
                }
                "unknown".to_string()
            }
        }
    }
}

/// Answers 429 once a client exceeds its per-minute chunk budget.
pub async fn chunk_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let limiter = &state.rate_limiter;
    if limiter.is_enabled() {
        let client = limiter.client_key(&req);
        if let Err(e) = limiter.check(&client) {
            tracing::warn!(client = %client, "⛔ Chunk upload rate limit exceeded");
            return Err(e);
        }
    }
    Ok(next.run(req).await)
}

/// Periodically drops idle buckets until `shutdown` fires.
pub fn spawn_cleanup_task(
    limiter: ChunkRateLimiter,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let evicted = limiter.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "Rate limiter dropped idle clients");
                    }
                }
            }
        }
    })
}
