//! Per-client token bucket for the contact endpoint.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use sfr_telemetry::record_counter;
use tower::{Layer, Service, util::ServiceExt};

use crate::config::RateSettings;

const LIMITED_COUNTER: &str = "relay_contact_rate_limited_total";

/// Distinct clients tracked before idle buckets are swept.
pub const MAX_TRACKED_CLIENTS: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn level(&self, now: Instant, refill_per_sec: f64, capacity: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        (self.tokens + elapsed * refill_per_sec).min(capacity)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    capacity: f64,
    refill_per_sec: f64,
    max_clients: usize,
}

impl RateLimiter {
    pub fn new(settings: RateSettings) -> Self {
        Self::with_max_clients(settings, MAX_TRACKED_CLIENTS)
    }

    pub fn with_max_clients(settings: RateSettings, max_clients: usize) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity: f64::from(settings.capacity),
            refill_per_sec: f64::from(settings.refill_per_sec),
            max_clients: max_clients.max(1),
        }
    }

    /// Takes one token for `key`; `false` when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if !buckets.contains_key(key) && buckets.len() >= self.max_clients {
            self.sweep(&mut buckets, now);
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last: now,
        });
        bucket.tokens = bucket.level(now, self.refill_per_sec, self.capacity);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of clients currently holding a bucket.
    pub fn tracked(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops buckets that have refilled to capacity. Falls back to evicting the
    /// least recently used one.
    fn sweep(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) {
        let (capacity, refill) = (self.capacity, self.refill_per_sec);
        buckets.retain(|_, bucket| bucket.level(now, refill, capacity) < capacity);
        if buckets.len() < self.max_clients {
            return;
        }
        let stalest = buckets
            .iter()
            .min_by_key(|(_, bucket)| bucket.last)
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            buckets.remove(&key);
        }
        tracing::debug!(tracked = buckets.len(), "rate limiter evicted an active bucket");
    }
}

/// First hop of `x-forwarded-for`, or `unknown`.
pub fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            limiter: RateLimiter::new(settings),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer
where
    S: Service<Request<Body>, Response = Response> + Clone,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let key = client_key(req.headers());
        let allow = self.limiter.check(&key);
        let inner = self.inner.clone();
        Box::pin(async move {
            if allow {
                inner.oneshot(req).await
            } else {
                record_counter(LIMITED_COUNTER, &[]);
                tracing::warn!(client = %key, "contact submission rate limited");
                Ok(StatusCode::TOO_MANY_REQUESTS.into_response())
            }
        })
    }
}
