//! Per-client rate limiting for the `/api` routes.

use std::{
    future::{Ready, ready},
    sync::Arc,
    time::Instant,
};

use actix_web::{
    Error, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use dashmap::DashMap;
use futures::future::LocalBoxFuture;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::json;

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later.";

/// Token bucket refilled continuously at `refill_rate` tokens per second.
pub struct TokenBucket {
    inner: Mutex<TokenBucketInner>,
    capacity: f64,
    refill_rate: f64,
}

struct TokenBucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let capacity = capacity as f64;
        Self {
            inner: Mutex::new(TokenBucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate,
        }
    }

    fn refill(&self, inner: &mut TokenBucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.capacity);
        inner.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.tokens
    }

    fn is_full(&self) -> bool {
        self.available_tokens() >= self.capacity
    }
}

/// One bucket per client key, created on first sight.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    /// `max_requests` per `window_secs`; `max_requests == 0` disables limiting.
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        let refill_rate = if window_secs == 0 {
            max_requests as f64
        } else {
            max_requests as f64 / window_secs as f64
        };
        Self {
            buckets: DashMap::new(),
            capacity: max_requests,
            refill_rate,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns true if `client` may proceed.
    pub fn check(&self, client: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let bucket = self
            .buckets
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.capacity, self.refill_rate)))
            .clone();
        bucket.try_acquire()
    }

    /// Drop buckets that have refilled completely; they carry no state.
    pub fn prune_idle(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full());
        let pruned = before - self.buckets.len();
        if pruned > 0 {
            debug!("Pruned {} idle rate limit buckets", pruned);
        }
        pruned
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whole tokens left for `client`; a client never seen has a full bucket.
    pub fn remaining(&self, client: &str) -> u32 {
        self.buckets
            .get(client)
            .map(|bucket| bucket.available_tokens().floor() as u32)
            .unwrap_or(self.capacity)
    }

    /// Seconds until an exhausted bucket holds one token again.
    pub fn retry_after_secs(&self) -> u64 {
        if self.refill_rate <= 0.0 {
            return 0;
        }
        (1.0 / self.refill_rate).ceil() as u64
    }
}

/// actix middleware rejecting clients over their budget with 429.
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitService<S> {
    service: S,
    limiter: Arc<RateLimiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Keyed on the socket address; forwarding headers are client-controlled.
        let client = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if !self.limiter.check(&client) {
            warn!("Rate limit exceeded for {} on {}", client, req.path());
            let response = HttpResponse::TooManyRequests()
                .insert_header(("RateLimit-Limit", self.limiter.capacity().to_string()))
                .insert_header(("RateLimit-Remaining", self.limiter.remaining(&client).to_string()))
                .insert_header(("Retry-After", self.limiter.retry_after_secs().to_string()))
                .json(json!({
                    "error": RATE_LIMIT_MESSAGE,
                }));
            let (req, _) = req.into_parts();
            return Box::pin(async move {
                Ok(ServiceResponse::new(req, response).map_into_right_body())
            });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}
