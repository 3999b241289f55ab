//! Optional process-wide QPS guard for the HTTP surface. The decision path
//! has its own per-campaign throttling; this only protects the service
//! itself from a misbehaving caller.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::RateLimitConfig;

pub type QpsGuard = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn guard_from_config(config: &RateLimitConfig) -> QpsGuard {
    let one = NonZeroU32::new(1).expect("1 is non-zero");
    let quota = Quota::per_second(NonZeroU32::new(config.requests_per_second).unwrap_or(one))
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(one));
    Arc::new(RateLimiter::direct(quota))
}

pub async fn qps_middleware(
    State(guard): State<QpsGuard>,
    request: Request,
    next: Next,
) -> Response {
    match guard.check() {
        Ok(_) => next.run(request).await,
        Err(_) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
    }
}
