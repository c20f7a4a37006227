//! HTTP engine metrics.

use metriken::{metric, Counter};

#[metric(name = "wireline_http/requests/started", description = "Requests begun")]
pub static REQUESTS_STARTED: Counter = Counter::new();

#[metric(
    name = "wireline_http/requests/completed",
    description = "Requests finished successfully"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "wireline_http/requests/failed",
    description = "Requests finished with an error"
)]
pub static REQUESTS_FAILED: Counter = Counter::new();

#[metric(
    name = "wireline_http/pool/acquire_timeouts",
    description = "Transport pool acquisition timeouts"
)]
pub static POOL_ACQUIRE_TIMEOUTS: Counter = Counter::new();

#[metric(name = "wireline_http/bytes/sent", description = "Request bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "wireline_http/bytes/received",
    description = "Response body bytes received"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "wireline_http/auth/replays",
    description = "Requests replayed with credentials after a challenge"
)]
pub static AUTH_REPLAYS: Counter = Counter::new();
