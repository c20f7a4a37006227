//! wireline runtime metrics.
//!
//! Counters for readiness events, timer fires, and wakeups. Exposed through
//! the `metriken` registry when the embedding application scrapes it.

use metriken::{metric, Counter};

#[metric(
    name = "wireline/events/delivered",
    description = "Readiness events delivered to the handler"
)]
pub static EVENTS_DELIVERED: Counter = Counter::new();

#[metric(name = "wireline/timer/fired", description = "Deadline timer fires")]
pub static TIMER_FIRED: Counter = Counter::new();

#[metric(
    name = "wireline/wakeups",
    description = "Eventfd wakeups of the ring owner"
)]
pub static WAKEUPS: Counter = Counter::new();

#[metric(
    name = "wireline/dispatch/executed",
    description = "Dispatched closures executed"
)]
pub static DISPATCH_EXECUTED: Counter = Counter::new();

#[metric(
    name = "wireline/sqe/submit_failures",
    description = "SQE submission failures"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();
