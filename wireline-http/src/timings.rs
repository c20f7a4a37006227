//! Per-transfer phase timings and the client-wide aggregate.

/// Phase durations for one completed transfer, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferTimings {
    /// Start until name resolution completed.
    pub name_look_up: f64,
    /// Name resolution until the TCP connect completed.
    pub connect: f64,
    /// Connect until the TLS handshake completed (0 for plain connections).
    pub app_connect: f64,
    /// Handshake until the transfer was about to begin.
    pub pre_transfer: f64,
    /// Pre-transfer until the first response byte arrived.
    pub start_transfer: f64,
    /// Total transfer time.
    pub total: f64,
}

/// min/max/mean/variance over completed requests, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
}

/// Aggregate statistics per transfer phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub name_look_up: Statistics,
    pub connect: Statistics,
    pub app_connect: Statistics,
    pub pre_transfer: Statistics,
    pub start_transfer: Statistics,
    pub total: Statistics,
}

/// Welford accumulator for one phase.
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl Accumulator {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn statistics(&self) -> Statistics {
        if self.count == 0 {
            return Statistics::default();
        }
        Statistics {
            min: self.min,
            max: self.max,
            mean: self.mean,
            variance: self.m2 / self.count as f64,
        }
    }
}

/// The client-wide accumulator, fed by the completion drain.
#[derive(Debug, Default)]
pub(crate) struct TimingsAccumulator {
    name_look_up: Accumulator,
    connect: Accumulator,
    app_connect: Accumulator,
    pre_transfer: Accumulator,
    start_transfer: Accumulator,
    total: Accumulator,
}

impl TimingsAccumulator {
    pub fn record(&mut self, timings: &TransferTimings) {
        self.name_look_up.record(timings.name_look_up);
        self.connect.record(timings.connect);
        self.app_connect.record(timings.app_connect);
        self.pre_transfer.record(timings.pre_transfer);
        self.start_transfer.record(timings.start_transfer);
        self.total.record(timings.total);
    }

    pub fn snapshot(&self) -> Timings {
        Timings {
            name_look_up: self.name_look_up.statistics(),
            connect: self.connect.statistics(),
            app_connect: self.app_connect.statistics(),
            pre_transfer: self.pre_transfer.statistics(),
            start_transfer: self.start_transfer.statistics(),
            total: self.total.statistics(),
        }
    }
}
