use std::time::Duration;

/// Cumulative per-session counters. Collectors snapshot them before a poll
/// and report the difference.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub num_calls: u64,
    pub bytes_rx: u64,
    pub api_time: Duration,
    pub parse_time: Duration,
}

impl Stats {
    /// One request sent to the appliance, whatever its outcome.
    pub fn record_call(&mut self, api_time: Duration) {
        self.num_calls += 1;
        self.api_time += api_time;
    }

    /// Body of a successful call read and decoded.
    pub fn record_parse(&mut self, parse_time: Duration, bytes: usize) {
        self.bytes_rx += bytes as u64;
        self.parse_time += parse_time;
    }

    /// Counters accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &Stats) -> Stats {
        Stats {
            num_calls: self.num_calls.saturating_sub(earlier.num_calls),
            bytes_rx: self.bytes_rx.saturating_sub(earlier.bytes_rx),
            api_time: self.api_time.saturating_sub(earlier.api_time),
            parse_time: self.parse_time.saturating_sub(earlier.parse_time),
        }
    }
}
