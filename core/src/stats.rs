//! Per-operation statistics for a connection.
//!
//! Counters are keyed by intrinsic (or extrinsic) method name and cover
//! the connection's lifetime. When statistics are disabled every recording
//! call is a no-op and the table stays empty.

use std::collections::HashMap;
use std::time::Duration;

/// Sum/min/max over the byte lengths of request and reply bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeStats {
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl SizeStats {
    fn add(&mut self, value: u64, first: bool) {
        self.sum += value;
        if first {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}

/// Sum/min/max over measured durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeStats {
    pub sum: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimeStats {
    fn add(&mut self, value: Duration, first: bool) {
        self.sum += value;
        if first {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}

/// Accumulated counters for one method name.
#[derive(Debug, Clone, Default)]
pub struct OperationStatistic {
    pub count: u64,
    pub exception_count: u64,
    pub client_time: TimeStats,
    /// From the `WBEMServerResponseTime` header; servers that do not send
    /// it leave this at zero while `server_time_count` stays zero too.
    pub server_time: TimeStats,
    pub server_time_count: u64,
    pub request_len: SizeStats,
    pub reply_len: SizeStats,
}

/// The per-connection statistics table.
#[derive(Debug, Clone)]
pub struct Statistics {
    enabled: bool,
    table: HashMap<String, OperationStatistic>,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            table: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record a completed round trip. Lengths are the exact byte lengths of
    /// the serialized request body and the received response body.
    pub fn record_round_trip(
        &mut self,
        method: &str,
        client_time: Duration,
        server_time: Option<Duration>,
        request_len: usize,
        reply_len: usize,
    ) {
        if !self.enabled {
            return;
        }
        let entry = self.table.entry(method.to_string()).or_default();
        let first = entry.count == 0;
        entry.count += 1;
        entry.client_time.add(client_time, first);
        entry.request_len.add(request_len as u64, first);
        entry.reply_len.add(reply_len as u64, first);
        if let Some(st) = server_time {
            let first_server = entry.server_time_count == 0;
            entry.server_time.add(st, first_server);
            entry.server_time_count += 1;
        }
    }

    /// Record an operation that raised, whether or not a round trip
    /// completed.
    pub fn record_exception(&mut self, method: &str) {
        if !self.enabled {
            return;
        }
        let entry = self.table.entry(method.to_string()).or_default();
        entry.exception_count += 1;
    }

    pub fn get(&self, method: &str) -> Option<&OperationStatistic> {
        self.table.get(method)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OperationStatistic)> {
        self.table.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn reset(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_statistics_record_nothing() {
        let mut stats = Statistics::new(false);
        stats.record_round_trip("GetInstance", Duration::from_millis(5), None, 100, 200);
        stats.record_exception("GetInstance");
        assert!(stats.is_empty());
        assert!(stats.get("GetInstance").is_none());
    }

    #[test]
    fn round_trips_accumulate() {
        let mut stats = Statistics::new(true);
        stats.record_round_trip(
            "GetInstance",
            Duration::from_millis(5),
            Some(Duration::from_micros(1234)),
            503,
            585,
        );
        stats.record_round_trip(
            "GetInstance",
            Duration::from_millis(3),
            Some(Duration::from_micros(1000)),
            503,
            700,
        );
        let s = stats.get("GetInstance").unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.exception_count, 0);
        assert_eq!(s.request_len.sum, 1006);
        assert_eq!(s.request_len.min, 503);
        assert_eq!(s.request_len.max, 503);
        assert_eq!(s.reply_len.min, 585);
        assert_eq!(s.reply_len.max, 700);
        assert_eq!(s.client_time.sum, Duration::from_millis(8));
        assert_eq!(s.client_time.min, Duration::from_millis(3));
        assert_eq!(s.server_time_count, 2);
        assert_eq!(s.server_time.max, Duration::from_micros(1234));
    }

    #[test]
    fn exceptions_count_separately_per_method() {
        let mut stats = Statistics::new(true);
        stats.record_exception("DeleteInstance");
        stats.record_round_trip("GetInstance", Duration::ZERO, None, 1, 1);
        assert_eq!(stats.get("DeleteInstance").unwrap().exception_count, 1);
        assert_eq!(stats.get("DeleteInstance").unwrap().count, 0);
        assert_eq!(stats.get("GetInstance").unwrap().exception_count, 0);
    }

    #[test]
    fn missing_server_time_leaves_zero() {
        let mut stats = Statistics::new(true);
        stats.record_round_trip("GetInstance", Duration::from_millis(1), None, 10, 10);
        let s = stats.get("GetInstance").unwrap();
        assert_eq!(s.server_time_count, 0);
        assert_eq!(s.server_time.sum, Duration::ZERO);
    }

    #[test]
    fn reset_clears_the_table() {
        let mut stats = Statistics::new(true);
        stats.record_round_trip("GetInstance", Duration::ZERO, None, 1, 1);
        stats.reset();
        assert!(stats.is_empty());
        assert!(stats.enabled());
    }
}
