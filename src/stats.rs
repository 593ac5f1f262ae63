//! Shared request statistics.
//!
//! One mutex-guarded counter block spans all workers. Every handled
//! request contributes exactly one [`ServerStats::record`] call; the
//! `/api/stats` endpoint and the periodic printer read consistent
//! snapshots under the same lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::cache::CacheStats;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_requests: u64,
    bytes_transferred: u64,
    status_200: u64,
    status_404: u64,
    status_500: u64,
    total_response_time_ms: u64,
    active_connections: u64,
}

/// Process-wide request counters.
///
/// All counters are monotonically non-decreasing except
/// `active_connections`.
#[derive(Debug, Default)]
pub struct ServerStats {
    counters: Mutex<Counters>,
}

/// A consistent point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub bytes_transferred: u64,
    pub status_200: u64,
    pub status_404: u64,
    pub status_500: u64,
    pub total_response_time_ms: u64,
    pub active_connections: u64,
}

impl StatsSnapshot {
    /// Mean response time over all recorded requests, zero when none.
    #[must_use]
    pub fn avg_response_time_ms(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_response_time_ms / self.total_requests
        }
    }
}

impl ServerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one completed response. Only 200, 404, and 500 carry a
    /// per-status counter; every response counts toward the totals.
    pub fn record(&self, status: u16, bytes: u64, duration_ms: u64) {
        let mut counters = self.lock();
        counters.total_requests += 1;
        counters.bytes_transferred += bytes;
        counters.total_response_time_ms += duration_ms;
        match status {
            200 => counters.status_200 += 1,
            404 => counters.status_404 += 1,
            500 => counters.status_500 += 1,
            _ => {}
        }
    }

    pub fn connection_opened(&self) {
        self.lock().active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut counters = self.lock();
        counters.active_connections = counters.active_connections.saturating_sub(1);
    }

    /// A consistent copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.lock();
        StatsSnapshot {
            total_requests: counters.total_requests,
            bytes_transferred: counters.bytes_transferred,
            status_200: counters.status_200,
            status_404: counters.status_404,
            status_500: counters.status_500,
            total_response_time_ms: counters.total_response_time_ms,
            active_connections: counters.active_connections,
        }
    }
}

/// `status_codes` object of the stats report.
#[derive(Debug, Serialize)]
pub struct StatusCodesReport {
    #[serde(rename = "200")]
    pub ok: u64,
    #[serde(rename = "404")]
    pub not_found: u64,
    #[serde(rename = "500")]
    pub internal_error: u64,
}

/// `cache` object of the stats report.
#[derive(Debug, Serialize)]
pub struct CacheReport {
    pub items: usize,
    pub bytes_used: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Hit percentage in [0, 100], two-decimal precision.
    pub hit_rate: f64,
}

/// The `/api/stats` JSON document.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub total_requests: u64,
    pub bytes_transferred: u64,
    pub active_connections: u64,
    pub avg_response_time_ms: u64,
    pub status_codes: StatusCodesReport,
    pub cache: CacheReport,
}

impl StatsReport {
    /// Builds the report from a stats snapshot and per-worker cache
    /// stats, which are summed across workers.
    #[must_use]
    pub fn build(snapshot: StatsSnapshot, caches: &[CacheStats]) -> Self {
        let mut combined = CacheStats::default();
        for stats in caches {
            combined.items += stats.items;
            combined.bytes_used += stats.bytes_used;
            combined.capacity += stats.capacity;
            combined.hits += stats.hits;
            combined.misses += stats.misses;
            combined.evictions += stats.evictions;
        }
        let lookups = combined.hits + combined.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            let percent = (combined.hits as f64 / lookups as f64) * 100.0;
            (percent * 100.0).round() / 100.0
        };

        Self {
            total_requests: snapshot.total_requests,
            bytes_transferred: snapshot.bytes_transferred,
            active_connections: snapshot.active_connections,
            avg_response_time_ms: snapshot.avg_response_time_ms(),
            status_codes: StatusCodesReport {
                ok: snapshot.status_200,
                not_found: snapshot.status_404,
                internal_error: snapshot.status_500,
            },
            cache: CacheReport {
                items: combined.items,
                bytes_used: combined.bytes_used,
                capacity: combined.capacity,
                hits: combined.hits,
                misses: combined.misses,
                evictions: combined.evictions,
                hit_rate,
            },
        }
    }
}

/// Human-readable one-line summary for the periodic printer.
#[must_use]
pub fn format_summary(snapshot: &StatsSnapshot, caches: &[CacheStats]) -> String {
    let (hits, misses): (u64, u64) = caches
        .iter()
        .fold((0, 0), |(h, m), c| (h + c.hits, m + c.misses));
    format!(
        "requests={} bytes={} active={} avg_ms={} 200={} 404={} 500={} cache_hits={hits} cache_misses={misses}",
        snapshot.total_requests,
        snapshot.bytes_transferred,
        snapshot.active_connections,
        snapshot.avg_response_time_ms(),
        snapshot.status_200,
        snapshot.status_404,
        snapshot.status_500,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_totals_and_classes() {
        let stats = ServerStats::new();
        stats.record(200, 100, 5);
        stats.record(200, 50, 3);
        stats.record(404, 150, 2);
        stats.record(500, 0, 10);
        stats.record(403, 120, 1); // no class counter

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 5);
        assert_eq!(snap.bytes_transferred, 420);
        assert_eq!(snap.status_200, 2);
        assert_eq!(snap.status_404, 1);
        assert_eq!(snap.status_500, 1);
        assert_eq!(snap.total_response_time_ms, 21);
    }

    #[test]
    fn test_stats_conservation_over_classed_statuses() {
        let stats = ServerStats::new();
        for _ in 0..4 {
            stats.record(200, 10, 1);
        }
        for _ in 0..3 {
            stats.record(404, 10, 1);
        }
        stats.record(500, 10, 1);

        let snap = stats.snapshot();
        assert_eq!(
            snap.status_200 + snap.status_404 + snap.status_500,
            snap.total_requests
        );
    }

    #[test]
    fn test_avg_response_time() {
        let stats = ServerStats::new();
        assert_eq!(stats.snapshot().avg_response_time_ms(), 0);
        stats.record(200, 0, 10);
        stats.record(200, 0, 20);
        assert_eq!(stats.snapshot().avg_response_time_ms(), 15);
    }

    #[test]
    fn test_active_connections_tracks_open_close() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        assert_eq!(stats.snapshot().active_connections, 2);
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 1);
        stats.connection_closed();
        stats.connection_closed(); // must not underflow
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[test]
    fn test_report_json_shape() {
        let stats = ServerStats::new();
        stats.record(200, 21, 3);
        let caches = vec![CacheStats {
            items: 1,
            bytes_used: 21,
            capacity: 1024,
            hits: 3,
            misses: 1,
            evictions: 0,
        }];
        let report = StatsReport::build(stats.snapshot(), &caches);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["bytes_transferred"], 21);
        assert_eq!(json["active_connections"], 0);
        assert_eq!(json["status_codes"]["200"], 1);
        assert_eq!(json["status_codes"]["404"], 0);
        assert_eq!(json["status_codes"]["500"], 0);
        assert_eq!(json["cache"]["items"], 1);
        assert_eq!(json["cache"]["hit_rate"], 75.0);
    }

    #[test]
    fn test_report_aggregates_worker_caches() {
        let caches = vec![
            CacheStats {
                items: 2,
                bytes_used: 100,
                capacity: 512,
                hits: 1,
                misses: 1,
                evictions: 0,
            },
            CacheStats {
                items: 1,
                bytes_used: 50,
                capacity: 512,
                hits: 2,
                misses: 0,
                evictions: 3,
            },
        ];
        let report = StatsReport::build(StatsSnapshot::default(), &caches);
        assert_eq!(report.cache.items, 3);
        assert_eq!(report.cache.bytes_used, 150);
        assert_eq!(report.cache.capacity, 1024);
        assert_eq!(report.cache.evictions, 3);
        assert_eq!(report.cache.hit_rate, 75.0);
    }

    #[test]
    fn test_hit_rate_zero_when_no_lookups() {
        let report = StatsReport::build(StatsSnapshot::default(), &[CacheStats::default()]);
        assert_eq!(report.cache.hit_rate, 0.0);
    }

    #[test]
    fn test_hit_rate_two_decimal_rounding() {
        let caches = vec![CacheStats {
            hits: 1,
            misses: 2,
            ..CacheStats::default()
        }];
        let report = StatsReport::build(StatsSnapshot::default(), &caches);
        assert_eq!(report.cache.hit_rate, 33.33);
    }

    #[test]
    fn test_format_summary_mentions_all_counters() {
        let stats = ServerStats::new();
        stats.record(200, 21, 3);
        let line = format_summary(&stats.snapshot(), &[]);
        assert!(line.contains("requests=1"));
        assert!(line.contains("bytes=21"));
        assert!(line.contains("200=1"));
    }
}
