//! Sync performance counters.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::util::duration_millis;

/// Number of sync durations kept for the rolling average.
const SYNC_TIME_WINDOW: usize = 100;

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub failed_syncs: u64,
    pub items_synced: u64,
    pub items_failed: u64,
    pub average_sync_time_ms: f64,
    pub delta_fields_sent: u64,
    pub bytes_saved: u64,
    pub requests_coalesced: u64,
    pub conflicts: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
struct State {
    metrics: SyncMetrics,
    sync_times: VecDeque<u64>,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: Mutex<State>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed sync pass.
    pub fn record_sync(&self, duration: Duration, synced: usize, failed: usize) {
        let mut state = self.state.lock();
        state.metrics.total_syncs += 1;
        if failed > 0 {
            state.metrics.failed_syncs += 1;
        }
        state.metrics.items_synced += synced as u64;
        state.metrics.items_failed += failed as u64;

        state.sync_times.push_back(duration_millis(duration));
        if state.sync_times.len() > SYNC_TIME_WINDOW {
            state.sync_times.pop_front();
        }
        let total: u64 = state.sync_times.iter().sum();
        state.metrics.average_sync_time_ms = total as f64 / state.sync_times.len() as f64;
    }

    pub fn record_delta(&self, fields: usize, bytes_saved: u64) {
        let mut state = self.state.lock();
        state.metrics.delta_fields_sent += fields as u64;
        state.metrics.bytes_saved += bytes_saved;
    }

    pub fn record_coalesced(&self, merged: usize) {
        self.state.lock().metrics.requests_coalesced += merged as u64;
    }

    pub fn record_conflict(&self) {
        self.state.lock().metrics.conflicts += 1;
    }

    pub fn record_retry(&self) {
        self.state.lock().metrics.retries += 1;
    }

    pub fn snapshot(&self) -> SyncMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn reset(&self) {
        *self.state.lock() = State::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_uses_rolling_window() {
        let metrics = MetricsCollector::new();
        for _ in 0..SYNC_TIME_WINDOW {
            metrics.record_sync(Duration::from_millis(1_000), 1, 0);
        }
        for _ in 0..SYNC_TIME_WINDOW {
            metrics.record_sync(Duration::from_millis(10), 1, 0);
        }
        let snapshot = metrics.snapshot();
        assert!((snapshot.average_sync_time_ms - 10.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.total_syncs, 200);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_sync(Duration::from_millis(5), 3, 1);
        metrics.record_delta(4, 120);
        metrics.record_coalesced(2);
        metrics.record_conflict();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_synced, 3);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.failed_syncs, 1);
        assert_eq!(snapshot.delta_fields_sent, 4);
        assert_eq!(snapshot.bytes_saved, 120);
        assert_eq!(snapshot.requests_coalesced, 2);
        assert_eq!(snapshot.conflicts, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), SyncMetrics::default());
    }
}
