//! Per-instance request trace stream and system-stat stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::pool::PoolSample;
use crate::sysstat::{ResourceUsage, SystemStat};

/// Position of a traced event in a request's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ClientSend,
    ServerReceive,
    ServerSend,
    ClientReceive,
}

/// Wall-clock interval in seconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: f64,
    pub end: f64,
}

impl Window {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Seconds since the UNIX epoch.
pub fn wall_clock_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One immutable trace sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: u64,
    pub timestamp: f64,
    pub call_path_id: u64,
    pub event_type: EventType,
    pub ordering_sequence: u64,
    pub pool_size_sample: u64,
    pub pool_total_size_sample: u64,
    pub resource_usage_sample: ResourceUsage,
    pub bulk_transfer_window: Option<Window>,
    pub operation_window: Option<Window>,
    pub size: u64,
    /// Bytes per second over the bulk window, or the operation window if
    /// there was no bulk transfer.
    pub bandwidth: f64,
    pub name: String,
}

/// Input to [`TraceRecorder::record`].
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub event_type: EventType,
    pub trace_id: u64,
    pub call_path_id: u64,
    pub name: String,
    pub pool: PoolSample,
    /// Sequence number seen on the wire, merged into the local counter.
    pub observed_sequence: Option<u64>,
    pub bulk_transfer_window: Option<Window>,
    pub operation_window: Option<Window>,
    pub size: u64,
}

impl TraceEvent {
    pub fn new(event_type: EventType, trace_id: u64, call_path_id: u64, name: impl Into<String>) -> Self {
        Self {
            event_type,
            trace_id,
            call_path_id,
            name: name.into(),
            pool: PoolSample {
                size: 0,
                total_size: 0,
            },
            observed_sequence: None,
            bulk_transfer_window: None,
            operation_window: None,
            size: 0,
        }
    }

    pub fn pool(mut self, pool: PoolSample) -> Self {
        self.pool = pool;
        self
    }

    pub fn observed(mut self, sequence: u64) -> Self {
        self.observed_sequence = Some(sequence);
        self
    }

    pub fn bulk(mut self, window: Window, size: u64) -> Self {
        self.bulk_transfer_window = Some(window);
        self.size = size;
        self
    }

    pub fn operation(mut self, window: Window) -> Self {
        self.operation_window = Some(window);
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Destination for records as they are produced. Must not block.
pub trait TraceSink: Send + Sync {
    fn emit(&self, record: &TraceRecord);

    fn emit_system_stat(&self, _stat: &SystemStat) {}
}

/// Sink that turns every record into a `tracing` event on `hpcrpc::trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, record: &TraceRecord) {
        trace!(
            target: "hpcrpc::trace",
            trace_id = record.trace_id,
            call_path = record.call_path_id,
            event = ?record.event_type,
            order = record.ordering_sequence,
            pool_size = record.pool_size_sample,
            pool_total_size = record.pool_total_size_sample,
            size = record.size,
            bandwidth = record.bandwidth,
            name = %record.name,
            "rpc trace"
        );
    }

    fn emit_system_stat(&self, stat: &SystemStat) {
        trace!(
            target: "hpcrpc::trace",
            cpu = stat.cpu_utilization,
            mem = stat.memory_utilization,
            load_1m = stat.loadavg_1m,
            pool_size = stat.pool_size,
            pool_total_size = stat.pool_total_size,
            "system stat"
        );
    }
}

/// Counters for a recorder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    pub recorded: u64,
    pub dropped: u64,
    pub system_stats_recorded: u64,
    pub last_sequence: u64,
}

/// Append-only per-instance trace stream with a total order.
pub struct TraceRecorder {
    enabled: bool,
    capacity: usize,
    sequence: AtomicU64,
    records: Mutex<VecDeque<TraceRecord>>,
    system_stats: Mutex<VecDeque<SystemStat>>,
    latest_usage: Mutex<ResourceUsage>,
    sink: Arc<dyn TraceSink>,
    recorded: AtomicU64,
    dropped: AtomicU64,
    system_stats_recorded: AtomicU64,
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("enabled", &self.enabled)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TraceRecorder {
    pub fn new(enabled: bool, capacity: usize, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            enabled,
            capacity,
            sequence: AtomicU64::new(0),
            records: Mutex::new(VecDeque::new()),
            system_stats: Mutex::new(VecDeque::new()),
            latest_usage: Mutex::new(ResourceUsage::default()),
            sink,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            system_stats_recorded: AtomicU64::new(0),
        }
    }

    // Lamport merge: strictly increasing locally, and past anything observed.
    fn next_sequence(&self, observed: Option<u64>) -> u64 {
        let observed = observed.unwrap_or(0);
        let prev = self
            .sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.max(observed).saturating_add(1))
            })
            .unwrap_or_else(|cur| cur);
        prev.max(observed).saturating_add(1)
    }

    /// Takes the next sequence number without recording anything. Pair with
    /// [`record_reserved`](Self::record_reserved).
    pub fn reserve_sequence(&self) -> u64 {
        self.next_sequence(None)
    }

    /// Produces the record for `event` and appends it to the stream.
    pub fn record(&self, event: TraceEvent) -> TraceRecord {
        let ordering_sequence = self.next_sequence(event.observed_sequence);
        self.record_reserved(ordering_sequence, event)
    }

    /// Records `event` under a sequence taken earlier from
    /// [`reserve_sequence`](Self::reserve_sequence).
    pub fn record_reserved(&self, ordering_sequence: u64, event: TraceEvent) -> TraceRecord {
        let bandwidth = match (event.bulk_transfer_window, event.operation_window) {
            (Some(w), _) | (None, Some(w)) if w.duration() > 0.0 => event.size as f64 / w.duration(),
            _ => 0.0,
        };
        let resource_usage_sample = self
            .latest_usage
            .lock()
            .map(|usage| *usage)
            .unwrap_or_default();

        let record = TraceRecord {
            trace_id: event.trace_id,
            timestamp: wall_clock_secs(),
            call_path_id: event.call_path_id,
            event_type: event.event_type,
            ordering_sequence,
            pool_size_sample: event.pool.size,
            pool_total_size_sample: event.pool.total_size,
            resource_usage_sample,
            bulk_transfer_window: event.bulk_transfer_window,
            operation_window: event.operation_window,
            size: event.size,
            bandwidth,
            name: event.name,
        };

        if !self.enabled {
            return record;
        }

        self.sink.emit(&record);
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if self.capacity == 0 {
            return record;
        }
        if let Ok(mut records) = self.records.lock() {
            if records.len() >= self.capacity {
                records.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            records.push_back(record.clone());
        }
        record
    }

    /// Appends a system sample and refreshes the resource usage attached to
    /// subsequent records.
    pub fn record_system_stat(&self, stat: SystemStat, usage: ResourceUsage) {
        if let Ok(mut latest) = self.latest_usage.lock() {
            *latest = usage;
        }
        if !self.enabled {
            return;
        }
        self.sink.emit_system_stat(&stat);
        self.system_stats_recorded.fetch_add(1, Ordering::Relaxed);
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut stats) = self.system_stats.lock() {
            if stats.len() >= self.capacity {
                stats.pop_front();
            }
            stats.push_back(stat);
        }
    }

    /// Removes and returns buffered records, oldest first.
    pub fn drain(&self) -> Vec<TraceRecord> {
        if let Ok(mut records) = self.records.lock() {
            return records.drain(..).collect();
        }
        Vec::new()
    }

    pub fn drain_system_stats(&self) -> Vec<SystemStat> {
        if let Ok(mut stats) = self.system_stats.lock() {
            return stats.drain(..).collect();
        }
        Vec::new()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            system_stats_recorded: self.system_stats_recorded.load(Ordering::Relaxed),
            last_sequence: self.sequence.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinSet;

    #[derive(Default)]
    struct CountingSink {
        seen: AtomicU64,
    }

    impl TraceSink for CountingSink {
        fn emit(&self, _record: &TraceRecord) {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recorder(capacity: usize) -> TraceRecorder {
        TraceRecorder::new(true, capacity, Arc::new(TracingSink))
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let rec = recorder(16);
        let a = rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "a"));
        let b = rec.record(TraceEvent::new(EventType::ClientReceive, 1, 7, "a"));
        assert_eq!(a.ordering_sequence, 1);
        assert_eq!(b.ordering_sequence, 2);
    }

    #[test]
    fn test_observed_sequence_is_merged() {
        let rec = recorder(16);
        rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "a"));
        let merged = rec.record(TraceEvent::new(EventType::ServerReceive, 1, 7, "a").observed(40));
        assert_eq!(merged.ordering_sequence, 41);
        let low = rec.record(TraceEvent::new(EventType::ServerReceive, 1, 7, "a").observed(3));
        assert_eq!(low.ordering_sequence, 42);
    }

    #[test]
    fn test_bandwidth_from_bulk_window() {
        let rec = recorder(16);
        let r = rec.record(
            TraceEvent::new(EventType::ClientReceive, 1, 7, "bulk")
                .bulk(Window::new(10.0, 12.0), 4096),
        );
        assert_eq!(r.bandwidth, 2048.0);
        assert_eq!(r.size, 4096);
    }

    #[test]
    fn test_bandwidth_zero_without_window() {
        let rec = recorder(16);
        let r = rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x").size(100));
        assert_eq!(r.bandwidth, 0.0);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let rec = recorder(2);
        for _ in 0..3 {
            rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x"));
        }
        let drained = rec.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].ordering_sequence, 2);
        assert_eq!(rec.stats().dropped, 1);
        assert!(rec.drain().is_empty());
    }

    #[test]
    fn test_observed_sequence_saturates() {
        let rec = recorder(16);
        let r = rec.record(TraceEvent::new(EventType::ServerReceive, 1, 7, "a").observed(u64::MAX));
        assert_eq!(r.ordering_sequence, u64::MAX);
        let next = rec.record(TraceEvent::new(EventType::ServerSend, 1, 7, "a"));
        assert_eq!(next.ordering_sequence, u64::MAX);
        assert_eq!(rec.stats().last_sequence, u64::MAX);
    }

    #[test]
    fn test_zero_capacity_buffers_nothing() {
        let sink = Arc::new(CountingSink::default());
        let rec = TraceRecorder::new(true, 0, sink.clone());
        for _ in 0..3 {
            rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x"));
        }
        rec.record_system_stat(SystemStat::default(), ResourceUsage::default());

        assert!(rec.drain().is_empty());
        assert!(rec.drain_system_stats().is_empty());
        assert_eq!(sink.seen.load(Ordering::Relaxed), 3);
        let stats = rec.stats();
        assert_eq!(stats.recorded, 3);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.system_stats_recorded, 1);
    }

    #[test]
    fn test_reserved_sequence_keeps_its_place() {
        let rec = recorder(16);
        let reserved = rec.reserve_sequence();
        let later = rec.record(TraceEvent::new(EventType::ClientReceive, 1, 7, "b"));
        let r = rec.record_reserved(reserved, TraceEvent::new(EventType::ClientSend, 1, 7, "a"));
        assert_eq!(r.ordering_sequence, 1);
        assert_eq!(later.ordering_sequence, 2);

        // an unused reservation leaves a gap and nothing in the buffer
        rec.reserve_sequence();
        let drained = rec.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "c")).ordering_sequence, 4);
    }

    #[test]
    fn test_disabled_recorder_keeps_nothing() {
        let sink = Arc::new(CountingSink::default());
        let rec = TraceRecorder::new(false, 8, sink.clone());
        let r = rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x"));
        assert_eq!(r.ordering_sequence, 1);
        assert!(rec.drain().is_empty());
        assert_eq!(sink.seen.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sink_sees_every_record() {
        let sink = Arc::new(CountingSink::default());
        let rec = TraceRecorder::new(true, 8, sink.clone());
        rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x"));
        rec.record(TraceEvent::new(EventType::ClientReceive, 1, 7, "x"));
        assert_eq!(sink.seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_system_stat_refreshes_usage() {
        let rec = recorder(8);
        let usage = ResourceUsage {
            user_ticks: 11,
            system_ticks: 3,
            voluntary_context_switches: 5,
            involuntary_context_switches: 1,
        };
        rec.record_system_stat(SystemStat::default(), usage);
        let r = rec.record(TraceEvent::new(EventType::ClientSend, 1, 7, "x"));
        assert_eq!(r.resource_usage_sample, usage);
        assert_eq!(rec.drain_system_stats().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sequences_unique() {
        let rec = Arc::new(recorder(10_000));
        let mut set = JoinSet::new();
        for t in 0..8u64 {
            let rec = Arc::clone(&rec);
            set.spawn(async move {
                for _ in 0..100 {
                    rec.record(TraceEvent::new(EventType::ClientSend, t, t, "x"));
                }
            });
        }
        while set.join_next().await.is_some() {}

        let mut seqs: Vec<u64> = rec.drain().iter().map(|r| r.ordering_sequence).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 800);
        assert_eq!(*seqs.last().unwrap(), 800);
    }
}
