//! Request and replication counters, rendered as `name value` lines by `/_statistics`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Process-wide counters the core increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConnectionsCurrent,
    GetRequests,
    GetRequestsFoundOnReplica,
    GetRequestsNotFound,
    PostRequests,
    PostRequestsFailed,
    PostRequestsNewFileStored,
    PutRequests,
    PutRequestsFailed,
    PutRequestsMissingFileChecks,
    PutRequestsNewFileStored,
    ReplicationPushAttempts,
    ReplicationPushAttemptsFailed,
}

impl Counter {
    /// Every counter, in rendering order.
    pub const ALL: [Counter; 13] = [
        Counter::ConnectionsCurrent,
        Counter::GetRequests,
        Counter::GetRequestsFoundOnReplica,
        Counter::GetRequestsNotFound,
        Counter::PostRequests,
        Counter::PostRequestsFailed,
        Counter::PostRequestsNewFileStored,
        Counter::PutRequests,
        Counter::PutRequestsFailed,
        Counter::PutRequestsMissingFileChecks,
        Counter::PutRequestsNewFileStored,
        Counter::ReplicationPushAttempts,
        Counter::ReplicationPushAttemptsFailed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::ConnectionsCurrent => "connections_current",
            Counter::GetRequests => "get_requests",
            Counter::GetRequestsFoundOnReplica => "get_requests_found_on_replica",
            Counter::GetRequestsNotFound => "get_requests_not_found",
            Counter::PostRequests => "post_requests",
            Counter::PostRequestsFailed => "post_requests_failed",
            Counter::PostRequestsNewFileStored => "post_requests_new_file_stored",
            Counter::PutRequests => "put_requests",
            Counter::PutRequestsFailed => "put_requests_failed",
            Counter::PutRequestsMissingFileChecks => "put_requests_missing_file_checks",
            Counter::PutRequestsNewFileStored => "put_requests_new_file_stored",
            Counter::ReplicationPushAttempts => "replication_push_attempts",
            Counter::ReplicationPushAttemptsFailed => "replication_push_attempts_failed",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Gauges reported per replication peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMetric {
    QueueLength,
    SecondsBehind,
}

impl PeerMetric {
    pub fn suffix(self) -> &'static str {
        match self {
            PeerMetric::QueueLength => "queue_length",
            PeerMetric::SecondsBehind => "seconds_behind",
        }
    }
}

/// Where the core reports what it did. The registry below is the only production
/// implementation; tests may substitute their own.
pub trait StatisticsSink: Send + Sync {
    fn increment(&self, counter: Counter);

    fn decrement(&self, counter: Counter);

    /// Record the current value of a per-peer gauge. `peer` is `host:port`.
    fn peer_metric(&self, peer: &str, metric: PeerMetric, value: u64);
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerGauges {
    queue_length: u64,
    seconds_behind: u64,
}

/// In-memory counter registry.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: [AtomicI64; Counter::ALL.len()],
    peers: Mutex<BTreeMap<String, PeerGauges>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> i64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Last reported value of a peer gauge, if the peer has reported at all.
    pub fn peer_value(&self, peer: &str, metric: PeerMetric) -> Option<u64> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(peer).map(|g| match metric {
            PeerMetric::QueueLength => g.queue_length,
            PeerMetric::SecondsBehind => g.seconds_behind,
        })
    }

    /// Render every counter followed by the per-peer gauges.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for counter in Counter::ALL {
            let _ = writeln!(out, "{} {}", counter.name(), self.get(counter));
        }

        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        for (peer, gauges) in peers.iter() {
            let label = metric_label(peer);
            for (metric, value) in [
                (PeerMetric::QueueLength, gauges.queue_length),
                (PeerMetric::SecondsBehind, gauges.seconds_behind),
            ] {
                let _ = writeln!(out, "replication_{label}_{} {value}", metric.suffix());
            }
        }
        out
    }
}

impl StatisticsSink for Statistics {
    fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self, counter: Counter) {
        self.counters[counter.index()].fetch_sub(1, Ordering::Relaxed);
    }

    fn peer_metric(&self, peer: &str, metric: PeerMetric, value: u64) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let gauges = peers.entry(peer.to_string()).or_default();
        match metric {
            PeerMetric::QueueLength => gauges.queue_length = value,
            PeerMetric::SecondsBehind => gauges.seconds_behind = value,
        }
    }
}

/// `host:port` becomes `host_port`.
fn metric_label(peer: &str) -> String {
    peer.replace(':', "_")
}
