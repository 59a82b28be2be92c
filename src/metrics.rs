#![forbid(unsafe_code)]

// Server metrics: atomic counters indexed by `Counter`, latency histograms,
// rendered as Prometheus text on scrape.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "interview_sfu";

/// Upper bounds in microseconds, paired with their `le` label.
const BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Monotonic event counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    RoomsEvicted,
    Joins,
    Leaves,
    Producers,
    Consumers,
    CannotConsume,
}

impl Counter {
    const ALL: [Counter; 11] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::RoomsEvicted,
        Counter::Joins,
        Counter::Leaves,
        Counter::Producers,
        Counter::Consumers,
        Counter::CannotConsume,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "connections_total",
            Counter::MessagesReceived => "messages_received_total",
            Counter::MessagesSent => "messages_sent_total",
            Counter::Errors => "errors_total",
            Counter::RoomsCreated => "rooms_created_total",
            Counter::RoomsEvicted => "rooms_evicted_total",
            Counter::Joins => "joins_total",
            Counter::Leaves => "leaves_total",
            Counter::Producers => "producers_created_total",
            Counter::Consumers => "consumers_created_total",
            Counter::CannotConsume => "cannot_consume_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "WebSocket connections accepted",
            Counter::MessagesReceived => "Signaling messages received from clients",
            Counter::MessagesSent => "Signaling messages written to clients",
            Counter::Errors => "Requests answered with an error",
            Counter::RoomsCreated => "Rooms created",
            Counter::RoomsEvicted => "Empty rooms evicted",
            Counter::Joins => "Successful room joins",
            Counter::Leaves => "Participants removed from rooms",
            Counter::Producers => "Producers created",
            Counter::Consumers => "Consumers created",
            Counter::CannotConsume => "Consume requests refused for incompatible capabilities",
        }
    }
}

/// Cumulative histogram over `BUCKETS`
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        BUCKETS
            .iter()
            .zip(&self.buckets)
            .filter(|((bound, _), _)| us <= *bound)
            .for_each(|(_, bucket)| {
                bucket.fetch_add(1, Relaxed);
            });
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        header(out, name, help, "histogram");
        for ((_, le), bucket) in BUCKETS.iter().zip(&self.buckets) {
            let _ = writeln!(out, "{PREFIX}_{name}_bucket{{le=\"{le}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{PREFIX}_{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{PREFIX}_{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{PREFIX}_{name}_count {count}");
    }
}

/// Process-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    message_handling: Histogram,
    room_setup: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
                room_setup: Histogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Counts an open connection until the guard drops
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Time from first join to a ready router and speaker observer
    pub fn observe_room_setup(&self, duration: Duration) {
        self.inner.room_setup.observe(duration);
    }

    /// Prometheus text exposition. Room and participant gauges are sampled by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            sample(&mut out, counter.name(), counter.help(), "counter", self.get(counter));
        }

        let gauges = [
            (
                "connections_active",
                "Open WebSocket connections",
                self.inner.connections_active.load(Relaxed),
            ),
            ("rooms_active", "Rooms currently registered", rooms_active as u64),
            ("participants_active", "Participants across all rooms", participants_active as u64),
        ];
        for (name, help, value) in gauges {
            sample(&mut out, name, help, "gauge", value);
        }

        self.inner
            .message_handling
            .render(&mut out, "message_handling_seconds", "Time to handle one signaling message");
        self.inner
            .room_setup
            .render(&mut out, "room_setup_seconds", "Time to create a room's router and observer");

        out
    }
}

/// Decrements the active connection gauge on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
}

fn sample(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    header(out, name, help, kind);
    let _ = writeln!(out, "{PREFIX}_{name} {value}");
}
