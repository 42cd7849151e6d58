//! Prometheus-compatible metrics endpoint
//!
//! Exposes sync server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const HISTORY_LEN: usize = 1000;

/// Rolling tick-time statistics for one loop
#[derive(Debug)]
pub struct TickTimings {
    pub last_us: AtomicU64,
    pub p95_us: AtomicU64,
    pub p99_us: AtomicU64,
    pub max_us: AtomicU64,
    pub count: AtomicU64,
    pub overruns: AtomicU64,
    history: RwLock<VecDeque<u64>>,
}

impl TickTimings {
    fn new() -> Self {
        Self {
            last_us: AtomicU64::new(0),
            p95_us: AtomicU64::new(0),
            p99_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.last_us.store(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.history.write();
        history.push_back(us);
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Record a tick that ran past its period
    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "last_us": self.last_us.load(Ordering::Relaxed),
            "p95_us": self.p95_us.load(Ordering::Relaxed),
            "p99_us": self.p99_us.load(Ordering::Relaxed),
            "max_us": self.max_us.load(Ordering::Relaxed),
            "count": self.count.load(Ordering::Relaxed),
            "overruns": self.overruns.load(Ordering::Relaxed),
        })
    }
}

/// Metrics registry for the sync server
#[derive(Debug)]
pub struct Metrics {
    // World state
    pub rooms: AtomicU64,
    pub entities: AtomicU64,
    pub connections_active: AtomicU64,

    // Traffic
    pub frames_sent: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_failures: AtomicU64,

    // Loop timing
    pub simulation: TickTimings,
    pub flush: TickTimings,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            rooms: AtomicU64::new(0),
            entities: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            simulation: TickTimings::new(),
            flush: TickTimings::new(),
            start_time: Instant::now(),
        }
    }

    /// Add one flush pass to the traffic counters
    pub fn record_flush(&self, frames: usize, messages: usize, bytes: usize) {
        self.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(messages as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Add one inbound frame to the traffic counters
    pub fn record_inbound(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("glue_sync_rooms", "Number of rooms, including the default room", "gauge",
            self.rooms.load(Ordering::Relaxed));
        metric!("glue_sync_entities", "Number of live entities", "gauge",
            self.entities.load(Ordering::Relaxed));
        metric!("glue_sync_connections_active", "Active WebTransport connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));

        metric!("glue_sync_frames_sent_total", "Total frames flushed to transports", "counter",
            self.frames_sent.load(Ordering::Relaxed));
        metric!("glue_sync_messages_sent_total", "Total messages flushed to transports", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("glue_sync_bytes_sent_total", "Total bytes flushed to transports", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("glue_sync_frames_received_total", "Total frames received", "counter",
            self.frames_received.load(Ordering::Relaxed));
        metric!("glue_sync_messages_received_total", "Total messages dispatched", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("glue_sync_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("glue_sync_decode_failures_total", "Inbound frames dropped as malformed", "counter",
            self.decode_failures.load(Ordering::Relaxed));

        for (loop_name, timings) in [("simulation", &self.simulation), ("flush", &self.flush)] {
            metric!(format!("glue_sync_{}_tick_time_microseconds", loop_name),
                "Last tick time in microseconds", "gauge",
                timings.last_us.load(Ordering::Relaxed));
            metric!(format!("glue_sync_{}_tick_time_p95_microseconds", loop_name),
                "95th percentile tick time", "gauge",
                timings.p95_us.load(Ordering::Relaxed));
            metric!(format!("glue_sync_{}_tick_time_p99_microseconds", loop_name),
                "99th percentile tick time", "gauge",
                timings.p99_us.load(Ordering::Relaxed));
            metric!(format!("glue_sync_{}_tick_time_max_microseconds", loop_name),
                "Maximum tick time", "gauge",
                timings.max_us.load(Ordering::Relaxed));
            metric!(format!("glue_sync_{}_tick_count", loop_name),
                "Total ticks processed", "counter",
                timings.count.load(Ordering::Relaxed));
            metric!(format!("glue_sync_{}_overruns_total", loop_name),
                "Ticks that ran past their period", "counter",
                timings.overruns.load(Ordering::Relaxed));
        }

        metric!("glue_sync_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let body = json!({
            "world": {
                "rooms": self.rooms.load(Ordering::Relaxed),
                "entities": self.entities.load(Ordering::Relaxed),
                "connections": self.connections_active.load(Ordering::Relaxed),
            },
            "network": {
                "frames_sent": self.frames_sent.load(Ordering::Relaxed),
                "messages_sent": self.messages_sent.load(Ordering::Relaxed),
                "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
                "frames_received": self.frames_received.load(Ordering::Relaxed),
                "messages_received": self.messages_received.load(Ordering::Relaxed),
                "bytes_received": self.bytes_received.load(Ordering::Relaxed),
                "decode_failures": self.decode_failures.load(Ordering::Relaxed),
            },
            "simulation": self.simulation.to_json(),
            "flush": self.flush.to_json(),
            "uptime_seconds": self.uptime_seconds(),
        });

        serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn route(metrics: &Metrics, request: &str) -> String {
    // The JSON route must be matched before its `/metrics` prefix
    if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        respond("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        respond("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        respond("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

fn respond(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
