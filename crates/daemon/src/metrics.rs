use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prometheus-compatible metrics for the tunnel client.
///
/// Counters are bumped from the relay loops on the hot path, so every
/// update is a single relaxed atomic add.
pub struct Metrics {
    // === Session ===
    pub sessions_active: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_failed: AtomicU64,

    // === Traffic ===
    /// Datagrams sent to the server
    pub packets_tx_total: AtomicU64,
    /// DATA datagrams written to the tunnel device
    pub packets_rx_total: AtomicU64,
    /// Tunnel payload bytes sent (header excluded)
    pub bytes_tx_total: AtomicU64,
    /// Tunnel payload bytes received (header excluded)
    pub bytes_rx_total: AtomicU64,

    // === Transport faults ===
    pub send_failures: AtomicU64,
    /// Sockets replaced after a failed send
    pub socket_recreations: AtomicU64,
    /// Receive errors other than timeouts
    pub recv_errors: AtomicU64,

    // === Filtered input ===
    /// Datagrams shorter than the header
    pub dropped_short: AtomicU64,
    /// Datagrams with a type other than DATA
    pub dropped_unknown_type: AtomicU64,

    // === Mangler ===
    pub mss_clamped: AtomicU64,
    pub pmtud_events: AtomicU64,
    pub active_mtu: AtomicU64,
    pub active_mss: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            packets_tx_total: AtomicU64::new(0),
            packets_rx_total: AtomicU64::new(0),
            bytes_tx_total: AtomicU64::new(0),
            bytes_rx_total: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            socket_recreations: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
            dropped_short: AtomicU64::new(0),
            dropped_unknown_type: AtomicU64::new(0),
            mss_clamped: AtomicU64::new(0),
            pmtud_events: AtomicU64::new(0),
            active_mtu: AtomicU64::new(0),
            active_mss: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    // === Session ===

    pub fn inc_sessions(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_handshakes_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshakes_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    // === Traffic ===

    pub fn record_tx(&self, payload_len: usize) {
        self.packets_tx_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx_total
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, payload_len: usize) {
        self.packets_rx_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx_total
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    // === Transport faults ===

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_socket_recreations(&self) {
        self.socket_recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recv_errors(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_short(&self) {
        self.dropped_short.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_unknown_type(&self) {
        self.dropped_unknown_type.fetch_add(1, Ordering::Relaxed);
    }

    // === Mangler ===

    pub fn inc_mss_clamped(&self) {
        self.mss_clamped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pmtud_events(&self) {
        self.pmtud_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_path(&self, mtu: u32, mss: u32) {
        self.active_mtu.store(mtu as u64, Ordering::Relaxed);
        self.active_mss.store(mss as u64, Ordering::Relaxed);
    }

    /// Current byte counters, for throughput sampling.
    pub fn sample(&self) -> TrafficSample {
        TrafficSample {
            at: Instant::now(),
            rx_bytes: self.bytes_rx_total.load(Ordering::Relaxed),
            tx_bytes: self.bytes_tx_total.load(Ordering::Relaxed),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP thinkslow_sessions_active Current number of active sessions\n\
             # TYPE thinkslow_sessions_active gauge\n\
             thinkslow_sessions_active {}\n\
             # HELP thinkslow_handshakes_completed_total Successful handshakes\n\
             # TYPE thinkslow_handshakes_completed_total counter\n\
             thinkslow_handshakes_completed_total {}\n\
             # HELP thinkslow_handshakes_failed_total Failed handshakes\n\
             # TYPE thinkslow_handshakes_failed_total counter\n\
             thinkslow_handshakes_failed_total {}\n\
             # HELP thinkslow_packets_tx_total Datagrams sent to the server\n\
             # TYPE thinkslow_packets_tx_total counter\n\
             thinkslow_packets_tx_total {}\n\
             # HELP thinkslow_packets_rx_total Packets delivered to the tunnel device\n\
             # TYPE thinkslow_packets_rx_total counter\n\
             thinkslow_packets_rx_total {}\n\
             # HELP thinkslow_bytes_tx_total Tunnel payload bytes sent\n\
             # TYPE thinkslow_bytes_tx_total counter\n\
             thinkslow_bytes_tx_total {}\n\
             # HELP thinkslow_bytes_rx_total Tunnel payload bytes received\n\
             # TYPE thinkslow_bytes_rx_total counter\n\
             thinkslow_bytes_rx_total {}\n\
             # HELP thinkslow_send_failures_total Failed datagram sends\n\
             # TYPE thinkslow_send_failures_total counter\n\
             thinkslow_send_failures_total {}\n\
             # HELP thinkslow_socket_recreations_total Transport sockets replaced\n\
             # TYPE thinkslow_socket_recreations_total counter\n\
             thinkslow_socket_recreations_total {}\n\
             # HELP thinkslow_recv_errors_total Receive errors other than timeouts\n\
             # TYPE thinkslow_recv_errors_total counter\n\
             thinkslow_recv_errors_total {}\n\
             # HELP thinkslow_dropped_short_total Datagrams shorter than the header\n\
             # TYPE thinkslow_dropped_short_total counter\n\
             thinkslow_dropped_short_total {}\n\
             # HELP thinkslow_dropped_unknown_type_total Non-DATA datagrams dropped\n\
             # TYPE thinkslow_dropped_unknown_type_total counter\n\
             thinkslow_dropped_unknown_type_total {}\n\
             # HELP thinkslow_mss_clamped_total SYN packets with a rewritten MSS\n\
             # TYPE thinkslow_mss_clamped_total counter\n\
             thinkslow_mss_clamped_total {}\n\
             # HELP thinkslow_pmtud_events_total Path MTU reductions\n\
             # TYPE thinkslow_pmtud_events_total counter\n\
             thinkslow_pmtud_events_total {}\n\
             # HELP thinkslow_active_mtu Current tunnel MTU\n\
             # TYPE thinkslow_active_mtu gauge\n\
             thinkslow_active_mtu {}\n\
             # HELP thinkslow_active_mss Current MSS clamp\n\
             # TYPE thinkslow_active_mss gauge\n\
             thinkslow_active_mss {}\n",
            self.sessions_active.load(Ordering::Relaxed),
            self.handshakes_completed.load(Ordering::Relaxed),
            self.handshakes_failed.load(Ordering::Relaxed),
            self.packets_tx_total.load(Ordering::Relaxed),
            self.packets_rx_total.load(Ordering::Relaxed),
            self.bytes_tx_total.load(Ordering::Relaxed),
            self.bytes_rx_total.load(Ordering::Relaxed),
            self.send_failures.load(Ordering::Relaxed),
            self.socket_recreations.load(Ordering::Relaxed),
            self.recv_errors.load(Ordering::Relaxed),
            self.dropped_short.load(Ordering::Relaxed),
            self.dropped_unknown_type.load(Ordering::Relaxed),
            self.mss_clamped.load(Ordering::Relaxed),
            self.pmtud_events.load(Ordering::Relaxed),
            self.active_mtu.load(Ordering::Relaxed),
            self.active_mss.load(Ordering::Relaxed),
        )
    }
}

/// Byte counters captured at one instant.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSample {
    pub at: Instant,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Average rates between two samples, in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub down_mbps: f64,
    pub up_mbps: f64,
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

impl TrafficSample {
    /// Rates from `earlier` to `self`. Counter resets read as zero.
    pub fn throughput_since(&self, earlier: &TrafficSample) -> Throughput {
        let elapsed = self.at.saturating_duration_since(earlier.at);
        Throughput {
            down_mbps: mbps(self.rx_bytes.saturating_sub(earlier.rx_bytes), elapsed),
            up_mbps: mbps(self.tx_bytes.saturating_sub(earlier.tx_bytes), elapsed),
        }
    }
}

impl std::fmt::Display for Throughput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "down {:.2} Mbps | up {:.2} Mbps",
            self.down_mbps, self.up_mbps
        )
    }
}
