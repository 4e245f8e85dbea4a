//! Full-duplex packet relay between the tunnel device and the server.
//!
//! Two tasks run per session:
//! - Uplink: tunnel device -> MSS clamp -> DATA header -> encrypt -> socket
//! - Downlink: socket -> filter -> decrypt -> PMTUD check -> tunnel device
//!
//! Each loop owns one reusable buffer. Transport errors are recovered
//! inside the loops; a tunnel device error stops both.

use crate::metrics::Metrics;
use crate::mangle::{clamp_mss, detect_icmp_frag_needed, ChecksumMode, MssClamp};
use crate::session::Session;
use crate::socket::{SendOutcome, SharedSocket};
use crate::status::{StatusEvent, StatusHub};
use crate::tun::{PacketRead, PacketWrite, TunnelDevice};
use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thinkslow_common::{PacketHeader, PacketType, HEADER_SIZE};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Smallest per-loop buffer, large enough for any datagram the server sends.
pub const MIN_BUFFER_LEN: usize = 1600;

pub fn buffer_len(mtu: u32) -> usize {
    (HEADER_SIZE + mtu as usize).max(MIN_BUFFER_LEN)
}

/// Cooperative stop for both loops.
///
/// The flag is checked every iteration; the watch channel wakes loops that
/// are parked in a receive or a tunnel read.
#[derive(Clone)]
pub struct StopSignal {
    running: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            running: Arc::new(AtomicBool::new(true)),
            tx: Arc::new(tx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually stopped the loops.
    pub fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.tx.send_replace(true);
        was_running
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        wait_stopped(&mut rx).await;
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Timeouts bounding each suspension point.
#[derive(Debug, Clone, Copy)]
pub struct RelayTiming {
    pub recv_timeout: Duration,
    /// Used instead of `recv_timeout` once the socket has been replaced.
    pub recovery_recv_timeout: Duration,
    pub tun_poll: Duration,
}

/// Everything both loops share.
pub struct RelayContext {
    pub session: Arc<Session>,
    pub socket: Arc<SharedSocket>,
    pub server: SocketAddr,
    pub metrics: Arc<Metrics>,
    pub status: Arc<StatusHub>,
    pub stop: StopSignal,
    pub timing: RelayTiming,
    pub checksum_mode: ChecksumMode,
}

/// Join handles of a running relay.
pub struct RelayTasks {
    pub uplink: JoinHandle<()>,
    pub downlink: JoinHandle<()>,
}

impl RelayTasks {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.uplink.await {
            error!("Uplink task failed: {}", e);
        }
        if let Err(e) = self.downlink.await {
            error!("Downlink task failed: {}", e);
        }
    }
}

/// Start both loops on the current runtime.
pub fn spawn(ctx: Arc<RelayContext>, device: TunnelDevice) -> RelayTasks {
    let TunnelDevice { reader, writer } = device;
    RelayTasks {
        uplink: tokio::spawn(uplink(Arc::clone(&ctx), reader)),
        downlink: tokio::spawn(downlink(ctx, writer)),
    }
}

/// Stop both loops after the tunnel device failed.
fn fail_device(ctx: &RelayContext, err: &std::io::Error) {
    if ctx.stop.stop() {
        ctx.status
            .emit(StatusEvent::Error(format!("tunnel device failed: {}", err)));
    }
}

/// Tunnel device to server.
pub async fn uplink(ctx: Arc<RelayContext>, mut reader: Box<dyn PacketRead>) {
    let cipher = ctx.session.cipher();
    let mut buf = vec![0u8; buffer_len(ctx.session.active_mtu())];
    let mut stop_rx = ctx.stop.subscribe();
    debug!("Uplink loop started");

    while ctx.stop.is_running() {
        let read = tokio::select! {
            _ = wait_stopped(&mut stop_rx) => break,
            r = tokio::time::timeout(ctx.timing.tun_poll, reader.read_packet(&mut buf[HEADER_SIZE..])) => r,
        };
        let len = match read {
            Err(_) | Ok(Ok(0)) => continue,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("Tunnel device read failed: {}", e);
                fail_device(&ctx, &e);
                break;
            }
        };

        let packet = &mut buf[HEADER_SIZE..HEADER_SIZE + len];
        if let MssClamp::Clamped { from, to } =
            clamp_mss(packet, len, ctx.session.clamp_limit(), ctx.checksum_mode)
        {
            ctx.metrics.inc_mss_clamped();
            trace!("Clamped SYN MSS {} -> {}", from, to);
        }

        PacketHeader::new(PacketType::Data, ctx.session.session_id()).write_to(&mut buf);
        cipher.apply(&mut buf, HEADER_SIZE, len);

        match ctx
            .socket
            .send_or_replace(&buf[..HEADER_SIZE + len], ctx.server)
            .await
        {
            SendOutcome::Sent(_) => ctx.metrics.record_tx(len),
            SendOutcome::Replaced(_) => {
                ctx.metrics.inc_send_failures();
                ctx.metrics.inc_socket_recreations();
            }
            SendOutcome::Failed { .. } => ctx.metrics.inc_send_failures(),
        }
    }

    debug!("Uplink loop exited");
}

/// Server to tunnel device.
pub async fn downlink(ctx: Arc<RelayContext>, mut writer: Box<dyn PacketWrite>) {
    let cipher = ctx.session.cipher();
    let mut buf = vec![0u8; buffer_len(ctx.session.active_mtu())];
    let mut stop_rx = ctx.stop.subscribe();
    debug!("Downlink loop started");

    while ctx.stop.is_running() {
        // Never hold the socket lock across a receive.
        let (socket, generation) = ctx.socket.current_with_generation().await;
        let wait = if ctx.socket.is_recovering() {
            ctx.timing.recovery_recv_timeout
        } else {
            ctx.timing.recv_timeout
        };

        let received = tokio::select! {
            _ = wait_stopped(&mut stop_rx) => break,
            r = tokio::time::timeout(wait, socket.recv_from(&mut buf)) => r,
        };
        let len = match received {
            Err(_) => continue,
            Ok(Ok((n, _from))) => {
                if ctx.socket.mark_recovered(generation) {
                    info!("Replacement socket is receiving, back to normal timeouts");
                }
                n
            }
            Ok(Err(e)) => {
                ctx.metrics.inc_recv_errors();
                warn!("Receive failed: {}", e);
                continue;
            }
        };

        let Some(header) = PacketHeader::decode(&buf[..len]) else {
            ctx.metrics.inc_dropped_short();
            trace!("Dropped {} byte datagram", len);
            continue;
        };
        if !header.is(PacketType::Data) {
            ctx.metrics.inc_dropped_unknown_type();
            trace!("Dropped datagram of type {}", header.raw_type);
            continue;
        }

        ctx.session.adopt_session_id(header.session_id);

        let payload_len = len - HEADER_SIZE;
        if payload_len == 0 {
            continue;
        }
        cipher.apply(&mut buf, HEADER_SIZE, payload_len);
        let payload = &buf[HEADER_SIZE..len];

        if let Some(next_hop) =
            detect_icmp_frag_needed(payload, payload_len, ctx.session.active_mtu())
        {
            if let Some(telemetry) = ctx.session.apply_path_mtu(next_hop) {
                ctx.metrics.inc_pmtud_events();
                ctx.metrics.set_path(telemetry.mtu, telemetry.mss);
                ctx.status.emit(StatusEvent::MtuChanged(telemetry));
            }
        }

        let written = tokio::select! {
            _ = wait_stopped(&mut stop_rx) => break,
            r = writer.write_packet(payload) => r,
        };
        match written {
            Ok(()) => ctx.metrics.record_rx(payload_len),
            Err(e) => {
                error!("Tunnel device write failed: {}", e);
                fail_device(&ctx, &e);
                break;
            }
        }
    }

    info!("Downlink loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::XorCipher;
    use crate::handshake::HandshakeOutcome;
    use crate::mangle::{recompute_ipv4_checksum, recompute_tcp_checksum};
    use crate::socket::{DatagramSocket, SocketFactory};
    use async_trait::async_trait;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::{mpsc, Mutex};

    const SECRET: u32 = 0x0000_005A;

    /// Socket fed from a channel; sends go to another channel.
    struct ChannelSocket {
        inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl DatagramSocket for ChannelSocket {
        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            let _ = self.outbound.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbound.lock().await.recv().await {
                Some(d) => {
                    buf[..d.len()].copy_from_slice(&d);
                    Ok((d.len(), "127.0.0.1:5555".parse().unwrap()))
                }
                None => std::future::pending().await,
            }
        }
    }

    struct NoFactory;

    #[async_trait]
    impl SocketFactory for NoFactory {
        async fn create_protected_socket(&self) -> io::Result<Arc<dyn DatagramSocket>> {
            Err(io::Error::new(io::ErrorKind::Other, "unused"))
        }
    }

    struct ChannelReader(mpsc::UnboundedReceiver<io::Result<Vec<u8>>>);

    #[async_trait]
    impl PacketRead for ChannelReader {
        async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv().await {
                Some(Ok(p)) => {
                    buf[..p.len()].copy_from_slice(&p);
                    Ok(p.len())
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl PacketWrite for ChannelWriter {
        async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
            let _ = self.0.send(packet.to_vec());
            Ok(())
        }
    }

    struct Harness {
        ctx: Arc<RelayContext>,
        to_client: mpsc::UnboundedSender<Vec<u8>>,
        from_client: mpsc::UnboundedReceiver<Vec<u8>>,
        events: Arc<AtomicU64>,
    }

    fn harness() -> Harness {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let socket = Arc::new(ChannelSocket {
            inbound: Mutex::new(inbound),
            outbound,
        });
        let outcome = HandshakeOutcome {
            session_id: 0x11,
            assigned_address: Ipv4Addr::new(10, 8, 0, 5),
            shared_secret: SECRET,
            cipher: XorCipher::from_secret(SECRET),
        };
        let status = StatusHub::new();
        let events = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&events);
        status.subscribe(move |e| {
            if matches!(e, StatusEvent::MtuChanged(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let ctx = Arc::new(RelayContext {
            session: Arc::new(Session::new(&outcome, 1320, 1160)),
            socket: Arc::new(SharedSocket::new(socket, Arc::new(NoFactory))),
            server: "127.0.0.1:5555".parse().unwrap(),
            metrics: Metrics::new(),
            status,
            stop: StopSignal::new(),
            timing: RelayTiming {
                recv_timeout: Duration::from_millis(20),
                recovery_recv_timeout: Duration::from_millis(20),
                tun_poll: Duration::from_millis(20),
            },
            checksum_mode: ChecksumMode::Incremental,
        });
        Harness {
            ctx,
            to_client,
            from_client,
            events,
        }
    }

    fn data(session_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader::new(PacketType::Data, session_id)
            .encode()
            .to_vec();
        out.extend_from_slice(payload);
        let cipher = XorCipher::from_secret(SECRET);
        let len = payload.len();
        cipher.apply(&mut out, HEADER_SIZE, len);
        out
    }

    fn syn_with_mss(mss: u16) -> Vec<u8> {
        let mut p = vec![0u8; 44];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&44u16.to_be_bytes());
        p[8] = 64;
        p[9] = 6;
        p[12..16].copy_from_slice(&[10, 8, 0, 5]);
        p[16..20].copy_from_slice(&[1, 1, 1, 1]);
        p[20..22].copy_from_slice(&40000u16.to_be_bytes());
        p[22..24].copy_from_slice(&443u16.to_be_bytes());
        p[32] = 6 << 4;
        p[33] = 0x02;
        p[40..44].copy_from_slice(&[2, 4, (mss >> 8) as u8, mss as u8]);
        recompute_ipv4_checksum(&mut p);
        recompute_tcp_checksum(&mut p, 20, 44);
        p
    }

    fn icmp_frag_needed(next_hop: u16) -> Vec<u8> {
        let mut p = vec![0u8; 56];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&56u16.to_be_bytes());
        p[8] = 64;
        p[9] = 1;
        p[20] = 3;
        p[21] = 4;
        p[26..28].copy_from_slice(&next_hop.to_be_bytes());
        recompute_ipv4_checksum(&mut p);
        p
    }

    #[test]
    fn test_buffer_len() {
        assert_eq!(buffer_len(1320), 1600);
        assert_eq!(buffer_len(9000), 9005);
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let stop = StopSignal::new();
        assert!(stop.is_running());
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        assert!(stop.stop());
        assert!(!stop.stop());
        waiter.await.unwrap();
        assert!(!stop.is_running());
    }

    #[tokio::test]
    async fn test_downlink_filters_and_delivers() {
        let h = harness();
        let (tun_tx, mut tun_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(downlink(Arc::clone(&h.ctx), Box::new(ChannelWriter(tun_tx))));

        h.to_client.send(vec![4, 0, 0]).unwrap();
        h.to_client
            .send(PacketHeader::new(PacketType::Welcome, 9).encode().to_vec())
            .unwrap();
        h.to_client.send(data(0x22, b"\x45hello")).unwrap();

        let delivered = tun_rx.recv().await.unwrap();
        assert_eq!(delivered, b"\x45hello");
        assert_eq!(h.ctx.session.session_id(), 0x22);

        let m = &h.ctx.metrics;
        assert_eq!(m.dropped_short.load(Ordering::Relaxed), 1);
        assert_eq!(m.dropped_unknown_type.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_rx_total.load(Ordering::Relaxed), 6);

        h.ctx.stop.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_pmtud_shrinks_mss() {
        let h = harness();
        let (tun_tx, mut tun_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(downlink(Arc::clone(&h.ctx), Box::new(ChannelWriter(tun_tx))));

        h.to_client.send(data(0x11, &icmp_frag_needed(2000))).unwrap();
        tun_rx.recv().await.unwrap();
        assert_eq!(h.ctx.session.active_mss(), 1160);

        h.to_client.send(data(0x11, &icmp_frag_needed(1200))).unwrap();
        tun_rx.recv().await.unwrap();
        assert_eq!(h.ctx.session.active_mtu(), 1200);
        assert_eq!(h.ctx.session.active_mss(), 1040);
        assert_eq!(h.events.load(Ordering::SeqCst), 1);
        assert_eq!(h.ctx.metrics.pmtud_events.load(Ordering::Relaxed), 1);

        h.ctx.stop.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_uplink_clamps_frames_and_encrypts() {
        let mut h = harness();
        let (pkt_tx, pkt_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(uplink(Arc::clone(&h.ctx), Box::new(ChannelReader(pkt_rx))));

        pkt_tx.send(Ok(syn_with_mss(1460))).unwrap();
        let mut datagram = h.from_client.recv().await.unwrap();

        assert_eq!(datagram.len(), HEADER_SIZE + 44);
        assert_eq!(&datagram[..HEADER_SIZE], &[4, 0, 0, 0, 0x11]);
        let len = datagram.len() - HEADER_SIZE;
        XorCipher::from_secret(SECRET).apply(&mut datagram, HEADER_SIZE, len);

        let inner = &datagram[HEADER_SIZE..];
        assert_eq!(&inner[42..44], &1160u16.to_be_bytes());
        let mut check = inner.to_vec();
        recompute_tcp_checksum(&mut check, 20, 44);
        assert_eq!(check, inner);
        assert_eq!(h.ctx.metrics.mss_clamped.load(Ordering::Relaxed), 1);

        h.ctx.stop.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tun_read_error_stops_relay() {
        let h = harness();
        let (pkt_tx, pkt_rx) = mpsc::unbounded_channel();
        let (tun_tx, _tun_rx) = mpsc::unbounded_channel();
        let tasks = spawn(
            Arc::clone(&h.ctx),
            TunnelDevice::new(ChannelReader(pkt_rx), ChannelWriter(tun_tx)),
        );

        pkt_tx
            .send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed")))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
        assert!(!h.ctx.stop.is_running());
    }
}
