//! Shared fixtures: a simulated server on loopback UDP and in-memory hosts.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thinkslow::{
    DatagramSocket, EngineConfig, PacketHeader, PacketRead, PacketType, PacketWrite,
    RelayTiming, SocketFactory, StatusEvent, TunnelDevice, TunnelFactory, TunnelParams,
    HEADER_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const SERVER_PRIVATE: u32 = 4321;
pub const ASSIGNED: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 5);
pub const SESSION_ID: u32 = 0xAABB_CCDD;
pub const WAIT: Duration = Duration::from_secs(3);

/// Square-and-multiply written out independently of the library.
pub fn oracle_pow(base: u64, exp: u64, modulus: u64) -> u32 {
    let mut result = 1u64;
    for _ in 0..exp {
        result = result * base % modulus;
    }
    result as u32
}

pub fn oracle_key(secret: u32) -> u8 {
    let b = secret.to_le_bytes();
    b[0] ^ b[1] ^ b[2] ^ b[3]
}

pub fn xor(buf: &mut [u8], key: u8) {
    for b in buf {
        *b ^= key;
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        handshake_timeout: Duration::from_secs(2),
        relay: RelayTiming {
            recv_timeout: Duration::from_millis(50),
            recovery_recv_timeout: Duration::from_millis(50),
            tun_poll: Duration::from_millis(50),
        },
        ..EngineConfig::default()
    }
}

/// What the server learned from HELLO.
#[derive(Debug, Clone, Copy)]
pub struct Hello {
    pub magic: u32,
    pub client_public: u32,
    pub shared_secret: u32,
}

/// Minimal ThinkSlow server speaking the wire protocol over loopback.
pub struct SimServer {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    key: u8,
}

impl SimServer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            peer: None,
            key: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Answer one HELLO with WELCOME and wait for CLIENT_ACK.
    pub async fn accept(&mut self) -> Hello {
        let mut buf = [0u8; 64];
        let (n, peer) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no HELLO")
            .unwrap();
        assert_eq!(n, 13, "HELLO length");
        assert_eq!(&buf[..5], &[1, 0, 0, 0, 0], "HELLO header");

        let magic = u32::from_be_bytes(buf[5..9].try_into().unwrap());
        let client_public = u32::from_be_bytes(buf[9..13].try_into().unwrap());
        let server_public = oracle_pow(9, SERVER_PRIVATE as u64, 127);
        let shared_secret = oracle_pow(client_public as u64, SERVER_PRIVATE as u64, 127);
        self.key = oracle_key(shared_secret);
        self.peer = Some(peer);

        let mut welcome = PacketHeader::new(PacketType::Welcome, SESSION_ID)
            .encode()
            .to_vec();
        welcome.extend_from_slice(&ASSIGNED.octets());
        welcome.extend_from_slice(&server_public.to_be_bytes());
        self.socket.send_to(&welcome, peer).await.unwrap();

        let (n, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no CLIENT_ACK")
            .unwrap();
        assert_eq!(&buf[..n], &[3, 0xAA, 0xBB, 0xCC, 0xDD], "CLIENT_ACK");

        Hello {
            magic,
            client_public,
            shared_secret,
        }
    }

    /// Swallow the HELLO and never answer.
    pub async fn ignore_hello(&self) {
        let mut buf = [0u8; 64];
        let _ = timeout(WAIT, self.socket.recv_from(&mut buf)).await;
    }

    /// Next DATA datagram from the client, decrypted. Follows the client to
    /// a new source port.
    pub async fn recv_data(&mut self) -> (u32, Vec<u8>) {
        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("no DATA from client")
            .unwrap();
        self.peer = Some(from);
        let header = PacketHeader::decode(&buf[..n]).unwrap();
        assert!(header.is(PacketType::Data));
        let mut payload = buf[HEADER_SIZE..n].to_vec();
        xor(&mut payload, self.key);
        (header.session_id, payload)
    }

    pub async fn send_raw(&self, datagram: &[u8]) {
        let peer = self.peer.expect("no client yet");
        self.socket.send_to(datagram, peer).await.unwrap();
    }

    pub async fn send_data(&self, session_id: u32, payload: &[u8]) {
        let mut datagram = PacketHeader::new(PacketType::Data, session_id)
            .encode()
            .to_vec();
        let mut body = payload.to_vec();
        xor(&mut body, self.key);
        datagram.extend_from_slice(&body);
        self.send_raw(&datagram).await;
    }
}

/// Host end of an in-memory tunnel device.
pub struct HostTun {
    pub params: TunnelParams,
    pub to_engine: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    pub from_engine: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl HostTun {
    pub fn inject(&self, packet: Vec<u8>) {
        self.to_engine.send(Ok(packet)).unwrap();
    }

    pub fn fail(&self) {
        let _ = self
            .to_engine
            .send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "gone")));
    }

    pub async fn next(&mut self) -> Vec<u8> {
        timeout(WAIT, self.from_engine.recv())
            .await
            .expect("nothing written to tunnel")
            .expect("tunnel writer closed")
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
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed")),
        }
    }
}

struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl PacketWrite for ChannelWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host gone"))
    }
}

/// Tunnel factory handing the host end to the test.
#[derive(Default)]
pub struct ChannelTunnels {
    host: Mutex<Option<HostTun>>,
    released: Mutex<Vec<TunnelParams>>,
    pub fail: bool,
    /// How long releasing a tunnel takes.
    pub release_delay: Duration,
}

impl ChannelTunnels {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow_release(delay: Duration) -> Self {
        Self {
            release_delay: delay,
            ..Self::default()
        }
    }

    pub fn take(&self) -> HostTun {
        self.host.lock().unwrap().take().expect("no tunnel created")
    }

    pub fn released(&self) -> Vec<TunnelParams> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelFactory for ChannelTunnels {
    async fn create_tunnel(&self, params: &TunnelParams) -> io::Result<TunnelDevice> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no tun"));
        }
        let (to_engine, engine_rx) = mpsc::unbounded_channel();
        let (engine_tx, from_engine) = mpsc::unbounded_channel();
        *self.host.lock().unwrap() = Some(HostTun {
            params: params.clone(),
            to_engine,
            from_engine,
        });
        Ok(TunnelDevice::new(ChannelReader(engine_rx), ChannelWriter(engine_tx)))
    }

    async fn release_tunnel(&self, params: &TunnelParams) {
        tokio::time::sleep(self.release_delay).await;
        self.released.lock().unwrap().push(params.clone());
    }
}

/// Loopback socket whose sends fail after `ok_sends` successes.
pub struct FlakySocket {
    inner: UdpSocket,
    ok_sends: usize,
    sent: AtomicUsize,
}

#[async_trait]
impl DatagramSocket for FlakySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.sent.fetch_add(1, Ordering::SeqCst) >= self.ok_sends {
            return Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "flaky"));
        }
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

/// Hands out loopback sockets; the first one breaks after `first_ok_sends`.
pub struct FlakySockets {
    first_ok_sends: usize,
    pub created: AtomicUsize,
}

impl FlakySockets {
    pub fn new(first_ok_sends: usize) -> Self {
        Self {
            first_ok_sends,
            created: AtomicUsize::new(0),
        }
    }

    pub fn reliable() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl SocketFactory for FlakySockets {
    async fn create_protected_socket(&self) -> io::Result<Arc<dyn DatagramSocket>> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let ok_sends = if n == 0 { self.first_ok_sends } else { usize::MAX };
        Ok(Arc::new(FlakySocket {
            inner: UdpSocket::bind("127.0.0.1:0").await?,
            ok_sends,
            sent: AtomicUsize::new(0),
        }))
    }
}

/// Collects status events for assertions.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<StatusEvent>>>);

impl EventLog {
    pub fn push(&self, event: &StatusEvent) {
        self.0.lock().unwrap().push(event.clone());
    }

    pub fn all(&self) -> Vec<StatusEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&StatusEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn disconnects(&self) -> usize {
        self.count(|e| matches!(e, StatusEvent::Disconnected))
    }
}

/// IPv4/TCP SYN from the assigned address advertising `mss`, with valid
/// checksums.
pub fn syn_packet(mss: u16) -> Vec<u8> {
    let mut p = vec![0u8; 44];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&44u16.to_be_bytes());
    p[6] = 0x40;
    p[8] = 64;
    p[9] = 6;
    p[12..16].copy_from_slice(&ASSIGNED.octets());
    p[16..20].copy_from_slice(&[198, 51, 100, 7]);
    p[20..22].copy_from_slice(&50000u16.to_be_bytes());
    p[22..24].copy_from_slice(&80u16.to_be_bytes());
    p[24..28].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    p[32] = 6 << 4;
    p[33] = 0x02;
    p[34..36].copy_from_slice(&65535u16.to_be_bytes());
    p[40..44].copy_from_slice(&[2, 4, (mss >> 8) as u8, mss as u8]);
    thinkslow::mangle::recompute_ipv4_checksum(&mut p);
    thinkslow::mangle::recompute_tcp_checksum(&mut p, 20, 44);
    p
}

/// ICMP destination unreachable / fragmentation needed.
pub fn frag_needed(next_hop_mtu: u16) -> Vec<u8> {
    let mut p = vec![0u8; 56];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&56u16.to_be_bytes());
    p[8] = 64;
    p[9] = 1;
    p[12..16].copy_from_slice(&[203, 0, 113, 1]);
    p[16..20].copy_from_slice(&ASSIGNED.octets());
    p[20] = 3;
    p[21] = 4;
    p[26..28].copy_from_slice(&next_hop_mtu.to_be_bytes());
    thinkslow::mangle::recompute_ipv4_checksum(&mut p);
    p
}
