//! Transport socket seam and replace-on-failure wrapper.
//!
//! The engine never creates sockets itself. It asks a [`SocketFactory`]
//! for an already "protected" datagram socket, one the host has exempted
//! from the tunnel's own routing.
//!
//! ## Design
//! - [`DatagramSocket`] is the minimal send/recv surface the relay needs
//! - [`SharedSocket`] holds the current socket behind a single lock; a
//!   failed send replaces the socket under that same lock
//! - Receivers take a cheap clone of the current socket and never hold the
//!   lock while parked in a receive
//! - [`UdpSocketFactory`] is the default host implementation built on
//!   `socket2`

use async_trait::async_trait;
use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Buffer size requested for both directions, matching the reference client.
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Datagram transport used for the handshake and the relay.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// Host capability: hand out a socket that bypasses the tunnel.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create_protected_socket(&self) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Result of [`SharedSocket::send_or_replace`].
#[derive(Debug)]
pub enum SendOutcome {
    Sent(usize),
    /// The send failed and a fresh socket is now in place.
    Replaced(io::Error),
    /// The send failed and so did creating a replacement; the old socket stays.
    Failed { send: io::Error, replace: io::Error },
}

/// The one transport socket shared by both relay loops.
pub struct SharedSocket {
    current: Mutex<Arc<dyn DatagramSocket>>,
    factory: Arc<dyn SocketFactory>,
    generation: AtomicU64,
    recovering: AtomicBool,
}

impl SharedSocket {
    pub fn new(socket: Arc<dyn DatagramSocket>, factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            current: Mutex::new(socket),
            factory,
            generation: AtomicU64::new(0),
            recovering: AtomicBool::new(false),
        }
    }

    /// Clone of the socket currently in use.
    pub async fn current(&self) -> Arc<dyn DatagramSocket> {
        Arc::clone(&*self.current.lock().await)
    }

    /// Clone of the current socket together with its generation.
    pub async fn current_with_generation(&self) -> (Arc<dyn DatagramSocket>, u64) {
        let current = self.current.lock().await;
        (Arc::clone(&*current), self.generation())
    }

    /// Send one datagram, replacing the socket if the send fails.
    ///
    /// The send and the replacement happen under the same lock, so no other
    /// sender can observe a half-replaced socket.
    pub async fn send_or_replace(&self, buf: &[u8], target: SocketAddr) -> SendOutcome {
        let mut current = self.current.lock().await;
        let send_err = match current.send_to(buf, target).await {
            Ok(n) => return SendOutcome::Sent(n),
            Err(e) => e,
        };

        match self.factory.create_protected_socket().await {
            Ok(fresh) => {
                *current = fresh;
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.recovering.store(true, Ordering::Release);
                warn!(
                    "Send to {} failed ({}), replaced transport socket (generation {})",
                    target, send_err, generation
                );
                SendOutcome::Replaced(send_err)
            }
            Err(replace_err) => {
                warn!(
                    "Send to {} failed ({}) and socket replacement failed: {}",
                    target, send_err, replace_err
                );
                SendOutcome::Failed {
                    send: send_err,
                    replace: replace_err,
                }
            }
        }
    }

    /// Number of times the socket has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the socket in use is a replacement that has not received
    /// anything yet.
    ///
    /// Receivers use the recovery timeout while this is set.
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Leave recovery after a successful receive on socket `generation`.
    ///
    /// A receive on a socket that has since been replaced does not count.
    /// Returns `true` if recovery ended here.
    pub fn mark_recovered(&self, generation: u64) -> bool {
        if generation != self.generation() {
            return false;
        }
        self.recovering.swap(false, Ordering::AcqRel)
    }
}

/// Default [`SocketFactory`]: a plain UDP socket with large buffers.
#[derive(Debug, Clone)]
pub struct UdpSocketFactory {
    bind_addr: SocketAddr,
    buffer_size: usize,
    fwmark: Option<u32>,
}

impl Default for UdpSocketFactory {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            buffer_size: SOCKET_BUFFER_SIZE,
            fwmark: None,
        }
    }
}

impl UdpSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Mark outgoing packets so policy routing can keep them off the tunnel.
    pub fn fwmark(mut self, mark: Option<u32>) -> Self {
        self.fwmark = mark;
        self
    }

    fn bind(&self) -> io::Result<std::net::UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if let Err(e) = socket.set_send_buffer_size(self.buffer_size) {
            warn!("Failed to set send buffer size: {}", e);
        }
        if let Err(e) = socket.set_recv_buffer_size(self.buffer_size) {
            warn!("Failed to set recv buffer size: {}", e);
        }

        let actual = socket.send_buffer_size()?;
        if actual < self.buffer_size {
            warn!(
                "Unable to set desired send buffer size. Desired: {}, Actual: {}",
                self.buffer_size, actual
            );
        }
        let actual = socket.recv_buffer_size()?;
        if actual < self.buffer_size {
            warn!(
                "Unable to set desired recv buffer size. Desired: {}, Actual: {}",
                self.buffer_size, actual
            );
        }

        if let Some(mark) = self.fwmark {
            apply_fwmark(&socket, mark)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;
        Ok(socket.into())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_fwmark(socket: &Socket, mark: u32) -> io::Result<()> {
    socket.set_mark(mark)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_fwmark(_socket: &Socket, mark: u32) -> io::Result<()> {
    warn!("fwmark {} ignored: SO_MARK is Linux-only", mark);
    Ok(())
}

#[async_trait]
impl SocketFactory for UdpSocketFactory {
    async fn create_protected_socket(&self) -> io::Result<Arc<dyn DatagramSocket>> {
        let std_socket = self.bind()?;
        let socket = UdpSocket::from_std(std_socket)?;
        info!("Bound transport socket on {}", socket.local_addr()?);
        Ok(Arc::new(socket))
    }
}
