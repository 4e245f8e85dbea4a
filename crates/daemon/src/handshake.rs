//! HELLO / WELCOME / CLIENT_ACK exchange.
//!
//! One round trip, no retries. Message building and parsing are plain
//! functions on [`Handshake`] so they can be tested without a socket;
//! [`Handshake::run`] drives them over a [`DatagramSocket`].

use crate::cipher::XorCipher;
use crate::dh::KeyPair;
use crate::error::EngineError;
use crate::socket::DatagramSocket;
use log::{debug, info};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thinkslow_common::{
    read_u32_be, PacketHeader, PacketType, CLIENT_ACK_LEN, HEADER_SIZE, HELLO_LEN, WELCOME_LEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    HelloSent,
    WelcomeReceived,
    Established,
}

/// Everything the relay needs from a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub session_id: u32,
    pub assigned_address: Ipv4Addr,
    pub shared_secret: u32,
    pub cipher: XorCipher,
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct Handshake {
    keys: KeyPair,
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower 32 bits of the wall clock in milliseconds.
fn client_magic() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

impl Handshake {
    pub fn new() -> Self {
        Self::with_keys(KeyPair::generate())
    }

    /// Handshake with a fixed private exponent, for reproducible exchanges.
    pub fn with_private_exponent(private: u32) -> Self {
        Self::with_keys(KeyPair::from_private(private))
    }

    fn with_keys(keys: KeyPair) -> Self {
        Self {
            keys,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn public_value(&self) -> u32 {
        self.keys.public()
    }

    /// Build the HELLO datagram and move to `HelloSent`.
    pub fn hello(&mut self, magic: u32) -> [u8; HELLO_LEN] {
        let mut out = [0u8; HELLO_LEN];
        out[..HEADER_SIZE].copy_from_slice(&PacketHeader::new(PacketType::Hello, 0).encode());
        out[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&magic.to_be_bytes());
        out[HEADER_SIZE + 4..].copy_from_slice(&self.keys.public().to_be_bytes());
        self.state = HandshakeState::HelloSent;
        out
    }

    /// Parse the server's WELCOME and derive the session key.
    pub fn on_welcome(&mut self, datagram: &[u8]) -> Result<HandshakeOutcome, EngineError> {
        let header = PacketHeader::decode(datagram).ok_or_else(|| {
            EngineError::MalformedWelcome(format!("{} byte datagram", datagram.len()))
        })?;
        if !header.is(PacketType::Welcome) {
            return Err(EngineError::UnexpectedPacket {
                expected: PacketType::Welcome.as_u8(),
                got: header.raw_type,
            });
        }
        if datagram.len() < WELCOME_LEN {
            return Err(EngineError::MalformedWelcome(format!(
                "expected {} bytes, got {}",
                WELCOME_LEN,
                datagram.len()
            )));
        }

        let (Some(addr), Some(server_public)) = (
            read_u32_be(datagram, HEADER_SIZE),
            read_u32_be(datagram, HEADER_SIZE + 4),
        ) else {
            return Err(EngineError::MalformedWelcome("truncated body".into()));
        };

        let shared_secret = self.keys.agree(server_public);
        self.state = HandshakeState::WelcomeReceived;

        Ok(HandshakeOutcome {
            session_id: header.session_id,
            assigned_address: Ipv4Addr::from(addr),
            shared_secret,
            cipher: XorCipher::from_secret(shared_secret),
        })
    }

    /// Build the CLIENT_ACK datagram and move to `Established`.
    pub fn client_ack(&mut self, session_id: u32) -> [u8; CLIENT_ACK_LEN] {
        self.state = HandshakeState::Established;
        PacketHeader::new(PacketType::ClientAck, session_id).encode()
    }

    /// Run the full exchange against `server`.
    ///
    /// A missing WELCOME after `timeout` is fatal; the caller decides
    /// whether to try again.
    pub async fn run(
        mut self,
        socket: &dyn DatagramSocket,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<HandshakeOutcome, EngineError> {
        let hello = self.hello(client_magic());
        socket.send_to(&hello, server).await?;
        debug!("HELLO sent to {} (yc={})", server, self.keys.public());

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| EngineError::HandshakeTimeout(timeout))??;
        debug!("Handshake reply from {} ({} bytes)", from, len);

        let outcome = self.on_welcome(&buf[..len])?;
        info!(
            "WELCOME: session {:#010x}, assigned {}",
            outcome.session_id, outcome.assigned_address
        );

        let ack = self.client_ack(outcome.session_id);
        socket.send_to(&ack, server).await?;
        info!("Handshake with {} complete", server);

        Ok(outcome)
    }
}
