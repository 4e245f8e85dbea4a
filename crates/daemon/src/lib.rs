//! # ThinkSlow Tunnel Client
//!
//! Client-side engine for the ThinkSlow UDP tunnel: a three-message
//! handshake with a toy Diffie-Hellman exchange, then a full-duplex relay of
//! IP packets between a TUN device and the server with TCP MSS clamping and
//! passive path MTU discovery.
//!
//! ## Key Components
//!
//! ### Protocol
//! - [`Handshake`] - HELLO / WELCOME / CLIENT_ACK exchange
//! - [`KeyPair`] / [`XorCipher`] - key agreement and payload cipher
//!   (wire compatibility only, not security)
//!
//! ### Data Plane
//! - [`Engine`] - connect, relay and teardown
//! - [`mangle`] - MSS clamping, checksums, ICMP "fragmentation needed"
//! - [`SharedSocket`] - replace-on-failure transport socket
//!
//! ### Host Seams
//! - [`SocketFactory`] / [`TunnelFactory`] - what the host provides
//! - [`StatusHub`] - status events and telemetry for the host UI
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use thinkslow::{Config, Engine, TunDeviceFactory, UdpSocketFactory};
//!
//! let config = Config::load_or_default();
//! let engine = Engine::new(
//!     config.engine(),
//!     Arc::new(UdpSocketFactory::new()),
//!     Arc::new(TunDeviceFactory::new()),
//! );
//! engine.on_status(|event| println!("{}", event));
//!
//! let session = engine.connect("vpn.example.net").await?;
//! println!("Assigned {}", session.telemetry().assigned_address);
//! ```

pub mod cipher;
pub mod config;
pub mod dh;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod http;
pub mod mangle;
pub mod metrics;
pub mod relay;
pub mod session;
pub mod socket;
pub mod status;
pub mod tun;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{
    ClientConfig, Config, DaemonConfig, EngineConfig, TimingConfig, TunnelConfig,
};

// ============================================================================
// Engine
// ============================================================================

pub use engine::{Engine, SessionHandle};
pub use error::EngineError;

// ============================================================================
// Handshake & Crypto
// ============================================================================

pub use cipher::XorCipher;
pub use dh::KeyPair;
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState};

// ============================================================================
// Packet Mangling
// ============================================================================

pub use mangle::{ChecksumMode, MssClamp};

// ============================================================================
// Relay & Session
// ============================================================================

pub use relay::{RelayTiming, StopSignal};
pub use session::Session;

// ============================================================================
// Host Seams
// ============================================================================

pub use socket::{DatagramSocket, SharedSocket, SocketFactory, UdpSocketFactory};
pub use tun::{
    IoReader, IoWriter, PacketRead, PacketWrite, RouteEntry, TunDeviceFactory, TunnelDevice,
    TunnelFactory, TunnelParams,
};

// ============================================================================
// Status & Metrics
// ============================================================================

pub use metrics::{Metrics, Throughput, TrafficSample};
pub use status::{StatusEvent, StatusHub, Telemetry};

// ============================================================================
// Wire Format
// ============================================================================

pub use thinkslow_common::{PacketHeader, PacketType, HEADER_SIZE, SERVER_PORT};
