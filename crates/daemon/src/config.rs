use crate::mangle::ChecksumMode;
use crate::relay::RelayTiming;
use crate::tun::TunnelParams;
use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thinkslow_common::{DEFAULT_CLAMP_MSS, DEFAULT_MTU, SERVER_PORT};

/// Bounds accepted for the tunnel MTU.
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 9000;

/// IPv4 plus TCP header without options.
const TCP_IP_OVERHEAD: u32 = 40;

/// Top-level configuration for the tunnel client.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Server and packet-size settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Server host name or address
    pub server: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_clamp_mss")]
    pub clamp_mss: u32,
    #[serde(default)]
    pub checksum_mode: ChecksumMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: default_port(),
            mtu: default_mtu(),
            clamp_mss: default_clamp_mss(),
            checksum_mode: ChecksumMode::default(),
        }
    }
}

/// Virtual interface settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_dns")]
    pub dns: Ipv4Addr,
    /// CIDRs sent through the tunnel; a default route is installed as two /1s
    #[serde(default = "default_routes")]
    pub routes: Vec<Ipv4Net>,
    /// SO_MARK applied to the transport socket (Linux)
    pub fwmark: Option<u32>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            prefix_len: default_prefix_len(),
            dns: default_dns(),
            routes: default_routes(),
            fwmark: None,
        }
    }
}

/// Timeouts for the handshake and the relay loops.
///
/// Every relay wait is bounded so the loops notice a stop request within
/// one timeout even if nothing arrives.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// How long to wait for WELCOME
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,

    /// Receive timeout after the transport socket has been replaced
    #[serde(default = "default_recv_timeout")]
    pub recovery_recv_timeout_ms: u64,

    #[serde(default = "default_tun_poll")]
    pub tun_poll_ms: u64,

    /// Interval of the throughput log line
    #[serde(default = "default_throughput_interval")]
    pub throughput_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            recv_timeout_ms: default_recv_timeout(),
            recovery_recv_timeout_ms: default_recv_timeout(),
            tun_poll_ms: default_tun_poll(),
            throughput_interval_secs: default_throughput_interval(),
        }
    }
}

impl TimingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn throughput_interval(&self) -> Duration {
        Duration::from_secs(self.throughput_interval_secs)
    }

    pub fn relay(&self) -> RelayTiming {
        RelayTiming {
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            recovery_recv_timeout: Duration::from_millis(self.recovery_recv_timeout_ms),
            tun_poll: Duration::from_millis(self.tun_poll_ms),
        }
    }
}

/// Process settings for the binary.
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Serve /metrics, /health and /status on this port
    pub metrics_port: Option<u16>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

fn default_port() -> u16 {
    SERVER_PORT
}
fn default_mtu() -> u32 {
    DEFAULT_MTU
}
fn default_clamp_mss() -> u32 {
    DEFAULT_CLAMP_MSS
}
fn default_tun_name() -> String {
    "slow0".to_string()
}
fn default_prefix_len() -> u8 {
    24
}
fn default_dns() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}
fn default_routes() -> Vec<Ipv4Net> {
    // Prefix 0 is always valid.
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).into_iter().collect()
}
fn default_handshake_timeout() -> u64 {
    2000
}
fn default_recv_timeout() -> u64 {
    200
}
fn default_tun_poll() -> u64 {
    200
}
fn default_throughput_interval() -> u64 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/thinkslow/config.toml",
            "~/.thinkslow/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mtu = self.client.mtu;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            bail!("mtu {} outside [{}, {}]", mtu, MIN_MTU, MAX_MTU);
        }
        let mss = self.client.clamp_mss;
        if mss == 0 || mss >= mtu - TCP_IP_OVERHEAD {
            bail!(
                "clamp_mss {} must be non-zero and below mtu - {} ({})",
                mss,
                TCP_IP_OVERHEAD,
                mtu - TCP_IP_OVERHEAD
            );
        }
        if self.tunnel.prefix_len > 32 {
            bail!("prefix_len {} is not a valid IPv4 prefix", self.tunnel.prefix_len);
        }
        if self.tunnel.routes.is_empty() {
            bail!("tunnel.routes must list at least one destination");
        }
        let t = &self.timing;
        for (name, value) in [
            ("handshake_timeout_ms", t.handshake_timeout_ms),
            ("recv_timeout_ms", t.recv_timeout_ms),
            ("recovery_recv_timeout_ms", t.recovery_recv_timeout_ms),
            ("tun_poll_ms", t.tun_poll_ms),
            ("throughput_interval_secs", t.throughput_interval_secs),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    /// Runtime settings for the engine.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            port: self.client.port,
            mtu: self.client.mtu,
            clamp_mss: self.client.clamp_mss,
            checksum_mode: self.client.checksum_mode,
            handshake_timeout: self.timing.handshake_timeout(),
            relay: self.timing.relay(),
            tun_name: self.tunnel.name.clone(),
            prefix_len: self.tunnel.prefix_len,
            dns: self.tunnel.dns,
            routes: self.tunnel.routes.clone(),
        }
    }
}

/// Plain settings consumed by [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Used when the server address has no port
    pub port: u16,
    pub mtu: u32,
    pub clamp_mss: u32,
    pub checksum_mode: ChecksumMode,
    pub handshake_timeout: Duration,
    pub relay: RelayTiming,
    pub tun_name: String,
    pub prefix_len: u8,
    pub dns: Ipv4Addr,
    pub routes: Vec<Ipv4Net>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Config::default().engine()
    }
}

impl EngineConfig {
    pub fn tunnel_params(&self, address: Ipv4Addr, server: IpAddr) -> TunnelParams {
        TunnelParams {
            name: self.tun_name.clone(),
            address,
            prefix_len: self.prefix_len,
            mtu: self.mtu,
            dns: self.dns,
            routes: self.routes.clone(),
            server,
        }
    }
}
