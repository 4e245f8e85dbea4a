//! Virtual interface seam and the default TUN implementation.
//!
//! The relay only sees a packet reader and a packet writer. Provisioning the
//! interface (address, routes, DNS) belongs to the host; [`TunDeviceFactory`]
//! is what the standalone binary uses.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What the host needs to bring up the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u32,
    pub dns: Ipv4Addr,
    /// Destinations to send through the tunnel.
    pub routes: Vec<Ipv4Net>,
    /// Resolved transport endpoint; must stay reachable outside the tunnel.
    pub server: IpAddr,
}

impl TunnelParams {
    pub fn netmask(&self) -> Ipv4Addr {
        netmask_for_prefix(self.prefix_len)
    }
}

pub fn netmask_for_prefix(prefix_len: u8) -> Ipv4Addr {
    let host_bits = 32u32.saturating_sub(prefix_len.min(32) as u32);
    Ipv4Addr::from(u32::MAX.checked_shl(host_bits).unwrap_or(0))
}

/// Source of raw IP packets leaving the host.
#[async_trait]
pub trait PacketRead: Send {
    /// Read one packet. `Ok(0)` means nothing was available.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sink for raw IP packets entering the host.
#[async_trait]
pub trait PacketWrite: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Duplex packet stream handed back by a [`TunnelFactory`].
///
/// The uplink loop owns the reader and the downlink loop owns the writer.
pub struct TunnelDevice {
    pub reader: Box<dyn PacketRead>,
    pub writer: Box<dyn PacketWrite>,
}

impl TunnelDevice {
    pub fn new(reader: impl PacketRead + 'static, writer: impl PacketWrite + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Host capability: create the virtual interface for a new session.
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    async fn create_tunnel(&self, params: &TunnelParams) -> io::Result<TunnelDevice>;

    /// Undo host changes made by `create_tunnel`. Called once both relay
    /// loops have exited.
    async fn release_tunnel(&self, _params: &TunnelParams) {}
}

/// [`PacketRead`] over a tokio reader where each read yields one packet.
pub struct IoReader<R>(pub R);

#[async_trait]
impl<R> PacketRead for IoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf).await? {
            // A TUN fd never reads zero bytes while open.
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tunnel device closed",
            )),
            n => Ok(n),
        }
    }
}

/// [`PacketWrite`] over a tokio writer.
pub struct IoWriter<W>(pub W);

#[async_trait]
impl<W> PacketWrite for IoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.write_all(packet).await
    }
}

/// One `ip route` entry owned by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub net: Ipv4Net,
    pub via: Option<Ipv4Addr>,
    pub dev: String,
}

impl RouteEntry {
    /// Arguments for `ip`, `verb` being `add` or `del`.
    pub fn args(&self, verb: &str) -> Vec<String> {
        let mut args = vec!["route".to_string(), verb.to_string(), self.net.to_string()];
        if let Some(gw) = self.via {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        args.push("dev".to_string());
        args.push(self.dev.clone());
        args
    }
}

/// How the host reached the server before the tunnel existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub via: Option<Ipv4Addr>,
    pub dev: String,
}

/// Parse the first line of `ip route get <addr>`, e.g.
/// `203.0.113.10 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0`.
pub fn parse_route_get(output: &str) -> Option<Uplink> {
    let line = output.lines().next()?;
    let mut tokens = line.split_whitespace();
    let mut via = None;
    let mut dev = None;
    while let Some(token) = tokens.next() {
        match token {
            "via" => via = tokens.next().and_then(|t| t.parse().ok()),
            "dev" => dev = tokens.next().map(str::to_string),
            _ => {}
        }
    }
    Some(Uplink { via, dev: dev? })
}

/// Routes to install for a session, in order.
///
/// A default route is split into `0.0.0.0/1` and `128.0.0.0/1` so the host's
/// own default stays in place. When the server falls inside a tunnel route
/// it is pinned to `uplink` with a /32 first; without that the transport
/// socket would send into its own tunnel.
pub fn plan_routes(params: &TunnelParams, uplink: Option<&Uplink>) -> Vec<RouteEntry> {
    let mut plan = Vec::new();

    if let (IpAddr::V4(server), Some(uplink)) = (params.server, uplink) {
        if params.routes.iter().any(|net| net.contains(&server)) {
            plan.push(RouteEntry {
                net: Ipv4Net::from(server),
                via: uplink.via,
                dev: uplink.dev.clone(),
            });
        }
    }

    for net in &params.routes {
        let halves = match net.prefix_len() {
            0 => net.subnets(1).map(|s| s.collect::<Vec<_>>()).unwrap_or_default(),
            _ => vec![net.trunc()],
        };
        plan.extend(halves.into_iter().map(|net| RouteEntry {
            net,
            via: None,
            dev: params.name.clone(),
        }));
    }
    plan
}

/// Layer 3 TUN interface via `tun2`.
///
/// Routes it adds are remembered and deleted again on release.
#[derive(Debug, Default)]
pub struct TunDeviceFactory {
    installed: Mutex<Vec<RouteEntry>>,
}

impl TunDeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn installed(&self) -> std::sync::MutexGuard<'_, Vec<RouteEntry>> {
        self.installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn install_routes(&self, params: &TunnelParams) {
        let uplink = match params.server {
            IpAddr::V4(server) => lookup_uplink(server).await,
            IpAddr::V6(_) => None,
        };
        if uplink.is_none() && params.routes.iter().any(|n| n.prefix_len() == 0) {
            warn!(
                "No uplink found for {}; transport traffic may loop through '{}'",
                params.server, params.name
            );
        }

        for route in plan_routes(params, uplink.as_ref()) {
            if run_ip(&route.args("add")).await {
                info!(
                    "Route {} dev {}{}",
                    route.net,
                    route.dev,
                    route.via.map(|gw| format!(" via {}", gw)).unwrap_or_default()
                );
                self.installed().push(route);
            }
        }
    }
}

#[async_trait]
impl TunnelFactory for TunDeviceFactory {
    async fn create_tunnel(&self, params: &TunnelParams) -> io::Result<TunnelDevice> {
        let mtu = u16::try_from(params.mtu).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("MTU {} does not fit a TUN device", params.mtu),
            )
        })?;

        info!(
            "Creating TUN interface '{}' with IP {}/{}",
            params.name, params.address, params.prefix_len
        );

        let device = {
            let mut config = tun2::Configuration::default();
            config
                .tun_name(&params.name)
                .address(params.address)
                .netmask(params.netmask())
                .mtu(mtu)
                .up();

            // Raw IP packets only, no 4-byte packet information prefix.
            #[cfg(target_os = "linux")]
            config.platform_config(|p| {
                p.packet_information(false);
            });

            #[cfg(target_os = "macos")]
            config.platform_config(|p| {
                p.packet_information(false);
            });

            tun2::create_as_async(&config)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
        };

        info!("TUN interface '{}' up, MTU {}", params.name, mtu);

        self.install_routes(params).await;
        info!(
            "DNS server for '{}': {} (apply via the host resolver)",
            params.name, params.dns
        );

        let (reader, writer) = tokio::io::split(device);
        Ok(TunnelDevice::new(IoReader(reader), IoWriter(writer)))
    }

    async fn release_tunnel(&self, params: &TunnelParams) {
        let routes: Vec<RouteEntry> = self.installed().drain(..).rev().collect();
        for route in routes {
            if run_ip(&route.args("del")).await {
                debug!("Removed route {} dev {}", route.net, route.dev);
            }
        }
        info!("Released routes for '{}'", params.name);
    }
}

#[cfg(target_os = "linux")]
async fn run_ip(args: &[String]) -> bool {
    match tokio::process::Command::new("ip").args(args).status().await {
        Ok(s) if s.success() => true,
        Ok(s) => {
            warn!("ip {} exited with {}", args.join(" "), s);
            false
        }
        Err(e) => {
            warn!("Failed to run ip {}: {}", args.join(" "), e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn run_ip(args: &[String]) -> bool {
    warn!("ip {} skipped: routes are not managed on this platform", args.join(" "));
    false
}

#[cfg(target_os = "linux")]
async fn lookup_uplink(server: Ipv4Addr) -> Option<Uplink> {
    let output = tokio::process::Command::new("ip")
        .args(["route", "get", &server.to_string()])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_route_get(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            warn!("ip route get {} exited with {}", server, out.status);
            None
        }
        Err(e) => {
            warn!("Failed to run ip route get {}: {}", server, e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn lookup_uplink(_server: Ipv4Addr) -> Option<Uplink> {
    None
}
