use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use thinkslow::{
    config::Config,
    engine::Engine,
    http::{self, HttpState},
    socket::UdpSocketFactory,
    status::StatusEvent,
    tun::TunDeviceFactory,
};
use tokio::signal;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(
    name = "thinkslow",
    version,
    about = "ThinkSlow tunnel client - encrypted UDP tunnel with MSS clamping",
    long_about = "ThinkSlow tunnel client\n\n\
        Performs the HELLO/WELCOME/CLIENT_ACK handshake with a ThinkSlow\n\
        server, brings up a TUN interface with the assigned address and\n\
        relays IP packets over UDP until interrupted.\n\n\
        Examples:\n  \
          # Connect with defaults (port 5555, MTU 1320)\n  \
          thinkslow --server vpn.example.net\n\n  \
          # Smaller MTU, metrics on :9100\n  \
          thinkslow --server 203.0.113.10 --mtu 1280 --clamp-mss 1120 --metrics-port 9100"
)]
struct Args {
    /// Server host or host:port
    #[arg(short, long)]
    server: Option<String>,

    /// Server UDP port when --server has none
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to config file
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Tunnel MTU
    #[arg(long)]
    mtu: Option<u32>,

    /// MSS ceiling for outgoing TCP SYNs
    #[arg(long)]
    clamp_mss: Option<u32>,

    /// TUN interface name
    #[arg(long)]
    tun_name: Option<String>,

    /// Serve /metrics, /health and /status on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// SO_MARK for the transport socket (Linux)
    #[arg(long)]
    fwmark: Option<u32>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };

    if let Some(server) = &args.server {
        config.client.server = Some(server.clone());
    }
    if let Some(port) = args.port {
        config.client.port = port;
    }
    if let Some(mtu) = args.mtu {
        config.client.mtu = mtu;
    }
    if let Some(mss) = args.clamp_mss {
        config.client.clamp_mss = mss;
    }
    if let Some(name) = &args.tun_name {
        config.tunnel.name = name.clone();
    }
    if args.metrics_port.is_some() {
        config.daemon.metrics_port = args.metrics_port;
    }
    if args.fwmark.is_some() {
        config.tunnel.fwmark = args.fwmark;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.daemon.log_level.as_str()),
    )
    .init();

    let Some(server) = config.client.server.clone() else {
        bail!("No server configured (use --server or [client].server)");
    };

    let sockets = Arc::new(UdpSocketFactory::new().fwmark(config.tunnel.fwmark));
    let tunnels = Arc::new(TunDeviceFactory::new());
    let engine = Engine::new(config.engine(), sockets, tunnels);

    engine.on_status(|event| match event {
        StatusEvent::Error(_) => error!("{}", event),
        _ => info!("{}", event),
    });

    if let Some(port) = config.daemon.metrics_port {
        let state = HttpState {
            metrics: engine.metrics(),
            status: engine.status(),
        };
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(state, port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let session = engine
        .connect(&server)
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;

    let metrics = engine.metrics();
    let mut ticker = interval(config.timing.throughput_interval());
    let mut last = metrics.sample();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Exiting...");
                break;
            }
            _ = session.closed() => {
                warn!("Session ended");
                break;
            }
            _ = ticker.tick() => {
                let now = metrics.sample();
                info!("{}", now.throughput_since(&last));
                last = now;
            }
        }
    }

    engine.disconnect().await;
    Ok(())
}
