//! Connection lifecycle: resolve, handshake, provision, relay, teardown.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handshake::Handshake;
use crate::metrics::Metrics;
use crate::relay::{self, RelayContext, StopSignal};
use crate::session::Session;
use crate::socket::{SharedSocket, SocketFactory};
use crate::status::{StatusEvent, StatusHub, Telemetry};
use crate::tun::TunnelFactory;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Host-side view of a live session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
    server: SocketAddr,
    stop: StopSignal,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn telemetry(&self) -> Telemetry {
        self.session.telemetry()
    }

    pub fn session_id(&self) -> u32 {
        self.session.session_id()
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// `false` once a stop was requested or the tunnel device failed.
    pub fn is_running(&self) -> bool {
        self.stop.is_running()
    }

    /// Ask both loops to exit without waiting for them.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Resolves after both loops have exited and teardown is complete.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Clears the in-progress flag when a connect attempt ends.
struct ConnectGuard<'a>(&'a AtomicBool);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tunnel client engine. One session at a time.
pub struct Engine {
    config: EngineConfig,
    sockets: Arc<dyn SocketFactory>,
    tunnels: Arc<dyn TunnelFactory>,
    metrics: Arc<Metrics>,
    status: Arc<StatusHub>,
    connecting: AtomicBool,
    active: Mutex<Option<SessionHandle>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sockets: Arc<dyn SocketFactory>,
        tunnels: Arc<dyn TunnelFactory>,
    ) -> Self {
        Self {
            config,
            sockets,
            tunnels,
            metrics: Metrics::new(),
            status: StatusHub::new(),
            connecting: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn status(&self) -> Arc<StatusHub> {
        Arc::clone(&self.status)
    }

    /// Register a status callback. Callbacks run on the engine's tasks and
    /// should return quickly.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.status.subscribe(callback);
    }

    /// Handle of the current session, if it is still running.
    pub fn session(&self) -> Option<SessionHandle> {
        self.active_slot()
            .as_ref()
            .filter(|h| h.is_running())
            .cloned()
    }

    fn active_slot(&self) -> std::sync::MutexGuard<'_, Option<SessionHandle>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect to `server` (`host` or `host:port`) and start relaying.
    ///
    /// A previous session that has stopped but is still tearing down is
    /// waited for first, so its `Disconnected` precedes the new `Connecting`.
    pub async fn connect(&self, server: &str) -> Result<SessionHandle, EngineError> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConnected);
        }
        let _guard = ConnectGuard(&self.connecting);

        let previous = self.active_slot().clone();
        if let Some(previous) = previous {
            if previous.is_running() {
                return Err(EngineError::AlreadyConnected);
            }
            previous.closed().await;
        }

        match self.establish(server).await {
            Ok(handle) => {
                *self.active_slot() = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.status.emit(StatusEvent::Error(e.to_string()));
                self.status.emit(StatusEvent::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, server: &str) -> Result<SessionHandle, EngineError> {
        let server = resolve_server(server, self.config.port).await?;
        self.status.emit(StatusEvent::Connecting { server });

        let socket = self.sockets.create_protected_socket().await?;

        let outcome = match Handshake::new()
            .run(&*socket, server, self.config.handshake_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.inc_handshakes_failed();
                return Err(e);
            }
        };
        self.metrics.inc_handshakes_completed();

        let session = Arc::new(Session::new(
            &outcome,
            self.config.mtu,
            self.config.clamp_mss,
        ));

        let params = self
            .config
            .tunnel_params(outcome.assigned_address, server.ip());
        let device = self
            .tunnels
            .create_tunnel(&params)
            .await
            .map_err(|e| EngineError::TunnelDevice(e.to_string()))?;

        let stop = StopSignal::new();
        let ctx = Arc::new(RelayContext {
            session: Arc::clone(&session),
            socket: Arc::new(SharedSocket::new(socket, Arc::clone(&self.sockets))),
            server,
            metrics: Arc::clone(&self.metrics),
            status: Arc::clone(&self.status),
            stop: stop.clone(),
            timing: self.config.relay,
            checksum_mode: self.config.checksum_mode,
        });
        let tasks = relay::spawn(ctx, device);

        let telemetry = session.telemetry();
        self.metrics.inc_sessions();
        self.metrics.set_path(telemetry.mtu, telemetry.mss);
        self.status.emit(StatusEvent::Connected(telemetry));

        let (closed_tx, closed_rx) = watch::channel(false);
        let supervisor_stop = stop.clone();
        let metrics = Arc::clone(&self.metrics);
        let status = Arc::clone(&self.status);
        let tunnels = Arc::clone(&self.tunnels);
        tokio::spawn(async move {
            tasks.join().await;
            supervisor_stop.stop();
            tunnels.release_tunnel(&params).await;
            metrics.dec_sessions();
            info!("Session with {} closed", server);
            status.emit(StatusEvent::Disconnected);
            closed_tx.send_replace(true);
        });

        Ok(SessionHandle {
            session,
            server,
            stop,
            closed: closed_rx,
        })
    }

    /// Stop the current session and wait for teardown. Safe to call at any
    /// time, including when nothing is connected.
    pub async fn disconnect(&self) {
        let handle = self.active_slot().take();
        if let Some(handle) = handle {
            info!("Disconnecting from {}", handle.server());
            handle.stop();
            handle.closed().await;
        }
    }
}

/// Resolve `host` or `host:port`, preferring IPv4.
pub async fn resolve_server(server: &str, default_port: u16) -> Result<SocketAddr, EngineError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, default_port)
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| EngineError::InvalidServerAddress(format!("{}: {}", server, e)))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| EngineError::InvalidServerAddress(server.to_string()))
}
