//! Status events and telemetry reported to the host.

use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

/// Snapshot of the live session as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub assigned_address: Ipv4Addr,
    pub session_id: u32,
    pub mtu: u32,
    pub mss: u32,
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Connecting { server: SocketAddr },
    Connected(Telemetry),
    MtuChanged(Telemetry),
    Error(String),
    Disconnected,
}

impl StatusEvent {
    pub fn telemetry(&self) -> Option<&Telemetry> {
        match self {
            StatusEvent::Connected(t) | StatusEvent::MtuChanged(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connecting { server } => write!(f, "Connecting to {}...", server),
            StatusEvent::Connected(t) => write!(
                f,
                "Connected as {} (session {:#010x}, MTU {}, MSS {})",
                t.assigned_address, t.session_id, t.mtu, t.mss
            ),
            StatusEvent::MtuChanged(t) => {
                write!(f, "Path MTU lowered to {} (MSS {})", t.mtu, t.mss)
            }
            StatusEvent::Error(msg) => write!(f, "Error: {}", msg),
            StatusEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}

pub type StatusCallback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Fans status events out to registered callbacks.
///
/// Also remembers the last telemetry seen so pollers (the `/status`
/// endpoint) do not need to subscribe.
#[derive(Default)]
pub struct StatusHub {
    callbacks: Mutex<Vec<StatusCallback>>,
    latest: Mutex<Option<Telemetry>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StatusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    pub fn emit(&self, event: StatusEvent) {
        match &event {
            StatusEvent::Connected(t) | StatusEvent::MtuChanged(t) => {
                *lock(&self.latest) = Some(*t);
            }
            StatusEvent::Disconnected => {
                *lock(&self.latest) = None;
            }
            _ => {}
        }

        // Callbacks run without the lock held so they may subscribe or emit.
        let callbacks: Vec<StatusCallback> = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Telemetry of the current session, if one is up.
    pub fn latest(&self) -> Option<Telemetry> {
        *lock(&self.latest)
    }
}
