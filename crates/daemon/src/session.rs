//! Negotiated tunnel session shared by the uplink and downlink loops.

use crate::cipher::XorCipher;
use crate::handshake::HandshakeOutcome;
use crate::mangle::mss_for_mtu;
use crate::status::Telemetry;
use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

/// State of one established session.
///
/// The cipher and assigned address are fixed at creation. The session id
/// follows whatever the server last put in a DATA header. MTU and MSS only
/// ever shrink; they are written by the downlink loop and read by the
/// uplink loop.
pub struct Session {
    session_id: AtomicU32,
    assigned_address: Ipv4Addr,
    cipher: XorCipher,
    active_mtu: AtomicU32,
    active_mss: AtomicU32,
}

impl Session {
    pub fn new(outcome: &HandshakeOutcome, mtu: u32, clamp_mss: u32) -> Self {
        Self {
            session_id: AtomicU32::new(outcome.session_id),
            assigned_address: outcome.assigned_address,
            cipher: outcome.cipher,
            active_mtu: AtomicU32::new(mtu),
            active_mss: AtomicU32::new(clamp_mss),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    /// Take the session id from an inbound DATA header.
    ///
    /// The id is not authenticated: any datagram that reaches the socket
    /// with a DATA header can move the session to a different id. Returns
    /// the previous id when it changed.
    pub fn adopt_session_id(&self, session_id: u32) -> Option<u32> {
        let previous = self.session_id.swap(session_id, Ordering::AcqRel);
        if previous != session_id {
            warn!(
                "Server rotated session id {:#010x} -> {:#010x}",
                previous, session_id
            );
            Some(previous)
        } else {
            None
        }
    }

    pub fn assigned_address(&self) -> Ipv4Addr {
        self.assigned_address
    }

    pub fn cipher(&self) -> XorCipher {
        self.cipher
    }

    pub fn active_mtu(&self) -> u32 {
        self.active_mtu.load(Ordering::Acquire)
    }

    pub fn active_mss(&self) -> u32 {
        self.active_mss.load(Ordering::Acquire)
    }

    /// Current MSS ceiling for outgoing SYNs.
    pub fn clamp_limit(&self) -> u16 {
        self.active_mss().min(u16::MAX as u32) as u16
    }

    /// Shrink MTU and MSS after a "fragmentation needed" signal.
    ///
    /// Returns the new telemetry if anything changed. A next-hop MTU at or
    /// above the current one is ignored.
    pub fn apply_path_mtu(&self, next_hop_mtu: u32) -> Option<Telemetry> {
        let previous_mtu = self.active_mtu.fetch_min(next_hop_mtu, Ordering::AcqRel);
        if next_hop_mtu >= previous_mtu {
            return None;
        }
        let target_mss = mss_for_mtu(next_hop_mtu);
        let previous_mss = self.active_mss.fetch_min(target_mss, Ordering::AcqRel);
        info!(
            "PMTUD: next-hop MTU {} (was {}), MSS clamp {} -> {}",
            next_hop_mtu,
            previous_mtu,
            previous_mss,
            previous_mss.min(target_mss)
        );
        Some(self.telemetry())
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            assigned_address: self.assigned_address,
            session_id: self.session_id(),
            mtu: self.active_mtu(),
            mss: self.active_mss(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &format_args!("{:#010x}", self.session_id()))
            .field("assigned_address", &self.assigned_address)
            .field("active_mtu", &self.active_mtu())
            .field("active_mss", &self.active_mss())
            .finish_non_exhaustive()
    }
}
