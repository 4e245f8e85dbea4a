#![cfg_attr(not(test), no_std)]

//! Wire format for the ThinkSlow tunnel protocol.
//!
//! Every datagram starts with a fixed 5-byte header: one type byte followed
//! by a big-endian 32-bit session id.

/// Size of the packet header on the wire.
pub const HEADER_SIZE: usize = 5;

/// Length of a HELLO datagram: header, client magic, client public value.
pub const HELLO_LEN: usize = HEADER_SIZE + 4 + 4;

/// Length of a WELCOME datagram: header, assigned IPv4, server public value.
pub const WELCOME_LEN: usize = HEADER_SIZE + 4 + 4;

/// Length of a CLIENT_ACK datagram (header only).
pub const CLIENT_ACK_LEN: usize = HEADER_SIZE;

/// UDP port the tunnel server listens on.
pub const SERVER_PORT: u16 = 5555;

/// Tunnel MTU used when nothing else is configured.
pub const DEFAULT_MTU: u32 = 1320;

/// MSS ceiling applied to outgoing TCP SYNs before any PMTUD feedback.
pub const DEFAULT_CLAMP_MSS: u32 = 1160;

/// Datagram kinds. Values outside this set are dropped by receivers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Hello = 1,
    Welcome = 2,
    ClientAck = 3,
    Data = 4,
}

impl PacketType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Hello),
            2 => Ok(PacketType::Welcome),
            3 => Ok(PacketType::ClientAck),
            4 => Ok(PacketType::Data),
            other => Err(other),
        }
    }
}

/// Decoded packet header.
///
/// The type byte is kept raw so that unknown types survive decoding and can
/// be filtered by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub raw_type: u8,
    pub session_id: u32,
}

impl PacketHeader {
    pub const fn new(packet_type: PacketType, session_id: u32) -> Self {
        Self {
            raw_type: packet_type as u8,
            session_id,
        }
    }

    /// Known packet type, or `None` for forward-compat values.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.raw_type).ok()
    }

    pub fn is(&self, packet_type: PacketType) -> bool {
        self.raw_type == packet_type as u8
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let sid = self.session_id.to_be_bytes();
        [self.raw_type, sid[0], sid[1], sid[2], sid[3]]
    }

    /// Write the header into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// Returns `false` without touching `buf` if it is too short.
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        match buf.get_mut(..HEADER_SIZE) {
            Some(dst) => {
                dst.copy_from_slice(&self.encode());
                true
            }
            None => false,
        }
    }

    /// Decode the header at the start of `buf`; `None` if shorter than
    /// `HEADER_SIZE`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            raw_type: buf[0],
            session_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }
}

/// Read a big-endian u32 at `offset`, if in bounds.
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
