//! In-place rewriting of tunneled IPv4 packets.
//!
//! - TCP MSS clamping on outgoing SYNs, with either a full checksum
//!   recompute or an RFC 1624 incremental update
//! - IPv4 and TCP checksum recomputation
//! - Detection of ICMP "fragmentation needed" messages for passive PMTUD
//!
//! All functions work on a borrowed buffer and never change its length.
//! Anything that is not a well-formed IPv4 packet of the expected kind is
//! left untouched.

use serde::Deserialize;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;

const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const IPV4_CHECKSUM_OFFSET: usize = 10;
const TCP_CHECKSUM_OFFSET: usize = 16;

const TCP_FLAG_SYN: u8 = 0x02;
const TCP_OPTION_END: u8 = 0;
const TCP_OPTION_NOP: u8 = 1;
const TCP_OPTION_MSS: u8 = 2;
const TCP_OPTION_MSS_LEN: usize = 4;

const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_FRAG_NEEDED: u8 = 4;
const ICMP_NEXT_HOP_MTU_OFFSET: usize = 6;

/// Smallest next-hop MTU accepted from a PMTUD signal (RFC 791 minimum).
pub const MIN_PLAUSIBLE_MTU: u32 = 576;

/// Distance kept between the tunnel MTU and the MSS we clamp to.
pub const MSS_SAFETY_MARGIN: u32 = 160;

/// How the TCP checksum is repaired after an MSS rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Recompute IPv4 and TCP checksums from scratch.
    Full,
    /// Patch the TCP checksum for the changed word only.
    #[default]
    Incremental,
}

/// What `clamp_mss` did to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MssClamp {
    /// Not an IPv4 TCP SYN carrying a readable MSS option.
    NotApplicable,
    /// MSS option present and already at or below the limit.
    WithinLimit(u16),
    /// MSS rewritten and checksums repaired.
    Clamped { from: u16, to: u16 },
}

/// MSS to clamp to for a given path MTU.
pub fn mss_for_mtu(mtu: u32) -> u32 {
    mtu.saturating_sub(MSS_SAFETY_MARGIN)
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// RFC 1071 Internet checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

/// RFC 1624 eqn. 3: `HC' = ~(~HC + ~m + m')`.
pub fn incremental_update(old_checksum: u16, old_word: u16, new_word: u16) -> u16 {
    let sum = (!old_checksum) as u32 + (!old_word) as u32 + new_word as u32;
    !fold(sum)
}

/// IPv4 header length if `packet` starts with a plausible IPv4 header.
fn ipv4_header_len(packet: &[u8]) -> Option<usize> {
    let first = *packet.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = (first & 0x0F) as usize * 4;
    if ihl < IPV4_MIN_HEADER || ihl > packet.len() {
        return None;
    }
    Some(ihl)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Recompute the IPv4 header checksum in place.
///
/// Returns `false` (and leaves the buffer alone) if the header is truncated.
pub fn recompute_ipv4_checksum(packet: &mut [u8]) -> bool {
    let Some(ihl) = ipv4_header_len(packet) else {
        return false;
    };
    write_u16(packet, IPV4_CHECKSUM_OFFSET, 0);
    let checksum = internet_checksum(&packet[..ihl]);
    write_u16(packet, IPV4_CHECKSUM_OFFSET, checksum);
    true
}

/// Recompute the TCP checksum (pseudo-header plus segment) in place.
///
/// `total_len` is the number of valid bytes in `packet`.
pub fn recompute_tcp_checksum(packet: &mut [u8], ip_header_len: usize, total_len: usize) -> bool {
    let total_len = total_len.min(packet.len());
    if ip_header_len < IPV4_MIN_HEADER || total_len < ip_header_len + TCP_MIN_HEADER {
        return false;
    }
    let tcp_len = total_len - ip_header_len;
    if tcp_len > u16::MAX as usize {
        return false;
    }
    let csum_at = ip_header_len + TCP_CHECKSUM_OFFSET;
    write_u16(packet, csum_at, 0);

    let mut sum = sum_words(0, &packet[12..20]);
    sum += IPPROTO_TCP as u32;
    sum += tcp_len as u32;
    sum = sum_words(sum, &packet[ip_header_len..total_len]);

    write_u16(packet, csum_at, !fold(sum));
    true
}

/// Clamp the MSS option of an outgoing IPv4 TCP SYN to `limit`.
///
/// Only the first MSS option is considered. A malformed option list (an
/// option length below 2, or one running past the header) aborts the scan
/// and leaves the packet unmodified.
pub fn clamp_mss(packet: &mut [u8], total_len: usize, limit: u16, mode: ChecksumMode) -> MssClamp {
    let total_len = total_len.min(packet.len());
    let packet_view = &packet[..total_len];

    if total_len < IPV4_MIN_HEADER + TCP_MIN_HEADER {
        return MssClamp::NotApplicable;
    }
    let Some(ihl) = ipv4_header_len(packet_view) else {
        return MssClamp::NotApplicable;
    };
    if packet_view[9] != IPPROTO_TCP || total_len < ihl + TCP_MIN_HEADER {
        return MssClamp::NotApplicable;
    }

    let tcp = ihl;
    if packet_view[tcp + 13] & TCP_FLAG_SYN == 0 {
        return MssClamp::NotApplicable;
    }
    let tcp_hdr_len = ((packet_view[tcp + 12] >> 4) & 0x0F) as usize * 4;
    if tcp_hdr_len <= TCP_MIN_HEADER || tcp + tcp_hdr_len > total_len {
        return MssClamp::NotApplicable;
    }

    let Some(mss_at) = find_mss_option(packet_view, tcp + TCP_MIN_HEADER, tcp + tcp_hdr_len) else {
        return MssClamp::NotApplicable;
    };

    let old_mss = read_u16(packet, mss_at);
    if old_mss <= limit {
        return MssClamp::WithinLimit(old_mss);
    }
    write_u16(packet, mss_at, limit);

    match mode {
        ChecksumMode::Full => {
            recompute_ipv4_checksum(&mut packet[..total_len]);
            recompute_tcp_checksum(packet, ihl, total_len);
        }
        ChecksumMode::Incremental => {
            // A field at an odd offset within the segment contributes its
            // bytes swapped to the one's-complement sum.
            let (old_word, new_word) = if (mss_at - tcp) % 2 == 1 {
                (old_mss.swap_bytes(), limit.swap_bytes())
            } else {
                (old_mss, limit)
            };
            let csum_at = tcp + TCP_CHECKSUM_OFFSET;
            let updated = incremental_update(read_u16(packet, csum_at), old_word, new_word);
            write_u16(packet, csum_at, updated);
        }
    }

    MssClamp::Clamped {
        from: old_mss,
        to: limit,
    }
}

/// Offset of the MSS value inside `[start, end)`, if present and readable.
fn find_mss_option(packet: &[u8], start: usize, end: usize) -> Option<usize> {
    let mut opt = start;
    while opt < end {
        match packet[opt] {
            TCP_OPTION_END => return None,
            TCP_OPTION_NOP => opt += 1,
            kind => {
                if opt + 1 >= end {
                    return None;
                }
                let size = packet[opt + 1] as usize;
                if size < 2 || opt + size > end {
                    return None;
                }
                if kind == TCP_OPTION_MSS && size == TCP_OPTION_MSS_LEN {
                    return Some(opt + 2);
                }
                opt += size;
            }
        }
    }
    None
}

/// Next-hop MTU carried by an ICMP "fragmentation needed" message.
///
/// Only values within `[MIN_PLAUSIBLE_MTU, current_mtu]` are returned.
pub fn detect_icmp_frag_needed(packet: &[u8], len: usize, current_mtu: u32) -> Option<u32> {
    let packet = &packet[..len.min(packet.len())];
    let ihl = ipv4_header_len(packet)?;
    if packet[9] != IPPROTO_ICMP || packet.len() < ihl + 8 {
        return None;
    }
    if packet[ihl] != ICMP_DEST_UNREACHABLE || packet[ihl + 1] != ICMP_FRAG_NEEDED {
        return None;
    }
    let mtu = read_u16(packet, ihl + ICMP_NEXT_HOP_MTU_OFFSET) as u32;
    (MIN_PLAUSIBLE_MTU..=current_mtu).contains(&mtu).then_some(mtu)
}
