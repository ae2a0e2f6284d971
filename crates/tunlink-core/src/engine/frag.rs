// ============================================
// File: crates/tunlink-core/src/engine/frag.rs
// ============================================
//! # IP Fragment Reassembly
//!
//! ## Creation Reason
//! Inspection and the UDP path read transport headers straight from the
//! packet, and only the first fragment of a datagram carries them. Ingress
//! therefore reassembles fragmented IPv4 and IPv6 datagrams before
//! anything else looks at them.
//!
//! ## Main Logical Flow
//! ```text
//! packet ─► unfragmented? ─► Whole (untouched)
//!        └► fragment ─► keyed by (source, destination, id, protocol)
//!                       ─► all bytes present ─► Complete(rebuilt packet)
//!                       └► otherwise Held until REASSEMBLY_TIMEOUT
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - IPv6 fragments are only recognised when the fragment header directly
//!   follows the fixed header
//! - Overlapping fragments are accepted; later bytes win
//!
//! ## Last Modified
//! v0.1.0 - Initial reassembly

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};
use tracing::trace;

use crate::packet::NetworkProtocol;

/// Time a partly received datagram is kept.
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Datagrams reassembled at once; fragments of further ones are dropped.
const MAX_PENDING_DATAGRAMS: usize = 64;

/// Largest IP payload a reassembled datagram may carry.
const MAX_PAYLOAD: usize = u16::MAX as usize;

const IPV6_HEADER_LEN: usize = 40;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;
const IPV6_FRAGMENT: u8 = 44;

/// Outcome of offering one packet to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reassembly {
    /// Not a fragment; use the packet as is.
    Whole,
    /// Fragment stored, datagram still incomplete.
    Held,
    /// The last missing fragment arrived; this is the rebuilt packet.
    Complete(Vec<u8>),
    /// Malformed fragment, or no room to track it.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    source: IpAddr,
    destination: IpAddr,
    ident: u32,
    next_header: u8,
}

struct Fragment<'a> {
    key: FragmentKey,
    offset: usize,
    more: bool,
    header: &'a [u8],
    payload: &'a [u8],
}

enum Parsed<'a> {
    Whole,
    Fragment(Fragment<'a>),
    Invalid,
}

fn parse_v4(data: &[u8]) -> Parsed<'_> {
    let Ok(packet) = Ipv4Packet::new_checked(data) else {
        return Parsed::Invalid;
    };
    let flags = u16::from_be_bytes([data[6], data[7]]);
    let more = flags & 0x2000 != 0;
    let offset = usize::from(flags & 0x1fff) * 8;
    if !more && offset == 0 {
        return Parsed::Whole;
    }
    if !packet.verify_checksum() {
        return Parsed::Invalid;
    }

    let header_len = usize::from(packet.header_len());
    let total_len = usize::from(packet.total_len());
    Parsed::Fragment(Fragment {
        key: FragmentKey {
            source: IpAddr::V4(Ipv4Addr::from(packet.src_addr())),
            destination: IpAddr::V4(Ipv4Addr::from(packet.dst_addr())),
            ident: u32::from(packet.ident()),
            next_header: u8::from(packet.next_header()),
        },
        offset,
        more,
        header: &data[..header_len],
        payload: &data[header_len..total_len],
    })
}

fn parse_v6(data: &[u8]) -> Parsed<'_> {
    let Ok(packet) = Ipv6Packet::new_checked(data) else {
        return Parsed::Invalid;
    };
    if u8::from(packet.next_header()) != IPV6_FRAGMENT {
        return Parsed::Whole;
    }
    let body = packet.payload();
    if body.len() < IPV6_FRAGMENT_HEADER_LEN {
        return Parsed::Invalid;
    }

    let field = u16::from_be_bytes([body[2], body[3]]);
    Parsed::Fragment(Fragment {
        key: FragmentKey {
            source: IpAddr::V6(Ipv6Addr::from(packet.src_addr())),
            destination: IpAddr::V6(Ipv6Addr::from(packet.dst_addr())),
            ident: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            next_header: body[0],
        },
        offset: usize::from(field & 0xfff8),
        more: field & 1 != 0,
        header: &data[..IPV6_HEADER_LEN],
        payload: &body[IPV6_FRAGMENT_HEADER_LEN..],
    })
}

struct Partial {
    started: Instant,
    /// IP header of the offset-0 fragment
    header: Option<Vec<u8>>,
    /// Payload length, known once the last fragment arrived
    total: Option<usize>,
    pieces: Vec<(usize, Vec<u8>)>,
    received: usize,
}

impl Partial {
    const fn new(started: Instant) -> Self {
        Self {
            started,
            header: None,
            total: None,
            pieces: Vec::new(),
            received: 0,
        }
    }

    /// The reassembled payload once every byte is present.
    fn payload(&self) -> Option<Vec<u8>> {
        let total = self.total?;
        self.header.as_ref()?;

        let mut spans: Vec<(usize, usize)> = self
            .pieces
            .iter()
            .map(|(offset, data)| (*offset, offset + data.len()))
            .collect();
        spans.sort_unstable();
        let mut covered = 0;
        for (start, end) in spans {
            if start > covered {
                return None;
            }
            covered = covered.max(end);
        }
        if covered < total {
            return None;
        }

        let mut payload = vec![0u8; total];
        for (offset, data) in &self.pieces {
            let end = (offset + data.len()).min(total);
            if *offset < end {
                payload[*offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
        Some(payload)
    }
}

fn rebuild(
    protocol: NetworkProtocol,
    key: &FragmentKey,
    header: &[u8],
    payload: &[u8],
) -> Option<Vec<u8>> {
    let mut packet = [header, payload].concat();
    match protocol {
        NetworkProtocol::Ipv4 => {
            let total = u16::try_from(packet.len()).ok()?;
            packet[2..4].copy_from_slice(&total.to_be_bytes());
            // Keep DF, clear MF and the offset.
            let flags = u16::from_be_bytes([packet[6], packet[7]]) & 0x4000;
            packet[6..8].copy_from_slice(&flags.to_be_bytes());
            Ipv4Packet::new_unchecked(&mut packet[..]).fill_checksum();
        }
        NetworkProtocol::Ipv6 => {
            let len = u16::try_from(payload.len()).ok()?;
            let mut ip = Ipv6Packet::new_unchecked(&mut packet[..]);
            ip.set_next_header(IpProtocol::from(key.next_header));
            ip.set_payload_len(len);
        }
    }
    Some(packet)
}

/// Buffers IP fragments until their datagram is complete.
pub(crate) struct Reassembler {
    pending: Mutex<HashMap<FragmentKey, Partial>>,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Offers `data` to the reassembler.
    pub(crate) fn accept(&self, protocol: NetworkProtocol, data: &[u8]) -> Reassembly {
        self.accept_at(protocol, data, Instant::now())
    }

    pub(crate) fn accept_at(
        &self,
        protocol: NetworkProtocol,
        data: &[u8],
        now: Instant,
    ) -> Reassembly {
        let parsed = match protocol {
            NetworkProtocol::Ipv4 => parse_v4(data),
            NetworkProtocol::Ipv6 => parse_v6(data),
        };
        let fragment = match parsed {
            Parsed::Whole => return Reassembly::Whole,
            Parsed::Invalid => return Reassembly::Dropped,
            Parsed::Fragment(fragment) => fragment,
        };

        let end = fragment.offset + fragment.payload.len();
        if (fragment.more && fragment.payload.len() % 8 != 0) || end > MAX_PAYLOAD {
            trace!(source = %fragment.key.source, "Dropping misaligned or oversized fragment");
            return Reassembly::Dropped;
        }

        let mut pending = self.pending.lock();
        pending.retain(|_, partial| {
            now.saturating_duration_since(partial.started) < REASSEMBLY_TIMEOUT
        });
        if !pending.contains_key(&fragment.key) && pending.len() >= MAX_PENDING_DATAGRAMS {
            trace!(source = %fragment.key.source, "Reassembly table full, dropping fragment");
            return Reassembly::Dropped;
        }

        let key = fragment.key;
        let partial = pending.entry(key).or_insert_with(|| Partial::new(now));
        if fragment.offset == 0 {
            partial.header = Some(fragment.header.to_vec());
        }
        if !fragment.more {
            if partial.total.is_some_and(|total| total != end) {
                pending.remove(&key);
                return Reassembly::Dropped;
            }
            partial.total = Some(end);
        }
        partial.received += fragment.payload.len();
        if partial.received > MAX_PAYLOAD {
            pending.remove(&key);
            return Reassembly::Dropped;
        }
        partial.pieces.push((fragment.offset, fragment.payload.to_vec()));

        let Some(payload) = partial.payload() else {
            return Reassembly::Held;
        };
        let header = partial.header.take().unwrap_or_default();
        pending.remove(&key);
        match rebuild(protocol, &key, &header, &payload) {
            Some(packet) => Reassembly::Complete(packet),
            None => Reassembly::Dropped,
        }
    }

    /// Datagrams currently being reassembled.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
