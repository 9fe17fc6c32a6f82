//! VL1 packet framing, armor, fragmentation, and reassembly.
//!
//! A packet's header is never encrypted; the MAC covers the armored
//! payload (verb byte onward), so relays can increment the hop count
//! without re-keying. Packets larger than the path MTU are split into
//! a head (the first MTU bytes, flagged as fragmented) plus up to
//! fifteen continuation fragments. Reassembly is keyed by packet ID,
//! bounded by an LRU table, and times out after half a second.

use lru::LruCache;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use crate::buf::PooledBuf;
use crate::crypto;
use crate::error::MarshalError;
use crate::identity::Address;
use crate::protocol::*;

/// Header flag: continuation fragments follow this packet.
pub const FLAG_FRAGMENTED: u8 = 0x80;

/// Parsed view of a packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u64,
    pub dest: Address,
    pub source: Address,
    pub flags: u8,
    pub cipher: u8,
    pub hops: u8,
    pub mac: [u8; 8],
}

impl PacketHeader {
    pub fn parse(b: &[u8]) -> Result<Self, MarshalError> {
        if b.len() < MIN_PACKET_LENGTH {
            return Err(MarshalError::Underflow);
        }
        let dest = Address::from_bytes(&b[PACKET_DEST_INDEX..PACKET_DEST_INDEX + 5].try_into().unwrap())
            .ok_or(MarshalError::InvalidField)?;
        let source =
            Address::from_bytes(&b[PACKET_SOURCE_INDEX..PACKET_SOURCE_INDEX + 5].try_into().unwrap())
                .ok_or(MarshalError::InvalidField)?;
        let fch = b[PACKET_FLAGS_INDEX];
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&b[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8]);
        Ok(PacketHeader {
            packet_id: u64::from_be_bytes(b[0..8].try_into().unwrap()),
            dest,
            source,
            flags: fch & 0xc0,
            cipher: (fch >> 3) & 0x07,
            hops: fch & 0x07,
            mac,
        })
    }
}

#[inline]
pub fn packet_id(b: &[u8]) -> u64 {
    u64::from_be_bytes(b[0..8].try_into().unwrap())
}

#[inline]
pub fn is_fragment(b: &[u8]) -> bool {
    b.len() > FRAGMENT_INDICATOR_INDEX && b[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR
}

/// Bump the hop count in place. Returns the new count, or `None` when
/// the packet already sits at the relay ceiling.
pub fn increment_hops(b: &mut [u8]) -> Option<u8> {
    if b.len() <= PACKET_FLAGS_INDEX {
        return None;
    }
    let fch = b[PACKET_FLAGS_INDEX];
    let hops = fch & 0x07;
    if hops >= MAX_HOPS {
        return None;
    }
    b[PACKET_FLAGS_INDEX] = (fch & 0xf8) | (hops + 1);
    Some(hops + 1)
}

/// Assemble and armor a complete outbound packet into `buf`.
///
/// The payload (verb byte plus body) is armored with `key` under the
/// given cipher suite; the 8-byte MAC lands in the header.
pub fn build(
    buf: &mut PooledBuf,
    packet_id: u64,
    dest: Address,
    source: Address,
    cipher: CipherSuite,
    key: &[u8; 32],
    verb: Verb,
    payload: &[u8],
) -> Result<(), MarshalError> {
    buf.clear();
    if MIN_PACKET_LENGTH + payload.len() > BUF_SIZE {
        return Err(MarshalError::Overflow);
    }
    buf.append(&packet_id.to_be_bytes());
    buf.append(&dest.to_bytes());
    buf.append(&source.to_bytes());
    buf.push(((cipher as u8) << 3) & 0x38); // hops start at zero
    buf.append(&[0u8; 8]); // MAC placeholder
    buf.push(verb as u8);
    buf.append(payload);

    let encrypt = cipher == CipherSuite::Poly1305Salsa2012;
    let data = buf.as_mut_slice();
    let (head, armored) = data.split_at_mut(PAYLOAD_START);
    let mac = crypto::armor(key, packet_id, armored, encrypt);
    head[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8].copy_from_slice(&mac);
    Ok(())
}

/// Authenticate and decrypt an inbound packet in place, trying each
/// candidate key in order. Returns the index of the key that verified,
/// or `None` if none did (the payload is then untouched).
pub fn dearmor_in_place(b: &mut [u8], cipher: CipherSuite, keys: &[[u8; 32]]) -> Option<usize> {
    if b.len() < MIN_PACKET_LENGTH {
        return None;
    }
    let id = packet_id(b);
    let mut mac = [0u8; 8];
    mac.copy_from_slice(&b[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8]);
    let encrypted = cipher == CipherSuite::Poly1305Salsa2012;
    let payload = &mut b[PAYLOAD_START..];
    for (i, key) in keys.iter().enumerate() {
        if crypto::dearmor(key, id, payload, &mac, encrypted) {
            return Some(i);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Fragmentation.
// ---------------------------------------------------------------------------

/// Split an armored packet into wire datagrams no larger than `mtu`.
/// The first element is the head (original header, fragmented flag
/// set); the rest are continuation fragments. A packet that fits
/// returns a single unflagged element.
pub fn fragment(packet: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, MarshalError> {
    if packet.len() < MIN_PACKET_LENGTH {
        return Err(MarshalError::Underflow);
    }
    let mtu = mtu.max(MIN_UDP_MTU.min(packet.len()));
    if packet.len() <= mtu {
        return Ok(vec![packet.to_vec()]);
    }

    let chunk = mtu - FRAGMENT_HEADER_SIZE;
    let remaining = packet.len() - mtu;
    let continuations = remaining.div_ceil(chunk);
    let total = continuations + 1;
    if total > MAX_FRAGMENTS {
        return Err(MarshalError::Overflow);
    }

    let mut out = Vec::with_capacity(total);
    let mut head = packet[..mtu].to_vec();
    head[PACKET_FLAGS_INDEX] |= FLAG_FRAGMENTED;
    out.push(head);

    let hops = packet[PACKET_FLAGS_INDEX] & 0x07;
    for (i, piece) in packet[mtu..].chunks(chunk).enumerate() {
        let mut frag = Vec::with_capacity(FRAGMENT_HEADER_SIZE + piece.len());
        frag.extend_from_slice(&packet[0..8]); // packet ID
        frag.extend_from_slice(&packet[PACKET_DEST_INDEX..PACKET_DEST_INDEX + 5]);
        frag.push(FRAGMENT_INDICATOR);
        frag.push(((total as u8) << 4) | ((i + 1) as u8));
        frag.push(hops);
        frag.extend_from_slice(piece);
        out.push(frag);
    }
    Ok(out)
}

struct PartialAssembly {
    head: Option<Vec<u8>>,
    /// Continuation payloads indexed 1..total (slot 0 unused).
    pieces: Vec<Option<Vec<u8>>>,
    total: Option<usize>,
    first_seen: i64,
}

impl PartialAssembly {
    fn new(clock: i64) -> Self {
        PartialAssembly {
            head: None,
            pieces: vec![None; MAX_FRAGMENTS],
            total: None,
            first_seen: clock,
        }
    }

    fn complete(&self) -> bool {
        let total = match self.total {
            Some(t) => t,
            None => return false,
        };
        self.head.is_some() && (1..total).all(|i| self.pieces[i].is_some())
    }

    fn assemble(mut self) -> Vec<u8> {
        let total = self.total.unwrap_or(1);
        let mut out = self.head.take().unwrap_or_default();
        // The head keeps its fragmented flag; dispatch ignores it once
        // the packet is whole.
        for i in 1..total {
            if let Some(p) = self.pieces[i].take() {
                out.extend_from_slice(&p);
            }
        }
        out
    }
}

/// What feeding one datagram into the reassembly table produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// A whole packet is ready for dispatch.
    Complete(Vec<u8>),
    /// Stored; more fragments are needed.
    Pending,
    /// Structurally invalid fragment, dropped.
    Invalid,
}

/// Reassembly buffers keyed by (source socket address, packet ID),
/// evicted LRU under pressure and garbage collected after
/// `FRAGMENT_TIMEOUT_MS`. Keying on the source keeps an unrelated
/// remote that reuses a packet ID from touching another source's
/// in-flight assembly.
pub struct ReassemblyTable {
    partial: LruCache<(SocketAddr, u64), PartialAssembly>,
}

impl ReassemblyTable {
    pub fn new(capacity: usize) -> Self {
        ReassemblyTable {
            partial: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Feed the head packet of a fragmented series (fragmented flag
    /// set, full VL1 header) as received from `remote`.
    pub fn add_head(&mut self, clock: i64, remote: SocketAddr, packet: &[u8]) -> ReassemblyOutcome {
        if packet.len() < MIN_PACKET_LENGTH {
            return ReassemblyOutcome::Invalid;
        }
        let key = (remote, packet_id(packet));
        let entry = self
            .partial
            .get_or_insert_mut(key, || PartialAssembly::new(clock));
        entry.head = Some(packet.to_vec());
        self.finish(key)
    }

    /// Feed a continuation fragment (0xff indicator layout) as
    /// received from `remote`.
    pub fn add_fragment(&mut self, clock: i64, remote: SocketAddr, frag: &[u8]) -> ReassemblyOutcome {
        if frag.len() <= FRAGMENT_HEADER_SIZE || frag[FRAGMENT_INDICATOR_INDEX] != FRAGMENT_INDICATOR
        {
            return ReassemblyOutcome::Invalid;
        }
        let total = (frag[14] >> 4) as usize;
        let index = (frag[14] & 0x0f) as usize;
        if total > MAX_FRAGMENTS || index == 0 || index >= total {
            return ReassemblyOutcome::Invalid;
        }

        let key = (remote, packet_id(frag));
        let entry = self
            .partial
            .get_or_insert_mut(key, || PartialAssembly::new(clock));
        match entry.total {
            Some(t) if t != total => return ReassemblyOutcome::Invalid,
            _ => entry.total = Some(total),
        }
        entry.pieces[index] = Some(frag[FRAGMENT_HEADER_SIZE..].to_vec());
        self.finish(key)
    }

    fn finish(&mut self, key: (SocketAddr, u64)) -> ReassemblyOutcome {
        if self.partial.peek(&key).map(|e| e.complete()).unwrap_or(false) {
            let entry = self.partial.pop(&key).unwrap();
            ReassemblyOutcome::Complete(entry.assemble())
        } else {
            ReassemblyOutcome::Pending
        }
    }

    /// Drop partial assemblies older than the timeout. Returns how
    /// many were evicted.
    pub fn gc(&mut self, clock: i64) -> usize {
        let stale: Vec<(SocketAddr, u64)> = self
            .partial
            .iter()
            .filter(|(_, e)| clock - e.first_seen > FRAGMENT_TIMEOUT_MS)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            self.partial.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;

    fn addr(v: u64) -> Address {
        Address::from_u64(v).unwrap()
    }

    fn remote() -> SocketAddr {
        "203.0.113.5:9993".parse().unwrap()
    }

    fn build_test_packet(payload_len: usize, cipher: CipherSuite) -> (Vec<u8>, [u8; 32]) {
        let pool = BufferPool::new(2);
        let mut buf = pool.get();
        let key = [0x42u8; 32];
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        build(
            &mut buf,
            0x1111_2222_3333_4444,
            addr(0x0102030405),
            addr(0x0a0b0c0d0e),
            cipher,
            &key,
            Verb::UserMessage,
            &payload,
        )
        .unwrap();
        (buf.as_slice().to_vec(), key)
    }

    #[test]
    fn build_parse_dearmor_round_trip() {
        let (packet, key) = build_test_packet(100, CipherSuite::Poly1305Salsa2012);
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.packet_id, 0x1111_2222_3333_4444);
        assert_eq!(header.dest, addr(0x0102030405));
        assert_eq!(header.source, addr(0x0a0b0c0d0e));
        assert_eq!(header.hops, 0);
        assert_eq!(header.cipher, CipherSuite::Poly1305Salsa2012 as u8);

        let mut work = packet.clone();
        let hit = dearmor_in_place(&mut work, CipherSuite::Poly1305Salsa2012, &[[0u8; 32], key]);
        assert_eq!(hit, Some(1), "second candidate key verifies");
        assert_eq!(work[PACKET_VERB_INDEX], Verb::UserMessage as u8);
        assert_eq!(work[PAYLOAD_START + 1], 0, "payload deciphered");

        let mut work = packet;
        assert_eq!(
            dearmor_in_place(&mut work, CipherSuite::Poly1305Salsa2012, &[[9u8; 32]]),
            None
        );
    }

    #[test]
    fn hop_increment_stops_at_limit() {
        let (mut packet, key) = build_test_packet(10, CipherSuite::Poly1305Salsa2012);
        for expect in 1..=MAX_HOPS {
            assert_eq!(increment_hops(&mut packet), Some(expect));
        }
        assert_eq!(increment_hops(&mut packet), None);

        // Hop changes do not break the MAC.
        let hit = dearmor_in_place(&mut packet, CipherSuite::Poly1305Salsa2012, &[key]);
        assert_eq!(hit, Some(0));
    }

    #[test]
    fn small_packet_is_not_fragmented() {
        let (packet, _) = build_test_packet(100, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0], packet);
        assert_eq!(frags[0][PACKET_FLAGS_INDEX] & FLAG_FRAGMENTED, 0);
    }

    #[test]
    fn fragmentation_reassembly_any_order() {
        let (packet, _) = build_test_packet(3000, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();
        assert_eq!(frags.len(), 3);
        assert!(frags[0][PACKET_FLAGS_INDEX] & FLAG_FRAGMENTED != 0);
        assert!(is_fragment(&frags[1]));
        assert!(is_fragment(&frags[2]));

        // Every delivery order yields the same reassembled packet,
        // exactly once.
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut table = ReassemblyTable::new(8);
            let mut completions = 0;
            let mut assembled = Vec::new();
            for &i in &order {
                let outcome = if is_fragment(&frags[i]) {
                    table.add_fragment(0, remote(), &frags[i])
                } else {
                    table.add_head(0, remote(), &frags[i])
                };
                match outcome {
                    ReassemblyOutcome::Complete(p) => {
                        completions += 1;
                        assembled = p;
                    }
                    ReassemblyOutcome::Pending => {}
                    ReassemblyOutcome::Invalid => panic!("valid fragment rejected"),
                }
            }
            assert_eq!(completions, 1, "order {:?}", order);
            // The head carries the fragmented flag; the rest of the
            // bytes must match the original exactly.
            let mut expect = packet.clone();
            expect[PACKET_FLAGS_INDEX] |= FLAG_FRAGMENTED;
            assert_eq!(assembled, expect);
            assert!(table.is_empty());
        }
    }

    #[test]
    fn reassembly_times_out() {
        let (packet, _) = build_test_packet(3000, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();

        let mut table = ReassemblyTable::new(8);
        assert_eq!(
            table.add_fragment(0, remote(), &frags[1]),
            ReassemblyOutcome::Pending
        );
        assert_eq!(table.gc(FRAGMENT_TIMEOUT_MS), 0);
        assert_eq!(table.gc(FRAGMENT_TIMEOUT_MS + 1), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn reassembly_rejects_malformed_fragments() {
        let mut table = ReassemblyTable::new(8);
        assert_eq!(
            table.add_fragment(0, remote(), &[0u8; 4]),
            ReassemblyOutcome::Invalid
        );

        let (packet, _) = build_test_packet(3000, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();

        // Index zero and index >= total are invalid.
        let mut bad = frags[1].clone();
        bad[14] = (3 << 4) | 0;
        assert_eq!(table.add_fragment(0, remote(), &bad), ReassemblyOutcome::Invalid);
        let mut bad = frags[1].clone();
        bad[14] = (3 << 4) | 3;
        assert_eq!(table.add_fragment(0, remote(), &bad), ReassemblyOutcome::Invalid);
    }

    #[test]
    fn lru_pressure_evicts_partials() {
        let (packet, _) = build_test_packet(3000, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();

        let mut table = ReassemblyTable::new(2);
        table.add_fragment(0, remote(), &frags[1]);
        // Two unrelated partials push the first out.
        for id in [7u64, 9u64] {
            let mut other = frags[1].clone();
            other[0..8].copy_from_slice(&id.to_be_bytes());
            table.add_fragment(0, remote(), &other);
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sources_sharing_a_packet_id_do_not_collide() {
        let (packet, _) = build_test_packet(3000, CipherSuite::Poly1305Salsa2012);
        let frags = fragment(&packet, DEFAULT_UDP_MTU).unwrap();
        let other_remote: SocketAddr = "198.51.100.9:9993".parse().unwrap();

        // The legitimate source delivers everything but one fragment.
        let mut table = ReassemblyTable::new(8);
        assert_eq!(
            table.add_head(0, remote(), &frags[0]),
            ReassemblyOutcome::Pending
        );
        assert_eq!(
            table.add_fragment(0, remote(), &frags[1]),
            ReassemblyOutcome::Pending
        );

        // A different remote racing the same packet ID builds its own
        // assembly; it must neither complete ours nor corrupt it.
        assert_eq!(
            table.add_fragment(0, other_remote, &frags[2]),
            ReassemblyOutcome::Pending
        );
        assert_eq!(table.len(), 2, "two independent partial assemblies");

        // Only the real source's final fragment completes the packet.
        let outcome = table.add_fragment(0, remote(), &frags[2]);
        let mut expect = packet.clone();
        expect[PACKET_FLAGS_INDEX] |= FLAG_FRAGMENTED;
        assert_eq!(outcome, ReassemblyOutcome::Complete(expect));
        assert_eq!(table.len(), 1, "the imposter's partial remains isolated");
    }

    #[test]
    fn oversized_packet_fails_fragmentation() {
        // More bytes than sixteen minimum-MTU fragments can carry.
        let too_big = vec![0u8; MIN_UDP_MTU + 15 * (MIN_UDP_MTU - FRAGMENT_HEADER_SIZE) + 1];
        assert_eq!(fragment(&too_big, MIN_UDP_MTU), Err(MarshalError::Overflow));
    }
}
