//! Wire protocol constants shared by the VL1 transport and its peers.
//!
//! The byte-level layout of packets and fragments is normative for
//! interoperability; nothing in here may change without a protocol
//! version bump. Verb numbers, cipher suite selectors, and the header
//! offsets below are exactly the deployed encoding.

/// VL1 protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 11;

/// Default primary UDP port for nodes.
pub const DEFAULT_PORT: u16 = 9993;

/// Size of a pooled I/O buffer; also the hard ceiling on any packet
/// the core will construct or accept.
pub const BUF_SIZE: usize = 16384;

/// Minimum allowed physical UDP MTU; smaller values are clipped up.
pub const MIN_UDP_MTU: usize = 1400;

/// Default physical UDP payload, excluding IP/UDP overhead.
pub const DEFAULT_UDP_MTU: usize = 1432;

/// Minimum and maximum Ethernet MTU permitted on virtual networks.
pub const MIN_VIRTUAL_MTU: usize = 1280;
pub const MAX_VIRTUAL_MTU: usize = 10000;

/// Maximum hop count; packets at this count are never relayed further.
pub const MAX_HOPS: u8 = 7;

// ---------------------------------------------------------------------------
// Packet header layout.
//
// [0..8]   packet ID (big-endian u64, doubles as the cipher nonce)
// [8..13]  destination address (40 bits)
// [13..18] source address (40 bits)
// [18]     flags (bits 6-7) | cipher (bits 3-5) | hops (bits 0-2)
// [19..27] MAC (8 bytes)
// [27..]   armored payload, first byte is the verb
// ---------------------------------------------------------------------------

pub const PACKET_ID_INDEX: usize = 0;
pub const PACKET_DEST_INDEX: usize = 8;
pub const PACKET_SOURCE_INDEX: usize = 13;
pub const PACKET_FLAGS_INDEX: usize = 18;
pub const PACKET_MAC_INDEX: usize = 19;
pub const PACKET_VERB_INDEX: usize = 27;

/// Minimum length of a full (non-fragment) packet: header plus verb.
pub const MIN_PACKET_LENGTH: usize = 28;

/// Byte offset where the armored region (verb + payload) begins.
pub const PAYLOAD_START: usize = PACKET_VERB_INDEX;

// ---------------------------------------------------------------------------
// Fragment layout.
//
// [0..8]   packet ID of the packet this fragment belongs to
// [8..13]  destination address
// [13]     0xff fragment indicator (never a valid source address byte)
// [14]     total fragments (high nibble) | fragment index (low nibble)
// [15]     hops
// [16..]   fragment payload
// ---------------------------------------------------------------------------

pub const FRAGMENT_INDICATOR: u8 = 0xff;
pub const FRAGMENT_INDICATOR_INDEX: usize = 13;
pub const FRAGMENT_HEADER_SIZE: usize = 16;
pub const MAX_FRAGMENTS: usize = 16;

/// How long a partial reassembly may wait for its missing fragments.
pub const FRAGMENT_TIMEOUT_MS: i64 = 500;

/// Cipher suite selectors (header bits 3-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Poly1305 authentication only; payload travels in the clear.
    /// Used for HELLO so that identity exchange can bootstrap a peer.
    Poly1305None = 0,
    /// Salsa20/12 encryption with Poly1305 authentication.
    Poly1305Salsa2012 = 1,
    /// AES-GMAC-SIV. Recognized on the wire but not processed; see the
    /// deployed-encoding note in the top-level design document.
    AesGmacSiv = 3,
}

impl CipherSuite {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(CipherSuite::Poly1305None),
            1 => Some(CipherSuite::Poly1305Salsa2012),
            3 => Some(CipherSuite::AesGmacSiv),
            _ => None,
        }
    }
}

/// VL1 verbs. Numbers are stable wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkConfigRequest = 0x0b,
    NetworkConfig = 0x0c,
    MulticastFrame = 0x0e,
    UserMessage = 0x14,
}

impl Verb {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v & 0x1f {
            0x00 => Some(Verb::Nop),
            0x01 => Some(Verb::Hello),
            0x02 => Some(Verb::Error),
            0x03 => Some(Verb::Ok),
            0x04 => Some(Verb::Whois),
            0x05 => Some(Verb::Rendezvous),
            0x06 => Some(Verb::Frame),
            0x07 => Some(Verb::ExtFrame),
            0x08 => Some(Verb::Echo),
            0x09 => Some(Verb::MulticastLike),
            0x0b => Some(Verb::NetworkConfigRequest),
            0x0c => Some(Verb::NetworkConfig),
            0x0e => Some(Verb::MulticastFrame),
            0x14 => Some(Verb::UserMessage),
            _ => None,
        }
    }
}

/// In-band error codes carried by the ERROR verb.
pub const ERROR_NONE: u8 = 0x00;
pub const ERROR_INVALID_REQUEST: u8 = 0x01;
pub const ERROR_BAD_PROTOCOL_VERSION: u8 = 0x02;
pub const ERROR_OBJ_NOT_FOUND: u8 = 0x03;
pub const ERROR_UNSUPPORTED_OPERATION: u8 = 0x05;
pub const ERROR_NEED_MEMBERSHIP_CERTIFICATE: u8 = 0x06;
pub const ERROR_NETWORK_ACCESS_DENIED: u8 = 0x07;

// ---------------------------------------------------------------------------
// Timing and structural limits.
// ---------------------------------------------------------------------------

/// A path is alive if it received anything within this window.
pub const PATH_ALIVE_TIMEOUT_MS: i64 = 60_000;

/// Paths silent for this long are forgotten entirely.
pub const PATH_EXPIRATION_MS: i64 = 300_000;

/// Keep-alive HELLO cadence on a peer's preferred path.
pub const PEER_HELLO_INTERVAL_MS: i64 = 60_000;

/// Session keys are renegotiated after this long.
pub const SESSION_KEY_LIFETIME_MS: i64 = 3_600_000;

/// Control verbs that expect replies retry with exponential backoff
/// starting here, at most `CONTROL_RETRY_LIMIT` times.
pub const CONTROL_RETRY_BASE_MS: i64 = 1_000;
pub const CONTROL_RETRY_LIMIT: u32 = 3;

/// Network config request timeout before a re-request.
pub const NETWORK_CONFIG_REQUEST_TIMEOUT_MS: i64 = 30_000;

/// Maximum direct paths tracked per peer.
pub const MAX_PEER_PATHS: usize = 16;

/// Maximum endpoints in a locator.
pub const MAX_LOCATOR_ENDPOINTS: usize = 8;

/// Per-source cap on packets parked awaiting WHOIS resolution.
pub const WHOIS_PARK_QUEUE_LIMIT: usize = 32;

/// Structural limits on network configuration contents.
pub const MAX_NETWORK_RULES: usize = 1024;
pub const MAX_CAPABILITY_RULES: usize = 64;
pub const MAX_NETWORK_CAPABILITIES: usize = 128;
pub const MAX_NETWORK_TAGS: usize = 128;
pub const MAX_CERTIFICATES_OF_OWNERSHIP: usize = 4;
pub const MAX_ASSIGNED_ADDRESSES: usize = 32;
pub const MAX_NETWORK_ROUTES: usize = 64;

/// Maximum length of string fields in certificates.
pub const CERTIFICATE_MAX_STRING_LENGTH: usize = 127;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_round_trip() {
        for v in [
            Verb::Nop,
            Verb::Hello,
            Verb::Error,
            Verb::Ok,
            Verb::Whois,
            Verb::Rendezvous,
            Verb::Frame,
            Verb::ExtFrame,
            Verb::Echo,
            Verb::MulticastLike,
            Verb::NetworkConfigRequest,
            Verb::NetworkConfig,
            Verb::MulticastFrame,
            Verb::UserMessage,
        ] {
            assert_eq!(Verb::from_u8(v as u8), Some(v));
        }
        assert_eq!(Verb::from_u8(0x1f), None);
    }

    #[test]
    fn cipher_suite_bits() {
        assert_eq!(CipherSuite::from_bits(0), Some(CipherSuite::Poly1305None));
        assert_eq!(
            CipherSuite::from_bits(1),
            Some(CipherSuite::Poly1305Salsa2012)
        );
        assert_eq!(CipherSuite::from_bits(3), Some(CipherSuite::AesGmacSiv));
        assert_eq!(CipherSuite::from_bits(2), None);
        assert_eq!(CipherSuite::from_bits(7), None);
    }

    #[test]
    fn header_layout_is_contiguous() {
        assert_eq!(PACKET_DEST_INDEX, PACKET_ID_INDEX + 8);
        assert_eq!(PACKET_SOURCE_INDEX, PACKET_DEST_INDEX + 5);
        assert_eq!(PACKET_FLAGS_INDEX, PACKET_SOURCE_INDEX + 5);
        assert_eq!(PACKET_MAC_INDEX, PACKET_FLAGS_INDEX + 1);
        assert_eq!(PACKET_VERB_INDEX, PACKET_MAC_INDEX + 8);
        assert_eq!(MIN_PACKET_LENGTH, PACKET_VERB_INDEX + 1);
    }
}
