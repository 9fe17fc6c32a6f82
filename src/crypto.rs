//! # Cryptographic Infrastructure
//!
//! Primitives shared by the identity, transport, and credential layers:
//!
//! - **Digests**: SHA-384 (fingerprints, serials) and SHA-512 (key
//!   derivation, address work function)
//! - **Packet armor**: Salsa20/12 + Poly1305 with an 8-byte wire MAC,
//!   keyed per packet by the 64-bit packet ID
//! - **Session keys**: HKDF-SHA384 over the long-term identity
//!   agreement, salted with per-session nonces
//! - **Address work function**: the memory-hard digest that makes bulk
//!   identity generation expensive
//!
//! Signature generation and verification live with [`crate::identity`]
//! because the algorithm depends on the identity kind. Everything here
//! is deterministic given its inputs; no function reads a clock or an
//! ambient RNG.

use hkdf::Hkdf;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::{Salsa12, Salsa20};
use sha2::{Digest, Sha384, Sha512};
use subtle::ConstantTimeEq;

/// Error type for signature verification failures, shared by every
/// signed object in the crate (identities, locators, certificates,
/// credentials, network configs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has the wrong length for the signer's identity kind.
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key material is not a valid curve point.
    InvalidPublicKey,
    /// Signing was requested but no private key is present.
    NoPrivateKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::NoPrivateKey => write!(f, "identity has no private key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Size of the truncated Poly1305 MAC carried in the packet header.
pub const WIRE_MAC_SIZE: usize = 8;

/// Size of the memory-hard work buffer (2 MiB). Large enough to defeat
/// small-cache shortcuts, small enough to allocate per candidate.
pub const WORK_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// The work buffer for the address derivation function could not be
/// allocated. Maps to `ResultCode::FatalOutOfMemory` at the API edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkBufferError;

impl std::fmt::Display for WorkBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to allocate address derivation work buffer")
    }
}

impl std::error::Error for WorkBufferError {}

#[inline]
pub fn sha384(data: &[u8]) -> [u8; 48] {
    let mut out = [0u8; 48];
    out.copy_from_slice(&Sha384::digest(data));
    out
}

#[inline]
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Constant-time equality over byte slices of equal length.
#[inline]
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

// ---------------------------------------------------------------------------
// Memory-hard address work function.
// ---------------------------------------------------------------------------

/// Compute the memory-hard digest of `input` (an identity's public key
/// bundle).
///
/// SHA-512 seeds a Salsa20/20 keystream that fills a 2 MiB work
/// buffer; a data-dependent mixing pass then walks every 64-bit word,
/// replacing it with a word chosen by the running accumulator, so the
/// whole buffer must be resident for the final digest to be
/// computable. The result feeds the address work condition in
/// `identity`.
///
/// Fails only if the work buffer cannot be allocated.
pub fn memory_hard_digest(input: &[u8]) -> Result<[u8; 64], WorkBufferError> {
    let seed = sha512(input);

    let mut key = [0u8; 32];
    key.copy_from_slice(&seed[..32]);
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&seed[32..40]);

    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(WORK_BUFFER_SIZE)
        .map_err(|_| WorkBufferError)?;
    buf.resize(WORK_BUFFER_SIZE, 0);

    let mut cipher = Salsa20::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);

    // Data-dependent mixing pass over 64-bit words.
    let words = WORK_BUFFER_SIZE / 8;
    let mut acc = u64::from_be_bytes(seed[40..48].try_into().unwrap());
    for i in 0..words {
        let a = i * 8;
        let w = u64::from_be_bytes(buf[a..a + 8].try_into().unwrap());
        let j = ((acc ^ w) as usize % words) * 8;
        let other = u64::from_be_bytes(buf[j..j + 8].try_into().unwrap());
        acc = acc.wrapping_add(other).rotate_left(9) ^ w;
        buf[a..a + 8].copy_from_slice(&other.to_be_bytes());
        buf[j..j + 8].copy_from_slice(&acc.to_be_bytes());
    }

    let mut h = Sha512::new();
    h.update(seed);
    h.update(&buf);
    let mut out = [0u8; 64];
    out.copy_from_slice(&h.finalize());
    Ok(out)
}

// ---------------------------------------------------------------------------
// Packet armor: Salsa20/12 + Poly1305.
// ---------------------------------------------------------------------------

/// Set up the per-packet keystream and return the Poly1305 one-time
/// key. The first 32 keystream bytes become the MAC key and the next
/// 32 are discarded; payload bytes are enciphered from offset 64 on.
fn packet_keystream(key: &[u8; 32], packet_id: u64) -> (Poly1305, Salsa12) {
    let nonce = packet_id.to_be_bytes();
    let mut ks = Salsa12::new(key.into(), (&nonce).into());

    let mut mac_key = [0u8; 32];
    ks.apply_keystream(&mut mac_key);
    let mut discard = [0u8; 32];
    ks.apply_keystream(&mut discard);

    (Poly1305::new((&mac_key).into()), ks)
}

/// Armor an outbound payload in place. When `encrypt` is set the
/// payload is enciphered first; the MAC always covers the bytes that
/// will appear on the wire. Returns the 8-byte wire MAC.
pub fn armor(key: &[u8; 32], packet_id: u64, payload: &mut [u8], encrypt: bool) -> [u8; 8] {
    let (poly, mut ks) = packet_keystream(key, packet_id);
    if encrypt {
        ks.apply_keystream(payload);
    }
    let tag = poly.compute_unpadded(payload);
    let mut mac = [0u8; 8];
    mac.copy_from_slice(&tag[..8]);
    mac
}

/// Verify and (when `encrypted`) decipher an inbound payload in place.
/// The MAC comparison is constant-time. Returns false on MAC mismatch,
/// leaving the payload untouched.
pub fn dearmor(
    key: &[u8; 32],
    packet_id: u64,
    payload: &mut [u8],
    mac: &[u8; 8],
    encrypted: bool,
) -> bool {
    let (poly, mut ks) = packet_keystream(key, packet_id);
    let tag = poly.compute_unpadded(payload);
    if !secure_eq(&tag[..8], mac) {
        return false;
    }
    if encrypted {
        ks.apply_keystream(payload);
    }
    true
}

// ---------------------------------------------------------------------------
// Session key schedule.
// ---------------------------------------------------------------------------

/// Directional session keys derived from a HELLO exchange. `i2r`
/// protects traffic from the HELLO initiator to the responder, `r2i`
/// the reverse.
#[derive(Clone)]
pub struct SessionKeyPair {
    pub i2r: [u8; 32],
    pub r2i: [u8; 32],
}

const SESSION_INFO_I2R: &[u8] = b"weft-vl1-session-i2r";
const SESSION_INFO_R2I: &[u8] = b"weft-vl1-session-r2i";

/// Derive the per-direction session keys for one HELLO exchange.
///
/// Both sides call this with the same argument order: the nonce minted
/// by the HELLO initiator first, then the responder's nonce from
/// OK(HELLO). Keys expire after `SESSION_KEY_LIFETIME_MS`; a fresh
/// HELLO exchange renews them.
pub fn derive_session_keys(
    static_key: &[u8; 32],
    initiator_nonce: &[u8; 16],
    responder_nonce: &[u8; 16],
) -> SessionKeyPair {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(initiator_nonce);
    salt[16..].copy_from_slice(responder_nonce);

    let hk = Hkdf::<Sha384>::new(Some(&salt), static_key);
    let mut i2r = [0u8; 32];
    let mut r2i = [0u8; 32];
    // expand() only fails for absurd output lengths; 32 is fine.
    hk.expand(SESSION_INFO_I2R, &mut i2r).unwrap();
    hk.expand(SESSION_INFO_R2I, &mut r2i).unwrap();

    SessionKeyPair { i2r, r2i }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_helpers_have_expected_sizes() {
        assert_eq!(sha384(b"zt").len(), 48);
        assert_eq!(sha512(b"zt").len(), 64);
        assert_ne!(sha384(b"a"), sha384(b"b"));
    }

    #[test]
    fn secure_eq_basics() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"abcd"));
        assert!(secure_eq(b"", b""));
    }

    #[test]
    fn memory_hard_digest_is_deterministic() {
        let a = memory_hard_digest(b"some public key material").unwrap();
        let b = memory_hard_digest(b"some public key material").unwrap();
        let c = memory_hard_digest(b"other public key material").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn armor_round_trip_encrypted() {
        let key = [7u8; 32];
        let original = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut payload = original.clone();

        let mac = armor(&key, 0x0123_4567_89ab_cdef, &mut payload, true);
        assert_ne!(payload, original, "payload must be enciphered");

        assert!(dearmor(
            &key,
            0x0123_4567_89ab_cdef,
            &mut payload,
            &mac,
            true
        ));
        assert_eq!(payload, original);
    }

    #[test]
    fn armor_round_trip_plaintext() {
        let key = [9u8; 32];
        let original = b"hello payload".to_vec();
        let mut payload = original.clone();

        let mac = armor(&key, 42, &mut payload, false);
        assert_eq!(payload, original, "cipher none leaves payload readable");
        assert!(dearmor(&key, 42, &mut payload, &mac, false));
    }

    #[test]
    fn dearmor_rejects_wrong_key_id_or_mac() {
        let key = [1u8; 32];
        let mut payload = b"payload".to_vec();
        let mac = armor(&key, 7, &mut payload, true);

        let mut p = payload.clone();
        assert!(!dearmor(&[2u8; 32], 7, &mut p, &mac, true), "wrong key");

        let mut p = payload.clone();
        assert!(!dearmor(&key, 8, &mut p, &mac, true), "wrong packet id");

        let mut bad_mac = mac;
        bad_mac[0] ^= 1;
        let mut p = payload.clone();
        assert!(!dearmor(&key, 7, &mut p, &bad_mac, true), "flipped mac");

        let mut p = payload;
        p[0] ^= 1;
        assert!(!dearmor(&key, 7, &mut p, &mac, true), "tampered payload");
    }

    #[test]
    fn session_keys_are_directional_and_shared() {
        let static_key = [3u8; 32];
        let a = derive_session_keys(&static_key, &[1u8; 16], &[2u8; 16]);
        let b = derive_session_keys(&static_key, &[1u8; 16], &[2u8; 16]);
        assert_eq!(a.i2r, b.i2r);
        assert_eq!(a.r2i, b.r2i);
        assert_ne!(a.i2r, a.r2i, "directions must not share a key");

        let c = derive_session_keys(&static_key, &[9u8; 16], &[2u8; 16]);
        assert_ne!(a.i2r, c.i2r, "nonce change must change keys");
    }
}
