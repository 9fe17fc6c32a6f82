//! # Identities and Addresses
//!
//! This module defines the node identity model:
//!
//! - [`Address`]: 40-bit node address, derived from the public keys via
//!   a memory-hard work function
//! - [`Identity`]: address plus public keys (and optionally the
//!   matching private keys)
//! - [`Fingerprint`]: address plus SHA-384 of the public key bundle
//!
//! ## Identity Model
//!
//! An identity is self-certifying: the address is a function of the
//! public keys, so presenting keys that hash to a claimed address
//! proves ownership of that address without any registry. Deriving the
//! digest is deliberately memory-hard so that grinding out many
//! identities (to squat addresses or flood peers) is expensive, while
//! verification is a single digest computation.
//!
//! Two identity kinds exist on the wire: `C25519` (an x25519 agreement
//! key plus an Ed25519 signing key) and `P384`, which extends the
//! C25519 bundle with NIST P-384 ECDH and ECDSA keys. P384 identities
//! sign with both algorithms; verifiers require both signatures to
//! check out.
//!
//! Identities are immutable after construction. Equality and hashing
//! consider only the public half, so an identity with private keys
//! compares equal to its public projection.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use p384::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{self, memory_hard_digest, SignatureError, WorkBufferError};
use crate::error::MarshalError;

/// Addresses whose first byte is this value are reserved and never
/// assigned; the fragment indicator in the packet header relies on it.
pub const RESERVED_ADDRESS_PREFIX: u8 = 0xff;

/// The memory-hard digest's first byte must be below this threshold
/// for the candidate keys to yield a valid address. Under test the
/// threshold is relaxed so identity generation is instant; validation
/// logic is identical either way.
#[cfg(not(test))]
pub const ADDRESS_WORK_THRESHOLD: u8 = 17;
#[cfg(test)]
pub const ADDRESS_WORK_THRESHOLD: u8 = 255;

/// Ed25519 signature size; C25519 identities sign exactly this.
pub const C25519_SIGNATURE_SIZE: usize = 64;

/// P-384 ECDSA fixed signature size (r || s).
pub const P384_SIGNATURE_SIZE: usize = 96;

/// P384 identities emit Ed25519 || ECDSA-P384.
pub const DUAL_SIGNATURE_SIZE: usize = C25519_SIGNATURE_SIZE + P384_SIGNATURE_SIZE;

const P384_PUBLIC_SIZE: usize = 49; // compressed SEC1
const P384_SECRET_SIZE: usize = 48;

/// 40-bit node address. The canonical text form is ten hex digits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    /// Construct from a raw value, masking to 40 bits. Returns `None`
    /// for the zero address or the reserved 0xff prefix.
    pub fn from_u64(v: u64) -> Option<Self> {
        let v = v & 0xff_ffff_ffff;
        let a = Address(v);
        if a.is_reserved() {
            None
        } else {
            Some(a)
        }
    }

    pub fn from_bytes(b: &[u8; 5]) -> Option<Self> {
        let mut v = 0u64;
        for byte in b {
            v = (v << 8) | u64::from(*byte);
        }
        Self::from_u64(v)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 5] {
        let v = self.0;
        [
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// True for addresses that may never be assigned to a node.
    #[inline]
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) as u8 == RESERVED_ADDRESS_PREFIX
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 10 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().and_then(Self::from_u64)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

/// Address plus SHA-384 of the public key bundle. This is the compact,
/// collision-resistant way to name an identity in certificates and
/// endpoints without embedding the full key material.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub address: Address,
    pub hash: [u8; 48],
}

impl Fingerprint {
    pub const MARSHAL_SIZE: usize = 5 + 48;

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_bytes());
        out.extend_from_slice(&self.hash);
    }

    pub fn unmarshal(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        if b.len() < Self::MARSHAL_SIZE {
            return Err(MarshalError::Underflow);
        }
        let address = Address::from_bytes(&b[0..5].try_into().unwrap())
            .ok_or(MarshalError::InvalidField)?;
        let mut hash = [0u8; 48];
        hash.copy_from_slice(&b[5..53]);
        Ok((Fingerprint { address, hash }, Self::MARSHAL_SIZE))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.address, hex::encode(self.hash))
    }
}

// The 48-byte hash is longer than serde's derived array support, so
// fingerprints serialize as (address, hash bytes).
impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut t = serializer.serialize_tuple(2)?;
        t.serialize_element(&self.address)?;
        t.serialize_element(&self.hash[..])?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (address, bytes): (Address, Vec<u8>) = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 48 {
            return Err(serde::de::Error::invalid_length(bytes.len(), &"48 bytes"));
        }
        let mut hash = [0u8; 48];
        hash.copy_from_slice(&bytes);
        Ok(Fingerprint { address, hash })
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({}-{})", self.address, hex::encode(&self.hash[..8]))
    }
}

/// Identity key algorithm families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdentityKind {
    C25519 = 0,
    P384 = 1,
}

impl IdentityKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(IdentityKind::C25519),
            1 => Some(IdentityKind::P384),
            _ => None,
        }
    }
}

/// Private key bundle. Zeroized on drop.
#[derive(Clone)]
struct IdentitySecret {
    x25519: [u8; 32],
    ed25519: [u8; 32],
    p384_ecdh: Option<[u8; P384_SECRET_SIZE]>,
    p384_ecdsa: Option<[u8; P384_SECRET_SIZE]>,
}

impl Drop for IdentitySecret {
    fn drop(&mut self) {
        self.x25519.zeroize();
        self.ed25519.zeroize();
        if let Some(k) = self.p384_ecdh.as_mut() {
            k.zeroize();
        }
        if let Some(k) = self.p384_ecdsa.as_mut() {
            k.zeroize();
        }
    }
}

/// A node identity: 40-bit address, public keys, optionally the
/// matching private keys.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    kind: IdentityKind,
    x25519: [u8; 32],
    ed25519: [u8; 32],
    p384_ecdh: Option<[u8; P384_PUBLIC_SIZE]>,
    p384_ecdsa: Option<[u8; P384_PUBLIC_SIZE]>,
    secret: Option<IdentitySecret>,
}

impl Identity {
    /// Generate a fresh identity of the requested kind.
    ///
    /// Samples candidate key bundles until the memory-hard digest
    /// satisfies the work condition and the derived address is not
    /// reserved. Wall time is sub-second to a few seconds depending on
    /// luck and hardware.
    ///
    /// # Errors
    /// Fails only if the work buffer cannot be allocated.
    pub fn generate(kind: IdentityKind) -> Result<Self, WorkBufferError> {
        loop {
            let x25519_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
            let ed25519_secret = SigningKey::generate(&mut OsRng);

            let (p384_ecdh_secret, p384_ecdsa_secret) = match kind {
                IdentityKind::C25519 => (None, None),
                IdentityKind::P384 => (
                    Some(p384::SecretKey::random(&mut OsRng)),
                    Some(p384::SecretKey::random(&mut OsRng)),
                ),
            };

            let x25519_pub = x25519_dalek::PublicKey::from(&x25519_secret).to_bytes();
            let ed25519_pub = ed25519_secret.verifying_key().to_bytes();
            let p384_ecdh_pub = p384_ecdh_secret.as_ref().map(compressed_public);
            let p384_ecdsa_pub = p384_ecdsa_secret.as_ref().map(compressed_public);

            let bundle = public_bundle(kind, &x25519_pub, &ed25519_pub, p384_ecdh_pub.as_ref(), p384_ecdsa_pub.as_ref());
            let digest = memory_hard_digest(&bundle)?;

            if digest[0] >= ADDRESS_WORK_THRESHOLD {
                continue;
            }
            let addr_bytes: [u8; 5] = digest[59..64].try_into().unwrap();
            let address = match Address::from_bytes(&addr_bytes) {
                Some(a) => a,
                None => continue,
            };

            return Ok(Identity {
                address,
                kind,
                x25519: x25519_pub,
                ed25519: ed25519_pub,
                p384_ecdh: p384_ecdh_pub,
                p384_ecdsa: p384_ecdsa_pub,
                secret: Some(IdentitySecret {
                    x25519: x25519_secret.to_bytes(),
                    ed25519: ed25519_secret.to_bytes(),
                    p384_ecdh: p384_ecdh_secret.map(|k| secret_bytes(&k)),
                    p384_ecdsa: p384_ecdsa_secret.map(|k| secret_bytes(&k)),
                }),
            });
        }
    }

    /// Recompute the memory-hard digest and check that this identity's
    /// address was honestly derived from its public keys. Pure.
    pub fn validate(&self) -> bool {
        let digest = match memory_hard_digest(&self.public_bundle()) {
            Ok(d) => d,
            Err(_) => return false,
        };
        if digest[0] >= ADDRESS_WORK_THRESHOLD {
            return false;
        }
        let addr_bytes: [u8; 5] = digest[59..64].try_into().unwrap();
        match Address::from_bytes(&addr_bytes) {
            Some(a) => a == self.address,
            None => false,
        }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    #[inline]
    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    #[inline]
    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            address: self.address,
            hash: crypto::sha384(&self.public_bundle()),
        }
    }

    /// The identity with private keys stripped.
    pub fn public_clone(&self) -> Identity {
        let mut id = self.clone();
        id.secret = None;
        id
    }

    fn public_bundle(&self) -> Vec<u8> {
        public_bundle(
            self.kind,
            &self.x25519,
            &self.ed25519,
            self.p384_ecdh.as_ref(),
            self.p384_ecdsa.as_ref(),
        )
    }

    /// Sign a message. C25519 identities produce a 64-byte Ed25519
    /// signature; P384 identities append a 96-byte P-384 ECDSA
    /// signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::NoPrivateKey)?;
        let ed = SigningKey::from_bytes(&secret.ed25519);
        let mut sig = ed.sign(message).to_bytes().to_vec();

        if self.kind == IdentityKind::P384 {
            let raw = secret.p384_ecdsa.ok_or(SignatureError::NoPrivateKey)?;
            let sk = p384::SecretKey::from_slice(&raw)
                .map_err(|_| SignatureError::InvalidPublicKey)?;
            let signer = p384::ecdsa::SigningKey::from(sk);
            let p_sig: p384::ecdsa::Signature = signer.sign(message);
            sig.extend_from_slice(&p_sig.to_bytes());
        }
        Ok(sig)
    }

    /// Verify a signature over `message`. Constant-time on the
    /// comparison path; returns a plain boolean so callers can't
    /// distinguish failure modes.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let expected = match self.kind {
            IdentityKind::C25519 => C25519_SIGNATURE_SIZE,
            IdentityKind::P384 => DUAL_SIGNATURE_SIZE,
        };
        if signature.len() != expected {
            return false;
        }

        let vk = match VerifyingKey::from_bytes(&self.ed25519) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let ed_sig = ed25519_dalek::Signature::from_bytes(
            signature[..C25519_SIGNATURE_SIZE].try_into().unwrap(),
        );
        if vk.verify_strict(message, &ed_sig).is_err() {
            return false;
        }

        if self.kind == IdentityKind::P384 {
            let pub_bytes = match self.p384_ecdsa.as_ref() {
                Some(b) => b,
                None => return false,
            };
            let pk = match p384::PublicKey::from_sec1_bytes(pub_bytes) {
                Ok(pk) => pk,
                Err(_) => return false,
            };
            let vk = p384::ecdsa::VerifyingKey::from(pk);
            let p_sig =
                match p384::ecdsa::Signature::from_slice(&signature[C25519_SIGNATURE_SIZE..]) {
                    Ok(s) => s,
                    Err(_) => return false,
                };
            if vk.verify(message, &p_sig).is_err() {
                return false;
            }
        }
        true
    }

    /// Long-term key agreement with a remote identity. Requires our
    /// private keys. The result seeds HELLO authentication and the
    /// session key schedule; both sides compute the same value.
    pub fn agree(&self, remote: &Identity) -> Result<[u8; 32], SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::NoPrivateKey)?;
        let local = x25519_dalek::StaticSecret::from(secret.x25519);
        let remote_pub = x25519_dalek::PublicKey::from(remote.x25519);
        let dh = local.diffie_hellman(&remote_pub);

        let mixed = if self.kind == IdentityKind::P384 && remote.kind == IdentityKind::P384 {
            let raw = secret.p384_ecdh.ok_or(SignatureError::NoPrivateKey)?;
            let sk = p384::SecretKey::from_slice(&raw)
                .map_err(|_| SignatureError::InvalidPublicKey)?;
            let remote_raw = remote.p384_ecdh.ok_or(SignatureError::InvalidPublicKey)?;
            let pk = p384::PublicKey::from_sec1_bytes(&remote_raw)
                .map_err(|_| SignatureError::InvalidPublicKey)?;
            let shared = p384::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
            let mut input = Vec::with_capacity(32 + 48);
            input.extend_from_slice(dh.as_bytes());
            input.extend_from_slice(shared.raw_secret_bytes());
            crypto::sha512(&input)
        } else {
            crypto::sha512(dh.as_bytes())
        };

        let mut key = [0u8; 32];
        key.copy_from_slice(&mixed[..32]);
        Ok(key)
    }

    // -- serialization -----------------------------------------------------

    /// Binary form: address(5) | kind(1) | public bundle |
    /// secret-length(1) | secret bundle. The secret length is zero when
    /// private keys are excluded.
    pub fn to_bytes(&self, include_private: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + 1 + 162 + 1 + 160);
        out.extend_from_slice(&self.address.to_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.public_bundle());
        match (&self.secret, include_private) {
            (Some(s), true) => {
                let mut sec = Vec::with_capacity(160);
                sec.extend_from_slice(&s.x25519);
                sec.extend_from_slice(&s.ed25519);
                if let (Some(a), Some(b)) = (&s.p384_ecdh, &s.p384_ecdsa) {
                    sec.extend_from_slice(a);
                    sec.extend_from_slice(b);
                }
                out.push(sec.len() as u8);
                out.extend_from_slice(&sec);
            }
            _ => out.push(0),
        }
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, MarshalError> {
        Self::unmarshal(b).map(|(id, _)| id)
    }

    /// Parse an identity from the front of `b`, returning it and the
    /// number of bytes consumed.
    pub fn unmarshal(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        if b.len() < 7 {
            return Err(MarshalError::Underflow);
        }
        let address = Address::from_bytes(&b[0..5].try_into().unwrap())
            .ok_or(MarshalError::InvalidField)?;
        let kind = IdentityKind::from_u8(b[5]).ok_or(MarshalError::UnknownType)?;

        let public_len = match kind {
            IdentityKind::C25519 => 64,
            IdentityKind::P384 => 64 + 2 * P384_PUBLIC_SIZE,
        };
        if b.len() < 6 + public_len + 1 {
            return Err(MarshalError::Underflow);
        }
        let pb = &b[6..6 + public_len];

        let mut x25519 = [0u8; 32];
        x25519.copy_from_slice(&pb[..32]);
        let mut ed25519 = [0u8; 32];
        ed25519.copy_from_slice(&pb[32..64]);
        VerifyingKey::from_bytes(&ed25519).map_err(|_| MarshalError::InvalidField)?;

        let (p384_ecdh, p384_ecdsa) = if kind == IdentityKind::P384 {
            let mut a = [0u8; P384_PUBLIC_SIZE];
            a.copy_from_slice(&pb[64..64 + P384_PUBLIC_SIZE]);
            let mut c = [0u8; P384_PUBLIC_SIZE];
            c.copy_from_slice(&pb[64 + P384_PUBLIC_SIZE..]);
            p384::PublicKey::from_sec1_bytes(&a).map_err(|_| MarshalError::InvalidField)?;
            p384::PublicKey::from_sec1_bytes(&c).map_err(|_| MarshalError::InvalidField)?;
            (Some(a), Some(c))
        } else {
            (None, None)
        };

        let secret_len = b[6 + public_len] as usize;
        let consumed = 6 + public_len + 1 + secret_len;
        if b.len() < consumed {
            return Err(MarshalError::Underflow);
        }
        let secret = if secret_len > 0 {
            let expected = match kind {
                IdentityKind::C25519 => 64,
                IdentityKind::P384 => 64 + 2 * P384_SECRET_SIZE,
            };
            if secret_len != expected {
                return Err(MarshalError::InvalidField);
            }
            let sb = &b[6 + public_len + 1..consumed];
            let mut x = [0u8; 32];
            x.copy_from_slice(&sb[..32]);
            let mut e = [0u8; 32];
            e.copy_from_slice(&sb[32..64]);
            let (pe, pd) = if kind == IdentityKind::P384 {
                let mut a = [0u8; P384_SECRET_SIZE];
                a.copy_from_slice(&sb[64..64 + P384_SECRET_SIZE]);
                let mut c = [0u8; P384_SECRET_SIZE];
                c.copy_from_slice(&sb[64 + P384_SECRET_SIZE..]);
                (Some(a), Some(c))
            } else {
                (None, None)
            };
            let secret = IdentitySecret {
                x25519: x,
                ed25519: e,
                p384_ecdh: pe,
                p384_ecdsa: pd,
            };
            // The secret must actually correspond to the public keys.
            if x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(secret.x25519))
                .to_bytes()
                != x25519
            {
                return Err(MarshalError::InvalidField);
            }
            if SigningKey::from_bytes(&secret.ed25519).verifying_key().to_bytes() != ed25519 {
                return Err(MarshalError::InvalidField);
            }
            Some(secret)
        } else {
            None
        };

        Ok((
            Identity {
                address,
                kind,
                x25519,
                ed25519,
                p384_ecdh,
                p384_ecdsa,
                secret,
            },
            consumed,
        ))
    }

    /// Canonical string form: `address:kind:publichex[:secrethex]`.
    pub fn to_string_with_private(&self, include_private: bool) -> String {
        let mut s = format!(
            "{}:{}:{}",
            self.address,
            self.kind as u8,
            hex::encode(self.public_bundle())
        );
        if include_private {
            if let Some(sec) = &self.secret {
                let mut raw = Vec::with_capacity(160);
                raw.extend_from_slice(&sec.x25519);
                raw.extend_from_slice(&sec.ed25519);
                if let (Some(a), Some(b)) = (&sec.p384_ecdh, &sec.p384_ecdsa) {
                    raw.extend_from_slice(a);
                    raw.extend_from_slice(b);
                }
                s.push(':');
                s.push_str(&hex::encode(raw));
            }
        }
        s
    }

    pub fn from_string(s: &str) -> Result<Self, MarshalError> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(MarshalError::InvalidField);
        }
        let address = Address::from_hex(fields[0]).ok_or(MarshalError::InvalidField)?;
        let kind_v: u8 = fields[1].parse().map_err(|_| MarshalError::InvalidField)?;
        let kind = IdentityKind::from_u8(kind_v).ok_or(MarshalError::UnknownType)?;
        let public = hex::decode(fields[2]).map_err(|_| MarshalError::InvalidField)?;
        let secret = if fields.len() == 4 {
            hex::decode(fields[3]).map_err(|_| MarshalError::InvalidField)?
        } else {
            Vec::new()
        };

        // Reuse the binary parser: rebuild the canonical byte form.
        let mut raw = Vec::with_capacity(6 + public.len() + 1 + secret.len());
        raw.extend_from_slice(&address.to_bytes());
        raw.push(kind as u8);
        raw.extend_from_slice(&public);
        raw.push(secret.len() as u8);
        raw.extend_from_slice(&secret);
        Self::from_bytes(&raw)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.kind == other.kind
            && self.x25519 == other.x25519
            && self.ed25519 == other.ed25519
            && self.p384_ecdh == other.p384_ecdh
            && self.p384_ecdsa == other.p384_ecdsa
    }
}

impl Eq for Identity {}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.ed25519.hash(state);
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("has_private", &self.has_private())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_with_private(false))
    }
}

fn public_bundle(
    kind: IdentityKind,
    x25519: &[u8; 32],
    ed25519: &[u8; 32],
    p384_ecdh: Option<&[u8; P384_PUBLIC_SIZE]>,
    p384_ecdsa: Option<&[u8; P384_PUBLIC_SIZE]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + 2 * P384_PUBLIC_SIZE);
    out.extend_from_slice(x25519);
    out.extend_from_slice(ed25519);
    if kind == IdentityKind::P384 {
        out.extend_from_slice(p384_ecdh.expect("p384 identity has ecdh key"));
        out.extend_from_slice(p384_ecdsa.expect("p384 identity has ecdsa key"));
    }
    out
}

fn compressed_public(sk: &p384::SecretKey) -> [u8; P384_PUBLIC_SIZE] {
    use p384::elliptic_curve::sec1::ToEncodedPoint;
    let mut out = [0u8; P384_PUBLIC_SIZE];
    out.copy_from_slice(sk.public_key().to_encoded_point(true).as_bytes());
    out
}

fn secret_bytes(sk: &p384::SecretKey) -> [u8; P384_SECRET_SIZE] {
    let mut out = [0u8; P384_SECRET_SIZE];
    out.copy_from_slice(&sk.to_bytes());
    out
}
