//! Signed locators: where in the physical world a node can be found.
//!
//! A locator is a timestamped, ordered list of up to eight endpoints,
//! signed by the identity it describes. Receivers treat locator
//! contents as hints: paths learned from one stay tentative until a
//! HELLO round trip confirms the endpoint actually answers.

use crate::endpoint::Endpoint;
use crate::error::MarshalError;
use crate::identity::{Fingerprint, Identity};
use crate::protocol::MAX_LOCATOR_ENDPOINTS;

/// Domain separation prefix for locator signatures; prevents a locator
/// signature from being replayed as any other signed object.
const LOCATOR_SIGNING_DOMAIN: &[u8] = b"weft-locator-v1:";

/// A signed, timestamped list of physical endpoints for one identity.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Locator {
    timestamp: i64,
    endpoints: Vec<Endpoint>,
    signer: Fingerprint,
    signature: Vec<u8>,
}

impl Locator {
    /// Create and sign a locator. Endpoint order is preserved; the
    /// first entry is the signer's most preferred contact point.
    ///
    /// Fails if `signer` has no private key or more than eight
    /// endpoints are supplied.
    pub fn create(
        timestamp: i64,
        endpoints: Vec<Endpoint>,
        signer: &Identity,
    ) -> Result<Self, MarshalError> {
        if endpoints.len() > MAX_LOCATOR_ENDPOINTS {
            return Err(MarshalError::Overflow);
        }
        let payload = signing_payload(timestamp, &endpoints);
        let signature = signer.sign(&payload).map_err(|_| MarshalError::InvalidField)?;
        Ok(Locator {
            timestamp,
            endpoints,
            signer: signer.fingerprint(),
            signature,
        })
    }

    /// Verify the signature against the signer's identity. Also checks
    /// that the embedded fingerprint actually names that identity.
    pub fn verify(&self, signer: &Identity) -> bool {
        if signer.fingerprint() != self.signer {
            return false;
        }
        let payload = signing_payload(self.timestamp, &self.endpoints);
        signer.verify(&payload, &self.signature)
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[inline]
    pub fn signer(&self) -> &Fingerprint {
        &self.signer
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.endpoints.len() as u8);
        for ep in &self.endpoints {
            ep.marshal(out);
        }
        self.signer.marshal(out);
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        self.marshal(&mut out);
        out
    }

    pub fn unmarshal(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        if b.len() < 9 {
            return Err(MarshalError::Underflow);
        }
        let timestamp = i64::from_be_bytes(b[0..8].try_into().unwrap());
        let count = b[8] as usize;
        if count > MAX_LOCATOR_ENDPOINTS {
            return Err(MarshalError::Overflow);
        }
        let mut pos = 9;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            let (ep, n) = Endpoint::unmarshal(&b[pos..])?;
            endpoints.push(ep);
            pos += n;
        }
        let (signer, n) = Fingerprint::unmarshal(&b[pos..])?;
        pos += n;
        if b.len() < pos + 2 {
            return Err(MarshalError::Underflow);
        }
        let sig_len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if b.len() < pos + sig_len {
            return Err(MarshalError::Underflow);
        }
        let signature = b[pos..pos + sig_len].to_vec();
        pos += sig_len;
        Ok((
            Locator {
                timestamp,
                endpoints,
                signer,
                signature,
            },
            pos,
        ))
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, MarshalError> {
        Self::unmarshal(b).map(|(l, _)| l)
    }

    /// Hex text form, convenient for logs and flat config files.
    pub fn to_hex_string(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex_string(s: &str) -> Result<Self, MarshalError> {
        let raw = hex::decode(s).map_err(|_| MarshalError::InvalidField)?;
        Self::from_bytes(&raw)
    }
}

fn signing_payload(timestamp: i64, endpoints: &[Endpoint]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCATOR_SIGNING_DOMAIN.len() + 9 + endpoints.len() * 20);
    out.extend_from_slice(LOCATOR_SIGNING_DOMAIN);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.push(endpoints.len() as u8);
    for ep in endpoints {
        ep.marshal(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::IpUdp("198.51.100.7:9993".parse().unwrap()),
            Endpoint::IpUdp("[2001:db8::7]:9993".parse().unwrap()),
            Endpoint::Nil,
        ]
    }

    #[test]
    fn create_verify_round_trip() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let loc = Locator::create(1_700_000_000_000, endpoints(), &id).unwrap();

        assert!(loc.verify(&id));
        assert!(loc.verify(&id.public_clone()));
        assert_eq!(loc.timestamp(), 1_700_000_000_000);
        assert_eq!(loc.endpoints(), &endpoints()[..]);

        let parsed = Locator::from_bytes(&loc.to_bytes()).unwrap();
        assert_eq!(parsed, loc);
        assert!(parsed.verify(&id));
    }

    #[test]
    fn wrong_signer_fails() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let other = Identity::generate(IdentityKind::C25519).unwrap();
        let loc = Locator::create(1000, endpoints(), &id).unwrap();
        assert!(!loc.verify(&other));
    }

    #[test]
    fn tampering_is_detected() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let loc = Locator::create(1000, endpoints(), &id).unwrap();

        let mut t = loc.clone();
        t.timestamp += 1;
        assert!(!t.verify(&id));

        let mut t = loc.clone();
        t.endpoints[0] = Endpoint::IpUdp("203.0.113.9:9993".parse().unwrap());
        assert!(!t.verify(&id));

        let mut t = loc.clone();
        t.signature[0] ^= 1;
        assert!(!t.verify(&id));
    }

    #[test]
    fn endpoint_count_is_bounded() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let too_many = vec![Endpoint::Nil; MAX_LOCATOR_ENDPOINTS + 1];
        assert_eq!(
            Locator::create(1, too_many, &id),
            Err(MarshalError::Overflow)
        );

        // A forged count byte past the limit is rejected on parse too.
        let loc = Locator::create(1, vec![Endpoint::Nil], &id).unwrap();
        let mut raw = loc.to_bytes();
        raw[8] = (MAX_LOCATOR_ENDPOINTS + 1) as u8;
        assert_eq!(Locator::from_bytes(&raw), Err(MarshalError::Overflow));
    }

    #[test]
    fn hex_string_round_trip() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let loc = Locator::create(55, endpoints(), &id).unwrap();
        let parsed = Locator::from_hex_string(&loc.to_hex_string()).unwrap();
        assert_eq!(parsed, loc);
    }

    #[test]
    fn unsigned_identity_cannot_create() {
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let public = id.public_clone();
        assert!(Locator::create(1, endpoints(), &public).is_err());
    }
}
