//! Network membership credentials.
//!
//! Five credential kinds exist, all signed by a network's controller:
//!
//! - [`Com`], the certificate of membership: proof a node may use a
//!   network at a point in time. Two members agree to talk iff their
//!   COM timestamps are within the controller-declared delta.
//! - [`CapabilityCredential`]: a small bundled rule set granting
//!   rights the base rules would not.
//! - [`TagCredential`]: a 32-bit (id, value) pair scoped to a network,
//!   matched by tag rules.
//! - [`CooCredential`], the certificate of ownership: proof that an IP
//!   or MAC belongs to a member, feeding the authenticated-sender
//!   characteristics bits.
//! - [`Revocation`]: invalidates credentials at or before a timestamp
//!   threshold, effective immediately on receipt.
//!
//! Every kind signs a domain-prefixed canonical byte encoding, so a
//! signature for one kind can never pass as another.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::endpoint::Mac;
use crate::error::CredentialError;
use crate::identity::{Address, Fingerprint, Identity};
use crate::rules::Rule;

/// Credential type IDs; wire- and revocation-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CredentialKind {
    Null = 0,
    Com = 1,
    Capability = 2,
    Tag = 3,
    Coo = 4,
    Revocation = 6,
}

const COM_SIGNING_DOMAIN: &[u8] = b"weft-com-v1:";
const CAPABILITY_SIGNING_DOMAIN: &[u8] = b"weft-capability-v1:";
const TAG_SIGNING_DOMAIN: &[u8] = b"weft-tag-v1:";
const COO_SIGNING_DOMAIN: &[u8] = b"weft-coo-v1:";
const REVOCATION_SIGNING_DOMAIN: &[u8] = b"weft-revocation-v1:";

/// Certificate of membership.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Com {
    pub network_id: u64,
    /// Issuance time; also the value compared for mutual agreement.
    pub timestamp: i64,
    /// The member this COM admits.
    pub issued_to: Fingerprint,
    pub signature: Vec<u8>,
}

impl Com {
    pub fn new(network_id: u64, timestamp: i64, issued_to: Fingerprint) -> Self {
        Com {
            network_id,
            timestamp,
            issued_to,
            signature: Vec::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = COM_SIGNING_DOMAIN.to_vec();
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.issued_to.marshal(&mut out);
        out
    }

    pub fn sign(&mut self, controller: &Identity) -> Result<(), CredentialError> {
        self.signature = controller
            .sign(&self.signing_payload())
            .map_err(|_| CredentialError::Invalid)?;
        Ok(())
    }

    pub fn verify(&self, controller: &Identity, network_id: u64) -> Result<(), CredentialError> {
        if self.network_id != network_id {
            return Err(CredentialError::WrongNetwork);
        }
        if self.signature.is_empty() {
            return Err(CredentialError::Invalid);
        }
        if !controller.verify(&self.signing_payload(), &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        Ok(())
    }

    /// Two COMs are mutually agreeable iff they name the same network
    /// and their timestamps are within the controller-declared delta.
    pub fn agrees_with(&self, other: &Com, max_delta: i64) -> bool {
        self.network_id == other.network_id
            && (self.timestamp - other.timestamp).abs() <= max_delta
    }
}

/// Capability: a controller-granted bundle of rules evaluated when the
/// base rule set does not accept a frame.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CapabilityCredential {
    pub network_id: u64,
    pub timestamp: i64,
    pub id: u32,
    pub issued_to: Address,
    pub rules: Vec<Rule>,
    pub signature: Vec<u8>,
}

impl CapabilityCredential {
    pub fn new(network_id: u64, timestamp: i64, id: u32, issued_to: Address, rules: Vec<Rule>) -> Self {
        CapabilityCredential {
            network_id,
            timestamp,
            id,
            issued_to,
            rules,
            signature: Vec::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = CAPABILITY_SIGNING_DOMAIN.to_vec();
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.issued_to.to_bytes());
        // Rules travel inside the payload as their bounded encoding.
        let body = bincode::serialize(&self.rules).unwrap_or_default();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn sign(&mut self, controller: &Identity) -> Result<(), CredentialError> {
        self.signature = controller
            .sign(&self.signing_payload())
            .map_err(|_| CredentialError::Invalid)?;
        Ok(())
    }

    pub fn verify(&self, controller: &Identity, network_id: u64) -> Result<(), CredentialError> {
        if self.network_id != network_id {
            return Err(CredentialError::WrongNetwork);
        }
        if self.rules.len() > crate::protocol::MAX_CAPABILITY_RULES {
            return Err(CredentialError::Invalid);
        }
        if !controller.verify(&self.signing_payload(), &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        Ok(())
    }
}

/// Tag: a per-member (id, value) pair matched by tag rules.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TagCredential {
    pub network_id: u64,
    pub timestamp: i64,
    pub id: u32,
    pub value: u32,
    pub issued_to: Address,
    pub signature: Vec<u8>,
}

impl TagCredential {
    pub fn new(network_id: u64, timestamp: i64, id: u32, value: u32, issued_to: Address) -> Self {
        TagCredential {
            network_id,
            timestamp,
            id,
            value,
            issued_to,
            signature: Vec::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = TAG_SIGNING_DOMAIN.to_vec();
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.value.to_be_bytes());
        out.extend_from_slice(&self.issued_to.to_bytes());
        out
    }

    pub fn sign(&mut self, controller: &Identity) -> Result<(), CredentialError> {
        self.signature = controller
            .sign(&self.signing_payload())
            .map_err(|_| CredentialError::Invalid)?;
        Ok(())
    }

    pub fn verify(&self, controller: &Identity, network_id: u64) -> Result<(), CredentialError> {
        if self.network_id != network_id {
            return Err(CredentialError::WrongNetwork);
        }
        if !controller.verify(&self.signing_payload(), &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        Ok(())
    }
}

/// Something a certificate of ownership can claim.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum OwnedThing {
    Ip(IpAddr),
    Mac(Mac),
}

/// Certificate of ownership: binds IPs/MACs to a member, feeding the
/// sender-authenticated characteristics bits in the rules engine.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CooCredential {
    pub network_id: u64,
    pub timestamp: i64,
    pub id: u32,
    pub issued_to: Address,
    pub things: Vec<OwnedThing>,
    pub signature: Vec<u8>,
}

impl CooCredential {
    pub fn new(
        network_id: u64,
        timestamp: i64,
        id: u32,
        issued_to: Address,
        things: Vec<OwnedThing>,
    ) -> Self {
        CooCredential {
            network_id,
            timestamp,
            id,
            issued_to,
            things,
            signature: Vec::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = COO_SIGNING_DOMAIN.to_vec();
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.issued_to.to_bytes());
        out.push(self.things.len() as u8);
        for t in &self.things {
            match t {
                OwnedThing::Ip(IpAddr::V4(v4)) => {
                    out.push(4);
                    out.extend_from_slice(&v4.octets());
                }
                OwnedThing::Ip(IpAddr::V6(v6)) => {
                    out.push(6);
                    out.extend_from_slice(&v6.octets());
                }
                OwnedThing::Mac(m) => {
                    out.push(1);
                    out.extend_from_slice(&m.to_bytes());
                }
            }
        }
        out
    }

    pub fn sign(&mut self, controller: &Identity) -> Result<(), CredentialError> {
        self.signature = controller
            .sign(&self.signing_payload())
            .map_err(|_| CredentialError::Invalid)?;
        Ok(())
    }

    pub fn verify(&self, controller: &Identity, network_id: u64) -> Result<(), CredentialError> {
        if self.network_id != network_id {
            return Err(CredentialError::WrongNetwork);
        }
        if self.things.is_empty() {
            return Err(CredentialError::Invalid);
        }
        if !controller.verify(&self.signing_payload(), &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        Ok(())
    }

    pub fn owns_ip(&self, ip: &IpAddr) -> bool {
        self.things.iter().any(|t| matches!(t, OwnedThing::Ip(i) if i == ip))
    }

    pub fn owns_mac(&self, mac: Mac) -> bool {
        self.things.iter().any(|t| matches!(t, OwnedThing::Mac(m) if *m == mac))
    }
}

/// Revocation: all credentials of `kind` with id `credential_id`
/// issued to `target` at or before `threshold` are invalid from the
/// moment this is received.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Revocation {
    pub network_id: u64,
    /// Issuance time of the revocation itself.
    pub timestamp: i64,
    /// Credentials issued at or before this are dead.
    pub threshold: i64,
    pub kind: CredentialKind,
    pub credential_id: u32,
    pub target: Address,
    pub signature: Vec<u8>,
}

impl Revocation {
    pub fn new(
        network_id: u64,
        timestamp: i64,
        threshold: i64,
        kind: CredentialKind,
        credential_id: u32,
        target: Address,
    ) -> Self {
        Revocation {
            network_id,
            timestamp,
            threshold,
            kind,
            credential_id,
            target,
            signature: Vec::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = REVOCATION_SIGNING_DOMAIN.to_vec();
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.threshold.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.credential_id.to_be_bytes());
        out.extend_from_slice(&self.target.to_bytes());
        out
    }

    pub fn sign(&mut self, controller: &Identity) -> Result<(), CredentialError> {
        self.signature = controller
            .sign(&self.signing_payload())
            .map_err(|_| CredentialError::Invalid)?;
        Ok(())
    }

    pub fn verify(&self, controller: &Identity, network_id: u64) -> Result<(), CredentialError> {
        if self.network_id != network_id {
            return Err(CredentialError::WrongNetwork);
        }
        if !controller.verify(&self.signing_payload(), &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;

    fn controller_and_member() -> (Identity, Identity) {
        (
            Identity::generate(IdentityKind::C25519).unwrap(),
            Identity::generate(IdentityKind::C25519).unwrap(),
        )
    }

    #[test]
    fn com_sign_verify_and_agreement() {
        let (controller, member) = controller_and_member();
        let nwid = 0x1122334455667788u64;

        let mut com = Com::new(nwid, 10_000, member.fingerprint());
        com.sign(&controller).unwrap();
        assert!(com.verify(&controller, nwid).is_ok());

        // Wrong network, wrong controller, tampering.
        assert_eq!(
            com.verify(&controller, nwid + 1),
            Err(CredentialError::WrongNetwork)
        );
        let other = Identity::generate(IdentityKind::C25519).unwrap();
        assert_eq!(
            com.verify(&other, nwid),
            Err(CredentialError::SignatureVerificationFailed)
        );
        let mut t = com.clone();
        t.timestamp += 1;
        assert_eq!(
            t.verify(&controller, nwid),
            Err(CredentialError::SignatureVerificationFailed)
        );

        // Agreement window.
        let mut peer_com = Com::new(nwid, 12_000, member.fingerprint());
        peer_com.sign(&controller).unwrap();
        assert!(com.agrees_with(&peer_com, 5_000));
        assert!(!com.agrees_with(&peer_com, 1_000));
        let mut other_net = Com::new(nwid + 1, 10_000, member.fingerprint());
        other_net.sign(&controller).unwrap();
        assert!(!com.agrees_with(&other_net, i64::MAX / 2));
    }

    #[test]
    fn tag_sign_verify() {
        let (controller, member) = controller_and_member();
        let nwid = 7u64;

        let mut tag = TagCredential::new(nwid, 100, 1001, 42, member.address());
        tag.sign(&controller).unwrap();
        assert!(tag.verify(&controller, nwid).is_ok());

        let mut t = tag.clone();
        t.value = 43;
        assert_eq!(
            t.verify(&controller, nwid),
            Err(CredentialError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn coo_sign_verify_and_ownership() {
        let (controller, member) = controller_and_member();
        let nwid = 9u64;
        let ip: IpAddr = "10.147.17.5".parse().unwrap();
        let mac = Mac::from_u64(0x021122334455);

        let mut coo = CooCredential::new(
            nwid,
            100,
            1,
            member.address(),
            vec![OwnedThing::Ip(ip), OwnedThing::Mac(mac)],
        );
        coo.sign(&controller).unwrap();
        assert!(coo.verify(&controller, nwid).is_ok());
        assert!(coo.owns_ip(&ip));
        assert!(!coo.owns_ip(&"10.147.17.6".parse().unwrap()));
        assert!(coo.owns_mac(mac));

        let empty = CooCredential::new(nwid, 100, 1, member.address(), Vec::new());
        assert_eq!(
            empty.verify(&controller, nwid),
            Err(CredentialError::Invalid)
        );
    }

    #[test]
    fn capability_sign_verify() {
        let (controller, member) = controller_and_member();
        let nwid = 11u64;

        let mut cap = CapabilityCredential::new(
            nwid,
            100,
            5,
            member.address(),
            vec![Rule::action_accept()],
        );
        cap.sign(&controller).unwrap();
        assert!(cap.verify(&controller, nwid).is_ok());

        let mut t = cap.clone();
        t.id += 1;
        assert_eq!(
            t.verify(&controller, nwid),
            Err(CredentialError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn revocation_sign_verify() {
        let (controller, member) = controller_and_member();
        let nwid = 13u64;

        let mut rev = Revocation::new(nwid, 500, 400, CredentialKind::Com, 0, member.address());
        rev.sign(&controller).unwrap();
        assert!(rev.verify(&controller, nwid).is_ok());

        let mut t = rev.clone();
        t.threshold += 1;
        assert_eq!(
            t.verify(&controller, nwid),
            Err(CredentialError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn credentials_serialize_for_config_body() {
        let (controller, member) = controller_and_member();
        let mut com = Com::new(1, 2, member.fingerprint());
        com.sign(&controller).unwrap();

        let bytes = bincode::serialize(&com).unwrap();
        let parsed: Com = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parsed, com);
        assert!(parsed.verify(&controller, 1).is_ok());
    }
}
