//! Certificates and the local certificate store.
//!
//! A certificate binds a subject (identities with optional locators,
//! networks, referenced certificates, an X.509-style name record) to
//! an issuer identity, inside a validity window. It deliberately is
//! not X.509: one canonical binary encoding, one signature algorithm
//! family per identity kind, no extension soup.
//!
//! The serial number IS the SHA-384 digest of the canonical encoding
//! minus the signature, so a serial both names and authenticates the
//! exact bytes of a certificate.
//!
//! Subjects may carry a unique ID: a P-384 public key whose private
//! half signs the subject itself. That proof lets a subject "own"
//! itself across reissues, and gives the store its supersession rule:
//! for any (issuer, subject unique ID) pair only the newest subject
//! timestamp is retained, and inserting an older one fails with
//! `HaveNewerCert`.

use std::collections::HashMap;

use p384::ecdsa::signature::{Signer as _, Verifier as _};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use tracing::debug;

use crate::crypto::{self, SignatureError};
use crate::error::{CertificateError, MarshalError};
use crate::identity::{Address, Fingerprint, Identity};
use crate::locator::Locator;
use crate::protocol::CERTIFICATE_MAX_STRING_LENGTH;

/// Operator-set trust flag: this certificate is a root CA; chains may
/// terminate here.
pub const LOCAL_TRUST_FLAG_ROOT_CA: u32 = 0x0001;

/// Operator-set trust flag: this certificate's subject lists the root
/// set; its identities are promoted to root peers.
pub const LOCAL_TRUST_FLAG_ROOT_SET: u32 = 0x0002;

/// Type prefix byte for P-384 subject unique IDs.
pub const UNIQUE_ID_TYPE_P384: u8 = 1;

/// Prefixed unique ID size: type byte plus compressed SEC1 point.
pub const UNIQUE_ID_P384_SIZE: usize = 50;

const CERT_SIGNING_DOMAIN: &[u8] = b"weft-certificate-v1:";
const UNIQUE_ID_PROOF_DOMAIN: &[u8] = b"weft-certificate-unique-id-v1:";

/// X.509-style name record. All fields optional free text.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct CertificateName {
    pub serial_no: String,
    pub common_name: String,
    pub country: String,
    pub organization: String,
    pub unit: String,
    pub locality: String,
    pub province: String,
    pub street_address: String,
    pub postal_code: String,
    pub email: String,
    pub url: String,
    pub host: String,
}

impl CertificateName {
    fn fields(&self) -> [&String; 12] {
        [
            &self.serial_no,
            &self.common_name,
            &self.country,
            &self.organization,
            &self.unit,
            &self.locality,
            &self.province,
            &self.street_address,
            &self.postal_code,
            &self.email,
            &self.url,
            &self.host,
        ]
    }

    fn is_within_limits(&self) -> bool {
        self.fields()
            .iter()
            .all(|f| f.len() <= CERTIFICATE_MAX_STRING_LENGTH)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for f in self.fields() {
            out.push(f.len() as u8);
            out.extend_from_slice(f.as_bytes());
        }
    }

    fn decode(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        let mut pos = 0usize;
        let mut fields: Vec<String> = Vec::with_capacity(12);
        for _ in 0..12 {
            if b.len() < pos + 1 {
                return Err(MarshalError::Underflow);
            }
            let len = b[pos] as usize;
            pos += 1;
            if len > CERTIFICATE_MAX_STRING_LENGTH || b.len() < pos + len {
                return Err(MarshalError::Underflow);
            }
            let s = std::str::from_utf8(&b[pos..pos + len])
                .map_err(|_| MarshalError::InvalidField)?;
            fields.push(s.to_string());
            pos += len;
        }
        let mut it = fields.into_iter();
        Ok((
            CertificateName {
                serial_no: it.next().unwrap(),
                common_name: it.next().unwrap(),
                country: it.next().unwrap(),
                organization: it.next().unwrap(),
                unit: it.next().unwrap(),
                locality: it.next().unwrap(),
                province: it.next().unwrap(),
                street_address: it.next().unwrap(),
                postal_code: it.next().unwrap(),
                email: it.next().unwrap(),
                url: it.next().unwrap(),
                host: it.next().unwrap(),
            },
            pos,
        ))
    }
}

/// An identity listed in a subject, with an optional locator telling
/// the world where that identity can be reached.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CertificateIdentity {
    pub identity: Identity,
    pub locator: Option<Locator>,
}

/// A network claimed by a subject, named by ID and controller.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CertificateNetwork {
    pub id: u64,
    pub controller: Fingerprint,
}

/// The subject half of a certificate.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CertificateSubject {
    /// Subject revision time; drives newest-wins supersession.
    pub timestamp: i64,
    pub identities: Vec<CertificateIdentity>,
    pub networks: Vec<CertificateNetwork>,
    /// Serials of other certificates this subject endorses.
    pub certificates: Vec<[u8; 48]>,
    pub update_urls: Vec<String>,
    pub name: CertificateName,
    /// Prefixed P-384 public key, or empty for no unique ID.
    pub unique_id: Vec<u8>,
    /// Signature of the subject by the unique ID's private key.
    pub unique_id_proof_signature: Vec<u8>,
}

impl CertificateSubject {
    fn encode(&self, include_proof: bool, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());

        out.extend_from_slice(&(self.identities.len() as u16).to_be_bytes());
        for ci in &self.identities {
            let id_bytes = ci.identity.to_bytes(false);
            out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&id_bytes);
            match &ci.locator {
                Some(loc) => {
                    out.push(1);
                    loc.marshal(out);
                }
                None => out.push(0),
            }
        }

        out.extend_from_slice(&(self.networks.len() as u16).to_be_bytes());
        for n in &self.networks {
            out.extend_from_slice(&n.id.to_be_bytes());
            n.controller.marshal(out);
        }

        out.extend_from_slice(&(self.certificates.len() as u16).to_be_bytes());
        for serial in &self.certificates {
            out.extend_from_slice(serial);
        }

        out.extend_from_slice(&(self.update_urls.len() as u16).to_be_bytes());
        for url in &self.update_urls {
            out.extend_from_slice(&(url.len() as u16).to_be_bytes());
            out.extend_from_slice(url.as_bytes());
        }

        self.name.encode(out);

        out.push(self.unique_id.len() as u8);
        out.extend_from_slice(&self.unique_id);
        if include_proof {
            out.extend_from_slice(&(self.unique_id_proof_signature.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.unique_id_proof_signature);
        }
    }

    fn decode(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        let mut pos = 0usize;
        let need = |pos: usize, n: usize| {
            if b.len() < pos + n {
                Err(MarshalError::Underflow)
            } else {
                Ok(())
            }
        };

        need(pos, 8)?;
        let timestamp = i64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
        pos += 8;

        need(pos, 2)?;
        let id_count = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let mut identities = Vec::with_capacity(id_count.min(64));
        for _ in 0..id_count {
            need(pos, 2)?;
            let len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            need(pos, len)?;
            let identity = Identity::from_bytes(&b[pos..pos + len])?;
            pos += len;
            need(pos, 1)?;
            let has_locator = b[pos] != 0;
            pos += 1;
            let locator = if has_locator {
                let (loc, n) = Locator::unmarshal(&b[pos..])?;
                pos += n;
                Some(loc)
            } else {
                None
            };
            identities.push(CertificateIdentity { identity, locator });
        }

        need(pos, 2)?;
        let nw_count = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let mut networks = Vec::with_capacity(nw_count.min(64));
        for _ in 0..nw_count {
            need(pos, 8)?;
            let id = u64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let (controller, n) = Fingerprint::unmarshal(&b[pos..])?;
            pos += n;
            networks.push(CertificateNetwork { id, controller });
        }

        need(pos, 2)?;
        let cert_count = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let mut certificates = Vec::with_capacity(cert_count.min(64));
        for _ in 0..cert_count {
            need(pos, 48)?;
            certificates.push(b[pos..pos + 48].try_into().unwrap());
            pos += 48;
        }

        need(pos, 2)?;
        let url_count = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let mut update_urls = Vec::with_capacity(url_count.min(16));
        for _ in 0..url_count {
            need(pos, 2)?;
            let len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            need(pos, len)?;
            let s = std::str::from_utf8(&b[pos..pos + len])
                .map_err(|_| MarshalError::InvalidField)?;
            update_urls.push(s.to_string());
            pos += len;
        }

        let (name, n) = CertificateName::decode(&b[pos..])?;
        pos += n;

        need(pos, 1)?;
        let uid_len = b[pos] as usize;
        pos += 1;
        need(pos, uid_len)?;
        let unique_id = b[pos..pos + uid_len].to_vec();
        pos += uid_len;

        need(pos, 2)?;
        let proof_len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        need(pos, proof_len)?;
        let unique_id_proof_signature = b[pos..pos + proof_len].to_vec();
        pos += proof_len;

        Ok((
            CertificateSubject {
                timestamp,
                identities,
                networks,
                certificates,
                update_urls,
                name,
                unique_id,
                unique_id_proof_signature,
            },
            pos,
        ))
    }

    /// Install `secret`'s public key as this subject's unique ID and
    /// sign the subject with it.
    pub fn sign_unique_id(&mut self, secret: &[u8]) -> Result<(), SignatureError> {
        let sk = p384::SecretKey::from_slice(secret)
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        use p384::elliptic_curve::sec1::ToEncodedPoint;
        let mut uid = Vec::with_capacity(UNIQUE_ID_P384_SIZE);
        uid.push(UNIQUE_ID_TYPE_P384);
        uid.extend_from_slice(sk.public_key().to_encoded_point(true).as_bytes());
        self.unique_id = uid;
        self.unique_id_proof_signature.clear();

        let mut payload = UNIQUE_ID_PROOF_DOMAIN.to_vec();
        self.encode(false, &mut payload);
        let signer = p384::ecdsa::SigningKey::from(sk);
        let sig: p384::ecdsa::Signature = signer.sign(&payload);
        self.unique_id_proof_signature = sig.to_bytes().to_vec();
        Ok(())
    }

    /// Check the unique ID proof. A subject without a unique ID is
    /// trivially fine; one with a unique ID must carry a valid proof.
    pub fn verify_unique_id_proof(&self) -> bool {
        if self.unique_id.is_empty() {
            return self.unique_id_proof_signature.is_empty();
        }
        if self.unique_id.len() != UNIQUE_ID_P384_SIZE
            || self.unique_id[0] != UNIQUE_ID_TYPE_P384
        {
            return false;
        }
        let pk = match p384::PublicKey::from_sec1_bytes(&self.unique_id[1..]) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match p384::ecdsa::Signature::from_slice(&self.unique_id_proof_signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let mut payload = UNIQUE_ID_PROOF_DOMAIN.to_vec();
        self.encode(false, &mut payload);
        p384::ecdsa::VerifyingKey::from(pk)
            .verify(&payload, &sig)
            .is_ok()
    }
}

/// Generate a fresh subject unique ID. Returns (prefixed public key,
/// private key bytes). The private half is what lets a subject update
/// its own certificate later.
pub fn new_subject_unique_id() -> (Vec<u8>, Vec<u8>) {
    use p384::elliptic_curve::sec1::ToEncodedPoint;
    let sk = p384::SecretKey::random(&mut OsRng);
    let mut public = Vec::with_capacity(UNIQUE_ID_P384_SIZE);
    public.push(UNIQUE_ID_TYPE_P384);
    public.extend_from_slice(sk.public_key().to_encoded_point(true).as_bytes());
    (public, sk.to_bytes().to_vec())
}

/// A certificate: subject, issuer, validity window, signature.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Certificate {
    /// SHA-384 of the canonical encoding minus the signature. Set by
    /// [`Certificate::sign`]; recomputed and checked on verify.
    pub serial: [u8; 48],
    pub flags: u64,
    pub timestamp: i64,
    /// Validity window: (not before, not after), inclusive.
    pub validity: (i64, i64),
    pub subject: CertificateSubject,
    pub issuer: Identity,
    pub issuer_name: CertificateName,
    pub extended_attributes: Vec<u8>,
    /// How many further certificates may chain below this one. Zero
    /// means the subject may not act as a CA at all.
    pub max_path_length: u32,
    pub signature: Vec<u8>,
}

impl Certificate {
    fn encode(&self, include_signature: bool, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.validity.0.to_be_bytes());
        out.extend_from_slice(&self.validity.1.to_be_bytes());
        self.subject.encode(true, out);
        let issuer_bytes = self.issuer.to_bytes(false);
        out.extend_from_slice(&(issuer_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&issuer_bytes);
        self.issuer_name.encode(out);
        out.extend_from_slice(&(self.extended_attributes.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.extended_attributes);
        out.extend_from_slice(&self.max_path_length.to_be_bytes());
        if include_signature {
            out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.signature);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        self.encode(true, &mut out);
        out
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = CERT_SIGNING_DOMAIN.to_vec();
        self.encode(false, &mut out);
        out
    }

    fn compute_serial(&self) -> [u8; 48] {
        let mut out = Vec::with_capacity(512);
        self.encode(false, &mut out);
        crypto::sha384(&out)
    }

    /// Sign with the issuer's private key, fixing the serial. The
    /// `issuer` argument must be the same identity stored in the
    /// certificate (it carries the private half).
    pub fn sign(&mut self, issuer: &Identity) -> Result<(), SignatureError> {
        if issuer.public_clone() != self.issuer.public_clone() {
            return Err(SignatureError::InvalidPublicKey);
        }
        self.signature = issuer.sign(&self.signing_payload())?;
        self.serial = self.compute_serial();
        Ok(())
    }

    /// Full verification: structure, serial-digest equality, unique ID
    /// proof, component locator signatures, identity consistency, the
    /// primary signature, and (when a clock is supplied) the validity
    /// window.
    pub fn verify(&self, clock: Option<i64>) -> Result<(), CertificateError> {
        if !self.subject.name.is_within_limits() || !self.issuer_name.is_within_limits() {
            return Err(CertificateError::InvalidFormat);
        }
        if self.signature.is_empty() {
            return Err(CertificateError::MissingRequiredFields);
        }
        if self.serial != self.compute_serial() {
            return Err(CertificateError::InvalidFormat);
        }
        if !self.subject.verify_unique_id_proof() {
            return Err(CertificateError::InvalidUniqueIdProof);
        }
        for ci in &self.subject.identities {
            if !ci.identity.validate() {
                return Err(CertificateError::InvalidIdentity);
            }
            if let Some(loc) = &ci.locator {
                if !loc.verify(&ci.identity) {
                    return Err(CertificateError::InvalidComponentSignature);
                }
            }
        }
        if !self.issuer.verify(&self.signing_payload(), &self.signature) {
            return Err(CertificateError::InvalidPrimarySignature);
        }
        if let Some(now) = clock {
            if now < self.validity.0 || now > self.validity.1 {
                return Err(CertificateError::OutOfValidTimeWindow);
            }
        }
        Ok(())
    }

    /// Parse a certificate. When `verify_clock` is supplied the parsed
    /// certificate is fully verified against that clock.
    pub fn decode(b: &[u8], verify_clock: Option<i64>) -> Result<Self, CertificateError> {
        let cert = Self::decode_unverified(b).map_err(|_| CertificateError::InvalidFormat)?;
        if verify_clock.is_some() {
            cert.verify(verify_clock)?;
        }
        Ok(cert)
    }

    fn decode_unverified(b: &[u8]) -> Result<Self, MarshalError> {
        let mut pos = 0usize;
        let need = |pos: usize, n: usize| {
            if b.len() < pos + n {
                Err(MarshalError::Underflow)
            } else {
                Ok(())
            }
        };

        need(pos, 32)?;
        let flags = u64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let timestamp = i64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let not_before = i64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let not_after = i64::from_be_bytes(b[pos..pos + 8].try_into().unwrap());
        pos += 8;

        let (subject, n) = CertificateSubject::decode(&b[pos..])?;
        pos += n;

        need(pos, 2)?;
        let issuer_len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        need(pos, issuer_len)?;
        let issuer = Identity::from_bytes(&b[pos..pos + issuer_len])?;
        pos += issuer_len;

        let (issuer_name, n) = CertificateName::decode(&b[pos..])?;
        pos += n;

        need(pos, 2)?;
        let ea_len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        need(pos, ea_len)?;
        let extended_attributes = b[pos..pos + ea_len].to_vec();
        pos += ea_len;

        need(pos, 4)?;
        let max_path_length = u32::from_be_bytes(b[pos..pos + 4].try_into().unwrap());
        pos += 4;

        need(pos, 2)?;
        let sig_len = u16::from_be_bytes(b[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        need(pos, sig_len)?;
        let signature = b[pos..pos + sig_len].to_vec();

        let mut cert = Certificate {
            serial: [0u8; 48],
            flags,
            timestamp,
            validity: (not_before, not_after),
            subject,
            issuer,
            issuer_name,
            extended_attributes,
            max_path_length,
            signature,
        };
        cert.serial = cert.compute_serial();
        Ok(cert)
    }
}

struct StoredCert {
    cert: Certificate,
    local_trust: u32,
}

#[derive(Default)]
struct StoreInner {
    certs: HashMap<[u8; 48], StoredCert>,
    /// Newest certificate per (issuer address, subject unique ID).
    newest: HashMap<(Address, Vec<u8>), [u8; 48]>,
}

/// The local certificate store: certificates by serial, per-(issuer,
/// unique ID) newest pointers, operator trust flags, and the derived
/// root set.
#[derive(Default)]
pub struct CertificateStore {
    inner: RwLock<StoreInner>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a certificate with the given local trust flags.
    ///
    /// Runs full verification unless `already_verified` certifies the
    /// caller did. Newest-wins per (issuer, subject unique ID): an
    /// older subject timestamp loses with `HaveNewerCert` and the
    /// store is left unchanged.
    pub fn insert(
        &self,
        cert: Certificate,
        local_trust: u32,
        clock: i64,
        already_verified: bool,
    ) -> Result<(), CertificateError> {
        if !already_verified {
            cert.verify(Some(clock))?;
        }

        let mut inner = self.inner.write();
        if !cert.subject.unique_id.is_empty() {
            let key = (cert.issuer.address(), cert.subject.unique_id.clone());
            if let Some(existing_serial) = inner.newest.get(&key) {
                if let Some(existing) = inner.certs.get(existing_serial) {
                    if existing.cert.subject.timestamp >= cert.subject.timestamp
                        && existing.cert.serial != cert.serial
                    {
                        return Err(CertificateError::HaveNewerCert);
                    }
                }
            }
            inner.newest.insert(key, cert.serial);
        }
        debug!(serial = %hex::encode(&cert.serial[..8]), trust = local_trust, "certificate added");
        inner.certs.insert(cert.serial, StoredCert { cert, local_trust });
        Ok(())
    }

    pub fn get(&self, serial: &[u8; 48]) -> Option<Certificate> {
        self.inner.read().certs.get(serial).map(|s| s.cert.clone())
    }

    pub fn local_trust(&self, serial: &[u8; 48]) -> Option<u32> {
        self.inner.read().certs.get(serial).map(|s| s.local_trust)
    }

    pub fn set_local_trust(&self, serial: &[u8; 48], local_trust: u32) -> bool {
        match self.inner.write().certs.get_mut(serial) {
            Some(s) => {
                s.local_trust = local_trust;
                true
            }
            None => false,
        }
    }

    /// Walk from `serial` to a certificate carrying the ROOT_CA trust
    /// flag, following subject→issuer links and honoring each hop's
    /// `max_path_length`. Returns the chain, leaf first.
    pub fn chain(&self, serial: &[u8; 48]) -> Result<Vec<[u8; 48]>, CertificateError> {
        let inner = self.inner.read();
        let start = inner
            .certs
            .get(serial)
            .ok_or(CertificateError::InvalidChain)?;

        let mut chain = vec![*serial];
        let mut current = start;
        // Depth counts certificates below the candidate parent.
        loop {
            if current.local_trust & LOCAL_TRUST_FLAG_ROOT_CA != 0 {
                return Ok(chain);
            }
            let issuer_addr = current.cert.issuer.address();
            let depth = chain.len() as u32;
            let parent = inner.certs.values().find(|s| {
                s.cert.serial != current.cert.serial
                    && !chain.contains(&s.cert.serial)
                    && s.cert.max_path_length >= depth
                    && s.cert
                        .subject
                        .identities
                        .iter()
                        .any(|ci| ci.identity.address() == issuer_addr)
            });
            match parent {
                Some(p) => {
                    chain.push(p.cert.serial);
                    current = p;
                }
                None => return Err(CertificateError::InvalidChain),
            }
        }
    }

    /// Identities (with locators) drawn from subjects of certificates
    /// the operator flagged as listing the root set.
    pub fn roots(&self) -> Vec<(Identity, Option<Locator>)> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for s in inner.certs.values() {
            if s.local_trust & LOCAL_TRUST_FLAG_ROOT_SET != 0 {
                for ci in &s.cert.subject.identities {
                    out.push((ci.identity.public_clone(), ci.locator.clone()));
                }
            }
        }
        out
    }

    /// Serials of stored certificates now outside their validity
    /// window. Used by the background pass to emit traces.
    pub fn expired(&self, clock: i64) -> Vec<[u8; 48]> {
        self.inner
            .read()
            .certs
            .values()
            .filter(|s| clock < s.cert.validity.0 || clock > s.cert.validity.1)
            .map(|s| s.cert.serial)
            .collect()
    }

    pub fn all_serials(&self) -> Vec<[u8; 48]> {
        self.inner.read().certs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().certs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;

    fn make_cert(
        issuer: &Identity,
        subject_identity: &Identity,
        subject_ts: i64,
        unique_secret: Option<&[u8]>,
    ) -> Certificate {
        let mut subject = CertificateSubject {
            timestamp: subject_ts,
            identities: vec![CertificateIdentity {
                identity: subject_identity.public_clone(),
                locator: None,
            }],
            name: CertificateName {
                common_name: "test subject".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Some(sec) = unique_secret {
            subject.sign_unique_id(sec).unwrap();
        }
        let mut cert = Certificate {
            serial: [0u8; 48],
            flags: 0,
            timestamp: subject_ts,
            validity: (0, i64::MAX),
            subject,
            issuer: issuer.public_clone(),
            issuer_name: CertificateName::default(),
            extended_attributes: Vec::new(),
            max_path_length: 0,
            signature: Vec::new(),
        };
        cert.sign(issuer).unwrap();
        cert
    }

    #[test]
    fn serial_is_digest_of_unsigned_encoding() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let cert = make_cert(&issuer, &subject, 1000, None);

        let mut unsigned = Vec::new();
        cert.encode(false, &mut unsigned);
        assert_eq!(cert.serial, crypto::sha384(&unsigned));
        assert!(cert.verify(Some(5)).is_ok());
    }

    #[test]
    fn decode_round_trip_and_verify() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let (_, uid_secret) = new_subject_unique_id();
        let cert = make_cert(&issuer, &subject, 1000, Some(&uid_secret));

        let parsed = Certificate::decode(&cert.to_bytes(), Some(500)).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(parsed.serial, cert.serial);
    }

    #[test]
    fn verify_rejects_tampering() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let cert = make_cert(&issuer, &subject, 1000, None);

        let mut t = cert.clone();
        t.subject.timestamp += 1;
        // Serial no longer matches the encoding.
        assert_eq!(t.verify(Some(5)), Err(CertificateError::InvalidFormat));

        let mut t = cert.clone();
        t.subject.timestamp += 1;
        t.serial = t.compute_serial();
        assert_eq!(
            t.verify(Some(5)),
            Err(CertificateError::InvalidPrimarySignature)
        );

        let mut t = cert.clone();
        t.signature.clear();
        assert_eq!(
            t.verify(Some(5)),
            Err(CertificateError::MissingRequiredFields)
        );
    }

    #[test]
    fn validity_window_is_enforced() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let mut cert = make_cert(&issuer, &subject, 1000, None);
        cert.validity = (100, 200);
        cert.sign(&issuer).unwrap();

        assert!(cert.verify(Some(150)).is_ok());
        assert_eq!(
            cert.verify(Some(50)),
            Err(CertificateError::OutOfValidTimeWindow)
        );
        assert_eq!(
            cert.verify(Some(250)),
            Err(CertificateError::OutOfValidTimeWindow)
        );
        assert!(cert.verify(None).is_ok(), "no clock, no window check");
    }

    #[test]
    fn unique_id_proof_required_and_checked() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let (uid_pub, uid_secret) = new_subject_unique_id();
        let cert = make_cert(&issuer, &subject, 1000, Some(&uid_secret));
        assert_eq!(cert.subject.unique_id, uid_pub);
        assert!(cert.verify(Some(5)).is_ok());

        // Unique ID present but proof stripped.
        let mut t = cert.clone();
        t.subject.unique_id_proof_signature = vec![0u8; 96];
        t.serial = t.compute_serial();
        t.sign(&issuer).unwrap();
        assert_eq!(t.verify(Some(5)), Err(CertificateError::InvalidUniqueIdProof));
    }

    #[test]
    fn store_supersession_newest_wins() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let (_, uid_secret) = new_subject_unique_id();

        let c1 = make_cert(&issuer, &subject, 1000, Some(&uid_secret));
        let c2 = make_cert(&issuer, &subject, 2000, Some(&uid_secret));

        let store = CertificateStore::new();
        store.insert(c1.clone(), 0, 10, false).unwrap();
        store.insert(c2.clone(), 0, 10, false).unwrap();
        assert!(store.get(&c2.serial).is_some());

        // Re-inserting the older one fails and changes nothing.
        assert_eq!(
            store.insert(c1.clone(), 0, 10, false),
            Err(CertificateError::HaveNewerCert)
        );
        assert!(store.get(&c2.serial).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn store_rejects_invalid_unless_preverified() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let mut cert = make_cert(&issuer, &subject, 1000, None);
        cert.validity = (0, 5);
        cert.sign(&issuer).unwrap();

        let store = CertificateStore::new();
        assert_eq!(
            store.insert(cert.clone(), 0, 100, false),
            Err(CertificateError::OutOfValidTimeWindow)
        );
        // Caller vouching for verification bypasses the check.
        assert!(store.insert(cert, 0, 100, true).is_ok());
    }

    #[test]
    fn chain_walks_to_trusted_root() {
        let root = Identity::generate(IdentityKind::C25519).unwrap();
        let intermediate = Identity::generate(IdentityKind::C25519).unwrap();
        let leaf_subject = Identity::generate(IdentityKind::C25519).unwrap();

        // Root cert: self-issued, subject is the root identity itself.
        let mut root_cert = make_cert(&root, &root, 1, None);
        root_cert.max_path_length = 4;
        root_cert.sign(&root).unwrap();

        // Intermediate: issued by root, subject is the intermediate.
        let mut mid_cert = make_cert(&root, &intermediate, 2, None);
        mid_cert.max_path_length = 1;
        mid_cert.sign(&root).unwrap();

        // Leaf: issued by the intermediate.
        let leaf_cert = make_cert(&intermediate, &leaf_subject, 3, None);

        let store = CertificateStore::new();
        store
            .insert(root_cert.clone(), LOCAL_TRUST_FLAG_ROOT_CA, 10, false)
            .unwrap();
        store.insert(mid_cert.clone(), 0, 10, false).unwrap();
        store.insert(leaf_cert.clone(), 0, 10, false).unwrap();

        let chain = store.chain(&leaf_cert.serial).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], leaf_cert.serial);
        assert_eq!(chain[2], root_cert.serial);
    }

    #[test]
    fn chain_respects_max_path_length() {
        let root = Identity::generate(IdentityKind::C25519).unwrap();
        let intermediate = Identity::generate(IdentityKind::C25519).unwrap();
        let leaf_subject = Identity::generate(IdentityKind::C25519).unwrap();

        let mut root_cert = make_cert(&root, &root, 1, None);
        root_cert.max_path_length = 4;
        root_cert.sign(&root).unwrap();

        // Intermediate with path length zero may not sign anything.
        let mid_cert = make_cert(&root, &intermediate, 2, None);
        assert_eq!(mid_cert.max_path_length, 0);
        let leaf_cert = make_cert(&intermediate, &leaf_subject, 3, None);

        let store = CertificateStore::new();
        store
            .insert(root_cert, LOCAL_TRUST_FLAG_ROOT_CA, 10, false)
            .unwrap();
        store.insert(mid_cert, 0, 10, false).unwrap();
        store.insert(leaf_cert.clone(), 0, 10, false).unwrap();

        assert_eq!(
            store.chain(&leaf_cert.serial),
            Err(CertificateError::InvalidChain)
        );
    }

    #[test]
    fn root_set_flag_exposes_identities() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let root_id = Identity::generate(IdentityKind::C25519).unwrap();
        let loc = Locator::create(
            77,
            vec![crate::endpoint::Endpoint::IpUdp("192.0.2.1:9993".parse().unwrap())],
            &root_id,
        )
        .unwrap();

        let mut subject = CertificateSubject {
            timestamp: 5,
            identities: vec![CertificateIdentity {
                identity: root_id.public_clone(),
                locator: Some(loc.clone()),
            }],
            ..Default::default()
        };
        subject.name.common_name = "roots".into();
        let mut cert = Certificate {
            serial: [0u8; 48],
            flags: 0,
            timestamp: 5,
            validity: (0, i64::MAX),
            subject,
            issuer: issuer.public_clone(),
            issuer_name: CertificateName::default(),
            extended_attributes: Vec::new(),
            max_path_length: 0,
            signature: Vec::new(),
        };
        cert.sign(&issuer).unwrap();

        let store = CertificateStore::new();
        store
            .insert(cert, LOCAL_TRUST_FLAG_ROOT_SET, 10, false)
            .unwrap();

        let roots = store.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].0.address(), root_id.address());
        assert_eq!(roots[0].1.as_ref().unwrap().timestamp(), 77);
    }

    #[test]
    fn expired_lists_out_of_window_serials() {
        let issuer = Identity::generate(IdentityKind::C25519).unwrap();
        let subject = Identity::generate(IdentityKind::C25519).unwrap();
        let mut cert = make_cert(&issuer, &subject, 1000, None);
        cert.validity = (0, 100);
        cert.sign(&issuer).unwrap();
        let serial = cert.serial;

        let store = CertificateStore::new();
        store.insert(cert, 0, 50, false).unwrap();
        assert!(store.expired(50).is_empty());
        assert_eq!(store.expired(200), vec![serial]);
    }
}
