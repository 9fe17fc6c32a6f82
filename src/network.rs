//! Per-network VL2 state: the config request cycle, membership
//! credentials, multicast subscriptions, and filter application.
//!
//! A joined network starts in `RequestingConfiguration` and moves to
//! `Ok` when a config signed by its controller arrives, or to
//! `AccessDenied` / `NotFound` on a controller error reply. The
//! controller is named by the top 40 bits of the network ID, or pinned
//! explicitly by fingerprint at join time.
//!
//! Config bodies are bincode under a controller signature; bounded
//! deserialization keeps a hostile controller from ballooning memory.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use bincode::Options;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::credential::{CapabilityCredential, Com, CooCredential, CredentialKind, Revocation, TagCredential};
use crate::endpoint::Mac;
use crate::error::{CredentialError, FrameDropReason};
use crate::identity::{Address, Fingerprint, Identity};
use crate::protocol::{
    MAX_ASSIGNED_ADDRESSES, MAX_CERTIFICATES_OF_OWNERSHIP, MAX_NETWORK_CAPABILITIES,
    MAX_NETWORK_ROUTES, MAX_NETWORK_RULES, MAX_NETWORK_TAGS, MIN_VIRTUAL_MTU,
    NETWORK_CONFIG_REQUEST_TIMEOUT_MS,
};
use crate::rules::{self, FilterResult, FrameContext, Rule};

/// Maximum serialized config body we will deserialize.
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Default COM agreement window when a controller declares none.
pub const DEFAULT_CREDENTIAL_TIME_MAX_DELTA: i64 = 7_200_000;

const NETWORK_CONFIG_SIGNING_DOMAIN: &[u8] = b"weft-network-config-v1:";

/// Bincode options with a hard size limit. Always used for untrusted
/// input to prevent memory exhaustion.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_CONFIG_SIZE)
        .with_fixint_encoding()
}

pub(crate) fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// 64-bit network ID; the high 40 bits name the controller.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl NetworkId {
    /// The controller node's address, from the top 40 bits.
    pub fn controller_address(self) -> Option<Address> {
        Address::from_u64(self.0 >> 24)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(NetworkId)
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkId({:016x})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkStatus {
    RequestingConfiguration = 0,
    Ok = 1,
    AccessDenied = 2,
    NotFound = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkType {
    /// Membership gated by credentials.
    Private = 0,
    /// No access control; every member is authorized.
    Public = 1,
}

/// A managed IP assignment: address plus prefix length.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AssignedAddress {
    pub ip: IpAddr,
    pub prefix: u8,
}

/// A route pushed by the controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Route {
    pub target: AssignedAddress,
    pub via: Option<IpAddr>,
    pub flags: u16,
    pub metric: u16,
}

/// An Ethernet multicast group: MAC plus additional distinguishing
/// information (for IPv4 ARP scalability the broadcast MAC is
/// subscribed once per held IPv4 address, with the address as ADI).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

/// The controller-issued network configuration body.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: NetworkId,
    pub name: String,
    pub network_type: NetworkType,
    pub timestamp: i64,
    /// COM agreement window; zero means use the default.
    pub credential_time_max_delta: i64,
    pub revision: u64,
    pub mtu: u16,
    pub multicast_limit: u32,
    pub broadcast_enabled: bool,
    pub assigned_addresses: Vec<AssignedAddress>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    /// Capabilities granted to the receiving member.
    pub capabilities: Vec<CapabilityCredential>,
    /// Tags assigned to the receiving member.
    pub tags: Vec<TagCredential>,
    /// The receiving member's certificate of membership.
    pub com: Option<Com>,
    pub coos: Vec<CooCredential>,
}

impl NetworkConfig {
    pub fn credential_delta(&self) -> i64 {
        if self.credential_time_max_delta > 0 {
            self.credential_time_max_delta
        } else {
            DEFAULT_CREDENTIAL_TIME_MAX_DELTA
        }
    }

    fn within_limits(&self) -> bool {
        self.rules.len() <= MAX_NETWORK_RULES
            && self.capabilities.len() <= MAX_NETWORK_CAPABILITIES
            && self.tags.len() <= MAX_NETWORK_TAGS
            && self.coos.len() <= MAX_CERTIFICATES_OF_OWNERSHIP
            && self.assigned_addresses.len() <= MAX_ASSIGNED_ADDRESSES
            && self.routes.len() <= MAX_NETWORK_ROUTES
            && (self.mtu as usize) >= MIN_VIRTUAL_MTU
    }
}

/// A config body under the controller's signature, as carried by the
/// NETWORK_CONFIG verb and persisted to the data store.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SignedNetworkConfig {
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedNetworkConfig {
    pub fn sign(config: &NetworkConfig, controller: &Identity) -> Result<Self, CredentialError> {
        let body = bincode::serialize(config).map_err(|_| CredentialError::Invalid)?;
        let mut payload = NETWORK_CONFIG_SIGNING_DOMAIN.to_vec();
        payload.extend_from_slice(&body);
        let signature = controller
            .sign(&payload)
            .map_err(|_| CredentialError::Invalid)?;
        Ok(SignedNetworkConfig { body, signature })
    }

    /// Check the controller signature and parse the body.
    pub fn verify_and_parse(
        &self,
        controller: &Identity,
        expected: NetworkId,
    ) -> Result<NetworkConfig, CredentialError> {
        let mut payload = NETWORK_CONFIG_SIGNING_DOMAIN.to_vec();
        payload.extend_from_slice(&self.body);
        if !controller.verify(&payload, &self.signature) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        let config: NetworkConfig =
            deserialize_bounded(&self.body).map_err(|_| CredentialError::Invalid)?;
        if config.network_id != expected {
            return Err(CredentialError::WrongNetwork);
        }
        if !config.within_limits() {
            return Err(CredentialError::Invalid);
        }
        Ok(config)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, CredentialError> {
        deserialize_bounded(b).map_err(|_| CredentialError::Invalid)
    }
}

/// What we know about another member of this network.
#[derive(Default)]
struct Member {
    com: Option<Com>,
    tags: HashMap<u32, u32>,
    tag_timestamps: HashMap<u32, i64>,
    coos: Vec<CooCredential>,
    likes: HashSet<MulticastGroup>,
}

struct NetworkInner {
    status: NetworkStatus,
    config: Option<NetworkConfig>,
    /// Learned controller identity; verified against the pin or the
    /// network ID's embedded address before use.
    controller: Option<Identity>,
    request_sent_at: i64,
    request_retries: u32,
    members: HashMap<Address, Member>,
    /// Revocation thresholds keyed by (kind, credential id, target).
    revocations: HashMap<(u8, u32, Address), i64>,
    subscriptions: Vec<MulticastGroup>,
    our_tags: HashMap<u32, u32>,
}

/// One joined virtual network.
pub struct Network {
    id: NetworkId,
    pinned_controller: Option<Fingerprint>,
    inner: Mutex<NetworkInner>,
}

/// Snapshot handed to the host's network config callback.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub mac: Mac,
    pub name: String,
    pub status: NetworkStatus,
    pub network_type: NetworkType,
    pub mtu: u16,
    pub broadcast_enabled: bool,
    pub revision: u64,
    pub assigned_addresses: Vec<AssignedAddress>,
    pub routes: Vec<Route>,
}

impl Network {
    pub fn new(id: NetworkId, pinned_controller: Option<Fingerprint>) -> Self {
        Network {
            id,
            pinned_controller,
            inner: Mutex::new(NetworkInner {
                status: NetworkStatus::RequestingConfiguration,
                config: None,
                controller: None,
                request_sent_at: 0,
                request_retries: 0,
                members: HashMap::new(),
                revocations: HashMap::new(),
                subscriptions: Vec::new(),
                our_tags: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> NetworkId {
        self.id
    }

    /// The controller's address: the pinned fingerprint's when one was
    /// given at join, otherwise from the network ID's high bits.
    pub fn controller_address(&self) -> Option<Address> {
        match &self.pinned_controller {
            Some(fp) => Some(fp.address),
            None => self.id.controller_address(),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.inner.lock().status
    }

    pub fn config(&self) -> Option<NetworkConfig> {
        self.inner.lock().config.clone()
    }

    pub fn info(&self, our_address: Address) -> NetworkInfo {
        let inner = self.inner.lock();
        let mac = Mac::from_address(our_address, self.id.0);
        match &inner.config {
            Some(c) => NetworkInfo {
                id: self.id,
                mac,
                name: c.name.clone(),
                status: inner.status,
                network_type: c.network_type,
                mtu: c.mtu,
                broadcast_enabled: c.broadcast_enabled,
                revision: c.revision,
                assigned_addresses: c.assigned_addresses.clone(),
                routes: c.routes.clone(),
            },
            None => NetworkInfo {
                id: self.id,
                mac,
                name: String::new(),
                status: inner.status,
                network_type: NetworkType::Private,
                mtu: MIN_VIRTUAL_MTU as u16,
                broadcast_enabled: false,
                revision: 0,
                assigned_addresses: Vec::new(),
                routes: Vec::new(),
            },
        }
    }

    // -- config request cycle ----------------------------------------------

    /// Whether the request cycle calls for (another) config request.
    /// Retries back off exponentially from the base timeout while the
    /// network stays unconfigured; a held config re-requests at half
    /// its credential window to refresh the COM before expiry.
    pub fn config_request_due(&self, clock: i64) -> bool {
        let inner = self.inner.lock();
        match inner.status {
            NetworkStatus::RequestingConfiguration => {
                let backoff = NETWORK_CONFIG_REQUEST_TIMEOUT_MS
                    << inner.request_retries.saturating_sub(1).min(4);
                inner.request_sent_at == 0 || clock - inner.request_sent_at >= backoff
            }
            NetworkStatus::Ok => match &inner.config {
                Some(c) => {
                    clock - c.timestamp >= c.credential_delta() / 2
                        && clock - inner.request_sent_at >= NETWORK_CONFIG_REQUEST_TIMEOUT_MS
                }
                None => true,
            },
            // Terminal unless re-joined; NOT_FOUND re-probes slowly.
            NetworkStatus::AccessDenied | NetworkStatus::NotFound => false,
        }
    }

    pub fn config_requested(&self, clock: i64) {
        let mut inner = self.inner.lock();
        inner.request_sent_at = clock;
        inner.request_retries = inner.request_retries.saturating_add(1);
    }

    /// Revision we currently hold, sent with requests so an unchanged
    /// controller config need not be resent.
    pub fn held_revision(&self) -> u64 {
        self.inner
            .lock()
            .config
            .as_ref()
            .map(|c| c.revision)
            .unwrap_or(0)
    }

    /// Validate that `identity` may act as this network's controller.
    fn controller_acceptable(&self, identity: &Identity) -> bool {
        match &self.pinned_controller {
            Some(fp) => identity.fingerprint() == *fp,
            None => Some(identity.address()) == self.id.controller_address(),
        }
    }

    /// Apply a signed config received from `controller`. On success
    /// the network transitions to `Ok` and the previous status is
    /// returned (so the caller can emit up/update callbacks).
    pub fn handle_config(
        &self,
        signed: &SignedNetworkConfig,
        controller: &Identity,
        clock: i64,
    ) -> Result<NetworkStatus, CredentialError> {
        if !self.controller_acceptable(controller) {
            return Err(CredentialError::SignatureVerificationFailed);
        }
        let config = signed.verify_and_parse(controller, self.id)?;

        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.config {
            if existing.revision > config.revision {
                return Err(CredentialError::OlderThanLatest);
            }
        }

        // Our own credential set rides in with the config.
        let mut our_tags = HashMap::new();
        for t in &config.tags {
            if t.verify(controller, self.id.0).is_ok() {
                our_tags.insert(t.id, t.value);
            }
        }
        if let Some(com) = &config.com {
            com.verify(controller, self.id.0)?;
        } else if config.network_type == NetworkType::Private {
            return Err(CredentialError::Invalid);
        }

        let previous = inner.status;
        inner.status = NetworkStatus::Ok;
        inner.controller = Some(controller.public_clone());
        inner.our_tags = our_tags;
        inner.config = Some(config);
        inner.request_retries = 0;
        debug!(network = %self.id, revision = inner.config.as_ref().unwrap().revision, "network configuration installed");
        Ok(previous)
    }

    /// Apply a controller error reply to a config request.
    pub fn handle_config_error(&self, denied: bool) -> NetworkStatus {
        let mut inner = self.inner.lock();
        inner.status = if denied {
            NetworkStatus::AccessDenied
        } else {
            NetworkStatus::NotFound
        };
        warn!(network = %self.id, status = ?inner.status, "controller refused configuration");
        inner.status
    }

    /// Re-enter the request cycle (rejoin or cold start).
    pub fn reset_to_requesting(&self) {
        let mut inner = self.inner.lock();
        inner.status = NetworkStatus::RequestingConfiguration;
        inner.request_sent_at = 0;
        inner.request_retries = 0;
    }

    // -- remote member credentials -----------------------------------------

    /// Install credentials pushed by another member. Each is verified
    /// against the controller identity and the revocation table;
    /// within a kind, newer timestamps replace older ones.
    pub fn add_member_com(&self, from: Address, com: Com, clock: i64) -> Result<(), CredentialError> {
        let mut inner = self.inner.lock();
        let controller = inner
            .controller
            .clone()
            .ok_or(CredentialError::Invalid)?;
        com.verify(&controller, self.id.0)?;
        let _ = clock;
        if let Some(threshold) = inner
            .revocations
            .get(&(CredentialKind::Com as u8, 0, from))
        {
            if com.timestamp <= *threshold {
                return Err(CredentialError::Revoked);
            }
        }
        let member = inner.members.entry(from).or_default();
        if let Some(existing) = &member.com {
            if existing.timestamp > com.timestamp {
                return Err(CredentialError::OlderThanLatest);
            }
        }
        member.com = Some(com);
        Ok(())
    }

    pub fn add_member_tag(&self, from: Address, tag: TagCredential) -> Result<(), CredentialError> {
        let mut inner = self.inner.lock();
        let controller = inner
            .controller
            .clone()
            .ok_or(CredentialError::Invalid)?;
        tag.verify(&controller, self.id.0)?;
        if tag.issued_to != from {
            return Err(CredentialError::Invalid);
        }
        if let Some(threshold) = inner
            .revocations
            .get(&(CredentialKind::Tag as u8, tag.id, from))
        {
            if tag.timestamp <= *threshold {
                return Err(CredentialError::Revoked);
            }
        }
        let member = inner.members.entry(from).or_default();
        if let Some(existing_ts) = member.tag_timestamps.get(&tag.id) {
            if *existing_ts > tag.timestamp {
                return Err(CredentialError::OlderThanLatest);
            }
        }
        member.tag_timestamps.insert(tag.id, tag.timestamp);
        member.tags.insert(tag.id, tag.value);
        Ok(())
    }

    pub fn add_member_coo(&self, from: Address, coo: CooCredential) -> Result<(), CredentialError> {
        let mut inner = self.inner.lock();
        let controller = inner
            .controller
            .clone()
            .ok_or(CredentialError::Invalid)?;
        coo.verify(&controller, self.id.0)?;
        if coo.issued_to != from {
            return Err(CredentialError::Invalid);
        }
        if let Some(threshold) = inner
            .revocations
            .get(&(CredentialKind::Coo as u8, coo.id, from))
        {
            if coo.timestamp <= *threshold {
                return Err(CredentialError::Revoked);
            }
        }
        let member = inner.members.entry(from).or_default();
        member.coos.retain(|c| c.id != coo.id);
        if member.coos.len() < MAX_CERTIFICATES_OF_OWNERSHIP {
            member.coos.push(coo);
        }
        Ok(())
    }

    /// Apply a revocation: remember the threshold and immediately
    /// invalidate anything at or below it.
    pub fn add_revocation(&self, rev: Revocation) -> Result<(), CredentialError> {
        let mut inner = self.inner.lock();
        let controller = inner
            .controller
            .clone()
            .ok_or(CredentialError::Invalid)?;
        rev.verify(&controller, self.id.0)?;

        let key = (rev.kind as u8, rev.credential_id, rev.target);
        let threshold = inner.revocations.entry(key).or_insert(i64::MIN);
        if rev.threshold > *threshold {
            *threshold = rev.threshold;
        }
        let threshold = *threshold;

        if let Some(member) = inner.members.get_mut(&rev.target) {
            match rev.kind {
                CredentialKind::Com => {
                    if member
                        .com
                        .as_ref()
                        .map(|c| c.timestamp <= threshold)
                        .unwrap_or(false)
                    {
                        member.com = None;
                    }
                }
                CredentialKind::Tag => {
                    if member
                        .tag_timestamps
                        .get(&rev.credential_id)
                        .map(|ts| *ts <= threshold)
                        .unwrap_or(false)
                    {
                        member.tags.remove(&rev.credential_id);
                        member.tag_timestamps.remove(&rev.credential_id);
                    }
                }
                CredentialKind::Coo => {
                    member
                        .coos
                        .retain(|c| c.id != rev.credential_id || c.timestamp > threshold);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Gate for traffic to or from `member`: public networks always
    /// pass; private ones require our COM and theirs to mutually
    /// agree within the credential window.
    pub fn member_gate(&self, member: Address) -> bool {
        let inner = self.inner.lock();
        let config = match &inner.config {
            Some(c) => c,
            None => return false,
        };
        if config.network_type == NetworkType::Public {
            return true;
        }
        let ours = match &config.com {
            Some(c) => c,
            None => return false,
        };
        match inner.members.get(&member).and_then(|m| m.com.as_ref()) {
            Some(theirs) => ours.agrees_with(theirs, config.credential_delta()),
            None => false,
        }
    }

    /// Whether we have any COM to push to a member (sent alongside
    /// frames so the receiver can authorize us).
    pub fn our_com(&self) -> Option<Com> {
        self.inner.lock().config.as_ref().and_then(|c| c.com.clone())
    }

    // -- multicast ----------------------------------------------------------

    pub fn multicast_subscribe(&self, group: MulticastGroup) -> bool {
        let mut inner = self.inner.lock();
        if inner.subscriptions.contains(&group) {
            false
        } else {
            inner.subscriptions.push(group);
            true
        }
    }

    pub fn multicast_unsubscribe(&self, group: &MulticastGroup) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|g| g != group);
        inner.subscriptions.len() != before
    }

    pub fn subscriptions(&self) -> Vec<MulticastGroup> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn is_subscribed(&self, group: &MulticastGroup) -> bool {
        self.inner.lock().subscriptions.contains(group)
    }

    /// Record that a member announced interest in a group.
    pub fn add_member_like(&self, from: Address, group: MulticastGroup) {
        let mut inner = self.inner.lock();
        inner.members.entry(from).or_default().likes.insert(group);
    }

    /// Members known to want a group, capped by the config fan-out
    /// limit.
    pub fn members_for_group(&self, group: &MulticastGroup) -> Vec<Address> {
        let inner = self.inner.lock();
        let cap = inner
            .config
            .as_ref()
            .map(|c| c.multicast_limit.max(1) as usize)
            .unwrap_or(32);
        let mut out: Vec<Address> = inner
            .members
            .iter()
            .filter(|(_, m)| m.likes.contains(group))
            .map(|(a, _)| *a)
            .collect();
        out.sort();
        out.truncate(cap);
        out
    }

    /// All members we know of (for LIKE propagation).
    pub fn known_members(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.inner.lock().members.keys().copied().collect();
        out.sort();
        out
    }

    // -- filtering ----------------------------------------------------------

    /// Filter a frame. `inbound` selects which side's tags count as
    /// sender vs receiver; COO-backed authentication bits are computed
    /// from the sending member's certificates of ownership.
    #[allow(clippy::too_many_arguments)]
    pub fn filter_frame(
        &self,
        inbound: bool,
        remote: Address,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        frame: &[u8],
        our_address: Address,
    ) -> Result<FilterResult, FrameDropReason> {
        let inner = self.inner.lock();
        let config = match (&inner.config, inner.status) {
            (Some(c), NetworkStatus::Ok) => c,
            _ => return Err(FrameDropReason::PermissionDenied),
        };

        if dest_mac.is_broadcast() && !config.broadcast_enabled {
            return Err(FrameDropReason::BroadcastDisabled);
        }

        let empty = Member::default();
        let remote_member = inner.members.get(&remote).unwrap_or(&empty);
        let (sender_tags, receiver_tags) = if inbound {
            (&remote_member.tags, &inner.our_tags)
        } else {
            (&inner.our_tags, &remote_member.tags)
        };

        let (source_address, dest_address) = if inbound {
            (remote, our_address)
        } else {
            (our_address, remote)
        };

        // Sender authentication from certificates of ownership.
        let (ip_auth, mac_auth) = if inbound {
            sender_auth(&remote_member.coos, ethertype, frame, source_mac)
        } else {
            let our_coos = &config.coos;
            sender_auth(our_coos, ethertype, frame, source_mac)
        };

        let ctx = FrameContext {
            network_id: self.id.0,
            source_address,
            dest_address,
            source_mac,
            dest_mac,
            ethertype,
            vlan_id,
            frame,
            inbound,
            sender_ip_authenticated: ip_auth,
            sender_mac_authenticated: mac_auth,
        };

        let caps: Vec<(u32, &[Rule])> = config
            .capabilities
            .iter()
            .map(|c| (c.id, c.rules.as_slice()))
            .collect();

        let result = rules::filter_frame(&config.rules, &caps, &ctx, sender_tags, receiver_tags);
        if result.accept {
            trace!(network = %self.id, cap = ?result.matched_capability, "frame accepted");
            Ok(result)
        } else {
            Err(FrameDropReason::FilterBlocked)
        }
    }
}

fn sender_auth(coos: &[CooCredential], ethertype: u16, frame: &[u8], source_mac: Mac) -> (bool, bool) {
    let mac_auth = coos.iter().any(|c| c.owns_mac(source_mac));
    let ip_auth = source_ip(ethertype, frame)
        .map(|ip| coos.iter().any(|c| c.owns_ip(&ip)))
        .unwrap_or(false);
    (ip_auth, mac_auth)
}

fn source_ip(ethertype: u16, frame: &[u8]) -> Option<IpAddr> {
    match ethertype {
        0x0800 if frame.len() >= 20 => {
            let o: [u8; 4] = frame[12..16].try_into().ok()?;
            Some(IpAddr::from(o))
        }
        0x86dd if frame.len() >= 40 => {
            let o: [u8; 16] = frame[8..24].try_into().ok()?;
            Some(IpAddr::from(o))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;

    fn controller_for(id: NetworkId) -> (Identity, Network) {
        // Pin by fingerprint so tests need not grind an identity whose
        // address matches the network ID's high bits.
        let controller = Identity::generate(IdentityKind::C25519).unwrap();
        let network = Network::new(id, Some(controller.fingerprint()));
        (controller, network)
    }

    fn base_config(id: NetworkId, member: &Identity, controller: &Identity) -> NetworkConfig {
        let mut com = Com::new(id.0, 10_000, member.fingerprint());
        com.sign(controller).unwrap();
        NetworkConfig {
            network_id: id,
            name: "testnet".into(),
            network_type: NetworkType::Private,
            timestamp: 10_000,
            credential_time_max_delta: 60_000,
            revision: 1,
            mtu: 2800,
            multicast_limit: 32,
            broadcast_enabled: true,
            assigned_addresses: vec![AssignedAddress {
                ip: "10.147.17.2".parse().unwrap(),
                prefix: 24,
            }],
            routes: Vec::new(),
            rules: vec![Rule::action_accept()],
            capabilities: Vec::new(),
            tags: Vec::new(),
            com: Some(com),
            coos: Vec::new(),
        }
    }

    #[test]
    fn network_id_controller_address() {
        let id = NetworkId(0x0123456789_000001);
        assert_eq!(
            id.controller_address(),
            Address::from_u64(0x0123456789)
        );
        assert_eq!(id.to_string(), "0123456789000001");
        assert_eq!(NetworkId::from_hex("0123456789000001"), Some(id));
    }

    #[test]
    fn config_cycle_reaches_ok() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();

        assert_eq!(network.status(), NetworkStatus::RequestingConfiguration);
        assert!(network.config_request_due(0));
        network.config_requested(1_000);
        assert!(!network.config_request_due(1_000));
        assert!(network.config_request_due(1_000 + NETWORK_CONFIG_REQUEST_TIMEOUT_MS));

        let config = base_config(id, &member, &controller);
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        let prev = network.handle_config(&signed, &controller, 11_000).unwrap();
        assert_eq!(prev, NetworkStatus::RequestingConfiguration);
        assert_eq!(network.status(), NetworkStatus::Ok);
        assert_eq!(network.config().unwrap().name, "testnet");
    }

    #[test]
    fn config_from_wrong_controller_rejected() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();
        let imposter = Identity::generate(IdentityKind::C25519).unwrap();

        let config = base_config(id, &member, &controller);
        let signed = SignedNetworkConfig::sign(&config, &imposter).unwrap();
        assert!(network.handle_config(&signed, &imposter, 11_000).is_err());
        assert_eq!(network.status(), NetworkStatus::RequestingConfiguration);
    }

    #[test]
    fn stale_revision_rejected() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();

        let mut config = base_config(id, &member, &controller);
        config.revision = 5;
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        network.handle_config(&signed, &controller, 11_000).unwrap();

        config.revision = 3;
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        assert_eq!(
            network.handle_config(&signed, &controller, 12_000),
            Err(CredentialError::OlderThanLatest)
        );
    }

    #[test]
    fn error_replies_move_status() {
        let id = NetworkId(0xfada000000000001);
        let (_, network) = controller_for(id);
        assert_eq!(network.handle_config_error(true), NetworkStatus::AccessDenied);
        assert!(!network.config_request_due(i64::MAX - 1), "terminal");

        network.reset_to_requesting();
        assert_eq!(network.status(), NetworkStatus::RequestingConfiguration);
        assert_eq!(network.handle_config_error(false), NetworkStatus::NotFound);
    }

    #[test]
    fn private_config_requires_com() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();

        let mut config = base_config(id, &member, &controller);
        config.com = None;
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        assert_eq!(
            network.handle_config(&signed, &controller, 11_000),
            Err(CredentialError::Invalid)
        );
    }

    #[test]
    fn member_gate_needs_agreeing_coms() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();
        let peer = Identity::generate(IdentityKind::C25519).unwrap();

        let config = base_config(id, &member, &controller);
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        network.handle_config(&signed, &controller, 11_000).unwrap();

        // Unknown member: no COM, gate closed.
        assert!(!network.member_gate(peer.address()));

        // Agreeing COM opens it.
        let mut peer_com = Com::new(id.0, 12_000, peer.fingerprint());
        peer_com.sign(&controller).unwrap();
        network
            .add_member_com(peer.address(), peer_com, 12_000)
            .unwrap();
        assert!(network.member_gate(peer.address()));

        // A COM outside the window does not agree.
        let peer2 = Identity::generate(IdentityKind::C25519).unwrap();
        let mut old_com = Com::new(id.0, 10_000 - 70_000, peer2.fingerprint());
        old_com.sign(&controller).unwrap();
        network
            .add_member_com(peer2.address(), old_com, 12_000)
            .unwrap();
        assert!(!network.member_gate(peer2.address()));
    }

    #[test]
    fn revocation_invalidates_immediately() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();
        let peer = Identity::generate(IdentityKind::C25519).unwrap();

        let config = base_config(id, &member, &controller);
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        network.handle_config(&signed, &controller, 11_000).unwrap();

        let mut peer_com = Com::new(id.0, 12_000, peer.fingerprint());
        peer_com.sign(&controller).unwrap();
        network
            .add_member_com(peer.address(), peer_com.clone(), 12_000)
            .unwrap();
        assert!(network.member_gate(peer.address()));

        let mut rev = Revocation::new(id.0, 13_000, 12_500, CredentialKind::Com, 0, peer.address());
        rev.sign(&controller).unwrap();
        network.add_revocation(rev).unwrap();
        assert!(!network.member_gate(peer.address()));

        // Re-pushing the dead COM is rejected as revoked.
        assert_eq!(
            network.add_member_com(peer.address(), peer_com, 13_500),
            Err(CredentialError::Revoked)
        );
    }

    #[test]
    fn filter_blocks_before_config() {
        let id = NetworkId(0xfada000000000001);
        let (_, network) = controller_for(id);
        let a = Address::from_u64(0x1111111111).unwrap();
        let b = Address::from_u64(0x2222222222).unwrap();
        let r = network.filter_frame(
            false,
            b,
            Mac::from_address(a, id.0),
            Mac::from_address(b, id.0),
            0x0800,
            0,
            b"frame",
            a,
        );
        assert_eq!(r, Err(FrameDropReason::PermissionDenied));
    }

    #[test]
    fn filter_applies_rules_and_default_drop() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();

        let mut config = base_config(id, &member, &controller);
        config.rules = vec![
            Rule::match_ethertype(0x0806),
            Rule::action_accept(),
            Rule::action_drop(),
        ];
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        network.handle_config(&signed, &controller, 11_000).unwrap();

        let us = member.address();
        let them = Address::from_u64(0x2222222222).unwrap();
        let us_mac = Mac::from_address(us, id.0);
        let them_mac = Mac::from_address(them, id.0);

        let arp = network.filter_frame(false, them, us_mac, them_mac, 0x0806, 0, b"arp", us);
        assert!(arp.is_ok());

        let v4 = network.filter_frame(false, them, us_mac, them_mac, 0x0800, 0, b"ipv4", us);
        assert_eq!(v4, Err(FrameDropReason::FilterBlocked));
    }

    #[test]
    fn broadcast_disabled_blocks_broadcast() {
        let id = NetworkId(0xfada000000000001);
        let (controller, network) = controller_for(id);
        let member = Identity::generate(IdentityKind::C25519).unwrap();

        let mut config = base_config(id, &member, &controller);
        config.broadcast_enabled = false;
        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        network.handle_config(&signed, &controller, 11_000).unwrap();

        let us = member.address();
        let them = Address::from_u64(0x2222222222).unwrap();
        let r = network.filter_frame(
            false,
            them,
            Mac::from_address(us, id.0),
            Mac::BROADCAST,
            0x0806,
            0,
            b"arp",
            us,
        );
        assert_eq!(r, Err(FrameDropReason::BroadcastDisabled));
    }

    #[test]
    fn multicast_subscriptions_and_likes() {
        let id = NetworkId(0xfada000000000001);
        let (_, network) = controller_for(id);
        let group = MulticastGroup {
            mac: Mac::BROADCAST,
            adi: u32::from_be_bytes([10, 147, 17, 2]),
        };

        assert!(network.multicast_subscribe(group));
        assert!(!network.multicast_subscribe(group), "idempotent");
        assert!(network.is_subscribed(&group));
        assert_eq!(network.subscriptions(), vec![group]);

        let m1 = Address::from_u64(0x3333333333).unwrap();
        let m2 = Address::from_u64(0x4444444444).unwrap();
        network.add_member_like(m1, group);
        network.add_member_like(m2, group);
        assert_eq!(network.members_for_group(&group), vec![m1, m2]);

        assert!(network.multicast_unsubscribe(&group));
        assert!(!network.is_subscribed(&group));
    }

    #[test]
    fn signed_config_round_trips_bytes() {
        let id = NetworkId(0xfada000000000001);
        let controller = Identity::generate(IdentityKind::C25519).unwrap();
        let member = Identity::generate(IdentityKind::C25519).unwrap();
        let config = base_config(id, &member, &controller);

        let signed = SignedNetworkConfig::sign(&config, &controller).unwrap();
        let parsed = SignedNetworkConfig::from_bytes(&signed.to_bytes()).unwrap();
        assert_eq!(parsed, signed);
        let body = parsed.verify_and_parse(&controller, id).unwrap();
        assert_eq!(body, config);
    }
}
