//! # Node Orchestration
//!
//! [`Node`] is the single entry point for a driver embedding the core.
//! It owns the identity, the peer and network maps, and the trust
//! store, and it performs no I/O of its own: wire packets and tap
//! frames come in through `process_*` calls, everything going the
//! other way leaves through the [`Host`] trait, and the clock is
//! always a parameter.
//!
//! ## Threading
//!
//! Any number of `process_wire_packet` calls may run concurrently on
//! different threads. Shared structures are guarded per entity: one
//! lock per peer, one per network, one each for the peer map, network
//! map, and trust store. Host callbacks are invoked synchronously from
//! whatever thread triggered them, never while a map lock is held.
//!
//! ## Background work
//!
//! `process_background_tasks` drives keep-alives, WHOIS retries,
//! network config refresh, reassembly GC, certificate window checks,
//! and the online/offline edge. It returns the clock deadline by
//! which the driver must call again.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, trace};

use crate::buf::BufferPool;
use crate::cert::{Certificate, CertificateStore};
use crate::credential::{Com, CredentialKind};
use crate::endpoint::{Endpoint, Mac};
use crate::error::{
    CertificateError, CredentialError, FrameDropReason, PacketDropReason, ResultCode,
};
use crate::identity::{Address, Fingerprint, Identity, IdentityKind};
use crate::locator::Locator;
use crate::network::{
    Network, NetworkId, NetworkInfo, NetworkStatus, SignedNetworkConfig,
};
use crate::packet::{self, ReassemblyOutcome, ReassemblyTable, FLAG_FRAGMENTED};
use crate::peer::Peer;
use crate::protocol::*;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 4;
pub const VERSION_REVISION: u16 = 0;

/// EXT_FRAME flag: a certificate of membership precedes the frame.
const EXT_FRAME_FLAG_COM: u8 = 0x01;

/// Typed names for persisted state objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateObject {
    IdentityPublic,
    IdentitySecret,
    Locator,
    Peer(Address),
    NetworkConfig(NetworkId),
    TrustStore,
    Cert([u8; 48]),
}

impl StateObject {
    /// Logical object name under the driver's storage home.
    pub fn name(&self) -> String {
        match self {
            StateObject::IdentityPublic => "identity.public".into(),
            StateObject::IdentitySecret => "identity.secret".into(),
            StateObject::Locator => "locator".into(),
            StateObject::Peer(a) => format!("peers.d/{}", a),
            StateObject::NetworkConfig(n) => format!("networks.d/{}.conf", n),
            StateObject::TrustStore => "trust".into(),
            StateObject::Cert(serial) => format!("certs.d/{}", hex::encode(serial)),
        }
    }
}

/// Network config callback operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOperation {
    Up,
    Update,
    Down,
    Destroy,
}

/// Events delivered through the host event callback.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Node constructed and ready; always the first event.
    Up,
    Offline,
    Online,
    /// Node is shutting down.
    Down,
    Trace(TraceEvent),
    UserMessage {
        source: Address,
        type_id: u64,
        data: Vec<u8>,
    },
}

/// Structured diagnostics; these are remote-debuggable facts, not log
/// lines, so drivers can filter and forward them.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    IncomingPacketDropped {
        source: Option<Address>,
        remote: SocketAddr,
        reason: PacketDropReason,
    },
    OutgoingFrameDropped {
        network: NetworkId,
        reason: FrameDropReason,
    },
    IncomingFrameDropped {
        network: NetworkId,
        source: Address,
        reason: FrameDropReason,
    },
    NetworkConfigRequested {
        network: NetworkId,
    },
    NetworkFilter {
        network: NetworkId,
        accepted: bool,
        matched_capability: Option<u32>,
    },
    CredentialRejected {
        network: NetworkId,
        source: Address,
        kind: CredentialKind,
        reason: CredentialError,
    },
    TryingNewPath {
        peer: Address,
        remote: SocketAddr,
    },
    CertificateExpired {
        serial: [u8; 48],
    },
}

/// Everything the core needs from its embedding driver.
///
/// Callbacks are invoked synchronously from `process_*` and management
/// calls and must return promptly; they may be invoked from any
/// thread the driver uses to call into the node.
pub trait Host: Send + Sync {
    /// Persist a named object. An empty `data` deletes it.
    fn state_put(&self, object: StateObject, data: &[u8]);

    fn state_get(&self, object: StateObject) -> Option<Vec<u8>>;

    /// Send a UDP datagram. Return false if the send definitely
    /// failed (e.g. no such socket).
    fn wire_send(&self, local_socket: i64, remote: SocketAddr, data: &[u8], ttl: u32) -> bool;

    /// Inject an Ethernet frame into the virtual network's tap.
    fn virtual_network_frame(
        &self,
        network: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    );

    /// Network lifecycle and config updates.
    fn virtual_network_config(&self, network: NetworkId, op: ConfigOperation, info: &NetworkInfo);

    fn event(&self, event: Event);

    /// Veto a physical path (e.g. one that would recurse through a
    /// virtual interface). Default: accept everything.
    fn path_check(&self, _peer: Address, _local_socket: i64, _remote: SocketAddr) -> bool {
        true
    }

    /// Hint a physical address for a peer we have no path to.
    fn path_lookup(&self, _peer: Address) -> Option<SocketAddr> {
        None
    }

    /// Start an HTTP request on the core's behalf (certificate update
    /// URLs). Results come back through `process_http_response`.
    fn http_request(&self, _request_id: u64, _method: &str, _url: &str) {}
}

/// Current node status snapshot.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub address: Address,
    pub public_identity: String,
    pub secret_identity: String,
    pub online: bool,
}

/// Peer snapshot for the driver.
#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub address: Address,
    pub paths: Vec<crate::path::Path>,
    pub protocol_version: Option<u8>,
    pub is_root: bool,
}

struct WhoisEntry {
    parked: VecDeque<(i64, SocketAddr, Vec<u8>)>,
    last_sent: i64,
    retries: u32,
}

/// The node: top-level orchestrator over VL1 and VL2.
pub struct Node {
    identity: Identity,
    host: Arc<dyn Host>,
    pool: BufferPool,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    networks: RwLock<HashMap<NetworkId, Arc<Network>>>,
    trust: CertificateStore,
    roots: RwLock<Vec<Address>>,
    interface_addresses: RwLock<Vec<(SocketAddr, bool)>>,
    reassembly: Mutex<ReassemblyTable>,
    whois: Mutex<HashMap<Address, WhoisEntry>>,
    packet_counter: AtomicU64,
    online: AtomicBool,
    last_cert_check: AtomicI64,
}

impl Node {
    /// Create a node. The identity is loaded from the data store or,
    /// when none exists, generated and persisted (this is the slow
    /// path; expect up to a few seconds of proof-of-work).
    pub fn new(host: Arc<dyn Host>, clock: i64) -> Result<Node, ResultCode> {
        let identity = match host
            .state_get(StateObject::IdentitySecret)
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| Identity::from_string(s.trim()).ok())
            .filter(|id| id.has_private())
        {
            Some(id) => id,
            None => {
                let id = Identity::generate(IdentityKind::C25519)
                    .map_err(|_| ResultCode::FatalOutOfMemory)?;
                host.state_put(
                    StateObject::IdentitySecret,
                    id.to_string_with_private(true).as_bytes(),
                );
                host.state_put(
                    StateObject::IdentityPublic,
                    id.to_string_with_private(false).as_bytes(),
                );
                id
            }
        };
        debug!(address = %identity.address(), "node starting");

        let mut seed = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let node = Node {
            identity,
            host: host.clone(),
            pool: BufferPool::default(),
            peers: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            trust: CertificateStore::new(),
            roots: RwLock::new(Vec::new()),
            interface_addresses: RwLock::new(Vec::new()),
            reassembly: Mutex::new(ReassemblyTable::new(64)),
            whois: Mutex::new(HashMap::new()),
            packet_counter: AtomicU64::new(u64::from_be_bytes(seed) | 1),
            online: AtomicBool::new(false),
            last_cert_check: AtomicI64::new(clock),
        };
        host.event(Event::Up);
        Ok(node)
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.address(),
            public_identity: self.identity.to_string_with_private(false),
            secret_identity: self.identity.to_string_with_private(true),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    pub fn trust_store(&self) -> &CertificateStore {
        &self.trust
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let roots = self.roots.read().clone();
        self.peers
            .read()
            .values()
            .map(|p| PeerStatus {
                address: p.address(),
                paths: p.paths(),
                protocol_version: p.remote_protocol_version(),
                is_root: roots.contains(&p.address()),
            })
            .collect()
    }

    pub fn networks(&self) -> Vec<NetworkInfo> {
        let ours = self.address();
        self.networks
            .read()
            .values()
            .map(|n| n.info(ours))
            .collect()
    }

    pub fn network_info(&self, id: NetworkId) -> Option<NetworkInfo> {
        let ours = self.address();
        self.networks.read().get(&id).map(|n| n.info(ours))
    }

    fn next_packet_id(&self) -> u64 {
        self.packet_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.read().get(&address).cloned()
    }

    fn network(&self, id: NetworkId) -> Option<Arc<Network>> {
        self.networks.read().get(&id).cloned()
    }

    fn trace(&self, t: TraceEvent) {
        self.host.event(Event::Trace(t));
    }

    fn drop_packet(&self, source: Option<Address>, remote: SocketAddr, reason: PacketDropReason) {
        trace!(?source, %remote, ?reason, "inbound packet dropped");
        self.trace(TraceEvent::IncomingPacketDropped {
            source,
            remote,
            reason,
        });
    }

    /// Register (or fetch) peer state for a verified remote identity.
    fn add_peer_for_identity(&self, identity: Identity) -> Option<Arc<Peer>> {
        let address = identity.address();
        if address == self.address() {
            return None;
        }
        if let Some(p) = self.peer(address) {
            return Some(p);
        }
        let peer = Arc::new(Peer::new(&self.identity, identity.public_clone()).ok()?);
        self.peers.write().insert(address, peer.clone());
        self.host.state_put(
            StateObject::Peer(address),
            identity.to_string_with_private(false).as_bytes(),
        );
        Some(peer)
    }

    // ------------------------------------------------------------------
    // Wire input.
    // ------------------------------------------------------------------

    /// Feed one received UDP datagram into the node.
    pub fn process_wire_packet(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        data: &[u8],
    ) -> ResultCode {
        if data.len() < FRAGMENT_HEADER_SIZE {
            self.drop_packet(None, remote, PacketDropReason::MalformedPacket);
            return ResultCode::Ok;
        }

        if packet::is_fragment(data) {
            // Continuation fragments carry only the destination.
            let dest = Address::from_bytes(&data[PACKET_DEST_INDEX..PACKET_DEST_INDEX + 5].try_into().unwrap());
            match dest {
                Some(d) if d == self.address() => {
                    let outcome = self.reassembly.lock().add_fragment(clock, remote, data);
                    match outcome {
                        ReassemblyOutcome::Complete(whole) => {
                            self.handle_packet(clock, local_socket, remote, whole)
                        }
                        ReassemblyOutcome::Pending => {}
                        ReassemblyOutcome::Invalid => {
                            self.drop_packet(None, remote, PacketDropReason::MalformedPacket)
                        }
                    }
                }
                Some(_) => self.relay(clock, data.to_vec()),
                None => self.drop_packet(None, remote, PacketDropReason::MalformedPacket),
            }
            return ResultCode::Ok;
        }

        let header = match packet::PacketHeader::parse(data) {
            Ok(h) => h,
            Err(_) => {
                self.drop_packet(None, remote, PacketDropReason::MalformedPacket);
                return ResultCode::Ok;
            }
        };

        if header.dest != self.address() {
            self.relay(clock, data.to_vec());
            return ResultCode::Ok;
        }

        if header.flags & FLAG_FRAGMENTED != 0 {
            let outcome = self.reassembly.lock().add_head(clock, remote, data);
            match outcome {
                ReassemblyOutcome::Complete(whole) => {
                    self.handle_packet(clock, local_socket, remote, whole)
                }
                ReassemblyOutcome::Pending => {}
                ReassemblyOutcome::Invalid => {
                    self.drop_packet(None, remote, PacketDropReason::MalformedPacket)
                }
            }
            return ResultCode::Ok;
        }

        self.handle_packet(clock, local_socket, remote, data.to_vec());
        ResultCode::Ok
    }

    /// Forward a packet not addressed to us toward its destination,
    /// respecting the hop limit. When both ends are known directly,
    /// also coordinate a hole punch so they can stop relaying.
    fn relay(&self, clock: i64, mut data: Vec<u8>) {
        let is_frag = packet::is_fragment(&data);
        if is_frag {
            // Fragments keep their hop count at byte 15.
            if data.len() < FRAGMENT_HEADER_SIZE || data[15] >= MAX_HOPS {
                return;
            }
            data[15] += 1;
        } else if packet::increment_hops(&mut data).is_none() {
            return;
        }
        let dest = match Address::from_bytes(
            &data[PACKET_DEST_INDEX..PACKET_DEST_INDEX + 5].try_into().unwrap(),
        ) {
            Some(d) => d,
            None => return,
        };
        let dest_peer = match self.peer(dest) {
            Some(p) => p,
            None => return,
        };
        let path = match dest_peer.best_path(clock) {
            Some(p) => p,
            None => return,
        };
        if self.host.wire_send(path.0, path.1, &data, 0) {
            dest_peer.record_send(clock, path.0, path.1);
        }

        if !is_frag && data.len() >= MIN_PACKET_LENGTH {
            self.suggest_rendezvous(clock, &data, &dest_peer);
        }
    }

    /// Acting as the common relay for two peers we both reach
    /// directly, tell each the other's physical address so they can
    /// hole punch.
    fn suggest_rendezvous(&self, clock: i64, data: &[u8], dest_peer: &Arc<Peer>) {
        let source = match Address::from_bytes(
            &data[PACKET_SOURCE_INDEX..PACKET_SOURCE_INDEX + 5].try_into().unwrap(),
        ) {
            Some(s) => s,
            None => return,
        };
        let source_peer = match self.peer(source) {
            Some(p) => p,
            None => return,
        };
        if !dest_peer.allow_rendezvous(clock) {
            return;
        }
        let (src_path, dst_path) = match (source_peer.best_path(clock), dest_peer.best_path(clock))
        {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        self.send_vl1(
            clock,
            dest_peer,
            Verb::Rendezvous,
            &rendezvous_payload(source, src_path.1),
        );
        self.send_vl1(
            clock,
            &source_peer,
            Verb::Rendezvous,
            &rendezvous_payload(dest_peer.address(), dst_path.1),
        );
    }

    /// Authenticate, decrypt, and dispatch one whole packet addressed
    /// to this node.
    fn handle_packet(&self, clock: i64, local_socket: i64, remote: SocketAddr, mut data: Vec<u8>) {
        let header = match packet::PacketHeader::parse(&data) {
            Ok(h) => h,
            Err(_) => {
                self.drop_packet(None, remote, PacketDropReason::MalformedPacket);
                return;
            }
        };
        let cipher = match CipherSuite::from_bits(header.cipher) {
            Some(CipherSuite::AesGmacSiv) | None => {
                self.drop_packet(Some(header.source), remote, PacketDropReason::UnsupportedCipher);
                return;
            }
            Some(c) => c,
        };

        if let Some(peer) = self.peer(header.source) {
            let keys = peer.receive_keys();
            if packet::dearmor_in_place(&mut data, cipher, &keys).is_some() {
                self.dispatch(clock, local_socket, remote, &peer, &header, data);
                return;
            }
            // Fall through: a MAC failure on a known peer may still be
            // a valid HELLO after the remote lost session state.
        }

        // HELLO bootstrap: cleartext payload carries the identity.
        if cipher == CipherSuite::Poly1305None
            && data.len() > PACKET_VERB_INDEX
            && Verb::from_u8(data[PACKET_VERB_INDEX]) == Some(Verb::Hello)
        {
            self.handle_bootstrap_hello(clock, local_socket, remote, &header, data);
            return;
        }

        if self.peer(header.source).is_some() {
            self.drop_packet(Some(header.source), remote, PacketDropReason::MacFailed);
            return;
        }

        // Unknown peer: park the packet and resolve the identity.
        self.park_for_whois(clock, local_socket, remote, header.source, data);
    }

    /// Verify a HELLO from a peer we may not know yet. The payload is
    /// cleartext, so the embedded identity can be parsed first and the
    /// MAC verified against the static agreement key it implies.
    fn handle_bootstrap_hello(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        header: &packet::PacketHeader,
        mut data: Vec<u8>,
    ) {
        let parsed = parse_hello(&data[PAYLOAD_START + 1..]);
        let hello = match parsed {
            Some(h) => h,
            None => {
                self.drop_packet(Some(header.source), remote, PacketDropReason::MalformedPacket);
                return;
            }
        };
        if hello.identity.address() != header.source || !hello.identity.validate() {
            self.drop_packet(Some(header.source), remote, PacketDropReason::InvalidObject);
            return;
        }
        let peer = match self.add_peer_for_identity(hello.identity.clone()) {
            Some(p) => p,
            None => return,
        };
        let keys = [peer.static_key()];
        if packet::dearmor_in_place(&mut data, CipherSuite::Poly1305None, &keys).is_none() {
            self.drop_packet(Some(header.source), remote, PacketDropReason::MacFailed);
            return;
        }
        self.dispatch(clock, local_socket, remote, &peer, header, data);
    }

    fn park_for_whois(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        source: Address,
        data: Vec<u8>,
    ) {
        let send_now = {
            let mut whois = self.whois.lock();
            let entry = whois.entry(source).or_insert_with(|| WhoisEntry {
                parked: VecDeque::new(),
                last_sent: 0,
                retries: 0,
            });
            if entry.parked.len() >= WHOIS_PARK_QUEUE_LIMIT {
                entry.parked.pop_front();
            }
            entry.parked.push_back((local_socket, remote, data));
            if entry.last_sent == 0 {
                entry.last_sent = clock;
                entry.retries = 1;
                true
            } else {
                false
            }
        };
        if send_now {
            self.send_whois(clock, source);
        }
    }

    /// Dispatch a decrypted packet by verb.
    fn dispatch(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        header: &packet::PacketHeader,
        data: Vec<u8>,
    ) {
        if self.host.path_check(peer.address(), local_socket, remote) {
            peer.learn_path(clock, local_socket, remote);
        }

        let verb = match Verb::from_u8(data[PACKET_VERB_INDEX]) {
            Some(v) => v,
            None => {
                self.drop_packet(Some(header.source), remote, PacketDropReason::UnrecognizedVerb);
                return;
            }
        };
        let payload = &data[PAYLOAD_START + 1..];
        trace!(peer = %peer.address(), ?verb, len = payload.len(), "dispatch");

        match verb {
            Verb::Nop => {}
            Verb::Hello => self.handle_hello(clock, local_socket, remote, peer, header, payload),
            Verb::Ok => self.handle_ok(clock, local_socket, remote, peer, payload),
            Verb::Error => self.handle_error(clock, peer, payload),
            Verb::Whois => self.handle_whois(clock, peer, header, payload),
            Verb::Rendezvous => self.handle_rendezvous(clock, peer, payload),
            Verb::Echo => self.handle_echo(clock, peer, header, payload),
            Verb::Frame => self.handle_frame(clock, peer, payload),
            Verb::ExtFrame => self.handle_ext_frame(clock, peer, payload),
            Verb::MulticastLike => self.handle_multicast_like(clock, peer, payload),
            Verb::MulticastFrame => self.handle_multicast_frame(clock, peer, payload),
            Verb::NetworkConfigRequest => {
                // This node is not a controller; answer definitively so
                // the requester can move to NOT_FOUND.
                if payload.len() >= 8 {
                    let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    self.send_error_reply(
                        clock,
                        peer,
                        Verb::NetworkConfigRequest,
                        header.packet_id,
                        ERROR_OBJ_NOT_FOUND,
                        &nwid.to_be_bytes(),
                    );
                }
            }
            Verb::NetworkConfig => self.handle_network_config(clock, peer, payload),
            Verb::UserMessage => {
                if payload.len() >= 8 {
                    let type_id = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                    self.host.event(Event::UserMessage {
                        source: peer.address(),
                        type_id,
                        data: payload[8..].to_vec(),
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Verb handlers.
    // ------------------------------------------------------------------

    fn handle_hello(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        header: &packet::PacketHeader,
        payload: &[u8],
    ) {
        let hello = match parse_hello(payload) {
            Some(h) => h,
            None => {
                self.drop_packet(Some(peer.address()), remote, PacketDropReason::MalformedPacket);
                return;
            }
        };
        if hello.identity.address() != peer.address() {
            self.drop_packet(Some(peer.address()), remote, PacketDropReason::InvalidObject);
            return;
        }
        if !peer.allow_unsolicited_hello(clock) {
            self.drop_packet(Some(peer.address()), remote, PacketDropReason::RateLimitExceeded);
            return;
        }

        peer.hello_received(clock);
        peer.set_remote_protocol_version(hello.protocol_version);
        if let Some(loc) = hello.locator {
            if loc.verify(peer.identity()) {
                peer.set_locator(loc);
            }
        }

        // An authenticated HELLO proves this path carries their
        // traffic to us; our OK completes the round trip for them.
        peer.confirm_path(clock, local_socket, remote);

        // Responder half of the session schedule.
        let mut responder_nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut responder_nonce);
        peer.establish_session(clock, &hello.nonce, &responder_nonce, false);

        // OK(HELLO): echo packet ID and timestamp, carry our nonce.
        let mut reply = Vec::with_capacity(64);
        reply.push(Verb::Hello as u8);
        reply.extend_from_slice(&header.packet_id.to_be_bytes());
        reply.extend_from_slice(&hello.timestamp.to_be_bytes());
        reply.push(PROTOCOL_VERSION);
        reply.push(VERSION_MAJOR);
        reply.push(VERSION_MINOR);
        reply.extend_from_slice(&VERSION_REVISION.to_be_bytes());
        reply.extend_from_slice(&responder_nonce);

        self.send_on(
            clock,
            peer,
            local_socket,
            remote,
            Verb::Ok,
            &reply,
            CipherSuite::Poly1305None,
        );
    }

    fn handle_ok(
        &self,
        clock: i64,
        local_socket: i64,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        payload: &[u8],
    ) {
        if payload.len() < 9 {
            return;
        }
        let in_re = Verb::from_u8(payload[0]);
        let body = &payload[9..];
        match in_re {
            Some(Verb::Hello) => {
                if body.len() < 8 + 5 + 16 {
                    return;
                }
                let initiator_nonce = match peer.pending_hello_nonce() {
                    Some(n) => n,
                    None => {
                        self.drop_packet(
                            Some(peer.address()),
                            remote,
                            PacketDropReason::ReplyNotExpected,
                        );
                        return;
                    }
                };
                peer.set_remote_protocol_version(body[8]);
                let mut responder_nonce = [0u8; 16];
                responder_nonce.copy_from_slice(&body[13..29]);
                peer.establish_session(clock, &initiator_nonce, &responder_nonce, true);
                peer.confirm_path(clock, local_socket, remote);
                peer.hello_received(clock);
                debug!(peer = %peer.address(), "hello round trip complete");
            }
            Some(Verb::Whois) => self.handle_whois_reply(clock, body),
            Some(Verb::Echo) => {}
            Some(Verb::NetworkConfigRequest) | Some(Verb::NetworkConfig) => {}
            _ => {}
        }
    }

    fn handle_error(&self, _clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        if payload.len() < 10 {
            return;
        }
        let in_re = Verb::from_u8(payload[0]);
        let code = payload[9];
        let body = &payload[10..];

        if in_re == Some(Verb::NetworkConfigRequest) && body.len() >= 8 {
            let nwid = NetworkId(u64::from_be_bytes(body[0..8].try_into().unwrap()));
            let network = match self.network(nwid) {
                Some(n) => n,
                None => return,
            };
            // Only the network's controller may decide membership.
            if Some(peer.address()) != network.controller_address() {
                return;
            }
            let denied = code == ERROR_NETWORK_ACCESS_DENIED;
            if denied || code == ERROR_OBJ_NOT_FOUND {
                network.handle_config_error(denied);
                let info = network.info(self.address());
                self.host
                    .virtual_network_config(nwid, ConfigOperation::Down, &info);
            }
        }
    }

    fn handle_whois(
        &self,
        clock: i64,
        peer: &Arc<Peer>,
        header: &packet::PacketHeader,
        payload: &[u8],
    ) {
        if !peer.allow_whois(clock) {
            self.trace(TraceEvent::IncomingPacketDropped {
                source: Some(peer.address()),
                remote: peer.any_path().map(|(_, r)| r).unwrap_or_else(unspecified_addr),
                reason: PacketDropReason::RateLimitExceeded,
            });
            return;
        }
        let mut reply = Vec::with_capacity(128);
        reply.push(Verb::Whois as u8);
        reply.extend_from_slice(&header.packet_id.to_be_bytes());
        let mut found_any = false;
        for chunk in payload.chunks_exact(5) {
            let addr = match Address::from_bytes(&chunk.try_into().unwrap()) {
                Some(a) => a,
                None => continue,
            };
            let identity = if addr == self.address() {
                Some(self.identity.public_clone())
            } else {
                self.peer(addr).map(|p| p.identity().clone())
            };
            if let Some(id) = identity {
                let raw = id.to_bytes(false);
                reply.extend_from_slice(&(raw.len() as u16).to_be_bytes());
                reply.extend_from_slice(&raw);
                found_any = true;
            }
        }
        if found_any {
            self.send_vl1(clock, peer, Verb::Ok, &reply);
        } else if payload.len() >= 5 {
            self.send_error_reply(
                clock,
                peer,
                Verb::Whois,
                header.packet_id,
                ERROR_OBJ_NOT_FOUND,
                &payload[0..5],
            );
        }
    }

    fn handle_whois_reply(&self, clock: i64, mut body: &[u8]) {
        while body.len() >= 2 {
            let len = u16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
            if body.len() < 2 + len {
                return;
            }
            let raw = &body[2..2 + len];
            body = &body[2 + len..];

            let identity = match Identity::from_bytes(raw) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if !identity.validate() {
                continue;
            }
            let address = identity.address();
            let parked = {
                let mut whois = self.whois.lock();
                whois.remove(&address)
            };
            if parked.is_none() {
                continue;
            }
            if self.add_peer_for_identity(identity).is_none() {
                continue;
            }
            debug!(peer = %address, "whois resolved, replaying parked packets");
            if let Some(entry) = parked {
                for (ls, remote, packet) in entry.parked {
                    self.handle_packet(clock, ls, remote, packet);
                }
            }
        }
    }

    fn handle_rendezvous(&self, clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        // Rendezvous instructions are only honored from roots.
        if !self.roots.read().contains(&peer.address()) {
            return;
        }
        if !peer.allow_rendezvous(clock) {
            return;
        }
        if payload.len() < 9 {
            return;
        }
        let with = match Address::from_bytes(&payload[1..6].try_into().unwrap()) {
            Some(a) => a,
            None => return,
        };
        let port = u16::from_be_bytes(payload[6..8].try_into().unwrap());
        let addr_len = payload[8] as usize;
        if payload.len() < 9 + addr_len {
            return;
        }
        let ip = match addr_len {
            4 => {
                let o: [u8; 4] = payload[9..13].try_into().unwrap();
                std::net::IpAddr::from(o)
            }
            16 => {
                let o: [u8; 16] = payload[9..25].try_into().unwrap();
                std::net::IpAddr::from(o)
            }
            _ => return,
        };
        let remote = SocketAddr::new(ip, port);
        let target = match self.peer(with) {
            Some(p) => p,
            None => return,
        };
        if !self.host.path_check(with, -1, remote) {
            return;
        }
        // Hole punch: fire a HELLO directly at the advertised address.
        self.trace(TraceEvent::TryingNewPath {
            peer: with,
            remote,
        });
        self.send_hello(clock, &target, Some((-1, remote)));
    }

    fn handle_echo(
        &self,
        clock: i64,
        peer: &Arc<Peer>,
        header: &packet::PacketHeader,
        payload: &[u8],
    ) {
        if !peer.allow_echo(clock) {
            self.trace(TraceEvent::IncomingPacketDropped {
                source: Some(peer.address()),
                remote: peer.any_path().map(|(_, r)| r).unwrap_or_else(unspecified_addr),
                reason: PacketDropReason::RateLimitExceeded,
            });
            return;
        }
        let mut reply = Vec::with_capacity(9 + payload.len());
        reply.push(Verb::Echo as u8);
        reply.extend_from_slice(&header.packet_id.to_be_bytes());
        reply.extend_from_slice(payload);
        self.send_vl1(clock, peer, Verb::Ok, &reply);
    }

    fn deliver_frame(
        &self,
        network: &Arc<Network>,
        source: Address,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
    ) {
        match network.filter_frame(
            true,
            source,
            source_mac,
            dest_mac,
            ethertype,
            0,
            frame,
            self.address(),
        ) {
            Ok(result) => {
                self.trace(TraceEvent::NetworkFilter {
                    network: network.id(),
                    accepted: true,
                    matched_capability: result.matched_capability,
                });
                self.host
                    .virtual_network_frame(network.id(), source_mac, dest_mac, ethertype, 0, frame);
            }
            Err(reason) => {
                if reason == FrameDropReason::FilterBlocked {
                    self.trace(TraceEvent::NetworkFilter {
                        network: network.id(),
                        accepted: false,
                        matched_capability: None,
                    });
                }
                self.trace(TraceEvent::IncomingFrameDropped {
                    network: network.id(),
                    source,
                    reason,
                });
            }
        }
    }

    fn handle_frame(&self, _clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        if payload.len() < 10 {
            return;
        }
        let nwid = NetworkId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
        let ethertype = u16::from_be_bytes(payload[8..10].try_into().unwrap());
        let frame = &payload[10..];
        let network = match self.network(nwid) {
            Some(n) => n,
            None => return,
        };
        if !network.member_gate(peer.address()) {
            self.trace(TraceEvent::IncomingFrameDropped {
                network: nwid,
                source: peer.address(),
                reason: FrameDropReason::PermissionDenied,
            });
            return;
        }
        let source_mac = Mac::from_address(peer.address(), nwid.0);
        let dest_mac = Mac::from_address(self.address(), nwid.0);
        self.deliver_frame(&network, peer.address(), source_mac, dest_mac, ethertype, frame);
    }

    fn handle_ext_frame(&self, clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        if payload.len() < 8 + 1 + 6 + 6 + 2 {
            return;
        }
        let nwid = NetworkId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
        let flags = payload[8];
        let dest_mac = Mac::from_bytes(&payload[9..15].try_into().unwrap());
        let source_mac = Mac::from_bytes(&payload[15..21].try_into().unwrap());
        let ethertype = u16::from_be_bytes(payload[21..23].try_into().unwrap());
        let mut rest = &payload[23..];

        let network = match self.network(nwid) {
            Some(n) => n,
            None => return,
        };

        if flags & EXT_FRAME_FLAG_COM != 0 {
            if rest.len() < 2 {
                return;
            }
            let com_len = u16::from_be_bytes(rest[0..2].try_into().unwrap()) as usize;
            if rest.len() < 2 + com_len {
                return;
            }
            if let Ok(com) = crate::network::deserialize_bounded::<Com>(&rest[2..2 + com_len]) {
                if let Err(reason) = network.add_member_com(peer.address(), com, clock) {
                    self.trace(TraceEvent::CredentialRejected {
                        network: nwid,
                        source: peer.address(),
                        kind: CredentialKind::Com,
                        reason,
                    });
                }
            }
            rest = &rest[2 + com_len..];
        }

        if !network.member_gate(peer.address()) {
            self.trace(TraceEvent::IncomingFrameDropped {
                network: nwid,
                source: peer.address(),
                reason: FrameDropReason::PermissionDenied,
            });
            return;
        }

        // No bridging: the embedded source MAC must be the sender's
        // own network MAC.
        if source_mac != Mac::from_address(peer.address(), nwid.0) {
            self.trace(TraceEvent::IncomingFrameDropped {
                network: nwid,
                source: peer.address(),
                reason: FrameDropReason::BridgingNotAllowedRemote,
            });
            return;
        }

        self.deliver_frame(&network, peer.address(), source_mac, dest_mac, ethertype, rest);
    }

    fn handle_multicast_like(&self, _clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        for chunk in payload.chunks_exact(18) {
            let nwid = NetworkId(u64::from_be_bytes(chunk[0..8].try_into().unwrap()));
            let mac = Mac::from_bytes(&chunk[8..14].try_into().unwrap());
            let adi = u32::from_be_bytes(chunk[14..18].try_into().unwrap());
            if let Some(network) = self.network(nwid) {
                if network.member_gate(peer.address()) {
                    network.add_member_like(
                        peer.address(),
                        crate::network::MulticastGroup { mac, adi },
                    );
                }
            }
        }
    }

    fn handle_multicast_frame(&self, _clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        if payload.len() < 8 + 1 + 6 + 4 + 2 {
            return;
        }
        let nwid = NetworkId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
        let group_mac = Mac::from_bytes(&payload[9..15].try_into().unwrap());
        let adi = u32::from_be_bytes(payload[15..19].try_into().unwrap());
        let ethertype = u16::from_be_bytes(payload[19..21].try_into().unwrap());
        let frame = &payload[21..];

        let network = match self.network(nwid) {
            Some(n) => n,
            None => return,
        };
        if !network.member_gate(peer.address()) {
            self.trace(TraceEvent::IncomingFrameDropped {
                network: nwid,
                source: peer.address(),
                reason: FrameDropReason::PermissionDenied,
            });
            return;
        }
        let group = crate::network::MulticastGroup { mac: group_mac, adi };
        if !network.is_subscribed(&group) && !group_mac.is_broadcast() {
            self.trace(TraceEvent::IncomingFrameDropped {
                network: nwid,
                source: peer.address(),
                reason: FrameDropReason::MulticastDisabled,
            });
            return;
        }
        let source_mac = Mac::from_address(peer.address(), nwid.0);
        self.deliver_frame(&network, peer.address(), source_mac, group_mac, ethertype, frame);
    }

    fn handle_network_config(&self, clock: i64, peer: &Arc<Peer>, payload: &[u8]) {
        if payload.len() < 8 {
            return;
        }
        let nwid = NetworkId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
        let network = match self.network(nwid) {
            Some(n) => n,
            None => return,
        };
        let signed = match SignedNetworkConfig::from_bytes(&payload[8..]) {
            Ok(s) => s,
            Err(_) => return,
        };
        match network.handle_config(&signed, peer.identity(), clock) {
            Ok(previous) => {
                self.host.state_put(
                    StateObject::NetworkConfig(nwid),
                    &signed.to_bytes(),
                );
                let info = network.info(self.address());
                let op = if previous == NetworkStatus::Ok {
                    ConfigOperation::Update
                } else {
                    ConfigOperation::Up
                };
                self.host.virtual_network_config(nwid, op, &info);
            }
            Err(reason) => {
                self.trace(TraceEvent::CredentialRejected {
                    network: nwid,
                    source: peer.address(),
                    kind: CredentialKind::Null,
                    reason,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound.
    // ------------------------------------------------------------------

    /// Send a verb to a peer on its best path, relaying through the
    /// best root when no direct path exists. Fragments as needed.
    fn send_vl1(&self, clock: i64, peer: &Arc<Peer>, verb: Verb, payload: &[u8]) -> bool {
        let path = peer
            .best_path(clock)
            .or_else(|| peer.any_path())
            .or_else(|| self.host.path_lookup(peer.address()).map(|sa| (-1, sa)));
        match path {
            Some((ls, remote)) => self.send_on(
                clock,
                peer,
                ls,
                remote,
                verb,
                payload,
                CipherSuite::Poly1305Salsa2012,
            ),
            None => {
                // Relay via the best root: same packet, sent to the
                // root's path with the real destination in the header.
                let root = self.best_root(clock);
                match root {
                    Some(root_peer) if root_peer.address() != peer.address() => {
                        match root_peer.best_path(clock).or_else(|| root_peer.any_path()) {
                            Some((ls, remote)) => self.send_on(
                                clock,
                                peer,
                                ls,
                                remote,
                                verb,
                                payload,
                                CipherSuite::Poly1305Salsa2012,
                            ),
                            None => false,
                        }
                    }
                    _ => false,
                }
            }
        }
    }

    /// Build, armor, fragment, and transmit one packet on an explicit
    /// (socket, address) pair.
    #[allow(clippy::too_many_arguments)]
    fn send_on(
        &self,
        clock: i64,
        peer: &Arc<Peer>,
        local_socket: i64,
        remote: SocketAddr,
        verb: Verb,
        payload: &[u8],
        cipher: CipherSuite,
    ) -> bool {
        let key = match cipher {
            CipherSuite::Poly1305None => peer.static_key(),
            _ => peer.send_key(clock),
        };
        let packet_id = self.next_packet_id();

        let mut buf = self.pool.get();
        let built = packet::build(
            &mut buf,
            packet_id,
            peer.address(),
            self.address(),
            cipher,
            &key,
            verb,
            payload,
        );
        if built.is_err() {
            self.pool.release(buf);
            return false;
        }

        let pieces = match packet::fragment(buf.as_slice(), DEFAULT_UDP_MTU) {
            Ok(p) => p,
            Err(_) => {
                self.pool.release(buf);
                return false;
            }
        };
        let mut ok = true;
        for piece in &pieces {
            ok &= self.host.wire_send(local_socket, remote, piece, 0);
        }
        self.pool.release(buf);
        if ok {
            peer.record_send(clock, local_socket, remote);
        }
        ok
    }

    fn send_error_reply(
        &self,
        clock: i64,
        peer: &Arc<Peer>,
        in_re: Verb,
        in_re_packet_id: u64,
        code: u8,
        body: &[u8],
    ) {
        let mut payload = Vec::with_capacity(10 + body.len());
        payload.push(in_re as u8);
        payload.extend_from_slice(&in_re_packet_id.to_be_bytes());
        payload.push(code);
        payload.extend_from_slice(body);
        self.send_vl1(clock, peer, Verb::Error, &payload);
    }

    /// Send a HELLO to a peer, optionally on an explicit endpoint
    /// (used for hole punching and explicit tries).
    fn send_hello(&self, clock: i64, peer: &Arc<Peer>, endpoint: Option<(i64, SocketAddr)>) {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut payload = Vec::with_capacity(128);
        payload.push(PROTOCOL_VERSION);
        payload.push(VERSION_MAJOR);
        payload.push(VERSION_MINOR);
        payload.extend_from_slice(&VERSION_REVISION.to_be_bytes());
        payload.extend_from_slice(&clock.to_be_bytes());
        payload.extend_from_slice(&nonce);
        let id_raw = self.identity.to_bytes(false);
        payload.extend_from_slice(&(id_raw.len() as u16).to_be_bytes());
        payload.extend_from_slice(&id_raw);
        match self.current_locator() {
            Some(loc) => {
                payload.push(1);
                loc.marshal(&mut payload);
            }
            None => payload.push(0),
        }

        let target = endpoint.or_else(|| peer.best_path(clock).or_else(|| peer.any_path()));
        let sent = match target {
            Some((ls, remote)) => self.send_on(
                clock,
                peer,
                ls,
                remote,
                Verb::Hello,
                &payload,
                CipherSuite::Poly1305None,
            ),
            None => false,
        };
        if sent {
            peer.hello_sent(clock, nonce);
        }
    }

    fn send_whois(&self, clock: i64, address: Address) {
        if let Some(root) = self.best_root(clock) {
            let mut payload = Vec::with_capacity(5);
            payload.extend_from_slice(&address.to_bytes());
            self.send_vl1(clock, &root, Verb::Whois, &payload);
        }
    }

    fn best_root(&self, clock: i64) -> Option<Arc<Peer>> {
        let roots = self.roots.read().clone();
        let peers = self.peers.read();
        let mut best: Option<Arc<Peer>> = None;
        for addr in roots {
            if let Some(p) = peers.get(&addr) {
                let better = match &best {
                    None => true,
                    Some(b) => p.has_alive_path(clock) && !b.has_alive_path(clock),
                };
                if better {
                    best = Some(p.clone());
                }
            }
        }
        best
    }

    fn current_locator(&self) -> Option<Locator> {
        self.host
            .state_get(StateObject::Locator)
            .and_then(|raw| Locator::from_bytes(&raw).ok())
    }

    // ------------------------------------------------------------------
    // VL2 egress.
    // ------------------------------------------------------------------

    /// Feed one Ethernet frame from the tap into a virtual network.
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        clock: i64,
        nwid: NetworkId,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        frame: &[u8],
    ) -> ResultCode {
        let network = match self.network(nwid) {
            Some(n) => n,
            None => return ResultCode::ErrorNetworkNotFound,
        };

        if source_mac != Mac::from_address(self.address(), nwid.0) {
            self.trace(TraceEvent::OutgoingFrameDropped {
                network: nwid,
                reason: FrameDropReason::BridgingNotAllowedLocal,
            });
            return ResultCode::Ok;
        }

        if dest_mac.is_multicast() {
            return self.send_multicast_frame(clock, &network, dest_mac, ethertype, vlan_id, frame);
        }

        let dest = match dest_mac.to_address(nwid.0) {
            Some(d) if d != self.address() => d,
            _ => {
                self.trace(TraceEvent::OutgoingFrameDropped {
                    network: nwid,
                    reason: FrameDropReason::Unspecified,
                });
                return ResultCode::Ok;
            }
        };

        let result = match network.filter_frame(
            false,
            dest,
            source_mac,
            dest_mac,
            ethertype,
            vlan_id,
            frame,
            self.address(),
        ) {
            Ok(r) => r,
            Err(reason) => {
                self.trace(TraceEvent::NetworkFilter {
                    network: nwid,
                    accepted: false,
                    matched_capability: None,
                });
                self.trace(TraceEvent::OutgoingFrameDropped {
                    network: nwid,
                    reason,
                });
                return ResultCode::Ok;
            }
        };
        self.trace(TraceEvent::NetworkFilter {
            network: nwid,
            accepted: true,
            matched_capability: result.matched_capability,
        });

        let final_dest = result.redirect.unwrap_or(dest);
        self.send_unicast_frame(clock, &network, final_dest, source_mac, dest_mac, ethertype, frame);

        for (observer, length) in result.tees.iter().chain(result.watches.iter()) {
            let cut = if *length == 0 {
                frame.len()
            } else {
                (*length as usize).min(frame.len())
            };
            self.send_unicast_frame(
                clock,
                &network,
                *observer,
                source_mac,
                dest_mac,
                ethertype,
                &frame[..cut],
            );
        }
        ResultCode::Ok
    }

    fn send_unicast_frame(
        &self,
        clock: i64,
        network: &Arc<Network>,
        dest: Address,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        frame: &[u8],
    ) {
        let peer = match self.peer(dest) {
            Some(p) => p,
            None => {
                // Resolve and let upper layers retransmit.
                self.park_nothing_and_whois(clock, dest);
                return;
            }
        };

        // Push our COM with the frame so the receiver can authorize
        // us; EXT_FRAME carries it inline.
        let com = network.our_com();
        let nwid = network.id();
        match com {
            Some(com) => {
                let com_raw = bincode::serialize(&com).unwrap_or_default();
                let mut payload =
                    Vec::with_capacity(8 + 1 + 6 + 6 + 2 + 2 + com_raw.len() + frame.len());
                payload.extend_from_slice(&nwid.0.to_be_bytes());
                payload.push(EXT_FRAME_FLAG_COM);
                payload.extend_from_slice(&dest_mac.to_bytes());
                payload.extend_from_slice(&source_mac.to_bytes());
                payload.extend_from_slice(&ethertype.to_be_bytes());
                payload.extend_from_slice(&(com_raw.len() as u16).to_be_bytes());
                payload.extend_from_slice(&com_raw);
                payload.extend_from_slice(frame);
                self.send_vl1(clock, &peer, Verb::ExtFrame, &payload);
            }
            None => {
                let mut payload = Vec::with_capacity(10 + frame.len());
                payload.extend_from_slice(&nwid.0.to_be_bytes());
                payload.extend_from_slice(&ethertype.to_be_bytes());
                payload.extend_from_slice(frame);
                self.send_vl1(clock, &peer, Verb::Frame, &payload);
            }
        }
    }

    fn park_nothing_and_whois(&self, clock: i64, address: Address) {
        let send_now = {
            let mut whois = self.whois.lock();
            match whois.get(&address) {
                Some(_) => false,
                None => {
                    whois.insert(
                        address,
                        WhoisEntry {
                            parked: VecDeque::new(),
                            last_sent: clock,
                            retries: 1,
                        },
                    );
                    true
                }
            }
        };
        if send_now {
            self.send_whois(clock, address);
        }
    }

    fn send_multicast_frame(
        &self,
        clock: i64,
        network: &Arc<Network>,
        group_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        frame: &[u8],
    ) -> ResultCode {
        let nwid = network.id();
        let source_mac = Mac::from_address(self.address(), nwid.0);

        // ARP scalability: the broadcast group is distinguished by the
        // queried IPv4 address.
        let adi = if group_mac.is_broadcast() && ethertype == 0x0806 && frame.len() >= 28 {
            u32::from_be_bytes(frame[24..28].try_into().unwrap())
        } else {
            0
        };

        if let Err(reason) = network.filter_frame(
            false,
            self.address(),
            source_mac,
            group_mac,
            ethertype,
            vlan_id,
            frame,
            self.address(),
        ) {
            self.trace(TraceEvent::OutgoingFrameDropped {
                network: nwid,
                reason,
            });
            return ResultCode::Ok;
        }

        let group = crate::network::MulticastGroup {
            mac: group_mac,
            adi,
        };
        let mut payload = Vec::with_capacity(21 + frame.len());
        payload.extend_from_slice(&nwid.0.to_be_bytes());
        payload.push(0); // flags
        payload.extend_from_slice(&group_mac.to_bytes());
        payload.extend_from_slice(&adi.to_be_bytes());
        payload.extend_from_slice(&ethertype.to_be_bytes());
        payload.extend_from_slice(frame);

        let mut members = network.members_for_group(&group);
        if members.is_empty() {
            members = network.known_members();
        }
        for member in members {
            if member == self.address() {
                continue;
            }
            if let Some(peer) = self.peer(member) {
                self.send_vl1(clock, &peer, Verb::MulticastFrame, &payload);
            }
        }
        ResultCode::Ok
    }

    // ------------------------------------------------------------------
    // Management operations.
    // ------------------------------------------------------------------

    /// Join a network. The controller defaults to the address embedded
    /// in the network ID; a fingerprint pins it explicitly.
    pub fn join(
        &self,
        clock: i64,
        nwid: NetworkId,
        controller: Option<Fingerprint>,
    ) -> ResultCode {
        let network = {
            let mut networks = self.networks.write();
            match networks.get(&nwid) {
                Some(n) => {
                    let n = n.clone();
                    n.reset_to_requesting();
                    n
                }
                None => {
                    let n = Arc::new(Network::new(nwid, controller));
                    networks.insert(nwid, n.clone());
                    n
                }
            }
        };
        if network.controller_address().is_none() {
            self.networks.write().remove(&nwid);
            return ResultCode::ErrorBadParameter;
        }
        let info = network.info(self.address());
        self.host
            .virtual_network_config(nwid, ConfigOperation::Up, &info);
        self.request_network_config(clock, &network);
        ResultCode::Ok
    }

    pub fn leave(&self, clock: i64, nwid: NetworkId) -> ResultCode {
        let _ = clock;
        let network = match self.networks.write().remove(&nwid) {
            Some(n) => n,
            None => return ResultCode::ErrorNetworkNotFound,
        };
        let info = network.info(self.address());
        self.host
            .virtual_network_config(nwid, ConfigOperation::Destroy, &info);
        self.host.state_put(StateObject::NetworkConfig(nwid), &[]);
        ResultCode::Ok
    }

    pub fn multicast_subscribe(&self, clock: i64, nwid: NetworkId, mac: Mac, adi: u32) -> ResultCode {
        let network = match self.network(nwid) {
            Some(n) => n,
            None => return ResultCode::ErrorNetworkNotFound,
        };
        let group = crate::network::MulticastGroup { mac, adi };
        if network.multicast_subscribe(group) {
            self.announce_multicast_like(clock, &network, group);
        }
        ResultCode::Ok
    }

    pub fn multicast_unsubscribe(&self, _clock: i64, nwid: NetworkId, mac: Mac, adi: u32) -> ResultCode {
        match self.network(nwid) {
            Some(n) => {
                n.multicast_unsubscribe(&crate::network::MulticastGroup { mac, adi });
                ResultCode::Ok
            }
            None => ResultCode::ErrorNetworkNotFound,
        }
    }

    fn announce_multicast_like(
        &self,
        clock: i64,
        network: &Arc<Network>,
        group: crate::network::MulticastGroup,
    ) {
        let mut payload = Vec::with_capacity(18);
        payload.extend_from_slice(&network.id().0.to_be_bytes());
        payload.extend_from_slice(&group.mac.to_bytes());
        payload.extend_from_slice(&group.adi.to_be_bytes());

        let mut targets = network.known_members();
        if let Some(c) = network.controller_address() {
            if !targets.contains(&c) {
                targets.push(c);
            }
        }
        for t in targets {
            if t == self.address() {
                continue;
            }
            if let Some(peer) = self.peer(t) {
                self.send_vl1(clock, &peer, Verb::MulticastLike, &payload);
            }
        }
    }

    /// Add a root peer. Roots answer WHOIS and coordinate rendezvous.
    pub fn add_root(&self, clock: i64, identity: Identity, locator: Option<Locator>) -> ResultCode {
        if identity.address() == self.address() {
            return ResultCode::ErrorBadParameter;
        }
        if !identity.validate() {
            return ResultCode::ErrorInvalidCredential;
        }
        if let Some(loc) = &locator {
            if !loc.verify(&identity) {
                return ResultCode::ErrorInvalidCredential;
            }
        }
        let peer = match self.add_peer_for_identity(identity) {
            Some(p) => p,
            None => return ResultCode::ErrorBadParameter,
        };
        {
            let mut roots = self.roots.write();
            if !roots.contains(&peer.address()) {
                roots.push(peer.address());
            }
        }
        if let Some(loc) = locator {
            for ep in loc.endpoints() {
                if let Endpoint::IpUdp(sa) = ep {
                    if self.host.path_check(peer.address(), -1, *sa) {
                        self.trace(TraceEvent::TryingNewPath {
                            peer: peer.address(),
                            remote: *sa,
                        });
                        self.send_hello(clock, &peer, Some((-1, *sa)));
                    }
                }
            }
            peer.set_locator(loc);
        }
        ResultCode::Ok
    }

    pub fn remove_root(&self, _clock: i64, address: Address) -> ResultCode {
        self.roots.write().retain(|a| *a != address);
        ResultCode::Ok
    }

    /// Explicitly try to reach a peer at a physical address. Creates
    /// tentative state; the path becomes real if HELLO/OK completes.
    pub fn try_peer(
        &self,
        clock: i64,
        identity: Identity,
        local_socket: i64,
        remote: SocketAddr,
    ) -> ResultCode {
        if !identity.validate() {
            return ResultCode::ErrorInvalidCredential;
        }
        let peer = match self.add_peer_for_identity(identity) {
            Some(p) => p,
            None => return ResultCode::ErrorBadParameter,
        };
        if !self.host.path_check(peer.address(), local_socket, remote) {
            return ResultCode::ErrorBadParameter;
        }
        self.trace(TraceEvent::TryingNewPath {
            peer: peer.address(),
            remote,
        });
        self.send_hello(clock, &peer, Some((local_socket, remote)));
        ResultCode::Ok
    }

    /// Send an application-level user message over VL1.
    pub fn send_user_message(
        &self,
        clock: i64,
        to: Address,
        type_id: u64,
        data: &[u8],
    ) -> ResultCode {
        let peer = match self.peer(to) {
            Some(p) => p,
            None => return ResultCode::ErrorBadParameter,
        };
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&type_id.to_be_bytes());
        payload.extend_from_slice(data);
        if self.send_vl1(clock, &peer, Verb::UserMessage, &payload) {
            ResultCode::Ok
        } else {
            ResultCode::ErrorInternal
        }
    }

    /// Install a certificate with local trust flags. Root-set subjects
    /// are promoted to root peers on the next background pass.
    pub fn add_certificate(
        &self,
        clock: i64,
        cert: Certificate,
        local_trust: u32,
    ) -> Result<(), CertificateError> {
        let serial = cert.serial;
        let raw = cert.to_bytes();
        self.trust.insert(cert, local_trust, clock, false)?;
        self.host.state_put(StateObject::Cert(serial), &raw);
        self.persist_trust_summary();
        Ok(())
    }

    fn persist_trust_summary(&self) {
        let mut summary = Vec::new();
        for serial in self.trust.all_serials() {
            summary.extend_from_slice(&serial);
            summary.extend_from_slice(
                &self.trust.local_trust(&serial).unwrap_or(0).to_be_bytes(),
            );
        }
        self.host.state_put(StateObject::TrustStore, &summary);
    }

    /// Update the list of local interface addresses. Permanent ones
    /// are folded into this node's signed locator.
    pub fn set_interface_addresses(&self, clock: i64, addrs: &[(SocketAddr, bool)]) -> ResultCode {
        *self.interface_addresses.write() = addrs.to_vec();
        let endpoints: Vec<Endpoint> = addrs
            .iter()
            .filter(|(_, permanent)| *permanent)
            .take(MAX_LOCATOR_ENDPOINTS)
            .map(|(sa, _)| Endpoint::IpUdp(*sa))
            .collect();
        if !endpoints.is_empty() {
            if let Ok(loc) = Locator::create(clock, endpoints, &self.identity) {
                self.host.state_put(StateObject::Locator, &loc.to_bytes());
            }
        }
        ResultCode::Ok
    }

    /// Deliver the response to an HTTP request the core asked for.
    /// Bodies are treated as certificate updates.
    pub fn process_http_response(
        &self,
        clock: i64,
        _request_id: u64,
        status: u16,
        body: &[u8],
    ) -> ResultCode {
        if status != 200 {
            return ResultCode::Ok;
        }
        if let Ok(cert) = Certificate::decode(body, Some(clock)) {
            let _ = self.add_certificate(clock, cert, 0);
        }
        ResultCode::Ok
    }

    // ------------------------------------------------------------------
    // Background tasks.
    // ------------------------------------------------------------------

    fn request_network_config(&self, clock: i64, network: &Arc<Network>) {
        let controller_addr = match network.controller_address() {
            Some(a) => a,
            None => return,
        };
        network.config_requested(clock);
        self.trace(TraceEvent::NetworkConfigRequested {
            network: network.id(),
        });

        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(&network.id().0.to_be_bytes());
        payload.extend_from_slice(&network.held_revision().to_be_bytes());
        payload.extend_from_slice(&clock.to_be_bytes());

        match self.peer(controller_addr) {
            Some(peer) => {
                self.send_vl1(clock, &peer, Verb::NetworkConfigRequest, &payload);
            }
            None => {
                // Identity unknown; resolve first. The request cycle
                // will retry once the controller becomes a peer.
                self.park_nothing_and_whois(clock, controller_addr);
            }
        }
    }

    /// Run deferred maintenance. Returns the clock deadline by which
    /// the driver must call again. Calling twice at the same clock is
    /// a no-op the second time.
    pub fn process_background_tasks(&self, clock: i64) -> i64 {
        // Promote trust-store root sets to root peers.
        for (identity, locator) in self.trust.roots() {
            let addr = identity.address();
            let known = self.roots.read().contains(&addr);
            if !known {
                let _ = self.add_root(clock, identity, locator);
            }
        }

        // Peer upkeep: prune dead paths, keep sessions fresh.
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        let roots = self.roots.read().clone();
        for peer in &peers {
            peer.prune_paths(clock);
            let is_root = roots.contains(&peer.address());
            let has_path = peer.any_path().is_some();
            if !has_path {
                continue;
            }

            let retry_due = peer.pending_hello_nonce().is_some()
                && peer.needs_rekey(clock)
                && peer.hello_retries() <= CONTROL_RETRY_LIMIT
                && clock - peer.last_hello_sent()
                    >= CONTROL_RETRY_BASE_MS << peer.hello_retries().min(6);
            let keepalive_due = (is_root || peer.has_alive_path(clock)) && peer.hello_due(clock);
            let rekey_due = peer.has_alive_path(clock) && peer.needs_rekey(clock) && peer.hello_due(clock);

            if retry_due || keepalive_due || rekey_due {
                self.send_hello(clock, peer, None);
            }
        }

        // WHOIS retry and expiry.
        let retry: Vec<Address> = {
            let mut whois = self.whois.lock();
            let mut to_send = Vec::new();
            whois.retain(|addr, entry| {
                if clock - entry.last_sent >= CONTROL_RETRY_BASE_MS << entry.retries.min(6) {
                    if entry.retries >= CONTROL_RETRY_LIMIT {
                        trace!(address = %addr, "whois resolution abandoned");
                        return false;
                    }
                    entry.retries += 1;
                    entry.last_sent = clock;
                    to_send.push(*addr);
                }
                true
            });
            to_send
        };
        for addr in retry {
            self.send_whois(clock, addr);
        }

        // Network config cycle.
        let networks: Vec<Arc<Network>> = self.networks.read().values().cloned().collect();
        for network in &networks {
            if network.config_request_due(clock) {
                self.request_network_config(clock, network);
            }
        }

        // Reassembly GC.
        self.reassembly.lock().gc(clock);

        // Certificate validity windows, once a minute. Expired certs
        // whose subjects list update URLs get a refresh fetch via the
        // host; replacements come back through process_http_response.
        let last = self.last_cert_check.load(Ordering::Relaxed);
        if clock - last >= 60_000 && self
            .last_cert_check
            .compare_exchange(last, clock, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            for serial in self.trust.expired(clock) {
                self.trace(TraceEvent::CertificateExpired { serial });
                if let Some(cert) = self.trust.get(&serial) {
                    for url in &cert.subject.update_urls {
                        self.host
                            .http_request(self.next_packet_id(), "GET", url);
                    }
                }
            }
        }

        // Online/offline edge.
        let now_online = peers.iter().any(|p| p.has_alive_path(clock));
        let was_online = self.online.swap(now_online, Ordering::Relaxed);
        if now_online != was_online {
            self.host.event(if now_online {
                Event::Online
            } else {
                Event::Offline
            });
        }

        // Next deadline: fine-grained while reassembly or WHOIS work
        // is pending, coarse otherwise.
        let busy = !self.reassembly.lock().is_empty() || !self.whois.lock().is_empty();
        if busy {
            clock + FRAGMENT_TIMEOUT_MS
        } else {
            clock + 1_000
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.host.event(Event::Down);
    }
}

struct ParsedHello {
    protocol_version: u8,
    timestamp: i64,
    nonce: [u8; 16],
    identity: Identity,
    locator: Option<Locator>,
}

/// HELLO payload: proto(1) major(1) minor(1) revision(2) timestamp(8)
/// nonce(16) identity-length(2) identity [locator-flag(1) locator].
fn parse_hello(payload: &[u8]) -> Option<ParsedHello> {
    if payload.len() < 1 + 1 + 1 + 2 + 8 + 16 + 2 {
        return None;
    }
    let protocol_version = payload[0];
    let timestamp = i64::from_be_bytes(payload[5..13].try_into().unwrap());
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&payload[13..29]);
    let id_len = u16::from_be_bytes(payload[29..31].try_into().unwrap()) as usize;
    if payload.len() < 31 + id_len + 1 {
        return None;
    }
    let identity = Identity::from_bytes(&payload[31..31 + id_len]).ok()?;
    let mut pos = 31 + id_len;
    let locator = if payload[pos] != 0 {
        pos += 1;
        let (loc, _) = Locator::unmarshal(&payload[pos..]).ok()?;
        Some(loc)
    } else {
        None
    };
    Some(ParsedHello {
        protocol_version,
        timestamp,
        nonce,
        identity,
        locator,
    })
}

fn unspecified_addr() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

/// RENDEZVOUS payload: flags(1) peer-address(5) port(2) ip-length(1)
/// ip bytes.
fn rendezvous_payload(with: Address, at: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(25);
    out.push(0); // flags
    out.extend_from_slice(&with.to_bytes());
    out.extend_from_slice(&at.port().to_be_bytes());
    match at.ip() {
        std::net::IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Test host capturing every callback.
    #[derive(Default)]
    struct RecordingHost {
        state: PlMutex<HashMap<String, Vec<u8>>>,
        wire: PlMutex<Vec<(i64, SocketAddr, Vec<u8>)>>,
        frames: PlMutex<Vec<(NetworkId, Mac, Mac, u16, Vec<u8>)>>,
        configs: PlMutex<Vec<(NetworkId, ConfigOperation, NetworkStatus)>>,
        events: PlMutex<Vec<Event>>,
    }

    impl Host for RecordingHost {
        fn state_put(&self, object: StateObject, data: &[u8]) {
            if data.is_empty() {
                self.state.lock().remove(&object.name());
            } else {
                self.state.lock().insert(object.name(), data.to_vec());
            }
        }

        fn state_get(&self, object: StateObject) -> Option<Vec<u8>> {
            self.state.lock().get(&object.name()).cloned()
        }

        fn wire_send(&self, local_socket: i64, remote: SocketAddr, data: &[u8], _ttl: u32) -> bool {
            self.wire.lock().push((local_socket, remote, data.to_vec()));
            true
        }

        fn virtual_network_frame(
            &self,
            network: NetworkId,
            source_mac: Mac,
            dest_mac: Mac,
            ethertype: u16,
            _vlan_id: u16,
            data: &[u8],
        ) {
            self.frames
                .lock()
                .push((network, source_mac, dest_mac, ethertype, data.to_vec()));
        }

        fn virtual_network_config(
            &self,
            network: NetworkId,
            op: ConfigOperation,
            info: &NetworkInfo,
        ) {
            self.configs.lock().push((network, op, info.status));
        }

        fn event(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    fn new_node() -> (Arc<RecordingHost>, Node) {
        let host = Arc::new(RecordingHost::default());
        let node = Node::new(host.clone(), 1_000).unwrap();
        (host, node)
    }

    #[test]
    fn identity_is_generated_and_persisted() {
        let (host, node) = new_node();
        assert!(host
            .state
            .lock()
            .contains_key(&StateObject::IdentitySecret.name()));
        assert!(host
            .state
            .lock()
            .contains_key(&StateObject::IdentityPublic.name()));
        assert_eq!(host.events.lock()[0], Event::Up);

        // A second node over the same store loads the same identity.
        let addr = node.address();
        drop(node);
        let node2 = Node::new(host.clone(), 2_000).unwrap();
        assert_eq!(node2.address(), addr);
    }

    #[test]
    fn state_object_names_match_contract() {
        let a = Address::from_u64(0x0123456789).unwrap();
        assert_eq!(StateObject::IdentityPublic.name(), "identity.public");
        assert_eq!(StateObject::IdentitySecret.name(), "identity.secret");
        assert_eq!(StateObject::Peer(a).name(), "peers.d/0123456789");
        assert_eq!(
            StateObject::NetworkConfig(NetworkId(0xfada000000000001)).name(),
            "networks.d/fada000000000001.conf"
        );
        assert_eq!(StateObject::Cert([0xab; 48]).name().len(), "certs.d/".len() + 96);
    }

    #[test]
    fn join_emits_requesting_configuration() {
        let (host, node) = new_node();
        let nwid = NetworkId(0xfada000000000001);
        assert_eq!(node.join(1_000, nwid, None), ResultCode::Ok);

        let configs = host.configs.lock();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, nwid);
        assert_eq!(configs[0].1, ConfigOperation::Up);
        assert_eq!(configs[0].2, NetworkStatus::RequestingConfiguration);
        drop(configs);
        assert!(host.frames.lock().is_empty(), "no frames before config");

        // Still requesting through 30 s of background passes.
        for t in (2_000..32_000).step_by(1_000) {
            node.process_background_tasks(t);
        }
        assert_eq!(
            node.network_info(nwid).unwrap().status,
            NetworkStatus::RequestingConfiguration
        );
        assert!(host.frames.lock().is_empty());
    }

    #[test]
    fn leave_destroys_and_clears_state() {
        let (host, node) = new_node();
        let nwid = NetworkId(0xfada000000000001);
        node.join(1_000, nwid, None);
        assert_eq!(node.leave(2_000, nwid), ResultCode::Ok);

        let configs = host.configs.lock();
        assert_eq!(configs.last().unwrap().1, ConfigOperation::Destroy);
        drop(configs);
        assert!(node.network_info(nwid).is_none());
        assert_eq!(node.leave(3_000, nwid), ResultCode::ErrorNetworkNotFound);
    }

    #[test]
    fn background_tasks_are_idempotent_at_fixed_clock() {
        let (host, node) = new_node();
        node.join(1_000, NetworkId(0xfada000000000001), None);

        node.process_background_tasks(5_000);
        let wire_count = host.wire.lock().len();
        let event_count = host.events.lock().len();
        let deadline = node.process_background_tasks(5_000);

        assert_eq!(host.wire.lock().len(), wire_count);
        assert_eq!(host.events.lock().len(), event_count);
        assert!(deadline > 5_000);
    }

    #[test]
    fn malformed_wire_input_is_dropped_with_trace() {
        let (host, node) = new_node();
        let remote: SocketAddr = "192.0.2.1:9993".parse().unwrap();

        assert_eq!(
            node.process_wire_packet(1_000, 1, remote, &[0u8; 4]),
            ResultCode::Ok
        );
        // A full-size packet of garbage fails header parsing or MAC.
        assert_eq!(
            node.process_wire_packet(1_000, 1, remote, &[0u8; 64]),
            ResultCode::Ok
        );

        let drops = host
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Trace(TraceEvent::IncomingPacketDropped { .. })))
            .count();
        assert!(drops >= 1);
    }

    #[test]
    fn user_message_to_unknown_peer_fails() {
        let (_, node) = new_node();
        let somewhere = Address::from_u64(0x3333333333).unwrap();
        assert_eq!(
            node.send_user_message(1_000, somewhere, 7, b"hi"),
            ResultCode::ErrorBadParameter
        );
    }

    #[test]
    fn result_code_fatality_contract() {
        assert!(!ResultCode::Ok.is_fatal());
        assert!(ResultCode::FatalOutOfMemory.is_fatal());
        assert!(!ResultCode::ErrorNetworkNotFound.is_fatal());
    }
}
