//! Per-remote-node session state.
//!
//! A [`Peer`] owns everything this node knows about one remote
//! identity: the static agreement key, the negotiated session keys,
//! up to sixteen paths, HELLO bookkeeping, and the per-peer rate
//! limit buckets for control verbs. All mutable state sits behind a
//! single per-peer lock so concurrent wire-packet calls touching
//! different peers never contend.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::crypto::{self, SessionKeyPair};
use crate::identity::{Address, Identity};
use crate::locator::Locator;
use crate::path::Path;
use crate::protocol::{MAX_PEER_PATHS, PEER_HELLO_INTERVAL_MS, SESSION_KEY_LIFETIME_MS};

/// Classic token bucket, refilled from the caller's clock so behavior
/// is a pure function of the call sequence.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_second: f64,
    last_refill: i64,
}

impl TokenBucket {
    pub fn new(capacity: u32, per_second: f64) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            tokens: capacity as f64,
            per_second,
            last_refill: 0,
        }
    }

    /// Take one token if available. Refills lazily from elapsed time.
    pub fn try_take(&mut self, clock: i64) -> bool {
        if clock > self.last_refill {
            let elapsed = (clock - self.last_refill) as f64 / 1000.0;
            self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
            self.last_refill = clock;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-peer buckets for the rate-limited control verbs.
#[derive(Clone, Debug)]
pub struct RateLimits {
    pub whois: TokenBucket,
    pub echo: TokenBucket,
    pub rendezvous: TokenBucket,
    pub hello: TokenBucket,
}

impl Default for RateLimits {
    fn default() -> Self {
        RateLimits {
            whois: TokenBucket::new(16, 4.0),
            echo: TokenBucket::new(8, 2.0),
            rendezvous: TokenBucket::new(4, 1.0),
            hello: TokenBucket::new(4, 0.5),
        }
    }
}

/// Negotiated directional keys from the most recent HELLO exchange.
#[derive(Clone)]
struct Session {
    tx: [u8; 32],
    rx: [u8; 32],
    established_at: i64,
}

struct PeerInner {
    paths: Vec<Path>,
    session: Option<Session>,
    /// Nonce of our outstanding HELLO, if we initiated one.
    pending_hello_nonce: Option<[u8; 16]>,
    last_hello_sent: i64,
    last_hello_received: i64,
    hello_retries: u32,
    limits: RateLimits,
    locator: Option<Locator>,
    remote_protocol_version: Option<u8>,
}

/// State for one remote node.
pub struct Peer {
    identity: Identity,
    static_key: [u8; 32],
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Build peer state from our identity (private half required) and
    /// the remote's public identity.
    pub fn new(local: &Identity, remote: Identity) -> Result<Self, crypto::SignatureError> {
        let static_key = local.agree(&remote)?;
        Ok(Peer {
            identity: remote,
            static_key,
            inner: Mutex::new(PeerInner {
                paths: Vec::new(),
                session: None,
                pending_hello_nonce: None,
                last_hello_sent: 0,
                last_hello_received: 0,
                hello_retries: 0,
                limits: RateLimits::default(),
                locator: None,
                remote_protocol_version: None,
            }),
        })
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    #[inline]
    pub fn static_key(&self) -> [u8; 32] {
        self.static_key
    }

    // -- key schedule ------------------------------------------------------

    /// Key for the next outbound packet: the session key while fresh,
    /// otherwise the static agreement key.
    pub fn send_key(&self, clock: i64) -> [u8; 32] {
        let inner = self.inner.lock();
        match &inner.session {
            Some(s) if clock - s.established_at < SESSION_KEY_LIFETIME_MS => s.tx,
            _ => self.static_key,
        }
    }

    /// Candidate keys for authenticating an inbound packet, most
    /// likely first. The static key is always a fallback so a peer
    /// that lost session state can still reach us with a HELLO.
    pub fn receive_keys(&self) -> Vec<[u8; 32]> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(2);
        if let Some(s) = &inner.session {
            keys.push(s.rx);
        }
        keys.push(self.static_key);
        keys
    }

    /// Install session keys after a completed HELLO exchange.
    /// `we_initiated` decides which direction of the derived pair we
    /// transmit on.
    pub fn establish_session(
        &self,
        clock: i64,
        initiator_nonce: &[u8; 16],
        responder_nonce: &[u8; 16],
        we_initiated: bool,
    ) {
        let SessionKeyPair { i2r, r2i } =
            crypto::derive_session_keys(&self.static_key, initiator_nonce, responder_nonce);
        let (tx, rx) = if we_initiated { (i2r, r2i) } else { (r2i, i2r) };
        let mut inner = self.inner.lock();
        inner.session = Some(Session {
            tx,
            rx,
            established_at: clock,
        });
        inner.pending_hello_nonce = None;
        inner.hello_retries = 0;
        debug!(peer = %self.address(), "session keys established");
    }

    /// True when no session exists or the current one is past its
    /// lifetime, meaning the background pass should send a HELLO.
    pub fn needs_rekey(&self, clock: i64) -> bool {
        let inner = self.inner.lock();
        match &inner.session {
            Some(s) => clock - s.established_at >= SESSION_KEY_LIFETIME_MS,
            None => true,
        }
    }

    // -- HELLO bookkeeping -------------------------------------------------

    /// Record that we sent a HELLO carrying `nonce`.
    pub fn hello_sent(&self, clock: i64, nonce: [u8; 16]) {
        let mut inner = self.inner.lock();
        inner.last_hello_sent = clock;
        inner.hello_retries += 1;
        inner.pending_hello_nonce = Some(nonce);
    }

    pub fn hello_received(&self, clock: i64) {
        self.inner.lock().last_hello_received = clock;
    }

    pub fn last_hello_sent(&self) -> i64 {
        self.inner.lock().last_hello_sent
    }

    pub fn hello_retries(&self) -> u32 {
        self.inner.lock().hello_retries
    }

    /// Our outstanding initiator nonce, consumed by OK(HELLO).
    pub fn pending_hello_nonce(&self) -> Option<[u8; 16]> {
        self.inner.lock().pending_hello_nonce
    }

    /// Whether the keep-alive cadence calls for a HELLO now.
    pub fn hello_due(&self, clock: i64) -> bool {
        let inner = self.inner.lock();
        clock - inner.last_hello_sent >= PEER_HELLO_INTERVAL_MS
    }

    pub fn set_remote_protocol_version(&self, v: u8) {
        self.inner.lock().remote_protocol_version = Some(v);
    }

    pub fn remote_protocol_version(&self) -> Option<u8> {
        self.inner.lock().remote_protocol_version
    }

    pub fn set_locator(&self, locator: Locator) -> bool {
        let mut inner = self.inner.lock();
        // Only newer locators replace what we hold.
        if inner
            .locator
            .as_ref()
            .map(|l| l.timestamp() < locator.timestamp())
            .unwrap_or(true)
        {
            inner.locator = Some(locator);
            true
        } else {
            false
        }
    }

    pub fn locator(&self) -> Option<Locator> {
        self.inner.lock().locator.clone()
    }

    // -- paths -------------------------------------------------------------

    /// Learn (or refresh) the path a packet arrived on. New paths
    /// start tentative. When the table is full, an expired or worst
    /// tentative entry is evicted; confirmed alive paths are kept.
    pub fn learn_path(&self, clock: i64, local_socket: i64, remote: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner
            .paths
            .iter_mut()
            .find(|p| p.matches(local_socket, &remote))
        {
            p.received(clock);
            return;
        }

        if inner.paths.len() >= MAX_PEER_PATHS {
            // Prefer evicting expired entries, then tentative ones.
            if let Some(idx) = inner
                .paths
                .iter()
                .position(|p| p.expired(clock))
                .or_else(|| inner.paths.iter().position(|p| !p.confirmed))
            {
                inner.paths.swap_remove(idx);
            } else {
                return;
            }
        }
        trace!(peer = %self.address(), %remote, "learned new path");
        inner.paths.push(Path::new(local_socket, remote, clock));
    }

    /// Mark a path confirmed after a HELLO/OK round trip over it.
    pub fn confirm_path(&self, clock: i64, local_socket: i64, remote: SocketAddr) {
        let mut inner = self.inner.lock();
        match inner
            .paths
            .iter_mut()
            .find(|p| p.matches(local_socket, &remote))
        {
            Some(p) => {
                p.confirmed = true;
                p.received(clock);
            }
            None => {
                let mut p = Path::new(local_socket, remote, clock);
                p.confirmed = true;
                if inner.paths.len() < MAX_PEER_PATHS {
                    inner.paths.push(p);
                }
            }
        }
    }

    pub fn set_path_preferred(&self, local_socket: i64, remote: SocketAddr, preferred: bool) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner
            .paths
            .iter_mut()
            .find(|p| p.matches(local_socket, &remote))
        {
            p.preferred = preferred;
        }
    }

    pub fn record_send(&self, clock: i64, local_socket: i64, remote: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner
            .paths
            .iter_mut()
            .find(|p| p.matches(local_socket, &remote))
        {
            p.sent(clock);
        }
    }

    /// Best-path selection: among alive paths, preferred beats not,
    /// then most recent incoming traffic, then the deterministic
    /// (local socket, remote) tie-break.
    pub fn best_path(&self, clock: i64) -> Option<(i64, SocketAddr)> {
        let inner = self.inner.lock();
        inner
            .paths
            .iter()
            .filter(|p| p.alive(clock))
            .min_by(|a, b| {
                b.preferred
                    .cmp(&a.preferred)
                    .then(b.last_receive.cmp(&a.last_receive))
                    .then_with(|| a.tie_break_cmp(b))
            })
            .map(|p| (p.local_socket, p.remote))
    }

    /// Any usable path, falling back to tentative ones. Used when we
    /// must answer on the arrival path before confirmation exists.
    pub fn any_path(&self) -> Option<(i64, SocketAddr)> {
        let inner = self.inner.lock();
        inner
            .paths
            .iter()
            .max_by_key(|p| p.last_receive)
            .map(|p| (p.local_socket, p.remote))
    }

    pub fn has_alive_path(&self, clock: i64) -> bool {
        self.inner.lock().paths.iter().any(|p| p.alive(clock))
    }

    /// Drop expired paths. Returns how many were removed.
    pub fn prune_paths(&self, clock: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.paths.len();
        inner.paths.retain(|p| !p.expired(clock));
        before - inner.paths.len()
    }

    pub fn path_count(&self) -> usize {
        self.inner.lock().paths.len()
    }

    /// Snapshot for the host status API.
    pub fn paths(&self) -> Vec<Path> {
        self.inner.lock().paths.clone()
    }

    // -- rate limits -------------------------------------------------------

    pub fn allow_whois(&self, clock: i64) -> bool {
        self.inner.lock().limits.whois.try_take(clock)
    }

    pub fn allow_echo(&self, clock: i64) -> bool {
        self.inner.lock().limits.echo.try_take(clock)
    }

    pub fn allow_rendezvous(&self, clock: i64) -> bool {
        self.inner.lock().limits.rendezvous.try_take(clock)
    }

    pub fn allow_unsolicited_hello(&self, clock: i64) -> bool {
        self.inner.lock().limits.hello.try_take(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKind;
    use crate::protocol::PATH_ALIVE_TIMEOUT_MS;

    fn peer_pair() -> (Identity, Peer) {
        let local = Identity::generate(IdentityKind::C25519).unwrap();
        let remote = Identity::generate(IdentityKind::C25519).unwrap();
        let peer = Peer::new(&local, remote.public_clone()).unwrap();
        (local, peer)
    }

    #[test]
    fn static_key_matches_both_directions() {
        let a = Identity::generate(IdentityKind::C25519).unwrap();
        let b = Identity::generate(IdentityKind::C25519).unwrap();
        let peer_of_b = Peer::new(&a, b.public_clone()).unwrap();
        let peer_of_a = Peer::new(&b, a.public_clone()).unwrap();
        assert_eq!(peer_of_b.static_key(), peer_of_a.static_key());
    }

    #[test]
    fn session_schedule_and_rekey() {
        let (_, peer) = peer_pair();
        assert!(peer.needs_rekey(0), "no session yet");
        assert_eq!(peer.send_key(0), peer.static_key());

        peer.establish_session(1000, &[1u8; 16], &[2u8; 16], true);
        assert!(!peer.needs_rekey(1000));
        let tx = peer.send_key(1000);
        assert_ne!(tx, peer.static_key());

        // Receive side lists session key first, static as fallback.
        let rx = peer.receive_keys();
        assert_eq!(rx.len(), 2);
        assert_eq!(rx[1], peer.static_key());
        assert_ne!(rx[0], tx, "directions differ");

        // Expired session falls back to static and wants a rekey.
        let later = 1000 + SESSION_KEY_LIFETIME_MS;
        assert!(peer.needs_rekey(later));
        assert_eq!(peer.send_key(later), peer.static_key());
    }

    #[test]
    fn initiator_and_responder_keys_interlock() {
        let a = Identity::generate(IdentityKind::C25519).unwrap();
        let b = Identity::generate(IdentityKind::C25519).unwrap();
        let a_side = Peer::new(&a, b.public_clone()).unwrap();
        let b_side = Peer::new(&b, a.public_clone()).unwrap();

        let ni = [5u8; 16];
        let nr = [6u8; 16];
        a_side.establish_session(0, &ni, &nr, true);
        b_side.establish_session(0, &ni, &nr, false);

        // A's transmit key is B's first receive candidate.
        assert_eq!(a_side.send_key(0), b_side.receive_keys()[0]);
        assert_eq!(b_side.send_key(0), a_side.receive_keys()[0]);
    }

    #[test]
    fn best_path_selection_rules() {
        let (_, peer) = peer_pair();
        let clock = 10_000;

        peer.learn_path(clock, 1, "10.0.0.1:9993".parse().unwrap());
        assert_eq!(peer.best_path(clock), None, "tentative is never selected");

        peer.confirm_path(clock, 1, "10.0.0.1:9993".parse().unwrap());
        assert_eq!(
            peer.best_path(clock),
            Some((1, "10.0.0.1:9993".parse().unwrap()))
        );

        // Fresher traffic wins.
        peer.confirm_path(clock + 100, 1, "10.0.0.2:9993".parse().unwrap());
        assert_eq!(
            peer.best_path(clock + 100),
            Some((1, "10.0.0.2:9993".parse().unwrap()))
        );

        // Preference beats freshness.
        peer.set_path_preferred(1, "10.0.0.1:9993".parse().unwrap(), true);
        assert_eq!(
            peer.best_path(clock + 100),
            Some((1, "10.0.0.1:9993".parse().unwrap()))
        );

        // Dead paths drop out.
        let much_later = clock + 100 + PATH_ALIVE_TIMEOUT_MS;
        assert_eq!(peer.best_path(much_later), None);
    }

    #[test]
    fn deterministic_tie_break_on_equal_paths() {
        let (_, peer) = peer_pair();
        let clock = 1_000;
        peer.confirm_path(clock, 1, "10.0.0.9:9993".parse().unwrap());
        peer.confirm_path(clock, 1, "10.0.0.3:9993".parse().unwrap());
        // Same confirmation time and no preference: lexicographically
        // smaller remote wins.
        assert_eq!(
            peer.best_path(clock),
            Some((1, "10.0.0.3:9993".parse().unwrap()))
        );
    }

    #[test]
    fn path_table_is_bounded() {
        let (_, peer) = peer_pair();
        for i in 0..MAX_PEER_PATHS + 4 {
            let addr: SocketAddr = format!("10.1.0.{}:9993", i + 1).parse().unwrap();
            peer.learn_path(1000, 1, addr);
        }
        assert!(peer.path_count() <= MAX_PEER_PATHS);
    }

    #[test]
    fn prune_removes_silent_paths() {
        let (_, peer) = peer_pair();
        peer.learn_path(0, 1, "10.0.0.1:9993".parse().unwrap());
        peer.confirm_path(0, 1, "10.0.0.2:9993".parse().unwrap());
        assert_eq!(peer.path_count(), 2);

        let later = crate::protocol::PATH_EXPIRATION_MS + 1;
        assert_eq!(peer.prune_paths(later), 2);
        assert_eq!(peer.path_count(), 0);
    }

    #[test]
    fn token_bucket_converges_to_rate() {
        let mut bucket = TokenBucket::new(10, 5.0);
        let mut admitted = 0u32;
        let mut clock = 0i64;
        // 100 attempts per second for 20 seconds against a 5/s bucket.
        for _ in 0..2000 {
            clock += 10;
            if bucket.try_take(clock) {
                admitted += 1;
            }
        }
        let rate = admitted as f64 / 20.0;
        assert!(
            (4.0..=6.5).contains(&rate),
            "admitted rate {} should converge near 5/s",
            rate
        );
    }

    #[test]
    fn locator_only_advances() {
        let (_, peer) = peer_pair();
        let id = Identity::generate(IdentityKind::C25519).unwrap();
        let old = Locator::create(100, vec![], &id).unwrap();
        let new = Locator::create(200, vec![], &id).unwrap();

        assert!(peer.set_locator(new.clone()));
        assert!(!peer.set_locator(old));
        assert_eq!(peer.locator().unwrap().timestamp(), 200);
    }
}
