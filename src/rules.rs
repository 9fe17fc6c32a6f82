//! The per-network rules engine.
//!
//! Rules form an ordered table of MATCH entries punctuated by ACTIONs.
//! Evaluation keeps a running boolean accumulator: each MATCH combines
//! into it with AND (default) or OR (when flagged and the previous
//! entry was also a MATCH), after optional NOT inversion. When an
//! ACTION is reached it fires iff the accumulator is true; either way
//! the accumulator resets for the next block. A table that ends
//! without an ACCEPT drops the frame.
//!
//! Capabilities are sub-rule-sets granted per member; when the base
//! table does not accept a frame each capability gets a chance to, and
//! the granting capability's ID is recorded for trace.
//!
//! The verdict is a pure function of (rules, frame, tag tables,
//! characteristics); even the RANDOM match derives its coin from a
//! digest of the frame so replays evaluate identically.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::endpoint::Mac;
use crate::identity::Address;

/// Packet characteristics bits, matched by `MatchCharacteristics`.
pub mod characteristics {
    pub const INBOUND: u64 = 0x8000_0000_0000_0000;
    pub const MULTICAST: u64 = 0x4000_0000_0000_0000;
    pub const BROADCAST: u64 = 0x2000_0000_0000_0000;
    pub const SENDER_IP_AUTHENTICATED: u64 = 0x1000_0000_0000_0000;
    pub const SENDER_MAC_AUTHENTICATED: u64 = 0x0800_0000_0000_0000;
    // Low bits mirror the TCP flag byte of the frame, when present.
    pub const TCP_ACK: u64 = 0x10;
    pub const TCP_PSH: u64 = 0x08;
    pub const TCP_RST: u64 = 0x04;
    pub const TCP_SYN: u64 = 0x02;
    pub const TCP_FIN: u64 = 0x01;
}

/// One rule: a kind plus the NOT and OR modifier bits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub not: bool,
    pub or: bool,
    pub kind: RuleKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuleKind {
    // Actions.
    ActionDrop,
    ActionAccept,
    /// Copy the frame to an observer, truncated to `length` bytes
    /// (zero means whole frame).
    ActionTee { address: Address, length: u16 },
    /// TEE that requires acknowledgment from the observer.
    ActionWatch { address: Address, length: u16 },
    /// Drop locally and forward to another member instead.
    ActionRedirect { address: Address },
    /// Stop evaluating this rule set.
    ActionBreak,
    /// Assign the frame to a QoS bucket and keep evaluating.
    ActionPriority { qos_bucket: u8 },

    // Matches.
    MatchSourceAddress(Address),
    MatchDestAddress(Address),
    MatchVlanId(u16),
    MatchMacSource(Mac),
    MatchMacDest(Mac),
    MatchIpv4Source { ip: [u8; 4], bits: u8 },
    MatchIpv4Dest { ip: [u8; 4], bits: u8 },
    MatchIpv6Source { ip: [u8; 16], bits: u8 },
    MatchIpv6Dest { ip: [u8; 16], bits: u8 },
    MatchIpTos { mask: u8, start: u8, end: u8 },
    MatchIpProtocol(u8),
    MatchEthertype(u16),
    MatchIcmp { icmp_type: u8, code: Option<u8> },
    MatchSourcePortRange(u16, u16),
    MatchDestPortRange(u16, u16),
    /// All given characteristic bits must be present.
    MatchCharacteristics(u64),
    MatchFrameSizeRange(u16, u16),
    /// Probability gate: 0 never matches, `u32::MAX` always does. The
    /// coin is a digest of the frame, so verdicts stay deterministic.
    MatchRandom(u32),
    MatchTagsDifference { id: u32, value: u32 },
    MatchTagsBitwiseAnd { id: u32, value: u32 },
    MatchTagsBitwiseOr { id: u32, value: u32 },
    MatchTagsBitwiseXor { id: u32, value: u32 },
    MatchTagsEqual { id: u32, value: u32 },
    MatchTagSender { id: u32, value: u32 },
    MatchTagReceiver { id: u32, value: u32 },
    /// Match a 1-64 bit integer read from the frame at byte offset
    /// `idx`. `format` low 6 bits give (bits - 1); the high bit set
    /// means little-endian. Matches when the value lands in
    /// `[start, start + end]`.
    MatchIntegerRange { start: u64, end: u32, idx: u16, format: u8 },
}

impl Rule {
    #[inline]
    pub fn is_action(&self) -> bool {
        matches!(
            self.kind,
            RuleKind::ActionDrop
                | RuleKind::ActionAccept
                | RuleKind::ActionTee { .. }
                | RuleKind::ActionWatch { .. }
                | RuleKind::ActionRedirect { .. }
                | RuleKind::ActionBreak
                | RuleKind::ActionPriority { .. }
        )
    }

    fn plain(kind: RuleKind) -> Rule {
        Rule {
            not: false,
            or: false,
            kind,
        }
    }

    pub fn action_accept() -> Rule {
        Rule::plain(RuleKind::ActionAccept)
    }

    pub fn action_drop() -> Rule {
        Rule::plain(RuleKind::ActionDrop)
    }

    pub fn action_break() -> Rule {
        Rule::plain(RuleKind::ActionBreak)
    }

    pub fn match_ethertype(et: u16) -> Rule {
        Rule::plain(RuleKind::MatchEthertype(et))
    }

    pub fn match_source_address(a: Address) -> Rule {
        Rule::plain(RuleKind::MatchSourceAddress(a))
    }

    pub fn with_not(mut self) -> Rule {
        self.not = true;
        self
    }

    pub fn with_or(mut self) -> Rule {
        self.or = true;
        self
    }
}

/// Everything the engine needs to know about one frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext<'a> {
    pub network_id: u64,
    pub source_address: Address,
    pub dest_address: Address,
    pub source_mac: Mac,
    pub dest_mac: Mac,
    pub ethertype: u16,
    pub vlan_id: u16,
    /// Ethernet payload (e.g. the IP packet for 0x0800).
    pub frame: &'a [u8],
    pub inbound: bool,
    pub sender_ip_authenticated: bool,
    pub sender_mac_authenticated: bool,
}

impl<'a> FrameContext<'a> {
    fn characteristics(&self) -> u64 {
        let mut c = 0u64;
        if self.inbound {
            c |= characteristics::INBOUND;
        }
        if self.dest_mac.is_multicast() {
            c |= characteristics::MULTICAST;
        }
        if self.dest_mac.is_broadcast() {
            c |= characteristics::BROADCAST;
        }
        if self.sender_ip_authenticated {
            c |= characteristics::SENDER_IP_AUTHENTICATED;
        }
        if self.sender_mac_authenticated {
            c |= characteristics::SENDER_MAC_AUTHENTICATED;
        }
        if let Some(ip) = Ipv4View::parse(self) {
            if ip.protocol == 6 {
                if let Some(flags) = ip.tcp_flags() {
                    c |= (flags & 0xff) as u64;
                }
            }
        }
        c
    }
}

/// Outcome of one rule set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Drop,
    /// Table ended (or BREAK fired) without an ACCEPT or DROP.
    NoMatch,
}

/// The engine's verdict plus collected side effects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterResult {
    pub accept: bool,
    pub qos_bucket: Option<u8>,
    /// Observers to receive copies: (address, truncate length).
    pub tees: Vec<(Address, u16)>,
    /// Observers requiring acknowledgment.
    pub watches: Vec<(Address, u16)>,
    /// When set, suppress local delivery and forward here instead.
    pub redirect: Option<Address>,
    /// ID of the capability that granted acceptance, if any.
    pub matched_capability: Option<u32>,
}

/// Evaluate one rule set over a frame, accumulating side effects into
/// `result`. Deterministic for fixed inputs.
pub fn evaluate_rule_set(
    rules: &[Rule],
    ctx: &FrameContext<'_>,
    sender_tags: &HashMap<u32, u32>,
    receiver_tags: &HashMap<u32, u32>,
    result: &mut FilterResult,
) -> Outcome {
    let mut acc = true;
    let mut prev_was_match = false;

    for rule in rules {
        if rule.is_action() {
            if acc {
                match &rule.kind {
                    RuleKind::ActionDrop => return Outcome::Drop,
                    RuleKind::ActionAccept => return Outcome::Accept,
                    RuleKind::ActionTee { address, length } => {
                        result.tees.push((*address, *length));
                    }
                    RuleKind::ActionWatch { address, length } => {
                        result.watches.push((*address, *length));
                    }
                    RuleKind::ActionRedirect { address } => {
                        result.redirect = Some(*address);
                        return Outcome::Accept;
                    }
                    RuleKind::ActionBreak => return Outcome::NoMatch,
                    RuleKind::ActionPriority { qos_bucket } => {
                        result.qos_bucket = Some(*qos_bucket);
                    }
                    _ => unreachable!(),
                }
            }
            acc = true;
            prev_was_match = false;
        } else {
            let raw = eval_match(&rule.kind, ctx, sender_tags, receiver_tags);
            let v = raw != rule.not;
            if rule.or && prev_was_match {
                acc = acc || v;
            } else {
                acc = acc && v;
            }
            prev_was_match = true;
        }
    }
    Outcome::NoMatch
}

/// Run a frame through the base rules and, when those do not accept,
/// through each capability's sub-rule-set in order. The default when
/// nothing accepts is DROP.
pub fn filter_frame(
    base_rules: &[Rule],
    capabilities: &[(u32, &[Rule])],
    ctx: &FrameContext<'_>,
    sender_tags: &HashMap<u32, u32>,
    receiver_tags: &HashMap<u32, u32>,
) -> FilterResult {
    let mut result = FilterResult::default();
    match evaluate_rule_set(base_rules, ctx, sender_tags, receiver_tags, &mut result) {
        Outcome::Accept => {
            result.accept = true;
            return result;
        }
        Outcome::Drop | Outcome::NoMatch => {}
    }
    for (cap_id, rules) in capabilities {
        if evaluate_rule_set(rules, ctx, sender_tags, receiver_tags, &mut result)
            == Outcome::Accept
        {
            result.accept = true;
            result.matched_capability = Some(*cap_id);
            return result;
        }
    }
    result.accept = false;
    result
}

fn eval_match(
    kind: &RuleKind,
    ctx: &FrameContext<'_>,
    sender_tags: &HashMap<u32, u32>,
    receiver_tags: &HashMap<u32, u32>,
) -> bool {
    match kind {
        RuleKind::MatchSourceAddress(a) => ctx.source_address == *a,
        RuleKind::MatchDestAddress(a) => ctx.dest_address == *a,
        RuleKind::MatchVlanId(v) => ctx.vlan_id == *v,
        RuleKind::MatchMacSource(m) => ctx.source_mac == *m,
        RuleKind::MatchMacDest(m) => ctx.dest_mac == *m,
        RuleKind::MatchEthertype(et) => ctx.ethertype == *et,
        RuleKind::MatchFrameSizeRange(lo, hi) => {
            let len = ctx.frame.len();
            len >= *lo as usize && len <= *hi as usize
        }
        RuleKind::MatchCharacteristics(bits) => ctx.characteristics() & *bits == *bits,
        RuleKind::MatchRandom(p) => *p == u32::MAX || frame_coin(ctx) < *p,

        RuleKind::MatchIpv4Source { ip, bits } => Ipv4View::parse(ctx)
            .map(|v| prefix_match(&v.source, ip, *bits))
            .unwrap_or(false),
        RuleKind::MatchIpv4Dest { ip, bits } => Ipv4View::parse(ctx)
            .map(|v| prefix_match(&v.dest, ip, *bits))
            .unwrap_or(false),
        RuleKind::MatchIpv6Source { ip, bits } => Ipv6View::parse(ctx)
            .map(|v| prefix_match(&v.source, ip, *bits))
            .unwrap_or(false),
        RuleKind::MatchIpv6Dest { ip, bits } => Ipv6View::parse(ctx)
            .map(|v| prefix_match(&v.dest, ip, *bits))
            .unwrap_or(false),
        RuleKind::MatchIpTos { mask, start, end } => Ipv4View::parse(ctx)
            .map(|v| {
                let tos = v.tos & mask;
                tos >= *start && tos <= *end
            })
            .unwrap_or(false),
        RuleKind::MatchIpProtocol(p) => ip_protocol(ctx).map(|x| x == *p).unwrap_or(false),
        RuleKind::MatchIcmp { icmp_type, code } => Ipv4View::parse(ctx)
            .and_then(|v| v.icmp())
            .map(|(t, c)| t == *icmp_type && code.map(|want| want == c).unwrap_or(true))
            .unwrap_or(false),
        RuleKind::MatchSourcePortRange(lo, hi) => ports(ctx)
            .map(|(src, _)| src >= *lo && src <= *hi)
            .unwrap_or(false),
        RuleKind::MatchDestPortRange(lo, hi) => ports(ctx)
            .map(|(_, dst)| dst >= *lo && dst <= *hi)
            .unwrap_or(false),

        RuleKind::MatchTagsDifference { id, value } => {
            tag_combine(sender_tags, receiver_tags, *id, |a, b| {
                (a.max(b) - a.min(b)) <= *value
            })
        }
        RuleKind::MatchTagsBitwiseAnd { id, value } => {
            tag_combine(sender_tags, receiver_tags, *id, |a, b| a & b == *value)
        }
        RuleKind::MatchTagsBitwiseOr { id, value } => {
            tag_combine(sender_tags, receiver_tags, *id, |a, b| a | b == *value)
        }
        RuleKind::MatchTagsBitwiseXor { id, value } => {
            tag_combine(sender_tags, receiver_tags, *id, |a, b| a ^ b == *value)
        }
        RuleKind::MatchTagsEqual { id, value } => {
            tag_combine(sender_tags, receiver_tags, *id, |a, b| {
                a == *value && b == *value
            })
        }
        RuleKind::MatchTagSender { id, value } => {
            sender_tags.get(id).map(|v| v == value).unwrap_or(false)
        }
        RuleKind::MatchTagReceiver { id, value } => {
            receiver_tags.get(id).map(|v| v == value).unwrap_or(false)
        }

        RuleKind::MatchIntegerRange {
            start,
            end,
            idx,
            format,
        } => match read_integer(ctx.frame, *idx as usize, *format) {
            Some(v) => v >= *start && v <= start.saturating_add(*end as u64),
            None => false,
        },

        // Actions never reach here.
        _ => false,
    }
}

/// An unknown tag on either side is undefined: the raw match is false,
/// which blocks ACCEPT unless the rule is NOT-inverted.
fn tag_combine(
    sender: &HashMap<u32, u32>,
    receiver: &HashMap<u32, u32>,
    id: u32,
    f: impl Fn(u32, u32) -> bool,
) -> bool {
    match (sender.get(&id), receiver.get(&id)) {
        (Some(a), Some(b)) => f(*a, *b),
        _ => false,
    }
}

fn prefix_match(addr: &[u8], want: &[u8], bits: u8) -> bool {
    let bits = (bits as usize).min(addr.len() * 8);
    let full = bits / 8;
    if addr[..full] != want[..full] {
        return false;
    }
    let rem = bits % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    (addr[full] & mask) == (want[full] & mask)
}

/// Read a 1-64 bit integer at byte offset `idx`. Low 6 bits of
/// `format` give (bit count - 1); the high bit selects little-endian.
fn read_integer(frame: &[u8], idx: usize, format: u8) -> Option<u64> {
    let bits = ((format & 0x3f) as usize) + 1;
    let nbytes = bits.div_ceil(8);
    if frame.len() < idx + nbytes {
        return None;
    }
    let raw = &frame[idx..idx + nbytes];
    let mut v = 0u64;
    if format & 0x80 != 0 {
        for b in raw.iter().rev() {
            v = (v << 8) | u64::from(*b);
        }
    } else {
        for b in raw {
            v = (v << 8) | u64::from(*b);
        }
    }
    if bits < 64 {
        v &= (1u64 << bits) - 1;
    }
    Some(v)
}

/// Deterministic coin for MatchRandom: a digest over the frame and
/// its addressing, reduced to 32 bits.
fn frame_coin(ctx: &FrameContext<'_>) -> u32 {
    let mut input = Vec::with_capacity(32 + ctx.frame.len());
    input.extend_from_slice(&ctx.network_id.to_be_bytes());
    input.extend_from_slice(&ctx.source_address.to_bytes());
    input.extend_from_slice(&ctx.dest_address.to_bytes());
    input.extend_from_slice(&ctx.ethertype.to_be_bytes());
    input.extend_from_slice(ctx.frame);
    let d = crypto::sha384(&input);
    u32::from_be_bytes(d[0..4].try_into().unwrap())
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

struct Ipv4View<'a> {
    source: [u8; 4],
    dest: [u8; 4],
    protocol: u8,
    tos: u8,
    payload: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    fn parse(ctx: &FrameContext<'a>) -> Option<Self> {
        if ctx.ethertype != ETHERTYPE_IPV4 {
            return None;
        }
        let f = ctx.frame;
        if f.len() < 20 || f[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((f[0] & 0x0f) as usize) * 4;
        if ihl < 20 || f.len() < ihl {
            return None;
        }
        Some(Ipv4View {
            source: f[12..16].try_into().unwrap(),
            dest: f[16..20].try_into().unwrap(),
            protocol: f[9],
            tos: f[1],
            payload: &f[ihl..],
        })
    }

    fn tcp_flags(&self) -> Option<u8> {
        if self.protocol == 6 && self.payload.len() >= 14 {
            Some(self.payload[13])
        } else {
            None
        }
    }

    fn icmp(&self) -> Option<(u8, u8)> {
        if self.protocol == 1 && self.payload.len() >= 2 {
            Some((self.payload[0], self.payload[1]))
        } else {
            None
        }
    }
}

struct Ipv6View<'a> {
    source: [u8; 16],
    dest: [u8; 16],
    next_header: u8,
    payload: &'a [u8],
}

impl<'a> Ipv6View<'a> {
    fn parse(ctx: &FrameContext<'a>) -> Option<Self> {
        if ctx.ethertype != ETHERTYPE_IPV6 {
            return None;
        }
        let f = ctx.frame;
        if f.len() < 40 || f[0] >> 4 != 6 {
            return None;
        }
        Some(Ipv6View {
            source: f[8..24].try_into().unwrap(),
            dest: f[24..40].try_into().unwrap(),
            next_header: f[6],
            payload: &f[40..],
        })
    }
}

fn ip_protocol(ctx: &FrameContext<'_>) -> Option<u8> {
    if let Some(v) = Ipv4View::parse(ctx) {
        return Some(v.protocol);
    }
    Ipv6View::parse(ctx).map(|v| v.next_header)
}

fn ports(ctx: &FrameContext<'_>) -> Option<(u16, u16)> {
    let (proto, payload) = if let Some(v) = Ipv4View::parse(ctx) {
        (v.protocol, v.payload)
    } else if let Some(v) = Ipv6View::parse(ctx) {
        (v.next_header, v.payload)
    } else {
        return None;
    };
    if (proto == 6 || proto == 17) && payload.len() >= 4 {
        Some((
            u16::from_be_bytes(payload[0..2].try_into().unwrap()),
            u16::from_be_bytes(payload[2..4].try_into().unwrap()),
        ))
    } else {
        None
    }
}
