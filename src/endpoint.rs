//! Typed physical endpoints and Ethernet MAC addresses.
//!
//! An [`Endpoint`] names one way a node might be reached: an IP/UDP
//! socket address, a raw Ethernet MAC, relaying via another node, and
//! so on. Only IP/UDP endpoints are operational for sending today; the
//! data model round-trips every variant so locators exchanged with
//! newer nodes survive untouched. Binary layout on the wire is the
//! source of truth; each variant is a type byte followed by its body.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::MarshalError;
use crate::identity::{Address, Fingerprint};

/// 48-bit Ethernet MAC address held in the low bits of a u64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mac(u64);

impl Mac {
    pub const BROADCAST: Mac = Mac(0xffff_ffff_ffff);

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        Mac(v & 0xffff_ffff_ffff)
    }

    pub fn from_bytes(b: &[u8; 6]) -> Self {
        let mut v = 0u64;
        for byte in b {
            v = (v << 8) | u64::from(*byte);
        }
        Mac(v)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 6] {
        let v = self.0;
        [
            (v >> 40) as u8,
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

    /// True when the group bit is set (multicast or broadcast).
    #[inline]
    pub fn is_multicast(self) -> bool {
        (self.0 >> 40) & 0x01 != 0
    }

    #[inline]
    pub fn is_broadcast(self) -> bool {
        self == Mac::BROADCAST
    }

    /// The deterministic MAC a member uses on a given network. The
    /// first octet is locally administered and derived from the
    /// network ID; the remaining 40 bits are the node address XOR'd
    /// with network ID bytes so distinct networks get distinct MACs.
    pub fn from_address(address: Address, network_id: u64) -> Self {
        let mut first = ((network_id & 0xfe) | 0x02) as u8;
        if first == 0x52 {
            // Avoid colliding with the prefix QEMU and friends claim.
            first = 0x32;
        }
        let mut low = address.as_u64();
        low ^= (network_id >> 8) & 0xff00_0000_00;
        low ^= (network_id >> 16) & 0x00ff_0000_00;
        low ^= (network_id >> 24) & 0x0000_ff00_00;
        low &= 0xff_ffff_ffff;
        Mac(((first as u64) << 40) | low)
    }

    /// Invert [`Mac::from_address`] for a known network.
    pub fn to_address(self, network_id: u64) -> Option<Address> {
        let mut low = self.0 & 0xff_ffff_ffff;
        low ^= (network_id >> 8) & 0xff00_0000_00;
        low ^= (network_id >> 16) & 0x00ff_0000_00;
        low ^= (network_id >> 24) & 0x0000_ff00_00;
        Address::from_u64(low)
    }
}

impl std::fmt::Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::fmt::Debug for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mac({})", self)
    }
}

/// Endpoint type tags. Wire values are stable.
const TYPE_NIL: u8 = 0;
const TYPE_RELAY: u8 = 1;
const TYPE_ETHERNET: u8 = 2;
const TYPE_WIFI_DIRECT: u8 = 3;
const TYPE_BLUETOOTH: u8 = 4;
const TYPE_IP: u8 = 5;
const TYPE_IP_UDP: u8 = 6;
const TYPE_IP_TCP: u8 = 7;
const TYPE_IP_HTTP: u8 = 8;

/// A typed physical address variant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Endpoint {
    /// Empty endpoint; marshals to a single type byte.
    Nil,
    /// Reach via another node acting as relay.
    Relay(Fingerprint),
    /// Raw Ethernet frames to a MAC.
    Ethernet(Mac),
    /// WiFi-direct, addressed like Ethernet.
    WifiDirect(Mac),
    /// Bluetooth, addressed like Ethernet.
    Bluetooth(Mac),
    /// Naked IP encapsulation.
    Ip(IpAddr),
    /// IP/UDP, the operational default.
    IpUdp(SocketAddr),
    /// IP/TCP stream encapsulation.
    IpTcp(SocketAddr),
    /// HTTP tunnel encapsulation.
    IpHttp(SocketAddr),
}

impl Endpoint {
    /// The socket address, for variants that carry one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::IpUdp(sa) | Endpoint::IpTcp(sa) | Endpoint::IpHttp(sa) => Some(*sa),
            _ => None,
        }
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        match self {
            Endpoint::Nil => out.push(TYPE_NIL),
            Endpoint::Relay(fp) => {
                out.push(TYPE_RELAY);
                fp.marshal(out);
            }
            Endpoint::Ethernet(m) => {
                out.push(TYPE_ETHERNET);
                out.extend_from_slice(&m.to_bytes());
            }
            Endpoint::WifiDirect(m) => {
                out.push(TYPE_WIFI_DIRECT);
                out.extend_from_slice(&m.to_bytes());
            }
            Endpoint::Bluetooth(m) => {
                out.push(TYPE_BLUETOOTH);
                out.extend_from_slice(&m.to_bytes());
            }
            Endpoint::Ip(ip) => {
                out.push(TYPE_IP);
                marshal_ip(ip, out);
            }
            Endpoint::IpUdp(sa) => {
                out.push(TYPE_IP_UDP);
                marshal_sockaddr(sa, out);
            }
            Endpoint::IpTcp(sa) => {
                out.push(TYPE_IP_TCP);
                marshal_sockaddr(sa, out);
            }
            Endpoint::IpHttp(sa) => {
                out.push(TYPE_IP_HTTP);
                marshal_sockaddr(sa, out);
            }
        }
    }

    pub fn unmarshal(b: &[u8]) -> Result<(Self, usize), MarshalError> {
        if b.is_empty() {
            return Err(MarshalError::Underflow);
        }
        let body = &b[1..];
        match b[0] {
            TYPE_NIL => Ok((Endpoint::Nil, 1)),
            TYPE_RELAY => {
                let (fp, n) = Fingerprint::unmarshal(body)?;
                Ok((Endpoint::Relay(fp), 1 + n))
            }
            TYPE_ETHERNET | TYPE_WIFI_DIRECT | TYPE_BLUETOOTH => {
                if body.len() < 6 {
                    return Err(MarshalError::Underflow);
                }
                let mac = Mac::from_bytes(&body[..6].try_into().unwrap());
                let ep = match b[0] {
                    TYPE_ETHERNET => Endpoint::Ethernet(mac),
                    TYPE_WIFI_DIRECT => Endpoint::WifiDirect(mac),
                    _ => Endpoint::Bluetooth(mac),
                };
                Ok((ep, 7))
            }
            TYPE_IP => {
                let (ip, n) = unmarshal_ip(body)?;
                Ok((Endpoint::Ip(ip), 1 + n))
            }
            TYPE_IP_UDP | TYPE_IP_TCP | TYPE_IP_HTTP => {
                let (sa, n) = unmarshal_sockaddr(body)?;
                let ep = match b[0] {
                    TYPE_IP_UDP => Endpoint::IpUdp(sa),
                    TYPE_IP_TCP => Endpoint::IpTcp(sa),
                    _ => Endpoint::IpHttp(sa),
                };
                Ok((ep, 1 + n))
            }
            _ => Err(MarshalError::UnknownType),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Nil => write!(f, "nil"),
            Endpoint::Relay(fp) => write!(f, "relay:{}", fp.address),
            Endpoint::Ethernet(m) => write!(f, "eth:{}", m),
            Endpoint::WifiDirect(m) => write!(f, "wifid:{}", m),
            Endpoint::Bluetooth(m) => write!(f, "bt:{}", m),
            Endpoint::Ip(ip) => write!(f, "ip:{}", ip),
            Endpoint::IpUdp(sa) => write!(f, "udp:{}", sa),
            Endpoint::IpTcp(sa) => write!(f, "tcp:{}", sa),
            Endpoint::IpHttp(sa) => write!(f, "http:{}", sa),
        }
    }
}

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

fn marshal_ip(ip: &IpAddr, out: &mut Vec<u8>) {
    match ip {
        IpAddr::V4(v4) => {
            out.push(FAMILY_V4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(FAMILY_V6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

fn unmarshal_ip(b: &[u8]) -> Result<(IpAddr, usize), MarshalError> {
    if b.is_empty() {
        return Err(MarshalError::Underflow);
    }
    match b[0] {
        FAMILY_V4 => {
            if b.len() < 5 {
                return Err(MarshalError::Underflow);
            }
            let o: [u8; 4] = b[1..5].try_into().unwrap();
            Ok((IpAddr::V4(Ipv4Addr::from(o)), 5))
        }
        FAMILY_V6 => {
            if b.len() < 17 {
                return Err(MarshalError::Underflow);
            }
            let o: [u8; 16] = b[1..17].try_into().unwrap();
            Ok((IpAddr::V6(Ipv6Addr::from(o)), 17))
        }
        _ => Err(MarshalError::InvalidField),
    }
}

fn marshal_sockaddr(sa: &SocketAddr, out: &mut Vec<u8>) {
    marshal_ip(&sa.ip(), out);
    out.extend_from_slice(&sa.port().to_be_bytes());
}

fn unmarshal_sockaddr(b: &[u8]) -> Result<(SocketAddr, usize), MarshalError> {
    let (ip, n) = unmarshal_ip(b)?;
    if b.len() < n + 2 {
        return Err(MarshalError::Underflow);
    }
    let port = u16::from_be_bytes(b[n..n + 2].try_into().unwrap());
    Ok((SocketAddr::new(ip, port), n + 2))
}
