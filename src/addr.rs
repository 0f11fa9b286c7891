//! Network addresses on top of libp2p multiaddrs.
//!
//! Only the shapes the overlay actually exchanges are accepted:
//! `/ip4/<ip>/tcp/<port>`, `/ip6/<ip>/udp/<port>`, each optionally
//! followed by `/p2p/<peer-id>`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use libp2p::multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Transport protocol of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream transport.
    Tcp,
    /// Datagram transport.
    Udp,
}

/// A dialable address, optionally bound to a peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    addr: Multiaddr,
    ip: IpAddr,
    transport: Transport,
    port: u16,
    peer: Option<PeerId>,
}

impl PeerAddr {
    fn build(ip: IpAddr, transport: Transport, port: u16, peer: Option<PeerId>) -> Self {
        let mut addr = Multiaddr::empty().with(Protocol::from(ip)).with(match transport {
            Transport::Tcp => Protocol::Tcp(port),
            Transport::Udp => Protocol::Udp(port),
        });
        if let Some(peer) = &peer {
            addr.push(Protocol::P2p(peer.to_libp2p()));
        }
        Self {
            addr,
            ip,
            transport,
            port,
            peer,
        }
    }

    /// TCP address without a peer suffix.
    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        Self::build(ip, Transport::Tcp, port, None)
    }

    /// UDP address without a peer suffix.
    pub fn udp(ip: IpAddr, port: u16) -> Self {
        Self::build(ip, Transport::Udp, port, None)
    }

    /// Validate a multiaddr against the accepted shapes.
    pub fn from_multiaddr(addr: Multiaddr) -> Result<Self> {
        let bad = |why: &str| Error::validation(format!("invalid address {addr}: {why}"));
        let mut parts = addr.iter();
        let ip = match parts.next() {
            Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
            Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
            _ => return Err(bad("expected /ip4 or /ip6")),
        };
        let (transport, port) = match parts.next() {
            Some(Protocol::Tcp(port)) => (Transport::Tcp, port),
            Some(Protocol::Udp(port)) => (Transport::Udp, port),
            _ => return Err(bad("expected /tcp or /udp")),
        };
        let peer = match parts.next() {
            None => None,
            Some(Protocol::P2p(id)) => Some(PeerId::from_libp2p(&id)?),
            Some(_) => return Err(bad("unsupported component")),
        };
        if parts.next().is_some() {
            return Err(bad("unexpected trailing components"));
        }
        Ok(Self {
            addr,
            ip,
            transport,
            port,
            peer,
        })
    }

    /// The underlying multiaddr.
    pub fn as_multiaddr(&self) -> &Multiaddr {
        &self.addr
    }

    /// Attach a `/p2p/<id>` suffix.
    pub fn with_peer(self, peer: PeerId) -> Self {
        Self::build(self.ip, self.transport, self.port, Some(peer))
    }

    /// Drop the `/p2p/<id>` suffix.
    pub fn without_peer(self) -> Self {
        if self.peer.is_none() {
            return self;
        }
        Self::build(self.ip, self.transport, self.port, None)
    }

    /// IP component.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port component.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transport component.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Peer suffix, if any.
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    /// IP and port as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether the address points at the loopback interface.
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: Multiaddr = s
            .trim()
            .parse()
            .map_err(|e| Error::validation(format!("invalid address {s:?}: {e}")))?;
        Self::from_multiaddr(addr)
    }
}

impl TryFrom<Multiaddr> for PeerAddr {
    type Error = Error;

    fn try_from(addr: Multiaddr) -> Result<Self> {
        Self::from_multiaddr(addr)
    }
}

impl From<PeerAddr> for Multiaddr {
    fn from(addr: PeerAddr) -> Self {
        addr.addr
    }
}

impl Serialize for PeerAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A peer identity together with the addresses it can be reached on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    /// Peer identity.
    pub id: PeerId,
    /// Known addresses, without `/p2p` suffixes.
    pub addrs: Vec<PeerAddr>,
}

impl AddrInfo {
    /// Build from an identity and addresses, stripping peer suffixes.
    pub fn new(id: PeerId, addrs: impl IntoIterator<Item = PeerAddr>) -> Self {
        Self {
            id,
            addrs: addrs.into_iter().map(PeerAddr::without_peer).collect(),
        }
    }

    /// Merge addresses not yet known, keeping insertion order.
    pub fn merge_addrs(&mut self, addrs: impl IntoIterator<Item = PeerAddr>) {
        for addr in addrs {
            let addr = addr.without_peer();
            if !self.addrs.contains(&addr) {
                self.addrs.push(addr);
            }
        }
    }

    /// Addresses with the `/p2p/<id>` suffix attached.
    pub fn p2p_addrs(&self) -> Vec<PeerAddr> {
        self.addrs
            .iter()
            .cloned()
            .map(|a| a.with_peer(self.id))
            .collect()
    }

    /// Group full `/p2p` addresses by peer identity, preserving first-seen order.
    pub fn from_p2p_addrs(addrs: impl IntoIterator<Item = PeerAddr>) -> Result<Vec<AddrInfo>> {
        let mut out: Vec<AddrInfo> = Vec::new();
        for addr in addrs {
            let id = addr
                .peer()
                .ok_or_else(|| Error::validation(format!("address {addr} has no /p2p component")))?;
            match out.iter_mut().find(|info| info.id == id) {
                Some(info) => info.merge_addrs([addr]),
                None => out.push(AddrInfo::new(id, [addr])),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parses_and_prints_common_shapes() {
        let addr: PeerAddr = "/ip4/192.168.1.10/tcp/4001".parse().unwrap();
        assert_eq!(addr.port(), 4001);
        assert_eq!(addr.transport(), Transport::Tcp);
        assert_eq!(addr.to_string(), "/ip4/192.168.1.10/tcp/4001");
        assert_eq!(addr, PeerAddr::tcp("192.168.1.10".parse().unwrap(), 4001));

        let v6: PeerAddr = "/ip6/::1/udp/3478".parse().unwrap();
        assert!(v6.is_loopback());
        assert_eq!(v6.to_string(), "/ip6/::1/udp/3478");
    }

    #[test]
    fn p2p_suffix_is_kept_and_stripped() {
        let id = Keypair::generate().peer_id();
        let text = format!("/ip4/10.0.0.1/tcp/5001/p2p/{}", id.to_libp2p());
        let addr: PeerAddr = text.parse().unwrap();
        assert_eq!(addr.peer(), Some(id));
        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.clone().without_peer().to_string(), "/ip4/10.0.0.1/tcp/5001");
        assert_eq!(addr.clone().without_peer().with_peer(id), addr);

        let multiaddr: Multiaddr = addr.clone().into();
        assert_eq!(PeerAddr::try_from(multiaddr).unwrap(), addr);
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "ip4/1.2.3.4/tcp/1",
            "/ip4/1.2.3.4/tcp",
            "/ip4/::1/tcp/1",
            "/dns/example.com/tcp/1",
            "/ip4/1.2.3.4/sctp/1",
            "/ip4/1.2.3.4/tcp/99999",
            "/ip4/1.2.3.4/tcp/1/quic",
            "/ip4/1.2.3.4/tcp/1/p2p/QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N",
        ] {
            assert!(bad.parse::<PeerAddr>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn groups_p2p_addrs_by_peer() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let at = |ip: &str, peer: PeerId| PeerAddr::tcp(ip.parse().unwrap(), 4001).with_peer(peer);
        let addrs = vec![at("10.0.0.1", a), at("10.0.0.2", b), at("10.0.0.3", a)];
        let infos = AddrInfo::from_p2p_addrs(addrs).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, a);
        assert_eq!(infos[0].addrs.len(), 2);
        assert_eq!(infos[1].id, b);
    }
}
