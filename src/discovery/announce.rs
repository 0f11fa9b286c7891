//! Local-network announcements and their TXT record form.

use std::net::IpAddr;

use crate::addr::{AddrInfo, PeerAddr, Transport};
use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Ports that well-known bootstrap deployments listen on.
pub const BOOTSTRAP_PORTS: [u16; 4] = [4001, 5001, 8080, 9090];
/// Port announced when the host has no TCP listen address.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 4001;
/// Upper bound for one `key=value` TXT record.
pub const TXT_RECORD_BUDGET: usize = 200;

/// TXT key carrying the peer identity.
pub const TXT_PEER_ID: &str = "peer_id";
/// TXT key carrying the announced port.
pub const TXT_PORT: &str = "port";
/// TXT key prefix for address chunks (`addresses`, `addresses_1`, ...).
pub const TXT_ADDRESSES: &str = "addresses";

/// Best-effort guess whether a peer is a bootstrap node: any TCP address on
/// one of [`BOOTSTRAP_PORTS`].
pub fn is_likely_bootstrap(addrs: &[PeerAddr]) -> bool {
    addrs
        .iter()
        .any(|a| a.transport() == Transport::Tcp && BOOTSTRAP_PORTS.contains(&a.port()))
}

/// Instance name advertised for `peer` by `component`.
pub fn instance_name(peer: &PeerId, component: &str) -> String {
    format!("peers-touch-{}-{component}", peer.short(8))
}

/// What this node advertises on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Service instance name.
    pub instance: String,
    /// Local identity.
    pub peer_id: PeerId,
    /// Advertised service port.
    pub port: u16,
    /// Non-loopback addresses.
    pub addrs: Vec<PeerAddr>,
}

impl Advertisement {
    /// Build the advertisement for a host. Loopback addresses are dropped and
    /// the port is taken from the first TCP address.
    pub fn for_host(peer_id: PeerId, component: &str, addrs: &[PeerAddr]) -> Self {
        let addrs: Vec<PeerAddr> = addrs
            .iter()
            .filter(|a| !a.is_loopback() && !a.ip().is_unspecified())
            .map(|a| a.clone().without_peer())
            .collect();
        let port = addrs
            .iter()
            .find(|a| a.transport() == Transport::Tcp)
            .map(PeerAddr::port)
            .unwrap_or(DEFAULT_ANNOUNCE_PORT);
        Self {
            instance: instance_name(&peer_id, component),
            peer_id,
            port,
            addrs,
        }
    }

    /// TXT records; addresses are packed into as many records as needed to
    /// keep each one within [`TXT_RECORD_BUDGET`].
    pub fn txt_records(&self) -> Vec<(String, String)> {
        let mut records = vec![
            (TXT_PEER_ID.to_string(), self.peer_id.to_string()),
            (TXT_PORT.to_string(), self.port.to_string()),
        ];

        let mut chunk = String::new();
        let mut index = 0usize;
        let key_for = |i: usize| {
            if i == 0 {
                TXT_ADDRESSES.to_string()
            } else {
                format!("{TXT_ADDRESSES}_{i}")
            }
        };
        for addr in &self.addrs {
            let text = addr.to_string();
            let key_len = key_for(index).len() + 1;
            if !chunk.is_empty() && key_len + chunk.len() + 1 + text.len() > TXT_RECORD_BUDGET {
                records.push((key_for(index), std::mem::take(&mut chunk)));
                index += 1;
            }
            if !chunk.is_empty() {
                chunk.push(',');
            }
            chunk.push_str(&text);
        }
        if !chunk.is_empty() {
            records.push((key_for(index), chunk));
        }
        records
    }
}

/// One answer received from the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// TXT records as key/value pairs.
    pub txt: Vec<(String, String)>,
    /// IP the answer was resolved to, if known.
    pub source: Option<IpAddr>,
}

impl Announcement {
    /// Announcement carrying `ad`'s TXT records, as a resolver would see it.
    pub fn from_advertisement(ad: &Advertisement, source: Option<IpAddr>) -> Self {
        Self {
            txt: ad.txt_records(),
            source,
        }
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Extract the announcing peer. Unparsable addresses are skipped; an
    /// announcement without identity or without any address is rejected.
    pub fn parse(&self) -> Result<AddrInfo> {
        let id: PeerId = self
            .value(TXT_PEER_ID)
            .ok_or_else(|| Error::validation("announcement has no peer_id"))?
            .parse()?;
        let port = self.value(TXT_PORT).and_then(|p| p.parse::<u16>().ok());

        let mut info = AddrInfo::new(id, []);
        for (key, value) in &self.txt {
            if !key.starts_with(TXT_ADDRESSES) {
                continue;
            }
            let addrs = value
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| s.parse::<PeerAddr>().ok());
            info.merge_addrs(addrs);
        }
        if let (Some(ip), Some(port)) = (self.source, port) {
            info.merge_addrs([PeerAddr::tcp(ip, port)]);
        }

        if info.addrs.is_empty() {
            return Err(Error::validation(format!("announcement from {id} has no usable address")));
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::net::Ipv4Addr;

    fn tcp(ip: [u8; 4], port: u16) -> PeerAddr {
        PeerAddr::tcp(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    #[test]
    fn bootstrap_ports_are_recognised() {
        for port in BOOTSTRAP_PORTS {
            assert!(is_likely_bootstrap(&[tcp([10, 0, 0, 1], port)]), "{port}");
        }
        for port in [3000, 8000, 12345] {
            assert!(!is_likely_bootstrap(&[tcp([10, 0, 0, 1], port)]), "{port}");
        }
        let udp = PeerAddr::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4001);
        assert!(!is_likely_bootstrap(&[udp]));
        assert!(!is_likely_bootstrap(&[]));
    }

    #[test]
    fn advertisement_skips_loopback_and_picks_port() {
        let id = Keypair::generate().peer_id();
        let ad = Advertisement::for_host(
            id,
            "registry",
            &[tcp([127, 0, 0, 1], 9000), tcp([192, 168, 1, 4], 5001)],
        );
        assert_eq!(ad.port, 5001);
        assert_eq!(ad.addrs, vec![tcp([192, 168, 1, 4], 5001)]);
        assert!(ad.instance.starts_with("peers-touch-"));
        assert!(ad.instance.ends_with("-registry"));

        let only_loopback = Advertisement::for_host(id, "registry", &[tcp([127, 0, 0, 1], 9000)]);
        assert_eq!(only_loopback.port, DEFAULT_ANNOUNCE_PORT);
        assert!(only_loopback.addrs.is_empty());
    }

    #[test]
    fn long_address_lists_are_chunked_within_budget() {
        let id = Keypair::generate().peer_id();
        let addrs: Vec<PeerAddr> = (0..20).map(|i| tcp([192, 168, 1, i], 4001)).collect();
        let ad = Advertisement::for_host(id, "registry", &addrs);

        let records = ad.txt_records();
        let chunks: Vec<_> = records
            .iter()
            .filter(|(k, _)| k.starts_with(TXT_ADDRESSES))
            .collect();
        assert!(chunks.len() > 1);
        for (k, v) in &records {
            assert!(k.len() + 1 + v.len() <= TXT_RECORD_BUDGET, "{k} too long");
        }

        let parsed = Announcement::from_advertisement(&ad, None).parse().unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.addrs, addrs);
    }

    #[test]
    fn source_address_is_merged() {
        let id = Keypair::generate().peer_id();
        let ad = Advertisement::for_host(id, "registry", &[tcp([10, 1, 1, 1], 4001)]);
        let src = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 9));
        let parsed = Announcement::from_advertisement(&ad, Some(src))
            .parse()
            .unwrap();
        assert_eq!(parsed.addrs, vec![tcp([10, 1, 1, 1], 4001), tcp([192, 168, 0, 9], 4001)]);
    }

    #[test]
    fn malformed_announcements_are_rejected() {
        let missing_id = Announcement {
            txt: vec![("addresses".into(), "/ip4/10.0.0.1/tcp/4001".into())],
            source: None,
        };
        assert!(missing_id.parse().is_err());

        let id = Keypair::generate().peer_id();
        let no_addrs = Announcement {
            txt: vec![
                ("peer_id".into(), id.to_string()),
                ("addresses".into(), "garbage,,more garbage".into()),
            ],
            source: None,
        };
        assert!(no_addrs.parse().is_err());
    }
}
