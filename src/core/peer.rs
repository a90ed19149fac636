use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

use serde::{Deserialize, Serialize};

use super::id::Id;

/// The public, wire-value form of a peer: enough to address it and order it
/// by distance. Referrals returned by Find/Introduce are these values, never
/// live references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: Id,
    pub peer_name: String,
    #[serde(with = "serde_ipaddr")]
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(peer_id: Id, peer_name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer_id,
            peer_name: peer_name.into(),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// A peer as tracked by the routing table: its address plus how it has
/// behaved so far. Two peers are the same iff their ids match; contact info
/// and counters are mutable.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: PeerAddress,
    pub requests_received: u64,
    pub responses_received: u64,
    pub latest_request: Option<Instant>,
    pub latest_response: Option<Instant>,
}

impl Peer {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            requests_received: 0,
            responses_received: 0,
            latest_request: None,
            latest_response: None,
        }
    }

    /// A peer first observed through a response at `now`.
    pub fn responded(address: PeerAddress, now: Instant) -> Self {
        let mut peer = Self::new(address);
        peer.record_response(now);
        peer
    }

    pub fn id(&self) -> Id {
        self.address.peer_id
    }

    pub fn record_request(&mut self, now: Instant) {
        self.requests_received += 1;
        self.latest_request = Some(now);
    }

    pub fn record_response(&mut self, now: Instant) {
        self.responses_received += 1;
        self.latest_response = Some(now);
    }

    /// Fold another observation of the same peer into this record: newer
    /// contact info wins, the larger counters and timestamps are kept.
    pub fn merge(&mut self, other: &Peer) {
        debug_assert_eq!(self.id(), other.id());
        if self.address != other.address {
            self.address = other.address.clone();
        }
        self.requests_received = self.requests_received.max(other.requests_received);
        self.responses_received = self.responses_received.max(other.responses_received);
        self.latest_request = self.latest_request.max(other.latest_request);
        self.latest_response = self.latest_response.max(other.latest_response);
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Peer {}

// Needed for msgpack ser/de of IpAddr.
// Instead of producing a map with the enum variant, we simply convert right into a string.
mod serde_ipaddr {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::IpAddr;

    pub fn serialize<S>(ip: &IpAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&ip.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<IpAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn address(last_octet: u8) -> PeerAddress {
        PeerAddress {
            peer_id: Id::new_random(),
            peer_name: format!("peer-{last_octet}"),
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet)),
            port: 20_100 + last_octet as u16,
        }
    }

    #[test]
    fn record_response_updates_counter_and_timestamp() {
        let mut peer = Peer::new(address(1));
        assert_eq!(peer.responses_received, 0);
        assert!(peer.latest_response.is_none());

        let now = Instant::now();
        peer.record_response(now);
        assert_eq!(peer.responses_received, 1);
        assert_eq!(peer.latest_response, Some(now));
    }

    #[test]
    fn merge_takes_new_address_and_max_counters() {
        let addr = address(1);
        let mut a = Peer::new(addr.clone());
        a.record_response(Instant::now());
        a.record_response(Instant::now());

        let mut moved = addr.clone();
        moved.port += 1;
        let mut b = Peer {
            address: moved.clone(),
            ..Peer::new(addr)
        };
        b.record_response(Instant::now());

        a.merge(&b);
        assert_eq!(a.address, moved);
        assert_eq!(a.responses_received, 2);
    }

    #[test]
    fn equality_is_by_id_only() {
        let addr = address(1);
        let a = Peer::new(addr.clone());
        let mut relocated = addr;
        relocated.port += 7;
        let b = Peer::new(relocated);
        assert_eq!(a, b);
    }

    #[test]
    fn peer_address_roundtrips_through_msgpack() {
        let addr = address(9);
        let bytes = rmp_serde::to_vec(&addr).unwrap();
        let back: PeerAddress = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(addr, back);
    }
}
