//! Remote peers and the grow-only table that tracks them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A remote peer plus the socket used to reach it.
///
/// On the server every learned endpoint shares the single listening socket;
/// on the client each endpoint owns the socket bound for its path. The
/// shared handle keeps the socket alive as long as either the table or the
/// registry holds it.
#[derive(Clone)]
pub struct Endpoint {
    pub peer: SocketAddr,
    pub socket: Arc<UdpSocket>,
}

impl Endpoint {
    pub fn new(peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self { peer, socket }
    }
}

/// Set of known endpoints keyed by peer address.
///
/// Entries are only ever added: there is no aging, probing, or removal.
/// Once a peer is known it stays a fan-out target for the rest of the run.
#[derive(Default)]
pub struct EndpointTable {
    entries: HashMap<SocketAddr, Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if the peer is unknown. Returns whether an insertion happened.
    pub fn insert_or_ignore(&mut self, endpoint: Endpoint) -> bool {
        match self.entries.entry(endpoint.peer) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                true
            }
        }
    }

    /// All current endpoints, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.values()
    }

    /// Whether the peer is already known.
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, EndpointTable};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    async fn shared_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn peer(last_octet: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 42, 42, last_octet], port))
    }

    #[tokio::test]
    async fn insert_is_ignored_for_known_peer() {
        let socket = shared_socket().await;
        let mut table = EndpointTable::new();

        assert!(table.insert_or_ignore(Endpoint::new(peer(1, 4242), socket.clone())));
        assert!(!table.insert_or_ignore(Endpoint::new(peer(1, 4242), socket.clone())));
        assert_eq!(table.len(), 1);
        assert!(table.contains(&peer(1, 4242)));
        assert!(!table.contains(&peer(2, 4242)));
    }

    #[tokio::test]
    async fn same_address_different_port_is_a_distinct_peer() {
        let socket = shared_socket().await;
        let mut table = EndpointTable::new();

        assert!(table.insert_or_ignore(Endpoint::new(peer(1, 4242), socket.clone())));
        assert!(table.insert_or_ignore(Endpoint::new(peer(1, 4243), socket.clone())));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn iter_yields_every_entry() {
        let socket = shared_socket().await;
        let mut table = EndpointTable::new();
        assert!(table.is_empty());

        for octet in 1..=5 {
            table.insert_or_ignore(Endpoint::new(peer(octet, 4242), socket.clone()));
        }
        assert_eq!(table.iter().count(), 5);
        assert!(table.iter().all(|e| e.peer.port() == 4242));
    }
}
