//! Role setup and the forwarding loop bridging one TUN device to a set of
//! UDP paths.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::select_all;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::dedup::{DedupRing, MTU};
use crate::endpoint::{Endpoint, EndpointTable};
use crate::tun::TunDevice;

/// Upper bound on pollable descriptors: the TUN device plus every UDP
/// socket. The same bound caps how many endpoints the server will learn.
pub const MAX_SOCKS: usize = 100;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// One client path: the local address to bind on paired with the remote
/// server address reached through it. Parsed from `<bind>:<server>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathPair {
    pub bind: Ipv4Addr,
    pub server: Ipv4Addr,
}

impl FromStr for PathPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (bind, server) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("endpoint pair must be <bind>:<server>, got {s:?}"))?;
        Ok(Self {
            bind: bind
                .trim()
                .parse()
                .with_context(|| format!("invalid bind address in {s:?}"))?,
            server: server
                .trim()
                .parse()
                .with_context(|| format!("invalid server address in {s:?}"))?,
        })
    }
}

/// Slot-indexed registry of every UDP socket the readiness wait covers.
///
/// Slots are handed out at registration and stay valid for the whole run;
/// the registry never shrinks. Slot numbering leaves room for the TUN in
/// the descriptor budget.
struct SocketRegistry {
    sockets: Vec<Arc<UdpSocket>>,
}

impl SocketRegistry {
    fn new() -> Self {
        Self {
            sockets: Vec::new(),
        }
    }

    fn register(&mut self, socket: Arc<UdpSocket>) -> Result<usize> {
        if self.sockets.len() + 1 >= MAX_SOCKS {
            bail!("descriptor budget exhausted ({MAX_SOCKS} descriptors)");
        }
        self.sockets.push(socket);
        Ok(self.sockets.len() - 1)
    }

    fn get(&self, slot: usize) -> Option<&Arc<UdpSocket>> {
        self.sockets.get(slot)
    }

    fn sockets(&self) -> &[Arc<UdpSocket>] {
        &self.sockets
    }
}

#[derive(Default)]
struct Counters {
    tun_rx: u64,
    tun_wr: u64,
    udp_rx: u64,
    udp_tx: u64,
    dup_drop: u64,
}

enum Wake {
    Tun(io::Result<usize>),
    Udp(usize, io::Result<()>),
    Stats,
}

/// The forwarding engine: one TUN device multiplexed against the registered
/// UDP sockets, all state owned by the single loop task.
pub struct Engine<T> {
    tun: T,
    registry: SocketRegistry,
    endpoints: EndpointTable,
    dedup: DedupRing,
    /// Slot of the shared listening socket; endpoint learning only happens
    /// on traffic received here, which keeps the client table fixed.
    server_slot: Option<usize>,
    counters: Counters,
}

impl<T: TunDevice> Engine<T> {
    /// Server role: one shared socket, endpoints learned from inbound
    /// traffic. The table starts empty.
    pub async fn server(tun: T, listen: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(listen, port))
            .await
            .with_context(|| format!("udp bind {listen}:{port} failed"))?;
        info!(bind = %listen, port, "server socket ready");

        let mut registry = SocketRegistry::new();
        let slot = registry.register(Arc::new(socket))?;

        Ok(Self {
            tun,
            registry,
            endpoints: EndpointTable::new(),
            dedup: DedupRing::new(),
            server_slot: Some(slot),
            counters: Counters::default(),
        })
    }

    /// Client role: one socket per configured path, peer set fixed at
    /// startup.
    pub async fn client(tun: T, paths: &[PathPair], port: u16) -> Result<Self> {
        if paths.is_empty() {
            bail!("client role requires at least one endpoint pair");
        }

        let mut registry = SocketRegistry::new();
        let mut endpoints = EndpointTable::new();
        for path in paths {
            let socket = UdpSocket::bind(SocketAddrV4::new(path.bind, 0))
                .await
                .with_context(|| format!("udp bind {} failed", path.bind))?;
            let socket = Arc::new(socket);
            registry.register(socket.clone())?;

            let peer = SocketAddr::from(SocketAddrV4::new(path.server, port));
            if endpoints.insert_or_ignore(Endpoint::new(peer, socket)) {
                info!(bind = %path.bind, peer = %peer, "path ready");
            } else {
                debug!(peer = %peer, "duplicate endpoint pair ignored");
            }
        }

        Ok(Self {
            tun,
            registry,
            endpoints,
            dedup: DedupRing::new(),
            server_slot: None,
            counters: Counters::default(),
        })
    }

    /// Drive the loop until a fatal error or until the readiness wait dies,
    /// which is treated as shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut tun_buf = [0u8; MTU];
        let mut udp_buf = [0u8; MTU];
        let mut stats = interval(STATS_INTERVAL);

        loop {
            // TUN-sourced traffic is drained ahead of UDP fan-in, keeping
            // the outbound pipeline depth at one packet.
            let wake = tokio::select! {
                biased;
                read = self.tun.read_packet(&mut tun_buf) => Wake::Tun(read),
                ready = next_readable(self.registry.sockets()) => Wake::Udp(ready.0, ready.1),
                _ = stats.tick() => Wake::Stats,
            };

            match wake {
                Wake::Tun(read) => {
                    let n = read.context("tun read failed")?;
                    self.forward_from_tun(&tun_buf[..n]).await;
                }
                Wake::Udp(slot, ready) => {
                    if let Err(err) = ready {
                        warn!(error = %err, "readiness wait failed; stopping");
                        return Ok(());
                    }
                    self.pump_socket(slot, &mut udp_buf).await?;
                }
                Wake::Stats => {
                    let c = &self.counters;
                    debug!(
                        tun_rx = c.tun_rx,
                        tun_wr = c.tun_wr,
                        udp_rx = c.udp_rx,
                        udp_tx = c.udp_tx,
                        dup_drop = c.dup_drop,
                        "forwarding stats"
                    );
                }
            }
        }
    }

    /// Fan one TUN packet out to every known endpoint. Send failures are
    /// per-path: another copy may still get through, so they never stop the
    /// loop.
    async fn forward_from_tun(&mut self, packet: &[u8]) {
        self.counters.tun_rx += 1;
        if self.endpoints.is_empty() {
            // server before the first peer is learned; nowhere to send yet
            debug!(len = packet.len(), "tun packet with no endpoints");
            return;
        }
        for endpoint in self.endpoints.iter() {
            match endpoint.socket.send_to(packet, endpoint.peer).await {
                Ok(_) => self.counters.udp_tx += 1,
                Err(err) => debug!(peer = %endpoint.peer, error = %err, "path send failed"),
            }
        }
    }

    /// Receive one datagram from a ready socket and hand it up through
    /// learning and dedup.
    async fn pump_socket(&mut self, slot: usize, buf: &mut [u8; MTU]) -> Result<()> {
        let socket = self
            .registry
            .get(slot)
            .ok_or_else(|| anyhow!("ready slot {slot} has no registered socket"))?
            .clone();

        let (n, src) = match socket.try_recv_from(buf) {
            Ok(received) => received,
            // Readiness can be spurious; the next wakeup retries.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err).context("udp recv failed"),
        };
        if n == 0 {
            bail!("zero-length datagram from {src} (malformed socket state)");
        }
        self.counters.udp_rx += 1;

        // Normalize: equality below is a pure byte compare over the full
        // slot, so the tail past the payload must not carry stale bytes.
        buf[n..].fill(0);

        // Learn from every datagram on the shared socket, duplicates
        // included: the first packet on a second path usually is one.
        if Some(slot) == self.server_slot {
            self.learn(src, &socket);
        }

        if self.dedup.contains(&buf[..]) {
            self.counters.dup_drop += 1;
            debug!(peer = %src, len = n, "duplicate suppressed");
            return Ok(());
        }

        self.tun
            .write_packet(&buf[..n])
            .await
            .context("tun write failed")?;
        self.counters.tun_wr += 1;
        self.dedup.remember(&buf[..]);
        Ok(())
    }

    /// Install a newly observed peer, reusing the shared socket. Past the
    /// descriptor budget the peer is ignored; its packets still reach the
    /// TUN.
    fn learn(&mut self, src: SocketAddr, socket: &Arc<UdpSocket>) {
        if self.endpoints.len() + 1 >= MAX_SOCKS {
            return;
        }
        if self
            .endpoints
            .insert_or_ignore(Endpoint::new(src, socket.clone()))
        {
            info!(peer = %src, "learned endpoint");
        }
    }
}

/// Block until any registered socket reports readable, returning its slot.
async fn next_readable(sockets: &[Arc<UdpSocket>]) -> (usize, io::Result<()>) {
    debug_assert!(!sockets.is_empty());
    let waits = sockets.iter().map(|s| Box::pin(s.readable()));
    let (result, slot, _) = select_all(waits).await;
    (slot, result)
}
