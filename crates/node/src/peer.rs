//! Per-peer state. Message writing happens through a bounded outbound queue
//! drained by the peer's write task; everything else is shared state the
//! read task and the registry both touch.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bloom::BloomFilter;
use crate::message::Message;

/// Outbound queue depth; senders wait once the writer falls this far behind.
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerState {
    Hand,
    HandShake,
    Established,
    Inactive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("peer disconnected")]
pub struct PeerGone;

pub struct Peer {
    id: u64,
    addr: SocketAddr,
    inbound: bool,
    persistent: bool,
    /// External peers take services from us but may not drive block sync.
    external: bool,
    state: Mutex<PeerState>,
    services: AtomicU64,
    version: AtomicU32,
    height: AtomicU32,
    version_known: AtomicBool,
    ver_ack_received: AtomicBool,
    relay: AtomicBool,
    disconnected: AtomicBool,
    filter: Mutex<Option<BloomFilter>>,
    stall_timer: Mutex<Option<Instant>>,
    outbound_queue: mpsc::Sender<Message>,
}

impl Peer {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        inbound: bool,
        persistent: bool,
        external: bool,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let peer = Self {
            id,
            addr,
            inbound,
            persistent,
            external,
            state: Mutex::new(PeerState::Hand),
            services: AtomicU64::new(0),
            version: AtomicU32::new(0),
            height: AtomicU32::new(0),
            version_known: AtomicBool::new(false),
            ver_ack_received: AtomicBool::new(false),
            relay: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            filter: Mutex::new(None),
            stall_timer: Mutex::new(None),
            outbound_queue: sender,
        };
        (peer, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("peer state lock poisoned")
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().expect("peer state lock poisoned") = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Established && !self.is_disconnected()
    }

    pub fn services(&self) -> u64 {
        self.services.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay.load(Ordering::Relaxed)
    }

    /// Records the remote version message; the handshake is complete once
    /// the verack lands as well.
    pub fn set_version_info(&self, version: u32, services: u64, height: u32, relay: bool) {
        self.version.store(version, Ordering::Relaxed);
        self.services.store(services, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.relay.store(relay, Ordering::Relaxed);
        self.version_known.store(true, Ordering::Relaxed);
    }

    pub fn version_known(&self) -> bool {
        self.version_known.load(Ordering::Relaxed)
    }

    pub fn set_ver_ack_received(&self) {
        self.ver_ack_received.store(true, Ordering::Relaxed);
    }

    pub fn ver_ack_received(&self) -> bool {
        self.ver_ack_received.load(Ordering::Relaxed)
    }

    pub fn load_filter(&self, filter: Option<BloomFilter>) {
        *self.filter.lock().expect("filter lock poisoned") = filter;
    }

    pub fn filter_loaded(&self) -> bool {
        self.filter.lock().expect("filter lock poisoned").is_some()
    }

    pub fn with_filter<R>(&self, f: impl FnOnce(Option<&mut BloomFilter>) -> R) -> R {
        let mut guard = self.filter.lock().expect("filter lock poisoned");
        f(guard.as_mut())
    }

    pub fn start_stall_timer(&self) {
        *self.stall_timer.lock().expect("stall timer lock poisoned") = Some(Instant::now());
    }

    pub fn update_stall_timer(&self) {
        let mut guard = self.stall_timer.lock().expect("stall timer lock poisoned");
        if guard.is_some() {
            *guard = Some(Instant::now());
        }
    }

    /// Queues a message for the write task. Blocks when the queue is full;
    /// fails once the peer is gone.
    pub async fn send_message(&self, message: Message) -> Result<(), PeerGone> {
        if self.is_disconnected() {
            return Err(PeerGone);
        }
        self.outbound_queue
            .send(message)
            .await
            .map_err(|_| PeerGone)
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
        self.set_state(PeerState::Inactive);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    /// Group key for outbound diversity accounting: /16 for IPv4, /32 for
    /// IPv6.
    pub fn group_key(&self) -> String {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                format!("{}.{}", octets[0], octets[1])
            }
            IpAddr::V6(ip) => {
                let segments = ip.segments();
                format!("{:x}:{:x}", segments[0], segments[1])
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;

    /// An established outbound peer with a captured outbound queue.
    pub fn established_peer(id: u64, height: u32) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(10, 0, (id >> 8) as u8, id as u8),
            20866,
        ));
        let (peer, receiver) = Peer::new(id, addr, false, false, false);
        peer.set_version_info(0, 0, height, true);
        peer.set_ver_ack_received();
        peer.set_state(PeerState::Established);
        (Arc::new(peer), receiver)
    }

    pub fn drain(receiver: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            out.push(message);
        }
        out
    }
}
