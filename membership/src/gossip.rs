//! Heartbeat dissemination over UDP.
//!
//! Every round a node sends the digests of everything it knows to one
//! random live peer and, while some seed is not yet a known peer, to one
//! such seed.  The receiver answers with the full state of every node it
//! is ahead on and a `REPLY` listing the digests it is behind on; the
//! original sender then ships those states too.  Nodes the sender has not
//! heard of reach it when the receiver gossips in turn.  Gossip never
//! carries payloads, only liveness.

use {
    crate::{
        config::MembershipConfig,
        error::{MembershipError, Result},
        gossip_protocol::{self, GossipMessage, MessageType, Packet},
        heartbeat::{Digest, Heartbeat, HeartbeatState},
        identity::Identity,
        node_id_set::NodeIdSet,
        stats::GossipStats,
        wire::WireSecurity,
        worker_pool::WorkerPool,
    },
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info, trace, warn},
    parking_lot::{Mutex, RwLock},
    rand::seq::IndexedRandom,
    std::{
        io,
        net::{SocketAddr, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Receive buffer; larger than any datagram we send.
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of offering a heartbeat to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    /// Not newer than the held state, or from another cluster.
    Stale,
    /// First heartbeat of this node.
    New,
    /// Later time, same incarnation.
    Newer,
    /// The node restarted: the epoch went up.
    Reincarnated,
}

/// Latest heartbeat of every live node, the local one included.
pub struct HeartbeatStore {
    magic: i32,
    states: DashMap<u16, HeartbeatState>,
}

impl HeartbeatStore {
    pub fn new(magic: i32) -> Self {
        Self {
            magic,
            states: DashMap::new(),
        }
    }

    pub fn update(&self, heartbeat: &Heartbeat) -> StoreUpdate {
        if heartbeat.sender.magic() != self.magic {
            return StoreUpdate::Stale;
        }
        match self.states.entry(heartbeat.sender.id()) {
            Entry::Vacant(slot) => {
                slot.insert(HeartbeatState::new(heartbeat.clone()));
                StoreUpdate::New
            }
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                let reincarnated = heartbeat
                    .sender
                    .compare_epoch(&state.heartbeat().sender)
                    .is_gt();
                if !state.update(heartbeat) {
                    StoreUpdate::Stale
                } else if reincarnated {
                    StoreUpdate::Reincarnated
                } else {
                    StoreUpdate::Newer
                }
            }
        }
    }

    pub fn get(&self, id: u16) -> Option<Heartbeat> {
        self.states.get(&id).map(|state| state.heartbeat().clone())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.states.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.states
            .iter()
            .map(|state| state.heartbeat().clone())
            .collect()
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.states
            .iter()
            .map(|state| state.heartbeat().digest())
            .collect()
    }

    pub fn members(&self) -> NodeIdSet {
        self.states.iter().map(|state| *state.key()).collect()
    }

    /// The node gossiping from `addr`, if known.
    pub fn id_for_gossip_addr(&self, addr: SocketAddr) -> Option<u16> {
        self.states
            .iter()
            .find(|state| state.heartbeat().gossip_addr == addr)
            .map(|state| *state.key())
    }

    /// Drop every node except `keep` silent for longer than `period` and
    /// return who was dropped.
    pub fn expire(&self, period: Duration, now: Instant, keep: u16) -> Vec<Identity> {
        let mut expired = Vec::new();
        self.states.retain(|id, state| {
            if *id == keep || !state.is_expired(period, now) {
                return true;
            }
            expired.push(state.heartbeat().sender);
            false
        });
        expired
    }
}

/// Receiver of the state gossip learns.
pub trait GossipListener: Send + Sync {
    /// A heartbeat arrived; returns whether it was news.
    fn heartbeat_received(&self, heartbeat: Heartbeat) -> bool;

    /// `peer` asks for a message link to be opened to it.
    fn connect_to(&self, peer: Identity);
}

struct GossipInner {
    me: Identity,
    socket: UdpSocket,
    local_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    store: Arc<HeartbeatStore>,
    listener: Arc<dyn GossipListener>,
    security: Arc<dyn WireSecurity>,
    ignoring: RwLock<NodeIdSet>,
    workers: WorkerPool,
    running: AtomicBool,
    stats: GossipStats,
}

pub struct GossipService {
    inner: Arc<GossipInner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl GossipService {
    /// Bind the gossip socket and start receiving.
    pub fn start(
        config: &MembershipConfig,
        me: Identity,
        store: Arc<HeartbeatStore>,
        listener: Arc<dyn GossipListener>,
        security: Arc<dyn WireSecurity>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.gossip_addr)?;
        socket.set_read_timeout(Some(config.gossip_receive_timeout))?;
        let local_addr = socket.local_addr()?;
        let inner = Arc::new(GossipInner {
            me,
            socket,
            local_addr,
            seeds: config.seeds.clone(),
            store,
            listener,
            security,
            ignoring: RwLock::new(NodeIdSet::new()),
            workers: WorkerPool::new("mbrGossip", config.gossip_threads.max(1)),
            running: AtomicBool::new(true),
            stats: GossipStats::default(),
        });

        let receiver = {
            let inner = inner.clone();
            Builder::new()
                .name("mbrGossipRecv".to_string())
                .spawn(move || receive_loop(inner))?
        };
        info!("{me} gossiping on {local_addr}");
        Ok(Self {
            inner,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn stats(&self) -> &GossipStats {
        &self.inner.stats
    }

    /// One gossip round.
    pub fn round(&self) {
        let inner = &self.inner;
        inner.stats.rounds.inc();
        let me = inner.me.id();
        let peers: Vec<Heartbeat> = inner
            .store
            .heartbeats()
            .into_iter()
            .filter(|hb| hb.sender.id() != me && !inner.is_ignoring(hb.sender.id()))
            .collect();
        let unknown_seeds: Vec<SocketAddr> = inner
            .seeds
            .iter()
            .copied()
            .filter(|seed| *seed != inner.local_addr && !peers.iter().any(|hb| hb.gossip_addr == *seed))
            .collect();

        let mut rng = rand::rng();
        let targets = [
            peers.choose(&mut rng).map(|hb| hb.gossip_addr),
            unknown_seeds.choose(&mut rng).copied(),
        ];
        let digests = inner.store.digests();
        for target in targets.into_iter().flatten() {
            trace!("{} gossiping {} digests to {target}", inner.me, digests.len());
            for datagram in gossip_protocol::encode_digests(inner.me.magic(), MessageType::Gossip, &digests) {
                inner.send(target, &datagram);
            }
        }
    }

    /// Ask `peer` to open a message link to us.
    pub fn send_connect_to(&self, peer: &Heartbeat) {
        let inner = &self.inner;
        inner.stats.connect_requests.inc();
        let datagram = gossip_protocol::encode_connect_to(inner.me.magic(), &inner.me);
        inner.send(peer.gossip_addr, &datagram);
    }

    /// Drop all gossip to and from `id` until [`Self::unignore`].
    pub fn ignore(&self, id: u16) {
        self.inner.ignoring.write().add(id);
    }

    pub fn unignore(&self, id: u16) {
        self.inner.ignoring.write().remove(id);
    }

    pub fn is_ignoring(&self, id: u16) -> bool {
        self.inner.is_ignoring(id)
    }

    /// Stop the receive thread and the decode workers.  Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(receiver) = self.receiver.lock().take() {
            if receiver.join().is_err() {
                warn!("{} gossip receiver panicked", self.inner.me);
            }
        }
        self.inner.workers.shutdown();
        self.inner.stats.report("membership-gossip");
    }
}

impl Drop for GossipService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(inner: Arc<GossipInner>) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    while inner.running.load(Ordering::Acquire) {
        let (len, from) = match inner.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{} gossip receive failed: {e}", inner.me);
                continue;
            }
        };
        inner.stats.packets_received.inc();
        if inner.is_ignoring_addr(from) {
            inner.stats.packets_ignored.inc();
            continue;
        }
        let datagram = buf[..len].to_vec();
        let worker = inner.clone();
        if !inner.workers.execute(move || worker.handle(from, &datagram)) {
            break;
        }
    }
    debug!("{} gossip receiver stopped", inner.me);
}

impl GossipInner {
    fn is_ignoring(&self, id: u16) -> bool {
        self.ignoring.read().contains(id)
    }

    fn is_ignoring_addr(&self, addr: SocketAddr) -> bool {
        let ignoring = self.ignoring.read();
        !ignoring.is_empty()
            && self
                .store
                .id_for_gossip_addr(addr)
                .is_some_and(|id| ignoring.contains(id))
    }

    fn send(&self, to: SocketAddr, datagram: &[u8]) {
        if self.is_ignoring_addr(to) {
            self.stats.packets_ignored.inc();
            return;
        }
        match self.socket.send_to(datagram, to) {
            Ok(_) => self.stats.packets_sent.inc(),
            Err(e) => debug!("{} gossip to {to} failed: {e}", self.me),
        }
    }

    fn send_update(&self, to: SocketAddr, heartbeat: &Heartbeat) {
        match gossip_protocol::encode_update(self.me.magic(), heartbeat, self.security.as_ref()) {
            Ok(datagram) => self.send(to, &datagram),
            Err(e) => warn!("{} cannot encode heartbeat of {}: {e}", self.me, heartbeat.sender),
        }
    }

    fn handle(&self, from: SocketAddr, datagram: &[u8]) {
        let Packet { message, malformed } =
            match gossip_protocol::decode(self.me.magic(), datagram, self.security.as_ref()) {
                Ok(packet) => packet,
                Err(MembershipError::BadMagic { found, .. }) => {
                    self.stats.packets_foreign.inc();
                    trace!("{} dropping datagram from {from} with magic {found}", self.me);
                    return;
                }
                Err(e) => {
                    self.stats.malformed_records.inc();
                    debug!("{} dropping datagram from {from}: {e}", self.me);
                    return;
                }
            };
        self.stats
            .malformed_records
            .add(u64::try_from(malformed).unwrap_or(u64::MAX));

        match message {
            GossipMessage::Gossip(digests) => self.on_gossip(from, &digests),
            GossipMessage::Reply(digests) => self.on_reply(from, &digests),
            GossipMessage::Update(heartbeat) => {
                if self.is_ignoring(heartbeat.sender.id()) {
                    self.stats.packets_ignored.inc();
                } else if self.listener.heartbeat_received(heartbeat) {
                    self.stats.updates_applied.inc();
                }
            }
            GossipMessage::ConnectTo(peer) => {
                if self.is_ignoring(peer.id()) {
                    self.stats.packets_ignored.inc();
                } else {
                    self.listener.connect_to(peer);
                }
            }
        }
    }

    /// Digests of one datagram; a long list spans several, so nothing here
    /// may assume the sender mentioned everything it knows.
    fn on_gossip(&self, from: SocketAddr, digests: &[Digest]) {
        let mut behind = Vec::new();
        for digest in digests {
            match self.store.get(digest.identity.id()) {
                None => behind.push(Digest::request(digest.identity)),
                Some(mine) if mine.version() > digest.version() => self.send_update(from, &mine),
                Some(mine) if mine.version() < digest.version() => behind.push(mine.digest()),
                Some(_) => {}
            }
        }
        // a sender we cannot place learns us, and so gains a peer to gossip with
        if self.store.id_for_gossip_addr(from).is_none() {
            if let Some(mine) = self.store.get(self.me.id()) {
                self.send_update(from, &mine);
            }
        }
        if !behind.is_empty() {
            for datagram in gossip_protocol::encode_digests(self.me.magic(), MessageType::Reply, &behind) {
                self.send(from, &datagram);
            }
        }
    }

    fn on_reply(&self, from: SocketAddr, digests: &[Digest]) {
        for digest in digests {
            if let Some(mine) = self.store.get(digest.identity.id()) {
                if mine.version() > digest.version() {
                    self.send_update(from, &mine);
                }
            }
        }
    }
}
