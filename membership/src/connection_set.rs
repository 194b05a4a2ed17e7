//! Every peer the local node knows about, and how it talks to each.
//!
//! A peer starts as a [`HeartbeatConnection`] when its first heartbeat is
//! seen.  It is upgraded to a [`MessageConnection`] as soon as either end
//! wants an ordered link, whether because the application sent it a
//! payload, called `want_link`, or because the peer's heartbeat lists us
//! in its link set.  The lower node id opens the socket; the higher one
//! asks for it with a `CONNECT_TO` gossip request.
//!
//! Map entries are only ever swapped by compare-and-replace against the
//! connection object the caller saw, so two threads racing to upgrade or
//! downgrade the same peer cannot both win.
//!
//! Accepted sockets start with a handshake sink.  Their first frame must
//! carry a heartbeat; it decides which message connection adopts the
//! socket:
//!
//! * a `Pending` connection to that peer takes it as is,
//! * a heartbeat-only peer is upgraded and the new connection takes it,
//! * an established connection keeps its socket and the newcomer is
//!   closed, unless the newcomer comes from a later incarnation, which
//!   replaces it,
//! * a peer we have no record of at all is a protocol violation.

use {
    crate::{
        config::MembershipConfig,
        connection::{
            Connection, ConnectionHost, ConnectionState, HeartbeatConnection, MessageConnection,
            SelfConnection,
        },
        error::{MembershipError, Result},
        framing::FrameFormat,
        gossip::{GossipListener, HeartbeatStore, StoreUpdate},
        heartbeat::Heartbeat,
        identity::Identity,
        io_connection::{FrameSink, FramedConnection, IoConnection},
        node_id_set::NodeIdSet,
        reactor::{ChannelHandler, HandlerFactory, ReactorHandle, Token},
        view::View,
        wire::{LinkMessage, WireSecurity},
    },
    crossbeam_channel::Sender,
    dashmap::{DashMap, DashSet},
    log::{debug, info, trace, warn},
    parking_lot::{Mutex, RwLock},
    std::{
        collections::VecDeque,
        io,
        net::{Ipv4Addr, SocketAddr, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Weak,
        },
        time::{Duration, Instant},
    },
};

/// Dispatch lane for payloads a node sends to itself.
const SELF_LANE: u64 = u64::MAX;

/// Application-facing callbacks.
pub trait MembershipListener: Send + Sync {
    /// A payload from `from`.  Payloads from one sender arrive in the
    /// order they were sent.
    fn deliver(&self, from: Identity, payload: Vec<u8>);

    /// Membership changed or settled.
    fn view_changed(&self, _view: &View) {}

    /// The message link to `peer` closed or failed.
    fn link_closed(&self, _peer: Identity) {}
}

/// Timing and framing of message links.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub frame_format: FrameFormat,
    pub max_frame_size: usize,
    pub close_timeout: Duration,
    pub expire_period: Duration,
    pub stability_period: Duration,
}

impl From<&MembershipConfig> for LinkSettings {
    fn from(config: &MembershipConfig) -> Self {
        Self {
            frame_format: config.frame_format,
            max_frame_size: config.max_frame_size,
            close_timeout: config.close_timeout,
            expire_period: config.expire_period,
            stability_period: config.stability_period,
        }
    }
}

struct ViewTracker {
    view: View,
    changed_at: Instant,
}

pub struct ConnectionSet {
    me: Identity,
    weak_self: Weak<ConnectionSet>,
    settings: LinkSettings,
    reactor: ReactorHandle,
    store: Arc<HeartbeatStore>,
    security: Arc<dyn WireSecurity>,
    listener: Arc<dyn MembershipListener>,
    handshake: Arc<Handshake>,
    connections: DashMap<Identity, Connection>,
    /// Peers with an outbound connect in flight.
    connecting: DashSet<Identity>,
    wanted: RwLock<NodeIdSet>,
    local: Mutex<Heartbeat>,
    view: Mutex<ViewTracker>,
    connect_requests: Sender<Identity>,
    running: AtomicBool,
}

impl ConnectionSet {
    /// `connect_requests` receives every peer that should be sent a
    /// `CONNECT_TO` on our behalf.
    pub fn new(
        me: Identity,
        settings: LinkSettings,
        reactor: ReactorHandle,
        store: Arc<HeartbeatStore>,
        security: Arc<dyn WireSecurity>,
        listener: Arc<dyn MembershipListener>,
        connect_requests: Sender<Identity>,
    ) -> Arc<Self> {
        let unbound = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Arc::new_cyclic(|weak_self: &Weak<ConnectionSet>| {
            let host: Weak<dyn ConnectionHost> = weak_self.clone();
            let connections = DashMap::new();
            connections.insert(me, Connection::Myself(SelfConnection::new(me, host)));
            Self {
                me,
                weak_self: weak_self.clone(),
                settings,
                reactor,
                store,
                security,
                listener,
                handshake: Arc::new(Handshake {
                    set: weak_self.clone(),
                }),
                connections,
                connecting: DashSet::new(),
                wanted: RwLock::new(NodeIdSet::new()),
                local: Mutex::new(Heartbeat::new(me, unbound, unbound)),
                view: Mutex::new(ViewTracker {
                    view: View::default(),
                    changed_at: Instant::now(),
                }),
                connect_requests,
                running: AtomicBool::new(true),
            }
        })
    }

    pub fn me(&self) -> Identity {
        self.me
    }

    /// Addresses advertised in the local heartbeat.
    pub fn set_local_addresses(&self, gossip_addr: SocketAddr, connection_addr: SocketAddr) {
        let mut local = self.local.lock();
        local.gossip_addr = gossip_addr;
        local.connection_addr = connection_addr;
    }

    pub fn view(&self) -> View {
        self.view.lock().view.clone()
    }

    /// State of the message link to node `id`; `None` when there is none.
    pub fn link_state(&self, id: u16) -> Option<ConnectionState> {
        let peer = Identity::new(self.me.magic(), id, 0).ok()?;
        match self.connection(&peer)? {
            Connection::Message(connection) => Some(connection.state()),
            Connection::Myself(_) | Connection::Heartbeat(_) => None,
        }
    }

    /// Send `payload` to `to` over an ordered link, opening one if needed.
    /// Payloads to ourselves are delivered through the dispatch pool.
    pub fn send(&self, to: &Identity, payload: Vec<u8>) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(MembershipError::ConnectionClosed);
        }
        loop {
            let Some(existing) = self.connection(to) else {
                return Err(MembershipError::UnknownPeer(*to));
            };
            match &existing {
                Connection::Myself(myself) => {
                    let myself = myself.clone();
                    if !self.reactor.dispatch(SELF_LANE, move || myself.send(payload)) {
                        return Err(MembershipError::ReactorShutdown);
                    }
                    return Ok(());
                }
                Connection::Message(connection) if connection.state() != ConnectionState::Closed => {
                    return connection.send_payload(payload);
                }
                Connection::Message(_) | Connection::Heartbeat(_) => {
                    // whoever wins the upgrade, the next pass finds a
                    // pending connection and queues on it
                    self.upgrade(&existing, VecDeque::new());
                }
            }
        }
    }

    /// Ask for an ordered link to `id` and keep it open.
    pub fn want_link(&self, id: u16) {
        if self.wanted.write().add(id) {
            debug!("{}: wants link to {id}", self.me);
        }
        self.ensure_links();
    }

    /// Withdraw interest in a link to `id`.  The link is closed on a later
    /// tick unless the peer still wants it.
    pub fn unwant_link(&self, id: u16) {
        if self.wanted.write().remove(id) {
            debug!("{}: no longer wants link to {id}", self.me);
        }
    }

    /// Timer work: advance and publish the local heartbeat, run close
    /// negotiation and open wanted links.  Returns the new local heartbeat.
    pub fn tick(&self) -> Heartbeat {
        let heartbeat = self.next_heartbeat();
        self.store.update(&heartbeat);
        for connection in self.message_connections() {
            connection.send_heartbeat(&heartbeat);
            connection.check_close(self.settings.close_timeout);
        }
        self.ensure_links();
        heartbeat
    }

    /// Evict nodes silent for longer than the expire period and refresh
    /// the view.  Returns the evicted nodes.
    pub fn check_nodes(&self, now: Instant) -> Vec<Identity> {
        let expired = self
            .store
            .expire(self.settings.expire_period, now, self.me.id());
        for peer in &expired {
            info!("{}: {peer} expired", self.me);
            self.connecting.remove(peer);
            if let Some((_, Connection::Message(connection))) = self.connections.remove(peer) {
                connection.terminate();
                self.listener.link_closed(*peer);
            }
        }
        self.update_view();
        expired
    }

    /// Drop every link.  Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for connection in self.message_connections() {
            connection.terminate();
        }
        self.connections
            .retain(|_, connection| matches!(connection, Connection::Myself(_)));
        debug!("{}: connection set shut down", self.me);
    }

    fn connection(&self, peer: &Identity) -> Option<Connection> {
        self.connections
            .get(peer)
            .map(|entry| entry.value().clone())
    }

    fn message_connections(&self) -> Vec<Arc<MessageConnection>> {
        self.connections
            .iter()
            .filter_map(|entry| entry.value().as_message().cloned())
            .collect()
    }

    /// Swap the entry for `peer` to `replacement` if it still holds
    /// `expected`.
    fn replace(&self, peer: &Identity, expected: &Connection, replacement: Connection) -> bool {
        match self.connections.get_mut(peer) {
            Some(mut entry) if entry.value().same(expected) => {
                *entry.value_mut() = replacement;
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, connection: &Arc<MessageConnection>) -> bool {
        self.connections
            .get(&connection.peer())
            .is_some_and(|entry| {
                entry
                    .value()
                    .as_message()
                    .is_some_and(|current| Arc::ptr_eq(current, connection))
            })
    }

    fn host(&self) -> Weak<dyn ConnectionHost> {
        self.weak_self.clone()
    }

    /// Latest known incarnation of `peer`.
    fn current_identity(&self, peer: &Identity) -> Identity {
        self.store
            .get(peer.id())
            .map(|heartbeat| heartbeat.sender)
            .unwrap_or(*peer)
    }

    /// Replace `existing` with a pending message connection holding
    /// `queue`; returns it when this call won the swap.
    fn claim(&self, existing: &Connection, queue: VecDeque<Vec<u8>>) -> Option<Arc<MessageConnection>> {
        let peer = self.current_identity(&existing.peer());
        let connection =
            MessageConnection::with_queue(self.me, peer, self.host(), self.security.clone(), queue);
        self.replace(&peer, existing, Connection::Message(connection.clone()))
            .then_some(connection)
    }

    /// [`Self::claim`] and start opening the link.
    fn upgrade(&self, existing: &Connection, queue: VecDeque<Vec<u8>>) {
        if let Some(connection) = self.claim(existing, queue) {
            trace!("{}: upgraded {} to a message link", self.me, connection.peer());
            self.open_link(&connection);
        }
    }

    /// Connect if we are the initiator, otherwise ask the peer to.
    fn open_link(&self, connection: &Arc<MessageConnection>) {
        let peer = connection.peer();
        let Some(heartbeat) = self.store.get(peer.id()) else {
            return;
        };
        if !connection.is_initiator() {
            trace!("{}: asking {peer} to connect", self.me);
            if self.connect_requests.send(peer).is_err() {
                debug!("{}: connect request to {peer} dropped", self.me);
            }
            return;
        }
        if !self.connecting.insert(peer) {
            return;
        }
        let set = self.weak_self.clone();
        let target = connection.clone();
        let started = self
            .reactor
            .connect(heartbeat.connection_addr, move |result| {
                if let Some(set) = set.upgrade() {
                    set.link_connected(&target, result);
                }
            });
        if let Err(e) = started {
            self.connecting.remove(&peer);
            debug!("{}: cannot connect to {peer}: {e}", self.me);
        }
    }

    fn link_connected(&self, connection: &Arc<MessageConnection>, result: io::Result<TcpStream>) {
        let peer = connection.peer();
        self.connecting.remove(&peer);
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                // the link stays pending and the next tick retries
                debug!("{}: connect to {peer} failed: {e}", self.me);
                return;
            }
        };
        if !self.is_current(connection) || connection.state() != ConnectionState::Pending {
            trace!("{}: dropping surplus socket to {peer}", self.me);
            return;
        }
        let io = FramedConnection::new(
            stream,
            self.reactor.next_token(),
            &self.reactor,
            self.settings.frame_format,
            self.settings.max_frame_size,
            connection.clone(),
        );
        io.register();
        if !connection.assign_impl(io.clone()) {
            io.silence();
            io.shutdown();
            return;
        }
        if let Err(e) = io.start_reading() {
            debug!("{}: link to {peer} lost at start: {e}", self.me);
        }
    }

    /// Upgrade peers whose link is wanted: by us on either side of the
    /// id order, by them only when we are the initiator.
    fn ensure_links(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let wanted = self.wanted.read().clone();
        for heartbeat in self.store.heartbeats() {
            let peer = heartbeat.sender;
            if peer.id() == self.me.id() {
                continue;
            }
            let initiator = self.me.id() < peer.id();
            if !wanted.contains(peer.id()) && !(initiator && heartbeat.wants_link_to(self.me.id())) {
                continue;
            }
            match self.connection(&peer) {
                Some(existing @ Connection::Heartbeat(_)) => self.upgrade(&existing, VecDeque::new()),
                Some(Connection::Message(connection)) => match connection.state() {
                    ConnectionState::Pending => self.open_link(&connection),
                    ConnectionState::Closed => {
                        self.upgrade(&Connection::Message(connection), VecDeque::new())
                    }
                    ConnectionState::Established | ConnectionState::Closing => {}
                },
                Some(Connection::Myself(_)) | None => {}
            }
        }
    }

    fn next_heartbeat(&self) -> Heartbeat {
        let view = self.view();
        let wanted = self.wanted.read().clone();
        let mut local = self.local.lock();
        local.time = local.time.saturating_add(1);
        local.view = view;
        local.msg_links = wanted;
        local.clone()
    }

    /// Record a heartbeat from any source.  Returns whether it was news.
    fn accept_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        let peer = heartbeat.sender;
        if peer.id() == self.me.id() {
            return false;
        }
        match self.store.update(&heartbeat) {
            StoreUpdate::Stale => false,
            StoreUpdate::Newer => true,
            StoreUpdate::New => {
                self.connections
                    .entry(peer)
                    .or_insert_with(|| Connection::Heartbeat(HeartbeatConnection::new(peer)));
                debug!("{}: discovered {peer}", self.me);
                self.update_view();
                true
            }
            StoreUpdate::Reincarnated => {
                if let Some(existing @ Connection::Message(_)) = self.connection(&peer) {
                    let downgrade = Connection::Heartbeat(HeartbeatConnection::new(peer));
                    if self.replace(&peer, &existing, downgrade) {
                        info!("{}: {peer} restarted, dropping its link", self.me);
                        if let Some(old) = existing.as_message() {
                            old.terminate();
                        }
                        self.listener.link_closed(peer);
                    }
                }
                true
            }
        }
    }

    fn update_view(&self) {
        let members = self.store.members();
        let now = Instant::now();
        let changed = {
            let mut tracker = self.view.lock();
            if tracker.view.members() != &members {
                tracker.view = View::new(members, false);
                tracker.changed_at = now;
                Some(tracker.view.clone())
            } else if !tracker.view.is_stable()
                && now.saturating_duration_since(tracker.changed_at) >= self.settings.stability_period
            {
                tracker.view.set_stable(true);
                Some(tracker.view.clone())
            } else {
                None
            }
        };
        if let Some(view) = changed {
            debug!(
                "{}: view {:?} stable={}",
                self.me,
                view.members(),
                view.is_stable()
            );
            self.listener.view_changed(&view);
        }
    }

    /// First frame on an accepted socket.
    fn handshake(&self, io: &Arc<FramedConnection>, payload: Vec<u8>) -> Result<()> {
        let message = LinkMessage::decode(payload, self.security.as_ref())?;
        let Some(heartbeat) = message.heartbeat().cloned() else {
            return Err(MembershipError::Handshake(format!(
                "{io} opened with a {} message",
                message.kind()
            )));
        };
        let peer = heartbeat.sender;
        if peer.magic() != self.me.magic() || peer.id() == self.me.id() {
            return Err(MembershipError::Handshake(format!(
                "{io} introduced itself as {peer}"
            )));
        }
        if !self.connections.contains_key(&peer) {
            return Err(MembershipError::Handshake(format!(
                "{io} from unknown node {peer}"
            )));
        }
        self.accept_heartbeat(heartbeat);

        let Some(existing) = self.connection(&peer) else {
            return Err(MembershipError::Handshake(format!(
                "{peer} expired during handshake on {io}"
            )));
        };
        let adopter = match &existing {
            Connection::Message(current) => match current.state() {
                ConnectionState::Pending => Some(current.clone()),
                ConnectionState::Closed => self.claim(&existing, VecDeque::new()),
                ConnectionState::Established | ConnectionState::Closing
                    if peer.compare_epoch(&current.peer()).is_gt() =>
                {
                    let replacement = self.claim(&existing, VecDeque::new());
                    if replacement.is_some() {
                        current.terminate();
                    }
                    replacement
                }
                ConnectionState::Established | ConnectionState::Closing => {
                    debug!("{}: {peer} already linked, closing {io}", self.me);
                    None
                }
            },
            Connection::Heartbeat(_) => self.claim(&existing, VecDeque::new()),
            Connection::Myself(_) => {
                return Err(MembershipError::Handshake(format!(
                    "{io} claims to be this node"
                )));
            }
        };

        match adopter {
            Some(connection) => {
                io.set_sink(connection.clone());
                if !connection.assign_impl(io.clone()) {
                    debug!("{}: {peer} linked meanwhile, closing {io}", self.me);
                    io.silence();
                    io.shutdown();
                }
            }
            None => {
                io.silence();
                io.shutdown();
            }
        }
        Ok(())
    }
}

impl ConnectionHost for ConnectionSet {
    fn local_heartbeat(&self) -> Heartbeat {
        self.local.lock().clone()
    }

    fn link_wanted(&self, peer: &Identity) -> bool {
        self.wanted.read().contains(peer.id())
            || self
                .store
                .get(peer.id())
                .is_some_and(|heartbeat| heartbeat.wants_link_to(self.me.id()))
    }

    fn heartbeat_received(&self, heartbeat: Heartbeat) {
        self.accept_heartbeat(heartbeat);
    }

    fn deliver(&self, from: Identity, payload: Vec<u8>) {
        self.listener.deliver(from, payload);
    }

    fn connection_failed(&self, connection: &Arc<MessageConnection>) {
        let peer = connection.peer();
        let expected = Connection::Message(connection.clone());
        let replaced = if self.store.contains(peer.id()) {
            self.replace(
                &peer,
                &expected,
                Connection::Heartbeat(HeartbeatConnection::new(peer)),
            )
        } else {
            self.connections
                .remove_if(&peer, |_, current| current.same(&expected))
                .is_some()
        };
        if replaced {
            debug!("{}: link to {peer} failed", self.me);
            self.listener.link_closed(peer);
        }
    }

    fn close_completed(
        &self,
        connection: &Arc<MessageConnection>,
        reopen: bool,
        queued: VecDeque<Vec<u8>>,
    ) {
        let peer = connection.peer();
        let expected = Connection::Message(connection.clone());
        if reopen && self.running.load(Ordering::Acquire) {
            debug!("{}: reopening link to {peer}", self.me);
            self.upgrade(&expected, queued);
            return;
        }
        if !queued.is_empty() {
            warn!("{}: dropping {} payloads for {peer}", self.me, queued.len());
        }
        let downgrade = Connection::Heartbeat(HeartbeatConnection::new(peer));
        if self.replace(&peer, &expected, downgrade) {
            debug!("{}: link to {peer} closed", self.me);
            self.listener.link_closed(peer);
        }
    }
}

impl GossipListener for ConnectionSet {
    fn heartbeat_received(&self, heartbeat: Heartbeat) -> bool {
        self.accept_heartbeat(heartbeat)
    }

    fn connect_to(&self, peer: Identity) {
        if self.me.id() > peer.id() {
            debug!("{}: ignoring connect request from lower id {peer}", self.me);
            return;
        }
        match self.connection(&peer) {
            Some(existing @ Connection::Heartbeat(_)) => self.upgrade(&existing, VecDeque::new()),
            Some(Connection::Message(connection)) => match connection.state() {
                ConnectionState::Pending => self.open_link(&connection),
                ConnectionState::Closed => {
                    self.upgrade(&Connection::Message(connection), VecDeque::new())
                }
                ConnectionState::Established | ConnectionState::Closing => {}
            },
            Some(Connection::Myself(_)) => {}
            None => debug!("{}: connect request from unknown node {peer}", self.me),
        }
    }
}

impl HandlerFactory for ConnectionSet {
    fn create_handler(
        &self,
        stream: TcpStream,
        token: Token,
        reactor: &ReactorHandle,
    ) -> Arc<dyn ChannelHandler> {
        FramedConnection::new(
            stream,
            token,
            reactor,
            self.settings.frame_format,
            self.settings.max_frame_size,
            self.handshake.clone(),
        )
    }
}

/// Sink of an accepted socket until its first frame names the peer.
struct Handshake {
    set: Weak<ConnectionSet>,
}

impl FrameSink for Handshake {
    fn deliver(&self, connection: &Arc<FramedConnection>, payload: Vec<u8>) -> Result<()> {
        match self.set.upgrade() {
            Some(set) => set.handshake(connection, payload),
            None => Err(MembershipError::ConnectionClosed),
        }
    }

    fn closing(&self, token: Token) {
        trace!("socket {token} closed before its handshake");
    }
}
