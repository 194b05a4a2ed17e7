//! A running cluster member.
//!
//! [`MembershipService`] owns one reactor, one heartbeat store, the
//! connection set and the gossip service, plus a timer thread that drives
//! them once per heartbeat interval:
//!
//! 1. advance the local heartbeat and send it on every message link,
//! 2. run close negotiation and open the links that are wanted,
//! 3. expire silent nodes and refresh the view,
//! 4. run one gossip round and forward pending `CONNECT_TO` requests.

use {
    crate::{
        config::MembershipConfig,
        connection::ConnectionState,
        connection_set::{ConnectionSet, LinkSettings, MembershipListener},
        error::Result,
        gossip::{GossipService, HeartbeatStore},
        heartbeat::Heartbeat,
        identity::Identity,
        reactor::Reactor,
        view::View,
        wire::{NoSecurity, WireSecurity},
    },
    crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender},
    log::{info, warn},
    parking_lot::Mutex,
    std::{
        net::SocketAddr,
        sync::Arc,
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// How often the timer logs and resets the reactor and gossip counters.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub struct MembershipService {
    me: Identity,
    reactor: Reactor,
    store: Arc<HeartbeatStore>,
    connections: Arc<ConnectionSet>,
    gossip: Arc<GossipService>,
    gossip_addr: SocketAddr,
    connection_addr: SocketAddr,
    exit: Mutex<Option<Sender<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipService {
    /// Start a member without wire security.
    pub fn start(
        config: MembershipConfig,
        me: Identity,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<Self> {
        Self::start_with_security(config, me, listener, Arc::new(NoSecurity))
    }

    /// Bind both sockets, publish the first heartbeat and start the timer.
    /// Datagrams and links are tagged with `me`'s magic.
    pub fn start_with_security(
        config: MembershipConfig,
        me: Identity,
        listener: Arc<dyn MembershipListener>,
        security: Arc<dyn WireSecurity>,
    ) -> Result<Self> {
        if me.magic() != config.magic {
            warn!(
                "{me}: identity magic differs from configured magic {}",
                config.magic
            );
        }
        let reactor = Reactor::new("mbr", &config)?;
        let store = Arc::new(HeartbeatStore::new(me.magic()));
        let (connect_sender, connect_requests) = unbounded();
        let connections = ConnectionSet::new(
            me,
            LinkSettings::from(&config),
            reactor.handle().clone(),
            store.clone(),
            security.clone(),
            listener,
            connect_sender,
        );
        let bound = reactor.listen(config.connection_addr, connections.clone())?;
        let connection_addr = config.advertised(bound);
        let gossip = Arc::new(GossipService::start(
            &config,
            me,
            store.clone(),
            connections.clone(),
            security,
        )?);
        let gossip_addr = config.advertised(gossip.local_addr());
        connections.set_local_addresses(gossip_addr, connection_addr);
        connections.tick();

        let (exit_sender, exit_receiver) = bounded(1);
        let timer = {
            let connections = connections.clone();
            let gossip = gossip.clone();
            let store = store.clone();
            let reactor = reactor.handle().clone();
            let interval = config.heartbeat_interval;
            Builder::new()
                .name("mbrTimer".to_string())
                .spawn(move || {
                    let mut last_report = Instant::now();
                    loop {
                        connections.tick();
                        connections.check_nodes(Instant::now());
                        gossip.round();
                        for peer in connect_requests.try_iter() {
                            if let Some(heartbeat) = store.get(peer.id()) {
                                gossip.send_connect_to(&heartbeat);
                            }
                        }
                        if last_report.elapsed() >= STATS_REPORT_INTERVAL {
                            reactor.stats().report("membership");
                            gossip.stats().report("membership");
                            last_report = Instant::now();
                        }
                        if wait_for_exit(&exit_receiver, interval) {
                            break;
                        }
                    }
                })
                .expect("failed to spawn membership timer thread")
        };

        info!("{me} joined: gossip {gossip_addr}, links {connection_addr}");
        Ok(Self {
            me,
            reactor,
            store,
            connections,
            gossip,
            gossip_addr,
            connection_addr,
            exit: Mutex::new(Some(exit_sender)),
            timer: Mutex::new(Some(timer)),
        })
    }

    pub fn identity(&self) -> Identity {
        self.me
    }

    /// Advertised gossip address.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    /// Advertised address message links are accepted on.
    pub fn connection_addr(&self) -> SocketAddr {
        self.connection_addr
    }

    pub fn view(&self) -> View {
        self.connections.view()
    }

    /// Latest heartbeat known for node `id`, ourselves included.
    pub fn heartbeat(&self, id: u16) -> Option<Heartbeat> {
        self.store.get(id)
    }

    pub fn link_state(&self, id: u16) -> Option<ConnectionState> {
        self.connections.link_state(id)
    }

    /// Send `payload` to `to` over an ordered message link.
    pub fn send(&self, to: &Identity, payload: Vec<u8>) -> Result<()> {
        self.connections.send(to, payload)
    }

    pub fn want_link(&self, id: u16) {
        self.connections.want_link(id);
    }

    pub fn unwant_link(&self, id: u16) {
        self.connections.unwant_link(id);
    }

    /// Drop all gossip to and from node `id`, simulating a partition.
    pub fn ignore(&self, id: u16) {
        self.gossip.ignore(id);
    }

    pub fn unignore(&self, id: u16) {
        self.gossip.unignore(id);
    }

    /// Stop the timer, gossip and every link.  Idempotent.
    pub fn shutdown(&self) {
        let Some(exit) = self.exit.lock().take() else {
            return;
        };
        let _ = exit.send(());
        if let Some(timer) = self.timer.lock().take() {
            if timer.thread().id() != thread::current().id() && timer.join().is_err() {
                warn!("{} timer thread panicked", self.me);
            }
        }
        self.gossip.shutdown();
        self.connections.shutdown();
        self.reactor.shutdown();
        info!("{} left the cluster", self.me);
    }
}

impl Drop for MembershipService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep for `interval`; true once shutdown was requested.
fn wait_for_exit(exit: &Receiver<()>, interval: Duration) -> bool {
    !matches!(exit.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
}
