//! Per-peer connections and the message-link state machine.
//!
//! ```text
//!            assign_impl                  check_close (initiator)
//!  Pending ─────────────► Established ──────────────────────────► Closing
//!     │                      │  │                                    │
//!     │ terminate            │  │ Close received (responder)         │ echo / timeout
//!     ▼                      ▼  ▼                                    ▼
//!   Closed ◄──────────── closing / terminate ◄──────────────────── Closed
//! ```
//!
//! A [`MessageConnection`] queues payloads while `Pending`, forwards them
//! while `Established` and drops them once `Closed`.  While `Closing` the
//! initiator has sent a `Close` and silenced its socket but keeps the
//! socket to recognise the echo; payloads sent meanwhile are queued and
//! handed back to the host when the close completes.

use {
    crate::{
        error::{MembershipError, Result},
        heartbeat::Heartbeat,
        identity::Identity,
        io_connection::{FrameSink, FramedConnection, IoConnection},
        reactor::Token,
        wire::{LinkMessage, WireSecurity},
    },
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        fmt,
        mem,
        sync::{Arc, Weak},
        time::{Duration, Instant},
    },
};

/// Owner of message connections, normally the connection set.
pub trait ConnectionHost: Send + Sync {
    fn local_heartbeat(&self) -> Heartbeat;

    /// Whether either end currently wants a message link with `peer`.
    fn link_wanted(&self, peer: &Identity) -> bool;

    fn heartbeat_received(&self, heartbeat: Heartbeat);

    fn deliver(&self, from: Identity, payload: Vec<u8>);

    /// The link broke; `connection` is now `Closed`.
    fn connection_failed(&self, connection: &Arc<MessageConnection>);

    /// Close negotiation finished and `connection` is `Closed`.  `reopen`
    /// asks for a fresh link carrying `queued`.
    fn close_completed(
        &self,
        connection: &Arc<MessageConnection>,
        reopen: bool,
        queued: VecDeque<Vec<u8>>,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Established,
    Closing,
    Closed,
}

enum SendBehavior {
    Pending(VecDeque<Vec<u8>>),
    Established(Arc<dyn IoConnection>),
    Closing {
        io: Arc<dyn IoConnection>,
        queue: VecDeque<Vec<u8>>,
        started: Instant,
    },
    Closed,
}

impl SendBehavior {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Pending(_) => ConnectionState::Pending,
            Self::Established(_) => ConnectionState::Established,
            Self::Closing { .. } => ConnectionState::Closing,
            Self::Closed => ConnectionState::Closed,
        }
    }

    fn io_token(&self) -> Option<Token> {
        match self {
            Self::Established(io) | Self::Closing { io, .. } => Some(io.token()),
            Self::Pending(_) | Self::Closed => None,
        }
    }
}

/// Ordered message link to one peer.
pub struct MessageConnection {
    me: Identity,
    peer: Identity,
    initiator: bool,
    weak_self: Weak<MessageConnection>,
    host: Weak<dyn ConnectionHost>,
    security: Arc<dyn WireSecurity>,
    state: Mutex<SendBehavior>,
}

impl MessageConnection {
    pub fn new(
        me: Identity,
        peer: Identity,
        host: Weak<dyn ConnectionHost>,
        security: Arc<dyn WireSecurity>,
    ) -> Arc<Self> {
        Self::with_queue(me, peer, host, security, VecDeque::new())
    }

    /// A `Pending` connection starting with `queue` already waiting.
    pub fn with_queue(
        me: Identity,
        peer: Identity,
        host: Weak<dyn ConnectionHost>,
        security: Arc<dyn WireSecurity>,
        queue: VecDeque<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            me,
            peer,
            initiator: me.id() < peer.id(),
            weak_self: weak_self.clone(),
            host,
            security,
            state: Mutex::new(SendBehavior::Pending(queue)),
        })
    }

    pub fn peer(&self) -> Identity {
        self.peer
    }

    /// The lower node id opens and closes the link.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state()
    }

    /// Attach a socket.  Only a `Pending` connection accepts one: the local
    /// heartbeat goes out first, then the queue in FIFO order.
    pub fn assign_impl(&self, io: Arc<dyn IoConnection>) -> bool {
        let Some(host) = self.host.upgrade() else {
            return false;
        };
        let heartbeat = LinkMessage::Heartbeat(host.local_heartbeat());
        let mut state = self.state.lock();
        let SendBehavior::Pending(queue) = &mut *state else {
            return false;
        };
        let queue = mem::take(queue);
        // a failed send shuts the socket down, and its closing
        // notification then finds this connection established
        if let Err(e) = self.write(io.as_ref(), &heartbeat) {
            debug!("{self}: handshake send failed: {e}");
        }
        let flushed = queue.len();
        for payload in queue {
            if let Err(e) = self.write(io.as_ref(), &LinkMessage::Payload(payload)) {
                debug!("{self}: queued send failed: {e}");
            }
        }
        trace!("{self}: established, flushed {flushed} queued");
        *state = SendBehavior::Established(io);
        true
    }

    /// Send an application payload; dropped silently once closed.  The
    /// write happens under the state lock, so a payload is either on the
    /// wire ahead of a `Close` or queued behind it.
    pub fn send_payload(&self, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            SendBehavior::Pending(queue) | SendBehavior::Closing { queue, .. } => {
                queue.push_back(payload);
                Ok(())
            }
            SendBehavior::Established(io) => {
                self.write(io.as_ref(), &LinkMessage::Payload(payload))
            }
            SendBehavior::Closed => {
                trace!("{self}: dropping payload on closed link");
                Ok(())
            }
        }
    }

    pub fn send_heartbeat(&self, heartbeat: &Heartbeat) {
        let state = self.state.lock();
        let SendBehavior::Established(io) = &*state else {
            return;
        };
        if let Err(e) = self.write(io.as_ref(), &LinkMessage::Heartbeat(heartbeat.clone())) {
            debug!("{self}: heartbeat send failed: {e}");
        }
    }

    /// Close immediately without notifying the host.
    pub fn terminate(&self) {
        let previous = mem::replace(&mut *self.state.lock(), SendBehavior::Closed);
        if let SendBehavior::Established(io) | SendBehavior::Closing { io, .. } = previous {
            io.silence();
            io.shutdown();
        }
    }

    /// The socket identified by `token` shut down.  Stale tokens are
    /// ignored; otherwise the connection closes and the host is told.
    pub fn closing(&self, token: Token) {
        {
            let mut state = self.state.lock();
            if state.io_token() != Some(token) {
                return;
            }
            *state = SendBehavior::Closed;
        }
        debug!("{self}: link failed");
        if let (Some(host), Some(this)) = (self.host.upgrade(), self.weak_self.upgrade()) {
            host.connection_failed(&this);
        }
    }

    /// Periodic close check, run by the initiator's timer.  Starts close
    /// negotiation on an unwanted link and gives up waiting for the echo
    /// after `close_timeout`.
    pub fn check_close(&self, close_timeout: Duration) {
        if !self.initiator {
            return;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let wanted = host.link_wanted(&self.peer);
        let mut state = self.state.lock();
        match &*state {
            SendBehavior::Established(io) if !wanted => {
                let io = io.clone();
                if let Err(e) = self.write(io.as_ref(), &LinkMessage::Close(host.local_heartbeat())) {
                    debug!("{self}: close send failed: {e}");
                }
                io.silence();
                debug!("{self}: closing unwanted link");
                *state = SendBehavior::Closing {
                    io,
                    queue: VecDeque::new(),
                    started: Instant::now(),
                };
            }
            SendBehavior::Closing { started, .. } if started.elapsed() >= close_timeout => {
                let previous = mem::replace(&mut *state, SendBehavior::Closed);
                drop(state);
                debug!("{self}: close echo timed out");
                self.finish_close(host.as_ref(), previous);
            }
            _ => {}
        }
    }

    /// Handle one frame read from the socket identified by `token`.
    pub fn receive(&self, token: Token, payload: Vec<u8>) -> Result<()> {
        if self.state.lock().io_token() != Some(token) {
            trace!("{self}: ignoring frame from stale socket {token}");
            return Ok(());
        }
        let Some(host) = self.host.upgrade() else {
            return Err(MembershipError::ConnectionClosed);
        };
        match LinkMessage::decode(payload, self.security.as_ref())? {
            LinkMessage::Heartbeat(heartbeat) => host.heartbeat_received(heartbeat),
            LinkMessage::Payload(payload) => host.deliver(self.peer, payload),
            LinkMessage::Close(heartbeat) => {
                host.heartbeat_received(heartbeat);
                self.close_received(host.as_ref());
            }
        }
        Ok(())
    }

    fn close_received(&self, host: &dyn ConnectionHost) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, SendBehavior::Closed) {
            closing @ SendBehavior::Closing { .. } => {
                drop(state);
                trace!("{self}: close echoed");
                self.finish_close(host, closing);
            }
            SendBehavior::Established(io) => {
                drop(state);
                let echo = LinkMessage::Close(host.local_heartbeat());
                if let Err(e) = self.write(io.as_ref(), &echo) {
                    debug!("{self}: close echo failed: {e}");
                }
                // the initiator closes the socket once it reads the echo
                io.silence();
                let reopen = host.link_wanted(&self.peer);
                debug!("{self}: peer closed link, reopen={reopen}");
                if let Some(this) = self.weak_self.upgrade() {
                    host.close_completed(&this, reopen, VecDeque::new());
                }
            }
            other => *state = other,
        }
    }

    fn finish_close(&self, host: &dyn ConnectionHost, previous: SendBehavior) {
        let SendBehavior::Closing { io, queue, .. } = previous else {
            return;
        };
        io.shutdown();
        let reopen = !queue.is_empty() || host.link_wanted(&self.peer);
        if let Some(this) = self.weak_self.upgrade() {
            host.close_completed(&this, reopen, queue);
        }
    }

    fn write(&self, io: &dyn IoConnection, message: &LinkMessage) -> Result<()> {
        io.send(message.encode(self.security.as_ref())?)
    }
}

impl FrameSink for MessageConnection {
    fn deliver(&self, connection: &Arc<FramedConnection>, payload: Vec<u8>) -> Result<()> {
        self.receive(connection.token(), payload)
    }

    fn closing(&self, token: Token) {
        MessageConnection::closing(self, token);
    }
}

impl fmt::Display for MessageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-link {}->{}", self.me.id(), self.peer.id())
    }
}

impl fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConnection")
            .field("me", &self.me)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// A peer known only through gossip heartbeats.
#[derive(Debug)]
pub struct HeartbeatConnection {
    peer: Identity,
}

impl HeartbeatConnection {
    pub fn new(peer: Identity) -> Arc<Self> {
        Arc::new(Self { peer })
    }

    pub fn peer(&self) -> Identity {
        self.peer
    }
}

/// Loopback to the local node.
pub struct SelfConnection {
    me: Identity,
    host: Weak<dyn ConnectionHost>,
}

impl SelfConnection {
    pub fn new(me: Identity, host: Weak<dyn ConnectionHost>) -> Arc<Self> {
        Arc::new(Self { me, host })
    }

    pub fn send(&self, payload: Vec<u8>) {
        if let Some(host) = self.host.upgrade() {
            host.deliver(self.me, payload);
        }
    }
}

#[derive(Clone)]
pub enum Connection {
    Myself(Arc<SelfConnection>),
    Heartbeat(Arc<HeartbeatConnection>),
    Message(Arc<MessageConnection>),
}

impl Connection {
    pub fn peer(&self) -> Identity {
        match self {
            Self::Myself(c) => c.me,
            Self::Heartbeat(c) => c.peer,
            Self::Message(c) => c.peer,
        }
    }

    /// Same connection object, not merely the same peer.
    pub fn same(&self, other: &Connection) -> bool {
        match (self, other) {
            (Self::Myself(a), Self::Myself(b)) => Arc::ptr_eq(a, b),
            (Self::Heartbeat(a), Self::Heartbeat(b)) => Arc::ptr_eq(a, b),
            (Self::Message(a), Self::Message(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_message(&self) -> Option<&Arc<MessageConnection>> {
        match self {
            Self::Message(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{heartbeat::tests::test_heartbeat, wire::NoSecurity},
        assert_matches::assert_matches,
        crossbeam_channel::{unbounded, Receiver, Sender},
        std::{
            sync::atomic::{AtomicBool, AtomicUsize, Ordering},
            thread,
        },
    };

    /// Decodes and records everything sent through it.
    pub(crate) struct RecordingIo {
        token: Token,
        pub(crate) sent: Mutex<Vec<LinkMessage>>,
        open: AtomicBool,
        silent: AtomicBool,
    }

    impl RecordingIo {
        pub(crate) fn new(token: Token) -> Arc<Self> {
            Arc::new(Self {
                token,
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                silent: AtomicBool::new(false),
            })
        }

        pub(crate) fn kinds(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(LinkMessage::kind).collect()
        }

        pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .iter()
                .filter_map(|m| match m {
                    LinkMessage::Payload(p) => Some(p.clone()),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn is_silent(&self) -> bool {
            self.silent.load(Ordering::SeqCst)
        }
    }

    impl IoConnection for RecordingIo {
        fn token(&self) -> Token {
            self.token
        }

        fn peer_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }

        fn send(&self, payload: Vec<u8>) -> Result<()> {
            if !self.is_open() {
                return Err(MembershipError::ConnectionClosed);
            }
            self.sent
                .lock()
                .push(LinkMessage::decode(payload, &NoSecurity)?);
            Ok(())
        }

        fn silence(&self) {
            self.silent.store(true, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    /// Records like [`RecordingIo`] but holds every payload write until
    /// released.
    struct GatedIo {
        inner: Arc<RecordingIo>,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl IoConnection for GatedIo {
        fn token(&self) -> Token {
            self.inner.token()
        }

        fn peer_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }

        fn send(&self, payload: Vec<u8>) -> Result<()> {
            if let Ok(LinkMessage::Payload(_)) = LinkMessage::decode(payload.clone(), &NoSecurity) {
                let _ = self.entered.send(());
                let _ = self.release.recv_timeout(Duration::from_secs(5));
            }
            self.inner.send(payload)
        }

        fn silence(&self) {
            self.inner.silence();
        }

        fn shutdown(&self) {
            self.inner.shutdown();
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedHost {
        pub(crate) wanted: AtomicBool,
        pub(crate) delivered: Mutex<Vec<(Identity, Vec<u8>)>>,
        pub(crate) heartbeats: AtomicUsize,
        pub(crate) failed: AtomicUsize,
        pub(crate) completed: Mutex<Vec<(bool, VecDeque<Vec<u8>>)>>,
    }

    impl ConnectionHost for ScriptedHost {
        fn local_heartbeat(&self) -> Heartbeat {
            test_heartbeat(1, 100)
        }

        fn link_wanted(&self, _peer: &Identity) -> bool {
            self.wanted.load(Ordering::SeqCst)
        }

        fn heartbeat_received(&self, _heartbeat: Heartbeat) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }

        fn deliver(&self, from: Identity, payload: Vec<u8>) {
            self.delivered.lock().push((from, payload));
        }

        fn connection_failed(&self, _connection: &Arc<MessageConnection>) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        fn close_completed(
            &self,
            _connection: &Arc<MessageConnection>,
            reopen: bool,
            queued: VecDeque<Vec<u8>>,
        ) {
            self.completed.lock().push((reopen, queued));
        }
    }

    fn identity(id: u16) -> Identity {
        Identity::new(42, id, 1).unwrap()
    }

    /// Connection from node 1 to `peer`; node 1 initiates towards higher ids.
    fn connection(host: &Arc<ScriptedHost>, peer: u16) -> Arc<MessageConnection> {
        let host: Arc<dyn ConnectionHost> = host.clone();
        MessageConnection::new(
            identity(1),
            identity(peer),
            Arc::downgrade(&host),
            Arc::new(NoSecurity),
        )
    }

    fn encoded(message: LinkMessage) -> Vec<u8> {
        message.encode(&NoSecurity).unwrap()
    }

    #[test]
    fn test_pending_queue_flushes_in_order() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        assert_eq!(conn.state(), ConnectionState::Pending);
        for msg in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            conn.send_payload(msg).unwrap();
        }

        let io = RecordingIo::new(7);
        assert!(conn.assign_impl(io.clone()));
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(
            io.kinds(),
            vec!["heartbeat", "payload", "payload", "payload"]
        );
        assert_eq!(io.payloads(), vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        conn.send_payload(b"four".to_vec()).unwrap();
        assert_eq!(io.payloads().last().unwrap(), b"four");

        // a second socket is refused
        assert!(!conn.assign_impl(RecordingIo::new(8)));
    }

    #[test]
    fn test_terminate_drops_everything() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        let io = RecordingIo::new(7);
        conn.assign_impl(io.clone());
        conn.terminate();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!io.is_open());
        assert!(io.is_silent());

        let sent = io.sent.lock().len();
        conn.send_payload(b"lost".to_vec()).unwrap();
        assert_eq!(io.sent.lock().len(), sent);
        assert_eq!(host.failed.load(Ordering::SeqCst), 0);

        // terminate on a pending connection also works
        let pending = connection(&host, 3);
        pending.terminate();
        assert!(!pending.assign_impl(RecordingIo::new(9)));
    }

    #[test]
    fn test_closing_ignores_stale_socket() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        conn.assign_impl(RecordingIo::new(7));
        conn.closing(99);
        assert_eq!(conn.state(), ConnectionState::Established);
        conn.closing(7);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(host.failed.load(Ordering::SeqCst), 1);
        conn.closing(7);
        assert_eq!(host.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receive_routes_messages() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        conn.assign_impl(RecordingIo::new(7));

        conn.receive(7, encoded(LinkMessage::Payload(b"data".to_vec())))
            .unwrap();
        conn.receive(7, encoded(LinkMessage::Heartbeat(test_heartbeat(2, 1))))
            .unwrap();
        // stale socket: ignored, not an error
        conn.receive(3, encoded(LinkMessage::Payload(b"old".to_vec())))
            .unwrap();
        assert_matches!(
            conn.receive(7, b"garbage".to_vec()),
            Err(MembershipError::Serialization(_))
        );

        assert_eq!(*host.delivered.lock(), vec![(identity(2), b"data".to_vec())]);
        assert_eq!(host.heartbeats.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initiator_close_downgrades() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        assert!(conn.is_initiator());
        let io = RecordingIo::new(7);
        conn.assign_impl(io.clone());

        host.wanted.store(true, Ordering::SeqCst);
        conn.check_close(Duration::from_secs(60));
        assert_eq!(conn.state(), ConnectionState::Established);

        host.wanted.store(false, Ordering::SeqCst);
        conn.check_close(Duration::from_secs(60));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(io.kinds().last(), Some(&"close"));
        assert!(io.is_silent());
        assert!(io.is_open());

        conn.receive(7, encoded(LinkMessage::Close(test_heartbeat(2, 5))))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!io.is_open());
        let completed = host.completed.lock();
        assert_eq!(completed.len(), 1);
        assert!(!completed[0].0);
        assert!(completed[0].1.is_empty());
    }

    #[test]
    fn test_send_during_close_reopens() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        let io = RecordingIo::new(7);
        conn.assign_impl(io.clone());
        conn.check_close(Duration::from_secs(60));
        assert_eq!(conn.state(), ConnectionState::Closing);

        conn.send_payload(b"late".to_vec()).unwrap();
        assert!(io.payloads().is_empty());

        conn.receive(7, encoded(LinkMessage::Close(test_heartbeat(2, 5))))
            .unwrap();
        let completed = host.completed.lock();
        assert!(completed[0].0);
        assert_eq!(completed[0].1, VecDeque::from(vec![b"late".to_vec()]));
    }

    #[test]
    fn test_close_waits_for_payload_in_flight() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        let recorder = RecordingIo::new(7);
        let (entered_sender, entered) = unbounded();
        let (release, release_receiver) = unbounded();
        conn.assign_impl(Arc::new(GatedIo {
            inner: recorder.clone(),
            entered: entered_sender,
            release: release_receiver,
        }));

        let sender = {
            let conn = conn.clone();
            thread::spawn(move || conn.send_payload(b"racing".to_vec()))
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        let closer = {
            let conn = conn.clone();
            thread::spawn(move || conn.check_close(Duration::from_secs(60)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.kinds(), vec!["heartbeat"]);

        release.send(()).unwrap();
        sender.join().unwrap().unwrap();
        closer.join().unwrap();
        assert_eq!(recorder.kinds(), vec!["heartbeat", "payload", "close"]);
        assert_eq!(conn.state(), ConnectionState::Closing);

        // a send that loses the race queues and forces a reopen
        conn.send_payload(b"late".to_vec()).unwrap();
        conn.receive(7, encoded(LinkMessage::Close(test_heartbeat(2, 5))))
            .unwrap();
        let completed = host.completed.lock();
        assert!(completed[0].0);
        assert_eq!(completed[0].1, VecDeque::from(vec![b"late".to_vec()]));
    }

    #[test]
    fn test_close_echo_timeout() {
        let host = Arc::new(ScriptedHost::default());
        let conn = connection(&host, 2);
        let io = RecordingIo::new(7);
        conn.assign_impl(io.clone());
        conn.check_close(Duration::ZERO);
        assert_eq!(conn.state(), ConnectionState::Closing);
        conn.check_close(Duration::ZERO);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!io.is_open());
        assert_eq!(host.completed.lock().len(), 1);
    }

    #[test]
    fn test_responder_echoes_close() {
        let host = Arc::new(ScriptedHost::default());
        // node 1 towards node 0: node 0 initiates
        let host_dyn: Arc<dyn ConnectionHost> = host.clone();
        let conn = MessageConnection::new(
            identity(1),
            identity(0),
            Arc::downgrade(&host_dyn),
            Arc::new(NoSecurity),
        );
        assert!(!conn.is_initiator());
        let io = RecordingIo::new(7);
        conn.assign_impl(io.clone());

        // a responder never starts a close
        conn.check_close(Duration::ZERO);
        assert_eq!(conn.state(), ConnectionState::Established);

        conn.receive(7, encoded(LinkMessage::Close(test_heartbeat(0, 5))))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(io.kinds().last(), Some(&"close"));
        assert!(io.is_silent());
        assert!(io.is_open());
        assert!(!host.completed.lock()[0].0);
    }

    #[test]
    fn test_connection_identity() {
        let host = Arc::new(ScriptedHost::default());
        let a = Connection::Message(connection(&host, 2));
        let b = Connection::Message(connection(&host, 2));
        assert_eq!(a.peer(), b.peer());
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        let hb = Connection::Heartbeat(HeartbeatConnection::new(identity(2)));
        assert!(!a.same(&hb));
        assert!(hb.as_message().is_none());
    }
}
