//! Readiness multiplexer driving every link socket of a node.
//!
//! One poller thread owns the interest set.  Other threads never touch it:
//! they queue [`Request`]s and wake the poller, which applies them on its
//! own turn.  When a socket becomes ready the poller first cancels the
//! fired interest and only then hands the matching callback to the comms
//! pool, so a handler sees at most one event per interest until it asks
//! for more.  Nothing runs inline on the poller thread.
//!
//! Decoded messages travel upward on a separate keyed dispatch pool, so
//! slow consumers never stall socket I/O.

use {
    crate::{
        config::{MembershipConfig, SocketOptions},
        error::{MembershipError, Result},
        stats::ReactorStats,
        worker_pool::WorkerPool,
    },
    crossbeam_channel::{unbounded, Receiver, Sender},
    dashmap::DashMap,
    log::{debug, error, info, trace, warn},
    nix::{
        errno::Errno,
        poll::{poll, PollFd, PollFlags},
    },
    parking_lot::Mutex,
    socket2::{Domain, Protocol, Socket, Type},
    std::{
        collections::HashMap,
        io::{self, Read, Write},
        net::{Shutdown, SocketAddr, TcpListener, TcpStream},
        os::{
            fd::{AsFd, BorrowedFd},
            unix::net::UnixStream,
        },
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Identifies a handler registered with a reactor.
pub type Token = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Accept,
    Read,
    Write,
    Connect,
}

impl Interest {
    fn is_inbound(self) -> bool {
        matches!(self, Self::Accept | Self::Read)
    }
}

/// A socket the reactor can watch.  Callbacks run on the comms pool, one
/// per fired interest; a handler that wants more events calls
/// [`ReactorHandle::watch`] again.
pub trait ChannelHandler: AsFd + Send + Sync {
    fn token(&self) -> Token;

    fn handle_accept(self: Arc<Self>) {}

    fn handle_read(self: Arc<Self>) {}

    fn handle_write(self: Arc<Self>) {}

    fn handle_connect(self: Arc<Self>) {}

    /// When a pending `Connect` interest gives up.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Close the socket.  Called for every open handler on shutdown.
    fn close(&self);
}

/// Builds the handler for each accepted socket.
pub trait HandlerFactory: Send + Sync {
    fn create_handler(
        &self,
        stream: TcpStream,
        token: Token,
        reactor: &ReactorHandle,
    ) -> Arc<dyn ChannelHandler>;
}

enum Request {
    Watch(Token, Interest),
    Deregister(Token),
}

struct ReactorInner {
    name: String,
    requests: Sender<Request>,
    waker: UnixStream,
    open: DashMap<Token, Arc<dyn ChannelHandler>>,
    comms: WorkerPool,
    dispatch: WorkerPool,
    next_token: AtomicU64,
    running: AtomicBool,
    options: SocketOptions,
    connect_timeout: Duration,
    stats: ReactorStats,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Owns a reactor; shuts it down on drop.
pub struct Reactor {
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new(name: &str, config: &MembershipConfig) -> Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        let (requests, receiver) = unbounded();

        let inner = Arc::new(ReactorInner {
            name: name.to_string(),
            requests,
            waker: wake_tx,
            open: DashMap::new(),
            comms: WorkerPool::new(&format!("{name}Comm"), config.comms_threads),
            dispatch: WorkerPool::keyed(&format!("{name}Dsp"), config.dispatch_threads),
            next_token: AtomicU64::new(1),
            running: AtomicBool::new(true),
            options: config.socket_options.clone(),
            connect_timeout: config.connect_timeout,
            stats: ReactorStats::default(),
            poller: Mutex::new(None),
        });

        let poll_timeout_ms = u16::try_from(config.poll_timeout.as_millis()).unwrap_or(u16::MAX);
        let poller_inner = inner.clone();
        let poller = Builder::new()
            .name(format!("{name}Poll"))
            .spawn(move || run(poller_inner, receiver, wake_rx, poll_timeout_ms))
            .expect("failed to spawn reactor poller thread");
        *inner.poller.lock() = Some(poller);
        info!("{name} reactor started");

        Ok(Self {
            handle: ReactorHandle { inner },
        })
    }

    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    pub fn listen(&self, addr: SocketAddr, factory: Arc<dyn HandlerFactory>) -> Result<SocketAddr> {
        self.handle.listen(addr, factory)
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// Cloneable access to a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Arc<ReactorInner>,
}

impl ReactorHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ReactorStats {
        &self.inner.stats
    }

    pub fn next_token(&self) -> Token {
        self.inner.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `handler` to the open set so it can be watched.
    pub fn attach(&self, handler: Arc<dyn ChannelHandler>) {
        self.inner.open.insert(handler.token(), handler);
    }

    /// Ask the poller to report the next `interest` event for `token`.
    pub fn watch(&self, token: Token, interest: Interest) -> Result<()> {
        if !self.is_running() {
            return Err(MembershipError::ReactorShutdown);
        }
        self.inner
            .requests
            .send(Request::Watch(token, interest))
            .map_err(|_| MembershipError::ReactorShutdown)?;
        self.wake();
        Ok(())
    }

    /// Drop `token` from the open set and stop watching it.
    pub fn deregister(&self, token: Token) {
        if self.inner.open.remove(&token).is_some() {
            self.inner.stats.closed.inc();
        }
        if self.inner.requests.send(Request::Deregister(token)).is_ok() {
            self.wake();
        }
    }

    /// Run `job` on the dispatch lane for `key`.
    pub fn dispatch<F>(&self, key: u64, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatch.execute_keyed(key, job)
    }

    /// Run `job` on the comms pool.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.comms.execute(job)
    }

    /// Bind a listener and start accepting; returns the bound address.
    pub fn listen(&self, addr: SocketAddr, factory: Arc<dyn HandlerFactory>) -> Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        self.inner.options.apply_to_listener(&socket);
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.inner.options.backlog())?;
        let listener = TcpListener::from(socket);
        let local_addr = listener.local_addr()?;

        let token = self.next_token();
        self.attach(Arc::new(Acceptor {
            token,
            listener,
            factory,
            reactor: self.clone(),
        }));
        self.watch(token, Interest::Accept)?;
        info!("{} reactor listening on {local_addr}", self.inner.name);
        Ok(local_addr)
    }

    /// Start a non-blocking connect to `addr`.  `on_connect` runs on the
    /// comms pool with the connected, configured stream or the failure,
    /// including `TimedOut` after the connect timeout.  An error returned
    /// here means the connect never started and `on_connect` is dropped.
    pub fn connect<F>(&self, addr: SocketAddr, on_connect: F) -> Result<()>
    where
        F: FnOnce(io::Result<TcpStream>) + Send + 'static,
    {
        if !self.is_running() {
            return Err(MembershipError::ReactorShutdown);
        }
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                self.inner.stats.connect_failures.inc();
                return Err(e.into());
            }
        }

        let token = self.next_token();
        self.attach(Arc::new(Connector {
            token,
            addr,
            socket,
            deadline: Instant::now()
                .checked_add(self.inner.connect_timeout)
                .unwrap_or_else(Instant::now),
            on_connect: Mutex::new(Some(Box::new(on_connect))),
            reactor: self.clone(),
        }));
        trace!("{} reactor connecting to {addr} as token {token}", self.inner.name);
        self.watch(token, Interest::Connect).inspect_err(|_| {
            self.inner.open.remove(&token);
        })
    }

    /// Stop the poller, close every open handler and shut both pools down.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wake();
        let handlers: Vec<_> = self
            .inner
            .open
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.open.clear();
        for handler in handlers {
            handler.close();
        }
        let poller = self.inner.poller.lock().take();
        if let Some(poller) = poller {
            if poller.thread().id() != thread::current().id() && poller.join().is_err() {
                error!("{} reactor poller panicked", self.inner.name);
            }
        }
        self.inner.comms.shutdown();
        self.inner.dispatch.shutdown();
        info!("{} reactor shut down", self.inner.name);
    }

    fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    fn wake(&self) {
        match (&self.inner.waker).write(&[1u8]) {
            Ok(_) => {}
            // a full pipe already guarantees a wakeup
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("{} reactor wakeup failed: {e}", self.inner.name),
        }
    }

    fn adopt(&self, stream: TcpStream, peer: SocketAddr, factory: &dyn HandlerFactory) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        self.options().apply_to_stream(&stream);
        let token = self.next_token();
        let handler = factory.create_handler(stream, token, self);
        self.attach(handler.clone());
        self.inner.stats.accepted.inc();
        debug!("{} reactor accepted {peer} as token {token}", self.inner.name);
        handler.handle_accept();
        Ok(())
    }
}

/// Poller-side registration of one handler.
struct Watched {
    handler: Arc<dyn ChannelHandler>,
    inbound: Option<Interest>,
    outbound: Option<Interest>,
}

impl Watched {
    fn add(&mut self, interest: Interest) {
        if interest.is_inbound() {
            self.inbound = Some(interest);
        } else {
            self.outbound = Some(interest);
        }
    }

    fn flags(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.inbound.is_some() {
            flags |= PollFlags::POLLIN;
        }
        if self.outbound.is_some() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn is_idle(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}

fn run(inner: Arc<ReactorInner>, requests: Receiver<Request>, mut wake_rx: UnixStream, poll_timeout_ms: u16) {
    let mut watched: HashMap<Token, Watched> = HashMap::new();

    while inner.running.load(Ordering::Acquire) {
        for request in requests.try_iter() {
            match request {
                Request::Watch(token, interest) => {
                    let Some(handler) = inner.open.get(&token).map(|h| h.value().clone()) else {
                        continue;
                    };
                    watched
                        .entry(token)
                        .or_insert_with(|| Watched {
                            handler,
                            inbound: None,
                            outbound: None,
                        })
                        .add(interest);
                }
                Request::Deregister(token) => {
                    watched.remove(&token);
                }
            }
        }
        watched.retain(|token, _| inner.open.contains_key(token));

        expire_connects(&inner, &mut watched);

        let entries: Vec<(Token, Arc<dyn ChannelHandler>, PollFlags)> = watched
            .iter()
            .map(|(token, w)| (*token, w.handler.clone(), w.flags()))
            .collect();
        let (woken, ready) = match poll_once(&wake_rx, &entries, poll_timeout_ms) {
            Ok(result) => result,
            Err(e) => {
                error!("{} reactor poll failed: {e}", inner.name);
                break;
            }
        };
        if woken {
            drain_waker(&mut wake_rx);
            inner.stats.poll_wakeups.inc();
        }
        for ((token, _, _), revents) in entries.iter().zip(ready) {
            if let Some(revents) = revents.filter(|r| !r.is_empty()) {
                fire(&inner, &mut watched, *token, revents);
            }
        }
    }
    debug!("{} reactor poller exiting", inner.name);
}

fn poll_once(
    waker: &UnixStream,
    entries: &[(Token, Arc<dyn ChannelHandler>, PollFlags)],
    timeout_ms: u16,
) -> io::Result<(bool, Vec<Option<PollFlags>>)> {
    let mut fds = Vec::with_capacity(entries.len().saturating_add(1));
    fds.push(PollFd::new(waker.as_fd(), PollFlags::POLLIN));
    fds.extend(
        entries
            .iter()
            .map(|(_, handler, flags)| PollFd::new(handler.as_fd(), *flags)),
    );
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let mut revents = fds.iter().map(|fd| fd.revents());
    let woken = revents.next().flatten().is_some_and(|r| !r.is_empty());
    Ok((woken, revents.collect()))
}

/// Cancel the interests `revents` satisfies and dispatch their callbacks.
fn fire(inner: &ReactorInner, watched: &mut HashMap<Token, Watched>, token: Token, revents: PollFlags) {
    let Some(entry) = watched.get_mut(&token) else {
        return;
    };
    if revents.contains(PollFlags::POLLNVAL) {
        warn!("{} reactor dropping invalid descriptor for token {token}", inner.name);
        watched.remove(&token);
        return;
    }
    let failed = revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP);
    let mut fired = Vec::with_capacity(2);
    if revents.contains(PollFlags::POLLIN) || failed {
        fired.extend(entry.inbound.take());
    }
    if revents.contains(PollFlags::POLLOUT) || failed {
        fired.extend(entry.outbound.take());
    }
    let handler = entry.handler.clone();
    if entry.is_idle() {
        watched.remove(&token);
    }
    for interest in fired {
        let handler = handler.clone();
        inner.comms.execute(move || match interest {
            Interest::Accept => handler.handle_accept(),
            Interest::Read => handler.handle_read(),
            Interest::Write => handler.handle_write(),
            Interest::Connect => handler.handle_connect(),
        });
    }
}

fn expire_connects(inner: &ReactorInner, watched: &mut HashMap<Token, Watched>) {
    let now = Instant::now();
    let expired: Vec<Token> = watched
        .iter()
        .filter(|(_, w)| {
            w.outbound == Some(Interest::Connect) && w.handler.deadline().is_some_and(|d| d <= now)
        })
        .map(|(token, _)| *token)
        .collect();
    for token in expired {
        fire(inner, watched, token, PollFlags::POLLOUT);
    }
}

fn drain_waker(wake_rx: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match wake_rx.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

struct Acceptor {
    token: Token,
    listener: TcpListener,
    factory: Arc<dyn HandlerFactory>,
    reactor: ReactorHandle,
}

impl AsFd for Acceptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl ChannelHandler for Acceptor {
    fn token(&self) -> Token {
        self.token
    }

    fn handle_accept(self: Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.reactor.adopt(stream, peer, self.factory.as_ref()) {
                        warn!("failed to adopt connection from {peer}: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{} reactor accept failed: {e}", self.reactor.name());
                    break;
                }
            }
        }
        if self.reactor.watch(self.token, Interest::Accept).is_err() {
            debug!("{} reactor stopped accepting", self.reactor.name());
        }
    }

    // the listener closes when the poller drops its last reference
    fn close(&self) {}
}

type ConnectCallback = Box<dyn FnOnce(io::Result<TcpStream>) + Send>;

struct Connector {
    token: Token,
    addr: SocketAddr,
    socket: Socket,
    deadline: Instant,
    on_connect: Mutex<Option<ConnectCallback>>,
    reactor: ReactorHandle,
}

impl Connector {
    fn finish(&self, result: io::Result<TcpStream>) {
        self.reactor.deregister(self.token);
        let result = result.inspect(|stream| self.reactor.options().apply_to_stream(stream));
        let stats = self.reactor.stats();
        match &result {
            Ok(_) => stats.connected.inc(),
            Err(e) => {
                stats.connect_failures.inc();
                debug!("connect to {} failed: {e}", self.addr);
            }
        }
        let on_connect = self.on_connect.lock().take();
        if let Some(on_connect) = on_connect {
            on_connect(result);
        }
    }
}

impl AsFd for Connector {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl ChannelHandler for Connector {
    fn token(&self) -> Token {
        self.token
    }

    fn handle_connect(self: Arc<Self>) {
        let outcome = match self.socket.take_error() {
            Ok(Some(e)) | Err(e) => Some(Err(e)),
            Ok(None) => match self.socket.peer_addr() {
                Ok(_) => Some(self.socket.try_clone().map(TcpStream::from)),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    if Instant::now() < self.deadline {
                        None
                    } else {
                        Some(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect to {} timed out", self.addr),
                        )))
                    }
                }
                Err(e) => Some(Err(e)),
            },
        };
        match outcome {
            Some(result) => self.finish(result),
            None => {
                if self.reactor.watch(self.token, Interest::Connect).is_err() {
                    self.finish(Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "reactor shut down",
                    )));
                }
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }

    fn close(&self) {
        self.on_connect.lock().take();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crossbeam_channel::bounded};

    const WAIT: Duration = Duration::from_secs(5);

    /// Forwards whatever it reads to a channel.
    struct Collect {
        token: Token,
        stream: TcpStream,
        reactor: ReactorHandle,
        out: Sender<Vec<u8>>,
    }

    impl AsFd for Collect {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.stream.as_fd()
        }
    }

    impl ChannelHandler for Collect {
        fn token(&self) -> Token {
            self.token
        }

        fn handle_accept(self: Arc<Self>) {
            self.reactor.watch(self.token, Interest::Read).unwrap();
        }

        fn handle_read(self: Arc<Self>) {
            let mut buf = [0u8; 256];
            match (&self.stream).read(&mut buf) {
                Ok(0) => self.reactor.deregister(self.token),
                Ok(n) => {
                    self.out.send(buf[..n].to_vec()).unwrap();
                    let _ = self.reactor.watch(self.token, Interest::Read);
                }
                Err(_) => {
                    let _ = self.reactor.watch(self.token, Interest::Read);
                }
            }
        }

        fn close(&self) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    struct CollectFactory(Sender<Vec<u8>>);

    impl HandlerFactory for CollectFactory {
        fn create_handler(
            &self,
            stream: TcpStream,
            token: Token,
            reactor: &ReactorHandle,
        ) -> Arc<dyn ChannelHandler> {
            Arc::new(Collect {
                token,
                stream,
                reactor: reactor.clone(),
                out: self.0.clone(),
            })
        }
    }

    #[test]
    fn test_accept_and_read() {
        let reactor = Reactor::new("tAcc", &MembershipConfig::dev_default()).unwrap();
        let (tx, rx) = bounded(16);
        let addr = reactor
            .listen("127.0.0.1:0".parse().unwrap(), Arc::new(CollectFactory(tx)))
            .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"Hello").unwrap();
        let mut got = rx.recv_timeout(WAIT).unwrap();
        while got.len() < 5 {
            got.extend(rx.recv_timeout(WAIT).unwrap());
        }
        assert_eq!(got, b"Hello");
        // interest was re-armed by the handler
        client.write_all(b"again").unwrap();
        assert!(!rx.recv_timeout(WAIT).unwrap().is_empty());
        assert_eq!(reactor.handle().stats().accepted.get(), 1);
        reactor.shutdown();
        reactor.shutdown();
    }

    #[test]
    fn test_outbound_connect() {
        let reactor = Reactor::new("tCon", &MembershipConfig::dev_default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = bounded(1);
        reactor
            .handle()
            .connect(listener.local_addr().unwrap(), move |result| {
                tx.send(result.map(|s| s.peer_addr().unwrap())).unwrap();
            })
            .unwrap();
        let peer = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(peer, listener.local_addr().unwrap());
        assert_eq!(reactor.handle().stats().connected.get(), 1);
    }

    #[test]
    fn test_connect_refused() {
        let reactor = Reactor::new("tRef", &MembershipConfig::dev_default()).unwrap();
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (tx, rx) = bounded(1);
        match reactor.handle().connect(addr, move |result| {
            tx.send(result.is_err()).unwrap();
        }) {
            Err(_) => {}
            Ok(()) => assert!(rx.recv_timeout(WAIT).unwrap()),
        }
    }

    /// A listener that never accepts and whose accept queue is full, so
    /// the kernel leaves further SYNs unanswered.  Returns the listener,
    /// the connections holding the queue and the address.
    fn saturated_listener() -> (Socket, Vec<TcpStream>, SocketAddr) {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        listener
            .bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())
            .unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        let mut held = Vec::new();
        for _ in 0..16 {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => held.push(stream),
                Err(_) => break,
            }
        }
        (listener, held, addr)
    }

    #[test]
    fn test_connect_times_out() {
        let config = MembershipConfig {
            connect_timeout: Duration::from_millis(300),
            ..MembershipConfig::dev_default()
        };
        let reactor = Reactor::new("tTmo", &config).unwrap();
        let (_listener, held, addr) = saturated_listener();
        assert!(held.len() < 16);

        let (tx, rx) = bounded(1);
        let started = Instant::now();
        reactor
            .handle()
            .connect(addr, move |result| {
                tx.send(result.map(drop)).unwrap();
            })
            .unwrap();
        let e = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(reactor.handle().stats().connect_failures.get(), 1);
        assert_eq!(reactor.handle().stats().connected.get(), 0);
        reactor.shutdown();
    }

    #[test]
    fn test_watch_after_shutdown() {
        let reactor = Reactor::new("tOff", &MembershipConfig::dev_default()).unwrap();
        let handle = reactor.handle().clone();
        reactor.shutdown();
        assert!(!handle.is_running());
        assert!(matches!(
            handle.watch(1, Interest::Read),
            Err(MembershipError::ReactorShutdown)
        ));
        assert!(!handle.dispatch(1, || {}));
    }
}
