//! Socket-level half of a message link.
//!
//! [`FramedConnection`] couples one non-blocking TCP stream with a
//! [`FrameReader`] and a [`FrameWriter`], each behind its own lock so a
//! read event and a write event on the same socket never interleave buffer
//! mutations but can still run at the same time.  Complete frames go to
//! the current [`FrameSink`] through the reactor's dispatch lane for this
//! connection, which keeps upward delivery in wire order.

use {
    crate::{
        error::{MembershipError, Result},
        framing::{FrameFormat, FrameReader, FrameWriter, ReadStatus, WriteStatus},
        reactor::{ChannelHandler, Interest, ReactorHandle, Token},
    },
    log::{debug, trace, warn},
    parking_lot::{Mutex, RwLock},
    std::{
        fmt,
        net::{Shutdown, SocketAddr, TcpStream},
        os::fd::{AsFd, BorrowedFd},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// What a message connection needs from its socket.
pub trait IoConnection: Send + Sync {
    fn token(&self) -> Token;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Frame and send `payload`, in order with earlier sends.
    fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Suppress every future `closing` notification from this connection.
    fn silence(&self);

    /// Close the socket.  Idempotent.
    fn shutdown(&self);

    fn is_open(&self) -> bool;
}

/// Upward interface of a framed connection.
pub trait FrameSink: Send + Sync {
    /// One complete inbound frame.  An error is fatal to the connection.
    fn deliver(&self, connection: &Arc<FramedConnection>, payload: Vec<u8>) -> Result<()>;

    /// The connection shut down without having been silenced.
    fn closing(&self, token: Token);
}

struct WriterState {
    frames: FrameWriter,
    /// A write interest is armed; `handle_write` will flush.
    watching: bool,
}

pub struct FramedConnection {
    token: Token,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    reactor: ReactorHandle,
    reader: Mutex<FrameReader>,
    writer: Mutex<WriterState>,
    sink: RwLock<Arc<dyn FrameSink>>,
    open: AtomicBool,
    silent: AtomicBool,
}

impl FramedConnection {
    pub fn new(
        stream: TcpStream,
        token: Token,
        reactor: &ReactorHandle,
        format: FrameFormat,
        max_frame_size: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        Arc::new(Self {
            token,
            stream,
            peer_addr,
            reactor: reactor.clone(),
            reader: Mutex::new(FrameReader::new(format, max_frame_size)),
            writer: Mutex::new(WriterState {
                frames: FrameWriter::new(format, max_frame_size),
                watching: false,
            }),
            sink: RwLock::new(sink),
            open: AtomicBool::new(true),
            silent: AtomicBool::new(false),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Register an outbound connection with the reactor.  Writes may be
    /// issued from here on; nothing is read until [`Self::start_reading`].
    pub fn register(self: &Arc<Self>) {
        self.reactor.attach(self.clone());
    }

    pub fn start_reading(&self) -> Result<()> {
        self.reactor
            .watch(self.token, Interest::Read)
            .inspect_err(|_| self.shutdown())
    }

    /// Route later frames and the closing notification to `sink`.
    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.write() = sink;
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Acquire)
    }

    fn deliver(self: &Arc<Self>, payload: Vec<u8>) {
        let this = self.clone();
        self.reactor.dispatch(self.token, move || {
            if !this.is_open() {
                return;
            }
            let sink = this.sink.read().clone();
            if let Err(e) = sink.deliver(&this, payload) {
                this.fail(e);
            }
        });
    }

    fn fail(&self, e: MembershipError) {
        if e.is_benign_disconnect() {
            debug!("{self} closed: {e}");
        } else if e.is_protocol_fatal() {
            self.reactor.stats().protocol_errors.inc();
            warn!("{self} protocol violation: {e}");
        } else {
            warn!("{self} failed: {e}");
        }
        self.shutdown();
    }

    fn flush(&self, writer: &mut WriterState) -> Result<()> {
        let before = writer.frames.queued();
        let mut stream = &self.stream;
        let status = writer.frames.write_ready(&mut stream)?;
        let written = before.saturating_sub(writer.frames.queued());
        self.reactor
            .stats()
            .frames_written
            .add(u64::try_from(written).unwrap_or(u64::MAX));
        match status {
            WriteStatus::Drained => Ok(()),
            WriteStatus::WouldBlock => {
                writer.watching = true;
                self.reactor.watch(self.token, Interest::Write)
            }
        }
    }
}

impl fmt::Display for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "link#{}({addr})", self.token),
            None => write!(f, "link#{}", self.token),
        }
    }
}

impl AsFd for FramedConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl ChannelHandler for FramedConnection {
    fn token(&self) -> Token {
        self.token
    }

    fn handle_accept(self: Arc<Self>) {
        if let Err(e) = self.reactor.watch(self.token, Interest::Read) {
            self.fail(e);
        }
    }

    fn handle_read(self: Arc<Self>) {
        if !self.is_open() {
            return;
        }
        let mut frames = Vec::new();
        let status = {
            let mut reader = self.reader.lock();
            let mut stream = &self.stream;
            reader.read_ready(&mut stream, |frame| frames.push(frame.payload))
        };

        let stats = self.reactor.stats();
        stats
            .frames_read
            .add(u64::try_from(frames.len()).unwrap_or(u64::MAX));
        for payload in frames {
            stats
                .bytes_read
                .add(u64::try_from(payload.len()).unwrap_or(u64::MAX));
            self.deliver(payload);
        }

        match status {
            Ok(ReadStatus::WouldBlock) => {
                if let Err(e) = self.reactor.watch(self.token, Interest::Read) {
                    self.fail(e);
                }
            }
            Ok(ReadStatus::Eof) => {
                trace!("{self} reached end of stream");
                self.shutdown();
            }
            Err(e) => self.fail(e),
        }
    }

    fn handle_write(self: Arc<Self>) {
        if !self.is_open() {
            return;
        }
        let result = {
            let mut writer = self.writer.lock();
            writer.watching = false;
            self.flush(&mut writer)
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn close(&self) {
        self.silence();
        self.shutdown();
    }
}

impl IoConnection for FramedConnection {
    fn token(&self) -> Token {
        self.token
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn send(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(MembershipError::ConnectionClosed);
        }
        let len = payload.len();
        let result = {
            let mut writer = self.writer.lock();
            writer.frames.enqueue(payload)?;
            if writer.watching {
                Ok(())
            } else {
                self.flush(&mut writer)
            }
        };
        match result {
            Ok(()) => {
                self.reactor
                    .stats()
                    .bytes_written
                    .add(u64::try_from(len).unwrap_or(u64::MAX));
                Ok(())
            }
            Err(e) => {
                self.fail(e);
                Err(MembershipError::ConnectionClosed)
            }
        }
    }

    fn silence(&self) {
        self.silent.store(true, Ordering::Release);
    }

    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.reactor.deregister(self.token);
        if self.is_silent() {
            return;
        }
        let sink = self.sink.read().clone();
        let token = self.token;
        // never call the sink inline: callers may hold connection locks
        if !self.reactor.dispatch(token, move || sink.closing(token)) {
            debug!("{self} closed after dispatch shut down");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
