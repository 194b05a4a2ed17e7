//! Configuration for the membership layer.

use {
    crate::framing::FrameFormat,
    log::warn,
    socket2::{SockRef, Socket},
    std::{
        io,
        net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
        time::Duration,
    },
};

/// Cluster magic used when none is configured.
pub const DEFAULT_CLUSTER_MAGIC: i32 = 0x7472_7631;

/// Listen backlog used when [`SocketOptions::backlog`] is unset.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Per-node configuration of gossip, heartbeats and message links.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Cluster magic.  Nodes and datagrams with another magic are ignored.
    pub magic: i32,

    /// UDP address the gossip service binds.
    /// Default: `0.0.0.0:8950`
    pub gossip_addr: SocketAddr,

    /// TCP address message links are accepted on.
    /// Default: `0.0.0.0:8951`
    pub connection_addr: SocketAddr,

    /// IP put in heartbeats when the bind address is unspecified.
    pub advertised_ip: Option<IpAddr>,

    /// Gossip addresses contacted while no peer is known.
    pub seeds: Vec<SocketAddr>,

    /// Period of the timer: heartbeat, close checks and one gossip round.
    pub heartbeat_interval: Duration,

    /// Silence after which a node is evicted from the view.
    pub expire_period: Duration,

    /// Time without membership change before the view is stable.
    pub stability_period: Duration,

    /// How long an initiator waits for the echoed close.
    pub close_timeout: Duration,

    /// Upper bound on one reactor poll.
    pub poll_timeout: Duration,

    /// Outbound TCP connects not finished by then fail with `TimedOut`.
    pub connect_timeout: Duration,

    /// Read timeout of the gossip receive thread; bounds shutdown latency.
    pub gossip_receive_timeout: Duration,

    /// Threads running read/write/accept/connect callbacks.
    pub comms_threads: usize,

    /// Lanes delivering decoded messages upward.
    pub dispatch_threads: usize,

    /// Threads decoding gossip datagrams.
    pub gossip_threads: usize,

    /// Largest framed payload accepted or sent.
    pub max_frame_size: usize,

    /// Frame header layout on message links.
    pub frame_format: FrameFormat,

    pub socket_options: SocketOptions,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_CLUSTER_MAGIC,
            gossip_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8950)),
            connection_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8951)),
            advertised_ip: None,
            seeds: Vec::new(),
            heartbeat_interval: Duration::from_millis(500),
            expire_period: Duration::from_secs(5),
            stability_period: Duration::from_secs(3),
            close_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(3),
            gossip_receive_timeout: Duration::from_millis(200),
            comms_threads: 4,
            dispatch_threads: 4,
            gossip_threads: 2,
            max_frame_size: 1_048_576, // 1 MB
            frame_format: FrameFormat::Sequenced,
            socket_options: SocketOptions::default(),
        }
    }
}

impl MembershipConfig {
    /// Loopback, ephemeral ports and short timers for local testing.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            gossip_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            connection_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            heartbeat_interval: Duration::from_millis(50),
            expire_period: Duration::from_millis(1_000),
            stability_period: Duration::from_millis(300),
            close_timeout: Duration::from_millis(500),
            poll_timeout: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(1_000),
            gossip_receive_timeout: Duration::from_millis(20),
            comms_threads: 2,
            dispatch_threads: 2,
            gossip_threads: 1,
            ..Self::default()
        }
    }

    /// The address peers should use to reach `bound`.
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        if !bound.ip().is_unspecified() {
            return bound;
        }
        let ip = self
            .advertised_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, bound.port())
    }
}

/// Socket options applied best-effort to every link socket.  `None`
/// leaves the operating system default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub no_delay: Option<bool>,
    pub keep_alive: Option<bool>,
    pub linger: Option<Duration>,
    /// Read and write timeout; only affects blocking use of a stream.
    pub timeout: Option<Duration>,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub backlog: Option<i32>,
    pub reuse_address: Option<bool>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: Some(true),
            keep_alive: Some(true),
            linger: None,
            timeout: None,
            send_buffer_size: None,
            receive_buffer_size: None,
            backlog: None,
            reuse_address: Some(true),
        }
    }
}

impl SocketOptions {
    pub fn backlog(&self) -> i32 {
        self.backlog.unwrap_or(DEFAULT_BACKLOG)
    }

    /// Apply stream options to an accepted or connected socket.
    pub fn apply_to_stream(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);
        if let Some(no_delay) = self.no_delay {
            report("no_delay", stream.set_nodelay(no_delay));
        }
        if let Some(keep_alive) = self.keep_alive {
            report("keep_alive", sock.set_keepalive(keep_alive));
        }
        if let Some(linger) = self.linger {
            report("linger", sock.set_linger(Some(linger)));
        }
        if let Some(timeout) = self.timeout {
            report("read_timeout", stream.set_read_timeout(Some(timeout)));
            report("write_timeout", stream.set_write_timeout(Some(timeout)));
        }
        self.apply_buffer_sizes(&sock);
    }

    /// Apply options that must be set before `bind`.
    pub fn apply_to_listener(&self, socket: &Socket) {
        if let Some(reuse) = self.reuse_address {
            report("reuse_address", socket.set_reuse_address(reuse));
        }
        self.apply_buffer_sizes(&SockRef::from(socket));
    }

    fn apply_buffer_sizes(&self, sock: &SockRef<'_>) {
        if let Some(size) = self.send_buffer_size {
            report("send_buffer_size", sock.set_send_buffer_size(size));
        }
        if let Some(size) = self.receive_buffer_size {
            report("receive_buffer_size", sock.set_recv_buffer_size(size));
        }
    }
}

fn report(option: &str, result: io::Result<()>) {
    if let Err(e) = result {
        warn!("failed to set socket option {option}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::net::TcpListener};

    #[test]
    fn test_advertised_address() {
        let mut config = MembershipConfig::dev_default();
        let bound = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 4000));
        assert_eq!(
            config.advertised(bound),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 4000))
        );
        config.advertised_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(
            config.advertised(bound),
            SocketAddr::from((Ipv4Addr::new(10, 0, 0, 7), 4000))
        );
        let concrete = SocketAddr::from((Ipv4Addr::LOCALHOST, 4001));
        assert_eq!(config.advertised(concrete), concrete);
    }

    #[test]
    fn test_options_applied_to_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let options = SocketOptions {
            linger: Some(Duration::from_secs(1)),
            timeout: Some(Duration::from_millis(250)),
            ..SocketOptions::default()
        };
        options.apply_to_stream(&stream);
        assert!(stream.nodelay().unwrap());
        assert_eq!(
            stream.read_timeout().unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(options.backlog(), DEFAULT_BACKLOG);
    }
}
