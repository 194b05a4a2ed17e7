//! Heartbeats, digests and per-node liveness records.
//!
//! A [`Heartbeat`] is the full liveness state a node advertises: who it is,
//! where to reach it, its logical time, its view of the cluster, its
//! candidate and the set of peers it wants ordered message links with.
//! A [`Digest`] is the fixed-size summary exchanged by gossip to find out
//! who is behind without shipping whole heartbeats.

use {
    crate::{
        error::{MembershipError, Result},
        identity::{Identity, IDENTITY_SIZE},
        node_id_set::NodeIdSet,
        view::View,
    },
    serde::{Deserialize, Serialize},
    std::{
        net::SocketAddr,
        time::{Duration, Instant},
    },
};

/// Encoded size of a digest: identity followed by `time:i64`.
pub const DIGEST_SIZE: usize = IDENTITY_SIZE + 8;

/// Version of a heartbeat: incarnation first, then logical time.
pub type Version = (i64, i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Identity of the node that produced the heartbeat.
    pub sender: Identity,
    /// UDP address the sender gossips on.
    pub gossip_addr: SocketAddr,
    /// TCP address the sender accepts message links on.
    pub connection_addr: SocketAddr,
    /// Logical time, strictly increasing per incarnation.
    pub time: i64,
    /// The sender's view of the cluster.
    pub view: View,
    /// The node the sender currently backs.
    pub candidate: Identity,
    /// Peers the sender wants an ordered message link with.
    pub msg_links: NodeIdSet,
}

impl Heartbeat {
    pub fn new(sender: Identity, gossip_addr: SocketAddr, connection_addr: SocketAddr) -> Self {
        Self {
            sender,
            gossip_addr,
            connection_addr,
            time: 0,
            view: View::default(),
            candidate: sender,
            msg_links: NodeIdSet::new(),
        }
    }

    pub fn version(&self) -> Version {
        (self.sender.epoch(), self.time)
    }

    pub fn digest(&self) -> Digest {
        Digest {
            identity: self.sender,
            time: self.time,
        }
    }

    /// Same node and a strictly later version.
    pub fn is_newer_than(&self, other: &Heartbeat) -> bool {
        self.sender == other.sender && self.version() > other.version()
    }

    pub fn wants_link_to(&self, id: u16) -> bool {
        self.msg_links.contains(id)
    }
}

/// Compact summary of the latest heartbeat known for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    pub identity: Identity,
    pub time: i64,
}

impl Digest {
    pub fn version(&self) -> Version {
        (self.identity.epoch(), self.time)
    }

    /// A digest asking for any state of `identity`'s node.
    pub fn request(identity: Identity) -> Self {
        Self {
            identity,
            time: i64::MIN,
        }
    }

    pub fn is_newer_than(&self, other: &Digest) -> bool {
        self.identity == other.identity && self.version() > other.version()
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        self.identity.write_to(buf);
        buf.extend_from_slice(&self.time.to_be_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..DIGEST_SIZE) else {
            return Err(MembershipError::MalformedGossip(format!(
                "digest needs {DIGEST_SIZE} bytes, got {}",
                bytes.len()
            )));
        };
        let identity = Identity::read_from(bytes)?;
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[IDENTITY_SIZE..DIGEST_SIZE]);
        Ok(Self {
            identity,
            time: i64::from_be_bytes(time),
        })
    }
}

/// Latest heartbeat seen for a node and when it arrived.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    heartbeat: Heartbeat,
    last_received: Instant,
}

impl HeartbeatState {
    pub fn new(heartbeat: Heartbeat) -> Self {
        Self {
            heartbeat,
            last_received: Instant::now(),
        }
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Accept `heartbeat` only if it is strictly newer than the one held.
    pub fn update(&mut self, heartbeat: &Heartbeat) -> bool {
        if !heartbeat.is_newer_than(&self.heartbeat) {
            return false;
        }
        self.heartbeat = heartbeat.clone();
        self.last_received = Instant::now();
        true
    }

    pub fn is_expired(&self, expire_period: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) > expire_period
    }
}
