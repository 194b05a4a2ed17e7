//! Datagram layout of the gossip protocol.
//!
//! ```text
//! [magic: i32-be][type: u8][body]
//!
//! GOSSIP, REPLY:  [count: i32-be][digest; count]   (digest = identity | time:i64-be)
//! UPDATE:         [heartbeat in wire form]
//! CONNECT_TO:     [identity]
//! ```
//!
//! Digest lists are split so no datagram exceeds [`MAX_SEGMENT_SIZE`].  A
//! datagram with a foreign magic number is rejected as a whole; a bad
//! digest inside an otherwise valid datagram is skipped and counted.

use {
    crate::{
        error::{MembershipError, Result},
        heartbeat::{Digest, Heartbeat, DIGEST_SIZE},
        identity::{Identity, IDENTITY_SIZE},
        wire::{decode_heartbeat, encode_heartbeat, WireSecurity},
    },
    log::trace,
};

/// Largest datagram sent; fits an Ethernet frame.
pub const MAX_SEGMENT_SIZE: usize = 1500;

/// Digests carried by one `GOSSIP` or `REPLY` datagram.
pub const MAX_DIGESTS_PER_PACKET: usize = (MAX_SEGMENT_SIZE - 8) / DIGEST_SIZE;

const HEADER_SIZE: usize = 5;
const COUNT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Gossip = 1,
    Reply = 2,
    Update = 3,
    ConnectTo = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = MembershipError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Gossip),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Update),
            4 => Ok(Self::ConnectTo),
            other => Err(MembershipError::MalformedGossip(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    /// Digests of everything the sender knows.
    Gossip(Vec<Digest>),
    /// Digests the sender is behind on.
    Reply(Vec<Digest>),
    /// Full state of one node.
    Update(Heartbeat),
    /// The named node asks the receiver to open a message link to it.
    ConnectTo(Identity),
}

/// A decoded datagram and how many of its records were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub message: GossipMessage,
    pub malformed: usize,
}

fn header(magic: i32, kind: MessageType, capacity: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(capacity);
    buf.extend_from_slice(&magic.to_be_bytes());
    buf.push(kind as u8);
    buf
}

/// Encode `digests` as one or more datagrams of type `kind`.
pub fn encode_digests(magic: i32, kind: MessageType, digests: &[Digest]) -> Vec<Vec<u8>> {
    if digests.is_empty() {
        let mut buf = header(magic, kind, HEADER_SIZE + COUNT_SIZE);
        buf.extend_from_slice(&0i32.to_be_bytes());
        return vec![buf];
    }
    digests
        .chunks(MAX_DIGESTS_PER_PACKET)
        .map(|chunk| {
            let mut buf = header(
                magic,
                kind,
                chunk
                    .len()
                    .saturating_mul(DIGEST_SIZE)
                    .saturating_add(HEADER_SIZE + COUNT_SIZE),
            );
            // a chunk never exceeds MAX_DIGESTS_PER_PACKET
            let count = i32::try_from(chunk.len()).unwrap_or(i32::MAX);
            buf.extend_from_slice(&count.to_be_bytes());
            for digest in chunk {
                digest.write_to(&mut buf);
            }
            buf
        })
        .collect()
}

/// One `UPDATE` datagram carrying `heartbeat` through `security`.
pub fn encode_update(magic: i32, heartbeat: &Heartbeat, security: &dyn WireSecurity) -> Result<Vec<u8>> {
    let body = encode_heartbeat(heartbeat, security)?;
    let mut buf = header(magic, MessageType::Update, HEADER_SIZE.saturating_add(body.len()));
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// A `CONNECT_TO` asking the receiver to open a link to `identity`.
pub fn encode_connect_to(magic: i32, identity: &Identity) -> Vec<u8> {
    let mut buf = header(magic, MessageType::ConnectTo, HEADER_SIZE + IDENTITY_SIZE);
    identity.write_to(&mut buf);
    buf
}

/// Decode one datagram.  Fails with `BadMagic` on foreign traffic and with
/// `MalformedGossip` or `Serialization` when the datagram as a whole is
/// unusable.
pub fn decode(magic: i32, datagram: &[u8], security: &dyn WireSecurity) -> Result<Packet> {
    let Some((head, body)) = datagram.split_at_checked(HEADER_SIZE) else {
        return Err(MembershipError::MalformedGossip(format!(
            "datagram of {} bytes",
            datagram.len()
        )));
    };
    let mut word = [0u8; 4];
    word.copy_from_slice(&head[..4]);
    let found = i32::from_be_bytes(word);
    if found != magic {
        return Err(MembershipError::BadMagic {
            expected: magic,
            found,
        });
    }
    match MessageType::try_from(head[4])? {
        MessageType::Gossip => {
            let (digests, malformed) = decode_digests(magic, body)?;
            Ok(Packet {
                message: GossipMessage::Gossip(digests),
                malformed,
            })
        }
        MessageType::Reply => {
            let (digests, malformed) = decode_digests(magic, body)?;
            Ok(Packet {
                message: GossipMessage::Reply(digests),
                malformed,
            })
        }
        MessageType::Update => {
            let heartbeat = decode_heartbeat(body.to_vec(), security)?;
            if heartbeat.sender.magic() != magic {
                return Err(MembershipError::MalformedGossip(format!(
                    "update for foreign node {}",
                    heartbeat.sender
                )));
            }
            Ok(Packet {
                message: GossipMessage::Update(heartbeat),
                malformed: 0,
            })
        }
        MessageType::ConnectTo => Ok(Packet {
            message: GossipMessage::ConnectTo(Identity::read_from(body)?),
            malformed: 0,
        }),
    }
}

fn decode_digests(magic: i32, body: &[u8]) -> Result<(Vec<Digest>, usize)> {
    let Some((count, records)) = body.split_at_checked(COUNT_SIZE) else {
        return Err(MembershipError::MalformedGossip(
            "missing digest count".to_string(),
        ));
    };
    let mut word = [0u8; 4];
    word.copy_from_slice(count);
    let announced = usize::try_from(i32::from_be_bytes(word)).map_err(|_| {
        MembershipError::MalformedGossip("negative digest count".to_string())
    })?;
    let present = records.len() / DIGEST_SIZE;
    let mut malformed = announced.saturating_sub(present);
    let mut digests = Vec::with_capacity(announced.min(present));
    for record in records.chunks_exact(DIGEST_SIZE).take(announced) {
        match Digest::read_from(record) {
            Ok(digest) if digest.identity.magic() == magic => digests.push(digest),
            Ok(digest) => {
                trace!("skipping digest of foreign node {}", digest.identity);
                malformed = malformed.saturating_add(1);
            }
            Err(e) => {
                trace!("skipping malformed digest: {e}");
                malformed = malformed.saturating_add(1);
            }
        }
    }
    Ok((digests, malformed))
}
