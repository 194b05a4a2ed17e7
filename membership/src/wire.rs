//! Message bodies carried on message links, and the pluggable wire form.
//!
//! Every framed payload is a bincode-encoded [`LinkMessage`] passed through
//! a [`WireSecurity`] implementation.  The security layer may sign or
//! encrypt; this crate treats it as a black box.

use {
    crate::{error::Result, heartbeat::Heartbeat},
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Wraps every link message and gossip `UPDATE` on its way to the wire,
/// e.g. to sign or encrypt it.  Both ends must use the same transform.
pub trait WireSecurity: Send + Sync + fmt::Debug {
    /// Transform an encoded message into the bytes sent on the wire.
    fn to_wire_form(&self, message: Vec<u8>) -> Result<Vec<u8>>;

    /// Reverse [`WireSecurity::to_wire_form`].
    fn from_wire_form(&self, wire: Vec<u8>) -> Result<Vec<u8>>;
}

/// Identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

impl WireSecurity for NoSecurity {
    fn to_wire_form(&self, message: Vec<u8>) -> Result<Vec<u8>> {
        Ok(message)
    }

    fn from_wire_form(&self, wire: Vec<u8>) -> Result<Vec<u8>> {
        Ok(wire)
    }
}

/// One frame's worth of message-link traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkMessage {
    /// Periodic liveness; also the mandatory first message on a link.
    Heartbeat(Heartbeat),
    /// Close negotiation, sent by the initiator and echoed by the peer.
    Close(Heartbeat),
    /// Application payload.
    Payload(Vec<u8>),
}

impl LinkMessage {
    pub fn encode(&self, security: &dyn WireSecurity) -> Result<Vec<u8>> {
        security.to_wire_form(bincode::serialize(self)?)
    }

    pub fn decode(wire: Vec<u8>, security: &dyn WireSecurity) -> Result<Self> {
        let bytes = security.from_wire_form(wire)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Heartbeat-shaped messages may open a link.
    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        match self {
            Self::Heartbeat(hb) | Self::Close(hb) => Some(hb),
            Self::Payload(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::Close(_) => "close",
            Self::Payload(_) => "payload",
        }
    }
}

/// Encode a heartbeat for a gossip `UPDATE`.
pub fn encode_heartbeat(heartbeat: &Heartbeat, security: &dyn WireSecurity) -> Result<Vec<u8>> {
    security.to_wire_form(bincode::serialize(heartbeat)?)
}

pub fn decode_heartbeat(wire: Vec<u8>, security: &dyn WireSecurity) -> Result<Heartbeat> {
    let bytes = security.from_wire_form(wire)?;
    Ok(bincode::deserialize(&bytes)?)
}
