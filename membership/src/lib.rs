//! TRv1 Cluster Membership
//!
//! Liveness, membership views and ordered point-to-point messaging for a
//! cluster of up to 2048 nodes:
//!
//! - **Gossip**: UDP anti-entropy spreads every node's heartbeat without
//!   keeping a connection per pair of nodes.
//! - **Message links**: length-prefixed, magic-tagged, sequenced TCP
//!   frames between the peers that want them, opened by the lower node id
//!   and closed again by heartbeat-driven negotiation.
//! - **Reactor**: one poller thread demultiplexes every socket and hands
//!   readiness to worker pools; per-link delivery stays in wire order.
//!
//! ## Architecture
//!
//! ```text
//!  application ── MembershipListener ──┐
//!        │ send / want_link             │ deliver / view_changed
//!  ┌─────▼──────────────────────────────┴─────┐
//!  │  MembershipService (timer thread)        │
//!  └─────┬───────────────────────┬────────────┘
//!        │                       │
//!  ┌─────▼────────┐       ┌──────▼─────────┐
//!  │ConnectionSet │◄──────┤ GossipService  │  UDP
//!  │ per-peer     │ state │ HeartbeatStore │
//!  └─────┬────────┘       └────────────────┘
//!        │ MessageConnection
//!  ┌─────▼─────────────────────────────────────┐
//!  │ FramedConnection ── Reactor (poll + pools) │  TCP
//!  └───────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]          | `MembershipConfig` defaults and dev overrides |
//! | [`identity`]        | Node identity: magic, id, epoch |
//! | [`node_id_set`]     | Growable bit set of node ids |
//! | [`view`]            | Membership view with stability flag |
//! | [`heartbeat`]       | Heartbeats, digests, liveness records |
//! | [`wire`]            | Link message encoding and wire security |
//! | [`framing`]         | Frame reader/writer over non-blocking streams |
//! | [`worker_pool`]     | Named thread pools, shared or keyed |
//! | [`reactor`]         | Poller thread and channel handlers |
//! | [`io_connection`]   | Framed TCP socket handler |
//! | [`connection`]      | Per-peer message link state machine |
//! | [`connection_set`]  | Peer table, handshakes, link intent |
//! | [`gossip_protocol`] | Gossip datagram layout |
//! | [`gossip`]          | Heartbeat store and UDP gossip service |
//! | [`service`]         | `MembershipService` wiring and timer |
//! | [`stats`]           | Reactor and gossip counters |
//! | [`error`]           | Crate-wide error enum |

pub mod config;
pub mod connection;
pub mod connection_set;
pub mod error;
pub mod framing;
pub mod gossip;
pub mod gossip_protocol;
pub mod heartbeat;
pub mod identity;
pub mod io_connection;
pub mod node_id_set;
pub mod reactor;
pub mod service;
pub mod stats;
pub mod view;
pub mod wire;
pub mod worker_pool;

pub use {
    config::MembershipConfig,
    connection_set::MembershipListener,
    error::{MembershipError, Result},
    identity::Identity,
    service::MembershipService,
    view::View,
};
