//! Peer-to-peer block exchange for content-addressed storage.
//!
//! `blockswap` implements the bitswap wire protocols (`/ipfs/bitswap/1.0.0`,
//! `1.1.0` and `1.2.0`) on top of caller-provided collaborators: a
//! [`BlockStore`], a [`Transport`] and a [`Routing`] implementation. The
//! [`Bitswap`] engine owns the protocol state machines (wantlist fan-out,
//! per-peer ledgers, response scheduling) while a cloneable [`Control`]
//! exposes the `get`/`put`/`unwant` surface to clients.
//!
//! Peers exchange immutable blocks addressed by [`Cid`]. Each node
//! broadcasts the list of blocks it wants, answers the wantlists it
//! receives from its own store and accounts for the bytes moved in either
//! direction per peer.
//!
//! The [`mem`] module ships in-process collaborators for tests and for
//! running the engine without a real network stack.

mod bitswap;
mod config;
mod control;
mod engine;
mod error;
mod ledger;
mod message;
mod msg_queue;
mod prefix;
mod stat;
mod want_manager;
mod wantlist;

pub mod block;
pub mod mem;
pub mod network;

mod pb;

pub use crate::bitswap::Bitswap;
pub use crate::block::{Block, BlockStore};
pub use crate::config::{default_hash_loader, BitswapConfig, HashLoader};
pub use crate::control::Control;
pub use crate::error::{BitswapError, BoxError};
pub use crate::ledger::LedgerSnapshot;
pub use crate::message::{BitswapMessage, BlockPresence, Entry};
pub use crate::network::{
    InboundStream, NegotiatedStream, Network, PeerEvent, PeerInfo, ProtocolId, ProtocolVersion,
    RawStream, Routing, Transport, BS_PROTO_V100, BS_PROTO_V110, BS_PROTO_V120,
};
pub use crate::prefix::Prefix;
pub use crate::stat::Stats;
pub use crate::wantlist::{Priority, WantType, Wantlist, WantlistEntry};

pub use cid::Cid;
pub use libp2p_identity::PeerId;

/// Largest frame accepted on a bitswap stream.
const MAX_BUF_SIZE: usize = 524_288;
