use cid::Cid;
use futures::channel::{mpsc, oneshot};
use libp2p_identity::PeerId;
use thiserror::Error;

/// Error type of the external collaborator traits ([`crate::BlockStore`],
/// [`crate::Transport`], [`crate::Routing`]).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BitswapError {
    /// An API was called before `start()` or after `stop()`.
    #[error("bitswap is not started")]
    NotStarted,
    #[error("block {0} not found")]
    NotFound(Cid),
    /// The pending `get` was retracted by `unwant`.
    #[error("want for {0} was cancelled")]
    Unwanted(Cid),
    #[error("dialing {peer} failed: {error}")]
    Dial { peer: PeerId, error: String },
    #[error("routing: {0}")]
    Routing(String),
    #[error("block store: {0}")]
    Store(String),
    #[error("error while decoding bitswap message: {0}")]
    Format(#[from] prost::DecodeError),
    #[error("error while parsing cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("error while parsing multihash: {0}")]
    Multihash(#[from] multihash::Error),
    #[error("error while parsing varint: {0}")]
    Varint(#[from] unsigned_varint::decode::Error),
    #[error("no registered hasher for multihash code {0:#x}")]
    UnsupportedHash(u64),
    #[error("block bytes do not match their cid prefix")]
    CidMismatch,
    #[error("inbound stream idle for too long")]
    Timeout,
    #[error("frame of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("length prefix: {0}")]
    LengthPrefix(#[from] unsigned_varint::io::ReadError),
    #[error("bitswap is closing")]
    Closing,
    #[error("error sending {0}")]
    Send(#[from] mpsc::SendError),
    #[error("cancelled oneshot {0}")]
    Cancel(#[from] oneshot::Canceled),
}
