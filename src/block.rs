use async_trait::async_trait;
use cid::Cid;

use crate::error::BoxError;

/// A content-addressed block: a [`Cid`] and the bytes it names.
///
/// Note: equality is based on [`Cid`] equality; the engine trusts the store
/// to only hand out data matching its cid.
#[derive(Clone, Debug)]
pub struct Block {
    /// The content identifier for this block
    pub cid: Cid,
    /// The data of this block
    pub data: Box<[u8]>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.cid.hash() == other.cid.hash()
    }
}

impl Eq for Block {}

impl Block {
    pub fn new(data: Box<[u8]>, cid: Cid) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.into()
    }
}

/// Block store contract consumed by the exchange.
///
/// `get` returning `Ok(None)` means the block is simply absent; the engine
/// reacts by wanting it from the network. Writers are serialized by the
/// store itself.
#[async_trait]
pub trait BlockStore: Clone + Send + Sync + Unpin + 'static {
    /// Returns whether a block is present in the blockstore.
    async fn has(&self, cid: &Cid) -> Result<bool, BoxError>;
    /// Returns a block from the blockstore.
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, BoxError>;
    /// Inserts a block in the blockstore.
    async fn put(&self, block: Block) -> Result<(), BoxError>;
    /// Inserts a batch of blocks in the blockstore.
    async fn put_many(&self, blocks: Vec<Block>) -> Result<(), BoxError>;
}
