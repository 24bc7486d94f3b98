use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cid::Cid;
use futures::channel::{mpsc, oneshot};
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{SinkExt, StreamExt};
use libp2p_identity::PeerId;

use crate::bitswap::ControlCommand;
use crate::block::Block;
use crate::error::BitswapError;
use crate::ledger::LedgerSnapshot;
use crate::stat::Stats;
use crate::wantlist::Priority;

type Result<T> = std::result::Result<T, BitswapError>;

/// Client handle to a running [`Bitswap`](crate::Bitswap) engine.
#[derive(Clone)]
pub struct Control {
    tx: mpsc::UnboundedSender<ControlCommand>,
    started: Arc<AtomicBool>,
}

/// Releases a `get` registration when the caller goes away before the
/// block arrives.
struct CancelGuard {
    cid: Option<Cid>,
    waiter: u64,
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl CancelGuard {
    fn disarm(mut self) {
        self.cid = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(cid) = self.cid.take() {
            let _ = self.tx.unbounded_send(ControlCommand::CancelWaiter(cid, self.waiter));
        }
    }
}

impl Control {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlCommand>, started: Arc<AtomicBool>) -> Self {
        Control { tx, started }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BitswapError::NotStarted)
        }
    }

    /// Returns the block from the local store, or fetches it from the
    /// network, resolving together with every other getter of the same cid.
    ///
    /// Dropping the returned future releases this getter; the want is
    /// retracted from the network once the last getter is gone.
    pub async fn get(&mut self, cid: Cid) -> Result<Block> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::WantBlock(cid, tx)).await?;
        let ticket = rx.await?;
        let guard = CancelGuard {
            cid: Some(ticket.cid),
            waiter: ticket.waiter,
            tx: self.tx.clone(),
        };
        let res = ticket.rx.await.map_err(|_| BitswapError::Closing)?;
        guard.disarm();
        res
    }

    /// Requests many blocks at once; the stream yields each one as it
    /// arrives, in no particular order.
    pub fn get_many(&self, cids: Vec<Cid>) -> BoxStream<'static, Result<Block>> {
        let gets: FuturesUnordered<_> = cids
            .into_iter()
            .map(|cid| {
                let mut control = self.clone();
                async move { control.get(cid).await }
            })
            .collect();
        gets.boxed()
    }

    /// Stores the block locally, wakes every pending getter of it and
    /// announces it to the network.
    pub async fn put(&mut self, block: Block) -> Result<()> {
        self.put_many(vec![block]).await
    }

    pub async fn put_many(&mut self, blocks: Vec<Block>) -> Result<()> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::PutBlocks(blocks, tx)).await?;
        rx.await?
    }

    /// Fails every pending `get` of the cid with [`BitswapError::Unwanted`]
    /// and retracts the want from the network regardless of how many
    /// getters held it.
    pub async fn unwant(&mut self, cid: Cid) -> Result<()> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Unwant(cid, tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Our wantlist when `peer` is `None`, otherwise what that peer has
    /// asked us for.
    pub async fn wantlist(&mut self, peer: Option<PeerId>) -> Result<Vec<(Cid, Priority)>> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::WantList(peer, tx)).await?;
        Ok(rx.await?)
    }

    /// Accounting for one peer; `None` when we never exchanged with it.
    pub async fn ledger(&mut self, peer: PeerId) -> Result<Option<LedgerSnapshot>> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::PeerLedger(peer, tx)).await?;
        Ok(rx.await?)
    }

    /// The currently connected peers.
    pub async fn peers(&mut self) -> Result<Vec<PeerId>> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Peers(tx)).await?;
        Ok(rx.await?)
    }

    /// Aggregated transfer statistics.
    pub async fn stats(&mut self) -> Result<Stats> {
        self.ensure_started()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Stats(tx)).await?;
        Ok(rx.await?)
    }

    /// Stops the engine: pending getters fail, network handlers are
    /// removed, the block store is left untouched.
    pub async fn stop(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Stop(tx)).await?;
        rx.await?;
        Ok(())
    }
}
