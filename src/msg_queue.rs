use std::time::Duration;

use cid::Cid;
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p_identity::PeerId;
use tracing::{debug, trace};

use crate::message::BitswapMessage;
use crate::network::Network;
use crate::wantlist::{Priority, WantType};

/// A wantlist change queued for one peer.
#[derive(Clone, Debug)]
pub(crate) struct QueuedEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
}

pub(crate) enum QueueOp {
    /// Entries to coalesce into the next debounced flush.
    AddEntries(Vec<QueuedEntry>),
    /// A pre-built message to send immediately.
    AddMessage(BitswapMessage),
}

/// Outbound aggregator for a single peer.
///
/// Entry updates are debounced: a burst of wants within the quiet window
/// produces one wire message. Sends are strictly sequential, so at most one
/// message is being written to this peer at a time.
struct MsgQueue {
    peer: PeerId,
    network: Network,
    debounce: Duration,
}

/// Spawns the queue task for `peer` and hands back its command channel.
/// Dropping the channel stops the task after a final flush.
pub(crate) fn spawn(peer: PeerId, network: Network, debounce: Duration) -> mpsc::UnboundedSender<QueueOp> {
    let (tx, rx) = mpsc::unbounded();
    let queue = MsgQueue { peer, network, debounce };
    tokio::spawn(queue.run(rx));
    tx
}

impl MsgQueue {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueOp>) {
        let mut pending: Vec<QueuedEntry> = Vec::new();
        loop {
            if pending.is_empty() {
                match rx.next().await {
                    Some(op) => self.apply(op, &mut pending).await,
                    None => break,
                }
            } else {
                match tokio::time::timeout(self.debounce, rx.next()).await {
                    Ok(Some(op)) => self.apply(op, &mut pending).await,
                    Ok(None) => {
                        self.send_entries(&mut pending).await;
                        break;
                    }
                    Err(_) => self.send_entries(&mut pending).await,
                }
            }
        }
        trace!("message queue for {} stopped", self.peer);
    }

    async fn apply(&self, op: QueueOp, pending: &mut Vec<QueuedEntry>) {
        match op {
            QueueOp::AddEntries(mut entries) => pending.append(&mut entries),
            QueueOp::AddMessage(msg) => self.send(msg).await,
        }
    }

    /// Flushes the accumulated entries as one non-full wantlist update.
    /// A cancel queued after a want for the same cid wins.
    async fn send_entries(&self, pending: &mut Vec<QueuedEntry>) {
        if pending.is_empty() {
            return;
        }
        let mut msg = BitswapMessage::new(false);
        for e in pending.drain(..) {
            if e.cancel {
                msg.cancel(e.cid);
            } else {
                msg.add_entry(e.cid, e.priority, e.want_type, false);
            }
        }
        self.send(msg).await;
    }

    /// Best effort: a failed dial or write drops the message.
    async fn send(&self, msg: BitswapMessage) {
        if let Err(e) = self.network.connect_to(&self.peer).await {
            debug!("cannot connect to {}, dropping message: {}", self.peer, e);
            return;
        }
        if let Err(e) = self.network.send_message(&self.peer, &msg).await {
            debug!("failed to send message to {}: {}", self.peer, e);
        }
    }
}
