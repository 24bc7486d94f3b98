use std::collections::HashMap;
use std::time::Duration;

use cid::Cid;
use futures::channel::mpsc;
use libp2p_identity::PeerId;
use tracing::{debug, trace};

use crate::message::BitswapMessage;
use crate::msg_queue::{self, QueueOp, QueuedEntry};
use crate::network::Network;
use crate::wantlist::{Priority, WantType, Wantlist};

struct PeerQueue {
    tx: mpsc::UnboundedSender<QueueOp>,
    /// How many registrations currently keep this peer alive.
    refcnt: usize,
}

/// Tracks what this node wants and fans wantlist updates out to every known
/// peer through its message queue.
pub(crate) struct WantManager {
    wantlist: Wantlist,
    peers: HashMap<PeerId, PeerQueue>,
    network: Network,
    debounce: Duration,
}

impl WantManager {
    pub fn new(network: Network, debounce: Duration) -> Self {
        WantManager {
            wantlist: Wantlist::new(),
            peers: HashMap::new(),
            network,
            debounce,
        }
    }

    pub fn wantlist(&self) -> &Wantlist {
        &self.wantlist
    }

    /// Adds wants and queues the new entries to all connected peers. Repeat
    /// wants are reference counted locally and cause no fan-out.
    pub fn want_blocks(&mut self, cids: &[Cid], priority: Priority, want_type: WantType) {
        let mut fresh = Vec::new();
        for cid in cids {
            if self.wantlist.add(cid.clone(), priority, want_type, false) {
                fresh.push(QueuedEntry {
                    cid: cid.clone(),
                    priority,
                    want_type,
                    cancel: false,
                });
            }
        }
        if fresh.is_empty() {
            return;
        }
        trace!("broadcasting {} new wants to {} peers", fresh.len(), self.peers.len());
        self.broadcast(fresh);
    }

    /// Releases one reference per cid; a cancel goes out when the last
    /// reference is gone. `force` drops entries regardless of refcount.
    pub fn cancel_wants(&mut self, cids: &[Cid], force: bool) {
        let mut cancels = Vec::new();
        for cid in cids {
            let removed = if force {
                self.wantlist.remove_force(cid)
            } else {
                self.wantlist.remove(cid)
            };
            if removed {
                cancels.push(QueuedEntry {
                    cid: cid.clone(),
                    priority: 0,
                    want_type: WantType::Block,
                    cancel: true,
                });
            }
        }
        if cancels.is_empty() {
            return;
        }
        trace!("broadcasting {} cancels to {} peers", cancels.len(), self.peers.len());
        self.broadcast(cancels);
    }

    fn broadcast(&mut self, entries: Vec<QueuedEntry>) {
        for (peer, queue) in &self.peers {
            if queue.tx.unbounded_send(QueueOp::AddEntries(entries.clone())).is_err() {
                debug!("message queue for {} is gone", peer);
            }
        }
    }

    /// Registers the peer, creating its queue on first reference, and
    /// introduces ourselves with our full wantlist.
    pub fn connected(&mut self, peer: PeerId) {
        let network = self.network.clone();
        let debounce = self.debounce;
        let queue = self.peers.entry(peer).or_insert_with(|| PeerQueue {
            tx: msg_queue::spawn(peer, network, debounce),
            refcnt: 0,
        });
        queue.refcnt += 1;
        if queue.refcnt == 1 && !self.wantlist.is_empty() {
            let mut msg = BitswapMessage::new(true);
            for entry in self.wantlist.sorted_entries() {
                msg.add_entry(entry.cid, entry.priority, entry.want_type, false);
            }
            let _ = queue.tx.unbounded_send(QueueOp::AddMessage(msg));
        }
    }

    /// Releases one reference; the queue is dropped with the last one.
    pub fn disconnected(&mut self, peer: &PeerId) {
        if let Some(queue) = self.peers.get_mut(peer) {
            queue.refcnt = queue.refcnt.saturating_sub(1);
            if queue.refcnt == 0 {
                self.peers.remove(peer);
            }
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Drops every queue; their tasks flush and stop as the channels close.
    pub fn stop(&mut self) {
        self.peers.clear();
    }
}
