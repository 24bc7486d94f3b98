use std::collections::HashMap;

use cid::Cid;

/// Priority of a want; higher priorities are served first. Carried on the
/// wire as `int32`.
pub type Priority = i32;

/// Whether the requester wants the block bytes or only a presence answer.
///
/// The legacy 1.0.0 protocol knows only [`WantType::Block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WantType {
    /// Send me the block.
    Block,
    /// Tell me whether you have the block.
    Have,
}

/// A single wantlist slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WantlistEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub send_dont_have: bool,
    ref_count: u32,
    seq: u64,
}

impl WantlistEntry {
    /// How many independent holders currently reference this entry.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Reference-counted set of wants, keyed by cid.
#[derive(Debug, Default)]
pub struct Wantlist {
    set: HashMap<Cid, WantlistEntry>,
    next_seq: u64,
}

impl Wantlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a want, or bumps the reference count of an existing one.
    /// Returns `true` when the cid was not yet wanted.
    ///
    /// Re-adding refreshes the priority, upgrades a `Have` want to a
    /// `Block` want and keeps `send_dont_have` once any holder asked for it.
    pub fn add(&mut self, cid: Cid, priority: Priority, want_type: WantType, send_dont_have: bool) -> bool {
        match self.set.get_mut(&cid) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.priority = priority;
                entry.send_dont_have |= send_dont_have;
                if entry.want_type == WantType::Have && want_type == WantType::Block {
                    entry.want_type = WantType::Block;
                }
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.set.insert(
                    cid.clone(),
                    WantlistEntry {
                        cid,
                        priority,
                        want_type,
                        send_dont_have,
                        ref_count: 1,
                        seq,
                    },
                );
                true
            }
        }
    }

    /// Drops one reference; the entry goes away with the last one.
    /// Returns `true` when the entry was removed.
    pub fn remove(&mut self, cid: &Cid) -> bool {
        match self.set.get_mut(cid) {
            Some(entry) if entry.ref_count > 1 => {
                entry.ref_count -= 1;
                false
            }
            Some(_) => {
                self.set.remove(cid);
                true
            }
            None => false,
        }
    }

    /// Unconditionally forgets the cid, whatever its reference count.
    /// Returns `true` when an entry existed.
    pub fn remove_force(&mut self, cid: &Cid) -> bool {
        self.set.remove(cid).is_some()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.set.contains_key(cid)
    }

    pub fn get(&self, cid: &Cid) -> Option<&WantlistEntry> {
        self.set.get(cid)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WantlistEntry> {
        self.set.values()
    }

    /// Entries in canonical byte order of their cids. Two peers holding the
    /// same wants produce the same sequence.
    pub fn sorted_entries(&self) -> Vec<WantlistEntry> {
        let mut entries: Vec<_> = self.set.values().cloned().collect();
        entries.sort_by_cached_key(|e| e.cid.to_bytes());
        entries
    }

    /// Entries ordered for serving: highest priority first, insertion order
    /// breaking ties.
    pub(crate) fn serve_order(&self) -> Vec<WantlistEntry> {
        let mut entries: Vec<_> = self.set.values().cloned().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    fn cid(data: &[u8]) -> Cid {
        Cid::new_v1(0x55, Code::Sha2_256.digest(data))
    }

    #[test]
    fn add_is_reference_counted() {
        let mut wl = Wantlist::new();
        let c = cid(b"a");

        assert!(wl.add(c.clone(), 1, WantType::Block, false));
        assert!(!wl.add(c.clone(), 1, WantType::Block, false));
        assert_eq!(wl.get(&c).unwrap().ref_count(), 2);

        assert!(!wl.remove(&c));
        assert!(wl.contains(&c));
        assert!(wl.remove(&c));
        assert!(!wl.contains(&c));
    }

    #[test]
    fn remove_force_ignores_references() {
        let mut wl = Wantlist::new();
        let c = cid(b"a");
        wl.add(c.clone(), 1, WantType::Block, false);
        wl.add(c.clone(), 1, WantType::Block, false);

        assert!(wl.remove_force(&c));
        assert!(wl.is_empty());
        assert!(!wl.remove_force(&c));
    }

    #[test]
    fn have_want_is_upgraded_to_block() {
        let mut wl = Wantlist::new();
        let c = cid(b"a");
        wl.add(c.clone(), 1, WantType::Have, true);
        wl.add(c.clone(), 5, WantType::Block, false);

        let entry = wl.get(&c).unwrap();
        assert_eq!(entry.want_type, WantType::Block);
        assert_eq!(entry.priority, 5);
        assert!(entry.send_dont_have);
    }

    #[test]
    fn sorted_entries_is_deterministic() {
        let cids: Vec<Cid> = (0u8..16).map(|i| cid(&[i])).collect();

        let mut forward = Wantlist::new();
        for c in &cids {
            forward.add(c.clone(), 1, WantType::Block, false);
        }
        let mut backward = Wantlist::new();
        for c in cids.iter().rev() {
            backward.add(c.clone(), 1, WantType::Block, false);
        }

        let a: Vec<Cid> = forward.sorted_entries().into_iter().map(|e| e.cid).collect();
        let b: Vec<Cid> = backward.sorted_entries().into_iter().map(|e| e.cid).collect();
        assert_eq!(a, b);

        // the order is the byte-lexicographic order of the canonical form
        let bytes: Vec<Vec<u8>> = a.iter().map(|c| c.to_bytes()).collect();
        let mut sorted = bytes.clone();
        sorted.sort();
        assert_eq!(bytes, sorted);
    }

    #[test]
    fn serve_order_ranks_priority_then_insertion() {
        let mut wl = Wantlist::new();
        let low = cid(b"low");
        let first = cid(b"first");
        let second = cid(b"second");
        wl.add(low.clone(), 1, WantType::Block, false);
        wl.add(first.clone(), 10, WantType::Block, false);
        wl.add(second.clone(), 10, WantType::Block, false);

        let order: Vec<Cid> = wl.serve_order().into_iter().map(|e| e.cid).collect();
        assert_eq!(order, vec![first, second, low]);
    }
}
