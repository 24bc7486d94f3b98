use cid::Cid;

use crate::message::Entry;
use crate::wantlist::{Priority, Wantlist};

/// Per-peer byte accounting plus the wantlist that peer has sent us.
///
/// Ledgers are cumulative: they survive disconnects for as long as the
/// engine lives.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Wants the remote currently has open with us.
    pub(crate) wantlist: Wantlist,
    bytes_sent: u64,
    bytes_recv: u64,
    exchange_count: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_bytes(&mut self, n: usize) {
        self.bytes_sent += n as u64;
        self.exchange_count += 1;
    }

    pub fn received_bytes(&mut self, n: usize) {
        self.bytes_recv += n as u64;
        self.exchange_count += 1;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv
    }

    pub fn exchange_count(&self) -> u64 {
        self.exchange_count
    }

    /// How much more we have sent than received; the bias a caller can use
    /// against freeloading peers.
    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv as f64 + 1.0)
    }

    /// Drops the cid from the peer's wantlist, e.g. because the peer sent
    /// us that very block and evidently has it.
    pub fn cancel_want(&mut self, cid: &Cid) {
        self.wantlist.remove_force(cid);
    }

    /// Applies a wantlist update: a full update replaces the stored view, a
    /// partial one only touches the entries it mentions.
    pub fn apply_update<'a>(&mut self, full: bool, entries: impl Iterator<Item = &'a Entry>) {
        if full {
            self.wantlist = Wantlist::new();
        }
        for e in entries {
            if e.cancel {
                self.wantlist.remove_force(&e.cid);
            } else {
                self.wantlist.add(e.cid.clone(), e.priority, e.want_type, e.send_dont_have);
            }
        }
    }

    /// Read-only copy handed out for introspection.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            bytes_sent: self.bytes_sent,
            bytes_recv: self.bytes_recv,
            exchange_count: self.exchange_count,
            debt_ratio: self.debt_ratio(),
            wantlist: self
                .wantlist
                .sorted_entries()
                .into_iter()
                .map(|e| (e.cid, e.priority))
                .collect(),
        }
    }
}

/// Accounting view of one peer at a point in time.
#[derive(Clone, Debug)]
pub struct LedgerSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub exchange_count: u64,
    pub debt_ratio: f64,
    pub wantlist: Vec<(Cid, Priority)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wantlist::WantType;
    use multihash_codetable::{Code, MultihashDigest};

    fn cid(data: &[u8]) -> Cid {
        Cid::new_v1(0x55, Code::Sha2_256.digest(data))
    }

    fn want(data: &[u8]) -> Entry {
        Entry {
            cid: cid(data),
            priority: 1,
            want_type: WantType::Block,
            cancel: false,
            send_dont_have: false,
        }
    }

    fn cancel(data: &[u8]) -> Entry {
        Entry {
            cancel: true,
            ..want(data)
        }
    }

    #[test]
    fn accounting_adds_up() {
        let mut ledger = Ledger::new();
        ledger.sent_bytes(100);
        ledger.sent_bytes(24);
        ledger.received_bytes(7);

        assert_eq!(ledger.bytes_sent(), 124);
        assert_eq!(ledger.bytes_recv(), 7);
        assert_eq!(ledger.exchange_count(), 3);
        assert_eq!(ledger.debt_ratio(), 124.0 / 8.0);
    }

    #[test]
    fn debt_ratio_is_defined_without_receives() {
        let mut ledger = Ledger::new();
        ledger.sent_bytes(10);
        assert_eq!(ledger.debt_ratio(), 10.0);
    }

    #[test]
    fn full_update_replaces_the_view() {
        let mut ledger = Ledger::new();
        let old = [want(b"old-1"), want(b"old-2")];
        ledger.apply_update(false, old.iter());

        let replacement = [want(b"new")];
        ledger.apply_update(true, replacement.iter());

        assert_eq!(ledger.wantlist.len(), 1);
        assert!(ledger.wantlist.contains(&cid(b"new")));
    }

    #[test]
    fn partial_update_keeps_unmentioned_entries() {
        let mut ledger = Ledger::new();
        let initial = [want(b"keep"), want(b"drop")];
        ledger.apply_update(true, initial.iter());

        let delta = [cancel(b"drop"), want(b"add")];
        ledger.apply_update(false, delta.iter());

        assert!(ledger.wantlist.contains(&cid(b"keep")));
        assert!(ledger.wantlist.contains(&cid(b"add")));
        assert!(!ledger.wantlist.contains(&cid(b"drop")));
    }

    #[test]
    fn full_list_then_cancels_leaves_the_difference() {
        let mut ledger = Ledger::new();
        let all: Vec<Entry> = (b'a'..=b'z').map(|c| want(&[c])).collect();
        ledger.apply_update(true, all.iter());

        let vowels: Vec<Entry> = [b'a', b'e', b'i', b'o', b'u'].iter().map(|c| cancel(&[*c])).collect();
        ledger.apply_update(false, vowels.iter());

        assert_eq!(ledger.wantlist.len(), 21);
        for c in b'a'..=b'z' {
            let expected = ![b'a', b'e', b'i', b'o', b'u'].contains(&c);
            assert_eq!(ledger.wantlist.contains(&cid(&[c])), expected, "letter {}", c as char);
        }
    }
}
