use std::collections::HashMap;

use cid::Cid;
use multihash::Multihash;
use prost::Message as _;

use crate::block::Block;
use crate::config::HashLoader;
use crate::error::BitswapError;
use crate::network::ProtocolVersion;
use crate::pb::bitswap_pb;
use crate::prefix::Prefix;
use crate::wantlist::{Priority, WantType};

/// Multihash code of sha2-256, the digest the legacy protocol assumes.
const SHA2_256: u64 = 0x12;

/// A presence answer for a cid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockPresence {
    Have,
    DontHave,
}

/// One wantlist slot of a wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

/// In-memory form of a bitswap wire message.
///
/// `full` marks the wantlist as a complete replacement of whatever the
/// remote stored for us; otherwise the entries are a delta.
#[derive(Debug, Default, PartialEq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: HashMap<Cid, Entry>,
    blocks: HashMap<Cid, Block>,
    block_presences: HashMap<Cid, BlockPresence>,
    pending_bytes: i32,
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    pub fn full(&self) -> bool {
        self.full
    }

    /// True when the message carries nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.values()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_presences(&self) -> impl Iterator<Item = (&Cid, &BlockPresence)> {
        self.block_presences.iter()
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    pub fn set_pending_bytes(&mut self, n: i32) {
        self.pending_bytes = n;
    }

    /// Adds a want; replaces any queued entry for the same cid.
    pub fn add_entry(&mut self, cid: Cid, priority: Priority, want_type: WantType, send_dont_have: bool) {
        self.wantlist.insert(
            cid.clone(),
            Entry {
                cid,
                priority,
                want_type,
                cancel: false,
                send_dont_have,
            },
        );
    }

    /// Retracts a want; replaces any queued entry for the same cid.
    pub fn cancel(&mut self, cid: Cid) {
        self.wantlist.insert(
            cid.clone(),
            Entry {
                cid,
                priority: 0,
                want_type: WantType::Block,
                cancel: true,
                send_dont_have: false,
            },
        );
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(block.cid.clone(), block);
    }

    pub fn add_block_presence(&mut self, cid: Cid, presence: BlockPresence) {
        self.block_presences.insert(cid, presence);
    }

    pub(crate) fn take_blocks(&mut self) -> Vec<Block> {
        self.blocks.drain().map(|(_, block)| block).collect()
    }

    /// Serializes for the negotiated protocol revision.
    pub fn to_bytes(&self, version: ProtocolVersion) -> Vec<u8> {
        match version {
            ProtocolVersion::V100 => self.to_bytes_v100(),
            ProtocolVersion::V110 | ProtocolVersion::V120 => self.to_bytes_v110(),
        }
    }

    // Wire entries and blocks are emitted in canonical cid order so two
    // peers holding the same state produce identical bytes.
    fn sorted_entries(&self) -> Vec<&Entry> {
        let mut entries: Vec<_> = self.wantlist.values().collect();
        entries.sort_by_cached_key(|e| e.cid.to_bytes());
        entries
    }

    fn sorted_blocks(&self) -> Vec<&Block> {
        let mut blocks: Vec<_> = self.blocks.values().collect();
        blocks.sort_by_cached_key(|b| b.cid.to_bytes());
        blocks
    }

    fn to_bytes_v100(&self) -> Vec<u8> {
        // the legacy schema has no want types or presences; entries carry
        // the bare multihash instead of the full cid
        let entries = self
            .sorted_entries()
            .into_iter()
            .map(|e| bitswap_pb::message::wantlist::Entry {
                block: e.cid.hash().to_bytes(),
                priority: e.priority,
                cancel: e.cancel,
                want_type: bitswap_pb::message::wantlist::WantType::Block as i32,
                send_dont_have: false,
            })
            .collect();

        let pb = bitswap_pb::Message {
            wantlist: Some(bitswap_pb::message::Wantlist {
                entries,
                full: self.full,
            }),
            blocks: self.sorted_blocks().into_iter().map(|b| b.data.to_vec()).collect(),
            payload: Vec::new(),
            block_presences: Vec::new(),
            pending_bytes: 0,
        };
        pb.encode_to_vec()
    }

    fn to_bytes_v110(&self) -> Vec<u8> {
        let entries = self
            .sorted_entries()
            .into_iter()
            .map(|e| bitswap_pb::message::wantlist::Entry {
                block: e.cid.to_bytes(),
                priority: e.priority,
                cancel: e.cancel,
                want_type: match e.want_type {
                    WantType::Block => bitswap_pb::message::wantlist::WantType::Block as i32,
                    WantType::Have => bitswap_pb::message::wantlist::WantType::Have as i32,
                },
                send_dont_have: e.send_dont_have,
            })
            .collect();

        let payload = self
            .sorted_blocks()
            .into_iter()
            .map(|b| bitswap_pb::message::Block {
                prefix: Prefix::from(&b.cid).to_bytes(),
                data: b.data.to_vec(),
            })
            .collect();

        let mut presences: Vec<_> = self.block_presences.iter().collect();
        presences.sort_by_cached_key(|(cid, _)| cid.to_bytes());
        let block_presences = presences
            .into_iter()
            .map(|(cid, presence)| bitswap_pb::message::BlockPresence {
                cid: cid.to_bytes(),
                r#type: match presence {
                    BlockPresence::Have => bitswap_pb::message::BlockPresenceType::Have as i32,
                    BlockPresence::DontHave => bitswap_pb::message::BlockPresenceType::DontHave as i32,
                },
            })
            .collect();

        let pb = bitswap_pb::Message {
            wantlist: Some(bitswap_pb::message::Wantlist {
                entries,
                full: self.full,
            }),
            blocks: Vec::new(),
            payload,
            block_presences,
            pending_bytes: self.pending_bytes,
        };
        pb.encode_to_vec()
    }

    /// Parses a length-stripped frame in the given protocol revision.
    ///
    /// Legacy 1.0.0 frames carry raw block bytes without cids. Those are
    /// assumed to be sha2-256 CIDv0 blocks and their cid is derived by
    /// hashing; that assumption is the legacy contract, it is never
    /// negotiated.
    pub fn from_bytes(
        version: ProtocolVersion,
        data: &[u8],
        hash_loader: &HashLoader,
    ) -> Result<Self, BitswapError> {
        let pb = bitswap_pb::Message::decode(data)?;
        let mut msg = BitswapMessage::default();
        msg.pending_bytes = pb.pending_bytes;

        if let Some(wantlist) = pb.wantlist {
            msg.full = wantlist.full;
            for e in wantlist.entries {
                let cid = match version {
                    ProtocolVersion::V100 => Cid::new_v0(Multihash::from_bytes(&e.block)?)?,
                    ProtocolVersion::V110 | ProtocolVersion::V120 => Cid::try_from(e.block.as_slice())?,
                };
                let want_type = if e.want_type == bitswap_pb::message::wantlist::WantType::Have as i32 {
                    WantType::Have
                } else {
                    WantType::Block
                };
                msg.wantlist.insert(
                    cid.clone(),
                    Entry {
                        cid,
                        priority: e.priority,
                        want_type,
                        cancel: e.cancel,
                        send_dont_have: e.send_dont_have,
                    },
                );
            }
        }

        for data in pb.blocks {
            let mh = hash_loader(SHA2_256, &data).ok_or(BitswapError::UnsupportedHash(SHA2_256))?;
            let cid = Cid::new_v0(mh)?;
            msg.blocks.insert(cid.clone(), Block::new(data.into_boxed_slice(), cid));
        }

        for b in pb.payload {
            let prefix = Prefix::new(&b.prefix)?;
            let cid = prefix.to_cid(&b.data, hash_loader)?;
            msg.blocks.insert(cid.clone(), Block::new(b.data.into_boxed_slice(), cid));
        }

        for p in pb.block_presences {
            let cid = Cid::try_from(p.cid.as_slice())?;
            let presence = if p.r#type == bitswap_pb::message::BlockPresenceType::DontHave as i32 {
                BlockPresence::DontHave
            } else {
                BlockPresence::Have
            };
            msg.block_presences.insert(cid, presence);
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_hash_loader;
    use multihash_codetable::{Code, MultihashDigest};

    fn v1_block(data: &[u8]) -> Block {
        let cid = Cid::new_v1(0x55, Code::Sha2_256.digest(data));
        Block::new(data.to_vec().into_boxed_slice(), cid)
    }

    fn v0_block(data: &[u8]) -> Block {
        let cid = Cid::new_v0(Code::Sha2_256.digest(data)).unwrap();
        Block::new(data.to_vec().into_boxed_slice(), cid)
    }

    #[test]
    fn v110_round_trip_preserves_everything() {
        let loader = default_hash_loader();
        let block_a = v1_block(b"payload a");
        let block_b = v0_block(b"payload b");

        let mut msg = BitswapMessage::new(true);
        msg.add_entry(v1_block(b"wanted").cid, 7, WantType::Block, false);
        msg.add_entry(v1_block(b"probed").cid, 1, WantType::Have, true);
        msg.cancel(v1_block(b"dropped").cid);
        msg.add_block(block_a.clone());
        msg.add_block(block_b.clone());
        msg.add_block_presence(v1_block(b"present").cid, BlockPresence::Have);
        msg.add_block_presence(v1_block(b"absent").cid, BlockPresence::DontHave);
        msg.set_pending_bytes(42);

        let decoded = BitswapMessage::from_bytes(
            ProtocolVersion::V110,
            &msg.to_bytes(ProtocolVersion::V110),
            &loader,
        )
        .unwrap();

        assert_eq!(decoded, msg);
        for block in [&block_a, &block_b] {
            let got = decoded.blocks().find(|b| b.cid == block.cid).unwrap();
            assert_eq!(got.data(), block.data());
        }
        assert_eq!(decoded.pending_bytes(), 42);
    }

    #[test]
    fn v100_round_trip_loses_only_the_new_fields() {
        let loader = default_hash_loader();
        let block = v0_block(b"legacy payload");

        let mut msg = BitswapMessage::new(false);
        msg.add_entry(v0_block(b"wanted").cid, 3, WantType::Have, true);
        msg.cancel(v0_block(b"dropped").cid);
        msg.add_block(block.clone());
        msg.add_block_presence(v0_block(b"present").cid, BlockPresence::Have);

        let decoded = BitswapMessage::from_bytes(
            ProtocolVersion::V100,
            &msg.to_bytes(ProtocolVersion::V100),
            &loader,
        )
        .unwrap();

        // presences do not survive the legacy schema, want types collapse
        // to Block, the raw bytes come back under their derived v0 cid
        assert_eq!(decoded.block_presences().count(), 0);
        let wanted = decoded
            .wantlist()
            .find(|e| e.cid == v0_block(b"wanted").cid)
            .unwrap();
        assert_eq!(wanted.want_type, WantType::Block);
        assert!(!wanted.cancel);
        let dropped = decoded
            .wantlist()
            .find(|e| e.cid == v0_block(b"dropped").cid)
            .unwrap();
        assert!(dropped.cancel);
        let got = decoded.blocks().next().unwrap();
        assert_eq!(got.cid, block.cid);
        assert_eq!(got.data(), block.data());
    }

    #[test]
    fn cancel_overrides_a_queued_want() {
        let cid = v1_block(b"x").cid;
        let mut msg = BitswapMessage::new(false);
        msg.add_entry(cid.clone(), 1, WantType::Block, false);
        msg.cancel(cid.clone());

        let entries: Vec<_> = msg.wantlist().collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].cancel);
    }

    #[test]
    fn serialization_is_deterministic() {
        let build = |order: &[&[u8]]| {
            let mut msg = BitswapMessage::new(false);
            for data in order {
                msg.add_entry(v1_block(data).cid, 1, WantType::Block, false);
                msg.add_block(v1_block(data));
            }
            msg.to_bytes(ProtocolVersion::V110)
        };
        let forward: &[&[u8]] = &[b"a", b"b", b"c"];
        let backward: &[&[u8]] = &[b"c", b"b", b"a"];
        assert_eq!(build(forward), build(backward));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let loader = default_hash_loader();
        let garbage = vec![0xff; 32];
        match BitswapMessage::from_bytes(ProtocolVersion::V110, &garbage, &loader) {
            Err(BitswapError::Format(_)) => {}
            other => panic!("expected Format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unsupported_payload_hash_is_rejected() {
        let loader = default_hash_loader();
        let pb = bitswap_pb::Message {
            wantlist: None,
            blocks: Vec::new(),
            payload: vec![bitswap_pb::message::Block {
                // version 1, raw codec, multihash code 0x99 (unassigned)
                prefix: vec![0x01, 0x55, 0x99, 0x01, 0x20],
                data: b"data".to_vec(),
            }],
            block_presences: Vec::new(),
            pending_bytes: 0,
        };
        match BitswapMessage::from_bytes(ProtocolVersion::V110, &pb.encode_to_vec(), &loader) {
            Err(BitswapError::UnsupportedHash(code)) => assert_eq!(code, 0x99),
            other => panic!("expected UnsupportedHash, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mismatching_digest_length_is_rejected() {
        let loader = default_hash_loader();
        let pb = bitswap_pb::Message {
            wantlist: None,
            blocks: Vec::new(),
            payload: vec![bitswap_pb::message::Block {
                // sha2-256 announced with a 16 byte digest
                prefix: vec![0x01, 0x55, 0x12, 0x10],
                data: b"data".to_vec(),
            }],
            block_presences: Vec::new(),
            pending_bytes: 0,
        };
        match BitswapMessage::from_bytes(ProtocolVersion::V110, &pb.encode_to_vec(), &loader) {
            Err(BitswapError::CidMismatch) => {}
            other => panic!("expected CidMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_message_reports_empty() {
        let mut msg = BitswapMessage::new(false);
        assert!(msg.is_empty());
        msg.add_block_presence(v1_block(b"x").cid, BlockPresence::Have);
        assert!(!msg.is_empty());
    }
}
