use cid::{Cid, Version};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use crate::config::HashLoader;
use crate::error::BitswapError;

/// All metadata of a cid without the digest itself: version, codec,
/// multihash code and digest length.
///
/// This is what the 1.1.0 payload carries next to the raw block bytes; the
/// receiver re-hashes the data to recover the full cid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prefix {
    pub version: Version,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: usize,
}

impl Prefix {
    /// Parses a prefix from its varint encoding.
    pub fn new(data: &[u8]) -> Result<Prefix, BitswapError> {
        let (raw_version, remain) = varint_decode::u64(data)?;
        let version = Version::try_from(raw_version)?;
        let (codec, remain) = varint_decode::u64(remain)?;
        let (mh_type, remain) = varint_decode::u64(remain)?;
        let (mh_len, _remain) = varint_decode::u64(remain)?;
        Ok(Prefix {
            version,
            codec,
            mh_type,
            mh_len: mh_len as usize,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let version = match self.version {
            Version::V0 => 0,
            Version::V1 => 1,
        };
        let mut res = Vec::with_capacity(4);
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(version, &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.codec, &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.mh_type, &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.mh_len as u64, &mut buf));
        res
    }

    /// Hashes `data` with the algorithm the prefix names and assembles the
    /// full cid.
    pub fn to_cid(&self, data: &[u8], hash_loader: &HashLoader) -> Result<Cid, BitswapError> {
        let mh = hash_loader(self.mh_type, data).ok_or(BitswapError::UnsupportedHash(self.mh_type))?;
        if mh.size() as usize != self.mh_len {
            return Err(BitswapError::CidMismatch);
        }
        match self.version {
            Version::V0 => Ok(Cid::new_v0(mh)?),
            Version::V1 => Ok(Cid::new_v1(self.codec, mh)),
        }
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Prefix {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().size() as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_hash_loader;
    use multihash_codetable::{Code, MultihashDigest};

    #[test]
    fn v1_prefix_round_trips() {
        let data = b"some v1 block";
        let cid = Cid::new_v1(0x55, Code::Sha2_256.digest(data));

        let prefix = Prefix::from(&cid);
        let parsed = Prefix::new(&prefix.to_bytes()).unwrap();
        assert_eq!(parsed, prefix);

        let rebuilt = parsed.to_cid(data, &default_hash_loader()).unwrap();
        assert_eq!(rebuilt, cid);
    }

    #[test]
    fn v0_prefix_rebuilds_the_cid() {
        let data = b"some v0 block";
        let cid = Cid::new_v0(Code::Sha2_256.digest(data)).unwrap();

        let prefix = Prefix::from(&cid);
        let rebuilt = Prefix::new(&prefix.to_bytes())
            .unwrap()
            .to_cid(data, &default_hash_loader())
            .unwrap();
        assert_eq!(rebuilt, cid);
    }

    #[test]
    fn digest_length_mismatch_is_rejected() {
        let prefix = Prefix {
            version: Version::V1,
            codec: 0x55,
            mh_type: 0x12,
            mh_len: 16,
        };
        match prefix.to_cid(b"data", &default_hash_loader()) {
            Err(BitswapError::CidMismatch) => {}
            other => panic!("expected CidMismatch, got {:?}", other.map(|c| c.to_string())),
        }
    }

    #[test]
    fn unknown_hash_code_is_rejected() {
        let prefix = Prefix {
            version: Version::V1,
            codec: 0x55,
            mh_type: 0xdead_beef,
            mh_len: 32,
        };
        match prefix.to_cid(b"data", &default_hash_loader()) {
            Err(BitswapError::UnsupportedHash(code)) => assert_eq!(code, 0xdead_beef),
            other => panic!("expected UnsupportedHash, got {:?}", other.map(|c| c.to_string())),
        }
    }

    #[test]
    fn truncated_prefix_is_an_error() {
        assert!(Prefix::new(&[]).is_err());
    }
}
