use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use multihash::Multihash;
use multihash_codetable::{Code, MultihashDigest};

/// Resolves a multihash code and digests `data` with it. Returns `None`
/// when no hasher is registered for the code.
pub type HashLoader = Arc<dyn Fn(u64, &[u8]) -> Option<Multihash<64>> + Send + Sync>;

/// Hash loader backed by the multihash code table.
pub fn default_hash_loader() -> HashLoader {
    Arc::new(|code, data| Code::try_from(code).ok().map(|c| c.digest(data)))
}

/// Engine configuration.
#[derive(Clone)]
pub struct BitswapConfig {
    /// Restrict the node to the legacy `/ipfs/bitswap/1.0.0` protocol.
    pub b100_only: bool,
    /// Upper bound of providers contacted per lookup.
    pub max_providers_per_request: usize,
    /// Quiet period before queued wantlist updates are flushed to a peer.
    pub wantlist_send_debounce: Duration,
    /// Idle window after which an inbound stream is aborted. Receiving a
    /// frame resets the timer.
    pub incoming_stream_timeout: Duration,
    /// Inbound streams served concurrently before new ones are refused.
    pub max_inbound_streams: usize,
    /// Outbound streams open concurrently before sends are refused.
    pub max_outbound_streams: usize,
    /// Digest resolver used when reconstructing cids from block payloads.
    pub hash_loader: HashLoader,
}

impl Default for BitswapConfig {
    fn default() -> Self {
        BitswapConfig {
            b100_only: false,
            max_providers_per_request: 10,
            wantlist_send_debounce: Duration::from_millis(10),
            incoming_stream_timeout: Duration::from_secs(30),
            max_inbound_streams: 32,
            max_outbound_streams: 128,
            hash_loader: default_hash_loader(),
        }
    }
}

impl fmt::Debug for BitswapConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // hash_loader is a closure and has no Debug
        fmt.debug_struct("BitswapConfig")
            .field("b100_only", &self.b100_only)
            .field("max_providers_per_request", &self.max_providers_per_request)
            .field("wantlist_send_debounce", &self.wantlist_send_debounce)
            .field("incoming_stream_timeout", &self.incoming_stream_timeout)
            .field("max_inbound_streams", &self.max_inbound_streams)
            .field("max_outbound_streams", &self.max_outbound_streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_loader_digests_sha2_256() {
        let loader = default_hash_loader();
        let mh = loader(0x12, b"hello").expect("sha2-256 is registered");
        assert_eq!(mh.code(), 0x12);
        assert_eq!(mh.size(), 32);
    }

    #[test]
    fn default_loader_rejects_unknown_codes() {
        let loader = default_hash_loader();
        assert!(loader(0xdead_beef, b"hello").is_none());
    }
}
