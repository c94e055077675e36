//! Tunables for the pack-objects engine.

/// Configuration for a pack-objects run. Constructed programmatically by
/// the embedding caller — this crate does not parse a config file.
#[derive(Debug, Clone)]
pub struct PackConfig {
    /// Delta window width.
    pub window: usize,
    /// Cap on bytes held resident in the delta window, 0 = unlimited.
    pub window_memory_limit: u64,
    /// Maximum delta chain depth.
    pub depth: u8,
    /// Deflate compression level (0-9).
    pub compression_level: u32,
    /// Worker thread count for delta search. 0 = auto-detect.
    pub threads: usize,
    /// Total cached-delta-bytes budget.
    pub delta_cache_size: u64,
    /// Per-delta size below which a winning delta is cached.
    pub delta_cache_limit: u64,
    /// If false, never emit OfsDelta (only RefDelta).
    pub allow_ofs_delta: bool,
    /// Blobs at or above this size stream through, no delta attempts.
    pub big_file_threshold: u64,
    /// Reuse on-disk deltas from source packs.
    pub reuse_delta: bool,
    /// Reuse on-disk non-delta representations verbatim.
    pub reuse_object: bool,
    /// Spot-check CRC/inflate before trusting a reused span.
    pub verify_reused: bool,
    /// Split output at this many bytes per pack. 0 = unlimited.
    pub pack_size_limit: u64,
    /// Enforce same-island delta rule and layered write order.
    pub delta_islands: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            window: 10,
            window_memory_limit: 0,
            depth: 50,
            compression_level: 6,
            threads: 0,
            delta_cache_size: 256 * 1024 * 1024,
            delta_cache_limit: 1000,
            allow_ofs_delta: true,
            big_file_threshold: 512 * 1024 * 1024,
            reuse_delta: true,
            reuse_object: true,
            verify_reused: false,
            pack_size_limit: 0,
            delta_islands: false,
        }
    }
}

impl PackConfig {
    /// Resolve `threads == 0` ("auto") against the available parallelism.
    pub fn resolved_threads(&self) -> usize {
        if self.threads != 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
