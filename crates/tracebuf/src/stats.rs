//! Buffer counters.

/// Monotonic counters tracking buffer activity. Snapshots are returned by
/// [`TraceBuffer::stats`](crate::TraceBuffer::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Times the write cursor wrapped back to the start of the ring.
    pub write_wrap_count: u64,
    /// Indexed chunks evicted to make room for newer ones.
    pub chunks_overwritten: u64,
    /// Chunks dropped at ingestion for violating the producer contract
    /// (oversized or fragment-less).
    pub chunks_rejected: u64,
    /// Patches applied to in-flight chunks.
    pub succeeded_patches: u64,
    /// Patches that missed: chunk already evicted (or never seen) or patch
    /// offset out of range.
    pub failed_patches: u64,
    /// Fragmented packets successfully stitched across chunks by look-ahead.
    pub fragment_lookahead_successes: u64,
    /// Look-aheads abandoned because the span had a hole or inconsistent
    /// continuation flags.
    pub fragment_lookahead_failures: u64,
}
