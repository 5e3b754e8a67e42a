//! The trace buffer: a bounded ring of chunk records plus the index that keeps
//! them addressable.
//!
//! Ingestion copies a chunk out of producer shared memory into the ring,
//! evicting however many older records the copy lands on. Eviction and the
//! write path maintain one structural invariant above all: walking the record
//! chain from offset 0 by `record.size` steps lands exactly on the ring end
//! (or on the zero tail of a ring that has not wrapped yet), and the index
//! never holds an entry whose record was overwritten.

use tracing::{debug, trace};

use crate::abi::PATCH_LEN;
use crate::error::BufferError;
use crate::index::{ChunkIndex, ChunkMeta};
use crate::invariants::{
    assert_chain_in_bounds, debug_assert_cursor_aligned, debug_assert_index_matches_record,
};
use crate::reader::ReadIter;
use crate::record::{ChunkKey, ChunkRecord};
use crate::ring::Ring;
use crate::stats::BufferStats;
use crate::{ChunkId, ProducerId, WriterId};

/// Bounded in-memory buffer for trace chunks written by untrusted producers.
///
/// Owned by the tracing service and driven from a single thread: ingestion,
/// patching and reading must all be serialized by the caller. Every operation
/// runs to completion without blocking.
pub struct TraceBuffer {
    pub(crate) ring: Ring,
    pub(crate) index: ChunkIndex,
    /// Write cursor, always record-aligned, `0 <= wptr < ring.len()`.
    pub(crate) wptr: usize,
    /// `min(ring size, ChunkRecord::MAX_SIZE)`.
    pub(crate) max_chunk_size: usize,
    pub(crate) stats: BufferStats,
    pub(crate) read_iter: ReadIter,
}

impl TraceBuffer {
    /// Allocates a buffer of `size` bytes, zero-filled and page-aligned.
    ///
    /// `size` must be a non-zero multiple of [`page_size`](crate::page_size).
    pub fn create(size: usize) -> Result<Self, BufferError> {
        let ring = Ring::allocate(size)?;
        Ok(Self {
            max_chunk_size: size.min(ChunkRecord::MAX_SIZE),
            ring,
            index: ChunkIndex::default(),
            wptr: 0,
            stats: BufferStats::default(),
            read_iter: ReadIter::default(),
        })
    }

    /// Total ring capacity in bytes.
    pub fn size(&self) -> usize {
        self.ring.len()
    }

    /// Snapshot of the buffer counters.
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Bytes between the write cursor and the physical end of the ring.
    fn size_to_end(&self) -> usize {
        self.ring.len() - self.wptr
    }

    /// Copies one chunk out of producer shared memory into the ring and
    /// indexes it, evicting older records as needed.
    ///
    /// `payload` points at memory the producer may rewrite at any instant.
    /// It is read exactly once, by the bulk copy into the ring, and never
    /// again afterwards; only the ring-resident copy is trusted from then on.
    /// `producer_id` is trusted (injected by the service from the IPC peer
    /// identity); everything else is producer-controlled and validated.
    ///
    /// Contract violations (an oversized chunk, a fragment-less chunk) drop
    /// the chunk, bump `chunks_rejected` and leave the buffer untouched.
    /// A duplicate `(producer, writer, chunk)` replaces the previous entry:
    /// the newest copy wins.
    pub fn copy_chunk_untrusted(
        &mut self,
        producer_id: ProducerId,
        writer_id: WriterId,
        chunk_id: ChunkId,
        num_fragments: u16,
        flags: u8,
        payload: &[u8],
    ) {
        // Rounding up to the record alignment avoids ever leaving a tail too
        // small to hold a padding header.
        let rounded_size = ChunkRecord::rounded_size(payload.len());
        if rounded_size > self.max_chunk_size {
            debug!(
                producer_id,
                writer_id,
                chunk_id,
                payload_len = payload.len(),
                "dropping oversized chunk"
            );
            self.stats.chunks_rejected += 1;
            return;
        }
        if num_fragments == 0 {
            // A fragment-less chunk can never yield a packet and would only
            // stall look-ahead; reject it outright.
            debug!(producer_id, writer_id, chunk_id, "dropping fragment-less chunk");
            self.stats.chunks_rejected += 1;
            return;
        }

        // The index is about to change shape; any in-flight read cursor must
        // reposition from scratch on the next read.
        self.read_iter = ReadIter::default();

        trace!(
            producer_id,
            writer_id,
            chunk_id,
            size = rounded_size,
            wptr = self.wptr,
            "copying chunk"
        );

        // Not enough room before the physical end: clear the tail, cover it
        // with a padding record and wrap.
        let cached_size_to_end = self.size_to_end();
        if rounded_size > cached_size_to_end {
            let leftover = self.delete_next_chunks_for(cached_size_to_end);
            debug_assert!(leftover == 0, "tail clear cannot over-scan the ring end");
            self.add_padding_record(cached_size_to_end);
            self.wptr = 0;
            self.stats.write_wrap_count += 1;
            debug_assert!(self.size_to_end() >= rounded_size);
        }

        // Evict whatever the new record will land on. The walker may overrun
        // the requested range by ending inside a bigger record; that leftover
        // becomes trailing padding after the copy.
        let padding_after = self.delete_next_chunks_for(rounded_size);

        let record = ChunkRecord::new_data(
            producer_id,
            writer_id,
            chunk_id,
            num_fragments,
            flags,
            rounded_size,
        );
        let key = record.key();
        if let Some(prev) = self
            .index
            .insert(key, ChunkMeta::new(self.wptr, num_fragments, flags))
        {
            // Producer bug or malice; the stale record at prev.record_off
            // stays in the ring until eviction reclaims it.
            debug!(
                producer_id,
                writer_id,
                chunk_id,
                prev_off = prev.record_off,
                "duplicate chunk key, replacing index entry"
            );
        }

        self.ring.write_record(self.wptr, &record, payload);
        self.wptr += rounded_size;
        if self.wptr >= self.ring.len() {
            debug_assert_eq!(padding_after, 0);
            self.wptr = 0;
            self.stats.write_wrap_count += 1;
        }
        debug_assert_cursor_aligned!(self.wptr, self.ring.len());

        self.index
            .note_last_chunk_id(producer_id, writer_id, chunk_id);

        if padding_after > 0 {
            self.add_padding_record(padding_after);
        }
    }

    /// Walks the record chain from the write cursor and un-indexes every
    /// record that starts within the next `bytes_to_clear` bytes. Returns the
    /// over-scan: bytes past the cleared range that belonged to the last
    /// evicted record and must be covered by trailing padding.
    fn delete_next_chunks_for(&mut self, bytes_to_clear: usize) -> usize {
        let search_end = self.wptr + bytes_to_clear;
        debug_assert!(search_end <= self.ring.len());

        let mut next_chunk_off = self.wptr;
        while next_chunk_off < search_end {
            let next_chunk = self.ring.record_at(next_chunk_off);

            if !next_chunk.is_valid() {
                // Reached the untouched part of the buffer; it is all zeroes
                // from here to the end. The zero region can only begin exactly
                // at the write cursor, anything else means the chain broke.
                debug_assert_eq!(
                    next_chunk_off, self.wptr,
                    "zero tail must begin at the write cursor"
                );
                return 0;
            }

            // Padding records occupy space but were never indexed.
            if next_chunk.is_padding == 0 {
                let key = next_chunk.key();
                let removed = self.index.remove(&key);
                debug_assert!(
                    removed.is_some(),
                    "evicting record {key:?} that was not indexed"
                );
                self.stats.chunks_overwritten += 1;
                trace!(
                    producer_id = key.producer_id,
                    writer_id = key.writer_id,
                    chunk_id = key.chunk_id,
                    off = next_chunk_off,
                    "evicting chunk"
                );
            }

            next_chunk_off += next_chunk.size as usize;

            // Walking past the physical end means the chain is corrupt; that
            // is a server-side bug, not producer behavior, and is fatal.
            assert_chain_in_bounds!(next_chunk_off, self.ring.len());
        }

        debug_assert!(next_chunk_off >= search_end);
        next_chunk_off - search_end
    }

    /// Writes a padding record of `size` bytes at the write cursor. The
    /// cursor deliberately does not advance: padding either covers the tail
    /// right before a wrap or the over-scan right after a copy.
    fn add_padding_record(&mut self, size: usize) {
        debug_assert!(size >= ChunkRecord::HEADER_SIZE && size <= ChunkRecord::MAX_SIZE);
        trace!(off = self.wptr, size, "adding padding record");
        let record = ChunkRecord::new_padding(size);
        self.ring.write_record(self.wptr, &record, &[]);
    }

    /// Overwrites `PATCH_LEN` bytes of an already-copied chunk at a
    /// producer-supplied payload offset. Used to backfill packet length
    /// prefixes that the producer did not know at commit time.
    ///
    /// Returns `false` (and counts a failed patch) if the chunk is gone —
    /// evicted, or never seen — or if the offset does not leave the patch
    /// fully inside the chunk payload. The offset is untrusted: a slow IPC
    /// can race a writer wrapping its chunk ids, and a malicious producer can
    /// send garbage.
    pub fn maybe_patch_chunk_contents(
        &mut self,
        producer_id: ProducerId,
        writer_id: WriterId,
        chunk_id: ChunkId,
        patch_offset_untrusted: usize,
        patch: [u8; PATCH_LEN],
    ) -> bool {
        let key = ChunkKey::new(producer_id, writer_id, chunk_id);
        let Some(meta) = self.index.get(&key) else {
            trace!(producer_id, writer_id, chunk_id, "patch target not in buffer");
            self.stats.failed_patches += 1;
            return false;
        };

        let record = self.ring.record_at(meta.record_off);
        debug_assert_index_matches_record!(record, key);
        let record_end = meta.record_off + record.size as usize;
        debug_assert!(record_end <= self.ring.len());

        let payload_begin = meta.record_off + ChunkRecord::HEADER_SIZE;
        let target = payload_begin.checked_add(patch_offset_untrusted);
        let target = match target {
            Some(t) if t <= record_end - PATCH_LEN => t,
            _ => {
                debug!(
                    producer_id,
                    writer_id,
                    chunk_id,
                    patch_offset_untrusted,
                    "patch offset out of range"
                );
                self.stats.failed_patches += 1;
                return false;
            }
        };

        // The target must still hold the zero placeholder laid down at
        // ingestion; anything else means a double patch or a wrong offset.
        debug_assert!(
            self.ring.bytes(target..target + PATCH_LEN).iter().all(|&b| b == 0),
            "patching non-zero bytes at offset {patch_offset_untrusted}"
        );

        trace!(producer_id, writer_id, chunk_id, patch_offset_untrusted, "patching chunk");
        self.ring
            .bytes_mut(target..target + PATCH_LEN)
            .copy_from_slice(&patch);
        self.stats.succeeded_patches += 1;
        true
    }

    /// Walks the whole record chain and cross-checks it against the index,
    /// panicking on any inconsistency. A debugging and test aid; not meant
    /// for production hot paths.
    pub fn check_consistency(&self) {
        assert!(
            self.wptr < self.ring.len() && self.wptr % ChunkRecord::ALIGNMENT == 0,
            "write cursor {} misaligned or out of bounds",
            self.wptr
        );

        for (key, meta) in self.index.iter() {
            let record = self.ring.record_at(meta.record_off);
            assert!(
                record.is_valid() && record.is_padding == 0 && record.key() == *key,
                "index entry {key:?} does not match record {record:?}"
            );
            assert!(
                meta.num_fragments_read <= meta.num_fragments,
                "fragment cursor past the end for {key:?}"
            );
            assert!(
                self.index
                    .last_chunk_id(key.producer_id, key.writer_id)
                    .is_some(),
                "indexed sequence {key:?} has no recorded last chunk id"
            );
        }

        let mut off = 0;
        while off < self.ring.len() {
            let record = self.ring.record_at(off);
            if !record.is_valid() {
                assert_eq!(off, self.wptr, "zero tail does not begin at the write cursor");
                assert!(
                    self.ring.bytes(off..self.ring.len()).iter().all(|&b| b == 0),
                    "zero tail contains non-zero bytes"
                );
                return;
            }
            let size = record.size as usize;
            assert!(
                size % ChunkRecord::ALIGNMENT == 0 && size >= ChunkRecord::HEADER_SIZE,
                "record at {off} has invalid size {size}"
            );
            if record.is_padding == 0 {
                assert!(
                    self.index.get(&record.key()).is_some(),
                    "non-padding record {:?} at {off} is not indexed",
                    record.key()
                );
            }
            off += size;
            assert!(off <= self.ring.len(), "record chain overruns the ring end");
        }
        assert_eq!(off, self.ring.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::page_size;

    fn fragment(len: usize) -> Vec<u8> {
        assert!(len < 0x80);
        let mut payload = vec![len as u8];
        payload.extend(std::iter::repeat(b'x').take(len));
        payload
    }

    #[test]
    fn test_create_validates_size() {
        assert!(TraceBuffer::create(page_size()).is_ok());
        assert!(matches!(
            TraceBuffer::create(0),
            Err(BufferError::InvalidSize { .. })
        ));
        assert!(matches!(
            TraceBuffer::create(page_size() - 1),
            Err(BufferError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_ingest_indexes_and_stays_consistent() {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &fragment(5));
        buf.copy_chunk_untrusted(1, 1, 1, 1, 0, &fragment(7));
        buf.copy_chunk_untrusted(2, 1, 0, 1, 0, &fragment(3));
        assert_eq!(buf.index.len(), 3);
        buf.check_consistency();
    }

    #[test]
    fn test_oversized_chunk_is_dropped() {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        let huge = vec![0u8; buf.max_chunk_size + 1];
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &huge);
        assert_eq!(buf.stats().chunks_rejected, 1);
        assert!(buf.index.is_empty());
        buf.check_consistency();
    }

    #[test]
    fn test_fragmentless_chunk_is_dropped() {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        buf.copy_chunk_untrusted(1, 1, 0, 0, 0, &fragment(5));
        assert_eq!(buf.stats().chunks_rejected, 1);
        assert!(buf.index.is_empty());
    }

    #[test]
    fn test_duplicate_key_replaces_entry() {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &fragment(5));
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &fragment(9));
        assert_eq!(buf.index.len(), 1);

        // The entry must point at the newest copy.
        let key = ChunkKey::new(1, 1, 0);
        let meta = *buf.index.get(&key).unwrap();
        let record = buf.ring.record_at(meta.record_off);
        assert_eq!(record.key(), key);
        assert_eq!(
            record.size as usize,
            ChunkRecord::rounded_size(fragment(9).len())
        );
    }

    #[test]
    fn test_wrap_evicts_oldest_records() {
        let size = page_size();
        let mut buf = TraceBuffer::create(size).unwrap();

        // 47-byte fragments round to 64-byte records; fill the ring exactly.
        let n = size / 64;
        for c in 0..n {
            buf.copy_chunk_untrusted(1, 1, c as u32, 1, 0, &fragment(47));
        }
        assert_eq!(buf.stats().write_wrap_count, 1);
        assert_eq!(buf.wptr, 0);
        assert_eq!(buf.index.len(), n);
        buf.check_consistency();

        // One more lands at the start and evicts chunk 0.
        buf.copy_chunk_untrusted(1, 1, n as u32, 1, 0, &fragment(47));
        assert_eq!(buf.stats().chunks_overwritten, 1);
        assert_eq!(buf.index.len(), n);
        assert!(buf.index.get(&ChunkKey::new(1, 1, 0)).is_none());
        buf.check_consistency();
    }

    #[test]
    fn test_straddling_chunk_pads_tail_and_wraps() {
        let size = page_size();
        let mut buf = TraceBuffer::create(size).unwrap();

        // Leave exactly 64 bytes before the end, then write a 96-byte record.
        let filler = size - 64 - ChunkRecord::HEADER_SIZE;
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &vec![1u8; filler]);
        assert_eq!(buf.wptr, size - 64);

        buf.copy_chunk_untrusted(1, 1, 1, 1, 0, &fragment(79));
        // The tail became padding, the cursor wrapped, and the big filler
        // chunk at offset 0 was evicted by the new record.
        assert_eq!(buf.stats().write_wrap_count, 1);
        assert_eq!(buf.stats().chunks_overwritten, 1);
        assert_eq!(buf.wptr, 96);
        assert!(buf.index.get(&ChunkKey::new(1, 1, 0)).is_none());
        assert!(buf.index.get(&ChunkKey::new(1, 1, 1)).is_some());
        buf.check_consistency();
    }

    #[test]
    fn test_exact_fit_wraps_without_padding() {
        let size = page_size();
        let mut buf = TraceBuffer::create(size).unwrap();
        buf.copy_chunk_untrusted(1, 1, 0, 1, 0, &vec![1u8; size - ChunkRecord::HEADER_SIZE]);
        assert_eq!(buf.wptr, 0);
        assert_eq!(buf.stats().write_wrap_count, 1);
        buf.check_consistency();
    }

    #[test]
    fn test_patch_hits_and_misses() {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        // Fragment with a zero-filled 4-byte length placeholder.
        let mut payload = vec![0u8; PATCH_LEN];
        payload.extend_from_slice(b"hello");
        buf.copy_chunk_untrusted(1, 1, 7, 1, 0, &payload);

        // Missing chunk.
        assert!(!buf.maybe_patch_chunk_contents(1, 1, 99, 0, [0x85, 0x80, 0x80, 0x00]));
        assert_eq!(buf.stats().failed_patches, 1);

        // Offset past the record end.
        assert!(!buf.maybe_patch_chunk_contents(1, 1, 7, 4096, [0x85, 0x80, 0x80, 0x00]));
        assert_eq!(buf.stats().failed_patches, 2);

        // Valid patch lands.
        assert!(buf.maybe_patch_chunk_contents(1, 1, 7, 0, [0x85, 0x80, 0x80, 0x00]));
        assert_eq!(buf.stats().succeeded_patches, 1);
        let meta = *buf.index.get(&ChunkKey::new(1, 1, 7)).unwrap();
        let payload_begin = meta.record_off + ChunkRecord::HEADER_SIZE;
        assert_eq!(
            buf.ring.bytes(payload_begin..payload_begin + PATCH_LEN),
            [0x85, 0x80, 0x80, 0x00]
        );
    }
}
