//! Packet reassembly: the two-dimensional read cursor and look-ahead.
//!
//! The reader walks sequences (`(producer, writer)` key ranges of the index)
//! in index order, and within each sequence walks chunks in chunk-id order
//! starting just past the sequence's newest id, so that reading survives the
//! chunk-id wrap. Fragmented packets are stitched by peeking at the following
//! chunks before committing to emit anything.

use tracing::trace;

use crate::abi::{CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES, CHUNK_FLAG_LAST_FRAGMENT_CONTINUES};
use crate::buffer::TraceBuffer;
use crate::index::{ChunkIndex, ChunkMeta};
use crate::invariants::{
    assert_cursor_indexed, assert_cursor_positioned, assert_fragment_in_bounds,
    assert_sequence_anchored, debug_assert_fragments_bounded,
};
use crate::record::{ChunkKey, ChunkRecord};
use crate::ring::Ring;
use crate::slices::Slices;
use crate::varint;
use crate::{ChunkId, ProducerId, WriterId};

/// Read cursor state carried between `read_next_trace_packet` calls.
///
/// Every index mutation resets this to `Unpositioned`; repositioning rescans
/// from the start of the index, and fully-read chunks are skipped via their
/// fragment counters, so no packet is ever emitted twice.
#[derive(Clone, Debug, Default)]
pub(crate) enum ReadIter {
    /// Not positioned; the next read derives a cursor from the index start.
    #[default]
    Unpositioned,
    /// Iterating one `(producer, writer)` sequence.
    Seq(SequenceIter),
    /// Every sequence drained. Reads return nothing until new data arrives.
    Exhausted,
}

/// Cursor over the chunks of one `(producer, writer)` sequence.
///
/// `chunk_id` wraps at `u32::MAX`, so the oldest readable chunk is not the
/// lowest key in the range: reading starts at the first key strictly greater
/// than the sequence's newest id (the wrapping id), wraps around the key
/// range once, and terminates after consuming the wrapping id itself.
#[derive(Clone, Debug)]
pub(crate) struct SequenceIter {
    pub(crate) producer_id: ProducerId,
    pub(crate) writer_id: WriterId,
    /// First key of the sequence at positioning time.
    begin: ChunkKey,
    /// Current chunk; `None` once the sequence is drained.
    pub(crate) cur: Option<ChunkKey>,
    /// The sequence's newest chunk id.
    wrapping_id: ChunkId,
}

impl SequenceIter {
    fn for_sequence(index: &ChunkIndex, begin: ChunkKey) -> Self {
        let (producer_id, writer_id) = (begin.producer_id, begin.writer_id);
        let wrapping_id = assert_sequence_anchored!(
            index.last_chunk_id(producer_id, writer_id),
            producer_id,
            writer_id
        );
        let cur = index
            .next_key_in_sequence(producer_id, writer_id, wrapping_id)
            .unwrap_or(begin);
        Self {
            producer_id,
            writer_id,
            begin,
            cur: Some(cur),
            wrapping_id,
        }
    }

    fn move_next(&mut self, index: &ChunkIndex) {
        let Some(cur) = self.cur else { return };
        if cur.chunk_id == self.wrapping_id {
            self.cur = None;
            return;
        }
        self.cur = Some(
            index
                .next_key_in_sequence(self.producer_id, self.writer_id, cur.chunk_id)
                .unwrap_or(self.begin),
        );
    }

    fn move_to_end(&mut self) {
        self.cur = None;
    }
}

enum ReadAheadResult {
    /// The whole fragmented packet was present; slices are filled.
    Succeeded,
    /// A hole or inconsistent flags: abandon the sequence for now, the
    /// missing chunk may still arrive.
    FailedMoveToNextSequence,
    /// A fragment inside the span was corrupt; stay on this sequence and try
    /// the following chunks.
    FailedStayOnSameSequence,
}

impl TraceBuffer {
    /// Resets the read cursor to the start of the first sequence.
    pub fn begin_read(&mut self) {
        self.read_iter = ReadIter::Unpositioned;
    }

    /// Reads exactly one logical packet, pushing one byte slice per fragment
    /// onto `slices` (cleared on entry). Packets come out in per-writer
    /// order; sequences are visited in index order.
    ///
    /// Returns `false` when nothing further is readable right now. More data
    /// (or a backfilling patch) can make later calls succeed again.
    pub fn read_next_trace_packet(&mut self, slices: &mut Slices) -> bool {
        slices.clear();
        let Self {
            ring,
            index,
            stats,
            read_iter,
            ..
        } = self;

        loop {
            // Position the cursor on a chunk, hopping to the next sequence
            // when the current one is drained.
            let positioned = matches!(&*read_iter, ReadIter::Seq(seq) if seq.cur.is_some());
            if !positioned {
                let next_begin = match &*read_iter {
                    ReadIter::Unpositioned => index.first_key(),
                    ReadIter::Seq(seq) => {
                        index.next_sequence_start(seq.producer_id, seq.writer_id)
                    }
                    ReadIter::Exhausted => None,
                };
                let Some(begin) = next_begin else {
                    *read_iter = ReadIter::Exhausted;
                    return false;
                };
                *read_iter = ReadIter::Seq(SequenceIter::for_sequence(index, begin));
            }
            let ReadIter::Seq(iter) = &mut *read_iter else {
                unreachable!("cursor was just positioned")
            };
            let cur_key = assert_cursor_positioned!(iter.cur);

            // Drain readable fragments from the current chunk.
            loop {
                let meta = assert_cursor_indexed!(index, cur_key);
                debug_assert_fragments_bounded!(meta);
                if meta.num_fragments_read >= meta.num_fragments {
                    break;
                }

                let first_unread = meta.num_fragments_read == 0;
                let on_last_fragment = meta.num_fragments_read == meta.num_fragments - 1;
                let continues_from_prev =
                    meta.flags & CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES != 0;
                let continues_on_next = meta.flags & CHUNK_FLAG_LAST_FRAGMENT_CONTINUES != 0;

                // An unread continuation at the front means the predecessor
                // chunk was already evicted. The fragment is orphaned and
                // lost for good: marking it read makes the skip permanent.
                if first_unread && continues_from_prev {
                    read_next_packet_in_chunk(ring, meta, None);
                    continue;
                }

                // The trailing fragment spills into the next chunk: peek
                // ahead to see whether the rest of the packet is here.
                if on_last_fragment && continues_on_next {
                    match read_ahead(ring, index, iter, slices) {
                        ReadAheadResult::Succeeded => {
                            stats.fragment_lookahead_successes += 1;
                            return true;
                        }
                        ReadAheadResult::FailedMoveToNextSequence => {
                            stats.fragment_lookahead_failures += 1;
                            iter.move_to_end();
                            break;
                        }
                        ReadAheadResult::FailedStayOnSameSequence => continue,
                    }
                }

                // An interior fragment (or a non-continuing trailing one) is
                // always self-contained.
                if read_next_packet_in_chunk(ring, meta, Some(&mut *slices)) {
                    return true;
                }
                // Corrupt or empty fragment: abandon this chunk rather than
                // stall the sequence, and try the next one.
                break;
            }

            iter.move_next(index);
        }
    }
}

/// Walks the chunks after the read cursor looking for the end of a packet
/// whose trailing fragment continues past the cursor's chunk. On success the
/// whole span is replayed into `slices` and marked read.
fn read_ahead(
    ring: &Ring,
    index: &mut ChunkIndex,
    read_iter: &mut SequenceIter,
    slices: &mut Slices,
) -> ReadAheadResult {
    let start = assert_cursor_positioned!(read_iter.cur);
    trace!(chunk_id = start.chunk_id, "look-ahead start");
    let mut next_chunk_id = start.chunk_id.wrapping_add(1);

    let mut it = read_iter.clone();
    it.move_next(index);
    while let Some(key) = it.cur {
        debug_assert!(
            key.producer_id == read_iter.producer_id && key.writer_id == read_iter.writer_id,
            "look-ahead escaped its sequence"
        );
        let meta = *assert_cursor_indexed!(index, key);

        // Ingestion rejects fragment-less chunks; skip defensively anyway.
        if meta.num_fragments == 0 {
            it.move_next(index);
            next_chunk_id = next_chunk_id.wrapping_add(1);
            continue;
        }

        // Either a hole in the chunk ids (the missing chunk may still be in
        // flight) or a contiguous id whose flags don't claim a continuation
        // (buggy or malicious producer). Give up on this sequence for now.
        if key.chunk_id != next_chunk_id
            || meta.flags & CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES == 0
        {
            return ReadAheadResult::FailedMoveToNextSequence;
        }

        // A middle chunk holding a single pass-through fragment of a large
        // packet: keep walking.
        if meta.num_fragments == 1 && meta.flags & CHUNK_FLAG_LAST_FRAGMENT_CONTINUES != 0 {
            it.move_next(index);
            next_chunk_id = next_chunk_id.wrapping_add(1);
            continue;
        }

        // Terminating chunk found: every fragment of the packet is present.
        trace!(chunk_id = key.chunk_id, "look-ahead success");
        debug_assert!(
            meta.num_fragments > 1 || meta.flags & CHUNK_FLAG_LAST_FRAGMENT_CONTINUES == 0
        );

        // Replay the span, emitting one slice per chunk and marking the
        // fragments read. Keep walking even past a corrupt fragment so the
        // cursor state stays consistent.
        let mut packet_corruption = false;
        loop {
            let cur = assert_cursor_positioned!(read_iter.cur);
            let cur_meta = assert_cursor_indexed!(index, cur);
            if cur_meta.num_fragments > 0 {
                packet_corruption |=
                    !read_next_packet_in_chunk(ring, cur_meta, Some(&mut *slices));
            }
            if read_iter.cur == it.cur {
                break;
            }
            read_iter.move_next(index);
        }

        if packet_corruption {
            slices.clear();
            return ReadAheadResult::FailedStayOnSameSequence;
        }
        return ReadAheadResult::Succeeded;
    }
    ReadAheadResult::FailedMoveToNextSequence
}

/// Parses the next fragment of `meta`'s chunk and advances its read state.
///
/// Pushes the fragment bytes onto `slices` when provided (skipping is a read
/// with no output). Returns `false` without emitting for an empty fragment,
/// and for a corrupt length prefix, in which case the chunk is drained so the
/// sequence never stalls on it.
fn read_next_packet_in_chunk(
    ring: &Ring,
    meta: &mut ChunkMeta,
    slices: Option<&mut Slices>,
) -> bool {
    debug_assert!(meta.num_fragments_read < meta.num_fragments);

    let record = ring.record_at(meta.record_off);
    let record_end = meta.record_off + record.size as usize;
    let payload_begin = meta.record_off + ChunkRecord::HEADER_SIZE;
    let packet_begin = payload_begin + meta.cur_packet_offset as usize;

    // These offsets derive from server-written headers, but an eviction bug
    // could still break them; leaving the ring is fatal.
    assert_fragment_in_bounds!(packet_begin, ring.len());
    assert!(record_end <= ring.len(), "record at {} overruns the ring", meta.record_off);

    // A fragment starts with a varint stating its length, followed by that
    // many bytes.
    let fragment = varint::parse_varint(ring.bytes(packet_begin..record_end)).and_then(
        |(len, prefix_len)| {
            let data_begin = (packet_begin + prefix_len) as u64;
            let next_packet = data_begin.checked_add(len)?;
            if next_packet > record_end as u64 {
                return None;
            }
            Some((data_begin as usize, len as usize))
        },
    );

    let Some((data_begin, len)) = fragment else {
        // Corrupt length prefix. Drain the chunk so the reader moves past it.
        meta.cur_packet_offset = 0;
        meta.num_fragments_read = meta.num_fragments;
        return false;
    };

    meta.cur_packet_offset = (data_begin + len - payload_begin) as u32;
    meta.num_fragments_read += 1;

    if len == 0 {
        // Empty fragment: consumed, nothing to emit.
        return false;
    }
    if let Some(slices) = slices {
        slices.push(ring.bytes(data_begin..data_begin + len));
    }
    true
}
