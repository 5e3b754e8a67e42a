//! Assertion macros for the buffer's self-consistency checks.
//!
//! Producer misbehavior is absorbed and counted, never asserted on. The checks
//! here guard the buffer's own bookkeeping: the record chain, the write
//! cursor, the read cursor, and the agreement between index and ring. Most
//! are debug-only; the ones that guard raw offset arithmetic on the ring or
//! the reader's view of the index stay on in release builds because a
//! violation there means reading unrelated memory or desynchronized state.

/// Assert that the write cursor sits on a record boundary inside the ring.
///
/// **Invariant**: `cursor % ALIGNMENT == 0 && cursor < ring_size`
///
/// Used in: `copy_chunk_untrusted()` after advancing the cursor
macro_rules! debug_assert_cursor_aligned {
    ($cursor:expr, $ring_size:expr) => {
        debug_assert!(
            $cursor % crate::record::ChunkRecord::ALIGNMENT == 0 && $cursor < $ring_size,
            "write cursor {} misaligned or out of bounds (ring size {})",
            $cursor,
            $ring_size
        )
    };
}

/// Assert that an index entry still describes the record it points at.
///
/// **Invariant**: `record_at(meta.record_off).key() == key`
///
/// Used in: `maybe_patch_chunk_contents()`, `check_consistency()`
macro_rules! debug_assert_index_matches_record {
    ($record:expr, $key:expr) => {
        debug_assert!(
            $record.is_valid() && $record.is_padding == 0 && $record.key() == $key,
            "index entry {:?} disagrees with ring record {:?}",
            $key,
            $record
        )
    };
}

/// Assert that a chunk never reports more fragments read than it contains.
///
/// **Invariant**: `num_fragments_read <= num_fragments`
///
/// Used in: `read_next_trace_packet()` per visited chunk
macro_rules! debug_assert_fragments_bounded {
    ($meta:expr) => {
        debug_assert!(
            $meta.num_fragments_read <= $meta.num_fragments,
            "fragment cursor past the end: {} of {} read",
            $meta.num_fragments_read,
            $meta.num_fragments
        )
    };
}

/// Abort if the record chain walks past the physical ring end. Always on:
/// an overrun means the write path corrupted the chain and every subsequent
/// byte interpretation is garbage.
///
/// Used in: `delete_next_chunks_for()`
macro_rules! assert_chain_in_bounds {
    ($next_off:expr, $ring_size:expr) => {
        assert!(
            $next_off <= $ring_size,
            "record chain broken: walker at {} overruns ring end {}",
            $next_off,
            $ring_size
        )
    };
}

/// Abort if a fragment cursor derived from a record header leaves the ring.
/// Always on, for the same reason as `assert_chain_in_bounds`.
///
/// Used in: `read_next_packet_in_chunk()`
macro_rules! assert_fragment_in_bounds {
    ($off:expr, $ring_size:expr) => {
        assert!(
            $off < $ring_size,
            "fragment cursor {} outside ring of size {}",
            $off,
            $ring_size
        )
    };
}

/// Unwrap a sequence cursor's current chunk, aborting if it is exhausted.
/// Always on: cursors are only dereferenced right after being positioned or
/// checked, so a `None` here is reader control flow gone wrong, not producer
/// behavior.
///
/// **Invariant**: `cur.is_some()` at every cursor dereference
///
/// Used in: `read_next_trace_packet()`, `read_ahead()`
macro_rules! assert_cursor_positioned {
    ($cur:expr) => {
        match $cur {
            Some(key) => key,
            None => panic!("sequence cursor dereferenced while exhausted"),
        }
    };
}

/// Resolve a read cursor's key in the index, aborting on a miss. Always on:
/// every index mutation invalidates the read cursor, so a held key must
/// resolve; a miss means the reader and the index went out of sync.
///
/// **Invariant**: every key a read cursor holds is present in the index
///
/// Used in: `read_next_trace_packet()`, `read_ahead()`
macro_rules! assert_cursor_indexed {
    ($index:expr, $key:expr) => {
        match $index.get_mut(&$key) {
            Some(meta) => meta,
            None => panic!("read cursor points at unindexed chunk {:?}", $key),
        }
    };
}

/// Unwrap a sequence's recorded last chunk id, aborting if it is missing.
/// Always on: `note_last_chunk_id` runs on every index insert, so every
/// indexed sequence carries the anchor the reader starts from.
///
/// **Invariant**: `index holds (p, w, _)` implies `last_chunk_id[(p, w)]` exists
///
/// Used in: `SequenceIter::for_sequence()`
macro_rules! assert_sequence_anchored {
    ($last_chunk_id:expr, $producer_id:expr, $writer_id:expr) => {
        match $last_chunk_id {
            Some(id) => id,
            None => panic!(
                "indexed sequence ({}, {}) has no recorded last chunk id",
                $producer_id, $writer_id
            ),
        }
    };
}

pub(crate) use assert_chain_in_bounds;
pub(crate) use assert_cursor_indexed;
pub(crate) use assert_cursor_positioned;
pub(crate) use assert_fragment_in_bounds;
pub(crate) use assert_sequence_anchored;
pub(crate) use debug_assert_cursor_aligned;
pub(crate) use debug_assert_fragments_bounded;
pub(crate) use debug_assert_index_matches_record;
