//! In-ring record header and index key.

use bytemuck::{Pod, Zeroable};

use crate::abi::{ChunkHeader, PageHeader};
use crate::{ChunkId, ProducerId, WriterId};

/// Self-describing header written at the start of every record in the ring,
/// immediately followed by the chunk payload.
///
/// The ring is a back-to-back chain of these: starting at offset 0 and
/// repeatedly advancing by `size` lands exactly on the ring end (or on the
/// zero-filled tail before the first wrap). The header occupies the same bytes
/// the producer-side page + chunk headers did, so ingestion is a single bulk
/// copy; the compile-time assertions below keep the two layouts in sync.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ChunkRecord {
    /// Monotonic (wrapping) counter within the same `(producer, writer)`
    /// sequence.
    pub chunk_id: u32,
    /// Record size in bytes, header included. Always a multiple of
    /// [`ChunkRecord::ALIGNMENT`]. Zero only in the untouched tail of a ring
    /// that has not wrapped yet.
    pub size: u32,
    /// Trusted producer identity, injected server-side at ingestion.
    pub producer_id: u16,
    /// Writer identity, chosen by the producer.
    pub writer_id: u16,
    /// Number of packet fragments in the payload.
    pub num_fragments: u16,
    /// `CHUNK_FLAG_*` bits copied from the producer chunk header.
    pub flags: u8,
    /// Non-zero for padding records, which fill the space left when a chunk
    /// would straddle the physical ring end. Padding carries no payload and is
    /// never indexed.
    pub is_padding: u8,
}

// The record replaces the producer's page + chunk headers byte for byte.
const _: () = assert!(
    std::mem::size_of::<ChunkRecord>()
        == std::mem::size_of::<PageHeader>() + std::mem::size_of::<ChunkHeader>()
);
const _: () = assert!(std::mem::align_of::<ChunkRecord>() <= std::mem::size_of::<ChunkRecord>());

impl ChunkRecord {
    /// Size of the header itself.
    pub const HEADER_SIZE: usize = std::mem::size_of::<Self>();

    /// Every record starts at a multiple of this and has a size that is a
    /// multiple of this. Equal to the header size so that leftover tail space
    /// always fits at least a padding header.
    pub const ALIGNMENT: usize = Self::HEADER_SIZE;

    /// Upper bound on a single record. The cap keeps `size` representable and
    /// guarantees a record never needs more padding than a ring tail can hold.
    pub const MAX_SIZE: usize = (1 << 16) * Self::ALIGNMENT;

    pub(crate) fn new_data(
        producer_id: ProducerId,
        writer_id: WriterId,
        chunk_id: ChunkId,
        num_fragments: u16,
        flags: u8,
        size: usize,
    ) -> Self {
        debug_assert!(size >= Self::HEADER_SIZE && size % Self::ALIGNMENT == 0);
        Self {
            chunk_id,
            size: size as u32,
            producer_id,
            writer_id,
            num_fragments,
            flags,
            is_padding: 0,
        }
    }

    pub(crate) fn new_padding(size: usize) -> Self {
        debug_assert!(size >= Self::HEADER_SIZE && size % Self::ALIGNMENT == 0);
        Self {
            chunk_id: 0,
            size: size as u32,
            producer_id: 0,
            writer_id: 0,
            num_fragments: 0,
            flags: 0,
            is_padding: 1,
        }
    }

    /// A zero `size` marks the untouched region of a ring that has not wrapped
    /// yet; everything else on the chain is a valid record.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.size != 0
    }

    #[inline]
    pub(crate) fn key(&self) -> ChunkKey {
        ChunkKey {
            producer_id: self.producer_id,
            writer_id: self.writer_id,
            chunk_id: self.chunk_id,
        }
    }

    /// Total record size for a chunk with `payload_len` bytes of payload,
    /// rounded up to the record alignment. Rounding avoids fragmenting the
    /// ring into tails too small to hold even a padding header.
    #[inline]
    pub(crate) const fn rounded_size(payload_len: usize) -> usize {
        (payload_len + Self::HEADER_SIZE + Self::ALIGNMENT - 1) & !(Self::ALIGNMENT - 1)
    }
}

/// Index key: the identity of a chunk.
///
/// The derived ordering is lexicographic over `(producer_id, writer_id,
/// chunk_id)`, which keeps all chunks of one sequence contiguous in the index
/// and makes per-sequence range scans a `BTreeMap` range query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub producer_id: ProducerId,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
}

impl ChunkKey {
    pub(crate) fn new(producer_id: ProducerId, writer_id: WriterId, chunk_id: ChunkId) -> Self {
        Self {
            producer_id,
            writer_id,
            chunk_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounded_size() {
        assert_eq!(ChunkRecord::rounded_size(0), ChunkRecord::HEADER_SIZE);
        assert_eq!(
            ChunkRecord::rounded_size(1),
            ChunkRecord::HEADER_SIZE + ChunkRecord::ALIGNMENT
        );
        assert_eq!(
            ChunkRecord::rounded_size(ChunkRecord::ALIGNMENT),
            2 * ChunkRecord::HEADER_SIZE
        );
        // Already aligned payload + header stays put.
        assert_eq!(
            ChunkRecord::rounded_size(48),
            48 + ChunkRecord::HEADER_SIZE
        );
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        let a = ChunkKey::new(1, 1, 5);
        let b = ChunkKey::new(1, 2, 0);
        let c = ChunkKey::new(2, 0, 0);
        assert!(a < b && b < c);

        // Within a sequence, raw unsigned chunk_id order.
        assert!(ChunkKey::new(1, 1, 0) < ChunkKey::new(1, 1, u32::MAX));
    }

    #[test]
    fn test_padding_record_is_valid_but_anonymous() {
        let rec = ChunkRecord::new_padding(64);
        assert!(rec.is_valid());
        assert_eq!(rec.is_padding, 1);
        assert_eq!(rec.num_fragments, 0);
    }
}
