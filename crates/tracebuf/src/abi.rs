//! Mirror of the producer-visible shared memory layout.
//!
//! Producers serialize trace data into shared memory pages; each page carries a
//! [`PageHeader`] and every chunk inside it a [`ChunkHeader`]. The buffer never
//! parses those pages itself (the IPC layer does), but the in-ring record
//! header replaces the two headers byte for byte so a chunk can be bulk-copied
//! straight out of a page. The size equality is verified at compile time in
//! `record.rs`.

/// First fragment in the chunk is the continuation of a packet that started in
/// the previous chunk of the same sequence.
pub const CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES: u8 = 1 << 0;

/// Last fragment in the chunk continues in the next chunk of the same
/// sequence.
pub const CHUNK_FLAG_LAST_FRAGMENT_CONTINUES: u8 = 1 << 1;

/// Size of the per-packet length prefix a producer writes ahead of each
/// fragment: a redundantly-encoded (fixed-width) base-128 varint.
///
/// Producers that don't know a packet's length up front write a zero-filled
/// prefix and backfill it later through
/// [`TraceBuffer::maybe_patch_chunk_contents`](crate::TraceBuffer::maybe_patch_chunk_contents).
pub const PACKET_HEADER_SIZE: usize = 4;

/// Length of an out-of-band patch. Patches exist only to backfill packet
/// length prefixes, so the two widths are one and the same.
pub const PATCH_LEN: usize = PACKET_HEADER_SIZE;

/// Header at the start of every shared memory page.
#[repr(C)]
pub struct PageHeader {
    /// Page layout discriminator and per-chunk state bits, written atomically
    /// by the producer.
    pub layout: u32,
    pub reserved: u32,
}

/// Header at the start of every chunk within a shared memory page.
#[repr(C)]
pub struct ChunkHeader {
    /// Monotonic (wrapping) counter, unique within a `(producer, writer)`
    /// sequence.
    pub chunk_id: u32,
    /// Number of packet fragments in the chunk payload.
    pub packet_count: u16,
    /// `CHUNK_FLAG_*` bits.
    pub flags: u8,
    pub reserved: u8,
}
