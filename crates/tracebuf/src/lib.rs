//! tracebuf - Bounded In-Memory Trace Buffer
//!
//! The central buffer of a multi-producer tracing service. Untrusted
//! producers serialize trace packets into fixed-size chunks in shared memory;
//! the service copies each chunk into a bounded ring, indexes it by
//! `(producer, writer, chunk)` and lets a reader reassemble logical packets
//! in per-writer order, stitching packets that were fragmented across chunk
//! boundaries.
//!
//! # Key properties
//!
//! - Bounded, page-aligned ring: new chunks overwrite the oldest records,
//!   and the on-ring record chain never desynchronizes from the index
//! - Out-of-band patching of in-flight chunks, used to backfill packet
//!   length prefixes the producer didn't know at commit time
//! - Look-ahead reassembly: a fragmented packet is only emitted once every
//!   one of its chunks is present
//! - Hostile-producer hardening: contract violations are absorbed and
//!   counted, never propagated; shared memory is read exactly once
//!
//! All operations are synchronous and single-threaded; the owning service
//! serializes ingestion, patching and reading.
//!
//! # Example
//!
//! ```
//! use tracebuf::{page_size, Slices, TraceBuffer};
//!
//! let mut buffer = TraceBuffer::create(page_size()).expect("ring allocation");
//!
//! // One chunk from producer 1, writer 1: a single fragment, varint length
//! // prefix followed by the packet bytes.
//! buffer.copy_chunk_untrusted(1, 1, 0, 1, 0, b"\x05hello");
//!
//! let mut slices = Slices::new();
//! buffer.begin_read();
//! assert!(buffer.read_next_trace_packet(&mut slices));
//! assert_eq!(slices.to_bytes(), b"hello");
//! assert!(!buffer.read_next_trace_packet(&mut slices));
//! ```

pub mod abi;
mod buffer;
mod error;
mod index;
mod invariants;
mod reader;
mod record;
mod ring;
mod slices;
mod stats;
mod varint;

pub use abi::{
    CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES, CHUNK_FLAG_LAST_FRAGMENT_CONTINUES, PACKET_HEADER_SIZE,
    PATCH_LEN,
};
pub use buffer::TraceBuffer;
pub use error::BufferError;
pub use ring::page_size;
pub use slices::Slices;
pub use stats::BufferStats;

/// Trusted producer identity, injected by the service from the IPC peer.
pub type ProducerId = u16;

/// Writer identity, chosen by the producer; unique within it.
pub type WriterId = u16;

/// Wrapping per-`(producer, writer)` chunk counter.
pub type ChunkId = u32;
