//! Demonstrates the full chunk lifecycle: a packet fragmented across three
//! chunks, a deferred length prefix backfilled by a patch, and the reader
//! stitching everything back together.
//!
//! Run with `RUST_LOG=trace cargo run --example reassembly` to watch the
//! buffer's internal events.

use tracebuf::{
    page_size, Slices, TraceBuffer, CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES,
    CHUNK_FLAG_LAST_FRAGMENT_CONTINUES,
};

fn framed(body: &[u8]) -> Vec<u8> {
    let mut payload = vec![body.len() as u8];
    payload.extend_from_slice(body);
    payload
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut buffer = TraceBuffer::create(page_size()).expect("ring allocation");

    // Writer 1 splits one large packet across three chunks.
    buffer.copy_chunk_untrusted(
        1,
        1,
        0,
        1,
        CHUNK_FLAG_LAST_FRAGMENT_CONTINUES,
        &framed(b"lorem "),
    );
    buffer.copy_chunk_untrusted(
        1,
        1,
        1,
        1,
        CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES | CHUNK_FLAG_LAST_FRAGMENT_CONTINUES,
        &framed(b"ipsum "),
    );
    buffer.copy_chunk_untrusted(
        1,
        1,
        2,
        1,
        CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES,
        &framed(b"dolor"),
    );

    // Writer 2 committed a chunk before knowing its packet's length: the
    // prefix is zero-filled and patched afterwards.
    let mut deferred = vec![0u8; 4];
    deferred.extend_from_slice(b"sit amet");
    buffer.copy_chunk_untrusted(1, 2, 0, 1, 0, &deferred);
    let patched = buffer.maybe_patch_chunk_contents(1, 2, 0, 0, [0x88, 0x80, 0x80, 0x00]);
    assert!(patched);

    let mut slices = Slices::new();
    buffer.begin_read();
    while buffer.read_next_trace_packet(&mut slices) {
        println!(
            "packet ({} fragment{}): {:?}",
            slices.len(),
            if slices.len() == 1 { "" } else { "s" },
            String::from_utf8_lossy(&slices.to_bytes())
        );
    }

    println!("stats: {:#?}", buffer.stats());
}
