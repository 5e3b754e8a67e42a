//! Property-based tests for the buffer's round-trip laws and structural
//! consistency under eviction churn.

use proptest::prelude::*;
use tracebuf::{
    page_size, Slices, TraceBuffer, CHUNK_FLAG_FIRST_FRAGMENT_CONTINUES as FIRST_CONT,
    CHUNK_FLAG_LAST_FRAGMENT_CONTINUES as LAST_CONT,
};

fn framed(body: &[u8]) -> Vec<u8> {
    assert!(body.len() < 0x80);
    let mut payload = vec![body.len() as u8];
    payload.extend_from_slice(body);
    payload
}

fn read_all(buf: &mut TraceBuffer) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut slices = Slices::new();
    buf.begin_read();
    while buf.read_next_trace_packet(&mut slices) {
        out.push(slices.to_bytes());
    }
    out
}

// =============================================================================
// Round-trip law: without eviction, packets come back in write order,
// byte-exact.
// =============================================================================

proptest! {
    #[test]
    fn prop_in_order_roundtrip_without_wrap(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..50),
    ) {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        for (c, body) in bodies.iter().enumerate() {
            buf.copy_chunk_untrusted(1, 1, c as u32, 1, 0, &framed(body));
        }
        prop_assert_eq!(buf.stats().write_wrap_count, 0);

        let packets = read_all(&mut buf);
        prop_assert_eq!(packets, bodies);
    }
}

// =============================================================================
// Per-writer FIFO: sequences drain independently, each in write order.
// =============================================================================

proptest! {
    #[test]
    fn prop_per_writer_fifo(
        first in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..30), 1..20),
        second in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..30), 1..20),
    ) {
        let mut buf = TraceBuffer::create(page_size()).unwrap();

        // Interleave the two writers' chunks.
        let mut c1 = 0u32;
        let mut c2 = 0u32;
        for i in 0..first.len().max(second.len()) {
            if let Some(body) = first.get(i) {
                buf.copy_chunk_untrusted(1, 1, c1, 1, 0, &framed(body));
                c1 += 1;
            }
            if let Some(body) = second.get(i) {
                buf.copy_chunk_untrusted(1, 2, c2, 1, 0, &framed(body));
                c2 += 1;
            }
        }

        // Sequences are visited in index order: writer 1 fully, then writer 2,
        // each in write order.
        let expected: Vec<Vec<u8>> = first.iter().chain(second.iter()).cloned().collect();
        prop_assert_eq!(read_all(&mut buf), expected);
    }
}

// =============================================================================
// Structural consistency: the record chain and the index agree after every
// operation, however much the ring churns.
// =============================================================================

proptest! {
    #[test]
    fn prop_consistency_under_eviction_churn(
        sizes in prop::collection::vec(1usize..110, 1..300),
    ) {
        let mut buf = TraceBuffer::create(page_size()).unwrap();
        for (c, &len) in sizes.iter().enumerate() {
            buf.copy_chunk_untrusted(1, 1, c as u32, 1, 0, &framed(&vec![c as u8; len]));
            buf.check_consistency();
        }

        let packets = read_all(&mut buf);
        prop_assert!(packets.len() <= sizes.len());
        // Whatever survived eviction must be a suffix of what was written.
        let expected_start = sizes.len() - packets.len();
        for (i, packet) in packets.iter().enumerate() {
            let c = expected_start + i;
            prop_assert_eq!(packet, &vec![c as u8; sizes[c]]);
        }
        buf.check_consistency();
    }
}

// =============================================================================
// Fragmentation: a packet split across k chunks is stitched back together.
// =============================================================================

proptest! {
    #[test]
    fn prop_fragmented_packet_reassembles(
        body in prop::collection::vec(any::<u8>(), 4..120),
        k in 1usize..5,
    ) {
        let k = k.min(body.len());
        let piece = body.len() / k;
        let mut buf = TraceBuffer::create(page_size()).unwrap();

        for i in 0..k {
            let lo = i * piece;
            let hi = if i == k - 1 { body.len() } else { lo + piece };
            let mut flags = 0;
            if i > 0 {
                flags |= FIRST_CONT;
            }
            if i < k - 1 {
                flags |= LAST_CONT;
            }
            buf.copy_chunk_untrusted(1, 1, i as u32, 1, flags, &framed(&body[lo..hi]));
        }

        let packets = read_all(&mut buf);
        prop_assert_eq!(packets.len(), 1);
        prop_assert_eq!(&packets[0], &body);
        prop_assert_eq!(
            buf.stats().fragment_lookahead_successes,
            u64::from(k > 1)
        );
    }
}
