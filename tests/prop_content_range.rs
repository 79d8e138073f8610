#![forbid(unsafe_code)]

use lansend::core::types::ContentRange;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_valid_ranges_round_trip(
        start in 0u64..1_000_000u64,
        len in 1u64..1_000_000u64,
        tail in 0u64..1_000_000u64,
    ) {
        let end = start + len - 1;
        let total = end + 1 + tail;
        let header = format!("bytes {start}-{end}/{total}");

        let parsed = ContentRange::parse(&header).expect("valid header");
        prop_assert_eq!(parsed.start, start);
        prop_assert_eq!(parsed.end, end);
        prop_assert_eq!(parsed.total, total);
        prop_assert_eq!(parsed.len(), len);
        prop_assert_eq!(parsed.is_terminal(), tail == 0);

        // Display emits the grammar it parses.
        prop_assert_eq!(ContentRange::parse(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn prop_start_after_end_is_rejected(
        end in 0u64..1_000_000u64,
        gap in 1u64..1_000u64,
        total in 1u64..2_000_000u64,
    ) {
        let start = end + gap;
        let header = format!("bytes {start}-{end}/{total}");
        prop_assert!(ContentRange::parse(&header).is_err());
    }

    #[test]
    fn prop_end_at_or_past_total_is_rejected(
        start in 0u64..1_000u64,
        len in 1u64..1_000u64,
        overshoot in 0u64..1_000u64,
    ) {
        let end = start + len - 1;
        // total <= end violates end < total
        let total = end.saturating_sub(overshoot);
        let header = format!("bytes {start}-{end}/{total}");
        prop_assert!(ContentRange::parse(&header).is_err());
    }

    #[test]
    fn prop_parser_never_panics(s in "\\PC*") {
        let _ = ContentRange::parse(&s);
    }

    #[test]
    fn prop_prefix_is_mandatory(start in 0u64..100u64, end in 0u64..100u64, total in 1u64..200u64) {
        let bare = format!("{start}-{end}/{total}");
        prop_assert!(ContentRange::parse(&bare).is_err());
    }
}

#[test]
fn one_byte_file_terminal_chunk() {
    let r = ContentRange::parse("bytes 0-0/1").expect("valid");
    assert_eq!(r.len(), 1);
    assert!(r.is_terminal());
}

#[test]
fn spec_chunk_sequence_for_a_large_file() {
    // 120 MB at 10 MB chunks: twelve ranges, the last one terminal.
    let total: u64 = 120_000_000;
    let chunk: u64 = 10_000_000;
    let mut start = 0;
    let mut n = 0;
    while start < total {
        let end = (start + chunk - 1).min(total - 1);
        let r = ContentRange::parse(&format!("bytes {start}-{end}/{total}")).expect("valid");
        assert_eq!(r.len(), chunk.min(total - start));
        assert_eq!(r.is_terminal(), end + 1 == total);
        start += chunk;
        n += 1;
    }
    assert_eq!(n, 12);
}
