#![no_main]

use lansend::core::types::ContentRange;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(range) = ContentRange::parse(data) {
        // Accepted ranges satisfy the grammar invariant.
        assert!(range.start <= range.end);
        assert!(range.end < range.total);
        assert_eq!(ContentRange::parse(&range.to_string()).unwrap(), range);
    }
});
