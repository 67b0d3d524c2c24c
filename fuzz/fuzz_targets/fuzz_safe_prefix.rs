#![no_main]
use hearth::generation::safe_prefix_len;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let cut = safe_prefix_len(data);
    assert!(cut <= data.len());
    assert!(data.len() - cut < 4);
    // Bytes that were already valid UTF-8 are always emitted in full.
    if std::str::from_utf8(data).is_ok() {
        assert_eq!(cut, data.len());
    }
});
