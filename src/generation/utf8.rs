//! Longest-valid-prefix detection for streamed UTF-8.

/// Length of the longest prefix of `bytes` that can be emitted without
/// splitting a multi-byte character.
///
/// Only an incomplete sequence at the very end is held back. Bytes that can
/// never become valid (stray continuation bytes, invalid leads) are counted
/// as safe so they are flushed instead of stalling the stream.
pub fn safe_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can start an
    // incomplete one.
    let floor = len.saturating_sub(3);
    let mut i = len;
    while i > floor {
        i -= 1;
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return len,
        };
        return if len - i < need { i } else { len };
    }
    len
}

/// Split `buf` at its safe prefix, returning the emitted text and keeping the
/// incomplete tail in `buf`.
pub(crate) fn take_safe_prefix(buf: &mut Vec<u8>) -> String {
    let cut = safe_prefix_len(buf);
    let tail = buf.split_off(cut);
    let head = std::mem::replace(buf, tail);
    String::from_utf8_lossy(&head).into_owned()
}
