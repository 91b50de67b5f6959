//! Byte and UTF-8 helpers shared across the transport.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;

use crate::peer::NAME_SUFFIX_CHARS;

/// Split `data` into chunks of at most `chunk_len` bytes, preserving order.
pub(crate) fn split_bytes(data: &[u8], chunk_len: usize) -> VecDeque<Vec<u8>> {
    debug_assert!(chunk_len > 0);
    data.chunks(chunk_len).map(<[u8]>::to_vec).collect()
}

/// Pad (with spaces) or truncate `s` to exactly `chars` characters.
pub(crate) fn fix_char_length(s: &str, chars: usize) -> String {
    let mut out: String = s.chars().take(chars).collect();
    while out.chars().count() < chars {
        out.push(' ');
    }
    out
}

/// Longest prefix of `s` that fits within `max_bytes` of UTF-8.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Split the leading UTF-8 character off `bytes`. `None` when the buffer is
/// empty or does not start with valid UTF-8.
pub(crate) fn take_first_char(bytes: &[u8]) -> Option<(String, &[u8])> {
    let take = bytes.len().min(4);
    for end in 1..=take {
        if let Ok(s) = std::str::from_utf8(&bytes[..end]) {
            return Some((s.to_string(), &bytes[end..]));
        }
    }
    None
}

/// Random characters appended to the advertised name. Alphanumeric, so the
/// suffix costs exactly [`NAME_SUFFIX_CHARS`] bytes of the advertising
/// budget.
pub(crate) fn generate_name_suffix() -> String {
    const SUFFIX_ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..NAME_SUFFIX_CHARS)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_bytes_covers_all_input_in_order() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks = split_bytes(&data, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[1].len(), 100);
        assert_eq!(chunks[2].len(), 56);
        let rejoined: Vec<u8> = chunks.iter().flatten().copied().collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn split_bytes_of_empty_input_is_empty() {
        assert!(split_bytes(&[], 10).is_empty());
    }

    #[test]
    fn fix_char_length_pads_and_truncates() {
        assert_eq!(fix_char_length("", 1), " ");
        assert_eq!(fix_char_length("abc", 1), "a");
        assert_eq!(fix_char_length("☃x", 1), "☃");
    }

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // '☃' is three bytes; cutting inside it must back off.
        assert_eq!(truncate_utf8("a☃", 2), "a");
        assert_eq!(truncate_utf8("a☃", 4), "a☃");
    }

    #[test]
    fn take_first_char_handles_multibyte() {
        let (head, rest) = take_first_char("☃rest".as_bytes()).unwrap();
        assert_eq!(head, "☃");
        assert_eq!(rest, b"rest");

        let (head, rest) = take_first_char(b"ahi").unwrap();
        assert_eq!(head, "a");
        assert_eq!(rest, b"hi");

        assert!(take_first_char(&[]).is_none());
        assert!(take_first_char(&[0xFF, 0xFE]).is_none());
    }

    #[test]
    fn name_suffix_has_fixed_width() {
        for _ in 0..16 {
            let suffix = generate_name_suffix();
            assert_eq!(suffix.chars().count(), NAME_SUFFIX_CHARS);
            assert_eq!(suffix.len(), NAME_SUFFIX_CHARS);
        }
    }
}
