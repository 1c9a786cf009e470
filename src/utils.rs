const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Encode `value` in base 36 with upper-case digits (`0` for zero).
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Decode a base-36 string, accepting either letter case.
pub fn from_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// Short lower-case base-36 digest of a raw record, used to spot duplicate rows.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    to_base36(u64::from_le_bytes(head)).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1295), "ZZ");
        assert_eq!(to_base36(u64::MAX), "3W5E11264SGSF");
    }

    #[test]
    fn test_base36_decode_is_case_insensitive() {
        assert_eq!(from_base36("zz"), Some(1295));
        assert_eq!(from_base36("ZZ"), Some(1295));
        assert_eq!(from_base36(""), None);
        assert_eq!(from_base36("a-b"), None);
        for n in [0u64, 1, 35, 36, 4096, 987_654_321] {
            assert_eq!(from_base36(&to_base36(n)), Some(n));
        }
    }

    #[test]
    fn test_content_hash_is_stable_and_distinguishes_records() {
        let a = content_hash(b"record one");
        let b = content_hash(b"record one");
        let c = content_hash(b"record two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_digit() || ch.is_ascii_lowercase()));
    }
}
