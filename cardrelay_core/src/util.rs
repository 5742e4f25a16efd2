//! Hashing and digit helpers shared by fingerprinting and extraction.

use sha2::{Digest, Sha256};

/// SHA-256 over a namespace and `:`-joined parts, hex encoded.
#[must_use]
pub fn fingerprint_hash(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for part in parts {
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Keep ASCII digits only. Arabic-Indic digits are mapped to ASCII first,
/// since source channels mix both.
#[must_use]
pub fn normalize_digits(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '0'..='9' => Some(c),
            '\u{0660}'..='\u{0669}' => char::from_digit(c as u32 - 0x0660, 10),
            '\u{06F0}'..='\u{06F9}' => char::from_digit(c as u32 - 0x06F0, 10),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_hash() {
        let h1 = fingerprint_hash("card", &["vodafone", "123"]);
        let h2 = fingerprint_hash("card", &["vodafone", "123"]);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn namespace_separates_hashes() {
        let h1 = fingerprint_hash("card", &["vodafone", "123"]);
        let h2 = fingerprint_hash("message", &["vodafone", "123"]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn digits_are_normalized() {
        assert_eq!(normalize_digits("1234-5678 9012"), "123456789012");
        assert_eq!(normalize_digits("*858*١٢٣#"), "858123");
        assert_eq!(normalize_digits("no digits"), "");
    }
}
