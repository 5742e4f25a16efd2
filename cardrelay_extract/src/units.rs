//! Numeric normalization for unit amounts.

use cardrelay_core::util::normalize_digits;

/// Parse an amount such as `1,500`, `٣١٥` or `200` into a number.
///
/// Thousands separators and non-digit suffixes are dropped; a string with no
/// digits, or one that overflows `u32`, yields `None`.
#[must_use]
pub fn parse_amount(raw: &str) -> Option<u32> {
    let digits = normalize_digits(raw);
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
