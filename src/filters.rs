//! Record validation.
//!
//! Records must carry a well-formed GAID and a plain dotted-quad IPv4
//! address before they are considered for allocation. Anything else is
//! dropped up front.

use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;

/// GAIDs are hyphenated 8-4-4-4-12 hex UUIDs.
static GAID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .expect("GAID pattern is valid")
});

/// Check that a device id is a well-formed GAID.
#[must_use]
pub fn is_valid_gaid(gaid: &str) -> bool {
    GAID_RE.is_match(gaid)
}

/// Check that an address is a canonical dotted-quad IPv4.
///
/// The part count is checked first so IPv6 and short forms never reach the
/// parser; std's `Ipv4Addr` parsing then rejects hex, octal-looking octets
/// and embedded junk.
#[must_use]
pub fn is_valid_ipv4(ip: &str) -> bool {
    ip.split('.').count() == 4 && ip.parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaid_accepts_canonical_uuid() {
        assert!(is_valid_gaid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_valid_gaid("550E8400-E29B-41D4-A716-446655440000"));
    }

    #[test]
    fn test_gaid_rejects_malformed() {
        assert!(!is_valid_gaid("not-a-uuid"));
        assert!(!is_valid_gaid(""));
        assert!(!is_valid_gaid("550e8400e29b41d4a716446655440000"));
        assert!(!is_valid_gaid("550e8400-e29b-41d4-a716-44665544000")); // short
        assert!(!is_valid_gaid("550e8400-e29b-41d4-a716-4466554400000")); // long
        assert!(!is_valid_gaid("g50e8400-e29b-41d4-a716-446655440000")); // non-hex
        assert!(!is_valid_gaid(" 550e8400-e29b-41d4-a716-446655440000"));
    }

    #[test]
    fn test_ipv4_accepts_dotted_quad() {
        assert!(is_valid_ipv4("1.2.3.4"));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(is_valid_ipv4("0.0.0.0"));
    }

    #[test]
    fn test_ipv4_rejects_non_canonical() {
        assert!(!is_valid_ipv4(""));
        assert!(!is_valid_ipv4("1.2.3"));
        assert!(!is_valid_ipv4("1.2.3.4.5"));
        assert!(!is_valid_ipv4("256.1.1.1"));
        assert!(!is_valid_ipv4("01.2.3.4")); // leading zero
        assert!(!is_valid_ipv4("0x7f.0.0.1")); // hex octet
        assert!(!is_valid_ipv4("1.2.3.4 "));
        assert!(!is_valid_ipv4("::ffff:1.2.3.4")); // IPv6-mapped
        assert!(!is_valid_ipv4("1.2.3.4\0"));
    }
}
