//! Domain Fingerprint Validation
//!
//! Normalizes raw names into lowercase ASCII fingerprints and rejects
//! anything that must never enter the pipeline.

use thiserror::Error;

/// Maximum total length per RFC 1035
pub const MAX_DOMAIN_LEN: usize = 253;
/// Maximum label length per RFC 1035
pub const MAX_LABEL_LEN: usize = 63;

/// Names that only ever resolve locally; the poller skips them outright.
const RESERVED_SUFFIXES: &[&str] = &[".local", ".localhost", ".arpa", ".internal"];
const RESERVED_NAMES: &[&str] = &["localhost", "local", "localdomain", "broadcasthost"];

/// Validation failure. Surfaced as a 4xx on the manual endpoint only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    /// Empty input (or empty after normalization)
    #[error("domain cannot be empty")]
    Empty,
    /// Over 253 characters after encoding
    #[error("domain exceeds {MAX_DOMAIN_LEN} characters")]
    TooLong,
    /// Fewer than two labels
    #[error("domain must have at least two labels")]
    MissingDot,
    /// Whitespace or control character in the input
    #[error("domain contains whitespace or control characters")]
    InvalidChar,
    /// A label is empty, too long, or violates the LDH rule
    #[error("invalid label: {0}")]
    BadLabel(String),
    /// Internationalized name could not be converted to ASCII
    #[error("invalid internationalized name")]
    Idna,
}

/// Normalize a raw name into a domain fingerprint: trimmed, lowercase,
/// ASCII-compatible encoding, trailing dot stripped.
pub fn normalize(raw: &str) -> Result<String, ValidateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidateError::Empty);
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidateError::InvalidChar);
    }

    let mut domain = if trimmed.is_ascii() {
        trimmed.to_ascii_lowercase()
    } else {
        idna::domain_to_ascii(trimmed).map_err(|_| ValidateError::Idna)?
    };

    if domain.ends_with('.') {
        domain.pop();
    }
    if domain.is_empty() {
        return Err(ValidateError::Empty);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(ValidateError::TooLong);
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(ValidateError::MissingDot);
    }
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(ValidateError::BadLabel((*label).to_string()));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ValidateError::BadLabel((*label).to_string()));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ValidateError::BadLabel((*label).to_string()));
        }
    }

    Ok(domain)
}

/// Whether a name is reserved/local and should be skipped by the poller.
pub fn is_reserved(domain: &str) -> bool {
    let d = domain.trim_end_matches('.').to_ascii_lowercase();
    RESERVED_NAMES.contains(&d.as_str()) || RESERVED_SUFFIXES.iter().any(|s| d.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of_len(total: usize) -> String {
        // labels of 63 chars joined by dots, last label padded to hit `total`
        let full = total / 64;
        let mut labels: Vec<String> = (0..full).map(|_| "a".repeat(63)).collect();
        let used = full * 64;
        labels.push("b".repeat(total - used));
        labels.join(".")
    }

    #[test]
    fn test_accepts_minimal_and_punycode() {
        assert_eq!(normalize("a.b").unwrap(), "a.b");
        assert_eq!(
            normalize("xn--bcher-kva.example").unwrap(),
            "xn--bcher-kva.example"
        );
        assert_eq!(normalize("EXAMPLE.Com.").unwrap(), "example.com");
    }

    #[test]
    fn test_unicode_converted_to_ascii() {
        assert_eq!(normalize("bücher.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_length_boundary() {
        let max = name_of_len(253);
        assert_eq!(max.len(), 253);
        assert!(normalize(&max).is_ok());

        let over = name_of_len(254);
        assert_eq!(over.len(), 254);
        assert_eq!(normalize(&over), Err(ValidateError::TooLong));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(normalize(""), Err(ValidateError::Empty));
        assert_eq!(normalize("   "), Err(ValidateError::Empty));
        assert_eq!(normalize("no-dot"), Err(ValidateError::MissingDot));
        assert_eq!(normalize("has space.example"), Err(ValidateError::InvalidChar));
        assert_eq!(normalize("tab\t.example"), Err(ValidateError::InvalidChar));
        assert!(matches!(normalize("a..b"), Err(ValidateError::BadLabel(_))));
        assert!(matches!(normalize("-lead.example"), Err(ValidateError::BadLabel(_))));
        assert!(matches!(normalize("trail-.example"), Err(ValidateError::BadLabel(_))));
        assert!(matches!(
            normalize(&format!("{}.example", "x".repeat(64))),
            Err(ValidateError::BadLabel(_))
        ));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("printer.local"));
        assert!(is_reserved("1.0.0.127.in-addr.arpa"));
        assert!(is_reserved("localhost"));
        assert!(!is_reserved("example.com"));
    }
}
