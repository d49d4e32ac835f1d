//! Address and payload validation shared by the frame codec and the conversation store.
//!
//! Contact addresses are the short hardware addresses the optical link device is
//! configured with (`AB`, `CD`, `FF` for broadcast). They are always handled in
//! normalized uppercase form; anything else is rejected before it can reach the
//! wire or the history file.

/// Longest address accepted as a contact identifier.
pub const MAX_ADDRESS_LEN: usize = 16;

/// Device buffer size for one message payload, including the NUL terminator.
pub const MAX_PAYLOAD_LEN: usize = 200;

/// Address used by the device for broadcast traffic.
pub const BROADCAST_ADDRESS: &str = "FF";

/// Contact address validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must not be empty")]
    Empty,

    #[error("address is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("address contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },
}

/// Message text validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("message contains characters outside the 7-bit device charset: {chars}")]
    NotAscii { chars: String },

    #[error("message payload is {len} characters including terminator (maximum {max})")]
    TooLong { len: usize, max: usize },
}

/// Normalize a contact address: trim surrounding whitespace and uppercase.
///
/// Only ASCII letters and digits are accepted; the bracket and comma characters
/// used by the wire format are therefore impossible inside an address.
pub fn normalize_address(raw: &str) -> Result<String, AddressError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    if trimmed.chars().count() > MAX_ADDRESS_LEN {
        return Err(AddressError::TooLong {
            max: MAX_ADDRESS_LEN,
        });
    }
    let invalid: String = trimmed
        .chars()
        .filter(|c| !c.is_ascii_alphanumeric())
        .collect();
    if !invalid.is_empty() {
        return Err(AddressError::InvalidCharacters { chars: invalid });
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Check that text only uses the device's 7-bit character set.
pub fn validate_charset(text: &str) -> Result<(), TextError> {
    if text.is_ascii() {
        return Ok(());
    }
    let mut offending: Vec<char> = text.chars().filter(|c| !c.is_ascii()).collect();
    offending.dedup();
    Err(TextError::NotAscii {
        chars: offending.into_iter().take(8).collect(),
    })
}

/// Check an already escaped wire payload against the device buffer size.
/// The NUL terminator occupies one slot.
pub fn validate_payload_len(wire_payload: &str) -> Result<(), TextError> {
    let len = wire_payload.len() + 1;
    if len > MAX_PAYLOAD_LEN {
        return Err(TextError::TooLong {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

pub fn is_broadcast(address: &str) -> bool {
    address.eq_ignore_ascii_case(BROADCAST_ADDRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_address(" ab ").unwrap(), "AB");
        assert_eq!(normalize_address("ff").unwrap(), "FF");
        assert_eq!(normalize_address("c0ffee").unwrap(), "C0FFEE");
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert_eq!(normalize_address("   "), Err(AddressError::Empty));
        assert!(matches!(
            normalize_address("A,B"),
            Err(AddressError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            normalize_address("AB]"),
            Err(AddressError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            normalize_address(&"A".repeat(MAX_ADDRESS_LEN + 1)),
            Err(AddressError::TooLong { .. })
        ));
    }

    #[test]
    fn charset_rejects_non_ascii() {
        assert!(validate_charset("plain text 123").is_ok());
        let err = validate_charset("caf\u{e9}").unwrap_err();
        assert!(matches!(err, TextError::NotAscii { ref chars } if chars == "\u{e9}"));
    }

    #[test]
    fn payload_len_counts_terminator() {
        assert!(validate_payload_len(&"x".repeat(199)).is_ok());
        assert_eq!(
            validate_payload_len(&"x".repeat(200)),
            Err(TextError::TooLong { len: 201, max: 200 })
        );
    }

    #[test]
    fn broadcast_detection_ignores_case() {
        assert!(is_broadcast("ff"));
        assert!(is_broadcast("FF"));
        assert!(!is_broadcast("AB"));
    }
}
