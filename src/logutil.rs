//! Logging helpers that keep message text on a single log line.

/// Longest preview of message text written to the log.
pub const MAX_PREVIEW: usize = 60;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters and NUL => `\xNN`
///
/// Output is cut after `max_chars` input characters with an ellipsis.
pub fn escape_log(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Short preview of message text for info-level logs.
pub fn preview(s: &str) -> String {
    escape_log(s, MAX_PREVIEW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_truncates() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd", 100), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log("abcdef", 3), "abc…");
        assert_eq!(escape_log("nul\0", 10), "nul\\x00");
    }

    #[test]
    fn preview_caps_length() {
        let long = "x".repeat(MAX_PREVIEW * 2);
        assert_eq!(preview(&long).chars().count(), MAX_PREVIEW + 1);
    }
}
