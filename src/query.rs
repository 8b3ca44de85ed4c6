//! Raw query sanitation
//!
//! Every query passes through here before canonicalization. Control and
//! zero-width characters are stripped so that pasted text can't smuggle
//! invisible payload into cache keys or prompts.

/// Maximum characters accepted for a raw query after sanitation.
pub const MAX_QUERY_CHARS: usize = 200;

fn is_control(c: char) -> bool {
    matches!(c, '\u{0000}'..='\u{001F}' | '\u{007F}')
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}')
}

/// Strip control/zero-width characters, collapse whitespace runs to single
/// spaces, trim, and clamp to [`MAX_QUERY_CHARS`].
pub fn sanitize_query(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !is_control(*c) && !is_zero_width(*c))
        .collect();

    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_QUERY_CHARS)
        .collect()
}

/// Detect characters that [`sanitize_query`] would remove.
pub fn has_control_chars(input: &str) -> bool {
    input.chars().any(|c| is_control(c) || is_zero_width(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_control_chars_and_collapses_whitespace() {
        let input = "Hello\u{0000}   world \u{200B}";
        assert_eq!(sanitize_query(input), "Hello world");
    }

    #[test]
    fn clamps_to_max_length() {
        let input = "a".repeat(MAX_QUERY_CHARS + 20);
        assert_eq!(sanitize_query(&input).chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn detects_control_chars() {
        assert!(has_control_chars("ok\u{0007}"));
        assert!(has_control_chars("ok\u{FEFF}"));
        assert!(!has_control_chars("How does gravity work?"));
    }

    #[test]
    fn plain_query_is_untouched() {
        assert_eq!(sanitize_query("black holes"), "black holes");
    }
}
