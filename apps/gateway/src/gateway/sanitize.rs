//! Escaping of user-supplied text before it is persisted or broadcast.

/// Trim surrounding whitespace, drop control characters (other than newline
/// and tab) and escape HTML markup.
pub fn sanitize_text(input: &str) -> String {
    let trimmed = input.trim();
    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_unchanged() {
        assert_eq!(sanitize_text("hi"), "hi");
        assert_eq!(sanitize_text("  hello there \n"), "hello there");
    }

    #[test]
    fn markup_is_escaped() {
        assert_eq!(
            sanitize_text("<script>alert('x')</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;&#x2F;script&gt;"
        );
        assert_eq!(sanitize_text("a & b"), "a &amp; b");
    }

    #[test]
    fn control_characters_are_dropped_but_newlines_kept() {
        assert_eq!(sanitize_text("line1\nline2\u{0007}"), "line1\nline2");
        assert_eq!(sanitize_text("tab\there"), "tab\there");
    }
}
