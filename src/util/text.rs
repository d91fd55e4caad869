use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const ELLIPSIS: char = '…';

fn is_unsafe_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

/// Strip terminal control characters and ANSI escape sequences from feed text.
///
/// Titles and descriptions come from arbitrary servers and end up on the
/// user's terminal. CSI (`ESC [ … final`) and OSC (`ESC ] … BEL|ST`) sequences
/// are removed whole, any other control character individually. Tab, newline
/// and carriage return are kept.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_unsafe_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            if !is_unsafe_control(c) {
                out.push(c);
            }
            continue;
        }

        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameters and intermediates up to and including the final byte
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

/// Flattens text to a single line: control characters removed, every run of
/// whitespace (including newlines) replaced by one space, ends trimmed.
pub fn single_line(s: &str) -> String {
    strip_control_chars(s)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rough plain-text rendering of an HTML description for terminal output.
///
/// Drops everything between `<` and `>` and flattens whitespace. Entities
/// are left alone; the tokenizer already decoded the XML layer.
pub fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    single_line(&text)
}

/// Truncates `s` to at most `max_width` terminal columns, ending with `…`
/// when something was cut.
///
/// Widths come from `unicode-width`, so CJK characters and emoji count as two
/// columns. Returns the input unchanged (borrowed) when it already fits.
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if UnicodeWidthStr::width(s) <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width == 0 {
        return Cow::Borrowed("");
    }

    let budget = max_width - 1; // room for the ellipsis
    let mut used = 0;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        end = idx + c.len_utf8();
    }

    let mut out = String::with_capacity(end + ELLIPSIS.len_utf8());
    out.push_str(&s[..end]);
    out.push(ELLIPSIS);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_clean_text_is_borrowed() {
        assert!(matches!(
            strip_control_chars("Plain title, 世界"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_strip_keeps_tab_newline_cr() {
        assert_eq!(strip_control_chars("a\tb\nc\rd"), "a\tb\nc\rd");
    }

    #[test]
    fn test_strip_removes_controls_and_del() {
        assert_eq!(strip_control_chars("a\x00b\x07c\x7fd"), "abcd");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_control_chars("\x1b[2J\x1b[Hhome"), "home");
        assert_eq!(strip_control_chars("\x1b]0;title\x07after"), "after");
        assert_eq!(strip_control_chars("\x1b]8;;http://x\x1b\\link"), "link");
        assert_eq!(strip_control_chars("bare\x1bX"), "bareX");
    }

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("  Breaking:\n  news \t today  "), "Breaking: news today");
        assert_eq!(single_line(""), "");
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(
            strip_tags(r#"<p>Hello <b>world</b></p><img src="x.jpg"/>"#),
            "Hello world"
        );
        assert_eq!(strip_tags("no markup"), "no markup");
        assert_eq!(strip_tags("a > b"), "a > b");
    }

    #[test]
    fn test_truncate_fits() {
        assert!(matches!(truncate_to_width("Short", 10), Cow::Borrowed(_)));
        assert_eq!(truncate_to_width("Exact", 5), "Exact");
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_to_width("Hello World", 8), "Hello W…");
    }

    #[test]
    fn test_truncate_wide_chars() {
        // Each CJK char is 2 columns; 7 columns leave 6 for text
        assert_eq!(truncate_to_width("你好世界你好", 7), "你好世…");
        // A wide char that does not fit entirely is dropped
        assert_eq!(truncate_to_width("你好世界", 4), "你…");
    }

    #[test]
    fn test_truncate_tiny_widths() {
        assert_eq!(truncate_to_width("Test", 0), "");
        assert_eq!(truncate_to_width("Test", 1), "…");
    }

    proptest! {
        #[test]
        fn prop_truncate_never_exceeds_width(
            s in "[a-zA-Z0-9 .,]{0,20}[一-龥]{0,10}[a-z]{0,5}",
            width in 0usize..30,
        ) {
            let out = truncate_to_width(&s, width);
            prop_assert!(UnicodeWidthStr::width(out.as_ref()) <= width);
        }

        #[test]
        fn prop_stripped_text_has_no_escapes(s in ".{0,60}") {
            let out = strip_control_chars(&s);
            prop_assert!(!out.contains('\x1b'));
        }
    }
}
