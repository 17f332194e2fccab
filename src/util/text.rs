use std::borrow::Cow;

/// Clean a feed or entry title for storage and terminal output.
///
/// Drops ANSI escape sequences (CSI `ESC [ ... final`, OSC `ESC ] ... BEL|ST`)
/// and C0/DEL control characters, and folds every whitespace run, line breaks
/// included, into a single space. Leading and trailing whitespace is removed.
///
/// Returns `Cow::Borrowed` when the title is already clean.
pub fn clean_title(s: &str) -> Cow<'_, str> {
    if is_clean(s) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
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
            },
            c if c.is_whitespace() => pending_space = !out.is_empty(),
            c if c.is_control() => {}
            c => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            }
        }
    }

    Cow::Owned(out)
}

fn is_clean(s: &str) -> bool {
    let mut previous_space = true;
    for c in s.chars() {
        if c == ' ' {
            if previous_space {
                return false;
            }
            previous_space = true;
        } else if c.is_whitespace() || c.is_control() {
            return false;
        } else {
            previous_space = false;
        }
    }
    !previous_space || s.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_title_borrows_when_clean() {
        let result = clean_title("Release notes for 2.0");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert!(matches!(clean_title(""), Cow::Borrowed(_)));
    }

    #[test]
    fn test_clean_title_folds_whitespace() {
        assert_eq!(clean_title("  Hello,\n\tworld  "), "Hello, world");
        assert_eq!(clean_title("a  b"), "a b");
    }

    #[test]
    fn test_clean_title_strips_controls() {
        assert_eq!(clean_title("he\x00ll\x07o\x7f"), "hello");
    }

    #[test]
    fn test_clean_title_strips_ansi_sequences() {
        assert_eq!(clean_title("\x1b[31mRed\x1b[0m title"), "Red title");
        assert_eq!(clean_title("\x1b]0;pwned\x07Title"), "Title");
        assert_eq!(clean_title("\x1b]8;;http://x\x1b\\Link"), "Link");
        assert_eq!(clean_title("bare\x1bescape"), "bareescape");
    }

    #[test]
    fn test_clean_title_keeps_unicode() {
        assert_eq!(clean_title("Café: 日本語"), "Café: 日本語");
    }
}
