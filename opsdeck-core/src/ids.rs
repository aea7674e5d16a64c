use uuid::Uuid;

/// Generate an opaque hyphenated id for sessions, clients and issues.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Reduce an arbitrary tag to something safe inside a file name.
/// Lowercases and maps every byte outside `[a-z0-9._-]` to `-`.
pub fn filename_safe(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    for ch in tag.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_hyphenated() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }

    #[test]
    fn filename_safe_replaces_hostile_bytes() {
        assert_eq!(filename_safe("Claude Code v2"), "claude-code-v2");
        assert_eq!(filename_safe("a/b\\c:d"), "a-b-c-d");
        assert_eq!(filename_safe("keep.these_chars-ok"), "keep.these_chars-ok");
        assert_eq!(filename_safe(""), "untitled");
    }
}
