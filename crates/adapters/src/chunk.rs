//! Outbound text chunking.
//!
//! Chat platforms cap message size in bytes; chunks must never split a
//! UTF-8 character. Splits prefer the last newline inside the window so
//! code blocks and paragraphs survive where possible.

/// Split `text` into pieces of at most `max_bytes` bytes each.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<String> {
    assert!(max_bytes > 0, "chunk size must be positive");
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let window = floor_char_boundary(rest, max_bytes);
        let split_at = match rest[..window].rfind('\n') {
            // Avoid degenerate empty chunks when the window starts with '\n'.
            Some(pos) if pos > 0 => pos + 1,
            _ => window,
        };
        chunks.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Largest index ≤ `max` that sits on a char boundary.
fn floor_char_boundary(text: &str, max: usize) -> usize {
    let mut index = max.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
