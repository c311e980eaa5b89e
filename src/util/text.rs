/// Normalises text extracted from remote documents before it is stored or logged.
///
/// Feed titles and descriptions are attacker-controlled. Control characters
/// (including ESC, so ANSI sequences lose their trigger byte) are dropped and
/// runs of whitespace collapse to a single space.
pub fn clean_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;

    for c in s.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if c.is_control() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    out
}

/// Single-line preview of a response body for debug logs.
pub fn content_preview(content: &str, max_chars: usize) -> String {
    if content.is_empty() {
        return "(empty)".to_string();
    }

    let flat: String = content
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .collect();

    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}
