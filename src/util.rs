//! Shared utility functions.

/// Extract the last top-level JSON object from text that may contain other
/// content (solver banners, progress lines).
///
/// Braces inside JSON strings are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut found = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    found = start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }

    found
}
