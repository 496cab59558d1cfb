/// Cap captured tool output kept in error messages.
pub const MAX_REPORTED_OUTPUT_BYTES: usize = 16 * 1024;

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated.push_str("\n[... output truncated ...]");
    truncated
}

pub fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
