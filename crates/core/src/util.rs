/// First line of a commit message, truncated to `max_chars` characters.
pub fn message_preview(message: &str, max_chars: usize) -> String {
    let first_line = message.lines().next().unwrap_or_default().trim_end();
    match first_line.char_indices().nth(max_chars) {
        Some((idx, _)) => first_line[..idx].to_string(),
        None => first_line.to_string(),
    }
}

/// Format a size in bytes to a human-readable string.
/// Uses binary (kibi = 1024) units, formatted to two decimal places.
pub fn size(value: u64) -> String {
    let units = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = value as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < units.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, units[unit])
}
