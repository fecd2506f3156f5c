//! Small shared helpers: clock access, timestamp display, text previews

use chrono::{Local, TimeZone};

/// Milliseconds since the Unix epoch. The only clock the engine reads.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render a stored millisecond timestamp as a local human-readable string.
/// Millisecond timestamps never leave the SQL layer in any other form.
pub fn format_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("@{}ms", ms),
    }
}

/// Single-line preview of `text`, at most `max_chars` characters, with a
/// trailing ellipsis when truncated. Newlines collapse to spaces so the
/// preview stays on one line.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let truncated: String = flat.chars().take(max_chars).collect();
        format!("{}…", truncated)
    }
}

/// Round a similarity score to two decimal places for the tool surface.
pub fn round_score(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_text() {
        assert_eq!(preview("hello world", 60), "hello world");
    }

    #[test]
    fn preview_truncates_and_marks() {
        let long = "a".repeat(80);
        let p = preview(&long, 60);
        assert_eq!(p.chars().count(), 61);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn preview_flattens_newlines() {
        assert_eq!(preview("line one\nline two", 60), "line one line two");
    }

    #[test]
    fn round_score_two_decimals() {
        assert_eq!(round_score(0.876_54), 0.88);
        assert_eq!(round_score(1.0), 1.0);
    }

    #[test]
    fn format_timestamp_is_stable_for_valid_input() {
        let s = format_timestamp(now_ms());
        assert_eq!(s.len(), "2026-08-02 10:00:00".len());
    }
}
