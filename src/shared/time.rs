use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Coarse "Nh ago" rendering for CLI listings.
pub fn format_time_ago(then_secs: i64, now: i64) -> String {
    let delta = now.saturating_sub(then_secs);
    if delta < 60 {
        return "just now".to_string();
    }
    if delta < 3600 {
        return format!("{}m ago", delta / 60);
    }
    if delta < 86_400 {
        return format!("{}h ago", delta / 3600);
    }
    match chrono::DateTime::from_timestamp(then_secs, 0) {
        Some(ts) => ts.format("%b %-d").to_string(),
        None => format!("{}d ago", delta / 86_400),
    }
}
