/// Format seconds into MM:SS or HH:MM:SS
pub fn format_time(seconds: f64) -> String {
    let total_secs = seconds.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS` (fractional seconds allowed) into seconds
pub fn parse_time(input: &str) -> Option<f64> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let (last, rest) = parts.split_last()?;
    let secs: f64 = last.parse().ok().filter(|s: &f64| s.is_finite() && *s >= 0.0)?;
    let mut total = 0.0;
    for part in rest {
        let value: u32 = part.parse().ok()?;
        total = total * 60.0 + f64::from(value);
    }
    Some(total * 60.0 + secs)
}
