//! Plain-text formatting of snapshots for the terminal

use chrono::{DateTime, Duration, Utc};

use crate::snapshot::CombinedSnapshot;

pub const DEFAULT_BAR_WIDTH: usize = 15;

/// Human-readable token count: 999, 1.2K, 123K, 1.23M, 12.3M
pub fn format_tokens(n: i64) -> String {
    if n < 0 {
        return format!("-{}", format_tokens(n.saturating_neg()));
    }
    let value = n as f64;
    match n {
        0..=999 => n.to_string(),
        1_000..=9_999 => format!("{:.1}K", value / 1e3),
        10_000..=999_999 => format!("{:.0}K", value / 1e3),
        1_000_000..=9_999_999 => format!("{:.2}M", value / 1e6),
        _ => format!("{:.1}M", value / 1e6),
    }
}

/// Progress bar like `▓▓▓▓▓▓▓░░░░░░░░ 47%`; `fraction` is clamped to 0..=1.
pub fn usage_bar(fraction: f64, width: usize) -> String {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    let filled = ((fraction * width as f64).round() as usize).min(width);
    format!(
        "{}{} {:.0}%",
        "▓".repeat(filled),
        "░".repeat(width - filled),
        fraction * 100.0
    )
}

/// Short countdown such as `3d 4h`, `2h 13m` or `45m`
pub fn format_countdown(remaining: Duration) -> String {
    let minutes = remaining.num_minutes();
    if minutes <= 0 {
        return "now".to_string();
    }
    let (days, hours, mins) = (minutes / 1440, minutes / 60 % 24, minutes % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

fn quota_line(label: &str, fraction: f64, resets_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let bar = usage_bar(fraction, DEFAULT_BAR_WIDTH);
    match resets_at {
        Some(at) => format!(
            "{:<9}{}  resets in {} ({})",
            label,
            bar,
            format_countdown(at - now),
            at.format("%a %H:%M UTC")
        ),
        None => format!("{:<9}{}", label, bar),
    }
}

fn tokens(n: u64) -> String {
    format_tokens(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Lines shown by the binary's text output
pub fn summary_lines(snapshot: &CombinedSnapshot, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = vec![
        quota_line("Session", snapshot.session_pct, snapshot.session_resets_at, now),
        quota_line("Weekly", snapshot.weekly_pct, snapshot.weekly_resets_at, now),
        quota_line("Sonnet", snapshot.sonnet_pct, snapshot.sonnet_resets_at, now),
    ];

    if let Some(extra) = &snapshot.extra_usage {
        lines.push(format!(
            "{:<9}${:.2} / ${:.2} ({:.0}%)",
            "Extra",
            extra.spent,
            extra.limit,
            extra.utilization * 100.0
        ));
    }

    lines.push(format!(
        "{:<9}billable {} (input {}, output {}, cache write {}, cache read {})",
        "Tokens",
        tokens(snapshot.billable_total),
        tokens(snapshot.input_tokens),
        tokens(snapshot.output_tokens),
        tokens(snapshot.cache_creation),
        tokens(snapshot.cache_read)
    ));

    if let (Some(start), Some(end)) = (snapshot.window_start, snapshot.window_end) {
        let hours = (end - start).num_minutes() as f64 / 60.0;
        lines.push(format!(
            "{:<9}{} sessions in last {}h ({} records, {} files)",
            "Activity", snapshot.session_count, hours, snapshot.record_count, snapshot.files_scanned
        ));
    }

    if !snapshot.subscription_type.is_empty() || !snapshot.rate_tier.is_empty() {
        lines.push(format!(
            "{:<9}{} {}",
            "Plan", snapshot.subscription_type, snapshot.rate_tier
        ).trim_end().to_string());
    }

    if let Some(error) = &snapshot.error {
        lines.push(format!("{:<9}{}", "Error", error));
    }

    lines.push(format!(
        "{:<9}{}",
        "Updated",
        snapshot.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    lines
}
