//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::engine::merge::{DisplayStatus, MergeRequest, MergeRequestView};

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.len()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print a table header
    pub fn table_header(columns: &[&str]) {
        let header = columns
            .iter()
            .map(|c| c.bright_white().bold().to_string())
            .collect::<Vec<_>>()
            .join(" │ ");
        println!("  {}", header);
        println!("  {}", "─".repeat(header.len()).bright_black());
    }

    /// Print a table row
    pub fn table_row(values: &[&str]) {
        println!("  {}", values.join(" │ "));
    }

    /// Print the stored fields of a merge request
    pub fn merge_request(request: &MergeRequest) {
        Self::kv("Merge request", &request.id.to_string());
        Self::kv("Initiator club", &request.club_a_id.to_string());
        Self::kv("Target club", &request.club_b_id.to_string());
        Self::kv("Initiator accepted", yes_no(request.initiator_accepted));
        Self::kv("Target accepted", yes_no(request.target_accepted));
        if let Some(club) = request.merged_club_id {
            Self::kv("Merged club", &club.to_string());
        }
        Self::kv("Created", &format_timestamp(&request.created_at));
    }

    /// Print one merge request as seen by a club
    pub fn merge_view(view: &MergeRequestView) {
        println!(
            "  {} #{} with {} ({})",
            status_badge(view.status),
            view.merge_request_id,
            view.other_club_name.bright_white().bold(),
            view.other_club_id
        );
        println!("    {}", view.message.bright_black());
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Colored badge text for a display status
pub fn status_badge(status: DisplayStatus) -> String {
    let label = format!("[{}]", status.label());
    match status {
        DisplayStatus::MergeComplete => label.green().bold().to_string(),
        DisplayStatus::ReadyToMerge => label.cyan().bold().to_string(),
        DisplayStatus::ActionRequired => label.yellow().bold().to_string(),
        DisplayStatus::Pending => label.bright_black().to_string(),
    }
}

/// Format a timestamp for terminal output
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(format_timestamp(&at), "2024-03-09 14:05 UTC");
    }

    #[test]
    fn test_status_badge_contains_label() {
        colored::control::set_override(false);
        assert_eq!(status_badge(DisplayStatus::ActionRequired), "[Action Required]");
        assert_eq!(status_badge(DisplayStatus::MergeComplete), "[Merge Complete]");
    }
}
