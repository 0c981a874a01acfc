//! Output formatting utilities for the CLI
//!
//! Tables for forwarding reports and colored status messages.

use serde::Serialize;
use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};
use weft_core::RemoteServiceStatus;
use weft_services::ServiceReport;

/// Format forwarding reports as an ASCII table
///
/// Returns "No forwardings requested" when there is nothing to show.
pub fn format_reports(reports: &[ServiceReport]) -> String {
    if reports.is_empty() {
        return "No forwardings requested".to_string();
    }

    #[derive(Tabled)]
    struct ReportRow {
        #[tabled(rename = "FORWARDING")]
        name: String,
        #[tabled(rename = "REMOTE")]
        remote: String,
        #[tabled(rename = "LOCAL")]
        local: String,
        #[tabled(rename = "ERROR")]
        error: String,
    }

    let rows: Vec<ReportRow> = reports
        .iter()
        .map(|r| ReportRow {
            name: r.name.clone(),
            remote: status_label(r.status).to_string(),
            local: if r.local_started { "started" } else { "not started" }.to_string(),
            error: r.error.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(120))
        .to_string()
}

/// Format forwarding reports as JSON
pub fn format_reports_json(reports: &[ServiceReport]) -> serde_json::Result<String> {
    #[derive(Serialize)]
    struct ReportJson<'a> {
        name: &'a str,
        remote: &'static str,
        local_started: bool,
        error: Option<&'a str>,
    }

    let rows: Vec<ReportJson<'_>> = reports
        .iter()
        .map(|r| ReportJson {
            name: &r.name,
            remote: status_label(r.status),
            local_started: r.local_started,
            error: r.error.as_deref(),
        })
        .collect();

    serde_json::to_string_pretty(&rows)
}

fn status_label(status: Option<RemoteServiceStatus>) -> &'static str {
    match status {
        Some(RemoteServiceStatus::NotFound) => "not found",
        Some(RemoteServiceStatus::Starting) => "starting",
        Some(RemoteServiceStatus::Running) => "running",
        Some(RemoteServiceStatus::Failed) => "failed",
        None => "unknown",
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in blue
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Blue),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
