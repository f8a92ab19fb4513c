//! Console output for virtbench
//!
//! Colored banners, messages and the end-of-run summary table. In JSON mode
//! messages become one JSON object per line and the summary is printed as
//! the summary record itself.

use colored::Colorize;
use serde::Serialize;
use std::io::{self, Write};

use virtbench::aggregate::TerminalReason;
use virtbench::report::{DetailRecord, SummaryRecord};

/// Output formatter for human and JSON modes
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// JSON output mode
    json_mode: bool,
    /// Verbosity level
    verbosity: u8,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        colored::control::set_override(use_color);

        Self {
            use_color,
            json_mode,
            verbosity,
        }
    }

    pub fn is_json(&self) -> bool {
        self.json_mode
    }

    /// Print a banner/header
    pub fn banner(&self, title: &str) {
        if self.json_mode {
            return;
        }

        let line = "=".repeat(title.len() + 4);
        if self.use_color {
            println!("\n{}", line.bright_blue());
            println!("{}", format!("  {}  ", title).bright_blue().bold());
            println!("{}\n", line.bright_blue());
        } else {
            println!("\n{}", line);
            println!("  {}  ", title);
            println!("{}\n", line);
        }
    }

    /// Print a section header
    pub fn section(&self, title: &str) {
        if self.json_mode {
            return;
        }

        if self.use_color {
            println!("\n{}", title.cyan().bold());
            println!("{}", "-".repeat(title.len()).cyan());
        } else {
            println!("\n{}", title);
            println!("{}", "-".repeat(title.len()));
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.json_mode {
            emit_json_line(&mut io::stderr(), "error", message);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.json_mode {
            emit_json_line(&mut io::stderr(), "warning", message);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {}", message);
        }
    }

    /// Print a hint message
    pub fn hint(&self, message: &str) {
        if self.json_mode {
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "HINT:".cyan().bold(), message);
        } else {
            eprintln!("HINT: {}", message);
        }
    }

    /// Print an info message (always shown in human mode)
    pub fn info(&self, message: &str) {
        if self.json_mode {
            return;
        }

        if self.use_color {
            println!("{} {}", "INFO:".blue(), message);
        } else {
            println!("INFO: {}", message);
        }
    }

    /// Print a debug message (requires -vv)
    pub fn debug(&self, message: &str) {
        if self.verbosity < 2 || self.json_mode {
            return;
        }

        if self.use_color {
            println!("{} {}", "DEBUG:".bright_black(), message.bright_black());
        } else {
            println!("DEBUG: {}", message);
        }
    }

    /// Print any serializable value as pretty JSON on stdout
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => self.error(&format!("Failed to encode JSON output: {}", e)),
        }
    }

    /// End-of-run summary: counts, per-metric table and failures.
    pub fn summary(&self, summary: &SummaryRecord, details: &[DetailRecord]) {
        if self.json_mode {
            self.json(summary);
            return;
        }

        self.section(&format!("{} summary", summary.workload));

        let counts = format!(
            "total={} successful={} failed={} skipped={} duration={:.1}s",
            summary.total_count,
            summary.success_count,
            summary.fail_count,
            summary.skipped_count,
            summary.total_run_duration_sec
        );
        if self.use_color {
            let colored_counts = if summary.fail_count > 0 {
                counts.yellow()
            } else {
                counts.green()
            };
            println!("{}", colored_counts);
        } else {
            println!("{}", counts);
        }
        println!("terminal reason: {}", self.terminal_reason(summary.terminal_reason));

        if !summary.per_metric_stats.is_empty() {
            println!();
            let rows: Vec<Vec<String>> = summary
                .per_metric_stats
                .iter()
                .map(|m| {
                    vec![
                        m.metric.clone(),
                        m.count.to_string(),
                        format!("{:.2}", m.avg),
                        format!("{:.2}", m.min),
                        format!("{:.2}", m.max),
                    ]
                })
                .collect();
            self.table(&["metric", "count", "avg (s)", "min (s)", "max (s)"], &rows);
        }

        if !summary.failures_by_reason.is_empty() {
            println!();
            for (reason, count) in &summary.failures_by_reason {
                println!("  {:<18} {}", reason.as_str(), count);
            }
        }

        let failures: Vec<&DetailRecord> = details
            .iter()
            .filter(|d| !d.success && d.message.is_some())
            .collect();
        if !failures.is_empty() && self.verbosity > 0 {
            self.section("Failures");
            for detail in failures {
                let reason = detail.failure_reason.map(|r| r.as_str()).unwrap_or("error");
                println!(
                    "  {}/{} [{}] {}",
                    detail.scope,
                    detail.target,
                    reason,
                    detail.message.as_deref().unwrap_or_default()
                );
            }
        }
    }

    fn terminal_reason(&self, reason: TerminalReason) -> String {
        if !self.use_color {
            return reason.as_str().to_string();
        }
        match reason {
            TerminalReason::NormalCompletion | TerminalReason::LimitReached => reason.as_str().green().to_string(),
            TerminalReason::CapacityExhausted => reason.as_str().cyan().bold().to_string(),
            _ => reason.as_str().red().bold().to_string(),
        }
    }

    /// Print a table
    pub fn table(&self, headers: &[&str], rows: &[Vec<String>]) {
        // Calculate column widths
        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
        }

        let header_line = headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
            .collect::<Vec<_>>()
            .join(" | ");
        let sep = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-");

        if self.use_color {
            println!("{}", header_line.bright_white().bold());
            println!("{}", sep.bright_black());
        } else {
            println!("{}", header_line);
            println!("{}", sep);
        }

        for row in rows {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:width$}", cell, width = *width))
                .collect::<Vec<_>>()
                .join(" | ");
            println!("{}", line);
        }
    }

    /// Flush stdout
    pub fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

fn emit_json_line(out: &mut impl Write, kind: &str, message: &str) {
    let line = serde_json::json!({
        "type": kind,
        "message": message
    });
    let _ = writeln!(out, "{}", line);
}
