// Output formatting and display for CLI

use crate::config::{ProcessSpec, WardenConfig};
use crate::error::WardenError;
use crate::process::{ProcessRecord, ProcessState};
use chrono::{DateTime, Local};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// One diagnostic line per failed process
pub fn print_process_errors(action: &str, errors: &[(String, WardenError)]) {
    for (name, error) in errors {
        eprintln!(
            "{} {} {}: {}",
            "✗".red().bold(),
            format!("Failed to {}", action).red(),
            name.cyan(),
            error
        );
        if error.is_leak() {
            eprintln!("  {}", "the process may still be running".yellow());
        }
    }
}

/// Print a formatted table of supervised processes
pub fn print_status_table(records: &[ProcessRecord]) {
    if records.is_empty() {
        println!("{}", "No processes are registered".yellow());
        return;
    }

    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Exit")]
        exit: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Started")]
        started: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
    }

    let rows: Vec<StatusRow> = records
        .iter()
        .map(|record| StatusRow {
            name: truncate(record.name(), 20),
            state: format_state_colored(record),
            pid: record
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            exit: format_exit(record),
            cpu: record
                .last_resource_snapshot
                .map(|s| format!("{:.1}%", s.cpu_usage))
                .unwrap_or_else(|| "-".to_string()),
            memory: record
                .last_resource_snapshot
                .map(|s| format_memory(s.memory_bytes))
                .unwrap_or_else(|| "-".to_string()),
            started: record
                .started_at
                .map(|started| {
                    let datetime: DateTime<Local> = started.into();
                    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
                })
                .unwrap_or_else(|| "-".to_string()),
            restarts: format!("{}/{}", record.restart_count, record.spec.max_restarts),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", records.len())
            .dimmed()
            .italic()
    );
}

/// Print the specs of a validated configuration
pub fn print_config(config: &WardenConfig) {
    #[derive(Tabled)]
    struct SpecRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Restart")]
        restart: String,
        #[tabled(rename = "Backoff")]
        backoff: String,
        #[tabled(rename = "Stop Timeout")]
        stop_timeout: String,
    }

    let rows: Vec<SpecRow> = config
        .processes
        .iter()
        .map(|spec| SpecRow {
            name: truncate(&spec.name, 20),
            command: truncate(&format_command(spec), 40),
            restart: if spec.restart_on_failure {
                format!("up to {}", spec.max_restarts)
            } else {
                "never".to_string()
            },
            backoff: format_duration(&spec.restart_backoff_base()),
            stop_timeout: format_duration(&spec.stop_timeout_duration()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!(
            "poll every {}, backoff cap {}, shutdown timeout {}",
            format_duration(&config.supervisor.poll_interval()),
            format_duration(&config.supervisor.max_backoff()),
            format_duration(&config.supervisor.shutdown_timeout()),
        )
        .dimmed()
        .italic()
    );
}

/// Format a record's state with color coding
fn format_state_colored(record: &ProcessRecord) -> String {
    let state = record.state;
    let label = if record.restart_pending {
        "restarting".to_string()
    } else if record.force_kill_failed {
        format!("{} (leaked)", state)
    } else {
        state.to_string()
    };

    match state {
        ProcessState::Running => label.green().to_string(),
        ProcessState::Pending if record.restart_pending => label.yellow().to_string(),
        ProcessState::Pending => label.normal().to_string(),
        ProcessState::Stopping => label.yellow().to_string(),
        ProcessState::Completed => label.cyan().to_string(),
        ProcessState::Stopped => label.bright_black().to_string(),
        ProcessState::Failed => label.red().bold().to_string(),
    }
}

fn format_exit(record: &ProcessRecord) -> String {
    match (record.exit_code, record.exit_signal) {
        (Some(code), _) => code.to_string(),
        (None, Some(signal)) => format!("sig {}", signal),
        (None, None) => "-".to_string(),
    }
}

fn format_command(spec: &ProcessSpec) -> String {
    let mut command = spec.command.display().to_string();
    for arg in &spec.args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
