use crate::output::{format_secs, print_json};
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::Subcommand;
use igupd_core::schedule::{next_window, validate, Schedule};

// ---------------------------------------------------------------------------
// Subcommand definition
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum ScheduleSubcommand {
    /// Check a schedule list, or a document of named schedules
    Validate {
        /// JSON text, or @path to read it from a file
        document: String,
    },
    /// Show when the next window opens and closes
    Next {
        /// Schedule list as JSON text, or @path
        schedule: String,
        /// Reference local time, e.g. 2024-01-01T10:30 (default: now)
        #[arg(long)]
        at: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn run(subcommand: ScheduleSubcommand, json: bool) -> Result<()> {
    match subcommand {
        ScheduleSubcommand::Validate { document } => run_validate(&document, json),
        ScheduleSubcommand::Next { schedule, at } => run_next(&schedule, at.as_deref(), json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn run_validate(arg: &str, json: bool) -> Result<()> {
    let text = super::read_document(arg)?;
    let value: serde_json::Value = serde_json::from_str(&text).context("not valid JSON")?;

    let results: Vec<(String, bool)> = match &value {
        serde_json::Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(name, schedule)| (name.clone(), validate(schedule)))
            .collect(),
        other => vec![("schedule".to_string(), validate(other))],
    };

    if json {
        let report: serde_json::Map<String, serde_json::Value> = results
            .iter()
            .map(|(name, ok)| (name.clone(), serde_json::Value::Bool(*ok)))
            .collect();
        print_json(&report)?;
    } else {
        for (name, ok) in &results {
            println!("{name}: {}", if *ok { "valid" } else { "invalid" });
        }
    }

    if results.iter().any(|(_, ok)| !ok) {
        bail!("invalid schedule");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// next
// ---------------------------------------------------------------------------

fn parse_at(at: Option<&str>) -> Result<NaiveDateTime> {
    let Some(at) = at else {
        return Ok(chrono::Local::now().naive_local());
    };
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(at, fmt).ok())
        .with_context(|| format!("invalid --at '{at}': expected YYYY-MM-DDTHH:MM[:SS]"))
}

fn run_next(arg: &str, at: Option<&str>, json: bool) -> Result<()> {
    let text = super::read_document(arg)?;
    let schedule: Schedule = serde_json::from_str(&text).context("invalid schedule")?;
    let from = parse_at(at)?;
    let window = next_window(from, Some(&schedule));

    if json {
        return print_json(&serde_json::json!({
            "from": from.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "start_secs": window.start.as_secs(),
            "end_secs": window.end.as_secs(),
            "always_open": window.is_always_open(),
        }));
    }

    if window.is_always_open() {
        println!("always open");
    } else if window.is_open_now() {
        println!("open now, closes in {}", format_secs(window.end.as_secs()));
    } else {
        println!(
            "opens in {}, closes in {}",
            format_secs(window.start.as_secs()),
            format_secs(window.end.as_secs())
        );
    }
    Ok(())
}
