//! Output formatting for CLI commands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, PartIndexArgs};
use crate::error::Result;
use crate::events::StatsSnapshot;
use crate::scheduler::BuildAttempt;

/// State of one part.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartStatus {
    pub name: String,
    pub rows: u64,
    pub merging: bool,
    /// Index name to "built", "decoupled" or "missing".
    pub indices: BTreeMap<String, String>,
}

/// Result structure for the status command.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableStatus {
    pub table: String,
    pub metadata_version: u64,
    pub parts: Vec<PartStatus>,
}

/// Result structure for the build command.
#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub attempts: Vec<BuildAttemptRecord>,
    pub stats: StatsSnapshot,
    pub duration_ms: u64,
}

/// One build as shown to the user.
#[derive(Debug, Serialize)]
pub struct BuildAttemptRecord {
    pub part: String,
    pub index: String,
    pub mode: String,
    pub outcome: String,
}

impl From<&BuildAttempt> for BuildAttemptRecord {
    fn from(attempt: &BuildAttempt) -> Self {
        let outcome = match &attempt.outcome {
            crate::events::BuildOutcome::Status(status) => status.to_string(),
            crate::events::BuildOutcome::Cancelled => "CANCELLED".to_string(),
            crate::events::BuildOutcome::Failed(reason) => format!("FAILED: {reason}"),
        };
        BuildAttemptRecord {
            part: attempt.part_name.clone(),
            index: attempt.index_name.clone(),
            mode: attempt.mode.to_string(),
            outcome,
        }
    }
}

/// Result of verifying one part.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartVerification {
    pub part: String,
    pub files: usize,
    pub mismatches: Vec<String>,
}

/// Result structure for the verify command.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyReport {
    pub parts: Vec<PartVerification>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.parts.iter().all(|p| p.mismatches.is_empty())
    }
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &PartIndexArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &PartIndexArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    let type_name = std::any::type_name::<T>();
    if type_name.ends_with("TableStatus") {
        output_table_status_human(&value)
    } else if type_name.ends_with("BuildSummary") {
        output_build_summary_human(&value)
    } else {
        output_generic_human(&value)
    }
}

fn output_table_status_human(value: &serde_json::Value) -> Result<()> {
    if let Some(obj) = value.as_object() {
        if let Some(table) = obj.get("table").and_then(|t| t.as_str()) {
            println!("Table: {table}");
        }
        if let Some(version) = obj.get("metadata_version").and_then(|v| v.as_u64()) {
            println!("Metadata version: {version}");
        }
        println!("════════════════");

        for part in obj.get("parts").and_then(|p| p.as_array()).into_iter().flatten() {
            let name = part.get("name").and_then(|n| n.as_str()).unwrap_or("?");
            let rows = part.get("rows").and_then(|r| r.as_u64()).unwrap_or(0);
            let merging = part.get("merging").and_then(|m| m.as_bool()).unwrap_or(false);
            println!();
            println!("{name} ({rows} rows){}", if merging { " [merging]" } else { "" });
            if let Some(indices) = part.get("indices").and_then(|i| i.as_object()) {
                for (index, state) in indices {
                    println!("  {index}: {}", format_value(state));
                }
            }
        }
    }
    Ok(())
}

fn output_build_summary_human(value: &serde_json::Value) -> Result<()> {
    if let Some(obj) = value.as_object() {
        let attempts = obj.get("attempts").and_then(|a| a.as_array());
        for attempt in attempts.into_iter().flatten() {
            let field = |key: &str| attempt.get(key).map(format_value).unwrap_or_default();
            println!(
                "{} / {} ({}): {}",
                field("part"),
                field("index"),
                field("mode"),
                field("outcome")
            );
        }
        if let Some(duration) = obj.get("duration_ms").and_then(|d| d.as_u64()) {
            println!();
            println!("Finished in {duration} ms");
        }
        if let Some(stats) = obj.get("stats") {
            output_generic_human(stats)?;
        }
    }
    Ok(())
}

fn output_generic_human(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                let formatted_val = format_value(val);
                println!("{key}: {formatted_val}");
            }
        }
        _ => {
            let formatted_value = format_value(value);
            println!("{formatted_value}");
        }
    }
    Ok(())
}

fn output_json<T: Serialize>(result: &T, args: &PartIndexArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}
