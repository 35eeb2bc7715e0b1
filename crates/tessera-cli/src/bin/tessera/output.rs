//! Output formatting for CLI responses.
//!
//! Supports both human-readable and JSON output formats for
//! integration with scripts and other tools.

use tessera_cache::CacheEntry;
use tessera_ci::WorkflowRun;
use tessera_ci::orchestrator::CellRun;
use tessera_ci::orchestrator::StepStatus;
use tessera_ci_core::MatrixCell;

/// Trait for types that can be output in multiple formats.
pub trait Outputable {
    /// Convert to JSON value for structured output.
    fn to_json(&self) -> serde_json::Value;

    /// Convert to human-readable string.
    fn to_human(&self) -> String;
}

/// Print a value in the appropriate format.
pub fn print_output<T: Outputable>(value: &T, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&value.to_json())
                .unwrap_or_else(|e| { format!("{{\"error\": \"failed to serialize: {}\"}}", e) })
        );
    } else {
        println!("{}", value.to_human());
    }
}

/// Print a success message.
pub fn print_success(message: &str, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": "success",
                "message": message
            })
        );
    } else {
        println!("{}", message);
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| serde_json::json!({ "error": format!("failed to serialize: {e}") }))
}

fn format_duration_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
    }
}

fn cell_duration_ms(cell: &CellRun) -> Option<u64> {
    let (start, end) = (cell.started_at?, cell.completed_at?);
    u64::try_from((end - start).num_milliseconds()).ok()
}

/// Full run record.
pub struct RunOutput {
    pub run: WorkflowRun,
}

impl Outputable for RunOutput {
    fn to_json(&self) -> serde_json::Value {
        to_value(&self.run)
    }

    fn to_human(&self) -> String {
        let run = &self.run;
        let mut output = format!(
            "Run {}\n\
             Workflow: {}\n\
             Event:    {} on {}\n\
             Status:   {}\n\n",
            run.id, run.workflow, run.event, run.branch, run.status
        );

        output.push_str(&format!("{:<32} {:<10} {:>9}  Detail\n", "Cell", "Status", "Duration"));
        output.push_str(&format!("{}\n", "-".repeat(72)));
        for cell in &run.cells {
            let duration = cell_duration_ms(cell).map(format_duration_ms).unwrap_or_else(|| "-".to_string());
            let detail = match &cell.failure {
                Some(failure) => match &failure.step {
                    Some(step) => format!("{} in '{}'", failure.kind, step),
                    None => failure.kind.to_string(),
                },
                None => String::new(),
            };
            output.push_str(&format!("{:<32} {:<10} {:>9}  {}\n", cell.id, cell.status, duration, detail));
        }

        for cell in &run.cells {
            let Some(failure) = &cell.failure else { continue };
            output.push_str(&format!("\n{} failed:\n", cell.id));
            for line in failure.message.lines() {
                output.push_str(&format!("  {line}\n"));
            }
            let logs = cell.steps.iter().filter(|s| s.status != StepStatus::Skipped).filter_map(|s| s.log_path.as_ref());
            if let Some(log) = logs.last() {
                output.push_str(&format!("  log: {}\n", log.display()));
            }
        }

        let artifacts: Vec<_> = run.cells.iter().flat_map(|c| c.artifacts.iter()).filter(|a| !a.is_empty()).collect();
        if !artifacts.is_empty() {
            output.push_str("\nArtifacts:\n");
            for artifact in artifacts {
                output.push_str(&format!(
                    "  {} ({} files, {} bytes) {}\n",
                    artifact.name,
                    artifact.files.len(),
                    artifact.size_bytes,
                    artifact.dir.display()
                ));
            }
        }

        output.trim_end().to_string()
    }
}

/// Detailed step listing for one run.
pub struct RunDetailOutput {
    pub run: WorkflowRun,
}

impl Outputable for RunDetailOutput {
    fn to_json(&self) -> serde_json::Value {
        to_value(&self.run)
    }

    fn to_human(&self) -> String {
        let mut output = RunOutput { run: self.run.clone() }.to_human();
        for cell in &self.run.cells {
            output.push_str(&format!("\n\n{} ({})\n", cell.id, cell.status));
            for step in &cell.steps {
                let exit = step.exit_code.map(|c| format!(" exit={c}")).unwrap_or_default();
                let cache = match &step.cache {
                    Some(outcome) if outcome.is_exact_hit() => " cache=hit".to_string(),
                    Some(outcome) if outcome.is_hit() => " cache=partial".to_string(),
                    Some(_) => " cache=miss".to_string(),
                    None => String::new(),
                };
                output.push_str(&format!(
                    "  {:<28} {:<10} {:>9}{}{}\n",
                    step.name,
                    step.status,
                    format_duration_ms(step.duration_ms),
                    exit,
                    cache
                ));
                if let Some(message) = &step.message {
                    output.push_str(&format!("      {message}\n"));
                }
            }
        }
        output.trim_end().to_string()
    }
}

/// Run list output.
pub struct RunListOutput {
    pub runs: Vec<WorkflowRun>,
}

impl Outputable for RunListOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.runs
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "workflow": r.workflow,
                        "event": r.event,
                        "branch": r.branch,
                        "status": r.status,
                        "created_at": r.created_at.to_rfc3339(),
                        "cells": r.cells.len(),
                        "failed_cells": r.failed_cells(),
                    })
                })
                .collect(),
        )
    }

    fn to_human(&self) -> String {
        if self.runs.is_empty() {
            return "No runs recorded".to_string();
        }

        let mut output = format!("Runs ({})\n", self.runs.len());
        output.push_str(&format!(
            "{:<36} {:<20} {:<10} {:>6}  {}\n",
            "ID", "Workflow", "Status", "Cells", "Created"
        ));
        output.push_str(&format!("{}\n", "-".repeat(100)));
        for run in &self.runs {
            output.push_str(&format!(
                "{:<36} {:<20} {:<10} {:>6}  {}\n",
                run.id,
                run.workflow,
                run.status,
                run.cells.len(),
                run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        output.trim_end().to_string()
    }
}

/// Expanded matrix output.
pub struct MatrixOutput {
    pub workflow: String,
    pub fail_fast: bool,
    pub parallelism: usize,
    pub cells: Vec<MatrixCell>,
}

impl Outputable for MatrixOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "workflow": self.workflow,
            "fail_fast": self.fail_fast,
            "parallelism": self.parallelism,
            "cells": self.cells.iter().map(|c| serde_json::json!({
                "index": c.index,
                "id": c.id(),
                "os": c.os,
                "version": c.version,
            })).collect::<Vec<_>>(),
        })
    }

    fn to_human(&self) -> String {
        let mut output = format!(
            "Matrix for {} ({} cells, fail_fast={}, parallelism={})\n",
            self.workflow,
            self.cells.len(),
            self.fail_fast,
            self.parallelism
        );
        output.push_str(&format!("{:>5}  {:<24} {:<10}\n", "Index", "OS", "Version"));
        for cell in &self.cells {
            output.push_str(&format!("{:>5}  {:<24} {:<10}\n", cell.index, cell.os, cell.version));
        }
        output.trim_end().to_string()
    }
}

/// Workflow validation result.
pub struct ValidateOutput {
    pub workflow: String,
    pub cells: usize,
    pub steps: Vec<(String, String)>,
}

impl Outputable for ValidateOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "valid": true,
            "workflow": self.workflow,
            "cells": self.cells,
            "steps": self.steps.iter().map(|(name, kind)| serde_json::json!({
                "name": name,
                "kind": kind,
            })).collect::<Vec<_>>(),
        })
    }

    fn to_human(&self) -> String {
        let mut output = format!("Workflow '{}' is valid: {} cells, {} steps\n", self.workflow, self.cells, self.steps.len());
        for (i, (name, kind)) in self.steps.iter().enumerate() {
            output.push_str(&format!("  {:>2}. {:<32} [{}]\n", i + 1, name, kind));
        }
        output.trim_end().to_string()
    }
}

/// Cache entry listing.
pub struct CacheListOutput {
    pub entries: Vec<CacheEntry>,
}

impl Outputable for CacheListOutput {
    fn to_json(&self) -> serde_json::Value {
        to_value(&self.entries)
    }

    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "Cache is empty".to_string();
        }
        let total: u64 = self.entries.iter().map(|e| e.size_bytes).sum();
        let mut output = format!("Cache entries ({}, {} bytes)\n", self.entries.len(), total);
        output.push_str(&format!("{:<48} {:>12}  {}\n", "Key", "Size", "Created"));
        output.push_str(&format!("{}\n", "-".repeat(84)));
        for entry in &self.entries {
            output.push_str(&format!(
                "{:<48} {:>12}  {}\n",
                entry.key,
                entry.size_bytes,
                entry.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        output.trim_end().to_string()
    }
}

/// Single cache entry.
pub struct CacheEntryOutput {
    pub entry: CacheEntry,
}

impl Outputable for CacheEntryOutput {
    fn to_json(&self) -> serde_json::Value {
        to_value(&self.entry)
    }

    fn to_human(&self) -> String {
        format!(
            "Cache Entry\n\
             ===========\n\
             Key:      {}\n\
             Archive:  {}\n\
             Digest:   {}\n\
             Size:     {} bytes\n\
             Created:  {}\n\
             Paths:    {}",
            self.entry.key,
            self.entry.archive,
            self.entry.digest,
            self.entry.size_bytes,
            self.entry.created_at.to_rfc3339(),
            self.entry.paths.join(", ")
        )
    }
}
