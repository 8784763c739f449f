use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const AVG_KEY: &str = "AVG";
pub const INCOMPLETE_SENTINEL: f64 = -1.0;

const TEST_MARKER: &str = "\"component\": \"test\"";
const ERR_TAIL_LINES: usize = 30;
const ERR_BLOCK_DELIMITER: &str = "*****************************************************";

const COLUMN_WIDTH: usize = 20;
const LABEL_TRUNCATE: usize = 10;

pub type ResultMatrix = BTreeMap<String, BTreeMap<String, f64>>;

pub struct ReferenceTable {
    steps: BTreeMap<String, u64>,
}

impl ReferenceTable {
    pub fn lra_defaults() -> Self {
        Self::from_entries([
            ("image", 35176),
            ("listops", 10000),
            ("pathfinder32-curv_contour_length_14", 62400),
            ("pathfinder32-curv_baseline", 62400),
            ("pathfinder32-curv_contour_length_9", 62400),
            ("text", 20000),
            ("retrieval", 30000),
        ])
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let steps = entries
            .into_iter()
            .map(|(task, count)| (task.into(), count))
            .collect();
        Self { steps }
    }

    pub fn expected_steps(&self, task: &str) -> Result<u64> {
        self.steps
            .get(task)
            .copied()
            .ok_or_else(|| anyhow!("no reference step count for task: {}", task))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId {
    pub task: String,
    pub replicate: u32,
}

/// Run files are named `<task>__<replicate>`; the task name itself may
/// contain single underscores and dashes, so the split is on the last `__`.
pub fn parse_run_stem(stem: &str) -> Result<RunId> {
    let (task, index) = stem
        .rsplit_once("__")
        .ok_or_else(|| anyhow!("run filename missing '__' delimiter: {}", stem))?;
    if task.is_empty() {
        return Err(anyhow!("run filename has empty task name: {}", stem));
    }
    let replicate: u32 = index
        .parse()
        .map_err(|_| anyhow!("run filename has non-numeric replicate index: {}", stem))?;
    Ok(RunId {
        task: task.to_string(),
        replicate,
    })
}

#[derive(Debug, Deserialize)]
struct CompletionRecord {
    train_step_idx: u64,
    best_accu: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Complete { best_accu: f64 },
    Incomplete { step: u64, expected: u64 },
    NoRecord,
}

impl RunOutcome {
    pub fn metric(&self) -> f64 {
        match self {
            RunOutcome::Complete { best_accu } => *best_accu,
            RunOutcome::Incomplete { .. } | RunOutcome::NoRecord => INCOMPLETE_SENTINEL,
        }
    }

    pub fn found_record(&self) -> bool {
        !matches!(self, RunOutcome::NoRecord)
    }
}

pub fn scan_run_log(log_path: &Path, task: &str, reference: &ReferenceTable) -> Result<RunOutcome> {
    let expected = reference.expected_steps(task)?;
    let data = fs::read_to_string(log_path)
        .with_context(|| format!("cannot read run log: {}", log_path.display()))?;

    // Only the most recent test record matters; scan from the end.
    for line in data.lines().rev() {
        if !line.contains(TEST_MARKER) {
            continue;
        }
        let record: CompletionRecord = serde_json::from_str(line)
            .with_context(|| format!("malformed test record in {}", log_path.display()))?;
        if record.train_step_idx == expected {
            info!("final result found for {}: {}", task, record.best_accu);
            return Ok(RunOutcome::Complete {
                best_accu: record.best_accu,
            });
        }
        info!(
            "current step: {}/{}, not finished",
            record.train_step_idx, expected
        );
        return Ok(RunOutcome::Incomplete {
            step: record.train_step_idx,
            expected,
        });
    }
    Ok(RunOutcome::NoRecord)
}

pub fn error_log_tail(run_dir: &Path, max_lines: usize) -> Result<Vec<String>> {
    let mut err_files = Vec::new();
    for entry in fs::read_dir(run_dir)
        .with_context(|| format!("cannot read run directory: {}", run_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("err") {
            err_files.push(path);
        }
    }
    err_files.sort();
    let err_path = err_files
        .first()
        .ok_or_else(|| anyhow!("no .err file in run directory: {}", run_dir.display()))?;
    let data = fs::read_to_string(err_path)
        .with_context(|| format!("cannot read error log: {}", err_path.display()))?;
    Ok(data
        .lines()
        .rev()
        .take(max_lines)
        .map(|line| line.to_string())
        .collect())
}

fn surface_error_log(run_dir: &Path) -> Result<()> {
    let tail = error_log_tail(run_dir, ERR_TAIL_LINES)?;
    println!("{}", ERR_BLOCK_DELIMITER);
    for line in &tail {
        println!("{}", line);
    }
    println!("{}", ERR_BLOCK_DELIMITER);
    Ok(())
}

fn dir_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("non-UTF8 directory name: {}", path.display()))
}

pub fn collect_results(root: &Path, reference: &ReferenceTable) -> Result<ResultMatrix> {
    let mut mechanisms = Vec::new();
    for entry in fs::read_dir(root)
        .with_context(|| format!("cannot read checkpoint root: {}", root.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            mechanisms.push(entry.path());
        }
    }
    // Explicit sort rather than filesystem enumeration order.
    mechanisms.sort();

    let mut matrix = ResultMatrix::new();
    for mechanism_dir in mechanisms {
        let mechanism = dir_name(&mechanism_dir)?;
        info!("found results for {}", mechanism);
        let row = matrix.entry(mechanism).or_default();

        for entry in WalkDir::new(&mechanism_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|s| s.to_str()) != Some("log")
            {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("non-UTF8 run filename: {}", path.display()))?;
            let run = parse_run_stem(stem)?;
            if run.replicate != 0 {
                // Only the primary replicate counts.
                continue;
            }
            info!("logs found for task: {}", run.task);

            let outcome = scan_run_log(path, &run.task, reference)?;
            if !outcome.found_record() {
                let run_dir = path.parent().unwrap_or(&mechanism_dir);
                warn!(
                    "no result found for {}, showing the error log in {}",
                    run.task,
                    run_dir.display()
                );
                surface_error_log(run_dir)?;
            }
            row.insert(run.task, outcome.metric());
        }
    }
    Ok(matrix)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn aggregate(matrix: &mut ResultMatrix) {
    let tasks: BTreeSet<String> = matrix
        .values()
        .flat_map(|row| row.keys())
        .filter(|task| task.as_str() != AVG_KEY)
        .cloned()
        .collect();
    if tasks.is_empty() {
        return;
    }

    for row in matrix.values_mut() {
        for task in &tasks {
            let value = row.entry(task.clone()).or_insert(0.0);
            // Incomplete runs contribute nothing to the average, same as
            // runs that never happened.
            if *value == INCOMPLETE_SENTINEL {
                *value = 0.0;
            }
        }
        let sum: f64 = tasks.iter().map(|task| row[task]).sum();
        row.insert(AVG_KEY.to_string(), round2(sum / tasks.len() as f64));
    }
}

pub fn render_report(matrix: &ResultMatrix) -> String {
    let mut columns: Vec<&String> = matrix
        .values()
        .flat_map(|row| row.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    columns.reverse();

    let mut out = String::new();
    out.push_str(&format!("{:<width$}", "", width = COLUMN_WIDTH));
    for column in &columns {
        let label: String = column.chars().take(LABEL_TRUNCATE).collect();
        out.push_str(&format!("{:<width$}   ", label, width = COLUMN_WIDTH));
    }
    out.push('\n');

    for (mechanism, row) in matrix {
        out.push_str(&format!("{:<width$}", mechanism, width = COLUMN_WIDTH));
        for column in &columns {
            match row.get(*column) {
                Some(value) => {
                    out.push_str(&format!("{:<width$}   ", value, width = COLUMN_WIDTH))
                }
                None => out.push_str(&format!("{:<width$}   ", "", width = COLUMN_WIDTH)),
            }
        }
        out.push('\n');
    }
    out
}
