use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use regex::Regex;
use tracing::{debug, info};
use crate::config::{CacheSize, SizeUnit};
use crate::error::{Result, SweepError};
use crate::extract::{CellResult, SummaryPattern};
use crate::io::get_reader;
use crate::plan::SweepCell;
use crate::store::ResultStore;

/// File name of the stdout artifact of a cell: `<trace>_<policy>_<size>.cachesim`
pub fn artifact_name(cell: &SweepCell) -> String {
    format!("{}_{}_{}.cachesim", cell.trace.name, cell.policy, cell.cache_size.argument())
}

pub fn artifact_path(results_dir: &Path, cell: &SweepCell) -> PathBuf {
    results_dir.join(artifact_name(cell))
}

/// The temporary `-o` file of a cell in file output mode: `<policy>_<trace>_<size>.json`
pub fn structured_output_path(results_dir: &Path, cell: &SweepCell) -> PathBuf {
    results_dir.join(format!("{}_{}_{}.json", cell.policy, cell.trace.name, cell.cache_size.argument()))
}

/// Rebuilds results from the stdout artifacts left in a directory by earlier runs
///
/// Every `<trace>_<policy>_<size>.cachesim` file whose size is written in `unit` is scanned for the
/// policy's summary line. Artifacts without one are skipped. The returned store is backed by the
/// policy's usual results file in `dir` but is not written to it
///
/// # Arguments
///
/// * `dir`: The results directory holding the artifacts
/// * `policy`: The policy whose artifacts are collected
/// * `unit`: The size unit the artifacts were produced with
///
/// returns: Result<ResultStore, SweepError>
pub fn collect(dir: &Path, policy: &str, unit: SizeUnit) -> Result<ResultStore> {
    let name_pattern = Regex::new(&format!(r"^(.+)_{}_(\d+)(MB)?\.cachesim$", regex::escape(policy)))
        .map_err(|e| SweepError::Config(format!("couldn't build artifact pattern for {policy:?}: {e}")))?;
    let summary = SummaryPattern::new(policy)?;
    let mut store = ResultStore::new(dir.join(format!("{policy}_results.json")), policy, unit);

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| SweepError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let Some(captures) = name_pattern.captures(file_name) else {
            continue;
        };
        let file_unit = if captures.get(3).is_some() { SizeUnit::Megabytes } else { SizeUnit::Bytes };
        if file_unit != unit {
            debug!("Skipping {file_name}, its size isn't in {unit:?}");
            continue;
        }
        let trace = captures[1].to_string();
        let Ok(value) = captures[2].parse::<u64>() else {
            continue;
        };
        let reader = get_reader(&path)?;
        let record = reader
            .split(b'\n')
            .map_while(|line| line.ok())
            .map(|line| String::from_utf8_lossy(&line).into_owned())
            .find(|line| summary.matches(line))
            .and_then(|line| summary.parse(&line));
        match record {
            Some(record) => {
                store.insert(trace, CacheSize::new(value, unit), CellResult::Metrics(record));
            }
            None => info!("No summary line in {file_name}"),
        }
    }
    Ok(store)
}
