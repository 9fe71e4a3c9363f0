use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use crate::config::{SweepConfig, TraceManifestEntry, TraceType};
use crate::error::{Result, SweepError};

/// A trace to benchmark. Immutable once discovered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceDescriptor {
    /// The name results are recorded under
    pub name: String,
    pub path: PathBuf,
    pub trace_type: TraceType,
}

impl TraceDescriptor {
    /// Creates a descriptor named after the file name of `path`
    pub fn new(path: PathBuf, trace_type: TraceType) -> Self {
        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path, trace_type }
    }
}

/// Scans directories for traces
///
/// Each directory is read non-recursively, and a regular file is kept if its last extension is both
/// in `extensions` and a known trace type. Directories which can't be read are skipped. Files are
/// sorted within each directory and directories are visited in order, so the result only depends
/// on the directory contents
///
/// # Arguments
///
/// * `directories`: The directories to scan
/// * `extensions`: Recognised extensions, without the leading dot
///
/// returns: Vec<TraceDescriptor>
pub fn discover<P: AsRef<Path>, S: AsRef<str>>(directories: &[P], extensions: &[S]) -> Vec<TraceDescriptor> {
    let recognised: HashSet<&str> = extensions.iter().map(|e| e.as_ref()).collect();
    let mut traces = Vec::new();
    for dir in directories {
        let dir = dir.as_ref();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping trace directory {}: {e}", dir.display());
                continue;
            }
        };
        let mut found: Vec<(PathBuf, TraceType)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let path = entry.path();
                let extension = path.extension()?.to_str()?;
                if !recognised.contains(extension) {
                    return None;
                }
                let trace_type = TraceType::from_extension(extension)?;
                Some((path, trace_type))
            })
            .collect();
        found.sort();
        traces.extend(found.into_iter().map(|(path, trace_type)| TraceDescriptor::new(path, trace_type)));
    }
    traces
}

/// Converts static manifest entries into trace descriptors
pub fn declare(manifest: &[TraceManifestEntry]) -> Vec<TraceDescriptor> {
    manifest
        .iter()
        .map(|entry| {
            let mut trace = TraceDescriptor::new(entry.path.clone(), entry.trace_type);
            if let Some(name) = &entry.name {
                trace.name = name.clone();
            }
            trace
        })
        .collect()
}

/// The traces of a sweep: the manifest if one is configured, otherwise whatever discovery finds
///
/// Fails if two traces share a name, as they would overwrite each other's results, or if a text
/// trace has no size or column contract
pub fn from_config(config: &SweepConfig) -> Result<Vec<TraceDescriptor>> {
    let traces = if config.traces.is_empty() {
        discover(&config.trace_dirs, &config.extensions)
    } else {
        declare(&config.traces)
    };
    let mut names = HashSet::new();
    for trace in &traces {
        if !names.insert(trace.name.as_str()) {
            return Err(SweepError::Config(format!(
                "more than one trace is named {:?}, give manifest entries distinct names",
                trace.name
            )));
        }
    }
    config.check_text_contract(traces.iter().map(|t| t.trace_type))?;
    Ok(traces)
}
