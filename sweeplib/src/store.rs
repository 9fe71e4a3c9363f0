use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::debug;
use crate::config::{CacheSize, SizeUnit};
use crate::error::{Result, SweepError};
use crate::extract::{CellResult, SummaryPattern};
use crate::plan::CellKey;

/// Header of CSV summaries
pub const CSV_HEADER: [&str; 4] = ["Trace", "Cache Size (bytes)", "Miss Ratio", "Throughput (MQPS)"];

/// On-disk shape: trace name, then cache size in the store's unit
type Entries = BTreeMap<String, BTreeMap<u64, CellResult>>;

/// Output formats for [ResultStore::export]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("unknown export format {s:?}, expected csv or json")),
        }
    }
}

/// Results of one policy's sweep, persisted as `{trace: {size: result}}` JSON
///
/// The file doubles as the sweep's checkpoint: a cell with a stored result is never run again.
/// Results are only ever added, and every addition is expected to be followed by a [flush], so an
/// interrupted sweep loses at most the cells that were running
///
/// [flush]: ResultStore::flush
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
    policy: String,
    unit: SizeUnit,
    entries: Entries,
}

impl ResultStore {
    /// Creates an empty store which will be written to `path`
    pub fn new(path: PathBuf, policy: &str, unit: SizeUnit) -> Self {
        Self {
            path,
            policy: policy.to_string(),
            unit,
            entries: Entries::new(),
        }
    }

    /// Loads a store, or creates an empty one if the file doesn't exist yet
    ///
    /// A file which exists but can't be parsed is an error rather than an empty store, continuing
    /// would overwrite every result it holds
    ///
    /// # Arguments
    ///
    /// * `path`: The results file
    /// * `policy`: The policy the file holds results for
    /// * `unit`: The unit its cache sizes are written in
    ///
    /// returns: Result<ResultStore, SweepError>
    pub fn load(path: &Path, policy: &str, unit: SizeUnit) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No results at {}, starting empty", path.display());
                return Ok(Self::new(path.to_path_buf(), policy, unit));
            }
            Err(e) => return Err(SweepError::io(path, e)),
        };
        let entries: Entries = serde_json::from_slice(&bytes).map_err(|e| SweepError::StoreCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        for (trace, sizes) in &entries {
            for (size, result) in sizes {
                if let CellResult::Metrics(record) = result {
                    if !record.is_valid() {
                        return Err(SweepError::StoreCorrupt {
                            path: path.to_path_buf(),
                            reason: format!("out of range metrics for {trace} at size {size}"),
                        });
                    }
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            policy: policy.to_string(),
            unit,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn unit(&self) -> SizeUnit {
        self.unit
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn holds(&self, key: &CellKey) -> bool {
        key.policy == self.policy && key.cache_size.unit == self.unit
    }

    pub fn has(&self, key: &CellKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &CellKey) -> Option<&CellResult> {
        if !self.holds(key) {
            return None;
        }
        self.entries.get(&key.trace)?.get(&key.cache_size.value)
    }

    /// Records the result of a successful cell. Does not write to disk
    pub fn put(&mut self, key: &CellKey, result: CellResult) -> Result<()> {
        if key.policy != self.policy {
            return Err(SweepError::PolicyMismatch {
                store: self.policy.clone(),
                cell: key.policy.clone(),
            });
        }
        if key.cache_size.unit != self.unit {
            return Err(SweepError::Config(format!(
                "cache size {} of {} is not in the store's unit {:?}",
                key.cache_size, key.trace, self.unit
            )));
        }
        self.insert(key.trace.clone(), key.cache_size, result);
        Ok(())
    }

    /// Drops a recorded result. Does not write to disk
    pub fn remove(&mut self, key: &CellKey) -> Option<CellResult> {
        if key.policy != self.policy || key.cache_size.unit != self.unit {
            return None;
        }
        let sizes = self.entries.get_mut(&key.trace)?;
        let removed = sizes.remove(&key.cache_size.value);
        if sizes.is_empty() {
            self.entries.remove(&key.trace);
        }
        removed
    }

    pub(crate) fn insert(&mut self, trace: String, cache_size: CacheSize, result: CellResult) {
        self.entries.entry(trace).or_default().insert(cache_size.value, result);
    }

    /// Every stored result, ordered by trace then cache size
    pub fn records(&self) -> impl Iterator<Item = (&str, CacheSize, &CellResult)> + '_ {
        self.entries.iter().flat_map(move |(trace, sizes)| {
            sizes
                .iter()
                .map(move |(value, result)| (trace.as_str(), CacheSize::new(*value, self.unit), result))
        })
    }

    /// Writes the store to its file
    ///
    /// The contents go to a temporary file next to the target which then replaces it, so a crash
    /// mid-write leaves the previous version in place
    pub fn flush(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| SweepError::io(dir, e))?;
        let rendered = self.export(ExportFormat::Json)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| SweepError::io(dir, e))?;
        tmp.write_all(rendered.as_bytes()).map_err(|e| SweepError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| SweepError::io(tmp.path(), e))?;
        tmp.persist(&self.path).map_err(|e| SweepError::io(&self.path, e.error))?;
        Ok(())
    }

    /// Renders the store
    ///
    /// Both formats are deterministic: rows and keys are ordered by trace name and then numerically
    /// by cache size. CSV rows are only produced for results with metrics; raw results contribute a
    /// row if their text contains a summary line
    ///
    /// # Arguments
    ///
    /// * `format`: CSV summary or the JSON store layout
    ///
    /// returns: Result<String, SweepError>
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => {
                let mut rendered = serde_json::to_string_pretty(&self.entries)?;
                rendered.push('\n');
                Ok(rendered)
            }
            ExportFormat::Csv => self.export_csv(),
        }
    }

    fn export_csv(&self) -> Result<String> {
        let pattern = SummaryPattern::new(&self.policy)?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_HEADER)?;
        for (trace, cache_size, result) in self.records() {
            let Some(record) = result.metrics(&pattern) else {
                debug!("No metrics for {trace} at {cache_size}, leaving it out of the summary");
                continue;
            };
            writer.write_record([
                trace.to_string(),
                cache_size.bytes().to_string(),
                record.miss_ratio.to_string(),
                record.throughput_mqps.to_string(),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| SweepError::Csv(csv::Error::from(e.into_error())))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
