use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::error::{Result, SweepError};

const MEGABYTE: u64 = 1024 * 1024;

/// A sweep configuration, usually parsed from a JSON file
///
/// Every field has a default matching a single-policy iLRU sweep over `data/` and `Traces/`, so a
/// configuration file only needs to name what differs
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// The simulator executable. A bare name is looked up on `PATH`
    #[serde(default = "default_simulator")]
    pub simulator: PathBuf,
    /// Directories scanned (non-recursively) for traces when no manifest is given
    #[serde(default = "default_trace_dirs")]
    pub trace_dirs: Vec<PathBuf>,
    /// Recognised trace file extensions, without the dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// A static trace manifest. Takes precedence over directory discovery when non-empty
    #[serde(default)]
    pub traces: Vec<TraceManifestEntry>,
    #[serde(default = "default_policies")]
    pub policies: Vec<String>,
    /// Cache sizes, in `size_unit`
    #[serde(default = "default_cache_sizes")]
    pub cache_sizes: Vec<u64>,
    #[serde(default)]
    pub size_unit: SizeUnit,
    /// Passed to the simulator as `--num-thread=N`, omitted when null
    #[serde(default = "default_num_threads")]
    pub num_threads: Option<u32>,
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Holds the per-policy results files, summaries and run artifacts
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Number of cells run at once. This is independent of `num_threads`
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_trace_options")]
    pub trace_options: BTreeMap<TraceType, TraceOptions>,
}

/// One entry of a static trace manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceManifestEntry {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    /// Overrides the trace name used in results, which defaults to the file name
    #[serde(default)]
    pub name: Option<String>,
}

/// The trace formats understood by the simulator. The serialised name is passed to it verbatim
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TraceType {
    #[serde(rename = "csv")]
    Csv,
    #[serde(rename = "txt")]
    Txt,
    #[serde(rename = "bin")]
    Bin,
    #[serde(rename = "oracleGeneral")]
    OracleGeneral,
    #[serde(rename = "oracleGeneralBin")]
    OracleGeneralBin,
    #[serde(rename = "vscsi")]
    Vscsi,
    #[serde(rename = "lcs")]
    Lcs,
    #[serde(rename = "twr")]
    Twr,
    #[serde(rename = "twrNS")]
    TwrNs,
}

impl TraceType {
    pub const ALL: [TraceType; 9] = [
        TraceType::Csv,
        TraceType::Txt,
        TraceType::Bin,
        TraceType::OracleGeneral,
        TraceType::OracleGeneralBin,
        TraceType::Vscsi,
        TraceType::Lcs,
        TraceType::Twr,
        TraceType::TwrNs,
    ];

    /// The trace type argument expected by the simulator
    pub fn as_str(self) -> &'static str {
        match self {
            TraceType::Csv => "csv",
            TraceType::Txt => "txt",
            TraceType::Bin => "bin",
            TraceType::OracleGeneral => "oracleGeneral",
            TraceType::OracleGeneralBin => "oracleGeneralBin",
            TraceType::Vscsi => "vscsi",
            TraceType::Lcs => "lcs",
            TraceType::Twr => "twr",
            TraceType::TwrNs => "twrNS",
        }
    }

    /// Maps a file extension to a trace type. The extension is the type name itself
    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == extension)
    }

    /// Text traces need either `--ignore-obj-size` or a column mapping, the simulator's results are
    /// meaningless otherwise
    pub fn is_text(self) -> bool {
        matches!(self, TraceType::Csv | TraceType::Txt)
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unknown trace type {s:?}"))
    }
}

/// Per trace type flags for the simulator
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceOptions {
    /// Adds `--ignore-obj-size=true`
    #[serde(default)]
    pub ignore_obj_size: bool,
    /// Adds `-t <spec>`
    #[serde(default)]
    pub column_spec: Option<ColumnSpec>,
}

impl TraceOptions {
    pub fn is_empty(&self) -> bool {
        !self.ignore_obj_size && self.column_spec.is_none()
    }
}

/// Column mapping for text traces, rendered as the simulator's `-t` argument
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    #[serde(default)]
    pub time_col: Option<u32>,
    #[serde(default)]
    pub obj_id_col: Option<u32>,
    #[serde(default)]
    pub obj_size_col: Option<u32>,
    #[serde(default)]
    pub has_header: Option<bool>,
    #[serde(default)]
    pub obj_id_is_num: Option<bool>,
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if let Some(col) = self.time_col {
            fields.push(format!("time-col={col}"));
        }
        if let Some(col) = self.obj_id_col {
            fields.push(format!("obj-id-col={col}"));
        }
        if let Some(col) = self.obj_size_col {
            fields.push(format!("obj-size-col={col}"));
        }
        if let Some(has_header) = self.has_header {
            fields.push(format!("has-header={has_header}"));
        }
        if let Some(is_num) = self.obj_id_is_num {
            fields.push(format!("obj-id-is-num={is_num}"));
        }
        f.write_str(&fields.join(","))
    }
}

/// The unit used for every cache size of a sweep
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum SizeUnit {
    #[default]
    #[serde(alias = "bytes", alias = "B")]
    Bytes,
    #[serde(alias = "megabytes", alias = "MB")]
    Megabytes,
}

impl SizeUnit {
    pub fn bytes_per_unit(&self) -> u64 {
        match self {
            SizeUnit::Bytes => 1,
            SizeUnit::Megabytes => MEGABYTE,
        }
    }
}

impl FromStr for SizeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bytes" | "B" | "Bytes" => Ok(SizeUnit::Bytes),
            "megabytes" | "MB" | "Megabytes" => Ok(SizeUnit::Megabytes),
            _ => Err(format!("unknown size unit {s:?}, expected bytes or megabytes")),
        }
    }
}

/// A cache size together with the unit it was configured in
///
/// The unit decides both the simulator argument (`10485760` vs `10MB`) and the key the result is
/// stored under, so it is carried around rather than normalised away
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheSize {
    pub value: u64,
    pub unit: SizeUnit,
}

impl CacheSize {
    pub fn new(value: u64, unit: SizeUnit) -> Self {
        Self { value, unit }
    }

    pub fn bytes(&self) -> u64 {
        // Sizes too large for this are rejected when the config is validated
        self.value.saturating_mul(self.unit.bytes_per_unit())
    }

    /// The literal passed to the simulator
    pub fn argument(&self) -> String {
        match self.unit {
            SizeUnit::Bytes => self.value.to_string(),
            SizeUnit::Megabytes => format!("{}MB", self.value),
        }
    }
}

impl fmt::Display for CacheSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argument())
    }
}

/// Where the simulator's result ends up
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum OutputMode {
    /// Stdout is redirected into a per-cell `.cachesim` artifact and scanned for the summary line
    #[default]
    #[serde(alias = "stdout", alias = "stdout-capture")]
    Stdout,
    /// The simulator writes its result to the file named by `-o`, which is stored verbatim
    #[serde(alias = "file", alias = "file-output")]
    File,
}

fn default_simulator() -> PathBuf {
    PathBuf::from("build/bin/cachesim")
}

fn default_trace_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("data"), PathBuf::from("Traces")]
}

fn default_extensions() -> Vec<String> {
    ["csv", "oracleGeneral", "bin", "txt"].into_iter().map(String::from).collect()
}

fn default_policies() -> Vec<String> {
    vec!["ilru".to_string()]
}

fn default_cache_sizes() -> Vec<u64> {
    [10, 50, 100, 200, 500].into_iter().map(|mb| mb * MEGABYTE).collect()
}

fn default_num_threads() -> Option<u32> {
    Some(1)
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_workers() -> usize {
    1
}

fn default_trace_options() -> BTreeMap<TraceType, TraceOptions> {
    let mut options = BTreeMap::new();
    options.insert(TraceType::Csv, TraceOptions {
        ignore_obj_size: false,
        column_spec: Some(ColumnSpec {
            time_col: Some(1),
            obj_id_col: Some(2),
            obj_size_col: Some(3),
            has_header: Some(false),
            obj_id_is_num: Some(true),
        }),
    });
    options.insert(TraceType::Txt, TraceOptions {
        ignore_obj_size: true,
        column_spec: None,
    });
    options
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            simulator: default_simulator(),
            trace_dirs: default_trace_dirs(),
            extensions: default_extensions(),
            traces: Vec::new(),
            policies: default_policies(),
            cache_sizes: default_cache_sizes(),
            size_unit: SizeUnit::default(),
            num_threads: default_num_threads(),
            output_mode: OutputMode::default(),
            results_dir: default_results_dir(),
            workers: default_workers(),
            trace_options: default_trace_options(),
        }
    }
}

impl SweepConfig {
    /// Reads, resolves and validates a configuration file
    ///
    /// Relative paths in the file are taken relative to the directory containing it
    ///
    /// # Arguments
    ///
    /// * `path`: Path to a JSON configuration file
    ///
    /// returns: Result<SweepConfig, SweepError>
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SweepError::io(path, e))?;
        let mut config: SweepConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SweepError::Config(format!("couldn't parse {}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Makes every relative path absolute with respect to `base`. Bare simulator names are left
    /// alone so they can be found on `PATH`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| if p.is_relative() { base.join(p) } else { p.to_path_buf() };
        if self.simulator.components().count() > 1 {
            self.simulator = resolve(self.simulator.as_path());
        }
        self.trace_dirs = self.trace_dirs.iter().map(|d| resolve(d.as_path())).collect();
        for entry in &mut self.traces {
            entry.path = resolve(entry.path.as_path());
        }
        self.results_dir = resolve(self.results_dir.as_path());
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SweepError::Config("workers must be at least 1".into()));
        }
        if self.num_threads == Some(0) {
            return Err(SweepError::Config("num_threads must be at least 1 when set".into()));
        }
        if let Some(size) = self.cache_sizes.iter().find(|s| **s == 0) {
            return Err(SweepError::Config(format!("cache size {size} is not positive")));
        }
        if let Some(size) = self.sizes().into_iter().find(|s| s.value.checked_mul(s.unit.bytes_per_unit()).is_none()) {
            return Err(SweepError::Config(format!("cache size {size} does not fit in 64 bits of bytes")));
        }
        for policy in &self.policies {
            if policy.is_empty() || policy.contains(|c: char| c.is_whitespace() || c == '/') {
                return Err(SweepError::Config(format!("invalid policy name {policy:?}")));
            }
        }
        Ok(())
    }

    pub fn sizes(&self) -> Vec<CacheSize> {
        self.cache_sizes.iter().map(|v| CacheSize::new(*v, self.size_unit)).collect()
    }

    /// The options to use for a trace type. Missing entries mean no extra flags
    pub fn options_for(&self, trace_type: TraceType) -> TraceOptions {
        self.trace_options.get(&trace_type).cloned().unwrap_or_default()
    }

    /// Checks that every text trace type in use has a size or column contract
    pub fn check_text_contract<I: IntoIterator<Item = TraceType>>(&self, types: I) -> Result<()> {
        for trace_type in types {
            if trace_type.is_text() && self.options_for(trace_type).is_empty() {
                return Err(SweepError::Config(format!(
                    "{trace_type} traces need ignore_obj_size or a column_spec in trace_options"
                )));
            }
        }
        Ok(())
    }

    /// The checkpoint file of a policy
    pub fn store_path(&self, policy: &str) -> PathBuf {
        self.results_dir.join(format!("{policy}_results.json"))
    }

    /// The CSV summary written at the end of a sweep
    pub fn summary_path(&self, policy: &str) -> PathBuf {
        self.results_dir.join(format!("{policy}_summary.csv"))
    }
}
