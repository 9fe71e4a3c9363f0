use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::error::{Result, SweepError};
use crate::invoke::RunOutcome;

/// Metrics reported by one simulator run
///
/// Only constructed through [MetricRecord::new], which rejects values the simulator can't have
/// produced
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub miss_ratio: f64,
    pub throughput_mqps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u64>,
}

impl MetricRecord {
    /// Returns None unless the miss ratio is in [0, 1] and the throughput is finite and not negative
    pub fn new(miss_ratio: f64, throughput_mqps: f64, request_count: Option<u64>) -> Option<Self> {
        let record = Self { miss_ratio, throughput_mqps, request_count };
        record.is_valid().then_some(record)
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.miss_ratio) && self.throughput_mqps.is_finite() && self.throughput_mqps >= 0.0
    }
}

/// The stored result of a successful cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellResult {
    /// The simulator's structured output, kept exactly as it was written
    Raw(String),
    Metrics(MetricRecord),
}

impl CellResult {
    /// The metrics of this result, scanning raw output for a summary line if needed
    pub fn metrics(&self, pattern: &SummaryPattern) -> Option<MetricRecord> {
        match self {
            CellResult::Metrics(record) => Some(*record),
            CellResult::Raw(text) => pattern.find(text.lines()),
        }
    }
}

/// Matches the summary line the simulator prints for a policy, e.g.
///
/// `ilru cache size   10485760,           666667 req, miss ratio 0.1234, throughput 25.67 MQPS`
#[derive(Debug, Clone)]
pub struct SummaryPattern {
    regex: Regex,
}

impl SummaryPattern {
    pub fn new(policy: &str) -> Result<Self> {
        let pattern = format!(
            r"(?:^|\s)(?i:{}) cache size\s+(\d+),\s+(\d+) req, miss ratio (-?[0-9.]+(?:[eE][-+]?\d+)?), throughput (-?[0-9.]+(?:[eE][-+]?\d+)?) MQPS",
            regex::escape(policy)
        );
        let regex = Regex::new(&pattern)
            .map_err(|e| SweepError::Config(format!("couldn't build summary pattern for {policy:?}: {e}")))?;
        Ok(Self { regex })
    }

    /// Parses a single line. Lines which don't match, or whose numbers are malformed or out of
    /// range, give None
    pub fn parse(&self, line: &str) -> Option<MetricRecord> {
        let captures = self.regex.captures(line)?;
        let request_count = captures.get(2)?.as_str().parse::<u64>().ok();
        let miss_ratio = captures.get(3)?.as_str().parse::<f64>().ok()?;
        let throughput = captures.get(4)?.as_str().parse::<f64>().ok()?;
        let record = MetricRecord::new(miss_ratio, throughput, request_count);
        if record.is_none() {
            debug!("Rejecting out of range metrics in {line:?}");
        }
        record
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// The metrics of the first summary line. If that line is malformed or out of range the
    /// result is None, later summary lines are not considered
    pub fn find<'a, I: IntoIterator<Item = &'a str>>(&self, lines: I) -> Option<MetricRecord> {
        let line = lines.into_iter().find(|line| self.matches(line))?;
        self.parse(line)
    }
}

/// Parses one simulator summary line for a policy
///
/// # Arguments
///
/// * `policy`: The policy the line is expected to be tagged with
/// * `line`: A line of simulator output
///
/// returns: Option<MetricRecord>
///
/// # Examples
///
/// ```
/// use sweeplib::extract::parse_summary_line;
/// let line = "ilru cache size 10485760, 666667 req, miss ratio 0.1234, throughput 25.67 MQPS";
/// let record = parse_summary_line("ilru", line).unwrap();
/// assert_eq!(record.miss_ratio, 0.1234);
/// assert_eq!(record.throughput_mqps, 25.67);
/// ```
pub fn parse_summary_line(policy: &str, line: &str) -> Option<MetricRecord> {
    SummaryPattern::new(policy).ok()?.parse(line)
}

/// Turns a run's captured output into a result
///
/// Structured output (file output mode) is passed through verbatim, trimmed. Otherwise stdout and
/// then stderr are scanned for the policy's summary line. Nothing usable gives None, which is not
/// an error by itself: the driver decides what it means for the cell
///
/// # Arguments
///
/// * `outcome`: The captured run
///
/// returns: Option<CellResult>
pub fn extract(outcome: &RunOutcome) -> Option<CellResult> {
    if let Some(structured) = &outcome.structured {
        let trimmed = structured.trim();
        return if trimmed.is_empty() {
            debug!("Empty structured output for {}", outcome.cell.key());
            None
        } else {
            Some(CellResult::Raw(trimmed.to_string()))
        };
    }
    let pattern = SummaryPattern::new(&outcome.cell.policy).ok()?;
    let found = pattern.find(outcome.stdout.lines().chain(outcome.stderr.lines()));
    if found.is_none() {
        debug!("No summary line for {}", outcome.cell.key());
    }
    found.map(CellResult::Metrics)
}
