use std::collections::HashSet;
use std::fmt;
use crate::config::CacheSize;
use crate::traces::TraceDescriptor;

/// One (trace, policy, cache size) combination of a sweep
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SweepCell {
    pub trace: TraceDescriptor,
    pub policy: String,
    pub cache_size: CacheSize,
}

/// Identifies a cell, and the result recorded for it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub trace: String,
    pub policy: String,
    pub cache_size: CacheSize,
}

impl SweepCell {
    pub fn key(&self) -> CellKey {
        CellKey {
            trace: self.trace.name.clone(),
            policy: self.policy.clone(),
            cache_size: self.cache_size,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.trace, self.policy, self.cache_size)
    }
}

/// The cells of a sweep, in a fixed order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    cells: Vec<SweepCell>,
}

impl SweepPlan {
    pub fn cells(&self) -> &[SweepCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The policies of the plan, in the order they first appear
    pub fn policies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.cells
            .iter()
            .map(|c| c.policy.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// The cells of one policy
    pub fn for_policy<'a>(&'a self, policy: &'a str) -> impl Iterator<Item = &'a SweepCell> + 'a {
        self.cells.iter().filter(move |c| c.policy == policy)
    }
}

/// Builds the Cartesian product of traces, sizes and policies
///
/// Cells are ordered by trace, then size, then policy. Repeated sizes or policies only produce one
/// cell, so the plan never contains a key twice. Building a plan has no side effects, the same
/// inputs always give the same plan
///
/// # Arguments
///
/// * `traces`: The traces to run
/// * `sizes`: The cache sizes to run each trace at
/// * `policies`: The replacement policies to run each trace and size with
///
/// returns: SweepPlan
pub fn plan(traces: &[TraceDescriptor], sizes: &[CacheSize], policies: &[String]) -> SweepPlan {
    let sizes = dedup(sizes);
    let policies = dedup(policies);
    let mut seen = HashSet::new();
    let mut cells = Vec::with_capacity(traces.len() * sizes.len() * policies.len());
    for trace in traces {
        for size in &sizes {
            for policy in &policies {
                let cell = SweepCell {
                    trace: trace.clone(),
                    policy: (*policy).clone(),
                    cache_size: **size,
                };
                if seen.insert(cell.key()) {
                    cells.push(cell);
                }
            }
        }
    }
    SweepPlan { cells }
}

fn dedup<T: Eq + std::hash::Hash>(items: &[T]) -> Vec<&T> {
    let mut seen = HashSet::new();
    items.iter().filter(|item| seen.insert(*item)).collect()
}
