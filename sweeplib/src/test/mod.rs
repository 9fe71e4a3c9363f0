mod driver;

use std::path::PathBuf;
use crate::config::{CacheSize, SizeUnit, TraceType};
use crate::plan::{CellKey, SweepCell};
use crate::traces::TraceDescriptor;

pub fn trace(name: &str, trace_type: TraceType) -> TraceDescriptor {
    TraceDescriptor::new(PathBuf::from("/traces").join(name), trace_type)
}

pub fn cell(trace_name: &str, policy: &str, bytes: u64) -> SweepCell {
    SweepCell {
        trace: trace(trace_name, TraceType::Csv),
        policy: policy.to_string(),
        cache_size: CacheSize::new(bytes, SizeUnit::Bytes),
    }
}

pub fn key(trace_name: &str, policy: &str, bytes: u64) -> CellKey {
    cell(trace_name, policy, bytes).key()
}
