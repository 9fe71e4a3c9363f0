use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A summary line in the simulator's format
pub fn summary_line(policy: &str, cache_size: u64, requests: u64, miss_ratio: f64, throughput: f64) -> String {
    format!(
        "{policy} cache size {cache_size:>10}, {requests:>16} req, miss ratio {miss_ratio:.4}, throughput {throughput:.2} MQPS"
    )
}

/// Simulator-like output: `noise_lines` lines of progress chatter followed by one summary line
pub fn synthetic_output(policy: &str, cache_size: u64, noise_lines: usize) -> String {
    let mut out = String::new();
    for i in 0..noise_lines {
        out.push_str(&format!("[INFO] {i:>8} req processed, {:.2} MQPS so far\n", 20.0 + (i % 7) as f64));
    }
    out.push_str(&summary_line(policy, cache_size, noise_lines as u64 * 1000, 0.1234, 25.67));
    out.push('\n');
    out
}

/// Writes an executable `/bin/sh` script standing in for the simulator
///
/// The script sees the same arguments the simulator would: `$1` is the trace path, `$2` the trace
/// type, `$3` the policy and `$4` the cache size
#[cfg(unix)]
pub fn write_fake_simulator(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
