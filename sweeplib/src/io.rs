use std::fs::File;
use std::io::{BufRead, Cursor};
use std::path::Path;
use memmap2::Mmap;
#[cfg(unix)]
use memmap2::Advice;
use crate::error::{Result, SweepError};

/// Bytes of an artifact file, mapped if there are any
pub enum ArtifactBytes {
    Mapped(Mmap),
    // Zero length mappings are rejected by the OS
    Empty,
}

impl AsRef<[u8]> for ArtifactBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            ArtifactBytes::Mapped(m) => &m[..],
            ArtifactBytes::Empty => &[],
        }
    }
}

/// Opens a simulator output artifact for sequential reading
///
/// Artifacts from long traces can be large and are only scanned once, front to back, so they are
/// memory mapped with sequential access advice rather than read into a buffer
pub fn get_reader(path: &Path) -> Result<Cursor<ArtifactBytes>> {
    let file = File::open(path).map_err(|e| SweepError::io(path, e))?;
    let len = file.metadata().map_err(|e| SweepError::io(path, e))?.len();
    if len == 0 {
        return Ok(Cursor::new(ArtifactBytes::Empty));
    }
    // The simulator has exited by the time artifacts are read, nothing truncates them underneath us
    let mapped = unsafe { Mmap::map(&file) }.map_err(|e| SweepError::io(path, e))?;
    #[cfg(unix)]
    mapped.advise(Advice::Sequential).map_err(|e| SweepError::io(path, e))?;
    Ok(Cursor::new(ArtifactBytes::Mapped(mapped)))
}

/// Reads a whole artifact as text, replacing invalid UTF-8
pub fn read_lossy(path: &Path) -> Result<String> {
    let mut reader = get_reader(path)?;
    let mut text = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).map_err(|e| SweepError::io(path, e))?;
        if read == 0 {
            break;
        }
        text.push_str(&String::from_utf8_lossy(&line));
    }
    Ok(text)
}
