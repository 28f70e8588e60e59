//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` to find which objects a process has mapped and
//! where, so a symbol's file offset can be located in any of them and
//! translated to the runtime address of the loaded copy.

use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{Pid, ResolutionError};

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    /// Offset into the backing file of `start`
    pub offset: u64,
    pub executable: bool,
    /// Backing file, `None` for anonymous and pseudo mappings (`[heap]`, `[vdso]`)
    pub path: Option<PathBuf>,
}

impl Mapping {
    /// Check if an address falls within this mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Runtime address of `file_offset` if this mapping covers it
    #[must_use]
    pub fn translate(&self, file_offset: u64) -> Option<u64> {
        let size = self.end - self.start;
        if file_offset >= self.offset && file_offset < self.offset + size {
            Some(self.start + (file_offset - self.offset))
        } else {
            None
        }
    }
}

/// Read and parse `/proc/<pid>/maps`
///
/// # Errors
/// Returns an error if the maps file cannot be read (process gone or no permission)
pub fn read_mappings(pid: Pid) -> Result<Vec<Mapping>, ResolutionError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps =
        fs::read_to_string(&maps_path).map_err(|e| ResolutionError::MemoryMapsUnreadable(pid, e))?;
    Ok(parse_mappings(&maps))
}

/// Parse the text of a maps file, skipping malformed lines
#[must_use]
pub fn parse_mappings(maps: &str) -> Vec<Mapping> {
    maps.lines().filter_map(parse_line).collect()
}

// Format: "start-end perms offset dev inode      pathname"
// The first five fields are single-space separated; the pathname is padded.
fn parse_line(line: &str) -> Option<Mapping> {
    let mut parts = line.splitn(6, ' ');
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().map(str::trim).filter(|p| p.starts_with('/'));

    let (start, end) = range.split_once('-')?;
    let mapping = Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        path: path.map(|p| PathBuf::from(p.trim_end_matches(" (deleted)"))),
    };

    if mapping.end <= mapping.start {
        debug!("Skipping empty mapping: {line}");
        return None;
    }
    Some(mapping)
}

/// File-backed objects in first-mapped order, each listed once
#[must_use]
pub fn mapped_objects(mappings: &[Mapping]) -> Vec<PathBuf> {
    let mut objects: Vec<PathBuf> = Vec::new();
    for path in mappings.iter().filter_map(|m| m.path.as_ref()) {
        if !objects.contains(path) {
            objects.push(path.clone());
        }
    }
    objects
}

/// Runtime address of `file_offset` inside the copy of `binary` the process mapped
#[must_use]
pub fn runtime_address(mappings: &[Mapping], binary: &Path, file_offset: u64) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.path.as_deref() == Some(binary))
        .find_map(|m| m.translate(file_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
5581d2a00000-5581d2a01000 r--p 00000000 08:01 1311 /usr/local/bin/dummy-tls-client
5581d2a01000-5581d2a02000 r-xp 00001000 08:01 1311 /usr/local/bin/dummy-tls-client
5581d3b5c000-5581d3b7d000 rw-p 00000000 00:00 0                          [heap]
7f2a1c600000-7f2a1c628000 r--p 00000000 08:01 2201                       /usr/lib/x86_64-linux-gnu/libc.so.6
7f2a1c628000-7f2a1c7bd000 r-xp 00028000 08:01 2201                       /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd4a1f0000-7ffd4a1f2000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn test_parse_mappings() {
        let mappings = parse_mappings(MAPS);
        assert_eq!(mappings.len(), 6);

        let text = &mappings[1];
        assert_eq!(text.start, 0x5581_d2a0_1000);
        assert_eq!(text.offset, 0x1000);
        assert!(text.executable);
        assert_eq!(text.path.as_deref(), Some(Path::new("/usr/local/bin/dummy-tls-client")));

        assert!(mappings[2].path.is_none(), "[heap] is not file-backed");
        assert!(mappings[5].path.is_none(), "[vdso] is not file-backed");
    }

    #[test]
    fn test_mapped_objects_in_order() {
        let objects = mapped_objects(&parse_mappings(MAPS));
        assert_eq!(
            objects,
            vec![
                PathBuf::from("/usr/local/bin/dummy-tls-client"),
                PathBuf::from("/usr/lib/x86_64-linux-gnu/libc.so.6"),
            ]
        );
    }

    #[test]
    fn test_runtime_address_translation() {
        let mappings = parse_mappings(MAPS);
        let exe = Path::new("/usr/local/bin/dummy-tls-client");

        assert_eq!(runtime_address(&mappings, exe, 0x1234), Some(0x5581_d2a0_1234));
        assert!(mappings[1].contains(0x5581_d2a0_1234));
        assert_eq!(runtime_address(&mappings, exe, 0x10_0000), None);

        let libc = Path::new("/usr/lib/x86_64-linux-gnu/libc.so.6");
        assert_eq!(runtime_address(&mappings, libc, 0x2_9000), Some(0x7f2a_1c62_9000));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let mappings = parse_mappings("garbage\nzzzz-1000 r-xp 0 0 0 /x\n");
        assert!(mappings.is_empty());
    }

    #[test]
    fn test_read_own_mappings() {
        let mappings = read_mappings(Pid(std::process::id())).expect("own maps are readable");
        assert!(mappings.iter().any(|m| m.executable));
    }
}
