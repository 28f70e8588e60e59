use log::debug;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::fs;
use std::path::{Path, PathBuf};

use super::memory_maps::{mapped_objects, read_mappings, runtime_address};
use super::{Location, SymbolResolver};
use crate::domain::{Pid, ResolutionError};

/// Resolves symbols against the ELF objects a live process has mapped
///
/// The main executable is searched first, then every shared object in the
/// order the process mapped them. Both the static symbol table and the
/// dynamic symbol table are consulted, so stripped libraries that still
/// export a symbol (`SSL_read` in `libssl.so`) resolve.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfSymbolResolver;

impl ElfSymbolResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SymbolResolver for ElfSymbolResolver {
    fn resolve(&self, pid: Pid, symbol: &str) -> Result<Location, ResolutionError> {
        let mappings = read_mappings(pid)?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid.0)) {
            candidates.push(exe);
        }
        for object in mapped_objects(&mappings) {
            if !candidates.contains(&object) {
                candidates.push(object);
            }
        }

        for binary in candidates {
            match find_symbol_offset(&binary, symbol) {
                Ok(Some(file_offset)) => {
                    let address = runtime_address(&mappings, &binary, file_offset);
                    debug!("Resolved {symbol} in {} at offset 0x{file_offset:x}", binary.display());
                    return Ok(Location { binary, symbol: symbol.to_string(), file_offset, address });
                }
                Ok(None) => {}
                Err(e) => debug!("Skipping {}: {e}", binary.display()),
            }
        }

        Err(ResolutionError::SymbolNotFound { pid, symbol: symbol.to_string() })
    }
}

/// Find a defined function symbol in an ELF file and return its file offset
///
/// # Errors
/// Returns an error if the file cannot be read or is not a parseable object
pub fn find_symbol_offset(path: &Path, symbol: &str) -> Result<Option<u64>, ResolutionError> {
    let parse_failed = |reason: String| ResolutionError::ObjectParseFailed {
        path: path.to_path_buf(),
        reason,
    };

    let data = fs::read(path).map_err(|e| parse_failed(e.to_string()))?;
    let file = object::File::parse(&*data).map_err(|e| parse_failed(e.to_string()))?;

    let offset = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|sym| {
            sym.kind() == SymbolKind::Text
                && sym.is_definition()
                && sym.name().is_ok_and(|name| symbol_matches(name, symbol))
        })
        .find_map(|sym| {
            let section = sym.section_index().and_then(|index| file.section_by_index(index).ok());
            let placement = section.and_then(|s| s.file_range().map(|(start, _)| (s.address(), start)));
            file_offset(sym.address(), placement)
        });

    Ok(offset)
}

/// Symbol values are virtual addresses; uprobes want file offsets
///
/// `placement` is the containing section's (address, file offset). A symbol
/// lying below its section's start is malformed and yields `None`.
fn file_offset(addr: u64, placement: Option<(u64, u64)>) -> Option<u64> {
    match placement {
        Some((section_addr, file_start)) => file_start.checked_add(addr.checked_sub(section_addr)?),
        None => Some(addr),
    }
}

/// Match a raw symbol name against what the user asked for
///
/// Accepts the exact (possibly mangled) name or the demangled Rust path
/// without its hash suffix.
fn symbol_matches(raw: &str, wanted: &str) -> bool {
    if raw == wanted {
        return true;
    }
    (raw.starts_with("_ZN") || raw.starts_with("_R")) && format!("{:#}", demangle(raw)) == wanted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(unsafe_code)]
    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn callscope_resolver_probe_target(x: u64) -> u64 {
        x.wrapping_mul(31)
    }

    #[test]
    fn test_symbol_matches_plain_and_demangled() {
        assert!(symbol_matches("SSL_read", "SSL_read"));
        assert!(!symbol_matches("SSL_read_ex", "SSL_read"));
        assert!(symbol_matches(
            "_ZN5tokio7runtime7context19set_current_task_id17h88510a52941c215fE",
            "tokio::runtime::context::set_current_task_id"
        ));
    }

    #[test]
    fn test_resolve_symbol_in_own_executable() {
        // Keep the symbol alive in the test binary
        assert_eq!(callscope_resolver_probe_target(2), 62);

        let pid = Pid(std::process::id());
        let location = ElfSymbolResolver::new()
            .resolve(pid, "callscope_resolver_probe_target")
            .expect("exported test symbol resolves");

        assert_eq!(location.symbol, "callscope_resolver_probe_target");
        assert!(location.file_offset > 0);
        assert_eq!(Some(location.binary.clone()), std::env::current_exe().ok());
        assert!(location.address.is_some(), "executable text is mapped");
    }

    #[test]
    fn test_missing_symbol_reports_not_found() {
        let pid = Pid(std::process::id());
        let err = ElfSymbolResolver::new()
            .resolve(pid, "definitely_not_a_symbol_in_this_process")
            .unwrap_err();
        assert!(matches!(err, ResolutionError::SymbolNotFound { .. }));
    }

    #[test]
    fn test_unparseable_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-elf");
        std::fs::write(&path, b"plain text").unwrap();
        let err = find_symbol_offset(&path, "main").unwrap_err();
        assert!(matches!(err, ResolutionError::ObjectParseFailed { .. }));
    }

    #[test]
    fn test_symbol_below_section_start_is_skipped() {
        assert_eq!(file_offset(0x1010, Some((0x1000, 0x400))), Some(0x410));
        assert_eq!(file_offset(0x0ff0, Some((0x1000, 0x400))), None);
        assert_eq!(file_offset(0x1234, None), Some(0x1234));
    }
}
