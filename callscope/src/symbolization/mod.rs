//! # Symbol Resolution
//!
//! Turns "function name in process N" into a location a probe can be
//! attached to. Uprobes are placed by **file offset** inside a specific
//! object on disk, so resolution answers three questions:
//!
//! 1. Which mapped object (executable or shared library) defines the symbol?
//! 2. Where is the symbol inside that file?
//! 3. Where does that file offset live in the running process (for display)?
//!
//! ## PIE and Shared Libraries
//!
//! ELF symbol values are **virtual addresses** relative to the object's
//! link-time base. The kernel wants a **file offset**:
//!
//! ```text
//! File Offset = Symbol VAddr - Section VAddr + Section File Offset
//! ```
//!
//! The runtime address is found through `/proc/<pid>/maps`:
//!
//! ```text
//! Runtime Address = Mapping Start + (File Offset - Mapping File Offset)
//! ```
//!
//! ## Module Structure
//!
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing and offset translation
//! - **`elf_resolver`**: [`ElfSymbolResolver`], searching symbol tables with `object`
//!
//! Other resolvers (the in-process target used by tests) implement
//! [`SymbolResolver`] directly.

pub mod elf_resolver;
pub mod memory_maps;

use serde::Serialize;
use std::path::PathBuf;

use crate::domain::{Pid, ResolutionError};

pub use elf_resolver::ElfSymbolResolver;
pub use memory_maps::{parse_mappings, read_mappings, Mapping};

/// Where a probe for a symbol gets installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Object on disk that defines the symbol
    pub binary: PathBuf,
    pub symbol: String,
    /// Offset of the first instruction inside `binary`
    pub file_offset: u64,
    /// Address in the target's address space, when the object is mapped
    pub address: Option<u64>,
}

/// Maps a function name in a target process to an attachable location
pub trait SymbolResolver: Send + Sync {
    /// Resolve `symbol` in the objects mapped by `pid`
    ///
    /// # Errors
    /// Returns [`ResolutionError::SymbolNotFound`] when no mapped object defines it
    fn resolve(&self, pid: Pid, symbol: &str) -> Result<Location, ResolutionError>;
}
