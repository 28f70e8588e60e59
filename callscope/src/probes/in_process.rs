//! Userspace trap table for functions of the current process
//!
//! [`InProcessTarget`] stands in for a target binary: functions are
//! registered by name and called through [`InProcessTarget::invoke`], which
//! fires whatever entry and return traps are installed on them. This lets
//! the whole pipeline run without kernel support or privileges.
//!
//! Return traps follow uretprobe semantics: whether a call reports its
//! return is decided when the call is entered, and a trap removed while the
//! call is in progress reports nothing.

use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use callscope_common::PAYLOAD_WORDS;

use super::{ProbeBackend, ProbeSite};
use crate::capture::Capture;
use crate::domain::{AttachError, AttachKind, Payload, Pid, ResolutionError, Tid};
use crate::events::Notice;
use crate::symbolization::{Location, SymbolResolver};

#[derive(Default)]
struct Traps {
    entry: Option<Arc<ProbeSite>>,
    ret: Option<Arc<ProbeSite>>,
}

pub struct InProcessTarget {
    pid: Pid,
    capture: Capture,
    functions: RwLock<HashMap<String, Traps>>,
    offsets: RwLock<HashMap<String, u64>>,
    alive: AtomicBool,
    instrumentable: AtomicBool,
}

impl InProcessTarget {
    /// A target reporting the current process id
    #[must_use]
    pub fn new(capture: Capture) -> Arc<Self> {
        Self::with_pid(Pid(std::process::id()), capture)
    }

    #[must_use]
    pub fn with_pid(pid: Pid, capture: Capture) -> Arc<Self> {
        Arc::new(Self {
            pid,
            capture,
            functions: RwLock::new(HashMap::new()),
            offsets: RwLock::new(HashMap::new()),
            alive: AtomicBool::new(true),
            instrumentable: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Make `symbol` resolvable and callable
    pub fn register(&self, symbol: &str) {
        let mut offsets = self.offsets.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = 0x1000 * (offsets.len() as u64 + 1);
        offsets.entry(symbol.to_string()).or_insert(next);
        drop(offsets);

        self.functions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(symbol.to_string())
            .or_default();
    }

    /// Refuse (or allow again) trap installation, as a process owned by
    /// another user would
    pub fn deny_instrumentation(&self, deny: bool) {
        self.instrumentable.store(!deny, Ordering::SeqCst);
    }

    /// Mark the target as exited; all traps vanish
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut functions = self.functions.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        for traps in functions.values_mut() {
            *traps = Traps::default();
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Call `body` as the registered function `symbol`
    ///
    /// `args` (up to six) become the entry payload; the value `body` returns
    /// becomes the return payload and is passed back to the caller.
    pub fn invoke<F>(&self, symbol: &str, args: &[u64], body: F) -> u64
    where
        F: FnOnce() -> u64,
    {
        let tid = current_tid();

        // Trap installation waits for the entry to be captured, so an entry
        // is always sequenced before the arming of a return trap it missed
        let ret = {
            let functions = self.functions.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let traps = functions.get(symbol);
            if let Some(site) = traps.and_then(|t| t.entry.as_ref()) {
                let mut words = [0u64; PAYLOAD_WORDS];
                for (word, arg) in words.iter_mut().zip(args) {
                    *word = *arg;
                }
                self.capture.fire(site, self.pid, tid, Payload(words));
            }
            traps.and_then(|t| t.ret.clone())
        };

        let value = body();

        if let Some(site) = &ret {
            self.capture.fire(site, self.pid, tid, Payload::word(value));
        }
        value
    }

    fn set_trap(&self, symbol: &str, kind: AttachKind, site: Option<Arc<ProbeSite>>) -> bool {
        let mut functions = self.functions.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(traps) = functions.get_mut(symbol) else {
            return false;
        };
        match kind {
            AttachKind::Entry => traps.entry = site,
            AttachKind::Return => traps.ret = site,
        }
        true
    }
}

impl SymbolResolver for InProcessTarget {
    fn resolve(&self, pid: Pid, symbol: &str) -> Result<Location, ResolutionError> {
        if pid != self.pid {
            return Err(ResolutionError::SymbolNotFound { pid, symbol: symbol.to_string() });
        }
        let offsets = self.offsets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let file_offset = *offsets
            .get(symbol)
            .ok_or_else(|| ResolutionError::SymbolNotFound { pid, symbol: symbol.to_string() })?;
        Ok(Location {
            binary: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe")),
            symbol: symbol.to_string(),
            file_offset,
            address: None,
        })
    }
}

/// Backend planting traps in an [`InProcessTarget`]
pub struct InProcessBackend {
    target: Arc<InProcessTarget>,
}

impl InProcessBackend {
    #[must_use]
    pub fn new(target: Arc<InProcessTarget>) -> Self {
        Self { target }
    }
}

impl ProbeBackend for InProcessBackend {
    fn target_alive(&self, pid: Pid) -> bool {
        pid == self.target.pid && self.target.is_alive()
    }

    fn install(&mut self, site: &Arc<ProbeSite>, location: &Location) -> Result<(), AttachError> {
        let pid = site.pid();
        if !self.target.is_alive() {
            return Err(AttachError::ProcessGone(pid));
        }
        if !self.target.instrumentable.load(Ordering::SeqCst) {
            return Err(AttachError::PermissionDenied { pid });
        }
        if !self.target.set_trap(&location.symbol, site.kind(), Some(Arc::clone(site))) {
            return Err(AttachError::Backend {
                symbol: location.symbol.clone(),
                kind: site.kind(),
                error: "function is not registered".to_string(),
            });
        }
        debug!("Installed in-process {} trap on {}", site.kind(), location.symbol);
        Ok(())
    }

    fn remove(&mut self, site: &ProbeSite) -> Result<(), AttachError> {
        self.target.set_trap(site.symbol(), site.kind(), None);
        Ok(())
    }

    fn publish(&self, notice: Notice) {
        self.target.capture.buffer().announce(notice);
    }
}

/// Kernel thread id of the calling thread
#[allow(unsafe_code, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn current_tid() -> Tid {
    // SAFETY: gettid takes no arguments and cannot fail
    Tid(unsafe { libc::syscall(libc::SYS_gettid) } as u32)
}
