//! # Probe Manager
//!
//! Owns the lifecycle of every attached probe.
//!
//! ## Lifecycle
//!
//! ```text
//! attach(spec) ─► resolve symbol ─► publish ProbeAttached ─► install trap ─► publish ProbeArmed ─► ProbeHandle
//! detach(handle) ─► remove trap ─► quiesce site ─► publish ProbeDetached
//! process_exited(pid) ─► quiesce every site of pid ─► publish ProcessExited
//! ```
//!
//! At most one probe is live per (symbol, attach kind, process). The entry
//! and return probes of one symbol share a [`FunctionId`], which is what the
//! correlator pairs on.
//!
//! ## Backends
//!
//! - [`EbpfBackend`] - kernel uprobes/uretprobes via aya
//! - [`InProcessBackend`] - userspace trap table for functions of this process

pub mod backend;
pub mod ebpf_backend;
pub mod in_process;
pub mod site;

pub use backend::ProbeBackend;
pub use ebpf_backend::EbpfBackend;
pub use in_process::{InProcessBackend, InProcessTarget};
pub use site::{FiringGuard, ProbeSite};

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::domain::{AttachError, AttachKind, FunctionId, Pid, ProbeId, ResolutionError, Timestamp};
use crate::events::Notice;
use crate::symbolization::SymbolResolver;

static NEXT_PROBE_ID: AtomicU32 = AtomicU32::new(1);

/// What to attach: immutable once created, identified by a unique [`ProbeId`]
#[derive(Debug)]
pub struct ProbeSpec {
    id: ProbeId,
    pid: Pid,
    symbol: Arc<str>,
    kind: AttachKind,
}

impl ProbeSpec {
    pub fn new(pid: Pid, symbol: impl Into<Arc<str>>, kind: AttachKind) -> Self {
        Self {
            id: ProbeId(NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed)),
            pid,
            symbol: symbol.into(),
            kind,
        }
    }

    #[must_use]
    pub fn id(&self) -> ProbeId {
        self.id
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn kind(&self) -> AttachKind {
        self.kind
    }
}

/// A live probe. Move-only: giving it back to [`ProbeManager::detach`] is
/// the only way to tear the probe down.
#[derive(Debug)]
pub struct ProbeHandle {
    id: ProbeId,
    function: FunctionId,
    pid: Pid,
    symbol: Arc<str>,
    kind: AttachKind,
}

impl ProbeHandle {
    #[must_use]
    pub fn id(&self) -> ProbeId {
        self.id
    }

    #[must_use]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn kind(&self) -> AttachKind {
        self.kind
    }

    fn key(&self) -> ProbeKey {
        ProbeKey { pid: self.pid, symbol: Arc::clone(&self.symbol), kind: self.kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProbeKey {
    pid: Pid,
    symbol: Arc<str>,
    kind: AttachKind,
}

pub struct ProbeManager<B: ProbeBackend> {
    backend: B,
    resolver: Arc<dyn SymbolResolver>,
    live: HashMap<ProbeKey, Arc<ProbeSite>>,
    functions: HashMap<(Pid, Arc<str>), FunctionId>,
    next_function: u32,
}

impl<B: ProbeBackend> ProbeManager<B> {
    pub fn new(backend: B, resolver: Arc<dyn SymbolResolver>) -> Self {
        Self { backend, resolver, live: HashMap::new(), functions: HashMap::new(), next_function: 1 }
    }

    /// Attach one probe
    ///
    /// # Errors
    /// - `AlreadyAttached` if an equivalent probe is live
    /// - `NoSuchProcess` if the target does not exist
    /// - `Resolution` if the symbol cannot be located
    /// - `PermissionDenied` / `ProcessGone` from the backend
    pub fn attach(&mut self, spec: ProbeSpec) -> Result<ProbeHandle, AttachError> {
        let ProbeSpec { id, pid, symbol, kind } = spec;
        let key = ProbeKey { pid, symbol: Arc::clone(&symbol), kind };

        if self.live.contains_key(&key) {
            return Err(AttachError::AlreadyAttached { symbol: symbol.to_string(), kind, pid });
        }
        if !self.backend.target_alive(pid) {
            return Err(AttachError::NoSuchProcess(pid));
        }

        let location = match self.resolver.resolve(pid, &symbol) {
            Ok(location) => location,
            Err(ResolutionError::MemoryMapsUnreadable(..)) if !self.backend.target_alive(pid) => {
                return Err(AttachError::ProcessGone(pid));
            }
            Err(e) => return Err(e.into()),
        };

        let function = self.intern(pid, &symbol);
        let site = Arc::new(ProbeSite::new(id, function, kind, pid, Arc::clone(&symbol)));

        // The correlator must learn about the probe before its first event
        self.backend.publish(Notice::ProbeAttached {
            probe: id,
            function,
            symbol: Arc::clone(&symbol),
            pid,
            kind,
        });

        if let Err(e) = self.backend.install(&site, &location) {
            site.quiesce();
            self.backend.publish(Notice::ProbeDetached { probe: id, function, pid, kind, at: Timestamp::now() });
            if !self.backend.target_alive(pid) {
                return Err(AttachError::ProcessGone(pid));
            }
            return Err(e);
        }
        // Only now can a return be observed for calls entered from here on
        self.backend.publish(Notice::ProbeArmed { probe: id, function, kind });

        info!("✓ Attached {kind} probe: {symbol} ({}+0x{:x}) {pid}", location.binary.display(), location.file_offset);
        self.live.insert(key, site);
        Ok(ProbeHandle { id, function, pid, symbol, kind })
    }

    /// Detach one probe, blocking until no firing still references it
    ///
    /// Detaching a probe whose process already exited is a no-op.
    ///
    /// # Errors
    /// Returns the backend's error if the trap could not be removed cleanly;
    /// the probe is considered detached either way.
    pub fn detach(&mut self, handle: ProbeHandle) -> Result<(), AttachError> {
        let key = handle.key();
        let Some(site) = self.live.get(&key).filter(|s| s.probe() == handle.id).cloned() else {
            debug!("{} probe on {} already torn down", handle.kind, handle.symbol);
            return Ok(());
        };
        self.live.remove(&key);

        let result = self.teardown(&site);
        info!("✓ Detached {} probe: {} {}", handle.kind, handle.symbol, handle.pid);
        result
    }

    /// Detach every live probe; returns how many were detached
    pub fn detach_all(&mut self) -> usize {
        let sites: Vec<Arc<ProbeSite>> = self.live.drain().map(|(_, site)| site).collect();
        for site in &sites {
            if let Err(e) = self.teardown(site) {
                warn!("⚠️  Failed to detach {} probe on {}: {e}", site.kind(), site.symbol());
            }
        }
        sites.len()
    }

    /// The target exited: its traps are gone with it
    ///
    /// Every probe of `pid` is quiesced and forgotten, then a single
    /// `ProcessExited` notice is published. Returns how many probes died.
    pub fn process_exited(&mut self, pid: Pid) -> usize {
        let keys: Vec<ProbeKey> = self.live.keys().filter(|k| k.pid == pid).cloned().collect();
        for key in &keys {
            if let Some(site) = self.live.remove(key) {
                if let Err(e) = self.backend.remove(&site) {
                    debug!("Removing trap for exited {pid}: {e}");
                }
                site.quiesce();
            }
        }
        self.functions.retain(|(p, _), _| *p != pid);
        self.backend.publish(Notice::ProcessExited { pid, at: Timestamp::now() });
        info!("Target {pid} exited, {} probes released", keys.len());
        keys.len()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn teardown(&mut self, site: &ProbeSite) -> Result<(), AttachError> {
        let result = self.backend.remove(site);
        site.quiesce();
        self.backend.publish(Notice::ProbeDetached {
            probe: site.probe(),
            function: site.function(),
            pid: site.pid(),
            kind: site.kind(),
            at: Timestamp::now(),
        });
        result
    }

    fn intern(&mut self, pid: Pid, symbol: &Arc<str>) -> FunctionId {
        let next = &mut self.next_function;
        *self.functions.entry((pid, Arc::clone(symbol))).or_insert_with(|| {
            let id = FunctionId(*next);
            *next += 1;
            id
        })
    }
}
