//! # eBPF Probe Backend
//!
//! Plants kernel uprobes and uretprobes through aya.
//!
//! ## Slots
//!
//! The kernel object carries `MAX_PROBE_SLOTS` identical entry programs and
//! as many return programs. Attaching a probe claims a free slot of its
//! kind, binds the slot to the probe's identity in `SLOT_BINDINGS`, and
//! attaches that slot's program at (binary, file offset, pid).
//!
//! ## Pump
//!
//! A dedicated thread owns the `EVENTS` ring buffer. It moves kernel events
//! into the transport buffer, folds the kernel drop counter into the
//! transport's, and forwards detach/exit notices only after draining the
//! ring, so a notice never overtakes the events it concerns.

use aya::maps::{HashMap, MapData, PerCpuArray, RingBuf};
use aya::programs::{ProgramError, UProbe};
use aya::programs::uprobe::UProbeLinkId;
use aya::Ebpf;
use aya_log::EbpfLogger;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::HashMap as StdHashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use callscope_common::{slot_key, CallEvent, SlotBinding, CONFIG_CAPTURE_ARGS, MAX_PROBE_SLOTS};

use super::{ProbeBackend, ProbeSite};
use crate::domain::{AttachError, AttachKind, Pid, ProbeId, SessionError};
use crate::events::{Event, Notice};
use crate::symbolization::Location;
use crate::transport::TransportBuffer;

/// How long the pump sleeps when neither events nor notices arrive
const PUMP_INTERVAL: Duration = Duration::from_millis(5);

const SLOTS: usize = MAX_PROBE_SLOTS as usize;

struct Link {
    kind: AttachKind,
    slot: u32,
    id: UProbeLinkId,
}

/// Free/used program slots per attach kind
#[derive(Debug, Default)]
struct SlotTable {
    entry: [Option<ProbeId>; SLOTS],
    ret: [Option<ProbeId>; SLOTS],
}

impl SlotTable {
    fn lane(&mut self, kind: AttachKind) -> &mut [Option<ProbeId>; SLOTS] {
        match kind {
            AttachKind::Entry => &mut self.entry,
            AttachKind::Return => &mut self.ret,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn claim(&mut self, kind: AttachKind, probe: ProbeId) -> Option<u32> {
        let lane = self.lane(kind);
        let slot = lane.iter().position(Option::is_none)?;
        lane[slot] = Some(probe);
        Some(slot as u32)
    }

    fn release(&mut self, kind: AttachKind, slot: u32) {
        if let Some(entry) = self.lane(kind).get_mut(slot as usize) {
            *entry = None;
        }
    }
}

fn program_name(kind: AttachKind, slot: u32) -> String {
    match kind {
        AttachKind::Entry => format!("call_entry_{slot}"),
        AttachKind::Return => format!("call_return_{slot}"),
    }
}

/// Options written into the kernel `CONFIG` map
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub capture_args: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { capture_args: true }
    }
}

pub struct EbpfBackend {
    ebpf: Ebpf,
    bindings: HashMap<MapData, u32, SlotBinding>,
    slots: SlotTable,
    links: StdHashMap<ProbeId, Link>,
    buffer: Arc<TransportBuffer>,
    notices: Option<Sender<Notice>>,
    pump: Option<JoinHandle<()>>,
    kernel_dropped: Arc<AtomicU64>,
}

impl EbpfBackend {
    /// Load the kernel object and start the pump
    ///
    /// This is the one process-wide kernel resource; it is released when the
    /// backend is dropped.
    ///
    /// # Errors
    /// Returns an error if the object cannot be loaded or lacks a required
    /// map or program
    pub fn load(path: &Path, buffer: Arc<TransportBuffer>, config: KernelConfig) -> Result<Self, SessionError> {
        let mut ebpf = Ebpf::load_file(path)
            .map_err(|e| SessionError::EbpfLoadFailed { path: path.to_path_buf(), error: e.to_string() })?;
        info!("✓ Loaded eBPF object {}", path.display());

        init_ebpf_logger(&mut ebpf);

        {
            let mut config_map: HashMap<_, u32, u64> =
                HashMap::try_from(ebpf.map_mut("CONFIG").ok_or(SessionError::MapNotFound("CONFIG"))?)?;
            config_map.insert(CONFIG_CAPTURE_ARGS, u64::from(config.capture_args), 0)?;
        }

        let bindings =
            HashMap::try_from(ebpf.take_map("SLOT_BINDINGS").ok_or(SessionError::MapNotFound("SLOT_BINDINGS"))?)?;
        let ring = RingBuf::try_from(ebpf.take_map("EVENTS").ok_or(SessionError::MapNotFound("EVENTS"))?)?;
        let dropped = PerCpuArray::try_from(ebpf.take_map("DROPPED").ok_or(SessionError::MapNotFound("DROPPED"))?)?;

        for kind in [AttachKind::Entry, AttachKind::Return] {
            for slot in 0..MAX_PROBE_SLOTS {
                let name = program_name(kind, slot);
                let program: &mut UProbe = ebpf
                    .program_mut(&name)
                    .ok_or(SessionError::EbpfLoadFailed {
                        path: path.to_path_buf(),
                        error: format!("program {name} missing"),
                    })?
                    .try_into()?;
                program.load()?;
            }
        }
        info!("✓ Loaded {MAX_PROBE_SLOTS} entry and {MAX_PROBE_SLOTS} return program slots");

        let (notices, notice_rx) = crossbeam_channel::unbounded();
        let kernel_dropped = Arc::new(AtomicU64::new(0));
        let pump = Pump { ring, dropped, buffer: Arc::clone(&buffer), kernel_dropped: Arc::clone(&kernel_dropped) };
        let pump = thread::Builder::new().name("callscope-pump".to_string()).spawn(move || pump.run(&notice_rx))?;

        Ok(Self {
            ebpf,
            bindings,
            slots: SlotTable::default(),
            links: StdHashMap::new(),
            buffer,
            notices: Some(notices),
            pump: Some(pump),
            kernel_dropped,
        })
    }

    /// Events the kernel ring buffer rejected so far
    #[must_use]
    pub fn kernel_dropped(&self) -> u64 {
        self.kernel_dropped.load(Ordering::Relaxed)
    }

    fn program(&mut self, kind: AttachKind, slot: u32) -> Result<&mut UProbe, ProgramError> {
        let name = program_name(kind, slot);
        match self.ebpf.program_mut(&name) {
            Some(program) => program.try_into(),
            None => Err(ProgramError::NotLoaded),
        }
    }

    fn unbind(&mut self, kind: AttachKind, slot: u32) {
        if let Err(e) = self.bindings.remove(&slot_key(kind.as_raw(), slot)) {
            debug!("Clearing {kind} slot {slot}: {e}");
        }
        self.slots.release(kind, slot);
    }
}

impl ProbeBackend for EbpfBackend {
    fn target_alive(&self, pid: Pid) -> bool {
        Path::new(&format!("/proc/{}", pid.0)).exists()
    }

    fn install(&mut self, site: &Arc<ProbeSite>, location: &Location) -> Result<(), AttachError> {
        let kind = site.kind();
        let backend_error = |error: String| AttachError::Backend { symbol: location.symbol.clone(), kind, error };

        let slot = self.slots.claim(kind, site.probe()).ok_or(AttachError::SlotsExhausted { kind })?;
        let binding = SlotBinding { probe_id: site.probe().0, function_id: site.function().0 };
        if let Err(e) = self.bindings.insert(slot_key(kind.as_raw(), slot), binding, 0) {
            self.slots.release(kind, slot);
            return Err(backend_error(e.to_string()));
        }

        let pid = site.pid();
        let attached = self
            .program(kind, slot)
            .and_then(|program| program.attach(None, location.file_offset, &location.binary, Some(i32::from(pid))));

        match attached {
            Ok(id) => {
                debug!("{kind} probe {} bound to slot {slot}", site.probe());
                self.links.insert(site.probe(), Link { kind, slot, id });
                Ok(())
            }
            Err(e) => {
                self.unbind(kind, slot);
                Err(match os_error(&e) {
                    Some(libc::EPERM | libc::EACCES) => AttachError::PermissionDenied { pid },
                    Some(libc::ESRCH) => AttachError::ProcessGone(pid),
                    _ => backend_error(e.to_string()),
                })
            }
        }
    }

    fn remove(&mut self, site: &ProbeSite) -> Result<(), AttachError> {
        let Some(link) = self.links.remove(&site.probe()) else {
            return Ok(());
        };
        let Link { kind, slot, id } = link;
        let detached = self.program(kind, slot).and_then(|program| program.detach(id));
        self.unbind(kind, slot);
        detached.map_err(|e| AttachError::Backend { symbol: site.symbol().to_string(), kind, error: e.to_string() })
    }

    fn publish(&self, notice: Notice) {
        // Attach notices precede the trap, so there is nothing in the ring to wait for
        if let Notice::ProbeAttached { .. } = notice {
            self.buffer.announce(notice);
            return;
        }
        match &self.notices {
            Some(tx) => {
                if let Err(e) = tx.send(notice) {
                    self.buffer.announce(e.into_inner());
                }
            }
            None => self.buffer.announce(notice),
        }
    }
}

impl Drop for EbpfBackend {
    fn drop(&mut self) {
        // Disconnecting the channel makes the pump drain once more and exit
        self.notices.take();
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("⚠️  Ring buffer pump panicked");
            }
        }
    }
}

/// Initialize eBPF logger
fn init_ebpf_logger(ebpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(ebpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Errno buried somewhere in an aya program error
fn os_error(error: &ProgramError) -> Option<i32> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io.raw_os_error();
        }
        source = e.source();
    }
    None
}

struct Pump {
    ring: RingBuf<MapData>,
    dropped: PerCpuArray<MapData, u64>,
    buffer: Arc<TransportBuffer>,
    kernel_dropped: Arc<AtomicU64>,
}

impl Pump {
    fn run(mut self, notices: &Receiver<Notice>) {
        let mut forwarded = 0u64;
        loop {
            let next = notices.recv_timeout(PUMP_INTERVAL);
            self.drain_ring(&mut forwarded);
            match next {
                Ok(notice) => self.buffer.announce(notice),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.sync_drops();
        }
        self.sync_drops();
        debug!("Pump stopped after {forwarded} kernel events");
    }

    fn drain_ring(&mut self, forwarded: &mut u64) {
        while let Some(item) = self.ring.next() {
            let bytes: &[u8] = &item;
            if bytes.len() < std::mem::size_of::<CallEvent>() {
                warn!("Received incomplete event");
                continue;
            }

            // SAFETY: We verified the buffer size matches CallEvent, and the eBPF program writes valid CallEvent data
            #[allow(unsafe_code)]
            let raw = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<CallEvent>()) };

            match Event::from_raw(&raw) {
                Some(event) => {
                    self.buffer.push(event);
                    *forwarded += 1;
                }
                None => warn!("Dropping event with unknown kind {}", raw.kind),
            }
        }
    }

    fn sync_drops(&mut self) {
        let total: u64 = match self.dropped.get(&0, 0) {
            Ok(per_cpu) => per_cpu.iter().sum(),
            Err(e) => {
                debug!("Reading DROPPED: {e}");
                return;
            }
        };
        let seen = self.kernel_dropped.swap(total, Ordering::Relaxed);
        if total > seen {
            self.buffer.count_upstream_drops(total - seen);
        }
    }
}
