//! In-process stand-in for the coverage device.
//!
//! [`SimulatedDevice`] implements [`ControlSurface`] over heap memory laid
//! out exactly like the kernel's buffers.  The matching
//! [`SimulatedKernel`] handle plays the instrumented code: it records PCs
//! and bumps counters, but only while the enabled flag is set and only
//! for the thread that bound itself, the same way the real device
//! behaves.
//!
//! ```
//! use ksancov::{DeviceHandle, SimulatedConfig, SimulatedDevice};
//!
//! let device = SimulatedDevice::new(SimulatedConfig::with_edges(4));
//! let kernel = device.kernel();
//! let mut handle = DeviceHandle::from_surface(device);
//! handle.configure_counters()?;
//! handle.map_data_buffer()?;
//! handle.bind_current_thread()?;
//! handle.collect_run(|| kernel.hit_edge(3))?;
//! assert_eq!(handle.counters()?.hits(3), Some(1));
//! # Ok::<(), ksancov::KsancovError>(())
//! ```
//!
//! Failures of individual operations can be injected with
//! [`SimulatedKernel::inject_failure`] to exercise error paths.

use crate::binding::ExecutionContext;
use crate::device::{ControlSurface, RawRegion};
use crate::error::DeviceOp;
use crate::mapping::{atomic_u32, atomic_u64, atomic_u8};
use crate::verified::saturating_hit;
use ksancov_protocol::{
    counters_buffer_len, edgemap_buffer_len, trace_buffer_len, COUNTERS_HITS_OFFSET,
    COUNTERS_NEDGES_OFFSET, EDGEMAP_ADDRS_OFFSET, EDGEMAP_ADDR_SIZE, EDGEMAP_NEDGES_OFFSET,
    HEADER_ENABLED_OFFSET, KSANCOV_COUNTERS_MAGIC, KSANCOV_EDGEMAP_MAGIC, KSANCOV_TRACE_MAGIC,
    TRACE_ENTRIES_OFFSET, TRACE_ENTRY_SIZE, TRACE_HEAD_OFFSET, TRACE_MAX_ENTRIES_OFFSET,
};
use log::{debug, trace};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Page alignment for simulated buffers, like a real mapping.
const PAGE_SIZE: usize = 4096;

/// First synthetic edge address handed out by [`SimulatedConfig::with_edges`].
const SYNTHETIC_EDGE_BASE: u64 = 0xffff_ff80_0010_0000;

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Shape of the simulated kernel.
///
/// The `reported_*` and `magic_override` fields make the simulated
/// kernel write headers that disagree with what was negotiated, to test
/// layout validation.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// One code address per instrumented edge.  The length is the edge
    /// count; a zero entry is an unresolvable edge.
    pub edge_addresses: Vec<u64>,
    /// Whether the edge map can be mapped at all.
    pub edge_map_available: bool,
    /// Capacity to write into the trace header instead of the requested one.
    pub reported_capacity: Option<usize>,
    /// Edge count to write into the counters header.
    pub reported_edges: Option<usize>,
    /// Edge count to write into the edge-map header.
    pub reported_edgemap_edges: Option<usize>,
    /// Magic to write into the data buffer header.
    pub magic_override: Option<u32>,
    /// Bytes to cut off the end of the data buffer mapping.
    pub truncate_data_by: usize,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            edge_addresses: Vec::new(),
            edge_map_available: true,
            reported_capacity: None,
            reported_edges: None,
            reported_edgemap_edges: None,
            magic_override: None,
            truncate_data_by: 0,
        }
    }
}

impl SimulatedConfig {
    /// A kernel with `nedges` edges at distinct synthetic addresses.
    pub fn with_edges(nedges: usize) -> Self {
        Self {
            edge_addresses: (0..nedges as u64)
                .map(|i| SYNTHETIC_EDGE_BASE + i * 0x10)
                .collect(),
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Simulated shared memory
// ═══════════════════════════════════════════════════════════════════════

/// Zeroed, page-aligned heap memory standing in for a kernel mapping.
struct SharedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: plain memory, accessed only through atomics.
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    fn zeroed(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE)
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn u32_at(&self, offset: usize) -> &std::sync::atomic::AtomicU32 {
        debug_assert!(offset + 4 <= self.len());
        // Safety: in bounds of a live, page-aligned allocation.
        unsafe { atomic_u32(self.ptr, offset) }
    }

    fn u64_at(&self, offset: usize) -> &std::sync::atomic::AtomicU64 {
        debug_assert!(offset + 8 <= self.len());
        // Safety: as above; all callers use 8-aligned offsets.
        unsafe { atomic_u64(self.ptr, offset) }
    }

    fn u8_at(&self, offset: usize) -> &std::sync::atomic::AtomicU8 {
        debug_assert!(offset < self.len());
        // Safety: as above.
        unsafe { atomic_u8(self.ptr, offset) }
    }

    fn enabled(&self) -> bool {
        self.u32_at(HEADER_ENABLED_OFFSET).load(Ordering::Relaxed) != 0
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // Safety: allocated in `zeroed` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Kernel state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum SimMode {
    Trace { capacity: usize },
    Counters { nedges: usize },
}

struct KernelState {
    config: SimulatedConfig,
    mode: Option<SimMode>,
    data: Option<SharedBuffer>,
    edgemap: Option<SharedBuffer>,
    data_mapped: bool,
    edge_map_mapped: bool,
    bound: Option<ExecutionContext>,
    failures: HashMap<DeviceOp, i32>,
    close_calls: usize,
}

impl KernelState {
    fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            mode: None,
            data: None,
            edgemap: None,
            data_mapped: false,
            edge_map_mapped: false,
            bound: None,
            failures: HashMap::new(),
            close_calls: 0,
        }
    }

    /// Fail `op` if a failure was injected for it (one shot).
    fn check(&mut self, op: DeviceOp) -> io::Result<()> {
        match self.failures.remove(&op) {
            Some(errno) => {
                debug!("Simulated {op} failing with errno {errno}");
                Err(io::Error::from_raw_os_error(errno))
            }
            None => Ok(()),
        }
    }

    fn select_mode(&mut self, mode: SimMode) -> io::Result<()> {
        if self.mode.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let len = match mode {
            SimMode::Trace { capacity } => trace_buffer_len(capacity),
            SimMode::Counters { nedges } => counters_buffer_len(nedges),
        }
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let buffer = SharedBuffer::zeroed(len)?;

        match mode {
            SimMode::Trace { capacity } => {
                let magic = self.config.magic_override.unwrap_or(KSANCOV_TRACE_MAGIC);
                let declared = self.config.reported_capacity.unwrap_or(capacity);
                buffer.u32_at(0).store(magic, Ordering::Relaxed);
                buffer
                    .u32_at(TRACE_MAX_ENTRIES_OFFSET)
                    .store(declared as u32, Ordering::Relaxed);
            }
            SimMode::Counters { nedges } => {
                let magic = self.config.magic_override.unwrap_or(KSANCOV_COUNTERS_MAGIC);
                let declared = self.config.reported_edges.unwrap_or(nedges);
                buffer.u32_at(0).store(magic, Ordering::Relaxed);
                buffer
                    .u32_at(COUNTERS_NEDGES_OFFSET)
                    .store(declared as u32, Ordering::Relaxed);
            }
        }

        self.mode = Some(mode);
        self.data = Some(buffer);
        Ok(())
    }

    fn build_edgemap(&self) -> io::Result<SharedBuffer> {
        let addresses = &self.config.edge_addresses;
        let len = edgemap_buffer_len(addresses.len())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let buffer = SharedBuffer::zeroed(len)?;
        let declared = self
            .config
            .reported_edgemap_edges
            .unwrap_or(addresses.len());
        buffer.u32_at(0).store(KSANCOV_EDGEMAP_MAGIC, Ordering::Relaxed);
        buffer
            .u32_at(EDGEMAP_NEDGES_OFFSET)
            .store(declared as u32, Ordering::Relaxed);
        for (i, &addr) in addresses.iter().enumerate() {
            buffer
                .u64_at(EDGEMAP_ADDRS_OFFSET + i * EDGEMAP_ADDR_SIZE)
                .store(addr, Ordering::Relaxed);
        }
        Ok(buffer)
    }

    /// The data buffer, if the calling thread would currently produce
    /// coverage into it.
    fn collecting(&self) -> Option<(&SharedBuffer, SimMode)> {
        let data = self.data.as_ref()?;
        let mode = self.mode?;
        if !data.enabled() || self.bound != Some(ExecutionContext::current()) {
            return None;
        }
        Some((data, mode))
    }
}

fn lock(state: &Mutex<KernelState>) -> MutexGuard<'_, KernelState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ═══════════════════════════════════════════════════════════════════════
//  Device and kernel handles
// ═══════════════════════════════════════════════════════════════════════

/// Control surface backed by simulated kernel memory.
pub struct SimulatedDevice {
    state: Arc<Mutex<KernelState>>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::new(config))),
        }
    }

    /// The kernel side of this device.
    pub fn kernel(&self) -> SimulatedKernel {
        SimulatedKernel {
            state: Arc::clone(&self.state),
        }
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SimulatedDevice")
            .field("mode", &state.mode)
            .field("data_mapped", &state.data_mapped)
            .field("edge_map_mapped", &state.edge_map_mapped)
            .finish()
    }
}

unsafe impl ControlSurface for SimulatedDevice {
    fn set_trace_mode(&mut self, max_entries: usize) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::SetTraceMode)?;
        if max_entries == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.select_mode(SimMode::Trace {
            capacity: max_entries,
        })
    }

    fn set_counters_mode(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::SetCountersMode)?;
        let nedges = state.config.edge_addresses.len();
        state.select_mode(SimMode::Counters { nedges })
    }

    fn map_data_buffer(&mut self) -> io::Result<RawRegion> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::MapDataBuffer)?;
        let truncate = state.config.truncate_data_by;
        let data = state
            .data
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let len = data.len().saturating_sub(truncate);
        // Safety: the allocation lives as long as the kernel state, which
        // this device keeps alive.
        let region = unsafe { RawRegion::new(data.ptr, len) };
        state.data_mapped = true;
        Ok(region)
    }

    fn map_edgemap_buffer(&mut self) -> io::Result<RawRegion> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::MapEdgeMap)?;
        if !state.config.edge_map_available {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if !matches!(state.mode, Some(SimMode::Counters { .. })) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if state.edgemap.is_none() {
            let buffer = state.build_edgemap()?;
            state.edgemap = Some(buffer);
        }
        let region = match &state.edgemap {
            // Safety: as for the data buffer.
            Some(edgemap) => unsafe { RawRegion::new(edgemap.ptr, edgemap.len()) },
            None => return Err(io::Error::from_raw_os_error(libc::ENOMEM)),
        };
        state.edge_map_mapped = true;
        Ok(region)
    }

    fn bind_current_thread(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::BindThread)?;
        if state.data.is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.bound = Some(ExecutionContext::current());
        Ok(())
    }

    fn edge_count(&mut self) -> io::Result<usize> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::EdgeCount)?;
        Ok(state.config.edge_addresses.len())
    }

    fn unmap(&mut self, region: RawRegion) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.check(DeviceOp::Unmap)?;
        let is = |buffer: &Option<SharedBuffer>| {
            buffer
                .as_ref()
                .is_some_and(|b| b.ptr.as_ptr() == region.as_ptr())
        };
        if is(&state.data) && state.data_mapped {
            state.data_mapped = false;
        } else if is(&state.edgemap) && state.edge_map_mapped {
            state.edge_map_mapped = false;
        } else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        state.check(DeviceOp::Close)?;
        state.bound = None;
        Ok(())
    }
}

/// The instrumented-code side of a [`SimulatedDevice`].
///
/// Cheap to clone and `Send`, so a workload thread can hold its own copy.
#[derive(Clone)]
pub struct SimulatedKernel {
    state: Arc<Mutex<KernelState>>,
}

impl SimulatedKernel {
    /// Record a PC as the trace instrumentation would.
    ///
    /// Returns whether anything was recorded: nothing is written unless
    /// the buffer is in trace mode, collection is enabled and the caller
    /// is the bound thread.  Past capacity only the head advances.
    pub fn record_pc(&self, pc: u64) -> bool {
        let state = lock(&self.state);
        let Some((data, SimMode::Trace { capacity })) = state.collecting() else {
            return false;
        };
        let head = data.u32_at(TRACE_HEAD_OFFSET);
        let idx = head.load(Ordering::Relaxed) as usize;
        if idx < capacity {
            data.u64_at(TRACE_ENTRIES_OFFSET + idx * TRACE_ENTRY_SIZE)
                .store(pc, Ordering::Relaxed);
        }
        head.store(idx.saturating_add(1).min(u32::MAX as usize) as u32, Ordering::Release);
        trace!("Simulated trace[{idx}] = {pc:#x}");
        true
    }

    /// Bump the counter of `edge` as the counters instrumentation would.
    ///
    /// Same conditions as [`record_pc`](Self::record_pc), plus the edge
    /// must exist.  Counters saturate at 255.
    pub fn hit_edge(&self, edge: usize) -> bool {
        let state = lock(&self.state);
        let Some((data, SimMode::Counters { nedges })) = state.collecting() else {
            return false;
        };
        if edge >= nedges {
            return false;
        }
        let counter = data.u8_at(COUNTERS_HITS_OFFSET + edge);
        counter.store(saturating_hit(counter.load(Ordering::Relaxed)), Ordering::Relaxed);
        true
    }

    /// Overwrite the trace head, e.g. with a value past capacity.
    pub fn set_raw_head(&self, head: u32) {
        let state = lock(&self.state);
        if let (Some(data), Some(SimMode::Trace { .. })) = (&state.data, state.mode) {
            data.u32_at(TRACE_HEAD_OFFSET).store(head, Ordering::Release);
        }
    }

    /// Make the next call of `op` fail with `errno`.
    pub fn inject_failure(&self, op: DeviceOp, errno: i32) {
        lock(&self.state).failures.insert(op, errno);
    }

    /// Whether the shared enabled flag is set.
    pub fn enabled(&self) -> bool {
        lock(&self.state)
            .data
            .as_ref()
            .is_some_and(SharedBuffer::enabled)
    }

    pub fn data_mapped(&self) -> bool {
        lock(&self.state).data_mapped
    }

    pub fn edge_map_mapped(&self) -> bool {
        lock(&self.state).edge_map_mapped
    }

    /// Number of times the device was closed.
    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    /// The configured address of `edge`, `None` for an empty slot.
    pub fn edge_address(&self, edge: usize) -> Option<u64> {
        lock(&self.state)
            .config
            .edge_addresses
            .get(edge)
            .copied()
            .filter(|&addr| addr != 0)
    }
}

impl std::fmt::Debug for SimulatedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedKernel").finish_non_exhaustive()
    }
}
