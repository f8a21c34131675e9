//! Mapping the shared buffers into the process.
//!
//! The device hands back a raw `(address, size)` pair.  This module is
//! the only place that sees it: each region is validated once against
//! the negotiated mode (magic, declared size, length, alignment) and
//! then wrapped in a mapping type that the readers borrow views from.
//!
//! A size or tag that disagrees with what the client negotiated is a
//! [`KsancovError::Layout`] error, distinct from a device-level
//! [`KsancovError::Map`] failure: it means the client and the kernel do
//! not agree on the interface, and retrying will not help.

use crate::device::{ControlSurface, DeviceHandle, RawRegion};
use crate::error::{BufferKind, KsancovError, LayoutMismatch, Result};
use crate::mode::Mode;
use crate::session::SessionState;
use ksancov_protocol::{
    counters_buffer_len, edgemap_buffer_len, trace_buffer_len, COUNTERS_NEDGES_OFFSET,
    EDGEMAP_NEDGES_OFFSET, HEADER_ENABLED_OFFSET, KSANCOV_COUNTERS_MAGIC, KSANCOV_EDGEMAP_MAGIC,
    KSANCOV_TRACE_MAGIC, TRACE_MAX_ENTRIES_OFFSET,
};
use log::{debug, info, warn};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

// ═══════════════════════════════════════════════════════════════════════
//  Shared memory access
// ═══════════════════════════════════════════════════════════════════════

/// View the `u32` at `offset` as an atomic.
///
/// # Safety
///
/// `base + offset` must lie in a live mapping, be 4-byte aligned, and
/// stay mapped for `'a`.
pub(crate) unsafe fn atomic_u32<'a>(base: NonNull<u8>, offset: usize) -> &'a AtomicU32 {
    &*base.as_ptr().add(offset).cast::<AtomicU32>()
}

/// View the `u64` at `offset` as an atomic.
///
/// # Safety
///
/// As [`atomic_u32`], with 8-byte alignment.
pub(crate) unsafe fn atomic_u64<'a>(base: NonNull<u8>, offset: usize) -> &'a AtomicU64 {
    &*base.as_ptr().add(offset).cast::<AtomicU64>()
}

/// View the byte at `offset` as an atomic.
///
/// # Safety
///
/// `base + offset` must lie in a live mapping that stays mapped for `'a`.
pub(crate) unsafe fn atomic_u8<'a>(base: NonNull<u8>, offset: usize) -> &'a AtomicU8 {
    &*base.as_ptr().add(offset).cast::<AtomicU8>()
}

// ═══════════════════════════════════════════════════════════════════════
//  Validated mappings
// ═══════════════════════════════════════════════════════════════════════

/// Size information about a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    /// Bytes mapped by the device.
    pub size: usize,
    /// Declared entries: trace capacity, counter count or edge-map length.
    pub entries: usize,
}

/// A trace buffer whose header matched the negotiated capacity.
#[derive(Debug)]
pub(crate) struct TraceMapping {
    pub(crate) region: RawRegion,
    pub(crate) capacity: usize,
}

/// A counters buffer whose header matched the device's edge count.
#[derive(Debug)]
pub(crate) struct CountersMapping {
    pub(crate) region: RawRegion,
    pub(crate) nedges: usize,
}

/// The data buffer of a session, in whichever mode was negotiated.
#[derive(Debug)]
pub(crate) enum DataMapping {
    Trace(TraceMapping),
    Counters(CountersMapping),
}

impl DataMapping {
    fn region(&self) -> &RawRegion {
        match self {
            DataMapping::Trace(t) => &t.region,
            DataMapping::Counters(c) => &c.region,
        }
    }

    /// The header's enabled flag.
    pub(crate) fn enabled_flag(&self) -> &AtomicU32 {
        // Safety: validated at map time: region covers the header and is
        // at least 4-byte aligned.
        unsafe { atomic_u32(self.region().base(), HEADER_ENABLED_OFFSET) }
    }

    /// Clear the enabled flag.
    pub(crate) fn disable(&self) {
        self.enabled_flag().store(0, Ordering::Relaxed);
    }

    pub(crate) fn info(&self) -> MapInfo {
        let entries = match self {
            DataMapping::Trace(t) => t.capacity,
            DataMapping::Counters(c) => c.nedges,
        };
        MapInfo {
            size: self.region().len(),
            entries,
        }
    }

    pub(crate) fn into_region(self) -> RawRegion {
        match self {
            DataMapping::Trace(t) => t.region,
            DataMapping::Counters(c) => c.region,
        }
    }
}

/// An edge map whose length matched the counters buffer.
#[derive(Debug)]
pub(crate) struct EdgeMapMapping {
    pub(crate) region: RawRegion,
    pub(crate) nedges: usize,
}

impl EdgeMapMapping {
    pub(crate) fn info(&self) -> MapInfo {
        MapInfo {
            size: self.region.len(),
            entries: self.nedges,
        }
    }

    pub(crate) fn into_region(self) -> RawRegion {
        self.region
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Layout validation
// ═══════════════════════════════════════════════════════════════════════

fn check_alignment(region: &RawRegion, align: usize) -> Result<(), LayoutMismatch> {
    let addr = region.as_ptr() as usize;
    if addr % align != 0 {
        return Err(LayoutMismatch::Misaligned { addr, align });
    }
    Ok(())
}

fn check_len(region: &RawRegion, required: Option<usize>) -> Result<(), LayoutMismatch> {
    let required = required.unwrap_or(usize::MAX);
    if region.len() < required {
        return Err(LayoutMismatch::TooShort {
            required,
            mapped: region.len(),
        });
    }
    Ok(())
}

fn check_magic(found: u32, expected: u32) -> Result<(), LayoutMismatch> {
    if found != expected {
        return Err(LayoutMismatch::Magic { expected, found });
    }
    Ok(())
}

/// Read the `(magic, count)` pair at the start of a region whose fixed
/// header spans `header_len` bytes.
fn read_tag_and_count(
    region: &RawRegion,
    header_len: usize,
    count_offset: usize,
) -> Result<(u32, usize), LayoutMismatch> {
    check_len(region, Some(header_len))?;
    // Safety: length and 4-byte alignment checked above / by the caller.
    let (magic, count) = unsafe {
        (
            atomic_u32(region.base(), 0).load(Ordering::Acquire),
            atomic_u32(region.base(), count_offset).load(Ordering::Acquire),
        )
    };
    Ok((magic, count as usize))
}

/// Check a trace buffer against the requested capacity.
pub(crate) fn validate_trace(region: &RawRegion, max_entries: usize) -> Result<(), LayoutMismatch> {
    check_alignment(region, std::mem::align_of::<u64>())?;
    let (magic, capacity) =
        read_tag_and_count(region, trace_buffer_len(0).unwrap_or(usize::MAX), TRACE_MAX_ENTRIES_OFFSET)?;
    check_magic(magic, KSANCOV_TRACE_MAGIC)?;
    if capacity != max_entries {
        return Err(LayoutMismatch::Capacity {
            expected: max_entries,
            found: capacity,
        });
    }
    check_len(region, trace_buffer_len(capacity))
}

/// Check a counters buffer against the device's edge count.
pub(crate) fn validate_counters(region: &RawRegion, nedges: usize) -> Result<(), LayoutMismatch> {
    check_alignment(region, std::mem::align_of::<u32>())?;
    let (magic, found) =
        read_tag_and_count(region, counters_buffer_len(0).unwrap_or(usize::MAX), COUNTERS_NEDGES_OFFSET)?;
    check_magic(magic, KSANCOV_COUNTERS_MAGIC)?;
    if found != nedges {
        return Err(LayoutMismatch::EdgeCount {
            expected: nedges,
            found,
        });
    }
    check_len(region, counters_buffer_len(found))
}

/// Check an edge map against the counters buffer's edge count.
pub(crate) fn validate_edge_map(region: &RawRegion, nedges: usize) -> Result<(), LayoutMismatch> {
    check_alignment(region, std::mem::align_of::<u64>())?;
    let (magic, found) =
        read_tag_and_count(region, edgemap_buffer_len(0).unwrap_or(usize::MAX), EDGEMAP_NEDGES_OFFSET)?;
    check_magic(magic, KSANCOV_EDGEMAP_MAGIC)?;
    if found != nedges {
        return Err(LayoutMismatch::EdgeCount {
            expected: nedges,
            found,
        });
    }
    check_len(region, edgemap_buffer_len(found))
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle operations
// ═══════════════════════════════════════════════════════════════════════

impl<S: ControlSurface> DeviceHandle<S> {
    /// Map the data buffer of the configured mode.
    ///
    /// Requires a configured, not yet mapped handle.  The mapping is
    /// checked against the negotiated mode; a mismatch unmaps it again
    /// and returns [`KsancovError::Layout`].
    pub fn map_data_buffer(&mut self) -> Result<MapInfo> {
        let mode = match (self.state, self.mode) {
            (SessionState::Configured, Some(mode)) => mode,
            (state, _) => {
                return Err(KsancovError::InvalidState {
                    op: "map_data_buffer",
                    state,
                })
            }
        };

        let region = self
            .surface
            .map_data_buffer()
            .map_err(|source| KsancovError::Map {
                buffer: BufferKind::Data,
                source,
            })?;
        debug!("Data buffer mapped: {} bytes", region.len());

        let checked = match mode {
            Mode::Trace { max_entries } => validate_trace(&region, max_entries),
            Mode::Counters { nedges } => validate_counters(&region, nedges),
        };
        if let Err(mismatch) = checked {
            self.release_rejected(region, BufferKind::Data);
            return Err(KsancovError::Layout {
                buffer: BufferKind::Data,
                mismatch,
            });
        }

        let mapping = match mode {
            Mode::Trace { max_entries } => DataMapping::Trace(TraceMapping {
                region,
                capacity: max_entries,
            }),
            Mode::Counters { nedges } => DataMapping::Counters(CountersMapping { region, nedges }),
        };
        let info = mapping.info();
        self.data = Some(mapping);
        self.state = SessionState::Mapped;
        info!(
            "Data buffer ready: {} bytes, {} entries",
            info.size, info.entries
        );
        Ok(info)
    }

    /// Map the read-only edge-address table.
    ///
    /// Only valid in counters mode, after the data buffer is mapped and
    /// before collection starts.  The edge map is optional: when this
    /// fails the session stays usable and
    /// [`resolve_edge_address`](DeviceHandle::resolve_edge_address)
    /// returns `None`.
    pub fn map_edge_map(&mut self) -> Result<MapInfo> {
        let nedges = match (self.state, self.mode) {
            (SessionState::Mapped | SessionState::Bound, Some(Mode::Counters { nedges }))
                if self.edges.is_none() =>
            {
                nedges
            }
            (state, _) => {
                return Err(KsancovError::InvalidState {
                    op: "map_edge_map",
                    state,
                })
            }
        };

        let region = self
            .surface
            .map_edgemap_buffer()
            .map_err(|source| {
                warn!("Edge map unavailable, reporting edge indices only: {source}");
                KsancovError::Map {
                    buffer: BufferKind::EdgeMap,
                    source,
                }
            })?;

        if let Err(mismatch) = validate_edge_map(&region, nedges) {
            self.release_rejected(region, BufferKind::EdgeMap);
            return Err(KsancovError::Layout {
                buffer: BufferKind::EdgeMap,
                mismatch,
            });
        }

        let mapping = EdgeMapMapping { region, nedges };
        let info = mapping.info();
        self.edges = Some(mapping);
        info!("Edge map ready: {} edges", info.entries);
        Ok(info)
    }

    /// Size information about the mapped data buffer.
    pub fn data_buffer_info(&self) -> Option<MapInfo> {
        self.data.as_ref().map(DataMapping::info)
    }

    fn release_rejected(&mut self, region: RawRegion, buffer: BufferKind) {
        warn!("Rejecting {buffer}: layout does not match negotiated mode");
        if let Err(err) = self.surface.unmap(region) {
            warn!("Failed to unmap rejected {buffer}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceOp;
    use crate::fake::{SimulatedConfig, SimulatedDevice};

    #[test]
    fn trace_mapping_reports_requested_capacity() {
        for capacity in [1usize, 7, 64, 4096] {
            let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(Default::default()));
            handle.configure_trace(capacity).unwrap();
            let info = handle.map_data_buffer().unwrap();
            assert_eq!(info.entries, capacity);
            assert!(info.size >= trace_buffer_len(capacity).unwrap());
            assert_eq!(handle.trace().unwrap().capacity(), capacity);
            assert_eq!(handle.state(), SessionState::Mapped);
        }
    }

    #[test]
    fn counters_mapping_reports_edge_count() {
        let mut handle =
            DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::with_edges(100)));
        handle.configure_counters().unwrap();
        let info = handle.map_data_buffer().unwrap();
        assert_eq!(info.entries, 100);
        assert_eq!(handle.data_buffer_info(), Some(info));
    }

    #[test]
    fn mapping_requires_configuration() {
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(Default::default()));
        assert!(matches!(
            handle.map_data_buffer(),
            Err(KsancovError::InvalidState {
                state: SessionState::Opened,
                ..
            })
        ));
    }

    #[test]
    fn data_buffer_maps_once() {
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(Default::default()));
        handle.configure_trace(8).unwrap();
        handle.map_data_buffer().unwrap();
        assert!(matches!(
            handle.map_data_buffer(),
            Err(KsancovError::InvalidState { .. })
        ));
    }

    #[test]
    fn capacity_skew_is_layout_error() {
        let config = SimulatedConfig {
            reported_capacity: Some(99),
            ..SimulatedConfig::default()
        };
        let device = SimulatedDevice::new(config);
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_trace(100).unwrap();

        let err = handle.map_data_buffer().unwrap_err();
        assert!(matches!(
            err,
            KsancovError::Layout {
                buffer: BufferKind::Data,
                mismatch: LayoutMismatch::Capacity {
                    expected: 100,
                    found: 99
                },
            }
        ));
        assert!(!err.is_retryable());
        // The rejected mapping is released and the handle stays configured.
        assert!(!kernel.data_mapped());
        assert_eq!(handle.state(), SessionState::Configured);
    }

    #[test]
    fn edge_count_skew_is_layout_error() {
        let config = SimulatedConfig {
            reported_edges: Some(3),
            ..SimulatedConfig::with_edges(4)
        };
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(config));
        handle.configure_counters().unwrap();
        assert!(matches!(
            handle.map_data_buffer(),
            Err(KsancovError::Layout {
                mismatch: LayoutMismatch::EdgeCount {
                    expected: 4,
                    found: 3
                },
                ..
            })
        ));
    }

    #[test]
    fn wrong_magic_is_layout_error() {
        let config = SimulatedConfig {
            magic_override: Some(KSANCOV_COUNTERS_MAGIC),
            ..SimulatedConfig::default()
        };
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(config));
        handle.configure_trace(4).unwrap();
        assert!(matches!(
            handle.map_data_buffer(),
            Err(KsancovError::Layout {
                mismatch: LayoutMismatch::Magic {
                    expected: KSANCOV_TRACE_MAGIC,
                    found: KSANCOV_COUNTERS_MAGIC
                },
                ..
            })
        ));
    }

    #[test]
    fn short_mapping_is_layout_error() {
        let config = SimulatedConfig {
            truncate_data_by: 8,
            ..SimulatedConfig::default()
        };
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(config));
        handle.configure_trace(4).unwrap();
        assert!(matches!(
            handle.map_data_buffer(),
            Err(KsancovError::Layout {
                mismatch: LayoutMismatch::TooShort {
                    required: 48,
                    mapped: 40
                },
                ..
            })
        ));
    }

    #[test]
    fn map_failure_is_map_error_with_errno() {
        let device = SimulatedDevice::new(Default::default());
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_trace(4).unwrap();
        kernel.inject_failure(DeviceOp::MapDataBuffer, libc::ENOMEM);

        let err = handle.map_data_buffer().unwrap_err();
        assert!(matches!(
            err,
            KsancovError::Map {
                buffer: BufferKind::Data,
                ..
            }
        ));
        assert_eq!(err.os_error(), Some(libc::ENOMEM));
        assert!(err.is_retryable());
    }

    #[test]
    fn edge_map_rejected_in_trace_mode() {
        let device = SimulatedDevice::new(SimulatedConfig::with_edges(4));
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_trace(4).unwrap();
        handle.map_data_buffer().unwrap();

        let err = handle.map_edge_map().unwrap_err();
        assert!(matches!(
            err,
            KsancovError::InvalidState {
                op: "map_edge_map",
                ..
            }
        ));
        assert!(!kernel.edge_map_mapped());
        assert!(!handle.has_edge_map());
        assert_eq!(handle.resolve_edge_address(0), None);
    }

    #[test]
    fn edge_map_requires_data_buffer() {
        let mut handle =
            DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::with_edges(4)));
        handle.configure_counters().unwrap();
        assert!(matches!(
            handle.map_edge_map(),
            Err(KsancovError::InvalidState {
                state: SessionState::Configured,
                ..
            })
        ));
    }

    #[test]
    fn missing_edge_map_does_not_abort_session() {
        let config = SimulatedConfig {
            edge_map_available: false,
            ..SimulatedConfig::with_edges(6)
        };
        let device = SimulatedDevice::new(config);
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();

        let err = handle.map_edge_map().unwrap_err();
        assert!(matches!(
            err,
            KsancovError::Map {
                buffer: BufferKind::EdgeMap,
                ..
            }
        ));

        handle.bind_current_thread().unwrap();
        handle.reset().unwrap();
        handle.start().unwrap();
        assert!(kernel.hit_edge(1));
        handle.stop().unwrap();

        let hits: Vec<_> = handle
            .counters()
            .unwrap()
            .counter_hits()
            .filter(|&(_, hits)| hits > 0)
            .collect();
        assert_eq!(hits, vec![(1, 1)]);
        assert_eq!(handle.resolve_edge_address(1), None);
    }

    #[test]
    fn edge_map_maps_once() {
        let mut handle =
            DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::with_edges(4)));
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        let info = handle.map_edge_map().unwrap();
        assert_eq!(info.entries, 4);
        assert!(matches!(
            handle.map_edge_map(),
            Err(KsancovError::InvalidState { .. })
        ));
    }

    #[test]
    fn edge_map_length_skew_is_layout_error() {
        let config = SimulatedConfig {
            reported_edgemap_edges: Some(5),
            ..SimulatedConfig::with_edges(4)
        };
        let device = SimulatedDevice::new(config);
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        assert!(matches!(
            handle.map_edge_map(),
            Err(KsancovError::Layout {
                buffer: BufferKind::EdgeMap,
                mismatch: LayoutMismatch::EdgeCount {
                    expected: 4,
                    found: 5
                },
            })
        ));
        assert!(!kernel.edge_map_mapped());
        assert!(!handle.has_edge_map());
    }
}
