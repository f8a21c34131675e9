//! Read-only views over the shared buffers.
//!
//! Views borrow the handle, so they cannot outlive the mapping.  All
//! reads go through relaxed atomic loads (the kernel may still be
//! writing if the caller reads while collection is running); the trace
//! head is loaded with acquire ordering so every entry below it is
//! visible.
//!
//! Reading while running is allowed but racy: the result is a snapshot
//! with no guarantees beyond "each value was written at some point".

use crate::device::{ControlSurface, DeviceHandle};
use crate::error::{KsancovError, Result};
use crate::mapping::{atomic_u32, atomic_u64, atomic_u8, DataMapping};
use crate::verified::{clamp_head, dropped_entries, entry_readable};
use ksancov_protocol::{
    COUNTERS_HITS_OFFSET, EDGEMAP_ADDRS_OFFSET, EDGEMAP_ADDR_SIZE, TRACE_ENTRIES_OFFSET,
    TRACE_ENTRY_SIZE, TRACE_HEAD_OFFSET,
};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

// ═══════════════════════════════════════════════════════════════════════
//  Trace
// ═══════════════════════════════════════════════════════════════════════

/// View over a trace-mode data buffer.
#[derive(Clone, Copy)]
pub struct TraceBuffer<'a> {
    base: NonNull<u8>,
    capacity: usize,
    _mapping: PhantomData<&'a DataMapping>,
}

impl<'a> TraceBuffer<'a> {
    /// Maximum number of entries the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The head exactly as the kernel last wrote it.  May exceed the
    /// capacity once the buffer overflowed.
    pub fn raw_head(&self) -> usize {
        // Safety: the mapping was validated to cover the trace header and
        // is borrowed for `'a`.
        unsafe { atomic_u32(self.base, TRACE_HEAD_OFFSET) }.load(Ordering::Acquire) as usize
    }

    /// Number of valid entries: the head clamped to the capacity.
    pub fn head(&self) -> usize {
        clamp_head(self.raw_head(), self.capacity)
    }

    /// Entries the kernel could not store because the buffer was full.
    pub fn dropped(&self) -> usize {
        dropped_entries(self.raw_head(), self.capacity)
    }

    /// Whether the kernel recorded more entries than fit.
    pub fn overflowed(&self) -> bool {
        self.dropped() > 0
    }

    /// The program counter at `index`, or 0 when `index` is at or past
    /// the current head.  Zero is never a valid recorded PC.
    pub fn entry(&self, index: usize) -> u64 {
        if !entry_readable(index, self.head()) {
            return 0;
        }
        self.load(index)
    }

    fn load(&self, index: usize) -> u64 {
        debug_assert!(index < self.capacity);
        // Safety: `index < capacity`, and the mapping was validated to
        // hold `capacity` 8-byte entries after the header.
        unsafe { atomic_u64(self.base, TRACE_ENTRIES_OFFSET + index * TRACE_ENTRY_SIZE) }
            .load(Ordering::Relaxed)
    }

    /// Recorded PCs in order.  The head is read once, when the iterator
    /// is created.
    pub fn entries(&self) -> TraceEntries<'a> {
        TraceEntries {
            buffer: *self,
            next: 0,
            end: self.head(),
        }
    }

    /// Distinct recorded PCs, sorted.
    pub fn unique_pcs(&self) -> BTreeSet<u64> {
        self.entries().collect()
    }
}

impl std::fmt::Debug for TraceBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("capacity", &self.capacity)
            .field("raw_head", &self.raw_head())
            .finish()
    }
}

/// Iterator over a snapshot of the trace.
#[derive(Debug, Clone)]
pub struct TraceEntries<'a> {
    buffer: TraceBuffer<'a>,
    next: usize,
    end: usize,
}

impl Iterator for TraceEntries<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.next >= self.end {
            return None;
        }
        let pc = self.buffer.load(self.next);
        self.next += 1;
        Some(pc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TraceEntries<'_> {}

// ═══════════════════════════════════════════════════════════════════════
//  Counters
// ═══════════════════════════════════════════════════════════════════════

/// View over a counters-mode data buffer.
#[derive(Clone, Copy)]
pub struct CounterBuffer<'a> {
    base: NonNull<u8>,
    nedges: usize,
    _mapping: PhantomData<&'a DataMapping>,
}

impl<'a> CounterBuffer<'a> {
    /// Number of edges (and counters).
    pub fn edge_count(&self) -> usize {
        self.nedges
    }

    /// Hit count of `edge`, or `None` if the index is out of range.
    pub fn hits(&self, edge: usize) -> Option<u8> {
        (edge < self.nedges).then(|| self.load(edge))
    }

    fn load(&self, edge: usize) -> u8 {
        // Safety: `edge < nedges`, covered by the validated mapping.
        unsafe { atomic_u8(self.base, COUNTERS_HITS_OFFSET + edge) }.load(Ordering::Relaxed)
    }

    /// Every `(edge, hits)` pair in index order, zero counts included.
    ///
    /// The iterator reads lazily and can be recreated any number of
    /// times.
    pub fn counter_hits(&self) -> CounterHits<'a> {
        CounterHits {
            buffer: *self,
            next: 0,
        }
    }

    /// Edges with at least one hit.
    pub fn hit_edges(&self) -> impl Iterator<Item = usize> + 'a {
        self.counter_hits()
            .filter(|&(_, hits)| hits > 0)
            .map(|(edge, _)| edge)
    }
}

impl std::fmt::Debug for CounterBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterBuffer")
            .field("nedges", &self.nedges)
            .finish()
    }
}

/// Iterator over `(edge, hits)` pairs.
#[derive(Debug, Clone)]
pub struct CounterHits<'a> {
    buffer: CounterBuffer<'a>,
    next: usize,
}

impl Iterator for CounterHits<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<(usize, u8)> {
        if self.next >= self.buffer.nedges {
            return None;
        }
        let edge = self.next;
        self.next += 1;
        Some((edge, self.buffer.load(edge)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.buffer.nedges - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CounterHits<'_> {}

// ═══════════════════════════════════════════════════════════════════════
//  Edge map
// ═══════════════════════════════════════════════════════════════════════

/// View over the edge-address table.
#[derive(Clone, Copy)]
pub struct EdgeMap<'a> {
    base: NonNull<u8>,
    nedges: usize,
    _mapping: PhantomData<&'a DataMapping>,
}

impl EdgeMap<'_> {
    pub fn edge_count(&self) -> usize {
        self.nedges
    }

    /// Code address of `edge`.  `None` when out of range or when the
    /// kernel left the slot empty.
    pub fn address(&self, edge: usize) -> Option<u64> {
        if edge >= self.nedges {
            return None;
        }
        // Safety: `edge < nedges`, covered by the validated mapping.
        let addr = unsafe { atomic_u64(self.base, EDGEMAP_ADDRS_OFFSET + edge * EDGEMAP_ADDR_SIZE) }
            .load(Ordering::Relaxed);
        (addr != 0).then_some(addr)
    }
}

impl std::fmt::Debug for EdgeMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeMap").field("nedges", &self.nedges).finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle accessors
// ═══════════════════════════════════════════════════════════════════════

impl<S: ControlSurface> DeviceHandle<S> {
    /// View the trace buffer.  Fails unless a trace-mode buffer is mapped.
    pub fn trace(&self) -> Result<TraceBuffer<'_>> {
        match &self.data {
            Some(DataMapping::Trace(trace)) => Ok(TraceBuffer {
                base: trace.region.base(),
                capacity: trace.capacity,
                _mapping: PhantomData,
            }),
            _ => Err(KsancovError::InvalidState {
                op: "trace",
                state: self.state,
            }),
        }
    }

    /// View the counters buffer.  Fails unless a counters-mode buffer is
    /// mapped.
    pub fn counters(&self) -> Result<CounterBuffer<'_>> {
        match &self.data {
            Some(DataMapping::Counters(counters)) => Ok(CounterBuffer {
                base: counters.region.base(),
                nedges: counters.nedges,
                _mapping: PhantomData,
            }),
            _ => Err(KsancovError::InvalidState {
                op: "counters",
                state: self.state,
            }),
        }
    }

    /// View the edge map, if one was mapped.
    pub fn edge_map(&self) -> Option<EdgeMap<'_>> {
        self.edges.as_ref().map(|edges| EdgeMap {
            base: edges.region.base(),
            nedges: edges.nedges,
            _mapping: PhantomData,
        })
    }

    pub fn has_edge_map(&self) -> bool {
        self.edges.is_some()
    }

    /// Code address of a counters-mode edge index.
    ///
    /// `None` without an edge map, for an out-of-range index, or for an
    /// unresolvable slot.  Callers fall back to reporting the raw index.
    pub fn resolve_edge_address(&self, edge: usize) -> Option<u64> {
        self.edge_map()?.address(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{SimulatedConfig, SimulatedDevice, SimulatedKernel};
    use crate::session::SessionState;

    fn running_trace(capacity: usize) -> (DeviceHandle<SimulatedDevice>, SimulatedKernel) {
        let device = SimulatedDevice::new(SimulatedConfig::default());
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_trace(capacity).unwrap();
        handle.map_data_buffer().unwrap();
        handle.bind_current_thread().unwrap();
        handle.reset().unwrap();
        handle.start().unwrap();
        (handle, kernel)
    }

    #[test]
    fn trace_entries_in_order() {
        let (mut handle, kernel) = running_trace(16);
        for pc in [0x1000, 0x2000, 0x1000, 0x3000] {
            assert!(kernel.record_pc(pc));
        }
        handle.stop().unwrap();

        let trace = handle.trace().unwrap();
        assert_eq!(trace.head(), 4);
        assert_eq!(trace.entries().len(), 4);
        assert_eq!(
            trace.entries().collect::<Vec<_>>(),
            vec![0x1000, 0x2000, 0x1000, 0x3000]
        );
        assert_eq!(
            trace.unique_pcs().into_iter().collect::<Vec<_>>(),
            vec![0x1000, 0x2000, 0x3000]
        );
        assert!(!trace.overflowed());
    }

    #[test]
    fn entry_past_head_is_zero() {
        let (mut handle, kernel) = running_trace(8);
        kernel.record_pc(0xabc);
        handle.stop().unwrap();

        let trace = handle.trace().unwrap();
        assert_eq!(trace.entry(0), 0xabc);
        assert_eq!(trace.entry(1), 0);
        assert_eq!(trace.entry(7), 0);
        assert_eq!(trace.entry(1_000_000), 0);
    }

    #[test]
    fn overflowing_trace_is_clamped() {
        let (mut handle, kernel) = running_trace(3);
        for pc in 1..=5u64 {
            kernel.record_pc(pc * 0x100);
        }
        handle.stop().unwrap();

        let trace = handle.trace().unwrap();
        assert_eq!(trace.raw_head(), 5);
        assert_eq!(trace.head(), 3);
        assert_eq!(trace.dropped(), 2);
        assert!(trace.overflowed());
        assert_eq!(
            trace.entries().collect::<Vec<_>>(),
            vec![0x100, 0x200, 0x300]
        );
    }

    #[test]
    fn bogus_head_never_reads_out_of_bounds() {
        let (mut handle, kernel) = running_trace(4);
        handle.stop().unwrap();
        kernel.set_raw_head(u32::MAX);

        let trace = handle.trace().unwrap();
        assert_eq!(trace.head(), 4);
        assert_eq!(trace.entries().count(), 4);
        assert_eq!(trace.entry(4), 0);
    }

    #[test]
    fn entries_snapshot_head_once() {
        let (handle, kernel) = running_trace(8);
        kernel.record_pc(0x10);
        let trace = handle.trace().unwrap();
        let entries = trace.entries();
        kernel.record_pc(0x20);
        assert_eq!(entries.collect::<Vec<_>>(), vec![0x10]);
        assert_eq!(trace.head(), 2);
    }

    #[test]
    fn counters_view_in_trace_mode_is_invalid_state() {
        let (handle, _kernel) = running_trace(4);
        assert!(matches!(
            handle.counters(),
            Err(KsancovError::InvalidState { op: "counters", .. })
        ));
    }

    #[test]
    fn trace_view_requires_mapping() {
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::default()));
        handle.configure_trace(4).unwrap();
        assert!(matches!(
            handle.trace(),
            Err(KsancovError::InvalidState {
                op: "trace",
                state: SessionState::Configured,
            })
        ));
    }

    #[test]
    fn counter_hits_is_restartable() {
        let device = SimulatedDevice::new(SimulatedConfig::with_edges(5));
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        handle.bind_current_thread().unwrap();
        handle.collect_run(|| kernel.hit_edge(4)).unwrap();

        let counters = handle.counters().unwrap();
        assert_eq!(counters.edge_count(), 5);
        let first: Vec<_> = counters.counter_hits().collect();
        let second: Vec<_> = counters.counter_hits().collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![(0, 0), (1, 0), (2, 0), (3, 0), (4, 1)]);
        assert_eq!(counters.hits(5), None);
        assert_eq!(counters.hit_edges().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn counters_saturate_at_255() {
        let device = SimulatedDevice::new(SimulatedConfig::with_edges(2));
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        handle.bind_current_thread().unwrap();
        handle
            .collect_run(|| {
                for _ in 0..1000 {
                    kernel.hit_edge(0);
                }
            })
            .unwrap();
        assert_eq!(handle.counters().unwrap().hits(0), Some(255));
    }

    #[test]
    fn counters_round_trip_with_edge_map() {
        let device = SimulatedDevice::new(SimulatedConfig::with_edges(8));
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        handle.map_edge_map().unwrap();
        handle.bind_current_thread().unwrap();
        handle.reset().unwrap();
        handle.start().unwrap();
        kernel.hit_edge(2);
        kernel.hit_edge(5);
        kernel.hit_edge(5);
        handle.stop().unwrap();

        let hit: Vec<_> = handle
            .counters()
            .unwrap()
            .counter_hits()
            .filter(|&(_, hits)| hits > 0)
            .collect();
        assert_eq!(hit, vec![(2, 1), (5, 2)]);

        assert_eq!(handle.resolve_edge_address(2), kernel.edge_address(2));
        assert!(handle.resolve_edge_address(2).is_some());
        assert_eq!(handle.resolve_edge_address(8), None);
        assert_eq!(handle.edge_map().unwrap().edge_count(), 8);
    }

    #[test]
    fn empty_edge_map_slot_is_unresolved() {
        let config = SimulatedConfig {
            edge_addresses: vec![0x1000, 0, 0x3000],
            ..SimulatedConfig::default()
        };
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(config));
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        handle.map_edge_map().unwrap();
        assert_eq!(handle.resolve_edge_address(0), Some(0x1000));
        assert_eq!(handle.resolve_edge_address(1), None);
        assert_eq!(handle.resolve_edge_address(2), Some(0x3000));
    }
}
