//! Shared memory layout and control codes for the `ksancov` coverage device.
//!
//! This crate defines the bit-exact structures the kernel exposes through
//! `/dev/ksancov`, the magic tags stamped into each buffer, and the
//! BSD-style `ioctl` request numbers used to drive the device.  It is
//! `no_std`-compatible with zero dependencies.
//!
//! # Session protocol
//!
//! 1. Client opens the device node
//! 2. Client selects a mode: [`KSANCOV_IOC_TRACE`] (with capacity) or
//!    [`KSANCOV_IOC_COUNTERS`]
//! 3. Client asks the kernel to map the data buffer ([`KSANCOV_IOC_MAP`])
//!    and, in counters mode, the edge map ([`KSANCOV_IOC_MAP_EDGEMAP`])
//! 4. Client binds the calling thread ([`KSANCOV_IOC_START`])
//! 5. Client toggles [`Header::enabled`] around the workload
//! 6. Client reads the trace head / counters out of the mapping
//!
//! Apart from rebinding another thread, everything after step 4 happens
//! through shared memory.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::AtomicU32;

// ═══════════════════════════════════════════════════════════════════════
//  Device node
// ═══════════════════════════════════════════════════════════════════════

/// Default path of the coverage device node.
pub const KSANCOV_PATH: &str = "/dev/ksancov";

// ═══════════════════════════════════════════════════════════════════════
//  Magic tags
// ═══════════════════════════════════════════════════════════════════════

/// Tag in [`Header::magic`] of a trace-mode data buffer.
pub const KSANCOV_TRACE_MAGIC: u32 = 0x5AD1_7F5B;

/// Tag in [`Header::magic`] of a counters-mode data buffer.
pub const KSANCOV_COUNTERS_MAGIC: u32 = 0x5AD2_7F6B;

/// Tag in [`EdgeMapHeader::magic`].
pub const KSANCOV_EDGEMAP_MAGIC: u32 = 0x5AD3_7F7B;

// ═══════════════════════════════════════════════════════════════════════
//  ioctl encoding (BSD `sys/ioccom.h`)
// ═══════════════════════════════════════════════════════════════════════

/// Parameter length mask: lengths are encoded in 13 bits.
pub const IOCPARM_MASK: u64 = 0x1fff;

/// No parameters.
pub const IOC_VOID: u64 = 0x2000_0000;

/// Copy parameters out of the kernel.
pub const IOC_OUT: u64 = 0x4000_0000;

/// Copy parameters into the kernel.
pub const IOC_IN: u64 = 0x8000_0000;

/// Copy parameters in and out.
pub const IOC_INOUT: u64 = IOC_IN | IOC_OUT;

/// Group letter used by every ksancov request.
pub const KSANCOV_IOC_GROUP: u8 = b'K';

/// Encode an ioctl request number the way `_IOC()` does.
pub const fn ioc(inout: u64, group: u8, num: u8, len: usize) -> u64 {
    inout | (((len as u64) & IOCPARM_MASK) << 16) | ((group as u64) << 8) | num as u64
}

/// `_IO(group, num)`
pub const fn io(group: u8, num: u8) -> u64 {
    ioc(IOC_VOID, group, num, 0)
}

/// `_IOR(group, num, T)`
pub const fn ior(group: u8, num: u8, len: usize) -> u64 {
    ioc(IOC_OUT, group, num, len)
}

/// `_IOW(group, num, T)`
pub const fn iow(group: u8, num: u8, len: usize) -> u64 {
    ioc(IOC_IN, group, num, len)
}

/// `_IOWR(group, num, T)`
pub const fn iowr(group: u8, num: u8, len: usize) -> u64 {
    ioc(IOC_INOUT, group, num, len)
}

/// Select trace mode.  Parameter: `size_t` capacity in entries.
pub const KSANCOV_IOC_TRACE: u64 = iow(KSANCOV_IOC_GROUP, 1, core::mem::size_of::<usize>());

/// Select counters mode.  No parameter.
pub const KSANCOV_IOC_COUNTERS: u64 = io(KSANCOV_IOC_GROUP, 2);

/// Map the data buffer.  Parameter: [`BufDesc`] (filled by the kernel).
pub const KSANCOV_IOC_MAP: u64 = iowr(KSANCOV_IOC_GROUP, 8, core::mem::size_of::<BufDesc>());

/// Map the edge map.  Parameter: [`BufDesc`] (filled by the kernel).
pub const KSANCOV_IOC_MAP_EDGEMAP: u64 =
    iowr(KSANCOV_IOC_GROUP, 9, core::mem::size_of::<BufDesc>());

/// Bind the calling thread.  Parameter: `uintptr_t` thread (0 = self).
pub const KSANCOV_IOC_START: u64 = iow(KSANCOV_IOC_GROUP, 10, core::mem::size_of::<usize>());

/// Query the number of instrumented edges.  Parameter: `size_t` out.
pub const KSANCOV_IOC_NEDGES: u64 = ior(KSANCOV_IOC_GROUP, 50, core::mem::size_of::<usize>());

// ═══════════════════════════════════════════════════════════════════════
//  Shared memory layout
// ═══════════════════════════════════════════════════════════════════════

/// Buffer descriptor filled in by the map requests.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufDesc {
    /// Address of the mapping in the caller's address space.
    pub ptr: usize,
    /// Length of the mapping in bytes.
    pub sz: usize,
}

/// Control block at the start of every data buffer.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     magic         ← written by kernel
/// 0x04    4     enabled       ← toggled by client (0/1)
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    /// One of the `KSANCOV_*_MAGIC` tags.
    pub magic: u32,
    /// Non-zero while the kernel should record coverage.
    pub enabled: AtomicU32,
}

/// Fixed part of a trace-mode buffer; `max_entries` `u64` PCs follow.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    8     hdr
/// 0x08    4     max_entries   ← capacity, fixed at configuration
/// 0x0C    4     head          ← bumped by kernel (may exceed capacity)
/// 0x10    8*N   entries
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct TraceHeader {
    pub hdr: Header,
    pub max_entries: u32,
    pub head: AtomicU32,
}

/// Fixed part of a counters-mode buffer; `nedges` `u8` counters follow.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    8     hdr
/// 0x08    4     nedges
/// 0x0C    N     hits          ← 8-bit saturating
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct CountersHeader {
    pub hdr: Header,
    pub nedges: u32,
}

/// Fixed part of the edge map; `nedges` `u64` addresses follow.
#[repr(C)]
#[derive(Debug)]
pub struct EdgeMapHeader {
    pub magic: u32,
    pub nedges: u32,
}

/// Offset of [`Header::enabled`].
pub const HEADER_ENABLED_OFFSET: usize = 4;

/// Offset of [`TraceHeader::max_entries`].
pub const TRACE_MAX_ENTRIES_OFFSET: usize = 8;

/// Offset of [`TraceHeader::head`].
pub const TRACE_HEAD_OFFSET: usize = 12;

/// Offset of the first trace entry.
pub const TRACE_ENTRIES_OFFSET: usize = core::mem::size_of::<TraceHeader>();

/// Size of one trace entry (a program counter).
pub const TRACE_ENTRY_SIZE: usize = 8;

/// Offset of [`CountersHeader::nedges`].
pub const COUNTERS_NEDGES_OFFSET: usize = 8;

/// Offset of the first hit counter.
pub const COUNTERS_HITS_OFFSET: usize = core::mem::size_of::<CountersHeader>();

/// Offset of [`EdgeMapHeader::nedges`].
pub const EDGEMAP_NEDGES_OFFSET: usize = 4;

/// Offset of the first edge address.
pub const EDGEMAP_ADDRS_OFFSET: usize = core::mem::size_of::<EdgeMapHeader>();

/// Size of one edge-map address.
pub const EDGEMAP_ADDR_SIZE: usize = 8;

// Compile-time layout checks.
const _: () = assert!(core::mem::size_of::<Header>() == 8);
const _: () = assert!(TRACE_ENTRIES_OFFSET == 16);
const _: () = assert!(COUNTERS_HITS_OFFSET == 12);
const _: () = assert!(EDGEMAP_ADDRS_OFFSET == 8);
const _: () = assert!(core::mem::size_of::<BufDesc>() == 2 * core::mem::size_of::<usize>());

// ═══════════════════════════════════════════════════════════════════════
//  Layout arithmetic
// ═══════════════════════════════════════════════════════════════════════

/// Minimum byte length of a trace buffer holding `max_entries` PCs.
///
/// Returns `None` on overflow.
pub const fn trace_buffer_len(max_entries: usize) -> Option<usize> {
    match max_entries.checked_mul(TRACE_ENTRY_SIZE) {
        Some(n) => n.checked_add(TRACE_ENTRIES_OFFSET),
        None => None,
    }
}

/// Minimum byte length of a counters buffer with `nedges` counters.
pub const fn counters_buffer_len(nedges: usize) -> Option<usize> {
    nedges.checked_add(COUNTERS_HITS_OFFSET)
}

/// Minimum byte length of an edge map with `nedges` addresses.
pub const fn edgemap_buffer_len(nedges: usize) -> Option<usize> {
    match nedges.checked_mul(EDGEMAP_ADDR_SIZE) {
        Some(n) => n.checked_add(EDGEMAP_ADDRS_OFFSET),
        None => None,
    }
}
