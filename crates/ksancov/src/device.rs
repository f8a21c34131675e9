//! Device handle: the open connection to the coverage device.
//!
//! [`DeviceHandle`] is the session object.  It owns the control surface,
//! the negotiated mode, the mapped buffers and the thread binding, and
//! every other module adds its operations as methods on it.
//!
//! The control surface itself sits behind the [`ControlSurface`] trait:
//! [`KsancovDevice`] talks to the real node through `ioctl`, while
//! [`SimulatedDevice`](crate::fake::SimulatedDevice) plays the kernel
//! in-process.
//!
//! # Teardown
//!
//! [`DeviceHandle::close`] (and `Drop`) always attempts to unmap every
//! buffer still marked mapped, even when an earlier step of the session
//! or of the teardown itself failed.

use crate::binding::ExecutionContext;
use crate::config::{ControlCodes, DeviceConfig};
use crate::error::{BufferKind, DeviceOp, KsancovError, Result};
use crate::mapping::{DataMapping, EdgeMapMapping};
use crate::mode::Mode;
use crate::session::SessionState;
use ksancov_protocol::BufDesc;
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

// ═══════════════════════════════════════════════════════════════════════
//  Control surface
// ═══════════════════════════════════════════════════════════════════════

/// A region of shared memory handed out by the device.
#[derive(Debug)]
pub struct RawRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region is plain shared memory; all client access goes
// through atomics.
unsafe impl Send for RawRegion {}

impl RawRegion {
    /// Wrap a mapping returned by a device.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// region is passed back to [`ControlSurface::unmap`] or the surface
    /// is closed.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The fixed set of operations the coverage device supports.
///
/// Every method either succeeds or fails with the platform error the
/// device reported; implementations must not translate codes.
///
/// # Safety
///
/// Regions returned by [`map_data_buffer`](Self::map_data_buffer) and
/// [`map_edgemap_buffer`](Self::map_edgemap_buffer) are dereferenced by
/// the handle.  Implementors guarantee they stay valid, suitably sized
/// for the header they claim to hold, and are not released until handed
/// back through [`unmap`](Self::unmap) or [`close`](Self::close).
pub unsafe trait ControlSurface {
    /// Select trace mode with room for `max_entries` PCs.
    fn set_trace_mode(&mut self, max_entries: usize) -> io::Result<()>;

    /// Select counters mode.
    fn set_counters_mode(&mut self) -> io::Result<()>;

    /// Map the data buffer of the selected mode.
    fn map_data_buffer(&mut self) -> io::Result<RawRegion>;

    /// Map the edge-address table.
    fn map_edgemap_buffer(&mut self) -> io::Result<RawRegion>;

    /// Attribute coverage of the calling thread to this device.
    fn bind_current_thread(&mut self) -> io::Result<()>;

    /// Number of instrumented edges in the kernel.
    fn edge_count(&mut self) -> io::Result<usize>;

    /// Release a region obtained from one of the map calls.
    fn unmap(&mut self, region: RawRegion) -> io::Result<()>;

    /// Release the device itself.
    fn close(&mut self) -> io::Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Real device
// ═══════════════════════════════════════════════════════════════════════

/// The `/dev/ksancov` node, driven through `ioctl`.
#[derive(Debug)]
pub struct KsancovDevice {
    fd: Option<OwnedFd>,
    codes: ControlCodes,
}

impl KsancovDevice {
    /// Open the node named by `config` read/write.
    pub fn open(config: &DeviceConfig) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.path)?;
        Ok(Self {
            fd: Some(OwnedFd::from(file)),
            codes: config.codes.clone(),
        })
    }

    fn raw_fd(&self) -> io::Result<RawFd> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Issue one request.  `arg` is the parameter block (or null).
    fn ioctl(&self, code: u64, arg: *mut libc::c_void) -> io::Result<()> {
        let fd = self.raw_fd()?;
        // `as _` adapts to the request type of the platform's ioctl
        // prototype (c_ulong on glibc and Darwin, c_int on musl).
        let ret = unsafe { libc::ioctl(fd, code as _, arg) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ioctl_with<T>(&self, code: u64, arg: &mut T) -> io::Result<()> {
        self.ioctl(code, (arg as *mut T).cast())
    }

    fn map(&self, code: u64) -> io::Result<RawRegion> {
        let mut desc = BufDesc::default();
        self.ioctl_with(code, &mut desc)?;
        let ptr = NonNull::new(desc.ptr as *mut u8)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        // Safety: the kernel mapped `desc.sz` bytes at `desc.ptr` into
        // this address space; they stay until munmap.
        Ok(unsafe { RawRegion::new(ptr, desc.sz) })
    }
}

unsafe impl ControlSurface for KsancovDevice {
    fn set_trace_mode(&mut self, max_entries: usize) -> io::Result<()> {
        let mut entries = max_entries;
        self.ioctl_with(self.codes.trace, &mut entries)
    }

    fn set_counters_mode(&mut self) -> io::Result<()> {
        self.ioctl(self.codes.counters, std::ptr::null_mut())
    }

    fn map_data_buffer(&mut self) -> io::Result<RawRegion> {
        self.map(self.codes.map)
    }

    fn map_edgemap_buffer(&mut self) -> io::Result<RawRegion> {
        self.map(self.codes.map_edgemap)
    }

    fn bind_current_thread(&mut self) -> io::Result<()> {
        // Thread 0 means "the caller".
        let mut thread: usize = 0;
        self.ioctl_with(self.codes.start, &mut thread)
    }

    fn edge_count(&mut self) -> io::Result<usize> {
        let mut nedges: usize = 0;
        self.ioctl_with(self.codes.nedges, &mut nedges)?;
        Ok(nedges)
    }

    fn unmap(&mut self, region: RawRegion) -> io::Result<()> {
        let ret = unsafe { libc::munmap(region.as_ptr().cast(), region.len()) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let ret = unsafe { libc::close(fd.into_raw_fd()) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle
// ═══════════════════════════════════════════════════════════════════════

/// An open coverage session.
///
/// Lifecycle:
///
/// ```text
/// open ─► configure_{trace,counters} ─► map_data_buffer ─► [map_edge_map]
///      ─► bind_current_thread ─► reset ─► start ─► (workload) ─► stop
///      ─► trace() / counters() / resolve_edge_address() ─► close
/// ```
///
/// # Example
///
/// ```no_run
/// use ksancov::{DeviceConfig, DeviceHandle};
///
/// let mut handle = DeviceHandle::open(&DeviceConfig::default())?;
/// handle.configure_trace(64 * 1024)?;
/// handle.map_data_buffer()?;
/// handle.bind_current_thread()?;
/// handle.reset()?;
/// handle.start()?;
/// let _ = std::process::id(); // code under measurement
/// handle.stop()?;
///
/// let trace = handle.trace()?;
/// for pc in trace.entries() {
///     println!("{pc:#x}");
/// }
/// # Ok::<(), ksancov::KsancovError>(())
/// ```
pub struct DeviceHandle<S: ControlSurface = KsancovDevice> {
    pub(crate) surface: S,
    pub(crate) state: SessionState,
    pub(crate) mode: Option<Mode>,
    pub(crate) data: Option<DataMapping>,
    pub(crate) edges: Option<EdgeMapMapping>,
    pub(crate) binding: Option<ExecutionContext>,
}

impl DeviceHandle<KsancovDevice> {
    /// Open the device named by `config`.
    ///
    /// A missing node or insufficient permissions yield
    /// [`KsancovError::DeviceUnavailable`] with the OS error attached.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let device =
            KsancovDevice::open(config).map_err(|source| KsancovError::DeviceUnavailable {
                path: config.path.clone(),
                source,
            })?;
        info!("Opened coverage device {}", config.path.display());
        Ok(Self::from_surface(device))
    }

    /// Whether the configured device node exists at all.
    pub fn probe(config: &DeviceConfig) -> bool {
        Path::new(&config.path).exists()
    }
}

impl<S: ControlSurface> DeviceHandle<S> {
    /// Wrap an already-open control surface.
    pub fn from_surface(surface: S) -> Self {
        Self {
            surface,
            state: SessionState::Opened,
            mode: None,
            data: None,
            edges: None,
            binding: None,
        }
    }

    /// Current position in the session state machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The negotiated collection mode, once configured.
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Access the underlying control surface.
    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Number of instrumented edges reported by the device.
    pub fn edge_count(&mut self) -> Result<usize> {
        self.ensure_open("edge_count")?;
        let nedges = self
            .surface
            .edge_count()
            .map_err(|source| KsancovError::Config {
                op: DeviceOp::EdgeCount,
                source,
            })?;
        debug!("Device reports {nedges} edges");
        Ok(nedges)
    }

    pub(crate) fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(KsancovError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Tear the session down.
    ///
    /// Disables collection if it is running, unmaps the edge map and the
    /// data buffer (each attempted regardless of earlier failures), then
    /// closes the device.  Returns the first error encountered.  Calling
    /// `close` again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let mut first_error: Option<KsancovError> = None;

        if let Some(data) = &self.data {
            data.disable();
        }

        if let Some(edges) = self.edges.take() {
            if let Err(source) = self.surface.unmap(edges.into_region()) {
                warn!("Failed to unmap edge map: {source}");
                first_error.get_or_insert(KsancovError::Unmap {
                    buffer: BufferKind::EdgeMap,
                    source,
                });
            }
        }

        if let Some(data) = self.data.take() {
            if let Err(source) = self.surface.unmap(data.into_region()) {
                warn!("Failed to unmap data buffer: {source}");
                first_error.get_or_insert(KsancovError::Unmap {
                    buffer: BufferKind::Data,
                    source,
                });
            }
        }

        if let Err(source) = self.surface.close() {
            warn!("Failed to close coverage device: {source}");
            first_error.get_or_insert(KsancovError::Close(source));
        }

        self.binding = None;
        self.state = SessionState::Closed;
        debug!("Coverage session closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<S: ControlSurface> Drop for DeviceHandle<S> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Coverage session teardown failed: {err}");
        }
    }
}

impl<S: ControlSurface> std::fmt::Debug for DeviceHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("data_mapped", &self.data.is_some())
            .field("edge_map_mapped", &self.edges.is_some())
            .field("binding", &self.binding)
            .finish()
    }
}
