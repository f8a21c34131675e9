//! Collection mode negotiation.
//!
//! A handle is configured exactly once, before anything is mapped.  The
//! negotiated [`Mode`] remembers what the client asked for so the mapped
//! buffer can be checked against it.

use crate::device::{ControlSurface, DeviceHandle};
use crate::error::{DeviceOp, KsancovError, Result};
use crate::session::SessionState;
use log::{debug, info};

/// The collection mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Ordered, capacity-bounded PC trace.
    Trace { max_entries: usize },
    /// Per-edge 8-bit saturating hit counters.
    Counters { nedges: usize },
}

impl Mode {
    /// Entries in the data buffer: trace capacity or edge count.
    pub fn entries(&self) -> usize {
        match *self {
            Mode::Trace { max_entries } => max_entries,
            Mode::Counters { nedges } => nedges,
        }
    }

    pub fn is_trace(&self) -> bool {
        matches!(self, Mode::Trace { .. })
    }

    pub fn is_counters(&self) -> bool {
        matches!(self, Mode::Counters { .. })
    }
}

impl<S: ControlSurface> DeviceHandle<S> {
    /// Select trace mode with room for `max_entries` program counters.
    ///
    /// Fails with [`KsancovError::InvalidArgument`] for a zero (or
    /// wider than 32-bit) capacity, with [`KsancovError::InvalidState`]
    /// if the handle is already configured, and with
    /// [`KsancovError::Config`] carrying the device's error code if the
    /// device rejects the request.  A rejected request leaves the handle
    /// unconfigured.
    pub fn configure_trace(&mut self, max_entries: usize) -> Result<()> {
        self.ensure_configurable("configure_trace")?;
        if max_entries == 0 {
            return Err(KsancovError::InvalidArgument("max_entries must be positive"));
        }
        if u32::try_from(max_entries).is_err() {
            return Err(KsancovError::InvalidArgument(
                "max_entries does not fit the 32-bit capacity field",
            ));
        }

        self.surface
            .set_trace_mode(max_entries)
            .map_err(|source| KsancovError::Config {
                op: DeviceOp::SetTraceMode,
                source,
            })?;

        self.mode = Some(Mode::Trace { max_entries });
        self.state = SessionState::Configured;
        info!("Trace mode configured ({max_entries} entries)");
        Ok(())
    }

    /// Select counters mode.
    ///
    /// The device's edge count is queried first and recorded; the mapped
    /// counters buffer must agree with it.
    pub fn configure_counters(&mut self) -> Result<()> {
        self.ensure_configurable("configure_counters")?;

        let nedges = self.edge_count()?;
        self.surface
            .set_counters_mode()
            .map_err(|source| KsancovError::Config {
                op: DeviceOp::SetCountersMode,
                source,
            })?;

        self.mode = Some(Mode::Counters { nedges });
        self.state = SessionState::Configured;
        info!("Counters mode configured ({nedges} edges)");
        Ok(())
    }

    fn ensure_configurable(&self, op: &'static str) -> Result<()> {
        if self.state != SessionState::Opened {
            debug!("{op} rejected in state {}", self.state);
            return Err(KsancovError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{SimulatedConfig, SimulatedDevice};

    fn handle() -> DeviceHandle<SimulatedDevice> {
        DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::with_edges(32)))
    }

    #[test]
    fn configure_trace_records_capacity() {
        let mut handle = handle();
        handle.configure_trace(1000).unwrap();
        assert_eq!(handle.mode(), Some(Mode::Trace { max_entries: 1000 }));
        assert_eq!(handle.state(), SessionState::Configured);
    }

    #[test]
    fn configure_counters_records_edge_count() {
        let mut handle = handle();
        handle.configure_counters().unwrap();
        assert_eq!(handle.mode(), Some(Mode::Counters { nedges: 32 }));
        assert_eq!(handle.mode().unwrap().entries(), 32);
    }

    #[test]
    fn zero_capacity_is_invalid_argument() {
        let mut handle = handle();
        let err = handle.configure_trace(0).unwrap_err();
        assert!(matches!(err, KsancovError::InvalidArgument(_)));
        assert_eq!(handle.state(), SessionState::Opened);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_capacity_is_invalid_argument() {
        let mut handle = handle();
        let err = handle.configure_trace(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, KsancovError::InvalidArgument(_)));
    }

    #[test]
    fn second_configuration_is_invalid_state() {
        let mut handle = handle();
        handle.configure_trace(10).unwrap();

        let err = handle.configure_trace(20).unwrap_err();
        assert!(matches!(
            err,
            KsancovError::InvalidState {
                op: "configure_trace",
                state: SessionState::Configured,
            }
        ));
        let err = handle.configure_counters().unwrap_err();
        assert!(matches!(err, KsancovError::InvalidState { .. }));

        // The first configuration stands.
        assert_eq!(handle.mode(), Some(Mode::Trace { max_entries: 10 }));
    }

    #[test]
    fn configuration_after_mapping_is_invalid_state() {
        let mut handle = handle();
        handle.configure_counters().unwrap();
        handle.map_data_buffer().unwrap();
        assert!(matches!(
            handle.configure_trace(10),
            Err(KsancovError::InvalidState {
                state: SessionState::Mapped,
                ..
            })
        ));
    }

    #[test]
    fn device_errors_keep_their_code() {
        let device = SimulatedDevice::new(SimulatedConfig::default());
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);

        kernel.inject_failure(DeviceOp::SetTraceMode, libc::EBUSY);
        let busy = handle.configure_trace(10).unwrap_err();
        assert_eq!(busy.os_error(), Some(libc::EBUSY));
        assert!(matches!(
            busy,
            KsancovError::Config {
                op: DeviceOp::SetTraceMode,
                ..
            }
        ));

        kernel.inject_failure(DeviceOp::SetCountersMode, libc::ENOTSUP);
        let unsupported = handle.configure_counters().unwrap_err();
        assert_eq!(unsupported.os_error(), Some(libc::ENOTSUP));

        // Still unconfigured, so a corrected retry works.
        assert_eq!(handle.state(), SessionState::Opened);
        handle.configure_trace(10).unwrap();
    }
}
