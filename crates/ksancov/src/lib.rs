//! Client library for the ksancov kernel coverage device.
//!
//! The kernel exposes its sanitizer-coverage instrumentation through a
//! character device (`/dev/ksancov`).  A client opens the device, picks a
//! collection mode, maps a shared buffer, binds one thread, and then
//! toggles collection around the code it wants to measure:
//!
//! - **Trace mode**: an ordered, capacity-bounded list of program
//!   counters ([`TraceBuffer`]).
//! - **Counters mode**: one 8-bit saturating hit counter per
//!   instrumented edge ([`CounterBuffer`]), optionally paired with an
//!   edge map that resolves edge indices to code addresses
//!   ([`EdgeMap`]).
//!
//! # Quick start
//!
//! ```no_run
//! use ksancov::{DeviceConfig, DeviceHandle};
//!
//! env_logger::init();
//!
//! let mut handle = DeviceHandle::open(&DeviceConfig::default())?;
//! handle.configure_counters()?;
//! handle.map_data_buffer()?;
//! let with_addresses = handle.map_edge_map().is_ok();
//! handle.bind_current_thread()?;
//!
//! handle.collect_run(|| {
//!     // code under measurement
//! })?;
//!
//! for edge in handle.counters()?.hit_edges() {
//!     match handle.resolve_edge_address(edge) {
//!         Some(addr) if with_addresses => println!("{addr:#x}"),
//!         _ => println!("edge {edge}"),
//!     }
//! }
//! # Ok::<(), ksancov::KsancovError>(())
//! ```
//!
//! # Layout
//!
//! The shared-memory formats and control codes live in
//! [`ksancov_protocol`].  This crate validates every mapping against the
//! negotiated mode before handing out views, and all reads of shared
//! memory are atomic loads.
//!
//! # Testing without the device
//!
//! [`SimulatedDevice`] implements the same [`ControlSurface`] over heap
//! memory, with a [`SimulatedKernel`] handle that records coverage the
//! way instrumented kernel code would.

pub mod binding;
pub mod config;
pub mod coverage;
pub mod device;
pub mod error;
pub mod fake;
pub mod mapping;
pub mod mode;
pub mod prelude;
pub mod reader;
pub mod session;
pub mod verified;

pub use binding::ExecutionContext;
pub use config::{ControlCodes, DeviceConfig};
pub use coverage::{CoverageAccumulator, CoverageBitmap, CoverageStats};
pub use device::{ControlSurface, DeviceHandle, KsancovDevice, RawRegion};
pub use error::{BufferKind, DeviceOp, KsancovError, LayoutMismatch, Result};
pub use fake::{SimulatedConfig, SimulatedDevice, SimulatedKernel};
pub use mapping::MapInfo;
pub use mode::Mode;
pub use reader::{CounterBuffer, CounterHits, EdgeMap, TraceBuffer, TraceEntries};
pub use session::SessionState;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_session_end_to_end() {
        let device = SimulatedDevice::new(SimulatedConfig::with_edges(8));
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);

        handle.configure_counters().unwrap();
        let data = handle.map_data_buffer().unwrap();
        assert_eq!(data.entries, 8);
        handle.map_edge_map().unwrap();
        handle.bind_current_thread().unwrap();
        handle.reset().unwrap();
        handle.start().unwrap();
        kernel.hit_edge(2);
        kernel.hit_edge(5);
        kernel.hit_edge(5);
        handle.stop().unwrap();

        let hits: Vec<(usize, u8)> = handle
            .counters()
            .unwrap()
            .counter_hits()
            .filter(|&(_, hits)| hits > 0)
            .collect();
        assert_eq!(hits, vec![(2, 1), (5, 2)]);
        assert_eq!(handle.resolve_edge_address(2), kernel.edge_address(2));

        handle.close().unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!kernel.data_mapped());
        assert!(!kernel.edge_map_mapped());
    }

    #[test]
    fn trace_session_end_to_end() {
        let device = SimulatedDevice::new(SimulatedConfig::default());
        let kernel = device.kernel();
        let mut handle = DeviceHandle::from_surface(device);

        handle.configure_trace(1024).unwrap();
        handle.map_data_buffer().unwrap();
        handle.bind_current_thread().unwrap();
        handle
            .collect_run(|| {
                for pc in [0xffff_0010, 0xffff_0020, 0xffff_0010] {
                    kernel.record_pc(pc);
                }
            })
            .unwrap();

        let trace = handle.trace().unwrap();
        assert_eq!(trace.head(), 3);
        assert_eq!(
            trace.entries().collect::<Vec<_>>(),
            vec![0xffff_0010, 0xffff_0020, 0xffff_0010]
        );
        assert_eq!(trace.entry(3), 0);
        assert_eq!(trace.unique_pcs().len(), 2);
    }

    #[test]
    fn closed_handle_rejects_everything() {
        let mut handle = DeviceHandle::from_surface(SimulatedDevice::new(SimulatedConfig::default()));
        handle.close().unwrap();
        for err in [
            handle.configure_trace(4).unwrap_err(),
            handle.map_data_buffer().unwrap_err(),
            handle.bind_current_thread().unwrap_err(),
            handle.start().unwrap_err(),
            handle.stop().unwrap_err(),
            handle.reset().unwrap_err(),
        ] {
            assert!(matches!(
                err,
                KsancovError::InvalidState {
                    state: SessionState::Closed,
                    ..
                }
            ));
        }
    }
}
