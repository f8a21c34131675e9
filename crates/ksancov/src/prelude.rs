//! Prelude: the types a typical collection loop needs.
//!
//! ```
//! use ksancov::prelude::*;
//!
//! fn hit_count<S: ControlSurface>(handle: &DeviceHandle<S>, edge: usize) -> Result<u8> {
//!     Ok(handle.counters()?.hits(edge).unwrap_or(0))
//! }
//! ```

// ── Session ──────────────────────────────────────────────────────────
pub use crate::{ControlSurface, DeviceConfig, DeviceHandle, Mode, SessionState};

// ── Results ──────────────────────────────────────────────────────────
pub use crate::{CounterBuffer, EdgeMap, TraceBuffer};

// ── Errors ───────────────────────────────────────────────────────────
pub use crate::{KsancovError, Result};

// ── Coverage ─────────────────────────────────────────────────────────
pub use crate::{CoverageAccumulator, CoverageBitmap};
