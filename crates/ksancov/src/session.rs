//! Session control: reset, start and stop.
//!
//! ```text
//!  Opened ─configure─► Configured ─map─► Mapped ─bind─► Bound
//!                                                        │ reset
//!                                                        ▼
//!            ┌──────────── start ─────────────────────  Armed
//!            ▼                                           ▲
//!         Running ─stop─► Stopped ─reset─────────────────┘
//!            ▲               │
//!            └──── start ────┘
//! ```
//!
//! Starting only flips the enabled flag in the shared header; stopping
//! clears it.  Neither touches recorded data, so a trace that is started
//! again without a reset keeps appending and its head never decreases.
//! Any state can move to `Closed`.

use crate::device::{ControlSurface, DeviceHandle};
use crate::error::{KsancovError, Result};
use crate::mapping::{atomic_u32, atomic_u8, DataMapping};
use crate::verified::dropped_entries;
use ksancov_protocol::{COUNTERS_HITS_OFFSET, TRACE_HEAD_OFFSET};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::Ordering;

/// Position of a handle in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Device open, no mode selected.
    Opened,
    /// Mode negotiated, nothing mapped.
    Configured,
    /// Data buffer mapped.
    Mapped,
    /// A thread is bound.
    Bound,
    /// Buffer cleared, ready to start.
    Armed,
    /// Collection enabled.
    Running,
    /// Collection disabled, data readable.
    Stopped,
    /// Torn down.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Mapped => "mapped",
            SessionState::Bound => "bound",
            SessionState::Armed => "armed",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Whether a thread is bound and the data buffer can be collected into.
    pub fn is_collectable(&self) -> bool {
        matches!(
            self,
            SessionState::Bound | SessionState::Armed | SessionState::Running | SessionState::Stopped
        )
    }
}

impl<S: ControlSurface> DeviceHandle<S> {
    /// Enable collection for the bound thread.
    ///
    /// Must be called from the bound thread; anything else is
    /// [`KsancovError::UnboundContext`].  Starting a running session is a
    /// no-op.  Starting a stopped session without a reset keeps the
    /// existing data and appends to it.
    pub fn start(&mut self) -> Result<()> {
        if !self.state.is_collectable() {
            return Err(KsancovError::InvalidState {
                op: "start",
                state: self.state,
            });
        }
        if !self.is_bound_here() {
            return Err(KsancovError::UnboundContext { op: "start" });
        }
        if self.state == SessionState::Running {
            debug!("start: already running");
            return Ok(());
        }

        let data = self.collectable_data("start")?;
        data.enabled_flag().store(1, Ordering::Relaxed);
        self.state = SessionState::Running;
        debug!("Coverage collection started");
        Ok(())
    }

    /// Disable collection.  Recorded data stays readable.
    ///
    /// Stopping a stopped session is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Running => {}
            SessionState::Stopped => {
                debug!("stop: already stopped");
                return Ok(());
            }
            state => return Err(KsancovError::InvalidState { op: "stop", state }),
        }

        let data = self.collectable_data("stop")?;
        data.disable();
        if let DataMapping::Trace(trace) = data {
            // Safety: validated trace mapping covers the header.
            let head = unsafe { atomic_u32(trace.region.base(), TRACE_HEAD_OFFSET) }
                .load(Ordering::Acquire) as usize;
            let dropped = dropped_entries(head, trace.capacity);
            if dropped > 0 {
                warn!(
                    "Trace buffer overflowed: {dropped} entries dropped (capacity {})",
                    trace.capacity
                );
            }
        }
        self.state = SessionState::Stopped;
        debug!("Coverage collection stopped");
        Ok(())
    }

    /// Clear recorded data so the next run starts from nothing.
    ///
    /// Trace mode rewinds the head to zero (old entries become
    /// unreachable); counters mode zeroes every counter.  Not allowed
    /// while running.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            SessionState::Bound | SessionState::Armed | SessionState::Stopped => {}
            state => return Err(KsancovError::InvalidState { op: "reset", state }),
        }

        match self.collectable_data("reset")? {
            DataMapping::Trace(trace) => {
                // Safety: validated trace mapping covers the header.
                let head = unsafe { atomic_u32(trace.region.base(), TRACE_HEAD_OFFSET) };
                head.store(0, Ordering::Release);
            }
            DataMapping::Counters(counters) => {
                for edge in 0..counters.nedges {
                    // Safety: validated counters mapping covers `nedges`
                    // counters after the header.
                    let hit = unsafe { atomic_u8(counters.region.base(), COUNTERS_HITS_OFFSET + edge) };
                    hit.store(0, Ordering::Relaxed);
                }
            }
        }
        self.state = SessionState::Armed;
        debug!("Coverage data reset");
        Ok(())
    }

    /// Whether the shared enabled flag is currently set.
    pub fn is_enabled(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|data| data.enabled_flag().load(Ordering::Relaxed) != 0)
    }

    /// Reset, start, run `workload`, then stop.
    ///
    /// Returns whatever `workload` returned.  If `workload` panics the
    /// session is left running; dropping the handle still tears it down.
    pub fn collect_run<T>(&mut self, workload: impl FnOnce() -> T) -> Result<T> {
        self.reset()?;
        self.start()?;
        let out = workload();
        self.stop()?;
        debug!("Collected one run ({:?})", self.mode);
        Ok(out)
    }

    fn collectable_data(&self, op: &'static str) -> Result<&DataMapping> {
        self.data.as_ref().ok_or(KsancovError::InvalidState {
            op,
            state: self.state,
        })
    }
}
