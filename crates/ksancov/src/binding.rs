//! Thread binding.
//!
//! The device attributes coverage to exactly one thread of one process.
//! The handle remembers which one, so that `start` from anywhere else is
//! rejected instead of silently collecting nothing.

use crate::device::{ControlSurface, DeviceHandle};
use crate::error::{KsancovError, Result};
use crate::session::SessionState;
use log::{debug, info};
use std::thread::{self, ThreadId};

/// A process/thread pair that coverage is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionContext {
    pub pid: u32,
    pub thread: ThreadId,
}

impl ExecutionContext {
    /// The calling thread.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            thread: thread::current().id(),
        }
    }
}

impl<S: ControlSurface> DeviceHandle<S> {
    /// Attribute coverage of the calling thread to this session.
    ///
    /// Allowed once the data buffer is mapped.  Binding again from a
    /// different thread (while collection is not running) moves the
    /// attribution there; the previous thread stops producing coverage.
    pub fn bind_current_thread(&mut self) -> Result<()> {
        let rebinding = match self.state {
            SessionState::Mapped => false,
            SessionState::Bound | SessionState::Armed | SessionState::Stopped => true,
            state => {
                return Err(KsancovError::InvalidState {
                    op: "bind_current_thread",
                    state,
                })
            }
        };

        self.surface
            .bind_current_thread()
            .map_err(KsancovError::Bind)?;

        let context = ExecutionContext::current();
        if rebinding {
            debug!("Coverage rebound from {:?} to {:?}", self.binding, context);
        } else {
            self.state = SessionState::Bound;
            info!("Coverage bound to {context:?}");
        }
        self.binding = Some(context);
        Ok(())
    }

    /// The execution context coverage is attributed to, if bound.
    pub fn bound_context(&self) -> Option<ExecutionContext> {
        self.binding
    }

    /// Whether the calling thread is the one the session is bound to.
    pub fn is_bound_here(&self) -> bool {
        self.binding == Some(ExecutionContext::current())
    }
}
