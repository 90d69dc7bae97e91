//! Operator controls shared between the engine worker and whoever drives it.
//!
//! Two flags:
//! - **stop**: edge-triggered. Once raised it stays raised until [`RunControl::clear`] is called
//!   between runs. The engine only observes it.
//! - **skip**: consumed by the engine. Raising it ends the current step's polling loop; the
//!   engine clears it when it acts on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    skip: AtomicBool,
}

/// Cloneable handle to the stop/skip flags; all clones share the same flags.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    flags: Arc<Flags>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop flag.
    pub fn emergency_stop(&self) {
        if !self.flags.stop.swap(true, Ordering::SeqCst) {
            info!("Emergency stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    /// Ask the engine to abandon the current step.
    pub fn skip_step(&self) {
        self.flags.skip.store(true, Ordering::SeqCst);
        info!("Skip step requested");
    }

    pub fn skip_requested(&self) -> bool {
        self.flags.skip.load(Ordering::SeqCst)
    }

    /// Consume a pending skip request.
    pub fn take_skip(&self) -> bool {
        self.flags.skip.swap(false, Ordering::SeqCst)
    }

    /// Lower both flags. Called by the orchestrator before a run starts.
    pub fn clear(&self) {
        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.skip.store(false, Ordering::SeqCst);
    }
}
