//! Cooperative cancellation.
//!
//! An [`Interrupt`] is a shared flag. Something outside the run (the Ctrl-C
//! listener, a test) raises it; the controller reads it between bus polls and
//! never from inside an engine callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Shared interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Raise the flag on the first Ctrl-C.
    ///
    /// The listener runs on its own thread with a current-thread tokio
    /// runtime and exits after the first signal.
    pub fn listen_for_ctrl_c(&self) -> std::io::Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let interrupt = self.clone();
        std::thread::Builder::new()
            .name("interrupt".into())
            .spawn(move || {
                runtime.block_on(async {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            tracing::info!("interrupt received, stopping gracefully");
                            interrupt.raise();
                        }
                        Err(e) => tracing::warn!("cannot listen for interrupts: {}", e),
                    }
                })
            })
    }
}
