//! Cooperative cancellation for worker loops and blocking IPC waits.
//!
//! SysV `semop`, `msgsnd` and `msgrcv` are never restarted after a signal
//! handler runs, so a registered SIGTERM interrupts any blocking wait with
//! `EINTR`; the wait then checks the token and returns `IpcError::Cancelled`.

use {
    log::debug,
    signal_hook::consts::{SIGINT, SIGTERM},
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires on SIGTERM or SIGINT delivered to this process.
    pub fn from_signals() -> io::Result<Self> {
        let token = Self::new();
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&token.flag))?;
        }
        debug!("shutdown token registered for SIGTERM and SIGINT");
        Ok(token)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
