//! Lifecycle of the worker processes owned by the server.

use {
    log::{info, warn},
    std::{
        ffi::OsStr,
        io,
        path::Path,
        process::{Child, Command, ExitStatus},
        thread::sleep,
        time::{Duration, Instant},
    },
};

const REAP_POLL: Duration = Duration::from_millis(20);

pub struct WorkerProcess {
    name: String,
    child: Option<Child>,
}

impl WorkerProcess {
    pub fn start<I, S>(name: &str, exe: &Path, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(exe).args(args).spawn().map_err(|e| {
            io::Error::new(e.kind(), format!("cannot start {name} ({}): {e}", exe.display()))
        })?;
        info!("worker {name} started with pid {}", child.id());
        Ok(Self {
            name: name.to_string(),
            child: Some(child),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// `true` while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the worker to stop with SIGTERM, escalate to SIGKILL after `grace`.
    pub fn stop(&mut self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        if let Some(status) = child.try_wait()? {
            warn!("worker {} had already exited: {status}", self.name);
            return Ok(Some(status));
        }

        if unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) } == -1 {
            warn!("worker {}: SIGTERM failed: {}", self.name, io::Error::last_os_error());
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                info!("worker {} stopped: {status}", self.name);
                return Ok(Some(status));
            }
            sleep(REAP_POLL);
        }

        warn!("worker {} ignored SIGTERM for {grace:?}, killing", self.name);
        child.kill()?;
        let status = child.wait()?;
        Ok(Some(status))
    }

    /// Block until the worker exits on its own.
    pub fn wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.take() {
            Some(mut child) => child.wait().map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(ref mut c) = self.child {
            let _ = c.kill();
            let _ = c.wait();
        }
    }
}
