//! A two-member SysV semaphore set used as the mailbox handshake pair.
//!
//! Member 0 is `signal`, member 1 is `lock`. Waits are expressed as a single
//! `semop` call carrying several operations, which the kernel applies
//! atomically and blocks on until all of them can proceed, so no caller ever
//! polls the counters.

use {
    crate::{error::IpcError, ipc_key::IpcKey, shutdown::Shutdown},
    log::debug,
    std::path::Path,
};

pub const SIGNAL: u16 = 0;
pub const LOCK: u16 = 1;

const KIND: &str = "dual_sem";

pub struct SemaphorePair {
    sem_id: libc::c_int,
    key: IpcKey,
    owner: bool,
}

fn op(member: u16, delta: i16) -> libc::sembuf {
    libc::sembuf {
        sem_num: member,
        sem_op: delta,
        sem_flg: 0,
    }
}

/// Operations that block until `member` holds at least `value` (or exactly
/// zero when `value == 0`) and leave it unchanged.
fn expect(member: u16, value: u16, ops: &mut Vec<libc::sembuf>) {
    if value == 0 {
        ops.push(op(member, 0));
    } else {
        let delta = value as i16;
        ops.push(op(member, -delta));
        ops.push(op(member, delta));
    }
}

impl SemaphorePair {
    /// Create (or reset) the set with the given initial values.
    pub fn create(dir: &Path, id: i32, signal: u16, lock: u16) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        key.ensure_file()?;
        let sem_id = unsafe { libc::semget(key.sysv_key()?, 2, 0o666 | libc::IPC_CREAT) };
        if sem_id == -1 {
            return Err(IpcError::Create {
                what: "semaphore set",
                source: std::io::Error::last_os_error(),
            });
        }

        let pair = Self {
            sem_id,
            key,
            owner: true,
        };
        let mut values: [libc::c_ushort; 2] = [signal, lock];
        if unsafe { libc::semctl(sem_id, 0, libc::SETALL, values.as_mut_ptr()) } == -1 {
            return Err(IpcError::Create {
                what: "semaphore set",
                source: std::io::Error::last_os_error(),
            });
        }
        debug!("created semaphore set {sem_id} at ({signal},{lock})");
        Ok(pair)
    }

    /// Attach to a set created by another process.
    pub fn open(dir: &Path, id: i32) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        let sem_id = unsafe { libc::semget(key.sysv_key()?, 2, 0o666) };
        if sem_id == -1 {
            return Err(IpcError::Attach {
                what: "semaphore set",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            sem_id,
            key,
            owner: false,
        })
    }

    pub fn increment(&self, member: u16) -> Result<(), IpcError> {
        self.apply(&mut [op(member, 1)], &Shutdown::new())
    }

    /// Blocks while the member is zero.
    pub fn decrement(&self, member: u16, token: &Shutdown) -> Result<(), IpcError> {
        self.apply(&mut [op(member, -1)], token)
    }

    /// Block until the pair reaches `(signal, lock)`.
    ///
    /// Positive targets are satisfied by any value at least as large; the
    /// handshake keeps both members in {0, 1}, where the two coincide.
    pub fn await_values(&self, signal: u16, lock: u16, token: &Shutdown) -> Result<(), IpcError> {
        let mut ops = Vec::with_capacity(4);
        expect(SIGNAL, signal, &mut ops);
        expect(LOCK, lock, &mut ops);
        self.apply(&mut ops, token)
    }

    /// Wait for `signal == 0` and take `lock` in one atomic step.
    pub fn claim(&self, token: &Shutdown) -> Result<(), IpcError> {
        self.apply(&mut [op(SIGNAL, 0), op(LOCK, -1)], token)
    }

    pub fn value(&self, member: u16) -> Result<u16, IpcError> {
        let v = unsafe { libc::semctl(self.sem_id, member as libc::c_int, libc::GETVAL) };
        if v == -1 {
            return Err(IpcError::last_os("semctl(GETVAL)", || self.exists()));
        }
        Ok(v as u16)
    }

    pub fn values(&self) -> Result<(u16, u16), IpcError> {
        Ok((self.value(SIGNAL)?, self.value(LOCK)?))
    }

    /// `true` while the kernel still knows the set.
    fn exists(&self) -> bool {
        (unsafe { libc::semctl(self.sem_id, 0, libc::GETVAL) }) != -1
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Remove the set from the kernel. Waiters in other processes fail with
    /// `IpcError::Removed`.
    pub fn remove(&mut self) -> Result<(), IpcError> {
        if !self.owner {
            return Ok(());
        }
        self.owner = false;
        self.key.remove_file();
        if unsafe { libc::semctl(self.sem_id, 0, libc::IPC_RMID) } == -1 {
            return Err(IpcError::last_os("semctl(IPC_RMID)", || self.exists()));
        }
        debug!("removed semaphore set {}", self.sem_id);
        Ok(())
    }

    fn apply(&self, ops: &mut [libc::sembuf], token: &Shutdown) -> Result<(), IpcError> {
        loop {
            if token.is_cancelled() {
                return Err(IpcError::Cancelled);
            }
            let rc = unsafe { libc::semop(self.sem_id, ops.as_mut_ptr(), ops.len()) };
            if rc == 0 {
                return Ok(());
            }
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::last_os("semop", || self.exists()));
        }
    }
}

impl Drop for SemaphorePair {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}
