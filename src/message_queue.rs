//! SysV message queue carrying short text messages tagged with a `long` type.

use {
    crate::{error::IpcError, ipc_key::IpcKey, shutdown::Shutdown},
    log::{debug, trace},
    std::path::Path,
};

/// Text capacity of one queued message.
pub const MESSAGE_TEXT_LEN: usize = 32;

const KIND: &str = "msg_queue";

#[repr(C)]
struct MessageBuffer {
    mtype: libc::c_long,
    mtext: [u8; MESSAGE_TEXT_LEN],
}

pub struct MessageQueue {
    msg_id: libc::c_int,
    key: IpcKey,
    owner: bool,
}

impl MessageQueue {
    pub fn create(dir: &Path, id: i32) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        key.ensure_file()?;
        let msg_id = unsafe { libc::msgget(key.sysv_key()?, 0o666 | libc::IPC_CREAT) };
        if msg_id == -1 {
            return Err(IpcError::Create {
                what: "message queue",
                source: std::io::Error::last_os_error(),
            });
        }
        let mut queue = Self {
            msg_id,
            key,
            owner: true,
        };
        queue.purge()?;
        debug!("created message queue {msg_id}");
        Ok(queue)
    }

    pub fn open(dir: &Path, id: i32) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        let msg_id = unsafe { libc::msgget(key.sysv_key()?, 0o666) };
        if msg_id == -1 {
            return Err(IpcError::Attach {
                what: "message queue",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            msg_id,
            key,
            owner: false,
        })
    }

    /// Enqueue `text` tagged with `mtype`; blocks while the queue is full.
    pub fn send(&self, mtype: i64, text: &str, token: &Shutdown) -> Result<(), IpcError> {
        if text.len() > MESSAGE_TEXT_LEN {
            return Err(IpcError::MessageTooLarge {
                size: text.len(),
                max: MESSAGE_TEXT_LEN,
            });
        }
        let mut buf = MessageBuffer {
            mtype: mtype as libc::c_long,
            mtext: [0; MESSAGE_TEXT_LEN],
        };
        buf.mtext[..text.len()].copy_from_slice(text.as_bytes());

        loop {
            if token.is_cancelled() {
                return Err(IpcError::Cancelled);
            }
            let rc = unsafe {
                libc::msgsnd(
                    self.msg_id,
                    &buf as *const MessageBuffer as *const libc::c_void,
                    MESSAGE_TEXT_LEN,
                    0,
                )
            };
            if rc == 0 {
                trace!("queue {} <- [{mtype}] {text}", self.msg_id);
                return Ok(());
            }
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return Err(IpcError::last_os("msgsnd", || self.exists()));
            }
        }
    }

    /// Block for the next message of type `mtype`, or of any type when `None`.
    pub fn receive(
        &self,
        mtype: Option<i64>,
        token: &Shutdown,
    ) -> Result<(i64, String), IpcError> {
        loop {
            if token.is_cancelled() {
                return Err(IpcError::Cancelled);
            }
            match self.receive_with_flags(mtype, 0)? {
                Some(message) => return Ok(message),
                None => continue,
            }
        }
    }

    /// Non-blocking receive; `Ok(None)` when nothing matches.
    pub fn try_receive(&self, mtype: Option<i64>) -> Result<Option<(i64, String)>, IpcError> {
        match self.receive_with_flags(mtype, libc::IPC_NOWAIT) {
            Err(IpcError::Os { source, .. }) if source.raw_os_error() == Some(libc::ENOMSG) => {
                Ok(None)
            }
            other => other,
        }
    }

    /// `Ok(None)` means the call was interrupted by a signal.
    fn receive_with_flags(
        &self,
        mtype: Option<i64>,
        flags: libc::c_int,
    ) -> Result<Option<(i64, String)>, IpcError> {
        let mut buf = MessageBuffer {
            mtype: 0,
            mtext: [0; MESSAGE_TEXT_LEN],
        };
        let n = unsafe {
            libc::msgrcv(
                self.msg_id,
                &mut buf as *mut MessageBuffer as *mut libc::c_void,
                MESSAGE_TEXT_LEN,
                mtype.unwrap_or(0) as libc::c_long,
                flags,
            )
        };
        if n == -1 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(IpcError::last_os("msgrcv", || self.exists()));
        }
        let text = &buf.mtext[..n as usize];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let text = String::from_utf8_lossy(&text[..end]).into_owned();
        trace!("queue {} -> [{}] {text}", self.msg_id, buf.mtype);
        Ok(Some((buf.mtype as i64, text)))
    }

    /// `true` while the kernel still knows the queue.
    fn exists(&self) -> bool {
        let mut stat: libc::msqid_ds = unsafe { std::mem::zeroed() };
        (unsafe { libc::msgctl(self.msg_id, libc::IPC_STAT, &mut stat) }) != -1
    }

    /// Drop everything left over from an earlier run using the same key.
    fn purge(&mut self) -> Result<(), IpcError> {
        while self.try_receive(None)?.is_some() {}
        Ok(())
    }

    pub fn remove(&mut self) -> Result<(), IpcError> {
        if !self.owner {
            return Ok(());
        }
        self.owner = false;
        self.key.remove_file();
        if unsafe { libc::msgctl(self.msg_id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            return Err(IpcError::last_os("msgctl(IPC_RMID)", || self.exists()));
        }
        debug!("removed message queue {}", self.msg_id);
        Ok(())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::{thread, time::Duration},
    };

    #[test]
    fn test_typed_receive() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::create(dir.path(), 1).unwrap();
        let token = Shutdown::new();

        queue.send(7, "for seven", &token).unwrap();
        queue.send(9, "for nine", &token).unwrap();

        assert_eq!(queue.receive(Some(9), &token).unwrap(), (9, "for nine".into()));
        assert_eq!(queue.try_receive(Some(9)).unwrap(), None);
        assert_eq!(queue.receive(None, &token).unwrap(), (7, "for seven".into()));
    }

    #[test]
    fn test_message_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::create(dir.path(), 1).unwrap();
        let long = "x".repeat(MESSAGE_TEXT_LEN + 1);
        assert!(matches!(
            queue.send(1, &long, &Shutdown::new()),
            Err(IpcError::MessageTooLarge { .. })
        ));
        let exact = "y".repeat(MESSAGE_TEXT_LEN);
        queue.send(1, &exact, &Shutdown::new()).unwrap();
        assert_eq!(queue.try_receive(Some(1)).unwrap(), Some((1, exact)));
    }

    #[test]
    fn test_create_discards_stale_messages() {
        let dir = tempfile::tempdir().unwrap();
        let first = MessageQueue::create(dir.path(), 4).unwrap();
        first.send(3, "stale", &Shutdown::new()).unwrap();

        // a second creator over the same key starts from an empty queue
        let second = MessageQueue::create(dir.path(), 4).unwrap();
        assert_eq!(second.try_receive(None).unwrap(), None);
        assert_eq!(first.try_receive(None).unwrap(), None);
    }

    #[test]
    fn test_receiver_sees_removal() {
        let dir = tempfile::tempdir().unwrap();
        let mut owner = MessageQueue::create(dir.path(), 1).unwrap();
        let other = MessageQueue::open(dir.path(), 1).unwrap();

        let waiter = thread::spawn(move || other.receive(None, &Shutdown::new()));
        thread::sleep(Duration::from_millis(50));
        owner.remove().unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(IpcError::Removed)));
    }

    #[test]
    fn test_send_after_removal_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut owner = MessageQueue::create(dir.path(), 1).unwrap();
        let other = MessageQueue::open(dir.path(), 1).unwrap();
        owner.remove().unwrap();

        assert!(matches!(
            other.send(1, "late", &Shutdown::new()),
            Err(IpcError::Removed)
        ));
    }

    #[test]
    fn test_zero_type_is_not_removal() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::create(dir.path(), 1).unwrap();
        // msgsnd rejects mtype 0 with EINVAL while the queue is alive
        assert!(matches!(
            queue.send(0, "bad", &Shutdown::new()),
            Err(IpcError::Os { op: "msgsnd", .. })
        ));
    }
}
