//! Single-slot synchronous request/response channel between many producer
//! threads and one consumer process.
//!
//! The slot is a file-backed shared mapping; the phase of the exchange is
//! carried by a [`SemaphorePair`] `(signal, lock)`:
//!
//! | state          | pair  | next actor        |
//! |----------------|-------|-------------------|
//! | idle           | (0,1) | any producer      |
//! | claimed        | (0,0) | claiming producer |
//! | request ready  | (1,0) | consumer          |
//! | response ready | (1,1) | claiming producer |

use {
    crate::{
        error::IpcError,
        ipc_key::IpcKey,
        semaphore::{SemaphorePair, LOCK, SIGNAL},
        shutdown::Shutdown,
    },
    log::debug,
    memmap2::{MmapMut, MmapOptions},
    std::{fs::OpenOptions, path::Path},
};

/// Bytes in front of the payload holding its length (u32, little endian).
const HEADER_LEN: usize = 4;

const KIND: &str = "memory";

/// Response written by the consumer when the request could not be served.
pub const FAILURE_MARKER: &str = "fail";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Claimed,
    RequestReady,
    ResponseReady,
    /// Counter values outside the four protocol states.
    Inconsistent(u16, u16),
}

impl HandshakeState {
    pub fn from_values(signal: u16, lock: u16) -> Self {
        match (signal, lock) {
            (0, 1) => HandshakeState::Idle,
            (0, 0) => HandshakeState::Claimed,
            (1, 0) => HandshakeState::RequestReady,
            (1, 1) => HandshakeState::ResponseReady,
            (s, l) => HandshakeState::Inconsistent(s, l),
        }
    }
}

/// How a producer moves the channel from idle to claimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ClaimMode {
    /// One `semop` that waits for `signal == 0` and takes `lock`.
    #[default]
    Atomic,
    /// Await idle, then decrement `lock` as a separate step. Two producers
    /// can both observe idle; the loser's decrement then lands in the middle
    /// of the winner's round trip.
    CheckThenAct,
}

/// The shared byte slot.
pub struct MailboxSegment {
    map: MmapMut,
    ptr: *mut u8,
    capacity: usize,
    key: IpcKey,
    owner: bool,
}

// The handshake guarantees a single writer per phase; the mapping itself is
// plain memory shared by every handle.
unsafe impl Send for MailboxSegment {}
unsafe impl Sync for MailboxSegment {}

impl MailboxSegment {
    pub fn create(dir: &Path, id: i32, capacity: usize) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        if let Some(parent) = key.path().parent() {
            std::fs::create_dir_all(parent).map_err(|source| IpcError::Create {
                what: "mailbox segment",
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(key.path())
            .and_then(|f| f.set_len((HEADER_LEN + capacity) as u64).map(|_| f))
            .map_err(|source| IpcError::Create {
                what: "mailbox segment",
                source,
            })?;
        Self::map(file, key, capacity, true).map_err(|source| IpcError::Create {
            what: "mailbox segment",
            source,
        })
    }

    pub fn open(dir: &Path, id: i32, capacity: usize) -> Result<Self, IpcError> {
        let key = IpcKey::new(dir, KIND, id);
        let attach = |source| IpcError::Attach {
            what: "mailbox segment",
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(key.path())
            .map_err(attach)?;
        let len = file.metadata().map_err(attach)?.len();
        if len < (HEADER_LEN + capacity) as u64 {
            return Err(attach(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment holds {len} bytes, expected {}", HEADER_LEN + capacity),
            )));
        }
        Self::map(file, key, capacity, false).map_err(attach)
    }

    fn map(
        file: std::fs::File,
        key: IpcKey,
        capacity: usize,
        owner: bool,
    ) -> std::io::Result<Self> {
        let mut map = unsafe { MmapOptions::new().len(HEADER_LEN + capacity).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            map,
            ptr,
            capacity,
            key,
            owner,
        })
    }

    pub fn check_fits(&self, message: &str) -> Result<(), IpcError> {
        if message.len() > self.capacity {
            return Err(IpcError::MessageTooLarge {
                size: message.len(),
                max: self.capacity,
            });
        }
        Ok(())
    }

    pub fn write(&self, message: &str) -> Result<(), IpcError> {
        self.check_fits(message)?;
        let len = message.len() as u32;
        // Safety: the mapping is HEADER_LEN + capacity bytes long and the
        // payload was checked against capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), self.ptr, HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                message.as_ptr(),
                self.ptr.add(HEADER_LEN),
                message.len(),
            );
        }
        Ok(())
    }

    pub fn read(&self) -> String {
        let mut len_buf = [0u8; HEADER_LEN];
        // Safety: see `write`; the length is clamped to capacity in case the
        // header was never written.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, len_buf.as_mut_ptr(), HEADER_LEN);
            let len = (u32::from_le_bytes(len_buf) as usize).min(self.capacity);
            let bytes = std::slice::from_raw_parts(self.ptr.add(HEADER_LEN), len);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    pub fn remove(&mut self) {
        if self.owner {
            self.owner = false;
            let _ = self.map.flush();
            self.key.remove_file();
        }
    }
}

impl Drop for MailboxSegment {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Producer and consumer handle on one mailbox.
pub struct Mailbox {
    segment: MailboxSegment,
    handshake: SemaphorePair,
    claim_mode: ClaimMode,
}

impl Mailbox {
    /// Create the segment and the handshake pair in the idle state.
    pub fn create(
        dir: &Path,
        segment_id: i32,
        handshake_id: i32,
        capacity: usize,
        claim_mode: ClaimMode,
    ) -> Result<Self, IpcError> {
        let segment = MailboxSegment::create(dir, segment_id, capacity)?;
        let handshake = SemaphorePair::create(dir, handshake_id, 0, 1)?;
        Ok(Self {
            segment,
            handshake,
            claim_mode,
        })
    }

    pub fn open(
        dir: &Path,
        segment_id: i32,
        handshake_id: i32,
        capacity: usize,
        claim_mode: ClaimMode,
    ) -> Result<Self, IpcError> {
        let segment = MailboxSegment::open(dir, segment_id, capacity)?;
        let handshake = SemaphorePair::open(dir, handshake_id)?;
        Ok(Self {
            segment,
            handshake,
            claim_mode,
        })
    }

    pub fn state(&self) -> Result<HandshakeState, IpcError> {
        let (signal, lock) = self.handshake.values()?;
        Ok(HandshakeState::from_values(signal, lock))
    }

    /// Raw counter values, for diagnostics.
    pub fn handshake_values(&self) -> Result<(u16, u16), IpcError> {
        self.handshake.values()
    }

    /// Whatever the slot currently holds.
    pub fn peek(&self) -> String {
        self.segment.read()
    }

    /// One full producer round trip: claim, submit, await the response.
    pub fn round_trip(&self, request: &str, token: &Shutdown) -> Result<String, IpcError> {
        self.segment.check_fits(request)?;
        self.claim(token)?;
        self.submit(request)?;
        self.await_response(token)
    }

    /// idle -> claimed.
    pub fn claim(&self, token: &Shutdown) -> Result<(), IpcError> {
        match self.claim_mode {
            ClaimMode::Atomic => self.handshake.claim(token)?,
            ClaimMode::CheckThenAct => {
                self.await_idle(token)?;
                self.take_lock(token)?;
            }
        }
        debug!("mailbox claimed");
        Ok(())
    }

    /// First half of the check-then-act claim.
    pub fn await_idle(&self, token: &Shutdown) -> Result<(), IpcError> {
        self.handshake.await_values(0, 1, token)
    }

    /// Second half of the check-then-act claim.
    pub fn take_lock(&self, token: &Shutdown) -> Result<(), IpcError> {
        self.handshake.decrement(LOCK, token)
    }

    /// claimed -> request ready.
    pub fn submit(&self, request: &str) -> Result<(), IpcError> {
        self.segment.write(request)?;
        self.handshake.increment(SIGNAL)?;
        debug!("mailbox request submitted: {request}");
        Ok(())
    }

    /// Wait for response ready, read it, and return the channel to idle.
    pub fn await_response(&self, token: &Shutdown) -> Result<String, IpcError> {
        self.handshake.await_values(1, 1, token)?;
        let response = self.segment.read();
        self.handshake.decrement(SIGNAL, token)?;
        debug!("mailbox response received: {response}");
        Ok(response)
    }

    /// Consumer side: serve exactly one request and return it.
    ///
    /// A response larger than the segment is replaced by [`FAILURE_MARKER`].
    pub fn serve_one<F>(&self, token: &Shutdown, work: F) -> Result<String, IpcError>
    where
        F: FnOnce(&str) -> String,
    {
        self.handshake.await_values(1, 0, token)?;
        let request = self.segment.read();
        debug!("mailbox request taken: {request}");

        let mut response = work(&request);
        if self.segment.check_fits(&response).is_err() {
            response = FAILURE_MARKER.to_string();
        }
        self.segment.write(&response)?;
        self.handshake.increment(LOCK)?;
        Ok(request)
    }

    /// Remove the segment and the handshake pair; only the creator does this.
    pub fn remove(&mut self) -> Result<(), IpcError> {
        self.segment.remove();
        self.handshake.remove()
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::{sync::Arc, thread},
    };

    #[test]
    fn test_segment_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let owner = MailboxSegment::create(dir.path(), 1, 32).unwrap();
        let other = MailboxSegment::open(dir.path(), 1, 32).unwrap();

        owner.write("17_in.cpp").unwrap();
        assert_eq!(other.read(), "17_in.cpp");

        // a shorter message must not expose the tail of the previous one
        other.write("17_in").unwrap();
        assert_eq!(owner.read(), "17_in");
    }

    #[test]
    fn test_segment_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let segment = MailboxSegment::create(dir.path(), 1, 8).unwrap();
        assert!(matches!(
            segment.write("way/too/long/path.cpp"),
            Err(IpcError::MessageTooLarge { size: 21, max: 8 })
        ));
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MailboxSegment::open(dir.path(), 9, 8),
            Err(IpcError::Attach { .. })
        ));
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(HandshakeState::from_values(0, 1), HandshakeState::Idle);
        assert_eq!(HandshakeState::from_values(0, 0), HandshakeState::Claimed);
        assert_eq!(HandshakeState::from_values(1, 0), HandshakeState::RequestReady);
        assert_eq!(HandshakeState::from_values(1, 1), HandshakeState::ResponseReady);
        assert_eq!(
            HandshakeState::from_values(2, 0),
            HandshakeState::Inconsistent(2, 0)
        );
    }

    #[test]
    fn test_round_trip_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox =
            Arc::new(Mailbox::create(dir.path(), 1, 1, 64, ClaimMode::Atomic).unwrap());
        let consumer = Mailbox::open(dir.path(), 1, 1, 64, ClaimMode::Atomic).unwrap();

        let serving = thread::spawn(move || {
            for _ in 0..5 {
                consumer
                    .serve_one(&Shutdown::new(), |req| req.to_uppercase())
                    .unwrap();
            }
        });

        for i in 0..5 {
            let response = mailbox.round_trip(&format!("job{i}"), &Shutdown::new()).unwrap();
            assert_eq!(response, format!("JOB{i}"));
            assert_eq!(mailbox.state().unwrap(), HandshakeState::Idle);
        }
        serving.join().unwrap();
    }

    #[test]
    fn test_oversized_response_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::create(dir.path(), 1, 1, 8, ClaimMode::Atomic).unwrap();
        let consumer = Mailbox::open(dir.path(), 1, 1, 8, ClaimMode::Atomic).unwrap();

        let serving = thread::spawn(move || {
            consumer
                .serve_one(&Shutdown::new(), |_| "much longer than eight".to_string())
                .unwrap()
        });
        assert_eq!(
            mailbox.round_trip("a.cpp", &Shutdown::new()).unwrap(),
            FAILURE_MARKER
        );
        assert_eq!(serving.join().unwrap(), "a.cpp");
    }

    #[test]
    fn test_oversized_request_does_not_claim() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::create(dir.path(), 1, 1, 4, ClaimMode::Atomic).unwrap();
        assert!(mailbox.round_trip("abcdef", &Shutdown::new()).is_err());
        assert_eq!(mailbox.state().unwrap(), HandshakeState::Idle);
    }
}
