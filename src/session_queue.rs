//! Session-multiplexed request/response over two message queues.
//!
//! The message type tag is the client's [`SessionKey`], so one consumer can
//! drain requests from every session in arrival order while each producer
//! only ever receives the replies addressed to its own key.

use {
    crate::{
        error::{IpcError, ProtocolError},
        message_queue::MessageQueue,
        shutdown::Shutdown,
    },
    std::{fmt, os::fd::AsRawFd, path::Path},
};

/// Identifies one client's logical game session.
///
/// The connection's file descriptor is used as the key: it is unique among
/// open connections and stable for the connection's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(i64);

impl SessionKey {
    /// SysV message types must be positive.
    pub fn new(raw: i64) -> Result<Self, ProtocolError> {
        if raw <= 0 {
            return Err(ProtocolError::InvalidSessionKey(raw));
        }
        Ok(Self(raw))
    }

    pub fn from_connection<S: AsRawFd>(conn: &S) -> Result<Self, ProtocolError> {
        Self::new(conn.as_raw_fd() as i64)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct SessionQueues {
    inbound: MessageQueue,
    outbound: MessageQueue,
}

impl SessionQueues {
    pub fn create(dir: &Path, inbound_id: i32, outbound_id: i32) -> Result<Self, IpcError> {
        Ok(Self {
            inbound: MessageQueue::create(dir, inbound_id)?,
            outbound: MessageQueue::create(dir, outbound_id)?,
        })
    }

    pub fn open(dir: &Path, inbound_id: i32, outbound_id: i32) -> Result<Self, IpcError> {
        Ok(Self {
            inbound: MessageQueue::open(dir, inbound_id)?,
            outbound: MessageQueue::open(dir, outbound_id)?,
        })
    }

    /// Client side: enqueue a request for the worker.
    pub fn send_request(&self, key: SessionKey, text: &str, token: &Shutdown) -> Result<(), IpcError> {
        self.inbound.send(key.raw(), text, token)
    }

    /// Worker side: next request from any session.
    pub fn receive_request(&self, token: &Shutdown) -> Result<(SessionKey, String), IpcError> {
        let (mtype, text) = self.inbound.receive(None, token)?;
        Ok((SessionKey(mtype), text))
    }

    /// Worker side: enqueue a reply addressed to `key`.
    pub fn send_reply(&self, key: SessionKey, text: &str, token: &Shutdown) -> Result<(), IpcError> {
        self.outbound.send(key.raw(), text, token)
    }

    /// Client side: next reply addressed to `key`.
    pub fn receive_reply(&self, key: SessionKey, token: &Shutdown) -> Result<String, IpcError> {
        let (_, text) = self.outbound.receive(Some(key.raw()), token)?;
        Ok(text)
    }

    /// Client side: discard replies for `key` that are already queued.
    pub fn discard_replies(&self, key: SessionKey) -> Result<usize, IpcError> {
        let mut discarded = 0;
        while self.outbound.try_receive(Some(key.raw()))?.is_some() {
            discarded += 1;
        }
        Ok(discarded)
    }

    pub fn remove(&mut self) -> Result<(), IpcError> {
        self.inbound.remove()?;
        self.outbound.remove()
    }
}
