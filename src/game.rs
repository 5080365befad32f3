//! The counting game: 21 stones, each side takes 1 to 3, whoever takes the
//! last stone wins.
//!
//! All state lives in [`GameSessions`], an arena keyed by [`SessionKey`] and
//! owned by the game worker's processing loop.

use {
    crate::{error::ProtocolError, session_queue::SessionKey},
    rand::Rng,
    std::{collections::HashMap, fmt},
};

pub const INITIAL_REMAINING: u32 = 21;
pub const MAX_TAKE: u32 = 3;

/// Client reply for a won game.
pub const WIN_SENTINEL: &str = "0|0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Start,
    Take(i64),
    Abandon,
}

impl Request {
    pub fn encode(&self) -> String {
        match self {
            Request::Start => "start".to_string(),
            Request::Take(n) => format!("take|{n}"),
            Request::Abandon => "abandon".to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut parts = text.split('|');
        let request = match (parts.next(), parts.next()) {
            (Some("start"), None) => Request::Start,
            (Some("abandon"), None) => Request::Abandon,
            (Some("take"), Some(n)) => Request::Take(
                n.parse()
                    .map_err(|_| ProtocolError::Malformed(text.to_string()))?,
            ),
            (Some("start" | "abandon" | "take"), _) => {
                return Err(ProtocolError::Malformed(text.to_string()))
            }
            _ => return Err(ProtocolError::UnknownOpcode(text.to_string())),
        };
        if parts.next().is_some() {
            return Err(ProtocolError::Malformed(text.to_string()));
        }
        Ok(request)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NoSession,
    BadRequest,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoSession => "no-session",
            RejectReason::BadRequest => "bad-request",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Ready,
    /// The client took the last stone.
    ClientWon,
    /// The client's move was applied; the worker's move follows.
    Pending { remaining: u32 },
    WorkerTook { taken: u32, remaining: u32 },
    /// The worker took the last stone.
    ClientLost { taken: u32 },
    Abandoned,
    Rejected(RejectReason),
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Ready => "ready".to_string(),
            Reply::ClientWon => "won".to_string(),
            Reply::Pending { remaining } => format!("pending|{remaining}"),
            Reply::WorkerTook { taken, remaining } => format!("took|{taken}|{remaining}"),
            Reply::ClientLost { taken } => format!("lost|{taken}"),
            Reply::Abandoned => "abandoned".to_string(),
            Reply::Rejected(reason) => format!("rejected|{}", reason.as_str()),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed(text.to_string());
        let number = |s: Option<&str>| -> Result<u32, ProtocolError> {
            s.ok_or_else(malformed)?.parse().map_err(|_| malformed())
        };
        let mut parts = text.split('|');
        let reply = match parts.next() {
            Some("ready") => Reply::Ready,
            Some("won") => Reply::ClientWon,
            Some("pending") => Reply::Pending {
                remaining: number(parts.next())?,
            },
            Some("took") => Reply::WorkerTook {
                taken: number(parts.next())?,
                remaining: number(parts.next())?,
            },
            Some("lost") => Reply::ClientLost {
                taken: number(parts.next())?,
            },
            Some("abandoned") => Reply::Abandoned,
            Some("rejected") => match parts.next() {
                Some("no-session") => Reply::Rejected(RejectReason::NoSession),
                Some("bad-request") => Reply::Rejected(RejectReason::BadRequest),
                _ => return Err(malformed()),
            },
            _ => return Err(ProtocolError::UnknownOpcode(text.to_string())),
        };
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(reply)
    }

    /// `false` only for replies that announce another reply to the same request.
    pub fn ends_exchange(&self) -> bool {
        !matches!(self, Reply::Pending { .. })
    }

    /// What the end client sees for this reply, if anything.
    pub fn client_text(&self) -> Option<String> {
        match self {
            Reply::Ready => Some("ready".to_string()),
            Reply::ClientWon => Some(WIN_SENTINEL.to_string()),
            Reply::WorkerTook { taken, remaining } => Some(format!("{taken}|{remaining}")),
            Reply::ClientLost { taken } => Some(format!("{taken}|0")),
            Reply::Pending { .. } | Reply::Abandoned | Reply::Rejected(_) => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    remaining: u32,
}

impl Session {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// The worker's move: uniform in `1..=min(MAX_TAKE, remaining)`.
pub fn worker_move<R: Rng>(remaining: u32, rng: &mut R) -> u32 {
    rng.gen_range(1..=remaining.min(MAX_TAKE))
}

#[derive(Debug, Default)]
pub struct GameSessions {
    sessions: HashMap<SessionKey, Session>,
}

impl GameSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: SessionKey) -> Option<Session> {
        self.sessions.get(&key).copied()
    }

    pub fn handle<R: Rng>(&mut self, key: SessionKey, request: &Request, rng: &mut R) -> Vec<Reply> {
        match request {
            Request::Start => vec![self.start(key)],
            Request::Take(n) => self.take(key, *n, rng),
            Request::Abandon => vec![self.abandon(key)],
        }
    }

    /// A repeated start resets the session.
    pub fn start(&mut self, key: SessionKey) -> Reply {
        self.sessions.insert(
            key,
            Session {
                remaining: INITIAL_REMAINING,
            },
        );
        Reply::Ready
    }

    pub fn take<R: Rng>(&mut self, key: SessionKey, n: i64, rng: &mut R) -> Vec<Reply> {
        let Some(session) = self.sessions.get_mut(&key) else {
            return vec![Reply::Rejected(RejectReason::NoSession)];
        };

        let taken = n.clamp(1, session.remaining as i64) as u32;
        session.remaining -= taken;
        if session.remaining == 0 {
            self.sessions.remove(&key);
            return vec![Reply::ClientWon];
        }

        let pending = Reply::Pending {
            remaining: session.remaining,
        };
        let taken = worker_move(session.remaining, rng);
        session.remaining -= taken;
        if session.remaining == 0 {
            self.sessions.remove(&key);
            return vec![pending, Reply::ClientLost { taken }];
        }
        vec![
            pending,
            Reply::WorkerTook {
                taken,
                remaining: session.remaining,
            },
        ]
    }

    pub fn abandon(&mut self, key: SessionKey) -> Reply {
        self.sessions.remove(&key);
        Reply::Abandoned
    }

    /// Drop the session after a protocol violation.
    pub fn reject(&mut self, key: SessionKey) -> Reply {
        self.sessions.remove(&key);
        Reply::Rejected(RejectReason::BadRequest)
    }
}
