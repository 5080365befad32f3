//! Per-connection command loop.
//!
//! A connection sends one command at a time: `compile`, `play` or `exit`.
//! Unknown commands are ignored. The handler drives the mailbox for
//! compilation and the session queues for the game on the client's behalf.

use {
    crate::{
        error::{ProtocolError, ServerError, TransportError},
        framed::FramedChannel,
        game::{Reply, Request},
        mailbox::{Mailbox, FAILURE_MARKER},
        session_queue::{SessionKey, SessionQueues},
        shutdown::Shutdown,
        CHUNK_SIZE,
    },
    log::{debug, error, info, warn},
    std::{
        fs::{self, File},
        io::{Read, Write},
        os::fd::AsRawFd,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Sent to the client when compilation did not produce an artifact.
pub const COMPILE_FAILED: &str = "failed";
/// Sent to the client when a game could not continue.
pub const GAME_ERROR: &str = "error";
pub const READY: &str = "ready";

/// Shared resources every handler uses.
pub struct HandlerContext {
    pub mailbox: Arc<Mailbox>,
    pub queues: Arc<SessionQueues>,
    pub work_dir: PathBuf,
    /// Fires only when IPC resources are about to be torn down.
    pub ipc_token: Shutdown,
}

/// A file removed when dropped.
struct TempFile(PathBuf);

impl TempFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if fs::remove_file(&self.0).is_ok() {
            debug!("removed {}", self.0.display());
        }
    }
}

pub struct ConnectionHandler<S> {
    id: u64,
    channel: FramedChannel<S>,
    key: SessionKey,
    ctx: Arc<HandlerContext>,
    uploads: u64,
}

impl<S: Read + Write + AsRawFd> ConnectionHandler<S> {
    pub fn new(id: u64, stream: S, ctx: Arc<HandlerContext>) -> Result<Self, ServerError> {
        let key = SessionKey::from_connection(&stream)?;
        Ok(Self {
            id,
            channel: FramedChannel::new(stream),
            key,
            ctx,
            uploads: 0,
        })
    }

    /// Serve commands until `exit` or until the peer goes away.
    pub fn run(mut self) -> Result<(), ServerError> {
        loop {
            let command = match self.channel.receive_string() {
                Ok(command) => command,
                Err(TransportError::Closed) => {
                    debug!("client {} closed the connection", self.id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            debug!("client {} command: {command}", self.id);

            match command.as_str() {
                "compile" => self.compile()?,
                "play" => self.play()?,
                "exit" => return Ok(()),
                other => debug!("client {} sent unknown command {other:?}, ignoring", self.id),
            }
        }
    }

    fn compile(&mut self) -> Result<(), ServerError> {
        let count_text = self.channel.receive_string()?;
        let count: usize = count_text
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidChunkCount(count_text.clone()))?;

        self.uploads += 1;
        let source = TempFile(
            self.ctx
                .work_dir
                .join(format!("{}_{}_in.cpp", self.id, self.uploads)),
        );
        let mut file = File::create(source.path())?;
        for _ in 0..count {
            let chunk = self.channel.receive()?;
            if chunk.len() > CHUNK_SIZE {
                return Err(ProtocolError::ChunkTooLarge {
                    size: chunk.len(),
                    max: CHUNK_SIZE,
                }
                .into());
            }
            file.write_all(&chunk)?;
        }
        file.flush()?;
        drop(file);
        info!("client {} uploaded {} ({count} chunks)", self.id, source.path().display());

        let request = source.path().to_string_lossy().into_owned();
        let response = match self.ctx.mailbox.round_trip(&request, &self.ctx.ipc_token) {
            Ok(response) => response,
            Err(e) => {
                error!("client {}: compile round trip failed: {e}", self.id);
                FAILURE_MARKER.to_string()
            }
        };
        drop(source);
        if response == FAILURE_MARKER {
            info!("client {}: compilation failed", self.id);
            self.channel.send_string(COMPILE_FAILED)?;
            return Ok(());
        }

        let artifact = TempFile(PathBuf::from(response));
        let read = fs::read(artifact.path());
        drop(artifact);
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("client {}: cannot read the artifact: {e}", self.id);
                self.channel.send_string(COMPILE_FAILED)?;
                return Ok(());
            }
        };
        let chunks: Vec<&[u8]> = bytes.chunks(CHUNK_SIZE).collect();
        self.channel.send_string(&chunks.len().to_string())?;
        for chunk in chunks {
            self.channel.send(chunk)?;
        }
        info!("client {}: sent {} byte artifact", self.id, bytes.len());
        Ok(())
    }

    fn play(&mut self) -> Result<(), ServerError> {
        // replies left over from an earlier connection with the same descriptor
        let stale = self.ctx.queues.discard_replies(self.key)?;
        if stale > 0 {
            warn!("session {}: discarded {stale} stale replies", self.key);
        }

        let result = self.play_rounds();
        if result.is_err() {
            self.abandon();
        }
        result
    }

    fn play_rounds(&mut self) -> Result<(), ServerError> {
        if self.exchange(&Request::Start)? != Reply::Ready {
            self.channel.send_string(GAME_ERROR)?;
            return Ok(());
        }
        self.channel.send_string(READY)?;

        loop {
            let text = self.channel.receive_string()?;
            let n: i64 = match text.trim().parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!("client {}: {}", self.id, ProtocolError::InvalidMove(text));
                    self.abandon();
                    self.channel.send_string(GAME_ERROR)?;
                    return Ok(());
                }
            };

            let reply = self.exchange(&Request::Take(n))?;
            match reply.client_text() {
                Some(text) => self.channel.send_string(&text)?,
                None => {
                    warn!("client {}: game ended with {reply}", self.id);
                    self.channel.send_string(GAME_ERROR)?;
                    return Ok(());
                }
            }
            if matches!(reply, Reply::ClientWon | Reply::ClientLost { .. }) {
                return Ok(());
            }
        }
    }

    /// Send one request and collect replies until the one that ends it.
    fn exchange(&self, request: &Request) -> Result<Reply, ServerError> {
        let token = &self.ctx.ipc_token;
        self.ctx
            .queues
            .send_request(self.key, &request.encode(), token)?;
        loop {
            let reply = Reply::parse(&self.ctx.queues.receive_reply(self.key, token)?)?;
            if reply.ends_exchange() {
                return Ok(reply);
            }
        }
    }

    fn abandon(&self) {
        match self.exchange(&Request::Abandon) {
            Ok(_) => debug!("session {} abandoned", self.key),
            Err(e) => warn!("session {}: cannot abandon: {e}", self.key),
        }
    }
}
