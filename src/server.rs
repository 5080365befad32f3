//! TCP listener, worker processes and the shutdown sequence.
//!
//! The server owns every kernel IPC resource. Handlers run one thread per
//! connection and talk to the workers through non-owning handles, so the
//! resources can be removed at teardown even while a handler is still
//! blocked on one of them.

use {
    crate::{
        config::ServerConfig,
        error::{ServerError, TransportError},
        executable_path,
        handler::{ConnectionHandler, HandlerContext},
        mailbox::Mailbox,
        session_queue::SessionQueues,
        shutdown::Shutdown,
        worker::WorkerProcess,
    },
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        ffi::OsString,
        fs,
        io::{self, BufRead},
        net::{self, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
        path::PathBuf,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        thread::{self, sleep, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Keyword on the console that shuts the server down.
pub const CLOSE_COMMAND: &str = "close";

const JOIN_POLL: Duration = Duration::from_millis(20);
const JOIN_GRACE: Duration = Duration::from_secs(1);
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

type Registry = Arc<Mutex<HashMap<u64, TcpStream>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops a running server from another thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    stop: Shutdown,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        info!("shutdown requested");
        self.stop.cancel();
        // unblock accept()
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            debug!("wake-up connection to {} failed: {e}", self.wake_addr);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Read console lines until [`CLOSE_COMMAND`], then trigger shutdown.
///
/// End of input leaves the server running.
pub fn watch_console<R: BufRead>(input: R, handle: &ShutdownHandle) {
    for line in input.lines() {
        match line {
            Ok(line) if line.trim() == CLOSE_COMMAND => {
                handle.trigger();
                return;
            }
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => warn!("unknown console command {:?}, type {CLOSE_COMMAND} to stop", line.trim()),
            Err(e) => {
                warn!("console read failed: {e}");
                return;
            }
        }
    }
    debug!("console closed");
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    mailbox: Mailbox,
    queues: SessionQueues,
    ctx: Arc<HandlerContext>,
    workers: Vec<WorkerProcess>,
    stop: Shutdown,
}

impl Server {
    /// Create the IPC resources and bind the listener.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let ipc = &config.ipc;
        fs::create_dir_all(&ipc.ipc_dir)?;
        fs::create_dir_all(&config.work_dir)?;

        let mailbox = Mailbox::create(
            &ipc.ipc_dir,
            ipc.mailbox_id,
            ipc.handshake_id,
            ipc.mailbox_capacity,
            config.claim_mode,
        )?;
        let queues = SessionQueues::create(&ipc.ipc_dir, ipc.inbound_queue_id, ipc.outbound_queue_id)?;
        debug!("IPC resources created under {}", ipc.ipc_dir.display());

        let ctx = Arc::new(HandlerContext {
            mailbox: Arc::new(Mailbox::open(
                &ipc.ipc_dir,
                ipc.mailbox_id,
                ipc.handshake_id,
                ipc.mailbox_capacity,
                config.claim_mode,
            )?),
            queues: Arc::new(SessionQueues::open(
                &ipc.ipc_dir,
                ipc.inbound_queue_id,
                ipc.outbound_queue_id,
            )?),
            work_dir: config.work_dir.clone(),
            ipc_token: Shutdown::new(),
        });

        let listener = TcpListener::bind(config.socket_addr_string())?;
        Ok(Self {
            config,
            listener,
            mailbox,
            queues,
            ctx,
            workers: Vec::new(),
            stop: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let mut wake_addr = self.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(match wake_addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        Ok(ShutdownHandle {
            stop: self.stop.clone(),
            wake_addr,
        })
    }

    fn worker_exe(&self, name: &str) -> PathBuf {
        match &self.config.worker_dir {
            Some(dir) => dir.join(name),
            None => executable_path(name),
        }
    }

    /// Start the compile and game workers.
    pub fn spawn_workers(&mut self) -> io::Result<()> {
        let mut compile_args = self.config.ipc.to_args();
        compile_args.push("--compiler".into());
        compile_args.push(OsString::from(&self.config.compiler));
        let compile = WorkerProcess::start(
            "compile_worker",
            &self.worker_exe("compile_worker"),
            compile_args,
        )?;
        self.workers.push(compile);

        let game = WorkerProcess::start(
            "game_worker",
            &self.worker_exe("game_worker"),
            self.config.ipc.to_args(),
        )?;
        self.workers.push(game);
        Ok(())
    }

    /// Accept connections until shutdown is triggered, then tear down.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            "listening on {} (max_clients = {})",
            self.local_addr()?,
            self.config.max_clients
        );
        let connections: Registry = Arc::new(Mutex::new(HashMap::new()));
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();
        let mut next_id: u64 = 0;
        let mut accept_failures: u32 = 0;

        for incoming in self.listener.incoming() {
            if self.stop.is_cancelled() {
                break;
            }
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    let pause = accept_backoff(accept_failures);
                    warn!("accept failed: {e}, retrying in {pause:?}");
                    accept_failures = accept_failures.saturating_add(1);
                    sleep(pause);
                    continue;
                }
            };
            accept_failures = 0;
            reap(&mut handlers);

            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown peer".to_string());
            if lock(&connections).len() >= self.config.max_clients {
                warn!(
                    "rejecting connection from {peer}: max_clients ({}) reached",
                    self.config.max_clients
                );
                continue;
            }

            next_id += 1;
            let id = next_id;
            match stream.try_clone() {
                Ok(clone) => {
                    lock(&connections).insert(id, clone);
                }
                Err(e) => {
                    warn!("dropping connection from {peer}: {e}");
                    continue;
                }
            }

            let ctx = Arc::clone(&self.ctx);
            let registry = Arc::clone(&connections);
            let spawned = thread::Builder::new()
                .name(format!("client-{id}"))
                .spawn(move || {
                    serve_connection(id, stream, &peer, ctx);
                    lock(&registry).remove(&id);
                });
            match spawned {
                Ok(handle) => handlers.push(handle),
                Err(e) => {
                    error!("cannot start handler for client {id}: {e}");
                    lock(&connections).remove(&id);
                }
            }
        }

        self.teardown(handlers, &connections);
        Ok(())
    }

    fn teardown(&mut self, mut handlers: Vec<JoinHandle<()>>, connections: &Registry) {
        reap(&mut handlers);
        info!("draining {} connection(s)", handlers.len());
        join_until(&mut handlers, Instant::now() + self.config.drain_timeout);

        if !handlers.is_empty() {
            warn!("closing {} connection(s) still open", handlers.len());
            for (id, stream) in lock(connections).drain() {
                if let Err(e) = stream.shutdown(net::Shutdown::Both) {
                    debug!("client {id}: socket shutdown failed: {e}");
                }
            }
            join_until(&mut handlers, Instant::now() + JOIN_GRACE);
        }

        for worker in &mut self.workers {
            if let Err(e) = worker.stop(self.config.stop_timeout) {
                error!("cannot stop {}: {e}", worker.name());
            }
        }

        // handlers still waiting on a worker see the removal and return
        self.ctx.ipc_token.cancel();
        if let Err(e) = self.mailbox.remove() {
            error!("cannot remove mailbox: {e}");
        }
        if let Err(e) = self.queues.remove() {
            error!("cannot remove session queues: {e}");
        }
        join_until(&mut handlers, Instant::now() + JOIN_GRACE);
        if !handlers.is_empty() {
            warn!("{} handler thread(s) did not finish", handlers.len());
        }
        info!("server stopped");
    }
}

/// Pause before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Join the handlers that have finished; returns how many panicked.
fn reap(handlers: &mut Vec<JoinHandle<()>>) -> usize {
    let (finished, running): (Vec<_>, Vec<_>) =
        handlers.drain(..).partition(|h| h.is_finished());
    *handlers = running;
    let mut panicked = 0;
    for handle in finished {
        if handle.join().is_err() {
            error!("a connection handler panicked");
            panicked += 1;
        }
    }
    panicked
}

fn join_until(handlers: &mut Vec<JoinHandle<()>>, deadline: Instant) {
    loop {
        reap(handlers);
        if handlers.is_empty() || Instant::now() >= deadline {
            return;
        }
        sleep(JOIN_POLL);
    }
}

fn serve_connection(id: u64, stream: TcpStream, peer: &str, ctx: Arc<HandlerContext>) {
    info!("client {id} connected from {peer}");
    match ConnectionHandler::new(id, stream, ctx).and_then(ConnectionHandler::run) {
        Ok(()) => info!("client {id} disconnected"),
        Err(ServerError::Transport(TransportError::Closed)) => {
            info!("client {id} went away")
        }
        Err(e) => warn!("client {id}: {e}"),
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{config::IpcArgs, framed::FramedChannel},
        clap::Parser,
        std::io::Cursor,
    };

    fn config(dir: &std::path::Path) -> ServerConfig {
        let mut config = ServerConfig::parse_from([
            "offload",
            "--bind",
            "127.0.0.1",
            "--port",
            "0",
            "--max-clients",
            "1",
            "--drain-timeout",
            "200ms",
        ]);
        config.work_dir = dir.join("work");
        config.ipc = IpcArgs {
            ipc_dir: dir.join("ipc"),
            ..IpcArgs::default()
        };
        config
    }

    #[test]
    fn test_reap_joins_finished_handlers_and_counts_panics() {
        let mut handlers = vec![
            thread::spawn(|| {}),
            thread::spawn(|| panic!("handler failure")),
            thread::spawn(|| sleep(Duration::from_secs(2))),
        ];
        let deadline = Instant::now() + Duration::from_secs(1);
        while handlers.iter().filter(|h| h.is_finished()).count() < 2 {
            assert!(Instant::now() < deadline);
            sleep(JOIN_POLL);
        }

        assert_eq!(reap(&mut handlers), 1);
        assert_eq!(handlers.len(), 1);
        assert_eq!(reap(&mut handlers), 0);
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(0), ACCEPT_BACKOFF_MIN);
        assert_eq!(accept_backoff(1), ACCEPT_BACKOFF_MIN * 2);
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(20), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[test]
    fn test_console_close_triggers_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path())).unwrap();
        let handle = server.shutdown_handle().unwrap();

        watch_console(Cursor::new("status\n\n"), &handle);
        assert!(!handle.is_triggered());

        watch_console(Cursor::new("status\n close \nignored\n"), &handle);
        assert!(handle.is_triggered());
    }

    #[test]
    fn test_run_stops_and_removes_ipc_files() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path())).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.shutdown_handle().unwrap();
        let running = thread::spawn(move || server.run());

        // a client that only says exit
        let mut client = FramedChannel::new(TcpStream::connect(addr).unwrap());
        client.send_string("exit").unwrap();
        assert!(matches!(client.receive(), Err(TransportError::Closed)));

        handle.trigger();
        running.join().unwrap().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("ipc"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "key"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_connection_beyond_limit_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path())).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.shutdown_handle().unwrap();
        let running = thread::spawn(move || server.run());

        let mut first = FramedChannel::new(TcpStream::connect(addr).unwrap());
        first.send_string("noop").unwrap();
        // give the accept loop time to register the first client
        sleep(Duration::from_millis(200));

        let mut second = FramedChannel::new(TcpStream::connect(addr).unwrap());
        assert!(second.receive().is_err());

        first.send_string("exit").unwrap();
        handle.trigger();
        running.join().unwrap().unwrap();
    }
}
