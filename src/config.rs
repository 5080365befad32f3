//! Command-line and environment configuration.
//!
//! Every flag can also be set through an `OFFLOAD_*` environment variable.

use {
    crate::mailbox::ClaimMode,
    clap::{Args, Parser},
    std::{ffi::OsString, path::PathBuf, time::Duration},
};

fn default_root() -> PathBuf {
    std::env::temp_dir().join("offload")
}

/// Where the kernel IPC resources live and which ids they use.
#[derive(Args, Clone, Debug)]
pub struct IpcArgs {
    /// Directory holding the IPC key files
    #[arg(long, env = "OFFLOAD_IPC_DIR", default_value_os_t = default_root())]
    pub ipc_dir: PathBuf,

    #[arg(long, env = "OFFLOAD_MAILBOX_ID", default_value_t = 1)]
    pub mailbox_id: i32,

    #[arg(long, env = "OFFLOAD_HANDSHAKE_ID", default_value_t = 1)]
    pub handshake_id: i32,

    #[arg(long, env = "OFFLOAD_INBOUND_QUEUE_ID", default_value_t = 1)]
    pub inbound_queue_id: i32,

    #[arg(long, env = "OFFLOAD_OUTBOUND_QUEUE_ID", default_value_t = 2)]
    pub outbound_queue_id: i32,

    /// Mailbox payload capacity in bytes
    #[arg(long, env = "OFFLOAD_MAILBOX_CAPACITY", default_value_t = 256)]
    pub mailbox_capacity: usize,
}

impl IpcArgs {
    /// The same settings as command-line arguments, for spawning workers.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--ipc-dir".into(), self.ipc_dir.clone().into()];
        for (flag, value) in [
            ("--mailbox-id", self.mailbox_id.to_string()),
            ("--handshake-id", self.handshake_id.to_string()),
            ("--inbound-queue-id", self.inbound_queue_id.to_string()),
            ("--outbound-queue-id", self.outbound_queue_id.to_string()),
            ("--mailbox-capacity", self.mailbox_capacity.to_string()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        args
    }
}

impl Default for IpcArgs {
    fn default() -> Self {
        Self {
            ipc_dir: default_root(),
            mailbox_id: 1,
            handshake_id: 1,
            inbound_queue_id: 1,
            outbound_queue_id: 2,
            mailbox_capacity: 256,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(about = "TCP server that offloads compilation and a counting game to worker processes")]
pub struct ServerConfig {
    /// Interface to bind
    #[arg(long, env = "OFFLOAD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long, env = "OFFLOAD_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Connections beyond this many are dropped on accept
    #[arg(long, env = "OFFLOAD_MAX_CLIENTS", default_value_t = 10)]
    pub max_clients: usize,

    /// Directory for uploaded sources and build artifacts
    #[arg(long, env = "OFFLOAD_WORK_DIR", default_value_os_t = default_root().join("work"))]
    pub work_dir: PathBuf,

    #[arg(long, env = "OFFLOAD_CLAIM_MODE", value_enum, default_value_t = ClaimMode::Atomic)]
    pub claim_mode: ClaimMode,

    /// How long in-flight connections may keep running after shutdown starts
    #[arg(long, env = "OFFLOAD_DRAIN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub drain_timeout: Duration,

    /// How long a worker may take to exit after SIGTERM
    #[arg(long, env = "OFFLOAD_STOP_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub stop_timeout: Duration,

    /// Directory containing the worker executables [default: next to this binary]
    #[arg(long, env = "OFFLOAD_WORKER_DIR")]
    pub worker_dir: Option<PathBuf>,

    /// Compiler handed to the compile worker
    #[arg(long, env = "OFFLOAD_COMPILER", default_value = "g++")]
    pub compiler: String,

    #[command(flatten)]
    pub ipc: IpcArgs,
}

impl ServerConfig {
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(about = "Compile worker: serves build requests from the mailbox")]
pub struct CompileWorkerConfig {
    #[arg(long, env = "OFFLOAD_COMPILER", default_value = "g++")]
    pub compiler: String,

    #[command(flatten)]
    pub ipc: IpcArgs,
}

#[derive(Parser, Clone, Debug)]
#[command(about = "Game worker: plays the counting game for every connected session")]
pub struct GameWorkerConfig {
    /// Seed for the worker's moves; random when absent
    #[arg(long, env = "OFFLOAD_GAME_SEED")]
    pub seed: Option<u64>,

    #[command(flatten)]
    pub ipc: IpcArgs,
}
