pub mod compile;
pub mod config;
pub mod error;
pub mod framed;
pub mod game;
pub mod game_worker;
pub mod handler;
pub mod ipc_key;
pub mod mailbox;
pub mod message_queue;
pub mod semaphore;
pub mod server;
pub mod session_queue;
pub mod shutdown;
pub mod worker;

use std::path::{Path, PathBuf};

pub const KB: usize = 1024;

/// Largest payload of a single file chunk on the client wire.
pub const CHUNK_SIZE: usize = KB;

/// Path of a sibling executable, resolved next to the running binary.
///
/// Integration tests run from `target/<profile>/deps`, so the parent
/// directory is tried as well.
pub fn executable_path(name: &str) -> PathBuf {
    let current = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(name));
    let dir = current.parent().unwrap_or_else(|| Path::new("."));
    let candidate = dir.join(name);
    if candidate.exists() {
        return candidate;
    }
    match dir.parent() {
        Some(parent) if dir.ends_with("deps") => parent.join(name),
        _ => candidate,
    }
}
