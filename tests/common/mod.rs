#![allow(dead_code)]

use {
    offload::framed::FramedChannel,
    std::{
        fs,
        io::Write,
        net::{SocketAddr, TcpStream},
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        process::{Child, Command, ExitStatus, Stdio},
        thread::sleep,
        time::{Duration, Instant},
    },
    tempfile::TempDir,
};

/// Source text the fake compiler refuses to build.
pub const SYNTAX_ERROR: &str = "SYNTAX_ERROR";

/// A stand-in for `g++ <src> -o <out>` that copies the source to the output.
pub fn fake_compiler(dir: &Path) -> PathBuf {
    let path = dir.join("fake_cc.sh");
    fs::write(
        &path,
        format!(
            "#!/bin/sh\nif grep -q {SYNTAX_ERROR} \"$1\"; then\n  echo \"$1: error: expected ';'\" >&2\n  exit 1\nfi\ncp \"$1\" \"$3\"\n"
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn worker_dir() -> PathBuf {
    Path::new(env!("CARGO_BIN_EXE_compile_worker"))
        .parent()
        .unwrap()
        .to_path_buf()
}

/// Files with a `.key` extension left in `dir`.
pub fn key_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "key"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        sleep(Duration::from_millis(20));
    }
    None
}

/// The `offload` binary running against a private directory.
pub struct ServerProcess {
    child: Child,
    pub addr: SocketAddr,
    pub dir: TempDir,
}

impl ServerProcess {
    pub fn start() -> Self {
        Self::start_with(&[])
    }

    pub fn start_with(extra: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let compiler = fake_compiler(dir.path());
        let port = portpicker::pick_unused_port().expect("no free port");
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_offload"))
            .args(["--bind", "127.0.0.1", "--port", &port.to_string()])
            .arg("--ipc-dir")
            .arg(dir.path().join("ipc"))
            .arg("--work-dir")
            .arg(dir.path().join("work"))
            .arg("--worker-dir")
            .arg(worker_dir())
            .arg("--compiler")
            .arg(&compiler)
            .args(extra)
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();

        let server = Self { child, addr, dir };
        server.wait_until_listening();
        server
    }

    fn wait_until_listening(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if TcpStream::connect(self.addr).is_ok() {
                return;
            }
            sleep(Duration::from_millis(50));
        }
        panic!("server did not start listening on {}", self.addr);
    }

    pub fn connect(&self) -> FramedChannel<TcpStream> {
        FramedChannel::new(TcpStream::connect(self.addr).unwrap())
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.dir.path().join("ipc")
    }

    /// Type the console keyword and wait for the process to exit.
    pub fn close(mut self) -> ExitStatus {
        let stdin = self.child.stdin.as_mut().unwrap();
        stdin.write_all(b"close\n").unwrap();
        stdin.flush().unwrap();
        let status = wait_with_timeout(&mut self.child, Duration::from_secs(20));
        status.expect("server did not exit after close")
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
