//! Compile worker: serves mailbox requests by running an external compiler.
//!
//! Exactly one compile job runs at a time system-wide; the single mailbox
//! slot is the only way in.

use {
    crate::{
        error::{CompileError, IpcError},
        mailbox::{Mailbox, FAILURE_MARKER},
        shutdown::Shutdown,
    },
    log::{debug, info, warn},
    std::{
        fs,
        path::{Path, PathBuf},
        process::Command,
    },
};

/// Builds a source file into an artifact.
pub trait Compiler {
    fn compile(&self, source: &Path) -> Result<PathBuf, CompileError>;
}

/// Artifact path for a source file: the source path without its extension.
pub fn artifact_path(source: &Path) -> PathBuf {
    let stripped = source.with_extension("");
    if stripped == source {
        source.with_extension("out")
    } else {
        stripped
    }
}

/// Runs `<program> <source> -o <artifact>`.
#[derive(Clone, Debug)]
pub struct CommandCompiler {
    program: String,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, source: &Path) -> Result<PathBuf, CompileError> {
        let artifact = artifact_path(source);
        debug!("running {} {} -o {}", self.program, source.display(), artifact.display());

        let output = Command::new(&self.program)
            .arg(source)
            .arg("-o")
            .arg(&artifact)
            .output()
            .map_err(|source| CompileError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            // never leave a half-written artifact behind
            let _ = fs::remove_file(&artifact);
            let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
            diagnostics.push_str(&String::from_utf8_lossy(&output.stdout));
            return Err(CompileError::Failed {
                status: output.status,
                diagnostics,
            });
        }
        Ok(artifact)
    }
}

pub struct CompileWorker<C> {
    mailbox: Mailbox,
    compiler: C,
}

impl<C: Compiler> CompileWorker<C> {
    pub fn new(mailbox: Mailbox, compiler: C) -> Self {
        Self { mailbox, compiler }
    }

    /// Serve until the token fires or the mailbox is removed.
    pub fn run(&self, token: &Shutdown) -> Result<(), IpcError> {
        info!("compile worker serving");
        loop {
            match self.serve_one(token) {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => {
                    info!("compile worker stopping: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn serve_one(&self, token: &Shutdown) -> Result<(), IpcError> {
        self.mailbox
            .serve_one(token, |request| self.respond(Path::new(request)))?;
        Ok(())
    }

    fn respond(&self, source: &Path) -> String {
        info!("compiling {}", source.display());
        match self.compiler.compile(source) {
            Ok(artifact) => {
                info!("compiled {} -> {}", source.display(), artifact.display());
                artifact.to_string_lossy().into_owned()
            }
            Err(CompileError::Failed {
                status,
                diagnostics,
            }) => {
                warn!("compiling {} failed with {status}", source.display());
                for line in diagnostics.lines() {
                    debug!("  {line}");
                }
                FAILURE_MARKER.to_string()
            }
            Err(e) => {
                warn!("{e}");
                FAILURE_MARKER.to_string()
            }
        }
    }
}
