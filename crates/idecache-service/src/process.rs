//! Running the external tools the caches are populated from.
//!
//! Everything that spawns `make`, `clang` or `ctags` goes through a [`ProcessRunner`], so the
//! caches can be exercised without any of these installed.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheError;

/// Where the standard output of an [`Invocation`] goes.
#[derive(Debug)]
pub enum Stdout {
    /// Collected into [`ProcessOutput::stdout`].
    Capture,
    /// Written straight into the given file.
    File(File),
}

/// A full command invocation: program, arguments, working directory and output handling.
///
/// Standard input and standard error are always connected to the null device.
#[derive(Debug)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    stdout: Stdout,
    cancel: Option<CancellationToken>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdout: Stdout::Capture,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Redirects standard output into `file` instead of capturing it.
    pub fn stdout_to(mut self, file: File) -> Self {
        self.stdout = Stdout::File(file);
        self
    }

    /// Kills the process once `token` is cancelled.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Takes the output file out of this invocation, leaving it in capture mode.
    pub fn take_stdout_file(&mut self) -> Option<File> {
        match std::mem::replace(&mut self.stdout, Stdout::Capture) {
            Stdout::File(file) => Some(file),
            Stdout::Capture => None,
        }
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // readable, not round-trippable
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Captured standard output. Empty when it was redirected into a file.
    pub stdout: Vec<u8>,
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be launched at all.
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// Waiting for the process or reading its output failed.
    #[error("failed to wait for `{program}`")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    /// Setting up the process failed, e.g. duplicating an output file handle.
    #[error("failed to prepare `{program}`")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` was cancelled")]
    Cancelled { program: String },
}

impl ProcessError {
    /// Whether the executable could not be found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<ProcessError> for CacheError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled { .. } => CacheError::Cancelled,
            ProcessError::Spawn { ref source, .. }
            | ProcessError::Wait { ref source, .. }
            | ProcessError::Io { ref source, .. } => {
                CacheError::ProcessFailed(format!("{err}: {source}"))
            }
        }
    }
}

/// Launches external processes on behalf of the caches.
pub trait ProcessRunner: Send + Sync + fmt::Debug {
    /// Runs `invocation` to completion.
    ///
    /// The exit status is reported, not interpreted: a non-zero exit is not an error.
    fn run(&self, invocation: Invocation)
    -> BoxFuture<'static, Result<ProcessOutput, ProcessError>>;
}

/// A [`ProcessRunner`] backed by [`tokio::process`].
///
/// Children are killed when the future running them is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn run(
        &self,
        invocation: Invocation,
    ) -> BoxFuture<'static, Result<ProcessOutput, ProcessError>> {
        Box::pin(run_process(invocation))
    }
}

async fn run_process(mut invocation: Invocation) -> Result<ProcessOutput, ProcessError> {
    let program = invocation.program.clone();

    let mut command = tokio::process::Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &invocation.cwd {
        command.current_dir(cwd);
    }
    match invocation.take_stdout_file() {
        Some(file) => command.stdout(Stdio::from(file)),
        None => command.stdout(Stdio::piped()),
    };

    tracing::trace!(%invocation, cwd = ?invocation.cwd, "Spawning process");
    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let wait = child.wait_with_output();
    let output = match invocation.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(%program, "Process cancelled");
                return Err(ProcessError::Cancelled { program });
            }
            output = wait => output,
        },
        None => wait.await,
    }
    .map_err(|source| ProcessError::Wait {
        program: program.clone(),
        source,
    })?;

    Ok(ProcessOutput {
        stdout: output.stdout,
        status: output.status.code(),
    })
}
