use crate::RuntimeError;
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An external command invocation: program, arguments, working directory and
/// extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(arg);
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    pub fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Output of a finished command.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stdout followed by stderr, trimmed. Backends split diagnostics across
    /// both streams, so error messages carry both.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => format!("exited with {}", self.status),
            (false, true) => stdout.to_owned(),
            (true, false) => stderr.to_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Run a command to completion, capturing both output streams.
///
/// The child is killed and `RuntimeError::Timeout` returned once `timeout`
/// elapses. A non-zero exit is not an error here; see [`run_checked`].
pub fn run_captured(spec: &ProcessSpec, timeout: Duration) -> Result<CapturedOutput, RuntimeError> {
    debug!("exec: {}", spec.display());
    let mut child = spec
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_reader = child.stdout.take().map(|pipe| thread::spawn(move || drain(pipe)));
    let stderr_reader = child.stderr.take().map(|pipe| thread::spawn(move || drain(pipe)));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("killing '{}' after {}s", spec.display(), timeout.as_secs());
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::Timeout {
                command: spec.display(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let join = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    Ok(CapturedOutput {
        status,
        stdout: join(stdout_reader),
        stderr: join(stderr_reader),
    })
}

/// Like [`run_captured`], but a non-zero exit becomes
/// `RuntimeError::OperationFailed` carrying the combined output.
pub fn run_checked(
    spec: &ProcessSpec,
    timeout: Duration,
    context: &str,
) -> Result<CapturedOutput, RuntimeError> {
    let output = run_captured(spec, timeout)?;
    if output.success() {
        Ok(output)
    } else {
        Err(RuntimeError::OperationFailed {
            context: context.to_owned(),
            output: output.combined(),
        })
    }
}

/// Run a command attached to the caller's terminal. No deadline applies: the
/// user is driving the session.
pub fn run_interactive(spec: &ProcessSpec) -> Result<ExitStatus, RuntimeError> {
    debug!("exec (interactive): {}", spec.display());
    Ok(spec
        .to_command()
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()?)
}

fn drain(mut pipe: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Locate an executable: explicit override, then `PATH`, then the given
/// well-known installation paths.
pub fn find_binary(name: &str, override_path: Option<&Path>, common: &[&str]) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(
            "configured {name} path '{}' not found, falling back to standard detection",
            path.display()
        );
    }
    search_path(name).or_else(|| {
        common
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
    })
}

pub fn search_path(name: impl AsRef<OsStr>) -> Option<PathBuf> {
    let name = name.as_ref();
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
