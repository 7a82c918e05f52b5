//! External build toolchain invocation.
//!
//! A [`Toolchain`] is the "build to output path" invocation shape for one
//! source language. [`run_build`] runs it with captured output, a deadline,
//! and cooperative cancellation. The whole process group is killed when the
//! toolchain exits, times out, or is cancelled: compilers fork helpers that
//! would otherwise outlive the driver and hold the output pipes open.

use crate::preparable::PrepareError;
use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Placeholder replaced by the source directory in toolchain arguments.
pub const SRC_PLACEHOLDER: &str = "{src}";
/// Placeholder replaced by the output binary path in toolchain arguments.
pub const OUT_PLACEHOLDER: &str = "{out}";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output pipes may stay open after the toolchain itself exited.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8192;

/// Program plus argument template for building one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Toolchain {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Toolchain {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `go build -o {out} {src}/.`
    pub fn go() -> Self {
        Self::new("go", ["build", "-o", OUT_PLACEHOLDER, "{src}/."])
    }

    /// Built-in toolchain for `language`, if there is one.
    pub fn builtin(language: &str) -> Option<Self> {
        match language {
            "go" => Some(Self::go()),
            _ => None,
        }
    }

    /// Arguments with `{src}` and `{out}` substituted.
    pub fn render_args(&self, src: &Path, out: &Path) -> Vec<String> {
        let src = src.to_string_lossy();
        let out = out.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SRC_PLACEHOLDER, &src)
                    .replace(OUT_PLACEHOLDER, &out)
            })
            .collect()
    }
}

/// Captured stdout and stderr of a toolchain run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl BuildOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    fn append(&mut self, stream: Stream, chunk: &[u8]) {
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(chunk),
            Stream::Stderr => self.stderr.extend_from_slice(chunk),
        }
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

impl fmt::Display for BuildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.combined().trim_end())
    }
}

/// Shared flag for aborting a running build from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Interrupt {
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type Chunk = (Stream, Vec<u8>);

/// Run `toolchain` to build `src` into `out`.
///
/// Returns the captured output on a zero exit status. A non-zero exit, a
/// missing program, an elapsed `timeout`, or a triggered `cancel` token all
/// yield an error; the variants that ran the program carry its output.
///
/// The deadline and the token cover the whole run, including draining the
/// output pipes. Once the toolchain exits, anything left in its process group
/// is killed. Helpers that escaped the group get [`DRAIN_GRACE`] to release
/// the pipes before the run returns with the output collected so far.
pub fn run_build(
    toolchain: &Toolchain,
    src: &Path,
    out: &Path,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<BuildOutput, PrepareError> {
    let program = toolchain.program.clone();
    let resolved = which::which(&program)
        .map_err(|_| PrepareError::ToolchainMissing {
            program: program.clone(),
        })?;
    let args = toolchain.render_args(src, out);

    if cancel.is_cancelled() {
        return Err(PrepareError::Cancelled {
            program,
            output: BuildOutput::default(),
        });
    }

    info!("running {} {}", resolved.display(), args.join(" "));
    let mut child = Command::new(&resolved)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .with_context(|| format!("spawning build toolchain '{}'", resolved.display()))?;

    let (tx, rx) = mpsc::channel::<Chunk>();
    forward(child.stdout.take(), Stream::Stdout, tx.clone());
    forward(child.stderr.take(), Stream::Stderr, tx);

    let started = Instant::now();
    let mut output = BuildOutput::default();
    let mut exited: Option<(ExitStatus, Instant)> = None;
    let mut drained = false;

    let outcome: Result<ExitStatus, Interrupt> = loop {
        if exited.is_none() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // Leftover helpers in the group would hold the pipes open.
                    kill_group(child.id());
                    exited = Some((status, Instant::now()));
                }
                Ok(None) => {}
                Err(err) => {
                    kill_group(child.id());
                    let _ = child.wait();
                    return Err(anyhow::Error::new(err)
                        .context(format!("waiting on build toolchain '{program}'"))
                        .into());
                }
            }
        }
        if let Some((status, at)) = exited {
            if drained {
                break Ok(status);
            }
            if at.elapsed() >= DRAIN_GRACE {
                warn!("{program} exited but its output pipes are still held open");
                break Ok(status);
            }
        }
        if cancel.is_cancelled() {
            break Err(Interrupt::Cancelled);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                break Err(Interrupt::TimedOut(limit));
            }
        }
        if drained {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, chunk)) => output.append(stream, &chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => drained = true,
        }
    };

    if outcome.is_err() {
        kill_group(child.id());
        if exited.is_none() {
            let _ = child.wait();
        }
    }
    while let Ok((stream, chunk)) = rx.try_recv() {
        output.append(stream, &chunk);
    }

    debug!(
        "{program} finished after {:?} ({} bytes stdout, {} bytes stderr)",
        started.elapsed(),
        output.stdout.len(),
        output.stderr.len()
    );

    match outcome {
        Ok(status) if status.success() => Ok(output),
        Ok(status) => Err(PrepareError::Toolchain {
            program,
            status: describe_status(status),
            output,
        }),
        Err(Interrupt::TimedOut(after)) => {
            warn!("{program} exceeded build timeout of {}s", after.as_secs());
            Err(PrepareError::Timeout {
                program,
                after,
                output,
            })
        }
        Err(Interrupt::Cancelled) => {
            warn!("{program} cancelled");
            Err(PrepareError::Cancelled { program, output })
        }
    }
}

/// Copy `pipe` into `tx` chunk by chunk until EOF or until the receiver is gone.
fn forward<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<Chunk>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
}

fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The child was
    // spawned with process_group(0), so its pid is also its group id.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(sig) => format!("killed by signal {sig}"),
                None => "unknown status".to_string(),
            }
        }
    }
}
