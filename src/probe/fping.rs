//! fping child process management.
//!
//! Runs `fping` in loop mode with stdout and stderr sharing one pipe, so the
//! monitor sees every line in the order fping wrote it.

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::LineSource;
use crate::config::ProbeConfig;

/// Fixed fping option profile: timestamps, 56 byte payload, loop forever,
/// no retries, 1000 ms between probes to the same target.
pub const FPING_ARGS: &[&str] = &["-D", "-b", "56", "-l", "-r", "0", "-p", "1000"];

/// Longest line kept, in bytes. The remainder up to the newline is dropped.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Builds the full fping argument list for the given targets.
pub fn fping_args(targets: &[String]) -> Vec<String> {
    FPING_ARGS
        .iter()
        .map(|s| (*s).to_string())
        .chain(targets.iter().cloned())
        .collect()
}

/// A running probe process with its output exposed as lines.
pub struct ProbeProcess {
    program: String,
    child: Child,
    output: Option<LineReader<pipe::Receiver>>,
}

impl ProbeProcess {
    /// Spawn fping against `targets` using the fixed option profile.
    pub fn spawn_fping(cfg: &ProbeConfig, targets: &[String]) -> Result<Self> {
        Self::spawn(&cfg.binary, &fping_args(targets))
    }

    /// Spawn `program` with `args`, stderr redirected into stdout.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let (writer, reader) = pipe::pipe().context("creating output pipe")?;
        let stdout = writer
            .into_blocking_fd()
            .context("detaching output pipe")?;
        let stderr = stdout.try_clone().context("duplicating output pipe")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            // Own process group: a terminal Ctrl+C reaches only the monitor,
            // which then stops the child itself.
            .process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {program}"))?;

        // Close our copies of the write end so the reader sees EOF when the
        // child exits.
        drop(cmd);

        info!(
            pid = child.id(),
            command = %format!("{program} {}", args.join(" ")),
            "probe process started",
        );

        Ok(Self {
            program: program.to_string(),
            child,
            output: Some(LineReader::new(reader)),
        })
    }

    /// Returns the OS process id, if the child has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .with_context(|| format!("waiting for {}", self.program))
    }
}

/// Newline-delimited reader that tolerates invalid UTF-8 and bounds line length.
///
/// Partial lines live in `buf` between calls, so `next_line` is cancel safe.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    truncated: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            truncated: false,
        }
    }

    /// Returns the next line without its terminator, `None` at end of input.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && !self.truncated {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let content = &available[..newline.unwrap_or(available.len())];

            let room = MAX_LINE_BYTES - self.buf.len();
            if content.len() > room {
                self.truncated = true;
            }
            self.buf
                .extend_from_slice(&content[..content.len().min(room)]);

            let used = newline.map_or(available.len(), |i| i + 1);
            self.inner.consume(used);

            if newline.is_some() {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }

        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();

        if std::mem::take(&mut self.truncated) {
            warn!(limit = MAX_LINE_BYTES, "probe output line truncated");
        }

        line
    }
}

impl LineSource for ProbeProcess {
    async fn next_line(&mut self) -> Result<Option<String>> {
        let Some(output) = self.output.as_mut() else {
            return Ok(None);
        };

        let line = output
            .next_line()
            .await
            .with_context(|| format!("reading {} output", self.program))?;

        if line.is_none() {
            debug!("probe output closed");
            self.output = None;
        }

        Ok(line)
    }

    async fn stop(&mut self) -> Result<()> {
        self.output = None;

        if let Some(status) = self
            .child
            .try_wait()
            .with_context(|| format!("polling {}", self.program))?
        {
            warn!(%status, "probe process had already exited");
            return Ok(());
        }

        self.child
            .kill()
            .await
            .with_context(|| format!("terminating {}", self.program))?;

        info!("probe process terminated");

        Ok(())
    }
}
