//! Child processes for unit bodies: wall-clock timeout and bounded capture.

use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream, plus how many were read and dropped.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

impl Captured {
    fn append_to(&self, label: &str, buf: &mut String) {
        buf.push_str(&format!("=== {label} ===\n"));
        buf.push_str(&String::from_utf8_lossy(&self.bytes));
        if self.dropped > 0 {
            buf.push_str(&format!("\n[{label} truncated {} bytes]", self.dropped));
        }
        buf.push('\n');
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Body of the per-unit log file.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        self.stdout.append_to("stdout", &mut buf);
        self.stderr.append_to("stderr", &mut buf);
        if self.timed_out {
            buf.push_str("[timed out]\n");
        }
        buf
    }
}

/// Run `cmd` with stdin closed, killing it once `timeout` elapses.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty body cannot block on a full pipe. At most `limit` bytes per
/// stream are kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_with_timeout(mut cmd: Command, timeout: Duration, limit: usize) -> Result<ProcessOutput> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn unit body")?;
    debug!(pid = child.id(), "unit body spawned");

    let stdout = capture(child.stdout.take(), limit)?;
    let stderr = capture(child.stderr.take(), limit)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for unit body")? {
        Some(status) => (status, false),
        None => {
            warn!("unit body exceeded its timeout; killing");
            child.kill().context("kill unit body")?;
            (child.wait().context("reap unit body")?, true)
        }
    };

    let output = ProcessOutput {
        status,
        stdout: collect(stdout).context("read stdout")?,
        stderr: collect(stderr).context("read stderr")?,
        timed_out,
    };
    if output.stdout.dropped > 0 || output.stderr.dropped > 0 {
        warn!(
            stdout_dropped = output.stdout.dropped,
            stderr_dropped = output.stderr.dropped,
            "unit output truncated"
        );
    }
    Ok(output)
}

fn capture<R>(stream: Option<R>, limit: usize) -> Result<JoinHandle<io::Result<Captured>>>
where
    R: Read + Send + 'static,
{
    let mut stream = stream.ok_or_else(|| anyhow!("child stream was not piped"))?;
    Ok(thread::spawn(move || {
        let mut captured = Captured::default();
        stream
            .by_ref()
            .take(limit as u64)
            .read_to_end(&mut captured.bytes)?;
        captured.dropped = io::copy(&mut stream, &mut io::sink())?;
        Ok(captured)
    }))
}

fn collect(handle: JoinHandle<io::Result<Captured>>) -> Result<Captured> {
    let captured = handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))??;
    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn keeps_prefix_and_counts_dropped_bytes() {
        let output = run_with_timeout(
            sh("printf 'hello world'; printf oops >&2"),
            Duration::from_secs(10),
            5,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.bytes, b"hello");
        assert_eq!(output.stdout.dropped, 6);
        assert_eq!(output.stderr.bytes, b"oops");
        assert!(output.render_log().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_body_after_timeout() {
        let output =
            run_with_timeout(sh("sleep 5"), Duration::from_millis(100), 100).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(output.render_log().ends_with("[timed out]\n"));
    }
}
