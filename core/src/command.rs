use crate::config::AgentConfig;
use crate::error::ToolError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const TRUNCATION_MARKER: &str = "\n\n...Output is too long. Truncated here.";

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep reading after a kill before giving up on the pipes.
const READ_GRACE: Duration = Duration::from_millis(200);

/// Runs one external command to completion (or until the deadline).
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Option<Duration>,
    output_cap: usize,
}

/// Untruncated capture of a finished command.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub invocation: String,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub started_at: String,
    pub duration_ms: u128,
}

/// What the planner gets to see: both streams bounded by the output cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>, output_cap: usize) -> Self {
        Self {
            timeout,
            output_cap,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command_timeout, config.output_cap)
    }

    pub fn output_cap(&self) -> usize {
        self.output_cap
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Spawns `program` inside `cwd`. Standard input is the payload when one
    /// is given and an immediately closed pipe otherwise.
    pub fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        stdin_payload: Option<&str>,
    ) -> Result<RawOutput, ToolError> {
        let invocation = render_invocation(program, args);
        debug!(command = %invocation, cwd = %cwd.display(), "running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own group, so a timeout can take down forked workers too
            cmd.process_group(0);
        }

        let started_at = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let timer = Instant::now();

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let Some(mut pipe) = child.stdin.take() {
            let payload = stdin_payload.unwrap_or_default().to_string();
            // detached: a grandchild holding the pipe must not stall the run
            thread::spawn(move || {
                let _ = pipe.write_all(payload.as_bytes());
            });
        }
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = self.timeout.map(|timeout| timer + timeout);
        let status = self.wait(&mut child, program, deadline)?;

        // once the deadline passed, inherited pipes only get a short grace
        let read_deadline = deadline.map(|deadline| deadline.max(Instant::now() + READ_GRACE));
        let stdout = collect_reader(stdout_reader, read_deadline);
        let mut stderr = collect_reader(stderr_reader, read_deadline);
        let duration_ms = timer.elapsed().as_millis();

        let (returncode, timed_out) = match status {
            Some(status) => (status.code().unwrap_or(-1), false),
            None => {
                let seconds = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(command = %invocation, seconds, "command timed out and was killed");
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("command timed out after {seconds}s and was killed"));
                (-1, true)
            }
        };

        debug!(command = %invocation, returncode, duration_ms = duration_ms as u64, "command finished");

        Ok(RawOutput {
            invocation,
            returncode,
            stdout,
            stderr,
            timed_out,
            started_at,
            duration_ms,
        })
    }

    fn wait(
        &self,
        child: &mut Child,
        program: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<ExitStatus>, ToolError> {
        let spawn_err = |source| ToolError::Spawn {
            program: program.to_string(),
            source,
        };

        let Some(deadline) = deadline else {
            return child.wait().map(Some).map_err(spawn_err);
        };

        loop {
            if let Some(status) = child.try_wait().map_err(spawn_err)? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                kill_process_group(child);
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl RawOutput {
    pub fn to_result(&self, cap: usize) -> CommandResult {
        CommandResult {
            returncode: self.returncode,
            stdout: truncate_output(&self.stdout, cap),
            stderr: truncate_output(&self.stderr, cap),
            timed_out: self.timed_out,
        }
    }

    pub fn success(&self) -> bool {
        self.returncode == 0 && !self.timed_out
    }
}

/// Cuts `text` to `cap` characters and appends the truncation marker.
/// Text at or under the cap is returned unchanged.
pub fn truncate_output(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

pub fn render_invocation(program: &str, args: &[String]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(program);
    words.extend(args.iter().map(String::as_str));
    shell_words::join(words)
}

/// Kills every process in the child's group (best effort).
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let group = format!("-{}", child.id());
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = status {
        debug!(%err, group = %group, "could not signal process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn spawn_reader<R>(source: Option<R>) -> Option<Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    source.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    })
}

/// Waits for a reader until `deadline`; `None` waits for end of stream.
fn collect_reader(reader: Option<Receiver<Vec<u8>>>, deadline: Option<Instant>) -> String {
    let Some(rx) = reader else {
        return String::new();
    };
    let bytes = match deadline {
        Some(deadline) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
        None => rx.recv().ok(),
    };
    bytes
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        let text = "a".repeat(1000);
        assert_eq!(truncate_output(&text, 1000), text);
        assert_eq!(truncate_output("", 1000), "");
    }

    #[test]
    fn long_output_is_cut_at_cap_with_marker() {
        let text = "x".repeat(1500);
        let truncated = truncate_output(&text, 1000);
        assert_eq!(truncated.len(), 1000 + TRUNCATION_MARKER.len());
        assert!(truncated.starts_with(&"x".repeat(1000)));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(1001);
        let truncated = truncate_output(&text, 1000);
        let kept = truncated.strip_suffix(TRUNCATION_MARKER).expect("marker present");
        assert_eq!(kept.chars().count(), 1000);
    }

    #[test]
    fn invocation_is_shell_quoted() {
        let rendered = render_invocation("kubectl", &["get".into(), "pod name".into()]);
        assert_eq!(rendered, "kubectl get 'pod name'");
    }

    #[cfg(unix)]
    #[test]
    fn captures_streams_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandRunner::new(Some(Duration::from_secs(10)), 1000);
        let output = runner
            .run(
                "sh",
                &["-c".into(), "cat; echo oops >&2; exit 3".into()],
                dir.path(),
                Some("piped input"),
            )
            .expect("command runs");
        assert_eq!(output.returncode, 3);
        assert_eq!(output.stdout, "piped input");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[test]
    fn runs_inside_working_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "here").expect("write marker");
        let runner = CommandRunner::new(None, 1000);
        let output = runner
            .run("cat", &["marker.txt".into()], dir.path(), None)
            .expect("command runs");
        assert!(output.success());
        assert_eq!(output.stdout, "here");
    }

    #[cfg(unix)]
    #[test]
    fn expired_deadline_is_reported_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandRunner::new(Some(Duration::from_millis(200)), 1000);
        let output = runner
            .run("sleep", &["5".into()], dir.path(), None)
            .expect("timeout is not an error");
        assert!(output.timed_out);
        assert_eq!(output.returncode, -1);
        assert!(output.stderr.contains("timed out"));
        assert!(output.to_result(1000).timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_bounds_runs_with_forked_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandRunner::new(Some(Duration::from_millis(200)), 1000);
        let started = Instant::now();
        let output = runner
            .run("sh", &["-c".into(), "sleep 6; echo done".into()], dir.path(), None)
            .expect("timeout is not an error");
        assert!(output.timed_out);
        assert!(!output.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandRunner::new(None, 1000);
        let err = runner
            .run("definitely-not-a-real-binary-xyz", &[], dir.path(), None)
            .expect_err("spawn fails");
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
