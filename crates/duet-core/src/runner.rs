//! Runs one external CLI and streams its output as [`Chunk`]s.
//!
//! A run owns exactly one child process. Two reader tasks forward stdout and
//! stderr fragments into the run's bounded chunk queue while a supervisor
//! task tracks the exit status and drives timeout escalation:
//!
//! ```text
//! Running --deadline--> Terminating --grace elapsed--> Killed
//!    \____________________\_________________________\___ exit + EOF --> Done
//! ```
//!
//! The terminal result is delivered only after every chunk is queued.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use crate::agent::Agent;
use crate::chunk::{Chunk, ChunkKind, ChunkSender, ChunkStream, chunk_channel};
use crate::config::{AgentCommands, DEFAULT_STREAM_BUFFER_CAPACITY, DEFAULT_TIMEOUT, DuetConfig};
use crate::errors::{DuetError, RunFailure};

/// Time a process gets to exit after the graceful signal before it is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Inputs for one CLI invocation.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub agent: Agent,
    /// Passed to the CLI as its only positional argument.
    pub prompt: String,
    pub work_dir: PathBuf,
    pub timeout: Duration,
}

impl RunRequest {
    /// Creates a request in the current directory with the default timeout.
    pub fn new(agent: Agent, prompt: impl Into<String>) -> Self {
        Self {
            agent,
            prompt: prompt.into(),
            work_dir: PathBuf::from("."),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Starts runs. Implemented by [`CliRunner`]; tests substitute scripted runners.
pub trait AgentRunner: Send + Sync {
    /// Starts a run and returns its chunk stream.
    ///
    /// Must be called from within a Tokio runtime.
    fn run(&self, request: RunRequest) -> ChunkStream;
}

/// Runs agent CLIs as shell commands.
#[derive(Clone, Debug)]
pub struct CliRunner {
    commands: AgentCommands,
    stream_buffer_capacity: usize,
}

impl CliRunner {
    pub fn new(commands: AgentCommands) -> Self {
        Self {
            commands,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    pub fn from_config(config: &DuetConfig) -> Self {
        Self::new(config.commands.clone()).stream_buffer_capacity(config.stream_buffer_capacity)
    }

    /// Sets the bounded chunk queue size for each run.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }
}

impl AgentRunner for CliRunner {
    fn run(&self, request: RunRequest) -> ChunkStream {
        let command = self.commands.command_for(request.agent).to_string();
        let (sink, stream) = chunk_channel(self.stream_buffer_capacity);
        tokio::spawn(run_process(command, request, sink));
        stream
    }
}

/// Builds the shell invocation for `command` with `prompt` as its sole argument.
///
/// The prompt travels as a positional parameter, never through shell
/// interpolation.
pub(crate) fn shell_command(command: &str, prompt: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("{command} \"$@\""))
            .arg("sh")
            .arg(prompt);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command).arg(prompt);
        cmd
    }
}

/// Wall-clock base plus a monotonic offset, so timestamps never go backwards
/// within a run.
#[derive(Clone, Copy)]
struct RunClock {
    origin: std::time::Instant,
    base_ms: i64,
}

impl RunClock {
    fn start() -> Self {
        Self {
            origin: std::time::Instant::now(),
            base_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn now(&self) -> i64 {
        self.base_ms
            .saturating_add(i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Running,
    Terminating { force_at: Instant },
    Killed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    TimedOut,
    Cancelled,
}

/// Signals the child's whole process group. Every operation is idempotent:
/// signalling a group that already exited is a no-op.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
}

impl ProcessGroup {
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if self.signal(libc::SIGTERM) {
                return;
            }
        }
        let _ = child.start_kill();
    }

    fn kill(&self, child: &mut Child) {
        #[cfg(unix)]
        let _ = self.signal(libc::SIGKILL);
        let _ = child.start_kill();
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // addresses the process group the child leads.
        unsafe { libc::kill(-pid, signal) == 0 }
    }
}

async fn run_process(command: String, request: RunRequest, sink: ChunkSender) {
    let agent = request.agent;
    let clock = RunClock::start();
    let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
    debug!(%agent, command = %command, work_dir = %request.work_dir.display(), timeout_ms, "spawning agent process");

    let mut cmd = shell_command(&command, &request.prompt);
    cmd.current_dir(&request.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let reason = err.to_string();
            error!(%agent, error = %reason, "agent process failed to spawn");
            sink.send(Chunk::error(agent, format!("Spawn error: {reason}"), clock.now()))
                .await;
            sink.finish(Err(RunFailure::Spawn { agent, reason }.into()));
            return;
        }
    };
    let group = ProcessGroup { pid: child.id() };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        group.kill(&mut child);
        sink.finish(Err(DuetError::protocol_msg(format!(
            "{agent} process streams not available"
        ))));
        return;
    };

    let tx = sink.raw_sender();
    let readers = futures::future::join(
        spawn_reader(stdout, agent, ChunkKind::Text, tx.clone(), clock),
        spawn_reader(stderr, agent, ChunkKind::Error, tx.clone(), clock),
    );
    tokio::pin!(readers);

    let deadline = Instant::now() + request.timeout;
    let mut phase = Phase::Running;
    let mut stop: Option<StopReason> = None;
    let mut notice: Option<Chunk> = None;
    let mut status: Option<io::Result<ExitStatus>> = None;
    let mut readers_done = false;

    let exit = loop {
        if readers_done && status.is_some() {
            break status.take();
        }
        let force_at = match phase {
            Phase::Terminating { force_at } => Some(force_at),
            Phase::Running | Phase::Killed => None,
        };
        tokio::select! {
            permit = tx.reserve(), if notice.is_some() => {
                match permit {
                    Ok(permit) => {
                        if let Some(chunk) = notice.take() {
                            permit.send(chunk);
                        }
                    }
                    Err(_) => notice = None,
                }
            }
            waited = child.wait(), if status.is_none() => {
                status = Some(waited);
            }
            _ = &mut readers, if !readers_done => {
                readers_done = true;
            }
            _ = time::sleep_until(deadline), if phase == Phase::Running => {
                error!(%agent, timeout_ms, "agent process timed out");
                notice = Some(Chunk::error(
                    agent,
                    format!("Process timed out after {timeout_ms}ms"),
                    clock.now(),
                ));
                stop = Some(StopReason::TimedOut);
                group.terminate(&mut child);
                phase = Phase::Terminating { force_at: Instant::now() + GRACE_PERIOD };
            }
            _ = sleep_until_some(force_at) => {
                warn!(%agent, "force killing agent process");
                group.kill(&mut child);
                phase = Phase::Killed;
            }
            _ = sink.aborted(), if phase == Phase::Running => {
                debug!(%agent, "agent run aborted");
                notice = Some(Chunk::error(agent, "Process cancelled", clock.now()));
                stop = Some(StopReason::Cancelled);
                group.terminate(&mut child);
                phase = Phase::Terminating { force_at: Instant::now() + GRACE_PERIOD };
            }
            _ = sink.closed(), if phase == Phase::Running => {
                debug!(%agent, "chunk consumer dropped; stopping agent process");
                stop = Some(StopReason::Cancelled);
                group.terminate(&mut child);
                phase = Phase::Terminating { force_at: Instant::now() + GRACE_PERIOD };
            }
        }
    };

    if let Some(chunk) = notice.take() {
        let _ = tx.send(chunk).await;
    }

    let result = match (stop, exit) {
        (Some(StopReason::TimedOut), _) => Err(RunFailure::Timeout { agent, timeout_ms }.into()),
        (Some(StopReason::Cancelled), _) => Err(RunFailure::Cancelled { agent }.into()),
        (None, Some(Ok(status))) if status.success() => {
            debug!(%agent, "agent process exited successfully");
            Ok(())
        }
        (None, Some(Ok(status))) => {
            let code = exit_code(status);
            error!(%agent, code, "agent process failed");
            let _ = tx
                .send(Chunk::error(
                    agent,
                    format!("Process exited with code {code}"),
                    clock.now(),
                ))
                .await;
            Err(RunFailure::Exit { agent, code }.into())
        }
        (None, Some(Err(err))) => {
            error!(%agent, error = %err, "failed to wait on agent process");
            let _ = tx
                .send(Chunk::error(
                    agent,
                    format!("Process wait error: {err}"),
                    clock.now(),
                ))
                .await;
            Err(DuetError::protocol_msg(format!(
                "failed to wait on {agent} process: {err}"
            )))
        }
        (None, None) => Err(DuetError::protocol_msg(format!(
            "{agent} process finished without an exit status"
        ))),
    };
    drop(tx);
    sink.finish(result);
}

/// Sleeps until `at`, or forever when there is no instant.
async fn sleep_until_some(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(
    mut reader: R,
    agent: Agent,
    kind: ChunkKind,
    tx: mpsc::Sender<Chunk>,
    clock: RunClock,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0_u8; READ_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    warn!(%agent, ?kind, error = %err, "agent output read failed");
                    break;
                }
            };
            let text = decoder.push(&buf[..n]);
            if text.is_empty() {
                continue;
            }
            if kind == ChunkKind::Error {
                warn!(%agent, stderr = %text, "agent stderr");
            }
            let chunk = Chunk {
                source: agent,
                content: text,
                timestamp: clock.now(),
                kind,
            };
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
        if let Some(text) = decoder.finish() {
            let chunk = Chunk {
                source: agent,
                content: text,
                timestamp: clock.now(),
                kind,
            };
            let _ = tx.send(chunk).await;
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Decodes byte fragments to text, holding back a UTF-8 sequence split
/// across reads until the rest arrives.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail_len(&self.pending);
        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a truncated multibyte sequence at the end of `bytes`, if any.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(command: &str) -> CliRunner {
        CliRunner::new(AgentCommands::new(command, command))
    }

    fn request(prompt: &str) -> RunRequest {
        RunRequest::new(Agent::Gemini, prompt).timeout(Duration::from_secs(10))
    }

    fn text_of(chunks: &[Chunk], kind: ChunkKind) -> String {
        chunks
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.content.as_str())
            .collect()
    }

    #[tokio::test]
    async fn streams_stdout_and_succeeds_on_zero_exit() {
        let (chunks, result) = runner("echo").run(request("hello world")).collect().await;

        assert!(result.is_ok(), "unexpected failure: {result:?}");
        assert_eq!(text_of(&chunks, ChunkKind::Text), "hello world\n");
        assert!(chunks.iter().all(|c| !c.is_error()));
        assert!(chunks.iter().all(|c| !c.content.is_empty()));
        assert!(chunks.iter().all(|c| c.source == Agent::Gemini));
    }

    #[tokio::test]
    async fn prompt_is_one_argument_without_shell_expansion() {
        let (chunks, result) = runner("printf '%s|'")
            .run(request("two words; $HOME `id`"))
            .collect()
            .await;

        assert!(result.is_ok());
        assert_eq!(text_of(&chunks, ChunkKind::Text), "two words; $HOME `id`|");
    }

    #[tokio::test]
    async fn stderr_becomes_error_chunks_but_zero_exit_still_succeeds() {
        let (chunks, result) = runner("echo warning >&2; echo")
            .run(request("done"))
            .collect()
            .await;

        assert!(result.is_ok());
        assert_eq!(text_of(&chunks, ChunkKind::Error), "warning\n");
        assert_eq!(text_of(&chunks, ChunkKind::Text), "done\n");
    }

    #[tokio::test]
    async fn non_zero_exit_emits_one_error_chunk_and_fails() {
        let (chunks, result) = runner("sh -c 'exit 3'").run(request("x")).collect().await;

        let errors: Vec<_> = chunks.iter().filter(|c| c.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "Process exited with code 3");
        assert_eq!(chunks.last(), Some(errors[0]));
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Exit { agent: Agent::Gemini, code: 3 }))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_emits_single_chunk() {
        let missing = tempfile::tempdir().unwrap().path().join("gone");
        let (chunks, result) = runner("echo")
            .run(request("x").work_dir(&missing))
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_error());
        assert!(chunks[0].content.starts_with("Spawn error: "));
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Spawn { .. }))
        ));
    }

    #[tokio::test]
    async fn runs_in_requested_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found").unwrap();
        let (chunks, result) = runner("cat")
            .run(request("marker.txt").work_dir(dir.path()))
            .collect()
            .await;

        assert!(result.is_ok());
        assert_eq!(text_of(&chunks, ChunkKind::Text), "found");
    }

    #[tokio::test]
    async fn timeout_emits_one_chunk_after_earlier_output_and_fails() {
        let (chunks, result) = runner("echo started; sleep 30; true")
            .run(request("x").timeout(Duration::from_millis(300)))
            .collect()
            .await;

        assert_eq!(text_of(&chunks, ChunkKind::Text), "started\n");
        let errors: Vec<_> = chunks.iter().filter(|c| c.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "Process timed out after 300ms");
        assert_eq!(chunks.last(), Some(errors[0]));
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Timeout { timeout_ms: 300, .. }))
        ));
    }

    #[tokio::test]
    async fn timeout_wins_even_if_process_exits_cleanly_in_grace_window() {
        let (chunks, result) = runner("trap 'exit 0' TERM; while :; do sleep 0.05; done; true")
            .run(request("x").timeout(Duration::from_millis(200)))
            .collect()
            .await;

        assert!(
            !chunks.iter().any(|c| c.content.starts_with("Process exited")),
            "exit code chunk must not duplicate the timeout"
        );
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn ignoring_terminate_escalates_to_kill_after_grace_period() {
        let started = std::time::Instant::now();
        let (_, result) = runner("trap '' TERM; sleep 30; true")
            .run(request("x").timeout(Duration::from_millis(100)))
            .collect()
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= GRACE_PERIOD, "killed before grace period: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(20), "kill never happened: {elapsed:?}");
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn abort_terminates_and_reports_cancelled() {
        let mut stream = runner("echo ready; sleep 30; true").run(request("x"));
        let first = stream.next_chunk().await.expect("first chunk");
        assert_eq!(first.content, "ready\n");

        stream.abort_handle().abort();
        let (chunks, result) = stream.collect().await;
        assert_eq!(
            chunks.last().map(|c| c.content.as_str()),
            Some("Process cancelled")
        );
        assert!(matches!(
            result,
            Err(DuetError::RunFailed(RunFailure::Cancelled { .. }))
        ));
    }

    #[tokio::test]
    async fn slow_consumer_receives_every_chunk_in_order() {
        let runner = runner("for i in 1 2 3 4 5 6 7 8; do echo line$i; done; true")
            .stream_buffer_capacity(1);
        let mut stream = runner.run(request("x"));
        let mut text = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
            text.push_str(&chunk.content);
        }
        assert!(stream.finish().await.is_ok());
        let expected: String = (1..=8).map(|i| format!("line{i}\n")).collect();
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn timestamps_never_decrease_within_one_source() {
        let (chunks, _) = runner("for i in 1 2 3; do echo $i; sleep 0.02; done; true")
            .run(request("x"))
            .collect()
            .await;
        let stamps: Vec<i64> = chunks.iter().map(|c| c.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn decoder_holds_back_split_multibyte_sequence() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.push(&[0xAC, b'b']), "€b");
        assert_eq!(decoder.finish(), None);

        assert_eq!(decoder.push(&[0xF0, 0x9F]), "");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn decoder_holds_back_split_sequence_after_invalid_byte() {
        let mut decoder = Utf8Decoder::default();
        let mut text = decoder.push(&[0xFF, b'a', 0xE2, 0x82]);
        text.push_str(&decoder.push(&[0xAC, b'b']));
        assert_eq!(text, "\u{FFFD}a€b");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_does_not_hold_back_complete_or_stray_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push("é".as_bytes()), "é");
        assert_eq!(decoder.push(&[b'x', 0x80]), "x\u{FFFD}");
        assert_eq!(decoder.finish(), None);
    }
}
