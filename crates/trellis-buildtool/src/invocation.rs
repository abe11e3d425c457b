//! build/test/run subprocess driver

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use trellis_core::{ActionKind, BuildToolError, BuildToolSettings, CancelToken};

use crate::events::{BuildEvent, EventTail, TestOutcome};

/// How often the event file is polled while the tool runs.
const TAIL_INTERVAL: Duration = Duration::from_millis(50);
/// Lines of stderr kept for the report.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub action: ActionKind,
    pub target: String,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Arguments passed to the binary after `--`; only used by `run`.
    #[serde(default)]
    pub run_args: Vec<String>,
}

impl InvocationRequest {
    pub fn new(action: ActionKind, target: impl Into<String>) -> Self {
        InvocationRequest { action, target: target.into(), flags: Vec::new(), run_args: Vec::new() }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn verb(&self) -> &'static str {
        match self.action {
            ActionKind::Build => "build",
            ActionKind::Test => "test",
            ActionKind::Run => "run",
        }
    }

    pub(crate) fn arguments(&self, settings: &BuildToolSettings, event_file: &Path) -> Vec<String> {
        let configured = match self.action {
            ActionKind::Build => &settings.build_flags,
            ActionKind::Test => &settings.test_flags,
            ActionKind::Run => &settings.run_flags,
        };
        let mut args = vec![self.verb().to_string()];
        args.extend(configured.iter().cloned());
        args.extend(self.flags.iter().cloned());
        args.push(format!("--build_event_json_file={}", event_file.display()));
        args.push("--build_event_publish_all_actions".to_string());
        args.push(self.target.clone());
        if self.action == ActionKind::Run && !self.run_args.is_empty() {
            args.push("--".to_string());
            args.extend(self.run_args.iter().cloned());
        }
        args
    }
}

/// Final outcome. Cancellation is its own state, never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationReport {
    pub status: InvocationStatus,
    /// Success flag of the last `Finished` event, if one arrived.
    pub finished: Option<bool>,
    pub test_results: Vec<TestOutcome>,
    pub events_delivered: usize,
    pub malformed_records: usize,
    pub stderr_tail: String,
    pub elapsed_ms: u64,
}

impl InvocationReport {
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }
}

/// Collects what the report needs while events are forwarded.
#[derive(Default)]
struct Progress {
    finished: Option<bool>,
    test_results: Vec<TestOutcome>,
    delivered: usize,
}

impl Progress {
    fn deliver(&mut self, events: Vec<BuildEvent>, on_event: &mut (impl FnMut(BuildEvent) + Send)) {
        for event in events {
            match &event {
                BuildEvent::Finished { success, .. } => self.finished = Some(*success),
                BuildEvent::TestResult(outcome) => self.test_results.push(outcome.clone()),
                _ => {}
            }
            self.delivered += 1;
            on_event(event);
        }
    }
}

pub(crate) async fn drive(
    settings: &BuildToolSettings,
    root: &Path,
    request: &InvocationRequest,
    cancel: CancelToken,
    mut on_event: impl FnMut(BuildEvent) + Send,
) -> Result<InvocationReport, BuildToolError> {
    if cancel.is_cancelled() {
        return Err(BuildToolError::Cancelled);
    }
    let start = Instant::now();
    let event_dir = tempfile::tempdir()?;
    let event_file = event_dir.path().join("events.json");
    tokio::fs::File::create(&event_file).await?;

    let args = request.arguments(settings, &event_file);
    info!("Running {} {}", settings.executable, args.join(" "));
    let mut child = Command::new(&settings.executable)
        .args(&args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(&settings.executable, e))?;

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));
    let mut stdout_lines = child.stdout.take().map(|stdout| BufReader::new(stdout).lines());
    let mut stdout_open = stdout_lines.is_some();

    let mut tail = EventTail::open(&event_file).await?;
    let mut progress = Progress::default();
    let mut ticker = tokio::time::interval(TAIL_INTERVAL);

    let exit: Option<ExitStatus> = loop {
        tokio::select! {
            status = child.wait() => break Some(status?),
            _ = cancel.cancelled() => break None,
            line = next_line(&mut stdout_lines), if stdout_open => match line {
                Some(message) => progress.deliver(vec![BuildEvent::Progress { message }], &mut on_event),
                None => stdout_open = false,
            },
            _ = ticker.tick() => {
                let events = tail.poll().await?;
                progress.deliver(events, &mut on_event);
            }
        }
    };

    if exit.is_some() && stdout_open {
        let drain = async {
            while let Some(message) = next_line(&mut stdout_lines).await {
                progress.deliver(vec![BuildEvent::Progress { message }], &mut on_event);
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
    }

    let status = match exit {
        Some(exit) => {
            debug!("{} {} exited with {}", request.verb(), request.target, exit);
            if exit.success() {
                InvocationStatus::Succeeded
            } else {
                InvocationStatus::Failed { exit_code: exit.code() }
            }
        }
        None => {
            terminate(&mut child, settings.cancel_grace()).await;
            InvocationStatus::Cancelled
        }
    };

    // Events already written stay delivered, cancelled or not.
    let (events, malformed_records) = tail.finish().await?;
    progress.deliver(events, &mut on_event);

    let stderr_tail = match stderr_task {
        Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default(),
        None => String::new(),
    };

    let report = InvocationReport {
        status,
        finished: progress.finished,
        test_results: progress.test_results,
        events_delivered: progress.delivered,
        malformed_records,
        stderr_tail,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        "{} {} finished: {:?} ({} events, {} ms)",
        request.verb(),
        request.target,
        report.status,
        report.events_delivered,
        report.elapsed_ms
    );
    Ok(report)
}

pub(crate) fn spawn_error(executable: &str, err: std::io::Error) -> BuildToolError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BuildToolError::ExecutableNotFound(executable.to_string())
    } else {
        BuildToolError::Spawn(format!("{executable}: {err}"))
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

async fn collect_tail(stderr: tokio::process::ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Program used to deliver SIGTERM.
const SIGNAL_PROGRAM: &str = "kill";

/// How a cancelled tool went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    /// Exited on SIGTERM within the grace period.
    Gracefully,
    /// Ignored SIGTERM for the whole grace period and was killed.
    AfterGrace,
    /// SIGTERM could not be sent (no `kill` on PATH, or not a unix host);
    /// killed straight away.
    WithoutSignal,
}

/// Ask the tool to stop, then kill it if it is still running after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    terminate_with(child, grace, SIGNAL_PROGRAM).await;
}

async fn terminate_with(child: &mut Child, grace: Duration, signal_program: &str) -> Stopped {
    let stopped = match send_sigterm(child, signal_program).await {
        Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Cancelled invocation exited with {}", status);
                return Stopped::Gracefully;
            }
            _ => {
                warn!("Build tool did not stop within {:?}; killing it", grace);
                Stopped::AfterGrace
            }
        },
        Err(reason) => {
            warn!("Could not send SIGTERM ({}); killing the build tool", reason);
            Stopped::WithoutSignal
        }
    };

    if let Err(err) = child.start_kill() {
        warn!("Failed to kill build tool: {}", err);
        return stopped;
    }
    let _ = tokio::time::timeout(grace, child.wait()).await;
    stopped
}

#[cfg(unix)]
async fn send_sigterm(child: &Child, program: &str) -> Result<(), String> {
    let pid = child.id().ok_or_else(|| "process already reaped".to_string())?;
    let status = Command::new(program)
        .args(["-TERM", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| format!("{program}: {e}"))?;
    if status.success() { Ok(()) } else { Err(format!("{program} exited with {status}")) }
}

#[cfg(not(unix))]
async fn send_sigterm(_child: &Child, _program: &str) -> Result<(), String> {
    Err("signals are unix-only".to_string())
}
