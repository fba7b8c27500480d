//! Run Supervisor: one script run from spawn to final [`Execution`].
//!
//! The order of the completion path matters:
//!
//! 1. both stream readers reach end-of-stream (or are aborted after a
//!    timeout kill plus grace period),
//! 2. the Log Pipeline is closed and its final batch flushed,
//! 3. the child is reaped.
//!
//! Reading to EOF before waiting means no output is lost to an early-exit
//! race, and the child can never block on a full pipe.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scriptguard_core::config::{LogsConfig, RunnerConfig};
use scriptguard_core::{Execution, ExecutionId, LogLevel, LogMessage, SharedClock, Task, TaskId};
use scriptguard_store::Store;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::line::LineReader;
use crate::live::LiveLog;
use crate::pipeline::{LogPipeline, LogSink, PipelineSettings};

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// argv template; `{env}` and `{script}` are substituted per task.
    pub command: Vec<String>,
    /// `NAME=value` added to the child environment.
    pub encoding_env: String,
    pub max_line_bytes: usize,
    pub strip_ansi: bool,
    /// How long readers may keep draining after a timeout kill.
    pub kill_grace: Duration,
    pub pipeline: PipelineSettings,
}

impl SupervisorSettings {
    pub fn from_config(runner: &RunnerConfig, logs: &LogsConfig) -> Self {
        Self {
            command: runner.command.clone(),
            encoding_env: runner.encoding_env.clone(),
            max_line_bytes: runner.max_line_bytes,
            strip_ansi: runner.strip_ansi,
            kill_grace: Duration::from_secs(runner.kill_grace_secs),
            pipeline: PipelineSettings::from_config(logs),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default(), &LogsConfig::default())
    }
}

/// Final state of one run. `error` is `None` exactly when the execution
/// succeeded.
#[derive(Debug)]
pub struct RunOutcome {
    pub execution: Execution,
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    /// 0 = unlimited. Hot-reloadable.
    timeout_secs: AtomicU64,
    store: Arc<dyn Store>,
    live: LiveLog,
    clock: SharedClock,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        timeout_secs: u64,
        store: Arc<dyn Store>,
        live: LiveLog,
        clock: SharedClock,
    ) -> Self {
        Self {
            settings,
            timeout_secs: AtomicU64::new(timeout_secs),
            store,
            live,
            clock,
        }
    }

    /// Applies to runs started after the call.
    pub fn set_timeout_secs(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Relaxed);
        info!(timeout_secs = secs, "run timeout updated");
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> &LiveLog {
        &self.live
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Run `task` once and return its finished [`Execution`].
    ///
    /// Never panics on task-level failures; every failure is captured in the
    /// outcome.
    pub async fn execute(&self, task: &Task) -> RunOutcome {
        let mut execution = Execution::start(task.id.clone(), self.clock.now());
        let timeout_secs = self.timeout_secs();

        let (mut child, stdout, stderr) = match self.spawn(task) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(task_id = %task.id, execution_id = %execution.id, "{err}");
                let at = execution.start_time;
                execution.fail(at, -1, err.to_string());
                self.announce(&execution, LogLevel::Error, err.to_string());
                return RunOutcome {
                    execution,
                    error: Some(err),
                };
            }
        };

        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            pid = child.id().unwrap_or_default(),
            "run started"
        );
        self.announce(
            &execution,
            LogLevel::Info,
            format!("started {} (env {})", task.script_path, task.env),
        );

        let deadline =
            (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));

        let pipeline = LogPipeline::start(
            &self.settings.pipeline,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            execution.id.clone(),
            task.id.clone(),
        );

        let mut readers = JoinSet::new();
        readers.spawn(drain(
            stdout,
            LogLevel::Stdout,
            self.stream_context(&execution),
            pipeline.sink(),
        ));
        readers.spawn(drain(
            stderr,
            LogLevel::Stderr,
            self.stream_context(&execution),
            pipeline.sink(),
        ));

        let mut timed_out = false;
        match deadline {
            None => join_readers(&mut readers).await,
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, join_readers(&mut readers))
                    .await
                    .is_err()
                {
                    timed_out = true;
                    warn!(
                        task_id = %task.id,
                        execution_id = %execution.id,
                        timeout_secs,
                        "run timed out; killing process group"
                    );
                    kill_process_tree(&mut child);
                    self.settle_readers(&mut readers, &execution.id).await;
                }
            }
        }

        pipeline.finish().await;

        let waited = match deadline {
            Some(deadline) if !timed_out => {
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        // Output closed but the process itself overran.
                        timed_out = true;
                        warn!(
                            task_id = %task.id,
                            execution_id = %execution.id,
                            timeout_secs,
                            "run timed out; killing process group"
                        );
                        kill_process_tree(&mut child);
                        child.wait().await
                    }
                }
            }
            _ => child.wait().await,
        };

        let end = self.clock.now();
        let (exit_code, error) = match waited {
            Ok(status) if timed_out => (
                status.code().unwrap_or(-1),
                Some(RunError::Timeout { secs: timeout_secs }),
            ),
            Err(_) if timed_out => (-1, Some(RunError::Timeout { secs: timeout_secs })),
            Ok(status) if status.success() => (0, None),
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                (code, Some(RunError::NonZeroExit { code }))
            }
            Err(e) => (-1, Some(RunError::Io(e))),
        };
        match &error {
            None => execution.succeed(end),
            Some(err) => execution.fail(end, exit_code, err.to_string()),
        }

        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            status = %execution.status,
            exit_code = execution.exit_code,
            duration_ms = execution.duration_ms,
            "run finished"
        );
        match &error {
            None => self.announce(
                &execution,
                LogLevel::Success,
                format!("finished successfully in {} ms", execution.duration_ms),
            ),
            Some(err) => self.announce(
                &execution,
                LogLevel::Error,
                format!("failed after {} ms: {err}", execution.duration_ms),
            ),
        }

        RunOutcome { execution, error }
    }

    /// Build the child process. Pipes are owned by the returned values, so
    /// every early return closes whatever was opened.
    fn spawn(
        &self,
        task: &Task,
    ) -> Result<(Child, tokio::process::ChildStdout, tokio::process::ChildStderr), RunError> {
        let argv = render_command(&self.settings.command, task);
        let Some((program, args)) = argv.split_first() else {
            return Err(RunError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((key, value)) = self.settings.encoding_env.split_once('=') {
            cmd.env(key, value);
        }
        // Own process group, so a timeout kill also reaches grandchildren
        // that inherited the pipes.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Ok((child, stdout, stderr)),
            _ => {
                kill_process_tree(&mut child);
                Err(RunError::Spawn {
                    program: program.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "child output pipes unavailable",
                    ),
                })
            }
        }
    }

    fn stream_context(&self, execution: &Execution) -> StreamContext {
        StreamContext {
            execution_id: execution.id.clone(),
            task_id: execution.task_id.clone(),
            clock: Arc::clone(&self.clock),
            live: self.live.clone(),
            max_line_bytes: self.settings.max_line_bytes,
            strip_ansi: self.settings.strip_ansi,
        }
    }

    /// After a kill, give readers the grace period to see EOF, then abort.
    async fn settle_readers(&self, readers: &mut JoinSet<()>, execution_id: &ExecutionId) {
        if tokio::time::timeout(self.settings.kill_grace, join_readers(readers))
            .await
            .is_err()
        {
            warn!(execution_id = %execution_id, "output still open after kill; abandoning readers");
            readers.abort_all();
            join_readers(readers).await;
        }
    }

    fn announce(&self, execution: &Execution, level: LogLevel, content: String) {
        self.live.publish(LogMessage::new(
            Some(execution.id.clone()),
            execution.task_id.clone(),
            self.clock.now(),
            level,
            content,
        ));
    }
}

/// Substitute `{env}` and `{script}` in every argument.
pub fn render_command(template: &[String], task: &Task) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{env}", &task.env).replace("{script}", &task.script_path))
        .collect()
}

#[derive(Clone)]
struct StreamContext {
    execution_id: ExecutionId,
    task_id: TaskId,
    clock: SharedClock,
    live: LiveLog,
    max_line_bytes: usize,
    strip_ansi: bool,
}

async fn drain<R>(stream: R, level: LogLevel, ctx: StreamContext, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let reader = BufReader::with_capacity(READ_BUFFER_BYTES, stream);
    let mut lines = LineReader::new(reader, ctx.max_line_bytes, ctx.strip_ansi);
    loop {
        match lines.next_line().await {
            Ok(Some(content)) => {
                let message = LogMessage::new(
                    Some(ctx.execution_id.clone()),
                    ctx.task_id.clone(),
                    ctx.clock.now(),
                    level,
                    content,
                );
                ctx.live.publish(message.clone());
                sink.push(message.into());
            }
            Ok(None) => break,
            Err(e) => {
                warn!(execution_id = %ctx.execution_id, stream = %level, "read error: {e}");
                break;
            }
        }
    }
    debug!(execution_id = %ctx.execution_id, stream = %level, "stream drained");
}

async fn join_readers(readers: &mut JoinSet<()>) {
    while let Some(joined) = readers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!("stream reader panicked: {e}");
            }
        }
    }
}

fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        // Negative pid signals the whole process group set up at spawn.
        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .output();
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill after group kill: {e}");
    }
}
