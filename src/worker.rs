//! Worker subprocess supervision and framed IPC pumps.
//!
//! The supervisor owns the worker's three standard streams exclusively.
//! Commands are framed onto stdin, events decoded off stdout, stderr is
//! forwarded line-wise for human diagnostics. Log-bearing events go
//! straight to the logger bus; structural events are handed to the caller
//! through a bounded channel.

use crate::error::chain;
use crate::logbus::LogBus;
use crate::protocol::{read_frame, write_frame, Command as IpcCommand, Event};
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time;

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Spawns and supervises one worker subprocess per build.
pub struct WorkerSupervisor {
    #[get]
    /// Path to the worker executable.
    binary: PathBuf,

    #[get]
    #[builder(default = "\"[]\".to_string()")]
    /// Serialised extra Nix options, handed to the worker as its single
    /// argument.
    options_arg: String,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(36_000)")]
    /// Wall clock budget of one build.
    wall_timeout: Duration,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(1_800)")]
    /// Maximum accepted quiet time on worker stdout/stderr.
    silence_timeout: Duration,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(10)")]
    /// Grace between SIGTERM and SIGKILL.
    kill_grace: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// How a supervised worker ended.
pub enum WorkerExit {
    /// The worker exited on its own.
    Exited(ExitStatus),
    /// The supervisor had to kill the worker.
    Killed(KillReason),
}

impl WorkerExit {
    /// Whether the worker exited on its own with status zero.
    pub fn clean(&self) -> bool {
        matches!(self, WorkerExit::Exited(status) if status.success())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Why the supervisor killed the worker.
pub enum KillReason {
    /// External cancellation of the task.
    Cancelled,
    /// No bytes on stdout or stderr within the silence timeout.
    Silence,
    /// The wall clock budget expired.
    Wall,
    /// The worker reported a fatal exception or broke the protocol.
    Exception,
}

impl WorkerSupervisor {
    /// Spawn the worker with a sanitised environment and pump its streams
    /// until it exits or has to be killed. The exit is returned only after
    /// the pumps are drained.
    pub async fn supervise(
        &self,
        commands: mpsc::Receiver<Option<IpcCommand>>,
        events: mpsc::Sender<Event>,
        stderr_lines: mpsc::Sender<String>,
        bus: Arc<LogBus>,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkerExit> {
        let mut child = Command::new(self.binary())
            .arg(self.options_arg())
            .env_clear()
            .env("NIX_PATH", "")
            .current_dir("/")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn worker {}", self.binary().display()))?;

        let stdin = child.stdin.take().context("worker stdin handle")?;
        let stdout = child.stdout.take().context("worker stdout handle")?;
        let stderr = child.stderr.take().context("worker stderr handle")?;

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (abort_tx, abort_rx) = mpsc::channel::<KillReason>(1);

        let command_pump = tokio::spawn(pump_commands(commands, stdin));
        let event_pump = tokio::spawn(pump_events(
            stdout,
            events,
            bus,
            last_activity.clone(),
            abort_tx,
        ));
        let stderr_pump = tokio::spawn(pump_stderr(
            stderr,
            stderr_lines,
            last_activity.clone(),
        ));

        let exit = self
            .await_exit(&mut child, cancel, abort_rx, last_activity)
            .await?;

        // The command pump may still wait on its channel; the others end at
        // pipe EOF. Bound the drain in case a grandchild kept a pipe open.
        command_pump.abort();
        let _ = command_pump.await;
        for pump in vec![event_pump, stderr_pump] {
            if time::timeout(self.kill_grace(), pump).await.is_err() {
                warn!("worker pump still busy after exit, dropping it");
            }
        }

        Ok(exit)
    }

    async fn await_exit(
        &self,
        child: &mut Child,
        mut cancel: watch::Receiver<bool>,
        mut abort_rx: mpsc::Receiver<KillReason>,
        last_activity: Arc<Mutex<Instant>>,
    ) -> Result<WorkerExit> {
        if *cancel.borrow() {
            self.terminate(child, KillReason::Cancelled).await?;
            return Ok(WorkerExit::Killed(KillReason::Cancelled));
        }

        let wall = time::sleep(self.wall_timeout());
        tokio::pin!(wall);
        let mut silence_tick =
            time::interval(self.silence_timeout().min(Duration::from_secs(1)).max(Duration::from_millis(10)));
        let mut cancel_alive = true;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(WorkerExit::Exited(status.context("reap worker")?));
                }
                changed = cancel.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            self.terminate(child, KillReason::Cancelled).await?;
                            return Ok(WorkerExit::Killed(KillReason::Cancelled));
                        }
                        Ok(()) => {}
                        Err(_) => cancel_alive = false,
                    }
                }
                Some(reason) = abort_rx.recv() => {
                    self.terminate(child, reason).await?;
                    return Ok(WorkerExit::Killed(reason));
                }
                _ = silence_tick.tick() => {
                    let quiet = last_activity.lock().expect("last activity lock").elapsed();
                    if quiet >= self.silence_timeout() {
                        self.terminate(child, KillReason::Silence).await?;
                        return Ok(WorkerExit::Killed(KillReason::Silence));
                    }
                }
                _ = &mut wall => {
                    self.terminate(child, KillReason::Wall).await?;
                    return Ok(WorkerExit::Killed(KillReason::Wall));
                }
            }
        }
    }

    /// SIGTERM, a grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, reason: KillReason) -> Result<()> {
        warn!("terminating worker ({:?})", reason);
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to worker failed: {}", e);
            }
        }
        if time::timeout(self.kill_grace(), child.wait()).await.is_err() {
            child.kill().await.context("SIGKILL worker")?;
        }
        Ok(())
    }
}

/// Frame commands onto worker stdin. A `None` sentinel closes the pipe.
async fn pump_commands(mut commands: mpsc::Receiver<Option<IpcCommand>>, mut stdin: ChildStdin) {
    while let Some(message) = commands.recv().await {
        match message {
            Some(command) => {
                if let Err(e) = write_frame(&mut stdin, &command.encode()).await {
                    warn!("writing command to worker failed: {}", chain(e));
                    break;
                }
            }
            None => break,
        }
    }
    drop(stdin);
}

/// Decode frames off worker stdout. Log-bearing events feed the bus,
/// structural events go to the caller. `BuildResult` is terminal; anything
/// structural after it is ignored with a warning.
async fn pump_events(
    stdout: ChildStdout,
    events: mpsc::Sender<Event>,
    bus: Arc<LogBus>,
    last_activity: Arc<Mutex<Instant>>,
    abort: mpsc::Sender<KillReason>,
) {
    let mut reader = BufReader::new(stdout);
    let mut seen_result = false;

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                let reason = chain(e);
                warn!("reading worker event frame failed: {}", reason);
                let _ = events
                    .send(Event::Exception(format!("protocol error: {}", reason)))
                    .await;
                let _ = abort.try_send(KillReason::Exception);
                break;
            }
        };
        touch(&last_activity);

        match Event::decode(&frame) {
            Ok(Event::Log(entry)) => bus.push(entry),
            Ok(event @ Event::Exception(_)) => {
                let _ = events.send(event).await;
                let _ = abort.try_send(KillReason::Exception);
                break;
            }
            Ok(event) => {
                if seen_result {
                    warn!("structural event after BuildResult ignored: {:?}", event);
                    continue;
                }
                seen_result = true;
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let reason = chain(e);
                warn!("decoding worker event failed: {}", reason);
                let _ = events
                    .send(Event::Exception(format!("protocol error: {}", reason)))
                    .await;
                let _ = abort.try_send(KillReason::Exception);
                break;
            }
        }
    }
}

/// Forward worker stderr line by line for human diagnostics. Not part of
/// the remote build log.
async fn pump_stderr(
    stderr: ChildStderr,
    lines: mpsc::Sender<String>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut reader = BufReader::new(stderr).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                touch(&last_activity);
                debug!("worker stderr: {}", line);
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("reading worker stderr failed: {}", e);
                break;
            }
        }
    }
}

fn touch(last_activity: &Arc<Mutex<Instant>>) {
    *last_activity.lock().expect("last activity lock") = Instant::now();
}
