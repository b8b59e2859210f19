//! Driving one build task from worker spawn to terminal status.
//!
//! The runner walks the task state machine: spawn the worker, send the one
//! `Build` command, collect structural events while streams are pumped,
//! then post-process a successful build (inspect outputs, report them,
//! push caches) or report the failure. Every post-build step returns
//! either its continuation value or the terminal status of the task, so a
//! single terminal status leaves the runner per task.

use crate::api::Reporter;
use crate::cache::CachePusher;
use crate::error::chain;
use crate::logbus::{
    BuildLogger, BusLogger, Level, LogBus, LogShipperBuilder, LOG_SOCKET_PATH,
};
use crate::nix::OutputInspector;
use crate::protocol::{Command, Event, LogSettingsBuilder};
use crate::retry::RetryPolicy;
use crate::task::{BuildEvent, BuildTask, OutputInfo, TaskStatus};
use crate::worker::{KillReason, WorkerExit, WorkerSupervisor};
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Flush threshold for forwarded worker stderr.
const STDERR_CHUNK: usize = 4096;

#[derive(Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Runs build tasks to completion, one at a time.
pub struct TaskRunner {
    #[get]
    /// Event sink towards the CI API.
    reporter: Reporter,

    #[get]
    /// Inspector for realised outputs.
    inspector: OutputInspector,

    #[get]
    /// Pusher mirroring outputs into the active caches.
    pusher: CachePusher,

    #[get]
    /// Supervisor owning the worker subprocess.
    supervisor: WorkerSupervisor,

    #[get_copy = "pub"]
    #[builder(default = "4096")]
    /// Bound of the per-task logger bus.
    log_bus_capacity: usize,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(10)")]
    /// Grace granted to the log shipper to drain at task end.
    shipper_grace: Duration,

    #[get]
    #[builder(default)]
    /// Reconnect backoff of the log shipper.
    shipper_policy: RetryPolicy,

    #[get_copy = "pub"]
    #[builder(default = "true")]
    /// Whether the log shipper connects via TLS. Only tests disable this.
    shipper_tls: bool,
}

/// What the supervised build left behind.
struct BuildOutcome {
    exit: WorkerExit,
    result: Option<bool>,
    exception: Option<String>,
}

impl TaskRunner {
    /// Run the task to its terminal status and report that status to the
    /// API. Exactly one status is produced per task.
    pub async fn run(&self, task: &BuildTask, cancel: watch::Receiver<bool>) -> TaskStatus {
        info!("running build task {}", task.id());
        let status = match self.drive(task, cancel).await {
            Ok(status) => status,
            Err(e) => TaskStatus::Exceptional(chain(e)),
        };

        if let Err(e) = self.reporter().report_task_status(task.id(), &status).await {
            error!("reporting status of task {} failed: {}", task.id(), chain(e));
        }
        info!("task {} finished: {:?}", task.id(), status);
        status
    }

    async fn drive(&self, task: &BuildTask, cancel: watch::Receiver<bool>) -> Result<TaskStatus> {
        let bus = LogBus::new(self.log_bus_capacity());
        let shipper = LogShipperBuilder::default()
            .bus(bus.clone())
            .settings(
                LogSettingsBuilder::default()
                    .token(task.log_token().clone())
                    .path(LOG_SOCKET_PATH)
                    .host(task.log_host().clone())
                    .build()
                    .context("assemble log settings")?,
            )
            .policy(self.shipper_policy().clone())
            .tls(self.shipper_tls())
            .build()
            .context("assemble log shipper")?
            .spawn();
        let logger = BusLogger::new(bus.clone());

        let status = match self.build(task, bus.clone(), cancel).await {
            Ok(outcome) => self.conclude(task, outcome, &logger).await,
            Err(e) => self.fail(task, TaskStatus::Exceptional(chain(e))).await,
        };

        bus.close();
        shipper.shutdown(self.shipper_grace()).await;
        Ok(status)
    }

    /// Spawn the worker, send the single `Build` command and collect the
    /// structural events until the worker is gone.
    async fn build(
        &self,
        task: &BuildTask,
        bus: Arc<LogBus>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BuildOutcome> {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(256);

        command_tx
            .send(Some(self.build_command(task)?))
            .await
            .context("enqueue build command")?;
        command_tx.send(None).await.context("close command stream")?;

        let supervise = self
            .supervisor()
            .supervise(command_rx, event_tx, stderr_tx, bus, cancel);
        tokio::pin!(supervise);

        let mut result = None;
        let mut exception = None;
        let mut stderr_buf = Vec::new();

        let exit = loop {
            tokio::select! {
                exit = &mut supervise => break exit?,
                Some(event) = event_rx.recv() => {
                    Self::collect(event, &mut result, &mut exception);
                }
                Some(line) = stderr_rx.recv() => {
                    stderr_buf.extend_from_slice(line.as_bytes());
                    stderr_buf.push(b'\n');
                    if stderr_buf.len() >= STDERR_CHUNK {
                        self.flush_stderr(task, &mut stderr_buf).await;
                    }
                }
            }
        };

        while let Ok(event) = event_rx.try_recv() {
            Self::collect(event, &mut result, &mut exception);
        }
        while let Ok(line) = stderr_rx.try_recv() {
            stderr_buf.extend_from_slice(line.as_bytes());
            stderr_buf.push(b'\n');
        }
        self.flush_stderr(task, &mut stderr_buf).await;

        Ok(BuildOutcome {
            exit,
            result,
            exception,
        })
    }

    fn collect(event: Event, result: &mut Option<bool>, exception: &mut Option<String>) {
        match event {
            Event::BuildResult(value) => {
                if result.is_none() {
                    *result = Some(value);
                }
            }
            Event::Exception(text) => {
                if exception.is_none() {
                    *exception = Some(text);
                }
            }
            Event::Log(entry) => {
                // Log events are routed to the bus by the pump; one slipping
                // through here would be a supervisor bug.
                warn!("unexpected log entry on structural channel: {:?}", entry);
            }
        }
    }

    fn build_command(&self, task: &BuildTask) -> Result<Command> {
        Ok(Command::Build {
            drv_path: task.derivation_path().clone(),
            input_paths: task.input_paths().clone(),
            log_settings: LogSettingsBuilder::default()
                .token(task.log_token().clone())
                .path(LOG_SOCKET_PATH)
                .host(task.log_host().clone())
                .build()
                .context("assemble worker log settings")?,
        })
    }

    /// Forward buffered worker stderr to the API log. Diagnostics only,
    /// failures do not decide the task.
    async fn flush_stderr(&self, task: &BuildTask, buf: &mut Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let chunk = std::mem::take(buf);
        if let Err(e) = self
            .reporter()
            .write_log(task.id(), task.log_token(), &chunk)
            .await
        {
            warn!("forwarding worker stderr failed: {}", chain(e));
        }
    }

    /// Map the build outcome to its terminal status, post-processing a
    /// successful build.
    async fn conclude(
        &self,
        task: &BuildTask,
        outcome: BuildOutcome,
        logger: &BusLogger,
    ) -> TaskStatus {
        if let Some(text) = outcome.exception {
            return self.fail(task, TaskStatus::Exceptional(text)).await;
        }

        if let WorkerExit::Killed(reason) = outcome.exit {
            return self.fail(task, kill_status(reason)).await;
        }

        match outcome.result {
            None => {
                self.fail(task, TaskStatus::Exceptional("Build did not complete".into()))
                    .await
            }
            Some(false) => self.fail(task, TaskStatus::Terminated).await,
            Some(true) if !outcome.exit.clean() => {
                self.fail(
                    task,
                    TaskStatus::Exceptional(format!("worker exited after result: {:?}", outcome.exit)),
                )
                .await
            }
            Some(true) => match self.postprocess(task, logger).await {
                Ok(status) => status,
                Err(status) => status,
            },
        }
    }

    /// The post-build sequence: inspect outputs, report them, push caches,
    /// close with `Done(true)`. Steps are strictly sequenced; the first
    /// terminal status short-circuits.
    async fn postprocess(
        &self,
        task: &BuildTask,
        logger: &BusLogger,
    ) -> std::result::Result<TaskStatus, TaskStatus> {
        logger.log_msg(Level::Info, "querying realised outputs".to_string());
        let outputs = self.inspect_outputs(task).await?;

        self.emit_output_infos(task, &outputs).await?;
        self.push_outputs(task, &outputs, logger).await?;

        match self
            .reporter()
            .update_build(task.id(), &[BuildEvent::Done { success: true }])
            .await
        {
            Ok(()) => Ok(TaskStatus::Successful),
            Err(e) => Err(TaskStatus::Exceptional(chain(e))),
        }
    }

    /// Query every declared output. A failing query is exceptional: nothing
    /// is pushed and `Done(false)` closes the task.
    async fn inspect_outputs(
        &self,
        task: &BuildTask,
    ) -> std::result::Result<BTreeMap<String, OutputInfo>, TaskStatus> {
        let drv_path = task.derivation_path();
        let declared = match self.inspector().declared_outputs(drv_path).await {
            Ok(declared) => declared,
            Err(e) => return Err(self.fail(task, TaskStatus::Exceptional(chain(e))).await),
        };
        match self.inspector().inspect(drv_path, &declared).await {
            Ok(outputs) => Ok(outputs),
            Err(e) => Err(self.fail(task, TaskStatus::Exceptional(chain(e))).await),
        }
    }

    async fn emit_output_infos(
        &self,
        task: &BuildTask,
        outputs: &BTreeMap<String, OutputInfo>,
    ) -> std::result::Result<(), TaskStatus> {
        let events: Vec<BuildEvent> = outputs
            .values()
            .cloned()
            .map(BuildEvent::OutputInfo)
            .collect();
        match self.reporter().update_build(task.id(), &events).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(task, TaskStatus::Exceptional(chain(e))).await),
        }
    }

    /// Push all output paths to every active cache. Push failures are not
    /// fatal: the build stays authoritative, only the `Pushed` event is
    /// withheld for a cache that missed paths.
    async fn push_outputs(
        &self,
        task: &BuildTask,
        outputs: &BTreeMap<String, OutputInfo>,
        logger: &BusLogger,
    ) -> std::result::Result<(), TaskStatus> {
        let caches = match self.reporter().active_push_caches().await {
            Ok(caches) => caches,
            Err(e) => {
                warn!("listing push caches failed, skipping distribution: {}", chain(e));
                return Ok(());
            }
        };

        let paths: Vec<String> = outputs.values().map(|info| info.path().clone()).collect();
        for cache in caches {
            logger.log_msg(
                Level::Info,
                format!("pushing {} store paths to {}", paths.len(), cache),
            );
            let failed = self.pusher().push_all(&cache, &paths).await;
            if !failed.is_empty() {
                warn!("cache {} missed {} of {} paths", cache, failed.len(), paths.len());
                continue;
            }
            let event = BuildEvent::Pushed {
                cache: cache.clone(),
            };
            if let Err(e) = self.reporter().update_build(task.id(), &[event]).await {
                return Err(self.fail(task, TaskStatus::Exceptional(chain(e))).await);
            }
        }
        Ok(())
    }

    /// Emit `Done(false)` (best effort) and hand back the terminal status.
    async fn fail(&self, task: &BuildTask, status: TaskStatus) -> TaskStatus {
        if let Err(e) = self
            .reporter()
            .update_build(task.id(), &[BuildEvent::Done { success: false }])
            .await
        {
            warn!("emitting Done(false) for task {} failed: {}", task.id(), chain(e));
        }
        status
    }
}

fn kill_status(reason: KillReason) -> TaskStatus {
    match reason {
        KillReason::Cancelled => TaskStatus::Exceptional("build cancelled".into()),
        KillReason::Silence => {
            TaskStatus::Exceptional("build timed out without output".into())
        }
        KillReason::Wall => TaskStatus::Exceptional("build timed out".into()),
        KillReason::Exception => {
            TaskStatus::Exceptional("worker reported an exception".into())
        }
    }
}
