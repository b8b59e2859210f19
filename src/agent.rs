//! Agent wiring: logging, component construction and signal handling
//! around one build task.

use crate::api::{BuildApi, HttpApiBuilder, ReporterBuilder};
use crate::cache::CachePusherBuilder;
use crate::config::Config;
use crate::nix::{NixStoreBuilder, OutputInspectorBuilder};
use crate::runner::TaskRunnerBuilder;
use crate::task::{BuildTask, TaskStatus};
use crate::worker::WorkerSupervisorBuilder;
use anyhow::{Context, Result};
use log::{error, info};
use std::env;
use std::sync::Arc;
use tokio::fs;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Agent is the main instance executing build tasks.
pub struct Agent {
    config: Config,
}

impl Agent {
    /// Create a new agent instance.
    pub fn new(config: Config) -> Self {
        Agent { config }
    }

    /// Run the task described by the configured task file to completion.
    pub async fn run(self) -> Result<TaskStatus> {
        self.set_logging_verbosity()
            .context("set logging verbosity")?;

        let task = self.load_task().await?;
        self.run_task(task).await
    }

    /// Run one build task, cancelling it on SIGINT or SIGTERM.
    pub async fn run_task(&self, task: BuildTask) -> Result<TaskStatus> {
        let api: Arc<dyn BuildApi> = Arc::new(
            HttpApiBuilder::default()
                .base_url(self.config.api_url().clone())
                .build()
                .context("assemble API client")?,
        );
        let runner = TaskRunnerBuilder::default()
            .reporter(
                ReporterBuilder::default()
                    .api(api)
                    .build()
                    .context("assemble reporter")?,
            )
            .inspector(
                OutputInspectorBuilder::default()
                    .store(NixStoreBuilder::default().build().context("assemble nix store")?)
                    .build()
                    .context("assemble output inspector")?,
            )
            .pusher(
                CachePusherBuilder::default()
                    .parallelism(self.config.cache_push_parallelism())
                    .build()
                    .context("assemble cache pusher")?,
            )
            .supervisor(
                WorkerSupervisorBuilder::default()
                    .binary(self.config.worker_binary())
                    .options_arg(self.config.options_arg()?)
                    .wall_timeout(self.config.build_timeout())
                    .silence_timeout(self.config.silence_timeout())
                    .build()
                    .context("assemble worker supervisor")?,
            )
            .log_bus_capacity(self.config.log_bus_capacity())
            .build()
            .context("assemble task runner")?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        let run = runner.run(&task, cancel_rx);
        tokio::pin!(run);
        let status = loop {
            tokio::select! {
                status = &mut run => break status,
                _ = shutdown_interrupt.recv() => {
                    info!("Got interrupt signal, cancelling build");
                    let _ = cancel_tx.send(true);
                }
                _ = shutdown_terminate.recv() => {
                    info!("Got termination signal, cancelling build");
                    let _ = cancel_tx.send(true);
                }
            }
        };

        match &status {
            TaskStatus::Successful => {}
            TaskStatus::Terminated => error!("hci: build failed"),
            TaskStatus::Exceptional(reason) => error!("hci: {}", reason),
        }
        Ok(status)
    }

    async fn load_task(&self) -> Result<BuildTask> {
        let path = self.config.task_file();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("read task file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decode task file {}", path.display()))
    }

    /// Initialize the logger and set the verbosity to the provided level.
    fn set_logging_verbosity(&self) -> Result<()> {
        env::set_var(
            "RUST_LOG",
            format!("hci_agent={}", self.config.log_level()),
        );
        env_logger::try_init().context("init env logger")
    }
}
