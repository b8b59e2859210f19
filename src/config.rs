//! Configuration related structures

use anyhow::{Context, Result};
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Builder, CopyGetters, Deserialize, Getters, Parser, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[clap(
    name = "hci-agent",
    about = "Build execution core for a Nix based CI agent"
)]
/// Agent configuration from command line and environment.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("HCI_LOG_LEVEL"),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the agent
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(
        default_value("https://ci.example.com"),
        env("HCI_API_URL"),
        long("api-url"),
        value_name("URL")
    )]
    /// Base URL of the CI API
    api_url: String,

    #[get = "pub"]
    #[clap(
        default_value("hci-worker"),
        env("HCI_WORKER_BINARY"),
        long("worker-binary"),
        value_name("PATH")
    )]
    /// Path to the worker executable
    worker_binary: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("task.json"),
        env("HCI_TASK_FILE"),
        long("task-file"),
        value_name("PATH")
    )]
    /// JSON file describing the build task to run
    task_file: PathBuf,

    #[get_copy = "pub"]
    #[clap(
        default_value("4096"),
        env("HCI_LOG_BUS_CAPACITY"),
        long("log-bus-capacity"),
        value_name("ENTRIES")
    )]
    /// Bound of the in-process build log queue
    log_bus_capacity: usize,

    #[get_copy = "pub"]
    #[clap(
        default_value("4"),
        env("HCI_CACHE_PUSH_PARALLELISM"),
        long("cache-push-parallelism"),
        value_name("UPLOADS")
    )]
    /// Concurrent uploads per push cache
    cache_push_parallelism: usize,

    #[get_copy = "pub"]
    #[clap(
        default_value("36000"),
        env("HCI_BUILD_TIMEOUT"),
        long("build-timeout"),
        value_name("SECONDS")
    )]
    /// Wall clock budget of one build in seconds
    build_timeout_secs: u64,

    #[get_copy = "pub"]
    #[clap(
        default_value("1800"),
        env("HCI_SILENCE_TIMEOUT"),
        long("silence-timeout"),
        value_name("SECONDS")
    )]
    /// Maximum accepted quiet time on worker output in seconds
    silence_timeout_secs: u64,

    #[get = "pub"]
    #[clap(long("extra-nix-option"), value_name("OPT"))]
    /// Extra Nix options handed to the worker, may be given multiple times
    extra_nix_options: Vec<String>,
}

impl Config {
    /// Wall clock budget of one build.
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs())
    }

    /// Maximum accepted quiet time on worker output.
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs())
    }

    /// The worker's single argument: the serialised extra option list.
    pub fn options_arg(&self) -> Result<String> {
        serde_json::to_string(self.extra_nix_options()).context("serialise extra nix options")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LevelFilter::Info,
            api_url: "https://ci.example.com".into(),
            worker_binary: "hci-worker".into(),
            task_file: "task.json".into(),
            log_bus_capacity: 4096,
            cache_push_parallelism: 4,
            build_timeout_secs: 36_000,
            silence_timeout_secs: 1_800,
            extra_nix_options: Vec::new(),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.log_bus_capacity(), 4096);
        assert_eq!(c.cache_push_parallelism(), 4);
        assert_eq!(c.build_timeout(), Duration::from_secs(36_000));
        assert_eq!(c.silence_timeout(), Duration::from_secs(1_800));
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .api_url("https://ci.internal")
            .worker_binary("/usr/libexec/hci-worker")
            .log_bus_capacity(16usize)
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.api_url(), "https://ci.internal");
        assert_eq!(
            &c.worker_binary().display().to_string(),
            "/usr/libexec/hci-worker"
        );
        assert_eq!(c.log_bus_capacity(), 16);
        Ok(())
    }

    #[test]
    fn options_arg_empty_list() -> Result<()> {
        let c = Config::default();
        assert_eq!(c.options_arg()?, "[]");
        Ok(())
    }

    #[test]
    fn options_arg_with_options() -> Result<()> {
        let c = ConfigBuilder::default()
            .extra_nix_options(vec!["--option sandbox true".to_string()])
            .build()?;
        assert_eq!(c.options_arg()?, "[\"--option sandbox true\"]");
        Ok(())
    }
}
