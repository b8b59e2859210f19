//! Interface to the `nix-store` command line tool.

mod outputs;

pub use outputs::{DeclaredOutput, OutputInspector, OutputInspectorBuilder};

use crate::error::ProtocolError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{Getters, Setters};
use std::{
    fmt::{self, Debug},
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};
use strum::AsRefStr;
use tokio::process::Command;

#[derive(Builder, Clone, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// NixStore is the main structure to be used when interacting with the Nix
/// store via its command line interface.
pub struct NixStore {
    #[getset(get, set = "pub(crate)")]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// The executor for nix-store
    exec: Box<dyn ExecCommand>,

    #[get]
    #[builder(default = "PathBuf::from(\"nix-store\")")]
    /// Path to the nix-store binary
    binary: PathBuf,
}

impl NixStore {
    /// Run nix-store with the provided operation and return the output if
    /// the command execution succeeds. This can still mean that nix-store
    /// itself failed, which can be verified via the exit status of the
    /// output.
    pub async fn run(&self, operation: &Operation) -> Result<Output> {
        self.exec()
            .run_output(self.binary(), &operation.build_cmd()[..])
            .await
    }

    /// Build a derivation and return its realised output paths.
    pub async fn realise(
        &self,
        drv_path: &str,
        timeout: Duration,
        max_silent: Duration,
    ) -> Result<Vec<String>> {
        let output = self
            .run(&Operation::Realise {
                drv_path: drv_path.into(),
                timeout,
                max_silent,
            })
            .await?;
        if !output.status.success() {
            bail!(
                "nix-store --realise exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        Self::stdout_lines(&output)
    }

    /// Size in bytes of a valid store path.
    pub async fn query_size(&self, path: &str) -> Result<u64> {
        let line = self
            .query_line(&Operation::QuerySize(path.into()))
            .await
            .with_context(|| format!("query size of {}", path))?;
        line.parse::<u64>()
            .map_err(|_| ProtocolError::NixOutput(format!("not a size: {:?}", line)).into())
    }

    /// Content hash of a valid store path, treated as opaque.
    pub async fn query_hash(&self, path: &str) -> Result<String> {
        let line = self
            .query_line(&Operation::QueryHash(path.into()))
            .await
            .with_context(|| format!("query hash of {}", path))?;
        if line.is_empty() {
            return Err(ProtocolError::NixOutput("empty hash".into()).into());
        }
        Ok(line)
    }

    /// Output paths a derivation declares, in declaration order.
    pub async fn query_outputs(&self, drv_path: &str) -> Result<Vec<String>> {
        let output = self.run(&Operation::QueryOutputs(drv_path.into())).await?;
        if !output.status.success() {
            bail!(
                "nix-store --query --outputs exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        Self::stdout_lines(&output)
    }

    async fn query_line(&self, operation: &Operation) -> Result<String> {
        let output = self.run(operation).await?;
        if !output.status.success() {
            bail!(
                "nix-store exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        let stdout = String::from_utf8(output.stdout).context("non UTF-8 nix-store output")?;
        Ok(stdout.trim().to_string())
    }

    fn stdout_lines(output: &Output) -> Result<Vec<String>> {
        let stdout =
            String::from_utf8(output.stdout.clone()).context("non UTF-8 nix-store output")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

#[derive(Clone, Default, Debug)]
/// DefaultExecCommand is a wrapper which can be used to execute nix-store in
/// a standard way.
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

#[async_trait]
pub(crate) trait ExecCommand: Debug + DynClone + Send + Sync {
    /// Run a command and return its `Output`.
    async fn run_output(&self, binary: &Path, args: &[String]) -> Result<Output> {
        Command::new(binary)
            .args(args)
            .output()
            .await
            .context("run nix-store")
    }
}

clone_trait_object!(ExecCommand);

#[derive(AsRefStr, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Command line flags understood by nix-store.
enum Flag {
    Realise,
    Query,
    Size,
    Hash,
    Outputs,
    Timeout,
    MaxSilentTime,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "--{}", self.as_ref())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
/// Store operations invoked by the build core.
pub enum Operation {
    /// Build a derivation under Nix's own locking.
    Realise {
        drv_path: String,
        timeout: Duration,
        max_silent: Duration,
    },
    /// Print the size in bytes of a valid store path.
    QuerySize(String),
    /// Print the content hash of a valid store path.
    QueryHash(String),
    /// Print the output paths a derivation declares.
    QueryOutputs(String),
}

impl Operation {
    /// Build a vec of `[flags..][path]`.
    fn build_cmd(&self) -> Vec<String> {
        use Operation::*;
        match self {
            Realise {
                drv_path,
                timeout,
                max_silent,
            } => vec![
                Flag::Realise.to_string(),
                Flag::Timeout.to_string(),
                timeout.as_secs().to_string(),
                Flag::MaxSilentTime.to_string(),
                max_silent.as_secs().to_string(),
                drv_path.clone(),
            ],
            QuerySize(path) => vec![
                Flag::Query.to_string(),
                Flag::Size.to_string(),
                path.clone(),
            ],
            QueryHash(path) => vec![
                Flag::Query.to_string(),
                Flag::Hash.to_string(),
                path.clone(),
            ],
            QueryOutputs(path) => vec![
                Flag::Query.to_string(),
                Flag::Outputs.to_string(),
                path.clone(),
            ],
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::{os::unix::process::ExitStatusExt, process::ExitStatus};

    #[derive(Clone, Debug, Default)]
    /// Answers each command line with a scripted output, keyed by the joined
    /// argument list.
    pub(crate) struct ScriptedExecCommand {
        replies: HashMap<String, (i32, Vec<u8>)>,
    }

    impl ScriptedExecCommand {
        pub(crate) fn reply(mut self, operation: &Operation, code: i32, stdout: &str) -> Self {
            self.replies.insert(
                operation.build_cmd().join(" "),
                (code, stdout.as_bytes().to_vec()),
            );
            self
        }
    }

    #[async_trait]
    impl ExecCommand for ScriptedExecCommand {
        async fn run_output(&self, _binary: &Path, args: &[String]) -> Result<Output> {
            let (code, stdout) = self
                .replies
                .get(&args.join(" "))
                .cloned()
                .unwrap_or((1, Vec::new()));
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout,
                stderr: Vec::new(),
            })
        }
    }

    pub(crate) fn scripted_store(exec: ScriptedExecCommand) -> NixStore {
        let mut store = NixStoreBuilder::default().build().expect("nix store");
        store.set_exec(Box::new(exec));
        store
    }

    #[test]
    fn flag_success_to_string() {
        assert_eq!(&Flag::Realise.to_string(), "--realise");
        assert_eq!(&Flag::MaxSilentTime.to_string(), "--max-silent-time");
        assert_eq!(&Flag::Size.to_string(), "--size");
    }

    #[test]
    fn operation_success_build_cmd() {
        let cmd = Operation::Realise {
            drv_path: "/nix/store/aaa-hello.drv".into(),
            timeout: Duration::from_secs(10),
            max_silent: Duration::from_secs(5),
        }
        .build_cmd();
        assert_eq!(
            cmd,
            vec![
                "--realise",
                "--timeout",
                "10",
                "--max-silent-time",
                "5",
                "/nix/store/aaa-hello.drv"
            ]
        );

        assert_eq!(
            Operation::QuerySize("/nix/store/bbb-hello".into()).build_cmd(),
            vec!["--query", "--size", "/nix/store/bbb-hello"]
        );
    }

    #[tokio::test]
    async fn nix_store_success_run() -> Result<()> {
        let store = NixStoreBuilder::default()
            .binary(which::which("echo")?)
            .build()?;
        let output = store
            .run(&Operation::QueryHash("/nix/store/bbb-hello".into()))
            .await?;
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8(output.stdout)?,
            "--query --hash /nix/store/bbb-hello\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn nix_store_success_query_size() -> Result<()> {
        let operation = Operation::QuerySize("/nix/store/bbb-hello".into());
        let store = scripted_store(ScriptedExecCommand::default().reply(&operation, 0, " 1024\n"));

        assert_eq!(store.query_size("/nix/store/bbb-hello").await?, 1024);
        Ok(())
    }

    #[tokio::test]
    async fn nix_store_failure_unparseable_size() {
        let operation = Operation::QuerySize("/nix/store/bbb-hello".into());
        let store =
            scripted_store(ScriptedExecCommand::default().reply(&operation, 0, "not-a-number\n"));

        assert!(store.query_size("/nix/store/bbb-hello").await.is_err());
    }

    #[tokio::test]
    async fn nix_store_success_query_hash() -> Result<()> {
        let operation = Operation::QueryHash("/nix/store/bbb-hello".into());
        let store =
            scripted_store(ScriptedExecCommand::default().reply(&operation, 0, "sha256:abcd\n"));

        assert_eq!(store.query_hash("/nix/store/bbb-hello").await?, "sha256:abcd");
        Ok(())
    }

    #[tokio::test]
    async fn nix_store_failure_query_exit_code() {
        let operation = Operation::QueryHash("/nix/store/bbb-hello".into());
        let store = scripted_store(ScriptedExecCommand::default().reply(&operation, 1, ""));

        assert!(store.query_hash("/nix/store/bbb-hello").await.is_err());
    }

    #[tokio::test]
    async fn nix_store_success_realise() -> Result<()> {
        let operation = Operation::Realise {
            drv_path: "/nix/store/aaa-hello.drv".into(),
            timeout: Duration::from_secs(10),
            max_silent: Duration::from_secs(5),
        };
        let store = scripted_store(
            ScriptedExecCommand::default().reply(&operation, 0, "/nix/store/bbb-hello\n"),
        );

        let paths = store
            .realise(
                "/nix/store/aaa-hello.drv",
                Duration::from_secs(10),
                Duration::from_secs(5),
            )
            .await?;
        assert_eq!(paths, vec!["/nix/store/bbb-hello"]);
        Ok(())
    }

    #[tokio::test]
    async fn nix_store_success_query_outputs() -> Result<()> {
        let operation = Operation::QueryOutputs("/nix/store/aaa-hello.drv".into());
        let store = scripted_store(ScriptedExecCommand::default().reply(
            &operation,
            0,
            "/nix/store/bbb-hello\n/nix/store/ccc-hello-dev\n",
        ));

        let outputs = store.query_outputs("/nix/store/aaa-hello.drv").await?;
        assert_eq!(
            outputs,
            vec!["/nix/store/bbb-hello", "/nix/store/ccc-hello-dev"]
        );
        Ok(())
    }
}
