//! Inspection of realised derivation outputs.

use super::NixStore;
use crate::error::ProtocolError;
use crate::task::{OutputInfo, OutputInfoBuilder};
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::Getters;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Builder, Clone, Debug, Eq, Getters, PartialEq)]
#[builder(pattern = "owned", setter(into))]
/// One output a derivation declares, before inspection.
pub struct DeclaredOutput {
    #[get = "pub"]
    /// Name of the output, for example `out` or `dev`.
    name: String,

    #[get = "pub"]
    /// Store path the output realises to.
    path: String,
}

#[derive(Builder, Clone, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Queries size and hash for the outputs of a realised derivation.
pub struct OutputInspector {
    #[get]
    /// The store the queries run against.
    store: NixStore,
}

impl OutputInspector {
    /// The outputs a derivation declares, named by the store path naming
    /// convention: `<hash>-<drvname>` is `out`, `<hash>-<drvname>-<output>`
    /// carries its output suffix.
    pub async fn declared_outputs(&self, drv_path: &str) -> Result<Vec<DeclaredOutput>> {
        let drv_name = derivation_name(drv_path)?;
        let paths = self.store().query_outputs(drv_path).await?;
        let mut outputs = Vec::with_capacity(paths.len());
        for path in paths {
            let name = output_name(&drv_name, &path)?;
            outputs.push(DeclaredOutput { name, path });
        }
        Ok(outputs)
    }

    /// Query size and hash for every declared output. The result has one
    /// entry per output or the call fails as a whole.
    pub async fn inspect(
        &self,
        deriver: &str,
        outputs: &[DeclaredOutput],
    ) -> Result<BTreeMap<String, OutputInfo>> {
        let mut infos = BTreeMap::new();
        for output in outputs {
            let size = self.store().query_size(output.path()).await?;
            let hash = self.store().query_hash(output.path()).await?;
            let info = OutputInfoBuilder::default()
                .deriver(deriver)
                .name(output.name().clone())
                .path(output.path().clone())
                .hash(hash)
                .size(size)
                .build()
                .with_context(|| format!("assemble output info for {}", output.name()))?;
            infos.insert(output.name().clone(), info);
        }
        Ok(infos)
    }
}

/// The package name of a derivation path, `hello-1.0` for
/// `/nix/store/<hash>-hello-1.0.drv`.
fn derivation_name(drv_path: &str) -> Result<String> {
    let base = store_path_name(drv_path)?;
    let name = base
        .strip_suffix(".drv")
        .ok_or_else(|| ProtocolError::NixOutput(format!("not a derivation path: {}", drv_path)))?;
    Ok(name.to_string())
}

/// Derive the output name of a realised path relative to its derivation.
fn output_name(drv_name: &str, output_path: &str) -> Result<String> {
    let base = store_path_name(output_path)?;
    if base == drv_name {
        return Ok("out".to_string());
    }
    match base.strip_prefix(&format!("{}-", drv_name)) {
        Some(suffix) if !suffix.is_empty() => Ok(suffix.to_string()),
        _ => Err(ProtocolError::NixOutput(format!(
            "output path {} does not match derivation name {}",
            output_path, drv_name
        ))
        .into()),
    }
}

/// Strip the `/nix/store/<hash>-` prefix of a store path.
fn store_path_name(path: &str) -> Result<String> {
    let base = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ProtocolError::NixOutput(format!("not a store path: {}", path)))?;
    let name = base
        .splitn(2, '-')
        .nth(1)
        .ok_or_else(|| ProtocolError::NixOutput(format!("store path without name: {}", path)))?;
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{scripted_store, ScriptedExecCommand};
    use super::super::Operation;
    use super::*;

    const DRV: &str = "/nix/store/zzz-hello-1.0.drv";
    const OUT: &str = "/nix/store/bbb-hello-1.0";
    const DEV: &str = "/nix/store/ccc-hello-1.0-dev";

    fn inspector(exec: ScriptedExecCommand) -> OutputInspector {
        OutputInspectorBuilder::default()
            .store(scripted_store(exec))
            .build()
            .expect("output inspector")
    }

    #[test]
    fn output_name_success() -> Result<()> {
        assert_eq!(output_name("hello-1.0", OUT)?, "out");
        assert_eq!(output_name("hello-1.0", DEV)?, "dev");
        Ok(())
    }

    #[test]
    fn output_name_failure_foreign_path() {
        assert!(output_name("hello-1.0", "/nix/store/ddd-other").is_err());
    }

    #[test]
    fn derivation_name_success() -> Result<()> {
        assert_eq!(derivation_name(DRV)?, "hello-1.0");
        Ok(())
    }

    #[test]
    fn derivation_name_failure_not_a_drv() {
        assert!(derivation_name(OUT).is_err());
    }

    #[tokio::test]
    async fn declared_outputs_success() -> Result<()> {
        let exec = ScriptedExecCommand::default().reply(
            &Operation::QueryOutputs(DRV.into()),
            0,
            &format!("{}\n{}\n", OUT, DEV),
        );

        let outputs = inspector(exec).declared_outputs(DRV).await?;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].name(), "out");
        assert_eq!(outputs[0].path(), OUT);
        assert_eq!(outputs[1].name(), "dev");
        Ok(())
    }

    #[tokio::test]
    async fn inspect_success() -> Result<()> {
        let exec = ScriptedExecCommand::default()
            .reply(&Operation::QuerySize(OUT.into()), 0, "1024\n")
            .reply(&Operation::QueryHash(OUT.into()), 0, "sha256:abcd\n");
        let outputs = vec![DeclaredOutputBuilder::default()
            .name("out")
            .path(OUT)
            .build()?];

        let infos = inspector(exec).inspect(DRV, &outputs).await?;
        assert_eq!(infos.len(), 1);
        let info = infos.get("out").expect("out entry");
        assert_eq!(info.size(), 1024);
        assert_eq!(info.hash(), "sha256:abcd");
        assert_eq!(info.deriver(), DRV);
        Ok(())
    }

    #[tokio::test]
    async fn inspect_failure_atomic_on_missing_path() {
        // The second output has no scripted reply, so its query fails and no
        // partial result escapes.
        let exec = ScriptedExecCommand::default()
            .reply(&Operation::QuerySize(OUT.into()), 0, "1024\n")
            .reply(&Operation::QueryHash(OUT.into()), 0, "sha256:abcd\n");
        let outputs = vec![
            DeclaredOutputBuilder::default()
                .name("out")
                .path(OUT)
                .build()
                .expect("declared output"),
            DeclaredOutputBuilder::default()
                .name("dev")
                .path(DEV)
                .build()
                .expect("declared output"),
        ];

        assert!(inspector(exec).inspect(DRV, &outputs).await.is_err());
    }
}
