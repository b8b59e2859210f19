//! Pushing realised store paths to binary caches.
//!
//! The pusher does not de-duplicate: paths already present are expected to
//! be skipped by the cache backend. A path that ultimately fails is logged
//! and reported back as a partial failure; the build itself stays
//! authoritative.

use crate::api::ApiError;
use crate::error::chain;
use crate::retry::{with_retries, RetryPolicy};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use futures::stream::{self, StreamExt};
use getset::{CopyGetters, Getters, Setters};
use log::{debug, warn};
use std::fmt::Debug;
use tokio::process::Command;

#[async_trait]
/// Transport used to mirror one store path into a cache.
pub trait CacheBackend: Debug + DynClone + Send + Sync {
    /// Push a single store path to the cache, skipping it if already present.
    async fn push_path(&self, cache: &str, path: &str) -> Result<()>;
}

clone_trait_object!(CacheBackend);

#[derive(Clone, Debug, Default)]
/// Default backend shelling out to `nix copy`, treating the cache
/// identifier as the destination store URI.
pub struct NixCopy;

#[async_trait]
impl CacheBackend for NixCopy {
    async fn push_path(&self, cache: &str, path: &str) -> Result<()> {
        let output = Command::new("nix")
            .args(&["copy", "--to", cache, path])
            .output()
            .await
            .context("run nix copy")?;
        if !output.status.success() {
            bail!(
                "nix copy to {} exited with {}: {}",
                cache,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        Ok(())
    }
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// Pushes a set of store paths to one cache with bounded parallelism and
/// per-path retries.
pub struct CachePusher {
    #[getset(get, set = "pub(crate)")]
    #[builder(private, default = "Box::new(NixCopy)")]
    /// The transport performing individual pushes.
    backend: Box<dyn CacheBackend>,

    #[get_copy = "pub"]
    #[builder(default = "4")]
    /// Number of concurrent uploads per cache.
    parallelism: usize,

    #[get]
    #[builder(default)]
    /// Backoff parameters for each path.
    policy: RetryPolicy,
}

impl CachePusher {
    /// Push every path to the cache. Returns the paths that still failed
    /// after retries; an empty result means the whole set reached the cache.
    pub async fn push_all(&self, cache: &str, paths: &[String]) -> Vec<String> {
        let failed: Vec<String> = stream::iter(paths)
            .map(|path| async move {
                match self.push_with_retries(cache, path).await {
                    Ok(()) => {
                        debug!("pushed {} to {}", path, cache);
                        None
                    }
                    Err(e) => {
                        warn!("push of {} to {} failed: {}", path, cache, chain(e));
                        Some(path.clone())
                    }
                }
            })
            .buffer_unordered(self.parallelism().max(1))
            .filter_map(|res| async move { res })
            .collect()
            .await;
        failed
    }

    async fn push_with_retries(&self, cache: &str, path: &str) -> Result<()> {
        with_retries(self.policy(), "cache push", || async {
            self.backend()
                .push_path(cache, path)
                .await
                .map_err(|e| ApiError::Transient(chain(e)))
        })
        .await
    }
}
