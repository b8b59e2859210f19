//! Build task data model shared between the runner, the API reporter and the
//! output inspector.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

#[derive(Builder, Clone, Debug, Deserialize, Getters, Serialize)]
#[builder(pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
/// BuildTask is the immutable input describing one derivation to realise. It
/// is created by the CI API and consumed exactly once.
pub struct BuildTask {
    #[get = "pub"]
    /// The unique task identifier.
    id: String,

    #[get = "pub"]
    /// Store path of the derivation to realise.
    derivation_path: String,

    #[get = "pub"]
    #[builder(default)]
    /// Output paths of input derivations which are already realised.
    input_paths: Vec<String>,

    #[get = "pub"]
    /// Opaque bearer token for the remote log socket.
    log_token: String,

    #[get = "pub"]
    /// Host of the remote log socket.
    log_host: String,
}

#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Eq, Getters, PartialEq, Serialize)]
#[builder(pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
/// OutputInfo describes one realised output of a derivation. `size` and
/// `hash` reflect the same store path on disk at query time.
pub struct OutputInfo {
    #[get = "pub"]
    /// Store path of the derivation this output belongs to.
    deriver: String,

    #[get = "pub"]
    /// Name of the output, for example `out` or `dev`.
    name: String,

    #[get = "pub"]
    /// Realised store path of the output.
    path: String,

    #[get = "pub"]
    /// Content hash as reported by Nix, treated as opaque.
    hash: String,

    #[get_copy = "pub"]
    /// Size of the output in bytes.
    size: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
/// Terminal outcome of a build task. Every task produces exactly one.
pub enum TaskStatus {
    /// The build succeeded locally, even if distribution partially failed.
    Successful,
    /// The build itself failed.
    Terminated,
    /// The task died without a verdict: protocol error, crash or timeout.
    Exceptional(String),
}

impl TaskStatus {
    /// Whether the status reports a locally successful build.
    pub fn is_successful(&self) -> bool {
        matches!(self, TaskStatus::Successful)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
/// Build events appended to the CI API via `updateBuild`. The server
/// tolerates duplicates, so re-delivery after a retry is safe.
pub enum BuildEvent {
    /// Metadata of one realised output.
    OutputInfo(OutputInfo),
    /// All output paths reached the given cache.
    Pushed {
        /// Identifier of the push cache.
        cache: String,
    },
    /// Terminal event of the task; always emitted last.
    Done {
        /// Whether the build succeeded.
        success: bool,
    },
}
