//! The CI API surface consumed by the build core and the reporter wrapping
//! every call in the default retry policy. All emitted events are additive
//! and the server tolerates duplicates, so re-delivery is safe.

use crate::retry::{with_retries, RetryPolicy};
use crate::task::{BuildEvent, TaskStatus};
use anyhow::Result;
use async_trait::async_trait;
use derive_builder::Builder;
use getset::Getters;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
/// Classification of a failed API call, driving the retry decision.
pub enum ApiError {
    /// Transport failure or server-side 5xx; worth retrying.
    #[error("transient API failure: {0}")]
    Transient(String),

    /// Client-side rejection (4xx) or unusable response; retrying cannot help.
    #[error("permanent API failure: {0}")]
    Permanent(String),
}

#[async_trait]
/// The RPC surface of the CI API used by the build core.
pub trait BuildApi: Debug + Send + Sync {
    /// Append build events to the task. Idempotent on the server side.
    async fn update_build(
        &self,
        task_id: &str,
        events: &[BuildEvent],
    ) -> std::result::Result<(), ApiError>;

    /// Append raw build stderr bytes to the task log.
    async fn write_log(
        &self,
        task_id: &str,
        token: &str,
        bytes: &[u8],
    ) -> std::result::Result<(), ApiError>;

    /// The identifiers of all currently active push caches.
    async fn active_push_caches(&self) -> std::result::Result<Vec<String>, ApiError>;

    /// Report the terminal status of the task.
    async fn report_task_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
    ) -> std::result::Result<(), ApiError>;
}

#[derive(Builder, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// HTTP implementation of [`BuildApi`] against the CI service.
pub struct HttpApi {
    #[get]
    /// Base URL of the CI API.
    base_url: String,

    #[builder(default)]
    client: reqwest::Client,
}

impl HttpApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url().trim_end_matches('/'), path)
    }

    /// Map a response status to an error classification; 5xx is worth a
    /// retry, anything else client-side is not.
    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(ApiError::Transient(format!("http {}: {}", status, body)))
        } else {
            Err(ApiError::Permanent(format!("http {}: {}", status, body)))
        }
    }

    fn transport(err: reqwest::Error) -> ApiError {
        ApiError::Transient(err.to_string())
    }
}

#[async_trait]
impl BuildApi for HttpApi {
    async fn update_build(
        &self,
        task_id: &str,
        events: &[BuildEvent],
    ) -> std::result::Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/tasks/{}/events", task_id)))
            .json(events)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn write_log(
        &self,
        task_id: &str,
        token: &str,
        bytes: &[u8],
    ) -> std::result::Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/tasks/{}/log", task_id)))
            .bearer_auth(token)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn active_push_caches(&self) -> std::result::Result<Vec<String>, ApiError> {
        let response = self
            .client
            .get(self.url("/api/v1/push-caches"))
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("decode push cache list: {}", e)))
    }

    async fn report_task_status(
        &self,
        task_id: &str,
        status: &TaskStatus,
    ) -> std::result::Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/api/v1/tasks/{}/status", task_id)))
            .json(status)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await?;
        Ok(())
    }
}

#[derive(Builder, Clone, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Thin, idempotent event sink: every [`BuildApi`] call goes through the
/// default retry policy. Transient failures never surface to the runner.
pub struct Reporter {
    #[get]
    /// The API implementation calls are delegated to.
    api: Arc<dyn BuildApi>,

    #[get]
    #[builder(default)]
    /// Backoff parameters for every call.
    policy: RetryPolicy,
}

impl Reporter {
    /// Append build events to the task.
    pub async fn update_build(&self, task_id: &str, events: &[BuildEvent]) -> Result<()> {
        with_retries(self.policy(), "updateBuild", || {
            self.api().update_build(task_id, events)
        })
        .await
    }

    /// Append raw build stderr bytes to the task log.
    pub async fn write_log(&self, task_id: &str, token: &str, bytes: &[u8]) -> Result<()> {
        with_retries(self.policy(), "writeLog", || {
            self.api().write_log(task_id, token, bytes)
        })
        .await
    }

    /// The identifiers of all currently active push caches.
    pub async fn active_push_caches(&self) -> Result<Vec<String>> {
        with_retries(self.policy(), "getActivePushCaches", || {
            self.api().active_push_caches()
        })
        .await
    }

    /// Report the terminal status of the task.
    pub async fn report_task_status(&self, task_id: &str, status: &TaskStatus) -> Result<()> {
        with_retries(self.policy(), "reportTaskStatus", || {
            self.api().report_task_status(task_id, status)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::retry::RetryPolicyBuilder;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    /// Records every call and fails `updateBuild` for a configurable number
    /// of leading attempts.
    pub(crate) struct MockApi {
        pub(crate) events: Mutex<Vec<(String, Vec<BuildEvent>)>>,
        pub(crate) log_bytes: Mutex<Vec<u8>>,
        pub(crate) statuses: Mutex<Vec<(String, TaskStatus)>>,
        pub(crate) caches: Vec<String>,
        pub(crate) update_failures: Mutex<u32>,
    }

    impl MockApi {
        pub(crate) fn with_caches(caches: Vec<String>) -> Self {
            MockApi {
                caches,
                ..MockApi::default()
            }
        }

        pub(crate) fn event_log(&self) -> Vec<BuildEvent> {
            self.events
                .lock()
                .expect("mock events")
                .iter()
                .flat_map(|(_, events)| events.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BuildApi for MockApi {
        async fn update_build(
            &self,
            task_id: &str,
            events: &[BuildEvent],
        ) -> std::result::Result<(), ApiError> {
            {
                let mut failures = self.update_failures.lock().expect("mock failures");
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ApiError::Transient("http 503".into()));
                }
            }
            self.events
                .lock()
                .expect("mock events")
                .push((task_id.to_string(), events.to_vec()));
            Ok(())
        }

        async fn write_log(
            &self,
            _task_id: &str,
            _token: &str,
            bytes: &[u8],
        ) -> std::result::Result<(), ApiError> {
            self.log_bytes
                .lock()
                .expect("mock log")
                .extend_from_slice(bytes);
            Ok(())
        }

        async fn active_push_caches(&self) -> std::result::Result<Vec<String>, ApiError> {
            Ok(self.caches.clone())
        }

        async fn report_task_status(
            &self,
            task_id: &str,
            status: &TaskStatus,
        ) -> std::result::Result<(), ApiError> {
            self.statuses
                .lock()
                .expect("mock statuses")
                .push((task_id.to_string(), status.clone()));
            Ok(())
        }
    }

    pub(crate) fn quick_reporter(api: Arc<MockApi>) -> Reporter {
        let api: Arc<dyn BuildApi> = api;
        ReporterBuilder::default()
            .api(api)
            .policy(
                RetryPolicyBuilder::default()
                    .max_attempts(4u32)
                    .base(Duration::from_millis(1))
                    .cap(Duration::from_millis(2))
                    .build()
                    .expect("retry policy"),
            )
            .build()
            .expect("reporter")
    }

    #[tokio::test]
    async fn reporter_success_update_build() -> Result<()> {
        let api = Arc::new(MockApi::default());
        let reporter = quick_reporter(api.clone());

        reporter
            .update_build("task-1", &[BuildEvent::Done { success: true }])
            .await?;

        assert_eq!(api.event_log(), vec![BuildEvent::Done { success: true }]);
        Ok(())
    }

    #[tokio::test]
    async fn reporter_success_retries_transient_failures() -> Result<()> {
        let api = Arc::new(MockApi::default());
        *api.update_failures.lock().expect("mock failures") = 2;
        let reporter = quick_reporter(api.clone());

        reporter
            .update_build("task-1", &[BuildEvent::Done { success: false }])
            .await?;

        assert_eq!(api.event_log().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reporter_failure_exhausted_retries() {
        let api = Arc::new(MockApi::default());
        *api.update_failures.lock().expect("mock failures") = 10;
        let reporter = quick_reporter(api.clone());

        let res = reporter
            .update_build("task-1", &[BuildEvent::Done { success: false }])
            .await;

        assert!(res.is_err());
        assert!(api.event_log().is_empty());
    }

    #[tokio::test]
    async fn reporter_success_push_caches() -> Result<()> {
        let api = Arc::new(MockApi::with_caches(vec!["a".into(), "b".into()]));
        let reporter = quick_reporter(api);

        assert_eq!(reporter.active_push_caches().await?, vec!["a", "b"]);
        Ok(())
    }
}
