//! Host middleware adapter
//!
//! JSON-RPC over HTTP to the host middleware, implementing
//! [`ReleaseManager`] and [`HostServices`]. Connection failures are retried
//! with exponential backoff; call errors are returned as
//! [`Error::MiddlewareCall`].

use crate::domain::ports::{HostJob, HostJobId, HostJobState, HostServices, Release, ReleaseManager};
use crate::error::{Error, Result};
use crate::retry::{retry_until, PollPolicy, Probe};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChartRelease {
    name: String,
    namespace: String,
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DatastoreRow {
    id: u64,
}

fn decode<T: DeserializeOwned>(method: &str, response: RpcResponse) -> Result<T> {
    if let Some(error) = response.error {
        return Err(Error::MiddlewareCall {
            method: method.into(),
            reason: error.message,
        });
    }
    let result = response.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| Error::MiddlewareCall {
        method: method.into(),
        reason: format!("unexpected result: {e}"),
    })
}

// =============================================================================
// Client
// =============================================================================

/// Middleware RPC client
pub struct MiddlewareClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    /// Give up retrying connection failures after this long
    max_retry: Duration,
    /// How `wait_job` polls
    job_poll: PollPolicy,
}

impl MiddlewareClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
            max_retry: Duration::from_secs(60),
            job_poll: PollPolicy::new(2, None),
        })
    }

    pub fn with_max_retry(mut self, max_retry: Duration) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_job_poll(mut self, policy: PollPolicy) -> Self {
        self.job_poll = policy;
        self
    }

    /// Call `method` with positional `params`
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_retry),
            ..Default::default()
        };

        let response = backoff::future::retry(backoff, || async {
            match self.send(method, &params).await {
                Ok(response) => Ok(response),
                Err(e) if e.is_transient() => {
                    warn!(method = %method, error = %e, "Middleware unreachable, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        decode(method, response)
    }

    async fn send(&self, method: &str, params: &Value) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, method = %method, "Middleware call");
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<RpcResponse>()
            .await?;
        Ok(response)
    }
}

// =============================================================================
// Release Manager
// =============================================================================

#[async_trait]
impl ReleaseManager for MiddlewareClient {
    async fn list_releases(&self) -> Result<Vec<Release>> {
        let releases: Vec<ChartRelease> = self
            .call("chart.release.query", json!([[], {"select": ["name", "namespace", "path"]}]))
            .await?;
        Ok(releases
            .into_iter()
            .map(|r| Release {
                name: r.name,
                namespace: r.namespace,
                chart_path: r.path,
            })
            .collect())
    }

    async fn redeploy(&self, release: &str) -> Result<HostJobId> {
        self.call("chart.release.redeploy_internal", json!([release, true]))
            .await
    }
}

// =============================================================================
// Host Services
// =============================================================================

#[async_trait]
impl HostServices for MiddlewareClient {
    async fn start_service(&self, service: &str) -> Result<()> {
        let started: bool = self.call("service.start", json!([service])).await?;
        if !started {
            return Err(Error::MiddlewareCall {
                method: "service.start".into(),
                reason: format!("{service} service did not start"),
            });
        }
        Ok(())
    }

    async fn stop_service(&self, service: &str) -> Result<()> {
        let _: Value = self.call("service.stop", json!([service])).await?;
        Ok(())
    }

    async fn service_started(&self, service: &str) -> Result<bool> {
        self.call("service.started", json!([service])).await
    }

    async fn run_migrations(&self) -> Result<()> {
        let _: Value = self.call("k8s.migration.run", json!([])).await?;
        Ok(())
    }

    async fn run_app_migrations(&self) -> Result<()> {
        let _: Value = self.call("k8s.app.migration.run", json!([])).await?;
        Ok(())
    }

    async fn raise_alert(&self, alert: &str, error: &str) -> Result<()> {
        let _: Value = self
            .call("alert.oneshot_create", json!([alert, {"error": error}]))
            .await?;
        Ok(())
    }

    async fn clear_alert(&self, alert: &str) -> Result<()> {
        let _: Value = self.call("alert.oneshot_delete", json!([alert, null])).await?;
        Ok(())
    }

    async fn reset_cni_config(&self) -> Result<()> {
        let row: DatastoreRow = self
            .call("datastore.config", json!(["services.kubernetes"]))
            .await?;
        let _: Value = self
            .call(
                "datastore.update",
                json!(["services.kubernetes", row.id, {"cni_config": {}}]),
            )
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, methods: &[&str], states: &[HostJobState]) -> Result<Vec<HostJob>> {
        self.call(
            "core.get_jobs",
            json!([[["method", "in", methods], ["state", "in", states]]]),
        )
        .await
    }

    async fn abort_job(&self, id: HostJobId) -> Result<()> {
        let _: Value = self.call("core.job_abort", json!([id])).await?;
        Ok(())
    }

    async fn wait_job(&self, id: HostJobId) -> Result<HostJob> {
        retry_until(&format!("job {id}"), &self.job_poll, || async {
            let jobs: Vec<HostJob> = self
                .call("core.get_jobs", json!([[["id", "=", id]]]))
                .await?;
            match jobs.into_iter().next() {
                Some(job) if job.state.is_finished() => Ok(Probe::Ready(job)),
                Some(job) => Ok(Probe::Pending(format!("job {} is {:?}", id, job.state))),
                None => Err(Error::not_found("Job", id.to_string())),
            }
        })
        .await
    }

    async fn sync_catalogs(&self) -> Result<HostJobId> {
        self.call("catalog.sync_all", json!([])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::{routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Serve a fake middleware; returns its URL and the calls it received
    async fn serve(polls_until_done: usize) -> (String, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let polls = Arc::new(Mutex::new(0usize));

        let app = Router::new().route(
            "/_rpc",
            post(move |Json(request): Json<Value>| {
                let seen = seen.clone();
                let polls = polls.clone();
                async move {
                    let method = request["method"].as_str().unwrap_or_default().to_string();
                    seen.lock().push(method.clone());
                    let reply = match method.as_str() {
                        "service.started" => json!({"result": true}),
                        "service.start" => json!({"result": false}),
                        "chart.release.query" => json!({"result": [
                            {"name": "plex", "namespace": "ix-plex", "path": "/mnt/charts/plex/1.0.0"},
                            {"name": "db", "namespace": "ix-db"}
                        ]}),
                        "datastore.config" => json!({"result": {"id": 7}}),
                        "datastore.update" => json!({"result": {"id": 7}}),
                        "core.get_jobs" => {
                            let mut polls = polls.lock();
                            *polls += 1;
                            let state = if *polls > polls_until_done { "SUCCESS" } else { "RUNNING" };
                            json!({"result": [{"id": 3, "method": "catalog.sync_all", "state": state}]})
                        }
                        _ => json!({"error": {"message": format!("method {method} not found")}}),
                    };
                    Json(reply)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/_rpc"), calls)
    }

    #[tokio::test]
    async fn test_calls_and_results() {
        let (url, calls) = serve(0).await;
        let client = MiddlewareClient::new(url).unwrap();

        assert!(client.service_started("kubernetes").await.unwrap());

        let releases = client.list_releases().await.unwrap();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].chart_path, Some(PathBuf::from("/mnt/charts/plex/1.0.0")));
        assert_eq!(releases[1].chart_path, None);

        client.reset_cni_config().await.unwrap();
        assert_eq!(
            calls.lock().as_slice(),
            ["service.started", "chart.release.query", "datastore.config", "datastore.update"]
        );
    }

    #[tokio::test]
    async fn test_call_errors() {
        let (url, _) = serve(0).await;
        let client = MiddlewareClient::new(url).unwrap();

        assert_matches!(
            client.start_service("kubernetes").await,
            Err(Error::MiddlewareCall { method, .. }) if method == "service.start"
        );
        let err = client.abort_job(1).await.unwrap_err();
        assert!(err.to_string().contains("core.job_abort"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_wait_job_polls_until_finished() {
        let (url, calls) = serve(2).await;
        let client = MiddlewareClient::new(url)
            .unwrap()
            .with_job_poll(PollPolicy::new(0, Some(5)));

        let job = client.wait_job(3).await.unwrap();
        assert_eq!(job.state, HostJobState::Success);
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_middleware_gives_up() {
        let client = MiddlewareClient::new("http://127.0.0.1:9/_rpc")
            .unwrap()
            .with_max_retry(Duration::from_millis(200));
        let err = client.service_started("kubernetes").await.unwrap_err();
        assert_matches!(err, Error::MiddlewareConnection(_));
    }
}
