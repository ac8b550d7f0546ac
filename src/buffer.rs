//! Webhook durability: buffer on receipt, replay in the background
//!
//! Webhook events must never be silently lost. When the target pod is
//! not running, the raw request is persisted and the producer gets a
//! provisional 202; a single periodic replay task drains each
//! namespace's queue once its pod comes up. Delivery is at-least-once
//! with best-effort ordering per namespace, never exactly-once or
//! global FIFO.

use crate::clients::{Idler, PodState};
use crate::dispatch::GatewayStats;
use crate::error::{FlowError, GatewayErrorCode};
use crate::pod::PodController;
use crate::resolver::Resolver;
use crate::store::{BufferedRequest, Store};
use crate::GatewayBody;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Repository reference inside a webhook payload
#[derive(Debug, Deserialize)]
struct RepositoryRef {
    /// GitHub-style clone URL
    clone_url: Option<String>,
    /// GitLab-style clone URL
    git_http_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    repository: RepositoryRef,
}

/// Pull the repository clone URL out of a webhook payload
fn clone_url_from_payload(payload: &[u8]) -> Option<String> {
    let parsed: WebhookPayload = serde_json::from_slice(payload).ok()?;
    parsed
        .repository
        .clone_url
        .or(parsed.repository.git_http_url)
}

/// Handles inbound webhook requests
pub struct WebhookBuffer {
    resolver: Arc<Resolver>,
    idler: Arc<dyn Idler>,
    store: Arc<Store>,
    stats: Arc<GatewayStats>,
    http: reqwest::Client,
}

impl WebhookBuffer {
    pub fn new(
        resolver: Arc<Resolver>,
        idler: Arc<dyn Idler>,
        store: Arc<Store>,
        stats: Arc<GatewayStats>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            resolver,
            idler,
            store,
            stats,
            http,
        }
    }

    /// Process one inbound webhook: forward live if the pod is running,
    /// otherwise persist for replay and answer 202.
    pub async fn handle(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, FlowError> {
        let (parts, body) = req.into_parts();
        let payload = body
            .collect()
            .await
            .map_err(|e| {
                FlowError::new(GatewayErrorCode::BadPayload, format!("Failed to read body: {}", e))
            })?
            .to_bytes();

        let clone_url = clone_url_from_payload(&payload).ok_or_else(|| {
            FlowError::new(
                GatewayErrorCode::BadPayload,
                "Webhook payload has no repository clone URL",
            )
        })?;

        let namespace = self
            .resolver
            .resolve_by_repo_url_with_retry(&clone_url)
            .await?;

        let pod = PodController::new(namespace.clone(), Arc::clone(&self.idler), self.http.clone());
        let item = pod.cache_item();

        let state = match pod.state().await {
            Ok(state) => state,
            Err(e) => {
                // Durability first: an unreachable idler means buffer, not drop
                warn!(namespace = %namespace.name, error = %e, "Pod state query failed, buffering");
                PodState::Unknown
            }
        };

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let buffered = BufferedRequest {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.name.clone(),
            cluster_url: namespace.cluster_url.clone(),
            method: parts.method.to_string(),
            headers: storable_headers(&parts.headers),
            payload: payload.to_vec(),
            host: item.route.clone(),
            scheme: item.scheme.clone(),
            path,
            retry_count: 0,
        };

        if state == PodState::Running {
            match deliver(&self.http, &buffered).await {
                Ok(upstream) => {
                    let status = upstream.status();
                    match relay_response(upstream).await {
                        Ok(response) => {
                            debug!(namespace = %namespace.name, status = %status, "Webhook forwarded live");
                            return Ok(response);
                        }
                        Err(e) => {
                            warn!(namespace = %namespace.name, error = %e, "Live forward relay failed, buffering");
                        }
                    }
                }
                Err(e) => {
                    // Fall through to buffering rather than losing the event
                    warn!(namespace = %namespace.name, error = %e, "Live forward failed, buffering");
                }
            }
        }

        self.store.create_request(&buffered).map_err(|e| {
            FlowError::new(GatewayErrorCode::StoreFailure, format!("Failed to buffer webhook: {}", e))
        })?;
        self.stats.record_buffered();

        if let Err(e) = self.store.touch_last_buffered(&namespace.name) {
            warn!(namespace = %namespace.name, error = %e, "Failed to record buffer timestamp");
        }

        // Best-effort wake; replay picks the request up once the pod is running
        if let Err(e) = pod.start().await {
            warn!(namespace = %namespace.name, error = %e, "Wake request failed");
        }

        info!(
            namespace = %namespace.name,
            request_id = %buffered.id,
            "Webhook buffered for replay"
        );
        Ok(empty_response(StatusCode::ACCEPTED))
    }
}

/// Headers worth persisting for replay. Host and Content-Length are
/// recomputed when the outbound request is rebuilt.
fn storable_headers(headers: &hyper::HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if name == hyper::header::HOST || name == hyper::header::CONTENT_LENGTH {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Relay an upstream reply to the producer, body and headers included.
/// Framing headers are dropped; hyper recomputes them for the rebuilt body.
async fn relay_response(
    upstream: reqwest::Response,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = upstream.headers().clone();
    let body = upstream.bytes().await?;

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if name == reqwest::header::CONTENT_LENGTH
            || name == reqwest::header::TRANSFER_ENCODING
            || name == reqwest::header::CONNECTION
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .map_err(|e| anyhow::anyhow!("Failed to rebuild upstream response: {}", e))
}

/// Rebuild a buffered request and send it to its stored target
pub async fn deliver(
    http: &reqwest::Client,
    request: &BufferedRequest,
) -> anyhow::Result<reqwest::Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid stored method '{}': {}", request.method, e))?;

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, values) in &request.headers {
        for value in values {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
    }

    let response = http
        .request(method, request.target_url())
        .headers(headers)
        .body(request.payload.clone())
        .send()
        .await?;

    Ok(response)
}

/// Periodic background task draining buffered webhooks
pub struct ReplayTask {
    store: Arc<Store>,
    idler: Arc<dyn Idler>,
    stats: Arc<GatewayStats>,
    http: reqwest::Client,
    interval: Duration,
    max_retries: u32,
}

impl ReplayTask {
    pub fn new(
        store: Arc<Store>,
        idler: Arc<dyn Idler>,
        stats: Arc<GatewayStats>,
        http: reqwest::Client,
        interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            idler,
            stats,
            http,
            interval,
            max_retries,
        }
    }

    /// Run the replay loop until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_retries = self.max_retries,
            "Webhook replay task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.run_pass().await {
                        error!(error = %e, "Replay pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Webhook replay task shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One replay pass over every namespace with pending requests.
    ///
    /// Requests are drained in queue order per namespace; the first
    /// non-Running observation stops that namespace's pass so delivery
    /// order is preserved once the pod comes up.
    pub async fn run_pass(&self) -> anyhow::Result<()> {
        let namespaces = self.store.namespaces_with_pending()?;
        for namespace in namespaces {
            self.drain_namespace(&namespace).await?;
        }
        Ok(())
    }

    async fn drain_namespace(&self, namespace: &str) -> anyhow::Result<()> {
        let requests = self.store.requests_for(namespace)?;

        for request in requests {
            let state = match self
                .idler
                .state(&request.namespace, &request.cluster_url)
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    warn!(namespace, error = %e, "Pod state query failed, deferring queue");
                    PodState::Unknown
                }
            };

            if state != PodState::Running {
                debug!(namespace, state = %state, "Pod not running, deferring queue");
                break;
            }

            if request.retry_count >= self.max_retries {
                debug!(
                    namespace,
                    request_id = %request.id,
                    retries = request.retry_count,
                    "Retry cap reached, skipping replay"
                );
                continue;
            }

            match deliver(&self.http, &request).await.map(|reply| {
                StatusCode::from_u16(reply.status().as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }) {
                Ok(status) if status == StatusCode::OK => {
                    info!(namespace, request_id = %request.id, "Buffered webhook delivered");
                    self.stats.record_replayed();
                    self.delete(&request.id);
                }
                Ok(status)
                    if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND =>
                {
                    warn!(
                        namespace,
                        request_id = %request.id,
                        status = %status,
                        "Buffered webhook permanently rejected"
                    );
                    self.delete(&request.id);
                }
                Ok(status) => {
                    debug!(
                        namespace,
                        request_id = %request.id,
                        status = %status,
                        "Replay attempt failed, will retry"
                    );
                    self.bump_retry(&request.id);
                }
                Err(e) => {
                    debug!(
                        namespace,
                        request_id = %request.id,
                        error = %e,
                        "Replay transport error, will retry"
                    );
                    self.bump_retry(&request.id);
                }
            }
        }

        Ok(())
    }

    fn delete(&self, id: &str) {
        if let Err(e) = self.store.delete_request(id) {
            error!(request_id = id, error = %e, "Failed to delete buffered request");
        }
    }

    /// Increment the retry counter; a record that cannot be updated is
    /// deleted rather than retried forever.
    fn bump_retry(&self, id: &str) {
        if let Err(e) = self.store.increment_retry(id) {
            error!(
                request_id = id,
                error = %e,
                "Failed to persist retry count, deleting broken record"
            );
            self.delete(id);
        }
    }
}

/// Periodic background task logging usage statistics
pub struct StatsLogTask {
    store: Arc<Store>,
    stats: Arc<GatewayStats>,
    interval: Duration,
}

impl StatsLogTask {
    pub fn new(store: Arc<Store>, stats: Arc<GatewayStats>, interval: Duration) -> Self {
        Self {
            store,
            stats,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Statistics logging task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.log_snapshot();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Statistics logging task shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn log_snapshot(&self) {
        info!(
            webhook_requests = self.stats.webhook_requests(),
            ui_requests = self.stats.ui_requests(),
            buffered = self.stats.buffered(),
            replayed = self.stats.replayed(),
            "Gateway counters"
        );

        match self.store.usage_snapshot() {
            Ok(snapshot) => {
                for stat in snapshot {
                    info!(
                        namespace = %stat.namespace,
                        last_accessed = stat.last_accessed.as_deref().unwrap_or("-"),
                        last_buffered = stat.last_buffered.as_deref().unwrap_or("-"),
                        "Namespace usage"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read usage statistics");
            }
        }
    }
}
