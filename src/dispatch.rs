//! Request dispatch: classify, route to a flow, answer errors
//!
//! Every inbound request is classified exactly once, by a marker header
//! (User-Agent prefix by default), into the webhook flow or the UI
//! flow. Flow errors surface here and nowhere else; inner components
//! return them and the dispatcher writes the single JSON error
//! response.

use crate::buffer::WebhookBuffer;
use crate::cache::{CacheItem, TtlCache};
use crate::cookies;
use crate::error::json_error_response;
use crate::forward::{redirect_response, Forwarder};
use crate::store::Store;
use crate::ui::{UiFlow, UiOutcome, HOLDING_PAGE};
use crate::GatewayBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Monotonic gateway counters, shared across flows and the stats logger
#[derive(Debug, Default)]
pub struct GatewayStats {
    webhook_requests: AtomicU64,
    ui_requests: AtomicU64,
    buffered: AtomicU64,
    replayed: AtomicU64,
}

impl GatewayStats {
    pub fn record_webhook(&self) {
        self.webhook_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ui(&self) {
        self.ui_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_requests(&self) -> u64 {
        self.webhook_requests.load(Ordering::Relaxed)
    }

    pub fn ui_requests(&self) -> u64 {
        self.ui_requests.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    webhooks: WebhookBuffer,
    ui: UiFlow,
    forwarder: Forwarder,
    session_cache: Arc<TtlCache<CacheItem>>,
    store: Arc<Store>,
    stats: Arc<GatewayStats>,
    source_header: String,
    source_prefix: String,
    session_prefix: String,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        webhooks: WebhookBuffer,
        ui: UiFlow,
        forwarder: Forwarder,
        session_cache: Arc<TtlCache<CacheItem>>,
        store: Arc<Store>,
        stats: Arc<GatewayStats>,
        source_header: impl Into<String>,
        source_prefix: impl Into<String>,
        session_prefix: impl Into<String>,
    ) -> Self {
        Self {
            webhooks,
            ui,
            forwarder,
            session_cache,
            store,
            stats,
            source_header: source_header.into(),
            source_prefix: source_prefix.into(),
            session_prefix: session_prefix.into(),
        }
    }

    /// Handle one inbound request. Always produces a response; flow
    /// errors become JSON error responses here.
    pub async fn handle(&self, req: Request<GatewayBody>) -> Response<GatewayBody> {
        if self.is_webhook(req.headers()) {
            self.stats.record_webhook();
            match self.webhooks.handle(req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Webhook flow failed");
                    json_error_response(e.code, e.message)
                }
            }
        } else {
            self.stats.record_ui();
            match self.handle_ui(req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "UI flow failed");
                    json_error_response(e.code, e.message)
                }
            }
        }
    }

    /// A request is a webhook when the marker header carries the
    /// configured producer prefix.
    fn is_webhook(&self, headers: &HeaderMap) -> bool {
        headers
            .get(self.source_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(&self.source_prefix))
            .unwrap_or(false)
    }

    async fn handle_ui(
        &self,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, crate::error::FlowError> {
        let (parts, body) = req.into_parts();
        let outcome = self.ui.prepare(&parts).await?;

        match outcome {
            UiOutcome::Forward { item, session_key } => {
                // Stale-session cleanup headers, computed before the
                // parts are consumed by the forwarded request
                let expired_session_cookies = cookies::expire_matching(&parts.headers, |n| {
                    n.starts_with(&self.session_prefix)
                });

                let req = Request::from_parts(parts, body);
                let result = self
                    .forwarder
                    .forward(req, &item, session_key.is_some())
                    .await;

                if let Err(e) = self.store.touch_last_accessed(&item.namespace) {
                    warn!(namespace = %item.namespace, error = %e, "Failed to record access timestamp");
                }

                let mut response = result.response;
                if !result.session_valid || result.gateway_failure {
                    // The cached route or session is no longer good;
                    // drop it so the next request re-resolves
                    if let Some(key) = &session_key {
                        debug!(namespace = %item.namespace, "Dropping cached session route");
                        self.session_cache.remove(key);
                    }
                    if !result.session_valid {
                        for cookie in expired_session_cookies {
                            response.headers_mut().append(SET_COOKIE, cookie);
                        }
                    }
                }
                Ok(response)
            }
            UiOutcome::Redirect {
                location,
                set_cookies,
            } => {
                let mut response = redirect_response(&location);
                append_cookies(&mut response, set_cookies);
                Ok(response)
            }
            UiOutcome::Hold { set_cookies } => {
                let mut response = Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
                    .body(
                        Full::new(Bytes::from_static(HOLDING_PAGE.as_bytes()))
                            .map_err(|never| match never {})
                            .boxed(),
                    )
                    .expect("valid response builder");
                append_cookies(&mut response, set_cookies);
                Ok(response)
            }
        }
    }
}

fn append_cookies(response: &mut Response<GatewayBody>, cookies: Vec<HeaderValue>) {
    for cookie in cookies {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
}
