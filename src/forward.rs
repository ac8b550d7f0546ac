//! Reverse-proxy engine with timeout- and redirect-aware error handling
//!
//! Forwards UI traffic to a resolved backend route under a bounded
//! timeout. Backend responses are classified three ways: normal
//! responses pass through verbatim; gateway-class failures (502/503/504
//! or a timeout, typically a pod that is still starting or a route that
//! has not propagated yet) become a 302 redirect back to the original
//! URL so the client retries against fresher state; a 403 is treated as
//! a session-validity signal rather than an error.

use crate::cache::CacheItem;
use crate::GatewayBody;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

/// Backend statuses treated as transient gateway failures
const GATEWAY_FAILURE_CODES: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Why a backend exchange did not produce a response
#[derive(Debug)]
pub enum ForwardError {
    /// The response timeout elapsed; in-flight I/O was abandoned
    Timeout,
    /// Transport-level failure reaching the backend
    Transport(String),
}

/// Outcome of one forwarded request
pub struct ForwardResult {
    /// The response to send to the client
    pub response: Response<BoxBody<Bytes, hyper::Error>>,
    /// False when the backend rejected the session (403); the caller
    /// clears cached session state before the redirect lands
    pub session_valid: bool,
    /// True on 502/503/504/timeout/transport failure; the caller may
    /// drop the cached route
    pub gateway_failure: bool,
}

/// Forwards requests to backend routes through a pooled client
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, GatewayBody>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut inner = HttpConnector::new();
        inner.set_nodelay(true);
        // Routes carry their cluster's scheme; the wrapped connector must
        // accept https URIs
        inner.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(inner);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client, timeout }
    }

    /// Forward a request to the cached backend route and classify the result
    pub async fn forward(
        &self,
        req: Request<GatewayBody>,
        item: &CacheItem,
        had_session_cookie: bool,
    ) -> ForwardResult {
        let original_url = original_request_url(&req);
        let reply = self.send(req, item).await;
        assess(reply, &original_url, had_session_cookie)
    }

    async fn send(
        &self,
        req: Request<GatewayBody>,
        item: &CacheItem,
    ) -> Result<Response<GatewayBody>, ForwardError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}://{}{}", item.scheme, item.route, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key != hyper::header::HOST {
                builder = builder.header(key, value);
            }
        }
        if let Ok(host) = HeaderValue::from_str(&item.route) {
            builder = builder.header(hyper::header::HOST, host);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        match tokio::time::timeout(self.timeout, self.client.request(backend_req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => {
                // Keep the cause chain; the top-level legacy error only
                // says "client error"
                let detail = format!("{:#}", anyhow::Error::new(e));
                warn!(route = %item.route, error = %detail, "Backend request failed");
                Err(ForwardError::Transport(detail))
            }
            Err(_) => {
                warn!(
                    route = %item.route,
                    timeout_secs = self.timeout.as_secs(),
                    "Backend request timed out"
                );
                Err(ForwardError::Timeout)
            }
        }
    }
}

/// Classify a backend reply into the response to serve and the session
/// and gateway flags the caller uses for cache/cookie cleanup.
pub fn assess(
    reply: Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError>,
    original_url: &str,
    had_session_cookie: bool,
) -> ForwardResult {
    match reply {
        Ok(response) if GATEWAY_FAILURE_CODES.contains(&response.status()) => {
            debug!(
                status = %response.status(),
                "Gateway-class backend failure, redirecting client"
            );
            ForwardResult {
                response: redirect_response(original_url),
                session_valid: true,
                gateway_failure: true,
            }
        }
        Ok(response) if response.status() == StatusCode::FORBIDDEN => {
            debug!(
                had_session_cookie,
                "Backend rejected the session, redirecting client"
            );
            ForwardResult {
                response: redirect_response(original_url),
                session_valid: false,
                gateway_failure: false,
            }
        }
        Ok(response) => ForwardResult {
            response,
            session_valid: true,
            gateway_failure: false,
        },
        Err(error) => {
            debug!(?error, "Backend unreachable, redirecting client");
            ForwardResult {
                response: redirect_response(original_url),
                session_valid: true,
                gateway_failure: true,
            }
        }
    }
}

/// Build a 302 redirect response
pub fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let location = HeaderValue::from_str(location)
        .unwrap_or_else(|_| HeaderValue::from_static("/"));
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Reconstruct the client-visible URL of a request from its Host header.
/// The scheme comes from X-Forwarded-Proto so redirects keep TLS-routed
/// clients on https.
pub fn original_request_url<B>(req: &Request<B>) -> String {
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http");
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}
