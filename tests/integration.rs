//! Integration tests for Wakegate
//!
//! Drives the full server stack (listener, dispatcher, flows, store)
//! over real TCP connections, with the external collaborators replaced
//! by in-process fakes implementing the public client traits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use wakegate::buffer::WebhookBuffer;
use wakegate::cache::TtlCache;
use wakegate::clients::{
    CodeHosting, Idler, Namespace, PodState, TenantDirectory, TokenService,
};
use wakegate::dispatch::{Dispatcher, GatewayStats};
use wakegate::forward::Forwarder;
use wakegate::proxy::GatewayServer;
use wakegate::resolver::Resolver;
use wakegate::store::Store;
use wakegate::ui::UiFlow;

struct StubIdler {
    state: PodState,
}

#[async_trait]
impl Idler for StubIdler {
    async fn state(&self, _namespace: &str, _cluster_url: &str) -> Result<PodState> {
        Ok(self.state)
    }

    async fn wake(&self, _namespace: &str, _cluster_url: &str) -> Result<StatusCode> {
        Ok(StatusCode::OK)
    }
}

struct StubTenant;

#[async_trait]
impl TenantDirectory for StubTenant {
    async fn tenant_info(&self, _id: &str) -> Result<Vec<Namespace>> {
        Ok(vec![Namespace {
            cluster_url: "https://api.cluster1.example.com".to_string(),
            name: "acme-jenkins".to_string(),
            kind: "jenkins".to_string(),
            state: "created".to_string(),
        }])
    }
}

struct StubCodeHosting;

#[async_trait]
impl CodeHosting for StubCodeHosting {
    async fn resolve_owner(&self, _clone_url: &str) -> Result<String> {
        Ok("acme".to_string())
    }
}

struct StubTokens;

#[async_trait]
impl TokenService for StubTokens {
    async fn uid_from_token(&self, _token: &str) -> Result<String> {
        Ok("user-42".to_string())
    }

    async fn token_for_cluster(&self, _cluster_url: &str, _token: &str) -> Result<String> {
        Ok("cluster-t0ken".to_string())
    }

    fn redirect_url_for(&self, target: &str) -> String {
        format!("http://auth.svc/api/login?redirect={}", target)
    }
}

/// Build a full gateway wired to the stub collaborators and start it
/// on the given port. Returns the store for assertions.
fn start_gateway(port: u16, pod_state: PodState) -> (Arc<Store>, watch::Sender<bool>) {
    let idler: Arc<dyn Idler> = Arc::new(StubIdler { state: pod_state });
    let tokens: Arc<dyn TokenService> = Arc::new(StubTokens);
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let stats = Arc::new(GatewayStats::default());
    let session_cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
    let http = reqwest::Client::new();

    let resolver = Arc::new(Resolver::new(
        Arc::new(StubTenant),
        Arc::new(StubCodeHosting),
        Arc::clone(&tokens),
        Arc::new(TtlCache::new(Duration::from_secs(60))),
        3,
        Duration::from_millis(1),
    ));

    let webhooks = WebhookBuffer::new(
        Arc::clone(&resolver),
        Arc::clone(&idler),
        Arc::clone(&store),
        Arc::clone(&stats),
        http.clone(),
    );
    let ui = UiFlow::new(
        resolver,
        idler,
        tokens,
        Arc::clone(&session_cache),
        "JSESSIONID",
        "JenkinsIdled",
        http,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        webhooks,
        ui,
        Forwarder::new(Duration::from_secs(2)),
        session_cache,
        Arc::clone(&store),
        stats,
        "User-Agent",
        "GitHub-Hookshot",
        "JSESSIONID",
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = GatewayServer::new(addr, dispatcher, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (store, shutdown_tx)
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a raw HTTP request and read the full response
async fn http_request(
    port: u16,
    request: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

const PUSH_PAYLOAD: &str =
    r#"{"repository":{"clone_url":"https://example.com/acme/repo.git"}}"#;

#[tokio::test]
async fn test_webhook_for_idled_pod_is_buffered() {
    let port = 18431;
    let (store, _shutdown) = start_gateway(port, PodState::Idled);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let request = format!(
        "POST /github-webhook/ HTTP/1.1\r\n\
         Host: gateway.example.com\r\n\
         User-Agent: GitHub-Hookshot/044aadd\r\n\
         X-GitHub-Event: push\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        PUSH_PAYLOAD.len(),
        PUSH_PAYLOAD
    );
    let response = http_request(port, &request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 202"), "got: {}", response);
    assert_eq!(store.pending_count("acme-jenkins").unwrap(), 1);

    let buffered = &store.requests_for("acme-jenkins").unwrap()[0];
    assert_eq!(buffered.method, "POST");
    assert_eq!(buffered.payload, PUSH_PAYLOAD.as_bytes());
}

#[tokio::test]
async fn test_ui_request_without_session_redirects_to_login() {
    let port = 18432;
    let (store, _shutdown) = start_gateway(port, PodState::Running);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let request = "GET /job/build HTTP/1.1\r\n\
                   Host: gateway.example.com\r\n\
                   User-Agent: Mozilla/5.0\r\n\
                   Connection: close\r\n\r\n";
    let response = http_request(port, request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 302"), "got: {}", response);
    assert!(response.contains("location: http://auth.svc/api/login?redirect="));
    // Nothing was buffered for a UI request
    assert_eq!(store.pending_count("acme-jenkins").unwrap(), 0);
}

#[tokio::test]
async fn test_tls_routed_ui_request_redirects_on_https() {
    let port = 18435;
    let (_store, _shutdown) = start_gateway(port, PodState::Running);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    // The platform router terminates TLS and stamps the proto header;
    // the redirect target must keep the client's scheme
    let request = "GET /job/build HTTP/1.1\r\n\
                   Host: gateway.example.com\r\n\
                   User-Agent: Mozilla/5.0\r\n\
                   X-Forwarded-Proto: https\r\n\
                   Connection: close\r\n\r\n";
    let response = http_request(port, request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 302"), "got: {}", response);
    assert!(
        response.contains("redirect=https://gateway.example.com/job/build"),
        "got: {}",
        response
    );
}

#[tokio::test]
async fn test_webhook_with_bad_payload_is_rejected() {
    let port = 18433;
    let (store, _shutdown) = start_gateway(port, PodState::Running);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let body = "not json";
    let request = format!(
        "POST /github-webhook/ HTTP/1.1\r\n\
         Host: gateway.example.com\r\n\
         User-Agent: GitHub-Hookshot/044aadd\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = http_request(port, &request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
    assert!(response.contains("x-gateway-error: BAD_PAYLOAD"));
    assert_eq!(store.pending_count("acme-jenkins").unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_signal_stops_listener() {
    let port = 18434;
    let (_store, shutdown) = start_gateway(port, PodState::Running);
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // New connections are refused once the accept loop exits
    assert!(TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .is_err());
}
