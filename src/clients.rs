//! Outbound clients for the external collaborators
//!
//! The gateway treats the pod lifecycle backend (idler), tenant
//! directory, code-hosting lookup, and token verification service as
//! oracles behind narrow async traits. Tests inject fakes; production
//! wiring uses the reqwest-backed implementations below.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Reported lifecycle state of a tenant's pod.
///
/// Never stored; always queried live from the lifecycle backend.
/// Transitions are driven externally, the gateway only observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    /// Suspended to save resources; must be woken before serving
    Idled,
    /// Wake-up requested, not yet serving traffic
    Starting,
    /// Up and (as far as the backend knows) serving
    Running,
    /// The backend reported something unrecognized
    Unknown,
}

impl PodState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "idled" => PodState::Idled,
            "starting" | "unidling" => PodState::Starting,
            "running" => PodState::Running,
            _ => PodState::Unknown,
        }
    }
}

impl std::fmt::Display for PodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodState::Idled => write!(f, "idled"),
            PodState::Starting => write!(f, "starting"),
            PodState::Running => write!(f, "running"),
            PodState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A tenant's pod within one cluster, as reported by the tenant directory.
///
/// Immutable once resolved for a request; re-resolved on cache miss or
/// expiry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Namespace {
    /// API URL of the cluster hosting the namespace
    #[serde(rename = "cluster-url")]
    pub cluster_url: String,
    /// Namespace (pod) name
    pub name: String,
    /// Namespace type; the gateway monitors `"jenkins"` namespaces
    #[serde(rename = "type")]
    pub kind: String,
    /// Provisioning state as reported by the directory
    #[serde(default)]
    pub state: String,
}

/// Pod lifecycle backend: reports pod state and requests wake-ups
#[async_trait]
pub trait Idler: Send + Sync {
    /// Query the current state of a pod
    async fn state(&self, namespace: &str, cluster_url: &str) -> Result<PodState>;

    /// Request that an idled pod be woken. Returns the backend's status.
    async fn wake(&self, namespace: &str, cluster_url: &str) -> Result<StatusCode>;
}

/// Tenant directory: resolves an identity to its namespaces
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_info(&self, id: &str) -> Result<Vec<Namespace>>;
}

/// Code-hosting lookup: resolves a repository clone URL to its owner
#[async_trait]
pub trait CodeHosting: Send + Sync {
    async fn resolve_owner(&self, clone_url: &str) -> Result<String>;
}

/// Identity/token verification service
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Validate a bearer token and return the user id it belongs to
    async fn uid_from_token(&self, token: &str) -> Result<String>;

    /// Exchange a token for one scoped to the given cluster
    async fn token_for_cluster(&self, cluster_url: &str, token: &str) -> Result<String>;

    /// Login URL to redirect unauthenticated UI users to
    fn redirect_url_for(&self, target: &str) -> String;
}

/// Build the shared client used for all outbound service calls.
///
/// Redirects are disabled: the login probe must see the backend's own
/// status, not whatever a redirect chain ends at.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("Failed to create HTTP client")
}

/// HTTP client for the idler service
pub struct HttpIdler {
    base_url: String,
    http: reqwest::Client,
}

impl HttpIdler {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdlerStateBody {
    state: String,
}

#[async_trait]
impl Idler for HttpIdler {
    async fn state(&self, namespace: &str, cluster_url: &str) -> Result<PodState> {
        let url = format!("{}/api/idler/state/{}", self.base_url, namespace);
        let response = self
            .http
            .get(&url)
            .query(&[("cluster", cluster_url)])
            .send()
            .await
            .context("Idler state request failed")?;

        let body: IdlerStateBody = response
            .error_for_status()
            .context("Idler state query rejected")?
            .json()
            .await
            .context("Idler state response was not valid JSON")?;

        let state = PodState::parse(&body.state);
        debug!(namespace, state = %state, "Queried pod state");
        Ok(state)
    }

    async fn wake(&self, namespace: &str, cluster_url: &str) -> Result<StatusCode> {
        let url = format!("{}/api/idler/unidle/{}", self.base_url, namespace);
        let response = self
            .http
            .post(&url)
            .query(&[("cluster", cluster_url)])
            .send()
            .await
            .context("Idler wake request failed")?;

        Ok(StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
    }
}

/// HTTP client for the tenant directory
pub struct HttpTenantDirectory {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTenantDirectory {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TenantInfoBody {
    data: Vec<Namespace>,
}

#[async_trait]
impl TenantDirectory for HttpTenantDirectory {
    async fn tenant_info(&self, id: &str) -> Result<Vec<Namespace>> {
        let url = format!("{}/api/tenants/{}", self.base_url, id);
        let body: TenantInfoBody = self
            .http
            .get(&url)
            .send()
            .await
            .context("Tenant directory request failed")?
            .error_for_status()
            .context("Tenant directory rejected the lookup")?
            .json()
            .await
            .context("Tenant directory response was not valid JSON")?;

        Ok(body.data)
    }
}

/// HTTP client for the code-hosting lookup
pub struct HttpCodeHosting {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCodeHosting {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OwnerBody {
    #[serde(rename = "owned-by")]
    owned_by: String,
}

#[async_trait]
impl CodeHosting for HttpCodeHosting {
    async fn resolve_owner(&self, clone_url: &str) -> Result<String> {
        let url = format!("{}/api/repositories/owner", self.base_url);
        let body: OwnerBody = self
            .http
            .get(&url)
            .query(&[("url", clone_url)])
            .send()
            .await
            .context("Code-hosting lookup request failed")?
            .error_for_status()
            .context("Code-hosting lookup rejected the URL")?
            .json()
            .await
            .context("Code-hosting response was not valid JSON")?;

        Ok(body.owned_by)
    }
}

/// HTTP client for the token verification service
pub struct HttpTokenService {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTokenService {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UidBody {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ClusterTokenBody {
    access_token: String,
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn uid_from_token(&self, token: &str) -> Result<String> {
        let url = format!("{}/api/user", self.base_url);
        let body: UidBody = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("Token verification request failed")?
            .error_for_status()
            .context("Token was rejected by the verification service")?
            .json()
            .await
            .context("Token verification response was not valid JSON")?;

        Ok(body.user_id)
    }

    async fn token_for_cluster(&self, cluster_url: &str, token: &str) -> Result<String> {
        let url = format!("{}/api/token", self.base_url);
        let body: ClusterTokenBody = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("for", cluster_url)])
            .send()
            .await
            .context("Cluster token request failed")?
            .error_for_status()
            .context("Cluster token request was rejected")?
            .json()
            .await
            .context("Cluster token response was not valid JSON")?;

        Ok(body.access_token)
    }

    fn redirect_url_for(&self, target: &str) -> String {
        format!(
            "{}/api/login?redirect={}",
            self.base_url,
            urlencoding::encode(target)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_state_parse() {
        assert_eq!(PodState::parse("idled"), PodState::Idled);
        assert_eq!(PodState::parse("Idled"), PodState::Idled);
        assert_eq!(PodState::parse("starting"), PodState::Starting);
        assert_eq!(PodState::parse("unidling"), PodState::Starting);
        assert_eq!(PodState::parse("running"), PodState::Running);
        assert_eq!(PodState::parse("terminating"), PodState::Unknown);
        assert_eq!(PodState::parse(""), PodState::Unknown);
    }

    #[test]
    fn test_namespace_deserialization() {
        let json = r#"{
            "cluster-url": "https://api.cluster1.example.com",
            "name": "acme-jenkins",
            "type": "jenkins",
            "state": "created"
        }"#;
        let ns: Namespace = serde_json::from_str(json).unwrap();
        assert_eq!(ns.cluster_url, "https://api.cluster1.example.com");
        assert_eq!(ns.name, "acme-jenkins");
        assert_eq!(ns.kind, "jenkins");
    }

    #[test]
    fn test_redirect_url_encodes_target() {
        let svc = HttpTokenService::new(
            "http://auth.svc",
            reqwest::Client::new(),
        );
        let url = svc.redirect_url_for("http://gateway.example.com/job/build?delay=0");
        assert!(url.starts_with("http://auth.svc/api/login?redirect="));
        assert!(url.contains("%3A%2F%2F"));
        assert!(!url.contains("?delay"));
    }
}
