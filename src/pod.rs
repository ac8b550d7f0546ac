//! Pod controller: lifecycle queries and login probes for one resolved namespace

use crate::cache::CacheItem;
use crate::clients::{Idler, Namespace, PodState};
use anyhow::{Context, Result};
use hyper::StatusCode;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle for one tenant's pod, combining the resolved namespace with
/// the lifecycle backend.
///
/// The controller observes and reacts to pod state; it never retries
/// backend communication errors internally. Retrying is the caller's
/// responsibility and differs between the webhook and UI flows.
pub struct PodController {
    namespace: Namespace,
    idler: Arc<dyn Idler>,
    http: reqwest::Client,
}

impl PodController {
    pub fn new(namespace: Namespace, idler: Arc<dyn Idler>, http: reqwest::Client) -> Self {
        Self {
            namespace,
            idler,
            http,
        }
    }

    /// Routing record for this pod: scheme and app domain are derived
    /// from the cluster API URL, the route host from the namespace name.
    pub fn cache_item(&self) -> CacheItem {
        let (scheme, app_domain) = split_cluster_url(&self.namespace.cluster_url);
        CacheItem {
            cluster_url: self.namespace.cluster_url.clone(),
            namespace: self.namespace.name.clone(),
            route: format!("{}.{}", self.namespace.name, app_domain),
            scheme,
        }
    }

    /// Current pod state, queried live from the lifecycle backend
    pub async fn state(&self) -> Result<PodState> {
        self.idler
            .state(&self.namespace.name, &self.namespace.cluster_url)
            .await
    }

    /// Wake the pod if it is idled.
    ///
    /// A successful wake maps to 202 Accepted, never 200, so callers
    /// always enter a poll/retry flow instead of assuming instant
    /// availability.
    pub async fn start(&self) -> Result<(PodState, StatusCode)> {
        let state = self.state().await?;
        match state {
            PodState::Running => Ok((state, StatusCode::OK)),
            PodState::Starting => Ok((state, StatusCode::ACCEPTED)),
            PodState::Idled => {
                let wake_status = self
                    .idler
                    .wake(&self.namespace.name, &self.namespace.cluster_url)
                    .await?;
                if wake_status.is_success() || wake_status == StatusCode::CONFLICT {
                    info!(namespace = %self.namespace.name, "Requested pod wake-up");
                    Ok((state, StatusCode::ACCEPTED))
                } else {
                    Ok((state, wake_status))
                }
            }
            PodState::Unknown => Ok((state, StatusCode::INTERNAL_SERVER_ERROR)),
        }
    }

    /// Issue a login probe against the pod's backend route.
    ///
    /// With a token, this establishes a session; with `None` it is a
    /// pure capability probe used to test whether the route actually
    /// answers yet. Returns the backend's status and its Set-Cookie
    /// values.
    pub async fn login(&self, token: Option<&str>) -> Result<(StatusCode, Vec<String>)> {
        let item = self.cache_item();
        let url = format!("{}/securityRealm/commenceLogin", item.url());

        let mut request = self.http.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("Login probe failed")?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(String::from))
            .collect();

        debug!(
            namespace = %self.namespace.name,
            status = %status,
            probe = token.is_none(),
            "Login probe completed"
        );
        Ok((status, cookies))
    }
}

/// Split a cluster API URL into (scheme, app domain).
///
/// The app domain is the cluster host with any leading `api.` label
/// stripped; pod routes are exposed as subdomains of it.
fn split_cluster_url(cluster_url: &str) -> (String, String) {
    let (scheme, rest) = cluster_url
        .split_once("://")
        .unwrap_or(("https", cluster_url));
    let host = rest.split('/').next().unwrap_or(rest);
    let host = host.split(':').next().unwrap_or(host);
    let app_domain = host.strip_prefix("api.").unwrap_or(host);
    (scheme.to_string(), app_domain.to_string())
}
