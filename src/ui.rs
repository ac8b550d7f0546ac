//! UI request flow: login, session routing, and idle recovery
//!
//! Each interactive request walks a small state machine: a one-time
//! token parameter drives login, a cached session cookie drives
//! forwarding, an idled-marker cookie drives the wake-and-wait holding
//! page, and anything else is redirected to the identity service. Every
//! transition returns an explicit outcome; only the dispatcher turns
//! outcomes into responses.

use crate::cache::{CacheItem, TtlCache};
use crate::clients::{Idler, Namespace, PodState, TokenService};
use crate::cookies;
use crate::error::{FlowError, GatewayErrorCode};
use crate::pod::PodController;
use crate::resolver::Resolver;
use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use hyper::StatusCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query parameter carrying the one-time login token
const TOKEN_PARAM: &str = "token";

/// Holding page served while a pod is waking up. Refreshes itself so
/// the user lands on the pod once the route starts answering.
pub const HOLDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta http-equiv="refresh" content="15">
  <title>Starting your Jenkins...</title>
</head>
<body>
  <h1>Your Jenkins instance is starting</h1>
  <p>It was idled to save resources. This page refreshes automatically
  until it is ready.</p>
</body>
</html>
"#;

/// What the UI state machine decided to do with a request
#[derive(Debug)]
pub enum UiOutcome {
    /// Rewrite the request target to the cached route and forward it
    Forward {
        item: CacheItem,
        /// Cache key to drop if the backend later rejects the session
        session_key: Option<String>,
    },
    /// Send the client elsewhere, optionally rewriting cookies
    Redirect {
        location: String,
        set_cookies: Vec<HeaderValue>,
    },
    /// Serve the holding page with 202 while the pod wakes
    Hold { set_cookies: Vec<HeaderValue> },
}

pub struct UiFlow {
    resolver: Arc<Resolver>,
    idler: Arc<dyn Idler>,
    tokens: Arc<dyn TokenService>,
    session_cache: Arc<TtlCache<CacheItem>>,
    session_prefix: String,
    idled_cookie: String,
    http: reqwest::Client,
}

impl UiFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<Resolver>,
        idler: Arc<dyn Idler>,
        tokens: Arc<dyn TokenService>,
        session_cache: Arc<TtlCache<CacheItem>>,
        session_prefix: impl Into<String>,
        idled_cookie: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            resolver,
            idler,
            tokens,
            session_cache,
            session_prefix: session_prefix.into(),
            idled_cookie: idled_cookie.into(),
            http,
        }
    }

    /// Walk the state machine for one UI request
    pub async fn prepare(&self, parts: &Parts) -> Result<UiOutcome, FlowError> {
        if let Some(token) = query_param(parts, TOKEN_PARAM) {
            return self.authenticate(parts, &token).await;
        }

        let mut stale_cookies = Vec::new();

        if let Some((name, value)) = cookies::session_cookie(&parts.headers, &self.session_prefix)
        {
            match self.session_cache.get(&value) {
                Some(item) => match self.routed_session(parts, item, &value).await? {
                    Some(outcome) => return Ok(outcome),
                    None => stale_cookies.push(cookies::expire_cookie(&name)),
                },
                None => {
                    // Session cookie with no cache entry is stale; expire
                    // it and fall through to re-authentication
                    debug!("Session cookie has no cache entry, expiring");
                    stale_cookies.push(cookies::expire_cookie(&name));
                }
            }
        }

        if let Some(value) = cookies::idled_cookie(&parts.headers, &self.idled_cookie) {
            match self.session_cache.get(&value) {
                Some(item) => return self.idled_session(parts, item, stale_cookies).await,
                None => stale_cookies.push(cookies::expire_cookie(&self.idled_cookie)),
            }
        }

        Ok(self.login_redirect(parts, stale_cookies))
    }

    /// Step 1: one-time token login
    async fn authenticate(&self, parts: &Parts, token: &str) -> Result<UiOutcome, FlowError> {
        let namespace = self.resolver.resolve_by_token(token).await?;
        let pod = self.controller(namespace.clone());

        let (state, _) = pod.start().await.map_err(|e| {
            FlowError::new(GatewayErrorCode::LifecycleUnreachable, e.to_string())
        })?;

        let stripped = strip_token_param(parts);

        if state != PodState::Running {
            // Pod is waking; park the user behind an idled marker that
            // keys the routing record for later passes
            let (header, value) = cookies::new_idled_cookie(&self.idled_cookie);
            self.session_cache.insert(value, pod.cache_item());
            info!(namespace = %namespace.name, state = %state, "Pod not running, parking UI session");
            return Ok(UiOutcome::Redirect {
                location: stripped,
                set_cookies: vec![header],
            });
        }

        let cluster_token = self
            .tokens
            .token_for_cluster(&namespace.cluster_url, token)
            .await
            .map_err(|e| FlowError::new(GatewayErrorCode::LoginFailed, e.to_string()))?;

        let (status, backend_cookies) = pod
            .login(Some(&cluster_token))
            .await
            .map_err(|e| FlowError::new(GatewayErrorCode::LoginFailed, e.to_string()))?;

        if let Some((_, session_value)) =
            cookies::session_cookie_from_login(&backend_cookies, &self.session_prefix)
        {
            self.session_cache
                .insert(session_value, pod.cache_item());

            // Clear any stale gateway cookies, then relay everything the
            // backend set so the client holds the new session
            let mut set_cookies =
                cookies::expire_matching(&parts.headers, |n| n == self.idled_cookie);
            set_cookies.extend(
                backend_cookies
                    .iter()
                    .filter_map(|raw| HeaderValue::from_str(raw).ok()),
            );

            info!(namespace = %namespace.name, "Backend login established a session");
            return Ok(UiOutcome::Redirect {
                location: stripped,
                set_cookies,
            });
        }

        warn!(
            namespace = %namespace.name,
            status = %status,
            "Backend login did not establish a session"
        );
        Ok(self.login_redirect(parts, Vec::new()))
    }

    /// Step 2: request carries a cached session cookie.
    ///
    /// Returns `None` when the cached route turned out stale and the
    /// caller should fall through to re-authentication.
    async fn routed_session(
        &self,
        _parts: &Parts,
        item: CacheItem,
        session_key: &str,
    ) -> Result<Option<UiOutcome>, FlowError> {
        let state = self
            .idler
            .state(&item.namespace, &item.cluster_url)
            .await
            .map_err(|e| FlowError::new(GatewayErrorCode::LifecycleUnreachable, e.to_string()))?;

        if state == PodState::Running {
            return Ok(Some(UiOutcome::Forward {
                item,
                session_key: Some(session_key.to_string()),
            }));
        }

        // Pod went down under the session; wake it, drop the stale
        // route, and force re-authentication
        debug!(namespace = %item.namespace, state = %state, "Cached session route is stale");
        if let Err(e) = self.idler.wake(&item.namespace, &item.cluster_url).await {
            warn!(namespace = %item.namespace, error = %e, "Wake request failed");
        }
        self.session_cache.remove(session_key);
        Ok(None)
    }

    /// Step 3: request carries an idled-marker cookie
    async fn idled_session(
        &self,
        parts: &Parts,
        item: CacheItem,
        mut set_cookies: Vec<HeaderValue>,
    ) -> Result<UiOutcome, FlowError> {
        let namespace = Namespace {
            cluster_url: item.cluster_url.clone(),
            name: item.namespace.clone(),
            kind: "jenkins".to_string(),
            state: String::new(),
        };
        let pod = self.controller(namespace);

        let (state, _) = pod.start().await.map_err(|e| {
            FlowError::new(GatewayErrorCode::LifecycleUnreachable, e.to_string())
        })?;

        if state != PodState::Running {
            return Ok(UiOutcome::Hold { set_cookies });
        }

        // The idler can report Running before the route actually serves
        // traffic; only a probe that gets an answer proves it is up
        match pod.login(None).await {
            Ok((status, _))
                if status == StatusCode::OK || status == StatusCode::FORBIDDEN =>
            {
                debug!(namespace = %item.namespace, "Route is answering, forcing re-auth");
                set_cookies.push(cookies::expire_cookie(&self.idled_cookie));
                set_cookies.extend(cookies::expire_matching(&parts.headers, |n| {
                    n.starts_with(&self.session_prefix)
                }));
                Ok(UiOutcome::Redirect {
                    location: client_url(parts),
                    set_cookies,
                })
            }
            _ => Ok(UiOutcome::Hold { set_cookies }),
        }
    }

    /// Step 4: nothing resolved a route; send the user to login
    fn login_redirect(&self, parts: &Parts, mut set_cookies: Vec<HeaderValue>) -> UiOutcome {
        set_cookies.extend(cookies::expire_matching(&parts.headers, |name| {
            name.starts_with(&self.session_prefix) || name == self.idled_cookie
        }));
        UiOutcome::Redirect {
            location: self.tokens.redirect_url_for(&client_url(parts)),
            set_cookies,
        }
    }

    fn controller(&self, namespace: Namespace) -> PodController {
        PodController::new(namespace, Arc::clone(&self.idler), self.http.clone())
    }
}

/// Scheme the client reached the platform router on. A TLS-terminating
/// router sets X-Forwarded-Proto; redirects must not downgrade to http.
fn forwarded_scheme(parts: &Parts) -> &str {
    parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http")
}

/// Reconstruct the client-visible URL of a request
fn client_url(parts: &Parts) -> String {
    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", forwarded_scheme(parts), host, path)
}

/// Read a query parameter from the request URI
fn query_param(parts: &Parts, name: &str) -> Option<String> {
    parts.uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// The client URL with the one-time token parameter removed
fn strip_token_param(parts: &Parts) -> String {
    let scheme = forwarded_scheme(parts);
    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let path = parts.uri.path();

    let remaining: Vec<&str> = parts
        .uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with(&format!("{}=", TOKEN_PARAM)))
        .collect();

    if remaining.is_empty() {
        format!("{}://{}{}", scheme, host, path)
    } else {
        format!("{}://{}{}?{}", scheme, host, path, remaining.join("&"))
    }
}
