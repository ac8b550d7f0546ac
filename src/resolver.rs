//! Identity and namespace resolution
//!
//! Maps a repository clone URL (webhook path) or a bearer token (UI
//! path) to the tenant's monitored jenkins namespace. Clone-URL results
//! are cached with a long TTL so repeated webhooks for the same
//! repository skip the code-hosting and tenant directory round trips.

use crate::cache::TtlCache;
use crate::clients::{CodeHosting, Namespace, TenantDirectory, TokenService};
use crate::error::ResolveError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Namespace type the gateway fronts
const MONITORED_TYPE: &str = "jenkins";

pub struct Resolver {
    tenant: Arc<dyn TenantDirectory>,
    code_hosting: Arc<dyn CodeHosting>,
    tokens: Arc<dyn TokenService>,
    repo_cache: Arc<TtlCache<Namespace>>,
    max_attempts: u32,
    backoff: Duration,
}

impl Resolver {
    pub fn new(
        tenant: Arc<dyn TenantDirectory>,
        code_hosting: Arc<dyn CodeHosting>,
        tokens: Arc<dyn TokenService>,
        repo_cache: Arc<TtlCache<Namespace>>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            tenant,
            code_hosting,
            tokens,
            repo_cache,
            max_attempts,
            backoff,
        }
    }

    /// Resolve a repository clone URL to its jenkins namespace, cache-first
    pub async fn resolve_by_repo_url(&self, clone_url: &str) -> Result<Namespace, ResolveError> {
        if let Some(namespace) = self.repo_cache.get(clone_url) {
            debug!(clone_url, namespace = %namespace.name, "Namespace cache hit");
            return Ok(namespace);
        }

        let owner = self.code_hosting.resolve_owner(clone_url).await?;
        if owner.trim().is_empty() {
            return Err(ResolveError::OwnerNotFound);
        }

        let namespaces = self.tenant.tenant_info(&owner).await?;
        let namespace = select_monitored(namespaces)
            .ok_or_else(|| ResolveError::NamespaceNotFound(owner.clone()))?;

        debug!(
            clone_url,
            owner,
            namespace = %namespace.name,
            cluster = %namespace.cluster_url,
            "Resolved repository to namespace"
        );
        self.repo_cache.insert(clone_url, namespace.clone());
        Ok(namespace)
    }

    /// Resolve a repository URL with bounded retries.
    ///
    /// Used on the webhook path, where losing an event is worse than a
    /// slow response. Terminal errors (no owner, no namespace) are not
    /// retried.
    pub async fn resolve_by_repo_url_with_retry(
        &self,
        clone_url: &str,
    ) -> Result<Namespace, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.resolve_by_repo_url(clone_url).await {
                Ok(namespace) => return Ok(namespace),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        clone_url,
                        attempts = attempt,
                        error = %e,
                        "Giving up on namespace resolution"
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(clone_url, attempt, error = %e, "Resolution failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Resolve a bearer token to the user's jenkins namespace.
    ///
    /// No caching at this layer; the UI flow caches the resulting route
    /// under the session cookie instead.
    pub async fn resolve_by_token(&self, token: &str) -> Result<Namespace, ResolveError> {
        let user_id = self.tokens.uid_from_token(token).await?;
        let namespaces = self.tenant.tenant_info(&user_id).await?;
        select_monitored(namespaces).ok_or(ResolveError::NamespaceNotFound(user_id))
    }
}

fn select_monitored(namespaces: Vec<Namespace>) -> Option<Namespace> {
    namespaces.into_iter().find(|ns| ns.kind == MONITORED_TYPE)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::clients::Namespace;

    fn resolver_with(
        tenant: Arc<FakeTenant>,
        code_hosting: Arc<FakeCodeHosting>,
    ) -> Resolver {
        Resolver::new(
            tenant,
            code_hosting,
            Arc::new(FakeTokens::for_user("user-42")),
            Arc::new(TtlCache::new(Duration::from_secs(60))),
            3,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_resolve_by_repo_url() {
        let tenant = Arc::new(FakeTenant::with(vec![
            Namespace {
                kind: "che".to_string(),
                ..jenkins_namespace("acme-che")
            },
            jenkins_namespace("acme-jenkins"),
        ]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("acme"));
        let resolver = resolver_with(tenant, hosting);

        let ns = resolver
            .resolve_by_repo_url("https://example.com/acme/repo.git")
            .await
            .unwrap();
        assert_eq!(ns.name, "acme-jenkins");
        assert_eq!(ns.kind, "jenkins");
    }

    #[tokio::test]
    async fn test_cache_short_circuits_resolution() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("acme"));
        let resolver = resolver_with(Arc::clone(&tenant), Arc::clone(&hosting));

        let url = "https://example.com/acme/repo.git";
        resolver.resolve_by_repo_url(url).await.unwrap();
        resolver.resolve_by_repo_url(url).await.unwrap();

        // Second call within the TTL window hits the cache only
        assert_eq!(hosting.call_count(), 1);
        assert_eq!(tenant.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_owner_is_not_found() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("   "));
        let resolver = resolver_with(tenant, hosting);

        let err = resolver
            .resolve_by_repo_url("https://example.com/acme/repo.git")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::OwnerNotFound));
    }

    #[tokio::test]
    async fn test_no_jenkins_namespace() {
        let tenant = Arc::new(FakeTenant::with(vec![Namespace {
            kind: "che".to_string(),
            ..jenkins_namespace("acme-che")
        }]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("acme"));
        let resolver = resolver_with(tenant, hosting);

        let err = resolver
            .resolve_by_repo_url("https://example.com/acme/repo.git")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NamespaceNotFound(owner) if owner == "acme"));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("acme").failing_first(2));
        let resolver = resolver_with(tenant, Arc::clone(&hosting));

        let ns = resolver
            .resolve_by_repo_url_with_retry("https://example.com/acme/repo.git")
            .await
            .unwrap();
        assert_eq!(ns.name, "acme-jenkins");
        assert_eq!(hosting.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_terminal_errors() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let hosting = Arc::new(FakeCodeHosting::with_owner(""));
        let resolver = resolver_with(tenant, Arc::clone(&hosting));

        let err = resolver
            .resolve_by_repo_url_with_retry("https://example.com/acme/repo.git")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::OwnerNotFound));
        assert_eq!(hosting.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let hosting = Arc::new(FakeCodeHosting::with_owner("acme").failing_first(100));
        let resolver = resolver_with(tenant, Arc::clone(&hosting));

        let err = resolver
            .resolve_by_repo_url_with_retry("https://example.com/acme/repo.git")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Upstream(_)));
        assert_eq!(hosting.call_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_by_token() {
        let tenant = Arc::new(FakeTenant::with(vec![jenkins_namespace("acme-jenkins")]));
        let tokens = Arc::new(FakeTokens::for_user("user-42"));
        let resolver = Resolver::new(
            Arc::clone(&tenant) as Arc<dyn TenantDirectory>,
            Arc::new(FakeCodeHosting::with_owner("unused")),
            Arc::clone(&tokens) as Arc<dyn TokenService>,
            Arc::new(TtlCache::new(Duration::from_secs(60))),
            3,
            Duration::from_millis(1),
        );

        let ns = resolver.resolve_by_token("t0ken").await.unwrap();
        assert_eq!(ns.name, "acme-jenkins");
        assert_eq!(tenant.call_count(), 1);
    }
}
