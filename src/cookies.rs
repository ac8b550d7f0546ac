//! Cookie helpers for session and idled-marker state
//!
//! Pure functions over request cookie sets and Set-Cookie lists. A
//! "session" cookie is identified by a name prefix and maps to a cached
//! routing record once backend login succeeds; the "idled" marker cookie
//! has an exact name and a random value used purely as a cache key, not
//! as a security token.

use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Epoch expiry used to delete cookies on the client
const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Length of the random idled-marker cookie value
const IDLED_VALUE_LEN: usize = 32;

/// Parse all cookies from a request header map into (name, value) pairs
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.to_string(), value.to_string()));
            }
        }
    }
    cookies
}

/// Find the session cookie (name-prefix match) in a request
pub fn session_cookie(headers: &HeaderMap, prefix: &str) -> Option<(String, String)> {
    request_cookies(headers)
        .into_iter()
        .find(|(name, _)| name.starts_with(prefix))
}

/// Find the idled-marker cookie (exact name match) in a request
pub fn idled_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    request_cookies(headers)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, value)| value)
}

/// Build a Set-Cookie header value that expires the named cookie
pub fn expire_cookie(name: &str) -> HeaderValue {
    let raw = format!("{}=; Path=/; Expires={}", name, EPOCH_EXPIRES);
    HeaderValue::from_str(&raw).expect("cookie names are header-safe")
}

/// Build Set-Cookie values expiring every request cookie matching the predicate
pub fn expire_matching<F>(headers: &HeaderMap, pred: F) -> Vec<HeaderValue>
where
    F: Fn(&str) -> bool,
{
    request_cookies(headers)
        .iter()
        .filter(|(name, _)| pred(name))
        .map(|(name, _)| expire_cookie(name))
        .collect()
}

/// Mint a fresh idled-marker cookie with a random, unguessable value.
///
/// Returns the Set-Cookie header value and the raw cookie value (the
/// cache key the caller stores the routing record under).
pub fn new_idled_cookie(name: &str) -> (HeaderValue, String) {
    let value: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(IDLED_VALUE_LEN)
        .map(char::from)
        .collect();
    let raw = format!("{}={}; Path=/; HttpOnly", name, value);
    let header = HeaderValue::from_str(&raw).expect("alphanumeric cookie value is header-safe");
    (header, value)
}

/// Pick the session cookie out of a backend login response's Set-Cookie list.
///
/// The full list is re-emitted to the client by the caller; this only
/// extracts the (name, value) pair used to key the session cache.
pub fn session_cookie_from_login(set_cookies: &[String], prefix: &str) -> Option<(String, String)> {
    for raw in set_cookies {
        let first = raw.split(';').next().unwrap_or("");
        if let Some((name, value)) = first.split_once('=') {
            if name.trim().starts_with(prefix) {
                return Some((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn test_request_cookies_parsing() {
        let headers = headers_with_cookie("JSESSIONID.abc=xyz; JenkinsIdled=r4nd0m; other=1");
        let cookies = request_cookies(&headers);

        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0], ("JSESSIONID.abc".to_string(), "xyz".to_string()));
        assert_eq!(cookies[1], ("JenkinsIdled".to_string(), "r4nd0m".to_string()));
    }

    #[test]
    fn test_session_cookie_prefix_match() {
        let headers = headers_with_cookie("other=1; JSESSIONID.node1=abc123");
        let (name, value) = session_cookie(&headers, "JSESSIONID").unwrap();
        assert_eq!(name, "JSESSIONID.node1");
        assert_eq!(value, "abc123");
    }

    #[test]
    fn test_idled_cookie_exact_match() {
        let headers = headers_with_cookie("JenkinsIdledX=no; JenkinsIdled=yes");
        assert_eq!(idled_cookie(&headers, "JenkinsIdled").unwrap(), "yes");
        assert!(idled_cookie(&headers, "Missing").is_none());
    }

    #[test]
    fn test_expire_cookie_sets_epoch() {
        let header = expire_cookie("JSESSIONID.node1");
        let raw = header.to_str().unwrap();
        assert!(raw.starts_with("JSESSIONID.node1=;"));
        assert!(raw.contains("Expires=Thu, 01 Jan 1970"));
    }

    #[test]
    fn test_expire_matching() {
        let headers = headers_with_cookie("JSESSIONID.a=1; JenkinsIdled=2; other=3");
        let expired = expire_matching(&headers, |name| {
            name.starts_with("JSESSIONID") || name == "JenkinsIdled"
        });

        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn test_new_idled_cookie_is_random() {
        let (header, value) = new_idled_cookie("JenkinsIdled");
        let (_, value2) = new_idled_cookie("JenkinsIdled");

        assert_eq!(value.len(), IDLED_VALUE_LEN);
        assert_ne!(value, value2);
        assert!(header
            .to_str()
            .unwrap()
            .starts_with(&format!("JenkinsIdled={}", value)));
    }

    #[test]
    fn test_session_cookie_from_login() {
        let set_cookies = vec![
            "remember-me=deleted; Path=/".to_string(),
            "JSESSIONID.node1=s3ss10n; Path=/; HttpOnly".to_string(),
        ];
        let (name, value) = session_cookie_from_login(&set_cookies, "JSESSIONID").unwrap();
        assert_eq!(name, "JSESSIONID.node1");
        assert_eq!(value, "s3ss10n");
    }

    #[test]
    fn test_session_cookie_from_login_absent() {
        let set_cookies = vec!["remember-me=deleted; Path=/".to_string()];
        assert!(session_cookie_from_login(&set_cookies, "JSESSIONID").is_none());
    }
}
