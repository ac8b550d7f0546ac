//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors from identity/namespace resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The code-hosting lookup returned no owner for the clone URL
    #[error("repository owner not found or empty")]
    OwnerNotFound,
    /// The tenant directory had no monitored namespace for the owner
    #[error("no jenkins namespace found for owner '{0}'")]
    NamespaceNotFound(String),
    /// A transport or protocol failure talking to an upstream service
    #[error("upstream lookup failed: {0}")]
    Upstream(#[from] anyhow::Error),
}

impl ResolveError {
    /// Resolution outcomes that retrying cannot fix
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResolveError::OwnerNotFound | ResolveError::NamespaceNotFound(_)
        )
    }
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Could not resolve the request to a tenant namespace
    ResolutionFailed,
    /// The lifecycle backend could not be reached
    LifecycleUnreachable,
    /// The durable store rejected an operation
    StoreFailure,
    /// The backend login probe failed
    LoginFailed,
    /// The request payload could not be read or parsed
    BadPayload,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ResolutionFailed => StatusCode::NOT_FOUND,
            GatewayErrorCode::BadPayload => StatusCode::BAD_REQUEST,
            GatewayErrorCode::LifecycleUnreachable
            | GatewayErrorCode::StoreFailure
            | GatewayErrorCode::LoginFailed
            | GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ResolutionFailed => "RESOLUTION_FAILED",
            GatewayErrorCode::LifecycleUnreachable => "LIFECYCLE_UNREACHABLE",
            GatewayErrorCode::StoreFailure => "STORE_FAILURE",
            GatewayErrorCode::LoginFailed => "LOGIN_FAILED",
            GatewayErrorCode::BadPayload => "BAD_PAYLOAD",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// An error bubbling out of a request flow.
///
/// Inner components return these instead of writing to the response;
/// only the dispatcher boundary turns them into HTTP.
#[derive(Debug)]
pub struct FlowError {
    pub code: GatewayErrorCode,
    pub message: String,
}

impl FlowError {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_header_value(), self.message)
    }
}

impl From<ResolveError> for FlowError {
    fn from(err: ResolveError) -> Self {
        let code = if err.is_terminal() {
            GatewayErrorCode::ResolutionFailed
        } else {
            GatewayErrorCode::InternalError
        };
        FlowError::new(code, err.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::ResolutionFailed.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayErrorCode::BadPayload.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayErrorCode::LifecycleUnreachable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            GatewayErrorCode::ResolutionFailed,
            "No namespace for owner: acme",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"RESOLUTION_FAILED\""));
        assert!(json.contains("\"message\":\"No namespace for owner: acme\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response =
            json_error_response(GatewayErrorCode::InternalError, "Something went wrong");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_resolve_error_terminality() {
        assert!(ResolveError::OwnerNotFound.is_terminal());
        assert!(ResolveError::NamespaceNotFound("acme".into()).is_terminal());
        assert!(!ResolveError::Upstream(anyhow::anyhow!("connection refused")).is_terminal());
    }
}
