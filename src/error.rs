//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Header carrying the failure class on proxy-generated responses
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Errors raised by the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The backend executable could not be launched at all
    #[error("failed to spawn backend '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error codes for proxy-generated responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Backend could not be confirmed healthy
    BackendUnavailable,
    /// Network-level failure talking to the backend
    UpstreamFailed,
    /// Request method is not forwarded
    MethodNotAllowed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// 405 response listing the forwarded methods
pub fn method_not_allowed(allowed: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = text_error_response(
        ProxyErrorCode::MethodNotAllowed,
        "Method not allowed",
    );
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allowed));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::UpstreamFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_text_error_response() {
        let response = text_error_response(ProxyErrorCode::BackendUnavailable, "Backend down");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get(X_PROXY_ERROR).unwrap(),
            "BACKEND_UNAVAILABLE"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Backend down");
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = method_not_allowed("GET, POST");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, POST");
        assert_eq!(
            response.headers().get(X_PROXY_ERROR).unwrap(),
            "METHOD_NOT_ALLOWED"
        );
    }

    #[test]
    fn test_spawn_error_message() {
        let err = SupervisorError::Spawn {
            command: "/missing/server".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };

        assert_eq!(
            err.to_string(),
            "failed to spawn backend '/missing/server': not found"
        );
    }
}
