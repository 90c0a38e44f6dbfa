//! Error codes and HTML error pages for the gateway
//!
//! Every failure that reaches an external caller becomes an HTML page with a
//! stable status code and an `X-Gateway-Error` header. Internal details are
//! logged, never rendered.

use crate::html;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Response body type used throughout the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Requested application is not configured
    UnknownApplication,
    /// Child process could not be spawned
    SpawnFailed,
    /// Required query or form parameter missing
    MissingParameter,
    /// No route matches the request
    NotFound,
    /// Child was ready but the connection failed
    ConnectionFailed,
    /// Child did not answer within the request timeout
    RequestTimeout,
    /// Gateway is stopping and starts no new children
    ShuttingDown,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownApplication => StatusCode::NOT_FOUND,
            GatewayErrorCode::SpawnFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::MissingParameter => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownApplication => "UNKNOWN_APPLICATION",
            GatewayErrorCode::SpawnFailed => "SPAWN_FAILED",
            GatewayErrorCode::MissingParameter => "MISSING_PARAMETER",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Page heading shown to the user
    pub fn title(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownApplication => "Unknown application",
            GatewayErrorCode::SpawnFailed => "Application failed to start",
            GatewayErrorCode::MissingParameter => "Bad request",
            GatewayErrorCode::NotFound => "Page not found",
            GatewayErrorCode::ConnectionFailed => "Application unreachable",
            GatewayErrorCode::RequestTimeout => "Application timed out",
            GatewayErrorCode::ShuttingDown => "Shutting down",
        }
    }
}

/// Wrap a static or owned payload as a gateway body
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create an HTML error page with the X-Gateway-Error header
pub fn html_error_response(code: GatewayErrorCode, message: impl AsRef<str>) -> Response<GatewayBody> {
    let page = html::error_page(code.status_code().as_u16(), code.title(), message.as_ref());

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(full_body(page))
        .expect("valid response with StatusCode enum and static headers")
}
