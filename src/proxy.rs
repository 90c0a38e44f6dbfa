use crate::error::{full_body, html_error_response, GatewayBody, GatewayErrorCode};
use crate::html;
use crate::pool::{ConnectionPool, PoolError};
use crate::probe::{Prober, Readiness};
use crate::process::{AppState, Supervisor, SupervisorError};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Set on placeholder pages so clients can tell them from child responses
pub const X_GATEWAY_STATE: &str = "x-gateway-state";
/// Largest upgrade response head accepted from a child
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// A request on its way to a child
pub struct ProxyRequest {
    pub request: Request<Incoming>,
    /// Path and query as the child should see them
    pub path_and_query: String,
    pub client_addr: SocketAddr,
    pub request_id: String,
}

/// Result of proxying one request
pub enum ProxyOutcome {
    /// Child did not become reachable before the startup deadline
    NotReady { display_name: String },
    /// Child's response, untouched
    Forwarded(Response<GatewayBody>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Failed to forward request to '{app}': {source}")]
    Connection {
        app: String,
        #[source]
        source: PoolError,
    },

    #[error("'{app}' did not respond within {} seconds", .timeout.as_secs())]
    Timeout { app: String, timeout: Duration },

    #[error("Upgrade to '{app}' failed: {reason}")]
    Upgrade { app: String, reason: String },
}

impl ProxyError {
    /// HTML page for the external caller. Internal details stay in the logs.
    pub fn into_response(self) -> Response<GatewayBody> {
        match self {
            ProxyError::Supervisor(SupervisorError::UnknownApplication(name)) => html_error_response(
                GatewayErrorCode::UnknownApplication,
                format!("No application named \"{}\" is configured.", name),
            ),
            ProxyError::Supervisor(SupervisorError::SpawnFailed { name, .. }) => html_error_response(
                GatewayErrorCode::SpawnFailed,
                format!("\"{}\" could not be started. Please try again later.", name),
            ),
            ProxyError::Supervisor(SupervisorError::ShuttingDown) => html_error_response(
                GatewayErrorCode::ShuttingDown,
                "The gateway is shutting down.",
            ),
            ProxyError::Connection { app, .. } | ProxyError::Upgrade { app, .. } => html_error_response(
                GatewayErrorCode::ConnectionFailed,
                format!("\"{}\" is running but could not be reached.", app),
            ),
            ProxyError::Timeout { app, timeout } => html_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("\"{}\" did not respond within {} seconds.", app, timeout.as_secs()),
            ),
        }
    }
}

impl ProxyOutcome {
    pub fn into_response(self) -> Response<GatewayBody> {
        match self {
            ProxyOutcome::Forwarded(response) => response,
            ProxyOutcome::NotReady { display_name } => placeholder_response(&display_name),
        }
    }
}

/// 200 page that reloads itself while the child starts
pub fn placeholder_response(display_name: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .header(X_GATEWAY_STATE, "starting")
        .body(full_body(html::placeholder_page(display_name)))
        .expect("valid response builder")
}

/// Starts children on demand and forwards traffic to them
pub struct ReverseProxy {
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
}

impl ReverseProxy {
    pub fn new(supervisor: Arc<Supervisor>, pool: Arc<ConnectionPool>) -> Self {
        Self { supervisor, pool }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Ensure the child for `app` is running, wait for it to accept
    /// connections, then forward exactly one request. Upgrade requests
    /// become a byte tunnel to the child.
    pub async fn handle(&self, app: &str, mut proxied: ProxyRequest) -> Result<ProxyOutcome, ProxyError> {
        let descriptor = self
            .supervisor
            .descriptor(app)
            .ok_or_else(|| SupervisorError::UnknownApplication(app.to_string()))?;

        if self.supervisor.ensure_started(app)? {
            info!(app, request_id = %proxied.request_id, "Cold start triggered by request");
        }

        let prober = match descriptor.health_path {
            Some(ref path) => Prober::http(path.clone()),
            None => Prober::tcp(),
        };

        let supervisor = &self.supervisor;
        let readiness = prober
            .await_ready_while(
                descriptor.port,
                descriptor.startup_timeout,
                descriptor.poll_interval,
                descriptor.probe_timeout,
                || !matches!(supervisor.status(app), Ok(AppState::Crashed)),
            )
            .await;

        match readiness {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                info!(
                    app,
                    port = descriptor.port,
                    timeout_secs = descriptor.startup_timeout.as_secs(),
                    "Child not ready yet, serving placeholder"
                );
                return Ok(ProxyOutcome::NotReady {
                    display_name: descriptor.display_name.clone(),
                });
            }
            Readiness::Exited => {
                error!(app, port = descriptor.port, "Child exited before accepting connections");
                return Err(SupervisorError::SpawnFailed {
                    name: app.to_string(),
                    reason: "exited before accepting connections".to_string(),
                }
                .into());
            }
        }

        self.supervisor.mark_ready(app);

        add_forwarding_headers(&mut proxied);

        if is_upgrade_request(&proxied.request) {
            return tunnel(app, descriptor.port, descriptor.request_timeout, proxied)
                .await
                .map(ProxyOutcome::Forwarded);
        }

        debug!(
            app,
            method = %proxied.request.method(),
            target = %proxied.path_and_query,
            request_id = %proxied.request_id,
            "Forwarding request"
        );

        let request_timeout = descriptor.request_timeout;
        let result = tokio::time::timeout(
            request_timeout,
            self.pool
                .send_request(proxied.request, descriptor.port, &proxied.path_and_query),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                if !response.status().is_success() {
                    debug!(app, status = %response.status(), "Passing through non-success response");
                }
                Ok(ProxyOutcome::Forwarded(response))
            }
            Ok(Err(e)) => {
                error!(app, port = descriptor.port, error = %e, "Failed to forward request");
                Err(ProxyError::Connection {
                    app: app.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    app,
                    port = descriptor.port,
                    timeout_secs = request_timeout.as_secs(),
                    "Request timed out"
                );
                Err(ProxyError::Timeout {
                    app: app.to_string(),
                    timeout: request_timeout,
                })
            }
        }
    }
}

/// Overwrite X-Forwarded-* rather than append; the gateway is the first hop.
fn add_forwarding_headers(proxied: &mut ProxyRequest) {
    let headers = proxied.request.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&proxied.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&proxied.client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// `Connection: upgrade` plus an `Upgrade` header
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request head for the child. Host is rewritten to the child.
fn build_upgrade_request<B>(req: &Request<B>, port: u16, path_and_query: &str) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    head.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));
    head.into_bytes()
}

/// Parse a response head: status plus headers
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let code = lines.next()?.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Read until the end of the response head. Returns the head and any bytes
/// the child already sent past it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "response head too large"));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "child closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Hand an upgrade request to the child and, on `101`, splice the two
/// connections together.
async fn tunnel(
    app: &str,
    port: u16,
    request_timeout: Duration,
    proxied: ProxyRequest,
) -> Result<Response<GatewayBody>, ProxyError> {
    let upgrade_failed = |reason: String| ProxyError::Upgrade {
        app: app.to_string(),
        reason,
    };

    let raw_request = build_upgrade_request(&proxied.request, port, &proxied.path_and_query);

    let handshake = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(&raw_request).await?;
        let (head, rest) = read_response_head(&mut stream).await?;
        Ok::<_, std::io::Error>((stream, head, rest))
    };

    let (child_stream, head, leftover) = match tokio::time::timeout(request_timeout, handshake).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => return Err(upgrade_failed(e.to_string())),
        Err(_) => {
            return Err(ProxyError::Timeout {
                app: app.to_string(),
                timeout: request_timeout,
            })
        }
    };

    let (status, headers) =
        parse_upgrade_response(&head).ok_or_else(|| upgrade_failed("invalid response head".to_string()))?;

    let mut response = Response::builder().status(status);
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), v);
        }
    }
    let response = response
        .body(full_body(Bytes::new()))
        .expect("valid response builder");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app, %status, "Child rejected upgrade request");
        return Ok(response);
    }

    info!(app, request_id = %proxied.request_id, "Upgrade accepted, tunnelling");

    let app = app.to_string();
    let request_id = proxied.request_id;
    let request = proxied.request;
    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => splice(upgraded, child_stream, leftover, &app, &request_id).await,
            Err(e) => error!(app, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}

async fn splice(client: Upgraded, mut child: TcpStream, leftover: Vec<u8>, app: &str, request_id: &str) {
    let mut client = TokioIo::new(client);

    if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
        return;
    }

    match tokio::io::copy_bidirectional(&mut client, &mut child).await {
        Ok((to_child, to_client)) => {
            debug!(app, request_id, to_child, to_client, "Tunnel closed");
        }
        Err(e) => {
            debug!(app, request_id, error = %e, "Tunnel closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_placeholder_response() {
        let response = placeholder_response("Movies App");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(X_GATEWAY_STATE).unwrap(), "starting");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("http-equiv=\"refresh\""));
        assert!(body.contains("Movies App"));
    }

    #[test]
    fn test_unknown_application_maps_to_404() {
        let response =
            ProxyError::from(SupervisorError::UnknownApplication("Nope".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(crate::error::X_GATEWAY_ERROR).unwrap(),
            "UNKNOWN_APPLICATION"
        );
    }

    #[test]
    fn test_spawn_failure_maps_to_503() {
        let err = ProxyError::from(SupervisorError::SpawnFailed {
            name: "Alpha".to_string(),
            reason: "/usr/bin/secret-path: No such file".to_string(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_timeout_maps_to_504() {
        let err = ProxyError::Timeout {
            app: "Alpha".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("30 seconds"));
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_exit_during_startup_maps_to_503() {
        let err = ProxyError::from(SupervisorError::SpawnFailed {
            name: "Alpha".to_string(),
            reason: "exited before accepting connections".to_string(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(crate::error::X_GATEWAY_ERROR).unwrap(),
            "SPAWN_FAILED"
        );
    }

    #[test]
    fn test_shutting_down_maps_to_503() {
        let response = ProxyError::from(SupervisorError::ShuttingDown).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(crate::error::X_GATEWAY_ERROR).unwrap(),
            "SHUTTING_DOWN"
        );
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let plain = Request::builder().header("connection", "keep-alive").body(()).unwrap();
        assert!(!is_upgrade_request(&plain));

        let missing_upgrade = Request::builder().header("connection", "upgrade").body(()).unwrap();
        assert!(!is_upgrade_request(&missing_upgrade));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/apps/Alpha/_stcore/stream")
            .header("host", "gateway.local")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();

        let raw = String::from_utf8(build_upgrade_request(&req, 8502, "/_stcore/stream")).unwrap();
        assert!(raw.starts_with("GET /_stcore/stream HTTP/1.1\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:8502\r\n"));
        assert!(!raw.contains("gateway.local"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));
        assert_eq!(headers.len(), 2);

        assert!(parse_upgrade_response(b"garbage").is_none());
    }
}
