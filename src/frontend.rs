//! Externally facing HTTP server
//!
//! Renders the landing page and routes application selections to the
//! supervisor and reverse proxy. Holds no state of its own; the only shared
//! state is the supervisor's process table.

use crate::error::{full_body, html_error_response, GatewayBody, GatewayErrorCode};
use crate::html;
use crate::process::SupervisorError;
use crate::proxy::{ProxyRequest, ReverseProxy, X_REQUEST_ID};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Query parameter naming the application on `/streamlit`
const APP_PARAM: &str = "app";
/// Form field naming the application on `/start-app`
const SELECTION_FIELD: &str = "selection";
/// Prefix for path-based pass-through routes
const APPS_PREFIX: &str = "/apps/";
/// Largest accepted `/start-app` form body
const MAX_FORM_BYTES: usize = 16 * 1024;

/// The front end HTTP server
pub struct FrontendServer {
    listener: TcpListener,
    proxy: Arc<ReverseProxy>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontendServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        proxy: Arc<ReverseProxy>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            proxy,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Front end listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let proxy = Arc::clone(&self.proxy);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, proxy).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front end shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, proxy: Arc<ReverseProxy>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { handle_request(req, proxy, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    proxy: Arc<ReverseProxy>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/") => landing_response(&proxy, StatusCode::OK, None),
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/status") => status_response(&proxy),
        (&Method::POST, "/start-app") => start_app(req, &proxy).await,
        (_, "/streamlit") => {
            let query = query.unwrap_or_default();
            match query_param(&query, APP_PARAM) {
                Some(app) => {
                    let remaining = strip_param(&query, APP_PARAM);
                    let target = if remaining.is_empty() {
                        "/".to_string()
                    } else {
                        format!("/?{}", remaining)
                    };
                    proxy_to(&proxy, &app, req, target, client_addr, request_id).await
                }
                None => html_error_response(
                    GatewayErrorCode::MissingParameter,
                    "Choose an application with ?app=<name>.",
                ),
            }
        }
        (_, p) if p.starts_with(APPS_PREFIX) => {
            let (app, rest) = split_app_path(&p[APPS_PREFIX.len()..]);
            let target = match query {
                Some(q) => format!("{}?{}", rest, q),
                None => rest.to_string(),
            };
            let app = decode_component(app).into_owned();
            proxy_to(&proxy, &app, req, target, client_addr, request_id).await
        }
        _ => html_error_response(GatewayErrorCode::NotFound, "There is nothing at this address."),
    };

    Ok(response)
}

async fn proxy_to(
    proxy: &ReverseProxy,
    app: &str,
    request: Request<Incoming>,
    path_and_query: String,
    client_addr: SocketAddr,
    request_id: String,
) -> Response<GatewayBody> {
    let proxied = ProxyRequest {
        request,
        path_and_query,
        client_addr,
        request_id,
    };

    match proxy.handle(app, proxied).await {
        Ok(outcome) => outcome.into_response(),
        Err(e) => {
            warn!(app, error = %e, "Proxy request failed");
            e.into_response()
        }
    }
}

/// Start a child without waiting for it, then show the landing page again
async fn start_app(req: Request<Incoming>, proxy: &ReverseProxy) -> Response<GatewayBody> {
    let body = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Unreadable start-app form");
            return html_error_response(GatewayErrorCode::MissingParameter, "The form could not be read.");
        }
    };

    let form = String::from_utf8_lossy(&body);
    let Some(selection) = query_param(&form, SELECTION_FIELD) else {
        return html_error_response(GatewayErrorCode::MissingParameter, "No application was selected.");
    };

    let supervisor = proxy.supervisor();
    match supervisor.ensure_started(&selection) {
        Ok(_) => {
            let display = supervisor
                .descriptor(&selection)
                .map(|d| d.display_name.as_str())
                .unwrap_or(selection.as_str());
            let message = format!(
                "✅ {} is running. Open it from the list below once it has started ⏳",
                display
            );
            landing_response(proxy, StatusCode::OK, Some(&message))
        }
        Err(SupervisorError::UnknownApplication(_)) => {
            landing_response(proxy, StatusCode::NOT_FOUND, Some("Invalid selection!"))
        }
        Err(e) => {
            error!(app = %selection, error = %e, "Start request failed");
            landing_response(
                proxy,
                StatusCode::SERVICE_UNAVAILABLE,
                Some("The application could not be started. Please try again later."),
            )
        }
    }
}

fn landing_response(proxy: &ReverseProxy, status: StatusCode, message: Option<&str>) -> Response<GatewayBody> {
    let page = html::landing_page(&proxy.supervisor().list(), message);
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(page))
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from_static(body.as_bytes())))
        .expect("valid response builder")
}

fn status_response(proxy: &ReverseProxy) -> Response<GatewayBody> {
    let supervisor = proxy.supervisor();
    let body = serde_json::json!({
        "apps": supervisor.list(),
        "spawns": supervisor.spawn_count(),
        "pool": proxy.pool().stats().snapshot(),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("valid response builder")
}

/// Split `Movies/static/app.js` into (`Movies`, `/static/app.js`)
fn split_app_path(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx..]),
        None => (path, "/"),
    }
}

/// Decode one `application/x-www-form-urlencoded` component
fn decode_component(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['+', '%']) {
        return Cow::Borrowed(raw);
    }
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => Cow::Owned(decoded.into_owned()),
        Err(_) => Cow::Owned(spaced),
    }
}

/// First value of `key` in a query string or urlencoded form body
fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k) == key).then(|| decode_component(v).into_owned())
        })
        .find(|v| !v.is_empty())
}

/// Query string with every `key` pair removed; other pairs stay byte-for-byte
fn strip_param(query: &str, key: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let k = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
            !pair.is_empty() && decode_component(k) != key
        })
        .collect::<Vec<_>>()
        .join("&")
}
