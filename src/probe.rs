//! Readiness probing for child processes
//!
//! Readiness means "the port accepts connections". When a health path is
//! configured the probe additionally requires a 2xx answer to `GET <path>`.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::trace;

/// Default readiness poll cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall readiness deadline
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of waiting for a child to accept connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Deadline passed while the child was still alive
    TimedOut,
    /// Child exited before it ever answered
    Exited,
}

/// Bounded liveness checks against `127.0.0.1:<port>`
#[derive(Debug, Clone, Default)]
pub struct Prober {
    health_path: Option<String>,
}

impl Prober {
    /// Prober that only checks whether the port accepts TCP connections
    pub fn tcp() -> Self {
        Self { health_path: None }
    }

    /// Prober that issues `GET <path>` and expects a 2xx status
    pub fn http(path: impl Into<String>) -> Self {
        Self {
            health_path: Some(path.into()),
        }
    }

    pub fn health_path(&self) -> Option<&str> {
        self.health_path.as_deref()
    }

    /// Single probe bounded by `timeout`. Connection failures and timeouts
    /// collapse to `false`.
    pub async fn probe(&self, port: u16, timeout: Duration) -> bool {
        let check = async {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
            match self.health_path {
                None => Some(true),
                Some(ref path) => Some(http_status_ok(stream, port, path).await),
            }
        };

        let reachable = matches!(tokio::time::timeout(timeout, check).await, Ok(Some(true)));
        trace!(port, reachable, "Readiness probe");
        reachable
    }

    /// Poll `probe` every `poll_interval` until it succeeds or `overall_timeout`
    /// elapses.
    pub async fn await_ready(
        &self,
        port: u16,
        overall_timeout: Duration,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> bool {
        await_ready_with(
            || self.probe(port, probe_timeout),
            overall_timeout,
            poll_interval,
        )
        .await
    }

    /// Like [`await_ready`](Prober::await_ready), but gives up as soon as
    /// `alive` reports the child has exited.
    pub async fn await_ready_while<A>(
        &self,
        port: u16,
        overall_timeout: Duration,
        poll_interval: Duration,
        probe_timeout: Duration,
        alive: A,
    ) -> Readiness
    where
        A: FnMut() -> bool,
    {
        await_ready_or_exit(
            || self.probe(port, probe_timeout),
            alive,
            overall_timeout,
            poll_interval,
        )
        .await
    }
}

/// Generic readiness loop.
///
/// Each waiter owns its own loop state; nothing is shared between concurrent
/// callers. Sleeps are clamped to the deadline, so a `false` result arrives
/// no later than one probe after `overall_timeout`.
pub async fn await_ready_with<F, Fut>(probe: F, overall_timeout: Duration, poll_interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    await_ready_or_exit(probe, || true, overall_timeout, poll_interval).await == Readiness::Ready
}

/// Readiness loop that also checks `alive` after every failed probe
pub async fn await_ready_or_exit<F, Fut, A>(
    mut probe: F,
    mut alive: A,
    overall_timeout: Duration,
    poll_interval: Duration,
) -> Readiness
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    A: FnMut() -> bool,
{
    let deadline = Instant::now() + overall_timeout;

    loop {
        if probe().await {
            return Readiness::Ready;
        }

        if !alive() {
            return Readiness::Exited;
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut;
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

async fn http_status_ok(mut stream: TcpStream, port: u16, path: &str) -> bool {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );

    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await.is_err() {
        return false;
    }

    // Format: "HTTP/1.1 200 OK\r\n"
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(false)
}
