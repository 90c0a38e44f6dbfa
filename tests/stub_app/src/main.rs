//! Minimal child application for integration tests and local smoke runs
//!
//! Accepts the same invocation the gateway uses for real children:
//!
//! ```text
//! stub-app run <script> --server.port <port> [--server.headless true]
//! ```
//!
//! Environment variables:
//! - STUB_STARTUP_DELAY_MS: delay before binding the port (default: 0)
//!
//! Routes:
//! - `/` fixed payload naming the script
//! - `/health` plain `ok`
//! - `/error` status 500
//! - `/target` echoes the request target
//! - `/headers` echoes request headers as JSON
//! - `/env/<NAME>` value of an environment variable, 404 when unset
//! - `/ws` with an `Upgrade` header: `101`, then echoes every byte back

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct StubArgs {
    script: String,
    port: u16,
    headless: bool,
}

fn parse_args(args: &[String]) -> Result<StubArgs, String> {
    let mut iter = args.iter();

    match iter.next().map(String::as_str) {
        Some("run") => {}
        other => return Err(format!("expected 'run' subcommand, got {:?}", other)),
    }

    let script = iter.next().ok_or("missing script path")?.clone();
    let mut port = None;
    let mut headless = false;

    while let Some(flag) = iter.next() {
        let value = iter.next().ok_or_else(|| format!("missing value for {}", flag))?;
        match flag.as_str() {
            "--server.port" => {
                port = Some(value.parse::<u16>().map_err(|e| format!("invalid port '{}': {}", value, e))?);
            }
            "--server.headless" => headless = value == "true",
            _ => {}
        }
    }

    Ok(StubArgs {
        script,
        port: port.ok_or("missing --server.port")?,
        headless,
    })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let stub = match parse_args(&args) {
        Ok(stub) => stub,
        Err(e) => {
            eprintln!("stub-app: {}", e);
            std::process::exit(2);
        }
    };

    let startup_delay: u64 = env::var("STUB_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("stub-app: sleeping for {}ms before binding", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = match TcpListener::bind(("127.0.0.1", stub.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("stub-app: failed to bind port {}: {}", stub.port, e);
            std::process::exit(1);
        }
    };

    eprintln!(
        "stub-app: serving {} on port {} (headless: {})",
        stub.script, stub.port, stub.headless
    );

    let script = stub.script;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let script = script.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &script).await;
                });
            }
            Err(e) => eprintln!("stub-app: accept error: {}", e),
        }
    }
}

async fn handle_connection(mut stream: TcpStream, script: &str) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let Ok(request) = std::str::from_utf8(&buf) else {
        return;
    };

    let mut lines = request.lines();
    let Some(request_line) = lines.next() else {
        return;
    };
    let target = request_line.split(' ').nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/");
    let headers: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();

    if path == "/ws" && has_header(&headers, "upgrade") {
        let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4).unwrap_or(buf.len());
        let early = buf[head_end..].to_vec();
        echo_upgraded(stream, early).await;
        return;
    }

    let (status, content_type, body) = match path {
        "/" => ("200 OK", "text/plain", format!("stub app: {}\n", script)),
        "/health" => ("200 OK", "text/plain", "ok".to_string()),
        "/error" => ("500 Internal Server Error", "text/plain", "error".to_string()),
        "/target" => ("200 OK", "text/plain", target.to_string()),
        "/headers" => ("200 OK", "application/json", headers_json(&headers)),
        p if p.starts_with("/env/") => match env::var(&p["/env/".len()..]) {
            Ok(value) => ("200 OK", "text/plain", value),
            Err(_) => ("404 Not Found", "text/plain", "unset".to_string()),
        },
        _ => ("404 Not Found", "text/plain", "not found".to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn has_header(headers: &[&str], name: &str) -> bool {
    headers
        .iter()
        .filter_map(|h| h.split_once(':'))
        .any(|(n, _)| n.trim().eq_ignore_ascii_case(name))
}

async fn echo_upgraded(mut stream: TcpStream, early: Vec<u8>) {
    let handshake = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    if stream.write_all(handshake.as_bytes()).await.is_err() {
        return;
    }
    if !early.is_empty() && stream.write_all(&early).await.is_err() {
        return;
    }

    let mut temp = [0u8; 1024];
    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if stream.write_all(&temp[..n]).await.is_err() {
            return;
        }
    }
}

fn headers_json(headers: &[&str]) -> String {
    let fields: Vec<String> = headers
        .iter()
        .filter_map(|h| h.split_once(':'))
        .map(|(name, value)| {
            format!(
                "\"{}\":\"{}\"",
                name.trim().to_lowercase(),
                value.trim().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
        .collect();
    format!("{{{}}}", fields.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let stub = parse_args(&args(&[
            "run",
            "movies.py",
            "--server.port",
            "8502",
            "--server.headless",
            "true",
        ]))
        .unwrap();
        assert_eq!(stub.script, "movies.py");
        assert_eq!(stub.port, 8502);
        assert!(stub.headless);
    }

    #[test]
    fn test_parse_args_rejects_missing_port() {
        assert!(parse_args(&args(&["run", "movies.py"])).is_err());
        assert!(parse_args(&args(&["serve", "movies.py"])).is_err());
        assert!(parse_args(&args(&["run", "movies.py", "--server.port", "x"])).is_err());
    }

    #[test]
    fn test_has_header() {
        assert!(has_header(&["Host: x", "Upgrade: websocket"], "upgrade"));
        assert!(!has_header(&["Host: x"], "upgrade"));
    }

    #[test]
    fn test_headers_json() {
        let json = headers_json(&["Host: example", "X-Quote: a\"b"]);
        assert_eq!(json, "{\"host\":\"example\",\"x-quote\":\"a\\\"b\"}");
    }
}
