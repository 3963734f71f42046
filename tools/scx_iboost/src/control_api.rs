// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: local HTTP control surface
// Copyright (c) 2025 The scx_iboost authors
//
// Minimal HTTP server on loopback exposing metrics and the tunables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::boost::CpuBoost;
use crate::config::Tunable;

const MAX_HEAD: usize = 8192;
const MAX_BODY: usize = 64 * 1024;

pub struct ControlApi {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlApi {
    pub fn start(port: u16, boost: Arc<CpuBoost>) -> Result<Self> {
        let bind_addr = format!("127.0.0.1:{}", port);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("control-api".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("Failed to create tokio runtime for control API: {}", e);
                        return;
                    }
                };
                rt.block_on(serve(bind_addr, boost, flag));
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for ControlApi {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

async fn serve(bind_addr: String, boost: Arc<CpuBoost>, shutdown: Arc<AtomicBool>) {
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API to {}: {}", bind_addr, e);
            return;
        }
    };
    info!("Control API listening on http://{}", bind_addr);

    while !shutdown.load(Ordering::Relaxed) {
        match tokio::time::timeout(Duration::from_millis(100), listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let boost = Arc::clone(&boost);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, boost).await {
                        debug!("Error handling connection from {}: {}", addr, e);
                    }
                });
            }
            Ok(Err(e)) => debug!("Accept error: {}", e),
            Err(_) => continue,
        }
    }
}

struct Request {
    method: String,
    path: String,
    body: String,
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read one request. The body is read up to its `Content-Length`, or is
/// whatever arrived with the head when the header is absent. `None` means
/// the peer closed without sending anything.
async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Request>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(end) = head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEAD {
            bail!("request head exceeds {} bytes", MAX_HEAD);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("connection closed inside request head");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut body = buf.split_off(end + 4);
    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    let mut lines = head.lines();
    let mut parts = lines.next().unwrap_or("").split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        bail!("malformed request line");
    };

    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.trim().parse::<usize>().context("invalid Content-Length"))
        .transpose()?;
    if let Some(len) = content_length {
        if len > MAX_BODY {
            bail!("request body exceeds {} bytes", MAX_BODY);
        }
        let have = body.len();
        if have < len {
            body.resize(len, 0);
            stream
                .read_exact(&mut body[have..])
                .await
                .context("connection closed inside request body")?;
        }
        body.truncate(len);
    }

    Ok(Some(Request {
        method: method.to_string(),
        path: target.split('?').next().unwrap_or(target).to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
}

async fn handle_connection<S>(mut stream: S, boost: Arc<CpuBoost>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (status, response) = match read_request(&mut stream).await {
        Ok(None) => return Ok(()),
        Ok(Some(req)) => {
            // Writes to `enabled` wait for timer callbacks to drain.
            tokio::task::spawn_blocking(move || route(&boost, &req.method, &req.path, &req.body))
                .await?
        }
        Err(e) => (400, json!({ "error": format!("{:#}", e) })),
    };
    send_response(&mut stream, status, &response.to_string()).await
}

fn tunables_json(boost: &CpuBoost) -> Value {
    let map: Map<String, Value> = Tunable::ALL
        .into_iter()
        .map(|t| (t.name().to_string(), Value::String(boost.read_tunable(t))))
        .collect();
    Value::Object(map)
}

/// Dispatch one request. Returns the status code and the JSON body.
pub fn route(boost: &CpuBoost, method: &str, path: &str, body: &str) -> (u16, Value) {
    if let Some(key) = path.strip_prefix("/tunables/") {
        let Ok(tunable) = key.parse::<Tunable>() else {
            return (404, json!({ "error": "Unknown tunable", "key": key }));
        };
        return match method {
            "GET" => (200, json!({ "key": key, "value": boost.read_tunable(tunable) })),
            "PUT" | "POST" => match boost.write_tunable(tunable, body) {
                Ok(()) => (200, json!({ "key": key, "value": boost.read_tunable(tunable) })),
                Err(e) => (400, json!({ "error": format!("{:#}", e), "key": key })),
            },
            _ => (405, json!({ "error": "Method not allowed" })),
        };
    }

    match (method, path) {
        ("GET", "/") => (
            200,
            json!({
                "api": format!("{} control API", crate::BOOST_NAME),
                "endpoints": {
                    "/metrics": "GET - Boost counters and live state",
                    "/tunables": "GET - All tunables",
                    "/tunables/<key>": "GET, PUT - Read or write one tunable",
                    "/health": "GET - Health check",
                }
            }),
        ),
        ("GET", "/metrics") => match serde_json::to_value(boost.metrics()) {
            Ok(v) => (200, v),
            Err(e) => (500, json!({ "error": format!("Failed to serialize metrics: {}", e) })),
        },
        ("GET", "/tunables") => (200, tunables_json(boost)),
        ("GET", "/health") => (
            200,
            json!({ "status": "healthy", "enabled": boost.params().enabled }),
        ),
        _ => (404, json!({ "error": "Not found", "path": path, "method": method })),
    }
}

async fn send_response<W: AsyncWrite + Unpin>(stream: &mut W, status_code: u16, body: &str) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status_code,
        status_text,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostParams;
    use crate::governor::mock::MockGovernor;
    use crate::governor::PolicyBounds;

    fn engine() -> Arc<CpuBoost> {
        let mock = Arc::new(MockGovernor::new(2, &[0, 1], PolicyBounds::default()));
        CpuBoost::new(&BoostParams::default(), mock.clone(), mock).unwrap()
    }

    #[test]
    fn reads_and_writes_tunables() {
        let boost = engine();
        let (code, v) = route(&boost, "GET", "/tunables/ib_duration_ms", "");
        assert_eq!(code, 200);
        assert_eq!(v["value"], "40");

        let (code, v) = route(&boost, "PUT", "/tunables/ib_duration_ms", "64\n");
        assert_eq!(code, 200);
        assert_eq!(v["value"], "64");
        assert_eq!(boost.params().ib_duration_ms, 64);

        let (code, _) = route(&boost, "PUT", "/tunables/ib_duration_ms", "0");
        assert_eq!(code, 400);
        assert_eq!(boost.params().ib_duration_ms, 64);
        boost.shutdown();
    }

    #[test]
    fn lists_all_tunables() {
        let boost = engine();
        let (code, v) = route(&boost, "GET", "/tunables", "");
        assert_eq!(code, 200);
        assert_eq!(v["ib_freqs"], "1190400 1190400");
        assert_eq!(v.as_object().map(|m| m.len()), Some(Tunable::ALL.len()));
        boost.shutdown();
    }

    #[test]
    fn unknown_paths_and_methods() {
        let boost = engine();
        assert_eq!(route(&boost, "GET", "/tunables/bogus", "").0, 404);
        assert_eq!(route(&boost, "DELETE", "/tunables/enabled", "").0, 405);
        assert_eq!(route(&boost, "GET", "/nope", "").0, 404);
        assert_eq!(route(&boost, "GET", "/metrics", "").0, 200);
        boost.shutdown();
    }

    #[tokio::test]
    async fn body_arriving_after_the_head_is_read_in_full() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            client
                .write_all(b"PUT /tunables/ib_freqs?x=1 HTTP/1.1\r\nHost: localhost\r\ncontent-length: 15\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"1500000 ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"900000").await.unwrap();
            client
        });

        let req = read_request(&mut server).await.unwrap().unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/tunables/ib_freqs");
        assert_eq!(req.body, "1500000 900000");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn malformed_and_empty_requests() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(read_request(&mut server).await.unwrap().is_none());

        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"PUT /tunables/enabled HTTP/1.1\r\nContent-Length: 4\r\n\r\n1")
            .await
            .unwrap();
        drop(client);
        assert!(read_request(&mut server).await.is_err());

        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nContent-Length: many\r\n\r\n")
            .await
            .unwrap();
        assert!(read_request(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn disabling_over_http_clears_boosts() {
        let boost = engine();
        boost.on_input_activity();

        let (mut client, server) = tokio::io::duplex(4096);
        let conn = tokio::spawn(handle_connection(server, Arc::clone(&boost)));
        client
            .write_all(b"PUT /tunables/enabled HTTP/1.1\r\nContent-Length: 2\r\n\r\n0\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        conn.await.unwrap().unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(r#"{"key":"enabled","value":"0"}"#));
        assert!(!boost.params().enabled);
        assert!(!boost.input_boost_running());
        assert_eq!(boost.metrics().stop_and_clear, 1);
        boost.shutdown();
    }
}
