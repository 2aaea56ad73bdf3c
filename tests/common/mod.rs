//! Shared fixtures: a scripted HTTP server standing in for the model
//! providers, a fake daemon launcher and a stub authenticator.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use review_on_save::dispatch::hosted::Authenticator;
use review_on_save::dispatch::readiness::DaemonLauncher;
use review_on_save::error::ReviewError;

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Raw header block, lowercased.
    pub headers: String,
    pub body: String,
}

impl Request {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Scripted response: headers, then each chunk with `delay` before it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub chunks: Vec<String>,
    pub delay: Duration,
}

impl Reply {
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            chunks: vec![body.to_string()],
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            chunks: vec![format!("status {status}")],
            delay: Duration::ZERO,
        }
    }

    pub fn ndjson(lines: &[serde_json::Value]) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            chunks: lines.iter().map(|l| format!("{l}\n")).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn sse(payloads: &[&str]) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            chunks: payloads.iter().map(|p| format!("data: {p}\n\n")).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Helper: one NDJSON chat line carrying `content`.
pub fn ollama_token(content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "gemma3:latest",
        "message": {"role": "assistant", "content": content},
        "done": false
    })
}

pub fn ollama_done() -> serde_json::Value {
    serde_json::json!({
        "model": "gemma3:latest",
        "message": {"role": "assistant", "content": ""},
        "done": true
    })
}

/// Helper: one SSE payload carrying `content`.
pub fn sse_delta(content: &str) -> String {
    format!(r#"{{"choices":[{{"delta":{{"content":"{content}"}}}}]}}"#)
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// HTTP/1.1 server on an ephemeral localhost port. Every connection is closed
/// after one response.
pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Request>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let seen = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    serve_one(socket, handler, seen).await;
                });
            }
        });

        Self {
            url: format!("http://127.0.0.1:{port}"),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    pub fn last(&self, path: &str) -> Option<Request> {
        self.requests().into_iter().rev().find(|r| r.path == path)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(mut socket: TcpStream, handler: Handler, seen: Arc<Mutex<Vec<Request>>>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    let reply = handler(&request);
    seen.lock().unwrap().push(request);

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reason(reply.status),
        reply.content_type
    );
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for chunk in &reply.chunks {
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
    }
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers = head.to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).to_string();

    Some(Request {
        method,
        path,
        headers,
        body,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// Launcher double. `launch` flips `up`, which a mock daemon can consult.
#[derive(Default)]
pub struct FakeLauncher {
    pub installed: bool,
    pub fail_launch: bool,
    /// Set to true on a successful launch when `comes_up` is set.
    pub up: Arc<AtomicBool>,
    pub comes_up: bool,
    pub launches: AtomicUsize,
    pub last_command: Mutex<Option<String>>,
}

impl FakeLauncher {
    pub fn installed(up: Arc<AtomicBool>) -> Self {
        Self {
            installed: true,
            up,
            comes_up: true,
            ..Default::default()
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl DaemonLauncher for FakeLauncher {
    fn is_installed<'a>(&'a self, _executable: &'a str) -> BoxFuture<'a, bool> {
        let installed = self.installed;
        Box::pin(async move { installed })
    }

    fn launch(&self, command: &str) -> Result<(), ReviewError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_command.lock().unwrap() = Some(command.to_string());
        if self.fail_launch {
            return Err(ReviewError::Other("spawn failed".into()));
        }
        if self.comes_up {
            self.up.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Authenticator double with a fixed outcome.
pub struct StubAuth {
    pub present: bool,
    pub token: Result<String, String>,
    pub calls: AtomicUsize,
}

impl StubAuth {
    pub fn signed_in() -> Self {
        Self {
            present: true,
            token: Ok("test-token".into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(message: &str) -> Self {
        Self {
            present: true,
            token: Err(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn missing_companion() -> Self {
        Self {
            present: false,
            token: Err("not signed in".into()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Authenticator for StubAuth {
    fn companion_present(&self) -> BoxFuture<'_, bool> {
        let present = self.present;
        Box::pin(async move { present })
    }

    fn token(&self) -> BoxFuture<'_, Result<String, ReviewError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.token.clone().map_err(|message| ReviewError::AuthFailed {
            provider: "github".into(),
            message,
        });
        Box::pin(async move { result })
    }
}

/// Mock Ollama daemon: `/` answers 200 while `up` is set, `/api/tags` lists
/// `models`, and `/api/chat` streams `tokens` followed by a done line.
pub async fn ollama_daemon(
    up: Arc<AtomicBool>,
    models: &[&str],
    tokens: &[&str],
) -> MockServer {
    let tags = serde_json::json!({
        "models": models.iter().map(|m| serde_json::json!({"name": m})).collect::<Vec<_>>()
    });
    let mut lines: Vec<serde_json::Value> = tokens.iter().map(|t| ollama_token(t)).collect();
    lines.push(ollama_done());

    MockServer::start(move |req| match req.path.as_str() {
        "/" if up.load(Ordering::SeqCst) => Reply::status(200),
        "/" => Reply::status(503),
        "/api/tags" => Reply::json(tags.clone()),
        "/api/chat" => Reply::ndjson(&lines),
        _ => Reply::status(404),
    })
    .await
}
