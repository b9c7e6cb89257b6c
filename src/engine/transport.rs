//! HTTP transport to the engine, over a Unix socket or TCP.

use crate::config::EngineHost;
use crate::error::ProxyError;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

/// Response whose body has not been read yet.
pub struct EngineResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl EngineResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>, ProxyError> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }

    /// Read the whole body as text for error messages, empty on failure.
    pub async fn text(self) -> String {
        self.bytes()
            .await
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())
            .unwrap_or_default()
    }
}

pub enum Transport {
    Unix {
        socket: PathBuf,
        timeout: Duration,
    },
    Tcp {
        http: reqwest::Client,
        base_url: String,
        timeout: Duration,
    },
}

impl Transport {
    /// `timeout` bounds connecting and receiving response headers. Bodies
    /// are streamed without a deadline, since events and pulls are long-lived.
    pub fn new(host: &EngineHost, timeout: Duration) -> Result<Self, ProxyError> {
        match host {
            EngineHost::Unix(socket) => Ok(Transport::Unix {
                socket: socket.clone(),
                timeout,
            }),
            EngineHost::Tcp(base_url) => {
                let http = reqwest::Client::builder()
                    .connect_timeout(timeout)
                    .build()
                    .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {e}")))?;
                Ok(Transport::Tcp {
                    http,
                    base_url: base_url.trim_end_matches('/').to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a request. `path` includes the API version prefix and query string.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<EngineResponse, ProxyError> {
        let timeout = match self {
            Transport::Unix { timeout, .. } | Transport::Tcp { timeout, .. } => *timeout,
        };

        let fut = async {
            match self {
                Transport::Unix { socket, .. } => send_unix(socket, method.clone(), path, body).await,
                Transport::Tcp { http, base_url, .. } => {
                    send_tcp(http, base_url, method.clone(), path, body).await
                }
            }
        };

        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            ProxyError::EngineUnavailable(format!(
                "{method} {path} got no response within {}s",
                timeout.as_secs()
            ))
        })?
    }
}

async fn send_unix(
    socket: &Path,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<EngineResponse, ProxyError> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        ProxyError::EngineUnavailable(format!(
            "Failed to connect to engine at {}: {e}",
            socket.display()
        ))
    })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::EngineUnavailable(format!("HTTP handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Engine connection closed: {e}");
        }
    });

    let builder = Request::builder()
        .method(method)
        .uri(format!("http://localhost{path}"))
        .header("Host", "localhost");

    let request = match body {
        Some(bytes) => builder
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes))),
        None => builder.body(Full::new(Bytes::new())),
    }
    .map_err(|e| ProxyError::EngineUnavailable(format!("Failed to build request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::EngineUnavailable(format!("Engine request failed: {e}")))?;

    let status = response.status().as_u16();
    let body = response
        .into_body()
        .into_data_stream()
        .map_err(|e| ProxyError::EngineUnavailable(format!("Engine stream failed: {e}")))
        .boxed();

    Ok(EngineResponse { status, body })
}

async fn send_tcp(
    http: &reqwest::Client,
    base_url: &str,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<EngineResponse, ProxyError> {
    let mut request = http.request(method, format!("{base_url}{path}"));
    if let Some(bytes) = body {
        request = request
            .header("Content-Type", "application/json")
            .body(bytes);
    }

    let resp = request
        .send()
        .await
        .map_err(|e| ProxyError::EngineUnavailable(format!("Engine request failed: {e}")))?;

    let status = resp.status().as_u16();
    let body = resp
        .bytes_stream()
        .map_err(|e| ProxyError::EngineUnavailable(format!("Engine stream failed: {e}")))
        .boxed();

    Ok(EngineResponse { status, body })
}
