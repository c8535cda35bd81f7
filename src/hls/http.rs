//! HTTP surface of the segmented live server
//!
//! ```text
//!   GET /              301 -> /<playlist>
//!   GET /<playlist>    starts the pipeline when idle, then serves the file
//!   GET /<name>.ts     serves a segment
//! ```
//!
//! Every served file resets the idle timer through [`HlsControl::touch`].

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the HTTP side asks of the server owning it
#[async_trait]
pub trait HlsControl: Send + Sync {
    /// The playlist was requested; start the pipeline if idle
    ///
    /// Returns false if the pipeline could not be started.
    async fn playlist_requested(&self) -> bool;

    /// A file was served
    fn touch(&self);
}

/// Basic-auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Credentials for `user`, or `None` when no user is given
    pub fn new(user: &str, pass: &str) -> Option<Self> {
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }

    /// Check an `Authorization` header value
    pub fn accepts(&self, header: &str) -> bool {
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.user && pass == self.pass,
            None => false,
        }
    }
}

/// Shared state of the request handler
pub struct HttpState {
    pub directory: PathBuf,
    pub playlist_name: String,
    pub realm: String,
    pub credentials: Option<Credentials>,
    pub control: Arc<dyn HlsControl>,
}

/// A running HTTP listener
pub struct HttpServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Bind on `port` (0 picks a free port) and start serving
    pub async fn bind(port: u16, state: HttpState) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::new(state));
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "HLS HTTP server failed");
            }
        });
        tracing::info!(%addr, "HLS HTTP server listening");

        Ok(Self {
            addr,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if self.task.take().is_some() {
            tracing::info!(addr = %self.addr, "HLS HTTP server stopped");
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer").field("addr", &self.addr).finish()
    }
}

fn status(code: StatusCode) -> Response {
    code.into_response()
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/x-mpegURL"
    } else if name.ends_with(".ts") {
        "video/MP2T"
    } else {
        "application/octet-stream"
    }
}

async fn handle(
    State(state): State<Arc<HttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path();
    if method != Method::GET {
        tracing::debug!(%method, path, "unsupported method");
        return status(StatusCode::NOT_IMPLEMENTED);
    }
    if let Some(credentials) = &state.credentials {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| credentials.accepts(v));
        if !authorized {
            tracing::warn!(path, "HLS request denied");
            let challenge = format!("Basic realm=\"{}\"", state.realm);
            return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, challenge)]).into_response();
        }
    }

    if path == "/" {
        let location = format!("/{}", state.playlist_name);
        tracing::debug!(%location, "redirecting to playlist");
        return (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response();
    }
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        tracing::warn!(path, "rejected path");
        return status(StatusCode::FORBIDDEN);
    }

    if name == state.playlist_name && !state.control.playlist_requested().await {
        tracing::warn!("pipeline could not be started for playlist request");
        return status(StatusCode::BAD_GATEWAY);
    }

    let file = state.directory.join(name);
    match tokio::fs::metadata(&file).await {
        Ok(meta) if meta.is_dir() => return status(StatusCode::SERVICE_UNAVAILABLE),
        Ok(_) => {}
        Err(e) => {
            let code = match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::debug!(path, error = %e, status = code.as_u16(), "cannot serve");
            return status(code);
        }
    }
    let body = match tokio::fs::read(&file).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(path, error = %e, "read failed");
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    tracing::trace!(path, bytes = body.len(), "serving");
    state.control.touch();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type(name))],
        Body::from(body),
    )
        .into_response()
}
