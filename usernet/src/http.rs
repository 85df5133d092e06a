//! HTTP control plane, served over a unix socket.

use crate::UsernetError;
use crate::leases::{Lease, LeaseTable};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Overrides the default SSH-readiness deadline, in seconds.
pub const RESOLVE_TIMEOUT_ENV: &str = "SKIFF_USERNET_RESOLVE_TIMEOUT";
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ControlState {
    pub leases: Arc<Mutex<LeaseTable>>,
    forwards: Arc<tokio::sync::Mutex<HashMap<SocketAddr, tokio::task::JoinHandle<()>>>>,
}

impl ControlState {
    pub fn new(leases: Arc<Mutex<LeaseTable>>) -> Self {
        ControlState {
            leases,
            forwards: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/leases", get(list_leases))
        .route("/services/forwarder/expose", post(expose))
        .route("/extension/wait-ssh-ready", post(wait_ssh_ready))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.1 });
        (self.0, axum::Json(body)).into_response()
    }
}

async fn list_leases(State(state): State<ControlState>) -> Result<axum::Json<Vec<Lease>>, ApiError> {
    let leases = state
        .leases
        .lock()
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "lease table poisoned".into()))?
        .leases();
    Ok(axum::Json(leases))
}

#[derive(Debug, Deserialize)]
struct ExposeRequest {
    local: SocketAddr,
    remote: SocketAddr,
}

/// Publish a host-side listener that proxies into the guest network.
async fn expose(
    State(state): State<ControlState>,
    axum::Json(req): axum::Json<ExposeRequest>,
) -> Result<StatusCode, ApiError> {
    let listener = TcpListener::bind(req.local)
        .await
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("bind {}: {}", req.local, e)))?;
    tracing::info!(local = %req.local, remote = %req.remote, "forward exposed");

    let remote = req.remote;
    let task = tokio::spawn(async move {
        loop {
            let (mut inbound, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "forward accept failed");
                    break;
                }
            };
            tokio::spawn(async move {
                let mut outbound = match TcpStream::connect(remote).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(remote = %remote, error = %e, "forward connect failed");
                        return;
                    }
                };
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
                {
                    tracing::trace!(peer = %peer, error = %e, "forward closed");
                }
            });
        }
    });

    // Re-exposing the same local address replaces the old forward.
    if let Some(old) = state.forwards.lock().await.insert(req.local, task) {
        old.abort();
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct SshReadyRequest {
    mac: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    /// Login the caller intends to use; carried into logs only.
    #[serde(default)]
    user: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Serialize)]
struct SshReadyResponse {
    ip: IpAddr,
    port: u16,
}

/// Block until the instance with `mac` has a lease and accepts TCP on
/// `port`. Poll interval is fixed; the deadline honors the env override.
async fn wait_ssh_ready(
    State(state): State<ControlState>,
    axum::Json(req): axum::Json<SshReadyRequest>,
) -> Result<axum::Json<SshReadyResponse>, ApiError> {
    let timeout = resolve_timeout();
    let deadline = tokio::time::Instant::now() + timeout;

    let ip = loop {
        let found = state
            .leases
            .lock()
            .ok()
            .and_then(|table| table.lookup(&req.mac));
        if let Some(ip) = found {
            break ip;
        }
        if tokio::time::Instant::now() >= deadline {
            let err = UsernetError::ResolveTimeout {
                mac: req.mac.clone(),
                elapsed_secs: timeout.as_secs(),
            };
            return Err(ApiError(StatusCode::GATEWAY_TIMEOUT, err.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let addr = SocketAddr::from((ip, req.port));
    loop {
        match tokio::time::timeout(POLL_INTERVAL, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                tracing::debug!(addr = %addr, user = req.user.as_deref().unwrap_or(""), "ssh ready");
                return Ok(axum::Json(SshReadyResponse {
                    ip: IpAddr::V4(ip),
                    port: req.port,
                }));
            }
            Ok(Err(_)) | Err(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            let err = UsernetError::SshReadyTimeout {
                addr: addr.to_string(),
                elapsed_secs: timeout.as_secs(),
            };
            return Err(ApiError(StatusCode::GATEWAY_TIMEOUT, err.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn resolve_timeout() -> Duration {
    std::env::var(RESOLVE_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RESOLVE_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn state_with_lease() -> ControlState {
        let mut statics = BTreeMap::new();
        statics.insert(
            "52:55:55:00:00:01".to_string(),
            Ipv4Addr::new(127, 0, 0, 1),
        );
        ControlState::new(Arc::new(Mutex::new(LeaseTable::new(
            Ipv4Addr::new(192, 168, 104, 0),
            &statics,
        ))))
    }

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => axum::body::Body::from(v.to_string()),
                None => axum::body::Body::empty(),
            })
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn leases_endpoint_returns_json() {
        let app = router(state_with_lease());
        let (status, body) = call(app, "GET", "/leases", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["mac"], "52:55:55:00:00:01");
        assert_eq!(body[0]["static"], true);
    }

    #[tokio::test]
    async fn expose_proxies_connections() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut conn, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut conn, &buf).await.unwrap();
        });

        // Pick a free local port first, then expose it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = probe.local_addr().unwrap();
        drop(probe);

        let app = router(state_with_lease());
        let (status, _) = call(
            app,
            "POST",
            "/services/forwarder/expose",
            Some(serde_json::json!({ "local": local, "remote": backend_addr })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut client = TcpStream::connect(local).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    #[tokio::test]
    async fn ssh_ready_succeeds_against_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let app = router(state_with_lease());
        let (status, body) = call(
            app,
            "POST",
            "/extension/wait-ssh-ready",
            Some(serde_json::json!({
                "mac": "52:55:55:00:00:01",
                "port": port,
                "user": "alice",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip"], "127.0.0.1");
    }

    #[tokio::test]
    async fn ssh_ready_times_out_without_a_lease() {
        // Env overrides are process-global; keep the value tiny so this
        // test stays fast regardless of ordering.
        unsafe { std::env::set_var(RESOLVE_TIMEOUT_ENV, "1") };
        let app = router(state_with_lease());
        let (status, body) = call(
            app,
            "POST",
            "/extension/wait-ssh-ready",
            Some(serde_json::json!({ "mac": "de:ad:be:ef:00:00" })),
        )
        .await;
        unsafe { std::env::remove_var(RESOLVE_TIMEOUT_ENV) };
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body["error"].as_str().unwrap().contains("de:ad:be:ef:00:00"));
    }
}
