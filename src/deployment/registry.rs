use crate::manifest::RegistrySettings;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Starting registry server on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry server failed: {0}")]
    Serve(String),
}

#[derive(Clone)]
struct RegistryState {
    settings: Arc<RwLock<HashMap<String, String>>>,
    credentials: Option<(String, String)>,
}

impl RegistryState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = &self.credentials else {
            return true;
        };
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(decode_basic_auth)
            .is_some_and(|(u, p)| &u == username && &p == password)
    }
}

fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// GET /instances/{id}/settings
async fn get_settings(
    State(state): State<RegistryState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let settings = match state.settings.read() {
        Ok(settings) => settings.get(&id).cloned(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    match settings {
        Some(settings) => {
            debug!("Serving registry settings for instance {}", id);
            Json(json!({"settings": settings, "status": "ok"})).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found"})),
        )
            .into_response(),
    }
}

/// PUT /instances/{id}/settings
async fn put_settings(
    State(state): State<RegistryState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = String::from_utf8_lossy(&body).into_owned();
    match state.settings.write() {
        Ok(mut settings) => {
            info!("Registry settings updated for instance {}", id);
            settings.insert(id, body);
            (StatusCode::CREATED, Json(json!({"status": "ok"}))).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Transient HTTP registry the VM reads its bootstrap settings from. It
/// lives only for one deploy run.
pub struct RegistryServer;

impl RegistryServer {
    pub async fn start(settings: &RegistrySettings) -> Result<RegistryHandle, RegistryError> {
        let address = format!("{}:{}", settings.host, settings.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|source| RegistryError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RegistryError::Bind { address, source })?;

        let credentials = if settings.username.is_empty() {
            None
        } else {
            Some((settings.username.clone(), settings.password.clone()))
        };
        let state = RegistryState {
            settings: Arc::new(RwLock::new(HashMap::new())),
            credentials,
        };
        let router = Router::new()
            .route(
                "/instances/{id}/settings",
                get(get_settings).put(put_settings),
            )
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!("Registry server listening on {}", local_addr);
        Ok(RegistryHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Running registry server. Dropping the handle signals shutdown; `stop`
/// also waits for the server to finish.
pub struct RegistryHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl RegistryHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub async fn stop(mut self) -> Result<(), RegistryError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(Ok(())) => {
                info!("Registry server on {} stopped", self.local_addr);
                Ok(())
            }
            Ok(Err(e)) => Err(RegistryError::Serve(e.to_string())),
            Err(e) => Err(RegistryError::Serve(e.to_string())),
        }
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            warn!("Registry server on {} dropped without stop", self.local_addr);
            let _ = shutdown.send(());
        }
    }
}
