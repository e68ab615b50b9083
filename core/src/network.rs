//! Network collaborators - bus connector, auth server and object storage

use crate::error::{Error, Result};
use crate::models::TokenPair;
use crate::storage::CredentialStore;
use crate::ClientConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

// ============================================================================
// Bus connection
// ============================================================================

/// Both directions of an open bus connection, as text frames.
///
/// The connection is gone once `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and sends `handshake` as its first frame.
    async fn open(&self, handshake: String) -> Result<Link>;
}

pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            url: config.ws_endpoint()?,
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, handshake: String) -> Result<Link> {
        let (ws_stream, _) = connect_async(self.url.clone()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Send authentication
        write.send(WsMessage::Text(handshake)).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Receive task
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        tracing::debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Send task
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// Auth server
// ============================================================================

/// Why a refresh round trip failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh token is invalid or expired. Fatal.
    Rejected(String),
    /// Network or server trouble. The caller may try again later.
    Unavailable(String),
}

impl From<RefreshFailure> for Error {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::Rejected(_) => Error::AuthExpired,
            RefreshFailure::Unavailable(reason) => Error::RefreshUnavailable(reason),
        }
    }
}

#[async_trait]
pub trait AuthServer: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenPair, RefreshFailure>;
}

pub struct HttpAuthServer {
    client: Client,
    base_url: String,
}

impl HttpAuthServer {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.http_url(),
        })
    }
}

#[async_trait]
impl AuthServer for HttpAuthServer {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenPair, RefreshFailure> {
        let resp = self
            .client
            .post(format!("{}/api/v1/auth/refresh", self.base_url))
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| RefreshFailure::Unavailable(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<TokenPair>()
                .await
                .map_err(|e| RefreshFailure::Unavailable(format!("invalid refresh response: {}", e))),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RefreshFailure::Rejected(format!("refresh rejected: {}", resp.status())))
            }
            s => Err(RefreshFailure::Unavailable(format!("refresh failed: {}", s))),
        }
    }
}

// ============================================================================
// Object storage
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub file_name: String,
    pub mime_type: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `data` and returns the URL it can be fetched from.
    async fn upload(&self, data: Arc<[u8]>, meta: &UploadMeta) -> Result<String>;
}

pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    credentials: CredentialStore,
}

impl HttpObjectStore {
    pub fn new(config: &ClientConfig, credentials: CredentialStore) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.http_url(),
            credentials,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, data: Arc<[u8]>, meta: &UploadMeta) -> Result<String> {
        let token = self.credentials.access_token().ok_or(Error::NotLoggedIn)?;

        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(meta.file_name.clone())
            .mime_str(&meta.mime_type)
            .map_err(|e| Error::UploadFailed(e.to_string()))?;

        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{}/api/v1/files/upload", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::UploadFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::UploadFailed(format!("upload failed: {}", resp.status())));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::UploadFailed(e.to_string()))?;
        let file_id = data["file_id"]
            .as_str()
            .ok_or_else(|| Error::UploadFailed("response without file_id".into()))?;

        Ok(format!("{}/api/v1/files/{}", self.base_url, file_id))
    }
}

fn http_client(config: &ClientConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?)
}
