//! Classlink Core Library
//!
//! Real-time communication core for the Classlink client: one authenticated
//! bus connection shared by call signaling and chat, with silent credential
//! rotation and automatic reconnects.
//! Provides: transport, token refresh, calls, messages, storage and models.

pub mod call;
pub mod error;
pub mod events;
pub mod loopback;
pub mod models;
pub mod network;
pub mod pipeline;
pub mod refresh;
pub mod storage;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

pub use call::{CallController, MediaLayer, MediaStream, PeerConnection, PeerEvent, PeerEventSink};
pub use error::*;
pub use events::*;
pub use models::*;
pub use network::{
    AuthServer, Connector, HttpAuthServer, HttpObjectStore, ObjectStore, RefreshFailure,
    UploadMeta, WebSocketConnector,
};
pub use pipeline::{Draft, LocalBlob, MediaAttachment, MessagePipeline, UploadHandle};
pub use refresh::RefreshCoordinator;
pub use storage::{CredentialStore, LocalStorage};
pub use transport::TransportSession;

/// Main client instance
pub struct RtcClient {
    config: ClientConfig,
    participant_id: String,
    credentials: CredentialStore,
    emitter: EventEmitter,
    transport: TransportSession,
    refresh: RefreshCoordinator,
    calls: CallController,
    messages: MessagePipeline,
}

/// External services the core talks to.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub auth: Arc<dyn AuthServer>,
    pub uploader: Arc<dyn ObjectStore>,
    pub media: Arc<dyn MediaLayer>,
}

impl Collaborators {
    /// WebSocket bus plus the HTTP auth and file endpoints of `config`.
    pub fn http(
        config: &ClientConfig,
        credentials: &CredentialStore,
        media: Arc<dyn MediaLayer>,
    ) -> Result<Self> {
        Ok(Self {
            connector: Arc::new(WebSocketConnector::new(config)?),
            auth: Arc::new(HttpAuthServer::new(config)?),
            uploader: Arc::new(HttpObjectStore::new(config, credentials.clone())?),
            media,
        })
    }
}

impl RtcClient {
    /// Wires the components for the signed-in participant.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ClientConfig,
        credentials: CredentialStore,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let participant_id = credentials
            .current()
            .ok_or(Error::NotLoggedIn)?
            .participant_id;

        let emitter = EventEmitter::new();
        let transport = TransportSession::new(
            collaborators.connector,
            config.reconnect.clone(),
            emitter.clone(),
        );
        let refresh = RefreshCoordinator::new(
            collaborators.auth,
            credentials.clone(),
            transport.clone(),
            emitter.clone(),
        );
        let calls = CallController::new(
            &participant_id,
            transport.clone(),
            collaborators.media,
            emitter.clone(),
            config.ring_timeout(),
        );
        let messages = MessagePipeline::new(
            &participant_id,
            transport.clone(),
            collaborators.uploader,
            emitter.clone(),
        );

        Ok(Self {
            config,
            participant_id,
            credentials,
            emitter,
            transport,
            refresh,
            calls,
            messages,
        })
    }

    /// Connects the bus with the stored credential, rotating it first when
    /// its expiry has already passed.
    pub async fn connect(&self) -> Result<ConnectionState> {
        let mut credential = self.credentials.current().ok_or(Error::NotLoggedIn)?;
        if credential.is_expired(chrono::Utc::now().timestamp()) {
            info!("stored credential expired, refreshing before connect");
            credential = self.refresh.request_refresh().await?;
        }
        self.transport.connect(credential).await
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Ends any live call, closes the bus and forgets the credential.
    pub async fn logout(&self) -> Result<()> {
        if let Some(call) = self.calls.current_call().await {
            if !call.state.is_terminal() {
                if let Err(e) = self.calls.end_call(EndReason::UserHangup).await {
                    warn!(error = %e, "could not end call on logout");
                }
            }
        }
        self.transport.disconnect();
        self.credentials.clear()?;
        info!(participant = %self.participant_id, "logged out");
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn RtcEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn session(&self) -> Session {
        self.transport.session()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.transport.watch_session()
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub fn messages(&self) -> &MessagePipeline {
        &self.messages
    }

    /// Rotates the credential pair now, joining any refresh in flight.
    pub async fn refresh(&self) -> Result<Credential> {
        self.refresh.request_refresh().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Client configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub http_timeout_secs: u64,
    pub ring_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 8443,
            use_tls: true,
            http_timeout_secs: 30,
            ring_timeout_ms: 30_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            ..Self::default()
        }
    }

    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }

    pub fn ws_endpoint(&self) -> Result<Url> {
        Ok(Url::parse(&self.ws_url())?)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Bounds for automatic reconnects and transient refresh retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
            backoff: Backoff::Exponential,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt number `attempt`, counting from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Exponential => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(self.max_delay_ms.max(self.delay_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::loopback;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_config_endpoints() {
        let config = ClientConfig::new("learn.example.org", 8443, true);
        assert_eq!(config.http_url(), "https://learn.example.org:8443");
        assert_eq!(config.ws_url(), "wss://learn.example.org:8443/ws");
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_config_partial_file_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"server_host":"10.0.0.5","reconnect":{"backoff":"fixed"}}"#,
        )
        .unwrap();

        let mut config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.server_host, "10.0.0.5");
        assert_eq!(config.server_port, 8443);
        assert_eq!(config.reconnect.backoff, Backoff::Fixed);
        assert_eq!(config.reconnect.delay_ms, 1_000);

        config.ring_timeout_ms = 45_000;
        config.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap().ring_timeout_ms, 45_000);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(30_000));

        let fixed = ReconnectPolicy {
            backoff: Backoff::Fixed,
            ..ReconnectPolicy::default()
        };
        assert_eq!(fixed.delay_for(7), Duration::from_millis(1_000));
    }

    struct NoMedia;

    #[async_trait]
    impl MediaLayer for NoMedia {
        async fn acquire_local_media(&self) -> Result<MediaStream> {
            Err(Error::Media("no devices".into()))
        }
        async fn create_peer_connection(
            &self,
            _stream: &MediaStream,
            _events: PeerEventSink,
        ) -> Result<Arc<dyn PeerConnection>> {
            Err(Error::Media("no devices".into()))
        }
        fn release_media(&self, _stream: MediaStream) {}
    }

    struct StaticAuth;

    #[async_trait]
    impl AuthServer for StaticAuth {
        async fn refresh(&self, _refresh_token: &str) -> std::result::Result<TokenPair, RefreshFailure> {
            Ok(TokenPair {
                access_token: "fresh".into(),
                refresh_token: "fresh-r".into(),
            })
        }
    }

    struct NoUploads;

    #[async_trait]
    impl ObjectStore for NoUploads {
        async fn upload(&self, _data: Arc<[u8]>, _meta: &UploadMeta) -> Result<String> {
            Err(Error::UploadFailed("offline".into()))
        }
    }

    fn collaborators(connector: crate::loopback::LoopbackConnector) -> Collaborators {
        Collaborators {
            connector: Arc::new(connector),
            auth: Arc::new(StaticAuth),
            uploader: Arc::new(NoUploads),
            media: Arc::new(NoMedia),
        }
    }

    #[tokio::test]
    async fn test_client_requires_signed_in_participant() {
        let (connector, _server) = loopback();
        let result = RtcClient::new(
            ClientConfig::default(),
            CredentialStore::in_memory(),
            collaborators(connector),
        );
        assert!(matches!(result, Err(Error::NotLoggedIn)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_connect_and_logout() {
        let (connector, server) = loopback();
        let credentials = CredentialStore::in_memory();
        credentials
            .sign_in(Credential::new(
                "stu-1",
                Role::Student,
                TokenPair {
                    access_token: "a1".into(),
                    refresh_token: "r1".into(),
                },
            ))
            .unwrap();
        let client = RtcClient::new(
            ClientConfig::default(),
            credentials.clone(),
            collaborators(connector),
        )
        .unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = states.clone();
            client.add_listener(Arc::new(move |event: RtcEvent| {
                if let RtcEvent::ConnectionStateChanged(state) = event {
                    states.lock().push(state);
                }
            }));
        }

        assert_eq!(client.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(client.participant_id(), "stu-1");
        assert_eq!(server.frames_of(EventKind::Authenticate)[0]["token"], "a1");

        client.logout().await.unwrap();
        assert_eq!(client.session().state, ConnectionState::Disconnected);
        assert!(!credentials.is_signed_in());
        assert!(matches!(client.connect().await, Err(Error::NotLoggedIn)));
        assert_eq!(
            *states.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }
}
