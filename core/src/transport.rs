//! Transport session - the single authenticated bus connection
//!
//! Call signaling and chat traffic share one connection. Frames are
//! dispatched to handlers per [`EventKind`] in arrival order. A
//! `credential_expired` frame never tears the connection down: outbound
//! frames are held until the refresh coordinator applies a new credential,
//! then flushed in submission order.

use crate::error::{Error, Result};
use crate::events::{EventEmitter, RtcEvent};
use crate::models::*;
use crate::network::Connector;
use crate::ReconnectPolicy;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Obtains a fresh credential when the bus reports the current one expired.
///
/// Implementations apply the credential to the session themselves before
/// resolving.
pub trait CredentialRefresher: Send + Sync {
    fn refresh(self: Arc<Self>) -> BoxFuture<'static, Result<Credential>>;
}

#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    emitter: EventEmitter,
    session: watch::Sender<Session>,
    credential: Mutex<Option<Credential>>,
    outbound: Mutex<Outbound>,
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    refresher: RwLock<Option<Weak<dyn CredentialRefresher>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

#[derive(Default)]
struct Outbound {
    link: Option<mpsc::UnboundedSender<String>>,
    suspended: bool,
    held: VecDeque<String>,
}

impl Outbound {
    /// Writes held frames to the link, oldest first.
    fn flush(&mut self) {
        let Some(tx) = self.link.clone() else {
            return;
        };
        while let Some(frame) = self.held.pop_front() {
            if let Err(e) = tx.send(frame) {
                self.held.push_front(e.0);
                break;
            }
        }
    }
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy, emitter: EventEmitter) -> Self {
        let (session, _) = watch::channel(Session::default());
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                emitter,
                session,
                credential: Mutex::new(None),
                outbound: Mutex::new(Outbound::default()),
                handlers: RwLock::new(HashMap::new()),
                refresher: RwLock::new(None),
                supervisor: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the connection with `credential` as the authentication payload.
    ///
    /// No-op while a connection is already up or being established; returns
    /// the current state in that case.
    pub async fn connect(&self, credential: Credential) -> Result<ConnectionState> {
        let mut current = ConnectionState::Disconnected;
        let started = self.inner.session.send_if_modified(|s| {
            current = s.state;
            if s.state == ConnectionState::Disconnected {
                s.state = ConnectionState::Connecting;
                s.last_error = None;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = %current, "connect ignored");
            return Ok(current);
        }
        self.inner
            .emitter
            .emit(RtcEvent::ConnectionStateChanged(ConnectionState::Connecting));

        *self.inner.credential.lock() = Some(credential.clone());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.inner.open_link(&credential).await {
            Ok(link) => {
                if self.inner.generation.load(Ordering::SeqCst) != generation {
                    // disconnect() won the race
                    return Ok(self.inner.state());
                }
                self.inner.install(link.outbound);
                self.inner.set_state(ConnectionState::Connected, None);
                info!(participant = %credential.participant_id, "bus connected");

                let handle = tokio::spawn(supervise(self.inner.clone(), link.inbound, generation));
                if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
                    previous.abort();
                }
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                warn!(error = %e, "bus connect failed");
                self.inner
                    .set_state(ConnectionState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Closes the connection and stops any reconnect attempts.
    pub fn disconnect(&self) {
        self.inner.shutdown();
        self.inner.set_state(ConnectionState::Disconnected, None);
        info!("bus disconnected");
    }

    /// Queues a frame on the connection.
    ///
    /// While a credential refresh is pending the frame is held and written
    /// once the new credential is applied.
    pub fn send<T: Serialize>(&self, kind: EventKind, payload: &T) -> Result<()> {
        if self.inner.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let frame = Frame::new(kind, payload)?.encode()?;

        let mut out = self.inner.outbound.lock();
        if out.suspended {
            debug!(?kind, held = out.held.len() + 1, "holding frame until credential refresh");
            out.held.push_back(frame);
            return Ok(());
        }
        match out.link {
            Some(ref tx) => tx.send(frame).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    /// Registers a handler for inbound frames of `kind`.
    /// Handlers of the same kind run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn set_refresher(&self, refresher: Weak<dyn CredentialRefresher>) {
        *self.inner.refresher.write() = Some(refresher);
    }

    pub fn session(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    /// Whether outbound frames are currently held for a refresh.
    pub fn is_suspended(&self) -> bool {
        self.inner.outbound.lock().suspended
    }

    /// Installs a rotated credential: re-authenticates the live connection,
    /// then releases held frames in order.
    pub(crate) fn apply_credential(&self, credential: Credential) {
        let handshake = match handshake_frame(&credential) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "cannot encode authentication frame");
                return;
            }
        };
        *self.inner.credential.lock() = Some(credential);

        let mut out = self.inner.outbound.lock();
        let held = out.held.len();
        if let Some(tx) = out.link.clone() {
            if let Err(e) = tx.send(handshake) {
                debug!(error = %e, "link closed before re-authentication");
            }
            out.flush();
        }
        out.suspended = false;
        info!(held, "credential applied, outbound resumed");
    }

    /// The credential cannot be renewed; the session is over.
    pub(crate) fn credential_rejected(&self) {
        self.inner.abandon(&Error::AuthExpired);
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.session.borrow().state
    }

    fn set_state(&self, state: ConnectionState, last_error: Option<String>) {
        let previous = self.state();
        self.session.send_replace(Session { state, last_error });
        if previous != state {
            debug!(from = %previous, to = %state, "session state");
            self.emitter.emit(RtcEvent::ConnectionStateChanged(state));
        }
    }

    async fn open_link(&self, credential: &Credential) -> Result<crate::network::Link> {
        let handshake = handshake_frame(credential)?;
        self.connector.open(handshake).await
    }

    fn install(&self, link: mpsc::UnboundedSender<String>) {
        let mut out = self.outbound.lock();
        out.link = Some(link);
        if !out.suspended {
            out.flush();
        }
    }

    fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.reset_outbound();
    }

    /// Forgets the link along with any frames held for a refresh.
    fn reset_outbound(&self) {
        let mut out = self.outbound.lock();
        if !out.held.is_empty() {
            warn!(dropped = out.held.len(), "dropping held frames");
        }
        out.held.clear();
        out.suspended = false;
        out.link = None;
    }

    fn abandon(&self, error: &Error) {
        warn!(error = %error, "abandoning bus session");
        self.shutdown();
        *self.credential.lock() = None;
        self.set_state(ConnectionState::Disconnected, Some(error.to_string()));
    }

    fn dispatch(self: &Arc<Self>, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable frame");
                return;
            }
        };

        match frame.kind {
            EventKind::CredentialExpired => self.on_credential_expired(),
            EventKind::Ping => {
                // control frame, bypasses suspension
                if let (Some(tx), Ok(pong)) = (
                    self.outbound.lock().link.clone(),
                    Frame::new(EventKind::Pong, &Value::Null).and_then(|f| f.encode()),
                ) {
                    let _ = tx.send(pong);
                }
            }
            kind => {
                if kind == EventKind::Error {
                    warn!(payload = %frame.payload, "bus reported an error");
                }
                let handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();
                if handlers.is_empty() {
                    debug!(?kind, "no handler for frame");
                }
                for handler in handlers {
                    handler(&frame.payload);
                }
            }
        }
    }

    fn on_credential_expired(self: &Arc<Self>) {
        {
            let mut out = self.outbound.lock();
            if out.suspended {
                debug!("credential refresh already pending");
                return;
            }
            out.suspended = true;
        }
        info!("credential expired, holding outbound frames");

        let refresher = self.refresher.read().as_ref().and_then(Weak::upgrade);
        match refresher {
            Some(refresher) => {
                tokio::spawn(self.clone().drive_refresh(refresher));
            }
            None => {
                warn!("no credential refresher attached");
                self.abandon(&Error::AuthExpired);
            }
        }
    }

    async fn drive_refresh(self: Arc<Self>, refresher: Arc<dyn CredentialRefresher>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match refresher.clone().refresh().await {
                Ok(_) => return,
                Err(Error::RefreshUnavailable(reason)) if attempt < self.policy.max_attempts => {
                    warn!(attempt, %reason, "credential refresh unavailable, retrying");
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(e) => {
                    self.abandon(&e);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            self.set_state(ConnectionState::Reconnecting { attempt }, last_error.clone());
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return None;
            }

            let Some(credential) = self.credential.lock().clone() else {
                self.set_state(
                    ConnectionState::Disconnected,
                    Some(Error::NotLoggedIn.to_string()),
                );
                return None;
            };

            match self.open_link(&credential).await {
                Ok(link) => {
                    self.install(link.outbound);
                    self.set_state(ConnectionState::Connected, None);
                    info!(attempt, "bus reconnected");
                    return Some(link.inbound);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        warn!(attempts = self.policy.max_attempts, "reconnect attempts exhausted");
        self.reset_outbound();
        self.set_state(
            ConnectionState::Disconnected,
            Some(last_error.unwrap_or_else(|| "connection lost".to_string())),
        );
        None
    }
}

/// Pumps inbound frames and reconnects after unexpected loss.
async fn supervise(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<String>, generation: u64) {
    loop {
        while let Some(text) = inbound.recv().await {
            inner.dispatch(&text);
        }

        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        warn!("bus connection lost");
        inner.outbound.lock().link = None;

        match inner.reconnect(generation).await {
            Some(next) => inbound = next,
            None => return,
        }
    }
}

fn handshake_frame(credential: &Credential) -> Result<String> {
    Ok(Frame::new(EventKind::Authenticate, &AuthPayload::from(credential))?.encode()?)
}
