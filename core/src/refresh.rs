//! Token refresh coordinator
//!
//! At most one refresh round trip is in flight. Every caller that arrives
//! while it is pending awaits the same shared outcome.

use crate::error::{Error, Result};
use crate::events::{EventEmitter, RtcEvent};
use crate::models::Credential;
use crate::network::{AuthServer, RefreshFailure};
use crate::storage::CredentialStore;
use crate::transport::{CredentialRefresher, TransportSession};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

type RefreshOutcome = std::result::Result<Credential, RefreshFailure>;

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorInner {
    auth: Arc<dyn AuthServer>,
    store: CredentialStore,
    transport: TransportSession,
    emitter: EventEmitter,
    in_flight: Mutex<Option<Shared<BoxFuture<'static, RefreshOutcome>>>>,
}

impl RefreshCoordinator {
    /// Creates the coordinator and registers it with `transport` as the
    /// handler for expired credentials.
    pub fn new(
        auth: Arc<dyn AuthServer>,
        store: CredentialStore,
        transport: TransportSession,
        emitter: EventEmitter,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            auth,
            store,
            transport: transport.clone(),
            emitter,
            in_flight: Mutex::new(None),
        });
        let weak: Weak<dyn CredentialRefresher> = Arc::downgrade(&inner) as Weak<dyn CredentialRefresher>;
        transport.set_refresher(weak);
        Self { inner }
    }

    /// Rotates the credential pair, joining a refresh already in flight.
    pub async fn request_refresh(&self) -> Result<Credential> {
        self.inner.clone().join().await.map_err(Error::from)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }
}

impl CoordinatorInner {
    fn join(self: Arc<Self>) -> Shared<BoxFuture<'static, RefreshOutcome>> {
        let mut slot = self.in_flight.lock();
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }
        let fut = self.clone().run().boxed().shared();
        *slot = Some(fut.clone());
        fut
    }

    async fn run(self: Arc<Self>) -> RefreshOutcome {
        let outcome = match self.exchange().await {
            Ok(credential) => self.install(credential),
            Err(RefreshFailure::Rejected(reason)) => {
                warn!(%reason, "refresh token rejected");
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "could not clear credential store");
                }
                self.transport.credential_rejected();
                self.emitter.emit(RtcEvent::AuthExpired);
                Err(RefreshFailure::Rejected(reason))
            }
            Err(RefreshFailure::Unavailable(reason)) => {
                warn!(%reason, "credential refresh unavailable");
                Err(RefreshFailure::Unavailable(reason))
            }
        };

        *self.in_flight.lock() = None;
        outcome
    }

    /// Stores the rotated pair, then hands it to the transport. A pair the
    /// store refuses is never applied.
    fn install(&self, credential: Credential) -> RefreshOutcome {
        if let Err(e) = self.store.replace(credential.clone()) {
            warn!(error = %e, "rotated credential not stored, discarding it");
            return Err(match e {
                // logged out meanwhile, or someone else signed in
                Error::NotLoggedIn | Error::InvalidState { .. } => {
                    RefreshFailure::Rejected(e.to_string())
                }
                other => RefreshFailure::Unavailable(other.to_string()),
            });
        }
        self.transport.apply_credential(credential.clone());
        info!(participant = %credential.participant_id, "credential rotated");
        Ok(credential)
    }

    async fn exchange(&self) -> RefreshOutcome {
        let current = self
            .store
            .current()
            .ok_or_else(|| RefreshFailure::Rejected("no credential to refresh".into()))?;
        let tokens = self.auth.refresh(&current.refresh_token).await?;
        Ok(current.rotate(tokens))
    }
}

impl CredentialRefresher for CoordinatorInner {
    fn refresh(self: Arc<Self>) -> BoxFuture<'static, Result<Credential>> {
        let shared = self.join();
        async move { shared.await.map_err(Error::from) }.boxed()
    }
}
