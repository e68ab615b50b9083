//! Events surfaced to the presentation layer

use crate::models::{CallInfo, CallState, ConnectionState, ConversationKey, MessageId};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    ConnectionStateChanged(ConnectionState),
    /// The refresh token was rejected; the user has to sign in again.
    AuthExpired,
    IncomingCall(CallInfo),
    CallStateChanged { call_id: String, state: CallState },
    RemoteTrack { call_id: String, track_id: String },
    ConversationUpdated {
        conversation: ConversationKey,
        message_id: MessageId,
    },
    ReadReceipt {
        conversation: ConversationKey,
        message_ids: Vec<MessageId>,
    },
    UploadFailed { message_id: MessageId, reason: String },
    Typing {
        conversation: ConversationKey,
        user_id: String,
        is_typing: bool,
    },
}

/// Receives events from the core.
/// Called from tokio tasks, so implementations must be Send + Sync.
pub trait RtcEventListener: Send + Sync {
    fn on_event(&self, event: RtcEvent);
}

impl<F> RtcEventListener for F
where
    F: Fn(RtcEvent) + Send + Sync,
{
    fn on_event(&self, event: RtcEvent) {
        self(event)
    }
}

/// Dispatches events to registered listeners in registration order.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn RtcEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn RtcEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: RtcEvent) {
        // snapshot so a listener may register another one without deadlocking
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}
