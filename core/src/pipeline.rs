//! Message pipeline
//!
//! Keeps one ordered, de-duplicated view per conversation. Outbound messages
//! are appended optimistically as `pending` and move forward on ack and read
//! receipts. Media goes to the object store first; the message only reaches
//! the conversation and the bus once it has a URL.

use crate::error::{Error, Result};
use crate::events::{EventEmitter, RtcEvent};
use crate::models::*;
use crate::network::{ObjectStore, UploadMeta};
use crate::transport::TransportSession;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Attachments
// ============================================================================

/// Local bytes of an attachment, owned by its pending message.
pub struct LocalBlob {
    data: Arc<[u8]>,
    revoked: Arc<AtomicBool>,
}

/// Observes whether a [`LocalBlob`] has been released.
#[derive(Clone)]
pub struct BlobWatch {
    revoked: Arc<AtomicBool>,
}

impl BlobWatch {
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl LocalBlob {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn watch(&self) -> BlobWatch {
        BlobWatch {
            revoked: self.revoked.clone(),
        }
    }

    fn revoke(self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

pub struct MediaAttachment {
    pub blob: LocalBlob,
    pub kind: MediaKind,
    pub file_name: String,
    pub mime_type: String,
}

impl MediaAttachment {
    pub fn new(blob: LocalBlob, file_name: &str, mime_type: &str) -> Self {
        Self {
            blob,
            kind: MediaKind::from_mime(mime_type),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.blob.len() as u64
    }

    fn meta(&self) -> UploadMeta {
        UploadMeta {
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Text message content, optionally replying to another message.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub text: String,
    pub reply_to: Option<MessageId>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }
}

// ============================================================================
// Uploads
// ============================================================================

#[derive(Debug, Clone)]
enum UploadStatus {
    Uploading,
    Failed(String),
    Dispatched(Message),
    Cancelled,
}

/// Tracks one media message through upload and dispatch.
pub struct UploadHandle {
    pub message_id: MessageId,
    status: watch::Receiver<UploadStatus>,
}

impl UploadHandle {
    /// Resolves once the upload has settled: the dispatched message, the
    /// upload failure, or `Cancelled`.
    pub async fn wait(mut self) -> Result<Message> {
        let status = self
            .status
            .wait_for(|s| !matches!(s, UploadStatus::Uploading))
            .await
            .map_err(|_| Error::Cancelled)?
            .clone();
        match status {
            UploadStatus::Dispatched(message) => Ok(message),
            UploadStatus::Failed(reason) => Err(Error::UploadFailed(reason)),
            UploadStatus::Cancelled | UploadStatus::Uploading => Err(Error::Cancelled),
        }
    }
}

struct PendingUpload {
    conversation: ConversationKey,
    reply_to: Option<MessageId>,
    sent_at: i64,
    attachment: MediaAttachment,
    task: Option<JoinHandle<()>>,
    status: watch::Sender<UploadStatus>,
}

// ============================================================================
// Conversation state
// ============================================================================

#[derive(Default)]
struct Conversation {
    order: BTreeSet<(i64, MessageId)>,
    messages: HashMap<MessageId, Message>,
}

impl Conversation {
    /// Inserts `message` or merges it into the entry with the same id.
    /// Returns whether anything changed.
    fn upsert(&mut self, message: Message) -> bool {
        match self.messages.get_mut(&message.id) {
            Some(existing) => {
                let merged = existing.delivery.merge(message.delivery);
                let changed = merged != existing.delivery;
                existing.delivery = merged;
                changed
            }
            None => {
                self.order.insert((message.sent_at, message.id.clone()));
                self.messages.insert(message.id.clone(), message);
                true
            }
        }
    }

    fn advance(&mut self, id: &MessageId, delivery: DeliveryState) -> bool {
        match self.messages.get_mut(id) {
            Some(message) => {
                let merged = message.delivery.merge(delivery);
                let changed = merged != message.delivery;
                message.delivery = merged;
                changed
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|(_, id)| self.messages.get(id).cloned())
            .collect()
    }
}

#[derive(Default)]
struct PipelineState {
    conversations: HashMap<ConversationKey, Conversation>,
    index: HashMap<MessageId, ConversationKey>,
    uploads: HashMap<MessageId, PendingUpload>,
}

impl PipelineState {
    fn upsert(&mut self, message: Message) -> bool {
        self.index
            .insert(message.id.clone(), message.conversation.clone());
        self.conversations
            .entry(message.conversation.clone())
            .or_default()
            .upsert(message)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        let key = self.index.get(id)?;
        self.conversations.get_mut(key)?.messages.get_mut(id)
    }

    fn advance(&mut self, id: &MessageId, delivery: DeliveryState) -> Option<ConversationKey> {
        let key = self.index.get(id)?.clone();
        let changed = self.conversations.get_mut(&key)?.advance(id, delivery);
        changed.then_some(key)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Clone)]
pub struct MessagePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    local_id: String,
    transport: TransportSession,
    uploader: Arc<dyn ObjectStore>,
    emitter: EventEmitter,
    state: Mutex<PipelineState>,
}

impl MessagePipeline {
    /// Subscribes to message, ack, read receipt and typing frames on
    /// `transport`.
    pub fn new(
        local_id: &str,
        transport: TransportSession,
        uploader: Arc<dyn ObjectStore>,
        emitter: EventEmitter,
    ) -> Self {
        let inner = Arc::new(PipelineInner {
            local_id: local_id.to_string(),
            transport: transport.clone(),
            uploader,
            emitter,
            state: Mutex::new(PipelineState::default()),
        });

        let weak = Arc::downgrade(&inner);
        subscribe(&transport, EventKind::Message, &weak, PipelineInner::on_message);
        subscribe(&transport, EventKind::Ack, &weak, PipelineInner::on_ack);
        subscribe(&transport, EventKind::ReadReceipt, &weak, PipelineInner::on_read_receipt);
        subscribe(&transport, EventKind::Typing, &weak, PipelineInner::on_typing);

        Self { inner }
    }

    /// Appends a pending text message and dispatches it.
    ///
    /// On a transport error the message stays in the conversation marked
    /// `failed` and can be resent with [`MessagePipeline::retry`].
    pub fn send(&self, conversation: &ConversationKey, draft: Draft) -> Result<Message> {
        let message = Message {
            id: MessageId::generate(),
            conversation: conversation.clone(),
            sender_id: self.inner.local_id.clone(),
            body: MessageBody::Text(draft.text),
            reply_to: draft.reply_to,
            sent_at: now_millis(),
            delivery: DeliveryState::Pending,
        };
        self.inner.state.lock().upsert(message.clone());
        self.inner.updated(&message);
        self.inner.dispatch(message)
    }

    /// Resends a failed message with its original id.
    pub fn retry(&self, id: &MessageId) -> Result<Message> {
        let message = {
            let mut state = self.inner.state.lock();
            let message = state
                .message_mut(id)
                .ok_or_else(|| Error::UnknownMessage(id.to_string()))?;
            if message.delivery != DeliveryState::Failed {
                return Err(Error::invalid_state("retry", format!("{:?}", message.delivery)));
            }
            message.delivery = DeliveryState::Pending;
            message.clone()
        };
        info!(message_id = %id, "retrying message");
        self.inner.updated(&message);
        self.inner.dispatch(message)
    }

    /// Marks messages read locally and sends a read receipt for them.
    /// Ids not present in the conversation are skipped.
    pub fn mark_read(&self, conversation: &ConversationKey, ids: &[MessageId]) -> Result<()> {
        let read: Vec<MessageId> = {
            let mut state = self.inner.state.lock();
            let Some(conv) = state.conversations.get_mut(conversation) else {
                return Ok(());
            };
            let mut read = Vec::new();
            for id in ids {
                if conv.messages.contains_key(id) {
                    conv.advance(id, DeliveryState::Read);
                    read.push(id.clone());
                }
            }
            read
        };
        if read.is_empty() {
            return Ok(());
        }

        for id in &read {
            self.inner.emitter.emit(RtcEvent::ConversationUpdated {
                conversation: conversation.clone(),
                message_id: id.clone(),
            });
        }
        self.inner.transport.send(
            EventKind::ReadReceipt,
            &ReadReceipt {
                conversation: conversation.clone(),
                reader_id: self.inner.local_id.clone(),
                message_ids: read,
            },
        )
    }

    /// Uploads `attachment`, then dispatches a media message referencing it.
    ///
    /// The message stays out of the conversation until the upload succeeds.
    pub fn send_media(
        &self,
        conversation: &ConversationKey,
        attachment: MediaAttachment,
        reply_to: Option<MessageId>,
    ) -> UploadHandle {
        let id = MessageId::generate();
        let (status, rx) = watch::channel(UploadStatus::Uploading);
        debug!(message_id = %id, size = attachment.size_bytes(), "upload started");

        // the task settles through `finish_upload`, which needs this lock,
        // so the entry is in place before it can look for it
        let mut state = self.inner.state.lock();
        let task = self.inner.spawn_upload(&id, &attachment);
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                conversation: conversation.clone(),
                reply_to,
                sent_at: now_millis(),
                attachment,
                task: Some(task),
                status,
            },
        );
        drop(state);

        UploadHandle {
            message_id: id,
            status: rx,
        }
    }

    /// Restarts a failed upload.
    pub fn retry_upload(&self, id: &MessageId) -> Result<UploadHandle> {
        let mut state = self.inner.state.lock();
        let pending = state
            .uploads
            .get_mut(id)
            .ok_or_else(|| Error::UnknownMessage(id.to_string()))?;
        if pending.task.is_some() {
            return Err(Error::invalid_state("retry an upload", "uploading"));
        }
        pending.status.send_replace(UploadStatus::Uploading);
        // spawned under the lock, as in `send_media`
        pending.task = Some(self.inner.spawn_upload(id, &pending.attachment));
        info!(message_id = %id, "retrying upload");

        Ok(UploadHandle {
            message_id: id.clone(),
            status: pending.status.subscribe(),
        })
    }

    /// Abandons a media message that has not been dispatched yet and
    /// releases its local blob.
    pub fn cancel_upload(&self, id: &MessageId) -> Result<()> {
        let pending = self
            .inner
            .state
            .lock()
            .uploads
            .remove(id)
            .ok_or_else(|| Error::UnknownMessage(id.to_string()))?;

        if let Some(task) = pending.task {
            task.abort();
        }
        pending.attachment.blob.revoke();
        pending.status.send_replace(UploadStatus::Cancelled);
        info!(message_id = %id, "upload cancelled");
        Ok(())
    }

    /// Messages of `conversation` ordered by send time, then id.
    pub fn conversation(&self, conversation: &ConversationKey) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .conversations
            .get(conversation)
            .map(Conversation::snapshot)
            .unwrap_or_default()
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.state.lock().message_mut(id).cloned()
    }

    /// Media messages still waiting for their upload.
    pub fn pending_uploads(&self) -> Vec<MessageId> {
        self.inner.state.lock().uploads.keys().cloned().collect()
    }

    pub fn send_typing(&self, conversation: &ConversationKey, is_typing: bool) -> Result<()> {
        self.inner.transport.send(
            EventKind::Typing,
            &TypingPayload {
                conversation: conversation.clone(),
                user_id: self.inner.local_id.clone(),
                is_typing,
            },
        )
    }
}

fn subscribe<T, F>(transport: &TransportSession, kind: EventKind, inner: &Weak<PipelineInner>, handle: F)
where
    T: serde::de::DeserializeOwned,
    F: Fn(&PipelineInner, T) + Send + Sync + 'static,
{
    let inner = inner.clone();
    transport.on(kind, move |payload| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match serde_json::from_value::<T>(payload.clone()) {
            Ok(event) => handle(&inner, event),
            Err(e) => warn!(?kind, error = %e, "malformed frame"),
        }
    });
}

impl PipelineInner {
    fn updated(&self, message: &Message) {
        self.emitter.emit(RtcEvent::ConversationUpdated {
            conversation: message.conversation.clone(),
            message_id: message.id.clone(),
        });
    }

    fn dispatch(&self, mut message: Message) -> Result<Message> {
        match self.transport.send(EventKind::Message, &message) {
            Ok(()) => Ok(message),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "message not sent");
                if let Some(entry) = self.state.lock().message_mut(&message.id) {
                    entry.delivery = DeliveryState::Failed;
                }
                message.delivery = DeliveryState::Failed;
                self.updated(&message);
                Err(e)
            }
        }
    }

    fn spawn_upload(self: &Arc<Self>, id: &MessageId, attachment: &MediaAttachment) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let uploader = self.uploader.clone();
        let data = attachment.blob.data.clone();
        let meta = attachment.meta();
        let id = id.clone();

        tokio::spawn(async move {
            let result = uploader.upload(data, &meta).await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_upload(&id, result);
            }
        })
    }

    fn finish_upload(&self, id: &MessageId, result: Result<String>) {
        let mut state = self.state.lock();
        let Some(mut pending) = state.uploads.remove(id) else {
            debug!(message_id = %id, "upload settled after cancel");
            return;
        };

        let url = match result {
            Ok(url) => url,
            Err(e) => {
                let reason = e.to_string();
                warn!(message_id = %id, %reason, "upload failed");
                pending.task = None;
                pending
                    .status
                    .send_replace(UploadStatus::Failed(reason.clone()));
                state.uploads.insert(id.clone(), pending);
                drop(state);
                self.emitter.emit(RtcEvent::UploadFailed {
                    message_id: id.clone(),
                    reason,
                });
                return;
            }
        };

        let PendingUpload {
            conversation,
            reply_to,
            sent_at,
            attachment,
            status,
            ..
        } = pending;
        let message = Message {
            id: id.clone(),
            conversation,
            sender_id: self.local_id.clone(),
            body: MessageBody::Media(MediaRef {
                url,
                kind: attachment.kind,
                size_bytes: attachment.size_bytes(),
                file_name: attachment.file_name.clone(),
                mime_type: attachment.mime_type.clone(),
            }),
            reply_to,
            sent_at,
            delivery: DeliveryState::Pending,
        };
        // the object store owns the bytes now
        attachment.blob.revoke();
        state.upsert(message.clone());
        drop(state);

        info!(message_id = %id, "upload complete");
        self.updated(&message);
        let message = match self.dispatch(message.clone()) {
            Ok(sent) => sent,
            Err(_) => Message {
                delivery: DeliveryState::Failed,
                ..message
            },
        };
        status.send_replace(UploadStatus::Dispatched(message));
    }

    fn on_message(&self, mut message: Message) {
        if !message.conversation.contains(&self.local_id) {
            debug!(message_id = %message.id, "message for another conversation");
            return;
        }
        // it reached the bus, so it is at least sent
        message.delivery = message.delivery.merge(DeliveryState::Sent);
        let changed = self.state.lock().upsert(message.clone());
        if changed {
            self.updated(&message);
        } else {
            debug!(message_id = %message.id, "duplicate message merged");
        }
    }

    fn on_ack(&self, ack: AckPayload) {
        let updated: Vec<_> = {
            let mut state = self.state.lock();
            ack.message_ids
                .iter()
                .filter_map(|id| state.advance(id, DeliveryState::Sent).map(|key| (key, id.clone())))
                .collect()
        };
        for (conversation, message_id) in updated {
            self.emitter.emit(RtcEvent::ConversationUpdated {
                conversation,
                message_id,
            });
        }
    }

    fn on_read_receipt(&self, receipt: ReadReceipt) {
        if receipt.reader_id == self.local_id {
            return;
        }
        let updated: Vec<MessageId> = {
            let mut state = self.state.lock();
            let Some(conv) = state.conversations.get_mut(&receipt.conversation) else {
                return;
            };
            receipt
                .message_ids
                .iter()
                .filter(|id| conv.advance(id, DeliveryState::Read))
                .cloned()
                .collect()
        };
        if updated.is_empty() {
            return;
        }
        debug!(conversation = %receipt.conversation, count = updated.len(), "read receipt");
        self.emitter.emit(RtcEvent::ReadReceipt {
            conversation: receipt.conversation,
            message_ids: updated,
        });
    }

    fn on_typing(&self, typing: TypingPayload) {
        if typing.user_id == self.local_id {
            return;
        }
        self.emitter.emit(RtcEvent::Typing {
            conversation: typing.conversation,
            user_id: typing.user_id,
            is_typing: typing.is_typing,
        });
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        for (_, pending) in self.state.get_mut().uploads.drain() {
            if let Some(task) = pending.task {
                task.abort();
            }
            pending.attachment.blob.revoke();
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
