//! Call signaling controller
//!
//! One [`CallContext`] at a time, driven through
//! `idle -> ringing -> connecting -> active -> ended` by local commands and
//! `call_signal` frames from the bus. Inbound signals and peer-connection
//! events are handled one at a time by a worker task, in arrival order.
//!
//! Caller and callee exchange `invite`, `accept`, `offer` and `answer`.
//! The caller creates the offer once the callee has accepted; ICE candidates
//! that arrive before the peer connection exists wait in the context.

use crate::error::{Error, Result};
use crate::events::{EventEmitter, RtcEvent};
use crate::models::*;
use crate::transport::TransportSession;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Media layer
// ============================================================================

/// Local capture handle owned by the media layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { track_id: String },
}

/// Where a peer connection reports its events.
#[derive(Clone)]
pub struct PeerEventSink {
    call_id: String,
    tx: mpsc::UnboundedSender<Input>,
}

impl PeerEventSink {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(Input::Peer {
            call_id: self.call_id.clone(),
            event,
        });
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    fn close(&self);
}

#[async_trait]
pub trait MediaLayer: Send + Sync {
    async fn acquire_local_media(&self) -> Result<MediaStream>;
    async fn create_peer_connection(
        &self,
        stream: &MediaStream,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
    fn release_media(&self, stream: MediaStream);
}

// ============================================================================
// Call context
// ============================================================================

/// Identity of the other party. Holds no resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRef {
    pub id: String,
}

pub struct CallContext {
    pub call_id: String,
    pub state: CallState,
    pub direction: CallDirection,
    pub local_participant: String,
    pub remote: ParticipantRef,
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub pending_candidates: Vec<IceCandidate>,
    pub started_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
    media: Option<MediaStream>,
    peer: Option<Arc<dyn PeerConnection>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallContext {
    fn new(call_id: String, direction: CallDirection, local: &str, remote: &str) -> Self {
        Self {
            call_id,
            state: CallState::Idle,
            direction,
            local_participant: local.to_string(),
            remote: ParticipantRef {
                id: remote.to_string(),
            },
            offer: None,
            answer: None,
            pending_candidates: Vec::new(),
            started_at: now_millis(),
            connected_at: None,
            ended_at: None,
            media: None,
            peer: None,
            ring_timer: None,
        }
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            peer_id: self.remote.id.clone(),
            state: self.state.clone(),
            is_outgoing: self.direction == CallDirection::Outbound,
            started_at: self.started_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
        }
    }

    fn holds_media(&self) -> bool {
        self.media.is_some() || self.peer.is_some()
    }
}

// ============================================================================
// Controller
// ============================================================================

pub(crate) enum Input {
    Signal(CallSignal),
    Peer { call_id: String, event: PeerEvent },
}

#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    local_id: String,
    transport: TransportSession,
    media: Arc<dyn MediaLayer>,
    emitter: EventEmitter,
    ring_timeout: Duration,
    call: Mutex<Option<CallContext>>,
    input: mpsc::UnboundedSender<Input>,
}

impl CallController {
    /// Subscribes to `call_signal` frames on `transport`.
    /// Must be called from within a tokio runtime.
    pub fn new(
        local_id: &str,
        transport: TransportSession,
        media: Arc<dyn MediaLayer>,
        emitter: EventEmitter,
        ring_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            local_id: local_id.to_string(),
            transport: transport.clone(),
            media,
            emitter,
            ring_timeout,
            call: Mutex::new(None),
            input: tx.clone(),
        });

        let me = local_id.to_string();
        transport.on(EventKind::CallSignal, move |payload| {
            match serde_json::from_value::<CallSignal>(payload.clone()) {
                Ok(signal) if signal.recipient_id == me => {
                    let _ = tx.send(Input::Signal(signal));
                }
                Ok(signal) => debug!(recipient = %signal.recipient_id, "call signal for someone else"),
                Err(e) => warn!(error = %e, "malformed call signal"),
            }
        });

        tokio::spawn(run_worker(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    /// Rings `remote_id`. Only possible while no call is in progress.
    pub async fn initiate_call(&self, remote_id: &str) -> Result<CallInfo> {
        let inner = &self.inner;
        let mut slot = inner.call.lock().await;
        if let Some(ctx) = slot.as_ref() {
            if !ctx.state.is_terminal() {
                return Err(Error::invalid_state("initiate a call", &ctx.state));
            }
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let ctx = slot.insert(CallContext::new(
            call_id.clone(),
            CallDirection::Outbound,
            &inner.local_id,
            remote_id,
        ));
        inner.transition(ctx, CallState::Ringing(CallDirection::Outbound));

        if let Err(e) = inner.send_signal(ctx, SignalType::Invite, String::new()) {
            return Err(inner.fail_signaling(ctx, e));
        }

        let weak = Arc::downgrade(inner);
        let timeout = inner.ring_timeout;
        ctx.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.ring_expired(&call_id).await;
            }
        }));

        Ok(ctx.info())
    }

    /// Picks up the ringing inbound call.
    ///
    /// The call lock is not held while the media layer works, so the call
    /// can still be ended from either side in the meantime.
    pub async fn answer(&self) -> Result<CallInfo> {
        let inner = &self.inner;
        let call_id = {
            let mut slot = inner.call.lock().await;
            let ctx = match slot.as_mut() {
                Some(ctx) if ctx.state == CallState::Ringing(CallDirection::Inbound) => ctx,
                Some(ctx) => return Err(Error::invalid_state("answer", &ctx.state)),
                None => return Err(Error::invalid_state("answer", CallState::Idle)),
            };
            inner.transition(ctx, CallState::Connecting);
            ctx.call_id.clone()
        };

        let started = inner.start_media(&call_id).await;

        let mut slot = inner.call.lock().await;
        let state = state_of(&slot);
        let Some(ctx) = live(&mut slot, &call_id) else {
            debug!(call_id = %call_id, %state, "call ended while answering");
            return match started {
                Err(e) => Err(e),
                Ok(_) => Err(Error::invalid_state("answer", state)),
            };
        };
        if let Err(e) = started {
            warn!(call_id = %call_id, error = %e, "cannot answer without media");
            inner.end_locally(ctx, EndReason::MediaFailed);
            return Err(e);
        }
        if let Err(e) = inner.send_signal(ctx, SignalType::Accept, String::new()) {
            return Err(inner.fail_signaling(ctx, e));
        }

        Ok(ctx.info())
    }

    /// Ends the current call from any non-terminal state.
    ///
    /// The termination signal is best-effort. Media is always released.
    pub async fn end_call(&self, reason: EndReason) -> Result<CallInfo> {
        let inner = &self.inner;
        let mut slot = inner.call.lock().await;
        match slot.as_mut() {
            Some(ctx) if !ctx.state.is_terminal() => {
                inner.end_locally(ctx, reason);
                Ok(ctx.info())
            }
            Some(ctx) => Err(Error::invalid_state("end the call", &ctx.state)),
            None => Err(Error::invalid_state("end the call", CallState::Idle)),
        }
    }

    pub async fn state(&self) -> CallState {
        state_of(&*self.inner.call.lock().await)
    }

    /// Snapshot of the current or most recently ended call.
    pub async fn current_call(&self) -> Option<CallInfo> {
        self.inner.call.lock().await.as_ref().map(CallContext::info)
    }

    /// Remote candidates waiting for the peer connection.
    pub async fn queued_candidates(&self) -> usize {
        self.inner
            .call
            .lock()
            .await
            .as_ref()
            .map(|ctx| ctx.pending_candidates.len())
            .unwrap_or(0)
    }
}

/// The current call, if it is still `call_id` and not over.
fn live<'a>(slot: &'a mut Option<CallContext>, call_id: &str) -> Option<&'a mut CallContext> {
    slot.as_mut()
        .filter(|ctx| ctx.call_id == call_id && !ctx.state.is_terminal())
}

fn state_of(slot: &Option<CallContext>) -> CallState {
    slot.as_ref()
        .map(|ctx| ctx.state.clone())
        .unwrap_or(CallState::Idle)
}

/// Collaborator work left over from a signal, run after the call lock is
/// released.
enum Followup {
    Offer,
    Answer {
        peer: Arc<dyn PeerConnection>,
        offer: String,
    },
    RemoteAnswer {
        peer: Arc<dyn PeerConnection>,
        answer: String,
    },
    Candidate {
        peer: Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    },
}

async fn run_worker(inner: Weak<ControllerInner>, mut rx: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match input {
            Input::Signal(signal) => inner.handle_signal(signal).await,
            Input::Peer { call_id, event } => inner.handle_peer_event(&call_id, event).await,
        }
    }
}

impl ControllerInner {
    fn transition(&self, ctx: &mut CallContext, state: CallState) {
        info!(call_id = %ctx.call_id, from = %ctx.state, to = %state, "call state");
        ctx.state = state.clone();
        self.emitter.emit(RtcEvent::CallStateChanged {
            call_id: ctx.call_id.clone(),
            state,
        });
    }

    fn send_signal(&self, ctx: &CallContext, signal_type: SignalType, payload: String) -> Result<()> {
        let signal = CallSignal {
            call_id: ctx.call_id.clone(),
            sender_id: self.local_id.clone(),
            recipient_id: ctx.remote.id.clone(),
            signal_type,
            payload,
        };
        self.transport
            .send(EventKind::CallSignal, &signal)
            .map_err(|e| Error::SignalingFailed(e.to_string()))
    }

    /// Releases the peer connection and local media, then enters `ended`.
    fn finish(&self, ctx: &mut CallContext, reason: EndReason) {
        if let Some(timer) = ctx.ring_timer.take() {
            timer.abort();
        }
        if let Some(peer) = ctx.peer.take() {
            peer.close();
        }
        if let Some(stream) = ctx.media.take() {
            self.media.release_media(stream);
        }
        ctx.pending_candidates.clear();
        ctx.ended_at = Some(now_millis());
        self.transition(ctx, CallState::Ended(reason));
    }

    /// Tells the peer the call is over, then finishes it.
    fn end_locally(&self, ctx: &mut CallContext, reason: EndReason) {
        if let Err(e) = self.send_signal(ctx, SignalType::Hangup, reason.as_str().to_string()) {
            warn!(call_id = %ctx.call_id, error = %e, "termination signal not delivered");
        }
        self.finish(ctx, reason);
    }

    /// A stale offer/answer cannot be resumed, so the call ends here.
    fn fail_signaling(&self, ctx: &mut CallContext, error: Error) -> Error {
        warn!(call_id = %ctx.call_id, error = %error, "signaling failed");
        self.finish(ctx, EndReason::SignalingFailed);
        match error {
            Error::SignalingFailed(_) => error,
            other => Error::SignalingFailed(other.to_string()),
        }
    }

    /// Acquires local media and a peer connection for `call_id`, then
    /// attaches them and flushes queued candidates.
    ///
    /// Returns `None` when the call ended in the meantime; whatever was
    /// acquired is released again.
    async fn start_media(&self, call_id: &str) -> Result<Option<Arc<dyn PeerConnection>>> {
        let stream = self.media.acquire_local_media().await?;
        if live(&mut *self.call.lock().await, call_id).is_none() {
            debug!(call_id, "call ended while acquiring media");
            self.media.release_media(stream);
            return Ok(None);
        }

        let sink = PeerEventSink {
            call_id: call_id.to_string(),
            tx: self.input.clone(),
        };
        let peer = match self.media.create_peer_connection(&stream, sink).await {
            Ok(peer) => peer,
            Err(e) => {
                self.media.release_media(stream);
                return Err(e);
            }
        };

        let mut slot = self.call.lock().await;
        let Some(ctx) = live(&mut slot, call_id) else {
            debug!(call_id, "call ended while creating the peer connection");
            peer.close();
            self.media.release_media(stream);
            return Ok(None);
        };
        ctx.media = Some(stream);
        ctx.peer = Some(peer.clone());

        // held under the lock so later candidates cannot overtake these
        let queued = std::mem::take(&mut ctx.pending_candidates);
        if !queued.is_empty() {
            debug!(call_id, count = queued.len(), "flushing queued ICE candidates");
        }
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                warn!(call_id, error = %e, "rejected queued ICE candidate");
            }
        }
        Ok(Some(peer))
    }

    async fn ring_expired(&self, call_id: &str) {
        let mut slot = self.call.lock().await;
        if let Some(ctx) = slot.as_mut() {
            if ctx.call_id == call_id && ctx.state == CallState::Ringing(CallDirection::Outbound) {
                info!(call_id, "no answer");
                // this task is the timer; do not abort it
                ctx.ring_timer.take();
                self.end_locally(ctx, EndReason::NoAnswer);
            }
        }
    }

    async fn handle_signal(&self, signal: CallSignal) {
        let call_id = signal.call_id.clone();
        let followup = {
            let mut slot = self.call.lock().await;
            self.apply_signal(&mut slot, signal)
        };

        match followup {
            None => {}
            Some(Followup::Offer) => self.send_offer(&call_id).await,
            Some(Followup::Answer { peer, offer }) => self.send_answer(&call_id, peer, offer).await,
            Some(Followup::RemoteAnswer { peer, answer }) => {
                self.accept_answer(&call_id, peer, answer).await
            }
            Some(Followup::Candidate { peer, candidate }) => {
                if let Err(e) = peer.add_ice_candidate(&candidate).await {
                    warn!(call_id = %call_id, error = %e, "rejected ICE candidate");
                }
            }
        }
    }

    fn apply_signal(&self, slot: &mut Option<CallContext>, signal: CallSignal) -> Option<Followup> {
        if signal.signal_type == SignalType::Invite {
            if let Some(ctx) = slot.as_ref() {
                if !ctx.state.is_terminal() {
                    if ctx.call_id != signal.call_id {
                        self.reply_busy(&signal);
                    }
                    return None;
                }
            }
            let ctx = slot.insert(CallContext::new(
                signal.call_id,
                CallDirection::Inbound,
                &self.local_id,
                &signal.sender_id,
            ));
            self.transition(ctx, CallState::Ringing(CallDirection::Inbound));
            self.emitter.emit(RtcEvent::IncomingCall(ctx.info()));
            return None;
        }

        let Some(ctx) = slot.as_mut() else {
            debug!(call_id = %signal.call_id, "signal without a call");
            return None;
        };
        if ctx.call_id != signal.call_id || ctx.state.is_terminal() {
            debug!(call_id = %signal.call_id, kind = ?signal.signal_type, "stale call signal");
            return None;
        }
        if signal.sender_id != ctx.remote.id {
            warn!(call_id = %ctx.call_id, sender = %signal.sender_id, "signal from a third party");
            return None;
        }

        match (signal.signal_type, ctx.state.clone()) {
            (SignalType::Accept, CallState::Ringing(CallDirection::Outbound)) => {
                if let Some(timer) = ctx.ring_timer.take() {
                    timer.abort();
                }
                self.transition(ctx, CallState::Connecting);
                Some(Followup::Offer)
            }
            (SignalType::Busy, CallState::Ringing(CallDirection::Outbound)) => {
                info!(call_id = %ctx.call_id, "peer is busy");
                self.finish(ctx, EndReason::Busy);
                None
            }
            (SignalType::Offer, CallState::Connecting) if ctx.direction == CallDirection::Inbound => {
                let Some(peer) = ctx.peer.clone() else {
                    debug!(call_id = %ctx.call_id, "offer before local media");
                    return None;
                };
                Some(Followup::Answer {
                    peer,
                    offer: signal.payload,
                })
            }
            (SignalType::Answer, CallState::Connecting) if ctx.direction == CallDirection::Outbound => {
                let peer = ctx.peer.clone()?;
                Some(Followup::RemoteAnswer {
                    peer,
                    answer: signal.payload,
                })
            }
            (SignalType::IceCandidate, _) => {
                let candidate = match serde_json::from_str::<IceCandidate>(&signal.payload) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(call_id = %ctx.call_id, error = %e, "malformed ICE candidate");
                        return None;
                    }
                };
                match ctx.peer.clone() {
                    Some(peer) => Some(Followup::Candidate { peer, candidate }),
                    None => {
                        ctx.pending_candidates.push(candidate);
                        None
                    }
                }
            }
            (SignalType::Hangup, _) => {
                let reason = if signal.payload.is_empty() {
                    EndReason::UserHangup
                } else {
                    EndReason::from(signal.payload.as_str())
                };
                info!(call_id = %ctx.call_id, %reason, "peer ended the call");
                self.finish(ctx, reason);
                None
            }
            (kind, state) => {
                debug!(call_id = %ctx.call_id, ?kind, %state, "ignoring out-of-order signal");
                None
            }
        }
    }

    async fn send_offer(&self, call_id: &str) {
        let peer = match self.start_media(call_id).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return,
            Err(e) => {
                warn!(call_id, error = %e, "media unavailable");
                if let Some(ctx) = live(&mut *self.call.lock().await, call_id) {
                    self.end_locally(ctx, EndReason::MediaFailed);
                }
                return;
            }
        };
        let offer = peer.create_offer().await;

        let mut slot = self.call.lock().await;
        let Some(ctx) = live(&mut slot, call_id) else {
            debug!(call_id, "call ended while creating the offer");
            return;
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                warn!(call_id, error = %e, "cannot create offer");
                self.end_locally(ctx, EndReason::MediaFailed);
                return;
            }
        };
        ctx.offer = Some(offer.clone());
        if let Err(e) = self.send_signal(ctx, SignalType::Offer, offer) {
            self.fail_signaling(ctx, e);
        }
    }

    async fn send_answer(&self, call_id: &str, peer: Arc<dyn PeerConnection>, offer: String) {
        let answer = match peer.set_remote_description(&offer).await {
            Ok(()) => peer.create_answer().await,
            Err(e) => Err(e),
        };

        let mut slot = self.call.lock().await;
        let Some(ctx) = live(&mut slot, call_id) else {
            debug!(call_id, "call ended while answering the offer");
            return;
        };
        ctx.offer = Some(offer);
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                warn!(call_id, error = %e, "cannot answer offer");
                self.end_locally(ctx, EndReason::MediaFailed);
                return;
            }
        };
        ctx.answer = Some(answer.clone());
        match self.send_signal(ctx, SignalType::Answer, answer) {
            Ok(()) => self.activate(ctx),
            Err(e) => {
                self.fail_signaling(ctx, e);
            }
        }
    }

    async fn accept_answer(&self, call_id: &str, peer: Arc<dyn PeerConnection>, answer: String) {
        let applied = peer.set_remote_description(&answer).await;

        let mut slot = self.call.lock().await;
        let Some(ctx) = live(&mut slot, call_id) else {
            debug!(call_id, "call ended while applying the answer");
            return;
        };
        ctx.answer = Some(answer);
        match applied {
            Ok(()) => self.activate(ctx),
            Err(e) => {
                warn!(call_id, error = %e, "remote answer rejected");
                self.end_locally(ctx, EndReason::MediaFailed);
            }
        }
    }

    fn activate(&self, ctx: &mut CallContext) {
        ctx.connected_at = Some(now_millis());
        self.transition(ctx, CallState::Active);
    }

    fn reply_busy(&self, invite: &CallSignal) {
        info!(call_id = %invite.call_id, from = %invite.sender_id, "rejecting invite, line busy");
        let busy = CallSignal {
            call_id: invite.call_id.clone(),
            sender_id: self.local_id.clone(),
            recipient_id: invite.sender_id.clone(),
            signal_type: SignalType::Busy,
            payload: String::new(),
        };
        if let Err(e) = self.transport.send(EventKind::CallSignal, &busy) {
            warn!(call_id = %invite.call_id, error = %e, "busy reply not delivered");
        }
    }

    async fn handle_peer_event(&self, call_id: &str, event: PeerEvent) {
        let mut slot = self.call.lock().await;
        let Some(ctx) = slot.as_mut() else {
            return;
        };
        if ctx.call_id != call_id || ctx.state.is_terminal() {
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let payload = match serde_json::to_string(&candidate) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(call_id, error = %e, "cannot encode ICE candidate");
                        return;
                    }
                };
                if let Err(e) = self.send_signal(ctx, SignalType::IceCandidate, payload) {
                    if ctx.state == CallState::Connecting {
                        self.fail_signaling(ctx, e);
                    } else {
                        warn!(call_id, error = %e, "ICE candidate not delivered");
                    }
                }
            }
            PeerEvent::RemoteTrack { track_id } => {
                self.emitter.emit(RtcEvent::RemoteTrack {
                    call_id: call_id.to_string(),
                    track_id,
                });
            }
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(ctx) = self.call.get_mut().as_mut() {
            if ctx.holds_media() {
                if let Some(peer) = ctx.peer.take() {
                    peer.close();
                }
                if let Some(stream) = ctx.media.take() {
                    self.media.release_media(stream);
                }
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
