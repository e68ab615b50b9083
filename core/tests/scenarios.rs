//! End-to-end scenarios: two clients joined by a relay over loopback buses.

use async_trait::async_trait;
use classlink_core::loopback::{loopback, LoopbackServer};
use classlink_core::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Doubles
// ============================================================================

#[derive(Default)]
struct CountingMedia {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct ScriptedPeer;

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0 offer".into())
    }
    async fn create_answer(&self) -> Result<String> {
        Ok("v=0 answer".into())
    }
    async fn set_remote_description(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }
    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }
    fn close(&self) {}
}

#[async_trait]
impl MediaLayer for CountingMedia {
    async fn acquire_local_media(&self) -> Result<MediaStream> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream {
            id: format!("cam-{}", n),
        })
    }
    async fn create_peer_connection(
        &self,
        _stream: &MediaStream,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        events.emit(PeerEvent::RemoteTrack {
            track_id: "remote-video".into(),
        });
        Ok(Arc::new(ScriptedPeer) as Arc<dyn PeerConnection>)
    }
    fn release_media(&self, _stream: MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct GatedAuth {
    calls: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl AuthServer for GatedAuth {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenPair, RefreshFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(TokenPair {
            access_token: format!("{}-rotated", refresh_token),
            refresh_token: format!("{}-next", refresh_token),
        })
    }
}

#[derive(Default)]
struct GatedStore {
    calls: AtomicUsize,
    release: Notify,
    fail: AtomicBool,
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn upload(&self, _data: Arc<[u8]>, meta: &UploadMeta) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::UploadFailed("storage offline".into()));
        }
        Ok(format!("https://files.example.org/api/v1/files/{}", meta.file_name))
    }
}

// ============================================================================
// Network
// ============================================================================

struct Peer {
    client: RtcClient,
    server: LoopbackServer,
    media: Arc<CountingMedia>,
    auth: Arc<GatedAuth>,
    store: Arc<GatedStore>,
    events: Arc<Mutex<Vec<RtcEvent>>>,
}

async fn peer(id: &str, role: Role) -> Peer {
    let (connector, server) = loopback();
    let credentials = CredentialStore::in_memory();
    credentials
        .sign_in(Credential::new(
            id,
            role,
            TokenPair {
                access_token: format!("{}-a1", id),
                refresh_token: format!("{}-r1", id),
            },
        ))
        .unwrap();

    let media = Arc::new(CountingMedia::default());
    let auth = Arc::new(GatedAuth::default());
    let store = Arc::new(GatedStore::default());
    let client = RtcClient::new(
        ClientConfig::default(),
        credentials,
        Collaborators {
            connector: Arc::new(connector),
            auth: auth.clone(),
            uploader: store.clone(),
            media: media.clone(),
        },
    )
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        client.add_listener(Arc::new(move |event: RtcEvent| events.lock().push(event)));
    }
    client.connect().await.unwrap();

    Peer {
        client,
        server,
        media,
        auth,
        store,
        events,
    }
}

/// Forwards everything but handshakes between the two buses.
struct Relay {
    log: Vec<Frame>,
}

impl Relay {
    fn new() -> Self {
        Self { log: Vec::new() }
    }

    fn forward(&mut self, from: &LoopbackServer, to: &LoopbackServer) {
        for frame in from.take_frames() {
            if matches!(frame.kind, EventKind::Authenticate | EventKind::Pong) {
                continue;
            }
            to.push(frame.kind, &frame.payload);
            self.log.push(frame);
        }
    }

    async fn settle(&mut self, a: &Peer, b: &Peer) {
        for _ in 0..20 {
            self.forward(&a.server, &b.server);
            self.forward(&b.server, &a.server);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn signals(&self, kind: SignalType) -> usize {
        self.log
            .iter()
            .filter(|f| f.kind == EventKind::CallSignal)
            .filter_map(|f| serde_json::from_value::<CallSignal>(f.payload.clone()).ok())
            .filter(|s| s.signal_type == kind)
            .count()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn call_runs_from_invite_to_single_hangup() {
    let tutor = peer("tutor-7", Role::Tutor).await;
    let student = peer("stu-1", Role::Student).await;
    let mut relay = Relay::new();

    let outgoing = tutor.client.calls().initiate_call("stu-1").await.unwrap();
    relay.settle(&tutor, &student).await;

    assert_eq!(
        student.client.calls().state().await,
        CallState::Ringing(CallDirection::Inbound)
    );
    assert!(student
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, RtcEvent::IncomingCall(info) if info.call_id == outgoing.call_id)));

    student.client.calls().answer().await.unwrap();
    relay.settle(&tutor, &student).await;

    assert_eq!(tutor.client.calls().state().await, CallState::Active);
    assert_eq!(student.client.calls().state().await, CallState::Active);
    assert!(tutor
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, RtcEvent::RemoteTrack { .. })));

    tutor
        .client
        .calls()
        .end_call(EndReason::UserHangup)
        .await
        .unwrap();
    relay.settle(&tutor, &student).await;

    assert_eq!(
        student.client.calls().state().await,
        CallState::Ended(EndReason::UserHangup)
    );
    assert_eq!(relay.signals(SignalType::Hangup), 1);
    assert_eq!(relay.signals(SignalType::Offer), 1);
    assert_eq!(relay.signals(SignalType::Answer), 1);
    for side in [&tutor, &student] {
        assert_eq!(side.media.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(side.media.released.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn second_caller_gets_busy() {
    let tutor = peer("tutor-7", Role::Tutor).await;
    let student = peer("stu-1", Role::Student).await;
    let other = peer("stu-2", Role::Student).await;
    let mut relay = Relay::new();

    tutor.client.calls().initiate_call("stu-1").await.unwrap();
    relay.settle(&tutor, &student).await;

    let second = other.client.calls().initiate_call("stu-1").await.unwrap();
    relay.settle(&other, &student).await;

    assert_eq!(
        other.client.calls().state().await,
        CallState::Ended(EndReason::Busy)
    );
    let current = student.client.calls().current_call().await.unwrap();
    assert_ne!(current.call_id, second.call_id);
    assert_eq!(current.peer_id, "tutor-7");
    assert_eq!(current.state, CallState::Ringing(CallDirection::Inbound));
}

#[tokio::test(start_paused = true)]
async fn sends_held_during_refresh_flush_in_order() {
    let student = peer("stu-1", Role::Student).await;
    let key = ConversationKey::new("stu-1", "tutor-7");

    student.server.push(EventKind::CredentialExpired, &serde_json::Value::Null);
    while student.auth.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let ids: Vec<MessageId> = ["one", "two", "three"]
        .iter()
        .map(|text| student.client.messages().send(&key, Draft::text(*text)).unwrap().id)
        .collect();
    assert!(student.server.frames_of(EventKind::Message).is_empty());
    assert_eq!(student.client.session().state, ConnectionState::Connected);

    student.auth.release.notify_one();
    for _ in 0..50 {
        if student.server.frames_of(EventKind::Message).len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let frames = student.server.frames();
    let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Authenticate,
            EventKind::Authenticate,
            EventKind::Message,
            EventKind::Message,
            EventKind::Message,
        ]
    );
    assert_eq!(frames[1].payload["token"], "stu-1-r1-rotated");
    let sent: Vec<_> = frames[2..]
        .iter()
        .map(|f| f.payload["id"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<_> = ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(sent, expected);
    assert_eq!(student.auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retransmitted_message_appears_once() {
    let tutor = peer("tutor-7", Role::Tutor).await;
    let student = peer("stu-1", Role::Student).await;
    let mut relay = Relay::new();
    let key = ConversationKey::new("tutor-7", "stu-1");

    let sent = tutor
        .client
        .messages()
        .send(&key, Draft::text("homework is due friday"))
        .unwrap();
    relay.settle(&tutor, &student).await;
    // same id arriving again
    student.server.push(EventKind::Message, &sent);
    relay.settle(&tutor, &student).await;

    let conv = student.client.messages().conversation(&key);
    assert_eq!(conv.len(), 1);
    assert_eq!(conv[0].id, sent.id);

    student
        .client
        .messages()
        .mark_read(&key, &[sent.id.clone()])
        .unwrap();
    relay.settle(&tutor, &student).await;
    assert_eq!(
        tutor.client.messages().message(&sent.id).unwrap().delivery,
        DeliveryState::Read
    );
}

#[tokio::test(start_paused = true)]
async fn media_reaches_peer_only_with_url() {
    let tutor = peer("tutor-7", Role::Tutor).await;
    let student = peer("stu-1", Role::Student).await;
    let mut relay = Relay::new();
    let key = ConversationKey::new("tutor-7", "stu-1");

    let handle = tutor.client.messages().send_media(
        &key,
        MediaAttachment::new(LocalBlob::new(vec![0u8; 2048]), "slides.png", "image/png"),
        None,
    );
    relay.settle(&tutor, &student).await;
    assert!(tutor.client.messages().conversation(&key).is_empty());
    assert!(student.client.messages().conversation(&key).is_empty());

    tutor.store.release.notify_one();
    let message = handle.wait().await.unwrap();
    relay.settle(&tutor, &student).await;

    let received = student.client.messages().conversation(&key);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, message.id);
    match &received[0].body {
        MessageBody::Media(media) => {
            assert_eq!(media.url, "https://files.example.org/api/v1/files/slides.png");
            assert_eq!(media.kind, MediaKind::Image);
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_upload_leaves_no_trace() {
    let tutor = peer("tutor-7", Role::Tutor).await;
    let student = peer("stu-1", Role::Student).await;
    let mut relay = Relay::new();
    let key = ConversationKey::new("tutor-7", "stu-1");

    let blob = LocalBlob::new(vec![1u8; 512]);
    let watch = blob.watch();
    let handle = tutor.client.messages().send_media(
        &key,
        MediaAttachment::new(blob, "recording.mp4", "video/mp4"),
        None,
    );
    while tutor.store.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tutor.client.messages().cancel_upload(&handle.message_id).unwrap();
    tutor.store.release.notify_one();
    relay.settle(&tutor, &student).await;

    assert!(watch.is_revoked());
    assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    assert!(tutor.client.messages().conversation(&key).is_empty());
    assert!(student.client.messages().conversation(&key).is_empty());
    assert!(relay.log.iter().all(|f| f.kind != EventKind::Message));
}
