//! Data models for Classlink

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Credentials
// ============================================================================

/// Participant kinds known to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Tutor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Tutor => "tutor",
            Role::Student => "student",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "tutor" => Ok(Role::Tutor),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Token pair returned by the auth server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub participant_id: String,
    pub role: Role,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds, taken from the access token's `exp` claim when present.
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn new(participant_id: &str, role: Role, tokens: TokenPair) -> Self {
        let expires_at = expiry_hint(&tokens.access_token);
        Self {
            participant_id: participant_id.to_string(),
            role,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
        }
    }

    /// Same identity, both tokens replaced.
    pub fn rotate(&self, tokens: TokenPair) -> Self {
        Self::new(&self.participant_id, self.role, tokens)
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.expires_at.map(|exp| exp <= now_secs).unwrap_or(false)
    }
}

/// Reads the `exp` claim of a JWT without verifying it.
pub fn expiry_hint(token: &str) -> Option<i64> {
    let claims = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("exp")?.as_i64()
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({})", attempt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unordered pair of participants. Both sides derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)")]
pub struct ConversationKey(String, String);

impl From<(String, String)> for ConversationKey {
    fn from((a, b): (String, String)) -> Self {
        Self::new(&a, &b)
    }
}

impl ConversationKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.0 == participant_id || self.1 == participant_id
    }

    /// The participant that is not `me`.
    pub fn peer_of(&self, me: &str) -> &str {
        if self.0 == me {
            &self.1
        } else {
            &self.0
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Read,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Failed | DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Read => 2,
        }
    }

    /// Delivery only moves forward; `Failed` never overrides progress.
    pub fn merge(self, incoming: DeliveryState) -> DeliveryState {
        if incoming.rank() > self.rank() {
            incoming
        } else if incoming.rank() == self.rank() && incoming == DeliveryState::Pending {
            // a retransmission clears a previous failure
            DeliveryState::Pending
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            MediaKind::Image
        } else if mime_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Document
        }
    }
}

/// Uploaded attachment as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Media(MediaRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender_id: String,
    pub body: MessageBody,
    /// Not guaranteed to resolve to a known message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Unix milliseconds.
    pub sent_at: i64,
    pub delivery: DeliveryState,
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EndReason {
    UserHangup,
    NoAnswer,
    Busy,
    Rejected,
    SignalingFailed,
    MediaFailed,
    Other(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::UserHangup => "user-hangup",
            EndReason::NoAnswer => "no-answer",
            EndReason::Busy => "busy",
            EndReason::Rejected => "rejected",
            EndReason::SignalingFailed => "signaling-failed",
            EndReason::MediaFailed => "media-failed",
            EndReason::Other(reason) => reason,
        }
    }
}

impl From<&str> for EndReason {
    fn from(s: &str) -> Self {
        match s {
            "user-hangup" => EndReason::UserHangup,
            "no-answer" => EndReason::NoAnswer,
            "busy" => EndReason::Busy,
            "rejected" => EndReason::Rejected,
            "signaling-failed" => EndReason::SignalingFailed,
            "media-failed" => EndReason::MediaFailed,
            other => EndReason::Other(other.to_string()),
        }
    }
}

impl From<String> for EndReason {
    fn from(s: String) -> Self {
        EndReason::from(s.as_str())
    }
}

impl From<EndReason> for String {
    fn from(reason: EndReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing(CallDirection),
    Connecting,
    Active,
    Ended(EndReason),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended(_))
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Ringing(CallDirection::Outbound) => write!(f, "ringing (outbound)"),
            CallState::Ringing(CallDirection::Inbound) => write!(f, "ringing (inbound)"),
            CallState::Connecting => write!(f, "connecting"),
            CallState::Active => write!(f, "active"),
            CallState::Ended(reason) => write!(f, "ended ({})", reason),
        }
    }
}

/// Read-only snapshot of a call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: String,
    pub peer_id: String,
    pub state: CallState,
    pub is_outgoing: bool,
    pub started_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Invite,
    Accept,
    Busy,
    Offer,
    Answer,
    IceCandidate,
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub call_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub signal_type: SignalType,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

// ============================================================================
// Wire frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Authenticate,
    Authenticated,
    Message,
    Ack,
    ReadReceipt,
    CallSignal,
    CredentialExpired,
    Typing,
    Error,
    Ping,
    Pong,
}

/// `{"type": ..., "payload": ...}` envelope used for every bus frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    pub role: Role,
}

impl From<&Credential> for AuthPayload {
    fn from(credential: &Credential) -> Self {
        Self {
            token: credential.access_token.clone(),
            role: credential.role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub conversation: ConversationKey,
    pub reader_id: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation: ConversationKey,
    pub user_id: String,
    pub is_typing: bool,
}
