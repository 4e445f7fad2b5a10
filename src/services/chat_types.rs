use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::crypto::ParticipantPair;

// ── Identifiers ────────────────────────────────────────────────

/// Server-assigned message id. The server sends integers; strings are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
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

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = deserialize_id_string(deserializer)?;
        if id.trim().is_empty() {
            return Err(serde::de::Error::custom("message id is empty"));
        }
        Ok(Self(id))
    }
}

/// Locally generated key for an optimistic record awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(String);

impl TempId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The reconciliation key of a rendered record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum RecordKey {
    Temp(TempId),
    Confirmed(MessageId),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Str(String),
}

/// Accept an id sent either as a JSON number or a string.
pub fn deserialize_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Int(n) => n.to_string(),
        RawId::Str(s) => s,
    })
}

fn deserialize_opt_id_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
        RawId::Int(n) => n.to_string(),
        RawId::Str(s) => s,
    }))
}

// ── Wire protocol types ────────────────────────────────────────

/// Message author block attached by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, deserialize_with = "deserialize_opt_id_string")]
    pub id: Option<String>,
    pub username: String,
}

/// A message as the server sends it on `new_message` and from `/get_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(alias = "sender_id", deserialize_with = "deserialize_id_string")]
    pub user_id: String,
    #[serde(deserialize_with = "deserialize_id_string")]
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_face_locked: bool,
    /// Missing on `/get_messages`; the body format decides then.
    #[serde(default)]
    pub is_encrypted: Option<bool>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub author: Option<Author>,
}

impl ServerMessage {
    pub fn sender_id(&self) -> &str {
        &self.user_id
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_server_timestamp)
    }
}

/// Parse the timestamp shapes the server emits (RFC 3339, naive ISO, or
/// `%Y-%m-%d %H:%M:%S`). Naive values are UTC.
pub fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Binary attachment sent through the multipart path.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: &std::path::Path) -> crate::error::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                crate::error::ChatError::InvalidInput(format!(
                    "Attachment path has no file name: {}",
                    path.display()
                ))
            })?
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self {
            filename,
            mime_type,
            bytes,
        })
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.bytes.len())
            .finish()
    }
}

/// What the client hands to the delivery channel.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Wire body: ciphertext when encrypted.
    pub content: String,
    pub recipient_id: String,
    pub is_face_locked: bool,
    pub is_encrypted: bool,
    pub attachment: Option<Attachment>,
}

impl OutgoingMessage {
    /// Payload of the push `send_message` event.
    pub fn push_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "content": self.content,
            "recipient_id": self.recipient_id,
            "is_face_locked": self.is_face_locked,
            "is_encrypted": self.is_encrypted,
        })
    }
}

/// `POST /send_message` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    /// Either a status string or the stored message.
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

impl SendResponse {
    pub fn confirmed_message(&self) -> Option<ServerMessage> {
        match &self.message {
            Some(value @ serde_json::Value::Object(_)) => {
                serde_json::from_value(value.clone()).ok()
            }
            _ => None,
        }
    }

    pub fn status_text(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.as_str())
    }
}

/// `GET /get_messages` response. Items are parsed one by one so a single bad
/// entry does not hide the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// `POST /verify_face` request body.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    #[serde(rename = "faceImage", skip_serializing_if = "Option::is_none")]
    pub face_image: Option<String>,
    pub username: String,
}

/// `POST /verify_face` response. Either `success` or `verified` signals a match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VerifyResponse {
    pub fn is_verified(&self) -> bool {
        self.success.or(self.verified).unwrap_or(false)
    }
}

// ── View types ─────────────────────────────────────────────────

/// Delivery status of a rendered record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Unconfirmed,
    Confirmed,
    Failed,
}

pub const LOCKED_PLACEHOLDER: &str = "🔒 Face-locked message";
pub const SELF_LABEL: &str = "You";

/// What the view shows for a record's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "text")]
pub enum RenderedBody {
    Text(String),
    Locked,
    Undecryptable,
}

impl RenderedBody {
    pub fn display(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Locked => LOCKED_PLACEHOLDER,
            Self::Undecryptable => crate::crypto::DECRYPT_FAILED_PLACEHOLDER,
        }
    }
}

/// A rendered message record owned by the reconciler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub key: RecordKey,
    pub pair: ParticipantPair,
    pub sender_id: String,
    pub recipient_id: String,
    pub sender_label: String,
    /// Body as it travels (ciphertext when encrypted).
    pub wire_body: String,
    pub body: RenderedBody,
    pub timestamp: DateTime<Utc>,
    pub is_face_locked: bool,
    pub is_encrypted: bool,
    pub attachment_ref: Option<String>,
    pub status: DeliveryStatus,
    pub is_outgoing: bool,
}

impl ChatMessage {
    pub fn id(&self) -> Option<&MessageId> {
        match &self.key {
            RecordKey::Confirmed(id) => Some(id),
            RecordKey::Temp(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<&TempId> {
        match &self.key {
            RecordKey::Temp(temp) => Some(temp),
            RecordKey::Confirmed(_) => None,
        }
    }
}

/// A locally originated message about to be rendered optimistically.
#[derive(Debug, Clone)]
pub struct LocalDraft {
    pub body: String,
    pub wire_body: String,
    pub is_face_locked: bool,
    pub is_encrypted: bool,
    pub attachment_ref: Option<String>,
}

/// A server message decoded and ready for admission.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: Option<MessageId>,
    pub sender_id: String,
    pub recipient_id: String,
    pub sender_label: String,
    pub wire_body: String,
    pub body: RenderedBody,
    pub timestamp: DateTime<Utc>,
    pub is_face_locked: bool,
    pub is_encrypted: bool,
    pub attachment_ref: Option<String>,
}

/// Updates published to the rendering surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ViewUpdate {
    Inserted { index: usize, message: ChatMessage },
    Promoted { index: usize, message: ChatMessage },
    Revealed { id: MessageId, body: String },
    UnlockFailed { id: MessageId, reason: String },
    DeliveryFailed { temp_id: TempId, reason: String },
    ConnectionChanged { connected: bool },
}
