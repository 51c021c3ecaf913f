//! Envelope framing for every Drover channel.
//!
//! A logical message is a multipart frame sequence:
//!
//! ```text
//! [routing_identity*]   zero or more opaque routing frames
//! b"<IDS|MSG>"          delimiter
//! signature             hex HMAC-SHA256 over the next four frames, or empty
//! header                JSON
//! parent_header         JSON ("{}" when absent)
//! metadata              JSON
//! content               JSON
//! [buffer*]             raw payload buffers, never inspected
//! ```
//!
//! ROUTER sockets prepend identity frames; deserialization scans for the
//! delimiter so callers never need to know how many were added.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sign::SigningKey;

/// Separates routing identities from the signed envelope.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Wire protocol version carried in every header.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Every message kind the controller sends or consumes.
///
/// Inbound frames with an unrecognized type parse to [`MsgType::Unknown`] and
/// are answered with a structured error instead of being dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    RegistrationRequest,
    RegistrationReply,
    UnregistrationRequest,
    UnregistrationReply,
    ConnectionRequest,
    ConnectionReply,
    Heartbeat,
    ApplyRequest,
    ApplyReply,
    ExecuteRequest,
    ExecuteReply,
    AbortRequest,
    AbortReply,
    ShutdownRequest,
    ShutdownReply,
    QueueRequest,
    QueueReply,
    ResultRequest,
    ResultReply,
    PurgeRequest,
    PurgeReply,
    HistoryRequest,
    HistoryReply,
    ResubmitRequest,
    ResubmitReply,
    DbRequest,
    DbReply,
    TaskDestination,
    RegistrationNotification,
    UnregistrationNotification,
    AbortNotification,
    ShutdownNotification,
    Stream,
    #[serde(other)]
    Unknown,
}

impl MsgType {
    /// The reply kind paired with a request, where one exists.
    pub fn reply_type(self) -> Option<MsgType> {
        Some(match self {
            Self::RegistrationRequest => Self::RegistrationReply,
            Self::UnregistrationRequest => Self::UnregistrationReply,
            Self::ConnectionRequest => Self::ConnectionReply,
            Self::ApplyRequest => Self::ApplyReply,
            Self::ExecuteRequest => Self::ExecuteReply,
            Self::AbortRequest => Self::AbortReply,
            Self::ShutdownRequest => Self::ShutdownReply,
            Self::QueueRequest => Self::QueueReply,
            Self::ResultRequest => Self::ResultReply,
            Self::PurgeRequest => Self::PurgeReply,
            Self::HistoryRequest => Self::HistoryReply,
            Self::ResubmitRequest => Self::ResubmitReply,
            Self::DbRequest => Self::DbReply,
            _ => return None,
        })
    }

    /// Whether this is a reply that terminates a request (apply/execute).
    pub fn is_result(self) -> bool {
        matches!(self, Self::ApplyReply | Self::ExecuteReply)
    }
}

/// Signed envelope header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: Uuid,
    pub msg_type: MsgType,
    pub session: String,
    pub username: String,
    pub date: DateTime<Utc>,
    pub version: String,
}

/// A parsed message: routing identities plus the envelope sections.
#[derive(Debug, Clone)]
pub struct Message {
    pub idents: Vec<Bytes>,
    pub header: Header,
    pub parent: Option<Header>,
    pub metadata: serde_json::Value,
    pub content: serde_json::Value,
    pub buffers: Vec<Bytes>,
}

impl Message {
    pub fn msg_id(&self) -> Uuid {
        self.header.msg_id
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    /// Replace the routing identities, e.g. to address a ROUTER send.
    pub fn with_idents(mut self, idents: Vec<Bytes>) -> Self {
        self.idents = idents;
        self
    }
}

/// Errors while packing or unpacking an envelope.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("no <IDS|MSG> delimiter in {0}-frame message")]
    MissingDelimiter(usize),
    #[error("envelope truncated: {have} frames after delimiter, need 5")]
    TruncatedEnvelope { have: usize },
    #[error("signature did not verify")]
    BadSignature,
    #[error("bad JSON in {section}: {source}")]
    BadJson {
        section: &'static str,
        source: serde_json::Error,
    },
}

impl WireError {
    fn json(section: &'static str) -> impl FnOnce(serde_json::Error) -> WireError {
        move |source| WireError::BadJson { section, source }
    }
}

/// The session codec: stamps headers, signs, and verifies.
///
/// One `Session` is shared per worker; identity of the sending process is the
/// `session` field stamped into every header.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub username: String,
    key: Option<SigningKey>,
}

impl Session {
    pub fn new(username: impl Into<String>, key: Option<SigningKey>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            username: username.into(),
            key,
        }
    }

    pub fn header(&self, msg_type: MsgType) -> Header {
        Header {
            msg_id: Uuid::new_v4(),
            msg_type,
            session: self.session_id.clone(),
            username: self.username.clone(),
            date: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Build a fresh message with no parent.
    pub fn msg(&self, msg_type: MsgType, content: serde_json::Value) -> Message {
        Message {
            idents: Vec::new(),
            header: self.header(msg_type),
            parent: None,
            metadata: serde_json::json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a reply whose parent is the originating header.
    pub fn reply(&self, msg_type: MsgType, parent: &Header, content: serde_json::Value) -> Message {
        Message {
            parent: Some(parent.clone()),
            ..self.msg(msg_type, content)
        }
    }

    /// Pack a message into wire frames, signing if a key is configured.
    pub fn serialize(&self, msg: &Message) -> Result<Vec<Bytes>, WireError> {
        let header = serde_json::to_vec(&msg.header).map_err(WireError::json("header"))?;
        let parent = match &msg.parent {
            Some(p) => serde_json::to_vec(p).map_err(WireError::json("parent_header"))?,
            None => b"{}".to_vec(),
        };
        let metadata = serde_json::to_vec(&msg.metadata).map_err(WireError::json("metadata"))?;
        let content = serde_json::to_vec(&msg.content).map_err(WireError::json("content"))?;

        let signature = match &self.key {
            Some(key) => key.sign(&[&header, &parent, &metadata, &content]),
            None => String::new(),
        };

        let mut frames = Vec::with_capacity(msg.idents.len() + 6 + msg.buffers.len());
        frames.extend(msg.idents.iter().cloned());
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature.into_bytes()));
        frames.push(Bytes::from(header));
        frames.push(Bytes::from(parent));
        frames.push(Bytes::from(metadata));
        frames.push(Bytes::from(content));
        frames.extend(msg.buffers.iter().cloned());
        Ok(frames)
    }

    /// Unpack wire frames, verifying the signature when a key is configured.
    pub fn deserialize(&self, frames: &[Bytes]) -> Result<Message, WireError> {
        let delim = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or(WireError::MissingDelimiter(frames.len()))?;
        let idents: Vec<Bytes> = frames[..delim].to_vec();
        let rest = &frames[delim + 1..];
        if rest.len() < 5 {
            return Err(WireError::TruncatedEnvelope { have: rest.len() });
        }
        let (signature, sections) = (&rest[0], &rest[1..5]);

        if let Some(key) = &self.key {
            let parts: Vec<&[u8]> = sections.iter().map(|b| b.as_ref()).collect();
            if !key.verify(&parts, signature) {
                return Err(WireError::BadSignature);
            }
        }

        let header: Header =
            serde_json::from_slice(&sections[0]).map_err(WireError::json("header"))?;
        let parent_value: serde_json::Value =
            serde_json::from_slice(&sections[1]).map_err(WireError::json("parent_header"))?;
        let parent = match &parent_value {
            serde_json::Value::Object(map) if map.is_empty() => None,
            serde_json::Value::Null => None,
            _ => Some(
                serde_json::from_value(parent_value).map_err(WireError::json("parent_header"))?,
            ),
        };
        let metadata =
            serde_json::from_slice(&sections[2]).map_err(WireError::json("metadata"))?;
        let content = serde_json::from_slice(&sections[3]).map_err(WireError::json("content"))?;
        let buffers = rest[5..].to_vec();

        Ok(Message {
            idents,
            header,
            parent,
            metadata,
            content,
            buffers,
        })
    }
}
