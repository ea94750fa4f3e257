//! Tagged message catalog: every frame body is a JSON object carrying an
//! integer `tag` plus the variant's fields. The tag is derived from the
//! variant on encode and stripped before construction on decode.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message body is not a JSON object")]
    NotAnObject,
    #[error("message body has no integer tag")]
    MissingTag,
    #[error("unknown message tag {0}")]
    UnknownTag(u64),
    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub username: String,
    pub secret: String,
    pub email: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub secret: String,
    pub listen_port: u16,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logout {
    pub username: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDirectory {
    pub username: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPublicKey {
    pub requester_name: String,
    pub target_name: String,
    pub time: i64,
}

/// Direct peer-to-peer chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub sender_name: String,
    pub receiver_name: String,
    pub content: String,
    pub time: i64,
}

impl ChatMessage {
    pub fn new(sender_name: &str, receiver_name: &str, content: &str) -> Self {
        ChatMessage {
            message_id: Uuid::new_v4().to_string(),
            sender_name: sender_name.to_string(),
            receiver_name: receiver_name.to_string(),
            content: content.to_string(),
            time: unix_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRegister {
    pub username: String,
    pub user_id: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessLogin {
    pub username: String,
    pub user_id: String,
    pub transfer_id: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessLogout {
    pub username: String,
    pub user_id: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRegister {
    pub username: String,
    pub error_type: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailLogin {
    pub username: String,
    pub error_type: String,
    pub time: i64,
}

pub const ERR_USERNAME_EXISTS: &str = "username_exists";
pub const ERR_USER_NOT_FOUND: &str = "user_not_found";
pub const ERR_INCORRECT_SECRET: &str = "incorrect_secret";

/// Sink selector for a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Directory,
    PublicKey,
    Image,
    Audio,
    File,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Directory => "directory",
            FileKind::PublicKey => "publickey",
            FileKind::Image => "image",
            FileKind::Audio => "audio",
            FileKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransfer {
    pub transfer_id: String,
    pub file_type: FileKind,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub transfer_id: String,
    pub chunk_index: u64,
    /// Base64 of the raw chunk bytes.
    pub data: String,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTransfer {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub time: i64,
}

/// Closed set of wire messages, discriminated by integer tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Register(Register),
    Login(Login),
    Logout(Logout),
    GetDirectory(GetDirectory),
    GetPublicKey(GetPublicKey),
    Message(ChatMessage),
    SuccessRegister(SuccessRegister),
    SuccessLogin(SuccessLogin),
    SuccessLogout(SuccessLogout),
    FailRegister(FailRegister),
    FailLogin(FailLogin),
    StartTransfer(StartTransfer),
    DataChunk(DataChunk),
    EndTransfer(EndTransfer),
}

impl Envelope {
    /// Wire tag of this variant. Values follow the original protocol table.
    pub fn tag(&self) -> u64 {
        match self {
            Envelope::Register(_) => 1,
            Envelope::Login(_) => 2,
            Envelope::Logout(_) => 3,
            Envelope::GetDirectory(_) => 4,
            Envelope::GetPublicKey(_) => 6,
            Envelope::Message(_) => 11,
            Envelope::SuccessRegister(_) => 21,
            Envelope::SuccessLogin(_) => 22,
            Envelope::SuccessLogout(_) => 23,
            Envelope::FailRegister(_) => 28,
            Envelope::FailLogin(_) => 29,
            Envelope::StartTransfer(_) => 31,
            Envelope::DataChunk(_) => 32,
            Envelope::EndTransfer(_) => 33,
        }
    }

    /// Serialize to a JSON object with the `tag` field injected.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let mut value = match self {
            Envelope::Register(m) => serde_json::to_value(m),
            Envelope::Login(m) => serde_json::to_value(m),
            Envelope::Logout(m) => serde_json::to_value(m),
            Envelope::GetDirectory(m) => serde_json::to_value(m),
            Envelope::GetPublicKey(m) => serde_json::to_value(m),
            Envelope::Message(m) => serde_json::to_value(m),
            Envelope::SuccessRegister(m) => serde_json::to_value(m),
            Envelope::SuccessLogin(m) => serde_json::to_value(m),
            Envelope::SuccessLogout(m) => serde_json::to_value(m),
            Envelope::FailRegister(m) => serde_json::to_value(m),
            Envelope::FailLogin(m) => serde_json::to_value(m),
            Envelope::StartTransfer(m) => serde_json::to_value(m),
            Envelope::DataChunk(m) => serde_json::to_value(m),
            Envelope::EndTransfer(m) => serde_json::to_value(m),
        }?;
        let Value::Object(ref mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        map.insert("tag".to_string(), Value::from(self.tag()));
        Ok(value)
    }

    /// Dispatch on the `tag` field and construct the matching variant. The
    /// tag is removed from the map first; it is derived data, not a field.
    pub fn from_value(mut value: Value) -> Result<Self, ProtocolError> {
        let tag = {
            let Value::Object(ref mut map) = value else {
                return Err(ProtocolError::NotAnObject);
            };
            map.remove("tag")
                .and_then(|v| v.as_u64())
                .ok_or(ProtocolError::MissingTag)?
        };
        let envelope = match tag {
            1 => Envelope::Register(serde_json::from_value(value)?),
            2 => Envelope::Login(serde_json::from_value(value)?),
            3 => Envelope::Logout(serde_json::from_value(value)?),
            4 => Envelope::GetDirectory(serde_json::from_value(value)?),
            6 => Envelope::GetPublicKey(serde_json::from_value(value)?),
            11 => Envelope::Message(serde_json::from_value(value)?),
            21 => Envelope::SuccessRegister(serde_json::from_value(value)?),
            22 => Envelope::SuccessLogin(serde_json::from_value(value)?),
            23 => Envelope::SuccessLogout(serde_json::from_value(value)?),
            28 => Envelope::FailRegister(serde_json::from_value(value)?),
            29 => Envelope::FailLogin(serde_json::from_value(value)?),
            31 => Envelope::StartTransfer(serde_json::from_value(value)?),
            32 => Envelope::DataChunk(serde_json::from_value(value)?),
            33 => Envelope::EndTransfer(serde_json::from_value(value)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(envelope)
    }
}
