//! Typed request and response messages.
//!
//! Worker-level control messages (`Echo`, `SpawnDevice`, `Stop`,
//! `ReleaseRemotes`) and device-level domain messages share one enum so a
//! single call path can carry both.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value supplied by a caller did not parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported {what} '{value}', expected one of: {expected}")]
pub struct ParseValueError {
    pub what: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Reaction applied to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Like,
    Unlike,
}

impl FromStr for Reaction {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "like" => Ok(Reaction::Like),
            "unlike" => Ok(Reaction::Unlike),
            _ => Err(ParseValueError {
                what: "reaction",
                value: s.to_string(),
                expected: "like, unlike",
            }),
        }
    }
}

/// Asset protocol version a device uploads with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetsVersion {
    V2,
    V3,
}

impl FromStr for AssetsVersion {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_start_matches('v') {
            "2" => Ok(AssetsVersion::V2),
            "3" => Ok(AssetsVersion::V3),
            _ => Err(ParseValueError {
                what: "assets version",
                value: s.to_string(),
                expected: "2, 3",
            }),
        }
    }
}

/// Summary of one message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_id: String,
    pub time_ms: i64,
    pub kind: String,
}

/// Requests understood by a worker or by one of its devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // Control
    Echo { msg: String },
    SpawnDevice { name: String },
    Stop,
    ReleaseRemotes,

    // Device
    SetLabel { label: String },
    Login { email: String, password: String },
    SendText { conv_id: String, text: String },
    SendImage { conv_id: String, path: String },
    SendGiphy { conv_id: String, query: String },
    Knock { conv_id: String },
    Typing { conv_id: String },
    ClearConversation { conv_id: String },
    MuteConversation { conv_id: String },
    UnmuteConversation { conv_id: String },
    ArchiveConversation { conv_id: String },
    UnarchiveConversation { conv_id: String },
    SendFile { conv_id: String, path: String, mime: String },
    DeleteMessage { conv_id: String, message_id: String },
    RecallMessage { conv_id: String, message_id: String },
    UpdateText { message_id: String, text: String },
    GetMessages { conv_id: String },
    SetReaction {
        conv_id: String,
        message_id: String,
        reaction: Reaction,
    },
    SendLocation {
        conv_id: String,
        lon: f32,
        lat: f32,
        address: String,
        zoom: i32,
    },
    SetEphemeral { conv_id: String, expiration_ms: u64 },
    MarkEphemeralRead { conv_id: String, message_id: String },
    GetDeviceId,
    GetFingerprint,
    SetAssetsVersion { version: AssetsVersion },
    CancelConnection { user_id: String },
    GetUserName,
    UpdateUserName { name: String },
}

impl Request {
    /// Wire name of the operation, for log fields.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Echo { .. } => "echo",
            Request::SpawnDevice { .. } => "spawn_device",
            Request::Stop => "stop",
            Request::ReleaseRemotes => "release_remotes",
            Request::SetLabel { .. } => "set_label",
            Request::Login { .. } => "login",
            Request::SendText { .. } => "send_text",
            Request::SendImage { .. } => "send_image",
            Request::SendGiphy { .. } => "send_giphy",
            Request::Knock { .. } => "knock",
            Request::Typing { .. } => "typing",
            Request::ClearConversation { .. } => "clear_conversation",
            Request::MuteConversation { .. } => "mute_conversation",
            Request::UnmuteConversation { .. } => "unmute_conversation",
            Request::ArchiveConversation { .. } => "archive_conversation",
            Request::UnarchiveConversation { .. } => "unarchive_conversation",
            Request::SendFile { .. } => "send_file",
            Request::DeleteMessage { .. } => "delete_message",
            Request::RecallMessage { .. } => "recall_message",
            Request::UpdateText { .. } => "update_text",
            Request::GetMessages { .. } => "get_messages",
            Request::SetReaction { .. } => "set_reaction",
            Request::SendLocation { .. } => "send_location",
            Request::SetEphemeral { .. } => "set_ephemeral",
            Request::MarkEphemeralRead { .. } => "mark_ephemeral_read",
            Request::GetDeviceId => "get_device_id",
            Request::GetFingerprint => "get_fingerprint",
            Request::SetAssetsVersion { .. } => "set_assets_version",
            Request::CancelConnection { .. } => "cancel_connection",
            Request::GetUserName => "get_user_name",
            Request::UpdateUserName { .. } => "update_user_name",
        }
    }

    /// True for the worker-level control messages.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Request::Echo { .. }
                | Request::SpawnDevice { .. }
                | Request::Stop
                | Request::ReleaseRemotes
        )
    }
}

/// Replies sent back for a `Request` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Echo {
        msg: String,
    },
    Successful {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    Failed {
        reason: String,
    },
    DeviceSpawned {
        device_ref: String,
    },
    Messages {
        messages: Vec<MessageInfo>,
    },
    Stopped,
}

impl Response {
    /// Plain success without a payload.
    pub fn ok() -> Self {
        Response::Successful { response: None }
    }

    /// Success carrying a string payload.
    pub fn ok_with(value: impl Into<String>) -> Self {
        Response::Successful {
            response: Some(value.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Response::Failed {
            reason: reason.into(),
        }
    }

    /// Short label of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Echo { .. } => "echo",
            Response::Successful { .. } => "successful",
            Response::Failed { .. } => "failed",
            Response::DeviceSpawned { .. } => "device_spawned",
            Response::Messages { .. } => "messages",
            Response::Stopped => "stopped",
        }
    }
}
