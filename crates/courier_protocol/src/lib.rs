#![forbid(unsafe_code)]

//! JSON wire protocol: client operation envelope, server frames and the
//! dispatcher push body. Client frames are UTF-8 JSON text tagged by
//! `type`; an unknown `type` is recoverable (the connection stays open).

use std::collections::BTreeMap;

use courier_domain::model::{Channel, ChannelParticipant, OutboundRecord, StoredMessage, UserChannelEntry};
use courier_domain::ChannelId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WebSocket close code for a missing bearer token.
pub const CLOSE_NO_TOKEN: u16 = 4001;
/// WebSocket close code for a token that failed verification.
pub const CLOSE_BAD_TOKEN: u16 = 4002;
/// WebSocket close code sent to live sockets during graceful shutdown.
pub const CLOSE_SHUTDOWN: u16 = 1012;

/// Operations a client may send over its socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOp {
	CreateChannel {
		#[serde(default)]
		name: Option<String>,
		#[serde(default)]
		participants: Vec<String>,
	},
	JoinChannel {
		channel_id: ChannelId,
	},
	LeaveChannel {
		channel_id: ChannelId,
	},
	ChatMessage {
		channel_id: ChannelId,
		content: String,
		#[serde(default)]
		metadata: BTreeMap<String, String>,
	},
	MarkChannelRead {
		channel_id: ChannelId,
	},
}

const KNOWN_OPS: &[&str] = &[
	"create_channel",
	"join_channel",
	"leave_channel",
	"chat_message",
	"mark_channel_read",
];

/// Why a client frame could not be decoded into a [`ClientOp`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpDecodeError {
	#[error("frame is not a JSON object")]
	NotAnObject,
	#[error("missing operation type")]
	MissingType,
	#[error("unknown operation: {0}")]
	UnknownOperation(String),
	#[error("invalid {op} operation: {detail}")]
	Invalid { op: String, detail: String },
}

/// Decode a client text frame, distinguishing "unknown operation" from a
/// malformed payload so the connection can report either and stay open.
pub fn decode_client_op(text: &str) -> Result<ClientOp, OpDecodeError> {
	let value: serde_json::Value = serde_json::from_str(text).map_err(|_| OpDecodeError::NotAnObject)?;
	let Some(obj) = value.as_object() else {
		return Err(OpDecodeError::NotAnObject);
	};

	let op = obj
		.get("type")
		.and_then(|v| v.as_str())
		.ok_or(OpDecodeError::MissingType)?
		.to_string();

	if !KNOWN_OPS.contains(&op.as_str()) {
		return Err(OpDecodeError::UnknownOperation(op));
	}

	serde_json::from_value(value).map_err(|e| OpDecodeError::Invalid {
		op,
		detail: e.to_string(),
	})
}

/// Frames the server sends to a client socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	/// Sent once after authentication: the user's channel index.
	ChannelList {
		channels: Vec<UserChannelEntry>,
	},
	ChannelCreated {
		channel: Channel,
		participants: Vec<ChannelParticipant>,
	},
	/// Reply to a join (or auto-join); `messages` are in chronological order.
	ChannelJoined {
		channel: Channel,
		participants: Vec<ChannelParticipant>,
		messages: Vec<StoredMessage>,
	},
	ChannelLeft {
		channel_id: ChannelId,
	},
	/// A delivered chat or system message.
	ChatMessage {
		#[serde(flatten)]
		message: OutboundRecord,
	},
	ReadMarked {
		channel_id: ChannelId,
	},
	Error {
		error: String,
	},
}

impl ServerFrame {
	/// Encode as a JSON text frame.
	pub fn to_json(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\",\"error\":\"encode failure\"}".to_string())
	}
}

/// Body of `POST /dispatch-message`: either a bare record or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushBody {
	Batch { messages: Vec<OutboundRecord> },
	Single(OutboundRecord),
}

impl PushBody {
	pub fn into_messages(self) -> Vec<OutboundRecord> {
		match self {
			PushBody::Batch { messages } => messages,
			PushBody::Single(record) => vec![record],
		}
	}
}
