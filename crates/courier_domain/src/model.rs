#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{ChannelId, ChannelKind, InstanceId, MessageId, ParticipantRole, UserId};

/// A chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub channel_id: ChannelId,
	pub kind: ChannelKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub created_at: i64,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

/// Membership row: one per `(channel, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParticipant {
	pub channel_id: ChannelId,
	pub user_id: UserId,
	pub joined_at: i64,
	pub role: ParticipantRole,
}

/// Denormalized per-user channel index for fast "list my channels".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChannelEntry {
	pub user_id: UserId,
	pub channel_id: ChannelId,
	pub kind: ChannelKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_read_at: Option<i64>,
	#[serde(default)]
	pub other_participants: BTreeSet<UserId>,
}

/// A persisted channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub channel_id: ChannelId,
	pub message_id: MessageId,
	pub user_id: UserId,
	pub content: String,
	pub created_at: i64,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

/// Live-connection routing entry: where does this user's socket live.
///
/// Absence means offline. Written on connect, refreshed on heartbeat,
/// deleted by the owning instance on disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
	pub user_id: UserId,
	pub instance: InstanceId,
	pub host: String,
	pub port: u16,
	pub updated_at: i64,
}

/// One fan-out record on the outbound log: a message addressed to a single
/// participant. The log key is `target_user_id` for partition affinity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
	pub channel_id: ChannelId,
	pub message_id: MessageId,
	pub sender_id: UserId,
	pub target_user_id: UserId,
	pub content: String,
	pub created_at: i64,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl OutboundRecord {
	/// Address one stored message to a single target participant.
	pub fn for_target(msg: &StoredMessage, target: UserId) -> Self {
		Self {
			channel_id: msg.channel_id,
			message_id: msg.message_id,
			sender_id: msg.user_id.clone(),
			target_user_id: target,
			content: msg.content.clone(),
			created_at: msg.created_at,
			metadata: msg.metadata.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::{InstanceId, MessageId, UserId, unix_ms_now};

	use super::*;

	#[test]
	fn outbound_record_addresses_target() {
		let msg = StoredMessage {
			channel_id: uuid::Uuid::new_v4(),
			message_id: MessageId::from_parts(1_700_000_000_000, InstanceId::new(1).unwrap(), 0),
			user_id: UserId::new("alice").unwrap(),
			content: "hi".to_string(),
			created_at: unix_ms_now(),
			metadata: BTreeMap::new(),
		};

		let rec = OutboundRecord::for_target(&msg, UserId::new("bob").unwrap());
		assert_eq!(rec.sender_id.as_str(), "alice");
		assert_eq!(rec.target_user_id.as_str(), "bob");
		assert_eq!(rec.message_id, msg.message_id);
		assert_eq!(rec.content, "hi");
	}

	#[test]
	fn message_id_serializes_as_string() {
		let id = MessageId::from_parts(1_700_000_000_000, InstanceId::new(3).unwrap(), 9);
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{}\"", id.as_u64()));
		let back: MessageId = serde_json::from_str(&json).unwrap();
		assert_eq!(back, id);
	}
}
