#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_cluster::directory::Directory;
use courier_cluster::log::LogProducer;
use courier_domain::model::{Channel, ChannelParticipant, StoredMessage, UserChannelEntry};
use courier_domain::snowflake::IdGenerator;
use courier_domain::{ChannelId, ChannelKind, ParticipantRole, UserId, derive_direct_channel_id, unix_ms_now};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use super::store::Store;

#[derive(Debug, Error)]
pub enum OpError {
	#[error("{0}")]
	Validation(String),
	#[error("channel not found")]
	NotFound,
	#[error(transparent)]
	Upstream(#[from] anyhow::Error),
}

/// Channel lifecycle and message fan-out.
///
/// Fan-out targets are always read fresh from storage at post time, so a
/// membership change between two messages is honored by the second one.
pub struct ChannelService {
	store: Arc<dyn Store>,
	log: Arc<dyn LogProducer>,
	directory: Arc<dyn Directory>,
	ids: Arc<IdGenerator>,
	history_limit: u32,
}

impl ChannelService {
	pub fn new(
		store: Arc<dyn Store>,
		log: Arc<dyn LogProducer>,
		directory: Arc<dyn Directory>,
		ids: Arc<IdGenerator>,
		history_limit: u32,
	) -> Self {
		Self {
			store,
			log,
			directory,
			ids,
			history_limit,
		}
	}

	/// Create a channel for `creator` plus `others`.
	///
	/// A channel with no name and exactly one other member is a direct
	/// channel: its id is derived from the user pair, so a second create by
	/// either side resolves to the same channel and returns it as-is.
	pub async fn create_channel(
		&self,
		creator: &UserId,
		name: Option<String>,
		others: &[String],
	) -> Result<(Channel, Vec<ChannelParticipant>), OpError> {
		let name = name.filter(|n| !n.trim().is_empty());

		let mut members: Vec<UserId> = vec![creator.clone()];
		for raw in others {
			let user = UserId::new(raw.clone()).map_err(|e| OpError::Validation(format!("invalid participant: {e}")))?;
			if !members.contains(&user) {
				members.push(user);
			}
		}

		let (channel_id, kind) = if name.is_none() && members.len() == 2 {
			(derive_direct_channel_id(&members[0], &members[1]), ChannelKind::Direct)
		} else {
			(uuid::Uuid::new_v4(), ChannelKind::Group)
		};

		// Direct channels are deterministic; re-creating one hands back the
		// existing channel instead of failing.
		if kind == ChannelKind::Direct
			&& let Some(existing) = self.store.channel(&channel_id).await?
		{
			let participants = self.store.participants(&channel_id).await?;
			return Ok((existing, participants));
		}

		let now = unix_ms_now();
		let channel = Channel {
			channel_id,
			kind,
			name,
			created_at: now,
			metadata: BTreeMap::new(),
		};
		let participants: Vec<ChannelParticipant> = members
			.iter()
			.map(|user| ChannelParticipant {
				channel_id,
				user_id: user.clone(),
				joined_at: now,
				role: if user == creator {
					ParticipantRole::Admin
				} else {
					ParticipantRole::Member
				},
			})
			.collect();

		self.store.create_channel(&channel, &participants).await?;
		// Room sets track connected subscribers, not membership: the other
		// participants enter the set when their own sessions pick the
		// channel up.
		self.directory.add_room_member(&channel_id, creator).await?;

		info!(channel = %channel_id, kind = %kind, members = participants.len(), "channel created");
		counter!("courier_channels_created_total").increment(1);
		Ok((channel, participants))
	}

	/// Join an existing channel. Joins are silent: no system message is
	/// posted, the join is only visible through the participant list.
	pub async fn join_channel(
		&self,
		user: &UserId,
		channel_id: &ChannelId,
	) -> Result<(Channel, Vec<ChannelParticipant>, Vec<StoredMessage>), OpError> {
		let channel = self.store.channel(channel_id).await?.ok_or(OpError::NotFound)?;

		let participant = ChannelParticipant {
			channel_id: *channel_id,
			user_id: user.clone(),
			joined_at: unix_ms_now(),
			role: ParticipantRole::Member,
		};
		self.store.add_participant(&channel, &participant).await?;
		self.directory.add_room_member(channel_id, user).await?;

		let participants = self.store.participants(channel_id).await?;
		let mut messages = self.store.recent_messages(channel_id, self.history_limit).await?;
		messages.reverse();

		Ok((channel, participants, messages))
	}

	/// Leave a channel, then announce the departure to whoever remains.
	/// The announcement is best-effort: the leave has already happened, so
	/// a failed system message only gets logged.
	pub async fn leave_channel(&self, user: &UserId, channel_id: &ChannelId) -> Result<(), OpError> {
		let channel = self.store.channel(channel_id).await?.ok_or(OpError::NotFound)?;

		self.store.remove_participant(channel_id, user).await?;
		self.directory.remove_room_member(channel_id, user).await?;
		info!(channel = %channel_id, user = %user, "participant left");

		let mut metadata = BTreeMap::new();
		metadata.insert("system".to_string(), "true".to_string());
		metadata.insert("event".to_string(), "user_left".to_string());
		let announcement = StoredMessage {
			channel_id: channel.channel_id,
			message_id: self.ids.generate(),
			user_id: user.clone(),
			content: format!("{user} left the channel"),
			created_at: unix_ms_now(),
			metadata,
		};

		if let Err(e) = self.store.insert_message(&announcement).await {
			warn!(channel = %channel_id, error = %e, "failed to persist leave announcement");
			return Ok(());
		}
		self.fan_out(&announcement).await;

		Ok(())
	}

	/// Persist a message and fan it out to every current participant,
	/// sender included (the echo doubles as the delivery receipt).
	pub async fn post_message(
		&self,
		sender: &UserId,
		channel_id: &ChannelId,
		content: String,
		metadata: BTreeMap<String, String>,
	) -> Result<StoredMessage, OpError> {
		if content.trim().is_empty() {
			return Err(OpError::Validation("message content is empty".to_string()));
		}
		self.store.channel(channel_id).await?.ok_or(OpError::NotFound)?;

		let participants = self.store.participants(channel_id).await?;
		if !participants.iter().any(|p| &p.user_id == sender) {
			return Err(OpError::Validation("not a participant of this channel".to_string()));
		}

		let message = StoredMessage {
			channel_id: *channel_id,
			message_id: self.ids.generate(),
			user_id: sender.clone(),
			content,
			created_at: unix_ms_now(),
			metadata,
		};
		self.store.insert_message(&message).await?;
		counter!("courier_messages_posted_total").increment(1);

		// Fan-out failures never unwind the post: the message is durable,
		// delivery is the log's problem from here.
		self.fan_out(&message).await;

		Ok(message)
	}

	/// Record the read position. Deliberately no fan-out: read receipts are
	/// a per-user bookmark, not an event other participants see.
	pub async fn mark_read(&self, user: &UserId, channel_id: &ChannelId) -> Result<(), OpError> {
		self.store.channel(channel_id).await?.ok_or(OpError::NotFound)?;
		self.store.mark_read(user, channel_id, unix_ms_now()).await?;
		Ok(())
	}

	pub async fn channel_list(&self, user: &UserId) -> Result<Vec<UserChannelEntry>, OpError> {
		Ok(self.store.user_channels(user).await?)
	}

	/// One outbound record per current participant, keyed by target.
	async fn fan_out(&self, message: &StoredMessage) {
		let participants = match self.store.participants(&message.channel_id).await {
			Ok(p) => p,
			Err(e) => {
				warn!(channel = %message.channel_id, error = %e, "fan-out aborted: participant read failed");
				counter!("courier_fanout_failures_total").increment(1);
				return;
			}
		};

		for p in participants {
			let record = courier_domain::model::OutboundRecord::for_target(message, p.user_id);
			match self.log.send(&record).await {
				Ok(()) => {
					counter!("courier_fanout_records_total").increment(1);
				}
				Err(e) => {
					warn!(
						channel = %message.channel_id,
						target = %record.target_user_id,
						error = %e,
						"fan-out record send failed"
					);
					counter!("courier_fanout_failures_total").increment(1);
				}
			}
		}
	}
}
