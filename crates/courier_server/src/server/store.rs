#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr as _;

use anyhow::{Context as _, anyhow};
use courier_domain::model::{Channel, ChannelParticipant, StoredMessage, UserChannelEntry};
use courier_domain::{ChannelId, ChannelKind, MessageId, ParticipantRole, UserId};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::StorageSettings;

/// Channel, membership and message persistence.
///
/// `user_channels` is the per-user channel index; `recent_messages` returns
/// newest-first (callers reverse for chronological replay).
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn create_channel(&self, channel: &Channel, participants: &[ChannelParticipant]) -> anyhow::Result<()>;

	async fn channel(&self, id: &ChannelId) -> anyhow::Result<Option<Channel>>;

	async fn participants(&self, id: &ChannelId) -> anyhow::Result<Vec<ChannelParticipant>>;

	async fn add_participant(&self, channel: &Channel, participant: &ChannelParticipant) -> anyhow::Result<()>;

	async fn remove_participant(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()>;

	async fn user_channels(&self, user: &UserId) -> anyhow::Result<Vec<UserChannelEntry>>;

	async fn insert_message(&self, message: &StoredMessage) -> anyhow::Result<()>;

	async fn recent_messages(&self, channel: &ChannelId, limit: u32) -> anyhow::Result<Vec<StoredMessage>>;

	async fn mark_read(&self, user: &UserId, channel: &ChannelId, at: i64) -> anyhow::Result<()>;
}

/// In-memory store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	channels: HashMap<ChannelId, Channel>,
	participants: HashMap<ChannelId, BTreeMap<UserId, ChannelParticipant>>,
	user_channels: HashMap<UserId, BTreeMap<ChannelId, Option<i64>>>,
	messages: HashMap<ChannelId, BTreeMap<u64, StoredMessage>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn create_channel(&self, channel: &Channel, participants: &[ChannelParticipant]) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		inner.channels.insert(channel.channel_id, channel.clone());
		let members = inner.participants.entry(channel.channel_id).or_default();
		for p in participants {
			members.insert(p.user_id.clone(), p.clone());
		}
		for p in participants {
			inner
				.user_channels
				.entry(p.user_id.clone())
				.or_default()
				.insert(channel.channel_id, None);
		}
		Ok(())
	}

	async fn channel(&self, id: &ChannelId) -> anyhow::Result<Option<Channel>> {
		Ok(self.inner.lock().channels.get(id).cloned())
	}

	async fn participants(&self, id: &ChannelId) -> anyhow::Result<Vec<ChannelParticipant>> {
		Ok(self
			.inner
			.lock()
			.participants
			.get(id)
			.map(|m| m.values().cloned().collect())
			.unwrap_or_default())
	}

	async fn add_participant(&self, channel: &Channel, participant: &ChannelParticipant) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		// Insert-if-absent, like the SQL backends' ON CONFLICT DO NOTHING: a
		// re-join must not rewrite the original role or join time.
		inner
			.participants
			.entry(channel.channel_id)
			.or_default()
			.entry(participant.user_id.clone())
			.or_insert_with(|| participant.clone());
		inner
			.user_channels
			.entry(participant.user_id.clone())
			.or_default()
			.entry(channel.channel_id)
			.or_insert(None);
		Ok(())
	}

	async fn remove_participant(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		if let Some(members) = inner.participants.get_mut(channel) {
			members.remove(user);
		}
		if let Some(index) = inner.user_channels.get_mut(user) {
			index.remove(channel);
		}
		Ok(())
	}

	async fn user_channels(&self, user: &UserId) -> anyhow::Result<Vec<UserChannelEntry>> {
		let inner = self.inner.lock();
		let Some(index) = inner.user_channels.get(user) else {
			return Ok(Vec::new());
		};

		let mut entries = Vec::with_capacity(index.len());
		for (channel_id, last_read_at) in index {
			let Some(channel) = inner.channels.get(channel_id) else {
				continue;
			};
			let other_participants: BTreeSet<UserId> = inner
				.participants
				.get(channel_id)
				.map(|m| m.keys().filter(|u| *u != user).cloned().collect())
				.unwrap_or_default();
			entries.push(UserChannelEntry {
				user_id: user.clone(),
				channel_id: *channel_id,
				kind: channel.kind,
				name: channel.name.clone(),
				last_read_at: *last_read_at,
				other_participants,
			});
		}
		Ok(entries)
	}

	async fn insert_message(&self, message: &StoredMessage) -> anyhow::Result<()> {
		self.inner
			.lock()
			.messages
			.entry(message.channel_id)
			.or_default()
			.insert(message.message_id.as_u64(), message.clone());
		Ok(())
	}

	async fn recent_messages(&self, channel: &ChannelId, limit: u32) -> anyhow::Result<Vec<StoredMessage>> {
		Ok(self
			.inner
			.lock()
			.messages
			.get(channel)
			.map(|m| m.values().rev().take(limit as usize).cloned().collect())
			.unwrap_or_default())
	}

	async fn mark_read(&self, user: &UserId, channel: &ChannelId, at: i64) -> anyhow::Result<()> {
		if let Some(index) = self.inner.lock().user_channels.get_mut(user)
			&& let Some(last_read) = index.get_mut(channel)
		{
			*last_read = Some(at);
		}
		Ok(())
	}
}

/// SQL-backed store (sqlite or postgres).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Connect with retries; the database is often the last dependency to
	/// come up in a fresh deployment.
	pub async fn connect_with_retry(database_url: &str, settings: &StorageSettings) -> anyhow::Result<Self> {
		let mut last_err = None;
		for attempt in 1..=settings.connect_attempts {
			match Self::connect(database_url).await {
				Ok(store) => {
					info!(attempt, "storage connected");
					return Ok(store);
				}
				Err(e) => {
					warn!(attempt, attempts = settings.connect_attempts, error = %e, "storage connect failed; retrying");
					last_err = Some(e);
					if attempt < settings.connect_attempts {
						tokio::time::sleep(settings.connect_retry).await;
					}
				}
			}
		}
		Err(last_err.unwrap_or_else(|| anyhow!("storage connect failed")))
	}
}

fn encode_metadata(metadata: &BTreeMap<String, String>) -> anyhow::Result<String> {
	serde_json::to_string(metadata).context("encode metadata")
}

fn decode_metadata(raw: &str) -> BTreeMap<String, String> {
	serde_json::from_str(raw).unwrap_or_default()
}

fn decode_channel_row(
	channel_id: String,
	kind: String,
	name: Option<String>,
	created_at: i64,
	metadata: String,
) -> anyhow::Result<Channel> {
	Ok(Channel {
		channel_id: ChannelId::from_str(&channel_id).context("parse channel id")?,
		kind: kind.parse::<ChannelKind>().map_err(|e| anyhow!(e))?,
		name,
		created_at,
		metadata: decode_metadata(&metadata),
	})
}

#[async_trait::async_trait]
impl Store for SqlStore {
	async fn create_channel(&self, channel: &Channel, participants: &[ChannelParticipant]) -> anyhow::Result<()> {
		let channel_id = channel.channel_id.to_string();
		let metadata = encode_metadata(&channel.metadata)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query(
					"INSERT INTO channels (channel_id, kind, name, created_at, metadata) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(channel_id) DO NOTHING",
				)
				.bind(&channel_id)
				.bind(channel.kind.as_str())
				.bind(&channel.name)
				.bind(channel.created_at)
				.bind(&metadata)
				.execute(&mut *tx)
				.await
				.context("insert channel (sqlite)")?;

				for p in participants {
					sqlx::query(
						"INSERT INTO channel_participants (channel_id, user_id, joined_at, role) VALUES (?, ?, ?, ?) \
						ON CONFLICT(channel_id, user_id) DO NOTHING",
					)
					.bind(&channel_id)
					.bind(p.user_id.as_str())
					.bind(p.joined_at)
					.bind(p.role.as_str())
					.execute(&mut *tx)
					.await
					.context("insert participant (sqlite)")?;

					sqlx::query(
						"INSERT INTO user_channels (user_id, channel_id, kind, name) VALUES (?, ?, ?, ?) \
						ON CONFLICT(user_id, channel_id) DO NOTHING",
					)
					.bind(p.user_id.as_str())
					.bind(&channel_id)
					.bind(channel.kind.as_str())
					.bind(&channel.name)
					.execute(&mut *tx)
					.await
					.context("insert user channel (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query(
					"INSERT INTO channels (channel_id, kind, name, created_at, metadata) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (channel_id) DO NOTHING",
				)
				.bind(&channel_id)
				.bind(channel.kind.as_str())
				.bind(&channel.name)
				.bind(channel.created_at)
				.bind(&metadata)
				.execute(&mut *tx)
				.await
				.context("insert channel (postgres)")?;

				for p in participants {
					sqlx::query(
						"INSERT INTO channel_participants (channel_id, user_id, joined_at, role) VALUES ($1, $2, $3, $4) \
						ON CONFLICT (channel_id, user_id) DO NOTHING",
					)
					.bind(&channel_id)
					.bind(p.user_id.as_str())
					.bind(p.joined_at)
					.bind(p.role.as_str())
					.execute(&mut *tx)
					.await
					.context("insert participant (postgres)")?;

					sqlx::query(
						"INSERT INTO user_channels (user_id, channel_id, kind, name) VALUES ($1, $2, $3, $4) \
						ON CONFLICT (user_id, channel_id) DO NOTHING",
					)
					.bind(p.user_id.as_str())
					.bind(&channel_id)
					.bind(channel.kind.as_str())
					.bind(&channel.name)
					.execute(&mut *tx)
					.await
					.context("insert user channel (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
			}
		}
		Ok(())
	}

	async fn channel(&self, id: &ChannelId) -> anyhow::Result<Option<Channel>> {
		let channel_id = id.to_string();
		let row: Option<(String, String, Option<String>, i64, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT channel_id, kind, name, created_at, metadata FROM channels WHERE channel_id = ?")
					.bind(&channel_id)
					.fetch_optional(pool)
					.await
					.context("select channel (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT channel_id, kind, name, created_at, metadata FROM channels WHERE channel_id = $1")
					.bind(&channel_id)
					.fetch_optional(pool)
					.await
					.context("select channel (postgres)")?
			}
		};

		match row {
			Some((channel_id, kind, name, created_at, metadata)) => {
				Ok(Some(decode_channel_row(channel_id, kind, name, created_at, metadata)?))
			}
			None => Ok(None),
		}
	}

	async fn participants(&self, id: &ChannelId) -> anyhow::Result<Vec<ChannelParticipant>> {
		let channel_id = id.to_string();
		let rows: Vec<(String, i64, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT user_id, joined_at, role FROM channel_participants WHERE channel_id = ? ORDER BY user_id",
			)
			.bind(&channel_id)
			.fetch_all(pool)
			.await
			.context("select participants (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT user_id, joined_at, role FROM channel_participants WHERE channel_id = $1 ORDER BY user_id",
			)
			.bind(&channel_id)
			.fetch_all(pool)
			.await
			.context("select participants (postgres)")?,
		};

		rows.into_iter()
			.map(|(user_id, joined_at, role)| {
				Ok(ChannelParticipant {
					channel_id: *id,
					user_id: UserId::new(user_id)?,
					joined_at,
					role: role.parse::<ParticipantRole>()?,
				})
			})
			.collect()
	}

	async fn add_participant(&self, channel: &Channel, participant: &ChannelParticipant) -> anyhow::Result<()> {
		let channel_id = channel.channel_id.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query(
					"INSERT INTO channel_participants (channel_id, user_id, joined_at, role) VALUES (?, ?, ?, ?) \
					ON CONFLICT(channel_id, user_id) DO NOTHING",
				)
				.bind(&channel_id)
				.bind(participant.user_id.as_str())
				.bind(participant.joined_at)
				.bind(participant.role.as_str())
				.execute(&mut *tx)
				.await
				.context("insert participant (sqlite)")?;

				sqlx::query(
					"INSERT INTO user_channels (user_id, channel_id, kind, name) VALUES (?, ?, ?, ?) \
					ON CONFLICT(user_id, channel_id) DO NOTHING",
				)
				.bind(participant.user_id.as_str())
				.bind(&channel_id)
				.bind(channel.kind.as_str())
				.bind(&channel.name)
				.execute(&mut *tx)
				.await
				.context("insert user channel (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query(
					"INSERT INTO channel_participants (channel_id, user_id, joined_at, role) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (channel_id, user_id) DO NOTHING",
				)
				.bind(&channel_id)
				.bind(participant.user_id.as_str())
				.bind(participant.joined_at)
				.bind(participant.role.as_str())
				.execute(&mut *tx)
				.await
				.context("insert participant (postgres)")?;

				sqlx::query(
					"INSERT INTO user_channels (user_id, channel_id, kind, name) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (user_id, channel_id) DO NOTHING",
				)
				.bind(participant.user_id.as_str())
				.bind(&channel_id)
				.bind(channel.kind.as_str())
				.bind(&channel.name)
				.execute(&mut *tx)
				.await
				.context("insert user channel (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
			}
		}
		Ok(())
	}

	async fn remove_participant(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		let channel_id = channel.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query("DELETE FROM channel_participants WHERE channel_id = ? AND user_id = ?")
					.bind(&channel_id)
					.bind(user.as_str())
					.execute(&mut *tx)
					.await
					.context("delete participant (sqlite)")?;
				sqlx::query("DELETE FROM user_channels WHERE user_id = ? AND channel_id = ?")
					.bind(user.as_str())
					.bind(&channel_id)
					.execute(&mut *tx)
					.await
					.context("delete user channel (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query("DELETE FROM channel_participants WHERE channel_id = $1 AND user_id = $2")
					.bind(&channel_id)
					.bind(user.as_str())
					.execute(&mut *tx)
					.await
					.context("delete participant (postgres)")?;
				sqlx::query("DELETE FROM user_channels WHERE user_id = $1 AND channel_id = $2")
					.bind(user.as_str())
					.bind(&channel_id)
					.execute(&mut *tx)
					.await
					.context("delete user channel (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
			}
		}
		Ok(())
	}

	async fn user_channels(&self, user: &UserId) -> anyhow::Result<Vec<UserChannelEntry>> {
		let rows: Vec<(String, String, Option<String>, Option<i64>, Option<String>)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT uc.channel_id, uc.kind, uc.name, uc.last_read_at, cp.user_id \
				FROM user_channels uc \
				LEFT JOIN channel_participants cp ON cp.channel_id = uc.channel_id AND cp.user_id != ? \
				WHERE uc.user_id = ? ORDER BY uc.channel_id",
			)
			.bind(user.as_str())
			.bind(user.as_str())
			.fetch_all(pool)
			.await
			.context("select user channels (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT uc.channel_id, uc.kind, uc.name, uc.last_read_at, cp.user_id \
				FROM user_channels uc \
				LEFT JOIN channel_participants cp ON cp.channel_id = uc.channel_id AND cp.user_id <> $1 \
				WHERE uc.user_id = $2 ORDER BY uc.channel_id",
			)
			.bind(user.as_str())
			.bind(user.as_str())
			.fetch_all(pool)
			.await
			.context("select user channels (postgres)")?,
		};

		let mut entries: BTreeMap<String, UserChannelEntry> = BTreeMap::new();
		for (channel_id, kind, name, last_read_at, other) in rows {
			let parsed_id = ChannelId::from_str(&channel_id).context("parse channel id")?;
			let kind = kind.parse::<ChannelKind>()?;
			let entry = entries.entry(channel_id).or_insert_with(|| UserChannelEntry {
				user_id: user.clone(),
				channel_id: parsed_id,
				kind,
				name,
				last_read_at,
				other_participants: BTreeSet::new(),
			});
			if let Some(other) = other {
				entry.other_participants.insert(UserId::new(other)?);
			}
		}
		Ok(entries.into_values().collect())
	}

	async fn insert_message(&self, message: &StoredMessage) -> anyhow::Result<()> {
		let channel_id = message.channel_id.to_string();
		let metadata = encode_metadata(&message.metadata)?;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO channel_messages (channel_id, message_id, user_id, content, created_at, metadata) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(&channel_id)
				.bind(message.message_id.as_i64())
				.bind(message.user_id.as_str())
				.bind(&message.content)
				.bind(message.created_at)
				.bind(&metadata)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO channel_messages (channel_id, message_id, user_id, content, created_at, metadata) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(&channel_id)
				.bind(message.message_id.as_i64())
				.bind(message.user_id.as_str())
				.bind(&message.content)
				.bind(message.created_at)
				.bind(&metadata)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}
		Ok(())
	}

	async fn recent_messages(&self, channel: &ChannelId, limit: u32) -> anyhow::Result<Vec<StoredMessage>> {
		let channel_id = channel.to_string();
		let rows: Vec<(i64, String, String, i64, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT message_id, user_id, content, created_at, metadata FROM channel_messages \
				WHERE channel_id = ? ORDER BY message_id DESC LIMIT ?",
			)
			.bind(&channel_id)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT message_id, user_id, content, created_at, metadata FROM channel_messages \
				WHERE channel_id = $1 ORDER BY message_id DESC LIMIT $2",
			)
			.bind(&channel_id)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};

		rows.into_iter()
			.map(|(message_id, user_id, content, created_at, metadata)| {
				Ok(StoredMessage {
					channel_id: *channel,
					message_id: MessageId::from_raw(message_id as u64),
					user_id: UserId::new(user_id)?,
					content,
					created_at,
					metadata: decode_metadata(&metadata),
				})
			})
			.collect()
	}

	async fn mark_read(&self, user: &UserId, channel: &ChannelId, at: i64) -> anyhow::Result<()> {
		let channel_id = channel.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE user_channels SET last_read_at = ? WHERE user_id = ? AND channel_id = ?")
					.bind(at)
					.bind(user.as_str())
					.bind(&channel_id)
					.execute(pool)
					.await
					.context("mark read (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE user_channels SET last_read_at = $1 WHERE user_id = $2 AND channel_id = $3")
					.bind(at)
					.bind(user.as_str())
					.bind(&channel_id)
					.execute(pool)
					.await
					.context("mark read (postgres)")?;
			}
		}
		Ok(())
	}
}
