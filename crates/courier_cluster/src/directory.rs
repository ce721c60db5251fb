#![forbid(unsafe_code)]

//! Shared connection directory: which instance currently owns a user's
//! socket, plus per-channel membership sets for fan-out.
//!
//! Entries follow a write-your-own discipline: an instance only publishes
//! and removes entries carrying its own instance id, so a user's reconnect
//! to another instance is never clobbered by the old owner's teardown.
//! Absence of an entry means the user is offline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use courier_domain::model::DirectoryEntry;
use courier_domain::{ChannelId, InstanceId, UserId};
use parking_lot::Mutex as SyncMutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

fn user_key(user: &UserId) -> String {
	format!("user:{user}")
}

fn room_key(channel: &ChannelId) -> String {
	format!("room:{channel}")
}

/// Directory of live connections and channel membership.
#[async_trait]
pub trait Directory: Send + Sync {
	/// Publish (or refresh) the caller's ownership of a user's connection.
	async fn publish(&self, entry: &DirectoryEntry) -> anyhow::Result<()>;

	/// Resolve where a user is connected; `None` means offline.
	async fn lookup(&self, user: &UserId) -> anyhow::Result<Option<DirectoryEntry>>;

	/// Remove the user's entry, but only if `instance` still owns it.
	async fn remove(&self, user: &UserId, instance: InstanceId) -> anyhow::Result<()>;

	async fn add_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()>;

	async fn remove_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()>;

	async fn room_members(&self, channel: &ChannelId) -> anyhow::Result<Vec<UserId>>;
}

/// Redis-backed directory over a shared multiplexed connection.
pub struct RedisDirectory {
	connection: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisDirectory {
	pub async fn connect(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("parse directory url")?;
		let connection = client
			.get_multiplexed_async_connection()
			.await
			.context("connect to directory")?;
		Ok(Self {
			connection: Arc::new(Mutex::new(connection)),
		})
	}
}

#[async_trait]
impl Directory for RedisDirectory {
	async fn publish(&self, entry: &DirectoryEntry) -> anyhow::Result<()> {
		let mut conn = self.connection.lock().await;
		redis::cmd("HSET")
			.arg(user_key(&entry.user_id))
			.arg("instance")
			.arg(entry.instance.get())
			.arg("host")
			.arg(&entry.host)
			.arg("port")
			.arg(entry.port)
			.arg("updated_at")
			.arg(entry.updated_at)
			.query_async::<_, ()>(&mut *conn)
			.await
			.context("publish directory entry")?;
		debug!(user = %entry.user_id, instance = %entry.instance, "published directory entry");
		Ok(())
	}

	async fn lookup(&self, user: &UserId) -> anyhow::Result<Option<DirectoryEntry>> {
		let mut conn = self.connection.lock().await;
		let fields: HashMap<String, String> = redis::cmd("HGETALL")
			.arg(user_key(user))
			.query_async(&mut *conn)
			.await
			.context("lookup directory entry")?;
		drop(conn);

		if fields.is_empty() {
			return Ok(None);
		}
		parse_entry(user, &fields).map(Some)
	}

	async fn remove(&self, user: &UserId, instance: InstanceId) -> anyhow::Result<()> {
		let mut conn = self.connection.lock().await;
		let owner: Option<String> = redis::cmd("HGET")
			.arg(user_key(user))
			.arg("instance")
			.query_async(&mut *conn)
			.await
			.context("read directory owner")?;

		// Another instance already owns this user; leave its entry alone.
		if owner.as_deref() != Some(instance.to_string().as_str()) {
			return Ok(());
		}

		redis::cmd("DEL")
			.arg(user_key(user))
			.query_async::<_, ()>(&mut *conn)
			.await
			.context("remove directory entry")?;
		Ok(())
	}

	async fn add_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		let mut conn = self.connection.lock().await;
		redis::cmd("SADD")
			.arg(room_key(channel))
			.arg(user.as_str())
			.query_async::<_, ()>(&mut *conn)
			.await
			.context("add room member")?;
		Ok(())
	}

	async fn remove_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		let mut conn = self.connection.lock().await;
		redis::cmd("SREM")
			.arg(room_key(channel))
			.arg(user.as_str())
			.query_async::<_, ()>(&mut *conn)
			.await
			.context("remove room member")?;
		Ok(())
	}

	async fn room_members(&self, channel: &ChannelId) -> anyhow::Result<Vec<UserId>> {
		let mut conn = self.connection.lock().await;
		let members: Vec<String> = redis::cmd("SMEMBERS")
			.arg(room_key(channel))
			.query_async(&mut *conn)
			.await
			.context("read room members")?;
		drop(conn);

		members.into_iter().map(|m| UserId::new(m).map_err(Into::into)).collect()
	}
}

fn parse_entry(user: &UserId, fields: &HashMap<String, String>) -> anyhow::Result<DirectoryEntry> {
	let field = |name: &str| -> anyhow::Result<&String> {
		match fields.get(name) {
			Some(v) => Ok(v),
			None => bail!("directory entry for {user} is missing field {name}"),
		}
	};

	let instance: u16 = field("instance")?.parse().context("parse directory instance")?;
	Ok(DirectoryEntry {
		user_id: user.clone(),
		instance: InstanceId::new(instance)?,
		host: field("host")?.clone(),
		port: field("port")?.parse().context("parse directory port")?,
		updated_at: field("updated_at")?.parse().context("parse directory timestamp")?,
	})
}

/// In-memory directory for tests and single-node runs.
#[derive(Default)]
pub struct MemoryDirectory {
	users: SyncMutex<HashMap<UserId, DirectoryEntry>>,
	rooms: SyncMutex<HashMap<ChannelId, BTreeSet<UserId>>>,
}

impl MemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Directory for MemoryDirectory {
	async fn publish(&self, entry: &DirectoryEntry) -> anyhow::Result<()> {
		self.users.lock().insert(entry.user_id.clone(), entry.clone());
		Ok(())
	}

	async fn lookup(&self, user: &UserId) -> anyhow::Result<Option<DirectoryEntry>> {
		Ok(self.users.lock().get(user).cloned())
	}

	async fn remove(&self, user: &UserId, instance: InstanceId) -> anyhow::Result<()> {
		let mut users = self.users.lock();
		if users.get(user).is_some_and(|e| e.instance == instance) {
			users.remove(user);
		}
		Ok(())
	}

	async fn add_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		self.rooms.lock().entry(*channel).or_default().insert(user.clone());
		Ok(())
	}

	async fn remove_room_member(&self, channel: &ChannelId, user: &UserId) -> anyhow::Result<()> {
		if let Some(members) = self.rooms.lock().get_mut(channel) {
			members.remove(user);
		}
		Ok(())
	}

	async fn room_members(&self, channel: &ChannelId) -> anyhow::Result<Vec<UserId>> {
		Ok(self
			.rooms
			.lock()
			.get(channel)
			.map(|m| m.iter().cloned().collect())
			.unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use courier_domain::unix_ms_now;

	use super::*;

	fn entry(user: &str, instance: u16) -> DirectoryEntry {
		DirectoryEntry {
			user_id: UserId::new(user).unwrap(),
			instance: InstanceId::new(instance).unwrap(),
			host: "10.0.0.1".to_string(),
			port: 8080,
			updated_at: unix_ms_now(),
		}
	}

	#[tokio::test]
	async fn publish_then_lookup() {
		let dir = MemoryDirectory::new();
		let alice = UserId::new("alice").unwrap();

		assert!(dir.lookup(&alice).await.unwrap().is_none());
		dir.publish(&entry("alice", 3)).await.unwrap();
		let found = dir.lookup(&alice).await.unwrap().unwrap();
		assert_eq!(found.instance, InstanceId::new(3).unwrap());
	}

	#[tokio::test]
	async fn remove_only_clears_own_entry() {
		let dir = MemoryDirectory::new();
		let alice = UserId::new("alice").unwrap();
		dir.publish(&entry("alice", 3)).await.unwrap();

		// A stale owner must not evict the new one.
		dir.remove(&alice, InstanceId::new(7).unwrap()).await.unwrap();
		assert!(dir.lookup(&alice).await.unwrap().is_some());

		dir.remove(&alice, InstanceId::new(3).unwrap()).await.unwrap();
		assert!(dir.lookup(&alice).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn room_membership_tracks_joins_and_leaves() {
		let dir = MemoryDirectory::new();
		let channel = uuid::Uuid::new_v4();
		let alice = UserId::new("alice").unwrap();
		let bob = UserId::new("bob").unwrap();

		dir.add_room_member(&channel, &alice).await.unwrap();
		dir.add_room_member(&channel, &bob).await.unwrap();
		assert_eq!(dir.room_members(&channel).await.unwrap().len(), 2);

		dir.remove_room_member(&channel, &alice).await.unwrap();
		assert_eq!(dir.room_members(&channel).await.unwrap(), vec![bob]);
	}
}
