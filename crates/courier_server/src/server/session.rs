#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use courier_domain::{ChannelId, UserId};
use courier_protocol::ServerFrame;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SESSION_BUFFER: usize = 256;

/// Token identifying one registration; a reconnect mints a new one, so a
/// stale connection's teardown cannot evict its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken(u64);

struct SessionHandle {
	token: SessionToken,
	tx: mpsc::Sender<ServerFrame>,
	/// Channels this session has subscribed to; drives the room-set
	/// cleanup when the socket closes.
	subscribed: BTreeSet<ChannelId>,
}

/// Map of locally connected users to their socket writer queues.
///
/// One session per user: registering again replaces the previous session,
/// whose receiver closes and unwinds the old connection task.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: Mutex<HashMap<UserId, SessionHandle>>,
	next_token: AtomicU64,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a session, returning its token and the writer-side receiver.
	pub fn register(&self, user: &UserId) -> (SessionToken, mpsc::Receiver<ServerFrame>) {
		let (tx, rx) = mpsc::channel(SESSION_BUFFER);
		let token = SessionToken(self.next_token.fetch_add(1, Ordering::Relaxed));

		let previous = self.sessions.lock().insert(
			user.clone(),
			SessionHandle {
				token,
				tx,
				subscribed: BTreeSet::new(),
			},
		);
		if previous.is_some() {
			debug!(user = %user, "session replaced by reconnect");
			counter!("courier_sessions_replaced_total").increment(1);
		}
		(token, rx)
	}

	/// Drop the session, but only if `token` still owns it.
	pub fn deregister(&self, user: &UserId, token: SessionToken) {
		let mut sessions = self.sessions.lock();
		if sessions.get(user).is_some_and(|h| h.token == token) {
			sessions.remove(user);
		}
	}

	/// Queue a frame for a locally connected user.
	///
	/// Returns false when the user has no local session or their queue is
	/// full; a full queue drops the frame rather than blocking the caller.
	pub fn deliver(&self, user: &UserId, frame: ServerFrame) -> bool {
		let tx = match self.sessions.lock().get(user) {
			Some(handle) => handle.tx.clone(),
			None => return false,
		};

		match tx.try_send(frame) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(user = %user, "session queue full; dropping frame");
				counter!("courier_frames_dropped_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	pub fn subscribe(&self, user: &UserId, channel: ChannelId) {
		if let Some(handle) = self.sessions.lock().get_mut(user) {
			handle.subscribed.insert(channel);
		}
	}

	pub fn unsubscribe(&self, user: &UserId, channel: &ChannelId) {
		if let Some(handle) = self.sessions.lock().get_mut(user) {
			handle.subscribed.remove(channel);
		}
	}

	/// Channels the user's current session is subscribed to.
	pub fn subscriptions(&self, user: &UserId) -> Vec<ChannelId> {
		self.sessions
			.lock()
			.get(user)
			.map(|h| h.subscribed.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn is_connected(&self, user: &UserId) -> bool {
		self.sessions.lock().contains_key(user)
	}

	pub fn connected_users(&self) -> Vec<UserId> {
		self.sessions.lock().keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	fn frame() -> ServerFrame {
		ServerFrame::Error {
			error: "test".to_string(),
		}
	}

	#[tokio::test]
	async fn deliver_reaches_registered_session() {
		let registry = SessionRegistry::new();
		let alice = user("alice");
		let (_token, mut rx) = registry.register(&alice);

		assert!(registry.deliver(&alice, frame()));
		assert!(rx.recv().await.is_some());
		assert!(!registry.deliver(&user("bob"), frame()));
	}

	#[tokio::test]
	async fn reconnect_replaces_previous_session() {
		let registry = SessionRegistry::new();
		let alice = user("alice");
		let (old_token, old_rx) = registry.register(&alice);
		let (_new_token, mut new_rx) = registry.register(&alice);
		assert_eq!(registry.len(), 1);

		assert!(registry.deliver(&alice, frame()));
		assert!(new_rx.recv().await.is_some());

		// Old connection's teardown must not evict the new session.
		drop(old_rx);
		registry.deregister(&alice, old_token);
		assert!(registry.is_connected(&alice));
	}

	#[tokio::test]
	async fn deregister_with_current_token_removes() {
		let registry = SessionRegistry::new();
		let alice = user("alice");
		let (token, _rx) = registry.register(&alice);
		registry.deregister(&alice, token);
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn subscriptions_track_the_current_session_only() {
		let registry = SessionRegistry::new();
		let alice = user("alice");
		let channel = uuid::Uuid::new_v4();

		// No session, nothing to record.
		registry.subscribe(&alice, channel);
		assert!(registry.subscriptions(&alice).is_empty());

		let (_token, _rx) = registry.register(&alice);
		registry.subscribe(&alice, channel);
		assert_eq!(registry.subscriptions(&alice), vec![channel]);

		registry.unsubscribe(&alice, &channel);
		assert!(registry.subscriptions(&alice).is_empty());

		// A reconnect starts from an empty subscription set.
		registry.subscribe(&alice, channel);
		let (_new_token, _new_rx) = registry.register(&alice);
		assert!(registry.subscriptions(&alice).is_empty());
	}

	#[tokio::test]
	async fn full_queue_drops_frame() {
		let registry = SessionRegistry::new();
		let alice = user("alice");
		let (_token, _rx) = registry.register(&alice);

		for _ in 0..SESSION_BUFFER {
			assert!(registry.deliver(&alice, frame()));
		}
		assert!(!registry.deliver(&alice, frame()));
	}
}
