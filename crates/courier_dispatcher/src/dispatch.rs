#![forbid(unsafe_code)]

//! One delivery round: parse a consumed batch, resolve each target's
//! owning instance through the directory, group by instance, push.
//!
//! Per-user ordering holds because the log partitions by target user and
//! grouping preserves batch order; an offline target is a miss, not an
//! error, and nothing is retried (at-most-once past the consumer).

use std::collections::HashMap;

use anyhow::Context as _;
use async_trait::async_trait;
use courier_cluster::directory::Directory;
use courier_domain::UserId;
use courier_domain::model::OutboundRecord;
use courier_protocol::PushBody;
use metrics::counter;
use tracing::{debug, warn};

/// Delivery client for one chat instance's push endpoint.
#[async_trait]
pub trait PushClient: Send + Sync {
	async fn push(&self, host: &str, port: u16, records: Vec<OutboundRecord>) -> anyhow::Result<()>;
}

pub struct HttpPushClient {
	client: reqwest::Client,
}

impl HttpPushClient {
	pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder().timeout(timeout).build().context("build push client")?;
		Ok(Self { client })
	}
}

#[async_trait]
impl PushClient for HttpPushClient {
	async fn push(&self, host: &str, port: u16, records: Vec<OutboundRecord>) -> anyhow::Result<()> {
		let url = format!("http://{host}:{port}/dispatch-message");
		self.client
			.post(&url)
			.json(&PushBody::Batch { messages: records })
			.send()
			.await
			.with_context(|| format!("push to {url}"))?
			.error_for_status()
			.with_context(|| format!("push to {url}"))?;
		Ok(())
	}
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
	pub delivered: usize,
	/// Targets with no directory entry (offline users).
	pub misses: usize,
	/// Directory lookups or pushes that errored.
	pub failures: usize,
	pub malformed: usize,
}

enum Route {
	Offline,
	Failed,
	At { host: String, port: u16 },
}

/// Deliver one consumed batch. Never fails: every record lands in exactly
/// one stats bucket, and the caller commits offsets afterwards either way.
pub async fn dispatch_batch(payloads: &[String], directory: &dyn Directory, push: &dyn PushClient) -> BatchStats {
	let mut stats = BatchStats::default();

	let mut records = Vec::with_capacity(payloads.len());
	for payload in payloads {
		match serde_json::from_str::<OutboundRecord>(payload) {
			Ok(record) => records.push(record),
			Err(e) => {
				warn!(error = %e, "malformed outbound record skipped");
				stats.malformed += 1;
			}
		}
	}

	// One lookup per distinct target, resolved concurrently.
	let mut targets: Vec<UserId> = Vec::new();
	for record in &records {
		if !targets.contains(&record.target_user_id) {
			targets.push(record.target_user_id.clone());
		}
	}
	let lookups = futures::future::join_all(targets.iter().map(|user| directory.lookup(user))).await;

	let mut routes: HashMap<UserId, Route> = HashMap::new();
	for (user, lookup) in targets.into_iter().zip(lookups) {
		let route = match lookup {
			Ok(Some(entry)) => Route::At {
				host: entry.host,
				port: entry.port,
			},
			Ok(None) => {
				debug!(user = %user, "target offline; dropping");
				Route::Offline
			}
			Err(e) => {
				warn!(user = %user, error = %e, "directory lookup failed");
				Route::Failed
			}
		};
		routes.insert(user, route);
	}

	// Group by instance, keeping batch order within each group.
	let mut groups: Vec<((String, u16), Vec<OutboundRecord>)> = Vec::new();
	for record in records {
		match routes.get(&record.target_user_id) {
			Some(Route::At { host, port }) => {
				let key = (host.clone(), *port);
				match groups.iter_mut().find(|(k, _)| *k == key) {
					Some((_, group)) => group.push(record),
					None => groups.push((key, vec![record])),
				}
			}
			Some(Route::Offline) => stats.misses += 1,
			Some(Route::Failed) | None => stats.failures += 1,
		}
	}

	for ((host, port), group) in groups {
		let count = group.len();
		match push.push(&host, port, group).await {
			Ok(()) => stats.delivered += count,
			Err(e) => {
				warn!(host = %host, port, count, error = %e, "push failed");
				stats.failures += count;
			}
		}
	}

	counter!("courier_dispatch_delivered_total").increment(stats.delivered as u64);
	counter!("courier_dispatch_misses_total").increment(stats.misses as u64);
	counter!("courier_dispatch_failures_total").increment(stats.failures as u64);
	counter!("courier_dispatch_malformed_total").increment(stats.malformed as u64);
	stats
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::sync::Arc;

	use courier_cluster::directory::MemoryDirectory;
	use courier_domain::model::DirectoryEntry;
	use courier_domain::{InstanceId, MessageId, unix_ms_now};
	use parking_lot::Mutex;

	use super::*;

	#[derive(Default)]
	struct RecordingPushClient {
		pushes: Mutex<Vec<(String, u16, Vec<OutboundRecord>)>>,
		fail_host: Mutex<Option<String>>,
	}

	#[async_trait]
	impl PushClient for RecordingPushClient {
		async fn push(&self, host: &str, port: u16, records: Vec<OutboundRecord>) -> anyhow::Result<()> {
			if self.fail_host.lock().as_deref() == Some(host) {
				anyhow::bail!("connection refused");
			}
			self.pushes.lock().push((host.to_string(), port, records));
			Ok(())
		}
	}

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	fn entry(target: &str, host: &str, instance: u16) -> DirectoryEntry {
		DirectoryEntry {
			user_id: user(target),
			instance: InstanceId::new(instance).unwrap(),
			host: host.to_string(),
			port: 8080,
			updated_at: unix_ms_now(),
		}
	}

	fn payload(target: &str, content: &str) -> String {
		let record = OutboundRecord {
			channel_id: uuid::Uuid::new_v4(),
			message_id: MessageId::from_parts(1_700_000_000_000, InstanceId::new(1).unwrap(), 0),
			sender_id: user("alice"),
			target_user_id: user(target),
			content: content.to_string(),
			created_at: unix_ms_now(),
			metadata: BTreeMap::new(),
		};
		serde_json::to_string(&record).unwrap()
	}

	#[tokio::test]
	async fn groups_records_per_owning_instance() {
		let directory = Arc::new(MemoryDirectory::new());
		directory.publish(&entry("bob", "10.0.0.1", 1)).await.unwrap();
		directory.publish(&entry("carol", "10.0.0.2", 2)).await.unwrap();
		let push = RecordingPushClient::default();

		let payloads = vec![payload("bob", "one"), payload("carol", "two"), payload("bob", "three")];
		let stats = dispatch_batch(&payloads, directory.as_ref(), &push).await;

		assert_eq!(stats.delivered, 3);
		assert_eq!(stats.misses, 0);

		let pushes = push.pushes.lock();
		assert_eq!(pushes.len(), 2);
		let to_one = pushes.iter().find(|(h, _, _)| h == "10.0.0.1").unwrap();
		let contents: Vec<&str> = to_one.2.iter().map(|r| r.content.as_str()).collect();
		// Batch order survives grouping.
		assert_eq!(contents, vec!["one", "three"]);
	}

	#[tokio::test]
	async fn offline_target_is_a_miss_not_an_error() {
		let directory = Arc::new(MemoryDirectory::new());
		directory.publish(&entry("bob", "10.0.0.1", 1)).await.unwrap();
		let push = RecordingPushClient::default();

		let payloads = vec![payload("bob", "hi"), payload("ghost", "boo")];
		let stats = dispatch_batch(&payloads, directory.as_ref(), &push).await;

		assert_eq!(stats.delivered, 1);
		assert_eq!(stats.misses, 1);
		assert_eq!(stats.failures, 0);
	}

	#[tokio::test]
	async fn malformed_payloads_are_counted_and_skipped() {
		let directory = Arc::new(MemoryDirectory::new());
		directory.publish(&entry("bob", "10.0.0.1", 1)).await.unwrap();
		let push = RecordingPushClient::default();

		let payloads = vec!["not json".to_string(), payload("bob", "hi")];
		let stats = dispatch_batch(&payloads, directory.as_ref(), &push).await;

		assert_eq!(stats.malformed, 1);
		assert_eq!(stats.delivered, 1);
	}

	#[tokio::test]
	async fn one_instance_failing_does_not_block_others() {
		let directory = Arc::new(MemoryDirectory::new());
		directory.publish(&entry("bob", "10.0.0.1", 1)).await.unwrap();
		directory.publish(&entry("carol", "10.0.0.2", 2)).await.unwrap();
		let push = RecordingPushClient::default();
		*push.fail_host.lock() = Some("10.0.0.1".to_string());

		let payloads = vec![payload("bob", "one"), payload("carol", "two")];
		let stats = dispatch_batch(&payloads, directory.as_ref(), &push).await;

		assert_eq!(stats.failures, 1);
		assert_eq!(stats.delivered, 1);
		assert_eq!(push.pushes.lock().len(), 1);
	}

	#[tokio::test]
	async fn empty_batch_is_a_no_op() {
		let directory = Arc::new(MemoryDirectory::new());
		let push = RecordingPushClient::default();
		let stats = dispatch_batch(&[], directory.as_ref(), &push).await;
		assert_eq!(stats, BatchStats::default());
	}
}
