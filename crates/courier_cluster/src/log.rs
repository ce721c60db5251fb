#![forbid(unsafe_code)]

//! Partitioned outbound message log.
//!
//! Producers key every record by its target user so one user's messages
//! land on one partition in order. The consumer side reads batches with
//! auto-commit disabled; offsets are committed only after a whole batch
//! has been handed off, so a crash replays the batch instead of dropping
//! it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use async_trait::async_trait;
use courier_domain::model::OutboundRecord;
use parking_lot::Mutex;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Producer half of the outbound log.
#[async_trait]
pub trait LogProducer: Send + Sync {
	async fn send(&self, record: &OutboundRecord) -> anyhow::Result<()>;

	/// Drain in-flight sends; called during graceful shutdown.
	async fn flush(&self) -> anyhow::Result<()>;
}

/// Kafka-backed producer, one record per (message, participant) pair.
pub struct KafkaLogProducer {
	producer: FutureProducer,
	topic: String,
}

impl KafkaLogProducer {
	pub fn connect(brokers: &str, topic: impl Into<String>) -> anyhow::Result<Self> {
		let producer = ClientConfig::new()
			.set("bootstrap.servers", brokers)
			.set("message.timeout.ms", "5000")
			.create()
			.context("create log producer")?;
		Ok(Self {
			producer,
			topic: topic.into(),
		})
	}
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
	async fn send(&self, record: &OutboundRecord) -> anyhow::Result<()> {
		let payload = serde_json::to_string(record).context("encode log record")?;
		self.producer
			.send(
				FutureRecord::to(&self.topic)
					.key(record.target_user_id.as_str())
					.payload(&payload),
				Timeout::After(SEND_TIMEOUT),
			)
			.await
			.map_err(|(e, _)| anyhow!("log send failed: {e}"))?;
		debug!(target = %record.target_user_id, message_id = %record.message_id, "log record sent");
		Ok(())
	}

	async fn flush(&self) -> anyhow::Result<()> {
		let producer = self.producer.clone();
		tokio::task::spawn_blocking(move || producer.flush(Timeout::After(SEND_TIMEOUT)))
			.await
			.context("join log flush task")?
			.context("flush log producer")
	}
}

/// In-memory producer for tests; records every send, optionally failing.
#[derive(Default)]
pub struct MemoryLogProducer {
	records: Mutex<Vec<OutboundRecord>>,
	failing: AtomicBool,
}

impl MemoryLogProducer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn sent(&self) -> Vec<OutboundRecord> {
		self.records.lock().clone()
	}
}

#[async_trait]
impl LogProducer for MemoryLogProducer {
	async fn send(&self, record: &OutboundRecord) -> anyhow::Result<()> {
		if self.failing.load(Ordering::SeqCst) {
			bail!("log unavailable");
		}
		self.records.lock().push(record.clone());
		Ok(())
	}

	async fn flush(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Consumer half of the outbound log, with manual offset commits.
pub struct KafkaLogConsumer {
	consumer: StreamConsumer,
}

impl KafkaLogConsumer {
	pub fn connect(brokers: &str, group: &str, topic: &str) -> anyhow::Result<Self> {
		let consumer: StreamConsumer = ClientConfig::new()
			.set("bootstrap.servers", brokers)
			.set("group.id", group)
			.set("enable.auto.commit", "false")
			.set("auto.offset.reset", "earliest")
			.create()
			.context("create log consumer")?;
		consumer.subscribe(&[topic]).context("subscribe to log topic")?;
		Ok(Self { consumer })
	}

	/// Read up to `max` payloads, waiting at most `max_wait` for each.
	///
	/// Returns early on the first quiet period, so a trickle of records is
	/// delivered promptly instead of stalling until the batch fills.
	pub async fn next_batch(&self, max: usize, max_wait: Duration) -> anyhow::Result<Vec<String>> {
		let mut batch = Vec::new();
		while batch.len() < max {
			let message = match tokio::time::timeout(max_wait, self.consumer.recv()).await {
				Ok(result) => result.context("receive log record")?,
				Err(_) => break,
			};
			match message.payload() {
				Some(payload) => batch.push(String::from_utf8_lossy(payload).into_owned()),
				None => warn!(offset = message.offset(), "log record with empty payload"),
			}
		}
		Ok(batch)
	}

	/// Commit consumed offsets; call only after the batch is fully handled.
	pub fn commit(&self) -> anyhow::Result<()> {
		self.consumer
			.commit_consumer_state(CommitMode::Async)
			.context("commit log offsets")
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use courier_domain::{InstanceId, MessageId, UserId, unix_ms_now};

	use super::*;

	fn record(target: &str) -> OutboundRecord {
		OutboundRecord {
			channel_id: uuid::Uuid::new_v4(),
			message_id: MessageId::from_parts(1_700_000_000_000, InstanceId::new(1).unwrap(), 0),
			sender_id: UserId::new("alice").unwrap(),
			target_user_id: UserId::new(target).unwrap(),
			content: "hi".to_string(),
			created_at: unix_ms_now(),
			metadata: BTreeMap::new(),
		}
	}

	#[tokio::test]
	async fn memory_producer_records_sends() {
		let producer = MemoryLogProducer::new();
		producer.send(&record("bob")).await.unwrap();
		producer.send(&record("carol")).await.unwrap();

		let sent = producer.sent();
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1].target_user_id.as_str(), "carol");
	}

	#[tokio::test]
	async fn memory_producer_failure_is_reported() {
		let producer = MemoryLogProducer::new();
		producer.set_failing(true);
		assert!(producer.send(&record("bob")).await.is_err());
		assert!(producer.sent().is_empty());
	}
}
