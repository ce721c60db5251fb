#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_cluster::directory::{Directory, MemoryDirectory};
use courier_cluster::log::MemoryLogProducer;
use courier_domain::snowflake::IdGenerator;
use courier_domain::{ChannelKind, InstanceId, ParticipantRole, UserId, derive_direct_channel_id};

use super::channels::{ChannelService, OpError};
use super::store::MemoryStore;

struct Fixture {
	service: ChannelService,
	log: Arc<MemoryLogProducer>,
	directory: Arc<MemoryDirectory>,
}

fn fixture() -> Fixture {
	let store = Arc::new(MemoryStore::new());
	let log = MemoryLogProducer::new();
	let directory = Arc::new(MemoryDirectory::new());
	let ids = Arc::new(IdGenerator::new(InstanceId::new(1).unwrap()));
	let service = ChannelService::new(store, log.clone(), directory.clone(), ids, 50);
	Fixture { service, log, directory }
}

fn user(id: &str) -> UserId {
	UserId::new(id).unwrap()
}

#[tokio::test]
async fn unnamed_pair_becomes_direct_channel() {
	let f = fixture();
	let alice = user("alice");

	let (channel, participants) = f.service.create_channel(&alice, None, &["bob".to_string()]).await.unwrap();
	assert_eq!(channel.kind, ChannelKind::Direct);
	assert_eq!(channel.channel_id, derive_direct_channel_id(&alice, &user("bob")));
	assert_eq!(participants.len(), 2);
}

#[tokio::test]
async fn direct_channel_recreate_returns_existing() {
	let f = fixture();
	let alice = user("alice");
	let bob = user("bob");

	let (first, _) = f.service.create_channel(&alice, None, &["bob".to_string()]).await.unwrap();
	// Same pair from the other side resolves to the same channel.
	let (second, participants) = f.service.create_channel(&bob, None, &["alice".to_string()]).await.unwrap();
	assert_eq!(second.channel_id, first.channel_id);
	assert_eq!(second.created_at, first.created_at);
	// Bob stays a plain member: the original creator keeps admin.
	let bob_role = participants.iter().find(|p| p.user_id == bob).unwrap().role;
	assert_eq!(bob_role, ParticipantRole::Member);
}

#[tokio::test]
async fn create_subscribes_only_the_creator_to_the_room_set() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();

	// Bob enters the set when his own session subscribes.
	let members = f.directory.room_members(&channel.channel_id).await.unwrap();
	assert_eq!(members, vec![alice]);
}

#[tokio::test]
async fn rejoining_participant_keeps_role_and_join_time() {
	let f = fixture();
	let alice = user("alice");
	let (channel, participants) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();
	let original = participants.iter().find(|p| p.user_id == alice).unwrap().clone();
	assert_eq!(original.role, ParticipantRole::Admin);

	// The creator's auto-join goes through the plain join path; it must
	// not demote them.
	let (_, participants, _) = f.service.join_channel(&alice, &channel.channel_id).await.unwrap();
	let rejoined = participants.iter().find(|p| p.user_id == alice).unwrap();
	assert_eq!(rejoined.role, ParticipantRole::Admin);
	assert_eq!(rejoined.joined_at, original.joined_at);
}

#[tokio::test]
async fn named_pair_is_a_group() {
	let f = fixture();
	let (channel, _) = f
		.service
		.create_channel(&user("alice"), Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();
	assert_eq!(channel.kind, ChannelKind::Group);
	assert_eq!(channel.name.as_deref(), Some("ops"));
}

#[tokio::test]
async fn creator_is_admin_and_duplicates_collapse() {
	let f = fixture();
	let alice = user("alice");
	let (_, participants) = f
		.service
		.create_channel(
			&alice,
			Some("ops".to_string()),
			&["bob".to_string(), "bob".to_string(), "alice".to_string()],
		)
		.await
		.unwrap();

	assert_eq!(participants.len(), 2);
	let alice_role = participants.iter().find(|p| p.user_id == alice).unwrap().role;
	assert_eq!(alice_role, ParticipantRole::Admin);
}

#[tokio::test]
async fn post_fans_out_to_all_participants_including_sender() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string(), "carol".to_string()])
		.await
		.unwrap();

	let message = f
		.service
		.post_message(&alice, &channel.channel_id, "hello".to_string(), BTreeMap::new())
		.await
		.unwrap();

	let sent = f.log.sent();
	assert_eq!(sent.len(), 3);
	let targets: Vec<&str> = sent.iter().map(|r| r.target_user_id.as_str()).collect();
	assert!(targets.contains(&"alice"));
	assert!(targets.contains(&"bob"));
	assert!(targets.contains(&"carol"));
	assert!(sent.iter().all(|r| r.message_id == message.message_id));
}

#[tokio::test]
async fn fanout_reads_membership_fresh_per_message() {
	let f = fixture();
	let alice = user("alice");
	let dave = user("dave");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();

	f.service.post_message(&alice, &channel.channel_id, "one".to_string(), BTreeMap::new()).await.unwrap();
	f.service.join_channel(&dave, &channel.channel_id).await.unwrap();
	f.service.post_message(&alice, &channel.channel_id, "two".to_string(), BTreeMap::new()).await.unwrap();

	let to_dave: Vec<_> = f.log.sent().into_iter().filter(|r| r.target_user_id == dave).collect();
	assert_eq!(to_dave.len(), 1);
	assert_eq!(to_dave[0].content, "two");
}

#[tokio::test]
async fn post_rejects_non_participant_and_empty_content() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();

	let err = f
		.service
		.post_message(&user("mallory"), &channel.channel_id, "hi".to_string(), BTreeMap::new())
		.await
		.unwrap_err();
	assert!(matches!(err, OpError::Validation(_)));

	let err = f
		.service
		.post_message(&alice, &channel.channel_id, "   ".to_string(), BTreeMap::new())
		.await
		.unwrap_err();
	assert!(matches!(err, OpError::Validation(_)));

	let err = f
		.service
		.post_message(&alice, &uuid::Uuid::new_v4(), "hi".to_string(), BTreeMap::new())
		.await
		.unwrap_err();
	assert!(matches!(err, OpError::NotFound));
}

#[tokio::test]
async fn message_survives_log_outage() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();

	f.log.set_failing(true);
	// Post succeeds: persistence is the contract, fan-out is best-effort.
	f.service
		.post_message(&alice, &channel.channel_id, "hello".to_string(), BTreeMap::new())
		.await
		.unwrap();

	f.log.set_failing(false);
	let (_, _, messages) = f.service.join_channel(&user("carol"), &channel.channel_id).await.unwrap();
	assert!(messages.iter().any(|m| m.content == "hello"));
}

#[tokio::test]
async fn join_is_silent_and_replays_history_in_order() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();
	f.service.post_message(&alice, &channel.channel_id, "first".to_string(), BTreeMap::new()).await.unwrap();
	f.service.post_message(&alice, &channel.channel_id, "second".to_string(), BTreeMap::new()).await.unwrap();
	let records_before_join = f.log.sent().len();

	let (_, participants, messages) = f.service.join_channel(&user("carol"), &channel.channel_id).await.unwrap();

	assert_eq!(participants.len(), 3);
	assert_eq!(messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["first", "second"]);
	// No join announcement on the log.
	assert_eq!(f.log.sent().len(), records_before_join);
}

#[tokio::test]
async fn join_missing_channel_is_not_found() {
	let f = fixture();
	let err = f.service.join_channel(&user("alice"), &uuid::Uuid::new_v4()).await.unwrap_err();
	assert!(matches!(err, OpError::NotFound));
}

#[tokio::test]
async fn leave_announces_to_remaining_participants_only() {
	let f = fixture();
	let alice = user("alice");
	let bob = user("bob");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string(), "carol".to_string()])
		.await
		.unwrap();
	f.service.join_channel(&bob, &channel.channel_id).await.unwrap();

	f.service.leave_channel(&bob, &channel.channel_id).await.unwrap();

	let sent = f.log.sent();
	assert_eq!(sent.len(), 2);
	assert!(sent.iter().all(|r| r.target_user_id != bob));
	assert!(sent.iter().all(|r| r.metadata.get("event").map(String::as_str) == Some("user_left")));
	assert!(sent[0].content.contains("bob"));

	let members = f.directory.room_members(&channel.channel_id).await.unwrap();
	assert!(!members.contains(&bob));
}

#[tokio::test]
async fn leave_succeeds_even_when_announcement_fails() {
	let f = fixture();
	let alice = user("alice");
	let bob = user("bob");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();

	f.log.set_failing(true);
	f.service.leave_channel(&bob, &channel.channel_id).await.unwrap();

	let entries = f.service.channel_list(&bob).await.unwrap();
	assert!(entries.is_empty());
}

#[tokio::test]
async fn mark_read_updates_index_without_fanout() {
	let f = fixture();
	let alice = user("alice");
	let (channel, _) = f
		.service
		.create_channel(&alice, Some("ops".to_string()), &["bob".to_string()])
		.await
		.unwrap();
	let records_before = f.log.sent().len();

	f.service.mark_read(&alice, &channel.channel_id).await.unwrap();

	assert_eq!(f.log.sent().len(), records_before);
	let entries = f.service.channel_list(&alice).await.unwrap();
	assert_eq!(entries.len(), 1);
	assert!(entries[0].last_read_at.is_some());
}

#[tokio::test]
async fn channel_list_includes_other_participants() {
	let f = fixture();
	let alice = user("alice");
	f.service.create_channel(&alice, None, &["bob".to_string()]).await.unwrap();

	let entries = f.service.channel_list(&alice).await.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].kind, ChannelKind::Direct);
	assert!(entries[0].other_participants.contains(&user("bob")));
	assert!(!entries[0].other_participants.contains(&alice));
}
