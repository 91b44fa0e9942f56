use std::sync::atomic::Ordering;

use topicbridge_platform::{ChatTarget, MediaKind};

use crate::server::moderation::ModerationGate;
use crate::server::relay::{RelayEngine, RelayError, RelayOutcome};
use crate::server::store::MappingStore;
use crate::server::testkit::{Call, GROUP_ID, Harness, identity, private_text, topic};

#[tokio::test]
async fn first_message_creates_mapping_and_forwards_into_it() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());

	let outcome = engine.relay_user_message(&private_text(42, 7, "hello")).await.unwrap();
	let RelayOutcome::Forwarded { topic: t, created, repaired } = outcome else {
		panic!("expected forward, got {outcome:?}");
	};
	assert!(created);
	assert!(!repaired);
	assert_eq!(h.store.topic_for(&identity(42)).await.unwrap(), Some(t));
	assert_eq!(h.store.list_mappings().await.unwrap().len(), 1);

	let calls = h.gateway.calls();
	assert_eq!(
		calls.first(),
		Some(&Call::CreateTopic {
			name: "User 42 (42)".to_string()
		})
	);
	assert_eq!(
		calls.last(),
		Some(&Call::Forward {
			to: ChatTarget::Id(GROUP_ID),
			from: ChatTarget::Id(42),
			message_id: 7,
			thread: Some(t),
		})
	);
}

#[tokio::test]
async fn intro_card_is_text_with_keyboard_without_profile_photo() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap();

	let card = h
		.gateway
		.calls()
		.into_iter()
		.find_map(|c| match c {
			Call::SendText { text, thread, keyboard, .. } => Some((text, thread, keyboard)),
			_ => None,
		})
		.expect("card sent");
	assert!(card.0.contains("<code>42</code>"));
	assert_eq!(card.1, Some(topic(100)));
	let keyboard = serde_json::to_string(&card.2.expect("keyboard")).unwrap();
	assert!(keyboard.contains("block_42"));
	assert!(keyboard.contains("unblock_42"));
}

#[tokio::test]
async fn intro_card_uses_profile_photo_when_available() {
	let h = Harness::new();
	h.gateway.set_profile_photo("avatar-1");
	let engine = RelayEngine::new(h.ctx.clone());
	engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap();

	assert!(h.gateway.calls().iter().any(|c| matches!(
		c,
		Call::SendMedia { kind: MediaKind::Photo, file_id, caption: Some(_), .. } if file_id == "avatar-1"
	)));
}

#[tokio::test]
async fn user_lifecycle_scenario() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	let gate = ModerationGate::new(h.ctx.store.clone());
	let u1 = identity(42);

	let first = engine.relay_user_message(&private_text(42, 1, "one")).await.unwrap();
	let RelayOutcome::Forwarded { topic: t1, created: true, .. } = first else {
		panic!("expected creation, got {first:?}");
	};

	let second = engine.relay_user_message(&private_text(42, 2, "two")).await.unwrap();
	assert_eq!(
		second,
		RelayOutcome::Forwarded {
			topic: t1,
			created: false,
			repaired: false
		}
	);
	assert_eq!(h.gateway.created_topics(), 1);

	gate.block(&u1).await.unwrap();
	let forwards_before = h.gateway.forwards().len();
	let third = engine.relay_user_message(&private_text(42, 3, "three")).await.unwrap();
	assert_eq!(third, RelayOutcome::Blocked { notified: true });
	assert_eq!(h.gateway.forwards().len(), forwards_before, "no forward for blocked identity");
	assert_eq!(
		h.gateway.texts_to(&ChatTarget::Id(42)),
		vec![crate::server::templates::blocked_notice().to_string()]
	);

	gate.unblock(&u1).await.unwrap();
	let fourth = engine.relay_user_message(&private_text(42, 4, "four")).await.unwrap();
	assert_eq!(
		fourth,
		RelayOutcome::Forwarded {
			topic: t1,
			created: false,
			repaired: false
		}
	);
	assert_eq!(h.store.topic_for(&u1).await.unwrap(), Some(t1));
}

#[tokio::test]
async fn blocked_identity_is_dropped_silently_when_notifications_are_off() {
	let h = Harness::with_config(|cfg| cfg.notify_blocked = false);
	let engine = RelayEngine::new(h.ctx.clone());
	h.store.set_block_flag(&identity(42)).await.unwrap();

	let outcome = engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap();
	assert_eq!(outcome, RelayOutcome::Blocked { notified: false });
	assert!(h.gateway.calls().is_empty());
	assert_eq!(h.store.topic_for(&identity(42)).await.unwrap(), None);
}

#[tokio::test]
async fn stale_topic_is_repaired_exactly_once() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	let u2 = identity(43);
	let t2 = topic(20);
	h.store.put_topic(&u2, t2).await.unwrap();
	h.gateway.kill_topic(t2);

	let outcome = engine.relay_user_message(&private_text(43, 5, "still there?")).await.unwrap();
	let RelayOutcome::Forwarded { topic: t3, created, repaired } = outcome else {
		panic!("expected forward, got {outcome:?}");
	};
	assert!(created);
	assert!(repaired);
	assert_ne!(t3, t2);
	assert_eq!(h.store.topic_for(&u2).await.unwrap(), Some(t3));
	assert_eq!(h.gateway.created_topics(), 1);

	let threads: Vec<_> = h
		.gateway
		.forwards()
		.into_iter()
		.filter_map(|c| match c {
			Call::Forward { thread, .. } => thread,
			_ => None,
		})
		.collect();
	assert_eq!(threads, vec![t2, t3]);
}

#[tokio::test]
async fn transient_forward_failure_keeps_mapping_and_is_reported() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	let t = topic(20);
	h.store.put_topic(&identity(42), t).await.unwrap();
	h.gateway.transient_failures.store(true, Ordering::SeqCst);

	let err = engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap_err();
	assert!(matches!(err, RelayError::Forward { topic, .. } if topic == t));
	assert_eq!(h.store.topic_for(&identity(42)).await.unwrap(), Some(t));
	assert_eq!(h.gateway.created_topics(), 0);
}

#[tokio::test]
async fn creation_failure_writes_no_mapping() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	h.gateway.fail_create.store(true, Ordering::SeqCst);

	let err = engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap_err();
	assert!(matches!(err, RelayError::CreateTopic(_)));
	assert!(h.store.list_mappings().await.unwrap().is_empty());
	assert!(h.gateway.forwards().is_empty());
}

#[tokio::test]
async fn failure_after_creation_does_not_loop() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	// The first created topic id is 100; make it unusable right away.
	h.gateway.kill_topic(topic(100));

	let err = engine.relay_user_message(&private_text(42, 1, "hi")).await.unwrap_err();
	assert!(matches!(err, RelayError::ForwardAfterCreate { topic: t, .. } if t == topic(100)));
	assert_eq!(h.gateway.created_topics(), 1);
	assert_eq!(h.gateway.forwards().len(), 1);
	// The mapping was persisted before the forward and stands.
	assert_eq!(h.store.topic_for(&identity(42)).await.unwrap(), Some(topic(100)));
}

#[tokio::test]
async fn message_without_sender_is_rejected() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	let mut msg = private_text(42, 1, "hi");
	msg.from = None;
	assert!(matches!(
		engine.relay_user_message(&msg).await,
		Err(RelayError::NoSender)
	));
}

/// Two first messages racing for one identity both create a topic; the later
/// store write wins and the other topic is orphaned.
#[tokio::test]
async fn concurrent_first_contact_orphans_a_topic() {
	let h = Harness::new();
	let engine = RelayEngine::new(h.ctx.clone());
	h.gateway.gate_creates(2);

	let m1 = private_text(42, 1, "a");
	let m2 = private_text(42, 2, "b");
	let (r1, r2) = tokio::join!(engine.relay_user_message(&m1), engine.relay_user_message(&m2));
	let (r1, r2) = (r1.unwrap(), r2.unwrap());

	assert_eq!(h.gateway.created_topics(), 2);
	let mappings = h.store.list_mappings().await.unwrap();
	assert_eq!(mappings.len(), 1, "at most one live mapping per identity");

	let topics = [r1, r2].map(|o| match o {
		RelayOutcome::Forwarded { topic, .. } => topic,
		other => panic!("unexpected {other:?}"),
	});
	assert_ne!(topics[0], topics[1]);
	assert!(topics.contains(&mappings[0].topic_id));
}
