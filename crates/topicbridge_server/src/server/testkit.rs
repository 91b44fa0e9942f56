#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;
use topicbridge_domain::{Identity, Mapping, TopicId};
use topicbridge_platform::{
	BotCommand, ChatTarget, CommandScope, ForumTopic, GatewayError, InlineKeyboard, MediaKind, Message,
	MessagingGateway, OutboundMedia, SendOptions, SentMessage, WebhookRegistration,
};

use crate::server::state::{RelayConfig, RelayContext};
use crate::server::store::{InMemoryMappingStore, MappingStore};

pub const GROUP_ID: i64 = -100_500;
pub const OPERATOR_ID: i64 = 1;

pub const THREAD_NOT_FOUND: &str = "Bad Request: message thread not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	Forward {
		to: ChatTarget,
		from: ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	},
	Copy {
		to: ChatTarget,
		message_id: i64,
	},
	SendText {
		to: ChatTarget,
		text: String,
		thread: Option<TopicId>,
		keyboard: Option<InlineKeyboard>,
	},
	SendMedia {
		to: ChatTarget,
		kind: MediaKind,
		file_id: String,
		caption: Option<String>,
		thread: Option<TopicId>,
	},
	CreateTopic {
		name: String,
	},
	DeleteTopic {
		topic: TopicId,
	},
	DeleteMessage {
		chat: ChatTarget,
		message_id: i64,
	},
	EditText {
		message_id: i64,
		text: String,
	},
	EditMarkup {
		message_id: i64,
		cleared: bool,
	},
	AnswerCallback {
		id: String,
		text: Option<String>,
	},
	SetCommands {
		scope: CommandScope,
		commands: Vec<String>,
	},
	ProfilePhoto {
		user_id: i64,
	},
	SetWebhook {
		url: String,
		allowed_updates: Vec<String>,
		max_connections: u32,
	},
	DeleteWebhook,
}

/// Scriptable in-process gateway that records every call.
pub struct FakeGateway {
	calls: Mutex<Vec<Call>>,
	next_topic: AtomicI64,
	next_message: AtomicI64,
	dead_topics: Mutex<HashSet<TopicId>>,
	pub transient_failures: AtomicBool,
	pub fail_create: AtomicBool,
	pub fail_edit: AtomicBool,
	profile_photo: Mutex<Option<String>>,
	recipient_errors: Mutex<HashMap<i64, String>>,
	create_barrier: Mutex<Option<Arc<Barrier>>>,
}

impl Default for FakeGateway {
	fn default() -> Self {
		Self {
			calls: Mutex::new(Vec::new()),
			next_topic: AtomicI64::new(100),
			next_message: AtomicI64::new(1000),
			dead_topics: Mutex::new(HashSet::new()),
			transient_failures: AtomicBool::new(false),
			fail_create: AtomicBool::new(false),
			fail_edit: AtomicBool::new(false),
			profile_photo: Mutex::new(None),
			recipient_errors: Mutex::new(HashMap::new()),
			create_barrier: Mutex::new(None),
		}
	}
}

impl FakeGateway {
	pub fn calls(&self) -> Vec<Call> {
		self.calls.lock().unwrap().clone()
	}

	pub fn clear_calls(&self) {
		self.calls.lock().unwrap().clear();
	}

	/// Make every call addressed into `topic` fail as a deleted thread.
	pub fn kill_topic(&self, topic: TopicId) {
		self.dead_topics.lock().unwrap().insert(topic);
	}

	pub fn set_profile_photo(&self, file_id: &str) {
		*self.profile_photo.lock().unwrap() = Some(file_id.to_string());
	}

	/// Direct sends to `user_id` fail with `description`.
	pub fn fail_recipient(&self, user_id: i64, description: &str) {
		self.recipient_errors
			.lock()
			.unwrap()
			.insert(user_id, description.to_string());
	}

	/// Hold every `create_topic` call until `parties` callers arrived.
	pub fn gate_creates(&self, parties: usize) {
		*self.create_barrier.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
	}

	pub fn forwards(&self) -> Vec<Call> {
		self.calls()
			.into_iter()
			.filter(|c| matches!(c, Call::Forward { .. }))
			.collect()
	}

	pub fn created_topics(&self) -> usize {
		self.calls()
			.iter()
			.filter(|c| matches!(c, Call::CreateTopic { .. }))
			.count()
	}

	/// Texts sent to `to`, in order.
	pub fn texts_to(&self, to: &ChatTarget) -> Vec<String> {
		self.calls()
			.into_iter()
			.filter_map(|c| match c {
				Call::SendText { to: t, text, .. } if &t == to => Some(text),
				_ => None,
			})
			.collect()
	}

	fn record(&self, call: Call) {
		self.calls.lock().unwrap().push(call);
	}

	fn message_id(&self) -> i64 {
		self.next_message.fetch_add(1, Ordering::SeqCst)
	}

	fn check_target(&self, to: &ChatTarget, thread: Option<TopicId>) -> Result<(), GatewayError> {
		if self.transient_failures.load(Ordering::SeqCst) {
			return Err(GatewayError::api(Some(429), "Too Many Requests: retry after 3"));
		}
		if let Some(t) = thread
			&& self.dead_topics.lock().unwrap().contains(&t)
		{
			return Err(GatewayError::api(Some(400), THREAD_NOT_FOUND));
		}
		if let ChatTarget::Id(id) = to
			&& let Some(desc) = self.recipient_errors.lock().unwrap().get(id)
		{
			return Err(GatewayError::api(Some(403), desc.clone()));
		}
		Ok(())
	}

	fn sent(&self, thread: Option<TopicId>) -> SentMessage {
		SentMessage {
			message_id: self.message_id(),
			message_thread_id: thread.map(TopicId::get),
		}
	}
}

#[async_trait]
impl MessagingGateway for FakeGateway {
	async fn forward_message(
		&self,
		to: &ChatTarget,
		from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<SentMessage, GatewayError> {
		self.record(Call::Forward {
			to: to.clone(),
			from: from.clone(),
			message_id,
			thread,
		});
		self.check_target(to, thread)?;
		Ok(self.sent(thread))
	}

	async fn copy_message(
		&self,
		to: &ChatTarget,
		_from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<i64, GatewayError> {
		self.record(Call::Copy {
			to: to.clone(),
			message_id,
		});
		self.check_target(to, thread)?;
		Ok(self.message_id())
	}

	async fn send_text(&self, to: &ChatTarget, text: &str, opts: &SendOptions) -> Result<SentMessage, GatewayError> {
		self.record(Call::SendText {
			to: to.clone(),
			text: text.to_string(),
			thread: opts.thread,
			keyboard: opts.reply_markup.clone(),
		});
		self.check_target(to, opts.thread)?;
		Ok(self.sent(opts.thread))
	}

	async fn send_media(
		&self,
		to: &ChatTarget,
		media: &OutboundMedia,
		opts: &SendOptions,
	) -> Result<SentMessage, GatewayError> {
		self.record(Call::SendMedia {
			to: to.clone(),
			kind: media.kind,
			file_id: media.file_id.clone(),
			caption: media.caption.clone(),
			thread: opts.thread,
		});
		self.check_target(to, opts.thread)?;
		Ok(self.sent(opts.thread))
	}

	async fn create_topic(&self, _chat: &ChatTarget, name: &str) -> Result<ForumTopic, GatewayError> {
		self.record(Call::CreateTopic { name: name.to_string() });
		let barrier = self.create_barrier.lock().unwrap().clone();
		if let Some(barrier) = barrier {
			barrier.wait().await;
		}
		if self.fail_create.load(Ordering::SeqCst) {
			return Err(GatewayError::api(Some(400), "Bad Request: not enough rights to create a topic"));
		}
		let id = self.next_topic.fetch_add(1, Ordering::SeqCst);
		Ok(ForumTopic {
			topic_id: TopicId::new(id).unwrap(),
			name: name.to_string(),
		})
	}

	async fn delete_topic(&self, _chat: &ChatTarget, topic: TopicId) -> Result<(), GatewayError> {
		self.record(Call::DeleteTopic { topic });
		self.dead_topics.lock().unwrap().insert(topic);
		Ok(())
	}

	async fn delete_message(&self, chat: &ChatTarget, message_id: i64) -> Result<(), GatewayError> {
		self.record(Call::DeleteMessage {
			chat: chat.clone(),
			message_id,
		});
		Ok(())
	}

	async fn edit_message_text(
		&self,
		_chat: &ChatTarget,
		message_id: i64,
		text: &str,
		_opts: &SendOptions,
	) -> Result<(), GatewayError> {
		self.record(Call::EditText {
			message_id,
			text: text.to_string(),
		});
		if self.fail_edit.load(Ordering::SeqCst) {
			return Err(GatewayError::api(Some(400), "Bad Request: message to edit not found"));
		}
		Ok(())
	}

	async fn edit_message_markup(
		&self,
		_chat: &ChatTarget,
		message_id: i64,
		markup: Option<&InlineKeyboard>,
	) -> Result<(), GatewayError> {
		self.record(Call::EditMarkup {
			message_id,
			cleared: markup.is_none(),
		});
		if self.fail_edit.load(Ordering::SeqCst) {
			return Err(GatewayError::api(Some(400), "Bad Request: message is not modified"));
		}
		Ok(())
	}

	async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError> {
		self.record(Call::AnswerCallback {
			id: callback_id.to_string(),
			text: text.map(str::to_string),
		});
		Ok(())
	}

	async fn set_command_menu(&self, commands: &[BotCommand], scope: &CommandScope) -> Result<(), GatewayError> {
		self.record(Call::SetCommands {
			scope: scope.clone(),
			commands: commands.iter().map(|c| c.command.clone()).collect(),
		});
		Ok(())
	}

	async fn latest_profile_photo(&self, user_id: i64) -> Result<Option<String>, GatewayError> {
		self.record(Call::ProfilePhoto { user_id });
		Ok(self.profile_photo.lock().unwrap().clone())
	}

	async fn set_webhook(&self, registration: &WebhookRegistration) -> Result<(), GatewayError> {
		self.record(Call::SetWebhook {
			url: registration.url.clone(),
			allowed_updates: registration.allowed_updates.clone(),
			max_connections: registration.max_connections,
		});
		Ok(())
	}

	async fn delete_webhook(&self) -> Result<(), GatewayError> {
		self.record(Call::DeleteWebhook);
		Ok(())
	}
}

pub struct Harness {
	pub ctx: RelayContext,
	pub store: Arc<InMemoryMappingStore>,
	pub gateway: Arc<FakeGateway>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_config(|_| {})
	}

	pub fn with_config(tweak: impl FnOnce(&mut RelayConfig)) -> Self {
		let mut cfg = RelayConfig {
			operator: Identity::from_user_id(OPERATOR_ID),
			group_id: GROUP_ID,
			notify_blocked: true,
			broadcast_concurrency: 4,
		};
		tweak(&mut cfg);
		let store = Arc::new(InMemoryMappingStore::default());
		let gateway = Arc::new(FakeGateway::default());
		let ctx = RelayContext::new(cfg, store.clone() as Arc<dyn MappingStore>, gateway.clone());
		Self { ctx, store, gateway }
	}

	pub fn group(&self) -> ChatTarget {
		ChatTarget::Id(GROUP_ID)
	}

	/// Same config and gateway, reading through a store that fails for chosen identities.
	pub fn with_flaky_store(&self) -> (RelayContext, Arc<FlakyStore>) {
		let flaky = Arc::new(FlakyStore::new(self.store.clone()));
		let ctx = RelayContext::new(
			(*self.ctx.cfg).clone(),
			flaky.clone() as Arc<dyn MappingStore>,
			self.gateway.clone(),
		);
		(ctx, flaky)
	}
}

/// Wraps the in-memory store; selected operations fail for selected identities.
pub struct FlakyStore {
	inner: Arc<InMemoryMappingStore>,
	flag_reads: Mutex<HashSet<Identity>>,
	removals: Mutex<HashSet<Identity>>,
	lookups: Mutex<HashSet<Identity>>,
}

impl FlakyStore {
	pub fn new(inner: Arc<InMemoryMappingStore>) -> Self {
		Self {
			inner,
			flag_reads: Mutex::default(),
			removals: Mutex::default(),
			lookups: Mutex::default(),
		}
	}

	pub fn fail_flag_read(&self, identity: Identity) {
		self.flag_reads.lock().unwrap().insert(identity);
	}

	pub fn fail_removal(&self, identity: Identity) {
		self.removals.lock().unwrap().insert(identity);
	}

	pub fn fail_lookup(&self, identity: Identity) {
		self.lookups.lock().unwrap().insert(identity);
	}

	fn check(set: &Mutex<HashSet<Identity>>, identity: &Identity, what: &str) -> anyhow::Result<()> {
		if set.lock().unwrap().contains(identity) {
			anyhow::bail!("{what} timed out");
		}
		Ok(())
	}
}

#[async_trait]
impl MappingStore for FlakyStore {
	async fn topic_for(&self, identity: &Identity) -> anyhow::Result<Option<TopicId>> {
		Self::check(&self.lookups, identity, "topic read")?;
		self.inner.topic_for(identity).await
	}

	async fn put_topic(&self, identity: &Identity, topic: TopicId) -> anyhow::Result<()> {
		self.inner.put_topic(identity, topic).await
	}

	async fn remove_topic(&self, identity: &Identity) -> anyhow::Result<bool> {
		Self::check(&self.removals, identity, "mapping delete")?;
		self.inner.remove_topic(identity).await
	}

	async fn list_mappings(&self) -> anyhow::Result<Vec<Mapping>> {
		self.inner.list_mappings().await
	}

	async fn is_flagged(&self, identity: &Identity) -> anyhow::Result<bool> {
		Self::check(&self.flag_reads, identity, "flag read")?;
		self.inner.is_flagged(identity).await
	}

	async fn set_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		self.inner.set_block_flag(identity).await
	}

	async fn clear_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		self.inner.clear_block_flag(identity).await
	}
}

pub fn identity(id: i64) -> Identity {
	Identity::from_user_id(id)
}

pub fn topic(id: i64) -> TopicId {
	TopicId::new(id).unwrap()
}

/// Build a `Message` from JSON fragments merged onto a minimal skeleton.
pub fn message(extra: serde_json::Value) -> Message {
	let mut base = serde_json::json!({
		"message_id": 10,
		"chat": {"id": 42, "type": "private"},
		"from": {"id": 42, "is_bot": false, "first_name": "Ada", "last_name": "Lovelace"},
	});
	if let (Some(obj), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
		for (k, v) in extra {
			obj.insert(k.clone(), v.clone());
		}
	}
	serde_json::from_value(base).unwrap()
}

/// Private message from `user_id`.
pub fn private_text(user_id: i64, message_id: i64, text: &str) -> Message {
	message(serde_json::json!({
		"message_id": message_id,
		"chat": {"id": user_id, "type": "private"},
		"from": {"id": user_id, "is_bot": false, "first_name": "User", "last_name": user_id.to_string()},
		"text": text,
	}))
}

/// Operator message in the management group, optionally inside a topic.
pub fn operator_group_message(thread: Option<i64>, extra: serde_json::Value) -> Message {
	let mut base = serde_json::json!({
		"message_id": 500,
		"chat": {"id": GROUP_ID, "type": "supergroup"},
		"from": {"id": OPERATOR_ID, "is_bot": false, "first_name": "Op"},
	});
	if let Some(t) = thread
		&& let Some(obj) = base.as_object_mut()
	{
		obj.insert("message_thread_id".into(), serde_json::json!(t));
		obj.insert("is_topic_message".into(), serde_json::json!(true));
	}
	if let (Some(obj), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
		for (k, v) in extra {
			obj.insert(k.clone(), v.clone());
		}
	}
	serde_json::from_value(base).unwrap()
}
