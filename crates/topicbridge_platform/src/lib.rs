#![forbid(unsafe_code)]

pub mod telegram;

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use topicbridge_domain::{Identity, TopicId};

pub use telegram::client::{BotApiClient, BotApiConfig};
pub use telegram::types::{CallbackQuery, Chat, ChatKind, CommandText, FileRef, InboundEvent, Message, PhotoSize, Update, User};

/// Address of a chat for outbound calls: numeric id or `@handle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ChatTarget {
	Id(i64),
	Handle(String),
}

impl From<i64> for ChatTarget {
	fn from(id: i64) -> Self {
		Self::Id(id)
	}
}

impl From<&Identity> for ChatTarget {
	fn from(identity: &Identity) -> Self {
		match identity.as_user_id() {
			Some(id) => Self::Id(id),
			None => {
				let s = identity.as_str();
				if s.starts_with('@') {
					Self::Handle(s.to_string())
				} else {
					Self::Handle(format!("@{s}"))
				}
			}
		}
	}
}

impl fmt::Display for ChatTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Id(id) => write!(f, "{id}"),
			Self::Handle(h) => f.write_str(h),
		}
	}
}

/// Text formatting mode for outbound text and captions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
	#[serde(rename = "HTML")]
	Html,
}

/// Inline keyboard attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboard {
	#[serde(rename = "inline_keyboard")]
	pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
	pub fn new(rows: Vec<Vec<InlineButton>>) -> Self {
		Self { rows }
	}
}

/// Single inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
	pub text: String,
	#[serde(flatten)]
	pub action: ButtonAction,
}

/// What pressing a button does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
	Url(String),
	CallbackData(String),
}

impl InlineButton {
	pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			action: ButtonAction::Url(url.into()),
		}
	}

	pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			action: ButtonAction::CallbackData(data.into()),
		}
	}
}

/// Per-call options shared by text and media sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
	pub thread: Option<TopicId>,
	pub parse_mode: Option<ParseMode>,
	pub reply_markup: Option<InlineKeyboard>,
}

impl SendOptions {
	/// Plain send, optionally into a topic.
	pub fn in_thread(thread: Option<TopicId>) -> Self {
		Self {
			thread,
			..Self::default()
		}
	}

	pub fn html(mut self) -> Self {
		self.parse_mode = Some(ParseMode::Html);
		self
	}

	pub fn with_keyboard(mut self, keyboard: InlineKeyboard) -> Self {
		self.reply_markup = Some(keyboard);
		self
	}
}

/// Media kinds the relay re-sends by file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
	Photo,
	Document,
	Video,
	Voice,
	Sticker,
}

impl MediaKind {
	/// Bot API method for this kind.
	pub const fn method(self) -> &'static str {
		match self {
			Self::Photo => "sendPhoto",
			Self::Document => "sendDocument",
			Self::Video => "sendVideo",
			Self::Voice => "sendVoice",
			Self::Sticker => "sendSticker",
		}
	}

	/// Request field carrying the file id.
	pub const fn field(self) -> &'static str {
		match self {
			Self::Photo => "photo",
			Self::Document => "document",
			Self::Video => "video",
			Self::Voice => "voice",
			Self::Sticker => "sticker",
		}
	}

	/// Stickers cannot carry a caption.
	pub const fn supports_caption(self) -> bool {
		!matches!(self, Self::Sticker)
	}
}

/// Media re-sent by an existing file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMedia {
	pub kind: MediaKind,
	pub file_id: String,
	pub caption: Option<String>,
}

/// Message created by a send/forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct SentMessage {
	pub message_id: i64,
	#[serde(default)]
	pub message_thread_id: Option<i64>,
}

/// Topic created by `create_topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForumTopic {
	pub topic_id: TopicId,
	pub name: String,
}

/// Command menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotCommand {
	pub command: String,
	pub description: String,
}

impl BotCommand {
	pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			description: description.into(),
		}
	}
}

/// Who sees a command menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandScope {
	Default,
	Chat { chat_id: ChatTarget },
}

/// Webhook registration request.
#[derive(Debug, Clone)]
pub struct WebhookRegistration {
	pub url: String,
	pub secret_token: Option<SecretString>,
	pub allowed_updates: Vec<String>,
	pub max_connections: u32,
}

/// Outbound call failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
	/// Network error, timeout or undecodable response.
	#[error("transport error: {0}")]
	Transport(String),

	/// The API answered `{ok: false}`.
	#[error("api error: {description}")]
	Api { code: Option<i64>, description: String },
}

/// How the relay reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
	/// The target topic is gone or not addressable; the mapping is stale.
	StaleTopic,
	/// Anything else; reported, never repaired.
	Transient,
}

/// Why a direct message to a user failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientHint {
	BotBlocked,
	RecipientNotFound,
	Other,
}

const STALE_TOPIC_MARKERS: &[&str] = &[
	"message thread not found",
	"thread not found",
	"topic_deleted",
	"topic_id_invalid",
	"chat not found",
];

impl GatewayError {
	pub fn api(code: Option<i64>, description: impl Into<String>) -> Self {
		Self::Api {
			code,
			description: description.into(),
		}
	}

	/// Human-readable reason.
	pub fn description(&self) -> &str {
		match self {
			Self::Transport(msg) => msg,
			Self::Api { description, .. } => description,
		}
	}

	pub fn class(&self) -> FailureClass {
		match self {
			Self::Transport(_) => FailureClass::Transient,
			Self::Api { description, .. } => {
				let lower = description.to_ascii_lowercase();
				if STALE_TOPIC_MARKERS.iter().any(|m| lower.contains(m)) {
					FailureClass::StaleTopic
				} else {
					FailureClass::Transient
				}
			}
		}
	}

	pub fn is_stale_topic(&self) -> bool {
		self.class() == FailureClass::StaleTopic
	}

	pub fn recipient_hint(&self) -> RecipientHint {
		let lower = self.description().to_ascii_lowercase();
		if lower.contains("bot was blocked") {
			RecipientHint::BotBlocked
		} else if lower.contains("chat not found") {
			RecipientHint::RecipientNotFound
		} else {
			RecipientHint::Other
		}
	}
}

/// Outbound calls against the messaging network.
///
/// Implementations perform exactly one request per call; no retries.
#[async_trait::async_trait]
pub trait MessagingGateway: Send + Sync + 'static {
	async fn forward_message(
		&self,
		to: &ChatTarget,
		from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<SentMessage, GatewayError>;

	/// Copy without the "forwarded from" header; returns the new message id.
	async fn copy_message(
		&self,
		to: &ChatTarget,
		from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<i64, GatewayError>;

	async fn send_text(&self, to: &ChatTarget, text: &str, opts: &SendOptions) -> Result<SentMessage, GatewayError>;

	async fn send_media(
		&self,
		to: &ChatTarget,
		media: &OutboundMedia,
		opts: &SendOptions,
	) -> Result<SentMessage, GatewayError>;

	async fn create_topic(&self, chat: &ChatTarget, name: &str) -> Result<ForumTopic, GatewayError>;

	async fn delete_topic(&self, chat: &ChatTarget, topic: TopicId) -> Result<(), GatewayError>;

	async fn delete_message(&self, chat: &ChatTarget, message_id: i64) -> Result<(), GatewayError>;

	async fn edit_message_text(
		&self,
		chat: &ChatTarget,
		message_id: i64,
		text: &str,
		opts: &SendOptions,
	) -> Result<(), GatewayError>;

	/// Replace (or with `None`, remove) a message's inline keyboard.
	async fn edit_message_markup(
		&self,
		chat: &ChatTarget,
		message_id: i64,
		markup: Option<&InlineKeyboard>,
	) -> Result<(), GatewayError>;

	async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError>;

	async fn set_command_menu(&self, commands: &[BotCommand], scope: &CommandScope) -> Result<(), GatewayError>;

	/// File id of the user's most recent profile photo, if any.
	async fn latest_profile_photo(&self, user_id: i64) -> Result<Option<String>, GatewayError>;

	async fn set_webhook(&self, registration: &WebhookRegistration) -> Result<(), GatewayError>;

	async fn delete_webhook(&self) -> Result<(), GatewayError>;
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
