#![forbid(unsafe_code)]

use serde::Deserialize;
use topicbridge_domain::{Identity, TopicId};

/// Raw webhook update. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
	pub update_id: i64,
	#[serde(default)]
	pub message: Option<Message>,
	#[serde(default)]
	pub callback_query: Option<CallbackQuery>,
}

/// Closed set of events the relay reacts to.
#[derive(Debug, Clone)]
pub enum InboundEvent {
	Message(Box<Message>),
	CallbackQuery(Box<CallbackQuery>),
}

impl Update {
	/// Narrow the update to a relay event; `None` for update kinds the relay ignores.
	pub fn into_event(self) -> Option<InboundEvent> {
		if let Some(message) = self.message {
			return Some(InboundEvent::Message(Box::new(message)));
		}
		self.callback_query.map(|q| InboundEvent::CallbackQuery(Box::new(q)))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
	Private,
	Group,
	Supergroup,
	Channel,
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
	pub id: i64,
	#[serde(rename = "type")]
	pub kind: ChatKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
	pub id: i64,
	#[serde(default)]
	pub is_bot: bool,
	#[serde(default)]
	pub first_name: String,
	#[serde(default)]
	pub last_name: Option<String>,
	#[serde(default)]
	pub username: Option<String>,
}

impl User {
	pub fn identity(&self) -> Identity {
		Identity::from_user_id(self.id)
	}

	/// First and last name joined by a space; `None` when both are blank.
	pub fn display_name(&self) -> Option<String> {
		let parts = [Some(self.first_name.as_str()), self.last_name.as_deref()];
		let joined = parts
			.into_iter()
			.flatten()
			.map(str::trim)
			.filter(|p| !p.is_empty())
			.collect::<Vec<_>>()
			.join(" ");
		if joined.is_empty() { None } else { Some(joined) }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
	pub file_id: String,
	#[serde(default)]
	pub width: u32,
	#[serde(default)]
	pub height: u32,
}

/// Any attachment addressed by file id (document, video, voice, sticker).
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
	pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
	pub message_id: i64,
	#[serde(default)]
	pub from: Option<User>,
	pub chat: Chat,
	#[serde(default)]
	pub message_thread_id: Option<i64>,
	#[serde(default)]
	pub is_topic_message: bool,
	#[serde(default)]
	pub text: Option<String>,
	#[serde(default)]
	pub caption: Option<String>,
	#[serde(default)]
	pub photo: Vec<PhotoSize>,
	#[serde(default)]
	pub document: Option<FileRef>,
	#[serde(default)]
	pub video: Option<FileRef>,
	#[serde(default)]
	pub voice: Option<FileRef>,
	#[serde(default)]
	pub sticker: Option<FileRef>,
	#[serde(default)]
	pub reply_to_message: Option<Box<Message>>,
}

/// A `/command arg1 arg2` split out of message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandText<'a> {
	/// Command name without the slash or `@botname` suffix.
	pub name: &'a str,
	/// Whitespace-separated arguments.
	pub args: Vec<&'a str>,
	/// Everything after the command token, trimmed.
	pub rest: &'a str,
}

impl Message {
	pub fn is_private(&self) -> bool {
		self.chat.kind == ChatKind::Private
	}

	pub fn sender_identity(&self) -> Option<Identity> {
		self.from.as_ref().map(User::identity)
	}

	/// Topic the message was posted in, if any.
	///
	/// Replies in a forum's General topic carry a `message_thread_id` too (the id of
	/// the replied-to message); only `is_topic_message` marks a real topic.
	pub fn topic(&self) -> Option<TopicId> {
		self.message_thread_id
			.filter(|_| self.is_topic_message)
			.and_then(|id| TopicId::new(id).ok())
	}

	/// Largest available size of an attached photo.
	pub fn largest_photo(&self) -> Option<&PhotoSize> {
		self.photo.last()
	}

	pub fn is_command(&self) -> bool {
		self.text.as_deref().is_some_and(|t| t.starts_with('/'))
	}

	pub fn command(&self) -> Option<CommandText<'_>> {
		let text = self.text.as_deref()?;
		let body = text.strip_prefix('/')?;
		let (token, rest) = match body.find(char::is_whitespace) {
			Some(idx) => (&body[..idx], body[idx..].trim()),
			None => (body, ""),
		};
		let name = token.split_once('@').map(|(n, _)| n).unwrap_or(token);
		if name.is_empty() {
			return None;
		}
		Some(CommandText {
			name,
			args: rest.split_whitespace().collect(),
			rest,
		})
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
	pub id: String,
	pub from: User,
	#[serde(default)]
	pub data: Option<String>,
	#[serde(default)]
	pub message: Option<Box<Message>>,
}
