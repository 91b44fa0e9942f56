#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use topicbridge_domain::TopicId;
use tracing::debug;

use crate::{
	BotCommand, ChatTarget, CommandScope, ForumTopic, GatewayError, InlineKeyboard, MessagingGateway, OutboundMedia,
	ParseMode, SecretString, SendOptions, SentMessage, WebhookRegistration,
};

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct BotApiConfig {
	pub base_url: String,
	pub token: SecretString,
	pub request_timeout: Duration,
}

impl BotApiConfig {
	pub fn new(token: SecretString) -> Self {
		Self {
			base_url: DEFAULT_API_BASE_URL.to_string(),
			token,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// `MessagingGateway` over the HTTP Bot API.
#[derive(Debug, Clone)]
pub struct BotApiClient {
	http: reqwest::Client,
	base_url: String,
	token: SecretString,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
	ok: bool,
	#[serde(default = "Option::default")]
	result: Option<T>,
	#[serde(default)]
	description: Option<String>,
	#[serde(default)]
	error_code: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
	chat_id: &'a ChatTarget,
	from_chat_id: &'a ChatTarget,
	message_id: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	message_thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageIdResult {
	message_id: i64,
}

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
	chat_id: &'a ChatTarget,
	text: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	message_thread_id: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	parse_mode: Option<ParseMode>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_markup: Option<&'a InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct SendMediaRequest<'a> {
	chat_id: &'a ChatTarget,
	#[serde(skip_serializing_if = "Option::is_none")]
	caption: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	message_thread_id: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	parse_mode: Option<ParseMode>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_markup: Option<&'a InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct CreateTopicRequest<'a> {
	chat_id: &'a ChatTarget,
	name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateTopicResult {
	message_thread_id: i64,
	name: String,
}

#[derive(Debug, Serialize)]
struct TopicRequest<'a> {
	chat_id: &'a ChatTarget,
	message_thread_id: i64,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
	chat_id: &'a ChatTarget,
	message_id: i64,
}

#[derive(Debug, Serialize)]
struct EditTextRequest<'a> {
	chat_id: &'a ChatTarget,
	message_id: i64,
	text: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	parse_mode: Option<ParseMode>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_markup: Option<&'a InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct EditMarkupRequest<'a> {
	chat_id: &'a ChatTarget,
	message_id: i64,
	reply_markup: &'a InlineKeyboard,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
	callback_query_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SetCommandsRequest<'a> {
	commands: &'a [BotCommand],
	scope: &'a CommandScope,
}

#[derive(Debug, Serialize)]
struct ProfilePhotosRequest {
	user_id: i64,
	limit: u32,
}

#[derive(Debug, Deserialize)]
struct ProfilePhotosResult {
	total_count: u32,
	#[serde(default)]
	photos: Vec<Vec<ProfilePhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct ProfilePhotoSize {
	file_id: String,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest<'a> {
	url: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	secret_token: Option<&'a str>,
	allowed_updates: &'a [String],
	max_connections: u32,
}

#[derive(Debug, Serialize)]
struct EmptyRequest {}

impl BotApiClient {
	pub fn new(cfg: BotApiConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("topicbridge/0.x")
			.timeout(cfg.request_timeout)
			.build()
			.map_err(|e| anyhow::anyhow!("build reqwest client: {e}"))?;

		Ok(Self {
			http,
			base_url: cfg.base_url,
			token: cfg.token,
		})
	}

	fn method_url(&self, method: &str) -> String {
		format!(
			"{}/bot{}/{}",
			self.base_url.trim_end_matches('/'),
			self.token.expose(),
			method
		)
	}

	/// POST one Bot API method and unwrap the `{ok, result}` envelope.
	async fn call<B, T>(&self, method: &str, body: &B) -> Result<T, GatewayError>
	where
		B: Serialize + ?Sized,
		T: DeserializeOwned,
	{
		metrics::counter!("topicbridge_gateway_requests_total", "method" => method.to_string()).increment(1);

		// reqwest errors carry the request URL, which embeds the token.
		let resp = self
			.http
			.post(self.method_url(method))
			.json(body)
			.send()
			.await
			.map_err(|e| GatewayError::Transport(format!("{method}: {}", e.without_url())))?;

		let status = resp.status();
		let bytes = resp
			.bytes()
			.await
			.map_err(|e| GatewayError::Transport(format!("{method}: read body: {}", e.without_url())))?;

		let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)
			.map_err(|e| GatewayError::Transport(format!("{method}: decode response (status={status}): {e}")))?;

		if !envelope.ok {
			metrics::counter!("topicbridge_gateway_errors_total", "method" => method.to_string()).increment(1);
			let description = envelope
				.description
				.unwrap_or_else(|| format!("request failed with status {status}"));
			debug!(method, status = %status, error_code = ?envelope.error_code, %description, "bot api call failed");
			return Err(GatewayError::api(envelope.error_code, description));
		}

		envelope
			.result
			.ok_or_else(|| GatewayError::Transport(format!("{method}: ok response without result")))
	}

	async fn call_unit<B>(&self, method: &str, body: &B) -> Result<(), GatewayError>
	where
		B: Serialize + ?Sized,
	{
		let _: serde_json::Value = self.call(method, body).await?;
		Ok(())
	}
}

#[async_trait]
impl MessagingGateway for BotApiClient {
	async fn forward_message(
		&self,
		to: &ChatTarget,
		from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<SentMessage, GatewayError> {
		let req = ForwardRequest {
			chat_id: to,
			from_chat_id: from,
			message_id,
			message_thread_id: thread.map(TopicId::get),
		};
		self.call("forwardMessage", &req).await
	}

	async fn copy_message(
		&self,
		to: &ChatTarget,
		from: &ChatTarget,
		message_id: i64,
		thread: Option<TopicId>,
	) -> Result<i64, GatewayError> {
		let req = ForwardRequest {
			chat_id: to,
			from_chat_id: from,
			message_id,
			message_thread_id: thread.map(TopicId::get),
		};
		let res: MessageIdResult = self.call("copyMessage", &req).await?;
		Ok(res.message_id)
	}

	async fn send_text(&self, to: &ChatTarget, text: &str, opts: &SendOptions) -> Result<SentMessage, GatewayError> {
		let req = SendTextRequest {
			chat_id: to,
			text,
			message_thread_id: opts.thread.map(TopicId::get),
			parse_mode: opts.parse_mode,
			reply_markup: opts.reply_markup.as_ref(),
		};
		self.call("sendMessage", &req).await
	}

	async fn send_media(
		&self,
		to: &ChatTarget,
		media: &OutboundMedia,
		opts: &SendOptions,
	) -> Result<SentMessage, GatewayError> {
		let caption = media.caption.as_deref().filter(|_| media.kind.supports_caption());
		let req = SendMediaRequest {
			chat_id: to,
			caption,
			message_thread_id: opts.thread.map(TopicId::get),
			parse_mode: caption.and(opts.parse_mode),
			reply_markup: opts.reply_markup.as_ref(),
		};

		// The file field name depends on the media kind.
		let mut body =
			serde_json::to_value(&req).map_err(|e| GatewayError::Transport(format!("{}: encode: {e}", media.kind.method())))?;
		if let Some(obj) = body.as_object_mut() {
			obj.insert(
				media.kind.field().to_string(),
				serde_json::Value::String(media.file_id.clone()),
			);
		}

		self.call(media.kind.method(), &body).await
	}

	async fn create_topic(&self, chat: &ChatTarget, name: &str) -> Result<ForumTopic, GatewayError> {
		let req = CreateTopicRequest { chat_id: chat, name };
		let res: CreateTopicResult = self.call("createForumTopic", &req).await?;
		let topic_id = TopicId::new(res.message_thread_id)
			.map_err(|e| GatewayError::Transport(format!("createForumTopic: {e}")))?;
		Ok(ForumTopic {
			topic_id,
			name: res.name,
		})
	}

	async fn delete_topic(&self, chat: &ChatTarget, topic: TopicId) -> Result<(), GatewayError> {
		let req = TopicRequest {
			chat_id: chat,
			message_thread_id: topic.get(),
		};
		self.call_unit("deleteForumTopic", &req).await
	}

	async fn delete_message(&self, chat: &ChatTarget, message_id: i64) -> Result<(), GatewayError> {
		let req = MessageRequest {
			chat_id: chat,
			message_id,
		};
		self.call_unit("deleteMessage", &req).await
	}

	async fn edit_message_text(
		&self,
		chat: &ChatTarget,
		message_id: i64,
		text: &str,
		opts: &SendOptions,
	) -> Result<(), GatewayError> {
		let req = EditTextRequest {
			chat_id: chat,
			message_id,
			text,
			parse_mode: opts.parse_mode,
			reply_markup: opts.reply_markup.as_ref(),
		};
		self.call_unit("editMessageText", &req).await
	}

	async fn edit_message_markup(
		&self,
		chat: &ChatTarget,
		message_id: i64,
		markup: Option<&InlineKeyboard>,
	) -> Result<(), GatewayError> {
		let empty = InlineKeyboard::default();
		let req = EditMarkupRequest {
			chat_id: chat,
			message_id,
			reply_markup: markup.unwrap_or(&empty),
		};
		self.call_unit("editMessageReplyMarkup", &req).await
	}

	async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), GatewayError> {
		let req = AnswerCallbackRequest {
			callback_query_id: callback_id,
			text,
		};
		self.call_unit("answerCallbackQuery", &req).await
	}

	async fn set_command_menu(&self, commands: &[BotCommand], scope: &CommandScope) -> Result<(), GatewayError> {
		let req = SetCommandsRequest { commands, scope };
		self.call_unit("setMyCommands", &req).await
	}

	async fn latest_profile_photo(&self, user_id: i64) -> Result<Option<String>, GatewayError> {
		let req = ProfilePhotosRequest { user_id, limit: 1 };
		let res: ProfilePhotosResult = self.call("getUserProfilePhotos", &req).await?;
		if res.total_count == 0 {
			return Ok(None);
		}
		Ok(res
			.photos
			.into_iter()
			.next()
			.and_then(|sizes| sizes.into_iter().next())
			.map(|p| p.file_id))
	}

	async fn set_webhook(&self, registration: &WebhookRegistration) -> Result<(), GatewayError> {
		let req = SetWebhookRequest {
			url: &registration.url,
			secret_token: registration.secret_token.as_ref().map(SecretString::expose),
			allowed_updates: &registration.allowed_updates,
			max_connections: registration.max_connections,
		};
		self.call_unit("setWebhook", &req).await
	}

	async fn delete_webhook(&self) -> Result<(), GatewayError> {
		self.call_unit("deleteWebhook", &EmptyRequest {}).await
	}
}
