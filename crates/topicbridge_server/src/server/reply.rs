#![forbid(unsafe_code)]

use topicbridge_domain::{Identity, TopicId};
use topicbridge_platform::{ChatTarget, GatewayError, MediaKind, Message, OutboundMedia, RecipientHint, SendOptions};
use tracing::{debug, warn};

use crate::server::resolver::ReverseResolver;
use crate::server::state::RelayContext;
use crate::server::templates;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
	Delivered { identity: Identity },
	/// Nobody owns the topic.
	Unresolved,
	Failed { identity: Identity, hint: RecipientHint },
}

/// Relays an operator message posted inside a topic back to the topic owner.
#[derive(Clone)]
pub struct OperatorReply {
	ctx: RelayContext,
	resolver: ReverseResolver,
}

impl OperatorReply {
	pub fn new(ctx: RelayContext) -> Self {
		let resolver = ReverseResolver::new(ctx.store.clone());
		Self { ctx, resolver }
	}

	pub async fn relay(&self, msg: &Message, topic: TopicId) -> anyhow::Result<ReplyOutcome> {
		let Some(identity) = self.resolver.resolve(topic).await? else {
			debug!(topic = %topic, "no owner for topic");
			self.notice(topic, templates::unresolved_recipient()).await;
			return Ok(ReplyOutcome::Unresolved);
		};

		match self.deliver(msg, &identity).await {
			Ok(()) => {
				metrics::counter!("topicbridge_replies_total").increment(1);
				Ok(ReplyOutcome::Delivered { identity })
			}
			Err(err) => {
				metrics::counter!("topicbridge_reply_failures_total").increment(1);
				warn!(identity = %identity, topic = %topic, error = %err, "operator reply not delivered");
				let hint = err.recipient_hint();
				self.notice(topic, &templates::delivery_failed(hint, err.description()))
					.await;
				Ok(ReplyOutcome::Failed { identity, hint })
			}
		}
	}

	async fn deliver(&self, msg: &Message, identity: &Identity) -> Result<(), GatewayError> {
		let gateway = &self.ctx.gateway;
		let to = ChatTarget::from(identity);
		let plain = SendOptions::default();

		if let Some(text) = msg.text.as_deref() {
			return gateway.send_text(&to, text, &plain).await.map(|_| ());
		}

		if let Some(media) = outbound_media(msg) {
			return gateway.send_media(&to, &media, &plain).await.map(|_| ());
		}

		gateway
			.copy_message(&to, &ChatTarget::Id(msg.chat.id), msg.message_id, None)
			.await
			.map(|_| ())
	}

	async fn notice(&self, topic: TopicId, text: &str) {
		let opts = SendOptions::in_thread(Some(topic)).html();
		if let Err(err) = self.ctx.gateway.send_text(&self.ctx.cfg.group(), text, &opts).await {
			warn!(topic = %topic, error = %err, "failed to post notice in topic");
		}
	}
}

/// Media re-sendable by file id; `None` means fall back to copying.
fn outbound_media(msg: &Message) -> Option<OutboundMedia> {
	let caption = msg.caption.clone();
	let (kind, file_id) = if let Some(photo) = msg.largest_photo() {
		(MediaKind::Photo, photo.file_id.clone())
	} else if let Some(doc) = &msg.document {
		(MediaKind::Document, doc.file_id.clone())
	} else if let Some(video) = &msg.video {
		(MediaKind::Video, video.file_id.clone())
	} else if let Some(voice) = &msg.voice {
		(MediaKind::Voice, voice.file_id.clone())
	} else if let Some(sticker) = &msg.sticker {
		return Some(OutboundMedia {
			kind: MediaKind::Sticker,
			file_id: sticker.file_id.clone(),
			caption: None,
		});
	} else {
		return None;
	};
	Some(OutboundMedia { kind, file_id, caption })
}
