#![forbid(unsafe_code)]

use thiserror::Error;
use topicbridge_domain::{Identity, TopicId};
use topicbridge_platform::{
	ChatTarget, GatewayError, MediaKind, Message, OutboundMedia, SendOptions, User,
};
use tracing::{debug, info, warn};

use crate::server::moderation::ModerationGate;
use crate::server::state::RelayContext;
use crate::server::templates;

/// Terminal state of one relayed user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
	/// Rejected before any mapping work.
	Blocked { notified: bool },
	Forwarded {
		topic: TopicId,
		/// A new topic was opened for this message.
		created: bool,
		/// A stale mapping was dropped first.
		repaired: bool,
	},
}

#[derive(Debug, Error)]
pub enum RelayError {
	#[error("message has no sender")]
	NoSender,

	#[error("mapping store: {0:#}")]
	Store(anyhow::Error),

	/// Forward into an existing topic failed for a reason other than a dead topic.
	#[error("forward into topic {topic} failed: {source}")]
	Forward { topic: TopicId, source: GatewayError },

	#[error("topic creation failed: {0}")]
	CreateTopic(#[source] GatewayError),

	/// Forward into a freshly created topic failed; never repaired again.
	#[error("forward into new topic {topic} failed: {source}")]
	ForwardAfterCreate { topic: TopicId, source: GatewayError },
}

/// Per-message relay from a private chat into the user's topic.
///
/// Allows at most one topic creation per message, so a pathologically broken
/// group costs a bounded number of calls.
#[derive(Clone)]
pub struct RelayEngine {
	ctx: RelayContext,
	gate: ModerationGate,
}

impl RelayEngine {
	pub fn new(ctx: RelayContext) -> Self {
		let gate = ModerationGate::new(ctx.store.clone());
		Self { ctx, gate }
	}

	pub async fn relay_user_message(&self, msg: &Message) -> Result<RelayOutcome, RelayError> {
		let user = msg.from.as_ref().ok_or(RelayError::NoSender)?;
		let identity = user.identity();

		if let Some(rejected) = self.reject_if_blocked(&identity).await? {
			return Ok(rejected);
		}

		let mut repaired = false;
		if let Some(topic) = self.ctx.store.topic_for(&identity).await.map_err(RelayError::Store)? {
			match self.forward(msg, topic).await {
				Ok(()) => {
					metrics::counter!("topicbridge_relays_total").increment(1);
					return Ok(RelayOutcome::Forwarded {
						topic,
						created: false,
						repaired: false,
					});
				}
				Err(err) if err.is_stale_topic() => {
					warn!(identity = %identity, topic = %topic, error = %err, "topic is gone; dropping mapping");
					self.ctx.store.remove_topic(&identity).await.map_err(RelayError::Store)?;
					metrics::counter!("topicbridge_repairs_total").increment(1);
					repaired = true;
				}
				Err(source) => return Err(RelayError::Forward { topic, source }),
			}
		}

		let topic = self.open_topic(user, &identity).await?;
		self.forward(msg, topic)
			.await
			.map_err(|source| RelayError::ForwardAfterCreate { topic, source })?;

		metrics::counter!("topicbridge_relays_total").increment(1);
		Ok(RelayOutcome::Forwarded {
			topic,
			created: true,
			repaired,
		})
	}

	/// Block check shared with the guest command path; notifies the sender when configured.
	pub async fn reject_if_blocked(&self, identity: &Identity) -> Result<Option<RelayOutcome>, RelayError> {
		if !self.gate.is_blocked(identity).await.map_err(RelayError::Store)? {
			return Ok(None);
		}
		metrics::counter!("topicbridge_relay_blocked_total").increment(1);
		let notified = self.ctx.cfg.notify_blocked && self.notify_blocked(identity).await;
		debug!(identity = %identity, notified, "dropping message from blocked identity");
		Ok(Some(RelayOutcome::Blocked { notified }))
	}

	async fn forward(&self, msg: &Message, topic: TopicId) -> Result<(), GatewayError> {
		self.ctx
			.gateway
			.forward_message(&self.ctx.cfg.group(), &ChatTarget::Id(msg.chat.id), msg.message_id, Some(topic))
			.await
			.map(|_| ())
	}

	/// Create a topic, persist the mapping, then post the intro card.
	async fn open_topic(&self, user: &User, identity: &Identity) -> Result<TopicId, RelayError> {
		let name = templates::topic_name(user);
		let created = self
			.ctx
			.gateway
			.create_topic(&self.ctx.cfg.group(), &name)
			.await
			.map_err(RelayError::CreateTopic)?;
		let topic = created.topic_id;

		self.ctx
			.store
			.put_topic(identity, topic)
			.await
			.map_err(RelayError::Store)?;
		metrics::counter!("topicbridge_topics_created_total").increment(1);
		info!(identity = %identity, topic = %topic, "opened topic");

		self.post_intro_card(user, identity, topic).await;
		Ok(topic)
	}

	async fn post_intro_card(&self, user: &User, identity: &Identity, topic: TopicId) {
		let gateway = &self.ctx.gateway;
		let group = self.ctx.cfg.group();
		let card = templates::user_card(user, Some(topic));
		let opts = SendOptions::in_thread(Some(topic))
			.html()
			.with_keyboard(templates::card_keyboard(identity));

		let photo = match gateway.latest_profile_photo(user.id).await {
			Ok(photo) => photo,
			Err(err) => {
				debug!(identity = %identity, error = %err, "profile photo lookup failed");
				None
			}
		};

		let res = match photo {
			Some(file_id) => {
				let media = OutboundMedia {
					kind: MediaKind::Photo,
					file_id,
					caption: Some(card),
				};
				gateway.send_media(&group, &media, &opts).await
			}
			None => gateway.send_text(&group, &card, &opts).await,
		};
		if let Err(err) = res {
			warn!(identity = %identity, topic = %topic, error = %err, "intro card not posted");
		}
	}

	async fn notify_blocked(&self, identity: &Identity) -> bool {
		match self
			.ctx
			.gateway
			.send_text(&ChatTarget::from(identity), templates::blocked_notice(), &SendOptions::default())
			.await
		{
			Ok(_) => true,
			Err(err) => {
				debug!(identity = %identity, error = %err, "blocked notice not delivered");
				false
			}
		}
	}
}
