#![forbid(unsafe_code)]

use topicbridge_domain::Identity;
use topicbridge_platform::{CallbackQuery, ChatTarget, SendOptions};
use tracing::{debug, info, warn};

use crate::server::moderation::ModerationGate;
use crate::server::state::RelayContext;
use crate::server::templates;

pub const BLOCK_PREFIX: &str = "block_";
pub const UNBLOCK_PREFIX: &str = "unblock_";

/// Action carried by an intro card button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardAction {
	Block(Identity),
	Unblock(Identity),
}

impl CardAction {
	pub fn parse(data: &str) -> Option<Self> {
		if let Some(rest) = data.strip_prefix(UNBLOCK_PREFIX) {
			return Identity::new(rest).ok().map(Self::Unblock);
		}
		data.strip_prefix(BLOCK_PREFIX)
			.and_then(|rest| Identity::new(rest).ok())
			.map(Self::Block)
	}

	fn identity(&self) -> &Identity {
		match self {
			Self::Block(identity) | Self::Unblock(identity) => identity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
	/// Clicked by someone other than the operator.
	Denied,
	/// Unknown or malformed payload.
	Unrecognized,
	Applied { action: CardAction, changed: bool },
}

/// Handles intro card button presses.
#[derive(Clone)]
pub struct CardCallbacks {
	ctx: RelayContext,
	gate: ModerationGate,
}

impl CardCallbacks {
	pub fn new(ctx: RelayContext) -> Self {
		let gate = ModerationGate::new(ctx.store.clone());
		Self { ctx, gate }
	}

	/// Apply the button's action. The query is always answered, even on error.
	pub async fn handle(&self, query: &CallbackQuery) -> anyhow::Result<CallbackOutcome> {
		let result = self.apply(query).await;
		let answer = match &result {
			Ok(CallbackOutcome::Denied) => Some("Only the operator can do that."),
			Ok(CallbackOutcome::Unrecognized) => Some("Unknown action."),
			Ok(CallbackOutcome::Applied { action: CardAction::Block(_), .. }) => Some("User blocked."),
			Ok(CallbackOutcome::Applied { action: CardAction::Unblock(_), .. }) => Some("User unblocked."),
			Err(_) => Some("Something went wrong."),
		};
		if let Err(err) = self.ctx.gateway.answer_callback(&query.id, answer).await {
			debug!(callback = %query.id, error = %err, "callback answer failed");
		}
		result
	}

	async fn apply(&self, query: &CallbackQuery) -> anyhow::Result<CallbackOutcome> {
		if !self.ctx.cfg.is_operator(&query.from.identity()) {
			debug!(from = query.from.id, "ignoring card action from non-operator");
			return Ok(CallbackOutcome::Denied);
		}
		let Some(action) = query.data.as_deref().and_then(CardAction::parse) else {
			return Ok(CallbackOutcome::Unrecognized);
		};
		metrics::counter!("topicbridge_card_actions_total").increment(1);

		let identity = action.identity().clone();
		let (changed, blocked) = match &action {
			CardAction::Block(_) => (!self.gate.block(&identity).await?.already_blocked, true),
			CardAction::Unblock(_) => (self.gate.unblock(&identity).await?.was_blocked, false),
		};
		info!(identity = %identity, blocked, changed, "card action applied");

		if changed {
			self.post_notice(&identity, blocked).await;
		}
		self.refresh_card(query, &identity).await;

		Ok(CallbackOutcome::Applied { action, changed })
	}

	/// Best-effort; the flag change stands whatever happens here.
	async fn post_notice(&self, identity: &Identity, blocked: bool) {
		let topic = match self.ctx.store.topic_for(identity).await {
			Ok(Some(topic)) => topic,
			Ok(None) => return,
			Err(err) => {
				warn!(identity = %identity, error = %err, "topic lookup failed; block notice skipped");
				return;
			}
		};
		let opts = SendOptions::in_thread(Some(topic)).html();
		let text = templates::block_changed(identity, blocked);
		if let Err(err) = self.ctx.gateway.send_text(&self.ctx.cfg.group(), &text, &opts).await {
			warn!(identity = %identity, topic = %topic, error = %err, "block notice not posted");
		}
	}

	/// Re-apply the card keyboard so the client drops its pressed state.
	async fn refresh_card(&self, query: &CallbackQuery, identity: &Identity) {
		let Some(card) = query.message.as_deref() else {
			return;
		};
		let keyboard = templates::card_keyboard(identity);
		if let Err(err) = self
			.ctx
			.gateway
			.edit_message_markup(&ChatTarget::Id(card.chat.id), card.message_id, Some(&keyboard))
			.await
		{
			debug!(message_id = card.message_id, error = %err, "card keyboard not refreshed");
		}
	}
}
