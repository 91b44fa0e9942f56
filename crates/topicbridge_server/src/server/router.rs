#![forbid(unsafe_code)]

use topicbridge_domain::Identity;
use topicbridge_platform::{CallbackQuery, ChatKind, ChatTarget, InboundEvent, Message, SendOptions};
use tracing::{debug, warn};

use crate::server::admin::{AdminDispatcher, AdminOutcome};
use crate::server::callbacks::{CallbackOutcome, CardCallbacks};
use crate::server::relay::{RelayEngine, RelayOutcome};
use crate::server::reply::{OperatorReply, ReplyOutcome};
use crate::server::state::RelayContext;
use crate::server::templates;

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
	Relayed(RelayOutcome),
	Replied(ReplyOutcome),
	Admin(AdminOutcome),
	Card(CallbackOutcome),
	Welcomed,
	Ignored,
	/// Handling failed; the operator was told (best-effort).
	Failed,
}

impl RouteOutcome {
	fn label(&self) -> &'static str {
		match self {
			Self::Relayed(_) => "relayed",
			Self::Replied(_) => "replied",
			Self::Admin(_) => "admin",
			Self::Card(_) => "card",
			Self::Welcomed => "welcomed",
			Self::Ignored => "ignored",
			Self::Failed => "failed",
		}
	}
}

/// Dispatches inbound events to the relay, reply, admin and callback handlers.
///
/// Each event is an independent unit of work; the router keeps no state of its own.
#[derive(Clone)]
pub struct UpdateRouter {
	ctx: RelayContext,
	relay: RelayEngine,
	reply: OperatorReply,
	admin: AdminDispatcher,
	callbacks: CardCallbacks,
}

impl UpdateRouter {
	pub fn new(ctx: RelayContext) -> Self {
		Self {
			relay: RelayEngine::new(ctx.clone()),
			reply: OperatorReply::new(ctx.clone()),
			admin: AdminDispatcher::new(ctx.clone()),
			callbacks: CardCallbacks::new(ctx.clone()),
			ctx,
		}
	}

	pub async fn route(&self, event: InboundEvent) -> RouteOutcome {
		let outcome = match event {
			InboundEvent::Message(msg) => self.route_message(&msg).await,
			InboundEvent::CallbackQuery(query) => self.route_callback(&query).await,
		};
		metrics::counter!("topicbridge_updates_total", "route" => outcome.label()).increment(1);
		debug!(route = outcome.label(), "event handled");
		outcome
	}

	async fn route_message(&self, msg: &Message) -> RouteOutcome {
		let Some(sender) = msg.sender_identity() else {
			return RouteOutcome::Ignored;
		};
		let from_operator = self.ctx.cfg.is_operator(&sender);

		if msg.is_private() {
			if from_operator && msg.is_command() {
				return self.admin(msg).await;
			}
			// Operator replies in the private chat carry no topic context.
			if from_operator && msg.reply_to_message.is_some() {
				return RouteOutcome::Ignored;
			}
			return self.guest(msg, &sender).await;
		}

		let in_group = matches!(msg.chat.kind, ChatKind::Group | ChatKind::Supergroup)
			&& msg.chat.id == self.ctx.cfg.group_id;
		if !in_group || !from_operator {
			return RouteOutcome::Ignored;
		}

		if msg.is_command() {
			return self.admin(msg).await;
		}
		let Some(topic) = msg.topic() else {
			return RouteOutcome::Ignored;
		};
		match self.reply.relay(msg, topic).await {
			Ok(outcome) => RouteOutcome::Replied(outcome),
			Err(err) => {
				self.report_failure("Reply failed", &format!("{err:#}")).await;
				RouteOutcome::Failed
			}
		}
	}

	/// Private chat of anyone but an operator command.
	async fn guest(&self, msg: &Message, sender: &Identity) -> RouteOutcome {
		let Some(cmd) = msg.command() else {
			return match self.relay.relay_user_message(msg).await {
				Ok(outcome) => RouteOutcome::Relayed(outcome),
				Err(err) => {
					warn!(chat = msg.chat.id, error = %err, "relay failed");
					self.report_failure("Relay failed", &err.to_string()).await;
					RouteOutcome::Failed
				}
			};
		};

		match self.relay.reject_if_blocked(sender).await {
			Ok(Some(rejected)) => return RouteOutcome::Relayed(rejected),
			Ok(None) => {}
			Err(err) => {
				self.report_failure("Relay failed", &err.to_string()).await;
				return RouteOutcome::Failed;
			}
		}

		if cmd.name != "start" {
			debug!(command = cmd.name, "ignoring guest command");
			return RouteOutcome::Ignored;
		}
		let opts = SendOptions::default().html();
		if let Err(err) = self
			.ctx
			.gateway
			.send_text(&ChatTarget::Id(msg.chat.id), &templates::welcome(sender), &opts)
			.await
		{
			warn!(identity = %sender, error = %err, "welcome not delivered");
		}
		RouteOutcome::Welcomed
	}

	async fn admin(&self, msg: &Message) -> RouteOutcome {
		match self.admin.dispatch(msg).await {
			Ok(outcome) => RouteOutcome::Admin(outcome),
			Err(err) => {
				warn!(error = %err, "admin command failed");
				self.report_failure("Command failed", &err.to_string()).await;
				RouteOutcome::Failed
			}
		}
	}

	async fn route_callback(&self, query: &CallbackQuery) -> RouteOutcome {
		match self.callbacks.handle(query).await {
			Ok(outcome) => RouteOutcome::Card(outcome),
			Err(err) => {
				warn!(callback = %query.id, error = %err, "card action failed");
				self.report_failure("Card action failed", &format!("{err:#}")).await;
				RouteOutcome::Failed
			}
		}
	}

	async fn report_failure(&self, title: &str, error: &str) {
		let text = templates::failure(title, error);
		if let Err(err) = self
			.ctx
			.gateway
			.send_text(&self.ctx.cfg.group(), &text, &SendOptions::default().html())
			.await
		{
			warn!(error = %err, "failure report not delivered");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use serde_json::json;

	use super::*;
	use crate::server::store::MappingStore;
	use crate::server::testkit::{GROUP_ID, Harness, OPERATOR_ID, identity, message, operator_group_message, private_text, topic};

	fn event(msg: Message) -> InboundEvent {
		InboundEvent::Message(Box::new(msg))
	}

	fn operator_private(extra: serde_json::Value) -> Message {
		let mut base = json!({
			"message_id": 3,
			"chat": {"id": OPERATOR_ID, "type": "private"},
			"from": {"id": OPERATOR_ID, "is_bot": false, "first_name": "Op"},
		});
		if let (Some(obj), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
			obj.extend(extra.clone());
		}
		message(base)
	}

	#[tokio::test]
	async fn private_text_is_relayed() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());
		let outcome = router.route(event(private_text(42, 1, "hi"))).await;
		assert!(matches!(outcome, RouteOutcome::Relayed(RelayOutcome::Forwarded { created: true, .. })));
	}

	#[tokio::test]
	async fn start_welcomes_without_opening_a_topic() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());

		assert_eq!(router.route(event(private_text(42, 1, "/start"))).await, RouteOutcome::Welcomed);
		let texts = h.gateway.texts_to(&ChatTarget::Id(42));
		assert_eq!(texts.len(), 1);
		assert!(texts[0].contains("<code>42</code>"));
		assert_eq!(h.gateway.created_topics(), 0);
		assert!(h.store.list_mappings().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn blocked_guest_gets_notice_instead_of_welcome() {
		let h = Harness::new();
		h.store.set_block_flag(&identity(42)).await.unwrap();
		let router = UpdateRouter::new(h.ctx.clone());

		let outcome = router.route(event(private_text(42, 1, "/start"))).await;
		assert_eq!(outcome, RouteOutcome::Relayed(RelayOutcome::Blocked { notified: true }));
		assert_eq!(
			h.gateway.texts_to(&ChatTarget::Id(42)),
			vec![templates::blocked_notice().to_string()]
		);
	}

	#[tokio::test]
	async fn other_guest_commands_are_ignored() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());
		assert_eq!(router.route(event(private_text(42, 1, "/block 7"))).await, RouteOutcome::Ignored);
		assert!(h.gateway.calls().is_empty());
	}

	#[tokio::test]
	async fn operator_private_command_reaches_dispatcher() {
		let h = Harness::new();
		h.store.put_topic(&identity(42), topic(20)).await.unwrap();
		let router = UpdateRouter::new(h.ctx.clone());

		let outcome = router.route(event(operator_private(json!({"text": "/status"})))).await;
		assert_eq!(outcome, RouteOutcome::Admin(AdminOutcome::Status { total: 1, blocked: 0, unknown: 0 }));
		assert_eq!(h.gateway.texts_to(&ChatTarget::Id(OPERATOR_ID)).len(), 1);
	}

	#[tokio::test]
	async fn operator_private_reply_is_ignored() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());
		let msg = operator_private(json!({
			"text": "thanks",
			"reply_to_message": {"message_id": 2, "chat": {"id": OPERATOR_ID, "type": "private"}}
		}));
		assert_eq!(router.route(event(msg)).await, RouteOutcome::Ignored);
		assert!(h.gateway.calls().is_empty());
	}

	#[tokio::test]
	async fn operator_topic_message_is_replied() {
		let h = Harness::new();
		h.store.put_topic(&identity(42), topic(20)).await.unwrap();
		let router = UpdateRouter::new(h.ctx.clone());

		let outcome = router
			.route(event(operator_group_message(Some(20), json!({"text": "hello"}))))
			.await;
		assert_eq!(
			outcome,
			RouteOutcome::Replied(ReplyOutcome::Delivered { identity: identity(42) })
		);
	}

	#[tokio::test]
	async fn operator_group_command_uses_thread_context() {
		let h = Harness::new();
		h.store.put_topic(&identity(42), topic(20)).await.unwrap();
		let router = UpdateRouter::new(h.ctx.clone());

		let outcome = router
			.route(event(operator_group_message(Some(20), json!({"text": "/block"}))))
			.await;
		assert!(matches!(outcome, RouteOutcome::Admin(AdminOutcome::Blocked { ref identity, .. }) if *identity == crate::server::testkit::identity(42)));
	}

	#[tokio::test]
	async fn general_chatter_and_strangers_are_ignored() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());

		let general = operator_group_message(None, json!({"text": "note to self"}));
		assert_eq!(router.route(event(general)).await, RouteOutcome::Ignored);

		// A reply in General carries the replied-to id as its thread id.
		let general_reply = operator_group_message(None, json!({"text": "noted", "message_thread_id": 20}));
		assert_eq!(router.route(event(general_reply)).await, RouteOutcome::Ignored);

		let stranger = operator_group_message(
			Some(20),
			json!({"text": "hi", "from": {"id": 555, "is_bot": false, "first_name": "Eve"}}),
		);
		assert_eq!(router.route(event(stranger)).await, RouteOutcome::Ignored);

		let other_group = operator_group_message(Some(20), json!({"text": "hi", "chat": {"id": -1, "type": "supergroup"}}));
		assert_eq!(router.route(event(other_group)).await, RouteOutcome::Ignored);
		assert!(h.gateway.calls().is_empty());
	}

	#[tokio::test]
	async fn relay_failure_is_reported_to_group() {
		let h = Harness::new();
		h.gateway.fail_create.store(true, Ordering::SeqCst);
		let router = UpdateRouter::new(h.ctx.clone());

		assert_eq!(router.route(event(private_text(42, 1, "hi"))).await, RouteOutcome::Failed);
		let reports = h.gateway.texts_to(&ChatTarget::Id(GROUP_ID));
		assert_eq!(reports.len(), 1);
		assert!(reports[0].contains("Relay failed"));
		assert!(reports[0].contains("topic creation failed"));
	}

	#[tokio::test]
	async fn callback_queries_reach_card_handler() {
		let h = Harness::new();
		let router = UpdateRouter::new(h.ctx.clone());
		let query: CallbackQuery = serde_json::from_value(json!({
			"id": "cb",
			"from": {"id": OPERATOR_ID, "is_bot": false, "first_name": "Op"},
			"data": "block_42"
		}))
		.unwrap();

		let outcome = router.route(InboundEvent::CallbackQuery(Box::new(query))).await;
		assert!(matches!(outcome, RouteOutcome::Card(CallbackOutcome::Applied { changed: true, .. })));
		assert!(h.store.is_flagged(&identity(42)).await.unwrap());
	}
}
