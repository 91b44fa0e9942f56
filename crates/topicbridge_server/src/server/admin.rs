#![forbid(unsafe_code)]

use futures::StreamExt;
use thiserror::Error;
use topicbridge_domain::{Identity, TopicId};
use topicbridge_platform::{BotCommand, ChatTarget, CommandScope, CommandText, GatewayError, Message, SendOptions};
use tracing::{debug, info, warn};

use crate::server::moderation::{BlockChange, ModerationGate, UnblockChange};
use crate::server::resolver::ReverseResolver;
use crate::server::state::RelayContext;
use crate::server::templates::{self, ListEntry};

const PROBE_TEXT: &str = "topic check";

#[derive(Debug, Error)]
pub enum AdminError {
	#[error("mapping store: {0:#}")]
	Store(anyhow::Error),
}

impl From<anyhow::Error> for AdminError {
	fn from(err: anyhow::Error) -> Self {
		Self::Store(err)
	}
}

/// Tally of one `/broadcast`; the three counts always sum to the mapping count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub sent: usize,
	pub failed: usize,
	pub skipped_blocked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
	pub checked: usize,
	pub removed: usize,
	/// Dead topics whose mapping could not be removed.
	pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOutcome {
	/// Not a command this dispatcher knows.
	Ignored,
	Help,
	Blocked { identity: Identity, change: BlockChange },
	Unblocked { identity: Identity, change: UnblockChange },
	Info { identity: Identity, blocked: bool, topic: Option<TopicId> },
	Listed { users: usize },
	/// `unknown` counts mappings whose block flag could not be read.
	Status { total: usize, blocked: usize, unknown: usize },
	Broadcast(BroadcastReport),
	Cleaned(CleanReport),
	Reset { identity: Identity, existed: bool },
	/// The target topic has no owner.
	Unresolved,
	/// Bad or missing arguments; reported to the operator, nothing changed.
	UsageError(String),
}

/// Where the command was issued; answers go back there.
#[derive(Debug, Clone)]
struct Origin {
	chat: ChatTarget,
	thread: Option<TopicId>,
}

impl Origin {
	fn of(msg: &Message) -> Self {
		Self {
			chat: ChatTarget::Id(msg.chat.id),
			thread: msg.topic(),
		}
	}

	fn opts(&self) -> SendOptions {
		SendOptions::in_thread(self.thread).html()
	}
}

enum Target {
	Found(Identity),
	Unresolved,
	Missing,
}

pub fn operator_commands() -> Vec<BotCommand> {
	vec![
		BotCommand::new("help", "Show the command list"),
		BotCommand::new("block", "Block a user (id or reply)"),
		BotCommand::new("unblock", "Unblock a user (id or reply)"),
		BotCommand::new("info", "Show a user's status"),
		BotCommand::new("list", "List all users"),
		BotCommand::new("status", "Show statistics"),
		BotCommand::new("broadcast", "Send a message to every active user"),
		BotCommand::new("clean", "Drop mappings whose topic is gone"),
		BotCommand::new("reset", "Remove a user's mapping and topic"),
	]
}

pub fn guest_commands() -> Vec<BotCommand> {
	vec![BotCommand::new("start", "Start the conversation")]
}

/// Push the guest menu globally and the operator menu to the operator's chats.
pub async fn sync_command_menu(ctx: &RelayContext) -> Result<(), GatewayError> {
	ctx.gateway
		.set_command_menu(&guest_commands(), &CommandScope::Default)
		.await?;
	ctx.gateway
		.set_command_menu(
			&operator_commands(),
			&CommandScope::Chat {
				chat_id: ChatTarget::from(&ctx.cfg.operator),
			},
		)
		.await?;
	ctx.gateway
		.set_command_menu(&operator_commands(), &CommandScope::Chat { chat_id: ctx.cfg.group() })
		.await?;
	info!("command menus synced");
	Ok(())
}

#[derive(Clone)]
pub struct AdminDispatcher {
	ctx: RelayContext,
	gate: ModerationGate,
	resolver: ReverseResolver,
}

impl AdminDispatcher {
	pub fn new(ctx: RelayContext) -> Self {
		let gate = ModerationGate::new(ctx.store.clone());
		let resolver = ReverseResolver::new(ctx.store.clone());
		Self { ctx, gate, resolver }
	}

	/// Run an operator command. The caller has already checked the sender.
	pub async fn dispatch(&self, msg: &Message) -> Result<AdminOutcome, AdminError> {
		let Some(cmd) = msg.command() else {
			return Ok(AdminOutcome::Ignored);
		};
		let origin = Origin::of(msg);

		if let Err(err) = self.ctx.gateway.delete_message(&origin.chat, msg.message_id).await {
			debug!(error = %err, "could not delete command message");
		}
		metrics::counter!("topicbridge_admin_commands_total", "command" => cmd.name.to_string()).increment(1);

		match cmd.name {
			"help" => {
				self.respond(&origin, &help_text()).await;
				Ok(AdminOutcome::Help)
			}
			"block" => self.block(&cmd, msg, &origin).await,
			"unblock" => self.unblock(&cmd, msg, &origin).await,
			"info" => self.info(&cmd, msg, &origin).await,
			"list" => self.list(&origin).await,
			"status" => self.status(&origin).await,
			"broadcast" => self.broadcast(cmd.rest, &origin).await,
			"clean" => self.clean(&origin).await,
			"reset" => self.reset(&cmd, msg, &origin).await,
			other => {
				debug!(command = other, "ignoring unknown command");
				Ok(AdminOutcome::Ignored)
			}
		}
	}

	/// Explicit argument, else the replied-to message's topic, else the current topic.
	async fn target(&self, cmd: &CommandText<'_>, msg: &Message) -> anyhow::Result<Result<Target, String>> {
		if let Some(arg) = cmd.args.first() {
			return Ok(match Identity::new(*arg) {
				Ok(identity) => Ok(Target::Found(identity)),
				Err(err) => Err(format!("invalid user id {arg:?}: {err}")),
			});
		}

		let topic = msg
			.reply_to_message
			.as_deref()
			.and_then(Message::topic)
			.or_else(|| msg.topic());
		let Some(topic) = topic else {
			return Ok(Ok(Target::Missing));
		};

		Ok(Ok(match self.resolver.resolve(topic).await? {
			Some(identity) => Target::Found(identity),
			None => Target::Unresolved,
		}))
	}

	/// Resolve the target or answer the operator with why it could not be.
	async fn require_target(
		&self,
		cmd: &CommandText<'_>,
		msg: &Message,
		origin: &Origin,
	) -> Result<Result<Identity, AdminOutcome>, AdminError> {
		match self.target(cmd, msg).await? {
			Ok(Target::Found(identity)) => Ok(Ok(identity)),
			Ok(Target::Unresolved) => {
				self.respond(origin, templates::unresolved_recipient()).await;
				Ok(Err(AdminOutcome::Unresolved))
			}
			Ok(Target::Missing) => {
				let hint = format!("Usage: /{} <user id>, or reply inside a user's topic", cmd.name);
				self.respond(origin, &templates::usage(&hint)).await;
				Ok(Err(AdminOutcome::UsageError(hint)))
			}
			Err(hint) => {
				self.respond(origin, &templates::usage(&hint)).await;
				Ok(Err(AdminOutcome::UsageError(hint)))
			}
		}
	}

	async fn block(&self, cmd: &CommandText<'_>, msg: &Message, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let identity = match self.require_target(cmd, msg, origin).await? {
			Ok(identity) => identity,
			Err(outcome) => return Ok(outcome),
		};
		let change = self.gate.block(&identity).await?;
		let text = if change.already_blocked {
			templates::block_unchanged(&identity, true)
		} else {
			templates::block_changed(&identity, true)
		};
		self.respond(origin, &text).await;
		Ok(AdminOutcome::Blocked { identity, change })
	}

	async fn unblock(&self, cmd: &CommandText<'_>, msg: &Message, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let identity = match self.require_target(cmd, msg, origin).await? {
			Ok(identity) => identity,
			Err(outcome) => return Ok(outcome),
		};
		let change = self.gate.unblock(&identity).await?;
		let text = if change.was_blocked {
			templates::block_changed(&identity, false)
		} else {
			templates::block_unchanged(&identity, false)
		};
		self.respond(origin, &text).await;
		Ok(AdminOutcome::Unblocked { identity, change })
	}

	async fn info(&self, cmd: &CommandText<'_>, msg: &Message, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let identity = match self.require_target(cmd, msg, origin).await? {
			Ok(identity) => identity,
			Err(outcome) => return Ok(outcome),
		};
		let blocked = self.gate.is_blocked(&identity).await?;
		let topic = self.ctx.store.topic_for(&identity).await?;
		self.respond(origin, &templates::user_status(&identity, blocked, topic))
			.await;
		Ok(AdminOutcome::Info {
			identity,
			blocked,
			topic,
		})
	}

	/// Full O(n) scan with one flag read per mapping; no pagination.
	/// A failed flag read marks that entry unknown instead of failing the listing.
	async fn classified(&self) -> Result<Vec<ListEntry>, AdminError> {
		let mappings = self.ctx.store.list_mappings().await?;
		let mut entries = Vec::with_capacity(mappings.len());
		for m in mappings {
			let blocked = match self.gate.is_blocked(&m.identity).await {
				Ok(blocked) => Some(blocked),
				Err(err) => {
					warn!(identity = %m.identity, error = %err, "block check failed; listing as unknown");
					None
				}
			};
			entries.push(ListEntry {
				identity: m.identity,
				topic: m.topic_id,
				blocked,
			});
		}
		Ok(entries)
	}

	async fn list(&self, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let entries = self.classified().await?;
		self.respond(origin, &templates::user_list(&entries)).await;
		Ok(AdminOutcome::Listed { users: entries.len() })
	}

	async fn status(&self, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let entries = self.classified().await?;
		let total = entries.len();
		let blocked = entries.iter().filter(|e| e.blocked == Some(true)).count();
		let unknown = entries.iter().filter(|e| e.blocked.is_none()).count();
		self.respond(origin, &templates::stats(total, blocked, unknown)).await;
		Ok(AdminOutcome::Status { total, blocked, unknown })
	}

	async fn broadcast(&self, text: &str, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let text = text.trim();
		if text.is_empty() {
			let hint = "Usage: /broadcast <message>".to_string();
			self.respond(origin, &templates::usage(&hint)).await;
			return Ok(AdminOutcome::UsageError(hint));
		}

		let mappings = self.ctx.store.list_mappings().await?;
		let mut report = BroadcastReport::default();
		let mut recipients = Vec::with_capacity(mappings.len());
		for m in mappings {
			match self.gate.is_blocked(&m.identity).await {
				Ok(true) => report.skipped_blocked += 1,
				Ok(false) => recipients.push(m.identity),
				Err(err) => {
					warn!(identity = %m.identity, error = %err, "block check failed; counting as failed");
					report.failed += 1;
				}
			}
		}

		let progress = match self
			.ctx
			.gateway
			.send_text(&origin.chat, &templates::broadcast_progress(recipients.len()), &origin.opts())
			.await
		{
			Ok(sent) => Some(sent.message_id),
			Err(err) => {
				warn!(error = %err, "broadcast progress message not posted");
				None
			}
		};

		let gateway = &self.ctx.gateway;
		let plain = SendOptions::default();
		let mut sends = futures::stream::iter(recipients)
			.map(|identity| {
				let plain = &plain;
				async move {
					let res = gateway.send_text(&ChatTarget::from(&identity), text, plain).await;
					(identity, res)
				}
			})
			.buffer_unordered(self.ctx.cfg.broadcast_concurrency);

		while let Some((identity, res)) = sends.next().await {
			match res {
				Ok(_) => report.sent += 1,
				Err(err) => {
					debug!(identity = %identity, error = %err, "broadcast delivery failed");
					report.failed += 1;
				}
			}
		}

		metrics::counter!("topicbridge_broadcast_sent_total").increment(report.sent as u64);
		metrics::counter!("topicbridge_broadcast_failed_total").increment(report.failed as u64);
		info!(
			sent = report.sent,
			failed = report.failed,
			skipped_blocked = report.skipped_blocked,
			"broadcast finished"
		);

		let summary = templates::broadcast_done(report.sent, report.failed, report.skipped_blocked);
		let edited = match progress {
			Some(message_id) => self
				.ctx
				.gateway
				.edit_message_text(&origin.chat, message_id, &summary, &SendOptions::default().html())
				.await
				.map_err(|err| debug!(error = %err, "progress edit failed; posting summary instead"))
				.is_ok(),
			None => false,
		};
		if !edited {
			self.respond(origin, &summary).await;
		}

		Ok(AdminOutcome::Broadcast(report))
	}

	/// Probe every topic; drop mappings whose topic is gone.
	async fn clean(&self, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let mappings = self.ctx.store.list_mappings().await?;
		let group = self.ctx.cfg.group();
		let mut report = CleanReport::default();

		for m in mappings {
			report.checked += 1;
			let probe = self
				.ctx
				.gateway
				.send_text(&group, PROBE_TEXT, &SendOptions::in_thread(Some(m.topic_id)))
				.await;
			match probe {
				Ok(sent) => {
					if let Err(err) = self.ctx.gateway.delete_message(&group, sent.message_id).await {
						debug!(topic = %m.topic_id, error = %err, "probe not deleted");
					}
				}
				Err(err) if err.is_stale_topic() => match self.ctx.store.remove_topic(&m.identity).await {
					Ok(removed) => {
						if removed {
							report.removed += 1;
						}
						info!(identity = %m.identity, topic = %m.topic_id, "removed mapping to missing topic");
					}
					Err(err) => {
						warn!(identity = %m.identity, topic = %m.topic_id, error = %err, "dead topic mapping not removed");
						report.failed += 1;
					}
				},
				Err(err) => {
					warn!(identity = %m.identity, topic = %m.topic_id, error = %err, "probe failed; keeping mapping");
				}
			}
		}

		self.respond(origin, &templates::clean_done(&report))
			.await;
		Ok(AdminOutcome::Cleaned(report))
	}

	/// Remove the mapping, then delete the topic best-effort.
	async fn reset(&self, cmd: &CommandText<'_>, msg: &Message, origin: &Origin) -> Result<AdminOutcome, AdminError> {
		let identity = match self.require_target(cmd, msg, origin).await? {
			Ok(identity) => identity,
			Err(outcome) => return Ok(outcome),
		};

		let topic = self.ctx.store.topic_for(&identity).await?;
		let existed = self.ctx.store.remove_topic(&identity).await?;

		let mut reply_to = origin.clone();
		if let Some(topic) = topic {
			if let Err(err) = self.ctx.gateway.delete_topic(&self.ctx.cfg.group(), topic).await {
				warn!(identity = %identity, topic = %topic, error = %err, "topic not deleted");
			}
			// The originating topic may be the one just deleted.
			if origin.thread == Some(topic) {
				reply_to.thread = None;
			}
		}
		info!(identity = %identity, existed, "mapping reset");

		self.respond(&reply_to, &templates::reset_done(&identity, existed)).await;
		Ok(AdminOutcome::Reset { identity, existed })
	}

	async fn respond(&self, origin: &Origin, text: &str) {
		if let Err(err) = self.ctx.gateway.send_text(&origin.chat, text, &origin.opts()).await {
			warn!(error = %err, "failed to answer operator command");
		}
	}
}

fn help_text() -> String {
	let lines = operator_commands()
		.iter()
		.map(|c| format!("/{} - {}", c.command, templates::escape_html(&c.description)))
		.collect::<Vec<_>>()
		.join("\n");
	format!("<b>Operator commands</b>\n━━━━━━━━━━━━━━━━\n{lines}")
}
