#![forbid(unsafe_code)]

//! Operator- and user-facing texts. All output is HTML parse mode.

use topicbridge_domain::{Identity, TopicId};
use topicbridge_platform::{InlineButton, InlineKeyboard, RecipientHint, User};

use crate::server::admin::CleanReport;

const RULE: &str = "━━━━━━━━━━━━━━━━";

/// Bot API limit for forum topic names, in characters.
pub const TOPIC_NAME_MAX_CHARS: usize = 128;

const UNNAMED_USER: &str = "Anonymous";

pub fn escape_html(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		match c {
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'&' => out.push_str("&amp;"),
			'"' => out.push_str("&quot;"),
			_ => out.push(c),
		}
	}
	out
}

fn now_stamp() -> String {
	chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// `"<name> (<identity>)"`, clipped to the topic name limit.
pub fn topic_name(user: &User) -> String {
	let name = user.display_name().unwrap_or_else(|| UNNAMED_USER.to_string());
	let full = format!("{name} ({})", user.id);
	if full.chars().count() <= TOPIC_NAME_MAX_CHARS {
		return full;
	}

	// Keep the identity suffix intact; clip the name part.
	let suffix = format!(" ({})", user.id);
	let room = TOPIC_NAME_MAX_CHARS.saturating_sub(suffix.chars().count() + 1);
	let clipped: String = name.chars().take(room).collect();
	format!("{clipped}…{suffix}")
}

pub fn user_card(user: &User, topic: Option<TopicId>) -> String {
	let username = user
		.username
		.as_deref()
		.map(|u| format!("@{}", escape_html(u)))
		.unwrap_or_else(|| "not set".to_string());
	let name = user.display_name().map(|n| escape_html(&n)).unwrap_or_default();
	let topic = topic.map(|t| t.to_string()).unwrap_or_else(|| "not created".to_string());
	format!(
		"<b>User info</b>\n{RULE}\nID: <code>{}</code>\nUsername: {username}\nName: {name}\nTopic: {topic}",
		user.id
	)
}

/// Profile link plus block/unblock actions bound to `identity`.
pub fn card_keyboard(identity: &Identity) -> InlineKeyboard {
	InlineKeyboard::new(vec![
		vec![InlineButton::url("👤 View profile", format!("tg://user?id={identity}"))],
		vec![
			InlineButton::callback("🚫 Block", format!("{}{identity}", crate::server::callbacks::BLOCK_PREFIX)),
			InlineButton::callback("✅ Unblock", format!("{}{identity}", crate::server::callbacks::UNBLOCK_PREFIX)),
		],
	])
}

pub fn welcome(identity: &Identity) -> String {
	format!(
		"<b>Welcome!</b>\n{RULE}\nYour user ID: <code>{}</code>\n\n\
		Send me anything and it will be passed on to the operator, who will reply here as soon as possible.\n\n\
		Please be polite and do not spam. Text, photos, files and other message types are all supported.",
		escape_html(identity.as_str())
	)
}

pub fn blocked_notice() -> &'static str {
	"You have been blocked by the operator. Your message was not delivered."
}

pub fn block_changed(identity: &Identity, blocked: bool) -> String {
	let id = escape_html(identity.as_str());
	if blocked {
		format!("🚫 User <code>{id}</code> has been blocked and can no longer send messages.")
	} else {
		format!("✅ User <code>{id}</code> has been unblocked and can send messages again.")
	}
}

pub fn block_unchanged(identity: &Identity, blocked: bool) -> String {
	let id = escape_html(identity.as_str());
	if blocked {
		format!("User <code>{id}</code> is already blocked.")
	} else {
		format!("User <code>{id}</code> is not blocked.")
	}
}

fn status_label(blocked: Option<bool>) -> &'static str {
	match blocked {
		Some(true) => "🚫 blocked",
		Some(false) => "✅ active",
		None => "❔ unknown",
	}
}

pub fn user_status(identity: &Identity, blocked: bool, topic: Option<TopicId>) -> String {
	let topic = topic.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string());
	format!(
		"<b>User status</b>\n{RULE}\nID: <code>{}</code>\nTopic: {topic}\nStatus: {}",
		escape_html(identity.as_str()),
		status_label(Some(blocked))
	)
}

/// One row of `/list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
	pub identity: Identity,
	pub topic: TopicId,
	/// `None` when the flag could not be read.
	pub blocked: Option<bool>,
}

pub fn user_list(entries: &[ListEntry]) -> String {
	let mut out = format!("<b>Users</b>\n{RULE}\n");
	for e in entries {
		out.push_str(&format!(
			"ID: <code>{}</code>\nTopic: {}\nStatus: {}\n\n",
			escape_html(e.identity.as_str()),
			e.topic,
			status_label(e.blocked)
		));
	}
	out.push_str(&format!("Total: {} users", entries.len()));
	out
}

pub fn stats(total: usize, blocked: usize, unknown: usize) -> String {
	let mut out = format!(
		"<b>Statistics</b>\n{RULE}\nTotal users: {total}\nBlocked: {blocked}\nActive: {}",
		total.saturating_sub(blocked + unknown)
	);
	if unknown > 0 {
		out.push_str(&format!("\nUnknown: {unknown}"));
	}
	out
}

pub fn clean_done(report: &CleanReport) -> String {
	let mut out = format!(
		"Cleanup finished: {} of {} topics were gone and their mappings removed.",
		report.removed, report.checked
	);
	if report.failed > 0 {
		out.push_str(&format!(" {} could not be removed.", report.failed));
	}
	out
}

pub fn reset_done(identity: &Identity, existed: bool) -> String {
	let id = escape_html(identity.as_str());
	if existed {
		format!("Mapping for <code>{id}</code> removed; their next message opens a new topic.")
	} else {
		format!("User <code>{id}</code> had no mapping.")
	}
}

pub fn broadcast_progress(recipients: usize) -> String {
	format!("📣 Broadcasting to {recipients} users…")
}

pub fn broadcast_done(sent: usize, failed: usize, skipped_blocked: usize) -> String {
	format!("<b>Broadcast finished</b>\n{RULE}\nSent: {sent}\nFailed: {failed}\nSkipped (blocked): {skipped_blocked}")
}

pub fn usage(hint: &str) -> String {
	format!("⚠️ {}", escape_html(hint))
}

pub fn unresolved_recipient() -> &'static str {
	"⚠️ Cannot determine the recipient of this topic."
}

pub fn delivery_failed(hint: RecipientHint, description: &str) -> String {
	match hint {
		RecipientHint::BotBlocked => "❌ Not delivered: the user has blocked the bot.".to_string(),
		RecipientHint::RecipientNotFound => "❌ Not delivered: the user could not be found.".to_string(),
		RecipientHint::Other => format!("❌ Not delivered: {}", escape_html(description)),
	}
}

pub fn failure(title: &str, error: &str) -> String {
	format!(
		"<b>{}</b>\n{RULE}\nError: {}\nTime: {}",
		escape_html(title),
		escape_html(error),
		now_stamp()
	)
}
