#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use topicbridge_platform::SecretString;
use tracing::{info, warn};

pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";
pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 8;

/// Default config path: `~/.topicbridge/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".topicbridge").join("config.toml"))
}

/// Load the config from TOML at `path` and apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub bot: BotSettings,
	pub relay: RelaySettings,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Bot API credentials and client behaviour.
#[derive(Debug, Clone)]
pub struct BotSettings {
	pub token: Option<SecretString>,
	pub api_base_url: String,
	/// Expected `X-Telegram-Bot-Api-Secret-Token` on webhook calls.
	pub webhook_secret: Option<SecretString>,
	pub request_timeout: Duration,
	/// Push the command menu once at startup.
	pub sync_commands_on_start: bool,
}

impl Default for BotSettings {
	fn default() -> Self {
		Self {
			token: None,
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			webhook_secret: None,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			sync_commands_on_start: true,
		}
	}
}

/// Relay identities and moderation behaviour.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	/// Operator user id (the only identity allowed to manage).
	pub operator_id: Option<String>,
	/// Management supergroup id (forum enabled).
	pub group_id: Option<i64>,
	/// Tell blocked users their message was not delivered.
	pub notify_blocked: bool,
	/// Max in-flight sends during `/broadcast`.
	pub broadcast_concurrency: usize,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			operator_id: None,
			group_id: None,
			notify_blocked: true,
			broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub webhook_path: String,
	/// Public base URL used when registering the webhook.
	pub public_url: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
			public_url: None,
			metrics_bind: None,
			health_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres:, mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	bot: FileBotSettings,

	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	token: Option<String>,
	api_base_url: Option<String>,
	webhook_secret: Option<String>,
	request_timeout_ms: Option<u64>,
	sync_commands_on_start: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	operator_id: Option<FileId>,
	group_id: Option<i64>,
	notify_blocked: Option<bool>,
	broadcast_concurrency: Option<usize>,
}

/// Ids are accepted both as TOML integers and strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FileId {
	Int(i64),
	Str(String),
}

impl FileId {
	fn into_string(self) -> String {
		match self {
			Self::Int(v) => v.to_string(),
			Self::Str(s) => s,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	webhook_path: Option<String>,
	public_url: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn normalize_webhook_path(path: &str) -> String {
	let path = path.trim();
	if path.is_empty() {
		DEFAULT_WEBHOOK_PATH.to_string()
	} else if path.starts_with('/') {
		path.to_string()
	} else {
		format!("/{path}")
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let bot = BotSettings {
			token: non_empty(file.bot.token).map(SecretString::new),
			api_base_url: non_empty(file.bot.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
			webhook_secret: non_empty(file.bot.webhook_secret).map(SecretString::new),
			request_timeout: file
				.bot
				.request_timeout_ms
				.filter(|ms| *ms > 0)
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
			sync_commands_on_start: file.bot.sync_commands_on_start.unwrap_or(true),
		};

		let relay = RelaySettings {
			operator_id: non_empty(file.relay.operator_id.map(FileId::into_string)),
			group_id: file.relay.group_id,
			notify_blocked: file.relay.notify_blocked.unwrap_or(true),
			broadcast_concurrency: file
				.relay
				.broadcast_concurrency
				.filter(|n| *n > 0)
				.unwrap_or(DEFAULT_BROADCAST_CONCURRENCY),
		};

		Self {
			bot,
			relay,
			server: ServerSettings {
				webhook_path: file
					.server
					.webhook_path
					.as_deref()
					.map(normalize_webhook_path)
					.unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string()),
				public_url: non_empty(file.server.public_url),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("TOPICBRIDGE_BOT_TOKEN") {
		cfg.bot.token = Some(SecretString::new(v));
		info!("bot config: token overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_BOT_API_BASE_URL") {
		cfg.bot.api_base_url = v;
		info!("bot config: api_base_url overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_WEBHOOK_SECRET") {
		cfg.bot.webhook_secret = Some(SecretString::new(v));
		info!("bot config: webhook_secret overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_SYNC_COMMANDS")
		&& let Some(sync) = parse_env_bool(&v)
	{
		cfg.bot.sync_commands_on_start = sync;
		info!(sync, "bot config: sync_commands_on_start overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_OPERATOR_ID") {
		cfg.relay.operator_id = Some(v);
		info!("relay config: operator_id overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_GROUP_ID") {
		match v.parse::<i64>() {
			Ok(id) => {
				cfg.relay.group_id = Some(id);
				info!("relay config: group_id overridden by env");
			}
			Err(_) => warn!("relay config: ignoring non-numeric TOPICBRIDGE_GROUP_ID"),
		}
	}

	if let Some(v) = var("TOPICBRIDGE_NOTIFY_BLOCKED")
		&& let Some(notify) = parse_env_bool(&v)
	{
		cfg.relay.notify_blocked = notify;
		info!(notify, "relay config: notify_blocked overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_PUBLIC_URL") {
		cfg.server.public_url = Some(v);
		info!("server config: public_url overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("TOPICBRIDGE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.bot.webhook_secret.is_none() {
		warn!("bot config: no webhook_secret configured; webhook requests are not authenticated");
	}
}
