#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use topicbridge_domain::Identity;
use topicbridge_platform::{ChatTarget, MessagingGateway};

use crate::config::ServerConfig;
use crate::server::store::MappingStore;

/// Immutable relay settings, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
	pub operator: Identity,
	pub group_id: i64,
	pub notify_blocked: bool,
	pub broadcast_concurrency: usize,
}

impl RelayConfig {
	pub fn from_settings(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let operator = cfg
			.relay
			.operator_id
			.as_deref()
			.ok_or_else(|| anyhow!("relay.operator_id is required (or TOPICBRIDGE_OPERATOR_ID)"))?;
		let operator = Identity::new(operator).map_err(|e| anyhow!("relay.operator_id: {e}"))?;

		let group_id = cfg
			.relay
			.group_id
			.ok_or_else(|| anyhow!("relay.group_id is required (or TOPICBRIDGE_GROUP_ID)"))?;

		Ok(Self {
			operator,
			group_id,
			notify_blocked: cfg.relay.notify_blocked,
			broadcast_concurrency: cfg.relay.broadcast_concurrency.max(1),
		})
	}

	pub fn group(&self) -> ChatTarget {
		ChatTarget::Id(self.group_id)
	}

	pub fn is_operator(&self, identity: &Identity) -> bool {
		&self.operator == identity
	}
}

/// Everything one unit of update handling needs.
///
/// Cloning is cheap; there is no other shared mutable state.
#[derive(Clone)]
pub struct RelayContext {
	pub cfg: Arc<RelayConfig>,
	pub store: Arc<dyn MappingStore>,
	pub gateway: Arc<dyn MessagingGateway>,
}

impl RelayContext {
	pub fn new(cfg: RelayConfig, store: Arc<dyn MappingStore>, gateway: Arc<dyn MessagingGateway>) -> Self {
		Self {
			cfg: Arc::new(cfg),
			store,
			gateway,
		}
	}
}
