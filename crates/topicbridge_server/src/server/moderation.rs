#![forbid(unsafe_code)]

use std::sync::Arc;

use topicbridge_domain::Identity;
use tracing::info;

use crate::server::store::MappingStore;

/// Result of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChange {
	/// The flag was already set; callers must not notify again.
	pub already_blocked: bool,
}

/// Result of an unblock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnblockChange {
	pub was_blocked: bool,
}

/// Block-list gate over the mapping store.
///
/// Every call reads the store; nothing is cached between calls. Mappings are
/// never touched here.
#[derive(Clone)]
pub struct ModerationGate {
	store: Arc<dyn MappingStore>,
}

impl ModerationGate {
	pub fn new(store: Arc<dyn MappingStore>) -> Self {
		Self { store }
	}

	pub async fn is_blocked(&self, identity: &Identity) -> anyhow::Result<bool> {
		self.store.is_flagged(identity).await
	}

	pub async fn block(&self, identity: &Identity) -> anyhow::Result<BlockChange> {
		if self.store.is_flagged(identity).await? {
			return Ok(BlockChange { already_blocked: true });
		}
		self.store.set_block_flag(identity).await?;
		metrics::counter!("topicbridge_blocks_total").increment(1);
		info!(identity = %identity, "identity blocked");
		Ok(BlockChange { already_blocked: false })
	}

	pub async fn unblock(&self, identity: &Identity) -> anyhow::Result<UnblockChange> {
		if !self.store.is_flagged(identity).await? {
			return Ok(UnblockChange { was_blocked: false });
		}
		self.store.clear_block_flag(identity).await?;
		metrics::counter!("topicbridge_unblocks_total").increment(1);
		info!(identity = %identity, "identity unblocked");
		Ok(UnblockChange { was_blocked: true })
	}
}
