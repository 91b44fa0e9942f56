#![forbid(unsafe_code)]

use std::sync::Arc;

use topicbridge_domain::{Identity, TopicId};

use crate::server::store::MappingStore;

/// Topic -> owner lookup by linear scan of all mappings.
///
/// O(n) per call. When several identities claim the same topic the first one
/// in store enumeration order wins, and that order is not stable.
#[derive(Clone)]
pub struct ReverseResolver {
	store: Arc<dyn MappingStore>,
}

impl ReverseResolver {
	pub fn new(store: Arc<dyn MappingStore>) -> Self {
		Self { store }
	}

	/// `Ok(None)` means nobody currently owns the topic; that is not an error.
	pub async fn resolve(&self, topic: TopicId) -> anyhow::Result<Option<Identity>> {
		let mappings = self.store.list_mappings().await?;
		Ok(mappings.into_iter().find(|m| m.topic_id == topic).map(|m| m.identity))
	}
}
