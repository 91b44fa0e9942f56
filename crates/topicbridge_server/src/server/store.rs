#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;
use topicbridge_domain::{Identity, Mapping, StoreKey, TopicId};
use tracing::warn;

const TOPICS_NS: &str = "topics";
const BLOCKS_NS: &str = "blocks";

/// Durable identity -> topic mappings and block flags.
///
/// There is no reverse index: finding the owner of a topic means walking
/// `list_mappings`, which is O(n) and carries no ordering guarantee.
#[async_trait::async_trait]
pub trait MappingStore: Send + Sync {
	async fn topic_for(&self, identity: &Identity) -> anyhow::Result<Option<TopicId>>;

	/// Upsert; a concurrent writer for the same identity wins if it writes last.
	async fn put_topic(&self, identity: &Identity, topic: TopicId) -> anyhow::Result<()>;

	/// Returns whether a mapping was present.
	async fn remove_topic(&self, identity: &Identity) -> anyhow::Result<bool>;

	async fn list_mappings(&self) -> anyhow::Result<Vec<Mapping>>;

	async fn is_flagged(&self, identity: &Identity) -> anyhow::Result<bool>;

	async fn set_block_flag(&self, identity: &Identity) -> anyhow::Result<()>;

	async fn clear_block_flag(&self, identity: &Identity) -> anyhow::Result<()>;
}

fn decode_topic(key: &str, value: &str) -> Option<TopicId> {
	match value.parse::<TopicId>() {
		Ok(topic) => Some(topic),
		Err(err) => {
			warn!(key, error = %err, "skipping mapping with unreadable topic id");
			None
		}
	}
}

#[derive(Debug, Default)]
struct KvTables {
	topics: HashMap<String, String>,
	blocks: HashMap<String, String>,
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryMappingStore {
	inner: Mutex<KvTables>,
}

#[async_trait::async_trait]
impl MappingStore for InMemoryMappingStore {
	async fn topic_for(&self, identity: &Identity) -> anyhow::Result<Option<TopicId>> {
		let key = StoreKey::topic(identity);
		let guard = self.inner.lock().await;
		Ok(guard.topics.get(&key).and_then(|v| decode_topic(&key, v)))
	}

	async fn put_topic(&self, identity: &Identity, topic: TopicId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.topics.insert(StoreKey::topic(identity), topic.to_string());
		Ok(())
	}

	async fn remove_topic(&self, identity: &Identity) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		Ok(guard.topics.remove(&StoreKey::topic(identity)).is_some())
	}

	async fn list_mappings(&self) -> anyhow::Result<Vec<Mapping>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.topics
			.iter()
			.filter_map(|(k, v)| {
				let identity = Identity::new(k.clone()).ok()?;
				Some(Mapping::new(identity, decode_topic(k, v)?))
			})
			.collect())
	}

	async fn is_flagged(&self, identity: &Identity) -> anyhow::Result<bool> {
		let guard = self.inner.lock().await;
		Ok(guard.blocks.contains_key(&StoreKey::block(identity)))
	}

	async fn set_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard
			.blocks
			.insert(StoreKey::block(identity), StoreKey::BLOCK_SENTINEL.to_string());
		Ok(())
	}

	async fn clear_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.blocks.remove(&StoreKey::block(identity));
		Ok(())
	}
}

/// sqlx-backed store over a single `relay_kv(namespace, entry_key, entry_value)` table.
#[derive(Clone)]
pub struct PersistentMappingStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl PersistentMappingStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: PersistentBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	async fn get(&self, ns: &str, key: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT entry_value FROM relay_kv WHERE namespace = ? AND entry_key = ?")
					.bind(ns)
					.bind(key)
					.fetch_optional(pool)
					.await
					.context("select kv (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT entry_value FROM relay_kv WHERE namespace = $1 AND entry_key = $2")
					.bind(ns)
					.bind(key)
					.fetch_optional(pool)
					.await
					.context("select kv (postgres)")?
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query_as("SELECT entry_value FROM relay_kv WHERE namespace = ? AND entry_key = ?")
					.bind(ns)
					.bind(key)
					.fetch_optional(pool)
					.await
					.context("select kv (mysql)")?
			}
		};
		Ok(row.map(|(v,)| v))
	}

	async fn put(&self, ns: &str, key: &str, value: &str) -> anyhow::Result<()> {
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO relay_kv (namespace, entry_key, entry_value) VALUES (?, ?, ?) \
					ON CONFLICT(namespace, entry_key) DO UPDATE SET entry_value = excluded.entry_value",
				)
				.bind(ns)
				.bind(key)
				.bind(value)
				.execute(pool)
				.await
				.context("upsert kv (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO relay_kv (namespace, entry_key, entry_value) VALUES ($1, $2, $3) \
					ON CONFLICT (namespace, entry_key) DO UPDATE SET entry_value = EXCLUDED.entry_value",
				)
				.bind(ns)
				.bind(key)
				.bind(value)
				.execute(pool)
				.await
				.context("upsert kv (postgres)")?;
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO relay_kv (namespace, entry_key, entry_value) VALUES (?, ?, ?) \
					ON DUPLICATE KEY UPDATE entry_value = VALUES(entry_value)",
				)
				.bind(ns)
				.bind(key)
				.bind(value)
				.execute(pool)
				.await
				.context("upsert kv (mysql)")?;
			}
		}
		Ok(())
	}

	async fn delete(&self, ns: &str, key: &str) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query("DELETE FROM relay_kv WHERE namespace = ? AND entry_key = ?")
				.bind(ns)
				.bind(key)
				.execute(pool)
				.await
				.context("delete kv (sqlite)")?
				.rows_affected(),
			PersistentBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM relay_kv WHERE namespace = $1 AND entry_key = $2")
					.bind(ns)
					.bind(key)
					.execute(pool)
					.await
					.context("delete kv (postgres)")?
					.rows_affected()
			}
			PersistentBackend::Mysql(pool) => sqlx::query("DELETE FROM relay_kv WHERE namespace = ? AND entry_key = ?")
				.bind(ns)
				.bind(key)
				.execute(pool)
				.await
				.context("delete kv (mysql)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn list(&self, ns: &str) -> anyhow::Result<Vec<(String, String)>> {
		let rows = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as::<_, (String, String)>("SELECT entry_key, entry_value FROM relay_kv WHERE namespace = ?")
					.bind(ns)
					.fetch_all(pool)
					.await
					.context("list kv (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as::<_, (String, String)>("SELECT entry_key, entry_value FROM relay_kv WHERE namespace = $1")
					.bind(ns)
					.fetch_all(pool)
					.await
					.context("list kv (postgres)")?
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query_as::<_, (String, String)>("SELECT entry_key, entry_value FROM relay_kv WHERE namespace = ?")
					.bind(ns)
					.fetch_all(pool)
					.await
					.context("list kv (mysql)")?
			}
		};
		Ok(rows)
	}
}

#[async_trait::async_trait]
impl MappingStore for PersistentMappingStore {
	async fn topic_for(&self, identity: &Identity) -> anyhow::Result<Option<TopicId>> {
		let key = StoreKey::topic(identity);
		let value = self.get(TOPICS_NS, &key).await?;
		Ok(value.and_then(|v| decode_topic(&key, &v)))
	}

	async fn put_topic(&self, identity: &Identity, topic: TopicId) -> anyhow::Result<()> {
		self.put(TOPICS_NS, &StoreKey::topic(identity), &topic.to_string()).await
	}

	async fn remove_topic(&self, identity: &Identity) -> anyhow::Result<bool> {
		self.delete(TOPICS_NS, &StoreKey::topic(identity)).await
	}

	async fn list_mappings(&self) -> anyhow::Result<Vec<Mapping>> {
		let rows = self.list(TOPICS_NS).await?;
		Ok(rows
			.into_iter()
			.filter_map(|(k, v)| {
				let topic = decode_topic(&k, &v)?;
				let identity = Identity::new(k).ok()?;
				Some(Mapping::new(identity, topic))
			})
			.collect())
	}

	async fn is_flagged(&self, identity: &Identity) -> anyhow::Result<bool> {
		Ok(self.get(BLOCKS_NS, &StoreKey::block(identity)).await?.is_some())
	}

	async fn set_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		self.put(BLOCKS_NS, &StoreKey::block(identity), StoreKey::BLOCK_SENTINEL)
			.await
	}

	async fn clear_block_flag(&self, identity: &Identity) -> anyhow::Result<()> {
		self.delete(BLOCKS_NS, &StoreKey::block(identity)).await?;
		Ok(())
	}
}
