#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Stable end-user identity handed out by the messaging network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
	/// Create a non-empty `Identity`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() != id.len() {
			return Ok(Self(trimmed.to_string()));
		}
		Ok(Self(id))
	}

	/// Identity of a numeric network user id.
	pub fn from_user_id(id: i64) -> Self {
		Self(id.to_string())
	}

	/// Numeric form, when the identity is a plain user id.
	pub fn as_user_id(&self) -> Option<i64> {
		self.0.parse().ok()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identity::new(s.to_string())
	}
}

/// Forum topic (sub-conversation) identifier inside the management group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(i64);

impl TopicId {
	/// Create a `TopicId`; thread ids are always positive.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::InvalidFormat(format!("topic id must be positive: {id}")));
		}
		Ok(Self(id))
	}

	pub fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for TopicId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for TopicId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id = s
			.parse::<i64>()
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected numeric topic id, got {s:?}")))?;
		TopicId::new(id)
	}
}

/// Durable `identity -> topic` association.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
	pub identity: Identity,
	pub topic_id: TopicId,
}

impl Mapping {
	pub fn new(identity: Identity, topic_id: TopicId) -> Self {
		Self { identity, topic_id }
	}
}

impl fmt::Display for Mapping {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}->{}", self.identity, self.topic_id)
	}
}

/// Key helpers for the mapping store schema.
///
/// Mappings live under the bare identity, block flags under `block:<identity>`.
pub struct StoreKey;

impl StoreKey {
	/// Prefix for block-flag keys.
	pub const BLOCK_PREFIX: &'static str = "block:";

	/// Sentinel value written for a present block flag.
	pub const BLOCK_SENTINEL: &'static str = "true";

	/// Key of an identity's mapping.
	pub fn topic(identity: &Identity) -> String {
		identity.as_str().to_string()
	}

	/// Key of an identity's block flag (e.g. `block:42`).
	pub fn block(identity: &Identity) -> String {
		format!("{}{}", Self::BLOCK_PREFIX, identity.as_str())
	}

	/// Parse a block-flag key back into its identity.
	pub fn parse_block(key: &str) -> Result<Identity, ParseIdError> {
		let rest = key
			.trim()
			.strip_prefix(Self::BLOCK_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected block:<identity>".into()))?;
		Identity::new(rest.to_string())
	}
}
