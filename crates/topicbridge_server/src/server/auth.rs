#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use topicbridge_platform::SecretString;

/// Header the Bot API sets on webhook deliveries when a secret was registered.
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Check the webhook secret header. With no secret configured every request passes.
pub fn verify_secret_token(provided: Option<&str>, expected: Option<&SecretString>) -> bool {
	let Some(expected) = expected else {
		return true;
	};
	let Some(provided) = provided else {
		return false;
	};

	// Digests first so the comparison length does not depend on the input.
	let a = Sha256::digest(provided.as_bytes());
	let b = Sha256::digest(expected.expose().as_bytes());
	constant_time_eq(&a, &b)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
