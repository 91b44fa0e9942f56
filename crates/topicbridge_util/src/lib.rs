#![forbid(unsafe_code)]

/// Listen address and public URL helpers for the webhook receiver.
pub mod webhook {
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum BindError {
		#[error("bind address must be non-empty")]
		Empty,
		#[error("unsupported scheme in bind address {0:?} (only http:// is accepted)")]
		Scheme(String),
		#[error("bind address {0:?} must not carry a path, query or fragment")]
		Path(String),
		#[error("bind address {0:?} is not an IP literal with a port (e.g. 0.0.0.0:8080 or [::1]:8080)")]
		Address(String),
		#[error("bind address {0:?} needs a non-zero port")]
		ZeroPort(String),
	}

	/// Parse `host:port`, optionally written as `http://host:port`.
	///
	/// TLS is terminated in front of the relay, so `https://` is refused here.
	pub fn parse_bind(raw: &str) -> Result<SocketAddr, BindError> {
		let s = raw.trim();
		if s.is_empty() {
			return Err(BindError::Empty);
		}
		let rest = match s.split_once("://") {
			Some(("http", rest)) => rest,
			Some(_) => return Err(BindError::Scheme(s.to_string())),
			None => s,
		};
		let rest = rest.strip_suffix('/').unwrap_or(rest);
		if rest.contains(['/', '?', '#']) {
			return Err(BindError::Path(s.to_string()));
		}
		let addr: SocketAddr = rest.parse().map_err(|_| BindError::Address(s.to_string()))?;
		if addr.port() == 0 {
			return Err(BindError::ZeroPort(s.to_string()));
		}
		Ok(addr)
	}

	/// Base URL derived from a request's `Host` header.
	pub fn base_from_host(host: &str) -> String {
		format!("https://{}", host.trim())
	}

	/// URL handed to `setWebhook`: the public base plus the receiver path.
	pub fn webhook_url(base: &str, path: &str) -> String {
		let base = base.trim().trim_end_matches('/');
		match path.trim().trim_start_matches('/') {
			"" => base.to_string(),
			path => format!("{base}/{path}"),
		}
	}

}
