#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use topicbridge_platform::{MessagingGateway, SecretString, Update, WebhookRegistration};
use topicbridge_util::webhook::{base_from_host, webhook_url};
use tracing::{debug, info, warn};

use crate::server::auth::{SECRET_TOKEN_HEADER, verify_secret_token};
use crate::server::router::UpdateRouter;

pub const REGISTER_PATH: &str = "/registerWebhook";
pub const UNREGISTER_PATH: &str = "/unRegisterWebhook";

const ALLOWED_UPDATES: [&str; 2] = ["message", "callback_query"];
const MAX_CONNECTIONS: u32 = 100;
/// Updates are small JSON documents; anything larger is refused unread.
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
pub struct WebhookState {
	pub path: String,
	pub public_url: Option<String>,
	pub secret: Option<SecretString>,
	pub router: UpdateRouter,
	pub gateway: Arc<dyn MessagingGateway>,
}

pub async fn run_webhook_server(bind: SocketAddr, state: WebhookState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, path = %state.path, "webhook server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| handle_webhook(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "webhook connection error");
			}
		});
	}
}

/// Route one request. The update itself is handled on a spawned task.
async fn handle_webhook<B>(req: Request<B>, state: WebhookState) -> Result<Response<Full<Bytes>>, hyper::Error>
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let (parts, body) = req.into_parts();
	if let Some(rejection) = screen(&parts, &state) {
		return Ok(rejection);
	}
	let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) if err.is::<LengthLimitError>() => {
			warn!(limit = MAX_BODY_BYTES, "webhook body too large");
			return Ok(text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large"));
		}
		Err(err) => {
			warn!(error = %err, "webhook body read failed");
			return Ok(text(StatusCode::BAD_REQUEST, "Bad Request"));
		}
	};
	Ok(dispatch(&parts, body, &state).await)
}

/// Head-only checks; run before the body is read.
fn screen(parts: &Parts, state: &WebhookState) -> Option<Response<Full<Bytes>>> {
	if parts.uri.path() != state.path {
		return None;
	}
	if parts.method != Method::POST {
		return Some(text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
	}
	metrics::counter!("topicbridge_webhook_requests_total").increment(1);

	let provided = parts.headers.get(SECRET_TOKEN_HEADER).and_then(|v| v.to_str().ok());
	if !verify_secret_token(provided, state.secret.as_ref()) {
		metrics::counter!("topicbridge_webhook_rejected_total").increment(1);
		return Some(text(StatusCode::FORBIDDEN, "Unauthorized"));
	}
	None
}

async fn dispatch(parts: &Parts, body: Bytes, state: &WebhookState) -> Response<Full<Bytes>> {
	let path = parts.uri.path();
	if path == state.path {
		return accept_update(&body, state);
	}

	match (&parts.method, path) {
		(&Method::GET, REGISTER_PATH) => register(parts, state).await,
		(&Method::GET, UNREGISTER_PATH) => match state.gateway.delete_webhook().await {
			Ok(()) => {
				info!("webhook unregistered");
				text(StatusCode::OK, "Ok")
			}
			Err(err) => {
				warn!(error = %err, "webhook unregistration failed");
				text(StatusCode::BAD_GATEWAY, err.description())
			}
		},
		_ => text(StatusCode::NOT_FOUND, "No handler for this request"),
	}
}

fn accept_update(body: &[u8], state: &WebhookState) -> Response<Full<Bytes>> {
	let update: Update = match serde_json::from_slice(body) {
		Ok(update) => update,
		Err(err) => {
			warn!(error = %err, "webhook payload parse failed");
			metrics::counter!("topicbridge_webhook_parse_errors_total").increment(1);
			return text(StatusCode::BAD_REQUEST, "Bad Request");
		}
	};

	let update_id = update.update_id;
	match update.into_event() {
		Some(event) => {
			let router = state.router.clone();
			tokio::spawn(async move {
				router.route(event).await;
			});
		}
		None => debug!(update_id, "ignoring update without message or callback"),
	}
	text(StatusCode::OK, "Ok")
}

async fn register(parts: &Parts, state: &WebhookState) -> Response<Full<Bytes>> {
	let base = match &state.public_url {
		Some(url) => url.clone(),
		None => match parts.headers.get(HOST).and_then(|v| v.to_str().ok()) {
			Some(host) => base_from_host(host),
			None => return text(StatusCode::BAD_REQUEST, "Missing Host header"),
		},
	};

	let registration = WebhookRegistration {
		url: webhook_url(&base, &state.path),
		secret_token: state.secret.clone(),
		allowed_updates: ALLOWED_UPDATES.iter().map(|s| s.to_string()).collect(),
		max_connections: MAX_CONNECTIONS,
	};
	match state.gateway.set_webhook(&registration).await {
		Ok(()) => {
			info!(url = %registration.url, "webhook registered");
			text(StatusCode::OK, "Ok")
		}
		Err(err) => {
			warn!(error = %err, "webhook registration failed");
			text(StatusCode::BAD_GATEWAY, err.description())
		}
	}
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}
