#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Liveness/readiness flag. Ready once the store and gateway are initialised.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Release);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Acquire)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = serve(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn serve(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let resp = probe(req.method(), req.uri().path(), &state);
				async move { Ok::<_, hyper::Error>(resp) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn probe(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	let (status, body): (StatusCode, &'static [u8]) = match (method, path) {
		(&Method::GET, "/healthz") => (StatusCode::OK, b"ok"),
		(&Method::GET, "/readyz") if state.is_ready() => (StatusCode::OK, b"ready"),
		(&Method::GET, "/readyz") => (StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		(&Method::GET, _) => (StatusCode::NOT_FOUND, b""),
		_ => (StatusCode::METHOD_NOT_ALLOWED, b""),
	};
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body)))
		.unwrap()
}
