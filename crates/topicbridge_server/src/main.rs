#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use topicbridge_platform::{BotApiClient, BotApiConfig, MessagingGateway};
use topicbridge_util::webhook::parse_bind;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::admin::sync_command_menu;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::router::UpdateRouter;
use crate::server::state::{RelayConfig, RelayContext};
use crate::server::store::{InMemoryMappingStore, MappingStore, PersistentMappingStore};
use crate::server::webhook::{WebhookState, run_webhook_server};

const DEFAULT_BIND: &str = "http://127.0.0.1:8080";

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: topicbridge_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Webhook listen address, host:port or http://host:port (default: {DEFAULT_BIND})\n\
\t--config   Config file (default: ~/.topicbridge/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = parse_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,topicbridge_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("topicbridge_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match parse_bind(bind) {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MappingStore>> {
	if !cfg.persistence.enabled {
		warn!("persistence disabled; mappings and block flags live in memory only");
		return Ok(Arc::new(InMemoryMappingStore::default()));
	}
	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let store = PersistentMappingStore::connect(database_url).await?;
	info!("persistent mapping store ready");
	Ok(Arc::new(store))
}

fn build_gateway(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessagingGateway>> {
	let token = cfg
		.bot
		.token
		.clone()
		.ok_or_else(|| anyhow!("bot.token is required (or TOPICBRIDGE_BOT_TOKEN)"))?;
	let mut api_cfg = BotApiConfig::new(token);
	api_cfg.base_url = cfg.bot.api_base_url.clone();
	api_cfg.request_timeout = cfg.bot.request_timeout;
	Ok(Arc::new(BotApiClient::new(api_cfg)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match parse_bind(bind) {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let relay_cfg = RelayConfig::from_settings(&server_cfg)?;
	let store = open_store(&server_cfg).await?;
	let gateway = build_gateway(&server_cfg)?;
	let ctx = RelayContext::new(relay_cfg, store, gateway);
	info!(operator = %ctx.cfg.operator, group = ctx.cfg.group_id, "relay configured");

	if server_cfg.bot.sync_commands_on_start
		&& let Err(e) = sync_command_menu(&ctx).await
	{
		warn!(error = %e, "failed to sync command menus");
	}

	health_state.mark_ready();

	let state = WebhookState {
		path: server_cfg.server.webhook_path.clone(),
		public_url: server_cfg.server.public_url.clone(),
		secret: server_cfg.bot.webhook_secret.clone(),
		router: UpdateRouter::new(ctx.clone()),
		gateway: ctx.gateway.clone(),
	};
	if state.secret.is_none() {
		warn!("no webhook secret configured; deliveries are not authenticated");
	}

	run_webhook_server(args.bind, state).await
}
