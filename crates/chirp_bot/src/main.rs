#![forbid(unsafe_code)]

mod commands;
mod config;
mod runner;

use std::path::PathBuf;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::runner::BotRunner;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chirp_bot [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chirp/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chirp_bot=debug,chirp_platform=info".to_string());

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
				let tracer = tracer_provider.tracer("chirp_bot");
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

	match bind.parse::<std::net::SocketAddr>() {
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

async fn drain(runners: &mut JoinSet<()>) {
	while let Some(res) = runners.join_next().await {
		if let Err(e) = res {
			warn!(error = %e, "bot task ended abnormally");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_bot_config_from_path(&config_path)?;
	info!(path = %config_path.display(), bots = cfg.bots.len(), "loaded bot config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	if cfg.bots.is_empty() {
		warn!("no runnable bots configured; nothing to do");
		return Ok(());
	}

	let started_at = Instant::now();
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let mut runners = JoinSet::new();
	for bot in &cfg.bots {
		let runner = BotRunner::start(bot, &cfg, started_at).with_context(|| format!("start bot {}", bot.name))?;
		runners.spawn(runner.run(shutdown_rx.clone()));
	}
	info!(count = runners.len(), "started twitch bots");

	tokio::select! {
		res = tokio::signal::ctrl_c() => {
			res.context("listen for ctrl-c")?;
			info!("ctrl-c received; shutting down bots");
		}
		_ = drain(&mut runners) => {
			warn!("every bot stopped on its own");
		}
	}

	shutdown_tx.send_replace(true);
	drain(&mut runners).await;
	info!("all bots stopped");
	Ok(())
}
