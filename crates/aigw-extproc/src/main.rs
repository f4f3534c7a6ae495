use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Endpoint, Server, Uri};
use tonic_health::ServingStatus;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_client::HealthClient;
use tower::service_fn;
use tracing::{info, warn};

use aigw_extproc::config::{ConfigStore, watcher::Watcher};
use aigw_extproc::metrics::{GenAiMetrics, parse_header_labels};
use aigw_extproc::proto::external_processor_server::ExternalProcessorServer;
use aigw_extproc::server::{ExtProcService, PathRegistry};
use aigw_extproc::trace::TraceConfig;

#[derive(Parser)]
#[command(name = "aigw-extproc")]
struct Cli {
	/// Path to the filter config YAML. Watched for changes.
	#[arg(long = "configPath")]
	config_path: PathBuf,
	/// gRPC listener address: `:port`, `host:port`, or `unix:///path`.
	#[arg(long = "extProcAddr", default_value = ":1063")]
	ext_proc_addr: String,
	#[arg(long = "logLevel", default_value = "info")]
	log_level: String,
	#[arg(long = "metricsPort", default_value_t = 9090)]
	metrics_port: u16,
	#[arg(long = "healthPort", default_value_t = 8080)]
	health_port: u16,
	/// Comma-separated `<header>:<label>` pairs promoted to metric labels.
	#[arg(long = "metricsRequestHeaderLabels", default_value = "")]
	metrics_request_header_labels: String,
	/// Prefix prepended to every registered request path.
	#[arg(long = "rootPrefix", default_value = "")]
	root_prefix: String,
	/// Maximum gRPC receive message size in bytes.
	#[arg(long = "maxRecvMsgSize", default_value_t = 4 * 1024 * 1024)]
	max_recv_msg_size: usize,
	/// Config file poll interval in seconds.
	#[arg(long = "configWatchInterval", default_value_t = 5)]
	config_watch_interval: u64,
	/// Record request/response payloads on spans.
	#[arg(long = "traceRecordInputsOutputs", default_value_t = false)]
	trace_record_inputs_outputs: bool,
}

enum ListenAddr {
	Tcp(SocketAddr),
	Unix(PathBuf),
}

fn parse_listen_addr(raw: &str) -> anyhow::Result<ListenAddr> {
	if let Some(path) = raw.strip_prefix("unix://") {
		return Ok(ListenAddr::Unix(PathBuf::from(path)));
	}
	let raw = if raw.starts_with(':') {
		format!("0.0.0.0{raw}")
	} else {
		raw.to_string()
	};
	Ok(ListenAddr::Tcp(raw.parse().context("invalid extProcAddr")?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
		)
		.init();

	let registry = prometheus::Registry::new();
	let exporter = opentelemetry_prometheus::exporter()
		.with_registry(registry.clone())
		.build()
		.context("failed to build prometheus exporter")?;
	let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
		.with_reader(exporter)
		.build();
	opentelemetry::global::set_meter_provider(meter_provider.clone());
	let meter = opentelemetry::global::meter("aigw-extproc");
	let genai_metrics = GenAiMetrics::new(&meter);

	let header_labels = parse_header_labels(&cli.metrics_request_header_labels)
		.map_err(|e| anyhow::anyhow!("invalid metricsRequestHeaderLabels: {e}"))?;

	// First load is synchronous: a broken config at startup is fatal, a
	// broken reload later keeps the old snapshot.
	let store = ConfigStore::new();
	let (mut watcher, mut ready) = Watcher::new(
		cli.config_path.clone(),
		Duration::from_secs(cli.config_watch_interval.max(1)),
		store.clone(),
	);
	watcher
		.load_initial()
		.context("failed to load filter config")?;
	tokio::spawn(watcher.run());

	// Readiness is published under both the ext_proc service name and the
	// unnamed default service: orchestrator probes (including our own health
	// proxy below) query the empty service name.
	let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
	set_health_status(&mut health_reporter, ServingStatus::NotServing).await;
	{
		let mut health_reporter = health_reporter.clone();
		tokio::spawn(async move {
			loop {
				let status = if *ready.borrow_and_update() {
					ServingStatus::Serving
				} else {
					ServingStatus::NotServing
				};
				set_health_status(&mut health_reporter, status).await;
				if ready.changed().await.is_err() {
					return;
				}
			}
		});
	}

	let service = ExtProcService::new(
		store,
		PathRegistry::new(&cli.root_prefix),
		genai_metrics,
		header_labels,
		TraceConfig {
			hide_inputs: !cli.trace_record_inputs_outputs,
			hide_outputs: !cli.trace_record_inputs_outputs,
		},
	);
	let ext_proc_server = ExternalProcessorServer::new(service)
		.max_decoding_message_size(cli.max_recv_msg_size);

	spawn_metrics_server(cli.metrics_port, registry).await?;
	spawn_health_server(cli.health_port, cli.ext_proc_addr.clone()).await?;

	let server = Server::builder()
		.add_service(health_service)
		.add_service(ext_proc_server);

	let addr = parse_listen_addr(&cli.ext_proc_addr)?;
	match addr {
		ListenAddr::Tcp(addr) => {
			info!(%addr, "external processor listening");
			server
				.serve_with_shutdown(addr, shutdown_signal())
				.await?;
		},
		ListenAddr::Unix(path) => {
			let _ = std::fs::remove_file(&path);
			let listener = UnixListener::bind(&path)
				.with_context(|| format!("failed to bind {}", path.display()))?;
			info!(path = %path.display(), "external processor listening");
			server
				.serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
				.await?;
		},
	}

	meter_provider.shutdown().ok();
	info!("shutdown complete");
	Ok(())
}

async fn set_health_status(
	reporter: &mut tonic_health::server::HealthReporter,
	status: ServingStatus,
) {
	match status {
		ServingStatus::Serving => {
			reporter
				.set_serving::<ExternalProcessorServer<ExtProcService>>()
				.await;
		},
		_ => {
			reporter
				.set_not_serving::<ExternalProcessorServer<ExtProcService>>()
				.await;
		},
	}
	reporter.set_service_status("", status).await;
}

/// Waits for SIGINT/SIGTERM, then arms the drain deadline: streams that do
/// not finish within the grace period are abandoned.
async fn shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.expect("failed to install SIGTERM handler");
	tokio::select! {
		_ = ctrl_c => {},
		_ = term.recv() => {},
	}
	info!("shutdown signal received, draining");
	tokio::spawn(async {
		tokio::time::sleep(Duration::from_secs(5)).await;
		warn!("drain grace period expired, exiting");
		std::process::exit(0);
	});
}

async fn spawn_metrics_server(port: u16, registry: prometheus::Registry) -> anyhow::Result<()> {
	let app = axum::Router::new().route(
		"/metrics",
		axum::routing::get(move || {
			let registry = registry.clone();
			async move {
				let mut buf = Vec::new();
				let encoder = TextEncoder::new();
				if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
					warn!("failed to encode metrics: {e}");
				}
				(
					[(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
					buf,
				)
			}
		}),
	);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
		.await
		.with_context(|| format!("failed to bind metrics port {port}"))?;
	info!(port, "metrics listening");
	tokio::spawn(async move {
		if let Err(e) = axum::serve(listener, app).await {
			warn!("metrics server exited: {e}");
		}
	});
	Ok(())
}

/// Health sidecar: `/health` answers directly; `/` dials the gRPC health
/// service, which the orchestrator's probe cannot reach itself when the
/// processor listens on a unix socket.
async fn spawn_health_server(port: u16, ext_proc_addr: String) -> anyhow::Result<()> {
	let app = axum::Router::new()
		.route("/health", axum::routing::get(|| async { "OK" }))
		.route(
			"/",
			axum::routing::get(move || {
				let addr = ext_proc_addr.clone();
				async move {
					match grpc_health_check(&addr).await {
						Ok(true) => (axum::http::StatusCode::OK, "SERVING"),
						Ok(false) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "NOT_SERVING"),
						Err(e) => {
							warn!("health probe failed: {e}");
							(axum::http::StatusCode::SERVICE_UNAVAILABLE, "UNREACHABLE")
						},
					}
				}
			}),
		);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
		.await
		.with_context(|| format!("failed to bind health port {port}"))?;
	info!(port, "health listening");
	tokio::spawn(async move {
		if let Err(e) = axum::serve(listener, app).await {
			warn!("health server exited: {e}");
		}
	});
	Ok(())
}

async fn grpc_health_check(ext_proc_addr: &str) -> anyhow::Result<bool> {
	let channel = match parse_listen_addr(ext_proc_addr)? {
		ListenAddr::Tcp(addr) => {
			Endpoint::try_from(format!("http://{addr}"))?
				.connect_timeout(Duration::from_secs(2))
				.connect()
				.await?
		},
		ListenAddr::Unix(path) => {
			// The URI is ignored; the connector dials the socket.
			Endpoint::try_from("http://localhost")?
				.connect_with_connector(service_fn(move |_: Uri| {
					let path = path.clone();
					async move {
						Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
							UnixStream::connect(path).await?,
						))
					}
				}))
				.await?
		},
	};
	let mut client = HealthClient::new(channel);
	let resp = client
		.check(HealthCheckRequest {
			service: String::new(),
		})
		.await?
		.into_inner();
	Ok(resp.status == tonic_health::pb::health_check_response::ServingStatus::Serving as i32)
}
