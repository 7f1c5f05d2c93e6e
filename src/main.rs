use chunked_upload_backend::config::SecurityConfig;
use chunked_upload_backend::infrastructure::{database, scanner};
use chunked_upload_backend::api::middleware::rate_limit;
use chunked_upload_backend::services::worker::{BackgroundWorker, SweepScope};
use chunked_upload_backend::{AppState, create_app};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP API plus the in-memory session sweep
    Api,
    /// Staging sweeper only
    Worker,
    /// Both in one process
    All,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Services to run
    #[arg(short, long, value_enum, default_value = "all")]
    mode: Mode,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunked_upload_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Chunked Upload Backend [Mode: {:?}]...", args.mode);

    let security_config = match std::env::var("APP_ENV").as_deref() {
        Ok("production") => SecurityConfig::production()?,
        _ => SecurityConfig::from_env(),
    };
    info!(
        "🛡️  Security Config: Max Size={}MB, Max Chunk={}MB, Virus Scan={}, Scanner={}",
        security_config.max_file_size / 1024 / 1024,
        security_config.max_chunk_size / 1024 / 1024,
        security_config.enable_virus_scan,
        security_config.virus_scanner_type
    );

    let db = database::setup_database().await?;
    let scanner_service = scanner::setup_scanner(&security_config).await;
    let state = AppState::build(db, security_config, scanner_service).await?;
    info!("📁 Storage root: {}", state.config.storage_root.display());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Sessions live in the serving process; a standalone worker only sees files
    let scope = match args.mode {
        Mode::Api => SweepScope::Sessions,
        Mode::Worker => SweepScope::Staging,
        Mode::All => SweepScope::Both,
    };
    let max_idle = Duration::from_secs(state.config.staging_cleanup_age_hours * 3600);
    let sweep_interval = max_idle.min(Duration::from_secs(3600));
    let worker = BackgroundWorker::new(
        state.reassembler.chunks().clone(),
        state.reassembler.sessions().clone(),
        max_idle,
        shutdown_rx.clone(),
    )
    .with_interval(sweep_interval)
    .with_scope(scope);
    let mut handles = vec![tokio::spawn(worker.run())];

    if args.mode != Mode::Worker && state.rate_limiter.is_enabled() {
        handles.push(rate_limit::spawn_cleanup_task(
            state.rate_limiter.clone(),
            Duration::from_secs(60),
            shutdown_rx,
        ));
    }

    let served = if args.mode == Mode::Worker {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
        Ok(())
    } else {
        serve(state, &args.host, args.port, async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
    };

    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Background task ended abnormally: {}", e);
        }
    }
    served?;

    info!("👋 Backend exited cleanly.");
    Ok(())
}

async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri().path());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            ),
    );

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    // Peer addresses key the chunk rate limiter
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
