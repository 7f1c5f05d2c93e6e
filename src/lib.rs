pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::api::middleware::rate_limit::ChunkRateLimiter;
use crate::config::SecurityConfig;
use crate::services::artifact_store::ArtifactStore;
use crate::services::catalog::FileCatalog;
use crate::services::chunk_store::{ChunkStore, LocalChunkStore};
use crate::services::reassembler::Reassembler;
use crate::services::scanner::VirusScanner;
use crate::services::session::SessionTracker;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::files::upload_chunk,
        api::handlers::files::list_files,
        api::handlers::files::get_file_metadata,
        api::handlers::files::download_file,
        api::handlers::files::delete_file,
        api::handlers::files::list_uploads,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::auth::AuthRequest,
            api::handlers::auth::AuthResponse,
            api::handlers::files::FileResponse,
            api::handlers::files::ChunkUploadResponse,
            api::handlers::files::ChunkUploadForm,
            api::handlers::health::HealthResponse,
            services::reassembler::ChunkMetadata,
            services::session::SessionSummary,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Authentication endpoints"),
        (name = "files", description = "Chunked upload and file management endpoints")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<SecurityConfig>,
    pub scanner: Arc<dyn VirusScanner>,
    pub reassembler: Reassembler,
    pub rate_limiter: ChunkRateLimiter,
}

impl AppState {
    /// Wires the upload pipeline on top of an already migrated database.
    pub async fn build(
        db: DatabaseConnection,
        config: SecurityConfig,
        scanner: Arc<dyn VirusScanner>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.staging_is_exposed(),
            "STAGING_ROOT {} lies inside the publicly served STORAGE_ROOT {}",
            config.staging_dir().display(),
            config.storage_root.display()
        );

        let config = Arc::new(config);
        let staging = config.staging_dir();

        let chunks: Arc<dyn ChunkStore> = Arc::new(LocalChunkStore::new(&staging).await?);
        let artifacts = ArtifactStore::new(config.storage_root.clone(), staging).await?;
        let catalog = FileCatalog::new(db.clone(), artifacts);

        let reassembler = Reassembler::new(
            chunks,
            SessionTracker::new(),
            catalog,
            scanner.clone(),
            config.clone(),
        );

        let rate_limiter =
            ChunkRateLimiter::new(config.rate_limit_per_minute, config.trust_forwarded_for);

        Ok(Self {
            db,
            config,
            scanner,
            reassembler,
            rate_limiter,
        })
    }
}

fn cors_layer(config: &SecurityConfig) -> CorsLayer {
    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION, header::CONTENT_LENGTH])
}

pub fn create_app(state: AppState) -> Router {
    let auth = from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);
    let rate_limit = from_fn_with_state(
        state.clone(),
        api::middleware::rate_limit::chunk_rate_limit,
    );

    // Multipart framing on top of the chunk itself
    let chunk_limit = usize::try_from(state.config.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    let files = Router::new()
        .route(
            "/upload-chunk",
            post(api::handlers::files::upload_chunk)
                .layer(DefaultBodyLimit::max(chunk_limit))
                .layer(rate_limit),
        )
        .route("/", get(api::handlers::files::list_files))
        .route("/uploads", get(api::handlers::files::list_uploads))
        .route("/metadata/:id", get(api::handlers::files::get_file_metadata))
        .route("/download/:id", get(api::handlers::files::download_file))
        .route("/:id", delete(api::handlers::files::delete_file))
        .route_layer(auth);

    let mut app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/api/register", post(api::handlers::auth::register))
        .route("/api/login", post(api::handlers::auth::login))
        .nest("/api/file", files);

    if state.config.serve_public_uploads {
        tracing::warn!("⚠️  Serving committed files publicly under /uploads");
        app = app.nest_service("/uploads", ServeDir::new(&state.config.storage_root));
    }

    app.layer(cors_layer(&state.config))
        .layer(from_fn(api::middleware::security::security_headers))
        .with_state(state)
}
