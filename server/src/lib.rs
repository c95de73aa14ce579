use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    classify::ServerErrorsFailureClass, limit::RequestBodyLimitLayer, trace::TraceLayer,
};
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

pub mod domain;
pub mod error;
pub mod file_reply;
mod handlers;
pub mod sqlite;
pub mod sweeper;

pub use handlers::{SweepResponse, UploadResponse};

use crate::error::Result;
use crate::sqlite::{Sqlite, MAX_BLOB_BYTES};
use crate::sweeper::{Sweeper, SystemClock, DEFAULT_SWEEP_INTERVAL};

const DB_FILE: &str = "stashbox.db";
const CURRENT_DIR: &str = "./";
const DEFAULT_PORT: u16 = 5000;

/// Server settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub data_file: String,
    pub port: u16,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(CURRENT_DIR),
            data_file: String::from(DB_FILE),
            port: DEFAULT_PORT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Config {
    /// Reads `STASHBOX_DATA_DIR`, `STASHBOX_DATA_FILE`, `STASHBOX_PORT` and
    /// `STASHBOX_SWEEP_INTERVAL_SECS`. Unset or unparsable values fall back to
    /// the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("STASHBOX_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            data_file: lookup("STASHBOX_DATA_FILE").unwrap_or(defaults.data_file),
            port: parse_or("STASHBOX_PORT", &lookup, defaults.port),
            sweep_interval: Duration::from_secs(parse_or(
                "STASHBOX_SWEEP_INTERVAL_SECS",
                &lookup,
                defaults.sweep_interval.as_secs(),
            )),
        }
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.data_file)
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            tracing::warn!("{key} is invalid, using default");
            default
        }
        None => default,
    }
}

/// Shared by every request handler.
pub struct AppState {
    pub db: PathBuf,
    pub sweeper: Sweeper<Sqlite>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_entries,
        handlers::upload_entry,
        handlers::get_entry,
        handlers::update_entry,
        handlers::delete_entry,
        handlers::get_entry_downloads,
        handlers::get_file,
        handlers::list_guest_links,
        handlers::create_guest_link,
        handlers::get_guest_link,
        handlers::delete_guest_link,
        handlers::enable_guest_link,
        handlers::disable_guest_link,
        handlers::get_settings,
        handlers::update_settings,
        handlers::sweep,
    ),
    components(
        schemas(
            kernel::EntryMetadata,
            kernel::EntryUpdate,
            kernel::DownloadRecord,
            kernel::GuestLink,
            kernel::GuestLinkLimits,
            kernel::Settings,
            UploadResponse,
            SweepResponse,
        ),
        responses(file_reply::FileReply)
    ),
    tags(
        (name = "entries", description = "Stored files and their metadata"),
        (name = "files", description = "File contents"),
        (name = "guest-links", description = "Upload links for guests"),
        (name = "settings", description = "Server settings"),
        (name = "maintenance", description = "Expired file removal"),
    )
)]
pub struct ApiDoc;

pub async fn run(config: Config) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "server=debug,stashbox=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&config.data_dir)?;
    let db = config.db_path();
    tracing::info!("using database {}", db.display());
    let store = Sqlite::open_or_create(&db)?;

    let sweeper = Sweeper::new(Arc::new(Mutex::new(store)), SystemClock);
    let sweeping = sweeper.start(config.sweep_interval);

    let socket = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(socket).await?;
    tracing::debug!("listening on {socket}");

    let app = create_routes(db, sweeper);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweeping.stop().await;
    served?;
    Ok(())
}

/// Builds the router. The database at `db` must already have its schema.
pub fn create_routes(db: PathBuf, sweeper: Sweeper<Sqlite>) -> Router {
    let state = Arc::new(AppState { db, sweeper });
    // Nothing larger than a single blob can be stored anyway.
    let body_limit = usize::try_from(MAX_BLOB_BYTES).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/api/entries",
            get(handlers::list_entries).post(handlers::upload_entry),
        )
        .route(
            "/api/entries/:id",
            get(handlers::get_entry)
                .put(handlers::update_entry)
                .delete(handlers::delete_entry),
        )
        .route(
            "/api/entries/:id/downloads",
            get(handlers::get_entry_downloads),
        )
        .route("/api/file/:id", get(handlers::get_file))
        .route(
            "/api/guest-links",
            get(handlers::list_guest_links).post(handlers::create_guest_link),
        )
        .route(
            "/api/guest-links/:id",
            get(handlers::get_guest_link).delete(handlers::delete_guest_link),
        )
        .route(
            "/api/guest-links/:id/enable",
            post(handlers::enable_guest_link),
        )
        .route(
            "/api/guest-links/:id/disable",
            post(handlers::disable_guest_link),
        )
        .route(
            "/api/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/api/sweep", post(handlers::sweep))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http().on_failure(
                    |error: ServerErrorsFailureClass, _latency: Duration, _span: &Span| {
                        tracing::error!("Server error: {error}");
                    },
                ))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(body_limit))
                .into_inner(),
        )
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
