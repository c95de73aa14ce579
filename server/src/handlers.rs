use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use kernel::{
    DownloadRecord, EntryId, EntryMetadata, EntryUpdate, ExpirationTime, FileNote, FileSize,
    Filename, GuestLink, GuestLinkId, GuestLinkLimits, NewGuestLink, Settings, UploadMetadata,
    ValidationError, DEFAULT_CONTENT_TYPE,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{EntryStore, GuestLinkStore, SettingsStore};
use crate::error::{Error, Result};
use crate::file_reply::FileReply;
use crate::sqlite::{Mode, Sqlite, TRANSFER_BUFFER_SIZE};
use crate::AppState;

/// Query string of an upload.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UploadParams {
    /// Name the file is served under
    pub filename: String,
    pub note: Option<String>,
    /// Defaults to the configured file lifetime, or the guest link's limit
    pub expires: Option<DateTime<Utc>>,
    /// Guest link the upload comes through
    pub guest_link: Option<GuestLinkId>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub id: EntryId,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SweepResponse {
    pub deleted: usize,
}

/// Lists metadata of every stored file
#[utoipa::path(
    get,
    path = "/api/entries",
    tag = "entries",
    responses(
        (status = 200, description = "All entries", body = [EntryMetadata]),
        (status = 500, description = "Server error", body = String)
    ),
)]
pub async fn list_entries(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, |repository| {
        Ok(Json(repository.list_entry_metadata()?))
    })
    .await
}

/// Uploads a file from the raw request body
#[utoipa::path(
    post,
    path = "/api/entries",
    tag = "entries",
    params(UploadParams),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 400, description = "Invalid metadata or rejected by the guest link", body = String),
        (status = 404, description = "Guest link not found", body = String),
        (status = 411, description = "Content-Length missing", body = String),
        (status = 500, description = "Server error", body = String)
    ),
)]
pub async fn upload_entry(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let Some(size) = content_length(&headers) else {
        return Ok((StatusCode::LENGTH_REQUIRED, "Content-Length is required").into_response());
    };
    let size = FileSize::try_from(size)?.get();
    let filename = Filename::parse(&params.filename)?;
    let note = FileNote::parse(params.note.as_deref().unwrap_or_default())?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_owned();

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = SyncIoBridge::new(StreamReader::new(stream));

    let id = execute(&state.db, Mode::ReadWrite, move |mut repository| {
        let uploaded = Utc::now();
        let requested = params.expires.map(ExpirationTime::new);
        let expires = match &params.guest_link {
            Some(link_id) => {
                let link = repository.get_guest_link(link_id)?;
                check_guest_upload(&link, uploaded, size, requested)?
            }
            None => match requested {
                Some(expires) => expires,
                None => repository
                    .read_settings()?
                    .default_file_lifetime
                    .expiration_from(uploaded),
            },
        };

        let metadata = UploadMetadata {
            id: EntryId::generate(),
            filename,
            note,
            content_type,
            uploaded,
            expires,
            size,
            guest_link_id: params.guest_link,
        };
        repository.insert_entry(&mut reader, &metadata)?;
        tracing::info!("file: {} size: {size} id: {}", metadata.filename, metadata.id);
        Ok(metadata.id)
    })
    .await?;

    Ok(created(Json(UploadResponse { id })))
}

/// Gets a stored file's metadata
#[utoipa::path(
    get,
    path = "/api/entries/{id}",
    tag = "entries",
    responses(
        (status = 200, body = EntryMetadata),
        (status = 404, description = "Entry not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Entry id")
    ),
)]
pub async fn get_entry(
    Path(id): Path<EntryId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, move |repository| {
        Ok(Json(repository.get_entry_metadata(&id)?))
    })
    .await
}

/// Changes a stored file's name, expiration or note
#[utoipa::path(
    put,
    path = "/api/entries/{id}",
    tag = "entries",
    request_body = EntryUpdate,
    responses(
        (status = 200, description = "Updated metadata", body = EntryMetadata),
        (status = 400, description = "Invalid metadata", body = String),
        (status = 404, description = "Entry not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Entry id")
    ),
)]
pub async fn update_entry(
    Path(id): Path<EntryId>,
    State(state): State<Arc<AppState>>,
    Json(update): Json<EntryUpdate>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.update_entry_metadata(&id, &update)?;
        Ok(Json(repository.get_entry_metadata(&id)?))
    })
    .await
}

/// Deletes a stored file. Deleting a missing file succeeds.
#[utoipa::path(
    delete,
    path = "/api/entries/{id}",
    tag = "entries",
    responses(
        (status = 204, description = "Entry gone"),
    ),
    params(
        ("id" = String, Path, description = "Entry id")
    ),
)]
pub async fn delete_entry(
    Path(id): Path<EntryId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.delete_entry(&id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Lists downloads of a stored file, newest first
#[utoipa::path(
    get,
    path = "/api/entries/{id}/downloads",
    tag = "entries",
    responses(
        (status = 200, body = [DownloadRecord]),
        (status = 404, description = "Entry not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Entry id")
    ),
)]
pub async fn get_entry_downloads(
    Path(id): Path<EntryId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, move |repository| {
        repository.get_entry_metadata(&id)?;
        Ok(Json(repository.get_entry_downloads(&id)?))
    })
    .await
}

/// Streams a stored file's contents and records the download
#[utoipa::path(
    get,
    path = "/api/file/{id}",
    tag = "files",
    responses(
        (status = 200, response = FileReply),
        (status = 404, description = "File not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Entry id")
    ),
)]
pub async fn get_file(
    Path(id): Path<EntryId>,
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<FileReply> {
    let record = DownloadRecord {
        time: Utc::now(),
        client_ip: client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
    };

    let entry_id = id.clone();
    let metadata = execute(&state.db, Mode::ReadOnly, move |repository| {
        repository.get_entry_metadata(&entry_id)
    })
    .await?;

    // A long upload can hold the write lock past the busy timeout. The file
    // is served whether or not the download made it into the history.
    let entry_id = id.clone();
    let recorded = execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.insert_entry_download(&entry_id, &record)
    })
    .await;
    if let Err(e) = recorded {
        tracing::warn!("download of {id} not recorded: {e}");
    }

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let result = Sqlite::open(&db, Mode::ReadOnly).and_then(|repository| {
            repository.read_entry_file(&id, |reader| {
                let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        tracing::debug!("client of {id} went away");
                        break;
                    }
                }
                Ok(())
            })
        });
        if let Err(e) = result {
            tracing::error!("file {id} not streamed. Error: {e}");
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok(FileReply::new(Body::from_stream(stream), metadata))
}

/// Lists every guest link
#[utoipa::path(
    get,
    path = "/api/guest-links",
    tag = "guest-links",
    responses(
        (status = 200, body = [GuestLink]),
    ),
)]
pub async fn list_guest_links(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, |repository| {
        Ok(Json(repository.get_guest_links()?))
    })
    .await
}

/// Creates a guest link
#[utoipa::path(
    post,
    path = "/api/guest-links",
    tag = "guest-links",
    request_body = GuestLinkLimits,
    responses(
        (status = 201, description = "Guest link created", body = GuestLink),
        (status = 400, description = "Invalid limits", body = String)
    ),
)]
pub async fn create_guest_link(
    State(state): State<Arc<AppState>>,
    Json(limits): Json<GuestLinkLimits>,
) -> Result<impl IntoResponse> {
    limits.validate()?;
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        let id = repository.insert_guest_link(&NewGuestLink {
            created: Utc::now(),
            limits,
        })?;
        tracing::info!("guest link {id} created");
        Ok(created(Json(repository.get_guest_link(&id)?)))
    })
    .await
}

/// Gets a guest link
#[utoipa::path(
    get,
    path = "/api/guest-links/{id}",
    tag = "guest-links",
    responses(
        (status = 200, body = GuestLink),
        (status = 404, description = "Guest link not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Guest link id")
    ),
)]
pub async fn get_guest_link(
    Path(id): Path<GuestLinkId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, move |repository| {
        Ok(Json(repository.get_guest_link(&id)?))
    })
    .await
}

/// Deletes a guest link. Files uploaded through it are kept.
#[utoipa::path(
    delete,
    path = "/api/guest-links/{id}",
    tag = "guest-links",
    responses(
        (status = 204, description = "Guest link deleted"),
        (status = 404, description = "Guest link not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Guest link id")
    ),
)]
pub async fn delete_guest_link(
    Path(id): Path<GuestLinkId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.delete_guest_link(&id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Lets a guest link accept uploads again
#[utoipa::path(
    post,
    path = "/api/guest-links/{id}/enable",
    tag = "guest-links",
    responses(
        (status = 204, description = "Guest link enabled"),
        (status = 404, description = "Guest link not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Guest link id")
    ),
)]
pub async fn enable_guest_link(
    Path(id): Path<GuestLinkId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.enable_guest_link(&id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Stops a guest link from accepting uploads
#[utoipa::path(
    post,
    path = "/api/guest-links/{id}/disable",
    tag = "guest-links",
    responses(
        (status = 204, description = "Guest link disabled"),
        (status = 404, description = "Guest link not found", body = String)
    ),
    params(
        ("id" = String, Path, description = "Guest link id")
    ),
)]
pub async fn disable_guest_link(
    Path(id): Path<GuestLinkId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.disable_guest_link(&id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Gets server settings
#[utoipa::path(
    get,
    path = "/api/settings",
    tag = "settings",
    responses(
        (status = 200, body = Settings),
    ),
)]
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadOnly, |repository| {
        Ok(Json(repository.read_settings()?))
    })
    .await
}

/// Replaces server settings
#[utoipa::path(
    put,
    path = "/api/settings",
    tag = "settings",
    request_body = Settings,
    responses(
        (status = 200, body = Settings),
        (status = 400, description = "Invalid settings", body = String)
    ),
)]
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<Settings>,
) -> Result<impl IntoResponse> {
    execute(&state.db, Mode::ReadWrite, move |mut repository| {
        repository.update_settings(&settings)?;
        Ok(Json(repository.read_settings()?))
    })
    .await
}

/// Removes expired files now instead of waiting for the next scheduled sweep
#[utoipa::path(
    post,
    path = "/api/sweep",
    tag = "maintenance",
    responses(
        (status = 200, body = SweepResponse),
    ),
)]
pub async fn sweep(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let sweeper = state.sweeper.clone();
    let deleted = tokio::task::spawn_blocking(move || sweeper.sweep())
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;
    Ok(Json(SweepResponse { deleted }))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_not_found() {
            tracing::info!("{self}");
            return (StatusCode::NOT_FOUND, self.to_string()).into_response();
        }
        if self.is_client_error() {
            tracing::info!("rejected: {self}");
            return (StatusCode::BAD_REQUEST, self.to_string()).into_response();
        }
        if matches!(self, Error::Constraint(_)) {
            tracing::warn!("{self}");
            return (StatusCode::CONFLICT, "conflicting data").into_response();
        }
        tracing::error!("Error: {self}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
    }
}

/// Picks the expiration of a guest upload, or rejects it.
fn check_guest_upload(
    link: &GuestLink,
    uploaded: DateTime<Utc>,
    size: u64,
    requested: Option<ExpirationTime>,
) -> std::result::Result<ExpirationTime, ValidationError> {
    if !link.is_active_at(uploaded) {
        return Err(ValidationError::GuestLinkInactive);
    }
    if let Some(max) = link.limits.max_file_bytes.filter(|_| !link.accepts_file_size(size)) {
        return Err(ValidationError::FileTooLarge(size, max));
    }
    let lifetime = link.limits.max_file_lifetime;
    match requested {
        Some(expires) if !link.permits_expiration(uploaded, expires) => Err(
            ValidationError::GuestLifetimeExceeded(lifetime.friendly_name()),
        ),
        Some(expires) => Ok(expires),
        None => Ok(lifetime.expiration_from(uploaded)),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Runs `action` against a fresh connection on the blocking pool.
async fn execute<F, R>(db: &FsPath, mode: Mode, action: F) -> Result<R>
where
    F: FnOnce(Sqlite) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let db = db.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let repository = Sqlite::open(&db, mode)?;
        let res = action(repository);
        tracing::info!("DB query time: {:?}", start.elapsed());
        res
    })
    .await
    .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn created<S: IntoResponse>(s: S) -> Response {
    (StatusCode::CREATED, s).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use kernel::{FileLifetime, GuestLinkLabel};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn link(max_file_bytes: Option<u64>, max_file_lifetime: FileLifetime) -> GuestLink {
        GuestLink {
            id: GuestLinkId::generate(),
            created: now(),
            limits: GuestLinkLimits {
                label: GuestLinkLabel::default(),
                url_expires: ExpirationTime::never(),
                max_file_lifetime,
                max_file_bytes,
                max_file_uploads: None,
            },
            files_uploaded: 0,
            is_disabled: false,
        }
    }

    #[rstest]
    #[case(None, 1_000_000, true)]
    #[case(Some(100), 100, true)]
    #[case(Some(100), 101, false)]
    #[trace]
    fn guest_upload_size(#[case] max: Option<u64>, #[case] size: u64, #[case] accepted: bool) {
        // Arrange
        let link = link(max, FileLifetime::INFINITE);

        // Act
        let result = check_guest_upload(&link, now(), size, None);

        // Assert
        assert_eq!(result.is_ok(), accepted);
    }

    #[test]
    fn guest_upload_defaults_to_link_lifetime() {
        // Arrange
        let lifetime = FileLifetime::from_days(7).unwrap();
        let link = link(None, lifetime);

        // Act
        let expires = check_guest_upload(&link, now(), 1, None).unwrap();

        // Assert
        assert_eq!(expires.as_datetime(), now() + Duration::days(7));
    }

    #[test]
    fn guest_upload_past_link_lifetime_is_rejected() {
        // Arrange
        let link = link(None, FileLifetime::from_days(7).unwrap());
        let requested = ExpirationTime::new(now() + Duration::days(8));

        // Act
        let result = check_guest_upload(&link, now(), 1, Some(requested));

        // Assert
        assert_eq!(
            result,
            Err(ValidationError::GuestLifetimeExceeded("7 days".to_owned()))
        );
    }

    #[test]
    fn disabled_guest_link_rejects_uploads() {
        // Arrange
        let mut link = link(None, FileLifetime::INFINITE);
        link.is_disabled = true;

        // Act
        let result = check_guest_upload(&link, now(), 1, None);

        // Assert
        assert_eq!(result, Err(ValidationError::GuestLinkInactive));
    }

    #[rstest]
    #[case(Some("203.0.113.7, 10.0.0.1"), None, "203.0.113.7")]
    #[case(None, Some("192.0.2.1:4000"), "192.0.2.1")]
    #[case(None, None, "")]
    #[trace]
    fn client_ip_prefers_forwarded_header(
        #[case] forwarded: Option<&str>,
        #[case] peer: Option<&str>,
        #[case] expected: &str,
    ) {
        // Arrange
        let mut headers = HeaderMap::new();
        if let Some(f) = forwarded {
            headers.insert("x-forwarded-for", f.parse().unwrap());
        }
        let peer = peer.map(|p| p.parse().unwrap());

        // Act
        let ip = client_ip(&headers, peer);

        // Assert
        assert_eq!(ip, expected);
    }
}
