//! HTTP front end for TubeShare.
//!
//! Routes are thin: each one validates its input, resolves the caller from
//! the identity header and hands off to the catalog, engagement or media
//! layer in the library crate.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRequestParts, Multipart, Path as AxumPath, Query, State,
        multipart::{Field, MultipartError},
        rejection::JsonRejection,
    },
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tubeshare::{
    blob::{BUCKETS, BlobStore, THUMBNAILS_BUCKET, VIDEOS_BUCKET},
    catalog::{Catalog, NewVideo, Video},
    config::{RuntimeOverrides, resolve_runtime_config},
    engagement::{Engagement, WatchOutcome},
    error::{AppError, AppResult},
    media,
    security::{ensure_not_root, is_plain_segment},
};
use uuid::Uuid;
use validator::Validate;

const DEFAULT_LOG_FILTER: &str = "tubeshare=info,backend=info,tower_http=info";
const USER_NAME_HEADER: &str = "x-user-name";

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "TubeShare video API server")]
struct BackendArgs {
    /// Directory holding the `videos` and `thumbnails` buckets.
    #[arg(long)]
    uploads_root: Option<PathBuf>,
    /// SQLite catalog file. Defaults to `<uploads root>/tubeshare.db`.
    #[arg(long = "database")]
    database: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Alternate dotenv file to read instead of `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            uploads_root: self.uploads_root,
            database_path: self.database,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBESHARE_HOST")
}

/// Shared state handed to every route.
#[derive(Clone)]
struct AppState {
    catalog: Catalog,
    engagement: Engagement,
    blobs: BlobStore,
    /// Lower-cased name of the header the auth proxy sets.
    auth_header: Arc<str>,
}

impl AppState {
    fn new(catalog: Catalog, blobs: BlobStore, auth_header: &str) -> Self {
        Self {
            engagement: Engagement::new(catalog.clone()),
            catalog,
            blobs,
            auth_header: Arc::from(auth_header.to_ascii_lowercase()),
        }
    }
}

/// Caller identity taken from the trusted identity header. The user row is
/// created on first sight.
#[derive(Debug, Clone)]
struct CurrentUser {
    id: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(&*state.auth_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AppError::Unauthorized)?
            .to_string();
        let name = parts
            .headers
            .get(USER_NAME_HEADER)
            .and_then(|value| value.to_str().ok());
        state.catalog.ensure_user(&id, name, None).await?;
        Ok(Self { id })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .init();

    let args = BackendArgs::parse();
    ensure_not_root("backend")?;
    let config = resolve_runtime_config(args.into_overrides())?;
    let host = parse_host_arg(&config.host)?;

    let blobs = BlobStore::new(&config.uploads_root);
    for bucket in BUCKETS {
        blobs.ensure_bucket(bucket).await?;
        let objects = blobs.list(bucket).await?.len();
        info!(bucket, objects, "bucket ready");
    }

    let catalog = Catalog::open(&config.database_path)
        .await
        .context("initializing catalog")?;
    info!(path = %config.database_path.display(), "catalog ready");

    let state = AppState::new(catalog, blobs, &config.auth_user_header);
    let app = router(state, config.max_upload_bytes);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/uploads/{*path}", get(serve_upload))
        .route(
            "/api/video",
            get(get_videos)
                .post(upload_video)
                .put(update_video)
                .delete(delete_video),
        )
        .route("/api/video/like", get(get_like).post(toggle_like))
        .route("/api/video/watched", get(watch_history).post(mark_watched))
        .route("/api/video/comment", post(add_comment))
        .route("/api/health", get(health))
        .fallback(|| async { AppError::not_found("endpoint not found") })
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn serve_upload(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let file = state
        .blobs
        .resolve(&path)
        .ok_or_else(|| AppError::not_found("file not found"))?;
    media::serve_file(&file, &headers).await
}

/// Parses a JSON body and runs its validation rules.
fn validated<T: Validate>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    let Json(body) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    body.validate()?;
    Ok(body)
}

/// `?limit=` only counts when it is a positive whole number.
fn parse_limit(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|limit| *limit > 0)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoQuery {
    id: Option<String>,
    author_id: Option<String>,
    search_query: Option<String>,
    limit: Option<String>,
}

async fn get_videos(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> AppResult<Response> {
    let limit = parse_limit(query.limit.as_deref());

    if let Some(author_id) = non_empty(query.author_id) {
        let videos = state.catalog.videos_by_author(&author_id).await?;
        return Ok(Json(videos).into_response());
    }

    if let Some(id) = non_empty(query.id) {
        let detail = state
            .catalog
            .video_detail(&id)
            .await?
            .ok_or_else(|| AppError::not_found("video not found"))?;
        return Ok(Json(detail).into_response());
    }

    if let Some(search) = non_empty(query.search_query) {
        let videos = state.catalog.search_videos(&search, limit).await?;
        return Ok(Json(videos).into_response());
    }

    let videos = state.catalog.list_videos(limit).await?;
    Ok(Json(videos).into_response())
}

/// One file part of an upload form.
#[derive(Debug)]
struct UploadedFile {
    file_name: Option<String>,
    content_type: Option<String>,
    data: axum::body::Bytes,
}

#[derive(Debug, Default, Validate)]
struct UploadForm {
    #[validate(
        required(message = "Title is required"),
        length(min = 1, message = "Title is required")
    )]
    title: Option<String>,
    #[validate(required(message = "Required"))]
    description: Option<String>,
    #[validate(required(message = "Required"))]
    tags: Option<String>,
    file: Option<UploadedFile>,
    thumbnail: Option<UploadedFile>,
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::bad_request(err.body_text())
}

async fn read_file_field(field: Field<'_>) -> AppResult<UploadedFile> {
    let file_name = field.file_name().map(str::to_string);
    let content_type = field.content_type().map(str::to_string);
    let data = field.bytes().await.map_err(multipart_error)?;
    Ok(UploadedFile {
        file_name,
        content_type,
        data,
    })
}

async fn read_upload_form(mut multipart: Multipart) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => form.title = Some(field.text().await.map_err(multipart_error)?),
            "description" => form.description = Some(field.text().await.map_err(multipart_error)?),
            "tags" => form.tags = Some(field.text().await.map_err(multipart_error)?),
            "file" => form.file = Some(read_file_field(field).await?),
            "thumbnail" => form.thumbnail = Some(read_file_field(field).await?),
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }
    Ok(form)
}

/// Extension for a stored thumbnail, taken from the client file name or, if
/// that has none, from the declared content type. Only image types qualify.
fn thumbnail_extension(upload: &UploadedFile) -> Option<String> {
    let from_name = upload
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let ext = from_name.or_else(|| {
        upload
            .content_type
            .as_deref()
            .and_then(mime_guess::get_mime_extensions_str)
            .and_then(|exts| exts.first())
            .map(|ext| ext.to_string())
    })?;
    let mime = mime_guess::from_ext(&ext).first()?;
    (mime.type_() == mime_guess::mime::IMAGE && is_plain_segment(&ext)).then_some(ext)
}

async fn upload_video(
    State(state): State<AppState>,
    user: CurrentUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<Video>)> {
    let form = read_upload_form(multipart).await?;
    form.validate()?;

    let video = form
        .file
        .filter(|file| !file.data.is_empty())
        .ok_or_else(|| AppError::bad_request("The video was not sent"))?;
    let thumbnail = form
        .thumbnail
        .filter(|file| !file.data.is_empty())
        .ok_or_else(|| AppError::bad_request("The thumbnail was not sent"))?;
    let thumbnail_ext = thumbnail_extension(&thumbnail)
        .ok_or_else(|| AppError::invalid_field("thumbnail", "Thumbnail must be an image"))?;

    let asset_id = Uuid::new_v4();
    let video_key = format!("{asset_id}-video.mp4");
    let thumbnail_key = format!("{asset_id}-thumbnail.{thumbnail_ext}");

    state.blobs.put(VIDEOS_BUCKET, &video_key, &video.data).await?;
    if let Err(err) = state
        .blobs
        .put(THUMBNAILS_BUCKET, &thumbnail_key, &thumbnail.data)
        .await
    {
        discard_blob(&state.blobs, VIDEOS_BUCKET, &video_key).await;
        return Err(err.into());
    }

    let created = state
        .catalog
        .create_video(NewVideo {
            title: form.title.unwrap_or_default(),
            description: form.description.unwrap_or_default(),
            tags: form.tags.unwrap_or_default(),
            video_key: video_key.clone(),
            thumbnail_key: thumbnail_key.clone(),
            author_id: user.id.clone(),
        })
        .await;
    let created = match created {
        Ok(video) => video,
        Err(err) => {
            discard_blob(&state.blobs, VIDEOS_BUCKET, &video_key).await;
            discard_blob(&state.blobs, THUMBNAILS_BUCKET, &thumbnail_key).await;
            return Err(err.into());
        }
    };

    info!(
        video_id = %created.id,
        author_id = %user.id,
        bytes = video.data.len(),
        "video uploaded"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// Best-effort cleanup of a blob whose catalog row never materialized.
async fn discard_blob(blobs: &BlobStore, bucket: &str, key: &str) {
    if let Err(err) = blobs.delete(bucket, key).await {
        warn!(bucket, key, error = %format!("{err:#}"), "failed to discard orphaned blob");
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateVideoRequest {
    #[validate(
        required(message = "Video ID is required"),
        length(min = 1, message = "Video ID is required")
    )]
    video_id: Option<String>,
    #[validate(
        required(message = "Video title is required"),
        length(min = 1, message = "Video title is required")
    )]
    new_video_title: Option<String>,
    #[validate(required(message = "Required"))]
    new_video_description: Option<String>,
    #[validate(
        required(message = "Video tags are required"),
        length(min = 1, message = "Video tags are required")
    )]
    new_video_tags: Option<String>,
}

async fn update_video(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<UpdateVideoRequest>, JsonRejection>,
) -> AppResult<Json<serde_json::Value>> {
    let body = validated(payload)?;
    let video_id = body.video_id.unwrap_or_default();
    state
        .catalog
        .update_video(
            &video_id,
            &user.id,
            &body.new_video_title.unwrap_or_default(),
            &body.new_video_description.unwrap_or_default(),
            &body.new_video_tags.unwrap_or_default(),
        )
        .await?;
    info!(video_id = %video_id, author_id = %user.id, "video updated");
    Ok(Json(json!({ "message": "success" })))
}

#[derive(Debug, Default, Deserialize, Validate)]
struct IdQuery {
    #[validate(
        required(message = "Video ID is required"),
        length(min = 1, message = "Video ID is required")
    )]
    id: Option<String>,
}

async fn delete_video(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<serde_json::Value>> {
    query.validate()?;
    let video_id = query.id.unwrap_or_default();

    let deleted = state.catalog.delete_video(&video_id, &user.id).await?;
    let (video_removed, thumbnail_removed) = tokio::join!(
        state.blobs.delete(VIDEOS_BUCKET, &deleted.video_key),
        state.blobs.delete(THUMBNAILS_BUCKET, &deleted.thumbnail_key),
    );
    video_removed?;
    thumbnail_removed?;

    info!(video_id = %video_id, author_id = %user.id, "video deleted");
    Ok(Json(json!({ "message": "success" })))
}

async fn get_like(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<serde_json::Value>> {
    query.validate()?;
    let video_id = query.id.unwrap_or_default();
    let is_liked = state.engagement.is_liked(&user.id, &video_id).await?;
    Ok(Json(json!({ "isLiked": is_liked })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct VideoIdRequest {
    #[validate(
        required(message = "Video ID is required"),
        length(min = 1, message = "Video ID is required")
    )]
    video_id: Option<String>,
}

async fn toggle_like(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<VideoIdRequest>, JsonRejection>,
) -> AppResult<Json<serde_json::Value>> {
    let video_id = validated(payload)?.video_id.unwrap_or_default();
    let like = state.engagement.toggle_like(&user.id, &video_id).await?;
    Ok(Json(json!({ "message": "success", "isLiked": like.is_liked() })))
}

async fn watch_history(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Response> {
    let history = state.engagement.watch_history(&user.id).await?;
    Ok(Json(history).into_response())
}

async fn mark_watched(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<VideoIdRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let video_id = validated(payload)?.video_id.unwrap_or_default();
    match state.engagement.mark_watched(&user.id, &video_id).await? {
        WatchOutcome::Recorded => Ok((StatusCode::CREATED, Json(json!({ "message": "success" })))),
        WatchOutcome::AlreadyWatched => Ok((
            StatusCode::OK,
            Json(json!({ "message": "video is already watched by user" })),
        )),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct NewCommentRequest {
    #[validate(
        required(message = "Video ID is required"),
        length(min = 1, message = "Video ID is required")
    )]
    video_id: Option<String>,
    #[validate(
        required(message = "Message is required"),
        length(min = 1, message = "Message is required")
    )]
    message: Option<String>,
}

async fn add_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<NewCommentRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let body = validated(payload)?;
    let video_id = body.video_id.unwrap_or_default();
    let comment_id = state
        .catalog
        .add_comment(&video_id, &user.id, &body.message.unwrap_or_default())
        .await?;
    debug!(comment_id = %comment_id, video_id = %video_id, author_id = %user.id, "comment added");
    Ok((StatusCode::CREATED, Json(json!({ "message": "success" }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const ALICE: &str = "alice";
    const BOB: &str = "bob";
    const BOUNDARY: &str = "tubeshare-test-boundary";

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let uploads = temp.path().join("uploads");
            let blobs = BlobStore::new(&uploads);
            for bucket in BUCKETS {
                blobs.ensure_bucket(bucket).await.unwrap();
            }
            let catalog = Catalog::open(&uploads.join("tubeshare.db")).await.unwrap();
            catalog.ensure_user(ALICE, Some("Alice"), None).await.unwrap();
            catalog.ensure_user(BOB, Some("Bob"), None).await.unwrap();
            Self {
                state: AppState::new(catalog, blobs, "X-User-Id"),
                _temp: temp,
            }
        }

        fn app(&self) -> Router {
            router(self.state.clone(), 1024 * 1024)
        }

        async fn insert_video(&self, author: &str, title: &str) -> Video {
            let video_key = format!("{title}-video.mp4");
            let thumbnail_key = format!("{title}-thumbnail.png");
            let bytes: Vec<u8> = (0..100u8).collect();
            self.state.blobs.put(VIDEOS_BUCKET, &video_key, &bytes).await.unwrap();
            self.state
                .blobs
                .put(THUMBNAILS_BUCKET, &thumbnail_key, b"PNG")
                .await
                .unwrap();
            self.state
                .catalog
                .create_video(NewVideo {
                    title: title.into(),
                    description: "Mock video description".into(),
                    tags: "video coding code webdev".into(),
                    video_key,
                    thumbnail_key,
                    author_id: author.into(),
                })
                .await
                .unwrap()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, body)
        }
    }

    fn user(id: &str) -> CurrentUser {
        CurrentUser { id: id.into() }
    }

    fn json_request(method: &str, uri: &str, as_user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = as_user {
            builder = builder.header("x-user-id", id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn multipart_body(text_fields: &[(&str, &str)], files: &[(&str, &str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in text_fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, file_name, content_type, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(as_user: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/video")
            .header("x-user-id", as_user)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn backend_args_map_to_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--uploads-root",
            "/srv/uploads",
            "--database",
            "/srv/db/tubeshare.db",
            "--port",
            "8080",
            "--host",
            "0.0.0.0",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.uploads_root, Some(PathBuf::from("/srv/uploads")));
        assert_eq!(overrides.database_path, Some(PathBuf::from("/srv/db/tubeshare.db")));
        assert_eq!(overrides.port, Some(8080));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert!(overrides.env_path.is_none());

        assert!(BackendArgs::try_parse_from(["backend", "--port", "nope"]).is_err());
        assert!(parse_host_arg("not-an-ip").is_err());
    }

    #[test]
    fn limit_must_be_positive_integer() {
        assert_eq!(parse_limit(Some("5")), Some(5));
        assert_eq!(parse_limit(Some(" 12 ")), Some(12));
        assert_eq!(parse_limit(Some("0")), None);
        assert_eq!(parse_limit(Some("-3")), None);
        assert_eq!(parse_limit(Some("ten")), None);
        assert_eq!(parse_limit(None), None);
    }

    #[test]
    fn thumbnail_extension_requires_an_image() {
        let file = |name: Option<&str>, content_type: Option<&str>| UploadedFile {
            file_name: name.map(str::to_string),
            content_type: content_type.map(str::to_string),
            data: axum::body::Bytes::from_static(b"x"),
        };
        assert_eq!(thumbnail_extension(&file(Some("cover.PNG"), None)).as_deref(), Some("png"));
        assert_eq!(thumbnail_extension(&file(Some("cover.jpg"), None)).as_deref(), Some("jpg"));
        assert!(thumbnail_extension(&file(None, Some("image/png"))).is_some());
        assert_eq!(thumbnail_extension(&file(Some("cover.txt"), None)), None);
        assert_eq!(thumbnail_extension(&file(None, None)), None);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let ctx = BackendTestContext::new().await;
        let (status, body) = ctx
            .send(Request::get("/api/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn identity_header_is_required() {
        let ctx = BackendTestContext::new().await;
        let (status, body) = ctx
            .send(json_request("POST", "/api/video/like", None, json!({ "videoId": "x" })))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let (status, _) = ctx
            .send(Request::get("/api/video/watched").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn first_request_creates_the_user() {
        let ctx = BackendTestContext::new().await;
        let request = Request::get("/api/video/watched")
            .header("x-user-id", "carol")
            .header(USER_NAME_HEADER, "Carol")
            .body(Body::empty())
            .unwrap();
        let (status, body) = ctx.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let carol = ctx.state.catalog.get_user("carol").await.unwrap().unwrap();
        assert_eq!(carol.name, "Carol");
    }

    #[tokio::test]
    async fn like_toggle_round_trip() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;

        let Json(first) = super::toggle_like(
            State(ctx.state.clone()),
            user(BOB),
            Ok(Json(VideoIdRequest {
                video_id: Some(video.id.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(first, json!({ "message": "success", "isLiked": true }));

        let Json(state) = super::get_like(
            State(ctx.state.clone()),
            user(BOB),
            Query(IdQuery {
                id: Some(video.id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(state["isLiked"], true);
        let stored = ctx.state.catalog.get_video(&video.id).await.unwrap().unwrap();
        assert_eq!(stored.likes, 1);

        let Json(second) = super::toggle_like(
            State(ctx.state.clone()),
            user(BOB),
            Ok(Json(VideoIdRequest {
                video_id: Some(video.id.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(second["isLiked"], false);
        let stored = ctx.state.catalog.get_video(&video.id).await.unwrap().unwrap();
        assert_eq!(stored.likes, 0);
    }

    #[tokio::test]
    async fn liking_missing_video_is_not_found() {
        let ctx = BackendTestContext::new().await;
        let (status, body) = ctx
            .send(json_request(
                "POST",
                "/api/video/like",
                Some(BOB),
                json!({ "videoId": "missing" }),
            ))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "video not found");
    }

    #[tokio::test]
    async fn watched_is_recorded_once() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;

        let body = json!({ "videoId": video.id });
        let (status, first) = ctx
            .send(json_request("POST", "/api/video/watched", Some(BOB), body.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["message"], "success");

        let (status, second) = ctx
            .send(json_request("POST", "/api/video/watched", Some(BOB), body))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["message"], "video is already watched by user");

        let stored = ctx.state.catalog.get_video(&video.id).await.unwrap().unwrap();
        assert_eq!(stored.views, 1);

        let response = super::watch_history(State(ctx.state.clone()), user(BOB))
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let history: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["videoId"], video.id);
        assert_eq!(history[0]["video"]["views"], 1);
    }

    #[tokio::test]
    async fn invalid_bodies_are_rejected_with_details() {
        let ctx = BackendTestContext::new().await;
        let (status, body) = ctx
            .send(json_request(
                "POST",
                "/api/video/comment",
                Some(BOB),
                json!({ "videoId": "", "message": "" }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["details"][0]["field"], "message");
        assert_eq!(body["details"][1]["field"], "videoId");

        let request = Request::builder()
            .method("POST")
            .uri("/api/video/watched")
            .header("x-user-id", BOB)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = ctx.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn comments_show_up_in_video_detail() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;

        let (_, created) = super::add_comment(
            State(ctx.state.clone()),
            user(BOB),
            Ok(Json(NewCommentRequest {
                video_id: Some(video.id.clone()),
                message: Some("Nice video!".into()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(created.0["message"], "success");

        let (status, detail) = ctx
            .send(
                Request::get(format!("/api/video?id={}", video.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["title"], "clip");
        assert_eq!(detail["author"]["name"], "Alice");
        assert_eq!(detail["comments"][0]["message"], "Nice video!");
        assert_eq!(detail["comments"][0]["author"]["id"], BOB);

        let (status, _) = ctx
            .send(json_request(
                "POST",
                "/api/video/comment",
                Some(BOB),
                json!({ "videoId": "missing", "message": "hi" }),
            ))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn video_listing_modes() {
        let ctx = BackendTestContext::new().await;
        ctx.insert_video(ALICE, "rust tutorial").await;
        ctx.insert_video(BOB, "cooking pasta").await;

        let (status, all) = ctx
            .send(Request::get("/api/video").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, limited) = ctx
            .send(Request::get("/api/video?limit=1").body(Body::empty()).unwrap())
            .await;
        assert_eq!(limited.as_array().unwrap().len(), 1);

        let (_, ignored) = ctx
            .send(Request::get("/api/video?limit=abc").body(Body::empty()).unwrap())
            .await;
        assert_eq!(ignored.as_array().unwrap().len(), 2);

        let (_, found) = ctx
            .send(
                Request::get("/api/video?searchQuery=RUST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(found.as_array().unwrap().len(), 1);
        assert_eq!(found[0]["title"], "rust tutorial");

        let (_, by_author) = ctx
            .send(
                Request::get(format!("/api/video?authorId={BOB}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(by_author.as_array().unwrap().len(), 1);
        assert_eq!(by_author[0]["author"]["name"], "Bob");

        let (status, _) = ctx
            .send(Request::get("/api/video?id=missing").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn only_the_author_can_update() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;
        let body = json!({
            "videoId": video.id,
            "newVideoTitle": "Renamed",
            "newVideoDescription": "",
            "newVideoTags": "new tags",
        });

        let (status, _) = ctx
            .send(json_request("PUT", "/api/video", Some(BOB), body.clone()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, reply) = ctx
            .send(json_request("PUT", "/api/video", Some(ALICE), body))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["message"], "success");

        let stored = ctx.state.catalog.get_video(&video.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(stored.description, "");
        assert_eq!(stored.tags, "new tags");
    }

    #[tokio::test]
    async fn delete_removes_row_and_blobs() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;

        let (status, _) = ctx
            .send(
                Request::delete("/api/video")
                    .header("x-user-id", ALICE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/video?id={}", video.id);
        let (status, _) = ctx
            .send(
                Request::delete(uri.as_str())
                    .header("x-user-id", BOB)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, reply) = ctx
            .send(
                Request::delete(uri.as_str())
                    .header("x-user-id", ALICE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["message"], "success");

        assert!(ctx.state.catalog.get_video(&video.id).await.unwrap().is_none());
        let blobs = &ctx.state.blobs;
        assert!(!blobs.exists(VIDEOS_BUCKET, &video.video_key).await.unwrap());
        assert!(!blobs.exists(THUMBNAILS_BUCKET, &video.thumbnail_key).await.unwrap());
    }

    #[tokio::test]
    async fn delete_still_removes_thumbnail_when_video_removal_fails() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;
        let video_path = ctx
            .state
            .blobs
            .resolve(&format!("{VIDEOS_BUCKET}/{}", video.video_key))
            .unwrap();
        std::fs::remove_file(&video_path).unwrap();
        std::fs::create_dir_all(video_path.join("stuck")).unwrap();

        let (status, body) = ctx
            .send(
                Request::delete(format!("/api/video?id={}", video.id))
                    .header("x-user-id", ALICE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal Server Error");

        let blobs = &ctx.state.blobs;
        assert!(!blobs.exists(THUMBNAILS_BUCKET, &video.thumbnail_key).await.unwrap());
        assert!(ctx.state.catalog.get_video(&video.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_stores_both_assets() {
        let ctx = BackendTestContext::new().await;
        let body = multipart_body(
            &[("title", "My clip"), ("description", "desc"), ("tags", "a b")],
            &[
                ("file", "clip.mp4", "video/mp4", b"fake video bytes"),
                ("thumbnail", "cover.png", "image/png", b"fake png"),
            ],
        );
        let (status, created) = ctx.send(upload_request(ALICE, body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["title"], "My clip");
        assert_eq!(created["authorId"], ALICE);
        assert_eq!(created["views"], 0);
        assert_eq!(created["likes"], 0);

        let video_key = created["videoKey"].as_str().unwrap();
        let thumbnail_key = created["thumbnailKey"].as_str().unwrap();
        assert!(video_key.ends_with("-video.mp4"));
        assert!(thumbnail_key.ends_with("-thumbnail.png"));
        let blobs = &ctx.state.blobs;
        assert!(blobs.exists(VIDEOS_BUCKET, video_key).await.unwrap());
        assert!(blobs.exists(THUMBNAILS_BUCKET, thumbnail_key).await.unwrap());
    }

    #[tokio::test]
    async fn upload_without_thumbnail_is_rejected() {
        let ctx = BackendTestContext::new().await;
        let body = multipart_body(
            &[("title", "My clip"), ("description", ""), ("tags", "")],
            &[("file", "clip.mp4", "video/mp4", b"fake video bytes")],
        );
        let (status, reply) = ctx.send(upload_request(ALICE, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["error"], "The thumbnail was not sent");
        assert!(ctx.state.blobs.list(VIDEOS_BUCKET).await.unwrap().is_empty());

        let body = multipart_body(
            &[("description", ""), ("tags", "")],
            &[("file", "clip.mp4", "video/mp4", b"fake")],
        );
        let (status, reply) = ctx.send(upload_request(ALICE, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["details"][0]["field"], "title");
    }

    #[tokio::test]
    async fn uploads_route_streams_ranges() {
        let ctx = BackendTestContext::new().await;
        let video = ctx.insert_video(ALICE, "clip").await;

        let request = Request::get(format!("/uploads/videos/{}", video.video_key))
            .header(header::RANGE, "bytes=0-9")
            .body(Body::empty())
            .unwrap();
        let response = ctx.app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 0-9/100"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), (0..10u8).collect::<Vec<_>>().as_slice());

        let request = Request::get(format!("/uploads/thumbnails/{}", video.thumbnail_key))
            .body(Body::empty())
            .unwrap();
        let response = ctx.app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn uploads_route_refuses_escapes() {
        let ctx = BackendTestContext::new().await;
        for uri in [
            "/uploads/videos/..%2F..%2Fetc%2Fpasswd",
            "/uploads/tubeshare.db",
            "/uploads/videos/missing.mp4",
        ] {
            let (status, body) = ctx
                .send(Request::get(uri).body(Body::empty()).unwrap())
                .await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["error"], "file not found", "{uri}");
        }
    }

    #[tokio::test]
    async fn unknown_api_path_is_json_not_found() {
        let ctx = BackendTestContext::new().await;
        let (status, body) = ctx
            .send(Request::get("/api/nope").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "endpoint not found");
    }
}
