//! 断点续传上传处理器：状态查询、续传写入与中止。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cookie::time::Duration as CookieDuration;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, admit_upload};
use crate::atomic::{CompletionHook, hash_file};
use crate::auth::Principal;
use crate::config::{
    CONTENT_SHA1_HEADER, UPLOAD_COOKIE_NAME, UPLOAD_OFFSET_HEADER, UPLOAD_SESSION_HEADER,
};
use crate::error::{ApiError, ErrorClass, UploadError};
use crate::journal::{CONTENT_HASH_LEN, ContentHash, FileState, Header};
use crate::locking::{BusyGuard, BusyRegistry};
use crate::pipeline::run_pipeline;
use crate::session::SessionStore;
use crate::storage::{Storage, UploadPaths};
use crate::wal::create_journal;

#[derive(Debug)]
pub struct UploadConfig {
    /// Largest accepted total length, 0 for no limit.
    pub max_total_size: u64,
    /// Sync data and journal around every hunk.
    pub durable: bool,
}

/// Process-wide upload state shared by all connections.
#[derive(Debug)]
pub struct UploadRegistry {
    pub busy: BusyRegistry,
    pub sessions: SessionStore,
}

impl UploadRegistry {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            busy: BusyRegistry::new(),
            sessions: SessionStore::new(session_ttl),
        }
    }
}

/// Resume payload sent whenever the server reports where an upload stands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub start_offset: u64,
    pub count: u64,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<FileState> for ResumeState {
    fn from(state: FileState) -> Self {
        Self {
            start_offset: state.start_offset,
            count: state.remaining(),
            file_size: state.file_size,
            error: None,
        }
    }
}

impl ResumeState {
    pub fn with_error(mut self, error: &UploadError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// 查询上传状态：返回服务端确认的续传偏移。
pub async fn upload_status(
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
) -> Result<Response, ApiError> {
    let paths = storage.resolve_upload(principal.name(), &name).await?;
    // Admission may repair files, so it needs the same exclusion as a write.
    let Some(hold) = registry.busy.try_acquire(&paths.key) else {
        return Err(UploadError::Busy.into());
    };
    let Admission { state, refusal } = admit(&paths, &hold).await?;
    if let Some(error) = refusal {
        return Err(refused(&paths, error, state));
    }
    Ok(state_response(StatusCode::OK, state))
}

/// 写入上传数据：从确认偏移处继续，完成后提升为最终文件。
#[allow(clippy::too_many_arguments)]
pub async fn upload_file(
    Path(name): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(config): Extension<Arc<UploadConfig>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
    Extension(hook): Extension<Arc<dyn CompletionHook>>,
    body: AxumBody,
) -> Response {
    let paths = match storage.resolve_upload(principal.name(), &name).await {
        Ok(paths) => paths,
        Err(err) => return ApiError::from(err).into_response(),
    };
    let Some(hold) = registry.busy.try_acquire(&paths.key) else {
        info!(key = paths.key, "upload refused, file busy");
        return ApiError::from(UploadError::Busy).into_response();
    };

    let token = session_token(&headers, &jar);
    let (session, created) = registry.sessions.open(token.as_deref(), &paths).await;
    debug!(
        session = session.session_id,
        path = ?session.storage_path,
        created,
        "upload session"
    );
    let context = UploadContext {
        storage: &storage,
        config: &config,
        registry: &registry,
        hook: &hook,
        paths: &paths,
        hold: &hold,
        session_id: &session.session_id,
    };
    let outcome = context
        .receive(&headers, body, session.last_known_offset)
        .await;
    if !created {
        return outcome.into_response();
    }

    let ttl = registry.sessions.ttl().as_secs() as i64;
    let cookie = Cookie::build((UPLOAD_COOKIE_NAME, session.session_id.clone()))
        .path("/api/upload")
        .http_only(true)
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::seconds(ttl))
        .build();
    (
        jar.add(cookie),
        [(UPLOAD_SESSION_HEADER, session.session_id)],
        outcome,
    )
        .into_response()
}

/// 中止上传：删除进行中的文件与 journal。
pub async fn abort_upload(
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
) -> Result<StatusCode, ApiError> {
    let paths = storage.resolve_upload(principal.name(), &name).await?;
    let Some(hold) = registry.busy.try_acquire(&paths.key) else {
        return Err(UploadError::Busy.into());
    };

    let doomed = [paths.partial_path.clone(), paths.journal_path.clone()];
    let removed = blocking(&hold, move || {
        let mut removed = false;
        for path in &doomed {
            match std::fs::remove_file(path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    })
    .await?
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    registry.sessions.remove_target(&paths.key).await;
    if !removed {
        return Err(ApiError::NotFound("no upload in progress".into()));
    }
    info!(key = paths.key, "upload aborted");
    Ok(StatusCode::NO_CONTENT)
}

struct UploadContext<'a> {
    storage: &'a Storage,
    config: &'a UploadConfig,
    registry: &'a UploadRegistry,
    hook: &'a Arc<dyn CompletionHook>,
    paths: &'a UploadPaths,
    hold: &'a BusyGuard,
    session_id: &'a str,
}

impl UploadContext<'_> {
    async fn receive(
        &self,
        headers: &HeaderMap,
        body: AxumBody,
        last_known_offset: Option<u64>,
    ) -> Result<Response, ApiError> {
        let paths = self.paths;
        let claimed = header_u64(headers, UPLOAD_OFFSET_HEADER)?
            .or(last_known_offset)
            .unwrap_or(0);
        let content_length = header_u64(headers, header::CONTENT_LENGTH.as_str())?;
        let request_hash = content_hash(headers)?;

        let Admission { state, refusal } = admit(paths, self.hold).await?;
        if let Some(error) = refusal {
            return Err(refused(paths, error, state));
        }
        if state.start_offset != claimed {
            info!(
                key = paths.key,
                claimed,
                offset = state.start_offset,
                "upload offset conflict"
            );
            self.record_offset(state.start_offset).await;
            return Err(ApiError::upload(
                UploadError::OffsetMismatch {
                    requested: claimed,
                    expected: state.start_offset,
                },
                state,
            ));
        }

        let (state, count) = if claimed == 0 {
            self.start_fresh(content_length, request_hash).await?
        } else {
            match content_length {
                Some(len) if len > state.remaining() => {
                    return Err(ApiError::upload(UploadError::BodyTooLong, state));
                }
                Some(len) => (state, len),
                None => (state, state.remaining()),
            }
        };

        info!(
            key = paths.key,
            offset = state.start_offset,
            count,
            file_size = state.file_size,
            "receiving upload"
        );
        let reader = StreamReader::new(BodyExt::into_data_stream(body).map_err(io::Error::other));
        let report = run_pipeline(
            reader,
            paths,
            self.hold.clone(),
            state.start_offset,
            count,
            self.config.durable,
        )
        .await;

        if let Err(error) = report.result {
            let Admission {
                state: current,
                refusal,
            } = admit(paths, self.hold).await?;
            if let Some(refusal) = refusal {
                warn!(key = paths.key, error = %refusal, "re-admission after failed upload refused");
            }
            info!(
                key = paths.key,
                received = report.received,
                committed = report.committed,
                offset = current.start_offset,
                retryable = error.is_retryable(),
                error = %error,
                "upload interrupted"
            );
            self.record_offset(current.start_offset).await;
            return Err(ApiError::upload(error, current));
        }

        let state = FileState {
            start_offset: state.start_offset + count,
            ..state
        };
        if !state.is_complete() {
            self.record_offset(state.start_offset).await;
            return Ok(state_response(StatusCode::ACCEPTED, state));
        }
        self.complete(state, request_hash).await
    }

    /// Replaces any previous journal with one for a `Content-Length` byte file.
    async fn start_fresh(
        &self,
        content_length: Option<u64>,
        content_hash: Option<ContentHash>,
    ) -> Result<(FileState, u64), ApiError> {
        let total = content_length.ok_or(UploadError::LengthRequired)?;
        let limit = self.config.max_total_size;
        if limit > 0 && total > limit {
            return Err(UploadError::TooLarge { limit }.into());
        }
        self.storage.prepare_dir(self.paths).await?;

        let header = Header {
            expected_length: total,
            content_hash,
        };
        let paths = self.paths.clone();
        blocking(self.hold, move || create_journal(&paths, &header))
            .await?
            .map_err(UploadError::from)?;
        Ok((FileState::from_header(&header), total))
    }

    async fn complete(
        &self,
        state: FileState,
        request_hash: Option<ContentHash>,
    ) -> Result<Response, ApiError> {
        let paths = self.paths;
        let hash = match state.content_hash.or(request_hash) {
            Some(expected) => {
                let partial = paths.partial_path.clone();
                let actual = blocking(self.hold, move || hash_file(&partial))
                    .await?
                    .map_err(UploadError::from)?;
                if actual != expected {
                    warn!(
                        key = paths.key,
                        expected = hex::encode(expected),
                        actual = hex::encode(actual),
                        "content hash mismatch"
                    );
                    return Err(ApiError::upload(UploadError::HashMismatch, state));
                }
                Some(actual)
            }
            None => None,
        };

        let hook = self.hook.clone();
        let hook_paths = paths.clone();
        blocking(self.hold, move || hook.on_upload_complete(&hook_paths, hash.as_ref()))
            .await?
            .map_err(UploadError::from)?;
        self.registry.sessions.remove(self.session_id).await;
        info!(key = paths.key, file_size = state.file_size, "upload complete");

        let mut response = state_response(StatusCode::CREATED, state);
        if let Ok(modified) = fs::metadata(&paths.final_path)
            .await
            .and_then(|metadata| metadata.modified())
            && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
        {
            response.headers_mut().insert(header::LAST_MODIFIED, value);
        }
        Ok(response)
    }

    async fn record_offset(&self, offset: u64) {
        self.registry
            .sessions
            .record_offset(self.session_id, offset)
            .await;
    }
}

async fn admit(paths: &UploadPaths, hold: &BusyGuard) -> Result<Admission, ApiError> {
    let paths = paths.clone();
    blocking(hold, move || admit_upload(&paths)).await
}

/// Runs file work on the blocking pool; the task keeps `hold` until it ends.
async fn blocking<T, F>(hold: &BusyGuard, task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let hold = hold.clone();
    tokio::task::spawn_blocking(move || {
        let output = task();
        drop(hold);
        output
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))
}

/// Logs an admission refusal for the operator and converts it.
fn refused(paths: &UploadPaths, error: UploadError, state: FileState) -> ApiError {
    match error.class() {
        ErrorClass::Format => error!(key = paths.key, error = %error, "journal unreadable"),
        ErrorClass::Corruption => warn!(key = paths.key, error = %error, "upload refused"),
        _ => info!(key = paths.key, error = %error, "upload refused"),
    }
    if matches!(error, UploadError::AlreadyComplete) {
        return ApiError::from(error);
    }
    ApiError::upload(error, state)
}

fn state_response(status: StatusCode, state: FileState) -> Response {
    (
        status,
        [(UPLOAD_OFFSET_HEADER, state.start_offset.to_string())],
        JsonResponse(ResumeState::from(state)),
    )
        .into_response()
}

fn session_token(headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
    headers
        .get(UPLOAD_SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            jar.get(UPLOAD_COOKIE_NAME)
                .map(|cookie| cookie.value().to_string())
        })
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {name} header")))
}

fn content_hash(headers: &HeaderMap) -> Result<Option<ContentHash>, ApiError> {
    let Some(value) = headers.get(CONTENT_SHA1_HEADER) else {
        return Ok(None);
    };
    let mut hash = [0u8; CONTENT_HASH_LEN];
    value
        .to_str()
        .ok()
        .and_then(|value| hex::decode_to_slice(value.trim(), &mut hash).ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {CONTENT_SHA1_HEADER} header")))?;
    Ok(Some(hash))
}
