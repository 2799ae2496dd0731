//! The download request coordinator.
//!
//! Order matters and is load-bearing: admission first (so rejected
//! requests cost nothing), then signature, then the manifest lookup, then
//! limits and filters — only then are response headers written and the
//! assembler started. Once the streaming body is handed to the client the
//! status line is fixed; the callback carries the authoritative outcome.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use zipstream_core::{DownloadManifest, Error};

use crate::admission::{DownloadSlot, RateDecision};
use crate::assembler::{CountingWriter, DownloadAttempt};
use crate::callback::CallbackPayload;
use crate::context::{client_ip, RequestId};
use crate::error::ApiError;
use crate::metrics::{
    CLIENT_DISCONNECTS_TOTAL, COMPRESSION_RATIO, DOWNLOADS_TOTAL, FILES_REQUESTED, FILES_SUCCESS,
    INCOMING_BYTES, OUTGOING_BYTES, REQUEST_DURATION,
};
use crate::server::AppState;
use crate::signature::VerifyError;

/// Buffer between the assembler and the response body; client-side TCP
/// backpressure propagates through it.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Query parameters on the download route.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    /// Unix-seconds expiry, signed into the request when present.
    pub expiry: Option<String>,
    /// Lowercase hex HMAC-SHA256 signature.
    pub signature: Option<String>,
}

/// Handler for `GET /` — the id segment is required.
pub async fn missing_id() -> ApiError {
    ApiError::bad_request("missing id")
}

/// Handler for `GET /{id}`: the streaming ZIP download.
#[allow(clippy::too_many_lines)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let request_id = request_id.map_or_else(String::new, |Extension(RequestId(id))| id);
    let with_id = |err: ApiError| err.with_request_id(request_id.clone());

    // Admission gates fail fast; no queueing.
    let Some(slot) = state.admission.try_acquire_slot() else {
        return with_id(ApiError::at_capacity()).into_response();
    };

    let ip = client_ip(&headers, peer);
    if let RateDecision::Limited { retry_after_secs } = state.admission.check_ip(&ip).await {
        tracing::warn!(%ip, %id, "rate limit exceeded");
        return with_id(ApiError::rate_limited(retry_after_secs)).into_response();
    }

    if id.is_empty() {
        return with_id(ApiError::bad_request("missing id")).into_response();
    }

    if let Err(err) = state.verifier.verify(
        &id,
        query.expiry.as_deref(),
        query.signature.as_deref(),
    ) {
        let api_err = match err {
            VerifyError::InvalidExpiry(_) => ApiError::bad_request(err.to_string()),
            VerifyError::Expired => {
                tracing::warn!(%id, "expired request");
                ApiError::gone(err.to_string())
            }
            VerifyError::MissingSignature | VerifyError::InvalidSignature => {
                tracing::warn!(%id, error = %err, "verification failed");
                ApiError::unauthorized(err.to_string())
            }
        };
        return with_id(api_err).into_response();
    }

    let manifest = match state.manifests.lookup(&id).await {
        Ok(manifest) => manifest,
        Err(Error::NotFound(_)) => {
            tracing::warn!(%id, "manifest not found");
            return with_id(ApiError::not_found("not found")).into_response();
        }
        Err(err) => {
            tracing::error!(%id, error = %err, "manifest lookup failed");
            return with_id(ApiError::internal("manifest lookup failed")).into_response();
        }
    };

    if manifest.objects.is_empty() {
        return with_id(ApiError::bad_request("manifest has no objects")).into_response();
    }
    let max_files = state.config.max_files_per_request;
    if max_files > 0 && manifest.objects.len() > max_files {
        return with_id(ApiError::bad_request(format!(
            "too many files: {} exceeds limit of {max_files}",
            manifest.objects.len()
        )))
        .into_response();
    }

    let filtered = filter_objects(
        &manifest.objects,
        &state.config.allowed_extensions,
        &state.config.blocked_extensions,
    );
    if filtered.is_empty() {
        return with_id(ApiError::bad_request("all files excluded by extension filters"))
            .into_response();
    }

    if manifest.password.is_some() {
        // Per-entry encryption is disabled in this build; see DESIGN.md.
        tracing::warn!(
            %id,
            enabled = state.config.allow_password_protected,
            "manifest password ignored: encoder has no per-entry encryption"
        );
    }

    let filename = prepare_filename(
        manifest.name.as_deref(),
        state.config.sanitize_filenames,
        state.config.append_ymd,
    );

    let (read_half, write_half) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let out_bytes = Arc::new(AtomicU64::new(0));
    let sink = CountingWriter::new(write_half, Arc::clone(&out_bytes));

    let attempt = DownloadAttempt {
        id: id.clone(),
        bucket: manifest.bucket.clone(),
        objects: filtered,
        cancel: CancellationToken::new(),
    };

    tokio::spawn(run_attempt(
        Arc::clone(&state),
        slot,
        attempt,
        manifest.clone(),
        sink,
        out_bytes,
        started,
        request_id.clone(),
    ));

    let mut response = Response::new(Body::from_stream(ReaderStream::new(read_half)));
    apply_headers(response.headers_mut(), &manifest, &filename);
    response
}

/// Applies manifest custom headers, then the standard archive headers on
/// top of them.
fn apply_headers(headers: &mut HeaderMap, manifest: &DownloadManifest, filename: &str) {
    if let Some(custom) = &manifest.custom_headers {
        for (name, value) in custom {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid custom header"),
            }
        }
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
    {
        headers.insert(CONTENT_DISPOSITION, value);
    }
}

/// The spawned half of the request: runs the assembler, records outcome
/// metrics, and hands the payload to the callback dispatcher.
#[allow(clippy::too_many_arguments)]
async fn run_attempt<W>(
    state: Arc<AppState>,
    slot: DownloadSlot,
    attempt: DownloadAttempt,
    manifest: DownloadManifest,
    sink: W,
    out_bytes: Arc<AtomicU64>,
    started: Instant,
    request_id: String,
) where
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    // The whole-request deadline fires the same token as a disconnect.
    let watchdog = {
        let cancel = attempt.cancel.clone();
        let deadline = state.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            cancel.cancel();
        })
    };

    let report = state.assembler.assemble(&attempt, sink).await;
    watchdog.abort();

    if report.sink_failed {
        metrics::counter!(CLIENT_DISCONNECTS_TOTAL).increment(1);
        tracing::warn!(id = %attempt.id, %request_id, "client disconnected");
    }

    let duration = started.elapsed();
    let out_total = out_bytes.load(Ordering::SeqCst);

    metrics::histogram!(REQUEST_DURATION).record(duration.as_secs_f64());
    #[allow(clippy::cast_precision_loss)]
    {
        metrics::histogram!(OUTGOING_BYTES).record(out_total as f64);
        metrics::histogram!(INCOMING_BYTES).record(report.in_bytes as f64);
        if report.in_bytes > 0 {
            metrics::histogram!(COMPRESSION_RATIO)
                .record(out_total as f64 / report.in_bytes as f64);
        }
        metrics::histogram!(FILES_REQUESTED).record(attempt.objects.len() as f64);
        metrics::histogram!(FILES_SUCCESS).record(report.success_count as f64);
    }
    metrics::counter!(DOWNLOADS_TOTAL, "status" => report.status.as_str()).increment(1);

    tracing::info!(
        id = %attempt.id,
        %request_id,
        status = report.status.as_str(),
        duration_ms = duration.as_millis() as u64,
        files = report.success_count,
        out_bytes = out_total,
        "download handled"
    );

    // The admission slot is released before the callback runs; delivery
    // must never hold capacity.
    drop(slot);

    if let Some(callback_url) = manifest.callback.as_deref() {
        let payload = CallbackPayload {
            id: attempt.id.clone(),
            status: report.status.as_str().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            message: report.message.clone(),
            duration_ms: duration.as_millis() as u64,
            file_count: attempt.objects.len(),
            compressed_size_bytes: out_total,
        };
        state.callbacks.dispatch(callback_url, payload).await;
    }
}

// ============================================================================
// Filename preparation and extension filtering
// ============================================================================

/// Builds the archive filename: base name (or `download`), optional
/// sanitization, optional date suffix, `.zip` extension.
fn prepare_filename(name: Option<&str>, sanitize: bool, append_ymd: bool) -> String {
    let mut filename = match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "download".to_string(),
    };

    if filename.to_ascii_lowercase().ends_with(".zip") {
        filename.truncate(filename.len() - 4);
    }

    if sanitize {
        filename = sanitize_filename(&filename);
    }
    if filename.is_empty() {
        filename = "download".to_string();
    }

    if append_ymd {
        filename.push_str(&format!("-{}", Utc::now().format("%Y%m%d")));
    }

    filename.push_str(".zip");
    filename
}

/// Maps bytes outside printable ASCII and filesystem-hostile characters to
/// `_`, then trims leading/trailing spaces and dots.
fn sanitize_filename(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            if !(' '..='~').contains(&c) || "\\/:*?\"<>|".contains(c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    mapped.trim_matches(|c| c == ' ' || c == '.').to_string()
}

/// Applies the allow list, then the block list; the block list wins.
fn filter_objects(objects: &[String], allowed: &[String], blocked: &[String]) -> Vec<String> {
    objects
        .iter()
        .filter(|key| {
            let ext = extension(key);
            if !allowed.is_empty()
                && !ext
                    .as_deref()
                    .is_some_and(|ext| list_contains(allowed, ext))
            {
                return false;
            }
            if let Some(ext) = ext.as_deref() {
                if list_contains(blocked, ext) {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect()
}

fn list_contains(list: &[String], ext: &str) -> bool {
    list.iter()
        .any(|entry| entry.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Lowercased extension of the key's base name, `None` when there is none.
fn extension(key: &str) -> Option<String> {
    FsPath::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_is_download() {
        assert_eq!(prepare_filename(None, false, false), "download.zip");
        assert_eq!(prepare_filename(Some(""), false, false), "download.zip");
    }

    #[test]
    fn test_trailing_zip_is_stripped_case_insensitively() {
        assert_eq!(prepare_filename(Some("report.zip"), false, false), "report.zip");
        assert_eq!(prepare_filename(Some("report.ZIP"), false, false), "report.zip");
        assert_eq!(prepare_filename(Some("reports"), false, false), "reports.zip");
    }

    #[test]
    fn test_sanitization_replaces_hostile_characters() {
        assert_eq!(
            prepare_filename(Some("my/weird:name?"), true, false),
            "my_weird_name_.zip"
        );
        assert_eq!(
            prepare_filename(Some("  dotted.name.  "), true, false),
            "dotted.name.zip"
        );
        assert_eq!(prepare_filename(Some("üñïçödé"), true, false), "______.zip");
    }

    #[test]
    fn test_sanitizing_everything_away_falls_back() {
        assert_eq!(prepare_filename(Some(" .. "), true, false), "download.zip");
    }

    #[test]
    fn test_date_suffix_has_expected_shape() {
        let name = prepare_filename(Some("report"), false, true);
        let expected = format!("report-{}.zip", Utc::now().format("%Y%m%d"));
        assert_eq!(name, expected);
    }

    #[test]
    fn test_preparation_is_idempotent() {
        for input in [None, Some("report"), Some("report.zip"), Some("a b:c")] {
            let once = prepare_filename(input, true, false);
            let twice = prepare_filename(Some(&once), true, false);
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| (*k).to_string()).collect()
    }

    #[test]
    fn test_empty_lists_allow_everything() {
        let objects = keys(&["a.txt", "b", "c.exe"]);
        assert_eq!(filter_objects(&objects, &[], &[]), objects);
    }

    #[test]
    fn test_allow_list_drops_other_extensions() {
        let objects = keys(&["a.txt", "b.json", "noext", "c.TXT"]);
        let allowed = keys(&["txt"]);
        assert_eq!(
            filter_objects(&objects, &allowed, &[]),
            keys(&["a.txt", "c.TXT"])
        );
    }

    #[test]
    fn test_block_list_wins_over_allow_list() {
        let objects = keys(&["a.txt", "b.txt", "danger.exe"]);
        let allowed = keys(&["txt", "exe"]);
        let blocked = keys(&["exe"]);
        assert_eq!(
            filter_objects(&objects, &allowed, &blocked),
            keys(&["a.txt", "b.txt"])
        );
    }

    #[test]
    fn test_list_entries_may_carry_leading_dots() {
        let objects = keys(&["a.txt", "b.exe"]);
        let blocked = keys(&[".exe"]);
        assert_eq!(filter_objects(&objects, &[], &blocked), keys(&["a.txt"]));
    }

    #[test]
    fn test_ordering_preserved_after_filtering() {
        let objects = keys(&["z.txt", "a.exe", "m.txt"]);
        let blocked = keys(&["exe"]);
        assert_eq!(
            filter_objects(&objects, &[], &blocked),
            keys(&["z.txt", "m.txt"])
        );
    }

    #[test]
    fn test_extension_extraction() {
        assert_eq!(extension("a.txt"), Some("txt".to_string()));
        assert_eq!(extension("x/y/archive.TAR.GZ"), Some("gz".to_string()));
        assert_eq!(extension("noext"), None);
        assert_eq!(extension("dir.d/noext"), None);
    }
}
