//! The streaming archive assembler.
//!
//! Fetches are concurrent up to the pool weight; encoding is strictly
//! serialized because a ZIP stream is append-only with a trailing central
//! directory. Whichever fetch acquires the encoder mutex first writes its
//! entry first — callers that need source order set the pool weight to 1.
//!
//! The assembler never aborts sibling tasks on a fatal error; in-flight
//! work finishes and all results are collected before the outcome is
//! classified. The encoder is never rolled back: a failed copy may leave a
//! partial entry, and bytes already on the wire are already gone.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use futures::io::AsyncWriteExt as _;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt as _};
use tokio_util::sync::CancellationToken;

use zipstream_core::storage::ObjectStore;
use zipstream_core::Error;

use crate::metrics::{FILES_FETCH_TOTAL, MISSING_FILES_TOTAL};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Terminal classification of one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Every requested object was archived.
    Completed,
    /// The archive was delivered but one or more entries are missing.
    Partial,
    /// The attempt failed; the stream may be truncated.
    Failed,
}

impl DownloadStatus {
    /// Metric/callback label for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Per-request assembly input, destroyed at request end.
#[derive(Debug)]
pub struct DownloadAttempt {
    /// Manifest id, for logging.
    pub id: String,
    /// Storage bucket all objects are fetched from.
    pub bucket: String,
    /// Filtered object keys, ordering preserved.
    pub objects: Vec<String>,
    /// Fires on client disconnect or request deadline.
    pub cancel: CancellationToken,
}

/// What one assembly produced.
#[derive(Debug)]
pub struct AssemblyReport {
    /// Terminal outcome, set exactly once after all fetches drain.
    pub status: DownloadStatus,
    /// Human-readable outcome detail for logs and the callback.
    pub message: Option<String>,
    /// Entries appended successfully.
    pub success_count: usize,
    /// Objects skipped as missing (`IGNORE_MISSING` only).
    pub missing_count: usize,
    /// Objects that failed to fetch or encode.
    pub error_count: usize,
    /// Uncompressed bytes read for successful entries.
    pub in_bytes: u64,
    /// True when a write into the response sink failed (client gone).
    pub sink_failed: bool,
}

enum FetchOutcome {
    Success { entry_bytes: u64 },
    Missing,
    Failed(Error),
}

/// Concurrent fetcher + serialized ZIP encoder for one request at a time.
pub struct Assembler {
    storage: Arc<ObjectStore>,
    max_concurrent: usize,
    ignore_missing: bool,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("max_concurrent", &self.max_concurrent)
            .field("ignore_missing", &self.ignore_missing)
            .finish_non_exhaustive()
    }
}

impl Assembler {
    /// Creates an assembler over the shared object store.
    #[must_use]
    pub fn new(storage: Arc<ObjectStore>, max_concurrent: usize, ignore_missing: bool) -> Self {
        Self {
            storage,
            max_concurrent: max_concurrent.max(1),
            ignore_missing,
        }
    }

    /// Streams one archive into `sink` and reports the outcome.
    ///
    /// The ZIP central directory is written even for partial and failed
    /// outcomes, matching the streaming contract: the status line is long
    /// gone, the callback carries the authoritative result.
    pub async fn assemble<W>(&self, attempt: &DownloadAttempt, sink: W) -> AssemblyReport
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer = Arc::new(Mutex::new(ZipFileWriter::new(sink.compat_write())));
        let pool = Arc::new(Semaphore::new(self.max_concurrent));
        let in_bytes = Arc::new(AtomicU64::new(0));
        let sink_failed = Arc::new(AtomicBool::new(false));

        let mut tasks: JoinSet<FetchOutcome> = JoinSet::new();
        for key in &attempt.objects {
            tasks.spawn(fetch_and_encode(
                Arc::clone(&self.storage),
                attempt.bucket.clone(),
                key.clone(),
                self.ignore_missing,
                Arc::clone(&pool),
                Arc::clone(&writer),
                attempt.cancel.clone(),
                Arc::clone(&in_bytes),
                Arc::clone(&sink_failed),
            ));
        }

        let mut success_count = 0usize;
        let mut missing_count = 0usize;
        let mut error_count = 0usize;
        let mut first_fatal: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(FetchOutcome::Success { .. }) => success_count += 1,
                Ok(FetchOutcome::Missing) => missing_count += 1,
                Ok(FetchOutcome::Failed(err)) => {
                    error_count += 1;
                    if first_fatal.is_none() {
                        first_fatal = Some(err);
                    }
                }
                Err(join_err) => {
                    error_count += 1;
                    if first_fatal.is_none() {
                        first_fatal =
                            Some(Error::transient(format!("fetch task failed: {join_err}")));
                    }
                }
            }
        }

        // All tasks have drained; finish the stream with its central
        // directory. A failure here means the client is gone.
        if let Ok(writer) = Arc::try_unwrap(writer) {
            if let Err(e) = writer.into_inner().close().await {
                sink_failed.store(true, Ordering::SeqCst);
                tracing::debug!(id = %attempt.id, error = %e, "failed to finalize archive");
            }
        }

        let total = attempt.objects.len();
        let (status, message) = classify(
            self.ignore_missing,
            total,
            success_count,
            first_fatal.as_ref(),
        );

        AssemblyReport {
            status,
            message,
            success_count,
            missing_count,
            error_count,
            in_bytes: in_bytes.load(Ordering::SeqCst),
            sink_failed: sink_failed.load(Ordering::SeqCst),
        }
    }
}

fn classify(
    ignore_missing: bool,
    total: usize,
    success_count: usize,
    first_fatal: Option<&Error>,
) -> (DownloadStatus, Option<String>) {
    if ignore_missing && success_count == 0 && total > 0 {
        return (
            DownloadStatus::Failed,
            Some(format!("all {total} files missing or failed to fetch")),
        );
    }
    if !ignore_missing {
        if let Some(fatal) = first_fatal {
            return (DownloadStatus::Failed, Some(fatal.to_string()));
        }
    }
    if success_count < total {
        return (
            DownloadStatus::Partial,
            Some(format!(
                "processed {success_count} of {total} files (some files missing)"
            )),
        );
    }
    (DownloadStatus::Completed, None)
}

/// One object's journey: pool slot, fetch, serialized encode.
#[allow(clippy::too_many_arguments)]
async fn fetch_and_encode<W>(
    storage: Arc<ObjectStore>,
    bucket: String,
    key: String,
    ignore_missing: bool,
    pool: Arc<Semaphore>,
    writer: Arc<Mutex<ZipFileWriter<Compat<W>>>>,
    cancel: CancellationToken,
    in_bytes: Arc<AtomicU64>,
    sink_failed: Arc<AtomicBool>,
) -> FetchOutcome
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let _permit = tokio::select! {
        () = cancel.cancelled() => {
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
            return FetchOutcome::Failed(Error::Cancelled);
        }
        permit = Arc::clone(&pool).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
                return FetchOutcome::Failed(Error::Cancelled);
            }
        },
    };

    let reader = match storage.get(&bucket, &key, &cancel).await {
        Ok(reader) => reader,
        Err(err) if err.is_not_found() && ignore_missing => {
            tracing::warn!(%bucket, %key, error = %err, "skipping missing file");
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "missing").increment(1);
            metrics::counter!(MISSING_FILES_TOTAL).increment(1);
            return FetchOutcome::Missing;
        }
        Err(err) => {
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
            return FetchOutcome::Failed(err);
        }
    };

    // Single-writer section: entry header, body, and entry close happen
    // under the encoder mutex.
    let mut guard = writer.lock().await;
    let entry = ZipEntryBuilder::new(base_name(&key).into(), Compression::Deflate);
    let mut entry_writer = match guard.write_entry_stream(entry).await {
        Ok(entry_writer) => entry_writer,
        Err(e) => {
            sink_failed.store(true, Ordering::SeqCst);
            cancel.cancel();
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
            return FetchOutcome::Failed(Error::transient(format!(
                "failed to start archive entry for {key}: {e}"
            )));
        }
    };

    match copy_entry(reader, &mut entry_writer).await {
        Ok(entry_bytes) => {
            if let Err(e) = entry_writer.close().await {
                sink_failed.store(true, Ordering::SeqCst);
                cancel.cancel();
                metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
                return FetchOutcome::Failed(Error::transient(format!(
                    "failed to close archive entry for {key}: {e}"
                )));
            }
            drop(guard);
            in_bytes.fetch_add(entry_bytes, Ordering::SeqCst);
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "success").increment(1);
            FetchOutcome::Success { entry_bytes }
        }
        Err(CopyError::Read(err)) => {
            // Keep the stream parseable for the entries that follow; the
            // partial entry stays, the encoder is not rolled back.
            let _ = entry_writer.close().await;
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
            FetchOutcome::Failed(Error::transient(format!(
                "read failed while streaming {key}: {err}"
            )))
        }
        Err(CopyError::Write(err)) => {
            sink_failed.store(true, Ordering::SeqCst);
            cancel.cancel();
            let _ = entry_writer.close().await;
            metrics::counter!(FILES_FETCH_TOTAL, "result" => "error").increment(1);
            FetchOutcome::Failed(Error::transient(format!(
                "write failed while streaming {key}: {err}"
            )))
        }
    }
}

enum CopyError {
    Read(std::io::Error),
    Write(std::io::Error),
}

/// Fixed-buffer copy from the object reader into one archive entry.
async fn copy_entry<R, W>(mut reader: R, entry_writer: &mut W) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: futures::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) => return Err(CopyError::Read(e)),
        };
        entry_writer
            .write_all(&buf[..n])
            .await
            .map_err(CopyError::Write)?;
        copied += n as u64;
    }
}

/// Wraps the response sink and counts bytes actually written, feeding the
/// `out_bytes` accounting and the compression-ratio histogram.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    /// Wraps `inner`, accumulating into `count`.
    pub fn new(inner: W, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.count.fetch_add(n as u64, Ordering::SeqCst);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Entry name: the base name of the object key, directory components
/// stripped.
fn base_name(key: &str) -> String {
    key.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(key)
        .to_string()
}
