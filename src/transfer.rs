//! Recursive transfer engine: scans a tree, moves file contents in chunks,
//! reports coalesced progress, and honors cooperative cancellation.
//!
//! The engine is written against [`RemoteFs`] rather than a concrete SFTP
//! session so its ordering and progress behavior can be exercised without a
//! server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::sftp::{EntryKind, RemoteFs};

/// Chunk size for streaming file contents (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Cooperative cancellation flag shared between a running transfer and the
/// caller. Cancellation takes effect at the next chunk boundary; bytes
/// already written stay where they are.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed,
    Cancelled,
}

/// Result of a finished (or cancelled) transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub outcome: TransferOutcome,
    pub files_transferred: u64,
    pub directories_created: u64,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

/// Which direction a transfer runs; selects the progress event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

/// Coalesces byte counts into integer-percent progress events.
///
/// An event is emitted only when the integer percentage changes, so a
/// many-chunk transfer produces at most 101 events. `finish` guarantees that
/// a completed transfer emits 100 exactly once, including the zero-byte case
/// where no percentage is computable along the way.
struct ProgressTracker<'a> {
    key: &'a str,
    sink: &'a dyn EventSink,
    direction: Direction,
    total_bytes: u64,
    transferred: u64,
    last_percent: Option<u8>,
}

impl<'a> ProgressTracker<'a> {
    fn new(key: &'a str, sink: &'a dyn EventSink, direction: Direction, total_bytes: u64) -> Self {
        Self {
            key,
            sink,
            direction,
            total_bytes,
            transferred: 0,
            last_percent: None,
        }
    }

    fn emit(&mut self, percent: u8) {
        self.last_percent = Some(percent);
        let event = match self.direction {
            Direction::Upload => Event::UploadProgress {
                key: self.key.to_string(),
                percent,
            },
            Direction::Download => Event::DownloadProgress {
                key: self.key.to_string(),
                percent,
            },
        };
        self.sink.emit(event);
    }

    fn add(&mut self, bytes: u64) {
        self.transferred += bytes;
        if self.total_bytes == 0 {
            return;
        }
        #[expect(clippy::cast_possible_truncation)]
        let percent =
            ((u128::from(self.transferred) * 100) / u128::from(self.total_bytes)).min(100) as u8;
        if self.last_percent != Some(percent) {
            self.emit(percent);
        }
    }

    fn finish(&mut self) {
        if self.last_percent != Some(100) {
            self.emit(100);
        }
    }

    const fn bytes_transferred(&self) -> u64 {
        self.transferred
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanKind {
    Dir,
    File,
}

/// One step of a transfer, in execution order: every directory appears
/// before anything inside it.
#[derive(Debug)]
struct PlanEntry {
    kind: PlanKind,
    local: PathBuf,
    remote: String,
    size: u64,
    permissions: Option<u32>,
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(unix)]
fn local_permissions(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn local_permissions(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Build the upload plan for a local path by walking the tree depth-first.
async fn scan_local(local_root: &Path, remote_root: &str) -> Result<Vec<PlanEntry>> {
    let root_meta = tokio::fs::metadata(local_root).await?;
    let mut plan = Vec::new();

    if !root_meta.is_dir() {
        plan.push(PlanEntry {
            kind: PlanKind::File,
            local: local_root.to_path_buf(),
            remote: remote_root.to_string(),
            size: root_meta.len(),
            permissions: local_permissions(&root_meta),
        });
        return Ok(plan);
    }

    let mut stack: Vec<(PathBuf, String)> = vec![(local_root.to_path_buf(), remote_root.to_string())];
    while let Some((local_dir, remote_dir)) = stack.pop() {
        plan.push(PlanEntry {
            kind: PlanKind::Dir,
            local: local_dir.clone(),
            remote: remote_dir.clone(),
            size: 0,
            permissions: None,
        });

        let mut read_dir = tokio::fs::read_dir(&local_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().await?;
            let remote_path = join_remote(&remote_dir, &name);
            if metadata.is_dir() {
                stack.push((entry.path(), remote_path));
            } else if metadata.is_file() {
                plan.push(PlanEntry {
                    kind: PlanKind::File,
                    local: entry.path(),
                    remote: remote_path,
                    size: metadata.len(),
                    permissions: local_permissions(&metadata),
                });
            } else {
                tracing::debug!(path = %entry.path().display(), "Skipping special file");
            }
        }
    }

    Ok(plan)
}

/// Build the download plan for a remote path.
async fn scan_remote(
    fs: &dyn RemoteFs,
    remote_root: &str,
    local_root: &Path,
) -> Result<Vec<PlanEntry>> {
    let root_stat = fs.stat(remote_root).await?;
    let mut plan = Vec::new();

    if root_stat.kind != EntryKind::Dir {
        plan.push(PlanEntry {
            kind: PlanKind::File,
            local: local_root.to_path_buf(),
            remote: remote_root.to_string(),
            size: root_stat.size,
            permissions: root_stat.permissions,
        });
        return Ok(plan);
    }

    let mut stack: Vec<(String, PathBuf)> =
        vec![(remote_root.to_string(), local_root.to_path_buf())];
    while let Some((remote_dir, local_dir)) = stack.pop() {
        plan.push(PlanEntry {
            kind: PlanKind::Dir,
            local: local_dir.clone(),
            remote: remote_dir.clone(),
            size: 0,
            permissions: None,
        });

        for entry in fs.read_dir(&remote_dir).await? {
            let local_path = local_dir.join(&entry.name);
            match entry.kind {
                EntryKind::Dir => stack.push((entry.path, local_path)),
                EntryKind::File => plan.push(PlanEntry {
                    kind: PlanKind::File,
                    local: local_path,
                    remote: entry.path,
                    size: entry.size,
                    permissions: entry.permissions,
                }),
                EntryKind::Symlink | EntryKind::Other => {
                    tracing::debug!(path = %entry.path, "Skipping non-regular entry");
                }
            }
        }
    }

    Ok(plan)
}

/// Recursive transfer engine.
///
/// Transfers run fail-fast: the first error aborts the whole operation and
/// already-transferred entries are left in place.
pub struct TransferEngine {
    chunk_size: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TransferEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[doc(hidden)]
    #[must_use]
    pub const fn with_chunk_size(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Upload a local file or directory tree to a remote path.
    ///
    /// Directories are created before anything inside them. Progress events
    /// are emitted as [`Event::UploadProgress`] keyed by `key`; a completed
    /// upload always ends on exactly one 100.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; the transfer stops there.
    pub async fn upload(
        &self,
        fs: &dyn RemoteFs,
        local: &Path,
        remote: &str,
        key: &str,
        sink: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<TransferSummary> {
        let start = std::time::Instant::now();
        let plan = scan_local(local, remote).await?;
        let total_bytes: u64 = plan.iter().map(|e| e.size).sum();
        let mut tracker = ProgressTracker::new(key, sink, Direction::Upload, total_bytes);

        let mut files_transferred = 0u64;
        let mut directories_created = 0u64;

        for entry in &plan {
            if cancel.is_cancelled() {
                return Ok(Self::summary(
                    TransferOutcome::Cancelled,
                    files_transferred,
                    directories_created,
                    &tracker,
                    start,
                ));
            }
            match entry.kind {
                PlanKind::Dir => {
                    fs.mkdir_all(&entry.remote).await?;
                    directories_created += 1;
                }
                PlanKind::File => {
                    if !self
                        .upload_file(fs, entry, &mut tracker, cancel)
                        .await?
                    {
                        return Ok(Self::summary(
                            TransferOutcome::Cancelled,
                            files_transferred,
                            directories_created,
                            &tracker,
                            start,
                        ));
                    }
                    files_transferred += 1;
                }
            }
        }

        tracker.finish();
        Ok(Self::summary(
            TransferOutcome::Completed,
            files_transferred,
            directories_created,
            &tracker,
            start,
        ))
    }

    /// Download a remote file or directory tree to a local path.
    ///
    /// Mirrors [`TransferEngine::upload`] with [`Event::DownloadProgress`]
    /// events.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; the transfer stops there.
    pub async fn download(
        &self,
        fs: &dyn RemoteFs,
        remote: &str,
        local: &Path,
        key: &str,
        sink: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<TransferSummary> {
        let start = std::time::Instant::now();
        let plan = scan_remote(fs, remote, local).await?;
        let total_bytes: u64 = plan.iter().map(|e| e.size).sum();
        let mut tracker = ProgressTracker::new(key, sink, Direction::Download, total_bytes);

        let mut files_transferred = 0u64;
        let mut directories_created = 0u64;

        for entry in &plan {
            if cancel.is_cancelled() {
                return Ok(Self::summary(
                    TransferOutcome::Cancelled,
                    files_transferred,
                    directories_created,
                    &tracker,
                    start,
                ));
            }
            match entry.kind {
                PlanKind::Dir => {
                    tokio::fs::create_dir_all(&entry.local).await?;
                    directories_created += 1;
                }
                PlanKind::File => {
                    if !self
                        .download_file(fs, entry, &mut tracker, cancel)
                        .await?
                    {
                        return Ok(Self::summary(
                            TransferOutcome::Cancelled,
                            files_transferred,
                            directories_created,
                            &tracker,
                            start,
                        ));
                    }
                    files_transferred += 1;
                }
            }
        }

        tracker.finish();
        Ok(Self::summary(
            TransferOutcome::Completed,
            files_transferred,
            directories_created,
            &tracker,
            start,
        ))
    }

    /// Returns `Ok(false)` if cancelled mid-file.
    async fn upload_file(
        &self,
        fs: &dyn RemoteFs,
        entry: &PlanEntry,
        tracker: &mut ProgressTracker<'_>,
        cancel: &CancelFlag,
    ) -> Result<bool> {
        let mut local_file = tokio::fs::File::open(&entry.local).await?;
        let mut remote_file = fs.create(&entry.remote, entry.permissions).await?;
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            if cancel.is_cancelled() {
                let _ = remote_file.finish().await;
                return Ok(false);
            }
            let n = local_file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            remote_file.write_chunk(&buffer[..n]).await?;
            tracker.add(n as u64);
        }

        remote_file.finish().await?;
        Ok(true)
    }

    /// Returns `Ok(false)` if cancelled mid-file.
    async fn download_file(
        &self,
        fs: &dyn RemoteFs,
        entry: &PlanEntry,
        tracker: &mut ProgressTracker<'_>,
        cancel: &CancelFlag,
    ) -> Result<bool> {
        let mut remote_file = fs.open_read(&entry.remote).await?;
        let mut local_file = tokio::fs::File::create(&entry.local).await?;
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            if cancel.is_cancelled() {
                let _ = local_file.shutdown().await;
                return Ok(false);
            }
            let n = remote_file.read_chunk(&mut buffer).await?;
            if n == 0 {
                break;
            }
            local_file.write_all(&buffer[..n]).await?;
            tracker.add(n as u64);
        }

        local_file.flush().await?;
        remote_file.finish().await?;

        #[cfg(unix)]
        if let Some(mode) = entry.permissions {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            let _ = std::fs::set_permissions(&entry.local, perms);
        }

        Ok(true)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn summary(
        outcome: TransferOutcome,
        files_transferred: u64,
        directories_created: u64,
        tracker: &ProgressTracker<'_>,
        start: std::time::Instant,
    ) -> TransferSummary {
        TransferSummary {
            outcome,
            files_transferred,
            directories_created,
            bytes_transferred: tracker.bytes_transferred(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
