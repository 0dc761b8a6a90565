//! SFTP resource layer: metadata, directory listing, whole-file reads and
//! writes, and the [`RemoteFs`] abstraction the transfer engine runs against.

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, FileType, OpenFlags};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::LimitsConfig;
use crate::error::{ClientError, Result};

/// Reject paths containing traversal components.
fn validate_remote_path(path: &str) -> Result<()> {
    if path.split('/').any(|component| component == "..") {
        return Err(ClientError::Sftp {
            reason: "Path traversal ('..') is not allowed in remote paths".to_string(),
        });
    }
    Ok(())
}

/// Join a directory path and an entry name without doubling separators.
fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Classification of a remote filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    fn from_attributes(attrs: &FileAttributes) -> Self {
        match attrs.file_type() {
            FileType::Dir => Self::Dir,
            FileType::File => Self::File,
            FileType::Symlink => Self::Symlink,
            FileType::Other => Self::Other,
        }
    }
}

/// Metadata for one remote path. Echoes the queried path so the result is
/// self-describing when snapshots are forwarded or collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Modification time, seconds since the Unix epoch
    pub modified: Option<u32>,
}

impl FileStat {
    fn from_attributes(path: &str, attrs: &FileAttributes) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::from_attributes(attrs),
            size: attrs.size.unwrap_or(0),
            permissions: attrs.permissions,
            uid: attrs.uid,
            gid: attrs.gid,
            modified: attrs.mtime,
        }
    }
}

/// Entry in a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub modified: Option<u32>,
}

/// Map an SFTP protocol error onto the crate error taxonomy, attaching the
/// path the operation was about.
fn map_sftp_error(e: &russh_sftp::client::error::Error, path: &str) -> ClientError {
    use russh_sftp::client::error::Error;
    use russh_sftp::protocol::StatusCode;

    if let Error::Status(status) = e {
        match status.status_code {
            StatusCode::NoSuchFile => {
                return ClientError::NotFound {
                    path: path.to_string(),
                };
            }
            StatusCode::PermissionDenied => {
                return ClientError::Permission {
                    path: path.to_string(),
                };
            }
            StatusCode::Failure => {
                // SFTP v3 has no dedicated out-of-space status; servers report
                // it as a generic failure with a descriptive message.
                let msg = status.error_message.to_lowercase();
                if msg.contains("space") || msg.contains("quota") {
                    return ClientError::NoSpace {
                        path: path.to_string(),
                    };
                }
            }
            _ => {}
        }
    }
    ClientError::Sftp {
        reason: e.to_string(),
    }
}

/// An open remote file handle for streaming reads or writes.
#[async_trait]
pub trait RemoteFile: Send {
    /// Read up to `buf.len()` bytes; returns 0 at end of file.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`.
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Flush and close the handle.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// The remote filesystem surface the transfer engine requires.
///
/// [`SftpClient`] is the production implementation; tests substitute an
/// in-memory one.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<FileStat>;

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Create a directory and any missing parents. Existing directories are
    /// not an error.
    async fn mkdir_all(&self, path: &str) -> Result<()>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>>;

    /// Create (or truncate) a file for writing, optionally applying a
    /// permission mode at creation time.
    async fn create(&self, path: &str, permissions: Option<u32>) -> Result<Box<dyn RemoteFile>>;
}

struct SftpFile {
    file: russh_sftp::client::fs::File,
}

#[async_trait]
impl RemoteFile for SftpFile {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.file.write_all(data).await?)
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        Ok(self.file.shutdown().await?)
    }
}

/// SFTP client bound to one open subsystem channel.
pub struct SftpClient {
    session: SftpSession,
    limits: LimitsConfig,
}

impl SftpClient {
    #[must_use]
    pub const fn new(session: SftpSession, limits: LimitsConfig) -> Self {
        Self { session, limits }
    }

    /// Stat a remote path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the path does not exist.
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        validate_remote_path(path)?;
        let attrs = self
            .session
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(&e, path))?;
        Ok(FileStat::from_attributes(path, &attrs))
    }

    /// Change the permission bits of a remote path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or the server rejects the
    /// change.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        validate_remote_path(path)?;
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.session
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(&e, path))
    }

    /// Read a whole remote file into memory.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TooLarge`] if the file exceeds the configured
    /// size limit, checked before any data is read.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        validate_remote_path(path)?;
        let stat = self.stat(path).await?;
        if stat.size > self.limits.max_file_bytes {
            return Err(ClientError::TooLarge {
                path: path.to_string(),
                size: stat.size,
                limit_bytes: self.limits.max_file_bytes,
            });
        }

        let mut file = self
            .session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_sftp_error(&e, path))?;

        #[expect(clippy::cast_possible_truncation)]
        let mut buf = Vec::with_capacity(stat.size as usize);
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Write a whole remote file, replacing any existing content.
    ///
    /// The data is written to a sibling `.part` file first and moved into
    /// place afterwards, so a failed write never leaves a truncated file at
    /// the destination. A pre-existing destination is briefly absent between
    /// the remove and the rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or the rename
    /// fails; the temporary file is removed on a failed write.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        validate_remote_path(path)?;
        let tmp_path = format!("{path}.part");

        let mut file = self
            .session
            .open_with_flags(
                &tmp_path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(&e, &tmp_path))?;

        if let Err(e) = file.write_all(data).await {
            let _ = file.shutdown().await;
            let _ = self.session.remove_file(&tmp_path).await;
            return Err(e.into());
        }
        file.shutdown().await?;

        // SFTP v3 rename does not overwrite
        match self.session.remove_file(path).await {
            Ok(()) => {}
            Err(e) => {
                if !matches!(map_sftp_error(&e, path), ClientError::NotFound { .. }) {
                    let _ = self.session.remove_file(&tmp_path).await;
                    return Err(map_sftp_error(&e, path));
                }
            }
        }

        self.session
            .rename(&tmp_path, path)
            .await
            .map_err(|e| map_sftp_error(&e, path))
    }

    /// List the entries of a remote directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or cannot be read.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        validate_remote_path(path)?;
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(&e, path))?;

        let mut result = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            result.push(RemoteEntry {
                path: join_remote(path, &name),
                kind: EntryKind::from_attributes(&metadata),
                size: metadata.size.unwrap_or(0),
                permissions: metadata.permissions,
                uid: metadata.uid,
                gid: metadata.gid,
                modified: metadata.mtime,
                name,
            });
        }

        Ok(result)
    }

    /// Create a remote directory and all missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if a component cannot be created and does not already
    /// exist.
    pub async fn mkdir_all(&self, path: &str) -> Result<()> {
        validate_remote_path(path)?;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = String::new();
        if path.starts_with('/') {
            current.push('/');
        }

        for component in &components {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);

            if self.session.create_dir(current.as_str()).await.is_err() {
                // Racing creators and pre-existing directories both land here
                let exists = self
                    .session
                    .try_exists(current.as_str())
                    .await
                    .map_err(|e| map_sftp_error(&e, current.as_str()))?;
                if !exists {
                    return Err(ClientError::Sftp {
                        reason: format!("Cannot create remote directory: {current}"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Rename a remote path.
    ///
    /// SFTP rename does not overwrite: the destination must not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing or the destination exists.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_remote_path(from)?;
        validate_remote_path(to)?;
        self.session
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(&e, from))
    }

    /// Remove a remote file.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is a directory.
    pub async fn remove_file(&self, path: &str) -> Result<()> {
        validate_remote_path(path)?;
        self.session
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(&e, path))
    }

    /// Remove an empty remote directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or is not empty.
    pub async fn remove_dir(&self, path: &str) -> Result<()> {
        validate_remote_path(path)?;
        self.session
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(&e, path))
    }

    /// Close the SFTP session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be closed cleanly.
    pub async fn close(self) -> Result<()> {
        self.session.close().await.map_err(|e| map_sftp_error(&e, ""))
    }
}

#[async_trait]
impl RemoteFs for SftpClient {
    async fn stat(&self, path: &str) -> Result<FileStat> {
        Self::stat(self, path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        Self::read_dir(self, path).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        Self::mkdir_all(self, path).await
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
        validate_remote_path(path)?;
        let file = self
            .session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_sftp_error(&e, path))?;
        Ok(Box::new(SftpFile { file }))
    }

    async fn create(&self, path: &str, permissions: Option<u32>) -> Result<Box<dyn RemoteFile>> {
        validate_remote_path(path)?;
        let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE;
        let file = if let Some(mode) = permissions {
            let mut attrs = FileAttributes::empty();
            attrs.permissions = Some(mode);
            self.session
                .open_with_flags_and_attributes(path, flags, attrs)
                .await
                .map_err(|e| map_sftp_error(&e, path))?
        } else {
            self.session
                .open_with_flags(path, flags)
                .await
                .map_err(|e| map_sftp_error(&e, path))?
        };
        Ok(Box::new(SftpFile { file }))
    }
}
