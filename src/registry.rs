//! Keyed session registry: the embedding application's entry point.
//!
//! Every operation is addressed by the caller-chosen session key. The
//! registry owns the SSH connections, lazily opens one SFTP channel per
//! session, tracks the interactive shell, and serializes transfers so a
//! session runs at most one upload or download at a time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::client::{CommandOutput, SshClient};
use crate::config::{Config, Credentials};
use crate::error::{ClientError, Result};
use crate::events::EventSink;
use crate::sftp::{FileStat, RemoteEntry, SftpClient};
use crate::shell::{PtyType, ShellHandle, spawn_shell};
use crate::transfer::{CancelFlag, TransferEngine, TransferSummary};

/// State owned by one connected session.
struct SessionHandle {
    client: SshClient,
    /// Opened on first SFTP use and shared by the resource operations and
    /// the transfer engine.
    sftp: OnceCell<Arc<SftpClient>>,
    shell: Mutex<Option<ShellHandle>>,
    /// At most one transfer runs per session; later calls wait here.
    transfer_lock: Mutex<()>,
    upload_cancel: std::sync::Mutex<Option<CancelFlag>>,
    download_cancel: std::sync::Mutex<Option<CancelFlag>>,
}

impl SessionHandle {
    fn new(client: SshClient) -> Self {
        Self {
            client,
            sftp: OnceCell::new(),
            shell: Mutex::new(None),
            transfer_lock: Mutex::new(()),
            upload_cancel: std::sync::Mutex::new(None),
            download_cancel: std::sync::Mutex::new(None),
        }
    }

    async fn sftp(&self) -> Result<&Arc<SftpClient>> {
        self.sftp
            .get_or_try_init(|| async {
                let sftp = self.client.sftp_session().await?;
                Ok::<_, ClientError>(Arc::new(sftp))
            })
            .await
    }
}

/// Registry of sessions addressed by key.
///
/// Cheap to share: callers typically hold it in an `Arc` and invoke
/// operations concurrently. The internal map lock is held only for lookups
/// and insertions, never across network I/O.
pub struct SessionRegistry {
    config: Config,
    sink: Arc<dyn EventSink>,
    engine: TransferEngine,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            engine: TransferEngine::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn handle(&self, key: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::SessionNotFound {
                key: key.to_string(),
            })
    }

    /// Connect and register a session under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateSession`] if `key` is already in use,
    /// or a connection/authentication error from the SSH layer.
    pub async fn connect(
        &self,
        key: &str,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<()> {
        if self.sessions.read().await.contains_key(key) {
            return Err(ClientError::DuplicateSession {
                key: key.to_string(),
            });
        }

        let client = SshClient::connect(host, port, credentials, &self.config).await?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(key) {
            // Lost the race to a concurrent connect under the same key
            drop(sessions);
            let _ = client.close().await;
            return Err(ClientError::DuplicateSession {
                key: key.to_string(),
            });
        }
        sessions.insert(key.to_string(), Arc::new(SessionHandle::new(client)));
        drop(sessions);

        tracing::info!(key = %key, host = %host, port = %port, "Session registered");
        Ok(())
    }

    /// Disconnect and remove the session under `key`, tearing down any
    /// running transfers, the shell, and the SFTP channel.
    ///
    /// Unknown keys are a no-op, so disconnect is safe to call twice.
    ///
    /// # Errors
    ///
    /// Returns an error only if the SSH disconnect message cannot be sent.
    pub async fn disconnect(&self, key: &str) -> Result<()> {
        let Some(handle) = self.sessions.write().await.remove(key) else {
            return Ok(());
        };

        if let Ok(guard) = handle.upload_cancel.lock() {
            if let Some(flag) = guard.as_ref() {
                flag.cancel();
            }
        }
        if let Ok(guard) = handle.download_cancel.lock() {
            if let Some(flag) = guard.as_ref() {
                flag.cancel();
            }
        }

        if let Some(shell) = handle.shell.lock().await.take() {
            shell.close();
        }

        // Waits for any in-flight transfer to observe cancellation
        let _transfer_guard = handle.transfer_lock.lock().await;

        let result = handle.client.close().await;
        tracing::info!(key = %key, "Session disconnected");
        result
    }

    /// Disconnect every registered session. Errors from individual sessions
    /// are logged, not propagated; by the time this returns the registry is
    /// empty.
    pub async fn disconnect_all(&self) {
        let keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.disconnect(&key).await {
                tracing::warn!(key = %key, error = %e, "Error disconnecting session");
            }
        }
    }

    /// Whether a live session exists under `key`.
    pub async fn is_connected(&self, key: &str) -> bool {
        match self.handle(key).await {
            Ok(handle) => handle.client.is_connected().await,
            Err(_) => false,
        }
    }

    /// Keys of all registered sessions, in no particular order.
    pub async fn keys(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Execute a one-shot command on the session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SessionNotFound`] for unknown keys, or an
    /// execution error from the SSH layer.
    pub async fn exec(&self, key: &str, command: &str) -> Result<CommandOutput> {
        let handle = self.handle(key).await?;
        handle.client.exec(command).await
    }

    /// Start the interactive shell for the session.
    ///
    /// A session has at most one shell. If one is already running this is a
    /// no-op; if a previous shell has terminated, a new one is opened in its
    /// place. Output is delivered through the event sink as
    /// [`crate::Event::ShellOutput`].
    ///
    /// # Errors
    ///
    /// Returns an error if the shell channel cannot be opened.
    pub async fn start_shell(&self, key: &str, pty: PtyType) -> Result<()> {
        let handle = self.handle(key).await?;
        let mut shell = handle.shell.lock().await;

        if let Some(existing) = shell.as_ref() {
            if existing.is_open() {
                return Ok(());
            }
        }

        let channel = handle.client.open_shell(pty).await?;
        *shell = Some(spawn_shell(key.to_string(), channel, Arc::clone(&self.sink)));
        tracing::debug!(key = %key, term = pty.term(), "Shell started");
        Ok(())
    }

    /// Send input to the session's shell.
    ///
    /// # Errors
    ///
    /// Returns a channel error if no shell is running.
    pub async fn write_to_shell(&self, key: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let handle = self.handle(key).await?;
        let shell = handle.shell.lock().await;
        match shell.as_ref() {
            Some(s) => s.write(data),
            None => Err(ClientError::Channel {
                reason: "shell not started".to_string(),
            }),
        }
    }

    /// Close the session's shell if one is running. No-op otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SessionNotFound`] for unknown keys.
    pub async fn close_shell(&self, key: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        if let Some(shell) = handle.shell.lock().await.take() {
            shell.close();
        }
        Ok(())
    }

    /// List a remote directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or unreadable.
    pub async fn sftp_list(&self, key: &str, path: &str) -> Result<Vec<RemoteEntry>> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.read_dir(path).await
    }

    /// Stat a remote path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the path does not exist.
    pub async fn sftp_stat(&self, key: &str, path: &str) -> Result<FileStat> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.stat(path).await
    }

    /// Create a remote directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if a component cannot be created.
    pub async fn sftp_mkdir(&self, key: &str, path: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.mkdir_all(path).await
    }

    /// Rename a remote path. The destination must not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing or the destination exists.
    pub async fn sftp_rename(&self, key: &str, from: &str, to: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.rename(from, to).await
    }

    /// Remove a remote file.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or is a directory.
    pub async fn sftp_rm(&self, key: &str, path: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.remove_file(path).await
    }

    /// Remove an empty remote directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing or not empty.
    pub async fn sftp_rmdir(&self, key: &str, path: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.remove_dir(path).await
    }

    /// Change the permission bits of a remote path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or the server refuses.
    pub async fn sftp_chmod(&self, key: &str, path: &str, mode: u32) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.chmod(path, mode).await
    }

    /// Read a whole remote file, subject to the configured size limit.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TooLarge`] for oversized files.
    pub async fn sftp_read_file(&self, key: &str, path: &str) -> Result<Vec<u8>> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.read_file(path).await
    }

    /// Replace a remote file's contents atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the final rename fails.
    pub async fn sftp_write_file(&self, key: &str, path: &str, data: &[u8]) -> Result<()> {
        let handle = self.handle(key).await?;
        handle.sftp().await?.write_file(path, data).await
    }

    /// Upload a local file or directory tree to the session.
    ///
    /// Transfers on one session are serialized; a second call waits for the
    /// first to finish. Progress arrives through the event sink as
    /// [`crate::Event::UploadProgress`].
    ///
    /// # Errors
    ///
    /// Returns the first transfer error; completed entries stay in place.
    pub async fn upload(&self, key: &str, local: &Path, remote: &str) -> Result<TransferSummary> {
        let handle = self.handle(key).await?;
        let _guard = handle.transfer_lock.lock().await;

        let cancel = CancelFlag::new();
        if let Ok(mut slot) = handle.upload_cancel.lock() {
            *slot = Some(cancel.clone());
        }

        let sftp = Arc::clone(handle.sftp().await?);
        let result = self
            .engine
            .upload(sftp.as_ref(), local, remote, key, self.sink.as_ref(), &cancel)
            .await;

        if let Ok(mut slot) = handle.upload_cancel.lock() {
            *slot = None;
        }
        result
    }

    /// Download a remote file or directory tree from the session.
    ///
    /// # Errors
    ///
    /// Returns the first transfer error; completed entries stay in place.
    pub async fn download(&self, key: &str, remote: &str, local: &Path) -> Result<TransferSummary> {
        let handle = self.handle(key).await?;
        let _guard = handle.transfer_lock.lock().await;

        let cancel = CancelFlag::new();
        if let Ok(mut slot) = handle.download_cancel.lock() {
            *slot = Some(cancel.clone());
        }

        let sftp = Arc::clone(handle.sftp().await?);
        let result = self
            .engine
            .download(sftp.as_ref(), remote, local, key, self.sink.as_ref(), &cancel)
            .await;

        if let Ok(mut slot) = handle.download_cancel.lock() {
            *slot = None;
        }
        result
    }

    /// Request cancellation of the session's running upload, if any.
    /// Takes effect at the next chunk boundary; no-op when nothing is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SessionNotFound`] for unknown keys.
    pub async fn cancel_upload(&self, key: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        if let Ok(slot) = handle.upload_cancel.lock() {
            if let Some(flag) = slot.as_ref() {
                flag.cancel();
                tracing::debug!(key = %key, "Upload cancellation requested");
            }
        }
        Ok(())
    }

    /// Request cancellation of the session's running download, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SessionNotFound`] for unknown keys.
    pub async fn cancel_download(&self, key: &str) -> Result<()> {
        let handle = self.handle(key).await?;
        if let Ok(slot) = handle.download_cancel.lock() {
            if let Some(flag) = slot.as_ref() {
                flag.cancel();
                tracing::debug!(key = %key, "Download cancellation requested");
            }
        }
        Ok(())
    }
}
