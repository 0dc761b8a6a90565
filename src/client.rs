//! Low-level SSH connection: handshake, authentication, channels.
//!
//! One [`SshClient`] wraps one authenticated russh `Handle`. Everything above
//! this layer (session keys, SFTP caching, transfers) lives in the registry.

use std::sync::Arc;
use std::time::Duration;

use russh::ChannelMsg;
use russh::client::{self, Handle, Handler};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::known_hosts::check_known_hosts;
use russh::keys::{PublicKey, decode_secret_key};
use russh_sftp::client::SftpSession;
use tokio::time::timeout;

use crate::config::{AuthMethod, Config, Credentials, HostKeyPolicy, LimitsConfig};
use crate::error::{ClientError, Result};
use crate::sftp::SftpClient;
use crate::shell::PtyType;

/// Strip detail from SSH library errors before they reach error messages.
/// Masks authentication method names and truncates anything long enough to
/// carry key material or data dumps.
fn sanitize_ssh_error(error: &impl std::fmt::Display) -> String {
    let mut msg = error.to_string();
    for method in &["publickey", "keyboard-interactive", "gssapi-with-mic"] {
        msg = msg.replace(method, "***");
    }
    if msg.len() > 500 {
        format!("{}... (truncated)", &msg[..500])
    } else {
        msg
    }
}

/// Output from a one-shot command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
    pub duration_ms: u64,
}

/// russh handler applying the configured host key policy.
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    const fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::Strict => {
                match check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        tracing::error!(host = %self.host, port = %self.port, "Host key not in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        tracing::error!(host = %self.host, port = %self.port, error = %e, "Host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// An authenticated SSH connection to one host.
pub struct SshClient {
    handle: Handle<ClientHandler>,
    host: String,
    port: u16,
    limits: LimitsConfig,
}

impl SshClient {
    /// Connect and authenticate.
    ///
    /// The connect timeout covers TCP establishment, the SSH handshake, and
    /// authentication as a whole.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established, the host key
    /// is rejected, the key material cannot be decoded, or authentication
    /// fails.
    #[must_use = "the SSH client must be used or closed"]
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: &Credentials,
        config: &Config,
    ) -> Result<Self> {
        let limits = config.limits.clone();
        let russh_config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(limits.keepalive_interval_seconds * 3)),
            keepalive_interval: Some(Duration::from_secs(limits.keepalive_interval_seconds)),
            keepalive_max: 3,
            ..Default::default()
        };
        let russh_config = Arc::new(russh_config);
        let handler = ClientHandler::new(host.to_string(), port, config.host_key_policy);

        let connect_timeout = Duration::from_secs(limits.connect_timeout_seconds);
        let handle = timeout(connect_timeout, async {
            let mut handle = client::connect(russh_config, (host, port), handler)
                .await
                .map_err(|e| {
                    tracing::error!(host = %host, port = %port, error = %sanitize_ssh_error(&e), "SSH connection failed");
                    ClientError::Network {
                        host: host.to_string(),
                        port,
                        reason: sanitize_ssh_error(&e),
                    }
                })?;
            Self::authenticate(&mut handle, host, credentials).await?;
            Ok::<_, ClientError>(handle)
        })
        .await
        .map_err(|_| {
            tracing::error!(host = %host, port = %port, timeout_secs = limits.connect_timeout_seconds, "SSH connection timeout");
            ClientError::Timeout {
                seconds: limits.connect_timeout_seconds,
            }
        })??;

        tracing::debug!(host = %host, port = %port, user = %credentials.user, "SSH session established");

        Ok(Self {
            handle,
            host: host.to_string(),
            port,
            limits,
        })
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        host: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        let user = &credentials.user;
        match &credentials.auth {
            AuthMethod::Password { password } => {
                Self::auth_with_password(handle, host, user, password.as_str()).await
            }
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                Self::auth_with_key(
                    handle,
                    host,
                    user,
                    private_key.as_str(),
                    passphrase.as_ref().map(|p| p.as_str()),
                )
                .await
            }
        }
    }

    async fn auth_with_password(
        handle: &mut Handle<ClientHandler>,
        host: &str,
        user: &str,
        password: &str,
    ) -> Result<()> {
        let auth_result = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| {
                tracing::error!(host = %host, user = %user, error = %sanitize_ssh_error(&e), method = "password", "SSH authentication error");
                ClientError::Auth {
                    user: user.to_string(),
                    host: host.to_string(),
                }
            })?;

        if auth_result.success() {
            Ok(())
        } else {
            tracing::error!(host = %host, user = %user, method = "password", "SSH authentication rejected");
            Err(ClientError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            })
        }
    }

    async fn auth_with_key(
        handle: &mut Handle<ClientHandler>,
        host: &str,
        user: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<()> {
        let key_pair = decode_secret_key(private_key, passphrase).map_err(|e| {
            ClientError::KeyInvalid {
                reason: sanitize_ssh_error(&e),
            }
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let auth_result = handle
            .authenticate_publickey(user, key_with_hash)
            .await
            .map_err(|e| {
                tracing::error!(host = %host, user = %user, error = %sanitize_ssh_error(&e), method = "key", "SSH authentication error");
                ClientError::Auth {
                    user: user.to_string(),
                    host: host.to_string(),
                }
            })?;

        if auth_result.success() {
            Ok(())
        } else {
            tracing::error!(host = %host, user = %user, method = "key", "SSH authentication rejected");
            Err(ClientError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            })
        }
    }

    /// Execute a command and collect its complete output.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened, the command times
    /// out, or the combined output exceeds the configured limit.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let start = std::time::Instant::now();

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ClientError::Channel {
                reason: format!("Failed to open channel: {e}"),
            })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ClientError::Channel {
                reason: format!("Failed to execute command: {e}"),
            })?;

        let (stdout, stderr, exit_code) = self.read_command_output(&mut channel).await?;

        #[expect(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            duration_ms,
        })
    }

    async fn read_command_output(
        &self,
        channel: &mut russh::Channel<client::Msg>,
    ) -> Result<(Vec<u8>, Vec<u8>, u32)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0u32;
        let mut total_bytes = 0u64;
        let command_timeout = Duration::from_secs(self.limits.command_timeout_seconds);

        let result = timeout(command_timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        total_bytes += data.len() as u64;
                        if total_bytes > self.limits.max_output_bytes {
                            return Err(ClientError::OutputTooLarge {
                                limit_bytes: self.limits.max_output_bytes,
                            });
                        }
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            total_bytes += data.len() as u64;
                            if total_bytes > self.limits.max_output_bytes {
                                return Err(ClientError::OutputTooLarge {
                                    limit_bytes: self.limits.max_output_bytes,
                                });
                            }
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = exit_status;
                    }
                    None => break,
                    // Eof may arrive before or after ExitStatus; keep draining
                    // until the channel closes.
                    _ => {}
                }
            }
            Ok((stdout, stderr, exit_code))
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = channel.close().await;
                Err(ClientError::Timeout {
                    seconds: self.limits.command_timeout_seconds,
                })
            }
        }
    }

    /// Open an interactive shell channel with a PTY.
    ///
    /// The returned channel has an active shell. Input goes through
    /// `channel.data()`; output arrives via `channel.wait()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or the PTY/shell
    /// request is rejected.
    pub async fn open_shell(&self, pty: PtyType) -> Result<russh::Channel<client::Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ClientError::Channel {
                reason: format!("Failed to open channel for shell: {e}"),
            })?;

        channel
            .request_pty(true, pty.term(), 80, 24, 0, 0, &[])
            .await
            .map_err(|e| ClientError::Channel {
                reason: format!("Failed to request PTY: {e}"),
            })?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| ClientError::Channel {
                reason: format!("Failed to request shell: {e}"),
            })?;

        Ok(channel)
    }

    /// Open an SFTP subsystem channel and wrap it as an [`SftpClient`].
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened, the subsystem
    /// request fails, or SFTP initialization fails.
    pub async fn sftp_session(&self) -> Result<SftpClient> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ClientError::Sftp {
                reason: format!("Failed to open channel: {e}"),
            })?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ClientError::Sftp {
                reason: format!("Failed to request SFTP subsystem: {e}"),
            })?;

        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ClientError::Sftp {
                reason: format!("Failed to initialize SFTP session: {e}"),
            })?;

        Ok(SftpClient::new(session, self.limits.clone()))
    }

    /// Check whether the connection can still open channels (bounded to 5s).
    #[must_use = "the connection status should be checked"]
    pub async fn is_connected(&self) -> bool {
        match timeout(Duration::from_secs(5), self.handle.channel_open_session()).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Send a disconnect message to the server (bounded to 5s).
    ///
    /// Takes `&self` so teardown can run on shared handles; a timeout is
    /// treated as success since the connection was likely dead anyway.
    ///
    /// # Errors
    ///
    /// Returns an error if the disconnect message cannot be sent.
    pub async fn close(&self) -> Result<()> {
        match timeout(
            Duration::from_secs(5),
            self.handle
                .disconnect(russh::Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::Network {
                host: self.host.clone(),
                port: self.port,
                reason: e.to_string(),
            }),
            Err(_) => {
                tracing::warn!(host = %self.host, "Timeout closing SSH connection, forcing drop");
                Ok(())
            }
        }
    }
}
