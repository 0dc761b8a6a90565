//! Interactive shell channel: PTY selection and the background read loop
//! that forwards output to the event sink.

use std::sync::Arc;

use russh::client::Msg;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};
use crate::events::{Event, EventSink};

/// Terminal type requested for the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyType {
    /// No terminal emulation
    #[default]
    Vanilla,
    Vt100,
    Vt102,
    Vt220,
    Ansi,
    Xterm,
}

impl PtyType {
    /// The TERM string sent in the pty-req.
    #[must_use]
    pub const fn term(self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Vt100 => "vt100",
            Self::Vt102 => "vt102",
            Self::Vt220 => "vt220",
            Self::Ansi => "ansi",
            Self::Xterm => "xterm",
        }
    }
}

enum ShellInput {
    Data(Vec<u8>),
    Close,
}

/// Handle to a running shell: input goes in here, output leaves through the
/// session's event sink.
pub struct ShellHandle {
    tx: mpsc::UnboundedSender<ShellInput>,
}

impl ShellHandle {
    /// Send input bytes to the shell.
    ///
    /// # Errors
    ///
    /// Returns an error if the shell has already terminated.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(ShellInput::Data(data.into()))
            .map_err(|_| ClientError::Channel {
                reason: "shell is closed".to_string(),
            })
    }

    /// Request shell termination. Idempotent; already-closed shells are not
    /// an error.
    pub fn close(&self) {
        let _ = self.tx.send(ShellInput::Close);
    }

    /// Whether the shell task is still running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawn the read loop for an open shell channel.
///
/// The task forwards every output chunk (stdout and stderr alike) to `sink`
/// as [`Event::ShellOutput`] tagged with `key`, and exits when the channel
/// closes or a close request arrives. Chunk boundaries are whatever the
/// server sent; no line buffering is applied.
pub fn spawn_shell(
    key: String,
    channel: russh::Channel<Msg>,
    sink: Arc<dyn EventSink>,
) -> ShellHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<ShellInput>();

    tokio::spawn(async move {
        // PTY output (stderr included, merged by the terminal) arrives on the
        // stream's read half; the write half feeds the shell's stdin.
        let (mut reader, mut writer) = tokio::io::split(channel.into_stream());
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        sink.emit(Event::ShellOutput {
                            key: key.clone(),
                            data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        });
                    }
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "Shell read ended");
                        break;
                    }
                },
                input = rx.recv() => match input {
                    Some(ShellInput::Data(bytes)) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            tracing::warn!(key = %key, error = %e, "Failed to write to shell");
                            break;
                        }
                    }
                    // Handle dropped or explicit close
                    Some(ShellInput::Close) | None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
        tracing::debug!(key = %key, "Shell task finished");
    });

    ShellHandle { tx }
}
