//! Embeddable SSH/SFTP client core.
//!
//! Sessions are opened under caller-chosen keys through a
//! [`SessionRegistry`]; every subsequent operation (command execution, SFTP
//! resource access, recursive transfers, the interactive shell) is addressed
//! by that key. Asynchronous output (shell data, transfer progress) reaches
//! the embedding application through an [`EventSink`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ssh_client_core::{ChannelEventSink, Config, Credentials, SessionRegistry};
//!
//! # async fn example() -> ssh_client_core::Result<()> {
//! let (sink, _events) = ChannelEventSink::new();
//! let registry = SessionRegistry::new(Config::default(), Arc::new(sink));
//!
//! registry
//!     .connect("build-box", "10.0.0.7", 22, &Credentials::password("ci", "secret"))
//!     .await?;
//! let output = registry.exec("build-box", "uname -a").await?;
//! println!("{}", output.stdout);
//! registry.disconnect("build-box").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod sftp;
pub mod shell;
pub mod transfer;

pub use client::{CommandOutput, SshClient};
pub use config::{AuthMethod, Config, Credentials, HostKeyPolicy, LimitsConfig};
pub use error::{ClientError, Result};
pub use events::{ChannelEventSink, Event, EventKind, EventSink};
pub use registry::SessionRegistry;
pub use sftp::{EntryKind, FileStat, RemoteEntry, RemoteFile, RemoteFs, SftpClient};
pub use shell::PtyType;
pub use transfer::{
    CancelFlag, DEFAULT_CHUNK_SIZE, TransferEngine, TransferOutcome, TransferSummary,
};
