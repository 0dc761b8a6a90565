//! Event types and the sink abstraction through which shell output and
//! transfer progress reach the embedding application.
//!
//! The core never assumes anything about how the sink delivers events onward.
//! The only ordering guarantee is FIFO per (session key, event kind): events
//! for one key and kind are emitted from a single task in production order,
//! so any sink that does not reorder preserves it.

use serde::Serialize;
use tokio::sync::mpsc;

/// Discriminant of an [`Event`], for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ShellOutput,
    UploadProgress,
    DownloadProgress,
}

/// A fire-and-forget notification tagged with the owning session's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// One chunk of shell output. Chunk boundaries carry no meaning: a single
    /// logical line may arrive split across several events.
    ShellOutput { key: String, data: String },
    /// Aggregate upload progress, 0-100.
    UploadProgress { key: String, percent: u8 },
    /// Aggregate download progress, 0-100.
    DownloadProgress { key: String, percent: u8 },
}

impl Event {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::ShellOutput { key, .. }
            | Self::UploadProgress { key, .. }
            | Self::DownloadProgress { key, .. } => key,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ShellOutput { .. } => EventKind::ShellOutput,
            Self::UploadProgress { .. } => EventKind::UploadProgress,
            Self::DownloadProgress { .. } => EventKind::DownloadProgress,
        }
    }
}

/// Consumer-supplied destination for [`Event`]s.
///
/// `emit` must not block: it is called from session tasks and the transfer
/// engine's hot loop. Queue-backed implementations are the expected shape.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// An [`EventSink`] backed by an unbounded tokio channel.
///
/// Dropped receivers make `emit` a no-op rather than an error: events are
/// fire-and-forget notifications.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver the host application drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_accessor() {
        let ev = Event::ShellOutput {
            key: "s1".to_string(),
            data: "ls\n".to_string(),
        };
        assert_eq!(ev.key(), "s1");

        let ev = Event::UploadProgress {
            key: "s2".to_string(),
            percent: 40,
        };
        assert_eq!(ev.key(), "s2");

        let ev = Event::DownloadProgress {
            key: "s3".to_string(),
            percent: 100,
        };
        assert_eq!(ev.key(), "s3");
    }

    #[test]
    fn test_event_kind_accessor() {
        let ev = Event::ShellOutput {
            key: "k".to_string(),
            data: String::new(),
        };
        assert_eq!(ev.kind(), EventKind::ShellOutput);

        let ev = Event::UploadProgress {
            key: "k".to_string(),
            percent: 0,
        };
        assert_eq!(ev.kind(), EventKind::UploadProgress);

        let ev = Event::DownloadProgress {
            key: "k".to_string(),
            percent: 0,
        };
        assert_eq!(ev.kind(), EventKind::DownloadProgress);
    }

    #[test]
    fn test_event_serialization() {
        let ev = Event::DownloadProgress {
            key: "job-7".to_string(),
            percent: 55,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("download_progress"));
        assert!(json.contains("job-7"));
        assert!(json.contains("55"));
    }

    #[test]
    fn test_shell_output_serialization() {
        let ev = Event::ShellOutput {
            key: "term".to_string(),
            data: "hello\r\n".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("shell_output"));
        assert!(json.contains("term"));
    }

    #[tokio::test]
    async fn test_channel_sink_fifo_order() {
        let (sink, mut rx) = ChannelEventSink::new();

        for pct in [10u8, 20, 30, 100] {
            sink.emit(Event::UploadProgress {
                key: "k".to_string(),
                percent: pct,
            });
        }

        let mut received = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            received.push(ev);
        }

        let percents: Vec<u8> = received
            .iter()
            .map(|ev| match ev {
                Event::UploadProgress { percent, .. } => *percent,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(percents, vec![10, 20, 30, 100]);
    }

    #[tokio::test]
    async fn test_channel_sink_dropped_receiver_is_silent() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);

        // Must not panic or error
        sink.emit(Event::ShellOutput {
            key: "k".to_string(),
            data: "late".to_string(),
        });
    }

    #[tokio::test]
    async fn test_events_interleaved_across_keys_keep_per_key_order() {
        let (sink, mut rx) = ChannelEventSink::new();

        sink.emit(Event::DownloadProgress {
            key: "a".to_string(),
            percent: 1,
        });
        sink.emit(Event::DownloadProgress {
            key: "b".to_string(),
            percent: 1,
        });
        sink.emit(Event::DownloadProgress {
            key: "a".to_string(),
            percent: 2,
        });
        sink.emit(Event::DownloadProgress {
            key: "b".to_string(),
            percent: 2,
        });

        let mut a_order = Vec::new();
        let mut b_order = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let Event::DownloadProgress { key, percent } = ev {
                match key.as_str() {
                    "a" => a_order.push(percent),
                    "b" => b_order.push(percent),
                    _ => unreachable!(),
                }
            }
        }
        assert_eq!(a_order, vec![1, 2]);
        assert_eq!(b_order, vec![1, 2]);
    }
}
