use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    // Connection-level errors: these leave the session disconnected
    #[error("connection to {host}:{port} failed: {reason}")]
    Network {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    #[error("invalid private key: {reason}")]
    KeyInvalid { reason: String },

    // Remote filesystem errors
    #[error("remote path not found: {path}")]
    NotFound { path: String },

    #[error("permission denied: {path}")]
    Permission { path: String },

    #[error("no space left writing {path}")]
    NoSpace { path: String },

    #[error("file too large: {path} is {size} bytes (limit: {limit_bytes})")]
    TooLarge {
        path: String,
        size: u64,
        limit_bytes: u64,
    },

    // Channel errors (shell or exec setup)
    #[error("channel error: {reason}")]
    Channel { reason: String },

    #[error("command output too large (limit: {limit_bytes} bytes)")]
    OutputTooLarge { limit_bytes: u64 },

    // Registry errors
    #[error("a session is already open under key '{key}'")]
    DuplicateSession { key: String },

    #[error("no session under key '{key}'")]
    SessionNotFound { key: String },

    // Unclassified SFTP protocol faults
    #[error("SFTP error: {reason}")]
    Sftp { reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_display() {
        let err = ClientError::Network {
            host: "example.com".to_string(),
            port: 22,
            reason: "connection refused".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("example.com"));
        assert!(msg.contains("22"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_timeout_display() {
        let err = ClientError::Timeout { seconds: 15 };
        let msg = format!("{err}");
        assert!(msg.contains("15"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn test_auth_display() {
        let err = ClientError::Auth {
            user: "deploy".to_string(),
            host: "server1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("deploy"));
        assert!(msg.contains("server1"));
    }

    #[test]
    fn test_key_invalid_display() {
        let err = ClientError::KeyInvalid {
            reason: "bad passphrase".to_string(),
        };
        assert!(format!("{err}").contains("bad passphrase"));
    }

    #[test]
    fn test_not_found_display() {
        let err = ClientError::NotFound {
            path: "/var/missing".to_string(),
        };
        assert!(format!("{err}").contains("/var/missing"));
    }

    #[test]
    fn test_permission_display() {
        let err = ClientError::Permission {
            path: "/etc/shadow".to_string(),
        };
        assert!(format!("{err}").contains("/etc/shadow"));
    }

    #[test]
    fn test_no_space_display() {
        let err = ClientError::NoSpace {
            path: "/data/blob".to_string(),
        };
        assert!(format!("{err}").contains("/data/blob"));
    }

    #[test]
    fn test_too_large_display() {
        let err = ClientError::TooLarge {
            path: "/var/log/huge".to_string(),
            size: 200,
            limit_bytes: 100,
        };
        let msg = format!("{err}");
        assert!(msg.contains("/var/log/huge"));
        assert!(msg.contains("200"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_channel_display() {
        let err = ClientError::Channel {
            reason: "shell not open".to_string(),
        };
        assert!(format!("{err}").contains("shell not open"));
    }

    #[test]
    fn test_duplicate_session_display() {
        let err = ClientError::DuplicateSession {
            key: "prod-1".to_string(),
        };
        assert!(format!("{err}").contains("prod-1"));
    }

    #[test]
    fn test_session_not_found_display() {
        let err = ClientError::SessionNotFound {
            key: "gone".to_string(),
        };
        assert!(format!("{err}").contains("gone"));
    }

    #[test]
    fn test_output_too_large_display() {
        let err = ClientError::OutputTooLarge {
            limit_bytes: 1_048_576,
        };
        assert!(format!("{err}").contains("1048576"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ClientError = io_err.into();
        assert!(format!("{err}").contains("file not found"));
    }

    #[test]
    fn test_all_variants_display_and_debug() {
        let variants: Vec<ClientError> = vec![
            ClientError::Network {
                host: "a".to_string(),
                port: 22,
                reason: "b".to_string(),
            },
            ClientError::Timeout { seconds: 1 },
            ClientError::Auth {
                user: "c".to_string(),
                host: "d".to_string(),
            },
            ClientError::KeyInvalid {
                reason: "e".to_string(),
            },
            ClientError::NotFound {
                path: "f".to_string(),
            },
            ClientError::Permission {
                path: "g".to_string(),
            },
            ClientError::NoSpace {
                path: "h".to_string(),
            },
            ClientError::TooLarge {
                path: "i".to_string(),
                size: 2,
                limit_bytes: 1,
            },
            ClientError::Channel {
                reason: "j".to_string(),
            },
            ClientError::OutputTooLarge { limit_bytes: 3 },
            ClientError::DuplicateSession {
                key: "k".to_string(),
            },
            ClientError::SessionNotFound {
                key: "l".to_string(),
            },
            ClientError::Sftp {
                reason: "m".to_string(),
            },
        ];

        for err in variants {
            let _ = format!("{err}");
            let _ = format!("{err:?}");
        }
    }

    #[test]
    fn test_result_type_alias() {
        let ok: Result<u32> = Ok(7);
        let err: Result<u32> = Err(ClientError::Timeout { seconds: 5 });
        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
