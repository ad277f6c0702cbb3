use std::path::PathBuf;

/// Failures raised by the bridge layer.
///
/// Most of these never reach the host: background subsystems log them and
/// carry on. Only `ContentUnavailable` (from a bounded synchronous fetch) and
/// `FileIo` during a save are meant to be shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A message was sent on a topic nobody listens to.
    #[error("no listener for topic '{topic}'")]
    TransportDropped { topic: String },

    #[error("failed to start language server '{command}': {reason}")]
    ProxyLaunchFailed { command: String, reason: String },

    #[error("editor content unavailable: {reason}")]
    ContentUnavailable { reason: String },

    #[error("I/O failure on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A move was observed but the destination vanished before it could be bound.
    #[error("inconsistent move from {} to {}", from.display(), to.display())]
    RenameRace { from: PathBuf, to: PathBuf },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration at {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn content_unavailable(reason: impl Into<String>) -> Self {
        Error::ContentUnavailable {
            reason: reason.into(),
        }
    }
}
