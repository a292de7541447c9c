//! Error types for the reporting pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use tracegate_client::ClientError;

use crate::model::TracingTool;

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum TraceGateError {
    /// Missing or invalid configuration (CI variables, credentials, flags).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A tracked project's repository could not be opened or read.
    #[error("git error for project '{project}': {source}")]
    Git {
        project: String,
        #[source]
        source: git2::Error,
    },

    /// Local file could not be read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The traces server refused or failed a request.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The result folder is missing core machine metadata.
    #[error("invalid report: {}", errors.join("; "))]
    InvalidReport { errors: Vec<String> },

    /// A frame could not be decoded to compute its pixel checksum.
    #[error("failed to decode image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The trace names a tracing tool we cannot replay, or none at all.
    #[error("unknown tracing tool '{}'", name.as_deref().unwrap_or("(none)"))]
    UnknownTool { name: Option<String> },

    /// A captured image whose name does not encode a frame id.
    #[error("'{stem}' is not a valid {tool} frame name")]
    InvalidFrameName { stem: String, tool: TracingTool },

    /// An artifact of an execution could not be checksummed or uploaded.
    /// Shared between every execution referencing the same blob.
    #[error("{}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: Arc<TraceGateError>,
    },

    /// A blocking or upload worker died before reporting its result.
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// No worker reported a result for this path.
    #[error("no result for {}: its worker did not finish", path.display())]
    Unprocessed { path: PathBuf },
}

impl TraceGateError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, source: TraceGateError) -> Self {
        Self::Artifact {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidReport { .. } => 1,
            Self::Client(e) => e.exit_code().min(2),
            Self::UnknownTool { .. } | Self::InvalidFrameName { .. } => 1,
            Self::Artifact { source, .. } => source.exit_code(),
            Self::Config { .. }
            | Self::Git { .. }
            | Self::Io { .. }
            | Self::Image { .. }
            | Self::Task(_)
            | Self::Unprocessed { .. } => 2,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, TraceGateError>;
