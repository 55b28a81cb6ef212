//! Error types for kernel operations.

use std::path::PathBuf;

use crate::export::BatchReport;
use crate::types::{AudioId, ContainerLabel, NodeKey};

/// Result alias used across the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors surfaced by session, registry, override and export operations.
///
/// Per-container and per-id failures inside batch operations are reported as
/// values in the batch result; only the variants returned directly by an
/// operation abort it.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// File is not a bank or package, or its contents violate a structural
    /// invariant (e.g. duplicate hierarchy ids).
    #[error("Unsupported container {path}: {reason}")]
    UnsupportedContainer {
        /// Offending file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// No opened container can supply bytes for an id.
    #[error("Source not found for audio id {id}")]
    SourceNotFound {
        /// Requested id.
        id: AudioId,
    },

    /// Package entry table does not list the id.
    #[error("Audio id {id} is not listed in container {container}")]
    UnknownAudioId {
        /// Rejected id.
        id: AudioId,
        /// Container name.
        container: String,
    },

    /// External transcoder failed.
    #[error("Transcode failed for {input}: {reason}")]
    TranscodeFailure {
        /// Input file.
        input: PathBuf,
        /// Tool message.
        reason: String,
    },

    /// Temp or staging file operation failed.
    #[error("Staging I/O failed at {path}: {source}")]
    StagingIo {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Every container of a batch export failed.
    #[error("Export failed for all {} containers", .report.failed)]
    ExportAllFailed {
        /// Full batch report with per-container reasons.
        report: Box<BatchReport>,
    },

    /// Another container of the same batch already wrote this file.
    #[error("Export destination {} already written by container {winner}", .destination.display())]
    DestinationConflict {
        /// Contested output file.
        destination: PathBuf,
        /// Container that claimed it first.
        winner: ContainerLabel,
    },

    /// Codec operation failed.
    #[error("Codec {operation} failed: {reason}")]
    Codec {
        /// `load`, `extract` or `save`.
        operation: &'static str,
        /// Codec message.
        reason: String,
    },

    /// Label does not name an opened container.
    #[error("Container not open: {0}")]
    ContainerNotOpen(ContainerLabel),

    /// Node key does not exist in the projection.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeKey),

    /// Node exists but does not support the operation.
    #[error("Invalid node {key}: {reason}")]
    InvalidNode {
        /// Node key.
        key: NodeKey,
        /// Why the operation does not apply.
        reason: String,
    },

    /// Loudness measurement failed.
    #[error("Loudness measurement failed for {path}: {reason}")]
    Loudness {
        /// Measured file.
        path: PathBuf,
        /// Reader message.
        reason: String,
    },

    /// Import file extension is not accepted.
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// Wrap an I/O error with the path it happened on.
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StagingIo {
            path: path.into(),
            source,
        }
    }

    /// Create a codec error from any error type.
    pub fn from_codec<E: std::error::Error>(operation: &'static str, e: E) -> Self {
        Self::Codec {
            operation,
            reason: e.to_string(),
        }
    }

    /// Create a transcode error from any error type.
    pub fn from_transcoder<E: std::error::Error>(input: impl Into<PathBuf>, e: E) -> Self {
        Self::TranscodeFailure {
            input: input.into(),
            reason: e.to_string(),
        }
    }

    /// Create a loudness error from any error type.
    pub fn loudness<E: std::error::Error>(path: impl Into<PathBuf>, e: E) -> Self {
        Self::Loudness {
            path: path.into(),
            reason: e.to_string(),
        }
    }

    /// Whether this error aborts a whole batch instead of one container.
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(self, Self::ExportAllFailed { .. } | Self::Config(_))
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedContainer { .. } => "UNSUPPORTED_CONTAINER",
            Self::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            Self::UnknownAudioId { .. } => "UNKNOWN_AUDIO_ID",
            Self::TranscodeFailure { .. } => "TRANSCODE_FAILURE",
            Self::StagingIo { .. } => "STAGING_IO",
            Self::ExportAllFailed { .. } => "EXPORT_ALL_FAILED",
            Self::DestinationConflict { .. } => "DESTINATION_CONFLICT",
            Self::Codec { .. } => "CODEC",
            Self::ContainerNotOpen(_) => "CONTAINER_NOT_OPEN",
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::InvalidNode { .. } => "INVALID_NODE",
            Self::Loudness { .. } => "LOUDNESS",
            Self::UnsupportedAudioFormat(_) => "UNSUPPORTED_AUDIO_FORMAT",
            Self::Config(_) => "CONFIG",
        }
    }
}
