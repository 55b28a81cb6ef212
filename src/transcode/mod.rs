//! Audio transcoding backends.
//!
//! Transcoding engines are external collaborators. Every backend writes its
//! output under a fresh random file name, so concurrent conversions of the
//! same input never collide.

pub mod cli;
pub mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Trait for transcoding backends.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Error type for transcode operations.
    type Error: std::error::Error + Send + Sync;

    /// Convert `input` to the format named by `target_extension` and return
    /// the path of the new file.
    async fn transcode(&self, input: &Path, target_extension: &str) -> Result<PathBuf, Self::Error>;
}

/// Output path for a conversion: `<dir>/<uuid>.<extension>`.
pub(crate) fn fresh_output_path(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension))
}

pub use cli::{CliTranscodeError, CliTranscoder};
pub use memory::{StubTranscodeError, StubTranscoder};
