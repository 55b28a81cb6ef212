//! Container codec backends.
//!
//! The binary format engine is an external collaborator. The kernel only
//! needs three operations from it: decode a file into sections, dump every
//! embedded audio entry into a directory, and encode sections back to disk
//! pulling audio bytes from a staging directory.

pub mod memory;

use async_trait::async_trait;
use std::path::Path;

use crate::types::{ContainerData, SectionKind};

/// Trait for container codec backends.
#[async_trait]
pub trait ContainerCodec: Send + Sync {
    /// Error type for codec operations.
    type Error: std::error::Error + Send + Sync;

    /// Decode a container. For banks, `filter` limits which sections are
    /// kept; `None` keeps every section including passthrough ones.
    async fn load(
        &self,
        path: &Path,
        filter: Option<&[SectionKind]>,
    ) -> Result<ContainerData, Self::Error>;

    /// Write every embedded audio entry of the container at `path` to
    /// `<output_dir>/<id>.<native extension>`.
    async fn extract_whole_container(&self, path: &Path, output_dir: &Path)
        -> Result<(), Self::Error>;

    /// Encode `data` to `destination`. When `staging_dir` is given, audio
    /// bytes for every entry are read from `<staging_dir>/<id>.<native
    /// extension>` and offsets/lengths are recomputed.
    async fn save(
        &self,
        data: &ContainerData,
        destination: &Path,
        staging_dir: Option<&Path>,
    ) -> Result<(), Self::Error>;
}

pub use memory::{InMemoryCodec, InMemoryCodecError};
