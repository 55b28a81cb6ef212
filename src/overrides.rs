//! Per-container replacement audio.
//!
//! An override maps an audio id to a staged file already in the native
//! codec. The store owns the staged files: replacing or removing an entry
//! deletes the file it pointed at. Dirty state is never stored; it is
//! answered from the entry map on every query.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::extension_of;
use crate::error::{KernelError, Result};
use crate::registry::exists;
use crate::transcode::Transcoder;
use crate::types::{AudioId, ContainerLabel};

/// Which ids a container accepts overrides for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverridePolicy {
    /// Any id; unknown ids become new entries on export (banks).
    AllowNew,
    /// Only ids in the set (packages: the entry table).
    ExistingOnly(BTreeSet<AudioId>),
}

impl OverridePolicy {
    fn permits(&self, id: AudioId) -> bool {
        match self {
            Self::AllowNew => true,
            Self::ExistingOnly(ids) => ids.contains(&id),
        }
    }
}

/// One staged replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    /// Replaced or added id.
    pub id: AudioId,
    /// Staged native-codec file, owned by the store.
    pub path: PathBuf,
    /// File the user supplied.
    pub source: PathBuf,
    /// When the entry was staged.
    pub staged_at: DateTime<Utc>,
}

/// Override map of one container.
#[derive(Debug)]
pub struct OverrideStore {
    label: ContainerLabel,
    container_name: String,
    policy: OverridePolicy,
    native_extension: String,
    staging_dir: PathBuf,
    entries: BTreeMap<AudioId, OverrideEntry>,
}

impl OverrideStore {
    /// Create an empty store. Verbatim copies are staged into `staging_dir`.
    pub fn new(
        label: ContainerLabel,
        container_name: impl Into<String>,
        policy: OverridePolicy,
        native_extension: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label,
            container_name: container_name.into(),
            policy,
            native_extension: native_extension.into(),
            staging_dir: staging_dir.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Stage `file` as the replacement for `id`.
    ///
    /// Files already in the native codec are copied under a fresh random
    /// name; anything else goes through `transcoder`. A previous entry for
    /// the same id is replaced and its staged file deleted.
    pub async fn add_override<T: Transcoder>(
        &mut self,
        id: AudioId,
        file: &Path,
        transcoder: &T,
    ) -> Result<&OverrideEntry> {
        if !self.policy.permits(id) {
            return Err(KernelError::UnknownAudioId {
                id,
                container: self.container_name.clone(),
            });
        }

        let staged = self.stage(file, transcoder).await?;
        debug!(label = %self.label, id = %id, staged = %staged.display(), "Staged override");

        let entry = OverrideEntry {
            id,
            path: staged,
            source: file.to_path_buf(),
            staged_at: Utc::now(),
        };
        if let Some(previous) = self.entries.insert(id, entry) {
            release(&previous.path).await;
        }

        info!(label = %self.label, id = %id, "Override added");
        Ok(&self.entries[&id])
    }

    async fn stage<T: Transcoder>(&self, file: &Path, transcoder: &T) -> Result<PathBuf> {
        if extension_of(file).as_deref() != Some(self.native_extension.as_str()) {
            return transcoder
                .transcode(file, &self.native_extension)
                .await
                .map_err(|e| KernelError::from_transcoder(file, e));
        }

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| KernelError::staging(&self.staging_dir, e))?;
        let target = self
            .staging_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), self.native_extension));
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| KernelError::staging(file, e))?;
        Ok(target)
    }

    /// Drop the override for `id` and delete its staged file.
    ///
    /// Deletion failures are logged, not raised.
    pub async fn remove_override(&mut self, id: AudioId) -> Option<OverrideEntry> {
        let entry = self.entries.remove(&id)?;
        release(&entry.path).await;
        info!(label = %self.label, id = %id, "Override removed");
        Some(entry)
    }

    /// Whether `id` currently has an override.
    pub fn is_dirty(&self, id: AudioId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Override for `id`.
    pub fn get(&self, id: AudioId) -> Option<&OverrideEntry> {
        self.entries.get(&id)
    }

    /// Entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &OverrideEntry> {
        self.entries.values()
    }

    /// Overridden ids in order.
    pub fn ids(&self) -> Vec<AudioId> {
        self.entries.keys().copied().collect()
    }

    /// Number of overrides.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no overrides.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete every staged file and drop all entries.
    pub async fn release_all(&mut self) {
        for entry in std::mem::take(&mut self.entries).into_values() {
            release(&entry.path).await;
        }
    }
}

async fn release(path: &Path) {
    if !exists(path).await {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staged file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged file"),
    }
}
