//! Multi-source resolution for audio ids.
//!
//! Several opened containers may claim the same audio id: a bank and the
//! package that streams its audio, or a base bank and a patch. The registry
//! keeps every candidate origin per id, ranks them, and lazily materializes
//! the winner's bytes on disk.
//!
//! ## Ranking
//!
//! Packages outrank banks. Within a kind, a container with embedded payload
//! outranks one without. Equal ranks keep registration order (stable sort).
//!
//! ## Materialization
//!
//! Bytes land at `<temp>/<label>/<id>.<native ext>`. The first access for a
//! label runs one whole-container extraction; concurrent callers for any id
//! of the same container await that same extraction before touching files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::codec::ContainerCodec;
use crate::error::{KernelError, Result};
use crate::types::{AudioId, ContainerKind, ContainerLabel};

/// One candidate container for one audio id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOrigin {
    /// Container file.
    pub container: PathBuf,
    /// Container label.
    pub label: ContainerLabel,
    /// Container family.
    pub kind: ContainerKind,
    /// Whether the container embeds payload bytes.
    pub has_payload: bool,
}

impl AudioOrigin {
    /// Priority rank; lower wins.
    pub fn rank(&self) -> u8 {
        let kind = match self.kind {
            ContainerKind::Package => 0,
            ContainerKind::Bank => 2,
        };
        kind + u8::from(!self.has_payload)
    }
}

/// Candidate origins per audio id with single-flight materialization.
pub struct SourceRegistry<C: ContainerCodec> {
    codec: Arc<C>,
    temp_dir: PathBuf,
    native_extension: String,
    origins: RwLock<HashMap<AudioId, Vec<AudioOrigin>>>,
    extractions: Mutex<HashMap<ContainerLabel, Arc<OnceCell<()>>>>,
}

impl<C: ContainerCodec + 'static> SourceRegistry<C> {
    /// Create an empty registry materializing under `temp_dir`.
    pub fn new(codec: Arc<C>, temp_dir: impl Into<PathBuf>, native_extension: impl Into<String>) -> Self {
        Self {
            codec,
            temp_dir: temp_dir.into(),
            native_extension: native_extension.into(),
            origins: RwLock::new(HashMap::new()),
            extractions: Mutex::new(HashMap::new()),
        }
    }

    /// Add a candidate for `id`. A candidate from the same container file
    /// replaces the previous one.
    pub fn register(&self, id: AudioId, origin: AudioOrigin) {
        let mut origins = self.origins.write();
        let candidates = origins.entry(id).or_default();
        candidates.retain(|existing| existing.container != origin.container);
        candidates.push(origin);
        candidates.sort_by_key(AudioOrigin::rank);
    }

    /// Remove the candidate for `id` coming from `container`.
    pub fn unregister(&self, id: AudioId, container: &Path) {
        let mut origins = self.origins.write();
        if let Some(candidates) = origins.get_mut(&id) {
            candidates.retain(|existing| existing.container != container);
            if candidates.is_empty() {
                origins.remove(&id);
            }
            debug!(id = %id, container = %container.display(), "Removed source");
        }
    }

    /// Remove every candidate coming from `container`.
    pub fn unregister_container(&self, container: &Path) {
        self.origins.write().retain(|_, candidates| {
            candidates.retain(|existing| existing.container != container);
            !candidates.is_empty()
        });
    }

    /// Highest-priority candidate for `id`.
    pub fn resolve(&self, id: AudioId) -> Option<AudioOrigin> {
        self.origins
            .read()
            .get(&id)
            .and_then(|candidates| candidates.first().cloned())
    }

    /// Every candidate for `id`, best first.
    pub fn candidates(&self, id: AudioId) -> Vec<AudioOrigin> {
        self.origins.read().get(&id).cloned().unwrap_or_default()
    }

    /// Number of ids with at least one candidate.
    pub fn len(&self) -> usize {
        self.origins.read().len()
    }

    /// Whether no id is registered.
    pub fn is_empty(&self) -> bool {
        self.origins.read().is_empty()
    }

    /// Drop all registrations. Extraction state and temp files are kept.
    pub fn clear(&self) {
        debug!("Clearing sources");
        self.origins.write().clear();
    }

    /// Extraction directory of a container.
    pub fn container_dir(&self, label: &ContainerLabel) -> PathBuf {
        self.temp_dir.join(label)
    }

    /// Path of the original bytes of `id`, extracting its winning container
    /// on first access.
    pub async fn materialize(&self, id: AudioId) -> Result<PathBuf> {
        let origin = self.resolve(id).ok_or(KernelError::SourceNotFound { id })?;
        let dir = self.container_dir(&origin.label);
        let expected = dir.join(id.file_name(&self.native_extension));

        let cell = {
            let mut extractions = self.extractions.lock();
            Arc::clone(extractions.entry(origin.label.clone()).or_default())
        };

        // Files under the label dir are only trusted once its extraction
        // has completed; until then they may be partially written.
        cell.get_or_try_init(|| async {
            info!(label = %origin.label, container = %origin.container.display(), "Extracting container");
            if exists(&dir).await {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| KernelError::staging(&dir, e))?;
            }
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| KernelError::staging(&dir, e))?;
            self.codec
                .extract_whole_container(&origin.container, &dir)
                .await
                .map_err(|e| KernelError::from_codec("extract", e))
        })
        .await?;

        if exists(&expected).await {
            Ok(expected)
        } else {
            warn!(id = %id, container = %origin.container.display(), "Source missing after extraction");
            Err(KernelError::SourceNotFound { id })
        }
    }

    /// Drop extraction state for a container and delete its directory.
    pub async fn forget_container(&self, label: &ContainerLabel) {
        self.extractions.lock().remove(label);
        let dir = self.container_dir(label);
        if exists(&dir).await {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(label = %label, error = %e, "Failed to remove container temp dir");
            }
        }
    }
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
