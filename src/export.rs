//! Export of patched containers.
//!
//! Exporting one container:
//!
//! 1. No overrides and no embedded payload: save directly.
//! 2. Otherwise clear and recreate `<temp>/export/<label>/`.
//! 3. Embedded payload is extracted into staging first.
//! 4. Every override's staged file is copied to `<id>.<ext>`, replacing the
//!    extracted original.
//! 5. Banks only: the index is reconciled against the override set
//!    (see [`reconcile_index`]).
//! 6. The codec saves the sections, pulling bytes from staging.
//!
//! Batch exports run containers strictly one after another. A failed
//! container is recorded and the batch moves on; only a batch in which every
//! container failed is an error.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::ContainerCodec;
use crate::error::{KernelError, Result};
use crate::graph::managed_sources;
use crate::overrides::OverrideStore;
use crate::registry::exists;
use crate::types::{AudioId, BankData, ContainerData, ContainerLabel, IndexEntry};

/// What [`reconcile_index`] changed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexReconciliation {
    /// Existing entries reset to placeholder offset/length.
    pub updated: Vec<AudioId>,
    /// New placeholder entries.
    pub appended: Vec<AudioId>,
    /// Overrides of hierarchy sources with no index entry; left untouched.
    pub managed_without_entry: Vec<AudioId>,
    /// Whether an empty payload section had to be added.
    pub payload_added: bool,
}

/// Fold an override set into a bank's index before a staged save.
///
/// - The index section is created if missing.
/// - Existing entries for overridden ids get a placeholder offset and
///   length, which the codec recomputes from staging.
/// - Ids with no entry that the hierarchy does not reference get a new
///   placeholder entry (pure additions).
/// - A payload section is added when overrides exist.
pub fn reconcile_index(bank: &mut BankData, overrides: &[AudioId]) -> IndexReconciliation {
    let mut result = IndexReconciliation::default();
    if overrides.is_empty() {
        return result;
    }

    let managed: BTreeSet<AudioId> = managed_sources(bank.hierarchy()).into_iter().collect();
    let index = bank.ensure_index();

    for &id in overrides {
        if let Some(entry) = index.entry_mut(id) {
            entry.reset();
            result.updated.push(id);
        } else if !managed.contains(&id) {
            index.entries.push(IndexEntry::placeholder(id));
            result.appended.push(id);
        } else {
            debug!(id = %id, "Managed source has no index entry");
            result.managed_without_entry.push(id);
        }
    }

    result.payload_added = bank.ensure_payload();
    result
}

/// One container handed to the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct ExportTarget<'a> {
    /// Display name, also the output file name in batch exports.
    pub name: &'a str,
    /// Container label.
    pub label: &'a ContainerLabel,
    /// Source file.
    pub path: &'a Path,
    /// Current decoded contents.
    pub data: &'a ContainerData,
    /// Staged overrides.
    pub overrides: &'a OverrideStore,
    /// Whether any graph node was edited.
    pub edited: bool,
}

impl ExportTarget<'_> {
    /// Whether a batch export should include this container.
    pub fn needs_export(&self) -> bool {
        !self.overrides.is_empty() || self.edited
    }
}

/// Outcome of one successful export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    /// Container name.
    pub name: String,
    /// Container label.
    pub label: ContainerLabel,
    /// Written file.
    pub destination: PathBuf,
    /// Number of overrides applied.
    pub overrides: usize,
    /// Whether a staging directory was used.
    pub staged: bool,
    /// Index changes (banks with overrides only).
    pub reconciliation: Option<IndexReconciliation>,
}

/// One failed container in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFailure {
    /// Container name.
    pub name: String,
    /// Container label.
    pub label: ContainerLabel,
    /// Error message.
    pub reason: String,
    /// Stable error code.
    pub code: String,
}

/// Summary of a batch export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// When the batch started.
    pub started_at: DateTime<Utc>,
    /// When the batch finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Containers exported.
    pub succeeded: usize,
    /// Containers that failed.
    pub failed: usize,
    /// Per-container success details.
    pub records: Vec<ExportRecord>,
    /// Per-container failure details.
    pub failures: Vec<ExportFailure>,
}

impl BatchReport {
    /// Start an empty report.
    pub fn begin() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            succeeded: 0,
            failed: 0,
            records: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn record_success(&mut self, record: ExportRecord) {
        self.succeeded += 1;
        self.records.push(record);
    }

    fn record_failure(&mut self, failure: ExportFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Number of containers attempted.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Progress after one container of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProgress {
    /// Containers processed so far, this one included.
    pub completed: usize,
    /// Containers in the batch.
    pub total: usize,
    /// Container just processed.
    pub label: ContainerLabel,
    /// Its name.
    pub name: String,
    /// Whether it succeeded.
    pub succeeded: bool,
}

/// Drives staging and saving for one or many containers.
pub struct ExportCoordinator<C: ContainerCodec> {
    codec: Arc<C>,
    temp_dir: PathBuf,
    native_extension: String,
}

impl<C: ContainerCodec + 'static> ExportCoordinator<C> {
    /// Create a coordinator staging under `<temp_dir>/export`.
    pub fn new(codec: Arc<C>, temp_dir: impl Into<PathBuf>, native_extension: impl Into<String>) -> Self {
        Self {
            codec,
            temp_dir: temp_dir.into(),
            native_extension: native_extension.into(),
        }
    }

    /// Staging directory of a container.
    pub fn staging_dir(&self, label: &ContainerLabel) -> PathBuf {
        self.temp_dir.join("export").join(label)
    }

    /// Export one container to `destination`.
    pub async fn export_one(&self, target: &ExportTarget<'_>, destination: &Path) -> Result<ExportRecord> {
        debug!(label = %target.label, overrides = target.overrides.len(), "Processing container");

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KernelError::staging(parent, e))?;
        }

        let mut record = ExportRecord {
            name: target.name.to_string(),
            label: target.label.clone(),
            destination: destination.to_path_buf(),
            overrides: target.overrides.len(),
            staged: false,
            reconciliation: None,
        };

        if target.overrides.is_empty() && !target.data.has_payload() {
            debug!(label = %target.label, "Nothing to stage, saving directly");
            self.codec
                .save(target.data, destination, None)
                .await
                .map_err(|e| KernelError::from_codec("save", e))?;
            info!(label = %target.label, destination = %destination.display(), "Container saved");
            return Ok(record);
        }

        let staging = self.staging_dir(target.label);
        if exists(&staging).await {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| KernelError::staging(&staging, e))?;
            debug!(staging = %staging.display(), "Cleaned up existing staging directory");
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| KernelError::staging(&staging, e))?;

        if target.data.has_payload() {
            self.codec
                .extract_whole_container(target.path, &staging)
                .await
                .map_err(|e| KernelError::from_codec("extract", e))?;
        }

        for entry in target.overrides.entries() {
            let staged = staging.join(entry.id.file_name(&self.native_extension));
            tokio::fs::copy(&entry.path, &staged)
                .await
                .map_err(|e| KernelError::staging(&entry.path, e))?;
            debug!(id = %entry.id, "Staged replacement audio");
        }

        let mut data = target.data.clone();
        if let ContainerData::Bank(bank) = &mut data {
            if !target.overrides.is_empty() {
                record.reconciliation = Some(reconcile_index(bank, &target.overrides.ids()));
            }
        }

        self.codec
            .save(&data, destination, Some(&staging))
            .await
            .map_err(|e| KernelError::from_codec("save", e))?;

        record.staged = true;
        info!(label = %target.label, destination = %destination.display(), "Container saved");
        Ok(record)
    }

    /// Export every target that needs it into `destination_dir`, one at a
    /// time, calling `on_progress` after each.
    ///
    /// Containers sharing a file name write into the same destination; only
    /// the first successful one is written, later ones fail with
    /// [`KernelError::DestinationConflict`].
    ///
    /// Returns [`KernelError::ExportAllFailed`] only when every attempted
    /// container failed.
    pub async fn export_batch<F>(
        &self,
        targets: &[ExportTarget<'_>],
        destination_dir: &Path,
        mut on_progress: F,
    ) -> Result<BatchReport>
    where
        F: FnMut(&ExportProgress) + Send,
    {
        let pending: Vec<&ExportTarget<'_>> = targets.iter().filter(|t| t.needs_export()).collect();
        let mut report = BatchReport::begin();

        if pending.is_empty() {
            warn!("No containers need export");
            report.finish();
            return Ok(report);
        }

        let total = pending.len();
        info!(total, destination = %destination_dir.display(), "Starting batch export");

        // Output file -> container that wrote it
        let mut written: HashMap<PathBuf, ContainerLabel> = HashMap::new();

        for (index, target) in pending.into_iter().enumerate() {
            let destination = destination_dir.join(target.name);
            let outcome = match written.get(&destination) {
                Some(winner) => Err(KernelError::DestinationConflict {
                    destination: destination.clone(),
                    winner: winner.clone(),
                }),
                None => self.export_one(target, &destination).await,
            };
            let succeeded = match outcome {
                Ok(record) => {
                    written.insert(destination, target.label.clone());
                    report.record_success(record);
                    true
                }
                Err(e) => {
                    warn!(label = %target.label, error = %e, "Container export failed");
                    report.record_failure(ExportFailure {
                        name: target.name.to_string(),
                        label: target.label.clone(),
                        reason: e.to_string(),
                        code: e.error_code().to_string(),
                    });
                    false
                }
            };

            on_progress(&ExportProgress {
                completed: index + 1,
                total,
                label: target.label.clone(),
                name: target.name.to_string(),
                succeeded,
            });
        }

        report.finish();
        info!(succeeded = report.succeeded, failed = report.failed, "Batch export finished");

        if report.succeeded == 0 {
            return Err(KernelError::ExportAllFailed {
                report: Box::new(report),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InMemoryCodec;
    use crate::overrides::OverridePolicy;
    use crate::transcode::StubTranscoder;
    use crate::types::{HierarchyEntry, MusicTrack, SectionKind, TrackSlot, TrackType};

    fn id(raw: u32) -> AudioId {
        AudioId::new(raw).unwrap()
    }

    fn track_playing(track_id: u32, source: u32) -> HierarchyEntry {
        HierarchyEntry::MusicTrack(MusicTrack {
            id: track_id,
            track_type: TrackType::Normal,
            playlist: vec![TrackSlot {
                source_id: source,
                ..TrackSlot::default()
            }],
        })
    }

    #[test]
    fn test_reconcile_index() {
        // Index lists 1 and 2; hierarchy plays 2 and 3 (3 streamed)
        let mut bank = InMemoryCodec::pack_bank(
            vec![track_playing(10, 2), track_playing(11, 3)],
            &[(id(1), b"one".to_vec()), (id(2), b"two".to_vec())],
            true,
        );

        let result = reconcile_index(&mut bank, &[id(1), id(3), id(99)]);

        assert_eq!(result.updated, vec![id(1)]);
        assert_eq!(result.appended, vec![id(99)]);
        assert_eq!(result.managed_without_entry, vec![id(3)]);
        assert!(!result.payload_added);

        let index = bank.index().unwrap();
        assert_eq!(index.entries[0], IndexEntry { id: 1, offset: 0, length: 0 });
        assert_eq!(index.entries[1], IndexEntry { id: 2, offset: 3, length: 3 });
        assert_eq!(index.entries[2], IndexEntry::placeholder(id(99)));
    }

    #[test]
    fn test_reconcile_creates_sections() {
        let mut bank = InMemoryCodec::pack_bank(vec![], &[], false);
        assert!(!bank.has_section(SectionKind::Index));

        let result = reconcile_index(&mut bank, &[id(99)]);
        assert!(result.payload_added);
        assert!(bank.has_section(SectionKind::Index));
        assert!(bank.has_payload());

        // No overrides leaves the bank alone
        let mut untouched = InMemoryCodec::pack_bank(vec![], &[], false);
        assert_eq!(reconcile_index(&mut untouched, &[]), IndexReconciliation::default());
        assert!(!untouched.has_payload());
    }

    #[tokio::test]
    async fn test_export_one_adds_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("music.bnk");
        let codec = Arc::new(InMemoryCodec::new());
        let bank = InMemoryCodec::pack_bank(vec![], &[(id(1), b"one".to_vec())], true);
        let data = ContainerData::Bank(bank);
        codec.install(&path, data.clone(), vec![]).await.unwrap();

        let replacement = dir.path().join("new.wem");
        tokio::fs::write(&replacement, b"ninety-nine").await.unwrap();
        let label = ContainerLabel::from_path(&path);
        let mut overrides = OverrideStore::new(
            label.clone(),
            "music.bnk",
            OverridePolicy::AllowNew,
            "wem",
            dir.path().join("overrides"),
        );
        let transcoder = StubTranscoder::new(dir.path().join("transcode"));
        overrides.add_override(id(99), &replacement, &transcoder).await.unwrap();

        let exporter = ExportCoordinator::new(Arc::clone(&codec), dir.path().join("temp"), "wem");
        let target = ExportTarget {
            name: "music.bnk",
            label: &label,
            path: &path,
            data: &data,
            overrides: &overrides,
            edited: false,
        };
        let out = dir.path().join("out").join("music.bnk");
        let record = exporter.export_one(&target, &out).await.unwrap();

        assert!(record.staged);
        assert_eq!(record.reconciliation.unwrap().appended, vec![id(99)]);
        assert_eq!(codec.audio_bytes(&out, id(99)).unwrap(), b"ninety-nine");
        assert_eq!(codec.audio_bytes(&out, id(1)).unwrap(), b"one");

        // Session data is not touched by reconciliation
        match &data {
            ContainerData::Bank(bank) => assert_eq!(bank.index().unwrap().entries.len(), 1),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_direct_save_without_staging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamed.bnk");
        let codec = Arc::new(InMemoryCodec::new());
        let data = ContainerData::Bank(InMemoryCodec::pack_bank(vec![], &[], false));
        codec.install(&path, data.clone(), vec![]).await.unwrap();

        let label = ContainerLabel::from_path(&path);
        let overrides = OverrideStore::new(label.clone(), "streamed.bnk", OverridePolicy::AllowNew, "wem", dir.path());
        let exporter = ExportCoordinator::new(Arc::clone(&codec), dir.path().join("temp"), "wem");
        let target = ExportTarget {
            name: "streamed.bnk",
            label: &label,
            path: &path,
            data: &data,
            overrides: &overrides,
            edited: true,
        };

        let out = dir.path().join("streamed_out.bnk");
        let record = exporter.export_one(&target, &out).await.unwrap();
        assert!(!record.staged);
        assert!(!exporter.staging_dir(&label).exists());
        assert_eq!(codec.stored(&out), Some(data));
    }

    #[tokio::test]
    async fn test_batch_without_targets_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ExportCoordinator::new(Arc::new(InMemoryCodec::new()), dir.path(), "wem");

        let mut calls = 0;
        let report = exporter
            .export_batch(&[], dir.path(), |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(report.total(), 0);
        assert!(report.finished_at.is_some());
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_batch_same_name_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let codec = Arc::new(InMemoryCodec::new());
        let exporter = ExportCoordinator::new(Arc::clone(&codec), dir.path().join("temp"), "wem");

        let base = dir.path().join("base").join("music.bnk");
        let patch = dir.path().join("patch").join("music.bnk");
        let base_data = ContainerData::Bank(InMemoryCodec::pack_bank(vec![track_playing(1, 10)], &[], false));
        let patch_data = ContainerData::Bank(InMemoryCodec::pack_bank(vec![track_playing(2, 20)], &[], false));
        let (base_label, patch_label) = (ContainerLabel::from_path(&base), ContainerLabel::from_path(&patch));
        let base_overrides = OverrideStore::new(base_label.clone(), "music.bnk", OverridePolicy::AllowNew, "wem", dir.path());
        let patch_overrides = OverrideStore::new(patch_label.clone(), "music.bnk", OverridePolicy::AllowNew, "wem", dir.path());

        let targets = [
            ExportTarget {
                name: "music.bnk",
                label: &base_label,
                path: &base,
                data: &base_data,
                overrides: &base_overrides,
                edited: true,
            },
            ExportTarget {
                name: "music.bnk",
                label: &patch_label,
                path: &patch,
                data: &patch_data,
                overrides: &patch_overrides,
                edited: true,
            },
        ];

        let out = dir.path().join("out");
        let report = exporter.export_batch(&targets, &out, |_| {}).await.unwrap();

        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.records[0].label, base_label);
        assert_eq!(report.failures[0].label, patch_label);
        assert_eq!(report.failures[0].code, "DESTINATION_CONFLICT");
        assert_eq!(codec.stored(&out.join("music.bnk")), Some(base_data));
    }

    #[tokio::test]
    async fn test_batch_all_failed() {
        let dir = tempfile::tempdir().unwrap();
        let codec = Arc::new(InMemoryCodec::new());
        // Never installed: extraction fails
        let path = dir.path().join("ghost.bnk");
        let data = ContainerData::Bank(InMemoryCodec::pack_bank(vec![], &[(id(1), b"x".to_vec())], true));
        let label = ContainerLabel::from_path(&path);
        let overrides = OverrideStore::new(label.clone(), "ghost.bnk", OverridePolicy::AllowNew, "wem", dir.path());

        let exporter = ExportCoordinator::new(Arc::clone(&codec), dir.path().join("temp"), "wem");
        let target = ExportTarget {
            name: "ghost.bnk",
            label: &label,
            path: &path,
            data: &data,
            overrides: &overrides,
            edited: true,
        };

        let mut progress = Vec::new();
        let err = exporter
            .export_batch(&[target], &dir.path().join("out"), |p| progress.push(p.clone()))
            .await
            .unwrap_err();

        match err {
            KernelError::ExportAllFailed { report } => {
                assert_eq!(report.failed, 1);
                assert_eq!(report.failures[0].code, "CODEC");
            }
            other => panic!("expected ExportAllFailed, got {other:?}"),
        }
        assert_eq!(progress.len(), 1);
        assert!(!progress[0].succeeded);
    }
}
