//! The editing session.
//!
//! A [`Session`] owns every opened container together with its graph,
//! overrides and edit marks, the shared [`SourceRegistry`], the
//! [`ExportCoordinator`], the current [`Projection`], a preview cache and
//! loudness measurements of rendered previews.
//! Mutations take `&mut self`; reads, previews and exports take `&self`.
//! After every mutation the projection is rebuilt and a [`SessionEvent`] is
//! broadcast.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::codec::ContainerCodec;
use crate::config::{extension_of, KernelConfig};
use crate::error::{KernelError, Result};
use crate::export::{BatchReport, ExportCoordinator, ExportProgress, ExportRecord, ExportTarget};
use crate::graph::{find_duplicate_id, managed_sources, unmanaged_sources, GraphBuild, GraphBuilder};
use crate::loudness::{measure, LoudnessCache, LoudnessInfo};
use crate::overrides::{OverrideEntry, OverridePolicy, OverrideStore};
use crate::projection::{ContainerView, NodeRole, Projection, ProjectedNode};
use crate::registry::{exists, AudioOrigin, SourceRegistry};
use crate::transcode::{CliTranscoder, Transcoder};
use crate::types::{
    AudioId, ContainerData, ContainerKind, ContainerLabel, HierarchyEntry, Marker, NodeKey,
    PlaylistTiming, SectionKind, SegmentTiming, FADE_IN_END_MARKER, FADE_OUT_START_MARKER,
};

const EVENT_CAPACITY: usize = 100;

/// Change notification broadcast by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A container was opened.
    ContainerOpened {
        /// Its label.
        label: ContainerLabel,
        /// File name.
        name: String,
        /// Container family.
        kind: ContainerKind,
    },
    /// A container was closed.
    ContainerClosed {
        /// Its label.
        label: ContainerLabel,
    },
    /// An override was staged.
    OverrideAdded {
        /// Owning container.
        label: ContainerLabel,
        /// Overridden id.
        id: AudioId,
    },
    /// An override was dropped.
    OverrideRemoved {
        /// Owning container.
        label: ContainerLabel,
        /// Formerly overridden id.
        id: AudioId,
    },
    /// A node's timing was edited.
    NodeEdited {
        /// Edited node.
        key: NodeKey,
    },
    /// One container of a batch export finished.
    ExportProgress(ExportProgress),
    /// A batch export finished.
    ExportFinished {
        /// Containers exported.
        succeeded: usize,
        /// Containers that failed.
        failed: usize,
    },
}

/// One opened container and everything derived from it.
#[derive(Debug)]
pub struct OpenedContainer {
    path: PathBuf,
    name: String,
    label: ContainerLabel,
    content: ContainerData,
    overrides: OverrideStore,
    graph: GraphBuild,
    edited: BTreeSet<NodeKey>,
}

impl OpenedContainer {
    /// Source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label.
    pub fn label(&self) -> &ContainerLabel {
        &self.label
    }

    /// Decoded contents, including timing edits.
    pub fn content(&self) -> &ContainerData {
        &self.content
    }

    /// Staged overrides.
    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    /// Current forest.
    pub fn graph(&self) -> &GraphBuild {
        &self.graph
    }

    /// Edited node keys.
    pub fn edited(&self) -> &BTreeSet<NodeKey> {
        &self.edited
    }

    /// Ids this container can supply without overrides.
    pub fn reachable_sources(&self) -> Vec<AudioId> {
        match &self.content {
            ContainerData::Bank(bank) => {
                let mut ids = managed_sources(bank.hierarchy());
                let unmanaged = unmanaged_sources(bank.index(), &ids);
                ids.extend(unmanaged);
                ids.sort();
                ids
            }
            ContainerData::Package(package) => package.entry_ids(),
        }
    }

    fn origin(&self) -> AudioOrigin {
        AudioOrigin {
            container: self.path.clone(),
            label: self.label.clone(),
            kind: self.content.kind(),
            has_payload: self.content.has_payload(),
        }
    }

    fn is_pure_addition(&self, id: AudioId) -> bool {
        self.reachable_sources().binary_search(&id).is_err()
    }

    fn view(&self) -> ContainerView<'_> {
        ContainerView {
            label: &self.label,
            name: &self.name,
            path: &self.path,
            content: &self.content,
            graph: &self.graph,
            overrides: &self.overrides,
            edited: &self.edited,
        }
    }

    fn export_target(&self) -> ExportTarget<'_> {
        ExportTarget {
            name: &self.name,
            label: &self.label,
            path: &self.path,
            data: &self.content,
            overrides: &self.overrides,
            edited: !self.edited.is_empty(),
        }
    }

    fn rebuild_graph(&mut self) {
        self.graph = GraphBuilder::new(&self.label).build(self.content.hierarchy());
    }

    fn hierarchy_mut(&mut self) -> Option<&mut Vec<HierarchyEntry>> {
        match &mut self.content {
            ContainerData::Bank(bank) => bank.hierarchy_mut(),
            ContainerData::Package(_) => None,
        }
    }
}

/// Outcome of [`Session::render_previews`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    /// Rendered files per id.
    pub rendered: Vec<(AudioId, PathBuf)>,
    /// Ids that could not be rendered.
    pub failures: Vec<PreviewFailure>,
}

/// One id [`Session::render_previews`] could not render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewFailure {
    /// Audio id.
    pub id: AudioId,
    /// Error message.
    pub reason: String,
    /// Stable error code.
    pub code: String,
}

#[derive(Debug, Clone)]
struct CachedPreview {
    label: ContainerLabel,
    id: AudioId,
    path: PathBuf,
}

/// Editing session over any number of containers.
pub struct Session<C: ContainerCodec, T: Transcoder> {
    config: KernelConfig,
    codec: Arc<C>,
    transcoder: T,
    containers: Vec<OpenedContainer>,
    registry: SourceRegistry<C>,
    exporter: ExportCoordinator<C>,
    projection: Projection,
    previews: Mutex<LruCache<NodeKey, CachedPreview>>,
    loudness: LoudnessCache,
    events: broadcast::Sender<SessionEvent>,
}

impl<C: ContainerCodec + 'static> Session<C, CliTranscoder> {
    /// Create a session transcoding through the configured external tools.
    pub fn with_cli_tools(config: KernelConfig, codec: Arc<C>) -> Result<Self> {
        let transcoder = CliTranscoder::new(
            config.tools.clone(),
            config.native_extension.clone(),
            config.temp_dir.join("transcode"),
        );
        Self::new(config, codec, transcoder)
    }
}

impl<C, T> Session<C, T>
where
    C: ContainerCodec + 'static,
    T: Transcoder,
{
    /// Create an empty session.
    pub fn new(config: KernelConfig, codec: Arc<C>, transcoder: T) -> Result<Self> {
        config.validate()?;

        let registry = SourceRegistry::new(Arc::clone(&codec), &config.temp_dir, &config.native_extension);
        let exporter = ExportCoordinator::new(Arc::clone(&codec), &config.temp_dir, &config.native_extension);
        let capacity = NonZeroUsize::new(config.preview_cache_entries).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(temp_dir = %config.temp_dir.display(), "Session created");

        Ok(Self {
            config,
            codec,
            transcoder,
            containers: Vec::new(),
            registry,
            exporter,
            projection: Projection::default(),
            previews: Mutex::new(LruCache::new(capacity)),
            loudness: LoudnessCache::new(),
            events,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Shared source registry.
    pub fn registry(&self) -> &SourceRegistry<C> {
        &self.registry
    }

    /// Current projection.
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Projected node by key.
    pub fn node(&self, key: &NodeKey) -> Option<&ProjectedNode> {
        self.projection.node(key)
    }

    /// Opened containers, in open order.
    pub fn containers(&self) -> &[OpenedContainer] {
        &self.containers
    }

    /// Opened container by label.
    pub fn container(&self, label: &ContainerLabel) -> Option<&OpenedContainer> {
        self.containers.iter().find(|c| &c.label == label)
    }

    /// Receive change events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // ==================== Containers ====================

    /// Open one container. Returns `None` if the path is already open.
    pub async fn open(&mut self, path: &Path) -> Result<Option<ContainerLabel>> {
        Ok(self.open_files(&[path.to_path_buf()]).await?.into_iter().next())
    }

    /// Open several containers, all or nothing.
    ///
    /// Paths already open (or repeated in `paths`) are skipped. If any file
    /// fails to open, nothing is committed.
    pub async fn open_files(&mut self, paths: &[PathBuf]) -> Result<Vec<ContainerLabel>> {
        let mut loaded: Vec<OpenedContainer> = Vec::new();

        for path in paths {
            let duplicate = self.containers.iter().any(|c| &c.path == path)
                || loaded.iter().any(|c| &c.path == path);
            if duplicate {
                info!(path = %path.display(), "Container already open");
                continue;
            }
            loaded.push(self.load_container(path).await?);
        }

        let mut labels = Vec::with_capacity(loaded.len());
        for container in loaded {
            // Stale extraction output from an earlier session
            self.registry.forget_container(&container.label).await;

            let origin = container.origin();
            for id in container.reachable_sources() {
                self.registry.register(id, origin.clone());
            }

            info!(
                label = %container.label,
                path = %container.path.display(),
                kind = %container.content.kind(),
                segments = container.graph.segments.len(),
                "Container opened"
            );
            self.emit(SessionEvent::ContainerOpened {
                label: container.label.clone(),
                name: container.name.clone(),
                kind: container.content.kind(),
            });
            labels.push(container.label.clone());
            self.containers.push(container);
        }

        if !labels.is_empty() {
            self.rebuild_projection();
        }
        Ok(labels)
    }

    async fn load_container(&self, path: &Path) -> Result<OpenedContainer> {
        let kind = sniff_container(path).await?;
        let filter = match kind {
            ContainerKind::Bank => Some(SectionKind::editing_set()),
            ContainerKind::Package => None,
        };
        let content = self
            .codec
            .load(path, filter)
            .await
            .map_err(|e| KernelError::from_codec("load", e))?;

        if content.kind() != kind {
            return Err(KernelError::UnsupportedContainer {
                path: path.to_path_buf(),
                reason: format!("signature says {kind}, codec decoded {}", content.kind()),
            });
        }
        if let Some((entry_kind, id)) = find_duplicate_id(content.hierarchy()) {
            return Err(KernelError::UnsupportedContainer {
                path: path.to_path_buf(),
                reason: format!("duplicate hierarchy id {id} ({entry_kind})"),
            });
        }

        let label = ContainerLabel::from_path(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.to_string());
        let policy = match &content {
            ContainerData::Bank(_) => OverridePolicy::AllowNew,
            ContainerData::Package(package) => {
                OverridePolicy::ExistingOnly(package.entry_ids().into_iter().collect())
            }
        };
        let overrides = OverrideStore::new(
            label.clone(),
            name.clone(),
            policy,
            self.config.native_extension.clone(),
            self.config.temp_dir.join("overrides"),
        );
        let graph = GraphBuilder::new(&label).build(content.hierarchy());

        Ok(OpenedContainer {
            path: path.to_path_buf(),
            name,
            label,
            content,
            overrides,
            graph,
            edited: BTreeSet::new(),
        })
    }

    /// Close a container and release everything derived from it.
    pub async fn close(&mut self, label: &ContainerLabel) -> Result<()> {
        let position = self
            .containers
            .iter()
            .position(|c| &c.label == label)
            .ok_or_else(|| KernelError::ContainerNotOpen(label.clone()))?;
        let mut container = self.containers.remove(position);

        self.invalidate_previews(label, None);
        for entry in container.overrides.entries() {
            discard_rendered(&entry.path, &self.config.preview_extension, &self.loudness).await;
        }
        container.overrides.release_all().await;
        self.loudness.evict_under(&self.registry.container_dir(label));
        self.registry.unregister_container(&container.path);
        self.registry.forget_container(label).await;

        let staging = self.exporter.staging_dir(label);
        if exists(&staging).await {
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!(label = %label, error = %e, "Failed to remove export staging dir");
            }
        }

        info!(label = %label, path = %container.path.display(), "Container closed");
        self.emit(SessionEvent::ContainerClosed { label: label.clone() });
        self.rebuild_projection();
        Ok(())
    }

    // ==================== Overrides ====================

    /// Stage `file` as the replacement for `id` in a container.
    pub async fn add_override(&mut self, label: &ContainerLabel, id: AudioId, file: &Path) -> Result<OverrideEntry> {
        let container = find_mut(&mut self.containers, label)?;
        let previous = container.overrides.get(id).map(|entry| entry.path.clone());
        let entry = container
            .overrides
            .add_override(id, file, &self.transcoder)
            .await?
            .clone();
        if let Some(previous) = previous {
            discard_rendered(&previous, &self.config.preview_extension, &self.loudness).await;
        }

        if container.is_pure_addition(id) {
            self.registry.register(id, container.origin());
        }

        self.invalidate_previews(label, Some(id));
        self.emit(SessionEvent::OverrideAdded {
            label: label.clone(),
            id,
        });
        self.rebuild_projection();
        Ok(entry)
    }

    /// Drop the override for `id` in a container.
    ///
    /// Returns `None` if there was none.
    pub async fn remove_override(&mut self, label: &ContainerLabel, id: AudioId) -> Result<Option<OverrideEntry>> {
        let container = find_mut(&mut self.containers, label)?;
        let Some(removed) = container.overrides.remove_override(id).await else {
            return Ok(None);
        };
        discard_rendered(&removed.path, &self.config.preview_extension, &self.loudness).await;
        if container.is_pure_addition(id) {
            self.registry.unregister(id, &container.path);
        }

        self.invalidate_previews(label, Some(id));
        self.emit(SessionEvent::OverrideRemoved {
            label: label.clone(),
            id,
        });
        self.rebuild_projection();
        Ok(Some(removed))
    }

    /// Replace the audio played by a source node.
    pub async fn import_audio(&mut self, key: &NodeKey, file: &Path) -> Result<OverrideEntry> {
        let node = self
            .projection
            .node(key)
            .ok_or_else(|| KernelError::NodeNotFound(key.clone()))?;
        let id = node.audio_id().ok_or_else(|| KernelError::InvalidNode {
            key: key.clone(),
            reason: "audio import only supports source nodes".to_string(),
        })?;
        let label = node.label.clone();

        self.check_import_format(file)?;
        let entry = self.add_override(&label, id, file).await?;
        info!(node = %key, id = %id, "Audio imported");
        Ok(entry)
    }

    /// Add a brand-new audio id to a bank.
    pub async fn add_audio(&mut self, label: &ContainerLabel, id: AudioId, file: &Path) -> Result<OverrideEntry> {
        let container = self
            .container(label)
            .ok_or_else(|| KernelError::ContainerNotOpen(label.clone()))?;
        if container.content.kind() != ContainerKind::Bank {
            return Err(KernelError::UnsupportedContainer {
                path: container.path.clone(),
                reason: "audio can only be added to banks".to_string(),
            });
        }

        self.check_import_format(file)?;
        self.add_override(label, id, file).await
    }

    fn check_import_format(&self, file: &Path) -> Result<()> {
        if self.config.accepts_import(file) {
            return Ok(());
        }
        Err(KernelError::UnsupportedAudioFormat(
            extension_of(file).unwrap_or_else(|| "<no extension>".to_string()),
        ))
    }

    // ==================== Node edits ====================

    /// Set the timing of a playlist item node.
    pub fn edit_playlist_item(&mut self, key: &NodeKey, timing: PlaylistTiming) -> Result<()> {
        let node = self
            .projection
            .node(key)
            .ok_or_else(|| KernelError::NodeNotFound(key.clone()))?;
        let NodeRole::PlaylistItem { track_id, slot, .. } = node.role else {
            return Err(KernelError::InvalidNode {
                key: key.clone(),
                reason: "not a playlist item".to_string(),
            });
        };
        let label = node.label.clone();

        let container = find_mut(&mut self.containers, &label)?;
        let target = container.hierarchy_mut().and_then(|entries| {
            entries.iter_mut().find_map(|entry| match entry {
                HierarchyEntry::MusicTrack(track) if track.id == track_id => track.playlist.get_mut(slot),
                _ => None,
            })
        });
        let Some(target) = target else {
            return Err(KernelError::InvalidNode {
                key: key.clone(),
                reason: format!("track {track_id} has no slot {slot}"),
            });
        };

        target.play_at = timing.play_at;
        target.begin_trim_offset = timing.begin_trim_offset;
        target.end_trim_offset = timing.end_trim_offset;
        target.src_duration = timing.src_duration;

        self.finish_edit(&label, key);
        Ok(())
    }

    /// Set the duration and fades of a segment node.
    pub fn edit_segment(&mut self, key: &NodeKey, timing: SegmentTiming) -> Result<()> {
        let node = self
            .projection
            .node(key)
            .ok_or_else(|| KernelError::NodeNotFound(key.clone()))?;
        let NodeRole::Segment { id, .. } = node.role else {
            return Err(KernelError::InvalidNode {
                key: key.clone(),
                reason: "not a segment".to_string(),
            });
        };
        let label = node.label.clone();

        let container = find_mut(&mut self.containers, &label)?;
        let segment = container.hierarchy_mut().and_then(|entries| {
            entries.iter_mut().find_map(|entry| match entry {
                HierarchyEntry::MusicSegment(segment) if segment.id == id => Some(segment),
                _ => None,
            })
        });
        let Some(segment) = segment else {
            return Err(KernelError::InvalidNode {
                key: key.clone(),
                reason: format!("segment {id} not in hierarchy"),
            });
        };

        segment.duration = timing.duration;
        set_marker(&mut segment.markers, FADE_IN_END_MARKER, timing.fade_in_end);
        set_marker(&mut segment.markers, FADE_OUT_START_MARKER, timing.fade_out_start);

        self.finish_edit(&label, key);
        Ok(())
    }

    fn finish_edit(&mut self, label: &ContainerLabel, key: &NodeKey) {
        if let Some(container) = self.containers.iter_mut().find(|c| &c.label == label) {
            container.edited.insert(key.clone());
            container.rebuild_graph();
        }
        debug!(node = %key, "Node edited");
        self.emit(SessionEvent::NodeEdited { key: key.clone() });
        self.rebuild_projection();
    }

    // ==================== Previews ====================

    /// Render a source node to the preview format.
    ///
    /// Overridden ids render their staged replacement, others their
    /// materialized original. A rendered file next to the input is reused.
    pub async fn preview(&self, key: &NodeKey) -> Result<PathBuf> {
        let cached = self.previews.lock().get(key).cloned();
        if let Some(cached) = cached {
            if exists(&cached.path).await {
                return Ok(cached.path);
            }
        }

        let node = self
            .projection
            .node(key)
            .ok_or_else(|| KernelError::NodeNotFound(key.clone()))?;
        let id = node.audio_id().ok_or_else(|| KernelError::InvalidNode {
            key: key.clone(),
            reason: "only source nodes can be previewed".to_string(),
        })?;
        let container = self
            .container(&node.label)
            .ok_or_else(|| KernelError::ContainerNotOpen(node.label.clone()))?;

        let input = match container.overrides.get(id) {
            Some(entry) => entry.path.clone(),
            None => self.registry.materialize(id).await?,
        };
        let rendered = self.render(&input).await?;

        self.previews.lock().put(
            key.clone(),
            CachedPreview {
                label: node.label.clone(),
                id,
                path: rendered.clone(),
            },
        );
        Ok(rendered)
    }

    async fn render(&self, input: &Path) -> Result<PathBuf> {
        let target = input.with_extension(&self.config.preview_extension);
        if exists(&target).await {
            return Ok(target);
        }

        let output = self
            .transcoder
            .transcode(input, &self.config.preview_extension)
            .await
            .map_err(|e| KernelError::from_transcoder(input, e))?;
        tokio::fs::rename(&output, &target)
            .await
            .map_err(|e| KernelError::staging(&output, e))?;
        Ok(target)
    }

    /// Render previews for many ids of one container.
    ///
    /// Failures are logged and reported per id.
    pub async fn render_previews(&self, label: &ContainerLabel, ids: &[AudioId]) -> Result<PreviewReport> {
        if self.container(label).is_none() {
            return Err(KernelError::ContainerNotOpen(label.clone()));
        }

        let mut report = PreviewReport::default();
        for &id in ids {
            let key = self
                .projection
                .nodes_for_audio(label, id)
                .first()
                .map(|node| node.key.clone())
                .unwrap_or_else(|| NodeKey::source(label, id));

            match self.preview(&key).await {
                Ok(path) => report.rendered.push((id, path)),
                Err(e) => {
                    warn!(label = %label, id = %id, error = %e, "Failed to render preview");
                    report.failures.push(PreviewFailure {
                        id,
                        reason: e.to_string(),
                        code: e.error_code().to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Peak level and integrated loudness of a source node's preview.
    ///
    /// Measurements are cached per rendered file.
    pub async fn loudness(&self, key: &NodeKey) -> Result<LoudnessInfo> {
        let rendered = self.preview(key).await?;
        if let Some(info) = self.loudness.get(&rendered) {
            return Ok(info);
        }

        let path = rendered.clone();
        let info = tokio::task::spawn_blocking(move || measure(&path))
            .await
            .map_err(|e| KernelError::loudness(&rendered, e))?
            .map_err(|e| KernelError::loudness(&rendered, e))?;
        self.loudness.insert(rendered, info);
        Ok(info)
    }

    /// Loudness measurements taken so far.
    pub fn loudness_cache(&self) -> &LoudnessCache {
        &self.loudness
    }

    fn invalidate_previews(&self, label: &ContainerLabel, id: Option<AudioId>) {
        let mut previews = self.previews.lock();
        let stale: Vec<NodeKey> = previews
            .iter()
            .filter(|(_, cached)| &cached.label == label && id.map_or(true, |id| cached.id == id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            previews.pop(&key);
        }
    }

    // ==================== Export ====================

    /// Export one container to `destination`.
    pub async fn export_one(&self, label: &ContainerLabel, destination: &Path) -> Result<ExportRecord> {
        let container = self
            .container(label)
            .ok_or_else(|| KernelError::ContainerNotOpen(label.clone()))?;
        self.exporter
            .export_one(&container.export_target(), destination)
            .await
    }

    /// Export every overridden or edited container into `destination_dir`.
    pub async fn export_batch(&self, destination_dir: &Path) -> Result<BatchReport> {
        let targets: Vec<ExportTarget<'_>> = self.containers.iter().map(OpenedContainer::export_target).collect();
        let events = self.events.clone();

        let result = self
            .exporter
            .export_batch(&targets, destination_dir, move |progress| {
                let _ = events.send(SessionEvent::ExportProgress(progress.clone()));
            })
            .await;

        let counts = match &result {
            Ok(report) => Some((report.succeeded, report.failed)),
            Err(KernelError::ExportAllFailed { report }) => Some((report.succeeded, report.failed)),
            Err(_) => None,
        };
        if let Some((succeeded, failed)) = counts {
            self.emit(SessionEvent::ExportFinished { succeeded, failed });
        }
        result
    }

    fn rebuild_projection(&mut self) {
        let views: Vec<ContainerView<'_>> = self.containers.iter().map(OpenedContainer::view).collect();
        let registry = &self.registry;
        let projection = Projection::build(&views, |id| registry.resolve(id));
        self.projection = projection;
    }
}

fn find_mut<'a>(containers: &'a mut [OpenedContainer], label: &ContainerLabel) -> Result<&'a mut OpenedContainer> {
    containers
        .iter_mut()
        .find(|c| &c.label == label)
        .ok_or_else(|| KernelError::ContainerNotOpen(label.clone()))
}

/// Delete the preview rendered next to a staged override, if any.
async fn discard_rendered(staged: &Path, preview_extension: &str, loudness: &LoudnessCache) {
    let rendered = staged.with_extension(preview_extension);
    loudness.evict(&rendered);
    if !exists(&rendered).await {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(&rendered).await {
        warn!(path = %rendered.display(), error = %e, "Failed to remove rendered preview");
    }
}

/// Identify a container by its 4-byte signature.
async fn sniff_container(path: &Path) -> Result<ContainerKind> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| KernelError::staging(path, e))?;
    let mut head = [0u8; 4];
    match file.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(KernelError::UnsupportedContainer {
                path: path.to_path_buf(),
                reason: "file too short".to_string(),
            })
        }
        Err(e) => return Err(KernelError::staging(path, e)),
    }

    ContainerKind::sniff(&head).ok_or_else(|| KernelError::UnsupportedContainer {
        path: path.to_path_buf(),
        reason: format!("unknown signature {}", hex::encode(head)),
    })
}

/// Update a marker position, adding the marker if it is missing and the
/// position is non-zero.
fn set_marker(markers: &mut Vec<Marker>, id: u32, position: f64) {
    match markers.iter_mut().find(|m| m.id == id) {
        Some(marker) => marker.position = position,
        None if position != 0.0 => markers.push(Marker {
            id,
            position,
            name: String::new(),
        }),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InMemoryCodec;
    use crate::loudness::tests::write_sine;
    use crate::transcode::StubTranscoder;
    use crate::types::{MusicSegment, MusicTrack, TrackSlot, TrackType};

    fn id(raw: u32) -> AudioId {
        AudioId::new(raw).unwrap()
    }

    fn hierarchy() -> Vec<HierarchyEntry> {
        vec![
            HierarchyEntry::MusicTrack(MusicTrack {
                id: 20,
                track_type: TrackType::Normal,
                playlist: vec![TrackSlot {
                    source_id: 30,
                    src_duration: 1000.0,
                    ..TrackSlot::default()
                }],
            }),
            HierarchyEntry::MusicSegment(MusicSegment {
                id: 10,
                duration: 2000.0,
                markers: vec![],
                children: vec![20],
            }),
        ]
    }

    async fn session(dir: &Path) -> (Session<InMemoryCodec, StubTranscoder>, Arc<InMemoryCodec>) {
        let codec = Arc::new(InMemoryCodec::new());
        let config = KernelConfig::with_temp_dir(dir.join("temp"));
        let transcoder = StubTranscoder::new(dir.join("transcode"));
        let session = Session::new(config, Arc::clone(&codec), transcoder).unwrap();
        (session, codec)
    }

    async fn install_bank(codec: &InMemoryCodec, path: &Path) {
        let bank = InMemoryCodec::pack_bank(hierarchy(), &[(id(30), b"thirty".to_vec())], true);
        codec.install(path, ContainerData::Bank(bank), vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_skips_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let mut events = session.subscribe();

        let labels = session.open_files(&[path.clone(), path.clone()]).await.unwrap();
        assert_eq!(labels.len(), 1);
        assert!(session.open(&path).await.unwrap().is_none());
        assert_eq!(session.containers().len(), 1);

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::ContainerOpened { .. }));
        assert!(session.node(&NodeKey::segment(&labels[0], 10)).is_some());
        assert_eq!(session.registry().resolve(id(30)).unwrap().container, path);
    }

    #[tokio::test]
    async fn test_open_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let good = dir.path().join("music.bnk");
        install_bank(&codec, &good).await;
        let bad = dir.path().join("readme.txt");
        tokio::fs::write(&bad, b"hello world").await.unwrap();

        let err = session.open_files(&[good, bad]).await.unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_CONTAINER");
        assert!(session.containers().is_empty());
        assert!(session.registry().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_hierarchy_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("broken.bnk");
        let mut entries = hierarchy();
        entries.push(HierarchyEntry::MusicSegment(MusicSegment {
            id: 20,
            duration: 0.0,
            markers: vec![],
            children: vec![],
        }));
        let bank = InMemoryCodec::pack_bank(entries, &[], false);
        codec.install(&path, ContainerData::Bank(bank), vec![]).await.unwrap();

        let err = session.open(&path).await.unwrap_err();
        assert!(err.to_string().contains("duplicate hierarchy id 20"));
    }

    #[tokio::test]
    async fn test_edit_marks_dirty_and_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();

        let segment = NodeKey::segment(&label, 10);
        session
            .edit_segment(
                &segment,
                SegmentTiming {
                    duration: 3000.0,
                    fade_in_end: 250.0,
                    fade_out_start: 0.0,
                },
            )
            .unwrap();

        let node = session.node(&segment).unwrap();
        assert!(node.dirty);
        match &node.role {
            NodeRole::Segment { timing, .. } => {
                assert_eq!(timing.duration, 3000.0);
                assert_eq!(timing.fade_in_end, 250.0);
            }
            other => panic!("expected segment, got {other:?}"),
        }
        assert!(session.projection().container(&label).unwrap().dirty);

        let item = NodeKey::playlist_item(&label, 20, 0, 30);
        session
            .edit_playlist_item(
                &item,
                PlaylistTiming {
                    play_at: 100.0,
                    ..PlaylistTiming::default()
                },
            )
            .unwrap();
        match &session.node(&item).unwrap().role {
            NodeRole::PlaylistItem { timing, .. } => assert_eq!(timing.play_at, 100.0),
            other => panic!("expected playlist item, got {other:?}"),
        }

        // Wrong node kinds
        let err = session.edit_segment(&item, SegmentTiming::default()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_NODE");
        let err = session
            .edit_playlist_item(&NodeKey::new("nope"), PlaylistTiming::default())
            .unwrap_err();
        assert_eq!(err.error_code(), "NODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_import_audio_checks_node_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();

        let clip = dir.path().join("clip.ogg");
        tokio::fs::write(&clip, b"OggS").await.unwrap();
        let text = dir.path().join("notes.txt");
        tokio::fs::write(&text, b"hi").await.unwrap();

        let err = session
            .import_audio(&NodeKey::segment(&label, 10), &clip)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_NODE");

        let item = NodeKey::playlist_item(&label, 20, 0, 30);
        let err = session.import_audio(&item, &text).await.unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedAudioFormat(ext) if ext == "txt"));

        session.import_audio(&item, &clip).await.unwrap();
        assert!(session.node(&item).unwrap().dirty);
    }

    #[tokio::test]
    async fn test_add_audio_is_bank_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let pck = dir.path().join("sfx.pck");
        let (package, payload) = InMemoryCodec::pack_package(&[(id(5), b"five".to_vec())], true);
        codec.install(&pck, ContainerData::Package(package), payload).await.unwrap();
        let label = session.open(&pck).await.unwrap().unwrap();

        let clip = dir.path().join("clip.wem");
        tokio::fs::write(&clip, b"RIFF").await.unwrap();
        let err = session.add_audio(&label, id(99), &clip).await.unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_CONTAINER");

        // Packages reject ids outside their entry table
        let err = session.add_override(&label, id(99), &clip).await.unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_AUDIO_ID");
    }

    #[tokio::test]
    async fn test_preview_prefers_override_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();
        let item = NodeKey::playlist_item(&label, 20, 0, 30);

        let original = session.preview(&item).await.unwrap();
        assert_eq!(original.extension().unwrap(), "wav");
        assert_eq!(tokio::fs::read(&original).await.unwrap(), b"thirty");
        assert_eq!(session.preview(&item).await.unwrap(), original);

        let clip = dir.path().join("clip.wem");
        tokio::fs::write(&clip, b"replacement").await.unwrap();
        session.add_override(&label, id(30), &clip).await.unwrap();

        let replaced = session.preview(&item).await.unwrap();
        assert_ne!(replaced, original);
        assert_eq!(tokio::fs::read(&replaced).await.unwrap(), b"replacement");

        session.remove_override(&label, id(30)).await.unwrap().unwrap();
        assert!(!replaced.exists());
        assert_eq!(session.preview(&item).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_replacing_override_discards_its_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();
        let item = NodeKey::playlist_item(&label, 20, 0, 30);

        let first = dir.path().join("first.wem");
        tokio::fs::write(&first, b"first").await.unwrap();
        session.add_override(&label, id(30), &first).await.unwrap();
        let stale = session.preview(&item).await.unwrap();
        assert!(stale.exists());

        let second = dir.path().join("second.wem");
        tokio::fs::write(&second, b"second").await.unwrap();
        session.add_override(&label, id(30), &second).await.unwrap();
        assert!(!stale.exists());

        let fresh = session.preview(&item).await.unwrap();
        assert_eq!(tokio::fs::read(&fresh).await.unwrap(), b"second");

        session.close(&label).await.unwrap();
        assert!(!fresh.exists());
    }

    #[tokio::test]
    async fn test_loudness_follows_the_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();
        let item = NodeKey::playlist_item(&label, 20, 0, 30);

        // The stub transcoder copies bytes, so a wav staged as .wem previews as itself
        let loud = dir.path().join("loud.wem");
        write_sine(&loud, 2, 0.5, 1.0);
        session.add_override(&label, id(30), &loud).await.unwrap();

        let first = session.loudness(&item).await.unwrap();
        assert!((first.peak_db - -6.02).abs() < 0.1);
        assert_eq!(session.loudness_cache().len(), 1);
        assert_eq!(session.loudness(&item).await.unwrap(), first);

        let quiet = dir.path().join("quiet.wem");
        write_sine(&quiet, 2, 0.125, 1.0);
        session.add_override(&label, id(30), &quiet).await.unwrap();
        assert!(session.loudness_cache().is_empty());

        let second = session.loudness(&item).await.unwrap();
        assert!((second.peak_db - -18.06).abs() < 0.1);

        // Originals are not wav data
        session.remove_override(&label, id(30)).await.unwrap();
        let err = session.loudness(&item).await.unwrap_err();
        assert_eq!(err.error_code(), "LOUDNESS");
        assert!(session.loudness_cache().is_empty());
    }

    #[tokio::test]
    async fn test_render_previews_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();

        let report = session.render_previews(&label, &[id(30), id(404)]).await.unwrap();
        assert_eq!(report.rendered.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, id(404));
        assert_eq!(report.failures[0].code, "NODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, codec) = session(dir.path()).await;
        let path = dir.path().join("music.bnk");
        install_bank(&codec, &path).await;
        let label = session.open(&path).await.unwrap().unwrap();

        let clip = dir.path().join("clip.wem");
        tokio::fs::write(&clip, b"RIFF").await.unwrap();
        let staged = session.add_override(&label, id(99), &clip).await.unwrap().path;
        session.registry().materialize(id(30)).await.unwrap();
        let extracted = session.registry().container_dir(&label);
        assert!(extracted.exists());

        session.close(&label).await.unwrap();

        assert!(!staged.exists());
        assert!(!extracted.exists());
        assert!(session.registry().is_empty());
        assert!(session.projection().is_empty());
        assert!(matches!(
            session.close(&label).await,
            Err(KernelError::ContainerNotOpen(_))
        ));
    }

    #[test]
    fn test_set_marker() {
        let mut markers = Vec::new();
        set_marker(&mut markers, FADE_OUT_START_MARKER, 0.0);
        assert!(markers.is_empty());

        set_marker(&mut markers, FADE_OUT_START_MARKER, 900.0);
        set_marker(&mut markers, FADE_OUT_START_MARKER, 800.0);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].position, 800.0);
    }
}
