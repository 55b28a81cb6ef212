//! Flattened, UI-consumable view of every opened container.
//!
//! A [`Projection`] is a pure function of the graph, override and edit state
//! of each container plus the registry's current winners. It is rebuilt
//! after every mutation, so dirty flags are never stored anywhere else.
//!
//! Per container the roots are its segments followed by flat source nodes:
//! unmanaged index entries and pure additions for banks, the entry table for
//! packages.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::{managed_sources, unmanaged_sources, GraphBuild};
use crate::overrides::OverrideStore;
use crate::registry::AudioOrigin;
use crate::types::{
    AudioId, ContainerData, ContainerKind, ContainerLabel, NodeKey, PlaylistItem, PlaylistTarget,
    PlaylistTiming, SegmentNode, SegmentTiming, TrackNode,
};

/// What a projected node stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeRole {
    /// Music segment.
    Segment {
        /// Segment id.
        id: u32,
        /// Current timing.
        timing: SegmentTiming,
    },
    /// Track directly under a segment.
    Track {
        /// Track id.
        id: u32,
    },
    /// Playlist slot of a track.
    PlaylistItem {
        /// Owning track.
        track_id: u32,
        /// Raw slot index in the owning track.
        slot: usize,
        /// Played object.
        target: ItemTarget,
        /// Current timing.
        timing: PlaylistTiming,
    },
    /// Audio entry outside the hierarchy.
    Source {
        /// Audio id.
        id: AudioId,
    },
}

/// Reference carried by a projected playlist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ItemTarget {
    /// Nested track.
    Track(u32),
    /// Audio entry.
    Source(AudioId),
    /// Event reference.
    Event(u32),
}

/// One node of the flattened tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedNode {
    /// Node key.
    pub key: NodeKey,
    /// Owning container.
    pub label: ContainerLabel,
    /// Parent node, `None` for container roots.
    pub parent: Option<NodeKey>,
    /// Children in display order.
    pub children: Vec<NodeKey>,
    /// Node role.
    pub role: NodeRole,
    /// Overridden or edited.
    pub dirty: bool,
    /// Winning origin of the node's audio, for audio-bearing nodes.
    pub origin: Option<AudioOrigin>,
}

impl ProjectedNode {
    /// Audio id played by this node, if any.
    pub fn audio_id(&self) -> Option<AudioId> {
        match &self.role {
            NodeRole::Source { id } => Some(*id),
            NodeRole::PlaylistItem {
                target: ItemTarget::Source(id),
                ..
            } => Some(*id),
            _ => None,
        }
    }
}

/// Per-container summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedContainer {
    /// Container label.
    pub label: ContainerLabel,
    /// File name.
    pub name: String,
    /// Source file.
    pub path: PathBuf,
    /// Container family.
    pub kind: ContainerKind,
    /// Top-level nodes.
    pub roots: Vec<NodeKey>,
    /// Number of overrides.
    pub overrides: usize,
    /// Whether the next batch export includes this container.
    pub dirty: bool,
}

/// Borrowed state of one container, input to [`Projection::build`].
#[derive(Debug, Clone, Copy)]
pub struct ContainerView<'a> {
    /// Container label.
    pub label: &'a ContainerLabel,
    /// File name.
    pub name: &'a str,
    /// Source file.
    pub path: &'a std::path::Path,
    /// Decoded contents.
    pub content: &'a ContainerData,
    /// Built forest (empty for packages).
    pub graph: &'a GraphBuild,
    /// Staged overrides.
    pub overrides: &'a OverrideStore,
    /// Edited node keys.
    pub edited: &'a BTreeSet<NodeKey>,
}

/// Flattened node map of every opened container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    containers: Vec<ProjectedContainer>,
    nodes: HashMap<NodeKey, ProjectedNode>,
}

impl Projection {
    /// Project `views`, asking `resolve` for the winning origin of each
    /// audio id.
    pub fn build<F>(views: &[ContainerView<'_>], resolve: F) -> Self
    where
        F: Fn(AudioId) -> Option<AudioOrigin>,
    {
        let mut projection = Self::default();
        for view in views {
            let mut builder = ContainerProjector {
                view,
                resolve: &resolve,
                nodes: &mut projection.nodes,
            };
            let roots = builder.project();
            let dirty = !view.overrides.is_empty() || !view.edited.is_empty();
            projection.containers.push(ProjectedContainer {
                label: view.label.clone(),
                name: view.name.to_string(),
                path: view.path.to_path_buf(),
                kind: view.content.kind(),
                roots,
                overrides: view.overrides.len(),
                dirty,
            });
        }
        projection
    }

    /// Node by key.
    pub fn node(&self, key: &NodeKey) -> Option<&ProjectedNode> {
        self.nodes.get(key)
    }

    /// Container summary by label.
    pub fn container(&self, label: &ContainerLabel) -> Option<&ProjectedContainer> {
        self.containers.iter().find(|c| &c.label == label)
    }

    /// Containers in open order.
    pub fn containers(&self) -> &[ProjectedContainer] {
        &self.containers
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing is projected.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys of every dirty node, sorted.
    pub fn dirty_nodes(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self
            .nodes
            .values()
            .filter(|node| node.dirty)
            .map(|node| node.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Every node of `label` playing `id`.
    pub fn nodes_for_audio(&self, label: &ContainerLabel, id: AudioId) -> Vec<&ProjectedNode> {
        self.nodes
            .values()
            .filter(|node| &node.label == label && node.audio_id() == Some(id))
            .collect()
    }
}

struct ContainerProjector<'v, 'n, F> {
    view: &'v ContainerView<'v>,
    resolve: &'v F,
    nodes: &'n mut HashMap<NodeKey, ProjectedNode>,
}

impl<F> ContainerProjector<'_, '_, F>
where
    F: Fn(AudioId) -> Option<AudioOrigin>,
{
    fn project(&mut self) -> Vec<NodeKey> {
        let view = self.view;
        let mut roots = Vec::new();
        for segment in &view.graph.segments {
            roots.push(self.segment(segment));
        }
        for id in self.flat_sources() {
            let key = NodeKey::source(self.view.label, id);
            self.insert(key.clone(), None, Vec::new(), NodeRole::Source { id });
            roots.push(key);
        }
        roots
    }

    fn flat_sources(&self) -> Vec<AudioId> {
        match self.view.content {
            ContainerData::Bank(bank) => {
                let managed = managed_sources(bank.hierarchy());
                let mut flat = unmanaged_sources(bank.index(), &managed);
                let listed: BTreeSet<AudioId> = flat.iter().copied().collect();
                // Pure additions
                flat.extend(
                    self.view
                        .overrides
                        .ids()
                        .into_iter()
                        .filter(|id| managed.binary_search(id).is_err() && !listed.contains(id)),
                );
                flat
            }
            ContainerData::Package(package) => package.entry_ids(),
        }
    }

    fn segment(&mut self, segment: &SegmentNode) -> NodeKey {
        let key = NodeKey::segment(self.view.label, segment.id);
        let children = segment
            .children
            .iter()
            .map(|track| self.track(track, &key))
            .collect();
        self.insert(
            key.clone(),
            None,
            children,
            NodeRole::Segment {
                id: segment.id,
                timing: SegmentTiming {
                    duration: segment.duration,
                    fade_in_end: segment.fade_in_end,
                    fade_out_start: segment.fade_out_start,
                },
            },
        );
        key
    }

    fn track(&mut self, track: &TrackNode, parent: &NodeKey) -> NodeKey {
        let key = NodeKey::track(self.view.label, track.id);
        let children = self.playlist(track, &key);
        self.insert(key.clone(), Some(parent.clone()), children, NodeRole::Track { id: track.id });
        key
    }

    fn playlist(&mut self, track: &TrackNode, parent: &NodeKey) -> Vec<NodeKey> {
        track
            .playlist
            .iter()
            .map(|item| self.item(track.id, item, parent))
            .collect()
    }

    fn item(&mut self, track_id: u32, item: &PlaylistItem, parent: &NodeKey) -> NodeKey {
        let (target, children) = match &item.target {
            PlaylistTarget::Track(nested) => (ItemTarget::Track(nested.id), self.playlist(nested, &item.key)),
            PlaylistTarget::Source(id) => (ItemTarget::Source(*id), Vec::new()),
            PlaylistTarget::Event(id) => (ItemTarget::Event(*id), Vec::new()),
        };
        self.insert(
            item.key.clone(),
            Some(parent.clone()),
            children,
            NodeRole::PlaylistItem {
                track_id,
                slot: item.slot,
                target,
                timing: item.timing,
            },
        );
        item.key.clone()
    }

    /// First insertion wins; a track shared by several segments keeps its
    /// first parent.
    fn insert(&mut self, key: NodeKey, parent: Option<NodeKey>, children: Vec<NodeKey>, role: NodeRole) {
        if self.nodes.contains_key(&key) {
            return;
        }
        let mut node = ProjectedNode {
            key: key.clone(),
            label: self.view.label.clone(),
            parent,
            children,
            role,
            dirty: false,
            origin: None,
        };
        let edited = self.view.edited.contains(&key);
        node.dirty = match node.audio_id() {
            Some(id) => {
                node.origin = (self.resolve)(id);
                self.view.overrides.is_dirty(id) || edited
            }
            None => edited,
        };
        self.nodes.insert(key, node);
    }
}
