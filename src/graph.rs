//! Playback hierarchy construction.
//!
//! Turns the flat, cross-referencing hierarchy entry list of a bank into a
//! forest of segments with nested tracks and playlists.
//!
//! ## Algorithm
//!
//! 1. Visit every `MusicTrack` in entry order. Each playlist slot is
//!    classified by the first non-zero of `event_id`, `source_id`,
//!    `track_id`. All-zero slots are dropped. Track references resolve
//!    against the tracks built so far; unresolved ones are dropped.
//! 2. Visit every `MusicSegment` in entry order. Markers resolve into fade
//!    offsets and child track ids resolve against the pass-1 table; unresolved
//!    children are dropped.
//!
//! Dropped references are recorded as [`GraphWarning`]s and logged. Nothing
//! here fails and nothing mutates the input.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{
    AudioId, ContainerLabel, EntryKind, HierarchyEntry, IndexSection, MusicSegment, MusicTrack,
    NodeKey, PlaylistItem, PlaylistTarget, PlaylistTiming, SegmentNode, TrackNode, TrackSlot,
    FADE_IN_END_MARKER, FADE_OUT_START_MARKER,
};

/// A reference dropped while building the forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GraphWarning {
    /// Playlist slot with no non-zero reference.
    EmptySlot {
        /// Owning track.
        track_id: u32,
        /// Slot index.
        slot: usize,
    },
    /// Playlist slot referencing a track not built yet.
    UnresolvedTrack {
        /// Owning track.
        track_id: u32,
        /// Slot index.
        slot: usize,
        /// Missing track.
        referenced: u32,
    },
    /// Segment child that is not a known track.
    UnresolvedChild {
        /// Owning segment.
        segment_id: u32,
        /// Missing track.
        track_id: u32,
    },
    /// Random/sequence playlist leaf that is not a known segment.
    UnresolvedSegment {
        /// Owning container.
        container_id: u32,
        /// Missing segment.
        segment_id: u32,
    },
}

/// Output of [`GraphBuilder::build`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphBuild {
    /// Segments in entry order.
    pub segments: Vec<SegmentNode>,
    /// Every dropped reference.
    pub warnings: Vec<GraphWarning>,
}

impl GraphBuild {
    /// Find a segment by id.
    pub fn segment(&self, id: u32) -> Option<&SegmentNode> {
        self.segments.iter().find(|segment| segment.id == id)
    }

    /// Number of playlist items across the forest, nested tracks included.
    pub fn num_playlist_items(&self) -> usize {
        fn count(track: &TrackNode) -> usize {
            track
                .playlist
                .iter()
                .map(|item| match &item.target {
                    PlaylistTarget::Track(nested) => 1 + count(nested),
                    _ => 1,
                })
                .sum()
        }
        self.segments
            .iter()
            .flat_map(|segment| segment.children.iter())
            .map(count)
            .sum()
    }
}

/// Builds the segment forest for one container.
#[derive(Debug, Clone)]
pub struct GraphBuilder<'a> {
    label: &'a ContainerLabel,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder deriving node keys from `label`.
    pub fn new(label: &'a ContainerLabel) -> Self {
        Self { label }
    }

    /// Build the forest.
    pub fn build(&self, entries: &[HierarchyEntry]) -> GraphBuild {
        let mut warnings = Vec::new();
        let mut tracks: HashMap<u32, TrackNode> = HashMap::new();

        for entry in entries {
            if let HierarchyEntry::MusicTrack(track) = entry {
                let node = self.build_track(track, &tracks, &mut warnings);
                tracks.insert(track.id, node);
            }
        }

        let mut segments = Vec::new();
        for entry in entries {
            if let HierarchyEntry::MusicSegment(segment) = entry {
                segments.push(build_segment(segment, &tracks, &mut warnings));
            }
        }

        let known_segments: HashSet<u32> = segments.iter().map(|s| s.id).collect();
        for entry in entries {
            if let HierarchyEntry::MusicRandomSequence(container) = entry {
                let mut referenced = Vec::new();
                for item in &container.playlist {
                    item.segment_ids(&mut referenced);
                }
                for segment_id in referenced {
                    if !known_segments.contains(&segment_id) {
                        warn!(
                            label = %self.label,
                            container_id = container.id,
                            segment_id,
                            "Segment not found in music segments"
                        );
                        warnings.push(GraphWarning::UnresolvedSegment {
                            container_id: container.id,
                            segment_id,
                        });
                    }
                }
            }
        }

        GraphBuild { segments, warnings }
    }

    fn build_track(
        &self,
        track: &MusicTrack,
        built: &HashMap<u32, TrackNode>,
        warnings: &mut Vec<GraphWarning>,
    ) -> TrackNode {
        let mut playlist = Vec::with_capacity(track.playlist.len());

        for (slot, item) in track.playlist.iter().enumerate() {
            let target = if item.event_id != 0 {
                PlaylistTarget::Event(item.event_id)
            } else if let Some(source) = AudioId::new(item.source_id) {
                PlaylistTarget::Source(source)
            } else if item.track_id != 0 {
                match built.get(&item.track_id) {
                    Some(nested) => PlaylistTarget::Track(nested.clone()),
                    None => {
                        warn!(
                            label = %self.label,
                            track_id = track.id,
                            slot,
                            referenced = item.track_id,
                            "Track not found in music tracks"
                        );
                        warnings.push(GraphWarning::UnresolvedTrack {
                            track_id: track.id,
                            slot,
                            referenced: item.track_id,
                        });
                        continue;
                    }
                }
            } else {
                warn!(label = %self.label, track_id = track.id, slot, "Invalid playlist slot");
                warnings.push(GraphWarning::EmptySlot {
                    track_id: track.id,
                    slot,
                });
                continue;
            };

            playlist.push(PlaylistItem {
                key: NodeKey::playlist_item(self.label, track.id, slot, target.referenced_id()),
                slot,
                target,
                timing: timing_of(item),
            });
        }

        TrackNode {
            id: track.id,
            playlist,
        }
    }
}

fn build_segment(
    segment: &MusicSegment,
    tracks: &HashMap<u32, TrackNode>,
    warnings: &mut Vec<GraphWarning>,
) -> SegmentNode {
    let mut fade_in_end = 0.0;
    let mut fade_out_start = 0.0;
    for marker in &segment.markers {
        match marker.id {
            FADE_IN_END_MARKER => fade_in_end = marker.position,
            FADE_OUT_START_MARKER => fade_out_start = marker.position,
            _ => {}
        }
    }

    let mut children = Vec::with_capacity(segment.children.len());
    for &child in &segment.children {
        match tracks.get(&child) {
            Some(track) => children.push(track.clone()),
            None => {
                warn!(segment_id = segment.id, track_id = child, "Track not found in music tracks");
                warnings.push(GraphWarning::UnresolvedChild {
                    segment_id: segment.id,
                    track_id: child,
                });
            }
        }
    }

    SegmentNode {
        id: segment.id,
        duration: segment.duration,
        fade_in_end,
        fade_out_start,
        children,
    }
}

fn timing_of(slot: &TrackSlot) -> PlaylistTiming {
    PlaylistTiming {
        play_at: slot.play_at,
        begin_trim_offset: slot.begin_trim_offset,
        end_trim_offset: slot.end_trim_offset,
        src_duration: slot.src_duration,
    }
}

/// Sorted unique source ids referenced by any track playlist.
pub fn managed_sources(entries: &[HierarchyEntry]) -> Vec<AudioId> {
    let sources: BTreeSet<AudioId> = entries
        .iter()
        .filter_map(|entry| match entry {
            HierarchyEntry::MusicTrack(track) => Some(track),
            _ => None,
        })
        .flat_map(|track| track.playlist.iter())
        .filter_map(|slot| AudioId::new(slot.source_id))
        .collect();
    sources.into_iter().collect()
}

/// Index entries not referenced by the hierarchy, in index order.
pub fn unmanaged_sources(index: Option<&IndexSection>, managed: &[AudioId]) -> Vec<AudioId> {
    let Some(index) = index else {
        return Vec::new();
    };
    index
        .entries
        .iter()
        .filter_map(|entry| AudioId::new(entry.id))
        .filter(|id| managed.binary_search(id).is_err())
        .collect()
}

/// Find the first entry whose id was already used by an earlier entry.
pub fn find_duplicate_id(entries: &[HierarchyEntry]) -> Option<(EntryKind, u32)> {
    let mut seen = HashSet::with_capacity(entries.len());
    entries
        .iter()
        .find(|entry| !seen.insert(entry.id()))
        .map(|entry| (entry.kind(), entry.id()))
}
