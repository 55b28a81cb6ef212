//! Navigable playback hierarchy built from a bank's hierarchy section.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AudioId, ContainerLabel};

/// Marker id whose position is the end of the fade-in.
pub const FADE_IN_END_MARKER: u32 = 43573010;

/// Marker id whose position is the start of the fade-out.
pub const FADE_OUT_START_MARKER: u32 = 1539036744;

/// Identifier of a node in the projected tree.
///
/// Keys are derived from the container label and the ids along the path, so
/// they are stable across rebuilds and unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Key of a segment node.
    pub fn segment(label: &ContainerLabel, id: u32) -> Self {
        Self(format!("{label}-seg-{id}"))
    }

    /// Key of a top-level track node.
    pub fn track(label: &ContainerLabel, id: u32) -> Self {
        Self(format!("{label}-trk-{id}"))
    }

    /// Key of a flat audio source node.
    pub fn source(label: &ContainerLabel, id: AudioId) -> Self {
        Self(format!("{label}-{id}"))
    }

    /// Key of a playlist item: `(label, track id, index, referenced id)`.
    pub fn playlist_item(label: &ContainerLabel, track_id: u32, index: usize, target: u32) -> Self {
        Self(format!("{label}-{track_id}-{index}-{target}"))
    }

    /// Wrap a raw key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Segment with resolved fades and child tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentNode {
    /// Segment id.
    pub id: u32,
    /// Duration in milliseconds.
    pub duration: f64,
    /// Position of the fade-in-end marker, `0.0` when absent.
    pub fade_in_end: f64,
    /// Position of the fade-out-start marker, `0.0` when absent.
    pub fade_out_start: f64,
    /// Resolved child tracks, in declaration order.
    pub children: Vec<TrackNode>,
}

/// Track with its resolved playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackNode {
    /// Track id.
    pub id: u32,
    /// Playlist items, in slot order minus dropped slots.
    pub playlist: Vec<PlaylistItem>,
}

/// What a playlist item plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target")]
pub enum PlaylistTarget {
    /// Nested track, resolved at build time.
    Track(TrackNode),
    /// Audio entry.
    Source(AudioId),
    /// Event reference, not followed.
    Event(u32),
}

impl PlaylistTarget {
    /// Raw id of the referenced object.
    pub fn referenced_id(&self) -> u32 {
        match self {
            Self::Track(track) => track.id,
            Self::Source(id) => id.get(),
            Self::Event(id) => *id,
        }
    }
}

/// Timing of a playlist item, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaylistTiming {
    /// Playback offset.
    pub play_at: f64,
    /// Trim at the start.
    pub begin_trim_offset: f64,
    /// Trim at the end.
    pub end_trim_offset: f64,
    /// Duration of the source.
    pub src_duration: f64,
}

/// One resolved playlist slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// Derived key, unique within the container.
    pub key: NodeKey,
    /// Slot index within the owning track's playlist.
    pub slot: usize,
    /// Referenced object.
    pub target: PlaylistTarget,
    /// Timing.
    pub timing: PlaylistTiming,
}

impl PlaylistItem {
    /// Audio id when this item plays a source.
    pub fn source_id(&self) -> Option<AudioId> {
        match self.target {
            PlaylistTarget::Source(id) => Some(id),
            _ => None,
        }
    }
}

/// Timing of a segment, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentTiming {
    /// Segment duration.
    pub duration: f64,
    /// Fade-in end.
    pub fade_in_end: f64,
    /// Fade-out start.
    pub fade_out_start: f64,
}
