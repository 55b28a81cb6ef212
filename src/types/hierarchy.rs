//! Object-hierarchy entries of a bank.
//!
//! Only the music objects are decoded into typed records. Every other object
//! kind is carried through as an [`OpaqueEntry`] so a bank can be saved back
//! byte-for-byte.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One record of a bank's hierarchy section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry_type")]
pub enum HierarchyEntry {
    /// Music segment: groups tracks and carries timing markers.
    MusicSegment(MusicSegment),
    /// Music track: ordered playlist of sources, events or nested tracks.
    MusicTrack(MusicTrack),
    /// Music random/sequence container: playlist tree over segments.
    MusicRandomSequence(MusicRandomSequence),
    /// Any other object kind, not decoded.
    Opaque(OpaqueEntry),
}

impl HierarchyEntry {
    /// Identifier of the entry, unique within its hierarchy section.
    pub fn id(&self) -> u32 {
        match self {
            Self::MusicSegment(segment) => segment.id,
            Self::MusicTrack(track) => track.id,
            Self::MusicRandomSequence(container) => container.id,
            Self::Opaque(entry) => entry.id,
        }
    }

    /// Object kind of the entry.
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::MusicSegment(_) => EntryKind::MusicSegment,
            Self::MusicTrack(_) => EntryKind::MusicTrack,
            Self::MusicRandomSequence(_) => EntryKind::MusicRandomSequence,
            Self::Opaque(entry) => entry.kind,
        }
    }
}

/// Object kinds found in a hierarchy section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Project settings.
    Settings,
    /// Sound effect or voice.
    Sound,
    /// Action triggered by an event.
    EventAction,
    /// Event.
    Event,
    /// Random or sequence container (non-music).
    RandomOrSequenceContainer,
    /// Switch container.
    SwitchContainer,
    /// Actor-mixer.
    ActorMixer,
    /// Audio bus.
    AudioBus,
    /// Blend container.
    BlendContainer,
    /// Music segment.
    MusicSegment,
    /// Music track.
    MusicTrack,
    /// Music switch container.
    MusicSwitchContainer,
    /// Music random/sequence container.
    MusicRandomSequence,
    /// Attenuation.
    Attenuation,
    /// Dialogue event.
    DialogueEvent,
    /// Motion bus.
    MotionBus,
    /// Motion effect.
    MotionFx,
    /// Effect.
    Effect,
    /// Auxiliary bus.
    AuxiliaryBus,
    /// Unrecognized kind byte.
    Unknown,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Music segment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicSegment {
    /// Object id.
    pub id: u32,
    /// Segment duration in milliseconds.
    pub duration: f64,
    /// Timing markers.
    pub markers: Vec<Marker>,
    /// Child track ids, in declaration order.
    pub children: Vec<u32>,
}

/// Timing marker on a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Marker type id.
    pub id: u32,
    /// Position in milliseconds.
    pub position: f64,
    /// Marker name, often empty.
    #[serde(default)]
    pub name: String,
}

/// Music track record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicTrack {
    /// Object id.
    pub id: u32,
    /// Playback behavior of the track.
    #[serde(default)]
    pub track_type: TrackType,
    /// Playlist slots.
    pub playlist: Vec<TrackSlot>,
}

/// How a track picks among its playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackType {
    /// Plays every slot at its offset.
    #[default]
    Normal,
    /// Picks one slot at random.
    Random,
    /// Steps through the slots.
    Sequence,
    /// Picks by switch state.
    Switch,
}

/// Raw playlist slot of a track.
///
/// At most one of `event_id`, `source_id`, `track_id` is meaningful; zero
/// means "not set".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackSlot {
    /// Nested track reference.
    pub track_id: u32,
    /// Audio entry reference.
    pub source_id: u32,
    /// Event reference.
    pub event_id: u32,
    /// Playback offset in milliseconds.
    pub play_at: f64,
    /// Trim at the start, in milliseconds.
    pub begin_trim_offset: f64,
    /// Trim at the end, in milliseconds.
    pub end_trim_offset: f64,
    /// Duration of the referenced source, in milliseconds.
    pub src_duration: f64,
}

/// Music random/sequence container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicRandomSequence {
    /// Object id.
    pub id: u32,
    /// Child segment ids.
    pub children: Vec<u32>,
    /// Root of the playlist tree.
    pub playlist: Vec<RandomSequenceItem>,
}

/// Node of a random/sequence playlist tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomSequenceItem {
    /// Segment played by a leaf, zero for groups.
    pub segment_id: u32,
    /// Item id.
    pub item_id: u32,
    /// 0 = sequence, 1 = random.
    pub rs_type: u32,
    /// Loop count, 0 = infinite.
    pub loop_count: u16,
    /// Random weight.
    pub weight: u32,
    /// Nested items.
    #[serde(default)]
    pub children: Vec<RandomSequenceItem>,
}

impl RandomSequenceItem {
    /// Collect every non-zero segment id in this subtree, depth first.
    pub fn segment_ids(&self, out: &mut Vec<u32>) {
        if self.segment_id != 0 {
            out.push(self.segment_id);
        }
        for child in &self.children {
            child.segment_ids(out);
        }
    }
}

/// Undecoded hierarchy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueEntry {
    /// Object id.
    pub id: u32,
    /// Object kind.
    pub kind: EntryKind,
    /// Raw body bytes.
    #[serde(default)]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_and_kind() {
        let entry = HierarchyEntry::Opaque(OpaqueEntry {
            id: 7,
            kind: EntryKind::Sound,
            data: vec![1, 2, 3],
        });
        assert_eq!(entry.id(), 7);
        assert_eq!(entry.kind(), EntryKind::Sound);
    }

    #[test]
    fn test_random_sequence_segment_ids() {
        let tree = RandomSequenceItem {
            segment_id: 0,
            item_id: 1,
            rs_type: 0,
            loop_count: 1,
            weight: 50000,
            children: vec![
                RandomSequenceItem {
                    segment_id: 10,
                    item_id: 2,
                    rs_type: 0,
                    loop_count: 1,
                    weight: 50000,
                    children: vec![],
                },
                RandomSequenceItem {
                    segment_id: 11,
                    item_id: 3,
                    rs_type: 0,
                    loop_count: 1,
                    weight: 50000,
                    children: vec![],
                },
            ],
        };

        let mut ids = Vec::new();
        tree.segment_ids(&mut ids);
        assert_eq!(ids, vec![10, 11]);
    }
}
