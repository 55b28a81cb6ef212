//! Core types for the bank patch kernel.

pub mod ids;
pub mod hierarchy;
pub mod container;
pub mod graph;

pub use ids::{AudioId, ContainerLabel, ZeroAudioId};
pub use hierarchy::{
    EntryKind, HierarchyEntry, Marker, MusicRandomSequence, MusicSegment, MusicTrack,
    OpaqueEntry, RandomSequenceItem, TrackSlot, TrackType,
};
pub use container::{
    BankData, BankHeader, ContainerData, ContainerKind, HierarchySection, IndexEntry,
    IndexSection, PackageData, PackageEntry, PackageHeader, PayloadSection, Section,
    SectionKind,
};
pub use graph::{
    NodeKey, PlaylistItem, PlaylistTarget, PlaylistTiming, SegmentNode, SegmentTiming,
    TrackNode, FADE_IN_END_MARKER, FADE_OUT_START_MARKER,
};
