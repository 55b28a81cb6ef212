//! # bank-patch-kernel
//!
//! Asset-graph resolution, multi-source disambiguation and override/export
//! reconciliation for audio bank and package containers.
//!
//! The kernel answers three questions:
//!
//! > What does this bank play? Which opened container supplies the bytes of
//! > a given audio id? What has to be written so a patched container carries
//! > the replacement audio?
//!
//! ## Core Contract
//!
//! 1. Build a segment/track/playlist forest from a bank's flat hierarchy
//! 2. Rank every container claiming an audio id and materialize the winner's
//!    bytes lazily, extracting each container at most once
//! 3. Track replacement audio per container; "changed" is always derived
//! 4. Reconcile overrides into index metadata, stage a merged payload, and
//!    save one or many containers with partial-failure reporting
//!
//! ## Architecture
//!
//! ```text
//! open → GraphBuilder → SourceRegistry ← OverrideStore
//!              ↓              ↓               ↓
//!          Projection (node map, derived dirty flags)
//!                             ↓
//!                    ExportCoordinator → ContainerCodec
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same hierarchy entries in any order → identical forest fingerprint
//! - Ties between equally ranked origins keep registration order
//! - Node keys derive from the container label and ids, stable across rebuilds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod graph;
pub mod canonical;
pub mod codec;
pub mod transcode;
pub mod registry;
pub mod overrides;
pub mod export;
pub mod projection;
pub mod loudness;
pub mod session;
pub mod config;
pub mod error;
pub mod telemetry;

// Re-exports
pub use types::{
    AudioId, ContainerData, ContainerKind, ContainerLabel, HierarchyEntry, NodeKey,
    PlaylistItem, PlaylistTarget, PlaylistTiming, SegmentNode, SegmentTiming, TrackNode,
};
pub use graph::{GraphBuild, GraphBuilder, GraphWarning};
pub use canonical::{canonical_hash, canonical_hash_hex, forest_fingerprint, to_canonical_bytes};
pub use codec::{ContainerCodec, InMemoryCodec};
pub use transcode::{CliTranscoder, StubTranscoder, Transcoder};
pub use registry::{AudioOrigin, SourceRegistry};
pub use overrides::{OverrideEntry, OverridePolicy, OverrideStore};
pub use export::{
    reconcile_index, BatchReport, ExportCoordinator, ExportFailure, ExportProgress, ExportRecord,
    ExportTarget, IndexReconciliation,
};
pub use projection::{ItemTarget, NodeRole, ProjectedContainer, ProjectedNode, Projection};
pub use loudness::{LoudnessCache, LoudnessInfo};
pub use session::{OpenedContainer, PreviewReport, Session, SessionEvent};
pub use config::{KernelConfig, ToolPaths};
pub use error::{KernelError, Result};
pub use telemetry::{init_tracing, LogFormat};
