//! Performance benchmarks for forest construction and projection.
//!
//! Run with: `cargo bench --bench graph_build`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Build, 1k tracks | <5ms | Nested track copies included |
//! | Fingerprint | <10ms | Canonical JSON + xxh64 |
//! | Projection, 1k tracks | <10ms | Rebuilt after every mutation |

use std::collections::BTreeSet;
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bank_patch_kernel::projection::ContainerView;
use bank_patch_kernel::types::{Marker, MusicSegment, MusicTrack, TrackSlot, TrackType, FADE_IN_END_MARKER};
use bank_patch_kernel::{
    forest_fingerprint, AudioId, ContainerData, ContainerLabel, GraphBuilder, HierarchyEntry,
    InMemoryCodec, OverridePolicy, OverrideStore, Projection,
};

/// Hierarchy with `tracks` tracks of four slots each, one segment per eight
/// tracks. Every fourth track nests its predecessor.
fn make_hierarchy(tracks: u32) -> Vec<HierarchyEntry> {
    let mut entries = Vec::with_capacity(tracks as usize + tracks as usize / 8 + 1);

    for t in 0..tracks {
        let id = 1000 + t;
        let mut playlist: Vec<TrackSlot> = (0..4)
            .map(|s| TrackSlot {
                source_id: 1 + t * 4 + s,
                play_at: f64::from(s) * 250.0,
                src_duration: 1000.0,
                ..TrackSlot::default()
            })
            .collect();
        if t % 4 == 3 {
            playlist.push(TrackSlot {
                track_id: id - 1,
                ..TrackSlot::default()
            });
        }
        entries.push(HierarchyEntry::MusicTrack(MusicTrack {
            id,
            track_type: TrackType::Normal,
            playlist,
        }));
    }

    for s in 0..tracks.div_ceil(8) {
        entries.push(HierarchyEntry::MusicSegment(MusicSegment {
            id: 1 + s,
            duration: 8000.0,
            markers: vec![Marker {
                id: FADE_IN_END_MARKER,
                position: 500.0,
                name: String::new(),
            }],
            children: (0..8).map(|i| 1000 + s * 8 + i).filter(|&c| c < 1000 + tracks).collect(),
        }));
    }

    entries
}

/// Benchmark forest construction.
fn bench_build(c: &mut Criterion) {
    let label = ContainerLabel::new("bench000");
    let mut group = c.benchmark_group("graph_build");

    for tracks in [10u32, 100, 1000] {
        let entries = make_hierarchy(tracks);

        group.throughput(Throughput::Elements(u64::from(tracks)));
        group.bench_with_input(BenchmarkId::new("tracks", tracks), &entries, |b, entries| {
            b.iter(|| {
                let build = GraphBuilder::new(&label).build(black_box(entries));
                assert!(build.warnings.is_empty());
                build
            })
        });
    }

    group.finish();
}

/// Benchmark forest fingerprinting.
fn bench_fingerprint(c: &mut Criterion) {
    let label = ContainerLabel::new("bench000");
    let build = GraphBuilder::new(&label).build(&make_hierarchy(1000));

    c.bench_function("forest_fingerprint_1000", |b| {
        b.iter(|| forest_fingerprint(black_box(&build)).unwrap())
    });
}

/// Benchmark projection of one bank.
fn bench_projection(c: &mut Criterion) {
    let label = ContainerLabel::new("bench000");
    let mut group = c.benchmark_group("projection");

    for tracks in [10u32, 100, 1000] {
        let audio: Vec<(AudioId, Vec<u8>)> = (1..=tracks * 4 + 16)
            .filter_map(AudioId::new)
            .map(|id| (id, vec![0u8; 8]))
            .collect();
        let content = ContainerData::Bank(InMemoryCodec::pack_bank(make_hierarchy(tracks), &audio, true));
        let graph = GraphBuilder::new(&label).build(content.hierarchy());
        let overrides = OverrideStore::new(
            label.clone(),
            "bench.bnk",
            OverridePolicy::AllowNew,
            "wem",
            std::env::temp_dir(),
        );
        let edited = BTreeSet::new();
        let views = [ContainerView {
            label: &label,
            name: "bench.bnk",
            path: Path::new("/bench/bench.bnk"),
            content: &content,
            graph: &graph,
            overrides: &overrides,
            edited: &edited,
        }];

        group.throughput(Throughput::Elements(u64::from(tracks)));
        group.bench_with_input(BenchmarkId::new("tracks", tracks), &views, |b, views| {
            b.iter(|| {
                let projection = Projection::build(black_box(views), |_| None);
                assert!(!projection.is_empty());
                projection
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build, bench_fingerprint, bench_projection);
criterion_main!(benches);
