//! Canonical serialization for deterministic hashing.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: Struct fields serialize in declaration order
//! - Stable Vec order: Vectors serialize in index order
//! - No HashMap allowed: Use BTreeMap for maps in hashed data
//! - Segment forests hash with roots ordered by id, so two builds of the same
//!   hierarchy compare equal regardless of where segments sat in the entry list

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use crate::graph::GraphBuild;
use crate::types::SegmentNode;

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> serde_json::Result<u64> {
    let bytes = to_canonical_bytes(value)?;
    Ok(xxh64(&bytes, 0))
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(format!("{:016x}", canonical_hash(value)?))
}

/// Fingerprint of a segment forest.
///
/// Roots are ordered by segment id; everything below a root keeps its built
/// order, since playlist order is meaningful.
pub fn forest_fingerprint(build: &GraphBuild) -> serde_json::Result<String> {
    let mut roots: Vec<&SegmentNode> = build.segments.iter().collect();
    roots.sort_by_key(|segment| segment.id);
    canonical_hash_hex(&roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u32) -> SegmentNode {
        SegmentNode {
            id,
            duration: 1000.0,
            fade_in_end: 0.0,
            fade_out_start: 0.0,
            children: vec![],
        }
    }

    #[test]
    fn test_determinism() {
        let s = segment(1);
        assert_eq!(canonical_hash(&s).unwrap(), canonical_hash(&s).unwrap());
        assert_eq!(canonical_hash_hex(&s).unwrap().len(), 16);
    }

    #[test]
    fn test_forest_fingerprint_ignores_root_order() {
        let a = GraphBuild {
            segments: vec![segment(1), segment(2)],
            warnings: vec![],
        };
        let b = GraphBuild {
            segments: vec![segment(2), segment(1)],
            warnings: vec![],
        };
        let c = GraphBuild {
            segments: vec![segment(1), segment(3)],
            warnings: vec![],
        };

        assert_eq!(forest_fingerprint(&a).unwrap(), forest_fingerprint(&b).unwrap());
        assert_ne!(forest_fingerprint(&a).unwrap(), forest_fingerprint(&c).unwrap());
    }
}
