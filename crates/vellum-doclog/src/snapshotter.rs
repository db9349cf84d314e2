//! Snapshot byte production.
//!
//! What a snapshot *contains* is the application's business; the log
//! only stores and serves the bytes. The [`SnapshotProducer`] trait is
//! the seam; the shipped [`RollupSnapshotter`] packs the raw deltas into
//! a length-prefixed roll-up that a client can replay, with the covered
//! version as the state vector.

use vellum_storage::DeltaRecord;

/// Produces snapshot and state-vector bytes from a delta prefix.
pub trait SnapshotProducer: Send + Sync + 'static {
    /// Fold `deltas` (ascending by version) into `(snapshot,
    /// state_vector)` bytes.
    fn produce(&self, deltas: &[DeltaRecord]) -> (Vec<u8>, Vec<u8>);
}

/// Default producer: a replayable length-prefixed concatenation.
///
/// Layout: for each delta, a 4-byte big-endian payload length followed by
/// the payload. The state vector is the 8-byte big-endian version the
/// snapshot covers. A CRDT-aware deployment substitutes its own producer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollupSnapshotter;

impl SnapshotProducer for RollupSnapshotter {
    fn produce(&self, deltas: &[DeltaRecord]) -> (Vec<u8>, Vec<u8>) {
        let total: usize = deltas.iter().map(|d| 4 + d.payload.len()).sum();
        let mut snapshot = Vec::with_capacity(total);
        for delta in deltas {
            let len = u32::try_from(delta.payload.len()).unwrap_or(u32::MAX);
            snapshot.extend_from_slice(&len.to_be_bytes());
            snapshot.extend_from_slice(&delta.payload);
        }

        let covered = deltas.last().map_or(0, |d| d.version);
        let state_vector = covered.to_be_bytes().to_vec();

        (snapshot, state_vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vellum_core::{ClientId, DocumentKey, PrincipalId};

    fn delta(version: u64, payload: &[u8]) -> DeltaRecord {
        DeltaRecord {
            doc: DocumentKey::new("p", "d").unwrap(),
            version,
            payload: payload.to_vec(),
            principal: PrincipalId::new("u"),
            client: ClientId::new("c"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rollup_is_length_prefixed_and_ordered() {
        let (snapshot, state_vector) =
            RollupSnapshotter.produce(&[delta(1, b"ab"), delta(2, b"xyz")]);

        assert_eq!(
            snapshot,
            [&[0, 0, 0, 2][..], b"ab", &[0, 0, 0, 3][..], b"xyz"].concat()
        );
        assert_eq!(state_vector, 2u64.to_be_bytes().to_vec());
    }

    #[test]
    fn empty_prefix_produces_empty_rollup() {
        let (snapshot, state_vector) = RollupSnapshotter.produce(&[]);
        assert!(snapshot.is_empty());
        assert_eq!(state_vector, 0u64.to_be_bytes().to_vec());
    }
}
