//! Random-hyperplane LSH blocking over embeddings.
//!
//! Two records collide in a hash table iff all `k` signed-projection bits
//! agree; `L` independent tables trade precision for recall. Hyperplanes
//! are drawn from a fixed seed, so runs are reproducible, and no vector
//! index is required.

use hashbrown::{HashMap as FastMap, HashSet as FastSet};
use store::{DocumentStore, ScanFilter};
use tracing::{debug, warn};

use crate::{
    BlockingError, BlockingStrategy, CandidatePair, StrategyOutput, StrategyStats, SCAN_BATCH,
};

/// LSH blocking with `num_hash_tables` tables of `num_hyperplanes` bits.
pub struct LshStrategy {
    name: String,
    num_hash_tables: usize,
    num_hyperplanes: usize,
    random_seed: u64,
}

impl LshStrategy {
    pub fn new(
        num_hash_tables: usize,
        num_hyperplanes: usize,
        random_seed: u64,
    ) -> Result<Self, BlockingError> {
        if num_hash_tables < 1 {
            return Err(BlockingError::InvalidConfig {
                strategy: "lsh".into(),
                reason: "num_hash_tables must be >= 1".into(),
            });
        }
        if num_hyperplanes < 1 {
            return Err(BlockingError::InvalidConfig {
                strategy: "lsh".into(),
                reason: "num_hyperplanes must be >= 1".into(),
            });
        }
        if num_hyperplanes > 64 {
            return Err(BlockingError::InvalidConfig {
                strategy: "lsh".into(),
                reason: "num_hyperplanes must be <= 64".into(),
            });
        }
        Ok(Self {
            name: "lsh".to_string(),
            num_hash_tables,
            num_hyperplanes,
            random_seed,
        })
    }

    /// Generate the `L*k` hyperplanes for `dim`-dimensional embeddings.
    /// Deterministic in `(seed, L, k, dim)`.
    fn hyperplanes(&self, dim: usize) -> Vec<Vec<f32>> {
        let total = self.num_hash_tables * self.num_hyperplanes;
        let mut planes = Vec::with_capacity(total);
        for plane_idx in 0..total {
            let mut plane = Vec::with_capacity(dim);
            for component in 0..dim {
                let stream_idx = (plane_idx * dim + component) as u64;
                plane.push(gaussian(self.random_seed, stream_idx) as f32);
            }
            planes.push(plane);
        }
        planes
    }

    /// The `k`-bit signature of an embedding in one table.
    fn signature(&self, table: usize, embedding: &[f32], planes: &[Vec<f32>]) -> u64 {
        let mut bits = 0u64;
        for p in 0..self.num_hyperplanes {
            let plane = &planes[table * self.num_hyperplanes + p];
            let projection: f64 = embedding
                .iter()
                .zip(plane.iter())
                .map(|(x, h)| f64::from(*x) * f64::from(*h))
                .sum();
            if projection >= 0.0 {
                bits |= 1 << p;
            }
        }
        bits
    }
}

impl BlockingStrategy for LshStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<StrategyOutput, BlockingError> {
        let mut stats = StrategyStats::default();
        let mut records: Vec<(String, Vec<f32>)> = Vec::new();
        let mut dim: Option<usize> = None;

        store.scan(
            collection,
            &ScanFilter::none().with_embedding(true),
            SCAN_BATCH,
            &mut |record| {
                stats.records_scanned += 1;
                let Some(embedding) = record.embedding else {
                    stats.records_skipped += 1;
                    return Ok(());
                };
                match dim {
                    None if !embedding.is_empty() => {
                        dim = Some(embedding.len());
                        records.push((record.id, embedding));
                    }
                    Some(d) if embedding.len() == d => {
                        records.push((record.id, embedding));
                    }
                    _ => {
                        stats.records_skipped += 1;
                        warn!(
                            record = record.id.as_str(),
                            "embedding dimension mismatch, skipping"
                        );
                    }
                }
                Ok(())
            },
        )?;

        let Some(dim) = dim else {
            debug!(collection, "no embedded records; lsh emits nothing");
            return Ok(StrategyOutput {
                pairs: Vec::new(),
                stats,
            });
        };

        let planes = self.hyperplanes(dim);
        let mut buckets: FastMap<(usize, u64), Vec<usize>> = FastMap::new();
        for (idx, (_, embedding)) in records.iter().enumerate() {
            for table in 0..self.num_hash_tables {
                let bits = self.signature(table, embedding, &planes);
                buckets.entry((table, bits)).or_default().push(idx);
            }
        }

        // The same pair can collide in several tables; emit it once.
        let mut seen: FastSet<(usize, usize)> = FastSet::new();
        let mut pairs = Vec::new();
        let mut bucket_keys: Vec<(usize, u64)> = buckets.keys().copied().collect();
        bucket_keys.sort_unstable();
        for key in bucket_keys {
            let members = &buckets[&key];
            if members.len() < 2 {
                continue;
            }
            stats.blocks_built += 1;
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let (lo, hi) = if members[i] < members[j] {
                        (members[i], members[j])
                    } else {
                        (members[j], members[i])
                    };
                    if !seen.insert((lo, hi)) {
                        continue;
                    }
                    if let Some(pair) = CandidatePair::new(
                        records[lo].0.clone(),
                        records[hi].0.clone(),
                        &self.name,
                        Some(format!("t{}:{:016x}", key.0, key.1)),
                    ) {
                        pairs.push(pair);
                    }
                }
            }
        }
        stats.pairs_emitted = pairs.len();
        Ok(StrategyOutput { pairs, stats })
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Map a 64-bit hash onto `[0, 1)` using its top 53 bits.
fn unit_interval(x: u64) -> f64 {
    (x >> 11) as f64 / (1u64 << 53) as f64
}

/// Standard-normal draw `idx` from the stream defined by `seed`
/// (Box–Muller over two splitmix64 uniforms).
fn gaussian(seed: u64, idx: u64) -> f64 {
    let u1 = unit_interval(splitmix64(seed.wrapping_add(idx.wrapping_mul(2)))).max(1e-12);
    let u2 = unit_interval(splitmix64(
        seed.wrapping_add(idx.wrapping_mul(2).wrapping_add(1)),
    ));
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{InMemoryStore, OnConflict, Record};

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin(), 0.0, 0.0]
    }

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("docs").unwrap();
        let mut records = Vec::new();
        // Two tight groups of five, far apart on the unit circle.
        for i in 0..5 {
            records.push(
                Record::new(format!("docs/a{i}"), "docs")
                    .with_embedding(unit(0.02 * i as f32)),
            );
            records.push(
                Record::new(format!("docs/b{i}"), "docs")
                    .with_embedding(unit(std::f32::consts::PI + 0.02 * i as f32)),
            );
        }
        store
            .insert_many("docs", records, OnConflict::Replace)
            .unwrap();
        store
    }

    fn pair_set(output: &StrategyOutput) -> Vec<(String, String)> {
        let mut set: Vec<(String, String)> = output
            .pairs
            .iter()
            .map(|p| (p.id_a.clone(), p.id_b.clone()))
            .collect();
        set.sort();
        set
    }

    #[test]
    fn validation_mirrors_limits() {
        assert!(matches!(
            LshStrategy::new(0, 8, 42),
            Err(BlockingError::InvalidConfig { reason, .. }) if reason.contains("num_hash_tables")
        ));
        assert!(matches!(
            LshStrategy::new(10, 0, 42),
            Err(BlockingError::InvalidConfig { reason, .. }) if reason.contains("num_hyperplanes")
        ));
        assert!(LshStrategy::new(10, 64, 42).is_ok());
        assert!(LshStrategy::new(10, 65, 42).is_err());
    }

    #[test]
    fn hyperplanes_are_deterministic_per_seed() {
        let a = LshStrategy::new(5, 4, 42).unwrap().hyperplanes(8);
        let b = LshStrategy::new(5, 4, 42).unwrap().hyperplanes(8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        let c = LshStrategy::new(5, 4, 123).unwrap().hyperplanes(8);
        assert_ne!(a, c);
    }

    #[test]
    fn same_seed_produces_identical_pair_sets() {
        let store = seeded_store();
        let first = LshStrategy::new(10, 8, 42)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        let second = LshStrategy::new(10, 8, 42)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        assert_eq!(pair_set(&first), pair_set(&second));
    }

    #[test]
    fn recall_of_intra_group_pairs_is_positive() {
        let store = seeded_store();
        let output = LshStrategy::new(10, 8, 42)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        let intra = output
            .pairs
            .iter()
            .filter(|p| {
                (p.id_a.starts_with("docs/a") && p.id_b.starts_with("docs/a"))
                    || (p.id_a.starts_with("docs/b") && p.id_b.starts_with("docs/b"))
            })
            .count();
        assert!(intra > 0, "expected intra-group collisions");
    }

    #[test]
    fn pairs_are_unique_across_tables() {
        let store = seeded_store();
        let output = LshStrategy::new(12, 4, 7)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        let set = pair_set(&output);
        let mut deduped = set.clone();
        deduped.dedup();
        assert_eq!(set, deduped);
    }

    #[test]
    fn empty_collection_emits_nothing() {
        let store = InMemoryStore::new();
        store.create_collection("docs").unwrap();
        let output = LshStrategy::new(4, 4, 1)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        assert!(output.pairs.is_empty());
        assert_eq!(output.stats.records_scanned, 0);
    }

    #[test]
    fn mismatched_dimensions_are_skipped() {
        let store = seeded_store();
        store
            .insert_many(
                "docs",
                vec![Record::new("docs/bad", "docs").with_embedding(vec![1.0, 0.0])],
                OnConflict::Replace,
            )
            .unwrap();
        let output = LshStrategy::new(4, 4, 1)
            .unwrap()
            .generate(&store, "docs")
            .unwrap();
        assert!(output.stats.records_skipped >= 1);
        assert!(!output
            .pairs
            .iter()
            .any(|p| p.id_a == "docs/bad" || p.id_b == "docs/bad"));
    }
}
