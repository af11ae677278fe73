//! Database partitions
//!
//! A partition is a self-contained shard with its own dense sid space:
//! one sequence store, one metadata store, the chunk descriptors it was
//! built from, and the sorted set of lineage ids actually present (used
//! by the expression simplifier to short-circuit lineage predicates).

use crate::dictionary::Dictionary;
use crate::meta_store::MetaStore;
use crate::sequence_store::SequenceStore;

/// A contiguous run of sids sharing a lineage-prefix bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The lineage-prefix bucket this chunk was grouped under
    pub prefix: String,
    /// Number of sequences in the chunk
    pub count: u32,
    /// First sid of the chunk within its partition
    pub offset: u32,
    /// Full lineage names present in the chunk
    pub lineages: Vec<String>,
}

/// One shard of the database.
#[derive(Debug)]
pub struct Partition {
    /// Number of sequences ingested into this partition
    pub sequence_count: u32,
    /// Chunk descriptors, in sid order
    pub chunks: Vec<Chunk>,
    /// The per-position bitmap index
    pub seq_store: SequenceStore,
    /// The metadata columns and predicate bitmaps
    pub meta_store: MetaStore,
    /// Sorted lineage ids present in this partition
    pub sorted_lineages: Vec<u32>,
}

impl Partition {
    /// Create an empty partition for the given genome length and chunk set
    pub fn new(genome_length: usize, extra_columns: usize, chunks: Vec<Chunk>) -> Self {
        Self {
            sequence_count: 0,
            chunks,
            seq_store: SequenceStore::new(genome_length),
            meta_store: MetaStore::new(extra_columns),
            sorted_lineages: Vec::new(),
        }
    }

    /// Freeze the partition: collect the present lineage ids, flip the
    /// per-position majority bitmaps, and precompute the metadata
    /// predicate bitmaps. Must run before the first query.
    pub fn finalize(&mut self, dict: &Dictionary) {
        let mut lineages: Vec<u32> = Vec::new();
        for chunk in &self.chunks {
            for name in &chunk.lineages {
                if let Some(id) = dict.lineage_id(name) {
                    if !lineages.contains(&id) {
                        lineages.push(id);
                    }
                }
            }
        }
        lineages.sort_unstable();
        self.sorted_lineages = lineages;

        self.seq_store.finalize();
        self.meta_store.precompute(dict);
    }

    /// Whether a lineage id occurs in this partition
    pub fn contains_lineage(&self, id: u32) -> bool {
        self.sorted_lineages.binary_search(&id).is_ok()
    }
}
