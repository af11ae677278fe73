//! Query actions: folds over per-partition filter results
//!
//! Actions consume the vector of per-partition filters produced by the
//! evaluation phase. `count` is a parallel cardinality sum; `mutations`
//! computes per-position symbol frequencies against the global reference,
//! parallel over positions with a coarse grain.

use rayon::prelude::*;

use crate::database::Database;
use crate::evaluate::Filter;
use crate::symbols::Symbol;

/// Position grain for the parallel per-position counting loop.
const MUTATION_GRAIN: usize = 300;

/// One reported mutation: reference symbol, position, variant symbol,
/// and its share among matching sequences with a known base there.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationProportion {
    /// Reference symbol at the position
    pub from: char,
    /// 1-indexed genome position
    pub position: u32,
    /// Variant symbol
    pub to: char,
    /// `count / total`, where total excludes N calls
    pub proportion: f64,
    /// Number of matching sequences carrying the variant
    pub count: u32,
}

/// Sum of match counts across partitions. Filters are released here.
pub fn execute_count(_db: &Database, partition_filters: Vec<Filter<'_>>) -> u64 {
    partition_filters
        .into_par_iter()
        .map(|filter| filter.cardinality())
        .sum()
}

/// Per-position counts of one partition's matches, flip-adjusted.
#[derive(Default, Clone, Copy)]
struct PositionCounts {
    n: u64,
    by_symbol: [u64; 5],
}

/// Candidate variant symbols, in enumeration order.
const CANDIDATES: [Symbol; 5] = [Symbol::Gap, Symbol::A, Symbol::C, Symbol::G, Symbol::T];

/// Mutation frequencies over the matching set.
///
/// For every position, counts how many matching sequences carry each
/// canonical symbol or gap other than the reference symbol. N calls are
/// treated as unknown and removed from the denominator. A variant is
/// reported when its count exceeds `ceil(total * threshold) - 1`;
/// zero-count variants are never reported. Results are ordered by
/// position, then by symbol enumeration order.
pub fn execute_mutations(
    db: &Database,
    partition_filters: Vec<Filter<'_>>,
    proportion_threshold: f64,
) -> Vec<MutationProportion> {
    let genome_length = db.genome_length();
    let reference = db.reference();

    let counts: Vec<PositionCounts> = (0..genome_length)
        .into_par_iter()
        .with_min_len(MUTATION_GRAIN)
        .map(|pos_index| {
            let pos = pos_index + 1;
            let mut counts = PositionCounts::default();
            for (partition, filter) in db.partitions().iter().zip(&partition_filters) {
                let matches = filter.as_bitmap();
                let store = &partition.seq_store;
                counts.n += matches.intersection_len(store.bm(pos, Symbol::N));
                for (slot, &candidate) in CANDIDATES.iter().enumerate() {
                    if store.flipped(pos) == Some(candidate) {
                        // stored bitmap is the complement of the members
                        counts.by_symbol[slot] +=
                            matches.difference_len(store.bm(pos, candidate));
                    } else {
                        counts.by_symbol[slot] +=
                            matches.intersection_len(store.bm(pos, candidate));
                    }
                }
            }
            counts
        })
        .collect();

    let matching_total: u64 = partition_filters
        .iter()
        .map(|filter| filter.cardinality())
        .sum();
    drop(partition_filters);

    let mut result = Vec::new();
    for (pos_index, counts) in counts.iter().enumerate() {
        let reference_symbol = reference[pos_index];
        let total = matching_total - counts.n;
        if total == 0 {
            continue;
        }
        let threshold_count = (total as f64 * proportion_threshold).ceil() as i64 - 1;
        for (slot, &candidate) in CANDIDATES.iter().enumerate() {
            if candidate == reference_symbol {
                continue;
            }
            let count = counts.by_symbol[slot];
            if count > 0 && count as i64 > threshold_count {
                result.push(MutationProportion {
                    from: reference_symbol.to_char(),
                    position: pos_index as u32 + 1,
                    to: candidate.to_char(),
                    proportion: count as f64 / total as f64,
                    count: count as u32,
                });
            }
        }
    }
    result
}
