//! Columnar sequence store: per-position bitmap fans
//!
//! For every genome position the store keeps one compressed bitmap per
//! alphabet symbol, holding the set of sequence ids carrying that symbol
//! there. After [`SequenceStore::finalize`] the bitmap of the per-position
//! majority base is stored complemented ("flipped"): the majority is close
//! to the reference almost everywhere, and the complement of a near-full
//! set compresses far better than the set itself. Callers of [`bm`] get
//! the raw stored bitmap and must consult [`flipped`] themselves; the
//! expression simplifier is the only place that interprets flips.
//!
//! [`bm`]: SequenceStore::bm
//! [`flipped`]: SequenceStore::flipped

use rayon::prelude::*;
use roaring::RoaringBitmap;

use crate::error::{Error, Result};
use crate::symbols::{Symbol, SYMBOL_COUNT};

/// One genome locus: the bitmap fan plus the flipped-symbol marker.
#[derive(Debug)]
pub struct Position {
    /// Per-symbol sid sets; the flipped symbol's entry is complemented
    pub bitmaps: [RoaringBitmap; SYMBOL_COUNT],
    /// The symbol whose bitmap is stored complemented, if any.
    /// Invariant: always one of A/C/G/T when set.
    pub flipped_symbol: Option<Symbol>,
}

impl Position {
    fn new() -> Self {
        Self {
            bitmaps: std::array::from_fn(|_| RoaringBitmap::new()),
            flipped_symbol: None,
        }
    }
}

/// The per-partition sequence index.
#[derive(Debug)]
pub struct SequenceStore {
    positions: Vec<Position>,
    genome_length: usize,
    sequence_count: u32,
}

impl SequenceStore {
    /// Create an empty store for genomes of the given length
    pub fn new(genome_length: usize) -> Self {
        Self {
            positions: (0..genome_length).map(|_| Position::new()).collect(),
            genome_length,
            sequence_count: 0,
        }
    }

    /// Reassemble a store from its parts (deserialization path)
    pub(crate) fn from_parts(positions: Vec<Position>, sequence_count: u32) -> Self {
        Self {
            genome_length: positions.len(),
            positions,
            sequence_count,
        }
    }

    /// The fixed genome length of this store
    pub fn genome_length(&self) -> usize {
        self.genome_length
    }

    /// Number of ingested sequences
    pub fn sequence_count(&self) -> u32 {
        self.sequence_count
    }

    /// Access all positions (0-indexed). Serialization and statistics only.
    pub(crate) fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// The stored bitmap for `pos` (1-indexed) and symbol `s`.
    ///
    /// No interpretation of flipping: when `s` is the flipped symbol the
    /// returned bitmap is the complement of the membership set. Callers
    /// fold the complement into the surrounding boolean algebra.
    #[inline]
    pub fn bm(&self, pos: usize, s: Symbol) -> &RoaringBitmap {
        &self.positions[pos - 1].bitmaps[s.index()]
    }

    /// The flipped symbol at `pos` (1-indexed), if any
    #[inline]
    pub fn flipped(&self, pos: usize) -> Option<Symbol> {
        self.positions[pos - 1].flipped_symbol
    }

    /// Approximate match: the union of the stored bitmaps for every
    /// canonical symbol `r` can represent, at `pos` (1-indexed).
    ///
    /// Like [`bm`](Self::bm) this does not interpret flipping; with a
    /// flipped symbol in the expansion the caller must resolve the
    /// complement at composition.
    pub fn bma(&self, pos: usize, r: Symbol) -> RoaringBitmap {
        let mut acc = RoaringBitmap::new();
        for &s in r.expand() {
            acc |= self.bm(pos, s);
        }
        acc
    }

    /// Complement of [`bma`](Self::bma) within `[0, sequence_count)`
    pub fn bma_neg(&self, pos: usize, r: Symbol) -> RoaringBitmap {
        let mut acc = self.full_range();
        acc -= &self.bma(pos, r);
        acc
    }

    /// A fresh bitmap covering all sids `[0, sequence_count)`
    pub fn full_range(&self) -> RoaringBitmap {
        let mut full = RoaringBitmap::new();
        full.insert_range(0..self.sequence_count);
        full
    }

    /// Append a batch of genomes, assigning them the next sids in order.
    ///
    /// Flipping is not applied here; store invariants are only
    /// reestablished by [`finalize`](Self::finalize).
    pub fn ingest(&mut self, genomes: &[Vec<u8>]) -> Result<()> {
        for genome in genomes {
            if genome.len() != self.genome_length {
                return Err(Error::LengthMismatch {
                    expected: self.genome_length,
                    found: genome.len(),
                });
            }
        }

        let base_sid = self.sequence_count;
        let mut buckets: [Vec<u32>; SYMBOL_COUNT] = std::array::from_fn(|_| Vec::new());
        for (p, position) in self.positions.iter_mut().enumerate() {
            for (offset, genome) in genomes.iter().enumerate() {
                let byte = genome[p];
                let symbol =
                    Symbol::from_byte(byte).ok_or(Error::BadSymbol(byte as char))?;
                buckets[symbol.index()].push(base_sid + offset as u32);
            }
            for (bucket, bitmap) in buckets.iter_mut().zip(position.bitmaps.iter_mut()) {
                // sids are strictly increasing across batches, so the
                // sorted-append fast path always applies
                bitmap
                    .append(bucket.drain(..))
                    .map_err(|e| Error::Internal(format!("non-monotonic sid append: {e}")))?;
            }
        }

        self.sequence_count += genomes.len() as u32;
        Ok(())
    }

    /// Pick and flip the per-position majority symbol, then run-optimize.
    ///
    /// The majority search considers all symbols, first-wins on ties in
    /// enumeration order; the flip is only applied when the majority is a
    /// canonical base. Positions dominated by N or gap stay unflipped.
    pub fn finalize(&mut self) {
        let full = self.full_range();
        self.positions.par_iter_mut().for_each(|position| {
            let mut max_symbol = None;
            let mut max_count = 0u64;
            for s in Symbol::ALL {
                let count = position.bitmaps[s.index()].len();
                if count > max_count {
                    max_symbol = Some(s);
                    max_count = count;
                }
            }
            if let Some(s) = max_symbol {
                if s.is_canonical() {
                    position.flipped_symbol = Some(s);
                    position.bitmaps[s.index()] ^= &full;
                }
            }
            for bitmap in &mut position.bitmaps {
                bitmap.optimize();
            }
        });
    }

    /// Total serialized size of all position bitmaps, in bytes
    pub fn size_in_bytes(&self) -> u64 {
        self.positions
            .iter()
            .flat_map(|p| p.bitmaps.iter())
            .map(|b| b.serialized_size() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_from(genomes: &[&str]) -> SequenceStore {
        let mut store = SequenceStore::new(genomes[0].len());
        let batch: Vec<Vec<u8>> = genomes.iter().map(|g| g.as_bytes().to_vec()).collect();
        store.ingest(&batch).unwrap();
        store
    }

    /// Membership at `pos` with the flip resolved, for invariant checks.
    fn member_set(store: &SequenceStore, pos: usize, s: Symbol) -> RoaringBitmap {
        if store.flipped(pos) == Some(s) {
            let mut m = store.full_range();
            m -= store.bm(pos, s);
            m
        } else {
            store.bm(pos, s).clone()
        }
    }

    #[test]
    fn test_ingest_and_bm() {
        let store = store_from(&["ACGT", "ACGA"]);
        assert_eq!(store.sequence_count(), 2);
        assert!(store.bm(1, Symbol::A).contains(0));
        assert!(store.bm(1, Symbol::A).contains(1));
        assert!(store.bm(4, Symbol::T).contains(0));
        assert!(store.bm(4, Symbol::A).contains(1));
        assert!(!store.bm(4, Symbol::A).contains(0));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut store = SequenceStore::new(4);
        let err = store.ingest(&[b"ACG".to_vec()]).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { expected: 4, found: 3 }));
        // the failed batch must not have been partially applied
        assert_eq!(store.sequence_count(), 0);
    }

    #[test]
    fn test_finalize_flips_majority_base() {
        let mut store = store_from(&["ACGT", "ACGA"]);
        store.finalize();
        // positions 1-3: unanimous base flipped, stored bitmap is empty
        assert_eq!(store.flipped(1), Some(Symbol::A));
        assert!(store.bm(1, Symbol::A).is_empty());
        // position 4: A and T tie, enumeration order picks A
        assert_eq!(store.flipped(4), Some(Symbol::A));
        assert_eq!(
            store.bm(4, Symbol::A).iter().collect::<Vec<_>>(),
            vec![0],
            "stored bitmap for the flipped symbol is the complement"
        );
    }

    #[test]
    fn test_finalize_skips_non_canonical_majority() {
        let mut store = store_from(&["N", "N", "A"]);
        store.finalize();
        assert_eq!(store.flipped(1), None);
    }

    #[test]
    fn test_position_partitions_sid_range() {
        let mut store = store_from(&["ACGT", "ACGA", "TCGN", "-CGW"]);
        store.finalize();
        for pos in 1..=4 {
            let mut seen = RoaringBitmap::new();
            let mut total = 0u64;
            for s in Symbol::ALL {
                let m = member_set(&store, pos, s);
                total += m.len();
                seen |= m;
            }
            // each sid appears under exactly one symbol
            assert_eq!(total, store.sequence_count() as u64);
            assert_eq!(seen, store.full_range());
        }
    }

    #[test]
    fn test_bma_union_of_expansion() {
        let store = store_from(&["ACGT", "AGGT", "ATGT"]);
        // position 2 holds C, G, T; R matches A or G
        let r = store.bma(2, Symbol::R);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![1]);
        let neg = store.bma_neg(2, Symbol::R);
        assert_eq!(neg.iter().collect::<Vec<_>>(), vec![0, 2]);
        // unambiguous symbol degrades to the plain bitmap
        assert_eq!(store.bma(2, Symbol::C), *store.bm(2, Symbol::C));
    }
}
