//! Per-partition metadata store
//!
//! Dense per-sid vectors for the categorical and date columns, plus the
//! precomputed predicate bitmaps (lineage, sublineage closure, country,
//! region) that back the corresponding filter nodes. The dense vectors are
//! filled during ingest; the bitmaps are derived in one pass at finalize
//! using the sorted-append fast path.

use roaring::RoaringBitmap;

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};

/// Metadata columns and predicate bitmaps for one partition.
#[derive(Debug, Default)]
pub struct MetaStore {
    /// External sequence identifier per sid
    pub sid_to_epi: Vec<u64>,
    /// Collection date per sid, seconds since the Unix epoch
    pub sid_to_date: Vec<i64>,
    /// Lineage id per sid
    pub sid_to_lineage: Vec<u32>,
    /// Region id per sid
    pub sid_to_region: Vec<u32>,
    /// Country id per sid
    pub sid_to_country: Vec<u32>,
    /// Extra columns, column-major: `extras[col][sid]` is a value id
    pub extras: Vec<Vec<u32>>,

    /// sids per lineage id
    pub lineage_bitmaps: Vec<RoaringBitmap>,
    /// sids per lineage id, closed over the name-prefix relation
    pub sublineage_bitmaps: Vec<RoaringBitmap>,
    /// sids per country id
    pub country_bitmaps: Vec<RoaringBitmap>,
    /// sids per region id
    pub region_bitmaps: Vec<RoaringBitmap>,
}

impl MetaStore {
    /// Create an empty store with the given number of extra columns
    pub fn new(extra_columns: usize) -> Self {
        Self {
            extras: vec![Vec::new(); extra_columns],
            ..Self::default()
        }
    }

    /// Number of stored records
    pub fn len(&self) -> u32 {
        self.sid_to_epi.len() as u32
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.sid_to_epi.is_empty()
    }

    /// Append one record; the new sid is the previous length.
    pub fn push(
        &mut self,
        epi: u64,
        date: i64,
        lineage: u32,
        region: u32,
        country: u32,
        extra_values: &[u32],
    ) -> Result<()> {
        if extra_values.len() != self.extras.len() {
            return Err(Error::Internal(format!(
                "expected {} extra columns, got {}",
                self.extras.len(),
                extra_values.len()
            )));
        }
        self.sid_to_epi.push(epi);
        self.sid_to_date.push(date);
        self.sid_to_lineage.push(lineage);
        self.sid_to_region.push(region);
        self.sid_to_country.push(country);
        for (column, value) in self.extras.iter_mut().zip(extra_values) {
            column.push(*value);
        }
        Ok(())
    }

    /// Precompute all predicate bitmaps.
    ///
    /// The sublineage closure is quadratic in the number of lineages: a
    /// lineage covers every other lineage whose name it string-prefixes.
    /// This relies on lineage names encoding the tree through prefixes,
    /// a precondition on the dictionary.
    pub fn precompute(&mut self, dict: &Dictionary) {
        let sequence_count = self.len();

        let lineage_count = dict.lineage_count() as usize;
        let mut by_lineage: Vec<Vec<u32>> = vec![Vec::new(); lineage_count];
        for sid in 0..sequence_count {
            by_lineage[self.sid_to_lineage[sid as usize] as usize].push(sid);
        }
        self.lineage_bitmaps = by_lineage.iter().map(|sids| sorted_bitmap(sids)).collect();

        let names = dict.lineage_names();
        self.sublineage_bitmaps = (0..lineage_count)
            .map(|l1| {
                let mut closure = by_lineage[l1].clone();
                for l2 in 0..lineage_count {
                    let (n1, n2) = (&names[l1], &names[l2]);
                    if n1.len() < n2.len() && n2.starts_with(n1.as_str()) {
                        closure.extend_from_slice(&by_lineage[l2]);
                    }
                }
                closure.sort_unstable();
                sorted_bitmap(&closure)
            })
            .collect();

        self.country_bitmaps = group_bitmaps(&self.sid_to_country, dict.country_count());
        self.region_bitmaps = group_bitmaps(&self.sid_to_region, dict.region_count());
    }

    /// Bitmap for one lineage id; empty when the id is out of range
    pub fn lineage_bitmap(&self, id: u32) -> Option<&RoaringBitmap> {
        self.lineage_bitmaps.get(id as usize)
    }

    /// Sublineage-closure bitmap for one lineage id
    pub fn sublineage_bitmap(&self, id: u32) -> Option<&RoaringBitmap> {
        self.sublineage_bitmaps.get(id as usize)
    }

    /// Bitmap for one country id
    pub fn country_bitmap(&self, id: u32) -> Option<&RoaringBitmap> {
        self.country_bitmaps.get(id as usize)
    }

    /// Bitmap for one region id
    pub fn region_bitmap(&self, id: u32) -> Option<&RoaringBitmap> {
        self.region_bitmaps.get(id as usize)
    }
}

/// Group a dense id column into one bitmap per id.
fn group_bitmaps(column: &[u32], id_count: u32) -> Vec<RoaringBitmap> {
    let mut groups: Vec<Vec<u32>> = vec![Vec::new(); id_count as usize];
    for (sid, &id) in column.iter().enumerate() {
        groups[id as usize].push(sid as u32);
    }
    groups.iter().map(|sids| sorted_bitmap(sids)).collect()
}

/// Build a bitmap from an ascending sid slice via the append fast path.
fn sorted_bitmap(sids: &[u32]) -> RoaringBitmap {
    let mut bitmap = RoaringBitmap::new();
    // grouping preserves ascending sid order, so append cannot fail
    let _ = bitmap.append(sids.iter().copied());
    bitmap
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three sequences with lineages B, B.1, B.1.17 under one region and
    /// two countries.
    fn sample() -> (MetaStore, Dictionary) {
        let mut dict = Dictionary::new();
        let b = dict.intern_lineage("B");
        let b1 = dict.intern_lineage("B.1");
        let b117 = dict.intern_lineage("B.1.17");
        let eu = dict.intern_region("Europe");
        let ch = dict.intern_country("Switzerland");
        let de = dict.intern_country("Germany");
        dict.intern_column("division");
        let v = dict.intern_value("x");

        let mut store = MetaStore::new(1);
        store.push(100, 0, b, eu, ch, &[v]).unwrap();
        store.push(101, 0, b1, eu, de, &[v]).unwrap();
        store.push(102, 0, b117, eu, ch, &[v]).unwrap();
        store.precompute(&dict);
        (store, dict)
    }

    #[test]
    fn test_lineage_bitmaps() {
        let (store, dict) = sample();
        let b = dict.lineage_id("B").unwrap();
        let b1 = dict.lineage_id("B.1").unwrap();
        assert_eq!(
            store.lineage_bitmap(b).unwrap().iter().collect::<Vec<_>>(),
            vec![0]
        );
        assert_eq!(
            store.lineage_bitmap(b1).unwrap().iter().collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn test_sublineage_closure() {
        let (store, dict) = sample();
        let b = dict.lineage_id("B").unwrap();
        let b1 = dict.lineage_id("B.1").unwrap();
        let b117 = dict.lineage_id("B.1.17").unwrap();
        assert_eq!(
            store.sublineage_bitmap(b).unwrap().iter().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            store.sublineage_bitmap(b1).unwrap().iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            store
                .sublineage_bitmap(b117)
                .unwrap()
                .iter()
                .collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn test_sublineage_superset_invariant() {
        let (store, dict) = sample();
        for id in 0..dict.lineage_count() {
            let lineage = store.lineage_bitmap(id).unwrap();
            let sub = store.sublineage_bitmap(id).unwrap();
            assert!(lineage.is_subset(sub));
        }
    }

    #[test]
    fn test_country_region_bitmaps() {
        let (store, dict) = sample();
        let ch = dict.country_id("Switzerland").unwrap();
        let eu = dict.region_id("Europe").unwrap();
        assert_eq!(
            store.country_bitmap(ch).unwrap().iter().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(
            store.region_bitmap(eu).unwrap().iter().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_each_sid_in_exactly_one_lineage_bitmap() {
        let (store, dict) = sample();
        for sid in 0..store.len() {
            let holders = (0..dict.lineage_count())
                .filter(|&l| store.lineage_bitmap(l).unwrap().contains(sid))
                .count();
            assert_eq!(holders, 1);
        }
    }
}
