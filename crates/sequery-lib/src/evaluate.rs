//! Expression evaluation against one partition
//!
//! Primitive nodes hand out borrows of index bitmaps wherever possible;
//! only boolean combinators allocate. The owned/borrowed split is carried
//! in [`Filter`], the evaluation result type. Borrowed bitmaps are tied to
//! the partition's lifetime, so the discipline is enforced by the borrow
//! checker; owned bitmaps are released when the filter is dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use roaring::RoaringBitmap;

use crate::dictionary::Dictionary;
use crate::expression::{FilterExpr, NOfStrategy};
use crate::partition::Partition;

/// The result of evaluating a filter expression on one partition.
pub enum Filter<'a> {
    /// A freshly computed bitmap, released on drop
    Owned(RoaringBitmap),
    /// A borrow of an index bitmap; must not outlive its partition
    Borrowed(&'a RoaringBitmap),
}

impl<'a> Filter<'a> {
    /// View the underlying bitmap
    #[inline]
    pub fn as_bitmap(&self) -> &RoaringBitmap {
        match self {
            Filter::Owned(bitmap) => bitmap,
            Filter::Borrowed(bitmap) => bitmap,
        }
    }

    /// Take ownership: steals an owned bitmap, copies a borrowed one
    #[inline]
    pub fn into_owned(self) -> RoaringBitmap {
        match self {
            Filter::Owned(bitmap) => bitmap,
            Filter::Borrowed(bitmap) => bitmap.clone(),
        }
    }

    /// Cardinality of the filter
    #[inline]
    pub fn cardinality(&self) -> u64 {
        self.as_bitmap().len()
    }
}

impl FilterExpr {
    /// Evaluate the expression, yielding the matching sid set.
    ///
    /// Correct with or without prior simplification; unsimplified
    /// flip-affected predicates materialize their complement here instead
    /// of borrowing.
    pub fn evaluate<'p>(&self, dict: &Dictionary, partition: &'p Partition) -> Filter<'p> {
        let store = &partition.seq_store;
        match self {
            FilterExpr::Empty => Filter::Owned(RoaringBitmap::new()),
            FilterExpr::Full => Filter::Owned(store.full_range()),
            FilterExpr::And { children, negated } => {
                evaluate_and(children, negated, dict, partition)
            }
            FilterExpr::Or { children } => evaluate_or(children, dict, partition),
            FilterExpr::NOf {
                children,
                n,
                exactly,
                strategy,
            } => evaluate_nof(children, *n, *exactly, *strategy, dict, partition),
            FilterExpr::Neg(child) => {
                let mut acc = store.full_range();
                acc -= child.evaluate(dict, partition).as_bitmap();
                Filter::Owned(acc)
            }
            FilterExpr::DateBetween { from, to } => {
                let mut sids = RoaringBitmap::new();
                let matching = partition
                    .meta_store
                    .sid_to_date
                    .iter()
                    .enumerate()
                    .filter(|(_, &date)| {
                        from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
                    })
                    .map(|(sid, _)| sid as u32);
                let _ = sids.append(matching);
                Filter::Owned(sids)
            }
            FilterExpr::NucEq {
                position,
                symbol,
                negated,
            } => {
                let Some(pos) = checked_position(*position, partition) else {
                    return Filter::Owned(RoaringBitmap::new());
                };
                if *negated {
                    // set by the simplifier: the stored bitmap already is
                    // the complement of the member set
                    Filter::Borrowed(store.bm(pos, *symbol))
                } else if store.flipped(pos) == Some(*symbol) {
                    let mut acc = store.full_range();
                    acc -= store.bm(pos, *symbol);
                    Filter::Owned(acc)
                } else {
                    Filter::Borrowed(store.bm(pos, *symbol))
                }
            }
            FilterExpr::NucMaybe {
                position,
                symbol,
                negated,
            } => {
                let Some(pos) = checked_position(*position, partition) else {
                    return Filter::Owned(RoaringBitmap::new());
                };
                if *negated {
                    // only reachable via the simplifier, which sets the
                    // flag for exact flipped-symbol matches
                    return Filter::Borrowed(store.bm(pos, *symbol));
                }
                let expansion = symbol.expand();
                match expansion {
                    [single] if store.flipped(pos) != Some(*single) => {
                        Filter::Borrowed(store.bm(pos, *single))
                    }
                    _ => {
                        // resolve flips while composing the union
                        let mut acc = RoaringBitmap::new();
                        for &s in expansion {
                            if store.flipped(pos) == Some(s) {
                                let mut member = store.full_range();
                                member -= store.bm(pos, s);
                                acc |= member;
                            } else {
                                acc |= store.bm(pos, s);
                            }
                        }
                        Filter::Owned(acc)
                    }
                }
            }
            FilterExpr::Lineage {
                id,
                include_sublineages,
            } => {
                let bitmap = id.and_then(|id| {
                    if *include_sublineages {
                        partition.meta_store.sublineage_bitmap(id)
                    } else {
                        partition.meta_store.lineage_bitmap(id)
                    }
                });
                match bitmap {
                    Some(bitmap) => Filter::Borrowed(bitmap),
                    None => Filter::Owned(RoaringBitmap::new()),
                }
            }
            FilterExpr::Country { id } => {
                match id.and_then(|id| partition.meta_store.country_bitmap(id)) {
                    Some(bitmap) => Filter::Borrowed(bitmap),
                    None => Filter::Owned(RoaringBitmap::new()),
                }
            }
            FilterExpr::Region { id } => {
                match id.and_then(|id| partition.meta_store.region_bitmap(id)) {
                    Some(bitmap) => Filter::Borrowed(bitmap),
                    None => Filter::Owned(RoaringBitmap::new()),
                }
            }
            FilterExpr::StrEq { column, value } => {
                let resolved = dict
                    .column_index(column)
                    .zip(dict.value_id(value))
                    .and_then(|(col, val)| {
                        partition
                            .meta_store
                            .extras
                            .get(col as usize)
                            .map(|column| (column, val))
                    });
                let Some((column, val)) = resolved else {
                    return Filter::Owned(RoaringBitmap::new());
                };
                let mut sids = RoaringBitmap::new();
                let matching = column
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v == val)
                    .map(|(sid, _)| sid as u32);
                let _ = sids.append(matching);
                Filter::Owned(sids)
            }
        }
    }
}

/// 1-indexed position check; out-of-range positions evaluate to nothing
/// instead of panicking (bug-class degrade path).
#[inline]
fn checked_position(position: u32, partition: &Partition) -> Option<usize> {
    let pos = position as usize;
    debug_assert!(
        pos >= 1 && pos <= partition.seq_store.genome_length(),
        "position {position} out of range"
    );
    (pos >= 1 && pos <= partition.seq_store.genome_length()).then_some(pos)
}

/// Intersection with subtraction, smallest-first.
///
/// Positive children are intersected in ascending cardinality order so
/// the accumulator shrinks as fast as possible; negated children are
/// subtracted largest-first. Exits as soon as the accumulator drains.
fn evaluate_and<'p>(
    children: &[FilterExpr],
    negated: &[FilterExpr],
    dict: &Dictionary,
    partition: &'p Partition,
) -> Filter<'p> {
    let mut pos: Vec<Filter<'p>> = children
        .iter()
        .map(|c| c.evaluate(dict, partition))
        .collect();
    let mut neg: Vec<Filter<'p>> = negated
        .iter()
        .map(|c| c.evaluate(dict, partition))
        .collect();
    pos.sort_by_key(Filter::cardinality);
    neg.sort_by_key(|f| Reverse(f.cardinality()));

    let mut acc = if pos.is_empty() {
        partition.seq_store.full_range()
    } else {
        pos.remove(0).into_owned()
    };
    for filter in &pos {
        if acc.is_empty() {
            break;
        }
        acc &= filter.as_bitmap();
    }
    for filter in &neg {
        if acc.is_empty() {
            break;
        }
        acc -= filter.as_bitmap();
    }
    Filter::Owned(acc)
}

/// Union, largest-first.
fn evaluate_or<'p>(
    children: &[FilterExpr],
    dict: &Dictionary,
    partition: &'p Partition,
) -> Filter<'p> {
    let mut filters: Vec<Filter<'p>> = children
        .iter()
        .map(|c| c.evaluate(dict, partition))
        .collect();
    filters.sort_by_key(|f| Reverse(f.cardinality()));

    let mut iter = filters.into_iter();
    let mut acc = match iter.next() {
        Some(first) => first.into_owned(),
        None => return Filter::Owned(RoaringBitmap::new()),
    };
    for filter in iter {
        acc |= filter.as_bitmap();
    }
    Filter::Owned(acc)
}

fn evaluate_nof<'p>(
    children: &[FilterExpr],
    n: u32,
    exactly: bool,
    strategy: NOfStrategy,
    dict: &Dictionary,
    partition: &'p Partition,
) -> Filter<'p> {
    let filters: Vec<Filter<'p>> = children
        .iter()
        .map(|c| c.evaluate(dict, partition))
        .collect();

    // thresholds outside [1, k] don't need a counting pass
    if n == 0 {
        if !exactly {
            return Filter::Owned(partition.seq_store.full_range());
        }
        let mut acc = partition.seq_store.full_range();
        for filter in &filters {
            acc -= filter.as_bitmap();
        }
        return Filter::Owned(acc);
    }
    if n as usize > filters.len() {
        return Filter::Owned(RoaringBitmap::new());
    }

    let selected = match strategy {
        NOfStrategy::Naive => nof_naive(&filters, n, exactly, partition.sequence_count),
        NOfStrategy::Merge => nof_merge(&filters, n, exactly),
        NOfStrategy::Heap => nof_heap(&filters, n, exactly),
    };
    Filter::Owned(selected)
}

/// Threshold-sum counting over the whole sid range.
fn nof_naive(filters: &[Filter<'_>], n: u32, exactly: bool, sequence_count: u32) -> RoaringBitmap {
    let mut counts = vec![0u32; sequence_count as usize];
    for filter in filters {
        for sid in filter.as_bitmap() {
            counts[sid as usize] += 1;
        }
    }
    let mut result = RoaringBitmap::new();
    let matching = counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| if exactly { count == n } else { count >= n })
        .map(|(sid, _)| sid as u32);
    let _ = result.append(matching);
    result
}

/// Candidate union of the smallest `k - n + 1` children, then a count
/// pass per candidate. Any sid matching `n` children must occur in at
/// least one of any `k - n + 1` of them.
fn nof_merge(filters: &[Filter<'_>], n: u32, exactly: bool) -> RoaringBitmap {
    let mut order: Vec<&Filter<'_>> = filters.iter().collect();
    order.sort_by_key(|f| f.cardinality());

    let take = filters.len() - n as usize + 1;
    let mut candidates = RoaringBitmap::new();
    for filter in &order[..take] {
        candidates |= filter.as_bitmap();
    }

    let mut result = RoaringBitmap::new();
    let matching = candidates.iter().filter(|&sid| {
        let count = filters
            .iter()
            .filter(|f| f.as_bitmap().contains(sid))
            .count() as u32;
        if exactly {
            count == n
        } else {
            count >= n
        }
    });
    let _ = result.append(matching);
    result
}

/// K-way merge of the child bitmap iterators, counting runs of equal sids.
fn nof_heap(filters: &[Filter<'_>], n: u32, exactly: bool) -> RoaringBitmap {
    let mut iters: Vec<_> = filters.iter().map(|f| f.as_bitmap().iter()).collect();
    let mut heap: BinaryHeap<Reverse<(u32, usize)>> = BinaryHeap::with_capacity(iters.len());
    for (index, iter) in iters.iter_mut().enumerate() {
        if let Some(sid) = iter.next() {
            heap.push(Reverse((sid, index)));
        }
    }

    let mut result = RoaringBitmap::new();
    let mut run: Vec<u32> = Vec::new();
    while let Some(Reverse((sid, index))) = heap.pop() {
        let mut count = 1u32;
        if let Some(next) = iters[index].next() {
            heap.push(Reverse((next, index)));
        }
        while let Some(&Reverse((other, other_index))) = heap.peek() {
            if other != sid {
                break;
            }
            heap.pop();
            count += 1;
            if let Some(next) = iters[other_index].next() {
                heap.push(Reverse((next, other_index)));
            }
        }
        if if exactly { count == n } else { count >= n } {
            run.push(sid);
        }
    }
    let _ = result.append(run.into_iter());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Chunk;
    use crate::symbols::Symbol;

    /// Four sequences over a 4-base genome with dated, lineage-tagged
    /// metadata. Finalize flips the majority base per position.
    fn fixture() -> (Partition, Dictionary) {
        let mut dict = Dictionary::new();
        let b = dict.intern_lineage("B");
        let b1 = dict.intern_lineage("B.1");
        let eu = dict.intern_region("Europe");
        let ch = dict.intern_country("Switzerland");
        let de = dict.intern_country("Germany");
        dict.intern_column("division");
        let basel = dict.intern_value("Basel");
        let bern = dict.intern_value("Bern");

        let chunks = vec![Chunk {
            prefix: "B".into(),
            count: 4,
            offset: 0,
            lineages: vec!["B".into(), "B.1".into()],
        }];
        let mut partition = Partition::new(4, 1, chunks);
        partition
            .seq_store
            .ingest(&[
                b"ACGT".to_vec(),
                b"ACGA".to_vec(),
                b"TCGA".to_vec(),
                b"ACNT".to_vec(),
            ])
            .unwrap();
        // dates: 2020-12-31, 2021-06-01, 2022-01-01, 2021-06-01
        let dates = [1609372800i64, 1622505600, 1640995200, 1622505600];
        partition.meta_store.push(1, dates[0], b, eu, ch, &[basel]).unwrap();
        partition.meta_store.push(2, dates[1], b1, eu, ch, &[bern]).unwrap();
        partition.meta_store.push(3, dates[2], b1, eu, de, &[basel]).unwrap();
        partition.meta_store.push(4, dates[3], b, eu, de, &[bern]).unwrap();
        partition.sequence_count = 4;
        partition.finalize(&dict);
        (partition, dict)
    }

    fn sids(filter: Filter<'_>) -> Vec<u32> {
        filter.as_bitmap().iter().collect()
    }

    fn eval(expr: &FilterExpr, dict: &Dictionary, partition: &Partition) -> Vec<u32> {
        sids(expr.evaluate(dict, partition))
    }

    fn eval_simplified(expr: &FilterExpr, dict: &Dictionary, partition: &Partition) -> Vec<u32> {
        sids(expr.simplify(partition).evaluate(dict, partition))
    }

    fn nuc(position: u32, symbol: Symbol) -> FilterExpr {
        FilterExpr::NucEq {
            position,
            symbol,
            negated: false,
        }
    }

    #[test]
    fn test_nuc_eq_with_and_without_flip() {
        let (partition, dict) = fixture();
        // position 4: A={1,2}, T={0,3}; A is the flipped majority? both
        // have two members, so the tie-break picks A
        assert_eq!(partition.seq_store.flipped(4), Some(Symbol::A));
        assert_eq!(eval(&nuc(4, Symbol::A), &dict, &partition), vec![1, 2]);
        assert_eq!(eval(&nuc(4, Symbol::T), &dict, &partition), vec![0, 3]);
        assert_eq!(
            eval_simplified(&nuc(4, Symbol::A), &dict, &partition),
            vec![1, 2]
        );
    }

    #[test]
    fn test_and_or_neg() {
        let (partition, dict) = fixture();
        let and = FilterExpr::And {
            children: vec![nuc(1, Symbol::A), nuc(4, Symbol::T)],
            negated: vec![],
        };
        assert_eq!(eval(&and, &dict, &partition), vec![0, 3]);
        assert_eq!(eval_simplified(&and, &dict, &partition), vec![0, 3]);

        let and_not = FilterExpr::And {
            children: vec![nuc(1, Symbol::A)],
            negated: vec![nuc(4, Symbol::T)],
        };
        assert_eq!(eval(&and_not, &dict, &partition), vec![1]);

        let or = FilterExpr::Or {
            children: vec![nuc(1, Symbol::T), nuc(4, Symbol::A)],
        };
        assert_eq!(eval(&or, &dict, &partition), vec![1, 2]);

        let neg = FilterExpr::Neg(Box::new(nuc(1, Symbol::T)));
        assert_eq!(eval(&neg, &dict, &partition), vec![0, 1, 3]);
    }

    #[test]
    fn test_and_without_positive_children() {
        let (partition, dict) = fixture();
        let expr = FilterExpr::And {
            children: vec![],
            negated: vec![nuc(1, Symbol::T)],
        };
        assert_eq!(eval(&expr, &dict, &partition), vec![0, 1, 3]);
    }

    #[test]
    fn test_nuc_maybe_expands_ambiguity() {
        let (partition, dict) = fixture();
        // position 3: G={0,1,2}, N={3}; W expands to A or T and matches
        // nothing, R expands to A or G
        let w = FilterExpr::NucMaybe {
            position: 3,
            symbol: Symbol::W,
            negated: false,
        };
        assert_eq!(eval(&w, &dict, &partition), Vec::<u32>::new());
        let r = FilterExpr::NucMaybe {
            position: 3,
            symbol: Symbol::R,
            negated: false,
        };
        // G is flipped at position 3; the union must resolve it
        assert_eq!(partition.seq_store.flipped(3), Some(Symbol::G));
        assert_eq!(eval(&r, &dict, &partition), vec![0, 1, 2]);
        assert_eq!(eval_simplified(&r, &dict, &partition), vec![0, 1, 2]);
    }

    #[test]
    fn test_date_between() {
        let (partition, dict) = fixture();
        // [2021-01-01, 2021-12-31]
        let expr = FilterExpr::DateBetween {
            from: Some(1609459200),
            to: Some(1640908800),
        };
        assert_eq!(eval(&expr, &dict, &partition), vec![1, 3]);
        let open_from = FilterExpr::DateBetween {
            from: None,
            to: Some(1609459200),
        };
        assert_eq!(eval(&open_from, &dict, &partition), vec![0]);
    }

    #[test]
    fn test_lineage_country_region() {
        let (partition, dict) = fixture();
        let b = FilterExpr::Lineage {
            id: dict.lineage_id("B"),
            include_sublineages: false,
        };
        assert_eq!(eval(&b, &dict, &partition), vec![0, 3]);
        let b_sub = FilterExpr::Lineage {
            id: dict.lineage_id("B"),
            include_sublineages: true,
        };
        assert_eq!(eval(&b_sub, &dict, &partition), vec![0, 1, 2, 3]);
        let ch = FilterExpr::Country {
            id: dict.country_id("Switzerland"),
        };
        assert_eq!(eval(&ch, &dict, &partition), vec![0, 1]);
        let eu = FilterExpr::Region {
            id: dict.region_id("Europe"),
        };
        assert_eq!(eval(&eu, &dict, &partition), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_str_eq() {
        let (partition, dict) = fixture();
        let expr = FilterExpr::StrEq {
            column: "division".into(),
            value: "Basel".into(),
        };
        assert_eq!(eval(&expr, &dict, &partition), vec![0, 2]);
        let unknown = FilterExpr::StrEq {
            column: "division".into(),
            value: "Nowhere".into(),
        };
        assert_eq!(eval(&unknown, &dict, &partition), Vec::<u32>::new());
    }

    #[test]
    fn test_nof_strategies_agree() {
        let (partition, dict) = fixture();
        let children = vec![
            nuc(1, Symbol::A),         // {0,1,3}
            nuc(4, Symbol::A),         // {1,2}
            FilterExpr::Country {
                id: dict.country_id("Germany"),
            },                          // {2,3}
        ];
        for n in 0..=4u32 {
            for exactly in [false, true] {
                let reference = eval(
                    &FilterExpr::NOf {
                        children: children.clone(),
                        n,
                        exactly,
                        strategy: NOfStrategy::Naive,
                    },
                    &dict,
                    &partition,
                );
                for strategy in [NOfStrategy::Merge, NOfStrategy::Heap] {
                    let got = eval(
                        &FilterExpr::NOf {
                            children: children.clone(),
                            n,
                            exactly,
                            strategy,
                        },
                        &dict,
                        &partition,
                    );
                    assert_eq!(got, reference, "n={n} exactly={exactly} {strategy:?}");
                }
            }
        }
    }

    #[test]
    fn test_nof_expected_sets() {
        let (partition, dict) = fixture();
        let children = vec![nuc(1, Symbol::A), nuc(4, Symbol::A)];
        // counts: sid0 -> 1, sid1 -> 2, sid2 -> 1, sid3 -> 1
        let at_least_one = FilterExpr::NOf {
            children: children.clone(),
            n: 1,
            exactly: false,
            strategy: NOfStrategy::Naive,
        };
        assert_eq!(eval(&at_least_one, &dict, &partition), vec![0, 1, 2, 3]);
        let exactly_one = FilterExpr::NOf {
            children,
            n: 1,
            exactly: true,
            strategy: NOfStrategy::Naive,
        };
        assert_eq!(eval(&exactly_one, &dict, &partition), vec![0, 2, 3]);
    }

    #[test]
    fn test_simplify_preserves_semantics() {
        let (partition, dict) = fixture();
        let exprs = vec![
            FilterExpr::Neg(Box::new(FilterExpr::Neg(Box::new(nuc(4, Symbol::A))))),
            FilterExpr::And {
                children: vec![FilterExpr::Full, nuc(1, Symbol::A)],
                negated: vec![FilterExpr::Empty],
            },
            FilterExpr::Or {
                children: vec![FilterExpr::Empty, nuc(3, Symbol::G)],
            },
            FilterExpr::NOf {
                children: vec![nuc(1, Symbol::A), nuc(4, Symbol::A), FilterExpr::Full],
                n: 2,
                exactly: false,
                strategy: NOfStrategy::Merge,
            },
            FilterExpr::NucMaybe {
                position: 3,
                symbol: Symbol::G,
                negated: false,
            },
        ];
        for expr in exprs {
            assert_eq!(
                eval(&expr, &dict, &partition),
                eval_simplified(&expr, &dict, &partition),
                "simplify changed semantics of {expr:?}"
            );
        }
    }

    #[test]
    fn test_flip_neutrality() {
        // the same corpus evaluated before and after finalize yields
        // identical results for flip-affected queries
        let mut dict = Dictionary::new();
        let b = dict.intern_lineage("B");
        dict.intern_region("Europe");
        dict.intern_country("Switzerland");
        let genomes = [b"ACGT".to_vec(), b"ACGA".to_vec(), b"TCGA".to_vec()];

        let build = |finalize: bool| {
            let mut partition = Partition::new(4, 0, vec![]);
            partition.seq_store.ingest(&genomes).unwrap();
            for epi in 0..3 {
                partition.meta_store.push(epi, 0, b, 0, 0, &[]).unwrap();
            }
            partition.sequence_count = 3;
            if finalize {
                partition.finalize(&dict);
            }
            partition
        };
        let raw = build(false);
        let finalized = build(true);

        for position in 1..=4u32 {
            for symbol in [Symbol::A, Symbol::C, Symbol::G, Symbol::T, Symbol::R] {
                let eq = nuc(position, symbol);
                let maybe = FilterExpr::NucMaybe {
                    position,
                    symbol,
                    negated: false,
                };
                for expr in [eq, maybe] {
                    assert_eq!(
                        eval(&expr, &dict, &raw),
                        eval_simplified(&expr, &dict, &finalized),
                        "{expr:?}"
                    );
                }
            }
        }
    }
}
