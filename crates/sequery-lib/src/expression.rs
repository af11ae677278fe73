//! Filter expression tree and its algebraic simplifier
//!
//! A closed sum of node kinds, rewritten and evaluated by exhaustive case
//! analysis. [`FilterExpr::simplify`] is a pure bottom-up rewrite
//! parameterized by one partition: it folds partition-local knowledge
//! (absent lineages, per-position flipped symbols) into the tree, flattens
//! nested boolean nodes, and short-circuits on constant children. Every
//! rewrite is sound on its own partition; none depends on global
//! cardinalities that could differ across partitions.
//!
//! Flip-awareness lives entirely here: when a nucleotide predicate targets
//! the flipped symbol of its position, the node is rewritten into a `Neg`
//! around itself with an internal `negated` marker, so that evaluation can
//! hand out the stored (complemented) bitmap as a cheap borrow and the
//! `Neg` fuses into the surrounding boolean algebra.

use chrono::DateTime;

use crate::dictionary::Dictionary;
use crate::partition::Partition;
use crate::symbols::Symbol;

/// Evaluation strategy hint for [`FilterExpr::NOf`].
///
/// All strategies produce identical results; the hint trades memory for
/// candidate pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NOfStrategy {
    /// Per-sid counter array over the whole partition range
    #[default]
    Naive,
    /// Union the smallest `k - n + 1` children as candidates, then count
    Merge,
    /// K-way heap merge over the child bitmap iterators
    Heap,
}

/// One node of a filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Matches nothing
    Empty,
    /// Matches every sid of the partition
    Full,
    /// Intersection of `children` minus the union of `negated`
    And {
        /// Positive conjuncts
        children: Vec<FilterExpr>,
        /// Subtracted disjuncts
        negated: Vec<FilterExpr>,
    },
    /// Union of children
    Or {
        /// Disjuncts
        children: Vec<FilterExpr>,
    },
    /// Sids matching at least (or exactly) `n` of the children
    NOf {
        /// Candidate children
        children: Vec<FilterExpr>,
        /// Match threshold
        n: u32,
        /// Require exactly `n` instead of at least `n`
        exactly: bool,
        /// Evaluation strategy hint
        strategy: NOfStrategy,
    },
    /// Complement within the partition's sid range
    Neg(Box<FilterExpr>),
    /// Date interval, inclusive; `None` bounds are open
    DateBetween {
        /// Earliest admitted date (epoch seconds)
        from: Option<i64>,
        /// Latest admitted date (epoch seconds)
        to: Option<i64>,
    },
    /// Exact symbol at a 1-indexed genome position
    NucEq {
        /// 1-indexed position
        position: u32,
        /// Queried symbol
        symbol: Symbol,
        /// Set by the simplifier when the stored bitmap is complemented;
        /// the node then denotes the complement of its member set
        negated: bool,
    },
    /// Approximate symbol match at a 1-indexed genome position
    NucMaybe {
        /// 1-indexed position
        position: u32,
        /// Queried symbol, expanded through its ambiguity set
        symbol: Symbol,
        /// Same contract as the flag on the exact-match node
        negated: bool,
    },
    /// Lineage membership, optionally closed over sublineages.
    /// `id == None` records a dictionary miss.
    Lineage {
        /// Lineage id, `None` for an unknown name
        id: Option<u32>,
        /// Use the sublineage closure bitmap
        include_sublineages: bool,
    },
    /// Country membership; `None` records a dictionary miss
    Country {
        /// Country id
        id: Option<u32>,
    },
    /// Region membership; `None` records a dictionary miss
    Region {
        /// Region id
        id: Option<u32>,
    },
    /// Equality on a free-form extra column; evaluated by a per-sid scan
    StrEq {
        /// Extra-column name
        column: String,
        /// Required value
        value: String,
    },
}

impl FilterExpr {
    /// Rewrite the expression for one partition. Pure; the result
    /// evaluates to the same sid set as `self` on that partition.
    pub fn simplify(&self, partition: &Partition) -> FilterExpr {
        match self {
            FilterExpr::Empty => FilterExpr::Empty,
            FilterExpr::Full => FilterExpr::Full,
            FilterExpr::And { children, negated } => simplify_and(children, negated, partition),
            FilterExpr::Or { children } => simplify_or(children, partition),
            FilterExpr::NOf {
                children,
                n,
                exactly,
                strategy,
            } => simplify_nof(children, *n, *exactly, *strategy, partition),
            FilterExpr::Neg(child) => match child.simplify(partition) {
                FilterExpr::Neg(inner) => *inner,
                FilterExpr::Empty => FilterExpr::Full,
                FilterExpr::Full => FilterExpr::Empty,
                other => FilterExpr::Neg(Box::new(other)),
            },
            FilterExpr::DateBetween { from, to } => FilterExpr::DateBetween {
                from: *from,
                to: *to,
            },
            FilterExpr::NucEq {
                position,
                symbol,
                negated,
            } => {
                if !position_in_range(*position, partition) {
                    return FilterExpr::Empty;
                }
                let node = FilterExpr::NucEq {
                    position: *position,
                    symbol: *symbol,
                    negated: *negated,
                };
                if !negated && partition.seq_store.flipped(*position as usize) == Some(*symbol) {
                    FilterExpr::Neg(Box::new(FilterExpr::NucEq {
                        position: *position,
                        symbol: *symbol,
                        negated: true,
                    }))
                } else {
                    node
                }
            }
            FilterExpr::NucMaybe {
                position,
                symbol,
                negated,
            } => {
                if !position_in_range(*position, partition) {
                    return FilterExpr::Empty;
                }
                let node = FilterExpr::NucMaybe {
                    position: *position,
                    symbol: *symbol,
                    negated: *negated,
                };
                if !negated && partition.seq_store.flipped(*position as usize) == Some(*symbol) {
                    FilterExpr::Neg(Box::new(FilterExpr::NucMaybe {
                        position: *position,
                        symbol: *symbol,
                        negated: true,
                    }))
                } else {
                    node
                }
            }
            FilterExpr::Lineage {
                id,
                include_sublineages,
            } => match id {
                None => FilterExpr::Empty,
                Some(id) if !include_sublineages && !partition.contains_lineage(*id) => {
                    FilterExpr::Empty
                }
                Some(id) => FilterExpr::Lineage {
                    id: Some(*id),
                    include_sublineages: *include_sublineages,
                },
            },
            FilterExpr::Country { id: None } => FilterExpr::Empty,
            FilterExpr::Country { id } => FilterExpr::Country { id: *id },
            FilterExpr::Region { id: None } => FilterExpr::Empty,
            FilterExpr::Region { id } => FilterExpr::Region { id: *id },
            FilterExpr::StrEq { column, value } => FilterExpr::StrEq {
                column: column.clone(),
                value: value.clone(),
            },
        }
    }

    /// Human-readable rendering; id-bearing nodes resolve names through
    /// the dictionary.
    pub fn format(&self, dict: &Dictionary) -> String {
        match self {
            FilterExpr::Empty => "FALSE".to_owned(),
            FilterExpr::Full => "TRUE".to_owned(),
            FilterExpr::And { children, negated } => {
                let mut out = String::from("(");
                for child in children {
                    out.push_str(" & ");
                    out.push_str(&child.format(dict));
                }
                for child in negated {
                    out.push_str(" &! ");
                    out.push_str(&child.format(dict));
                }
                out.push(')');
                out
            }
            FilterExpr::Or { children } => {
                let parts: Vec<String> = children.iter().map(|c| c.format(dict)).collect();
                format!("({})", parts.join(" | "))
            }
            FilterExpr::NOf {
                children, n, exactly, ..
            } => {
                let parts: Vec<String> = children.iter().map(|c| c.format(dict)).collect();
                let head = if *exactly { "exactly-" } else { "" };
                format!("[{head}{n}-of: {}]", parts.join(", "))
            }
            FilterExpr::Neg(child) => format!("!{}", child.format(dict)),
            FilterExpr::DateBetween { from, to } => {
                format!("[date {}..{}]", format_date(*from), format_date(*to))
            }
            FilterExpr::NucEq {
                position,
                symbol,
                negated,
            } => {
                let bang = if *negated { "!" } else { "" };
                format!("{bang}{position}{}", symbol.to_char())
            }
            FilterExpr::NucMaybe {
                position,
                symbol,
                negated,
            } => {
                let bang = if *negated { "!" } else { "" };
                format!("{bang}?{position}{}", symbol.to_char())
            }
            FilterExpr::Lineage {
                id,
                include_sublineages,
            } => {
                let name = id
                    .and_then(|id| dict.lineage_name(id))
                    .unwrap_or("<unknown>");
                if *include_sublineages {
                    format!("{name}.*")
                } else {
                    name.to_owned()
                }
            }
            FilterExpr::Country { id } => format!(
                "country={}",
                id.and_then(|id| dict.country_name(id)).unwrap_or("<unknown>")
            ),
            FilterExpr::Region { id } => format!(
                "region={}",
                id.and_then(|id| dict.region_name(id)).unwrap_or("<unknown>")
            ),
            FilterExpr::StrEq { column, value } => format!("{column}={value}"),
        }
    }
}

/// 1-indexed position bounds check against the partition's genome length.
fn position_in_range(position: u32, partition: &Partition) -> bool {
    position >= 1 && position as usize <= partition.seq_store.genome_length()
}

fn simplify_and(
    children: &[FilterExpr],
    negated: &[FilterExpr],
    partition: &Partition,
) -> FilterExpr {
    let mut pos = Vec::new();
    let mut neg = Vec::new();
    for child in children {
        match child.simplify(partition) {
            FilterExpr::Empty => return FilterExpr::Empty,
            FilterExpr::Full => {}
            FilterExpr::And {
                children: inner,
                negated: inner_neg,
            } => {
                pos.extend(inner);
                neg.extend(inner_neg);
            }
            FilterExpr::Neg(inner) => neg.push(*inner),
            other => pos.push(other),
        }
    }
    for child in negated {
        match child.simplify(partition) {
            // subtracting everything leaves nothing
            FilterExpr::Full => return FilterExpr::Empty,
            FilterExpr::Empty => {}
            FilterExpr::Neg(inner) => pos.push(*inner),
            other => neg.push(other),
        }
    }
    if pos.is_empty() && neg.is_empty() {
        FilterExpr::Full
    } else if pos.len() == 1 && neg.is_empty() {
        pos.pop().unwrap()
    } else {
        FilterExpr::And {
            children: pos,
            negated: neg,
        }
    }
}

fn simplify_or(children: &[FilterExpr], partition: &Partition) -> FilterExpr {
    let mut out = Vec::new();
    for child in children {
        match child.simplify(partition) {
            FilterExpr::Full => return FilterExpr::Full,
            FilterExpr::Empty => {}
            FilterExpr::Or { children: inner } => out.extend(inner),
            other => out.push(other),
        }
    }
    match out.len() {
        0 => FilterExpr::Empty,
        1 => out.pop().unwrap(),
        _ => FilterExpr::Or { children: out },
    }
}

fn simplify_nof(
    children: &[FilterExpr],
    n: u32,
    exactly: bool,
    strategy: NOfStrategy,
    partition: &Partition,
) -> FilterExpr {
    // EMPTY children never contribute a match; FULL children contribute
    // one match to every sid, so they lower the threshold instead.
    let mut kept = Vec::new();
    let mut full_children = 0u32;
    for child in children {
        match child.simplify(partition) {
            FilterExpr::Empty => {}
            FilterExpr::Full => full_children += 1,
            other => kept.push(other),
        }
    }

    if exactly && full_children > n {
        return FilterExpr::Empty;
    }
    let n = n.saturating_sub(full_children);

    if n == 0 {
        if !exactly {
            return FilterExpr::Full;
        }
        // exactly zero of the remaining children
        return match kept.len() {
            0 => FilterExpr::Full,
            _ => FilterExpr::Neg(Box::new(FilterExpr::Or { children: kept })),
        };
    }
    if n as usize > kept.len() {
        return FilterExpr::Empty;
    }
    if n == 1 && kept.len() == 1 {
        return kept.pop().unwrap();
    }
    FilterExpr::NOf {
        children: kept,
        n,
        exactly,
        strategy,
    }
}

fn format_date(value: Option<i64>) -> String {
    match value {
        None => "unbound".to_owned(),
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| secs.to_string()),
    }
}
