// sequery: a read-optimized query engine for aligned genome corpora.
//
// Indexes tens of millions of fixed-length aligned sequences as
// per-position roaring-bitmap fans plus categorical metadata, and answers
// boolean predicate queries with count and mutation-frequency
// aggregations.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod actions;
pub mod builder;
pub mod database;
pub mod descriptors;
pub mod dictionary;
pub mod error;
pub mod evaluate;
pub mod expression;
pub mod meta_store;
pub mod partition;
pub mod query;
pub mod sequence_store;
pub mod serialization;
pub mod symbols;

// Re-export common types at crate root
pub use actions::{execute_count, execute_mutations, MutationProportion};
pub use database::Database;
pub use dictionary::Dictionary;
pub use error::{Error, Result};
pub use evaluate::Filter;
pub use expression::{FilterExpr, NOfStrategy};
pub use meta_store::MetaStore;
pub use partition::{Chunk, Partition};
pub use query::{execute_query, parse_query, QueryAction, QueryResult};
pub use sequence_store::SequenceStore;
pub use symbols::{Symbol, SYMBOL_COUNT};

/// Version information
pub fn version() -> (u8, u8, u8) {
    (0, 1, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
