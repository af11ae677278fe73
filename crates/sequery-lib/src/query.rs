//! Query parsing and execution
//!
//! Queries arrive as JSON documents with an `action` and a `filter`. The
//! parser maps the filter tree onto [`FilterExpr`], resolving dictionary
//! ids on the way; unknown lineage, country and region names parse
//! successfully and are folded to the empty filter during per-partition
//! simplification. Malformed documents surface as
//! [`Error::QueryParse`](crate::Error::QueryParse) and never cross a
//! query boundary.

use std::io::Write;
use std::time::Instant;

use rayon::prelude::*;
use serde_json::{json, Value};
use tracing::debug;

use crate::actions::{execute_count, execute_mutations};
use crate::builder::parse::parse_date;
use crate::database::Database;
use crate::dictionary::resolve_alias;
use crate::error::{Error, Result};
use crate::evaluate::Filter;
use crate::expression::{FilterExpr, NOfStrategy};
use crate::symbols::Symbol;

/// The aggregation to run over the matching set.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAction {
    /// Count the matching sequences
    Count,
    /// Per-position mutation proportions above a threshold
    Mutations {
        /// Minimum reported proportion
        min_proportion: f64,
    },
}

/// Result envelope of one executed query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// The response document, as written to the result writer
    pub return_message: String,
    /// Time spent parsing the query text, microseconds
    pub parse_micros: u64,
    /// Time spent in simplify + evaluate across partitions, microseconds
    pub filter_micros: u64,
    /// Time spent in the action fold, microseconds
    pub action_micros: u64,
}

/// Parse a JSON query document into an action and a filter tree.
pub fn parse_query(db: &Database, text: &str) -> Result<(QueryAction, FilterExpr)> {
    let document: Value =
        serde_json::from_str(text).map_err(|e| Error::QueryParse(format!("bad JSON: {e}")))?;
    let action = parse_action(
        document
            .get("action")
            .ok_or_else(|| Error::QueryParse("missing \"action\"".into()))?,
    )?;
    let filter = parse_filter(
        db,
        document
            .get("filter")
            .ok_or_else(|| Error::QueryParse("missing \"filter\"".into()))?,
    )?;
    Ok((action, filter))
}

fn parse_action(value: &Value) -> Result<QueryAction> {
    match type_of(value)? {
        "Count" => Ok(QueryAction::Count),
        "Mutations" => {
            let min_proportion = match value.get("minProportion") {
                None => 0.0,
                Some(v) => v
                    .as_f64()
                    .ok_or_else(|| Error::QueryParse("minProportion must be a number".into()))?,
            };
            if !(0.0..=1.0).contains(&min_proportion) {
                return Err(Error::QueryParse(format!(
                    "minProportion {min_proportion} out of [0, 1]"
                )));
            }
            Ok(QueryAction::Mutations { min_proportion })
        }
        other => Err(Error::QueryParse(format!("unknown action {other:?}"))),
    }
}

fn parse_filter(db: &Database, value: &Value) -> Result<FilterExpr> {
    match type_of(value)? {
        "True" => Ok(FilterExpr::Full),
        "False" => Ok(FilterExpr::Empty),
        "And" => Ok(FilterExpr::And {
            children: parse_children(db, value)?,
            negated: Vec::new(),
        }),
        "Or" => Ok(FilterExpr::Or {
            children: parse_children(db, value)?,
        }),
        "Not" => {
            let child = value
                .get("child")
                .ok_or_else(|| Error::QueryParse("Not requires \"child\"".into()))?;
            Ok(FilterExpr::Neg(Box::new(parse_filter(db, child)?)))
        }
        "NOf" => {
            let n = value
                .get("n")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::QueryParse("NOf requires a numeric \"n\"".into()))?;
            let exactly = optional_bool(value, "exactly")?;
            let strategy = match value.get("strategy").and_then(Value::as_str) {
                None | Some("naive") => NOfStrategy::Naive,
                Some("merge") => NOfStrategy::Merge,
                Some("heap") => NOfStrategy::Heap,
                Some(other) => {
                    return Err(Error::QueryParse(format!("unknown NOf strategy {other:?}")))
                }
            };
            Ok(FilterExpr::NOf {
                children: parse_children(db, value)?,
                n: n as u32,
                exactly,
                strategy,
            })
        }
        "DateBetween" => {
            let bound = |key: &str| -> Result<Option<i64>> {
                match value.get(key) {
                    None | Some(Value::Null) => Ok(None),
                    Some(Value::String(text)) => {
                        parse_date(text).map(Some).map_err(|e| match e {
                            Error::BadDate(d) => Error::QueryParse(format!("bad date {d:?}")),
                            other => other,
                        })
                    }
                    Some(_) => Err(Error::QueryParse(format!("{key} must be a date string"))),
                }
            };
            Ok(FilterExpr::DateBetween {
                from: bound("from")?,
                to: bound("to")?,
            })
        }
        "NucleotideEquals" => {
            let (position, symbol) = parse_position_symbol(db, value)?;
            Ok(FilterExpr::NucEq {
                position,
                symbol,
                negated: false,
            })
        }
        "NucleotideMaybe" => {
            let (position, symbol) = parse_position_symbol(db, value)?;
            Ok(FilterExpr::NucMaybe {
                position,
                symbol,
                negated: false,
            })
        }
        "PangoLineage" => {
            let name = required_str(value, "lineage")?;
            let resolved = resolve_alias(db.alias_map(), name);
            Ok(FilterExpr::Lineage {
                id: db.dict().lineage_id(&resolved),
                include_sublineages: optional_bool(value, "includeSublineages")?,
            })
        }
        "Country" => Ok(FilterExpr::Country {
            id: db.dict().country_id(required_str(value, "country")?),
        }),
        "Region" => Ok(FilterExpr::Region {
            id: db.dict().region_id(required_str(value, "region")?),
        }),
        "StringEquals" => Ok(FilterExpr::StrEq {
            column: required_str(value, "column")?.to_owned(),
            value: required_str(value, "value")?.to_owned(),
        }),
        other => Err(Error::QueryParse(format!("unknown filter type {other:?}"))),
    }
}

fn type_of(value: &Value) -> Result<&str> {
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::QueryParse("node without a \"type\" string".into()))
}

fn parse_children(db: &Database, value: &Value) -> Result<Vec<FilterExpr>> {
    value
        .get("children")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::QueryParse("node requires a \"children\" array".into()))?
        .iter()
        .map(|child| parse_filter(db, child))
        .collect()
}

fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::QueryParse(format!("node requires a string {key:?}")))
}

fn optional_bool(value: &Value, key: &str) -> Result<bool> {
    match value.get(key) {
        None => Ok(false),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| Error::QueryParse(format!("{key} must be a boolean"))),
    }
}

fn parse_position_symbol(db: &Database, value: &Value) -> Result<(u32, Symbol)> {
    let position = value
        .get("position")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::QueryParse("node requires a numeric \"position\"".into()))?;
    if position < 1 || position > db.genome_length() as u64 {
        return Err(Error::QueryParse(format!(
            "position {position} out of range [1, {}]",
            db.genome_length()
        )));
    }
    let symbol_text = required_str(value, "symbol")?;
    let symbol = match symbol_text.as_bytes() {
        [byte] => Symbol::from_byte(*byte),
        _ => None,
    }
    .ok_or_else(|| Error::QueryParse(format!("unknown symbol {symbol_text:?}")))?;
    Ok((position as u32, symbol))
}

/// Parse, filter and aggregate: the full query path.
///
/// The response document goes to `result_out`, timings and the filter
/// rendering to `perf_out`; both are also carried in the returned
/// [`QueryResult`].
pub fn execute_query<W1: Write, W2: Write>(
    db: &Database,
    query: &str,
    result_out: &mut W1,
    perf_out: &mut W2,
) -> Result<QueryResult> {
    let started = Instant::now();
    let (action, filter) = parse_query(db, query)?;
    let parse_micros = started.elapsed().as_micros() as u64;
    debug!("query parsed: {}", filter.format(db.dict()));

    let started = Instant::now();
    let partition_filters: Vec<Filter<'_>> = db
        .partitions()
        .par_iter()
        .map(|partition| filter.simplify(partition).evaluate(db.dict(), partition))
        .collect();
    let filter_micros = started.elapsed().as_micros() as u64;

    let started = Instant::now();
    let response = match action {
        QueryAction::Count => {
            let count = execute_count(db, partition_filters);
            json!({ "count": count })
        }
        QueryAction::Mutations { min_proportion } => {
            let mutations = execute_mutations(db, partition_filters, min_proportion);
            let rows: Vec<Value> = mutations
                .iter()
                .map(|m| {
                    json!({
                        "position": m.position,
                        "mutFrom": m.from.to_string(),
                        "mutTo": m.to.to_string(),
                        "count": m.count,
                        "proportion": m.proportion,
                    })
                })
                .collect();
            Value::Array(rows)
        }
    };
    let action_micros = started.elapsed().as_micros() as u64;

    let return_message = response.to_string();
    writeln!(result_out, "{return_message}")?;
    writeln!(perf_out, "filter: {}", filter.format(db.dict()))?;
    writeln!(
        perf_out,
        "parse: {parse_micros}us, filter: {filter_micros}us, action: {action_micros}us"
    )?;

    Ok(QueryResult {
        return_message,
        parse_micros,
        filter_micros,
        action_micros,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    fn fixture() -> Database {
        let mut db = Database::for_tests("ACGT");
        let dict = db.dict_mut();
        let b = dict.intern_lineage("B");
        let b1 = dict.intern_lineage("B.1");
        let eu = dict.intern_region("Europe");
        let ch = dict.intern_country("Switzerland");
        dict.intern_column("division");
        let v = dict.intern_value("Basel");

        let mut partition = Partition::new(4, 1, vec![]);
        partition
            .seq_store
            .ingest(&[b"ACGT".to_vec(), b"ACGA".to_vec()])
            .unwrap();
        partition.meta_store.push(1, 0, b, eu, ch, &[v]).unwrap();
        partition
            .meta_store
            .push(2, 1622505600, b1, eu, ch, &[v])
            .unwrap();
        partition.sequence_count = 2;
        db.push_partition_for_tests(partition);
        db.finalize();
        db
    }

    fn run(db: &Database, query: &str) -> QueryResult {
        let mut result = Vec::new();
        let mut perf = Vec::new();
        execute_query(db, query, &mut result, &mut perf).unwrap()
    }

    #[test]
    fn test_count_query() {
        let db = fixture();
        let result = run(
            &db,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "NucleotideEquals", "position": 4, "symbol": "A"}}"#,
        );
        assert_eq!(result.return_message, r#"{"count":1}"#);
    }

    #[test]
    fn test_boolean_query() {
        let db = fixture();
        let result = run(
            &db,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "And", "children": [
                    {"type": "PangoLineage", "lineage": "B", "includeSublineages": true},
                    {"type": "Not", "child":
                        {"type": "NucleotideEquals", "position": 4, "symbol": "A"}}]}}"#,
        );
        assert_eq!(result.return_message, r#"{"count":1}"#);
    }

    #[test]
    fn test_unknown_lineage_folds_to_empty() {
        let db = fixture();
        let result = run(
            &db,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "PangoLineage", "lineage": "XBB.1.5"}}"#,
        );
        assert_eq!(result.return_message, r#"{"count":0}"#);
    }

    #[test]
    fn test_date_between_query() {
        let db = fixture();
        let result = run(
            &db,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "DateBetween",
                           "from": "2021-01-01", "to": "2021-12-31"}}"#,
        );
        assert_eq!(result.return_message, r#"{"count":1}"#);
    }

    #[test]
    fn test_mutations_query() {
        let db = fixture();
        let result = run(
            &db,
            r#"{"action": {"type": "Mutations", "minProportion": 0.0},
                "filter": {"type": "True"}}"#,
        );
        // position 4: one A among two T-reference calls
        let parsed: Value = serde_json::from_str(&result.return_message).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["position"], 4);
        assert_eq!(rows[0]["mutFrom"], "T");
        assert_eq!(rows[0]["mutTo"], "A");
        assert_eq!(rows[0]["proportion"], 0.5);
    }

    #[test]
    fn test_parse_errors_are_query_parse() {
        let db = fixture();
        let cases = [
            "not json at all",
            r#"{"filter": {"type": "True"}}"#,
            r#"{"action": {"type": "Count"}, "filter": {"type": "Wat"}}"#,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "NucleotideEquals", "position": 9, "symbol": "A"}}"#,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "NucleotideEquals", "position": 1, "symbol": "ZZ"}}"#,
            r#"{"action": {"type": "Count"},
                "filter": {"type": "DateBetween", "from": "not-a-date"}}"#,
        ];
        for query in cases {
            let mut result = Vec::new();
            let mut perf = Vec::new();
            let err = execute_query(&db, query, &mut result, &mut perf).unwrap_err();
            assert!(matches!(err, Error::QueryParse(_)), "query {query:?}");
        }
    }
}
