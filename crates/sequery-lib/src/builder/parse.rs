//! Chunk input parsing: FASTA sequences and TSV metadata
//!
//! Sequences are read with needletail, which transparently decompresses
//! gzip and xz input discovered by magic bytes. Metadata rows come from
//! tab-separated files with a header row; the external id carries an
//! 8-character prefix that is stripped before integer parsing.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use needletail::parse_fastx_file;

use ahash::AHashMap;

use crate::dictionary::{resolve_alias, Dictionary};
use crate::error::Error;
use crate::meta_store::MetaStore;
use crate::sequence_store::SequenceStore;

/// Sequences are buffered and bulk-inserted in batches of this size.
const SEQUENCE_BATCH: usize = 1024;

/// Length of the external-id prefix stripped before parsing.
const EPI_PREFIX_LEN: usize = 8;

/// One parsed metadata row, borrowed from the record buffer.
pub struct MetaRow<'a> {
    /// External sequence identifier (prefix already stripped)
    pub epi: u64,
    /// Alias-resolved lineage name
    pub lineage: &'a str,
    /// Collection date, epoch seconds
    pub date: i64,
    /// Region name
    pub region: &'a str,
    /// Country name
    pub country: &'a str,
    /// Division name (extra column)
    pub division: &'a str,
}

/// Stream a sequence file into the store, batching bulk inserts.
/// Returns the number of ingested sequences.
pub fn ingest_sequences<P: AsRef<Path>>(path: P, store: &mut SequenceStore) -> Result<u32> {
    let path = path.as_ref();
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("failed to open sequence file {}", path.display()))?;

    let mut batch: Vec<Vec<u8>> = Vec::with_capacity(SEQUENCE_BATCH);
    let mut count = 0u32;
    while let Some(record) = reader.next() {
        let record = record
            .with_context(|| format!("failed to parse sequence record in {}", path.display()))?;
        batch.push(record.seq().into_owned());
        count += 1;
        if batch.len() >= SEQUENCE_BATCH {
            store
                .ingest(&batch)
                .with_context(|| format!("while ingesting {}", path.display()))?;
            batch.clear();
        }
    }
    store
        .ingest(&batch)
        .with_context(|| format!("while ingesting {}", path.display()))?;
    Ok(count)
}

/// Run a callback over every metadata row of a TSV stream.
///
/// The header row is skipped. Lineages are alias-resolved before the
/// callback sees them.
pub fn scan_metadata<R, F>(input: R, aliases: &AHashMap<String, String>, mut callback: F) -> Result<u32>
where
    R: Read,
    F: FnMut(&MetaRow<'_>),
{
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(input);

    let mut count = 0u32;
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("metadata row {}", index + 1))?;
        let field = |i: usize| -> Result<&str> {
            record
                .get(i)
                .ok_or_else(|| anyhow::anyhow!("metadata row {} is missing field {i}", index + 1))
        };

        let epi_raw = field(0)?;
        if epi_raw.len() <= EPI_PREFIX_LEN {
            bail!("metadata row {}: bad external id {epi_raw:?}", index + 1);
        }
        let epi: u64 = epi_raw[EPI_PREFIX_LEN..]
            .parse()
            .with_context(|| format!("metadata row {}: bad external id {epi_raw:?}", index + 1))?;

        let lineage = resolve_alias(aliases, field(1)?);
        let date = parse_date(field(2)?)?;

        callback(&MetaRow {
            epi,
            lineage: &lineage,
            date,
            region: field(3)?,
            country: field(4)?,
            division: field(5)?,
        });
        count += 1;
    }
    Ok(count)
}

/// Stream metadata rows into the store, resolving every categorical
/// field against the frozen dictionary. Returns the row count.
pub fn ingest_metadata<R: Read>(
    input: R,
    aliases: &AHashMap<String, String>,
    dict: &Dictionary,
    store: &mut MetaStore,
) -> Result<u32> {
    let mut error = None;
    let count = scan_metadata(input, aliases, |row| {
        if error.is_some() {
            return;
        }
        let resolved = dict
            .lineage_id(row.lineage)
            .zip(dict.region_id(row.region))
            .zip(dict.country_id(row.country))
            .zip(dict.value_id(row.division));
        match resolved {
            Some((((lineage, region), country), division)) => {
                if let Err(e) = store.push(row.epi, row.date, lineage, region, country, &[division])
                {
                    error = Some(anyhow::Error::from(e));
                }
            }
            None => {
                error = Some(anyhow::anyhow!(
                    "metadata row for id {} names an entry missing from the dictionary",
                    row.epi
                ));
            }
        }
    })?;
    match error {
        Some(error) => Err(error),
        None => Ok(count),
    }
}

/// Parse a `YYYY-MM-DD` date into epoch seconds (midnight UTC).
pub fn parse_date(text: &str) -> std::result::Result<i64, Error> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| Error::BadDate(text.to_owned()))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::BadDate(text.to_owned()))?;
    Ok(midnight.and_utc().timestamp())
}
