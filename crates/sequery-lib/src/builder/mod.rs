//! Build pipeline: from the partitioned on-disk corpus to a database
//!
//! The pipeline has three steps:
//! 1. A sequential dictionary pass over all chunk metadata files,
//!    assigning ids in lexicographic order.
//! 2. Parallel per-partition ingest: each partition reads its chunks'
//!    sequence and metadata files single-threadedly, so no locking is
//!    needed anywhere.
//! 3. Finalization (driven by the database), which flips majority
//!    bitmaps and precomputes the metadata predicate bitmaps.

pub mod parse;

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use ahash::AHashMap;
use anyhow::{bail, Context};
use rayon::prelude::*;
use tracing::info;

use crate::descriptors::{LineageDescriptor, PartitioningDescriptor};
use crate::dictionary::Dictionary;
use crate::error::Result;
use crate::partition::Partition;

/// Extra metadata columns of the input shape, in storage order.
const EXTRA_COLUMNS: [&str; 1] = ["division"];

/// File locations for one build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directory holding the chunk input files
    pub workdir: PathBuf,
    /// Prefix of every chunk file name
    pub part_prefix: String,
    /// Suffix of metadata files
    pub meta_suffix: String,
    /// Suffix of sequence files (`.xz` is probed as a fallback)
    pub seq_suffix: String,
}

impl BuildConfig {
    /// Stem of the input files for chunk `j` of partition `i`
    fn chunk_stem(&self, partition: usize, chunk: usize) -> String {
        format!("{}P{partition}_C{chunk}", self.part_prefix)
    }

    fn meta_path(&self, partition: usize, chunk: usize) -> PathBuf {
        self.workdir
            .join(format!("{}{}", self.chunk_stem(partition, chunk), self.meta_suffix))
    }

    /// Sequence file path, probing for an `.xz`-compressed variant when
    /// the plain file is absent. Decompression itself is transparent.
    fn seq_path(&self, partition: usize, chunk: usize) -> anyhow::Result<PathBuf> {
        let plain = self
            .workdir
            .join(format!("{}{}", self.chunk_stem(partition, chunk), self.seq_suffix));
        if plain.exists() {
            return Ok(plain);
        }
        let compressed = PathBuf::from(format!("{}.xz", plain.display()));
        if compressed.exists() {
            info!("using compressed sequence file {}", compressed.display());
            return Ok(compressed);
        }
        bail!("sequence file {} not found", plain.display());
    }
}

/// The dictionary pass: scan every chunk's metadata, collect the distinct
/// alias-resolved lineages, regions, countries and extra values, and
/// intern them in lexicographic order. Lineage names from the descriptors
/// are included so that chunk lineage lists always resolve.
pub fn build_dictionary(
    config: &BuildConfig,
    part_def: &PartitioningDescriptor,
    pango_def: Option<&LineageDescriptor>,
    aliases: &AHashMap<String, String>,
) -> Result<Dictionary> {
    let mut lineages = BTreeSet::new();
    let mut regions = BTreeSet::new();
    let mut countries = BTreeSet::new();
    let mut values = BTreeSet::new();

    if let Some(pango_def) = pango_def {
        for record in &pango_def.records {
            lineages.insert(record.lineage.clone());
        }
    }
    for partition in &part_def.partitions {
        for chunk in &partition.chunks {
            lineages.extend(chunk.lineages.iter().cloned());
        }
    }

    for (i, partition) in part_def.partitions.iter().enumerate() {
        for j in 0..partition.chunks.len() {
            let path = config.meta_path(i, j);
            let file = File::open(&path)
                .with_context(|| format!("metadata file {} not found", path.display()))?;
            parse::scan_metadata(BufReader::new(file), aliases, |row| {
                lineages.insert(row.lineage.to_owned());
                regions.insert(row.region.to_owned());
                countries.insert(row.country.to_owned());
                values.insert(row.division.to_owned());
            })
            .with_context(|| format!("while scanning {}", path.display()))?;
        }
    }

    let mut dict = Dictionary::new();
    for name in &lineages {
        dict.intern_lineage(name);
    }
    for name in &regions {
        dict.intern_region(name);
    }
    for name in &countries {
        dict.intern_country(name);
    }
    for column in EXTRA_COLUMNS {
        dict.intern_column(column);
    }
    for value in &values {
        dict.intern_value(value);
    }
    info!(
        lineages = dict.lineage_count(),
        regions = dict.region_count(),
        countries = dict.country_count(),
        "dictionary built"
    );
    Ok(dict)
}

/// Ingest all partitions in parallel against the frozen dictionary.
pub fn build_partitions(
    config: &BuildConfig,
    part_def: &PartitioningDescriptor,
    genome_length: usize,
    dict: &Dictionary,
    aliases: &AHashMap<String, String>,
) -> Result<Vec<Partition>> {
    part_def
        .partitions
        .par_iter()
        .enumerate()
        .map(|(i, descriptor)| {
            build_partition(config, i, descriptor, genome_length, dict, aliases)
        })
        .collect()
}

fn build_partition(
    config: &BuildConfig,
    index: usize,
    descriptor: &crate::descriptors::PartitionDescriptor,
    genome_length: usize,
    dict: &Dictionary,
    aliases: &AHashMap<String, String>,
) -> Result<Partition> {
    let mut partition = Partition::new(genome_length, EXTRA_COLUMNS.len(), descriptor.chunks.clone());

    for j in 0..descriptor.chunks.len() {
        let seq_path = config.seq_path(index, j)?;
        let meta_path = config.meta_path(index, j);

        let sequences = parse::ingest_sequences(&seq_path, &mut partition.seq_store)?;
        let metadata = {
            let file = File::open(&meta_path).map_err(|_| {
                crate::error::Error::MissingFile(meta_path.clone())
            })?;
            parse::ingest_metadata(
                BufReader::new(file),
                aliases,
                dict,
                &mut partition.meta_store,
            )
            .map_err(|e| e.context(format!("while ingesting {}", meta_path.display())))?
        };

        if sequences != metadata {
            return Err(crate::error::Error::CountMismatch {
                chunk: config.chunk_stem(index, j),
                sequences,
                metadata,
            });
        }
        partition.sequence_count += sequences;
    }

    info!(
        partition = index,
        sequences = partition.sequence_count,
        "partition ingested"
    );
    Ok(partition)
}
