//! The database: partitions, reference, dictionary, descriptors
//!
//! Strictly bi-phase: [`Database::build`] (or [`Database::load`]) populates
//! the partitions, [`Database::finalize`] freezes them, and everything
//! afterwards is read-only. Queries may run concurrently; no locking is
//! needed past the freeze.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use rayon::prelude::*;
use tracing::info;

use crate::descriptors::{
    load_lineages, load_partitioning, save_lineages, save_partitioning, LineageDescriptor,
    PartitioningDescriptor,
};
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::partition::Partition;
use crate::serialization::{load_partition, save_partition};
use crate::symbols::Symbol;

/// Bucket width for the dense-bitmap distribution in the detailed report.
const INFO_POSITION_BUCKET: usize = 500;

/// Serialized size above which a position bitmap counts as dense.
const INFO_DENSE_BYTES: u64 = 4096;

/// A read-optimized, partitioned index over one aligned genome corpus.
#[derive(Debug)]
pub struct Database {
    workdir: PathBuf,
    /// Reference sequences; line 0 drives queries and defines `L`
    global_reference: Vec<String>,
    /// Decoded symbols of reference line 0
    reference: Vec<Symbol>,
    /// Lineage alias table from `pango_alias.txt`
    alias_map: AHashMap<String, String>,
    dict: Dictionary,
    partitions: Vec<Partition>,
    pub(crate) part_def: Option<PartitioningDescriptor>,
    pub(crate) pango_def: Option<LineageDescriptor>,
}

impl Database {
    /// Open a working directory: loads `reference_genome.txt` and
    /// `pango_alias.txt`. The database is empty until [`build`] or
    /// [`load`] runs.
    ///
    /// [`build`]: Database::build
    /// [`load`]: Database::load
    pub fn open<P: AsRef<Path>>(workdir: P) -> Result<Self> {
        let workdir = workdir.as_ref().to_path_buf();

        let reference_path = workdir.join("reference_genome.txt");
        let reference_file =
            File::open(&reference_path).map_err(|_| Error::MissingFile(reference_path.clone()))?;
        let mut global_reference = Vec::new();
        for line in BufReader::new(reference_file).lines() {
            global_reference.push(line?);
        }
        let primary = match global_reference.first() {
            Some(line) if !line.is_empty() => line,
            _ => {
                return Err(Error::BadDescriptor(format!(
                    "no genome in {}",
                    reference_path.display()
                )))
            }
        };
        let reference = primary
            .bytes()
            .map(|b| Symbol::from_byte(b).ok_or(Error::BadSymbol(b as char)))
            .collect::<Result<Vec<_>>>()?;

        let alias_path = workdir.join("pango_alias.txt");
        let alias_file =
            File::open(&alias_path).map_err(|_| Error::MissingFile(alias_path.clone()))?;
        let mut alias_map = AHashMap::new();
        for line in BufReader::new(alias_file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (alias, canonical) = line
                .split_once('\t')
                .ok_or_else(|| Error::BadDescriptor(format!("bad alias line {line:?}")))?;
            alias_map.insert(alias.to_owned(), canonical.to_owned());
        }

        info!(
            genome_length = reference.len(),
            aliases = alias_map.len(),
            "opened working directory {}",
            workdir.display()
        );
        Ok(Self {
            workdir,
            global_reference,
            reference,
            alias_map,
            dict: Dictionary::new(),
            partitions: Vec::new(),
            part_def: None,
            pango_def: None,
        })
    }

    /// The fixed genome length `L`
    pub fn genome_length(&self) -> usize {
        self.reference.len()
    }

    /// Decoded reference symbols, position order
    pub fn reference(&self) -> &[Symbol] {
        &self.reference
    }

    /// All reference lines as read from disk
    pub fn global_reference(&self) -> &[String] {
        &self.global_reference
    }

    /// The frozen dictionary
    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    /// The partitions, index order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The lineage alias table
    pub fn alias_map(&self) -> &AHashMap<String, String> {
        &self.alias_map
    }

    /// Ingest the partitioned corpus described by `part_def.txt` in the
    /// working directory, then finalize. Chunk files are located as
    /// `{part_prefix}P{i}_C{j}{suffix}` relative to the working directory.
    pub fn build(&mut self, part_prefix: &str, meta_suffix: &str, seq_suffix: &str) -> Result<()> {
        let part_def_path = self.workdir.join("part_def.txt");
        let part_def_file =
            File::open(&part_def_path).map_err(|_| Error::MissingFile(part_def_path))?;
        let part_def = load_partitioning(BufReader::new(part_def_file))?;

        let pango_def_path = self.workdir.join("pango_def.txt");
        let pango_def = match File::open(&pango_def_path) {
            Ok(file) => Some(load_lineages(BufReader::new(file))?),
            Err(_) => None,
        };

        let config = crate::builder::BuildConfig {
            workdir: self.workdir.clone(),
            part_prefix: part_prefix.to_owned(),
            meta_suffix: meta_suffix.to_owned(),
            seq_suffix: seq_suffix.to_owned(),
        };

        self.dict =
            crate::builder::build_dictionary(&config, &part_def, pango_def.as_ref(), &self.alias_map)?;
        self.partitions = crate::builder::build_partitions(
            &config,
            &part_def,
            self.genome_length(),
            &self.dict,
            &self.alias_map,
        )?;
        self.part_def = Some(part_def);
        self.pango_def = pango_def;

        self.finalize();
        Ok(())
    }

    /// Freeze every partition: flip majority bitmaps and precompute the
    /// metadata predicate bitmaps. Parallel over partitions.
    pub fn finalize(&mut self) {
        let dict = &self.dict;
        self.partitions
            .par_iter_mut()
            .for_each(|partition| partition.finalize(dict));
        info!(partitions = self.partitions.len(), "database finalized");
    }

    /// Write the snapshot: text descriptors plus one binary archive per
    /// partition, written in parallel.
    pub fn save<P: AsRef<Path>>(&self, save_dir: P) -> Result<()> {
        let save_dir = save_dir.as_ref();
        std::fs::create_dir_all(save_dir)?;

        let part_def = self.part_def.as_ref().ok_or_else(|| {
            Error::Internal("cannot save a database without a partitioning descriptor".into())
        })?;

        if let Some(pango_def) = &self.pango_def {
            let mut out = BufWriter::new(File::create(save_dir.join("pango_def.txt"))?);
            save_lineages(pango_def, &mut out)?;
            out.flush()?;
        }
        {
            let mut out = BufWriter::new(File::create(save_dir.join("part_def.txt"))?);
            save_partitioning(part_def, &mut out)?;
            out.flush()?;
        }
        {
            let mut out = BufWriter::new(File::create(save_dir.join("dict.txt"))?);
            self.dict.save(&mut out)?;
            out.flush()?;
        }

        self.partitions
            .par_iter()
            .enumerate()
            .try_for_each(|(i, partition)| -> Result<()> {
                let path = save_dir.join(format!("P{i}.silo"));
                let mut out = BufWriter::new(File::create(path)?);
                save_partition(&mut out, partition)?;
                out.flush()?;
                Ok(())
            })?;

        info!(partitions = self.partitions.len(), "snapshot saved to {}", save_dir.display());
        Ok(())
    }

    /// Load a snapshot written by [`save`](Database::save). Partitions are
    /// read in parallel; any malformed file fails the whole load.
    pub fn load<P: AsRef<Path>>(&mut self, save_dir: P) -> Result<()> {
        let save_dir = save_dir.as_ref();

        let part_def_path = save_dir.join("part_def.txt");
        let part_def_file =
            File::open(&part_def_path).map_err(|_| Error::MissingFile(part_def_path))?;
        let part_def = load_partitioning(BufReader::new(part_def_file))?;

        self.pango_def = match File::open(save_dir.join("pango_def.txt")) {
            Ok(file) => Some(load_lineages(BufReader::new(file))?),
            Err(_) => None,
        };

        let dict_path = save_dir.join("dict.txt");
        let dict_file = File::open(&dict_path).map_err(|_| Error::MissingFile(dict_path))?;
        self.dict = Dictionary::load(BufReader::new(dict_file))?;

        self.partitions = (0..part_def.partitions.len())
            .into_par_iter()
            .map(|i| -> Result<Partition> {
                let path = save_dir.join(format!("P{i}.silo"));
                let file = File::open(&path).map_err(|_| Error::MissingFile(path.clone()))?;
                load_partition(&mut BufReader::new(file))
            })
            .collect::<Result<Vec<_>>>()?;
        self.part_def = Some(part_def);

        info!(partitions = self.partitions.len(), "snapshot loaded from {}", save_dir.display());
        Ok(())
    }

    /// Write the summary report: sequence count and index size.
    pub fn db_info<W: Write>(&self, out: &mut W) -> Result<()> {
        let (sequence_count, total_size) = self
            .partitions
            .par_iter()
            .map(|p| (p.sequence_count as u64, p.seq_store.size_in_bytes()))
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        writeln!(out, "sequence count: {sequence_count}")?;
        writeln!(out, "total size: {total_size}")?;
        Ok(())
    }

    /// Write the detailed report: per-symbol sizes, the distribution of
    /// dense position bitmaps, and each partition's flipped-symbol string.
    pub fn db_info_detailed<W: Write>(&self, out: &mut W) -> Result<()> {
        let size_by_symbol: Vec<u64> = Symbol::ALL
            .par_iter()
            .map(|symbol| {
                self.partitions
                    .iter()
                    .flat_map(|p| p.seq_store.positions())
                    .map(|position| position.bitmaps[symbol.index()].serialized_size() as u64)
                    .sum::<u64>()
            })
            .collect();
        for (symbol, size) in Symbol::ALL.iter().zip(&size_by_symbol) {
            writeln!(out, "size for symbol '{}': {size}", symbol.to_char())?;
        }

        // distribution of dense bitmaps over the genome, split by the
        // symbol class of the bitmap
        let buckets = self.genome_length() / INFO_POSITION_BUCKET + 1;
        let mut dense = vec![0u32; buckets];
        let mut dense_gap = vec![0u32; buckets];
        let mut dense_n = vec![0u32; buckets];
        for partition in &self.partitions {
            for (pos_index, position) in partition.seq_store.positions().iter().enumerate() {
                for symbol in Symbol::ALL {
                    let bytes = position.bitmaps[symbol.index()].serialized_size() as u64;
                    if bytes < INFO_DENSE_BYTES {
                        continue;
                    }
                    let bucket = pos_index / INFO_POSITION_BUCKET;
                    match symbol {
                        Symbol::N => dense_n[bucket] += 1,
                        Symbol::Gap => dense_gap[bucket] += 1,
                        _ => dense[bucket] += 1,
                    }
                }
            }
        }
        writeln!(out, "dense bitmap distribution by position #OTHER (N, -)")?;
        for bucket in 0..buckets {
            writeln!(
                out,
                "pos [{},{}): {} (N: {}, -: {})",
                bucket * INFO_POSITION_BUCKET,
                (bucket + 1) * INFO_POSITION_BUCKET,
                dense[bucket],
                dense_n[bucket],
                dense_gap[bucket]
            )?;
        }

        writeln!(out, "partition flipped symbols:")?;
        for partition in &self.partitions {
            let rendered: String = partition
                .seq_store
                .positions()
                .iter()
                .map(|p| p.flipped_symbol.map_or('o', Symbol::to_char))
                .collect();
            writeln!(out, "{rendered}")?;
        }
        Ok(())
    }

    /// Assemble a database from already-built parts (snapshot loading and
    /// in-memory construction).
    pub fn from_parts(
        workdir: PathBuf,
        global_reference: Vec<String>,
        reference: Vec<Symbol>,
        alias_map: AHashMap<String, String>,
        dict: Dictionary,
        partitions: Vec<Partition>,
    ) -> Self {
        Self {
            workdir,
            global_reference,
            reference,
            alias_map,
            dict,
            partitions,
            part_def: None,
            pango_def: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(reference: &str) -> Self {
        let symbols = reference
            .bytes()
            .map(|b| Symbol::from_byte(b).expect("test reference"))
            .collect();
        Self::from_parts(
            PathBuf::new(),
            vec![reference.to_owned()],
            symbols,
            AHashMap::new(),
            Dictionary::new(),
            Vec::new(),
        )
    }

    #[cfg(test)]
    pub(crate) fn dict_mut(&mut self) -> &mut Dictionary {
        &mut self.dict
    }

    #[cfg(test)]
    pub(crate) fn push_partition_for_tests(&mut self, partition: Partition) {
        self.partitions.push(partition);
    }
}
