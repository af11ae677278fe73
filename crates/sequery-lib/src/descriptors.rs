//! Partitioning and lineage descriptors
//!
//! Text-format descriptors shared between the preprocessing layer, the
//! build pipeline and the snapshot directory. The partitioning descriptor
//! lists partitions (`P` lines), their chunks (`C` lines) and each chunk's
//! lineages (`L` lines); the lineage descriptor is a flat
//! `lineage\tcount` table.

use std::io::{BufRead, Write};

use crate::error::{Error, Result};
use crate::partition::Chunk;

/// Descriptor of one partition: its chunks and expected sequence count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Partition name (informational)
    pub name: String,
    /// Expected sequence count
    pub count: u32,
    /// Chunk layout in sid order
    pub chunks: Vec<Chunk>,
}

/// The full partitioning of a corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitioningDescriptor {
    /// Partitions in index order
    pub partitions: Vec<PartitionDescriptor>,
}

/// One lineage with its corpus-wide sequence count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageRecord {
    /// Canonical lineage name
    pub lineage: String,
    /// Number of sequences carrying it
    pub count: u32,
}

/// The corpus lineage table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageDescriptor {
    /// Records in file order
    pub records: Vec<LineageRecord>,
}

/// Write a partitioning descriptor in its text format.
pub fn save_partitioning<W: Write>(pd: &PartitioningDescriptor, out: &mut W) -> Result<()> {
    for partition in &pd.partitions {
        writeln!(
            out,
            "P\t{}\t{}\t{}",
            partition.name,
            partition.chunks.len(),
            partition.count
        )?;
        for chunk in &partition.chunks {
            writeln!(
                out,
                "C\t{}\t{}\t{}\t{}",
                chunk.prefix,
                chunk.lineages.len(),
                chunk.count,
                chunk.offset
            )?;
            for lineage in &chunk.lineages {
                writeln!(out, "L\t{lineage}")?;
            }
        }
    }
    Ok(())
}

/// Parse a partitioning descriptor from its text format.
pub fn load_partitioning<R: BufRead>(input: R) -> Result<PartitioningDescriptor> {
    let mut lines = input.lines();
    let mut descriptor = PartitioningDescriptor::default();

    while let Some(line) = lines.next() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        if fields.next() != Some("P") {
            return Err(Error::BadDescriptor(format!(
                "expected P line, found {line:?}"
            )));
        }
        let name = next_field(&mut fields, &line)?.to_owned();
        let chunk_count: usize = parse_field(&mut fields, &line)?;
        let count: u32 = parse_field(&mut fields, &line)?;

        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let line = lines
                .next()
                .ok_or_else(|| Error::BadDescriptor("truncated chunk list".into()))??;
            let mut fields = line.split('\t');
            if fields.next() != Some("C") {
                return Err(Error::BadDescriptor(format!(
                    "expected C line, found {line:?}"
                )));
            }
            let prefix = next_field(&mut fields, &line)?.to_owned();
            let lineage_count: usize = parse_field(&mut fields, &line)?;
            let count: u32 = parse_field(&mut fields, &line)?;
            let offset: u32 = parse_field(&mut fields, &line)?;

            let mut lineages = Vec::with_capacity(lineage_count);
            for _ in 0..lineage_count {
                let line = lines
                    .next()
                    .ok_or_else(|| Error::BadDescriptor("truncated lineage list".into()))??;
                let lineage = line
                    .strip_prefix("L\t")
                    .ok_or_else(|| Error::BadDescriptor(format!("expected L line, found {line:?}")))?;
                lineages.push(lineage.to_owned());
            }
            chunks.push(Chunk {
                prefix,
                count,
                offset,
                lineages,
            });
        }
        descriptor.partitions.push(PartitionDescriptor {
            name,
            count,
            chunks,
        });
    }
    Ok(descriptor)
}

/// Write a lineage descriptor as `lineage\tcount` lines.
pub fn save_lineages<W: Write>(ld: &LineageDescriptor, out: &mut W) -> Result<()> {
    for record in &ld.records {
        writeln!(out, "{}\t{}", record.lineage, record.count)?;
    }
    Ok(())
}

/// Parse a lineage descriptor.
pub fn load_lineages<R: BufRead>(input: R) -> Result<LineageDescriptor> {
    let mut descriptor = LineageDescriptor::default();
    for line in input.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (lineage, count) = line
            .split_once('\t')
            .ok_or_else(|| Error::BadDescriptor(format!("bad lineage line {line:?}")))?;
        let count: u32 = count
            .parse()
            .map_err(|_| Error::BadDescriptor(format!("bad lineage count in {line:?}")))?;
        descriptor.records.push(LineageRecord {
            lineage: lineage.to_owned(),
            count,
        });
    }
    Ok(descriptor)
}

fn next_field<'a>(fields: &mut std::str::Split<'a, char>, line: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| Error::BadDescriptor(format!("truncated line {line:?}")))
}

fn parse_field<T: std::str::FromStr>(fields: &mut std::str::Split<'_, char>, line: &str) -> Result<T> {
    next_field(fields, line)?
        .parse()
        .map_err(|_| Error::BadDescriptor(format!("bad number in {line:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_partitioning() -> PartitioningDescriptor {
        PartitioningDescriptor {
            partitions: vec![
                PartitionDescriptor {
                    name: "part0".into(),
                    count: 3,
                    chunks: vec![Chunk {
                        prefix: "B.1".into(),
                        count: 3,
                        offset: 0,
                        lineages: vec!["B.1".into(), "B.1.17".into()],
                    }],
                },
                PartitionDescriptor {
                    name: "part1".into(),
                    count: 1,
                    chunks: vec![Chunk {
                        prefix: "A".into(),
                        count: 1,
                        offset: 0,
                        lineages: vec!["A".into()],
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_partitioning_roundtrip() {
        let descriptor = sample_partitioning();
        let mut buf = Vec::new();
        save_partitioning(&descriptor, &mut buf).unwrap();
        let loaded = load_partitioning(buf.as_slice()).unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn test_partitioning_rejects_garbage() {
        assert!(load_partitioning("X\tfoo\n".as_bytes()).is_err());
        assert!(load_partitioning("P\tp0\t1\t5\nL\tB\n".as_bytes()).is_err());
    }

    #[test]
    fn test_lineages_roundtrip() {
        let descriptor = LineageDescriptor {
            records: vec![
                LineageRecord {
                    lineage: "B.1".into(),
                    count: 10,
                },
                LineageRecord {
                    lineage: "B.1.17".into(),
                    count: 2,
                },
            ],
        };
        let mut buf = Vec::new();
        save_lineages(&descriptor, &mut buf).unwrap();
        assert_eq!(load_lineages(buf.as_slice()).unwrap(), descriptor);
    }
}
