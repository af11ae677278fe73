//! Binary snapshot serialization for partitions
//!
//! Each partition archive (`P<i>.silo`) starts with a magic number and a
//! format version, followed by the metadata store, the sequence store,
//! the sequence count, the chunk list, and the sorted lineage ids, in
//! that order. All integers are little-endian; strings and vectors are
//! length-prefixed with a `u64`; bitmaps are a `u64` byte size followed
//! by the portable roaring blob. Loads refuse a mismatched major version
//! with a clear error and never expose partial state.

use std::io::{Read, Write};

use roaring::RoaringBitmap;

use crate::error::{Error, Result};
use crate::meta_store::MetaStore;
use crate::partition::{Chunk, Partition};
use crate::sequence_store::{Position, SequenceStore};
use crate::symbols::{Symbol, SYMBOL_COUNT};

/// Magic bytes of a partition archive
const MAGIC: &[u8; 8] = b"SQPART01";

/// Archive format version: (major, minor). Major bumps break readers.
const FORMAT_VERSION: (u32, u32) = (1, 0);

/// Sentinel byte for "no flipped symbol" at a position
const NO_FLIP: u8 = 0xFF;

/// Write one partition archive.
pub fn save_partition<W: Write>(out: &mut W, partition: &Partition) -> Result<()> {
    out.write_all(MAGIC)?;
    write_u32(out, FORMAT_VERSION.0)?;
    write_u32(out, FORMAT_VERSION.1)?;

    write_meta_store(out, &partition.meta_store)?;
    write_sequence_store(out, &partition.seq_store)?;
    write_u32(out, partition.sequence_count)?;
    write_u64(out, partition.chunks.len() as u64)?;
    for chunk in &partition.chunks {
        write_chunk(out, chunk)?;
    }
    write_u32_vec(out, &partition.sorted_lineages)?;
    Ok(())
}

/// Read one partition archive, verifying magic and version.
pub fn load_partition<R: Read>(input: &mut R) -> Result<Partition> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::SnapshotFormat(
            "bad magic number in partition archive".into(),
        ));
    }
    let major = read_u32(input)?;
    let minor = read_u32(input)?;
    if major != FORMAT_VERSION.0 {
        return Err(Error::SnapshotFormat(format!(
            "incompatible archive version {major}.{minor}, expected {}.{}",
            FORMAT_VERSION.0, FORMAT_VERSION.1
        )));
    }

    let meta_store = read_meta_store(input)?;
    let seq_store = read_sequence_store(input)?;
    let sequence_count = read_u32(input)?;
    let chunk_count = read_u64(input)? as usize;
    let mut chunks = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        chunks.push(read_chunk(input)?);
    }
    let sorted_lineages = read_u32_vec(input)?;

    Ok(Partition {
        sequence_count,
        chunks,
        seq_store,
        meta_store,
        sorted_lineages,
    })
}

fn write_meta_store<W: Write>(out: &mut W, store: &MetaStore) -> Result<()> {
    write_u64_vec(out, &store.sid_to_epi)?;
    write_i64_vec(out, &store.sid_to_date)?;
    write_u32_vec(out, &store.sid_to_lineage)?;
    write_u32_vec(out, &store.sid_to_region)?;
    write_u32_vec(out, &store.sid_to_country)?;
    write_u64(out, store.extras.len() as u64)?;
    for column in &store.extras {
        write_u32_vec(out, column)?;
    }
    write_bitmap_vec(out, &store.lineage_bitmaps)?;
    write_bitmap_vec(out, &store.sublineage_bitmaps)?;
    write_bitmap_vec(out, &store.country_bitmaps)?;
    write_bitmap_vec(out, &store.region_bitmaps)?;
    Ok(())
}

fn read_meta_store<R: Read>(input: &mut R) -> Result<MetaStore> {
    let sid_to_epi = read_u64_vec(input)?;
    let sid_to_date = read_i64_vec(input)?;
    let sid_to_lineage = read_u32_vec(input)?;
    let sid_to_region = read_u32_vec(input)?;
    let sid_to_country = read_u32_vec(input)?;
    let column_count = read_u64(input)? as usize;
    let mut extras = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        extras.push(read_u32_vec(input)?);
    }
    Ok(MetaStore {
        sid_to_epi,
        sid_to_date,
        sid_to_lineage,
        sid_to_region,
        sid_to_country,
        extras,
        lineage_bitmaps: read_bitmap_vec(input)?,
        sublineage_bitmaps: read_bitmap_vec(input)?,
        country_bitmaps: read_bitmap_vec(input)?,
        region_bitmaps: read_bitmap_vec(input)?,
    })
}

fn write_sequence_store<W: Write>(out: &mut W, store: &SequenceStore) -> Result<()> {
    write_u64(out, store.genome_length() as u64)?;
    write_u32(out, store.sequence_count())?;
    for position in store.positions() {
        let flip = position
            .flipped_symbol
            .map_or(NO_FLIP, |s| s.index() as u8);
        out.write_all(&[flip])?;
        for bitmap in &position.bitmaps {
            write_bitmap(out, bitmap)?;
        }
    }
    Ok(())
}

fn read_sequence_store<R: Read>(input: &mut R) -> Result<SequenceStore> {
    let genome_length = read_u64(input)? as usize;
    let sequence_count = read_u32(input)?;
    let mut positions = Vec::with_capacity(genome_length);
    for _ in 0..genome_length {
        let mut flip = [0u8; 1];
        input.read_exact(&mut flip)?;
        let flipped_symbol = match flip[0] {
            NO_FLIP => None,
            index => {
                let symbol = Symbol::from_index(index as usize).ok_or_else(|| {
                    Error::SnapshotFormat(format!("bad flipped-symbol byte {index}"))
                })?;
                if !symbol.is_canonical() {
                    return Err(Error::SnapshotFormat(format!(
                        "non-canonical flipped symbol '{}'",
                        symbol.to_char()
                    )));
                }
                Some(symbol)
            }
        };
        let mut bitmaps = Vec::with_capacity(SYMBOL_COUNT);
        for _ in 0..SYMBOL_COUNT {
            bitmaps.push(read_bitmap(input)?);
        }
        let bitmaps: [RoaringBitmap; SYMBOL_COUNT] = bitmaps
            .try_into()
            .map_err(|_| Error::SnapshotFormat("truncated position record".into()))?;
        positions.push(Position {
            bitmaps,
            flipped_symbol,
        });
    }
    Ok(SequenceStore::from_parts(positions, sequence_count))
}

fn write_chunk<W: Write>(out: &mut W, chunk: &Chunk) -> Result<()> {
    write_string(out, &chunk.prefix)?;
    write_u32(out, chunk.count)?;
    write_u32(out, chunk.offset)?;
    write_u64(out, chunk.lineages.len() as u64)?;
    for lineage in &chunk.lineages {
        write_string(out, lineage)?;
    }
    Ok(())
}

fn read_chunk<R: Read>(input: &mut R) -> Result<Chunk> {
    let prefix = read_string(input)?;
    let count = read_u32(input)?;
    let offset = read_u32(input)?;
    let lineage_count = read_u64(input)? as usize;
    let mut lineages = Vec::with_capacity(lineage_count);
    for _ in 0..lineage_count {
        lineages.push(read_string(input)?);
    }
    Ok(Chunk {
        prefix,
        count,
        offset,
        lineages,
    })
}

// --- primitives ---

fn write_u32<W: Write>(out: &mut W, value: u32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u64<W: Write>(out: &mut W, value: u64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_string<W: Write>(out: &mut W, value: &str) -> Result<()> {
    write_u64(out, value.len() as u64)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = read_u64(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::SnapshotFormat("non-UTF-8 string".into()))
}

fn write_u32_vec<W: Write>(out: &mut W, values: &[u32]) -> Result<()> {
    write_u64(out, values.len() as u64)?;
    for &value in values {
        write_u32(out, value)?;
    }
    Ok(())
}

fn read_u32_vec<R: Read>(input: &mut R) -> Result<Vec<u32>> {
    let len = read_u64(input)? as usize;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_u32(input)?);
    }
    Ok(values)
}

fn write_u64_vec<W: Write>(out: &mut W, values: &[u64]) -> Result<()> {
    write_u64(out, values.len() as u64)?;
    for &value in values {
        write_u64(out, value)?;
    }
    Ok(())
}

fn read_u64_vec<R: Read>(input: &mut R) -> Result<Vec<u64>> {
    let len = read_u64(input)? as usize;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_u64(input)?);
    }
    Ok(values)
}

fn write_i64_vec<W: Write>(out: &mut W, values: &[i64]) -> Result<()> {
    write_u64(out, values.len() as u64)?;
    for &value in values {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_i64_vec<R: Read>(input: &mut R) -> Result<Vec<i64>> {
    let len = read_u64(input)? as usize;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf)?;
        values.push(i64::from_le_bytes(buf));
    }
    Ok(values)
}

/// Write a bitmap as `u64` size plus the portable roaring blob.
fn write_bitmap<W: Write>(out: &mut W, bitmap: &RoaringBitmap) -> Result<()> {
    write_u64(out, bitmap.serialized_size() as u64)?;
    bitmap.serialize_into(&mut *out)?;
    Ok(())
}

/// Read a bitmap written by [`write_bitmap`].
fn read_bitmap<R: Read>(input: &mut R) -> Result<RoaringBitmap> {
    let size = read_u64(input)? as usize;
    let mut buf = vec![0u8; size];
    input.read_exact(&mut buf)?;
    RoaringBitmap::deserialize_from(buf.as_slice())
        .map_err(|e| Error::SnapshotFormat(format!("bad bitmap blob: {e}")))
}

fn write_bitmap_vec<W: Write>(out: &mut W, bitmaps: &[RoaringBitmap]) -> Result<()> {
    write_u64(out, bitmaps.len() as u64)?;
    for bitmap in bitmaps {
        write_bitmap(out, bitmap)?;
    }
    Ok(())
}

fn read_bitmap_vec<R: Read>(input: &mut R) -> Result<Vec<RoaringBitmap>> {
    let len = read_u64(input)? as usize;
    let mut bitmaps = Vec::with_capacity(len);
    for _ in 0..len {
        bitmaps.push(read_bitmap(input)?);
    }
    Ok(bitmaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::Dictionary;

    fn sample_partition() -> (Partition, Dictionary) {
        let mut dict = Dictionary::new();
        let b = dict.intern_lineage("B");
        let b1 = dict.intern_lineage("B.1");
        dict.intern_region("Europe");
        dict.intern_country("Switzerland");
        dict.intern_column("division");
        let v = dict.intern_value("Basel");

        let chunks = vec![Chunk {
            prefix: "B".into(),
            count: 2,
            offset: 0,
            lineages: vec!["B".into(), "B.1".into()],
        }];
        let mut partition = Partition::new(4, 1, chunks);
        partition
            .seq_store
            .ingest(&[b"ACGT".to_vec(), b"ACGA".to_vec()])
            .unwrap();
        partition.meta_store.push(7, 1622505600, b, 0, 0, &[v]).unwrap();
        partition.meta_store.push(8, 1640995200, b1, 0, 0, &[v]).unwrap();
        partition.sequence_count = 2;
        partition.finalize(&dict);
        (partition, dict)
    }

    #[test]
    fn test_partition_roundtrip() {
        let (partition, _) = sample_partition();
        let mut buf = Vec::new();
        save_partition(&mut buf, &partition).unwrap();
        let loaded = load_partition(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.sequence_count, partition.sequence_count);
        assert_eq!(loaded.chunks, partition.chunks);
        assert_eq!(loaded.sorted_lineages, partition.sorted_lineages);
        assert_eq!(loaded.meta_store.sid_to_epi, partition.meta_store.sid_to_epi);
        assert_eq!(loaded.meta_store.sid_to_date, partition.meta_store.sid_to_date);
        assert_eq!(loaded.meta_store.extras, partition.meta_store.extras);
        assert_eq!(
            loaded.meta_store.lineage_bitmaps,
            partition.meta_store.lineage_bitmaps
        );
        assert_eq!(
            loaded.meta_store.sublineage_bitmaps,
            partition.meta_store.sublineage_bitmaps
        );

        let (a, b) = (&loaded.seq_store, &partition.seq_store);
        assert_eq!(a.genome_length(), b.genome_length());
        assert_eq!(a.sequence_count(), b.sequence_count());
        for pos in 1..=a.genome_length() {
            assert_eq!(a.flipped(pos), b.flipped(pos));
            for s in Symbol::ALL {
                assert_eq!(a.bm(pos, s), b.bm(pos, s), "pos {pos} symbol {s:?}");
            }
        }
    }

    #[test]
    fn test_bad_magic_refused() {
        let err = load_partition(&mut b"NOTMAGIC".as_slice()).unwrap_err();
        assert!(matches!(err, Error::SnapshotFormat(_)));
    }

    #[test]
    fn test_version_mismatch_refused() {
        let (partition, _) = sample_partition();
        let mut buf = Vec::new();
        save_partition(&mut buf, &partition).unwrap();
        // bump the major version field
        buf[8] = 99;
        let err = load_partition(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::SnapshotFormat(_)));
    }
}
