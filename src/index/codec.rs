//! Little-endian fixed-width field helpers shared by the index file formats.

use crate::storage::error::{StorageError, StorageResult};
use std::io::{Read, Write};

/// Length of the magic prefix on every index file
pub const MAGIC_LEN: usize = 16;

/// Write `magic` followed by a one-byte version
pub fn write_header<W: Write>(w: &mut W, magic: &[u8; MAGIC_LEN], version: u8) -> StorageResult<()> {
    w.write_all(magic)?;
    w.write_all(&[version])?;
    Ok(())
}

/// Read and check the magic and version, failing on any mismatch
pub fn read_header<R: Read>(
    r: &mut R,
    magic: &[u8; MAGIC_LEN],
    version: u8,
    what: &str,
) -> StorageResult<()> {
    let mut buf = [0u8; MAGIC_LEN];
    r.read_exact(&mut buf)?;
    if &buf != magic {
        return Err(StorageError::InvalidFormat(format!(
            "{}: invalid magic {:?}",
            what, buf
        )));
    }

    let found = read_u8(r)?;
    if found != version {
        return Err(StorageError::InvalidFormat(format!(
            "{}: unsupported version {} (expected {})",
            what, found, version
        )));
    }
    Ok(())
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_f32<W: Write>(w: &mut W, v: f32) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> StorageResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_u8<R: Read>(r: &mut R) -> StorageResult<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32<R: Read>(r: &mut R) -> StorageResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> StorageResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64<R: Read>(r: &mut R) -> StorageResult<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn read_f32<R: Read>(r: &mut R) -> StorageResult<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub fn read_f64<R: Read>(r: &mut R) -> StorageResult<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Bound a decoded element count before allocating for it
pub fn checked_len(count: u64, limit: u64, what: &str) -> StorageResult<usize> {
    if count > limit {
        return Err(StorageError::Corruption(format!(
            "{}: count {} exceeds limit {}",
            what, count, limit
        )));
    }
    usize::try_from(count)
        .map_err(|_| StorageError::Corruption(format!("{}: count {} overflows", what, count)))
}
