//! Binary codec for log and snapshot records.
//!
//! All data is serialized with:
//! - JSON for data (reuses the contact serde attributes)
//! - Length-prefixed format for framing
//! - CRC32 checksum for corruption detection
//! - Version byte for forward compatibility

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes to identify idrecon files.
pub const MAGIC: [u8; 4] = *b"IDRC";

/// Length of the file header written by [`write_header`].
pub const HEADER_LEN: u64 = 5;

/// Largest record accepted by [`decode`].
const MAX_RECORD_SIZE: usize = 100 * 1024 * 1024;

/// Serializes a value to bytes with checksum.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    let len = u32::try_from(data.len()).map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("record of {} bytes is too large to frame", data.len()),
        )
    })?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Deserializes a value from bytes, verifying checksum.
///
/// # Errors
/// - `UnexpectedEof` if the record is cut short (torn write)
/// - `InvalidData` on version mismatch, oversized length, CRC mismatch, or bad JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"hill valley".to_string()).unwrap();
        encoded[7] ^= 0xFF;

        let result: IoResult<String> = decode(&mut Cursor::new(encoded));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("CRC") || err.to_string().contains("deserialization"));
    }

    #[test]
    fn test_truncated_record_is_unexpected_eof() {
        let encoded = encode(&vec![1u64, 2, 3]).unwrap();
        let cut = encoded[..encoded.len() - 2].to_vec();

        let result: IoResult<Vec<u64>> = decode(&mut Cursor::new(cut));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_record() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&200_000_000u32.to_le_bytes());

        let result: IoResult<String> = decode(&mut Cursor::new(bad));
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_rejects_foreign_file() {
        let result = read_header(&mut Cursor::new(b"KYRO\x01".to_vec()));
        assert!(result.unwrap_err().to_string().contains("invalid magic"));

        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);
    }
}
