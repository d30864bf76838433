//! FAISS `IndexFlatL2` binary layout.
//!
//! ```text
//! "IxF2"            fourcc
//! d: i32            dimension
//! ntotal: i64       vector count
//! 2 x i64           legacy header fields (always 1 << 20)
//! is_trained: u8
//! metric_type: i32  1 = L2
//! n: u64            number of floats that follow (ntotal * d)
//! n x f32           row-major vectors
//! ```
//!
//! Everything is little-endian.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{FlatIndexError, FlatL2Index, Result};

const FOURCC_FLAT_L2: [u8; 4] = *b"IxF2";
const METRIC_L2: i32 = 1;
const LEGACY_HEADER_FIELD: i64 = 1 << 20;

pub(crate) fn write_index<W: Write>(index: &FlatL2Index, mut writer: W) -> Result<()> {
    let dim = i32::try_from(index.dim())
        .map_err(|_| FlatIndexError::Corrupt(format!("dimension {} overflows i32", index.dim())))?;
    writer.write_all(&FOURCC_FLAT_L2)?;
    writer.write_i32::<LittleEndian>(dim)?;
    writer.write_i64::<LittleEndian>(index.ntotal() as i64)?;
    writer.write_i64::<LittleEndian>(LEGACY_HEADER_FIELD)?;
    writer.write_i64::<LittleEndian>(LEGACY_HEADER_FIELD)?;
    writer.write_u8(1)?;
    writer.write_i32::<LittleEndian>(METRIC_L2)?;
    writer.write_u64::<LittleEndian>(index.as_slice().len() as u64)?;
    for &value in index.as_slice() {
        writer.write_f32::<LittleEndian>(value)?;
    }
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_index<R: Read>(mut reader: R) -> Result<FlatL2Index> {
    let mut fourcc = [0u8; 4];
    reader.read_exact(&mut fourcc).map_err(truncated("fourcc"))?;
    if fourcc != FOURCC_FLAT_L2 {
        return Err(FlatIndexError::UnsupportedIndexType(
            String::from_utf8_lossy(&fourcc).into_owned(),
        ));
    }

    let dim = reader
        .read_i32::<LittleEndian>()
        .map_err(truncated("dimension"))?;
    let ntotal = reader
        .read_i64::<LittleEndian>()
        .map_err(truncated("ntotal"))?;
    for _ in 0..2 {
        reader
            .read_i64::<LittleEndian>()
            .map_err(truncated("header"))?;
    }
    let _is_trained = reader.read_u8().map_err(truncated("header"))?;
    let metric = reader
        .read_i32::<LittleEndian>()
        .map_err(truncated("metric type"))?;
    if metric != METRIC_L2 {
        return Err(FlatIndexError::UnsupportedMetric(metric));
    }

    let dim = usize::try_from(dim)
        .ok()
        .filter(|&d| d > 0)
        .ok_or_else(|| FlatIndexError::Corrupt(format!("invalid dimension {dim}")))?;
    let ntotal = usize::try_from(ntotal)
        .map_err(|_| FlatIndexError::Corrupt(format!("invalid vector count {ntotal}")))?;
    let expected = ntotal
        .checked_mul(dim)
        .ok_or_else(|| FlatIndexError::Corrupt("vector payload size overflows".to_string()))?;

    let count = reader
        .read_u64::<LittleEndian>()
        .map_err(truncated("payload length"))?;
    if count != expected as u64 {
        return Err(FlatIndexError::Corrupt(format!(
            "payload holds {count} floats but header promises {ntotal} x {dim}"
        )));
    }

    // The header is untrusted: only buffer the bytes that are actually there.
    let byte_len = count
        .checked_mul(4)
        .ok_or_else(|| FlatIndexError::Corrupt("vector payload size overflows".to_string()))?;
    let mut bytes = Vec::new();
    reader.take(byte_len).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != byte_len {
        return Err(FlatIndexError::Corrupt(format!(
            "file ends inside vector payload ({} of {byte_len} bytes)",
            bytes.len()
        )));
    }
    let mut data = vec![0f32; expected];
    LittleEndian::read_f32_into(&bytes, &mut data);
    Ok(FlatL2Index::from_parts(dim, data))
}

fn truncated(section: &'static str) -> impl Fn(io::Error) -> FlatIndexError {
    move |err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FlatIndexError::Corrupt(format!("file ends inside {section}"))
        } else {
            FlatIndexError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_faiss_layout() {
        let mut index = FlatL2Index::new(2).unwrap();
        index.add(&[1.0, 2.0]).unwrap();
        let mut bytes = Vec::new();
        index.write_to(&mut bytes).unwrap();

        assert_eq!(&bytes[0..4], b"IxF2");
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1);
        assert_eq!(bytes[32], 1);
        assert_eq!(i32::from_le_bytes(bytes[33..37].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(bytes[37..45].try_into().unwrap()), 2);
        assert_eq!(bytes.len(), 45 + 2 * 4);
    }

    #[test]
    fn rejects_inner_product_index() {
        let mut bytes = b"IxFI".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let err = FlatL2Index::read_from(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, FlatIndexError::UnsupportedIndexType(ref t) if t == "IxFI"));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut index = FlatL2Index::new(3).unwrap();
        index.add(&[0.5; 9]).unwrap();
        let mut bytes = Vec::new();
        index.write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 5);
        let err = FlatL2Index::read_from(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, FlatIndexError::Corrupt(_)), "{err}");
    }

    #[test]
    fn huge_header_without_payload_is_corrupt() {
        let count: i64 = 1 << 42;
        let mut bytes = b"IxF2".to_vec();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(&LEGACY_HEADER_FIELD.to_le_bytes());
        bytes.extend_from_slice(&LEGACY_HEADER_FIELD.to_le_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&METRIC_L2.to_le_bytes());
        bytes.extend_from_slice(&(count as u64).to_le_bytes());
        assert_eq!(bytes.len(), 45);

        let err = FlatL2Index::read_from(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, FlatIndexError::Corrupt(_)), "{err}");
    }
}
