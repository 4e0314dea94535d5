//! Chunk frames
//!
//! Format:
//! - 4 bytes: frame length (excluding this field)
//! - 1 byte: value kind
//! - 4 bytes: sample count
//! - N bytes: lz4 compressed bincode samples (size prepended)
//! - 4 bytes: CRC32 checksum of everything after the length field

use crate::{Result, Sample, SplitError, Timestamp, ValueKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Bytes of framing around the payload
const FRAME_OVERHEAD: usize = 4 + 1 + 4 + 4;

/// Reference to one chunk frame in the chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub offset: u64,
    pub len: u32,
    pub kind: ValueKind,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub num_samples: u32,
}

impl ChunkRef {
    /// Offset one past the end of the frame
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// Check if the chunk may hold samples in `[start, end]`
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }
}

/// Encode samples of a single kind into a frame
pub(crate) fn encode(kind: ValueKind, samples: &[Sample]) -> Result<Bytes> {
    debug_assert!(samples.iter().all(|s| s.kind() == kind));
    let raw = bincode::serialize(samples)?;
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + compressed.len());

    // Reserve space for length prefix
    buf.put_u32_le(0);
    buf.put_u8(kind as u8);
    buf.put_u32_le(samples.len() as u32);
    buf.put_slice(&compressed);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

/// Decode a frame, validating its checksum and kind
pub(crate) fn decode(data: &[u8], expected: ValueKind) -> Result<Vec<Sample>> {
    if data.len() < FRAME_OVERHEAD {
        return Err(SplitError::InvalidFormat("Chunk frame too short".into()));
    }

    let mut cursor = std::io::Cursor::new(data);
    let len = cursor.get_u32_le() as usize;
    if data.len() != 4 + len {
        return Err(SplitError::InvalidFormat(format!(
            "Chunk frame length {} does not match reference length {}",
            4 + len,
            data.len()
        )));
    }

    let body = &data[4..data.len() - 4];
    let expected_checksum = (&data[data.len() - 4..]).get_u32_le();
    let actual_checksum = crc32fast::hash(body);
    if expected_checksum != actual_checksum {
        return Err(SplitError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    let mut cursor = std::io::Cursor::new(body);
    let kind = ValueKind::try_from(cursor.get_u8())?;
    if kind != expected {
        return Err(SplitError::Corruption(format!(
            "chunk kind {:?} does not match index kind {:?}",
            kind, expected
        )));
    }
    let count = cursor.get_u32_le() as usize;

    let pos = cursor.position() as usize;
    let raw = lz4_flex::decompress_size_prepended(&body[pos..])
        .map_err(|e| SplitError::Corruption(format!("chunk decompression: {}", e)))?;
    let samples: Vec<Sample> = bincode::deserialize(&raw)?;

    if samples.len() != count || samples.iter().any(|s| s.kind() != kind) {
        return Err(SplitError::Corruption(format!(
            "chunk holds {} samples, header says {} of kind {:?}",
            samples.len(),
            count,
            kind
        )));
    }
    Ok(samples)
}

/// Split a time-ordered run of samples into chunks.
///
/// A new chunk starts whenever the value kind changes or the current chunk
/// reaches `max_samples`.
pub(crate) fn cut(samples: &[Sample], max_samples: usize) -> Vec<&[Sample]> {
    let max_samples = max_samples.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    for i in 1..=samples.len() {
        let boundary = i == samples.len()
            || i - start == max_samples
            || samples[i].kind() != samples[start].kind();
        if boundary {
            chunks.push(&samples[start..i]);
            start = i;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Histogram;

    fn floats(range: std::ops::Range<i64>) -> Vec<Sample> {
        range.map(|t| Sample::Float { t, v: t as f64 }).collect()
    }

    #[test]
    fn test_frame_decode() {
        let samples = floats(0..10);
        let frame = encode(ValueKind::Float, &samples).unwrap();
        assert_eq!(decode(&frame, ValueKind::Float).unwrap(), samples);
    }

    #[test]
    fn test_checksum_validation() {
        let mut frame = encode(ValueKind::Float, &floats(0..10)).unwrap().to_vec();

        // Corrupt the payload
        frame[10] ^= 0xFF;

        let result = decode(&frame, ValueKind::Float);
        assert!(matches!(result, Err(SplitError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_kind_mismatch_is_corruption() {
        let frame = encode(ValueKind::Float, &floats(0..3)).unwrap();
        let result = decode(&frame, ValueKind::Histogram);
        assert!(matches!(result, Err(SplitError::Corruption(_))));
    }

    #[test]
    fn test_cut_on_size_and_kind() {
        let mut samples = floats(0..5);
        samples.push(Sample::Histogram {
            t: 5,
            h: Box::new(Histogram::default()),
        });
        samples.extend(floats(6..8));

        let chunks = cut(&samples, 3);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 2, 1, 2]);
        assert!(cut(&[], 3).is_empty());
    }
}
