//! Record framing for state log segment files.
//!
//! Record format: `[length: 4 bytes LE][crc32c: 4 bytes LE][payload: length bytes]`,
//! where the payload is a bincode-encoded [`LogRecord`].

use confluence_core::PartitionId;

use crate::error::{StateError, StateResult};
use crate::traits::LogRecord;

/// Size of the record header (length + CRC32C).
pub(crate) const RECORD_HEADER_SIZE: usize = 8;

/// Encode one record into a frame ready to append.
pub(crate) fn encode_frame(record: &LogRecord) -> StateResult<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StateError::Codec(format!("record of {} bytes is too large", payload.len())))?;
    let crc = crc32c::crc32c(&payload);

    let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of reading one frame.
#[derive(Debug)]
pub(crate) enum Frame {
    Record(LogRecord),
    Eof,
    /// Partial record at the end of the segment.
    TornWrite { position: u64, reason: String },
}

/// Sequential reader over the bytes of one segment.
pub(crate) struct SegmentReader<'a> {
    partition: &'a PartitionId,
    data: &'a [u8],
    position: usize,
}

impl<'a> SegmentReader<'a> {
    pub(crate) fn new(partition: &'a PartitionId, data: &'a [u8]) -> Self {
        Self {
            partition,
            data,
            position: 0,
        }
    }

    /// Read the next frame. A checksum mismatch is an error; a short tail is
    /// reported as [`Frame::TornWrite`].
    pub(crate) fn read_next(&mut self) -> StateResult<Frame> {
        let remaining = self.data.len() - self.position;
        if remaining == 0 {
            return Ok(Frame::Eof);
        }
        if remaining < RECORD_HEADER_SIZE {
            return Ok(self.torn(format!(
                "incomplete header: only {remaining} bytes remaining, need {RECORD_HEADER_SIZE}"
            )));
        }

        let header = &self.data[self.position..self.position + RECORD_HEADER_SIZE];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if remaining - RECORD_HEADER_SIZE < len {
            return Ok(self.torn(format!(
                "incomplete payload: {} bytes remaining, need {len}",
                remaining - RECORD_HEADER_SIZE
            )));
        }

        let start = self.position + RECORD_HEADER_SIZE;
        let payload = &self.data[start..start + len];
        let actual = crc32c::crc32c(payload);
        if actual != expected {
            return Err(StateError::ChecksumMismatch {
                partition: self.partition.clone(),
                position: self.position as u64,
                expected,
                actual,
            });
        }

        let record: LogRecord = bincode::deserialize(payload)?;
        self.position = start + len;
        Ok(Frame::Record(record))
    }

    fn torn(&self, reason: String) -> Frame {
        Frame::TornWrite {
            position: self.position as u64,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> PartitionId {
        PartitionId::new("t-state", "b", 0)
    }

    #[test]
    fn test_torn_tail_is_reported_not_failed() {
        let mut data = encode_frame(&LogRecord::put(&b"k"[..], &b"v"[..])).unwrap();
        let second = encode_frame(&LogRecord::tombstone(&b"k"[..])).unwrap();
        let good_len = data.len();
        data.extend_from_slice(&second[..second.len() - 1]);

        let p = partition();
        let mut reader = SegmentReader::new(&p, &data);
        assert!(matches!(reader.read_next().unwrap(), Frame::Record(_)));
        match reader.read_next().unwrap() {
            Frame::TornWrite { position, .. } => assert_eq!(position, good_len as u64),
            other => panic!("expected torn write, got {other:?}"),
        }
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut data = encode_frame(&LogRecord::put(&b"k"[..], &b"v"[..])).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;

        let p = partition();
        let mut reader = SegmentReader::new(&p, &data);
        assert!(matches!(
            reader.read_next(),
            Err(StateError::ChecksumMismatch { position: 0, .. })
        ));
    }
}
