//! Transaction log binary framing.
//!
//! ```text
//! record := START_MARKER (16 bytes)  operation_count (u32)  operation*  checksum (u32)  END_MARKER (16 bytes)
//! operation := kind (u8)  file_number (u32)  start (u64)  length (u32)
//! ```
//!
//! `checksum` is a CRC32 over `operation_count`'s bytes followed by every operation's bytes,
//! placed just before `END_MARKER` so a reader can validate a transaction's integrity before
//! trusting it, the way the teacher validates record checksums in its own record codec. Markers
//! are fixed magic values chosen to be vanishingly unlikely to occur inside operation payloads,
//! since `start`/`length`/`file_number` are themselves unconstrained integers.

use std::io;

use bytes::{BufMut, BytesMut};
use snafu::Snafu;

/// Size, in bytes, of one framing marker.
const MARKER_LEN: usize = 16;

pub const START_MARKER: [u8; MARKER_LEN] = *b"DQ_TXN_START\x01\x02\x03\x04";
pub const END_MARKER: [u8; MARKER_LEN] = *b"DQ_TXN_END__\x05\x06\x07\x08";

const OPERATION_LEN: usize = 1 + 4 + 8 + 4;

/// Errors produced by the transaction log codec.
#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(display("transaction log I/O error: {}", source))]
    Io { source: io::Error },

    /// A transaction's checksum did not match its recorded operations.
    #[snafu(display("transaction #{} failed checksum validation", index))]
    ChecksumMismatch { index: u64 },

    /// The log contained unrecognized bytes where a transaction separator was expected.
    #[snafu(display(
        "Unexpected data in transaction log. Expected to get transaction separator but got \
         unknown data. Tx #{}",
        index
    ))]
    UnexpectedData { index: u64 },

    /// The log ended mid-transaction.
    #[snafu(display("transaction log truncated inside transaction #{}", index))]
    Truncated { index: u64 },
}

/// Whether an operation records bytes written or bytes consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Enqueue = 0,
    Dequeue = 1,
}

impl OperationKind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OperationKind::Enqueue),
            1 => Some(OperationKind::Dequeue),
            _ => None,
        }
    }
}

/// One element of a transaction: a byte range written or consumed in a single data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub file_number: u32,
    pub start: u64,
    pub length: u32,
}

impl Operation {
    pub fn enqueue(file_number: u32, start: u64, length: u32) -> Self {
        Operation {
            kind: OperationKind::Enqueue,
            file_number,
            start,
            length,
        }
    }

    pub fn dequeue(file_number: u32, start: u64, length: u32) -> Self {
        Operation {
            kind: OperationKind::Dequeue,
            file_number,
            start,
            length,
        }
    }

    fn write_to(self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.file_number);
        buf.put_u64_le(self.start);
        buf.put_u32_le(self.length);
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < OPERATION_LEN {
            return None;
        }
        let kind = OperationKind::from_u8(bytes[0])?;
        let file_number = u32::from_le_bytes(bytes[1..5].try_into().ok()?);
        let start = u64::from_le_bytes(bytes[5..13].try_into().ok()?);
        let length = u32::from_le_bytes(bytes[13..17].try_into().ok()?);
        Some(Operation {
            kind,
            file_number,
            start,
            length,
        })
    }
}

fn checksum_of(operation_count_bytes: &[u8], operations: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(operation_count_bytes);
    hasher.update(operations);
    hasher.finalize()
}

/// Encodes a full transaction record (including markers and checksum) ready to append to the
/// transaction log.
pub fn encode_transaction(ops: &[Operation]) -> Vec<u8> {
    let op_count = ops.len() as u32;
    let count_bytes = op_count.to_le_bytes();

    let mut op_bytes = BytesMut::with_capacity(ops.len() * OPERATION_LEN);
    for op in ops {
        op.write_to(&mut op_bytes);
    }

    let checksum = checksum_of(&count_bytes, &op_bytes);

    let mut record = BytesMut::with_capacity(MARKER_LEN * 2 + 4 + op_bytes.len() + 4);
    record.extend_from_slice(&START_MARKER);
    record.extend_from_slice(&count_bytes);
    record.extend_from_slice(&op_bytes);
    record.extend_from_slice(&checksum.to_le_bytes());
    record.extend_from_slice(&END_MARKER);
    record.to_vec()
}

/// One decoded transaction plus the offset just past its end in the source buffer.
pub struct DecodedTransaction {
    pub operations: Vec<Operation>,
    pub next_offset: usize,
}

/// Decodes the transaction starting at `offset` in `buf`.
///
/// Returns `Ok(None)` if `offset` is exactly at the end of the buffer (a clean end of log).
/// `index` is the 1-based transaction index, used only for error messages.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] if the buffer ends mid-record, [`CodecError::UnexpectedData`]
/// if a marker doesn't match, or [`CodecError::ChecksumMismatch`] if the operations' checksum is
/// wrong.
pub fn decode_next(
    buf: &[u8],
    offset: usize,
    index: u64,
) -> Result<Option<DecodedTransaction>, CodecError> {
    if offset == buf.len() {
        return Ok(None);
    }

    let mut cursor = offset;

    let take = |cursor: &mut usize, len: usize| -> Result<&[u8], CodecError> {
        if *cursor + len > buf.len() {
            return Err(CodecError::Truncated { index });
        }
        let slice = &buf[*cursor..*cursor + len];
        *cursor += len;
        Ok(slice)
    };

    let start_marker = take(&mut cursor, MARKER_LEN)?;
    if start_marker != START_MARKER {
        return Err(CodecError::UnexpectedData { index });
    }

    let count_bytes = take(&mut cursor, 4)?;
    let count_bytes: [u8; 4] = count_bytes.try_into().expect("length checked above");
    let op_count = u32::from_le_bytes(count_bytes) as usize;

    let ops_start = cursor;
    let ops_bytes = take(&mut cursor, op_count * OPERATION_LEN)?;

    let mut operations = Vec::with_capacity(op_count);
    for chunk in ops_bytes.chunks_exact(OPERATION_LEN) {
        let op = Operation::read_from(chunk).ok_or(CodecError::UnexpectedData { index })?;
        operations.push(op);
    }
    let ops_bytes_owned = buf[ops_start..cursor].to_vec();

    let checksum_bytes = take(&mut cursor, 4)?;
    let checksum_bytes: [u8; 4] = checksum_bytes.try_into().expect("length checked above");
    let recorded_checksum = u32::from_le_bytes(checksum_bytes);
    let expected_checksum = checksum_of(&count_bytes, &ops_bytes_owned);
    if recorded_checksum != expected_checksum {
        return Err(CodecError::ChecksumMismatch { index });
    }

    let end_marker = take(&mut cursor, MARKER_LEN)?;
    if end_marker != END_MARKER {
        return Err(CodecError::UnexpectedData { index });
    }

    Ok(Some(DecodedTransaction {
        operations,
        next_offset: cursor,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_transaction() {
        let ops = vec![
            Operation::enqueue(0, 0, 128),
            Operation::dequeue(0, 0, 128),
        ];
        let record = encode_transaction(&ops);
        let decoded = decode_next(&record, 0, 1).unwrap().unwrap();
        assert_eq!(decoded.operations, ops);
        assert_eq!(decoded.next_offset, record.len());
    }

    #[test]
    fn empty_buffer_is_clean_eof() {
        let buf: Vec<u8> = Vec::new();
        assert!(decode_next(&buf, 0, 1).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_reported() {
        let ops = vec![Operation::enqueue(0, 0, 1)];
        let mut record = encode_transaction(&ops);
        record.truncate(record.len() - 3);
        let result = decode_next(&record, 0, 1);
        assert!(matches!(result, Err(CodecError::Truncated { index: 1 })));
    }

    #[test]
    fn corrupted_checksum_is_reported() {
        let ops = vec![Operation::enqueue(0, 0, 1)];
        let mut record = encode_transaction(&ops);
        let last = record.len() - MARKER_LEN - 1;
        record[last] ^= 0xFF;
        let result = decode_next(&record, 0, 1);
        assert!(matches!(result, Err(CodecError::ChecksumMismatch { index: 1 })));
    }

    #[test]
    fn multiple_transactions_chain() {
        let first = vec![Operation::enqueue(0, 0, 10)];
        let second = vec![Operation::dequeue(0, 0, 10)];
        let mut buf = encode_transaction(&first);
        buf.extend(encode_transaction(&second));

        let decoded1 = decode_next(&buf, 0, 1).unwrap().unwrap();
        assert_eq!(decoded1.operations, first);
        let decoded2 = decode_next(&buf, decoded1.next_offset, 2).unwrap().unwrap();
        assert_eq!(decoded2.operations, second);
        assert!(decode_next(&buf, decoded2.next_offset, 3).unwrap().is_none());
    }
}
