//! On-disk record framing.
//!
//! ```text
//! [u32 LE payload length][u64 LE queue offset][payload bytes]
//! ```
//!
//! The queue offset is the message's position in the whole queue (gap-free,
//! starting at 0), which lets consumers detect misaligned reads and lets depth
//! be computed without scanning segments.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};

pub const RECORD_HEADER_LEN: u64 = 12;

/// Upper bound on a single payload. Anything larger is treated as corruption.
pub const MAX_RECORD_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl Record {
    /// Bytes this record occupies on disk, header included.
    pub fn framed_len(&self) -> u64 {
        RECORD_HEADER_LEN + self.payload.len() as u64
    }
}

/// Result of reading at one position in a segment.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(Record),
    /// Clean end of data.
    End,
    /// The stream ended part-way through a record.
    Torn,
}

pub fn encode_record(offset: u64, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_BYTES)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record of {} bytes exceeds limit", payload.len()),
            )
        })?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len());
    buf.write_u32::<LittleEndian>(len)?;
    buf.write_u64::<LittleEndian>(offset)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads one record, distinguishing a clean end from a torn tail.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<ReadOutcome> {
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if filled == 0 {
        return Ok(ReadOutcome::End);
    }
    if filled < header.len() {
        return Ok(ReadOutcome::Torn);
    }

    let mut cursor = &header[..];
    let len = cursor.read_u32::<LittleEndian>()?;
    let offset = cursor.read_u64::<LittleEndian>()?;
    if len > MAX_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record length {len} at offset {offset} exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(ReadOutcome::Record(Record { offset, payload })),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Torn),
        Err(err) => Err(err),
    }
}

/// Summary of a full pass over one segment's bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentScan {
    pub records: u64,
    /// Length of the prefix made of complete records.
    pub valid_len: u64,
    pub first_offset: Option<u64>,
    pub last_offset: Option<u64>,
    pub torn: bool,
}

pub fn scan_records<R: Read>(reader: &mut R) -> io::Result<SegmentScan> {
    let mut scan = SegmentScan::default();
    loop {
        match read_record(reader)? {
            ReadOutcome::Record(record) => {
                scan.records += 1;
                scan.valid_len += record.framed_len();
                scan.first_offset.get_or_insert(record.offset);
                scan.last_offset = Some(record.offset);
            }
            ReadOutcome::End => return Ok(scan),
            ReadOutcome::Torn => {
                scan.torn = true;
                return Ok(scan);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(records: &[(u64, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (offset, payload) in records {
            out.extend(encode_record(*offset, payload).expect("encode"));
        }
        out
    }

    #[test]
    fn reads_records_then_clean_end() {
        let bytes = framed(&[(7, b"hello"), (8, b"")]);
        let mut reader = &bytes[..];

        assert_eq!(
            read_record(&mut reader).expect("read"),
            ReadOutcome::Record(Record {
                offset: 7,
                payload: b"hello".to_vec()
            })
        );
        assert_eq!(
            read_record(&mut reader).expect("read"),
            ReadOutcome::Record(Record {
                offset: 8,
                payload: Vec::new()
            })
        );
        assert_eq!(read_record(&mut reader).expect("read"), ReadOutcome::End);
    }

    #[test]
    fn scan_reports_torn_tail_and_valid_prefix() {
        let mut bytes = framed(&[(0, b"abc"), (1, b"defg")]);
        let valid = bytes.len() as u64;
        // Half of a third record: full header, truncated payload.
        bytes.extend(&encode_record(2, b"0123456789").expect("encode")[..16]);

        let scan = scan_records(&mut &bytes[..]).expect("scan");
        assert_eq!(scan.records, 2);
        assert_eq!(scan.valid_len, valid);
        assert_eq!(scan.first_offset, Some(0));
        assert_eq!(scan.last_offset, Some(1));
        assert!(scan.torn);
    }

    #[test]
    fn partial_header_is_torn() {
        let bytes = encode_record(3, b"x").expect("encode");
        assert_eq!(
            read_record(&mut &bytes[..5]).expect("read"),
            ReadOutcome::Torn
        );
    }

    #[test]
    fn oversized_length_is_invalid_data() {
        let mut bytes = Vec::new();
        bytes.extend((MAX_RECORD_BYTES + 1).to_le_bytes());
        bytes.extend(0u64.to_le_bytes());
        let err = read_record(&mut &bytes[..]).expect_err("length above limit");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
