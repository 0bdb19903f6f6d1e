//! Shared flat-file block framing used by the AWS and HET media handlers
//! (spec.md §4.1, §6: AWSTAPE-family flat files).
//!
//! Every physical record on an AWS/HET-backed tape image is preceded by a
//! small fixed header giving the current and previous record lengths plus
//! a flag byte; a record with the tapemark flag set and zero length is a
//! filemark rather than a data block. HET layers an optional per-block
//! compression flag on top of the same header.
//!
//! Grounded on `pbs-tape/src/sg_tape.rs`'s filemark-via-sentinel-error
//! idiom (`BlockReadError::EndOfFile`) and `pbs-tape/src/tape_read.rs`'s
//! `BlockRead` trait, applied here to a length-prefixed flat-file record
//! instead of a SCSI variable-block command (see DESIGN.md for the full
//! rationale -- not wire-compatible with any real AWSTAPE/HET file).

use std::io::{Read, Write};

use proxmox_io::ReadExt;

use crate::error::BlockReadError;

const HEADER_LEN: usize = 6;

/// Block-header flag bits (flags1 byte).
pub mod flags1 {
    /// This record is a tapemark (no data follows).
    pub const TAPEMARK: u8 = 0b0100_0000;
    /// This record continues a previous chunked block (HET chunking).
    pub const ENDREC: u8 = 0b0010_0000;
    /// This record starts a fresh chunked block (HET chunking).
    pub const NEWREC: u8 = 0b1000_0000;
}

/// Block-header flag bits (flags2 byte, HET only).
pub mod flags2 {
    /// The following record payload is compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;
}

/// The 6-byte record header preceding every block/tapemark on an
/// AWS-family flat file: current length, previous length, two flag bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHeader {
    pub curblkl: u16,
    pub prvblkl: u16,
    pub flags1: u8,
    pub flags2: u8,
}

impl BlockHeader {
    pub fn is_tapemark(&self) -> bool {
        self.flags1 & flags1::TAPEMARK != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags2 & flags2::COMPRESSED != 0
    }

    /// Returns `Ok(None)` on a clean end-of-stream (no bytes at all read),
    /// distinguishing it from a header truncated mid-way.
    fn read_from(r: &mut impl Read) -> Result<Option<Self>, BlockReadError> {
        let mut bytes = [0u8; HEADER_LEN];
        if !r.read_exact_or_eof(&mut bytes)? {
            return Ok(None);
        }
        Ok(Some(BlockHeader {
            curblkl: u16::from_le_bytes([bytes[0], bytes[1]]),
            prvblkl: u16::from_le_bytes([bytes[2], bytes[3]]),
            flags1: bytes[4],
            flags2: bytes[5],
        }))
    }

    fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.curblkl.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.prvblkl.to_le_bytes());
        bytes[4] = self.flags1;
        bytes[5] = self.flags2;
        w.write_all(&bytes)
    }
}

/// Outcome of reading one physical record.
pub enum FramedRead {
    Data(usize),
    Tapemark,
}

/// Read one physical record (header + payload) into `buf`, per the
/// AWS/HET flat-file framing. Returns the number of payload bytes placed
/// in `buf` plus the record's own compressed flag (HET only; always
/// `false` for AWS), or `Tapemark` if the record was a filemark.
pub fn read_framed_block(
    r: &mut impl Read,
    buf: &mut [u8],
    prvblkl: u16,
) -> Result<(FramedRead, u16, bool), BlockReadError> {
    let header = match BlockHeader::read_from(r)? {
        None => return Err(BlockReadError::EndOfStream),
        Some(header) => header,
    };

    if header.is_tapemark() {
        return Ok((FramedRead::Tapemark, header.curblkl, false));
    }

    let len = header.curblkl as usize;
    if len > buf.len() {
        return Err(BlockReadError::Error(proxmox_lang::io_format_err!(
            "tape block ({len} bytes) larger than caller's buffer ({} bytes)",
            buf.len()
        )));
    }

    r.read_exact(&mut buf[..len])?;
    let _ = prvblkl; // caller tracks chaining across calls, not needed for a single record read
    Ok((FramedRead::Data(len), header.curblkl, header.is_compressed()))
}

/// Write one data record, returning the header actually written so the
/// caller can track `prvblkl` chaining for the next call.
pub fn write_framed_block(
    w: &mut impl Write,
    data: &[u8],
    prvblkl: u16,
    compressed: bool,
) -> Result<BlockHeader, std::io::Error> {
    if data.len() > u16::MAX as usize {
        proxmox_lang::io_bail!("tape block exceeds 64KiB AWS/HET record limit");
    }
    let header = BlockHeader {
        curblkl: data.len() as u16,
        prvblkl,
        flags1: 0,
        flags2: if compressed { flags2::COMPRESSED } else { 0 },
    };
    header.write_to(w)?;
    w.write_all(data)?;
    Ok(header)
}

/// Write a tapemark record.
pub fn write_tapemark(w: &mut impl Write, prvblkl: u16) -> Result<BlockHeader, std::io::Error> {
    let header = BlockHeader {
        curblkl: 0,
        prvblkl,
        flags1: flags1::TAPEMARK,
        flags2: 0,
    };
    header.write_to(w)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_data_block() {
        let mut buf = Vec::new();
        let data = b"hello tape block";
        write_framed_block(&mut buf, data, 0, false).unwrap();

        let mut cur = Cursor::new(buf);
        let mut out = [0u8; 64];
        let (result, _, compressed) = read_framed_block(&mut cur, &mut out, 0).unwrap();
        assert!(!compressed);
        match result {
            FramedRead::Data(n) => assert_eq!(&out[..n], data),
            FramedRead::Tapemark => panic!("expected data"),
        }
    }

    #[test]
    fn roundtrip_tapemark() {
        let mut buf = Vec::new();
        write_tapemark(&mut buf, 10).unwrap();

        let mut cur = Cursor::new(buf);
        let mut out = [0u8; 64];
        let (result, _, _) = read_framed_block(&mut cur, &mut out, 0).unwrap();
        assert!(matches!(result, FramedRead::Tapemark));
    }

    #[test]
    fn empty_stream_is_end_of_stream() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        let mut out = [0u8; 16];
        let err = read_framed_block(&mut cur, &mut out, 0).unwrap_err();
        assert!(matches!(err, BlockReadError::EndOfStream));
    }
}
