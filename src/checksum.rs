//! Page-interval checksum framing.
//!
//! ## File body layout
//!
//! ```text
//! +----------------------+--------+----------------------+--------+-----
//! | interval bytes       | cksum  | interval bytes       | cksum  | ...
//! +----------------------+--------+----------------------+--------+-----
//! ```
//!
//! Every `checksum_interval` logical bytes are followed by a 4-byte
//! big-endian murmur3-32 checksum of that interval, counted from byte 0 of
//! the file (the header sits inside the first interval). The checksums are
//! invisible to callers: offsets handed to [`ChecksummedReader::read_at`] are
//! logical offsets and the reader skips and verifies the embedded checksums
//! itself. A final partial interval carries no checksum; a normally closed
//! file only keeps padding there.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Murmur3-32 with a zero seed, the checksum every frame in the system uses.
pub fn sum32(data: &[u8]) -> u32 {
    murmur3::murmur3_32(&mut std::io::Cursor::new(data), 0)
        .expect("in-memory reads are infallible")
}

/// Maps a logical offset to its physical position, accounting for the 4-byte
/// checksum embedded after each interval.
pub fn physical_offset(logical: u64, interval: u32) -> u64 {
    logical + (logical / u64::from(interval)) * 4
}

/// Reads exactly `buf.len()` bytes unless EOF intervenes; returns the number
/// of bytes actually read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(sn) => n += sn,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(n)
}

/// A reader that re-verifies each interval's checksum on every read.
pub struct ChecksummedReader<R> {
    inner: R,
    interval: u32,
    page: Vec<u8>,
}

impl<R: Read + Seek> ChecksummedReader<R> {
    pub fn new(inner: R, interval: u32) -> Self {
        Self {
            inner,
            interval,
            page: vec![0u8; interval as usize + 4],
        }
    }

    /// Fills `buf` with the logical bytes at `offset`, verifying every
    /// interval touched. Returns `Corrupt` on a checksum mismatch and `IO` on
    /// a short file.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let interval = u64::from(self.interval);
        let mut logical = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let page_start = (logical / interval) * interval;
            let within = (logical - page_start) as usize;
            self.inner
                .seek(SeekFrom::Start(physical_offset(page_start, self.interval)))?;
            let n = read_full(&mut self.inner, &mut self.page)?;
            let available = if n == self.page.len() {
                // A complete interval with its trailing checksum.
                let expected = BigEndian::read_u32(&self.page[self.interval as usize..]);
                let actual = sum32(&self.page[..self.interval as usize]);
                if actual != expected {
                    return Err(Error::Corrupt(format!(
                        "checksum mismatch at logical offset {page_start}: computed {actual:#010x}, stored {expected:#010x}"
                    )));
                }
                self.interval as usize
            } else {
                // The final partial interval; raw bytes, no checksum follows.
                n
            };
            if within >= available {
                return Err(Error::IO(format!(
                    "unexpected end of file at logical offset {logical}"
                )));
            }
            let take = (available - within).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.page[within..within + take]);
            filled += take;
            logical += take as u64;
        }
        Ok(())
    }
}

/// Sweeps a whole file, verifying every complete interval, and returns the
/// corrupt logical byte ranges. The final partial interval is padding by
/// construction and is not reported.
pub fn checksum_verify<R: Read>(reader: &mut R, interval: u32) -> Result<Vec<(u64, u64)>> {
    let mut corruptions = Vec::new();
    let mut page = vec![0u8; interval as usize + 4];
    let mut page_index = 0u64;
    loop {
        let n = read_full(reader, &mut page)?;
        if n < page.len() {
            break;
        }
        let expected = BigEndian::read_u32(&page[interval as usize..]);
        if sum32(&page[..interval as usize]) != expected {
            let start = page_index * u64::from(interval);
            corruptions.push((start, start + u64::from(interval)));
        }
        page_index += 1;
    }
    Ok(corruptions)
}

/// True if `[offset, offset + length)` intersects any of the ranges.
pub fn in_corrupt_range(offset: u32, length: u32, corruptions: &[(u64, u64)]) -> bool {
    let start = u64::from(offset);
    let end = start + u64::from(length);
    corruptions.iter().any(|&(cs, ce)| start < ce && end > cs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const INTERVAL: u32 = 32;

    /// Frames `logical` at INTERVAL, appending a checksum per full interval.
    fn frame(logical: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in logical.chunks(INTERVAL as usize) {
            out.extend_from_slice(chunk);
            if chunk.len() == INTERVAL as usize {
                let mut sum = [0u8; 4];
                BigEndian::write_u32(&mut sum, sum32(chunk));
                out.extend_from_slice(&sum);
            }
        }
        out
    }

    #[test]
    fn test_read_within_one_interval() {
        let logical: Vec<u8> = (0..100u8).collect();
        let mut r = ChecksummedReader::new(Cursor::new(frame(&logical)), INTERVAL);
        let mut buf = [0u8; 10];
        r.read_at(5, &mut buf).unwrap();
        assert_eq!(&buf, &logical[5..15]);
    }

    #[test]
    fn test_read_across_intervals() {
        let logical: Vec<u8> = (0..=255u8).collect();
        let mut r = ChecksummedReader::new(Cursor::new(frame(&logical)), INTERVAL);
        let mut buf = [0u8; 80];
        r.read_at(20, &mut buf).unwrap();
        assert_eq!(&buf[..], &logical[20..100]);
    }

    #[test]
    fn test_read_tail_without_checksum() {
        let logical: Vec<u8> = (0..40u8).collect();
        let mut r = ChecksummedReader::new(Cursor::new(frame(&logical)), INTERVAL);
        let mut buf = [0u8; 6];
        r.read_at(34, &mut buf).unwrap();
        assert_eq!(&buf, &logical[34..40]);
    }

    #[test]
    fn test_read_past_end() {
        let logical: Vec<u8> = (0..40u8).collect();
        let mut r = ChecksummedReader::new(Cursor::new(frame(&logical)), INTERVAL);
        let mut buf = [0u8; 8];
        match r.read_at(36, &mut buf) {
            Err(Error::IO(_)) => {}
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_corruption_detected() {
        let logical: Vec<u8> = (0..=255u8).collect();
        let mut framed = frame(&logical);
        framed[10] ^= 0xff;
        let mut r = ChecksummedReader::new(Cursor::new(framed), INTERVAL);
        let mut buf = [0u8; 4];
        match r.read_at(8, &mut buf) {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_verify_ranges() {
        let logical: Vec<u8> = (0..=255u8).collect();
        let mut framed = frame(&logical);
        // Corrupt a byte inside the third interval.
        framed[2 * 36 + 5] ^= 0xff;
        let corruptions = checksum_verify(&mut Cursor::new(framed), INTERVAL).unwrap();
        assert_eq!(corruptions, vec![(64, 96)]);
        assert!(in_corrupt_range(90, 4, &corruptions));
        assert!(in_corrupt_range(60, 10, &corruptions));
        assert!(!in_corrupt_range(96, 10, &corruptions));
        assert!(!in_corrupt_range(0, 64, &corruptions));
    }

    #[test]
    fn test_physical_offset() {
        assert_eq!(physical_offset(0, INTERVAL), 0);
        assert_eq!(physical_offset(31, INTERVAL), 31);
        assert_eq!(physical_offset(32, INTERVAL), 36);
        assert_eq!(physical_offset(100, INTERVAL), 112);
    }
}
