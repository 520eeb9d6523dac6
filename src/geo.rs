//! IP-geolocation lookups against an ip2region `.xdb` database.
//!
//! The whole file is read into memory once at startup; lookups are a vector
//! index hop plus a binary search over segment records, no further I/O.
//!
//! xdb v2 layout: a 256-byte header, then a 256x256 vector index of
//! `(start_ptr: u32 LE, end_ptr: u32 LE)` pairs keyed by the first two IP
//! octets, then 14-byte segment records `(sip, eip: u32 LE, data_len: u16 LE,
//! data_ptr: u32 LE)` pointing into the trailing region-string pool.

use std::net::Ipv4Addr;
use std::path::Path;

use crate::errors::RelayError;

const HEADER_LEN: usize = 256;
const VECTOR_INDEX_LEN: usize = 256 * 256 * 8;
const SEGMENT_LEN: usize = 14;

/// In-memory ip2region searcher.
pub struct GeoSearcher {
    buf: Vec<u8>,
}

impl GeoSearcher {
    /// Load the database file fully into memory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let buf = std::fs::read(path)?;
        if buf.len() < HEADER_LEN + VECTOR_INDEX_LEN {
            return Err(RelayError::InvalidSnapshot(format!(
                "xdb file too short: {} bytes",
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    /// Resolve a dotted-quad address to its region string.
    ///
    /// Returns `None` for unparseable addresses and for addresses with no
    /// covering segment.
    #[must_use]
    pub fn search(&self, ip: &str) -> Option<String> {
        let addr: Ipv4Addr = ip.parse().ok()?;
        let ip = u32::from(addr);

        let o = addr.octets();
        let vec_off = HEADER_LEN + (o[0] as usize * 256 + o[1] as usize) * 8;
        let start = self.read_u32(vec_off)? as usize;
        let end = self.read_u32(vec_off + 4)? as usize;
        if start == 0 || end < start {
            return None;
        }

        // Binary search over the inclusive segment range [start, end].
        let mut lo = 0usize;
        let mut hi = (end - start) / SEGMENT_LEN;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let p = start + mid * SEGMENT_LEN;
            let sip = self.read_u32(p)?;
            let eip = self.read_u32(p + 4)?;
            if ip < sip {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            } else if ip > eip {
                lo = mid + 1;
            } else {
                let len = self.read_u16(p + 8)? as usize;
                let ptr = self.read_u32(p + 10)? as usize;
                let data = self.buf.get(ptr..ptr + len)?;
                return Some(String::from_utf8_lossy(data).into_owned());
            }
        }
        None
    }

    fn read_u32(&self, off: usize) -> Option<u32> {
        let b = self.buf.get(off..off + 4)?;
        Some(u32::from_le_bytes(b.try_into().ok()?))
    }

    fn read_u16(&self, off: usize) -> Option<u16> {
        let b = self.buf.get(off..off + 2)?;
        Some(u16::from_le_bytes(b.try_into().ok()?))
    }
}
