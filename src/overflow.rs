use crate::error::{Error, Result};
use crate::space::Space;
use crate::util::{put_uvarint, read_i64, take_uvarint, uvarint_len};
use std::cmp::Ordering;

/// Stored keys are at most this long. A longer raw key keeps its first
/// `MAX_STORED_KEY - 8` bytes inline; the rest lives in an overflow region
/// whose address fills the trailing 8 bytes.
pub const MAX_STORED_KEY: usize = 257;
/// Same scheme for values.
pub const MAX_STORED_VALUE: usize = 129;

pub fn create(space: &mut Space, payload: &[u8]) -> Result<i64> {
    let mut buf = Vec::with_capacity(uvarint_len(payload.len() as u64) + payload.len());
    put_uvarint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    let (addr, view) = space.allocate(buf.len())?;
    view.copy_from_slice(&buf);
    Ok(addr)
}

pub fn destroy(space: &mut Space, addr: i64) -> Result<usize> {
    let len = len(space, addr)?;
    space.free(addr)?;
    Ok(len)
}

pub fn len(space: &mut Space, addr: i64) -> Result<usize> {
    let mut region = &space.access(addr)?[..];
    let len = take_uvarint(&mut region)? as usize;
    if len != region.len() {
        return Err(Error::Corruption("overflow length does not match region"));
    }
    Ok(len)
}

/// Copies up to `buf.len()` payload bytes starting at `offset`; returns the
/// number of bytes copied (short when the payload ends first).
pub fn read_at(space: &mut Space, addr: i64, offset: usize, buf: &mut [u8]) -> Result<usize> {
    let mut region = &space.access(addr)?[..];
    let len = take_uvarint(&mut region)? as usize;
    if len != region.len() {
        return Err(Error::Corruption("overflow length does not match region"));
    }
    let n = buf.len().min(len.saturating_sub(offset));
    buf[..n].copy_from_slice(&region[offset..offset + n]);
    Ok(n)
}

fn read_all(space: &mut Space, addr: i64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len(space, addr)?];
    read_at(space, addr, 0, &mut buf)?;
    Ok(buf)
}

// The pack/unpack family converts between raw byte strings and the stored
// form kept in tree nodes: raw bytes shorter than `max_stored` stay inline,
// anything longer becomes `max_stored` bytes of prefix plus overflow address.

pub fn pack(space: &mut Space, raw: &[u8], max_stored: usize) -> Result<Vec<u8>> {
    if raw.len() < max_stored {
        return Ok(raw.to_vec());
    }
    let prefix = max_stored - 8;
    let addr = create(space, &raw[prefix..])?;
    let mut stored = Vec::with_capacity(max_stored);
    stored.extend_from_slice(&raw[..prefix]);
    stored.extend_from_slice(&addr.to_be_bytes());
    Ok(stored)
}

pub fn unpack(space: &mut Space, stored: &[u8], max_stored: usize) -> Result<Vec<u8>> {
    if stored.len() < max_stored {
        return Ok(stored.to_vec());
    }
    assert_eq!(stored.len(), max_stored);
    let prefix = max_stored - 8;
    let tail = read_all(space, read_i64(stored, prefix))?;
    let mut raw = Vec::with_capacity(prefix + tail.len());
    raw.extend_from_slice(&stored[..prefix]);
    raw.extend_from_slice(&tail);
    Ok(raw)
}

pub fn unpacked_len(space: &mut Space, stored: &[u8], max_stored: usize) -> Result<usize> {
    if stored.len() < max_stored {
        return Ok(stored.len());
    }
    let prefix = max_stored - 8;
    Ok(prefix + len(space, read_i64(stored, prefix))?)
}

/// Frees the overflow region behind a stored form, if any; returns the raw
/// length.
pub fn dispose(space: &mut Space, stored: &[u8], max_stored: usize) -> Result<usize> {
    if stored.len() < max_stored {
        return Ok(stored.len());
    }
    let prefix = max_stored - 8;
    Ok(prefix + destroy(space, read_i64(stored, prefix))?)
}

/// Orders a stored form against a raw query. The overflow region is only
/// dereferenced when the inline prefix ties.
pub fn compare(space: &mut Space, stored: &[u8], max_stored: usize, raw: &[u8]) -> Result<Ordering> {
    if stored.len() < max_stored {
        return Ok(stored.cmp(raw));
    }
    let prefix = &stored[..max_stored - 8];
    let shared = prefix.len().min(raw.len());
    match prefix[..shared].cmp(&raw[..shared]) {
        Ordering::Equal => {}
        unequal => return Ok(unequal),
    }
    if raw.len() <= prefix.len() {
        // the stored form is at least max_stored bytes of raw data
        return Ok(Ordering::Greater);
    }
    let tail = read_all(space, read_i64(stored, prefix.len()))?;
    Ok(tail[..].cmp(&raw[prefix.len()..]))
}
