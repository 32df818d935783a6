use crate::error::{Error, Result};
use crate::util::{put_uvarint, read_u64, take_uvarint, uvarint_len};
use std::hash::Hasher;

/// Sums of keys this short are serialized as 0 and recomputed on demand; the
/// byte compare is cheap enough that the stored sum only pays off for long
/// keys.
pub const SHORT_KEY_MAX: usize = 24;

pub fn key_sum(key: &[u8]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotItem {
    key_sum: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SlotItem {
    pub fn new(key: &[u8], value: &[u8]) -> SlotItem {
        SlotItem {
            key_sum: key_sum(key),
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    pub fn sum(&self) -> u64 {
        if self.key.len() <= SHORT_KEY_MAX {
            key_sum(&self.key)
        } else {
            self.key_sum
        }
    }

    pub fn matches(&self, sum: u64, key: &[u8]) -> bool {
        self.key.len() == key.len()
            && (self.key.len() <= SHORT_KEY_MAX || self.key_sum == sum)
            && self.key == key
    }
}

/// Packs items into a slot record:
/// `uvarint(count) | (sum fixed64, key_size uvarint, value_size uvarint)* |
/// blob`. The last item's value size is stored as 0; its real size is
/// whatever remains of the blob, so the record must exactly fill its region.
pub fn encode(items: &[SlotItem]) -> Vec<u8> {
    let mut size = uvarint_len(items.len() as u64);
    for (i, item) in items.iter().enumerate() {
        let value_size = if i + 1 == items.len() { 0 } else { item.value.len() as u64 };
        size += 8 + uvarint_len(item.key.len() as u64) + uvarint_len(value_size);
        size += item.key.len() + item.value.len();
    }
    let mut buf = Vec::with_capacity(size);
    put_uvarint(&mut buf, items.len() as u64);
    for (i, item) in items.iter().enumerate() {
        let sum = if item.key.len() <= SHORT_KEY_MAX { 0 } else { item.key_sum };
        buf.extend_from_slice(&sum.to_be_bytes());
        put_uvarint(&mut buf, item.key.len() as u64);
        let value_size = if i + 1 == items.len() { 0 } else { item.value.len() as u64 };
        put_uvarint(&mut buf, value_size);
    }
    for item in items {
        buf.extend_from_slice(&item.key);
        buf.extend_from_slice(&item.value);
    }
    debug_assert_eq!(buf.len(), size);
    buf
}

pub fn decode(region: &[u8]) -> Result<Vec<SlotItem>> {
    let mut input = region;
    let count = take_uvarint(&mut input)? as usize;
    if count > region.len() {
        return Err(Error::Corruption("slot item count exceeds record"));
    }
    let mut headers = Vec::with_capacity(count);
    let mut known = 0usize;
    for _ in 0..count {
        if input.len() < 8 {
            return Err(Error::Corruption("truncated slot item header"));
        }
        let sum = read_u64(input, 0);
        input = &input[8..];
        let key_size = take_uvarint(&mut input)? as usize;
        let value_size = take_uvarint(&mut input)? as usize;
        known += key_size + value_size;
        headers.push((sum, key_size, value_size));
    }
    let blob = input;
    if known > blob.len() {
        return Err(Error::Corruption("slot sizes exceed blob"));
    }
    if let Some(last) = headers.last_mut() {
        if last.2 != 0 {
            return Err(Error::Corruption("last slot item has explicit value size"));
        }
        last.2 = blob.len() - known;
    } else if !blob.is_empty() {
        return Err(Error::Corruption("empty slot record has payload"));
    }
    let mut items = Vec::with_capacity(count);
    let mut offset = 0;
    for (sum, key_size, value_size) in headers {
        let key = blob[offset..offset + key_size].to_vec();
        offset += key_size;
        let value = blob[offset..offset + value_size].to_vec();
        offset += value_size;
        items.push(SlotItem { key_sum: sum, key, value });
    }
    Ok(items)
}
