use crate::error::{Error, Result};
use crate::hash_slot::{self, key_sum, SlotItem};
use crate::space::{Space, SpaceStats, NIL_ADDR};
use crate::util::{put_info_field, read_i64, take_info_field, write_i64};
use bstr::BStr;
use std::path::Path;

const MAX_LOAD_FACTOR: f64 = 1.618;
const MIN_LOAD_FACTOR: f64 = MAX_LOAD_FACTOR / 2.0;

// slots are addressed through fixed-fanout directories of 4096 entries
const SLOT_DIR_SHIFT: u32 = 12;
const SLOT_DIR_LEN: i64 = 1 << SLOT_DIR_SHIFT;
const MIN_DIR_COUNT_SHIFT: i64 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DictStats {
    pub slot_dir_count: i64,
    pub slot_count: i64,
    pub item_count: i64,
    pub payload_size: i64,
    pub space: SpaceStats,
}

/// Stateful full-scan position. A fresh cursor starts from the beginning.
#[derive(Clone, Debug, Default)]
pub struct DictCursor {
    next_slot: i64,
    items: Vec<(Vec<u8>, Vec<u8>)>,
    position: usize,
}

/// Unordered persistent dictionary backed by linear hashing: the slot count
/// grows and shrinks one slot per overflow/underflow event, so a slot that is
/// not being split keeps its on-disk record untouched.
pub struct Dict {
    space: Space,
    slot_dirs_addr: i64,
    slot_dir_count: i64,
    max_slot_dir_count_shift: i64,
    slot_count: i64,
    min_slot_count_shift: i64,
    item_count: i64,
    payload_size: i64,
}

impl Dict {
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Dict> {
        let mut space = Space::open(path.as_ref(), create_if_missing)?;
        let primary = space.primary();
        if primary == NIL_ADDR {
            return Dict::create(space);
        }
        let info = space.access(primary)?.to_vec();
        let mut input = &info[..];
        let mut dict = Dict {
            slot_dirs_addr: take_info_field(&mut input, 1)?,
            slot_dir_count: take_info_field(&mut input, 2)?,
            max_slot_dir_count_shift: take_info_field(&mut input, 3)?,
            slot_count: take_info_field(&mut input, 4)?,
            min_slot_count_shift: take_info_field(&mut input, 5)?,
            item_count: take_info_field(&mut input, 6)?,
            payload_size: take_info_field(&mut input, 7)?,
            space,
        };
        if !input.is_empty() {
            return Err(Error::Corruption("trailing bytes in hash map info"));
        }
        if dict.slot_count < 1
            || dict.slot_dir_count < 1
            || dict.max_slot_dir_count_shift < MIN_DIR_COUNT_SHIFT
            || dict.slot_dir_count > 1 << dict.max_slot_dir_count_shift
        {
            return Err(Error::Corruption("implausible hash map info"));
        }
        dict.space.free(primary)?;
        dict.space.set_primary(NIL_ADDR);
        Ok(dict)
    }

    fn create(mut space: Space) -> Result<Dict> {
        let (dir_addr, view) = space.allocate((SLOT_DIR_LEN * 8) as usize)?;
        view.fill(0xff); // every slot starts out empty (NIL_ADDR)
        let (outer_addr, view) = space.allocate(8 << MIN_DIR_COUNT_SHIFT)?;
        view.fill(0xff);
        write_i64(space.access(outer_addr)?, 0, dir_addr);
        Ok(Dict {
            space,
            slot_dirs_addr: outer_addr,
            slot_dir_count: 1,
            max_slot_dir_count_shift: MIN_DIR_COUNT_SHIFT,
            slot_count: 1,
            min_slot_count_shift: 0,
            item_count: 0,
            payload_size: 0,
        })
    }

    /// Serializes the metadata, records it as the backend primary and
    /// releases the file. Skipping this loses the index.
    pub fn close(mut self) -> Result<()> {
        let mut info = Vec::with_capacity(64);
        put_info_field(&mut info, 1, self.slot_dirs_addr);
        put_info_field(&mut info, 2, self.slot_dir_count);
        put_info_field(&mut info, 3, self.max_slot_dir_count_shift);
        put_info_field(&mut info, 4, self.slot_count);
        put_info_field(&mut info, 5, self.min_slot_count_shift);
        put_info_field(&mut info, 6, self.item_count);
        put_info_field(&mut info, 7, self.payload_size);
        let (addr, view) = self.space.allocate(info.len())?;
        view.copy_from_slice(&info);
        self.space.set_primary(addr);
        self.space.close()
    }

    /// Frees every slot record and directory. Returns the backend stats taken
    /// right before the file is released; `allocated_size` is zero unless
    /// something leaked.
    pub fn destroy(mut self) -> Result<SpaceStats> {
        for slot in 0..self.slot_count {
            let addr = self.slot_record_addr(slot)?;
            if addr != NIL_ADDR {
                self.space.free(addr)?;
            }
        }
        for dir in 0..self.slot_dir_count {
            let addr = read_i64(self.space.access(self.slot_dirs_addr)?, (dir * 8) as usize);
            self.space.free(addr)?;
        }
        self.space.free(self.slot_dirs_addr)?;
        self.space.set_primary(NIL_ADDR);
        let stats = self.space.stats();
        self.space.close()?;
        Ok(stats)
    }

    pub fn stats(&self) -> DictStats {
        DictStats {
            slot_dir_count: self.slot_dir_count,
            slot_count: self.slot_count,
            item_count: self.item_count,
            payload_size: self.payload_size,
            space: self.space.stats(),
        }
    }

    /// Inserts if absent. Present keys are left untouched; the existing value
    /// is returned when `return_present` is set.
    #[tracing::instrument(skip_all)]
    pub fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        return_present: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let sum = key_sum(key);
        let slot = self.slot_of(sum);
        let mut items = self.load_slot(slot)?;
        if let Some(item) = items.iter().find(|item| item.matches(sum, key)) {
            let present = return_present.then(|| item.value.clone());
            return Ok((present, false));
        }
        tracing::trace!(key = %BStr::new(key), slot, "add");
        items.push(SlotItem::new(key, value));
        self.store_slot(slot, &items)?;
        self.item_count += 1;
        self.payload_size += (key.len() + value.len()) as i64;
        self.expand()?;
        Ok((None, true))
    }

    /// Replaces the value of a present key; absent keys are a no-op.
    #[tracing::instrument(skip_all)]
    pub fn update(
        &mut self,
        key: &[u8],
        value: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let sum = key_sum(key);
        let slot = self.slot_of(sum);
        let mut items = self.load_slot(slot)?;
        let Some(index) = items.iter().position(|item| item.matches(sum, key)) else {
            return Ok((None, false));
        };
        tracing::trace!(key = %BStr::new(key), slot, "update");
        let mut item = SlotItem::new(key, value);
        std::mem::swap(&mut items[index], &mut item);
        self.payload_size += value.len() as i64 - item.value.len() as i64;
        self.store_slot(slot, &items)?;
        let previous = return_previous.then(|| item.value);
        Ok((previous, true))
    }

    /// Upsert; the returned flag is true when the key was absent.
    #[tracing::instrument(skip_all)]
    pub fn add_or_update(
        &mut self,
        key: &[u8],
        value: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let sum = key_sum(key);
        let slot = self.slot_of(sum);
        let mut items = self.load_slot(slot)?;
        if let Some(index) = items.iter().position(|item| item.matches(sum, key)) {
            let mut item = SlotItem::new(key, value);
            std::mem::swap(&mut items[index], &mut item);
            self.payload_size += value.len() as i64 - item.value.len() as i64;
            self.store_slot(slot, &items)?;
            let previous = return_previous.then(|| item.value);
            return Ok((previous, false));
        }
        items.push(SlotItem::new(key, value));
        self.store_slot(slot, &items)?;
        self.item_count += 1;
        self.payload_size += (key.len() + value.len()) as i64;
        self.expand()?;
        Ok((None, true))
    }

    #[tracing::instrument(skip_all)]
    pub fn delete(
        &mut self,
        key: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let sum = key_sum(key);
        let slot = self.slot_of(sum);
        let mut items = self.load_slot(slot)?;
        let Some(index) = items.iter().position(|item| item.matches(sum, key)) else {
            return Ok((None, false));
        };
        tracing::trace!(key = %BStr::new(key), slot, "delete");
        let item = items.remove(index);
        self.store_slot(slot, &items)?;
        self.item_count -= 1;
        self.payload_size -= (item.key.len() + item.value.len()) as i64;
        self.shrink()?;
        let previous = return_previous.then(|| item.value);
        Ok((previous, true))
    }

    pub fn has(&mut self, key: &[u8], return_value: bool) -> Result<(Option<Vec<u8>>, bool)> {
        let sum = key_sum(key);
        let slot = self.slot_of(sum);
        let items = self.load_slot(slot)?;
        match items.iter().find(|item| item.matches(sum, key)) {
            Some(item) => Ok((return_value.then(|| item.value.clone()), true)),
            None => Ok((None, false)),
        }
    }

    /// Visits every item exactly once in slot order, as long as the map is
    /// not mutated between calls. Returned bytes are copies owned by the
    /// cursor.
    pub fn scan(&mut self, cursor: &mut DictCursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if cursor.position < cursor.items.len() {
                let (key, value) = cursor.items[cursor.position].clone();
                cursor.position += 1;
                return Ok(Some((key, value)));
            }
            if cursor.next_slot >= self.slot_count {
                return Ok(None);
            }
            let items = self.load_slot(cursor.next_slot)?;
            cursor.items = items.into_iter().map(|item| (item.key, item.value)).collect();
            cursor.position = 0;
            cursor.next_slot += 1;
        }
    }

    // ---- slot addressing ----

    fn slot_of(&self, sum: u64) -> i64 {
        let shift = self.min_slot_count_shift as u32;
        let mut slot = (sum & ((1 << (shift + 1)) - 1)) as i64;
        if slot >= self.slot_count {
            // the upper sibling has not been split off yet
            slot &= !(1 << shift);
        }
        slot
    }

    fn slot_record_addr(&mut self, slot: i64) -> Result<i64> {
        debug_assert!(slot < self.slot_count);
        let dir = slot >> SLOT_DIR_SHIFT;
        let index = slot & (SLOT_DIR_LEN - 1);
        let dir_addr = read_i64(self.space.access(self.slot_dirs_addr)?, (dir * 8) as usize);
        Ok(read_i64(self.space.access(dir_addr)?, (index * 8) as usize))
    }

    fn set_slot_record_addr(&mut self, slot: i64, addr: i64) -> Result<()> {
        let dir = slot >> SLOT_DIR_SHIFT;
        let index = slot & (SLOT_DIR_LEN - 1);
        let dir_addr = read_i64(self.space.access(self.slot_dirs_addr)?, (dir * 8) as usize);
        write_i64(self.space.access(dir_addr)?, (index * 8) as usize, addr);
        Ok(())
    }

    fn load_slot(&mut self, slot: i64) -> Result<Vec<SlotItem>> {
        let addr = self.slot_record_addr(slot)?;
        if addr == NIL_ADDR {
            return Ok(Vec::new());
        }
        hash_slot::decode(self.space.access(addr)?)
    }

    fn store_slot(&mut self, slot: i64, items: &[SlotItem]) -> Result<()> {
        let old = self.slot_record_addr(slot)?;
        if old != NIL_ADDR {
            self.space.free(old)?;
        }
        if items.is_empty() {
            return self.set_slot_record_addr(slot, NIL_ADDR);
        }
        let record = hash_slot::encode(items);
        let (addr, view) = self.space.allocate(record.len())?;
        view.copy_from_slice(&record);
        self.set_slot_record_addr(slot, addr)
    }

    // ---- growth and contraction ----

    fn load_factor(&self) -> f64 {
        self.item_count as f64 / self.slot_count as f64
    }

    fn expand(&mut self) -> Result<()> {
        while self.load_factor() > MAX_LOAD_FACTOR {
            self.split_slot()?;
        }
        Ok(())
    }

    fn shrink(&mut self) -> Result<()> {
        while self.slot_count >= 2 && self.load_factor() < MIN_LOAD_FACTOR {
            self.merge_slot()?;
        }
        Ok(())
    }

    fn split_slot(&mut self) -> Result<()> {
        let shift = self.min_slot_count_shift as u32;
        let new_slot = self.slot_count;
        let parent = new_slot & !(1 << shift);
        debug_assert!(new_slot & (1 << shift) != 0);
        tracing::debug!(parent, new_slot, "splitting slot");
        let items = self.load_slot(parent)?;
        let (moved, stayed): (Vec<SlotItem>, Vec<SlotItem>) =
            items.into_iter().partition(|item| item.sum() & (1 << shift) != 0);
        self.add_slot_dirs()?;
        self.slot_count += 1;
        if self.slot_count == 1 << (shift + 1) {
            self.min_slot_count_shift += 1;
        }
        self.store_slot(parent, &stayed)?;
        self.store_slot(new_slot, &moved)
    }

    fn merge_slot(&mut self) -> Result<()> {
        let last = self.slot_count - 1;
        let mut shift = self.min_slot_count_shift as u32;
        if last < 1 << shift {
            shift -= 1;
        }
        let parent = last & !(1 << shift);
        debug_assert!(parent < last);
        tracing::debug!(parent, last, "merging slot");
        let parent_items = self.load_slot(parent)?;
        let last_items = self.load_slot(last)?;
        let merged = interleave(parent_items, last_items);
        self.store_slot(last, &[])?;
        self.store_slot(parent, &merged)?;
        self.slot_count = last;
        self.min_slot_count_shift = shift as i64;
        self.remove_slot_dirs()
    }

    /// Makes room for one more slot, adding a directory and growing the outer
    /// pointer array as needed. Only the outer array ever moves; live slot
    /// records stay where they are.
    fn add_slot_dirs(&mut self) -> Result<()> {
        if self.slot_count + 1 <= self.slot_dir_count << SLOT_DIR_SHIFT {
            return Ok(());
        }
        if self.slot_dir_count == 1 << self.max_slot_dir_count_shift {
            let new_shift = self.max_slot_dir_count_shift + 1;
            let old = self.space.access(self.slot_dirs_addr)?.to_vec();
            let (new_addr, view) = self.space.allocate(8 << new_shift)?;
            view[..old.len()].copy_from_slice(&old);
            view[old.len()..].fill(0xff);
            self.space.free(self.slot_dirs_addr)?;
            self.slot_dirs_addr = new_addr;
            self.max_slot_dir_count_shift = new_shift;
        }
        let (dir_addr, view) = self.space.allocate((SLOT_DIR_LEN * 8) as usize)?;
        view.fill(0xff);
        write_i64(
            self.space.access(self.slot_dirs_addr)?,
            (self.slot_dir_count * 8) as usize,
            dir_addr,
        );
        self.slot_dir_count += 1;
        Ok(())
    }

    fn remove_slot_dirs(&mut self) -> Result<()> {
        while self.slot_count <= (self.slot_dir_count - 1) << SLOT_DIR_SHIFT {
            self.slot_dir_count -= 1;
            let offset = (self.slot_dir_count * 8) as usize;
            let dir_addr = read_i64(self.space.access(self.slot_dirs_addr)?, offset);
            self.space.free(dir_addr)?;
            write_i64(self.space.access(self.slot_dirs_addr)?, offset, NIL_ADDR);
        }
        while self.max_slot_dir_count_shift > MIN_DIR_COUNT_SHIFT
            && self.slot_dir_count <= 1 << (self.max_slot_dir_count_shift - 2)
        {
            let new_shift = self.max_slot_dir_count_shift - 1;
            let live = (self.slot_dir_count * 8) as usize;
            let old = self.space.access(self.slot_dirs_addr)?[..live].to_vec();
            let (new_addr, view) = self.space.allocate(8 << new_shift)?;
            view[..live].copy_from_slice(&old);
            view[live..].fill(0xff);
            self.space.free(self.slot_dirs_addr)?;
            self.slot_dirs_addr = new_addr;
            self.max_slot_dir_count_shift = new_shift;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn validate(&mut self) {
        assert!(self.slot_count >= 1);
        assert!((1 << self.min_slot_count_shift) <= self.slot_count);
        assert!(self.slot_count <= 1 << (self.min_slot_count_shift + 1));
        assert!((self.slot_dir_count - 1) << SLOT_DIR_SHIFT < self.slot_count);
        assert!(self.slot_count <= self.slot_dir_count << SLOT_DIR_SHIFT);
        assert!(self.max_slot_dir_count_shift >= MIN_DIR_COUNT_SHIFT);
        assert!(self.slot_dir_count <= 1 << self.max_slot_dir_count_shift);
        if self.slot_count >= 2 {
            assert!(self.load_factor() >= MIN_LOAD_FACTOR);
            assert!(self.load_factor() <= MAX_LOAD_FACTOR);
        }
        let mut items = 0;
        let mut payload = 0i64;
        for slot in 0..self.slot_count {
            for item in self.load_slot(slot).unwrap() {
                assert_eq!(self.slot_of(item.sum()), slot);
                items += 1;
                payload += (item.key.len() + item.value.len()) as i64;
            }
        }
        assert_eq!(items, self.item_count);
        assert_eq!(payload, self.payload_size);
    }
}

/// Deterministic, content-derived interleaving of two item lists; both inputs
/// keep their relative order.
fn interleave(a: Vec<SlotItem>, b: Vec<SlotItem>) -> Vec<SlotItem> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut accumulator: u64 = 1;
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => {
                accumulator = accumulator.wrapping_mul((x.key.len() + y.key.len()) as u64);
                if accumulator & 1 == 0 {
                    out.push(x);
                    out.push(y);
                } else {
                    out.push(y);
                    out.push(x);
                }
            }
            (Some(x), None) => out.push(x),
            (None, Some(y)) => out.push(y),
            (None, None) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp(dir: &TempDir) -> Dict {
        Dict::open(dir.path().join("dict"), true).unwrap()
    }

    #[test]
    fn split_then_drain_returns_to_one_slot() {
        let dir = TempDir::new().unwrap();
        let mut dict = open_temp(&dir);
        for i in 0..500u32 {
            dict.add(&i.to_be_bytes(), b"v", false).unwrap();
        }
        assert!(dict.stats().slot_count > 1);
        dict.validate();

        for i in 0..500u32 {
            let (_, existed) = dict.delete(&i.to_be_bytes(), false).unwrap();
            assert!(existed);
        }
        let stats = dict.stats();
        assert_eq!(stats.slot_count, 1);
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.payload_size, 0);
        dict.validate();
        dict.close().unwrap();
    }

    #[test]
    fn directory_array_grows_and_shrinks() {
        let dir = TempDir::new().unwrap();
        let mut dict = open_temp(&dir);
        // enough items to push the slot count past one 4096-entry directory
        const N: u32 = 8000;
        for i in 0..N {
            dict.add(&i.to_be_bytes(), &i.to_le_bytes(), false).unwrap();
            if i % 2000 == 0 {
                dict.validate();
            }
        }
        let stats = dict.stats();
        assert!(stats.slot_count > SLOT_DIR_LEN, "{stats:?}");
        assert_eq!(stats.slot_dir_count, 2);
        dict.validate();

        for i in 0..N {
            dict.delete(&i.to_be_bytes(), false).unwrap();
            if i % 2000 == 0 {
                dict.validate();
            }
        }
        let stats = dict.stats();
        assert_eq!(stats.slot_dir_count, 1);
        assert_eq!(stats.slot_count, 1);
        dict.validate();
        dict.close().unwrap();
    }

    #[test]
    fn cursor_visits_every_item_exactly_once() {
        let dir = TempDir::new().unwrap();
        let mut dict = open_temp(&dir);
        for i in 0..1000u32 {
            dict.add(format!("key-{i}").as_bytes(), &i.to_be_bytes(), false).unwrap();
        }
        let mut cursor = DictCursor::default();
        let mut seen = std::collections::HashSet::new();
        while let Some((key, value)) = dict.scan(&mut cursor).unwrap() {
            assert!(seen.insert(key.clone()), "duplicate {key:?}");
            let expected: u32 = std::str::from_utf8(&key[4..]).unwrap().parse().unwrap();
            assert_eq!(value, expected.to_be_bytes());
        }
        assert_eq!(seen.len(), 1000);
        dict.close().unwrap();
    }

    #[test]
    fn long_keys_keep_their_stored_sums() {
        let dir = TempDir::new().unwrap();
        let mut dict = open_temp(&dir);
        let mut long_key = vec![0u8; 200];
        for i in 0..200u32 {
            long_key[..4].copy_from_slice(&i.to_be_bytes());
            dict.add(&long_key, b"big", false).unwrap();
        }
        dict.validate();
        long_key[..4].copy_from_slice(&77u32.to_be_bytes());
        assert_eq!(dict.has(&long_key, true).unwrap(), (Some(b"big".to_vec()), true));
        // a key that differs only in its tail byte is distinct
        let mut other = long_key.clone();
        other[199] ^= 1;
        assert_eq!(dict.has(&other, false).unwrap(), (None, false));
        dict.close().unwrap();
    }

    #[test]
    fn interleave_is_deterministic_and_order_preserving() {
        let make = |keys: &[&[u8]]| keys.iter().map(|k| SlotItem::new(k, b"v")).collect::<Vec<_>>();
        let a = make(&[b"a1", b"a22", b"a333"]);
        let b = make(&[b"b1"]);
        let merged = interleave(a.clone(), b.clone());
        assert_eq!(merged.len(), 4);
        assert_eq!(merged, interleave(a.clone(), b.clone()));
        let a_positions: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, item)| item.key.starts_with(b"a"))
            .map(|(i, _)| i)
            .collect();
        let a_keys: Vec<&[u8]> = a_positions.iter().map(|&i| merged[i].key.as_slice()).collect();
        assert_eq!(a_keys, vec![b"a1".as_slice(), b"a22", b"a333"]);
    }
}
