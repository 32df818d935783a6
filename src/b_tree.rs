use crate::error::{Error, Result};
use crate::inner_node::{InnerView, INNER_OVERLOAD, INNER_UNDERLOAD};
use crate::leaf_node::{LeafView, LEAF_OVERLOAD, LEAF_UNDERLOAD, NODE_SIZE};
use crate::overflow::{self, MAX_STORED_KEY, MAX_STORED_VALUE};
use crate::space::{Space, SpaceStats, NIL_ADDR};
use crate::util::{put_info_field, take_info_field};
use bstr::BStr;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrderedDictStats {
    pub height: i64,
    pub leaf_count: i64,
    pub non_leaf_count: i64,
    pub record_count: i64,
    pub payload_size: i64,
    pub space: SpaceStats,
}

/// Range bound. `Min` lies before every key and `Max` after every key; both
/// resolve against the actual first/last record when a range is opened.
#[derive(Clone, Copy, Debug)]
pub enum RangeKey<'a> {
    Min,
    Max,
    Key(&'a [u8]),
}

#[derive(Clone, Copy, Debug)]
struct PathEntry {
    addr: i64,
    /// child index taken at a non-leaf, record index at the leaf
    index: usize,
}

type NodePath = SmallVec<[PathEntry; 8]>;

enum PutMode {
    AddOnly,
    UpdateOnly,
    Upsert,
}

/// Order-preserving persistent dictionary: a B+ tree of fixed 8 KiB nodes
/// with a doubly linked (circular) leaf chain for bidirectional range scans.
pub struct OrderedDict {
    space: Space,
    root_addr: i64,
    height: i64,
    leaf_head_addr: i64,
    leaf_tail_addr: i64,
    leaf_count: i64,
    non_leaf_count: i64,
    record_count: i64,
    payload_size: i64,
}

impl OrderedDict {
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<OrderedDict> {
        let mut space = Space::open(path.as_ref(), create_if_missing)?;
        let primary = space.primary();
        if primary == NIL_ADDR {
            return OrderedDict::create(space);
        }
        let info = space.access(primary)?.to_vec();
        let mut input = &info[..];
        let mut dict = OrderedDict {
            root_addr: take_info_field(&mut input, 1)?,
            height: take_info_field(&mut input, 2)?,
            leaf_head_addr: take_info_field(&mut input, 3)?,
            leaf_tail_addr: take_info_field(&mut input, 4)?,
            leaf_count: take_info_field(&mut input, 5)?,
            non_leaf_count: take_info_field(&mut input, 6)?,
            record_count: take_info_field(&mut input, 7)?,
            payload_size: take_info_field(&mut input, 8)?,
            space,
        };
        if !input.is_empty() {
            return Err(Error::Corruption("trailing bytes in tree info"));
        }
        if dict.height < 1 || dict.leaf_count < 1 || dict.record_count < 0 {
            return Err(Error::Corruption("implausible tree info"));
        }
        dict.space.free(primary)?;
        dict.space.set_primary(NIL_ADDR);
        Ok(dict)
    }

    fn create(mut space: Space) -> Result<OrderedDict> {
        let (addr, page) = space.allocate_aligned(NODE_SIZE)?;
        let mut leaf = LeafView::init(page);
        leaf.set_prev(addr);
        leaf.set_next(addr);
        Ok(OrderedDict {
            space,
            root_addr: addr,
            height: 1,
            leaf_head_addr: addr,
            leaf_tail_addr: addr,
            leaf_count: 1,
            non_leaf_count: 0,
            record_count: 0,
            payload_size: 0,
        })
    }

    /// Serializes the metadata, records it as the backend primary and
    /// releases the file. Skipping this loses the index.
    pub fn close(mut self) -> Result<()> {
        let mut info = Vec::with_capacity(80);
        put_info_field(&mut info, 1, self.root_addr);
        put_info_field(&mut info, 2, self.height);
        put_info_field(&mut info, 3, self.leaf_head_addr);
        put_info_field(&mut info, 4, self.leaf_tail_addr);
        put_info_field(&mut info, 5, self.leaf_count);
        put_info_field(&mut info, 6, self.non_leaf_count);
        put_info_field(&mut info, 7, self.record_count);
        put_info_field(&mut info, 8, self.payload_size);
        let (addr, view) = self.space.allocate(info.len())?;
        view.copy_from_slice(&info);
        self.space.set_primary(addr);
        self.space.close()
    }

    /// Frees every node and overflow region. Returns the backend stats taken
    /// right before the file is released; `allocated_size` is zero unless
    /// something leaked.
    pub fn destroy(mut self) -> Result<SpaceStats> {
        self.free_subtree(self.root_addr, self.height)?;
        self.space.set_primary(NIL_ADDR);
        let stats = self.space.stats();
        self.space.close()?;
        Ok(stats)
    }

    fn free_subtree(&mut self, addr: i64, level: i64) -> Result<()> {
        if level == 1 {
            let records = {
                let view = LeafView::new(self.space.access(addr)?);
                let count = view.record_count();
                view.records(0, count)
            };
            // separator keys up the tree share these overflow regions, so
            // leaf records are the single place they are released
            for record in records {
                overflow::dispose(&mut self.space, &record.key, MAX_STORED_KEY)?;
                overflow::dispose(&mut self.space, &record.value, MAX_STORED_VALUE)?;
            }
        } else {
            let children = {
                let view = InnerView::new(self.space.access(addr)?);
                view.entries(0, view.child_count())
            };
            for entry in children {
                self.free_subtree(entry.child, level - 1)?;
            }
        }
        self.space.free_aligned(addr)
    }

    pub fn stats(&self) -> OrderedDictStats {
        OrderedDictStats {
            height: self.height,
            leaf_count: self.leaf_count,
            non_leaf_count: self.non_leaf_count,
            record_count: self.record_count,
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
        self.put(key, value, PutMode::AddOnly, return_present)
    }

    /// Replaces the value of a present key; absent keys are a no-op.
    #[tracing::instrument(skip_all)]
    pub fn update(
        &mut self,
        key: &[u8],
        value: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        self.put(key, value, PutMode::UpdateOnly, return_previous)
    }

    /// Upsert; the returned flag is true when the key was absent.
    #[tracing::instrument(skip_all)]
    pub fn add_or_update(
        &mut self,
        key: &[u8],
        value: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        self.put(key, value, PutMode::Upsert, return_previous)
    }

    fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        return_value: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (mut path, found) = self.search(key)?;
        if found {
            let position = *path.last().unwrap();
            let previous = if return_value {
                Some(self.raw_value_at(position.addr, position.index)?)
            } else {
                None
            };
            if let PutMode::AddOnly = mode {
                return Ok((previous, false));
            }
            self.replace_value(&mut path, value)?;
            // update reports "existed", upsert reports "inserted"
            let flag = matches!(mode, PutMode::UpdateOnly);
            return Ok((previous, flag));
        }
        if let PutMode::UpdateOnly = mode {
            return Ok((None, false));
        }
        tracing::trace!(key = %BStr::new(key), "insert");
        self.insert_record(&mut path, key, value)?;
        Ok((None, true))
    }

    #[tracing::instrument(skip_all)]
    pub fn delete(
        &mut self,
        key: &[u8],
        return_previous: bool,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let (mut path, found) = self.search(key)?;
        if !found {
            return Ok((None, false));
        }
        tracing::trace!(key = %BStr::new(key), "delete");
        let position = *path.last().unwrap();
        let (stored_key, stored_value) = self.stored_record(position.addr, position.index)?;
        let previous = if return_previous {
            Some(overflow::unpack(&mut self.space, &stored_value, MAX_STORED_VALUE)?)
        } else {
            None
        };
        let key_len = overflow::dispose(&mut self.space, &stored_key, MAX_STORED_KEY)?;
        let value_len = overflow::dispose(&mut self.space, &stored_value, MAX_STORED_VALUE)?;
        {
            let mut leaf = LeafView::new(self.space.access(position.addr)?);
            leaf.remove(position.index);
        }
        self.record_count -= 1;
        self.payload_size -= (key_len + value_len) as i64;
        if position.index == 0 {
            self.sync_key(&path)?;
        }
        self.rebalance(&mut path)?;
        Ok((previous, true))
    }

    pub fn has(&mut self, key: &[u8], return_value: bool) -> Result<(Option<Vec<u8>>, bool)> {
        let (path, found) = self.search(key)?;
        if !found {
            return Ok((None, false));
        }
        let position = *path.last().unwrap();
        let value = if return_value {
            Some(self.raw_value_at(position.addr, position.index)?)
        } else {
            None
        };
        Ok((value, true))
    }

    pub fn range_forward(&mut self, min: RangeKey, max: RangeKey) -> Result<RangeIter<'_>> {
        self.range(min, max, false)
    }

    pub fn range_backward(&mut self, min: RangeKey, max: RangeKey) -> Result<RangeIter<'_>> {
        self.range(min, max, true)
    }

    // ---- lookup ----

    fn search(&mut self, key: &[u8]) -> Result<(NodePath, bool)> {
        let mut path = NodePath::new();
        let mut addr = self.root_addr;
        for _ in 1..self.height {
            let index = self.find_child(addr, key)?;
            path.push(PathEntry { addr, index });
            addr = self.with_inner(addr, |inner| inner.child(index))?;
        }
        let (index, found) = self.find_record(addr, key)?;
        path.push(PathEntry { addr, index });
        Ok((path, found))
    }

    /// Picks the child whose subtree covers `key`: the last child whose
    /// separator is not greater than the key (entry 0's separator is the
    /// dummy and orders before everything).
    fn find_child(&mut self, addr: i64, key: &[u8]) -> Result<usize> {
        let count = self.with_inner(addr, |inner| inner.child_count())?;
        let mut lo = 1;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let stored = self.with_inner(addr, |inner| inner.key(mid).to_vec())?;
            match overflow::compare(&mut self.space, &stored, MAX_STORED_KEY, key)? {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo - 1)
    }

    fn find_record(&mut self, addr: i64, key: &[u8]) -> Result<(usize, bool)> {
        let count = self.with_leaf(addr, |leaf| leaf.record_count())?;
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let stored = self.with_leaf(addr, |leaf| leaf.key(mid).to_vec())?;
            match overflow::compare(&mut self.space, &stored, MAX_STORED_KEY, key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    // ---- mutation ----

    fn insert_record(&mut self, path: &mut NodePath, key: &[u8], value: &[u8]) -> Result<()> {
        let stored_key = overflow::pack(&mut self.space, key, MAX_STORED_KEY)?;
        let stored_value = overflow::pack(&mut self.space, value, MAX_STORED_VALUE)?;
        let position = *path.last().unwrap();
        {
            let mut leaf = LeafView::new(self.space.access(position.addr)?);
            leaf.insert(position.index, &stored_key, &stored_value);
        }
        self.record_count += 1;
        self.payload_size += (key.len() + value.len()) as i64;
        if position.index == 0 {
            self.sync_key(path)?;
        }
        self.rebalance(path)
    }

    fn replace_value(&mut self, path: &mut NodePath, value: &[u8]) -> Result<()> {
        let position = *path.last().unwrap();
        let old_stored = self.with_leaf(position.addr, |leaf| leaf.value(position.index).to_vec())?;
        let old_len = overflow::unpacked_len(&mut self.space, &old_stored, MAX_STORED_VALUE)?;
        overflow::dispose(&mut self.space, &old_stored, MAX_STORED_VALUE)?;
        let new_stored = overflow::pack(&mut self.space, value, MAX_STORED_VALUE)?;
        {
            let mut leaf = LeafView::new(self.space.access(position.addr)?);
            leaf.set_value(position.index, &new_stored);
        }
        self.payload_size += value.len() as i64 - old_len as i64;
        // the size delta can push the leaf past either load bound
        self.rebalance(path)
    }

    /// After the record at index 0 of the leaf changed, rewrite the one
    /// ancestor separator that tracks it: the first ancestor reached through
    /// a child index >= 1. Ancestors entered through child 0 are transparent.
    fn sync_key(&mut self, path: &NodePath) -> Result<()> {
        let position = *path.last().unwrap();
        let first = {
            let leaf = LeafView::new(self.space.access(position.addr)?);
            if leaf.record_count() == 0 {
                return Ok(());
            }
            leaf.key(0).to_vec()
        };
        for level in (0..path.len() - 1).rev() {
            let entry = path[level];
            if entry.index >= 1 {
                let mut inner = InnerView::new(self.space.access(entry.addr)?);
                inner.set_key(entry.index, &first);
                break;
            }
        }
        Ok(())
    }

    // ---- rebalancing ----

    fn rebalance(&mut self, path: &mut NodePath) -> Result<()> {
        let mut level = 0;
        while level < path.len() {
            let mut rounds = 0;
            loop {
                let i = path.len() - 1 - level;
                let is_leaf = level == 0;
                let load = self.load_of(path[i].addr, is_leaf)?;
                let (under, over) = load_bounds(is_leaf);
                if load > over {
                    self.fix_overload(path, level)?;
                } else if load < under && i > 0 {
                    if !self.fix_underload(path, level)? {
                        break;
                    }
                } else {
                    break;
                }
                rounds += 1;
                debug_assert!(rounds < 8);
                if rounds >= 8 {
                    break;
                }
            }
            level += 1;
        }
        self.collapse_root()
    }

    fn fix_overload(&mut self, path: &mut NodePath, level: usize) -> Result<()> {
        if path.len() - 1 - level == 0 {
            self.grow_root(path)?;
        } else {
            // settle the parent first: a separator rewrite may have pushed it
            // past the bound, and the shift/split below writes into it
            let parent = path[path.len() - 2 - level].addr;
            if self.load_of(parent, false)? > INNER_OVERLOAD {
                self.fix_overload(path, level + 1)?;
            }
        }
        let i = path.len() - 1 - level;
        let is_leaf = level == 0;
        if self.try_shift_right(path, i, is_leaf)? {
            return Ok(());
        }
        if self.try_shift_left(path, i, is_leaf)? {
            return Ok(());
        }
        self.split(path, i, is_leaf)
    }

    fn fix_underload(&mut self, path: &mut NodePath, level: usize) -> Result<bool> {
        let i = path.len() - 1 - level;
        let is_leaf = level == 0;
        if self.with_inner(path[i - 1].addr, |inner| inner.child_count())? < 2 {
            // a single-child parent can only be the root; collapse handles it
            return Ok(false);
        }
        if self.try_borrow_right(path, i, is_leaf)? {
            return Ok(true);
        }
        if self.try_borrow_left(path, i, is_leaf)? {
            return Ok(true);
        }
        if self.try_merge_right(path, i, is_leaf)? {
            return Ok(true);
        }
        if self.try_merge_left(path, i, is_leaf)? {
            return Ok(true);
        }
        Ok(false)
    }

    fn grow_root(&mut self, path: &mut NodePath) -> Result<()> {
        let old_root = self.root_addr;
        let (addr, page) = self.space.allocate_aligned(NODE_SIZE)?;
        let mut root = InnerView::init(page);
        root.insert(0, b"", old_root);
        self.root_addr = addr;
        self.height += 1;
        self.non_leaf_count += 1;
        path.insert(0, PathEntry { addr, index: 0 });
        tracing::debug!(height = self.height, "growing tree");
        Ok(())
    }

    fn collapse_root(&mut self) -> Result<()> {
        while self.height > 1 {
            let (count, only_child) = {
                let view = InnerView::new(self.space.access(self.root_addr)?);
                (view.child_count(), view.child(0))
            };
            if count > 1 {
                break;
            }
            self.space.free_aligned(self.root_addr)?;
            self.root_addr = only_child;
            self.height -= 1;
            self.non_leaf_count -= 1;
            tracing::debug!(height = self.height, "demoting root");
        }
        Ok(())
    }

    fn try_shift_right(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index + 1 >= self.with_inner(parent, |inner| inner.child_count())? {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index + 1))?;
        let (under, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let (sizes, key_sizes) = self.entry_size_table(node, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index + 1).len())?
        };
        let count = sizes.len();

        let mut moved = 0usize;
        let mut sum = 0usize;
        for n in 1..count {
            let j = count - n;
            sum += sizes[j];
            let node_after = load - sum;
            let sibling_after = if is_leaf {
                sibling_load + sum
            } else {
                sibling_load + sum - key_sizes[j] + separator_len
            };
            if node_after < under || sibling_after > over || sum >= node_after {
                break;
            }
            if node_after <= over {
                moved = n;
                break;
            }
        }
        if moved == 0 {
            return Ok(false);
        }

        let retained = count - moved;
        tracing::trace!(node, sibling, moved, "shifting entries right");
        if is_leaf {
            let records = {
                let mut view = LeafView::new(self.space.access(node)?);
                let records = view.records(retained, count);
                view.remove_range(retained, count);
                records
            };
            {
                let mut view = LeafView::new(self.space.access(sibling)?);
                view.insert_records(0, &records);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index + 1, &records[0].key);
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index + 1).to_vec())?;
            let mut entries = {
                let mut view = InnerView::new(self.space.access(node)?);
                let entries = view.entries(retained, count);
                view.remove_range(retained, count);
                entries
            };
            let new_separator = std::mem::take(&mut entries[0].key);
            {
                let mut view = InnerView::new(self.space.access(sibling)?);
                view.set_key(0, &separator);
                view.insert_entries(0, &entries);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index + 1, &new_separator);
        }
        if path[i].index >= retained {
            path[i].addr = sibling;
            path[i].index -= retained;
            path[i - 1].index += 1;
        }
        Ok(true)
    }

    fn try_shift_left(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index == 0 {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index - 1))?;
        let (under, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let (sizes, key_sizes) = self.entry_size_table(node, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index).len())?
        };
        let count = sizes.len();

        let mut moved = 0usize;
        let mut sum = 0usize;
        for n in 1..count {
            sum += sizes[n - 1];
            let node_after = if is_leaf { load - sum } else { load - sum - key_sizes[n] };
            let sibling_after = if is_leaf {
                sibling_load + sum
            } else {
                sibling_load + sum + separator_len
            };
            if node_after < under || sibling_after > over || sum >= node_after {
                break;
            }
            if node_after <= over {
                moved = n;
                break;
            }
        }
        if moved == 0 {
            return Ok(false);
        }

        let sibling_count = if is_leaf {
            self.with_leaf(sibling, |leaf| leaf.record_count())?
        } else {
            self.with_inner(sibling, |inner| inner.child_count())?
        };
        tracing::trace!(node, sibling, moved, "shifting entries left");
        if is_leaf {
            let records = {
                let mut view = LeafView::new(self.space.access(node)?);
                let records = view.records(0, moved);
                view.remove_range(0, moved);
                records
            };
            {
                let mut view = LeafView::new(self.space.access(sibling)?);
                view.insert_records(sibling_count, &records);
            }
            let first = self.with_leaf(node, |leaf| leaf.key(0).to_vec())?;
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index, &first);
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index).to_vec())?;
            let mut entries = {
                let mut view = InnerView::new(self.space.access(node)?);
                let entries = view.entries(0, moved);
                view.remove_range(0, moved);
                entries
            };
            entries[0].key = separator;
            let new_separator = {
                let mut view = InnerView::new(self.space.access(node)?);
                let key = view.key(0).to_vec();
                view.set_key(0, b"");
                key
            };
            {
                let mut view = InnerView::new(self.space.access(sibling)?);
                view.insert_entries(sibling_count, &entries);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index, &new_separator);
        }
        if path[i].index < moved {
            path[i].addr = sibling;
            path[i].index += sibling_count;
            path[i - 1].index -= 1;
        } else {
            path[i].index -= moved;
        }
        Ok(true)
    }

    fn split(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<()> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        let node = path[i].addr;
        let (under, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let (sizes, key_sizes) = self.entry_size_table(node, is_leaf)?;
        let count = sizes.len();

        let mut moved = 0usize;
        let mut sum = 0usize;
        loop {
            if moved + 1 >= count {
                break;
            }
            let j = count - 1 - moved;
            let entry = sizes[j];
            let left_after = load - sum - entry;
            if left_after < under {
                break;
            }
            let right_after = sum + entry - if is_leaf { 0 } else { key_sizes[j] };
            if right_after > over {
                break;
            }
            if sum + entry >= left_after {
                break;
            }
            moved += 1;
            sum += entry;
            let left = load - sum;
            let right = sum - if is_leaf { 0 } else { key_sizes[count - moved] };
            if left <= over && right >= under {
                break;
            }
        }
        let moved = moved.max(1);
        let retained = count - moved;

        tracing::debug!(node, moved, retained, is_leaf, "splitting node");
        if is_leaf {
            let records = {
                let mut view = LeafView::new(self.space.access(node)?);
                let records = view.records(retained, count);
                view.remove_range(retained, count);
                records
            };
            let (new_addr, page) = self.space.allocate_aligned(NODE_SIZE)?;
            LeafView::init(page);
            {
                let mut view = LeafView::new(self.space.access(new_addr)?);
                view.insert_records(0, &records);
            }
            self.leaf_count += 1;
            self.splice_after(node, new_addr)?;
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.insert(my_index + 1, &records[0].key, new_addr);
        } else {
            let mut entries = {
                let mut view = InnerView::new(self.space.access(node)?);
                let entries = view.entries(retained, count);
                view.remove_range(retained, count);
                entries
            };
            let promoted = std::mem::take(&mut entries[0].key);
            let (new_addr, page) = self.space.allocate_aligned(NODE_SIZE)?;
            InnerView::init(page);
            {
                let mut view = InnerView::new(self.space.access(new_addr)?);
                view.insert_entries(0, &entries);
            }
            self.non_leaf_count += 1;
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.insert(my_index + 1, &promoted, new_addr);
        }
        if path[i].index >= retained {
            let sibling = self.with_inner(parent, |inner| inner.child(my_index + 1))?;
            path[i].addr = sibling;
            path[i].index -= retained;
            path[i - 1].index += 1;
        }
        Ok(())
    }

    fn try_borrow_right(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index + 1 >= self.with_inner(parent, |inner| inner.child_count())? {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index + 1))?;
        let (under, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let (sizes, key_sizes) = self.entry_size_table(sibling, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index + 1).len())?
        };
        let count = sizes.len();

        let mut moved = 0usize;
        let mut sum = 0usize;
        for n in 1..count {
            sum += sizes[n - 1];
            let sibling_after = if is_leaf {
                sibling_load - sum
            } else {
                sibling_load - sum - key_sizes[n]
            };
            let node_after = if is_leaf {
                load + sum
            } else {
                load + sum + separator_len
            };
            if sibling_after < under || node_after > over || sum >= sibling_after {
                break;
            }
            if node_after >= under {
                moved = n;
                break;
            }
        }
        if moved == 0 {
            return Ok(false);
        }

        let node_count = if is_leaf {
            self.with_leaf(node, |leaf| leaf.record_count())?
        } else {
            self.with_inner(node, |inner| inner.child_count())?
        };
        tracing::trace!(node, sibling, moved, "borrowing from right sibling");
        if is_leaf {
            let records = {
                let mut view = LeafView::new(self.space.access(sibling)?);
                let records = view.records(0, moved);
                view.remove_range(0, moved);
                records
            };
            {
                let mut view = LeafView::new(self.space.access(node)?);
                view.insert_records(node_count, &records);
            }
            let first = self.with_leaf(sibling, |leaf| leaf.key(0).to_vec())?;
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index + 1, &first);
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index + 1).to_vec())?;
            let mut entries = {
                let mut view = InnerView::new(self.space.access(sibling)?);
                let entries = view.entries(0, moved);
                view.remove_range(0, moved);
                entries
            };
            entries[0].key = separator;
            let new_separator = {
                let mut view = InnerView::new(self.space.access(sibling)?);
                let key = view.key(0).to_vec();
                view.set_key(0, b"");
                key
            };
            {
                let mut view = InnerView::new(self.space.access(node)?);
                view.insert_entries(node_count, &entries);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index + 1, &new_separator);
        }
        Ok(true)
    }

    fn try_borrow_left(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index == 0 {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index - 1))?;
        let (under, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let (sizes, key_sizes) = self.entry_size_table(sibling, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index).len())?
        };
        let count = sizes.len();

        let mut moved = 0usize;
        let mut sum = 0usize;
        for n in 1..count {
            let j = count - n;
            sum += sizes[j];
            let sibling_after = sibling_load - sum;
            let node_after = if is_leaf {
                load + sum
            } else {
                load + sum - key_sizes[j] + separator_len
            };
            if sibling_after < under || node_after > over || sum >= sibling_after {
                break;
            }
            if node_after >= under {
                moved = n;
                break;
            }
        }
        if moved == 0 {
            return Ok(false);
        }

        tracing::trace!(node, sibling, moved, "borrowing from left sibling");
        if is_leaf {
            let records = {
                let mut view = LeafView::new(self.space.access(sibling)?);
                let sibling_count = view.record_count();
                let records = view.records(sibling_count - moved, sibling_count);
                view.remove_range(sibling_count - moved, sibling_count);
                records
            };
            {
                let mut view = LeafView::new(self.space.access(node)?);
                view.insert_records(0, &records);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index, &records[0].key);
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index).to_vec())?;
            let mut entries = {
                let mut view = InnerView::new(self.space.access(sibling)?);
                let sibling_count = view.child_count();
                let entries = view.entries(sibling_count - moved, sibling_count);
                view.remove_range(sibling_count - moved, sibling_count);
                entries
            };
            let new_separator = std::mem::take(&mut entries[0].key);
            {
                let mut view = InnerView::new(self.space.access(node)?);
                view.set_key(0, &separator);
                view.insert_entries(0, &entries);
            }
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.set_key(my_index, &new_separator);
        }
        path[i].index += moved;
        Ok(true)
    }

    fn try_merge_right(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index + 1 >= self.with_inner(parent, |inner| inner.child_count())? {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index + 1))?;
        let (_, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index + 1).len())?
        };
        if load + sibling_load + separator_len > over {
            return Ok(false);
        }

        tracing::debug!(node, sibling, is_leaf, "merging right sibling");
        if is_leaf {
            let records = {
                let view = LeafView::new(self.space.access(sibling)?);
                let count = view.record_count();
                view.records(0, count)
            };
            let node_count = self.with_leaf(node, |leaf| leaf.record_count())?;
            {
                let mut view = LeafView::new(self.space.access(node)?);
                view.insert_records(node_count, &records);
            }
            self.unlink_leaf(sibling)?;
            self.space.free_aligned(sibling)?;
            self.leaf_count -= 1;
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index + 1).to_vec())?;
            let mut entries = {
                let view = InnerView::new(self.space.access(sibling)?);
                view.entries(0, view.child_count())
            };
            entries[0].key = separator;
            let node_count = self.with_inner(node, |inner| inner.child_count())?;
            {
                let mut view = InnerView::new(self.space.access(node)?);
                view.insert_entries(node_count, &entries);
            }
            self.space.free_aligned(sibling)?;
            self.non_leaf_count -= 1;
        }
        let mut parent_view = InnerView::new(self.space.access(parent)?);
        parent_view.remove(my_index + 1);
        Ok(true)
    }

    fn try_merge_left(&mut self, path: &mut NodePath, i: usize, is_leaf: bool) -> Result<bool> {
        let parent = path[i - 1].addr;
        let my_index = path[i - 1].index;
        if my_index == 0 {
            return Ok(false);
        }
        let node = path[i].addr;
        let sibling = self.with_inner(parent, |inner| inner.child(my_index - 1))?;
        let (_, over) = load_bounds(is_leaf);
        let load = self.load_of(node, is_leaf)?;
        let sibling_load = self.load_of(sibling, is_leaf)?;
        let separator_len = if is_leaf {
            0
        } else {
            self.with_inner(parent, |inner| inner.key(my_index).len())?
        };
        if load + sibling_load + separator_len > over {
            return Ok(false);
        }

        let sibling_count = if is_leaf {
            self.with_leaf(sibling, |leaf| leaf.record_count())?
        } else {
            self.with_inner(sibling, |inner| inner.child_count())?
        };
        tracing::debug!(node, sibling, is_leaf, "merging into left sibling");
        if is_leaf {
            let records = {
                let view = LeafView::new(self.space.access(node)?);
                let count = view.record_count();
                view.records(0, count)
            };
            {
                let mut view = LeafView::new(self.space.access(sibling)?);
                view.insert_records(sibling_count, &records);
            }
            self.unlink_leaf(node)?;
            self.space.free_aligned(node)?;
            self.leaf_count -= 1;
        } else {
            let separator = self.with_inner(parent, |inner| inner.key(my_index).to_vec())?;
            let mut entries = {
                let view = InnerView::new(self.space.access(node)?);
                view.entries(0, view.child_count())
            };
            entries[0].key = separator;
            {
                let mut view = InnerView::new(self.space.access(sibling)?);
                view.insert_entries(sibling_count, &entries);
            }
            self.space.free_aligned(node)?;
            self.non_leaf_count -= 1;
        }
        {
            let mut parent_view = InnerView::new(self.space.access(parent)?);
            parent_view.remove(my_index);
        }
        path[i].addr = sibling;
        path[i].index += sibling_count;
        path[i - 1].index -= 1;
        Ok(true)
    }

    // ---- leaf chain ----

    fn splice_after(&mut self, leaf: i64, new_leaf: i64) -> Result<()> {
        let next = self.with_leaf(leaf, |view| view.next())?;
        {
            let mut view = LeafView::new(self.space.access(new_leaf)?);
            view.set_prev(leaf);
            view.set_next(next);
        }
        {
            let mut view = LeafView::new(self.space.access(leaf)?);
            view.set_next(new_leaf);
        }
        {
            let mut view = LeafView::new(self.space.access(next)?);
            view.set_prev(new_leaf);
        }
        if self.leaf_tail_addr == leaf {
            self.leaf_tail_addr = new_leaf;
        }
        Ok(())
    }

    fn unlink_leaf(&mut self, leaf: i64) -> Result<()> {
        let (prev, next) = self.with_leaf(leaf, |view| (view.prev(), view.next()))?;
        {
            let mut view = LeafView::new(self.space.access(prev)?);
            view.set_next(next);
        }
        {
            let mut view = LeafView::new(self.space.access(next)?);
            view.set_prev(prev);
        }
        if self.leaf_head_addr == leaf {
            self.leaf_head_addr = next;
        }
        if self.leaf_tail_addr == leaf {
            self.leaf_tail_addr = prev;
        }
        Ok(())
    }

    // ---- ranges ----

    fn range(&mut self, min: RangeKey, max: RangeKey, backward: bool) -> Result<RangeIter<'_>> {
        let endpoints = self.resolve_range(&min, &max)?;
        Ok(match endpoints {
            None => RangeIter {
                dict: self,
                leaf: NIL_ADDR,
                index: 0,
                end_leaf: NIL_ADDR,
                end_index: 0,
                backward,
                at_end: true,
            },
            Some((start, end)) => {
                let (first, terminal) = if backward { (end, start) } else { (start, end) };
                RangeIter {
                    dict: self,
                    leaf: first.0,
                    index: first.1,
                    end_leaf: terminal.0,
                    end_index: terminal.1,
                    backward,
                    at_end: false,
                }
            }
        })
    }

    #[allow(clippy::type_complexity)]
    fn resolve_range(
        &mut self,
        min: &RangeKey,
        max: &RangeKey,
    ) -> Result<Option<((i64, usize), (i64, usize))>> {
        if self.record_count == 0 {
            return Ok(None);
        }
        if let (RangeKey::Key(a), RangeKey::Key(b)) = (min, max) {
            if a > b {
                return Ok(None);
            }
        }
        let start = match min {
            RangeKey::Min => (self.leaf_head_addr, 0),
            RangeKey::Max => self.last_position()?,
            RangeKey::Key(key) => match self.position_at_or_after(key)? {
                Some(position) => position,
                None => return Ok(None),
            },
        };
        let end = match max {
            RangeKey::Min => (self.leaf_head_addr, 0),
            RangeKey::Max => self.last_position()?,
            RangeKey::Key(key) => match self.position_at_or_before(key)? {
                Some(position) => position,
                None => return Ok(None),
            },
        };
        if start != end {
            let first = self.raw_key_at(start.0, start.1)?;
            let last = self.raw_key_at(end.0, end.1)?;
            if first > last {
                return Ok(None);
            }
        }
        Ok(Some((start, end)))
    }

    fn last_position(&mut self) -> Result<(i64, usize)> {
        let tail = self.leaf_tail_addr;
        let count = self.with_leaf(tail, |leaf| leaf.record_count())?;
        debug_assert!(count > 0);
        Ok((tail, count - 1))
    }

    fn position_at_or_after(&mut self, key: &[u8]) -> Result<Option<(i64, usize)>> {
        let (path, found) = self.search(key)?;
        let position = *path.last().unwrap();
        if found {
            return Ok(Some((position.addr, position.index)));
        }
        let count = self.with_leaf(position.addr, |leaf| leaf.record_count())?;
        if position.index < count {
            return Ok(Some((position.addr, position.index)));
        }
        if position.addr == self.leaf_tail_addr {
            return Ok(None);
        }
        let next = self.with_leaf(position.addr, |leaf| leaf.next())?;
        Ok(Some((next, 0)))
    }

    fn position_at_or_before(&mut self, key: &[u8]) -> Result<Option<(i64, usize)>> {
        let (path, found) = self.search(key)?;
        let position = *path.last().unwrap();
        if found {
            return Ok(Some((position.addr, position.index)));
        }
        if position.index > 0 {
            return Ok(Some((position.addr, position.index - 1)));
        }
        if position.addr == self.leaf_head_addr {
            return Ok(None);
        }
        let prev = self.with_leaf(position.addr, |leaf| leaf.prev())?;
        let count = self.with_leaf(prev, |leaf| leaf.record_count())?;
        Ok(Some((prev, count - 1)))
    }

    // ---- node access helpers ----

    fn with_leaf<R>(&mut self, addr: i64, f: impl FnOnce(&mut LeafView) -> R) -> Result<R> {
        let mut view = LeafView::new(self.space.access(addr)?);
        Ok(f(&mut view))
    }

    fn with_inner<R>(&mut self, addr: i64, f: impl FnOnce(&mut InnerView) -> R) -> Result<R> {
        let mut view = InnerView::new(self.space.access(addr)?);
        Ok(f(&mut view))
    }

    fn load_of(&mut self, addr: i64, is_leaf: bool) -> Result<usize> {
        if is_leaf {
            self.with_leaf(addr, |leaf| leaf.load_size())
        } else {
            self.with_inner(addr, |inner| inner.load_size())
        }
    }

    fn entry_size_table(&mut self, addr: i64, is_leaf: bool) -> Result<(Vec<usize>, Vec<usize>)> {
        if is_leaf {
            Ok((self.with_leaf(addr, |leaf| leaf.record_sizes())?, Vec::new()))
        } else {
            self.with_inner(addr, |inner| (inner.entry_sizes(), inner.key_sizes()))
        }
    }

    fn stored_record(&mut self, addr: i64, index: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        self.with_leaf(addr, |leaf| (leaf.key(index).to_vec(), leaf.value(index).to_vec()))
    }

    fn raw_key_at(&mut self, addr: i64, index: usize) -> Result<Vec<u8>> {
        let stored = self.with_leaf(addr, |leaf| leaf.key(index).to_vec())?;
        overflow::unpack(&mut self.space, &stored, MAX_STORED_KEY)
    }

    fn raw_value_at(&mut self, addr: i64, index: usize) -> Result<Vec<u8>> {
        let stored = self.with_leaf(addr, |leaf| leaf.value(index).to_vec())?;
        overflow::unpack(&mut self.space, &stored, MAX_STORED_VALUE)
    }

    #[cfg(test)]
    pub(crate) fn validate(&mut self) {
        let root = self.root_addr;
        let height = self.height;
        let mut counts = (0i64, 0i64, 0i64, 0i64);
        self.validate_node(root, height, true, &mut counts);
        let (leaves, inners, records, payload) = counts;
        assert_eq!(leaves, self.leaf_count);
        assert_eq!(inners, self.non_leaf_count);
        assert_eq!(records, self.record_count);
        assert_eq!(payload, self.payload_size);

        // chain walk: head to tail visits every leaf once, in key order
        let mut visited = 0i64;
        let mut previous: Option<Vec<u8>> = None;
        let mut addr = self.leaf_head_addr;
        loop {
            let count = self.with_leaf(addr, |leaf| leaf.record_count()).unwrap();
            for index in 0..count {
                let key = self.raw_key_at(addr, index).unwrap();
                if let Some(previous) = &previous {
                    assert!(previous < &key);
                }
                previous = Some(key);
            }
            visited += 1;
            assert!(visited <= self.leaf_count);
            if addr == self.leaf_tail_addr {
                break;
            }
            addr = self.with_leaf(addr, |leaf| leaf.next()).unwrap();
        }
        assert_eq!(visited, self.leaf_count);
        let head_prev = self.with_leaf(self.leaf_head_addr, |leaf| leaf.prev()).unwrap();
        let tail_next = self.with_leaf(self.leaf_tail_addr, |leaf| leaf.next()).unwrap();
        assert_eq!(head_prev, self.leaf_tail_addr);
        assert_eq!(tail_next, self.leaf_head_addr);
    }

    /// Returns the stored form of the subtree's smallest key.
    #[cfg(test)]
    fn validate_node(
        &mut self,
        addr: i64,
        level: i64,
        is_root: bool,
        counts: &mut (i64, i64, i64, i64),
    ) -> Vec<u8> {
        if level == 1 {
            let (count, load) =
                self.with_leaf(addr, |leaf| (leaf.record_count(), leaf.load_size())).unwrap();
            assert!(load <= LEAF_OVERLOAD);
            if !is_root {
                assert!(load >= LEAF_UNDERLOAD);
            }
            counts.0 += 1;
            counts.2 += count as i64;
            let mut previous: Option<Vec<u8>> = None;
            for index in 0..count {
                let key = self.raw_key_at(addr, index).unwrap();
                let value = self.raw_value_at(addr, index).unwrap();
                counts.3 += (key.len() + value.len()) as i64;
                if let Some(previous) = &previous {
                    assert!(previous < &key);
                }
                previous = Some(key);
            }
            if count == 0 {
                assert!(is_root);
                return Vec::new();
            }
            return self.with_leaf(addr, |leaf| leaf.key(0).to_vec()).unwrap();
        }

        let (count, load) =
            self.with_inner(addr, |inner| (inner.child_count(), inner.load_size())).unwrap();
        assert!(load <= INNER_OVERLOAD);
        if !is_root {
            assert!(load >= INNER_UNDERLOAD);
        }
        assert!(count >= 1);
        assert!(self.with_inner(addr, |inner| inner.key(0).is_empty()).unwrap());
        counts.1 += 1;
        let mut smallest = Vec::new();
        for index in 0..count {
            let child = self.with_inner(addr, |inner| inner.child(index)).unwrap();
            let child_min = self.validate_node(child, level - 1, false, counts);
            if index == 0 {
                smallest = child_min;
            } else {
                // separators are byte copies of the child's smallest stored key
                let separator = self.with_inner(addr, |inner| inner.key(index).to_vec()).unwrap();
                assert_eq!(separator, child_min);
            }
        }
        smallest
    }
}

fn load_bounds(is_leaf: bool) -> (usize, usize) {
    if is_leaf {
        (LEAF_UNDERLOAD, LEAF_OVERLOAD)
    } else {
        (INNER_UNDERLOAD, INNER_OVERLOAD)
    }
}

/// Inclusive range iterator. Holds a mutable borrow of the dictionary, so
/// the tree cannot change under it.
pub struct RangeIter<'a> {
    dict: &'a mut OrderedDict,
    leaf: i64,
    index: usize,
    end_leaf: i64,
    end_index: usize,
    backward: bool,
    at_end: bool,
}

impl RangeIter<'_> {
    pub fn is_at_end(&self) -> bool {
        self.at_end
    }

    pub fn read_key(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.dict.raw_key_at(self.leaf, self.index)
    }

    pub fn read_value(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.dict.raw_value_at(self.leaf, self.index)
    }

    pub fn read_record(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.ensure_live()?;
        let key = self.dict.raw_key_at(self.leaf, self.index)?;
        let value = self.dict.raw_value_at(self.leaf, self.index)?;
        Ok((key, value))
    }

    pub fn advance(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.leaf == self.end_leaf && self.index == self.end_index {
            self.at_end = true;
            return Ok(());
        }
        if self.backward {
            if self.index > 0 {
                self.index -= 1;
            } else {
                let prev = self.dict.with_leaf(self.leaf, |leaf| leaf.prev())?;
                let count = self.dict.with_leaf(prev, |leaf| leaf.record_count())?;
                self.leaf = prev;
                self.index = count - 1;
            }
        } else {
            self.index += 1;
            let count = self.dict.with_leaf(self.leaf, |leaf| leaf.record_count())?;
            if self.index >= count {
                self.leaf = self.dict.with_leaf(self.leaf, |leaf| leaf.next())?;
                self.index = 0;
            }
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.at_end {
            return Err(Error::ExhaustedIterator);
        }
        Ok(())
    }
}
