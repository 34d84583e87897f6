//! Module `tree` implement the B-tree engine over bucket pages.
//!
//! The tree is homed in the same data files as the records it indexes.
//! Bucket pages come from an internal page free list anchored in file 0's
//! header, separate from the extent free list; a page that collapses is
//! zeroed and pushed back. Non-root buckets carry a parent pointer, so
//! split fix-ups walk upward without a traversal stack.
//!
//! Deletion marks slots unused in place -- the slot keeps ordering
//! neighbours apart and cursors positioned on it stay valid. Unused slots
//! are dropped opportunistically when a bucket would otherwise split, and
//! a leaf losing its last slot collapses.

use log::debug;

use std::convert::TryFrom;

use crate::{
    btree::{
        bucket,
        key::{self, IndexKey, KeyOrder},
    },
    loc::{DiskLoc, RecRef},
    store::{alloc, Inner},
    Error, Result,
};

/// Allocate a zeroed bucket page: pop the page free list, else carve the
/// newest file's tail.
pub fn alloc_bucket(inner: &mut Inner, parent: DiskLoc) -> Result<DiskLoc> {
    let size = inner.config.bucket_size;
    let mut header = inner.files.file(0)?.load_header()?;
    let loc = if header.bucket_free.is_null() {
        match alloc::carve_tail(inner, u32::try_from(size).unwrap())? {
            Some(loc) => loc,
            None => {
                alloc::grow_for_bucket(inner)?;
                match alloc::carve_tail(inner, u32::try_from(size).unwrap())? {
                    Some(loc) => loc,
                    None => err_at!(StorageFull, msg: "no page for bucket")?,
                }
            }
        }
    } else {
        let loc = header.bucket_free;
        header.bucket_free = DiskLoc::from_bytes(inner.read(loc, 8)?)?;
        inner.files.file_mut(0)?.store_header(&header);
        loc
    };

    let page = inner.write(loc, size)?;
    bucket::init(page, parent);
    Ok(loc)
}

/// Zero a collapsed bucket page and push it onto the page free list.
/// Cursors positioned on it learn through the registry first.
pub fn free_bucket(inner: &mut Inner, loc: DiskLoc) -> Result<()> {
    let registry = std::sync::Arc::clone(&inner.registry);
    registry.about_to_delete_bucket(loc);

    let size = inner.config.bucket_size;
    let mut header = inner.files.file(0)?.load_header()?;
    let page = inner.write(loc, size)?;
    for b in page.iter_mut() {
        *b = 0;
    }
    page[..8].copy_from_slice(&header.bucket_free.to_bytes());
    header.bucket_free = loc;
    inner.files.file_mut(0)?.store_header(&header);
    debug!(target: "btree", "freed bucket {}", loc);
    Ok(())
}

/// True when a record other than `self_loc` already carries `key`.
/// Unused slots do not count.
pub fn would_create_dup(
    inner: &Inner,
    root: DiskLoc,
    key: &IndexKey,
    self_loc: DiskLoc,
    order: &KeyOrder,
) -> Result<bool> {
    if root.is_null() {
        return Ok(false);
    }
    let mut cur = match locate(inner, root, key.as_bytes(), 0, 1, order)? {
        Some(cur) => cur,
        None => return Ok(false),
    };
    loop {
        let page = inner.read(cur.0, inner.config.bucket_size)?;
        let slot = bucket::slot(page, cur.1);
        match key::compare(bucket::slot_key(page, cur.1), key.as_bytes(), order)? {
            std::cmp::Ordering::Equal => {
                if !slot.rec.is_unused() && slot.rec.loc() != self_loc {
                    return Ok(true);
                }
            }
            _ => return Ok(false),
        }
        cur = match advance_raw(inner, cur.0, cur.1, 1)? {
            Some(cur) => cur,
            None => return Ok(false),
        };
    }
}

/// Insert `(key, rec_loc)` into index slot `idx_no` of the collection at
/// `desc_loc`, splitting buckets as needed. A root split updates the
/// descriptor's head in place. `unique` rejects an equal key from a
/// different record with DuplicateKey.
pub fn insert(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    idx_no: usize,
    key: &IndexKey,
    rec_loc: DiskLoc,
    unique: bool,
    order: &KeyOrder,
) -> Result<()> {
    if key.len() > bucket::max_key_len(inner.config.bucket_size) {
        err_at!(KeyTooLarge, msg: "key of {} bytes", key.len())?
    }

    let mut desc = inner.load_desc(desc_loc)?;
    let head = desc.indexes[idx_no].head;

    if head.is_null() {
        let root = alloc_bucket(inner, DiskLoc::NULL)?;
        let page = inner.write(root, inner.config.bucket_size)?;
        bucket::basic_insert(page, 0, key.as_bytes(), RecRef::new(rec_loc), DiskLoc::NULL)?;
        desc.indexes[idx_no].head = root;
        return inner.store_desc(desc_loc, &desc);
    }

    if unique && would_create_dup(inner, head, key, rec_loc, order)? {
        err_at!(DuplicateKey, msg: "key {:?}", key)?
    }

    // descend to the leaf position.
    let mut cur = head;
    loop {
        let page = inner.read(cur, inner.config.bucket_size)?;
        let (pos, found) = bucket::search(page, key.as_bytes(), rec_loc.as_u64(), order)?;
        if found {
            let slot = bucket::slot(page, pos);
            if slot.rec.is_unused() {
                // the pair was unindexed earlier, revive the slot.
                let mut rec = slot.rec;
                rec.set_used();
                let page = inner.write(cur, inner.config.bucket_size)?;
                bucket::set_slot_rec(page, pos, rec);
                return Ok(());
            }
            err_at!(Fatal, msg: "key+loc already indexed at {}", cur)?
        }
        let child = bucket::child_for_pos(page, pos);
        if child.is_null() {
            return insert_here(
                inner,
                desc_loc,
                idx_no,
                cur,
                pos,
                key.as_bytes(),
                RecRef::new(rec_loc),
                DiskLoc::NULL,
                DiskLoc::NULL,
                order,
            );
        }
        cur = child;
    }
}

// Insert at a known position, splitting when the bucket is full. `lchild`
// and `rchild` carry the split products when the inserted key is a
// promoted median.
#[allow(clippy::too_many_arguments)]
fn insert_here(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    idx_no: usize,
    bucket_loc: DiskLoc,
    pos: usize,
    key: &[u8],
    rec: RecRef,
    lchild: DiskLoc,
    rchild: DiskLoc,
    order: &KeyOrder,
) -> Result<()> {
    let size = inner.config.bucket_size;
    let fitted = {
        let page = inner.write(bucket_loc, size)?;
        if bucket::basic_insert(page, pos, key, rec, lchild)? {
            if !rchild.is_null() {
                bucket::set_child_for_pos(page, pos + 1, rchild);
            }
            true
        } else {
            false
        }
    };
    if fitted {
        if !lchild.is_null() {
            set_parent(inner, lchild, bucket_loc)?;
        }
        if !rchild.is_null() {
            set_parent(inner, rchild, bucket_loc)?;
        }
        return Ok(());
    }
    split(inner, desc_loc, idx_no, bucket_loc, key, rec, lchild, rchild, order)
}

// Split `bucket_loc` to make room for `(key, rec)`. Unused slots are
// compacted first; if that frees enough space the split is avoided.
#[allow(clippy::too_many_arguments)]
fn split(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    idx_no: usize,
    bucket_loc: DiskLoc,
    key: &[u8],
    rec: RecRef,
    lchild: DiskLoc,
    rchild: DiskLoc,
    order: &KeyOrder,
) -> Result<()> {
    let size = inner.config.bucket_size;

    let compacted = {
        let page = inner.write(bucket_loc, size)?;
        let dropped = bucket::compact_unused(page);
        if dropped > 0 {
            bucket::repack(page)?;
        }
        dropped
    };
    if compacted > 0 {
        debug!(target: "btree", "compacted {} tombstones in {}", compacted, bucket_loc);
        let (pos, _) = {
            let page = inner.read(bucket_loc, size)?;
            bucket::search(page, key, rec.as_u64(), order)?
        };
        // positions moved, retry the plain insert path once.
        let fitted = {
            let page = inner.write(bucket_loc, size)?;
            if bucket::basic_insert(page, pos, key, rec, lchild)? {
                if !rchild.is_null() {
                    bucket::set_child_for_pos(page, pos + 1, rchild);
                }
                true
            } else {
                false
            }
        };
        if fitted {
            if !lchild.is_null() {
                set_parent(inner, lchild, bucket_loc)?;
            }
            if !rchild.is_null() {
                set_parent(inner, rchild, bucket_loc)?;
            }
            return Ok(());
        }
    }

    // lift the whole bucket into memory.
    let (items, old_next_child, old_parent, keypos) = {
        let page = inner.read(bucket_loc, size)?;
        let count = bucket::n(page);
        let mut items: Vec<(Vec<u8>, RecRef, DiskLoc)> = Vec::with_capacity(count);
        for i in 0..count {
            let s = bucket::slot(page, i);
            items.push((bucket::slot_key(page, i).to_vec(), s.rec, s.left));
        }
        let (keypos, _) = bucket::search(page, key, rec.as_u64(), order)?;
        (items, bucket::next_child(page), bucket::parent(page), keypos)
    };
    let count = items.len();

    // a rightmost insert biases the split so the new right sibling starts
    // with just the incoming key, optimizing monotonically increasing
    // key streams.
    let split_pos = if keypos == count { count - 1 } else { count / 2 };
    let (promo_key, promo_rec, promo_left) = items[split_pos].clone();

    let right_loc = alloc_bucket(inner, old_parent)?;
    debug!(
        target: "btree",
        "split {} at {}/{} new right {}", bucket_loc, split_pos, count, right_loc
    );

    {
        let page = inner.write(right_loc, size)?;
        for (k, r, l) in items[split_pos + 1..].iter() {
            bucket::push_back(page, k, *r, *l)?;
        }
        bucket::set_next_child(page, old_next_child);
    }
    for (_, _, l) in items[split_pos + 1..].iter() {
        if !l.is_null() {
            set_parent(inner, *l, right_loc)?;
        }
    }
    if !old_next_child.is_null() {
        set_parent(inner, old_next_child, right_loc)?;
    }

    {
        let page = inner.write(bucket_loc, size)?;
        bucket::init(page, old_parent);
        for (k, r, l) in items[..split_pos].iter() {
            bucket::push_back(page, k, *r, *l)?;
        }
        bucket::set_next_child(page, promo_left);
    }

    // place the pending key into the proper half.
    let target = if keypos <= split_pos { bucket_loc } else { right_loc };
    let (pos, _) = {
        let page = inner.read(target, size)?;
        bucket::search(page, key, rec.as_u64(), order)?
    };
    insert_here(inner, desc_loc, idx_no, target, pos, key, rec, lchild, rchild, order)?;

    // promote the median.
    if old_parent.is_null() {
        let new_root = alloc_bucket(inner, DiskLoc::NULL)?;
        {
            let page = inner.write(new_root, size)?;
            bucket::basic_insert(page, 0, &promo_key, promo_rec, bucket_loc)?;
            bucket::set_next_child(page, right_loc);
        }
        set_parent(inner, bucket_loc, new_root)?;
        set_parent(inner, right_loc, new_root)?;
        let mut desc = inner.load_desc(desc_loc)?;
        desc.indexes[idx_no].head = new_root;
        inner.store_desc(desc_loc, &desc)?;
        debug!(target: "btree", "new root {} for index {}", new_root, idx_no);
        Ok(())
    } else {
        let (ppos, _) = {
            let page = inner.read(old_parent, size)?;
            bucket::search(page, &promo_key, promo_rec.as_u64(), order)?
        };
        insert_here(
            inner, desc_loc, idx_no, old_parent, ppos, &promo_key, promo_rec,
            bucket_loc, right_loc, order,
        )
    }
}

fn set_parent(inner: &mut Inner, bucket_loc: DiskLoc, parent: DiskLoc) -> Result<()> {
    let size = inner.config.bucket_size;
    let page = inner.write(bucket_loc, size)?;
    bucket::set_parent(page, parent);
    Ok(())
}

/// Mark the slot holding `(key, rec_loc)` unused. The slot stays in place
/// for comparator ordering; a leaf losing its last live slot collapses.
/// Returns false when the pair is absent or already unused.
pub fn unindex(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    idx_no: usize,
    key: &IndexKey,
    rec_loc: DiskLoc,
    order: &KeyOrder,
) -> Result<bool> {
    let size = inner.config.bucket_size;
    let desc = inner.load_desc(desc_loc)?;
    let head = desc.indexes[idx_no].head;
    if head.is_null() {
        return Ok(false);
    }

    // descend to the exact pair.
    let mut cur = head;
    let (bucket_loc, pos) = loop {
        let page = inner.read(cur, size)?;
        let (pos, found) = bucket::search(page, key.as_bytes(), rec_loc.as_u64(), order)?;
        if found {
            break (cur, pos);
        }
        let child = bucket::child_for_pos(page, pos);
        if child.is_null() {
            return Ok(false);
        }
        cur = child;
    };

    let (is_unused, is_leaf, live) = {
        let page = inner.read(bucket_loc, size)?;
        let s = bucket::slot(page, pos);
        (s.rec.is_unused(), bucket::is_leaf(page), bucket::live_slots(page))
    };
    if is_unused {
        return Ok(false);
    }

    if is_leaf && live == 1 && bucket_loc != head {
        // the last live slot of a non-root leaf: drop the bucket.
        collapse_leaf(inner, bucket_loc)?;
    } else {
        let page = inner.write(bucket_loc, size)?;
        let mut rec = bucket::slot(page, pos).rec;
        rec.set_unused();
        bucket::set_slot_rec(page, pos, rec);
    }
    Ok(true)
}

// Unlink an all-tombstone leaf from its parent and free its page. The
// parent keeps the slot with a null child, which reads as an empty
// subtree.
fn collapse_leaf(inner: &mut Inner, bucket_loc: DiskLoc) -> Result<()> {
    let size = inner.config.bucket_size;
    let parent = {
        let page = inner.read(bucket_loc, size)?;
        bucket::parent(page)
    };
    if !parent.is_null() {
        let idx = index_in_parent(inner, parent, bucket_loc)?;
        let page = inner.write(parent, size)?;
        bucket::set_child_for_pos(page, idx, DiskLoc::NULL);
    }
    free_bucket(inner, bucket_loc)
}

// Logical position of `child` inside `parent`: slot index whose left
// child it is, or n for the next-child.
fn index_in_parent(inner: &Inner, parent: DiskLoc, child: DiskLoc) -> Result<usize> {
    let page = inner.read(parent, inner.config.bucket_size)?;
    for i in 0..bucket::n(page) {
        if bucket::slot(page, i).left == child {
            return Ok(i);
        }
    }
    if bucket::next_child(page) == child {
        return Ok(bucket::n(page));
    }
    err_at!(Corruption, msg: "bucket {} not a child of {}", child, parent)
}

/// One in-order step from `(bucket_loc, pos)`. Does not skip unused
/// slots; cursors interleave their bound check between steps.
pub fn advance_raw(
    inner: &Inner,
    bucket_loc: DiskLoc,
    pos: usize,
    dir: i8,
) -> Result<Option<(DiskLoc, usize)>> {
    let size = inner.config.bucket_size;
    let page = inner.read(bucket_loc, size)?;
    let count = bucket::n(page);

    if dir >= 0 {
        let right = if pos + 1 <= count {
            bucket::child_for_pos(page, pos + 1)
        } else {
            DiskLoc::NULL
        };
        if !right.is_null() {
            return descend_edge(inner, right, 1);
        }
        if pos + 1 < count {
            return Ok(Some((bucket_loc, pos + 1)));
        }
        // past the last slot, climb.
        let mut child = bucket_loc;
        loop {
            let parent = {
                let page = inner.read(child, size)?;
                bucket::parent(page)
            };
            if parent.is_null() {
                return Ok(None);
            }
            let idx = index_in_parent(inner, parent, child)?;
            let pn = {
                let page = inner.read(parent, size)?;
                bucket::n(page)
            };
            if idx < pn {
                return Ok(Some((parent, idx)));
            }
            child = parent;
        }
    } else {
        let left = bucket::child_for_pos(page, pos);
        if !left.is_null() {
            return descend_edge(inner, left, -1);
        }
        if pos > 0 {
            return Ok(Some((bucket_loc, pos - 1)));
        }
        let mut child = bucket_loc;
        loop {
            let parent = {
                let page = inner.read(child, size)?;
                bucket::parent(page)
            };
            if parent.is_null() {
                return Ok(None);
            }
            let idx = index_in_parent(inner, parent, child)?;
            if idx > 0 {
                return Ok(Some((parent, idx - 1)));
            }
            child = parent;
        }
    }
}

/// In-order step skipping unused slots.
pub fn advance(
    inner: &Inner,
    bucket_loc: DiskLoc,
    pos: usize,
    dir: i8,
) -> Result<Option<(DiskLoc, usize)>> {
    let mut cur = (bucket_loc, pos);
    loop {
        cur = match advance_raw(inner, cur.0, cur.1, dir)? {
            Some(cur) => cur,
            None => return Ok(None),
        };
        let page = inner.read(cur.0, inner.config.bucket_size)?;
        if !bucket::slot(page, cur.1).rec.is_unused() {
            return Ok(Some(cur));
        }
    }
}

// walk to the leftmost (dir > 0) or rightmost (dir < 0) position under
// `bucket_loc`.
fn descend_edge(inner: &Inner, bucket_loc: DiskLoc, dir: i8) -> Result<Option<(DiskLoc, usize)>> {
    let size = inner.config.bucket_size;
    let mut cur = bucket_loc;
    loop {
        let page = inner.read(cur, size)?;
        let count = bucket::n(page);
        let child = if dir >= 0 {
            bucket::child_for_pos(page, 0)
        } else {
            bucket::child_for_pos(page, count)
        };
        if child.is_null() {
            if count == 0 {
                return Ok(None);
            }
            let pos = if dir >= 0 { 0 } else { count - 1 };
            return Ok(Some((cur, pos)));
        }
        cur = child;
    }
}

/// Position at the first slot whose `(key, loc)` is `>=` (forward) or
/// `<=` (reverse) the target. May land on an unused slot; the caller
/// skips. None when no slot qualifies.
pub fn locate(
    inner: &Inner,
    root: DiskLoc,
    key: &[u8],
    loc: u64,
    dir: i8,
    order: &KeyOrder,
) -> Result<Option<(DiskLoc, usize)>> {
    if root.is_null() {
        return Ok(None);
    }
    let size = inner.config.bucket_size;
    let mut best: Option<(DiskLoc, usize)> = None;
    let mut cur = root;
    loop {
        let page = inner.read(cur, size)?;
        let count = bucket::n(page);
        let (pos, found) = bucket::search(page, key, loc, order)?;
        if found {
            return Ok(Some((cur, pos)));
        }
        let child = if dir >= 0 {
            if pos < count {
                best = Some((cur, pos));
            }
            bucket::child_for_pos(page, pos)
        } else {
            if pos > 0 {
                best = Some((cur, pos - 1));
            }
            bucket::child_for_pos(page, pos)
        };
        if child.is_null() {
            return Ok(best);
        }
        cur = child;
    }
}

/// Owned copy of the key and record reference at a position.
pub fn key_at(inner: &Inner, bucket_loc: DiskLoc, pos: usize) -> Result<(Vec<u8>, RecRef)> {
    let page = inner.read(bucket_loc, inner.config.bucket_size)?;
    if pos >= bucket::n(page) {
        err_at!(Fatal, msg: "position {} in bucket {}", pos, bucket_loc)?
    }
    Ok((bucket::slot_key(page, pos).to_vec(), bucket::slot(page, pos).rec))
}

/// Free every bucket of the tree rooted at `root`.
pub fn free_tree(inner: &mut Inner, root: DiskLoc) -> Result<usize> {
    if root.is_null() {
        return Ok(0);
    }
    let size = inner.config.bucket_size;
    let mut stack = vec![root];
    let mut freed = 0;
    while let Some(loc) = stack.pop() {
        {
            let page = inner.read(loc, size)?;
            for i in 0..bucket::n(page) {
                let child = bucket::slot(page, i).left;
                if !child.is_null() {
                    stack.push(child);
                }
            }
            let child = bucket::next_child(page);
            if !child.is_null() {
                stack.push(child);
            }
        }
        free_bucket(inner, loc)?;
        freed += 1;
    }
    Ok(freed)
}

/// Structural statistics out of [validate_tree].
#[derive(Clone, Debug, Default)]
pub struct TreeStats {
    pub n_buckets: usize,
    pub n_slots: usize,
    pub n_used: usize,
    pub depth: usize,
}

/// Traverse the whole tree checking bucket invariants: slot order under
/// the comparator, subtree bounds, parent back-pointers, key bytes inside
/// the key region.
pub fn validate_tree(inner: &Inner, root: DiskLoc, order: &KeyOrder) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    if root.is_null() {
        return Ok(stats);
    }
    validate_bucket(inner, root, DiskLoc::NULL, None, None, order, 1, &mut stats)?;
    Ok(stats)
}

type Bound = Option<(Vec<u8>, u64)>;

#[allow(clippy::too_many_arguments)]
fn validate_bucket(
    inner: &Inner,
    loc: DiskLoc,
    parent: DiskLoc,
    lo: Bound,
    hi: Bound,
    order: &KeyOrder,
    depth: usize,
    stats: &mut TreeStats,
) -> Result<()> {
    use std::cmp::Ordering::Less;

    if depth > 100 {
        err_at!(Corruption, msg: "tree deeper than 100, cycle?")?
    }
    let size = inner.config.bucket_size;
    let page = inner.read(loc, size)?;
    if bucket::parent(page) != parent {
        err_at!(Corruption, msg: "bucket {} parent {} expected {}",
            loc, bucket::parent(page), parent)?
    }
    stats.n_buckets += 1;
    stats.depth = stats.depth.max(depth);

    let count = bucket::n(page);
    let mut pairs: Vec<(Vec<u8>, u64, DiskLoc)> = vec![];
    for i in 0..count {
        let s = bucket::slot(page, i);
        let ks = bucket::slot_key(page, i).to_vec();
        if (s.key_ofs as usize) < bucket::BKT_HDR_SIZE + count * bucket::SLOT_SIZE {
            err_at!(Corruption, msg: "key offset {} inside slot region", s.key_ofs)?
        }
        stats.n_slots += 1;
        if !s.rec.is_unused() {
            stats.n_used += 1;
        }
        pairs.push((ks, s.rec.as_u64(), s.left));
    }
    let next_child = bucket::next_child(page);

    let check = |a: &(Vec<u8>, u64), b: &(Vec<u8>, u64), what: &str| -> Result<()> {
        let ord = match key::compare(&a.0, &b.0, order)? {
            std::cmp::Ordering::Equal => a.1.cmp(&b.1),
            ord => ord,
        };
        if ord != Less {
            err_at!(Corruption, msg: "bucket {} {} out of order", loc, what)?
        }
        Ok(())
    };

    for w in pairs.windows(2) {
        check(&(w[0].0.clone(), w[0].1), &(w[1].0.clone(), w[1].1), "slots")?;
    }
    if let (Some(lo), Some(first)) = (&lo, pairs.first()) {
        check(lo, &(first.0.clone(), first.1), "low bound")?;
    }
    if let (Some(hi), Some(last)) = (&hi, pairs.last()) {
        check(&(last.0.clone(), last.1), hi, "high bound")?;
    }

    // recurse into children with tightened bounds.
    for (i, (ks, l, child)) in pairs.iter().enumerate() {
        if child.is_null() {
            continue;
        }
        let child_lo = if i == 0 {
            lo.clone()
        } else {
            Some((pairs[i - 1].0.clone(), pairs[i - 1].1))
        };
        let child_hi = Some((ks.clone(), *l));
        validate_bucket(inner, *child, loc, child_lo, child_hi, order, depth + 1, stats)?;
    }
    if !next_child.is_null() {
        let child_lo = pairs.last().map(|(k, l, _)| (k.clone(), *l));
        validate_bucket(inner, next_child, loc, child_lo, hi, order, depth + 1, stats)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
