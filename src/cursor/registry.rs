//! Module `registry` implement the process-wide cursor registry.
//!
//! The registry indexes live cursors two ways: by cursor id and by the
//! record locator each cursor currently rests on. Mutators call in before
//! destroying things a cursor might be holding -- a record about to be
//! deleted, a bucket about to be deallocated -- and the affected cursors
//! are nudged forward or told to re-seek.
//!
//! The registry's spinlock sits below the global lock in the hierarchy:
//! it is held only for insert/erase/lookup, never across a cursor
//! operation, and nothing here ever blocks on the global lock.

use rand::random;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    cursor::CursorCore,
    loc::DiskLoc,
    store::Inner,
    util::Spinlock,
    Error, Result,
};

/// Process-wide cursor registry. Shared outside the global lock.
pub struct CursorReg {
    state: Spinlock<RegState>,
}

#[derive(Default)]
struct RegState {
    by_id: HashMap<u64, Arc<Spinlock<CursorCore>>>,
    by_loc: HashMap<DiskLoc, Vec<u64>>,
}

impl Default for CursorReg {
    fn default() -> CursorReg {
        CursorReg::new()
    }
}

impl CursorReg {
    pub fn new() -> CursorReg {
        CursorReg { state: Spinlock::new(RegState::default()) }
    }

    /// Register a cursor, allocating its 64-bit id: current millis in the
    /// low half, random bits in the high half, top bit always set so zero
    /// stays reserved. Collisions re-roll.
    pub fn register(&self, core: CursorCore) -> Result<(u64, Arc<Spinlock<CursorCore>>)> {
        let loc = core.current_loc();
        let core = Arc::new(Spinlock::new(core));
        let mut state = self.state.write();
        let id = loop {
            let ms = err_at!(Fatal, SystemTime::now().duration_since(UNIX_EPOCH))?
                .as_millis() as u64;
            let id = ((u64::from(random::<u32>()) << 32) | (ms & 0xFFFF_FFFF))
                | 0x8000_0000_0000_0000;
            if !state.by_id.contains_key(&id) {
                break id;
            }
        };
        state.by_id.insert(id, Arc::clone(&core));
        if !loc.is_null() {
            state.by_loc.entry(loc).or_insert_with(Vec::new).push(id);
        }
        Ok((id, core))
    }

    pub fn unregister(&self, id: u64) {
        let mut state = self.state.write();
        if let Some(core) = state.by_id.remove(&id) {
            let loc = core.read().current_loc();
            unmap_loc(&mut state, id, loc);
        }
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Spinlock<CursorCore>>> {
        self.state.read().by_id.get(&id).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A cursor moved from `old` to `new`; keep the by-location index
    /// accurate.
    pub fn update_loc(&self, id: u64, old: DiskLoc, new: DiskLoc) {
        if old == new {
            return;
        }
        let mut state = self.state.write();
        unmap_loc(&mut state, id, old);
        if !new.is_null() {
            state.by_loc.entry(new).or_insert_with(Vec::new).push(id);
        }
    }

    /// The record at `loc` is about to be deleted: advance every cursor
    /// resting on it so the slot can vanish. Invoked under the global
    /// lock's exclusive mode, before the index entries go.
    pub fn about_to_delete(&self, inner: &mut Inner, loc: DiskLoc) -> Result<()> {
        let ids: Vec<u64> = match self.state.read().by_loc.get(&loc) {
            Some(ids) => ids.clone(),
            None => return Ok(()),
        };
        for id in ids.into_iter() {
            let core = match self.lookup(id) {
                Some(core) => core,
                None => continue,
            };
            let new = {
                let mut core = core.write();
                core.advance_past(inner, loc)?;
                core.current_loc()
            };
            self.update_loc(id, loc, new);
        }
        Ok(())
    }

    /// The bucket at `loc` is about to be deallocated: any cursor
    /// positioned inside it loses its position and re-seeks from its
    /// saved key on the next advance.
    pub fn about_to_delete_bucket(&self, loc: DiskLoc) {
        let cores: Vec<Arc<Spinlock<CursorCore>>> =
            self.state.read().by_id.values().map(Arc::clone).collect();
        for core in cores.into_iter() {
            core.write().note_bucket_deleted(loc);
        }
    }

    /// The collection at `desc_loc` is being dropped or rewritten:
    /// terminate every cursor scanning it. The caller re-queries.
    pub fn invalidate_ns(&self, desc_loc: DiskLoc) {
        let entries: Vec<(u64, Arc<Spinlock<CursorCore>>)> = self
            .state
            .read()
            .by_id
            .iter()
            .map(|(id, core)| (*id, Arc::clone(core)))
            .collect();
        for (id, core) in entries.into_iter() {
            let old = {
                let mut core = core.write();
                if core.desc_loc() != desc_loc {
                    continue;
                }
                let old = core.current_loc();
                core.kill();
                old
            };
            self.update_loc(id, old, DiskLoc::NULL);
        }
    }
}

fn unmap_loc(state: &mut RegState, id: u64, loc: DiskLoc) {
    if loc.is_null() {
        return;
    }
    if let Some(ids) = state.by_loc.get_mut(&loc) {
        ids.retain(|x| *x != id);
        if ids.is_empty() {
            state.by_loc.remove(&loc);
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
