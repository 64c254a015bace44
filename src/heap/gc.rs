// Copyright 2017 The Australian National University
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One collection cycle over the generations `0..=max_gen`, run under
//! the arena lock with every registered mutator stopped at a
//! cooperation point.
//!
//! Phases: flip allocation epochs; scan roots (ambiguous roots mark and
//! pin, exact roots and older generations mark); drain the grey queue;
//! discover dead finalizables and resurrect them behind a message;
//! relocate marked unpinned objects, leaving forwarding markers; fix
//! every exact reference location; reclaim empty from-blocks and pad
//! the holes in retained ones.

use crate::heap::{
    Arena, ArenaInner, BlockFlag, PoolKind, PoolState, BYTES_IN_BLOCK, N_GENS, N_POOL_KINDS,
    POOL_KINDS,
};
use crate::objectmodel;
use crate::root::{Rank, RootSnap};
use crate::scan::{FixError, MarkQueue, ScanFn, ScanMode, ScanState, MARK_QUEUE_CAP};
use crate::word;

use utils::bit_utils;
use utils::Address;
use utils::ByteSize;

use std::sync::atomic::Ordering;
use std::time::Instant;

pub fn run_cycle(arena: &Arena, inner: &mut ArenaInner, max_gen: usize) {
    let t0 = Instant::now();
    debug!("collection cycle {} starts, through generation {}", inner.cycle_count, max_gen);

    inner.capture_open_fills();

    // flip: in-flight reservations must retry their commits
    for pool in arena.pools.iter() {
        pool.epoch.fetch_add(1, Ordering::SeqCst);
        pool.set_state(PoolState::Marking);
    }

    // the from-set: every block the collected generations own
    let mut from: Vec<(PoolKind, usize)> = vec![];
    for kind in POOL_KINDS.iter() {
        let k = kind.index();
        for g in 0..=max_gen {
            for &idx in &inner.gens[k][g].blocks {
                from.push((*kind, idx));
            }
        }
    }
    for &(_, idx) in &from {
        let info = &mut inner.blocks.infos[idx];
        bit_utils::clear_all(&mut info.marks);
        bit_utils::clear_all(&mut info.pins);
    }

    let mut queue = MarkQueue::new(MARK_QUEUE_CAP);

    // roots
    let roots = inner.roots.snapshot();
    trace!("scanning {} roots", roots.len());
    for r in &roots {
        scan_root(arena, inner, &mut queue, max_gen, r, false);
    }

    // generations older than max_gen keep their referents alive
    let older: Vec<(PoolKind, usize)> = {
        let mut v = vec![];
        for kind in POOL_KINDS.iter() {
            let k = kind.index();
            for g in (max_gen + 1)..N_GENS {
                for &idx in &inner.gens[k][g].blocks {
                    v.push((*kind, idx));
                }
            }
        }
        v
    };
    for &(kind, idx) in &older {
        let (start, fill) = {
            let info = &inner.blocks.infos[idx];
            (info.start, info.fill)
        };
        scan_area_retry(
            arena,
            inner,
            &mut queue,
            ScanMode::MarkExact,
            max_gen,
            kind.format().scan,
            start,
            fill,
        );
    }

    // undrained finalization messages keep their referents alive
    scan_messages(arena, inner, &mut queue, ScanMode::MarkExact, max_gen);

    drain_queue(arena, inner, &mut queue, max_gen);

    if inner.finalization_enabled {
        discover_finalizable(inner, &mut queue, max_gen);
        drain_queue(arena, inner, &mut queue, max_gen);
    }

    // relocate
    for pool in arena.pools.iter() {
        pool.set_state(PoolState::Relocating);
    }
    let mut copy = CopyCursors::new();
    let mut moved = 0usize;
    for &(kind, idx) in &from {
        moved += evacuate_block(inner, &mut copy, kind, idx);
    }

    // fix every exact reference location
    for r in &roots {
        if r.rank == Rank::Exact && r.stack.is_none() {
            scan_root(arena, inner, &mut queue, max_gen, r, true);
        }
    }
    let all_blocks: Vec<(PoolKind, usize)> = inner
        .blocks
        .infos
        .iter()
        .enumerate()
        .filter_map(|(idx, info)| {
            if info.flag == BlockFlag::Free {
                None
            } else {
                info.owner.map(|k| (k, idx))
            }
        })
        .collect();
    for &(kind, idx) in &all_blocks {
        let (start, fill) = {
            let info = &inner.blocks.infos[idx];
            (info.start, info.fill)
        };
        scan_area_retry(
            arena,
            inner,
            &mut queue,
            ScanMode::Fix,
            max_gen,
            kind.format().scan,
            start,
            fill,
        );
    }
    scan_messages(arena, inner, &mut queue, ScanMode::Fix, max_gen);
    fix_finalizable(inner, max_gen);

    // reclaim
    let mut freed = 0usize;
    let mut retained = 0usize;
    for &(kind, idx) in &from {
        reclaim_block(inner, kind, idx, &mut freed, &mut retained);
    }
    for info in inner.blocks.infos.iter_mut() {
        info.to_space = false;
    }
    recompute_usage(inner);

    for pool in arena.pools.iter() {
        pool.set_state(PoolState::Idle);
    }
    debug!(
        "cycle done in {:?}: {} objects moved, {} blocks freed, {} retained, {} messages pending",
        t0.elapsed(),
        moved,
        freed,
        retained,
        inner.messages.len()
    );
}

fn scan_root(
    arena: &Arena,
    inner: &mut ArenaInner,
    queue: &mut MarkQueue,
    max_gen: usize,
    r: &RootSnap,
    fixing: bool,
) {
    let (start, end, mode) = match &r.stack {
        Some(shared) => {
            let hot = Address::from_usize(shared.hot.load(Ordering::SeqCst));
            if hot.is_zero() || hot >= shared.cold {
                return;
            }
            (hot, shared.cold, ScanMode::MarkAmbig)
        }
        None => {
            let mode = if fixing {
                ScanMode::Fix
            } else {
                match r.rank {
                    Rank::Ambig => ScanMode::MarkAmbig,
                    Rank::Exact => ScanMode::MarkExact,
                }
            };
            (r.start, r.end, mode)
        }
    };
    scan_area_retry(arena, inner, queue, mode, max_gen, r.scan, start, end);
}

/// Scans one area, draining the grey queue and rescanning whenever FIX2
/// reports it is out of room. Marking is monotonic, so the retry
/// converges.
fn scan_area_retry(
    arena: &Arena,
    inner: &mut ArenaInner,
    queue: &mut MarkQueue,
    mode: ScanMode,
    max_gen: usize,
    scan: ScanFn,
    start: Address,
    end: Address,
) {
    loop {
        let result = {
            let mut ss = ScanState {
                arena,
                inner: &mut *inner,
                mode,
                max_gen,
                queue: &mut *queue,
            };
            scan(&mut ss, start, end)
        };
        match result {
            Ok(()) => return,
            Err(FixError::Retry) => {
                trace!("scan of [{}, {}) retrying after drain", start, end);
                drain_queue(arena, inner, queue, max_gen);
            }
        }
    }
}

fn drain_queue(arena: &Arena, inner: &mut ArenaInner, queue: &mut MarkQueue, max_gen: usize) {
    while let Some((addr, kind)) = queue.pop() {
        let fmt = kind.format();
        let result = {
            let mut ss = ScanState {
                arena,
                inner: &mut *inner,
                mode: ScanMode::MarkExact,
                max_gen,
                queue: &mut *queue,
            };
            (fmt.scan)(&mut ss, addr, addr.plus(fmt.object_size))
        };
        if result.is_err() {
            // already marked; rescanning its slots is idempotent
            queue.repush(addr, kind);
        }
    }
}

fn scan_messages(
    arena: &Arena,
    inner: &mut ArenaInner,
    queue: &mut MarkQueue,
    mode: ScanMode,
    max_gen: usize,
) {
    for i in 0..inner.messages.len() {
        let p = Address::from_mut_ptr(&mut inner.messages[i]);
        loop {
            let result = {
                let mut ss = ScanState {
                    arena,
                    inner: &mut *inner,
                    mode,
                    max_gen,
                    queue: &mut *queue,
                };
                ss.fix(p)
            };
            match result {
                Ok(()) => break,
                Err(FixError::Retry) => drain_queue(arena, inner, queue, max_gen),
            }
        }
    }
}

/// Finds registered finalizable objects that this cycle proved dead:
/// resurrect each (marked and pinned, so the posted address stays
/// valid) and post a finalization message.
fn discover_finalizable(inner: &mut ArenaInner, queue: &mut MarkQueue, max_gen: usize) {
    let entries = std::mem::replace(&mut inner.finalizable, vec![]);
    let mut kept = vec![];
    for addr in entries {
        let dead = match inner.blocks.index_of(addr) {
            Some(idx) => {
                let info = &inner.blocks.infos[idx];
                match info.owner {
                    Some(kind)
                        if !info.to_space
                            && (info.gen as usize) <= max_gen
                            && addr < info.fill =>
                    {
                        let i = info.obj_index(addr, kind.object_size());
                        !info.is_marked(i)
                    }
                    _ => false,
                }
            }
            None => false,
        };
        if dead {
            let idx = inner.blocks.index_of(addr).unwrap();
            let kind = inner.blocks.infos[idx].owner.unwrap();
            {
                let info = &mut inner.blocks.infos[idx];
                let i = info.obj_index(addr, kind.object_size());
                info.set_marked(i);
                info.set_pinned(i);
            }
            queue.repush(addr, kind);
            inner
                .messages
                .push_back(word::make(addr.as_usize(), word::TAG_FINALIZER));
            trace!("finalizable object {} died, message posted", addr);
        } else {
            kept.push(addr);
        }
    }
    inner.finalizable = kept;
}

/// Rewrites finalizable-registry entries whose objects moved.
fn fix_finalizable(inner: &mut ArenaInner, max_gen: usize) {
    for i in 0..inner.finalizable.len() {
        let addr = inner.finalizable[i];
        if let Some(idx) = inner.blocks.index_of(addr) {
            let info = &inner.blocks.infos[idx];
            if info.owner.is_some() && !info.to_space && (info.gen as usize) <= max_gen {
                if let Some(new) = objectmodel::is_forwarded(addr) {
                    inner.finalizable[i] = new;
                }
            }
        }
    }
}

/// Copy destinations, one bump cursor per pool and generation.
struct CopyCursors {
    cursors: [[Option<CopyCursor>; N_GENS]; N_POOL_KINDS],
}

struct CopyCursor {
    block: usize,
    cursor: Address,
    limit: Address,
}

impl CopyCursors {
    fn new() -> CopyCursors {
        CopyCursors {
            cursors: Default::default(),
        }
    }

    fn alloc(&mut self, inner: &mut ArenaInner, kind: PoolKind, gen: usize) -> Address {
        let size = kind.object_size();
        let k = kind.index();
        if let Some(cur) = &mut self.cursors[k][gen] {
            if cur.cursor.plus(size) <= cur.limit {
                let addr = cur.cursor;
                cur.cursor = addr.plus(size);
                inner.blocks.infos[cur.block].fill = cur.cursor;
                return addr;
            }
        }
        let idx = match inner.blocks.alloc_block(kind, gen as u8) {
            Some(idx) => idx,
            None => panic!("out of managed memory during relocation"),
        };
        let start = {
            let info = &mut inner.blocks.infos[idx];
            info.flag = BlockFlag::Closed;
            info.to_space = true;
            info.start
        };
        inner.gens[k][gen].blocks.push(idx);
        inner.gens[k][gen].used += BYTES_IN_BLOCK;
        let usable = (BYTES_IN_BLOCK / size) * size;
        self.cursors[k][gen] = Some(CopyCursor {
            block: idx,
            cursor: start.plus(size),
            limit: start.plus(usable),
        });
        inner.blocks.infos[idx].fill = start.plus(size);
        start
    }
}

/// Moves every marked, unpinned object out of a from-block, writing a
/// forwarding marker at the old address. Survivors are promoted one
/// generation; the last generation compacts into itself.
fn evacuate_block(
    inner: &mut ArenaInner,
    copy: &mut CopyCursors,
    kind: PoolKind,
    idx: usize,
) -> usize {
    let size = kind.object_size();
    let fmt = kind.format();
    let (start, fill, gen) = {
        let info = &inner.blocks.infos[idx];
        (info.start, info.fill, info.gen as usize)
    };
    let dest_gen = std::cmp::min(gen + 1, N_GENS - 1);
    let mut moved = 0usize;
    let mut addr = start;
    let mut i = 0usize;
    while addr < fill {
        let (marked, pinned) = {
            let info = &inner.blocks.infos[idx];
            (info.is_marked(i), info.is_pinned(i))
        };
        if marked && !pinned && !objectmodel::is_marker(addr) {
            let dst = copy.alloc(inner, kind, dest_gen);
            unsafe {
                std::ptr::copy_nonoverlapping(addr.to_ptr::<u8>(), dst.to_ptr_mut::<u8>(), size);
            }
            (fmt.forward)(addr, dst);
            moved += 1;
        }
        addr = addr.plus(size);
        i += 1;
    }
    moved
}

/// After fixing: blocks with no pinned survivor are recycled; the rest
/// are retained with their holes padded. Open buffers become trapped
/// until their owner refills.
fn reclaim_block(
    inner: &mut ArenaInner,
    kind: PoolKind,
    idx: usize,
    freed: &mut usize,
    retained: &mut usize,
) {
    let k = kind.index();
    let live = bit_utils::count_set(&inner.blocks.infos[idx].pins);
    inner.blocks.infos[idx].live = live;
    let (flag, gen) = {
        let info = &inner.blocks.infos[idx];
        (info.flag, info.gen as usize)
    };
    match flag {
        BlockFlag::Open => {
            pad_holes(inner, kind, idx);
            inner.blocks.infos[idx].flag = BlockFlag::Trapped;
        }
        BlockFlag::Trapped => {
            pad_holes(inner, kind, idx);
        }
        _ => {
            if live == 0 {
                let gen_state = &mut inner.gens[k][gen];
                gen_state.blocks.retain(|&b| b != idx);
                inner.blocks.free_block(idx);
                *freed += 1;
            } else {
                pad_holes(inner, kind, idx);
                inner.blocks.infos[idx].flag = BlockFlag::Retained;
                *retained += 1;
            }
        }
    }
}

/// Pads every slot that did not survive in place, including old
/// forwarding markers; after this the old addresses of moved objects
/// count as reclaimed.
fn pad_holes(inner: &mut ArenaInner, kind: PoolKind, idx: usize) {
    let size = kind.object_size();
    let fmt = kind.format();
    let (start, fill) = {
        let info = &inner.blocks.infos[idx];
        (info.start, info.fill)
    };
    let mut addr = start;
    let mut i = 0usize;
    while addr < fill {
        let pinned = inner.blocks.infos[idx].is_pinned(i);
        if !pinned {
            (fmt.pad)(addr, size);
        }
        addr = addr.plus(size);
        i += 1;
    }
}

fn recompute_usage(inner: &mut ArenaInner) {
    for k in 0..N_POOL_KINDS {
        for g in 0..N_GENS {
            let used: ByteSize = inner.gens[k][g].blocks.len() * BYTES_IN_BLOCK;
            inner.gens[k][g].used = used;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::{Arena, GenParam, PoolKind};
    use crate::objectmodel::{Cons, CONS_SIZE};
    use crate::thread::GcThread;
    use crate::word;

    use utils::Address;
    use utils::Word;

    use crossbeam::channel::unbounded;

    fn small_arena() -> (std::sync::Arc<Arena>, crossbeam::channel::Receiver<super::super::arena::Trigger>) {
        let (tx, rx) = unbounded();
        let chain = vec![
            GenParam {
                capacity: 128 * 1024,
                mortality: 0.8,
            },
            GenParam {
                capacity: 1 << 20,
                mortality: 0.4,
            },
        ];
        (Arena::new(8 << 20, chain, true, tx), rx)
    }

    unsafe fn read_cons(w: Word) -> Cons {
        Address::from_usize(word::payload(w)).load::<Cons>()
    }

    #[test]
    fn cycle_moves_unpinned_and_fixes_references() {
        let (arena, _rx) = small_arena();
        let cold = 0usize;
        let mut t = GcThread::add(arena.clone(), Address::from_ptr(&cold));

        // a two-word ambiguous root slot outside the arena
        let slot: &'static mut [Word; 2] = Box::leak(Box::new([word::NIL; 2]));
        let start = Address::from_mut_ptr(slot.as_mut_ptr());
        {
            let mut inner = arena.inner.lock().unwrap();
            inner.roots.register_ambig(start, start.plus(16));
        }

        // chain of 64 conses, head in the root slot
        let mut acc = word::NIL;
        for i in 0..64 {
            loop {
                let p = t.reserve(PoolKind::Cons, CONS_SIZE);
                unsafe {
                    p.store(Cons {
                        car: word::make_fixnum(i),
                        cdr: acc,
                    });
                }
                if t.commit(PoolKind::Cons, p, CONS_SIZE) {
                    acc = word::make(p.as_usize(), word::TAG_CONS);
                    break;
                }
            }
        }
        slot[0] = acc;

        assert!(arena.collect_now(Some(&t.shared), 1));

        // the head was pinned by the root slot and stayed put
        assert_eq!(slot[0], acc);
        // its cdr chain was relocated and rewritten, tag preserved
        let new_second = unsafe { read_cons(acc) }.cdr;
        assert_eq!(word::tag(new_second), word::TAG_CONS);
        let mut w = slot[0];
        for i in (0..64).rev() {
            assert_eq!(word::tag(w), word::TAG_CONS);
            let cons = unsafe { read_cons(w) };
            assert_eq!(word::fixnum_value(cons.car), i);
            w = cons.cdr;
        }
        assert!(word::is_nil(w));
    }

    #[test]
    fn flip_invalidates_inflight_reservation() {
        let (arena, _rx) = small_arena();
        let cold = 0usize;
        let mut t = GcThread::add(arena.clone(), Address::from_ptr(&cold));

        // warm the allocation point up
        loop {
            let p = t.reserve(PoolKind::Cons, CONS_SIZE);
            unsafe {
                p.store(Cons {
                    car: word::make_fixnum(1),
                    cdr: word::NIL,
                });
            }
            if t.commit(PoolKind::Cons, p, CONS_SIZE) {
                break;
            }
        }

        // reserve, then let a collection flip the pool under us
        let p = t.reserve(PoolKind::Cons, CONS_SIZE);
        unsafe {
            p.store(Cons {
                car: word::make_fixnum(2),
                cdr: word::NIL,
            });
        }
        assert!(arena.collect_now(Some(&t.shared), 0));
        assert!(!t.commit(PoolKind::Cons, p, CONS_SIZE));

        // the retry protocol recovers
        let w = loop {
            let p = t.reserve(PoolKind::Cons, CONS_SIZE);
            unsafe {
                p.store(Cons {
                    car: word::make_fixnum(3),
                    cdr: word::NIL,
                });
            }
            if t.commit(PoolKind::Cons, p, CONS_SIZE) {
                break word::make(p.as_usize(), word::TAG_CONS);
            }
        };
        assert_eq!(word::fixnum_value(unsafe { read_cons(w) }.car), 3);
    }
}
