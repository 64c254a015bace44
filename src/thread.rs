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

//! Per-thread state: the stack root extent, and one allocation point per
//! moving pool. Reserve bumps a thread-local cursor and is wait-free;
//! commit validates the pool epoch and retries after a flip. Threads
//! pause for the collector only here, at their cooperation points.

use crate::heap::{Arena, PoolKind, BYTES_IN_BLOCK, N_POOL_KINDS};
use crate::root::RootHandle;

use utils::Address;
use utils::ByteSize;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The globally visible part of a thread record. The collector reads the
/// stack extent, the commit watermarks, and the open buffer indices; the
/// thread reads its yield flag.
pub struct ThreadShared {
    pub cold: Address,
    pub hot: AtomicUsize,
    pub yield_flag: AtomicBool,
    /// Commit watermark per pool, inside the thread's open buffer.
    pub committed: [AtomicUsize; N_POOL_KINDS],
    /// Open buffer block index + 1 per pool; 0 when none.
    pub open_blocks: [AtomicUsize; N_POOL_KINDS],
    /// Epoch each allocation point last refilled at; lets the collector
    /// tell when a trapped buffer has been abandoned.
    pub ap_epochs: [AtomicUsize; N_POOL_KINDS],
}

impl ThreadShared {
    pub fn new(cold: Address) -> ThreadShared {
        ThreadShared {
            cold,
            hot: AtomicUsize::new(0),
            yield_flag: AtomicBool::new(false),
            committed: Default::default(),
            open_blocks: Default::default(),
            ap_epochs: Default::default(),
        }
    }
}

/// A thread-local reservation buffer bound to one pool. A zero limit
/// forces the slow path, the reset state after a flip.
struct AllocPoint {
    cursor: Address,
    limit: Address,
    epoch: usize,
}

impl AllocPoint {
    fn new(epoch: usize) -> AllocPoint {
        AllocPoint {
            cursor: unsafe { Address::zero() },
            limit: unsafe { Address::zero() },
            epoch,
        }
    }
}

pub struct GcThread {
    arena: Arc<Arena>,
    pub shared: Arc<ThreadShared>,
    aps: [AllocPoint; N_POOL_KINDS],
    pub stack_root: RootHandle,
    pub bindings_root: Option<RootHandle>,
    slot: usize,
}

impl GcThread {
    /// Registers the calling thread: thread record, stack root from the
    /// cold end, one allocation point per pool.
    pub fn add(arena: Arc<Arena>, cold: Address) -> Box<GcThread> {
        let shared = Arc::new(ThreadShared::new(cold));
        let marker = 0u8;
        shared
            .hot
            .store(&marker as *const u8 as usize, Ordering::Relaxed);

        let mut inner = arena.inner.lock().unwrap();
        let slot = match inner.threads.iter().position(|t| t.is_none()) {
            Some(i) => {
                inner.threads[i] = Some(shared.clone());
                i
            }
            None => {
                inner.threads.push(Some(shared.clone()));
                inner.threads.len() - 1
            }
        };
        let stack_root = inner.roots.register_thread_stack(shared.clone());
        debug!(
            "thread {} registered, {} threads live",
            slot,
            inner.threads.iter().flatten().count()
        );

        let epochs: Vec<usize> = arena
            .pools
            .iter()
            .map(|p| p.epoch.load(Ordering::SeqCst))
            .collect();
        drop(inner);

        Box::new(GcThread {
            arena,
            shared,
            aps: [
                AllocPoint::new(epochs[0]),
                AllocPoint::new(epochs[1]),
                AllocPoint::new(epochs[2]),
            ],
            stack_root,
            bindings_root: None,
            slot,
        })
    }

    /// Deregisters the thread: releases open buffers, removes the stack
    /// and binding-stack roots, clears the registry slot.
    pub fn remove(mut self: Box<GcThread>) {
        let arena = self.arena.clone();
        let mut inner = arena.inner.lock().unwrap();
        for kind in crate::heap::POOL_KINDS.iter() {
            let k = kind.index();
            let prev = self.shared.open_blocks[k].swap(0, Ordering::SeqCst);
            if prev != 0 {
                let committed = Address::from_usize(self.shared.committed[k].load(Ordering::SeqCst));
                inner.release_open_block(*kind, prev - 1, committed);
            }
        }
        inner.roots.deregister(self.stack_root);
        if let Some(h) = self.bindings_root.take() {
            inner.roots.deregister(h);
        }
        inner.threads[self.slot] = None;
        debug!(
            "thread {} removed, {} threads live",
            self.slot,
            inner.threads.iter().flatten().count()
        );
        // a collector waiting for this thread must recount
        arena.cv_stopped.notify_all();
    }

    /// Records the hot end of the control stack. Called at every
    /// cooperation point so the collector scans up to the current frame.
    #[inline(always)]
    pub fn record_hot(&self) {
        let marker = 0u8;
        self.shared
            .hot
            .store(&marker as *const u8 as usize, Ordering::Relaxed);
    }

    /// Reserves `size` bytes in `kind`'s pool. The address is not
    /// visible to the collector until a successful commit.
    #[inline(always)]
    pub fn reserve(&mut self, kind: PoolKind, size: ByteSize) -> Address {
        debug_assert!(size == kind.object_size());
        self.record_hot();
        if self.shared.yield_flag.load(Ordering::Relaxed) {
            self.cooperate();
        }
        let ap = &mut self.aps[kind.index()];
        if !ap.limit.is_zero() {
            let start = ap.cursor;
            let end = start.plus(size);
            if end <= ap.limit {
                ap.cursor = end;
                return start;
            }
        }
        self.reserve_slow(kind, size)
    }

    /// Makes the reservation visible. False means a collection flip
    /// invalidated the buffer: re-reserve and re-initialize.
    #[inline(always)]
    pub fn commit(&mut self, kind: PoolKind, addr: Address, size: ByteSize) -> bool {
        let k = kind.index();
        let ap = &mut self.aps[k];
        debug_assert!(addr.plus(size) == ap.cursor);
        // Watermark store and epoch load are both SeqCst: the collector
        // bumps the epoch before reading watermarks, so either it sees
        // this commit or the epoch check fails it.
        self.shared
            .committed[k]
            .store(ap.cursor.as_usize(), Ordering::SeqCst);
        if self.arena.pools[k].epoch.load(Ordering::SeqCst) != ap.epoch {
            ap.cursor = unsafe { Address::zero() };
            ap.limit = unsafe { Address::zero() };
            return false;
        }
        if self.shared.yield_flag.load(Ordering::Relaxed) {
            self.cooperate();
        }
        true
    }

    #[inline(never)]
    fn reserve_slow(&mut self, kind: PoolKind, size: ByteSize) -> Address {
        let arena = self.arena.clone();
        let k = kind.index();
        let mut did_collect = false;
        let mut exhausted_once = false;
        loop {
            let mut target = None;
            {
                let mut inner = arena.inner.lock().unwrap();
                if inner.stw_requested {
                    self.record_hot();
                    inner.stopped += 1;
                    arena.cv_stopped.notify_all();
                    while inner.stw_requested {
                        inner = arena.cv_resume.wait(inner).unwrap();
                    }
                    inner.stopped -= 1;
                }

                // return the exhausted buffer
                let prev = self.shared.open_blocks[k].swap(0, Ordering::SeqCst);
                if prev != 0 {
                    let committed =
                        Address::from_usize(self.shared.committed[k].load(Ordering::SeqCst));
                    inner.release_open_block(kind, prev - 1, committed);
                }

                if inner.park_depth == 0 && !did_collect {
                    target = arena.due_collection(&inner);
                }
                if target.is_none() {
                    if let Some(idx) = inner.blocks.alloc_block(kind, 0) {
                        let start = inner.blocks.infos[idx].start;
                        inner.gens[k][0].blocks.push(idx);
                        inner.gens[k][0].used += BYTES_IN_BLOCK;
                        let usable = (BYTES_IN_BLOCK / size) * size;
                        let epoch = arena.pools[k].epoch.load(Ordering::SeqCst);
                        self.shared.committed[k].store(start.as_usize(), Ordering::SeqCst);
                        self.shared.open_blocks[k].store(idx + 1, Ordering::SeqCst);
                        self.shared.ap_epochs[k].store(epoch, Ordering::SeqCst);
                        let ap = &mut self.aps[k];
                        ap.epoch = epoch;
                        ap.cursor = start.plus(size);
                        ap.limit = start.plus(usable);
                        trace!("thread {}: fresh {:?} buffer at {}", self.slot, kind, start);
                        return start;
                    }
                    // no block left
                    if inner.park_depth > 0 {
                        panic!("out of managed memory while the collector is inhibited");
                    }
                    if exhausted_once {
                        panic!("allocation failed after a full collection");
                    }
                    exhausted_once = true;
                    target = Some(crate::heap::N_GENS - 1);
                }
            }
            arena.collect_now(Some(&self.shared), target.unwrap());
            did_collect = true;
            self.reset_stale_aps();
        }
    }

    /// Cooperation point taken when the collector raised this thread's
    /// yield flag: record the stack extent, count as stopped, wait for
    /// the cycle to finish.
    #[inline(never)]
    pub fn cooperate(&mut self) {
        self.record_hot();
        let arena = self.arena.clone();
        let mut inner = arena.inner.lock().unwrap();
        if inner.stw_requested {
            inner.stopped += 1;
            arena.cv_stopped.notify_all();
            while inner.stw_requested {
                inner = arena.cv_resume.wait(inner).unwrap();
            }
            inner.stopped -= 1;
        }
        drop(inner);
        self.reset_stale_aps();
    }

    /// Zeroes any allocation point whose pool flipped, forcing the slow
    /// path on the next reserve.
    fn reset_stale_aps(&mut self) {
        for kind in crate::heap::POOL_KINDS.iter() {
            let k = kind.index();
            let current = self.arena.pools[k].epoch.load(Ordering::SeqCst);
            if self.aps[k].epoch != current {
                self.aps[k].cursor = unsafe { Address::zero() };
                self.aps[k].limit = unsafe { Address::zero() };
                self.aps[k].epoch = current;
            }
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}
