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

//! The arena: owner of the managed address space, the generation chain,
//! the pools, and the registries. One lock guards the structural state;
//! an entire collection cycle runs under it, so any acquisition of the
//! lock is atomic with respect to collections. Parking the arena blocks
//! new cycles; a parked scope is how roots are replaced.

use crate::builtin::SymbolTable;
use crate::finalize::FinalizerRunner;
use crate::heap::gc;
use crate::heap::{
    BlockFlag, BlockTable, GenParam, GenState, Pool, PoolKind, BYTES_IN_BLOCK, LOG_BYTES_IN_BLOCK,
    N_GENS, N_POOL_KINDS,
};
use crate::root::RootRegistry;
use crate::thread::ThreadShared;

use utils::mem::memmap;
use utils::Address;
use utils::ByteSize;
use utils::Word;

use crossbeam::channel::Sender;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Wake-up messages for the collector thread.
pub enum Trigger {
    Kick,
    Shutdown,
}

/// Everything the arena lock guards.
pub struct ArenaInner {
    pub blocks: BlockTable,
    pub gens: [[GenState; N_GENS]; N_POOL_KINDS],
    pub roots: RootRegistry,
    pub threads: Vec<Option<Arc<ThreadShared>>>,
    /// Objects registered for finalization, not yet discovered dead.
    pub finalizable: Vec<Address>,
    /// Posted finalization messages; a root until drained.
    pub messages: VecDeque<Word>,
    pub park_depth: usize,
    pub stw_requested: bool,
    pub stopped: usize,
    pub cycle_count: u64,
    pub finalization_enabled: bool,
}

impl ArenaInner {
    pub fn registered_threads(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    /// Hands a just-exhausted or abandoned allocation buffer back to the
    /// block table.
    pub fn release_open_block(&mut self, kind: PoolKind, idx: usize, committed: Address) {
        let k = kind.index();
        let (flag, gen, live) = {
            let info = &self.blocks.infos[idx];
            (info.flag, info.gen as usize, info.live)
        };
        match flag {
            BlockFlag::Open => {
                let info = &mut self.blocks.infos[idx];
                info.fill = committed;
                info.flag = BlockFlag::Closed;
            }
            BlockFlag::Trapped => {
                // collected while open; only now is it safe to recycle
                if live > 0 {
                    self.blocks.infos[idx].flag = BlockFlag::Retained;
                } else {
                    let gen_state = &mut self.gens[k][gen];
                    gen_state.blocks.retain(|&b| b != idx);
                    gen_state.used -= BYTES_IN_BLOCK;
                    self.blocks.free_block(idx);
                }
            }
            _ => debug_assert!(false, "released buffer block in state {:?}", flag),
        }
    }

    /// Refreshes the fill mark of every open allocation buffer from its
    /// owner's commit watermark.
    pub fn capture_open_fills(&mut self) {
        let watermarks: Vec<(usize, Address)> = self
            .threads
            .iter()
            .flatten()
            .flat_map(|t| {
                (0..N_POOL_KINDS).filter_map(move |k| {
                    let ob = t.open_blocks[k].load(Ordering::SeqCst);
                    if ob == 0 {
                        None
                    } else {
                        Some((
                            ob - 1,
                            Address::from_usize(t.committed[k].load(Ordering::SeqCst)),
                        ))
                    }
                })
            })
            .collect();
        for (idx, committed) in watermarks {
            self.blocks.infos[idx].fill = committed;
        }
    }
}

pub struct Arena {
    #[allow(dead_code)]
    backing: memmap::MmapMut,
    pub mem_start: Address,
    pub mem_end: Address,
    pub chain: Vec<GenParam>,
    pub pools: [Pool; N_POOL_KINDS],
    pub inner: Mutex<ArenaInner>,
    /// Collector waits here for mutators to reach cooperation points.
    pub cv_stopped: Condvar,
    /// Mutators wait here for the cycle to finish.
    pub cv_resume: Condvar,
    pub symbols: SymbolTable,
    pub finalizer_runner: RwLock<Option<FinalizerRunner>>,
    trigger: Sender<Trigger>,
}

impl Arena {
    pub fn new(
        arena_size: ByteSize,
        chain: Vec<GenParam>,
        finalization_enabled: bool,
        trigger: Sender<Trigger>,
    ) -> Arc<Arena> {
        assert!(!chain.is_empty() && chain.len() == N_GENS);

        let mut backing = match memmap::MmapMut::map_anon(arena_size + BYTES_IN_BLOCK) {
            Ok(m) => m,
            Err(e) => panic!("failed to reserve address space for the arena: {}", e),
        };
        let mem_start = Address::from_mut_ptr(backing.as_mut_ptr()).align_up(BYTES_IN_BLOCK);
        let n_blocks = arena_size >> LOG_BYTES_IN_BLOCK;
        let mem_end = mem_start.plus(n_blocks << LOG_BYTES_IN_BLOCK);
        info!(
            "arena: {} ~ {} ({} blocks of {} bytes)",
            mem_start, mem_end, n_blocks, BYTES_IN_BLOCK
        );
        for (i, g) in chain.iter().enumerate() {
            info!(
                "  generation {}: capacity {} bytes, mortality {}",
                i, g.capacity, g.mortality
            );
        }

        let symbols = SymbolTable::new();
        let mut roots = RootRegistry::new();
        roots.register_ambig(symbols.base(), symbols.end());

        let gens = [
            [GenState::new(), GenState::new()],
            [GenState::new(), GenState::new()],
            [GenState::new(), GenState::new()],
        ];

        Arc::new(Arena {
            backing,
            mem_start,
            mem_end,
            chain,
            pools: [
                Pool::new(PoolKind::Cons),
                Pool::new(PoolKind::Symbol),
                Pool::new(PoolKind::Finalizer),
            ],
            inner: Mutex::new(ArenaInner {
                blocks: BlockTable::new(mem_start, n_blocks),
                gens,
                roots,
                threads: vec![],
                finalizable: vec![],
                messages: VecDeque::new(),
                park_depth: 0,
                stw_requested: false,
                stopped: 0,
                cycle_count: 0,
                finalization_enabled,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
            symbols,
            finalizer_runner: RwLock::new(None),
            trigger,
        })
    }

    /// Which generations are due: the highest generation over capacity,
    /// escalated to a full collection when the copy reserve for it would
    /// not fit.
    pub fn due_collection(&self, inner: &ArenaInner) -> Option<usize> {
        let mut target = None;
        for g in 0..N_GENS {
            let used: ByteSize = (0..N_POOL_KINDS).map(|k| inner.gens[k][g].used).sum();
            if used > self.chain[g].capacity {
                target = Some(g);
            }
        }
        if let Some(g) = target {
            let mut used = 0;
            for gi in 0..=g {
                used += (0..N_POOL_KINDS)
                    .map(|k| inner.gens[k][gi].used)
                    .sum::<ByteSize>();
            }
            let reserve =
                (used as f64 * self.chain[g].mortality / BYTES_IN_BLOCK as f64).ceil() as usize;
            if inner.blocks.available() < reserve && g + 1 < N_GENS {
                return Some(N_GENS - 1);
            }
        }
        target
    }

    /// Runs one collection cycle through `max_gen`, stopping registered
    /// mutators at their cooperation points first. `me` is the calling
    /// thread's record when the caller is itself a registered mutator.
    /// Returns false when the arena is parked.
    pub fn collect_now(&self, me: Option<&Arc<ThreadShared>>, max_gen: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.park_depth > 0 {
            return false;
        }
        if inner.stw_requested {
            // another thread is already collecting; wait it out
            let me_registered = me.map_or(false, |m| {
                inner.threads.iter().flatten().any(|t| Arc::ptr_eq(t, m))
            });
            if me_registered {
                inner.stopped += 1;
                self.cv_stopped.notify_all();
            }
            while inner.stw_requested {
                inner = self.cv_resume.wait(inner).unwrap();
            }
            if me_registered {
                inner.stopped -= 1;
            }
            return true;
        }

        inner.stw_requested = true;
        for t in inner.threads.iter().flatten() {
            if me.map_or(true, |m| !Arc::ptr_eq(t, m)) {
                t.yield_flag.store(true, Ordering::SeqCst);
            }
        }

        loop {
            let required =
                inner.registered_threads() - me.map_or(false, |m| {
                    inner.threads.iter().flatten().any(|t| Arc::ptr_eq(t, m))
                }) as usize;
            if inner.stopped >= required {
                break;
            }
            if inner.park_depth > 0 {
                // a parked scope arrived while we waited; stand down
                inner.stw_requested = false;
                for t in inner.threads.iter().flatten() {
                    t.yield_flag.store(false, Ordering::SeqCst);
                }
                self.cv_resume.notify_all();
                return false;
            }
            inner = self.cv_stopped.wait(inner).unwrap();
        }

        gc::run_cycle(self, &mut inner, max_gen);
        inner.cycle_count += 1;

        inner.stw_requested = false;
        for t in inner.threads.iter().flatten() {
            t.yield_flag.store(false, Ordering::SeqCst);
        }
        self.cv_resume.notify_all();
        true
    }

    /// Advances the collector by at most `budget`. Cheap when nothing is
    /// due. Callers must not be registered mutators.
    pub fn step(&self, budget: Duration) -> bool {
        let start = Instant::now();
        let mut worked = false;
        loop {
            let target = {
                let inner = self.inner.lock().unwrap();
                if inner.park_depth > 0 {
                    None
                } else {
                    self.due_collection(&inner)
                }
            };
            match target {
                None => break,
                Some(g) => {
                    if !self.collect_now(None, g) {
                        break;
                    }
                    worked = true;
                }
            }
            if start.elapsed() >= budget {
                break;
            }
        }
        worked
    }

    /// Stops collector work. Waits for an in-flight cycle (the cycle
    /// holds the arena lock); a collector still gathering its mutators
    /// stands down when it observes the park.
    pub fn park(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.park_depth += 1;
        trace!("arena parked, depth {}", inner.park_depth);
        self.cv_stopped.notify_all();
    }

    pub fn release(&self) {
        let kick = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.park_depth > 0);
            inner.park_depth -= 1;
            trace!("arena released, depth {}", inner.park_depth);
            inner.park_depth == 0
        };
        // work may have piled up while parked
        if kick {
            let _ = self.trigger.send(Trigger::Kick);
        }
    }

    /// Runs `f` with the collector parked; released on every exit path.
    pub fn with_parked<R>(self: &Arc<Arena>, f: impl FnOnce() -> R) -> R {
        let _guard = ParkGuard::new(self.clone());
        f()
    }

    /// Calls `f` with the committed range of every block of a pool.
    /// Runs under the arena lock; `f` must not allocate.
    pub fn walk_pool(&self, kind: PoolKind, f: impl FnMut(Address, Address)) {
        let mut f = f;
        let mut inner = self.inner.lock().unwrap();
        inner.capture_open_fills();
        let k = kind.index();
        for g in 0..N_GENS {
            // the lists are edited only under this lock
            let blocks = inner.gens[k][g].blocks.clone();
            for idx in blocks {
                let info = &inner.blocks.infos[idx];
                if info.fill > info.start {
                    f(info.start, info.fill);
                }
            }
        }
    }
}

/// RAII scope that parks the arena; dropping releases it, also on
/// unwinds.
pub struct ParkGuard {
    arena: Arc<Arena>,
}

impl ParkGuard {
    pub fn new(arena: Arc<Arena>) -> ParkGuard {
        arena.park();
        ParkGuard { arena }
    }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        self.arena.release();
    }
}
