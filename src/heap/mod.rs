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

//! The arena's memory: fixed-size blocks carved out of one mapping, a
//! side table describing each block, and the moving pools that own them.

use crate::objectmodel;
use crate::objectmodel::ObjectFormat;

use utils::bit_utils;
use utils::Address;
use utils::ByteSize;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub mod arena;
pub mod gc;

pub use self::arena::{Arena, ArenaInner, ParkGuard};

pub const LOG_BYTES_IN_BLOCK: usize = 16;
pub const BYTES_IN_BLOCK: ByteSize = 1 << LOG_BYTES_IN_BLOCK;

pub const N_POOL_KINDS: usize = 3;
pub const N_GENS: usize = 2;

/// One pool per concrete object type; pool objects carry no type field,
/// so the pool is the type. A weak pool would take the next slot.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PoolKind {
    Cons = 0,
    Symbol = 1,
    Finalizer = 2,
}

pub const POOL_KINDS: [PoolKind; N_POOL_KINDS] =
    [PoolKind::Cons, PoolKind::Symbol, PoolKind::Finalizer];

impl PoolKind {
    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn format(self) -> &'static ObjectFormat {
        match self {
            PoolKind::Cons => &objectmodel::CONS_FMT,
            PoolKind::Symbol => &objectmodel::SYMBOL_FMT,
            PoolKind::Finalizer => &objectmodel::FINALIZER_FMT,
        }
    }

    #[inline(always)]
    pub fn object_size(self) -> ByteSize {
        self.format().object_size
    }
}

/// Collection state of a pool over one cycle, visible to the allocation
/// protocol through the epoch check.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PoolState {
    Idle = 0,
    Marking = 1,
    Relocating = 2,
}

/// The part of a pool that the allocation fast path reads without the
/// arena lock. Everything else about a pool lives in the block table and
/// generation lists.
pub struct Pool {
    pub kind: PoolKind,
    pub fmt: &'static ObjectFormat,
    /// Bumped when a collection relocates; in-flight reservations whose
    /// epoch is older must retry.
    pub epoch: AtomicUsize,
    state: AtomicU8,
}

impl Pool {
    pub fn new(kind: PoolKind) -> Pool {
        Pool {
            kind,
            fmt: kind.format(),
            epoch: AtomicUsize::new(0),
            state: AtomicU8::new(PoolState::Idle as u8),
        }
    }

    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::Relaxed) {
            0 => PoolState::Idle,
            1 => PoolState::Marking,
            _ => PoolState::Relocating,
        }
    }

    pub fn set_state(&self, s: PoolState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }
}

/// A generation's parameters: how much it may hold before it is due, and
/// the expected survival fraction used to size the copy reserve.
#[derive(Copy, Clone, Debug)]
pub struct GenParam {
    pub capacity: ByteSize,
    pub mortality: f64,
}

/// Blocks a pool generation currently owns, in allocation order.
pub struct GenState {
    pub blocks: Vec<usize>,
    pub used: ByteSize,
}

impl GenState {
    pub fn new() -> GenState {
        GenState {
            blocks: vec![],
            used: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockFlag {
    Free,
    /// A thread's current allocation buffer.
    Open,
    /// Full, or released by its allocation point.
    Closed,
    /// Survived a collection with pinned objects in place.
    Retained,
    /// Was an open buffer when its generation was collected; the owning
    /// thread may still write above the fill mark, so the block cannot
    /// be recycled until that thread refills.
    Trapped,
}

pub struct BlockInfo {
    pub flag: BlockFlag,
    pub owner: Option<PoolKind>,
    pub gen: u8,
    pub start: Address,
    /// End of committed objects; scans cover `[start, fill)`.
    pub fill: Address,
    /// Pinned survivors after the last collection of this block.
    pub live: usize,
    /// Set on blocks the current cycle copies into, so they are not
    /// treated as part of the from-set.
    pub to_space: bool,
    pub marks: Vec<u64>,
    pub pins: Vec<u64>,
}

impl BlockInfo {
    #[inline(always)]
    pub fn obj_index(&self, addr: Address, object_size: ByteSize) -> usize {
        (addr - self.start) / object_size
    }

    #[inline(always)]
    pub fn is_marked(&self, idx: usize) -> bool {
        bit_utils::test_bit(&self.marks, idx)
    }

    #[inline(always)]
    pub fn set_marked(&mut self, idx: usize) {
        bit_utils::set_bit(&mut self.marks, idx)
    }

    #[inline(always)]
    pub fn is_pinned(&self, idx: usize) -> bool {
        bit_utils::test_bit(&self.pins, idx)
    }

    #[inline(always)]
    pub fn set_pinned(&mut self, idx: usize) {
        bit_utils::set_bit(&mut self.pins, idx)
    }
}

/// Side table over the arena's blocks plus the free list. Blocks are
/// taken from the free list first, then by growing into untouched
/// address space.
pub struct BlockTable {
    pub infos: Vec<BlockInfo>,
    free: Vec<usize>,
    next_unused: usize,
    mem_start: Address,
    n_blocks: usize,
}

impl BlockTable {
    pub fn new(mem_start: Address, n_blocks: usize) -> BlockTable {
        let mut infos = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            infos.push(BlockInfo {
                flag: BlockFlag::Free,
                owner: None,
                gen: 0,
                start: mem_start.plus(i << LOG_BYTES_IN_BLOCK),
                fill: mem_start.plus(i << LOG_BYTES_IN_BLOCK),
                live: 0,
                to_space: false,
                marks: vec![],
                pins: vec![],
            });
        }
        BlockTable {
            infos,
            free: vec![],
            next_unused: 0,
            mem_start,
            n_blocks,
        }
    }

    /// Maps an address to its block index, if it lies in the arena.
    #[inline(always)]
    pub fn index_of(&self, addr: Address) -> Option<usize> {
        if addr < self.mem_start {
            return None;
        }
        let idx = (addr - self.mem_start) >> LOG_BYTES_IN_BLOCK;
        if idx < self.n_blocks {
            Some(idx)
        } else {
            None
        }
    }

    /// Grabs a block for `(owner, gen)`. Returns the block index, or
    /// None when the arena is exhausted.
    pub fn alloc_block(&mut self, owner: PoolKind, gen: u8) -> Option<usize> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                if self.next_unused >= self.n_blocks {
                    return None;
                }
                let idx = self.next_unused;
                self.next_unused += 1;
                idx
            }
        };
        let objects = BYTES_IN_BLOCK / owner.object_size();
        let info = &mut self.infos[idx];
        debug_assert!(info.flag == BlockFlag::Free);
        info.flag = BlockFlag::Open;
        info.owner = Some(owner);
        info.gen = gen;
        info.fill = info.start;
        info.live = 0;
        info.to_space = false;
        info.marks = vec![0u64; bit_utils::words_for(objects)];
        info.pins = vec![0u64; bit_utils::words_for(objects)];
        Some(idx)
    }

    /// Returns a block to the free list, zeroing its memory.
    pub fn free_block(&mut self, idx: usize) {
        let info = &mut self.infos[idx];
        debug_assert!(info.flag != BlockFlag::Free);
        unsafe {
            utils::mem::zero(info.start, BYTES_IN_BLOCK);
        }
        info.flag = BlockFlag::Free;
        info.owner = None;
        info.fill = info.start;
        info.live = 0;
        info.to_space = false;
        info.marks = vec![];
        info.pins = vec![];
        self.free.push(idx);
    }

    /// Blocks that could still be handed out, free list plus untouched
    /// space.
    pub fn available(&self) -> usize {
        self.free.len() + (self.n_blocks - self.next_unused)
    }
}
