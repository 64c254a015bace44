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

//! The fix protocol. Every candidate reference word goes through four
//! steps: decode the tag, drop fixnums, resolve the address (adding the
//! symbol table base for symbol-tagged words), ask the block table
//! whether it is a managed object (FIX1), then either mark/pin it or
//! rewrite it through the forwarding marker (FIX2). Rewrites preserve
//! the tag; symbol payloads are re-encoded relative to the base.

use crate::client::{Face, FaceCache, GlyphRow, LAST_AREA, LFACE_VECTOR_SIZE};
use crate::heap::{Arena, ArenaInner, PoolKind};
use crate::objectmodel;
use crate::word;

use utils::Address;
use utils::Word;
use utils::WORD_SIZE;

/// The one recoverable scanner condition: FIX2 could not take more work.
/// The collector drains the mark queue and rescans the failed area.
#[derive(Debug, PartialEq, Eq)]
pub enum FixError {
    Retry,
}

pub type FixResult = Result<(), FixError>;

/// Signature of every area and format scanner.
pub type ScanFn = fn(&mut ScanState, Address, Address) -> FixResult;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ScanMode {
    /// Ambiguous rank: mark and pin, never rewrite.
    MarkAmbig,
    /// Exact rank during marking: mark, referent may move later.
    MarkExact,
    /// After relocation: rewrite references to moved objects.
    Fix,
}

/// Bounded queue of grey objects. The bound models the collector's
/// working-set limit; hitting it surfaces as `FixError::Retry`.
pub struct MarkQueue {
    items: Vec<(Address, PoolKind)>,
    cap: usize,
}

pub const MARK_QUEUE_CAP: usize = 1 << 16;

impl MarkQueue {
    pub fn new(cap: usize) -> MarkQueue {
        MarkQueue {
            items: vec![],
            cap,
        }
    }

    #[inline(always)]
    pub fn push(&mut self, addr: Address, kind: PoolKind) -> FixResult {
        if self.items.len() >= self.cap {
            trace!("mark queue full at {} entries", self.items.len());
            return Err(FixError::Retry);
        }
        self.items.push((addr, kind));
        Ok(())
    }

    /// Re-queue after a failed interior scan; bypasses the cap so the
    /// drain loop can always make progress.
    #[inline(always)]
    pub fn repush(&mut self, addr: Address, kind: PoolKind) {
        self.items.push((addr, kind));
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<(Address, PoolKind)> {
        self.items.pop()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct Hit {
    block: usize,
    kind: PoolKind,
}

/// Scan context for one area. Holds the arena state for FIX1 lookups and
/// the grey queue; constructed fresh per scanned area by the cycle
/// driver.
pub struct ScanState<'a> {
    pub arena: &'a Arena,
    pub inner: &'a mut ArenaInner,
    pub mode: ScanMode,
    /// Highest generation being collected; older memory is not a
    /// candidate.
    pub max_gen: usize,
    pub queue: &'a mut MarkQueue,
}

impl<'a> ScanState<'a> {
    /// FIX1: is `addr` the start of a committed object in a collected
    /// generation?
    fn lookup(&self, addr: Address) -> Option<Hit> {
        let idx = self.inner.blocks.index_of(addr)?;
        let info = &self.inner.blocks.infos[idx];
        let owner = info.owner?;
        if info.to_space || info.gen as usize > self.max_gen {
            return None;
        }
        if addr >= info.fill {
            return None;
        }
        if (addr - info.start) % owner.object_size() != 0 {
            return None;
        }
        Some(Hit {
            block: idx,
            kind: owner,
        })
    }

    /// Applies the fix protocol to the candidate word at `p`.
    pub fn fix(&mut self, p: Address) -> FixResult {
        let w: Word = unsafe { p.load() };
        if word::is_immediate(w) {
            return Ok(());
        }
        let tag = word::tag(w);
        let refaddr = if tag == word::TAG_SYMBOL {
            self.arena.symbols.base().wrapping_plus(word::payload(w))
        } else {
            Address::from_usize(word::payload(w))
        };

        let hit = match self.lookup(refaddr) {
            Some(hit) => hit,
            None => return Ok(()),
        };

        match self.mode {
            ScanMode::MarkAmbig | ScanMode::MarkExact => {
                // A stale ambiguous word can land on a padding or
                // forwarding slot; those are holes, not objects.
                if objectmodel::is_marker(refaddr) {
                    return Ok(());
                }
                let object_size = hit.kind.object_size();
                let ambig = self.mode == ScanMode::MarkAmbig;
                let info = &mut self.inner.blocks.infos[hit.block];
                let idx = info.obj_index(refaddr, object_size);
                let newly = !info.is_marked(idx);
                if newly {
                    info.set_marked(idx);
                }
                if ambig {
                    info.set_pinned(idx);
                }
                if newly {
                    self.queue.push(refaddr, hit.kind)?;
                }
            }
            ScanMode::Fix => {
                let fmt = hit.kind.format();
                if let Some(new) = (fmt.is_forwarded)(refaddr) {
                    let off = if tag == word::TAG_SYMBOL {
                        new.wrapping_sub(self.arena.symbols.base())
                    } else {
                        new.as_usize()
                    };
                    unsafe { p.store(word::make(off, tag)) };
                }
            }
        }
        Ok(())
    }
}

/// Ambiguous area scanner: every word in `[start, end)` is a candidate.
pub fn scan_mem_area(ss: &mut ScanState, start: Address, end: Address) -> FixResult {
    let mut p = start.align_up(WORD_SIZE);
    while p.plus(WORD_SIZE) <= end {
        ss.fix(p)?;
        p = p.plus(WORD_SIZE);
    }
    Ok(())
}

/// Exact scanner over an array of pointers to value words; null slots
/// are skipped.
pub fn scan_static_vec(ss: &mut ScanState, start: Address, end: Address) -> FixResult {
    let mut p = start;
    while p.plus(WORD_SIZE) <= end {
        let slot: *mut Word = unsafe { p.load() };
        if !slot.is_null() {
            ss.fix(Address::from_mut_ptr(slot))?;
        }
        p = p.plus(WORD_SIZE);
    }
    Ok(())
}

/// Exact scanner over a vector of glyph rows: one reference per glyph.
pub fn scan_glyph_rows(ss: &mut ScanState, start: Address, end: Address) -> FixResult {
    let row_size = std::mem::size_of::<GlyphRow>();
    let mut p = start;
    while p.plus(row_size) <= end {
        let row: &GlyphRow = unsafe { p.to_ref() };
        let mut glyph = row.glyphs[0];
        let glyph_end = row.glyphs[LAST_AREA];
        if !glyph.is_null() && !glyph_end.is_null() {
            while glyph < glyph_end {
                let object = unsafe { &mut (*glyph).object };
                ss.fix(Address::from_mut_ptr(object))?;
                glyph = unsafe { glyph.add(1) };
            }
        }
        p = p.plus(row_size);
    }
    Ok(())
}

/// Exact scanner over a face cache's faces-by-id array: fixes each
/// face's lface vector.
pub fn scan_faces(ss: &mut ScanState, start: Address, end: Address) -> FixResult {
    let mut p = start;
    while p.plus(WORD_SIZE) <= end {
        let face: *mut Face = unsafe { p.load() };
        if !face.is_null() {
            for i in 0..LFACE_VECTOR_SIZE {
                let slot = unsafe { &mut (*face).lface[i] };
                ss.fix(Address::from_mut_ptr(slot))?;
            }
        }
        p = p.plus(WORD_SIZE);
    }
    Ok(())
}

/// Range of the faces-by-id array a cache's exact root covers.
pub fn face_cache_range(cache: &FaceCache) -> (Address, Address) {
    let start = Address::from_mut_ptr(cache.faces_by_id);
    (
        start,
        start.plus(cache.size as usize * std::mem::size_of::<*mut Face>()),
    )
}

/// Range of the rows array a glyph matrix's exact root covers.
pub fn glyph_matrix_range(rows: *mut GlyphRow, rows_allocated: i32) -> (Address, Address) {
    let start = Address::from_mut_ptr(rows);
    (
        start,
        start.plus(rows_allocated as usize * std::mem::size_of::<GlyphRow>()),
    )
}
