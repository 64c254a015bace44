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

//! The built-in symbol table: a contiguous, non-moving array at a fixed
//! base. Symbol-tagged words carry offsets from this base, so symbol
//! references survive copying of everything else without the table
//! itself ever moving. The table is an ambiguous root.

use crate::aligned_alloc;
use crate::objectmodel::{Symbol, SYMBOL_SIZE};
use crate::word;

use utils::Address;
use utils::ByteSize;
use utils::Word;

pub const BUILTIN_SYMBOLS: usize = 1024;

const TABLE_ALIGN: ByteSize = 4096;

pub struct SymbolTable {
    raw: *mut (),
    base: Address,
    bytes: ByteSize,
}

// The table is allocated once and only read through the fix protocol.
unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        let bytes = BUILTIN_SYMBOLS * SYMBOL_SIZE;
        let raw = aligned_alloc::aligned_alloc(bytes, TABLE_ALIGN);
        if raw.is_null() {
            panic!("failed to allocate the builtin symbol table");
        }
        let base = Address::from_mut_ptr(raw);
        // zeroed symbols are plain-value symbols with all fields nil
        unsafe {
            utils::mem::zero(base, bytes);
        }
        info!(
            "builtin symbol table: {} symbols at {}",
            BUILTIN_SYMBOLS, base
        );
        SymbolTable { raw, base, bytes }
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.base.plus(self.bytes)
    }

    /// The tagged word for builtin symbol `i`. Symbol 0 is `nil`.
    pub fn symbol_word(&self, i: usize) -> Word {
        assert!(i < BUILTIN_SYMBOLS);
        word::make(i * SYMBOL_SIZE, word::TAG_SYMBOL)
    }

    pub fn symbol_ref(&self, i: usize) -> &mut Symbol {
        assert!(i < BUILTIN_SYMBOLS);
        unsafe { self.base.plus(i * SYMBOL_SIZE).to_ref_mut() }
    }
}

impl Drop for SymbolTable {
    fn drop(&mut self) {
        unsafe { aligned_alloc::aligned_free(self.raw) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_symbol_zero() {
        let table = SymbolTable::new();
        assert_eq!(table.symbol_word(0), word::NIL);
        let one = table.symbol_word(1);
        assert_eq!(word::tag(one), word::TAG_SYMBOL);
        assert_eq!(
            table.base().wrapping_plus(word::payload(one)),
            table.base().plus(SYMBOL_SIZE)
        );
    }

    #[test]
    fn fresh_symbols_are_nil_plainval() {
        let table = SymbolTable::new();
        let sym = table.symbol_ref(3);
        assert_eq!(sym.redirect, crate::objectmodel::REDIRECT_PLAINVAL);
        assert!(word::is_nil(sym.name));
        assert!(word::is_nil(sym.value));
    }
}
