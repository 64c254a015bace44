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

use crate::objectmodel;
use crate::objectmodel::ObjectFormat;
use crate::scan::{FixResult, ScanState};
use crate::word;

use utils::Address;
use utils::ByteSize;
use utils::Word;
use utils::WORD_SIZE;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Cons {
    pub car: Word,
    pub cdr: Word,
}

pub const CONS_SIZE: ByteSize = std::mem::size_of::<Cons>();

/// Walks conses in `[base, limit)`, fixing car and cdr. Objects that
/// start with a forwarding or padding marker are skipped.
pub fn cons_scan(ss: &mut ScanState, base: Address, limit: Address) -> FixResult {
    let mut addr = base;
    while addr < limit {
        if !objectmodel::is_marker(addr) {
            ss.fix(addr)?;
            ss.fix(addr.plus(WORD_SIZE))?;
        }
        addr = addr.plus(CONS_SIZE);
    }
    Ok(())
}

pub fn cons_skip(addr: Address) -> Address {
    addr.plus(CONS_SIZE)
}

/// Reads the car of a cons-tagged word.
pub unsafe fn cons_car(w: Word) -> Word {
    debug_assert!(word::tag(w) == word::TAG_CONS);
    Address::from_usize(word::payload(w)).load::<Cons>().car
}

pub unsafe fn cons_cdr(w: Word) -> Word {
    debug_assert!(word::tag(w) == word::TAG_CONS);
    Address::from_usize(word::payload(w)).load::<Cons>().cdr
}

pub static CONS_FMT: ObjectFormat = ObjectFormat {
    align: word::ALIGNMENT,
    object_size: CONS_SIZE,
    scan: cons_scan,
    skip: cons_skip,
    forward: objectmodel::forward,
    is_forwarded: objectmodel::is_forwarded,
    pad: objectmodel::pad,
};
