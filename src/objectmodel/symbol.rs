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

/// Where a symbol's value lives. Zeroed memory reads as a plain-value
/// symbol with every field `nil`, which is what a fresh table must look
/// like.
pub const REDIRECT_PLAINVAL: Word = 0;
pub const REDIRECT_VARALIAS: Word = 1;
pub const REDIRECT_LOCALIZED: Word = 2;
pub const REDIRECT_FORWARDED: Word = 3;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Symbol {
    pub redirect: Word,
    pub name: Word,
    pub value: Word,
    pub function: Word,
    pub plist: Word,
    pub package: Word,
}

pub const SYMBOL_SIZE: ByteSize = std::mem::size_of::<Symbol>();

const OFF_NAME: ByteSize = WORD_SIZE;
const OFF_VALUE: ByteSize = 2 * WORD_SIZE;
const OFF_FUNCTION: ByteSize = 3 * WORD_SIZE;
const OFF_PLIST: ByteSize = 4 * WORD_SIZE;
const OFF_PACKAGE: ByteSize = 5 * WORD_SIZE;

/// Fixes name, function, plist and package; the value slot only when the
/// redirect says the symbol holds its value directly.
pub fn symbol_scan(ss: &mut ScanState, base: Address, limit: Address) -> FixResult {
    let mut addr = base;
    while addr < limit {
        if !objectmodel::is_marker(addr) {
            let redirect = unsafe { addr.load::<Word>() };
            ss.fix(addr.plus(OFF_NAME))?;
            if redirect == REDIRECT_PLAINVAL {
                ss.fix(addr.plus(OFF_VALUE))?;
            }
            ss.fix(addr.plus(OFF_FUNCTION))?;
            ss.fix(addr.plus(OFF_PLIST))?;
            ss.fix(addr.plus(OFF_PACKAGE))?;
        }
        addr = addr.plus(SYMBOL_SIZE);
    }
    Ok(())
}

pub fn symbol_skip(addr: Address) -> Address {
    addr.plus(SYMBOL_SIZE)
}

pub static SYMBOL_FMT: ObjectFormat = ObjectFormat {
    align: word::ALIGNMENT,
    object_size: SYMBOL_SIZE,
    scan: symbol_scan,
    skip: symbol_skip,
    forward: objectmodel::forward,
    is_forwarded: objectmodel::is_forwarded,
    pad: objectmodel::pad,
};
