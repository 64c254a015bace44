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

/// A finalizable object: one function word the drain clears when it
/// runs, padded to marker size.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Finalizer {
    pub function: Word,
    pub reserved: Word,
}

pub const FINALIZER_SIZE: ByteSize = std::mem::size_of::<Finalizer>();

pub fn finalizer_scan(ss: &mut ScanState, base: Address, limit: Address) -> FixResult {
    let mut addr = base;
    while addr < limit {
        if !objectmodel::is_marker(addr) {
            ss.fix(addr)?;
        }
        addr = addr.plus(FINALIZER_SIZE);
    }
    Ok(())
}

pub fn finalizer_skip(addr: Address) -> Address {
    addr.plus(FINALIZER_SIZE)
}

pub static FINALIZER_FMT: ObjectFormat = ObjectFormat {
    align: word::ALIGNMENT,
    object_size: FINALIZER_SIZE,
    scan: finalizer_scan,
    skip: finalizer_skip,
    forward: objectmodel::forward,
    is_forwarded: objectmodel::is_forwarded,
    pad: objectmodel::pad,
};
