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

//! The tagged value word. The low three bits are the tag; the rest is
//! either a fixnum or an address payload. Symbol payloads are offsets
//! from the builtin symbol table base, all other reference tags carry
//! absolute addresses. The codec never branches and fixing never
//! changes a tag.

use utils::ByteSize;
use utils::Word;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("lyra-gc requires a 64-bit machine word");

pub const TAG_BITS: usize = 3;
pub const TAG_MASK: Word = (1 << TAG_BITS) - 1;

/// Pool alignment equals the tag width so tagged pointers stay valid
/// across moves.
pub const ALIGNMENT: ByteSize = 1 << TAG_BITS;

pub const TAG_SYMBOL: Word = 0;
pub const TAG_INT0: Word = 2;
pub const TAG_CONS: Word = 3;
pub const TAG_FINALIZER: Word = 5;
pub const TAG_INT1: Word = 6;

/// Symbol 0 at offset 0: the zero word.
pub const NIL: Word = 0;

#[inline(always)]
pub fn tag(w: Word) -> Word {
    w & TAG_MASK
}

#[inline(always)]
pub fn payload(w: Word) -> Word {
    w ^ tag(w)
}

#[inline(always)]
pub fn make(payload: Word, tag: Word) -> Word {
    debug_assert!(payload & TAG_MASK == 0);
    debug_assert!(tag <= TAG_MASK);
    payload | tag
}

/// Fixnums occupy the two tags with bit pattern 0b_10 in the low two
/// bits, giving them one extra payload bit.
#[inline(always)]
pub fn is_immediate(w: Word) -> bool {
    w & 3 == TAG_INT0
}

#[inline(always)]
pub fn make_fixnum(n: isize) -> Word {
    ((n << 2) as Word) | TAG_INT0
}

#[inline(always)]
pub fn fixnum_value(w: Word) -> isize {
    debug_assert!(is_immediate(w));
    (w as isize) >> 2
}

#[inline(always)]
pub fn is_nil(w: Word) -> bool {
    w == NIL
}
