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

//! Object formats: the per-pool callback table the collector drives, and
//! the forwarding/padding markers shared by every format.
//!
//! Markers are identified by a one-word signature that is the address of
//! a private static, so it is unique per process. A real object whose
//! first word happened to equal a signature would be misread; the
//! signatures are raw static addresses, which no well-formed value word
//! produces.

use crate::scan::ScanFn;

use utils::Address;
use utils::ByteSize;
use utils::Word;
use utils::WORD_SIZE;

mod cons;
mod finalizer;
mod symbol;

pub use self::cons::{cons_car, cons_cdr, Cons, CONS_FMT, CONS_SIZE};
pub use self::finalizer::{Finalizer, FINALIZER_FMT, FINALIZER_SIZE};
pub use self::symbol::{
    Symbol, REDIRECT_FORWARDED, REDIRECT_LOCALIZED, REDIRECT_PLAINVAL, REDIRECT_VARALIAS,
    SYMBOL_FMT, SYMBOL_SIZE,
};

/// The five callbacks the collector needs per pool.
pub struct ObjectFormat {
    pub align: ByteSize,
    pub object_size: ByteSize,
    pub scan: ScanFn,
    pub skip: fn(Address) -> Address,
    pub forward: fn(Address, Address),
    pub is_forwarded: fn(Address) -> Option<Address>,
    pub pad: fn(Address, ByteSize),
}

static FWD_SIG: Word = 0;
static PAD_SIG: Word = 1;

#[inline(always)]
pub fn fwd_sig() -> Word {
    &FWD_SIG as *const Word as Word
}

#[inline(always)]
pub fn pad_sig() -> Word {
    &PAD_SIG as *const Word as Word
}

/// A moved object's old location: signature word, then the new address.
#[repr(C)]
struct Forwarding {
    sig: Word,
    new: Address,
}

/// Smallest unit the collector can overwrite; every pool object is at
/// least this large.
pub const MARKER_SIZE: ByteSize = 2 * WORD_SIZE;

/// Overwrites `*old` with a forwarding marker to `new`. The collector
/// never forwards the same address twice.
pub fn forward(old: Address, new: Address) {
    debug_assert!(is_forwarded(old).is_none());
    debug_assert!(!is_padding(old));
    unsafe {
        old.store(Forwarding {
            sig: fwd_sig(),
            new,
        });
    }
}

#[inline(always)]
pub fn is_forwarded(addr: Address) -> Option<Address> {
    unsafe {
        if addr.load::<Word>() == fwd_sig() {
            Some(addr.plus(WORD_SIZE).load::<Address>())
        } else {
            None
        }
    }
}

/// Fills `[addr, addr + size)` with a padding marker: the signature
/// word, then arbitrary bytes.
pub fn pad(addr: Address, size: ByteSize) {
    debug_assert!(size >= MARKER_SIZE);
    debug_assert!(addr.is_aligned_to(WORD_SIZE));
    unsafe {
        addr.store(pad_sig());
    }
    const FILL: &[u8] = b"padding-";
    let mut p = addr.plus(WORD_SIZE);
    let end = addr.plus(size);
    while p < end {
        let n = std::cmp::min(FILL.len(), end - p);
        unsafe {
            std::ptr::copy_nonoverlapping(FILL.as_ptr(), p.to_ptr_mut::<u8>(), n);
        }
        p = p.plus(n);
    }
}

#[inline(always)]
pub fn is_padding(addr: Address) -> bool {
    unsafe { addr.load::<Word>() == pad_sig() }
}

/// True if the slot at `addr` holds either marker; scans skip these.
#[inline(always)]
pub fn is_marker(addr: Address) -> bool {
    let first = unsafe { addr.load::<Word>() };
    first == fwd_sig() || first == pad_sig()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_marker() {
        let mut slots = [0usize; 4];
        let old = Address::from_mut_ptr(&mut slots[0]);
        let new = Address::from_usize(0xdead_0000);

        assert!(is_forwarded(old).is_none());
        forward(old, new);
        assert_eq!(is_forwarded(old), Some(new));
        assert!(is_marker(old));
        assert!(!is_padding(old));
    }

    #[test]
    fn padding_marker() {
        let mut slots = [0usize; 6];
        let addr = Address::from_mut_ptr(&mut slots[0]);

        pad(addr, 6 * WORD_SIZE);
        assert!(is_padding(addr));
        assert!(is_marker(addr));
        assert!(is_forwarded(addr).is_none());
    }

    #[test]
    fn signatures_differ() {
        assert_ne!(fwd_sig(), pad_sig());
    }
}
