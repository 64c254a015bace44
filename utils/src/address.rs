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

use crate::ByteOffset;
use crate::ByteSize;

use std::fmt;
use std::mem;
use std::ops::{Add, AddAssign, Sub};

/// An untyped machine address. All pointer arithmetic in the collector
/// goes through this type so that the unsafe raw accesses are easy to
/// find and audit.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The zero address. Valid only as an initialization marker, never
    /// dereferenced.
    pub unsafe fn zero() -> Address {
        Address(0)
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_ptr_mut<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub unsafe fn to_ref<'a, T>(self) -> &'a T {
        &*self.to_ptr::<T>()
    }

    #[inline(always)]
    pub unsafe fn to_ref_mut<'a, T>(self) -> &'a mut T {
        &mut *self.to_ptr_mut::<T>()
    }

    #[inline(always)]
    pub fn plus(self, bytes: ByteSize) -> Address {
        Address(self.0 + bytes)
    }

    #[inline(always)]
    pub fn offset(self, bytes: ByteOffset) -> Address {
        Address((self.0 as isize + bytes) as usize)
    }

    /// Byte distance to a lower address.
    #[inline(always)]
    pub fn diff(self, another: Address) -> ByteSize {
        debug_assert!(self >= another);
        self.0 - another.0
    }

    /// Offset arithmetic that is allowed to wrap; used for the
    /// base-relative symbol encoding.
    #[inline(always)]
    pub fn wrapping_sub(self, another: Address) -> usize {
        self.0.wrapping_sub(another.0)
    }

    #[inline(always)]
    pub fn wrapping_plus(self, bytes: usize) -> Address {
        Address(self.0.wrapping_add(bytes))
    }

    #[inline(always)]
    pub fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    #[inline(always)]
    pub fn is_aligned_to(self, align: ByteSize) -> bool {
        self.0 % align == 0
    }

    #[inline(always)]
    pub fn mask(self, mask: usize) -> Address {
        Address(self.0 & mask)
    }

    #[inline(always)]
    pub unsafe fn load<T: Copy>(self) -> T {
        debug_assert!(!self.is_zero());
        debug_assert!(self.is_aligned_to(mem::align_of::<T>()));
        *(self.0 as *const T)
    }

    #[inline(always)]
    pub unsafe fn store<T>(self, value: T) {
        debug_assert!(!self.is_zero());
        debug_assert!(self.is_aligned_to(mem::align_of::<T>()));
        *(self.0 as *mut T) = value;
    }
}

impl Add<ByteSize> for Address {
    type Output = Address;
    #[inline(always)]
    fn add(self, bytes: ByteSize) -> Address {
        Address(self.0 + bytes)
    }
}

impl AddAssign<ByteSize> for Address {
    #[inline(always)]
    fn add_assign(&mut self, bytes: ByteSize) {
        self.0 += bytes;
    }
}

impl Sub<ByteSize> for Address {
    type Output = Address;
    #[inline(always)]
    fn sub(self, bytes: ByteSize) -> Address {
        Address(self.0 - bytes)
    }
}

impl Sub<Address> for Address {
    type Output = ByteSize;
    #[inline(always)]
    fn sub(self, another: Address) -> ByteSize {
        debug_assert!(self >= another);
        self.0 - another.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let a = Address::from_usize(0x1000);
        assert_eq!(a.plus(16).as_usize(), 0x1010);
        assert_eq!((a + 8) - a, 8);
        assert_eq!(a.offset(-8).as_usize(), 0xff8);
        assert_eq!(a.plus(7).align_up(8), a.plus(8));
        assert!(a.is_aligned_to(8));
        assert!(!a.plus(4).is_aligned_to(8));
    }

    #[test]
    fn wrapping_offsets() {
        let base = Address::from_usize(0x7000_0000);
        let lower = Address::from_usize(0x1000);
        let off = lower.wrapping_sub(base);
        assert_eq!(base.wrapping_plus(off), lower);
    }

    #[test]
    fn load_store() {
        let mut slot: usize = 0;
        let a = Address::from_mut_ptr(&mut slot);
        unsafe {
            a.store(42usize);
            assert_eq!(a.load::<usize>(), 42);
        }
    }
}
