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

//! Registry boundary behavior, on a standalone registry.

extern crate lyra_gc as gc;

use gc::root::RootRegistry;
use gc::scan::{FixError, MarkQueue};
use gc::{Address, PoolKind};

use std::panic::{catch_unwind, AssertUnwindSafe};

#[test]
fn overlapping_roots_are_rejected() {
    let mut reg = RootRegistry::new();
    reg.register_ambig(Address::from_usize(0x1000), Address::from_usize(0x2000));

    for &(start, end) in &[
        (0x1800, 0x2800), // overlaps the tail
        (0x0800, 0x1800), // overlaps the head
        (0x1200, 0x1400), // contained
        (0x0800, 0x3000), // contains
        (0x1000, 0x2000), // identical
    ] {
        let result = catch_unwind(AssertUnwindSafe(|| {
            reg.register_ambig(Address::from_usize(start), Address::from_usize(end))
        }));
        assert!(result.is_err(), "[{:#x}, {:#x}) must be rejected", start, end);
    }

    // adjacent ranges are fine
    reg.register_ambig(Address::from_usize(0x2000), Address::from_usize(0x3000));
    assert_eq!(reg.len(), 2);
}

#[test]
fn zero_size_roots_are_rejected() {
    let mut reg = RootRegistry::new();
    let result = catch_unwind(AssertUnwindSafe(|| {
        reg.register_ambig(Address::from_usize(0x1000), Address::from_usize(0x1000))
    }));
    assert!(result.is_err());
}

#[test]
fn unknown_handles_are_rejected() {
    let mut reg = RootRegistry::new();
    let h = reg.register_ambig(Address::from_usize(0x1000), Address::from_usize(0x2000));
    reg.deregister(h);
    let result = catch_unwind(AssertUnwindSafe(|| reg.deregister(h)));
    assert!(result.is_err());
}

#[test]
fn find_by_start() {
    let mut reg = RootRegistry::new();
    let a = reg.register_ambig(Address::from_usize(0x1000), Address::from_usize(0x2000));
    let _b = reg.register_ambig(Address::from_usize(0x4000), Address::from_usize(0x5000));

    assert_eq!(reg.find_by_start(Address::from_usize(0x1000)), Some(a));
    assert_eq!(reg.find_by_start(Address::from_usize(0x3000)), None);

    // the start address is the stable identifier across a replacement
    reg.deregister(a);
    let a2 = reg.register_ambig(Address::from_usize(0x1000), Address::from_usize(0x2800));
    assert_eq!(reg.find_by_start(Address::from_usize(0x1000)), Some(a2));
}

#[test]
fn mark_queue_overflow_is_a_retry() {
    let mut queue = MarkQueue::new(2);
    assert!(queue
        .push(Address::from_usize(0x1000), PoolKind::Cons)
        .is_ok());
    assert!(queue
        .push(Address::from_usize(0x2000), PoolKind::Cons)
        .is_ok());
    assert_eq!(
        queue.push(Address::from_usize(0x3000), PoolKind::Cons),
        Err(FixError::Retry)
    );
    // draining makes room again
    assert!(queue.pop().is_some());
    assert!(queue
        .push(Address::from_usize(0x3000), PoolKind::Cons)
        .is_ok());
}
