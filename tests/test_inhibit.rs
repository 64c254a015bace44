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

//! The inhibit scope parks the collector and releases it on every exit
//! path, including unwinds.

extern crate lyra_gc as gc;

use gc::word;
use gc::{
    gc_cycle_count, gc_force_collect, gc_inhibit, gc_init, gc_make_cons, gc_thread_add,
    gc_thread_remove, gc_xalloc_ambig_root, Address, GcConfig,
};

use std::panic::{catch_unwind, AssertUnwindSafe};

#[test]
fn inhibit_scope_releases_on_unwind() {
    gc_init(GcConfig {
        arena_size: 64 << 20,
        gen0_capacity: 256 * 1024,
        gen0_mortality: 0.8,
        gen1_capacity: 8 << 20,
        gen1_mortality: 0.4,
        enable_finalization: true,
    });
    let cold = 0usize;
    let t = gc_thread_add(Address::from_ptr(&cold));
    let root = gc_xalloc_ambig_root(64);

    // allocating under inhibit never triggers a collection
    let before = gc_cycle_count();
    {
        let _guard = gc_inhibit();
        let mut acc = word::NIL;
        // well past the nursery capacity
        for i in 0..40000 {
            acc = gc_make_cons(t, word::make_fixnum(i), acc);
            unsafe { root.store(acc) };
        }
        assert_eq!(gc_cycle_count(), before);
        // an explicit collection request is a no-op while parked
        gc_force_collect(t);
        assert_eq!(gc_cycle_count(), before);
    }

    // an unwinding scope still releases the arena
    let result = catch_unwind(AssertUnwindSafe(|| {
        let _guard = gc_inhibit();
        panic!("runtime error inside a critical region");
    }));
    assert!(result.is_err());

    // the collector makes progress again
    let count = gc_cycle_count();
    gc_force_collect(t);
    assert!(gc_cycle_count() > count);

    gc_thread_remove(t);
}
