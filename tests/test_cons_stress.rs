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

//! Two mutator threads race the collector building long lists while a
//! third thread drives idle slices. Both lists must come back complete
//! and in order.

extern crate lyra_gc as gc;

use gc::word;
use gc::{
    cons_car, cons_cdr, gc_init, gc_inhibit, gc_make_cons, gc_on_idle, gc_thread_add,
    gc_thread_remove, gc_xalloc_ambig_root, Address, GcConfig, Word,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WORK_LOAD: isize = 20000;

fn mutator(root: Address) {
    let cold = 0usize;
    let t = gc_thread_add(Address::from_ptr(&cold));
    let mut acc = word::NIL;
    for i in 0..WORK_LOAD {
        acc = gc_make_cons(t, word::make_fixnum(i), acc);
        unsafe { root.store(acc) };
    }
    gc_thread_remove(t);
}

#[test]
fn parallel_cons_stress() {
    gc_init(GcConfig {
        arena_size: 64 << 20,
        gen0_capacity: 256 * 1024,
        gen0_mortality: 0.8,
        gen1_capacity: 8 << 20,
        gen1_mortality: 0.4,
        enable_finalization: true,
    });

    let root_a = gc_xalloc_ambig_root(64);
    let root_b = gc_xalloc_ambig_root(64);

    let done = Arc::new(AtomicBool::new(false));
    let idler = {
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                gc_on_idle();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let a = thread::spawn(move || mutator(root_a));
    let b = thread::spawn(move || mutator(root_b));
    a.join().unwrap();
    b.join().unwrap();
    done.store(true, Ordering::Relaxed);
    idler.join().unwrap();

    let _guard = gc_inhibit();
    for &root in &[root_a, root_b] {
        let mut w = unsafe { root.load::<Word>() };
        let mut expected = WORK_LOAD - 1;
        while !word::is_nil(w) {
            assert_eq!(word::tag(w), word::TAG_CONS);
            assert_eq!(unsafe { word::fixnum_value(cons_car(w)) }, expected);
            expected -= 1;
            w = unsafe { cons_cdr(w) };
        }
        assert_eq!(expected, -1);
    }
}
