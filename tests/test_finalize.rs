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

//! A finalizer fires exactly once after its object becomes unreachable;
//! a finalizer that stays rooted never fires.

extern crate lyra_gc as gc;

use gc::word;
use gc::{
    gc_destroy, gc_force_collect, gc_handle_messages, gc_init, gc_make_finalizer, gc_on_idle,
    gc_set_finalizer_runner, gc_thread_add, gc_thread_remove, gc_xalloc_ambig_root, Address,
    GcConfig, Word,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

static FIRED_DEAD: AtomicUsize = AtomicUsize::new(0);
static FIRED_ROOTED: AtomicUsize = AtomicUsize::new(0);

fn runner(function: Word) {
    match word::fixnum_value(function) {
        7 => {
            FIRED_DEAD.fetch_add(1, Ordering::SeqCst);
        }
        9 => {
            FIRED_ROOTED.fetch_add(1, Ordering::SeqCst);
        }
        other => panic!("unexpected finalizer function {}", other),
    }
}

#[test]
fn finalizer_fires_once() {
    gc_init(GcConfig {
        arena_size: 32 << 20,
        gen0_capacity: 256 * 1024,
        gen0_mortality: 0.8,
        gen1_capacity: 4 << 20,
        gen1_mortality: 0.4,
        enable_finalization: true,
    });
    gc_set_finalizer_runner(runner);

    // the finalizer is created on a thread that then goes away, so no
    // root to it remains anywhere
    thread::spawn(|| {
        let cold = 0usize;
        let t = gc_thread_add(Address::from_ptr(&cold));
        let _ = gc_make_finalizer(t, word::make_fixnum(7));
        gc_thread_remove(t);
    })
    .join()
    .unwrap();

    gc_force_collect(std::ptr::null_mut());
    gc_handle_messages();
    assert_eq!(FIRED_DEAD.load(Ordering::SeqCst), 1);

    // it must not fire again, no matter how often we collect and drain
    for _ in 0..20 {
        gc_force_collect(std::ptr::null_mut());
        gc_on_idle();
        gc_handle_messages();
    }
    assert_eq!(FIRED_DEAD.load(Ordering::SeqCst), 1);

    // a rooted finalizer stays alive and silent
    let cold = 0usize;
    let t = gc_thread_add(Address::from_ptr(&cold));
    let root = gc_xalloc_ambig_root(64);
    let rooted = gc_make_finalizer(t, word::make_fixnum(9));
    unsafe { root.store(rooted) };

    for _ in 0..5 {
        gc_force_collect(t);
        gc_handle_messages();
    }
    assert_eq!(FIRED_ROOTED.load(Ordering::SeqCst), 0);

    unsafe { root.store(word::NIL) };
    gc_thread_remove(t);
    gc_destroy();
}
