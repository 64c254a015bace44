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

//! Binding-stack growth: pushing frames forces repeated root
//! replacement under a parked collector while another thread allocates.
//! Every frame and every cons stays live and traversable.

extern crate lyra_gc as gc;

use gc::client::Binding;
use gc::objectmodel::REDIRECT_PLAINVAL;
use gc::word;
use gc::{
    cons_car, cons_cdr, gc_alloc_symbol, gc_force_collect, gc_init, gc_inhibit, gc_make_cons,
    gc_on_alloc_bindings, gc_on_binding_unused, gc_on_grow_bindings, gc_symbol, gc_thread_add,
    gc_thread_remove, gc_xalloc_ambig_root, Address, GcConfig, Word,
};

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const FRAMES: usize = 4000;

fn stack_range(v: &Vec<Binding>) -> (Address, Address) {
    let start = Address::from_ptr(v.as_ptr());
    (start, start.plus(v.capacity() * mem::size_of::<Binding>()))
}

/// The unused part of the registered area must hold no stale words.
fn zero_tail(v: &mut Vec<Binding>) {
    unsafe {
        let tail = v.as_mut_ptr().add(v.len());
        std::ptr::write_bytes(tail, 0, v.capacity() - v.len());
    }
}

#[test]
fn binding_stack_growth() {
    gc_init(GcConfig {
        arena_size: 64 << 20,
        gen0_capacity: 256 * 1024,
        gen0_mortality: 0.8,
        gen1_capacity: 8 << 20,
        gen1_mortality: 0.4,
        enable_finalization: true,
    });

    // a second thread hammers the cons pool the whole time
    let done = Arc::new(AtomicBool::new(false));
    let other_root = gc_xalloc_ambig_root(64);
    let other = {
        let done = done.clone();
        thread::spawn(move || {
            let cold = 0usize;
            let t = gc_thread_add(Address::from_ptr(&cold));
            let mut acc = word::NIL;
            let mut i = 0isize;
            while !done.load(Ordering::Relaxed) {
                acc = gc_make_cons(t, word::make_fixnum(i), acc);
                unsafe { other_root.store(acc) };
                i += 1;
            }
            gc_thread_remove(t);
            i
        })
    };

    let cold = 0usize;
    let t = gc_thread_add(Address::from_ptr(&cold));

    let mut stack: Vec<Binding> = Vec::with_capacity(64);
    zero_tail(&mut stack);
    {
        let (start, end) = stack_range(&stack);
        gc_on_alloc_bindings(t, start, end);
    }

    for i in 0..FRAMES {
        if stack.len() == stack.capacity() {
            let mut bigger: Vec<Binding> = Vec::with_capacity(stack.capacity() * 2);
            unsafe {
                std::ptr::copy_nonoverlapping(stack.as_ptr(), bigger.as_mut_ptr(), stack.len());
                bigger.set_len(stack.len());
            }
            zero_tail(&mut bigger);
            let (start, end) = stack_range(&bigger);
            gc_on_grow_bindings(t, start, end);
            stack = bigger;
        }
        stack.push(Binding {
            kind: word::make_fixnum(i as isize),
            symbol: gc_alloc_symbol(t),
            old_value: gc_make_cons(t, word::make_fixnum(i as isize), word::NIL),
        });
    }

    gc_force_collect(t);

    done.store(true, Ordering::Relaxed);
    let allocated = other.join().unwrap();

    {
        let _guard = gc_inhibit();
        for (i, b) in stack.iter().enumerate() {
            assert_eq!(word::fixnum_value(b.kind), i as isize);
            let sym = unsafe { &*gc_symbol(b.symbol) };
            assert_eq!(sym.redirect, REDIRECT_PLAINVAL);
            assert_eq!(word::tag(b.old_value), word::TAG_CONS);
            assert_eq!(unsafe { word::fixnum_value(cons_car(b.old_value)) }, i as isize);
        }

        // the other thread's list is intact too
        let mut w = unsafe { other_root.load::<Word>() };
        let mut expected = allocated - 1;
        while !word::is_nil(w) {
            assert_eq!(unsafe { word::fixnum_value(cons_car(w)) }, expected);
            expected -= 1;
            w = unsafe { cons_cdr(w) };
        }
        assert_eq!(expected, -1);
    }

    // released slots are zeroed so the ambiguous scan cannot see them
    while let Some(_) = stack.pop() {
        let slot = unsafe { stack.as_mut_ptr().add(stack.len()) };
        gc_on_binding_unused(slot);
        let b = unsafe { &*slot };
        assert!(word::is_nil(b.kind) && word::is_nil(b.symbol) && word::is_nil(b.old_value));
    }

    gc_thread_remove(t);
}
