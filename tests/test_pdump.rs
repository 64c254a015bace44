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

//! A mapped persistent image is an ambiguous root: value words in it
//! mix immediates and references into the cons pool. After a forced
//! collection every reference still resolves and, the root being
//! ambiguous, none of the words were rewritten.

extern crate lyra_gc as gc;

use gc::word;
use gc::{
    cons_car, cons_cdr, gc_force_collect, gc_init, gc_inhibit, gc_make_cons, gc_on_pdump_loaded,
    gc_thread_add, gc_thread_remove, Address, GcConfig, Word,
};

const IMAGE_WORDS: usize = 512 * 1024 / 8;

#[test]
fn pdump_image_roots() {
    gc_init(GcConfig {
        arena_size: 64 << 20,
        gen0_capacity: 512 * 1024,
        gen0_mortality: 0.8,
        gen1_capacity: 8 << 20,
        gen1_mortality: 0.4,
        enable_finalization: true,
    });

    let mut image: Vec<Word> = vec![0; IMAGE_WORDS];
    let start = Address::from_mut_ptr(image.as_mut_ptr());
    let end = start.plus(IMAGE_WORDS * 8);
    gc_on_pdump_loaded(start, end);

    let cold = 0usize;
    let t = gc_thread_add(Address::from_ptr(&cold));

    // every 64th word is a reference into the cons pool, the rest are
    // immediates
    for i in 0..IMAGE_WORDS {
        image[i] = if i % 64 == 0 {
            gc_make_cons(t, word::make_fixnum(i as isize), word::NIL)
        } else {
            word::make_fixnum(i as isize)
        };
    }
    let snapshot = image.clone();

    gc_force_collect(t);
    gc_force_collect(t);

    {
        let _guard = gc_inhibit();
        for i in 0..IMAGE_WORDS {
            // ambiguous roots are never rewritten; their referents are
            // pinned instead
            assert_eq!(image[i], snapshot[i]);
            if i % 64 == 0 {
                let w = image[i];
                assert_eq!(word::tag(w), word::TAG_CONS);
                assert_eq!(unsafe { word::fixnum_value(cons_car(w)) }, i as isize);
                assert!(word::is_nil(unsafe { cons_cdr(w) }));
            } else {
                assert!(word::is_immediate(image[i]));
            }
        }
    }

    gc_thread_remove(t);
}
