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

//! Finalization. The collector posts a message when a registered
//! finalizable object becomes unreachable, resurrecting it for the
//! cycle; the queued words are a root, so referents stay valid until a
//! drain consumes them. Draining clears the function slot one-shot and
//! hands the function to the runtime's runner.

use crate::heap::Arena;
use crate::objectmodel::Finalizer;
use crate::word;

use utils::Address;
use utils::Word;

/// Runtime callback that runs a finalizer function word.
pub type FinalizerRunner = fn(Word);

/// Pops messages until the queue is empty. Each message holds a
/// finalizer-tagged word; if the object still has a non-nil function,
/// the slot is cleared before the runner is invoked, so a finalizer
/// fires at most once. The runner executes outside the arena lock and
/// may allocate.
pub fn drain(arena: &Arena) {
    loop {
        let (function, runner) = {
            let mut inner = arena.inner.lock().unwrap();
            let msg = match inner.messages.pop_front() {
                Some(w) => w,
                None => return,
            };
            debug_assert!(word::tag(msg) == word::TAG_FINALIZER);
            let fin: &mut Finalizer =
                unsafe { Address::from_usize(word::payload(msg)).to_ref_mut() };
            if word::is_nil(fin.function) {
                continue;
            }
            let function = fin.function;
            fin.function = word::NIL;
            (function, *arena.finalizer_runner.read().unwrap())
        };
        trace!("running finalizer function {:x}", function);
        if let Some(runner) = runner {
            runner(function);
        }
    }
}
