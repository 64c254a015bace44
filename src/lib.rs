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

//! # An incremental, generational, moving garbage collector
//!
//! This crate is the GC core of the lyra runtime, designed as a
//! standalone crate so it can be embedded elsewhere. It manages two
//! kinds of language objects in moving pools (conses and symbols, plus
//! finalizer records), with per-thread allocation points, a registry of
//! ambiguous and exact roots, a tagged-pointer fix protocol, and a
//! finalization channel.
//!
//! An embedding runtime uses it as follows:
//!
//! 1. call gc_init() at process start, gc_destroy() at exit
//! 2. for every mutator thread, call gc_thread_add() with the cold end
//!    of its control stack and keep the returned pointer; call
//!    gc_thread_remove() when the thread ends
//! 3. allocate through gc_make_cons() / gc_alloc_symbol() /
//!    gc_make_finalizer(); the reserve/commit retry is internal
//! 4. register every malloc'd block that may hold references with
//!    gc_on_mem_insert(), remove it with gc_on_mem_delete()
//! 5. replace growable roots (binding stack, face caches, glyph
//!    matrices, reader stack) through the gc_on_* hooks; replacement
//!    happens under a parked collector
//! 6. call gc_on_idle() from the idle loop so the collector can make
//!    bounded progress and finalizers run; gc_handle_messages() drains
//!    finalizers on demand
//!
//! The collector stops mutators only at their cooperation points
//! (inside reserve and commit). gc_inhibit() returns a scope guard that
//! parks the collector until it drops, including on unwinds.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod aligned_alloc;
pub mod builtin;
pub mod client;
pub mod finalize;
pub mod heap;
pub mod objectmodel;
pub mod root;
pub mod scan;
pub mod thread;
pub mod word;

pub use crate::heap::{Arena, ParkGuard, PoolKind, PoolState};
pub use crate::objectmodel::{cons_car, cons_cdr, Cons, Finalizer, Symbol};
pub use crate::root::RootNode;
pub use crate::thread::GcThread;
pub use utils::{Address, ByteSize, Word};

use crate::client::{Binding, FaceCache, GlyphMatrix};
use crate::finalize::FinalizerRunner;
use crate::heap::arena::Trigger;
use crate::heap::{GenParam, N_GENS};
use crate::objectmodel::{CONS_SIZE, FINALIZER_SIZE, SYMBOL_SIZE};
use crate::scan::ScanFn;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use std::sync::{Arc, RwLock};
use std::thread as std_thread;
use std::time::Duration;

/// Arena and chain parameters. The defaults are the production
/// configuration; tests shrink them to force collections.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct GcConfig {
    pub arena_size: ByteSize,
    pub gen0_capacity: ByteSize,
    pub gen0_mortality: f64,
    pub gen1_capacity: ByteSize,
    pub gen1_mortality: f64,
    pub enable_finalization: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            arena_size: 512 << 20,
            gen0_capacity: 32000 * 1024,
            gen0_mortality: 0.8,
            gen1_capacity: 160045 * 1024,
            gen1_mortality: 0.4,
            enable_finalization: true,
        }
    }
}

/// The process-wide GC instance.
struct GC {
    arena: Arc<Arena>,
    trigger: Sender<Trigger>,
    collector: Option<std_thread::JoinHandle<()>>,
}

lazy_static! {
    static ref MY_GC: RwLock<Option<GC>> = RwLock::new(None);
}

const COLLECTOR_POLL: Duration = Duration::from_millis(25);
const IDLE_SLICE: Duration = Duration::from_millis(10);

fn arena() -> Arc<Arena> {
    MY_GC
        .read()
        .unwrap()
        .as_ref()
        .expect("GC is not initialized")
        .arena
        .clone()
}

/// The collector's own scheduler: wakes on a trigger or on its poll
/// interval and collects whatever is due.
fn collector_loop(arena: Arc<Arena>, rx: Receiver<Trigger>) {
    debug!("collector thread running");
    loop {
        match rx.recv_timeout(COLLECTOR_POLL) {
            Ok(Trigger::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Trigger::Kick) | Err(RecvTimeoutError::Timeout) => {
                arena.step(IDLE_SLICE);
            }
        }
    }
    debug!("collector thread exits");
}

/// Builds the arena, chain, pools and static roots, and starts the
/// collector thread. The LYRA_GC_TELEMETRY environment variable enables
/// the collector's own instrumentation channel.
#[no_mangle]
pub extern "C" fn gc_init(config: GcConfig) {
    if std::env::var_os("LYRA_GC_TELEMETRY").is_some() {
        start_logging_trace();
    }
    trace!("initializing GC...");
    let chain = vec![
        GenParam {
            capacity: config.gen0_capacity,
            mortality: config.gen0_mortality,
        },
        GenParam {
            capacity: config.gen1_capacity,
            mortality: config.gen1_mortality,
        },
    ];
    let (tx, rx) = unbounded();
    let arena = Arena::new(
        config.arena_size,
        chain,
        config.enable_finalization,
        tx.clone(),
    );
    let collector = {
        let arena = arena.clone();
        std_thread::Builder::new()
            .name("lyra-gc-collector".to_string())
            .spawn(move || collector_loop(arena, rx))
            .expect("failed to start the collector thread")
    };
    let mut gc = MY_GC.write().unwrap();
    assert!(gc.is_none(), "gc_init called twice");
    *gc = Some(GC {
        arena,
        trigger: tx,
        collector: Some(collector),
    });
    info!("GC initialized");
}

/// Tears the GC down. Every thread must have been removed first.
#[no_mangle]
pub extern "C" fn gc_destroy() {
    let gc = MY_GC.write().unwrap().take();
    let mut gc = gc.expect("gc_destroy without gc_init");
    let _ = gc.trigger.send(Trigger::Shutdown);
    if let Some(h) = gc.collector.take() {
        let _ = h.join();
    }
    {
        let inner = gc.arena.inner.lock().unwrap();
        if inner.registered_threads() != 0 {
            warn!(
                "gc_destroy with {} threads still registered",
                inner.registered_threads()
            );
        }
    }
    info!("GC destroyed");
}

#[inline(always)]
fn thread_ref(t: *mut GcThread) -> &'static mut GcThread {
    unsafe { t.as_mut().unwrap() }
}

/***********************************************************************
                                Threads
 ***********************************************************************/

/// Registers the calling thread. `cold` is the cold end of its control
/// stack; the collector scans from the thread's recorded hot end up to
/// it. The caller keeps the returned pointer in TLS and passes it to
/// every allocation.
#[no_mangle]
pub extern "C" fn gc_thread_add(cold: Address) -> *mut GcThread {
    Box::into_raw(GcThread::add(arena(), cold))
}

#[no_mangle]
pub extern "C" fn gc_thread_remove(t: *mut GcThread) {
    assert!(!t.is_null());
    let boxed = unsafe { Box::from_raw(t) };
    boxed.remove();
}

/***********************************************************************
                                Roots
 ***********************************************************************/

/// Called when the runtime's block allocator records a block that may
/// hold references: registers it as an ambiguous root.
#[no_mangle]
pub extern "C" fn gc_on_mem_insert(start: Address, end: Address) -> *mut RootNode {
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.register_ambig(start, end)
}

#[no_mangle]
pub extern "C" fn gc_on_mem_delete(info: *mut RootNode) {
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.deregister(info);
}

/// Registers an exact root scanned by `scan`.
#[no_mangle]
pub extern "C" fn gc_root_exact(start: Address, end: Address, scan: ScanFn) -> *mut RootNode {
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.register_exact(start, end, scan)
}

/// Allocates a zeroed block that is itself an ambiguous root; the
/// runtime uses this for structures whose lifetime it manages by hand.
#[no_mangle]
pub extern "C" fn gc_xalloc_ambig_root(size: ByteSize) -> Address {
    assert!(size > 0);
    let raw = aligned_alloc::aligned_alloc(size, word::ALIGNMENT);
    if raw.is_null() {
        panic!("out of memory allocating an ambiguous root block");
    }
    let start = Address::from_mut_ptr(raw);
    unsafe {
        utils::mem::zero(start, size);
    }
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.register_ambig(start, start.plus(size));
    start
}

#[no_mangle]
pub extern "C" fn gc_xfree_ambig_root(p: Address) {
    if p.is_zero() {
        return;
    }
    let arena = arena();
    {
        let mut inner = arena.inner.lock().unwrap();
        let handle = inner
            .roots
            .find_by_start(p)
            .expect("freeing a block that is not a registered root");
        inner.roots.deregister(handle);
    }
    unsafe { aligned_alloc::aligned_free(p.to_ptr_mut::<()>()) };
}

/// Called after a persistent image has been mapped: its whole range
/// becomes an ambiguous root.
#[no_mangle]
pub extern "C" fn gc_on_pdump_loaded(start: Address, end: Address) {
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.register_ambig(start, end);
}

/***********************************************************************
                            Binding stack
 ***********************************************************************/

/// Installs the ambiguous root over a thread's value-binding stack when
/// it is first allocated.
#[no_mangle]
pub extern "C" fn gc_on_alloc_bindings(t: *mut GcThread, start: Address, end: Address) {
    let t = thread_ref(t);
    let arena = t.arena().clone();
    let mut inner = arena.inner.lock().unwrap();
    debug_assert!(t.bindings_root.is_none());
    t.bindings_root = Some(inner.roots.register_ambig(start, end));
}

/// Called when the binding stack was reallocated: replaces its root
/// under a parked collector so the no-overlap invariant holds
/// throughout.
#[no_mangle]
pub extern "C" fn gc_on_grow_bindings(t: *mut GcThread, start: Address, end: Address) {
    let t = thread_ref(t);
    let arena = t.arena().clone();
    arena.with_parked(|| {
        let mut inner = arena.inner.lock().unwrap();
        if let Some(h) = t.bindings_root.take() {
            inner.roots.deregister(h);
        }
        t.bindings_root = Some(inner.roots.register_ambig(start, end));
    });
}

/// Zeroes a released binding slot so the ambiguous scan never sees a
/// stale reference.
#[no_mangle]
pub extern "C" fn gc_on_binding_unused(b: *mut Binding) {
    unsafe {
        utils::mem::zero(Address::from_mut_ptr(b), std::mem::size_of::<Binding>());
    }
}

/***********************************************************************
                            Display roots
 ***********************************************************************/

/// For every face in a face cache the lface vector must be fixed;
/// installs the exact root over the faces-by-id array.
#[no_mangle]
pub extern "C" fn gc_on_make_face_cache(c: *mut FaceCache) {
    let cache = unsafe { c.as_mut().unwrap() };
    let (start, end) = scan::face_cache_range(cache);
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    cache.gc_info = inner.roots.register_exact(start, end, scan::scan_faces);
}

#[no_mangle]
pub extern "C" fn gc_on_free_face_cache(c: *mut FaceCache) {
    let cache = unsafe { c.as_mut().unwrap() };
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.roots.deregister(cache.gc_info);
    cache.gc_info = std::ptr::null_mut();
}

/// The cache's faces-by-id array was reallocated; the old and new
/// arrays may overlap, so the swap happens under a parked collector.
#[no_mangle]
pub extern "C" fn gc_on_face_cache_change(c: *mut FaceCache) {
    let arena = arena();
    arena.with_parked(|| {
        gc_on_free_face_cache(c);
        gc_on_make_face_cache(c);
    });
}

/// Installs or replaces the exact root over a glyph matrix's rows.
#[no_mangle]
pub extern "C" fn gc_on_adjust_glyph_matrix(m: *mut GlyphMatrix) {
    let arena = arena();
    arena.with_parked(|| {
        let matrix = unsafe { m.as_mut().unwrap() };
        let mut inner = arena.inner.lock().unwrap();
        if !matrix.gc_info.is_null() {
            inner.roots.deregister(matrix.gc_info);
        }
        let (start, end) = scan::glyph_matrix_range(matrix.rows, matrix.rows_allocated);
        matrix.gc_info = inner.roots.register_exact(start, end, scan::scan_glyph_rows);
    });
}

#[no_mangle]
pub extern "C" fn gc_on_free_glyph_matrix(m: *mut GlyphMatrix) {
    let matrix = unsafe { m.as_mut().unwrap() };
    if !matrix.gc_info.is_null() {
        let arena = arena();
        let mut inner = arena.inner.lock().unwrap();
        inner.roots.deregister(matrix.gc_info);
        matrix.gc_info = std::ptr::null_mut();
    }
}

/// The reader's object stack grew: replace its root under a parked
/// collector. Returns the new handle.
#[no_mangle]
pub extern "C" fn gc_on_grow_read_stack(
    info: *mut RootNode,
    start: Address,
    end: Address,
) -> *mut RootNode {
    let arena = arena();
    arena.with_parked(|| {
        let mut inner = arena.inner.lock().unwrap();
        if !info.is_null() {
            inner.roots.deregister(info);
        }
        inner.roots.register_ambig(start, end)
    })
}

/***********************************************************************
                        Idle work and finalization
 ***********************************************************************/

/// Advances the collector by a bounded slice and drains finalizers.
/// Cheap when there is no work. Call from threads that are not
/// registered mutators.
#[no_mangle]
pub extern "C" fn gc_on_idle() {
    let arena = arena();
    arena.step(IDLE_SLICE);
    finalize::drain(&arena);
}

/// Drains pending finalization messages.
#[no_mangle]
pub extern "C" fn gc_handle_messages() {
    finalize::drain(&arena());
}

#[no_mangle]
pub extern "C" fn gc_enable_finalization(enable: bool) {
    let arena = arena();
    let mut inner = arena.inner.lock().unwrap();
    inner.finalization_enabled = enable;
}

/// Installs the runtime callback that runs finalizer functions.
pub fn gc_set_finalizer_runner(f: FinalizerRunner) {
    *arena().finalizer_runner.write().unwrap() = Some(f);
}

/// Parks the collector until the returned scope guard drops; released
/// on every exit path, including unwinds. Allocation under an inhibit
/// scope never sees a collection-induced commit retry.
pub fn gc_inhibit() -> ParkGuard {
    ParkGuard::new(arena())
}

/// Forces a synchronous full collection. `t` is the calling thread's
/// record, or null when the caller is not a registered mutator. No-op
/// while the arena is parked.
#[no_mangle]
pub extern "C" fn gc_force_collect(t: *mut GcThread) {
    let arena = arena();
    let me = unsafe { t.as_ref() }.map(|t| t.shared.clone());
    arena.collect_now(me.as_ref(), N_GENS - 1);
}

/// Calls `f` with the committed range of every block of a pool. Used by
/// the runtime's heap bridge; `f` must not allocate.
pub fn gc_pool_walk(kind: PoolKind, f: impl FnMut(Address, Address)) {
    arena().walk_pool(kind, f);
}

/// Debugger hook; a convenient place for a breakpoint.
#[no_mangle]
pub extern "C" fn gc_break() {}

/// Collection cycles completed so far; lets the runtime observe
/// collector progress.
pub fn gc_cycle_count() -> u64 {
    let arena = arena();
    let inner = arena.inner.lock().unwrap();
    inner.cycle_count
}

/***********************************************************************
                            Allocation
 ***********************************************************************/

/// Allocates a cons. The reserve/init/commit loop restarts when a
/// collection flip invalidates the reservation.
#[no_mangle]
pub extern "C" fn gc_make_cons(t: *mut GcThread, car: Word, cdr: Word) -> Word {
    let t = thread_ref(t);
    loop {
        let p = t.reserve(PoolKind::Cons, CONS_SIZE);
        unsafe {
            p.store(Cons { car, cdr });
        }
        if t.commit(PoolKind::Cons, p, CONS_SIZE) {
            return word::make(p.as_usize(), word::TAG_CONS);
        }
    }
}

/// Allocates a fresh symbol: plain-value redirect, every field nil.
/// Symbol words encode the offset from the builtin table base.
#[no_mangle]
pub extern "C" fn gc_alloc_symbol(t: *mut GcThread) -> Word {
    let t = thread_ref(t);
    let base = t.arena().symbols.base();
    loop {
        let p = t.reserve(PoolKind::Symbol, SYMBOL_SIZE);
        unsafe {
            p.store(Symbol {
                redirect: objectmodel::REDIRECT_PLAINVAL,
                name: word::NIL,
                value: word::NIL,
                function: word::NIL,
                plist: word::NIL,
                package: word::NIL,
            });
        }
        if t.commit(PoolKind::Symbol, p, SYMBOL_SIZE) {
            return word::make(p.wrapping_sub(base), word::TAG_SYMBOL);
        }
    }
}

/// Allocates a finalizer object and registers it for finalization.
/// When no strong reference remains, the collector posts a message; the
/// drain runs `function` through the installed runner, once.
#[no_mangle]
pub extern "C" fn gc_make_finalizer(t: *mut GcThread, function: Word) -> Word {
    let t = thread_ref(t);
    loop {
        let p = t.reserve(PoolKind::Finalizer, FINALIZER_SIZE);
        unsafe {
            p.store(Finalizer {
                function,
                reserved: word::NIL,
            });
        }
        if t.commit(PoolKind::Finalizer, p, FINALIZER_SIZE) {
            let arena = t.arena().clone();
            let mut inner = arena.inner.lock().unwrap();
            inner.finalizable.push(p);
            return word::make(p.as_usize(), word::TAG_FINALIZER);
        }
    }
}

/// The builtin symbol with index `i`; symbol 0 is nil.
pub fn gc_builtin_symbol(i: usize) -> Word {
    arena().symbols.symbol_word(i)
}

/// Resolves a symbol word to its record.
pub fn gc_symbol(w: Word) -> *mut Symbol {
    debug_assert!(word::tag(w) == word::TAG_SYMBOL);
    arena()
        .symbols
        .base()
        .wrapping_plus(word::payload(w))
        .to_ptr_mut()
}

pub fn start_logging_trace() {
    match stderrlog::new().verbosity(4).init() {
        Ok(()) => {
            info!("logger initialized");
        }
        Err(e) => {
            error!(
                "failed to init logger, probably already initialized: {:?}",
                e
            );
        }
    }
}
