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

//! The root registry: a doubly-linked list of live roots. The node
//! pointer is the handle callers keep; the runtime stores it in the
//! structures whose memory the root covers and hands it back on
//! deregistration. Replacing a grown root happens under a parked
//! collector so the no-overlap invariant never has a gap.

use crate::scan::{scan_mem_area, ScanFn};
use crate::thread::ThreadShared;

use utils::doubly::{DoublyList, Node};
use utils::Address;

use std::sync::Arc;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Rank {
    /// Every word is a potential reference; referents are pinned.
    Ambig,
    /// Scanned by a type-aware function; referents may move.
    Exact,
}

pub enum RootKind {
    Area { scan: ScanFn },
    /// Scanned `[hot, cold)`; the hot end is read from the thread record
    /// at scan time.
    ThreadStack { shared: Arc<ThreadShared> },
}

pub struct Root {
    pub start: Address,
    pub end: Address,
    pub rank: Rank,
    pub kind: RootKind,
}

pub type RootNode = Node<Root>;

/// Opaque registry handle: the node pointer itself.
pub type RootHandle = *mut RootNode;

pub struct RootRegistry {
    list: DoublyList<Root>,
}

// Raw node pointers; the registry lives inside the arena lock.
unsafe impl Send for RootRegistry {}

impl RootRegistry {
    pub fn new() -> RootRegistry {
        RootRegistry {
            list: DoublyList::new(),
        }
    }

    fn validate_area(&self, start: Address, end: Address) {
        assert!(start < end, "root [{}, {}) is empty", start, end);
        for r in self.list.iter() {
            // thread-stack entries have an empty recorded range
            if r.start < r.end {
                assert!(
                    end <= r.start || r.end <= start,
                    "root [{}, {}) overlaps registered root [{}, {})",
                    start,
                    end,
                    r.start,
                    r.end
                );
            }
        }
    }

    pub fn register_ambig(&mut self, start: Address, end: Address) -> RootHandle {
        self.validate_area(start, end);
        trace!("register ambig root [{}, {})", start, end);
        self.list.push_front(Root {
            start,
            end,
            rank: Rank::Ambig,
            kind: RootKind::Area {
                scan: scan_mem_area,
            },
        })
    }

    pub fn register_exact(&mut self, start: Address, end: Address, scan: ScanFn) -> RootHandle {
        self.validate_area(start, end);
        trace!("register exact root [{}, {})", start, end);
        self.list.push_front(Root {
            start,
            end,
            rank: Rank::Exact,
            kind: RootKind::Area { scan },
        })
    }

    pub fn register_thread_stack(&mut self, shared: Arc<ThreadShared>) -> RootHandle {
        let cold = shared.cold;
        trace!("register thread stack root, cold end {}", cold);
        self.list.push_front(Root {
            start: cold,
            end: cold,
            rank: Rank::Ambig,
            kind: RootKind::ThreadStack { shared },
        })
    }

    /// Removes a root. Unknown handles are a programming error.
    pub fn deregister(&mut self, handle: RootHandle) -> Root {
        assert!(
            self.list.contains(handle),
            "deregistering a root that is not registered"
        );
        unsafe { self.list.remove(handle) }
    }

    /// Looks a root up by its start address, the only stable identifier
    /// of a growable root.
    pub fn find_by_start(&self, start: Address) -> Option<RootHandle> {
        for node in self.list.iter_nodes() {
            if unsafe { (*node).value.start } == start {
                return Some(node);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Snapshot for the cycle driver, which cannot hold a borrow of the
    /// registry while scanning.
    pub fn snapshot(&self) -> Vec<RootSnap> {
        self.list
            .iter()
            .map(|r| match &r.kind {
                RootKind::Area { scan } => RootSnap {
                    start: r.start,
                    end: r.end,
                    rank: r.rank,
                    scan: *scan,
                    stack: None,
                },
                RootKind::ThreadStack { shared } => RootSnap {
                    start: r.start,
                    end: r.end,
                    rank: r.rank,
                    scan: scan_mem_area,
                    stack: Some(shared.clone()),
                },
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct RootSnap {
    pub start: Address,
    pub end: Address,
    pub rank: Rank,
    pub scan: ScanFn,
    pub stack: Option<Arc<ThreadShared>>,
}
