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

//! Runtime-side structures the exact scanners walk. Layouts mirror the
//! embedding runtime's C structs, reduced to the fields the collector
//! touches; each carries a `gc_info` slot for its root handle.

use crate::root::RootNode;

use utils::Word;

/// Left margin, text, right margin.
pub const GLYPH_AREAS: usize = 3;
/// Index of the end pointer in a row's glyphs array.
pub const LAST_AREA: usize = GLYPH_AREAS;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Glyph {
    /// The value this glyph displays; the one reference per glyph.
    pub object: Word,
    pub charpos: isize,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct GlyphRow {
    /// `glyphs[0]` through `glyphs[LAST_AREA]` bound the row's glyph
    /// storage; `glyphs[LAST_AREA]` is the end, not an area.
    pub glyphs: [*mut Glyph; GLYPH_AREAS + 1],
    pub enabled: bool,
}

#[repr(C)]
pub struct GlyphMatrix {
    pub rows: *mut GlyphRow,
    pub rows_allocated: i32,
    pub gc_info: *mut RootNode,
}

pub const LFACE_VECTOR_SIZE: usize = 20;

#[repr(C)]
pub struct Face {
    /// The face's attribute values.
    pub lface: [Word; LFACE_VECTOR_SIZE],
    pub id: i32,
}

#[repr(C)]
pub struct FaceCache {
    pub faces_by_id: *mut *mut Face,
    pub used: i32,
    pub size: i32,
    pub gc_info: *mut RootNode,
}

/// One frame of a thread's value-binding stack. Released slots are
/// zeroed so the ambiguous scan never sees stale references.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Binding {
    pub kind: Word,
    pub symbol: Word,
    pub old_value: Word,
}
