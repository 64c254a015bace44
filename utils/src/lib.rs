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

//! Support types shared by the collector: raw addresses, word-size
//! constants, bit helpers, and the intrusive list backing the registries.

pub type ByteSize = usize;
pub type ByteOffset = isize;
pub type Word = usize;

#[cfg(target_pointer_width = "64")]
pub const LOG_POINTER_SIZE: usize = 3;

pub const POINTER_SIZE: ByteSize = 1 << LOG_POINTER_SIZE;
pub const WORD_SIZE: ByteSize = 1 << LOG_POINTER_SIZE;

pub mod mem;

mod address;
pub use crate::address::Address;

pub mod bit_utils;
pub mod doubly;
