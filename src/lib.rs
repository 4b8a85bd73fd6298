// Copyright 2025 Johann Kempter
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
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a cached unit into memory

//! # dexhook
//!
//! Runtime method-hook trampolines, compiled ahead of installation into self-contained DEX
//! binary units.
//!
//! Given the identity of an executable member (owner class, name, parameter and return types,
//! static or instance), `dexhook` synthesizes a small class whose methods intercept calls to
//! that member, dispatch them through an ordered chain of before/after callbacks, and can fall
//! through to a preserved copy of the original implementation. The unit is produced by a
//! complete register-machine compiler:
//!
//! ```text
//! builder ─► CFG ─► SSA ─► optimizer ─► liveness/interference ─► register allocation
//!         ─► phi elimination ─► block layout + instruction selection ─► DEX container
//! ```
//!
//! ## Features
//!
//! - **Trampoline synthesis** - per-member generation with an in-memory and on-disk cache,
//!   at-most-once compilation under concurrency, and copy-on-write callback snapshots
//! - **Typed code builder** - declare classes, fields and methods, then write bodies over typed
//!   locals, labels and catch clauses; misuse fails fast with the offending stream position
//! - **SSA optimizer** - constant propagation with branch folding, copy propagation and dead
//!   code elimination, each switchable
//! - **Interference-aware allocation** - values share registers only when they never
//!   interfere, wide values take aligned register pairs, and parameters stay in the
//!   argument words
//! - **Binary container** - a deterministic DEX 035 writer and a reference reader with a
//!   disassembler for inspecting what was produced
//! - **Reference interpreter** - executes generated units against a host model, used to check
//!   the dispatch protocol end to end
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dexhook::prelude::*;
//!
//! let compiler = TrampolineCompiler::new(TrampolineConfig::default())?;
//! let member = MemberDescriptor::parse("Ljava/lang/String;->length()I")?;
//! let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
//! let unit = compiler.synthesize(&member, &chain)?;
//! println!("{} -> {} bytes", unit.class_name(), unit.bytes().len());
//! # Ok::<(), dexhook::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`types`] - type descriptors, member references and the hooked-member identity
//! - [`builder`] - declarative unit and method-body construction
//! - [`cfg`] - basic blocks and control-flow edges from a builder stream
//! - [`ssa`] - SSA construction and the optimizer passes
//! - [`regalloc`] - liveness, interference and register assignment
//! - [`backend`] - phi elimination and post-allocation cleanup
//! - [`dex`] - instruction encoding, the container writer and reader, disassembly
//! - [`codegen`] - the per-method pipeline and whole-unit compilation
//! - [`dispatch`] - callback chains and the before/after dispatch protocol
//! - [`vm`] - the reference interpreter
//! - [`trampoline`] - hook generation, caching and the public synthesis entry points
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]; see [`Error`] for the categories.

#[macro_use]
pub(crate) mod error;

pub mod prelude;

pub mod backend;
pub mod builder;
pub mod cfg;
pub mod codegen;
pub mod dex;
pub mod dispatch;
pub mod file;
pub mod ir;
pub mod regalloc;
pub mod ssa;
pub mod trampoline;
pub mod types;
pub mod utils;
pub mod vm;

/// `dexhook` Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// `dexhook` Error type.
pub use error::Error;

pub use trampoline::{BinaryUnit, OptimizerConfig, TrampolineCompiler, TrampolineConfig};
pub use types::MemberDescriptor;
