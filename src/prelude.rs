//! # dexhook Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the dexhook library. Import this module to get quick access to the essentials for
//! synthesizing trampolines and building units by hand.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dexhook operations
pub use crate::Error;

/// The result type used throughout dexhook
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Trampoline synthesis, configuration and the produced unit
pub use crate::trampoline::{
    BinaryUnit, HostBindings, Layout, OptimizerConfig, TrampolineCompiler, TrampolineConfig,
};

/// Collaborators consumed while installing hooks
pub use crate::trampoline::{AllowAll, CallRedirector, HookEntry, ScopeList, ScopePolicy};

// ================================================================================================
// Type System
// ================================================================================================

/// Descriptors, member references and the hooked-member identity
pub use crate::types::{
    AccessFlags, CallShape, FieldRef, MemberDescriptor, MethodRef, Prototype, TypeId,
};

// ================================================================================================
// Dispatch Protocol
// ================================================================================================

/// Callback chains and the before/after protocol
pub use crate::dispatch::{
    AfterContext, BeforeContext, Callback, CallbackChain, CallbackId, KillSwitch, Outcome,
};

// ================================================================================================
// Building and Encoding
// ================================================================================================

/// Unit and method-body construction
pub use crate::builder::{Code, Label, Local, UnitBuilder};

/// IR operators accepted by the builder
pub use crate::ir::{BinOp, CmpOp, Cond, Constant, UnOp};

/// Whole-unit compilation and encoding
pub use crate::codegen::{compile_unit, encode};

/// Reading encoded units back
pub use crate::dex::DexFile;

// ================================================================================================
// Reference Interpreter
// ================================================================================================

/// Values and the interpreter
pub use crate::vm::{Completion, Heap, Host, Isolated, ObjectId, Value, Vm};
