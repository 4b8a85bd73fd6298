//! The Dalvik executable container.
//!
//! This module turns register-form methods into code items and whole units into the
//! `dex\n035\0` binary format, and reads such binaries back:
//!
//! - [`opcode`] - opcodes and their instruction formats
//! - [`insn`] - encoding and decoding of single instructions
//! - [`code`] - block layout, instruction selection, register legalization, branch
//!   relaxation and try ranges for one method
//! - [`pool`] - the sorted constant tables
//! - [`debug`] - line number tables
//! - [`writer`] - the container writer
//! - [`reader`] - the reference reader, which validates everything the writer promises
//! - [`disasm`] - textual rendering of decoded code
//!
//! The types below are the logical content of a unit: a [`Pool`] plus class definitions
//! whose members refer to it by index. [`writer::write`] and [`DexFile::parse`] are inverse
//! over this model, so a unit survives a write/read cycle index for index.

pub mod code;
pub mod debug;
pub mod disasm;
pub mod insn;
pub mod opcode;
pub mod pool;
pub mod reader;
pub mod writer;

pub use code::assemble;
pub use debug::DebugInfo;
pub use insn::{DalvInsn, Operand};
pub use opcode::{Format, IndexKind, Opcode};
pub use pool::{Pool, PoolBuilder};
pub use reader::DexFile;

use crate::types::AccessFlags;

/// File magic of version 035 containers.
pub const MAGIC: [u8; 8] = *b"dex\n035\0";
/// Size of the header item.
pub const HEADER_SIZE: u32 = 0x70;
/// Little-endian tag.
pub const ENDIAN_TAG: u32 = 0x1234_5678;
/// Absent index marker.
pub const NO_INDEX: u32 = 0xffff_ffff;

/// A range of instructions covered by one handler list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TryItem {
    /// First covered code unit.
    pub start: u32,
    /// Number of covered code units.
    pub count: u16,
    /// Index into [`CodeItem::handlers`].
    pub handler: usize,
}

/// Handlers of a try range, in match order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CatchHandler {
    /// `(type index, handler address)` pairs.
    pub catches: Vec<(u32, u32)>,
    /// Address of the catch-all handler.
    pub catch_all: Option<u32>,
}

/// The body of a method.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeItem {
    /// Frame size.
    pub registers: u16,
    /// Argument words, occupying the last registers of the frame.
    pub ins: u16,
    /// Largest number of argument words passed to a call.
    pub outs: u16,
    /// Instruction code units.
    pub insns: Vec<u16>,
    /// Try ranges, sorted by address.
    pub tries: Vec<TryItem>,
    /// Handler lists referenced by the try ranges.
    pub handlers: Vec<CatchHandler>,
    /// Line number table.
    pub debug: Option<DebugInfo>,
}

/// A field defined by a class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedField {
    /// Index into the field table.
    pub field: u32,
    /// Access flags.
    pub access: AccessFlags,
}

/// A method defined by a class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedMethod {
    /// Index into the method table.
    pub method: u32,
    /// Access flags.
    pub access: AccessFlags,
    /// Body, absent for abstract and native methods.
    pub code: Option<CodeItem>,
}

/// A class defined by the unit.
///
/// Member lists are sorted by their table index, as the container requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDefinition {
    /// Type index of the class.
    pub class: u32,
    /// Access flags.
    pub access: AccessFlags,
    /// Type index of the superclass.
    pub superclass: Option<u32>,
    /// Type indices of the implemented interfaces.
    pub interfaces: Vec<u32>,
    /// String index of the source file name.
    pub source_file: Option<u32>,
    /// Static fields.
    pub static_fields: Vec<EncodedField>,
    /// Instance fields.
    pub instance_fields: Vec<EncodedField>,
    /// Static, private and constructor methods.
    pub direct_methods: Vec<EncodedMethod>,
    /// Virtual methods.
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassDefinition {
    /// Direct methods followed by virtual methods.
    pub fn methods(&self) -> impl Iterator<Item = &EncodedMethod> {
        self.direct_methods.iter().chain(&self.virtual_methods)
    }

    /// Returns `true` if the class has no members, so no class data item is written.
    #[must_use]
    pub fn has_no_data(&self) -> bool {
        self.static_fields.is_empty()
            && self.instance_fields.is_empty()
            && self.direct_methods.is_empty()
            && self.virtual_methods.is_empty()
    }
}

/// The logical content of a binary unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Unit {
    /// Constant tables.
    pub pool: Pool,
    /// Classes, each after its superclass and interfaces when those are defined here.
    pub classes: Vec<ClassDefinition>,
}
