//! Dalvik opcodes and instruction formats.
//!
//! Only the opcodes the code generator selects are listed. The decoder rejects anything
//! else, which keeps the reference reader honest about what the writer can produce.

use strum::{Display, FromRepr};

/// Instruction format: the layout of operands in the code units.
///
/// Names follow the format identifiers of the bytecode reference: the first digit is the
/// size in 16-bit units, the second the number of registers, the letter the kind of extra
/// operand (`x` none, `n`/`s`/`i`/`l`/`h` literal, `t` branch, `c` pool index, `rc` range).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[allow(missing_docs)]
pub enum Format {
    #[strum(serialize = "10x")]
    F10x,
    #[strum(serialize = "12x")]
    F12x,
    #[strum(serialize = "11n")]
    F11n,
    #[strum(serialize = "11x")]
    F11x,
    #[strum(serialize = "10t")]
    F10t,
    #[strum(serialize = "20t")]
    F20t,
    #[strum(serialize = "22x")]
    F22x,
    #[strum(serialize = "21t")]
    F21t,
    #[strum(serialize = "21s")]
    F21s,
    #[strum(serialize = "21h")]
    F21h,
    #[strum(serialize = "21c")]
    F21c,
    #[strum(serialize = "23x")]
    F23x,
    #[strum(serialize = "22t")]
    F22t,
    #[strum(serialize = "22c")]
    F22c,
    #[strum(serialize = "30t")]
    F30t,
    #[strum(serialize = "32x")]
    F32x,
    #[strum(serialize = "31i")]
    F31i,
    #[strum(serialize = "31c")]
    F31c,
    #[strum(serialize = "35c")]
    F35c,
    #[strum(serialize = "3rc")]
    F3rc,
    #[strum(serialize = "51l")]
    F51l,
}

impl Format {
    /// Size of an instruction of this format, in code units.
    #[must_use]
    pub const fn units(self) -> u32 {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22t
            | Format::F22c => 2,
            Format::F30t
            | Format::F32x
            | Format::F31i
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F51l => 5,
        }
    }

    /// Largest register number each register operand can hold, in operand order.
    #[must_use]
    pub const fn register_limits(self) -> &'static [u32] {
        const NIBBLE: u32 = 0xf;
        const BYTE: u32 = 0xff;
        const WORD: u32 = 0xffff;
        match self {
            Format::F10x | Format::F10t | Format::F20t | Format::F30t => &[],
            Format::F12x | Format::F22t | Format::F22c => &[NIBBLE, NIBBLE],
            Format::F11n => &[NIBBLE],
            Format::F11x | Format::F21t | Format::F21s | Format::F21h | Format::F21c => &[BYTE],
            Format::F31i | Format::F31c | Format::F51l => &[BYTE],
            Format::F22x => &[BYTE, WORD],
            Format::F23x => &[BYTE, BYTE, BYTE],
            Format::F32x => &[WORD, WORD],
            Format::F35c => &[NIBBLE, NIBBLE, NIBBLE, NIBBLE, NIBBLE],
            Format::F3rc => &[WORD],
        }
    }
}

/// What an instruction's index operand refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum IndexKind {
    /// String table.
    String,
    /// Type table.
    Type,
    /// Field table.
    Field,
    /// Method table.
    Method,
}

/// A Dalvik opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Opcode {
    #[strum(serialize = "nop")]
    Nop = 0x00,
    #[strum(serialize = "move")]
    Move = 0x01,
    #[strum(serialize = "move/from16")]
    MoveFrom16 = 0x02,
    #[strum(serialize = "move/16")]
    Move16 = 0x03,
    #[strum(serialize = "move-wide")]
    MoveWide = 0x04,
    #[strum(serialize = "move-wide/from16")]
    MoveWideFrom16 = 0x05,
    #[strum(serialize = "move-wide/16")]
    MoveWide16 = 0x06,
    #[strum(serialize = "move-object")]
    MoveObject = 0x07,
    #[strum(serialize = "move-object/from16")]
    MoveObjectFrom16 = 0x08,
    #[strum(serialize = "move-object/16")]
    MoveObject16 = 0x09,
    #[strum(serialize = "move-result")]
    MoveResult = 0x0a,
    #[strum(serialize = "move-result-wide")]
    MoveResultWide = 0x0b,
    #[strum(serialize = "move-result-object")]
    MoveResultObject = 0x0c,
    #[strum(serialize = "move-exception")]
    MoveException = 0x0d,
    #[strum(serialize = "return-void")]
    ReturnVoid = 0x0e,
    #[strum(serialize = "return")]
    Return = 0x0f,
    #[strum(serialize = "return-wide")]
    ReturnWide = 0x10,
    #[strum(serialize = "return-object")]
    ReturnObject = 0x11,
    #[strum(serialize = "const/4")]
    Const4 = 0x12,
    #[strum(serialize = "const/16")]
    Const16 = 0x13,
    #[strum(serialize = "const")]
    Const = 0x14,
    #[strum(serialize = "const/high16")]
    ConstHigh16 = 0x15,
    #[strum(serialize = "const-wide/16")]
    ConstWide16 = 0x16,
    #[strum(serialize = "const-wide/32")]
    ConstWide32 = 0x17,
    #[strum(serialize = "const-wide")]
    ConstWide = 0x18,
    #[strum(serialize = "const-wide/high16")]
    ConstWideHigh16 = 0x19,
    #[strum(serialize = "const-string")]
    ConstString = 0x1a,
    #[strum(serialize = "const-string/jumbo")]
    ConstStringJumbo = 0x1b,
    #[strum(serialize = "const-class")]
    ConstClass = 0x1c,
    #[strum(serialize = "check-cast")]
    CheckCast = 0x1f,
    #[strum(serialize = "instance-of")]
    InstanceOf = 0x20,
    #[strum(serialize = "array-length")]
    ArrayLength = 0x21,
    #[strum(serialize = "new-instance")]
    NewInstance = 0x22,
    #[strum(serialize = "new-array")]
    NewArray = 0x23,
    #[strum(serialize = "throw")]
    Throw = 0x27,
    #[strum(serialize = "goto")]
    Goto = 0x28,
    #[strum(serialize = "goto/16")]
    Goto16 = 0x29,
    #[strum(serialize = "goto/32")]
    Goto32 = 0x2a,
    #[strum(serialize = "cmpl-float")]
    CmplFloat = 0x2d,
    #[strum(serialize = "cmpg-float")]
    CmpgFloat = 0x2e,
    #[strum(serialize = "cmpl-double")]
    CmplDouble = 0x2f,
    #[strum(serialize = "cmpg-double")]
    CmpgDouble = 0x30,
    #[strum(serialize = "cmp-long")]
    CmpLong = 0x31,
    #[strum(serialize = "if-eq")]
    IfEq = 0x32,
    #[strum(serialize = "if-ne")]
    IfNe = 0x33,
    #[strum(serialize = "if-lt")]
    IfLt = 0x34,
    #[strum(serialize = "if-ge")]
    IfGe = 0x35,
    #[strum(serialize = "if-gt")]
    IfGt = 0x36,
    #[strum(serialize = "if-le")]
    IfLe = 0x37,
    #[strum(serialize = "if-eqz")]
    IfEqz = 0x38,
    #[strum(serialize = "if-nez")]
    IfNez = 0x39,
    #[strum(serialize = "if-ltz")]
    IfLtz = 0x3a,
    #[strum(serialize = "if-gez")]
    IfGez = 0x3b,
    #[strum(serialize = "if-gtz")]
    IfGtz = 0x3c,
    #[strum(serialize = "if-lez")]
    IfLez = 0x3d,
    #[strum(serialize = "aget")]
    Aget = 0x44,
    #[strum(serialize = "aget-wide")]
    AgetWide = 0x45,
    #[strum(serialize = "aget-object")]
    AgetObject = 0x46,
    #[strum(serialize = "aget-boolean")]
    AgetBoolean = 0x47,
    #[strum(serialize = "aget-byte")]
    AgetByte = 0x48,
    #[strum(serialize = "aget-char")]
    AgetChar = 0x49,
    #[strum(serialize = "aget-short")]
    AgetShort = 0x4a,
    #[strum(serialize = "aput")]
    Aput = 0x4b,
    #[strum(serialize = "aput-wide")]
    AputWide = 0x4c,
    #[strum(serialize = "aput-object")]
    AputObject = 0x4d,
    #[strum(serialize = "aput-boolean")]
    AputBoolean = 0x4e,
    #[strum(serialize = "aput-byte")]
    AputByte = 0x4f,
    #[strum(serialize = "aput-char")]
    AputChar = 0x50,
    #[strum(serialize = "aput-short")]
    AputShort = 0x51,
    #[strum(serialize = "iget")]
    Iget = 0x52,
    #[strum(serialize = "iget-wide")]
    IgetWide = 0x53,
    #[strum(serialize = "iget-object")]
    IgetObject = 0x54,
    #[strum(serialize = "iget-boolean")]
    IgetBoolean = 0x55,
    #[strum(serialize = "iget-byte")]
    IgetByte = 0x56,
    #[strum(serialize = "iget-char")]
    IgetChar = 0x57,
    #[strum(serialize = "iget-short")]
    IgetShort = 0x58,
    #[strum(serialize = "iput")]
    Iput = 0x59,
    #[strum(serialize = "iput-wide")]
    IputWide = 0x5a,
    #[strum(serialize = "iput-object")]
    IputObject = 0x5b,
    #[strum(serialize = "iput-boolean")]
    IputBoolean = 0x5c,
    #[strum(serialize = "iput-byte")]
    IputByte = 0x5d,
    #[strum(serialize = "iput-char")]
    IputChar = 0x5e,
    #[strum(serialize = "iput-short")]
    IputShort = 0x5f,
    #[strum(serialize = "sget")]
    Sget = 0x60,
    #[strum(serialize = "sget-wide")]
    SgetWide = 0x61,
    #[strum(serialize = "sget-object")]
    SgetObject = 0x62,
    #[strum(serialize = "sget-boolean")]
    SgetBoolean = 0x63,
    #[strum(serialize = "sget-byte")]
    SgetByte = 0x64,
    #[strum(serialize = "sget-char")]
    SgetChar = 0x65,
    #[strum(serialize = "sget-short")]
    SgetShort = 0x66,
    #[strum(serialize = "sput")]
    Sput = 0x67,
    #[strum(serialize = "sput-wide")]
    SputWide = 0x68,
    #[strum(serialize = "sput-object")]
    SputObject = 0x69,
    #[strum(serialize = "sput-boolean")]
    SputBoolean = 0x6a,
    #[strum(serialize = "sput-byte")]
    SputByte = 0x6b,
    #[strum(serialize = "sput-char")]
    SputChar = 0x6c,
    #[strum(serialize = "sput-short")]
    SputShort = 0x6d,
    #[strum(serialize = "invoke-virtual")]
    InvokeVirtual = 0x6e,
    #[strum(serialize = "invoke-super")]
    InvokeSuper = 0x6f,
    #[strum(serialize = "invoke-direct")]
    InvokeDirect = 0x70,
    #[strum(serialize = "invoke-static")]
    InvokeStatic = 0x71,
    #[strum(serialize = "invoke-interface")]
    InvokeInterface = 0x72,
    #[strum(serialize = "invoke-virtual/range")]
    InvokeVirtualRange = 0x74,
    #[strum(serialize = "invoke-super/range")]
    InvokeSuperRange = 0x75,
    #[strum(serialize = "invoke-direct/range")]
    InvokeDirectRange = 0x76,
    #[strum(serialize = "invoke-static/range")]
    InvokeStaticRange = 0x77,
    #[strum(serialize = "invoke-interface/range")]
    InvokeInterfaceRange = 0x78,
    #[strum(serialize = "neg-int")]
    NegInt = 0x7b,
    #[strum(serialize = "not-int")]
    NotInt = 0x7c,
    #[strum(serialize = "neg-long")]
    NegLong = 0x7d,
    #[strum(serialize = "not-long")]
    NotLong = 0x7e,
    #[strum(serialize = "neg-float")]
    NegFloat = 0x7f,
    #[strum(serialize = "neg-double")]
    NegDouble = 0x80,
    #[strum(serialize = "int-to-long")]
    IntToLong = 0x81,
    #[strum(serialize = "int-to-float")]
    IntToFloat = 0x82,
    #[strum(serialize = "int-to-double")]
    IntToDouble = 0x83,
    #[strum(serialize = "long-to-int")]
    LongToInt = 0x84,
    #[strum(serialize = "long-to-float")]
    LongToFloat = 0x85,
    #[strum(serialize = "long-to-double")]
    LongToDouble = 0x86,
    #[strum(serialize = "float-to-int")]
    FloatToInt = 0x87,
    #[strum(serialize = "float-to-long")]
    FloatToLong = 0x88,
    #[strum(serialize = "float-to-double")]
    FloatToDouble = 0x89,
    #[strum(serialize = "double-to-int")]
    DoubleToInt = 0x8a,
    #[strum(serialize = "double-to-long")]
    DoubleToLong = 0x8b,
    #[strum(serialize = "double-to-float")]
    DoubleToFloat = 0x8c,
    #[strum(serialize = "int-to-byte")]
    IntToByte = 0x8d,
    #[strum(serialize = "int-to-char")]
    IntToChar = 0x8e,
    #[strum(serialize = "int-to-short")]
    IntToShort = 0x8f,
    #[strum(serialize = "add-int")]
    AddInt = 0x90,
    #[strum(serialize = "sub-int")]
    SubInt = 0x91,
    #[strum(serialize = "mul-int")]
    MulInt = 0x92,
    #[strum(serialize = "div-int")]
    DivInt = 0x93,
    #[strum(serialize = "rem-int")]
    RemInt = 0x94,
    #[strum(serialize = "and-int")]
    AndInt = 0x95,
    #[strum(serialize = "or-int")]
    OrInt = 0x96,
    #[strum(serialize = "xor-int")]
    XorInt = 0x97,
    #[strum(serialize = "shl-int")]
    ShlInt = 0x98,
    #[strum(serialize = "shr-int")]
    ShrInt = 0x99,
    #[strum(serialize = "ushr-int")]
    UshrInt = 0x9a,
    #[strum(serialize = "add-long")]
    AddLong = 0x9b,
    #[strum(serialize = "sub-long")]
    SubLong = 0x9c,
    #[strum(serialize = "mul-long")]
    MulLong = 0x9d,
    #[strum(serialize = "div-long")]
    DivLong = 0x9e,
    #[strum(serialize = "rem-long")]
    RemLong = 0x9f,
    #[strum(serialize = "and-long")]
    AndLong = 0xa0,
    #[strum(serialize = "or-long")]
    OrLong = 0xa1,
    #[strum(serialize = "xor-long")]
    XorLong = 0xa2,
    #[strum(serialize = "shl-long")]
    ShlLong = 0xa3,
    #[strum(serialize = "shr-long")]
    ShrLong = 0xa4,
    #[strum(serialize = "ushr-long")]
    UshrLong = 0xa5,
    #[strum(serialize = "add-float")]
    AddFloat = 0xa6,
    #[strum(serialize = "sub-float")]
    SubFloat = 0xa7,
    #[strum(serialize = "mul-float")]
    MulFloat = 0xa8,
    #[strum(serialize = "div-float")]
    DivFloat = 0xa9,
    #[strum(serialize = "rem-float")]
    RemFloat = 0xaa,
    #[strum(serialize = "add-double")]
    AddDouble = 0xab,
    #[strum(serialize = "sub-double")]
    SubDouble = 0xac,
    #[strum(serialize = "mul-double")]
    MulDouble = 0xad,
    #[strum(serialize = "div-double")]
    DivDouble = 0xae,
    #[strum(serialize = "rem-double")]
    RemDouble = 0xaf,
}

impl Opcode {
    /// Operand layout of the opcode.
    #[must_use]
    pub const fn format(self) -> Format {
        use Opcode as O;
        match self {
            O::Nop | O::ReturnVoid => Format::F10x,
            O::Move | O::MoveWide | O::MoveObject | O::ArrayLength => Format::F12x,
            O::NegInt
            | O::NotInt
            | O::NegLong
            | O::NotLong
            | O::NegFloat
            | O::NegDouble
            | O::IntToLong
            | O::IntToFloat
            | O::IntToDouble
            | O::LongToInt
            | O::LongToFloat
            | O::LongToDouble
            | O::FloatToInt
            | O::FloatToLong
            | O::FloatToDouble
            | O::DoubleToInt
            | O::DoubleToLong
            | O::DoubleToFloat
            | O::IntToByte
            | O::IntToChar
            | O::IntToShort => Format::F12x,
            O::MoveFrom16 | O::MoveWideFrom16 | O::MoveObjectFrom16 => Format::F22x,
            O::Move16 | O::MoveWide16 | O::MoveObject16 => Format::F32x,
            O::MoveResult
            | O::MoveResultWide
            | O::MoveResultObject
            | O::MoveException
            | O::Return
            | O::ReturnWide
            | O::ReturnObject
            | O::Throw => Format::F11x,
            O::Const4 => Format::F11n,
            O::Const16 | O::ConstWide16 => Format::F21s,
            O::ConstHigh16 | O::ConstWideHigh16 => Format::F21h,
            O::Const | O::ConstWide32 => Format::F31i,
            O::ConstWide => Format::F51l,
            O::ConstString | O::ConstClass | O::CheckCast | O::NewInstance => Format::F21c,
            O::ConstStringJumbo => Format::F31c,
            O::InstanceOf | O::NewArray => Format::F22c,
            O::Goto => Format::F10t,
            O::Goto16 => Format::F20t,
            O::Goto32 => Format::F30t,
            O::IfEq | O::IfNe | O::IfLt | O::IfGe | O::IfGt | O::IfLe => Format::F22t,
            O::IfEqz | O::IfNez | O::IfLtz | O::IfGez | O::IfGtz | O::IfLez => Format::F21t,
            O::Iget
            | O::IgetWide
            | O::IgetObject
            | O::IgetBoolean
            | O::IgetByte
            | O::IgetChar
            | O::IgetShort
            | O::Iput
            | O::IputWide
            | O::IputObject
            | O::IputBoolean
            | O::IputByte
            | O::IputChar
            | O::IputShort => Format::F22c,
            O::Sget
            | O::SgetWide
            | O::SgetObject
            | O::SgetBoolean
            | O::SgetByte
            | O::SgetChar
            | O::SgetShort
            | O::Sput
            | O::SputWide
            | O::SputObject
            | O::SputBoolean
            | O::SputByte
            | O::SputChar
            | O::SputShort => Format::F21c,
            O::InvokeVirtual
            | O::InvokeSuper
            | O::InvokeDirect
            | O::InvokeStatic
            | O::InvokeInterface => Format::F35c,
            O::InvokeVirtualRange
            | O::InvokeSuperRange
            | O::InvokeDirectRange
            | O::InvokeStaticRange
            | O::InvokeInterfaceRange => Format::F3rc,
            _ => Format::F23x,
        }
    }

    /// The table an index operand refers to, for opcodes that carry one.
    #[must_use]
    pub const fn index_kind(self) -> Option<IndexKind> {
        use Opcode as O;
        match self {
            O::ConstString | O::ConstStringJumbo => Some(IndexKind::String),
            O::ConstClass | O::CheckCast | O::InstanceOf | O::NewInstance | O::NewArray => {
                Some(IndexKind::Type)
            }
            _ => match self.format() {
                Format::F22c | Format::F21c => Some(IndexKind::Field),
                Format::F35c | Format::F3rc => Some(IndexKind::Method),
                _ => None,
            },
        }
    }

    /// Returns `true` for the three `goto` widths.
    #[must_use]
    pub const fn is_goto(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::Goto16 | Opcode::Goto32)
    }

    /// Returns `true` if the instruction has a branch target.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(
            self.format(),
            Format::F10t | Format::F20t | Format::F30t | Format::F21t | Format::F22t
        )
    }

    /// Returns `true` for the `move-result` family, which must directly follow a call.
    #[must_use]
    pub const fn is_move_result(self) -> bool {
        matches!(
            self,
            Opcode::MoveResult | Opcode::MoveResultWide | Opcode::MoveResultObject
        )
    }

    /// Returns `true` for the `invoke-*` family.
    #[must_use]
    pub const fn is_invoke(self) -> bool {
        matches!(self.format(), Format::F35c | Format::F3rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_repr_and_names() {
        assert_eq!(Opcode::from_repr(0x6e), Some(Opcode::InvokeVirtual));
        assert_eq!(Opcode::from_repr(0x73), None);
        assert_eq!(Opcode::MoveWideFrom16.to_string(), "move-wide/from16");
        assert_eq!(Opcode::RemDouble as u8, 0xaf);
    }

    #[test]
    fn test_formats_and_index_kinds() {
        assert_eq!(Opcode::AddLong.format(), Format::F23x);
        assert_eq!(Opcode::CmpLong.format(), Format::F23x);
        assert_eq!(Opcode::Aput.format(), Format::F23x);
        assert_eq!(Opcode::IputWide.index_kind(), Some(IndexKind::Field));
        assert_eq!(Opcode::InstanceOf.index_kind(), Some(IndexKind::Type));
        assert_eq!(Opcode::InvokeStaticRange.index_kind(), Some(IndexKind::Method));
        assert_eq!(Opcode::ConstWide.format().units(), 5);
        assert!(Opcode::IfLez.is_branch());
        assert!(!Opcode::Throw.is_branch());
    }
}
