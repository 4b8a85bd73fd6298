//! Type and member references shared by every stage of the pipeline.
//!
//! Everything here is a plain value: a [`TypeId`] is a type descriptor, [`FieldRef`] and
//! [`MethodRef`] name members of (possibly external) classes, and [`MemberDescriptor`] is
//! the identity of the executable member a trampoline is generated for. None of these are
//! interned globally; the unit builder owns the tables that assign them indices.

mod member;

pub use member::{CallShape, MemberDescriptor, MemberKind};

use std::{fmt, sync::Arc};

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{Error, Result};

/// Register class of a value: which move, return and array opcodes apply to it and whether it
/// occupies one or two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum Kind {
    /// 32-bit integral value (also booleans, bytes, shorts and chars).
    #[strum(serialize = "int")]
    Int,
    /// 32-bit float.
    #[strum(serialize = "float")]
    Float,
    /// 64-bit integer, two registers.
    #[strum(serialize = "long")]
    Long,
    /// 64-bit float, two registers.
    #[strum(serialize = "double")]
    Double,
    /// Object reference or null.
    #[strum(serialize = "object")]
    Object,
}

impl Kind {
    /// Number of registers a value of this kind occupies.
    #[must_use]
    pub const fn width(self) -> u32 {
        match self {
            Kind::Long | Kind::Double => 2,
            _ => 1,
        }
    }

    /// Returns `true` for two-register kinds.
    #[must_use]
    pub const fn is_wide(self) -> bool {
        self.width() == 2
    }
}

/// A type descriptor.
///
/// Primitive types are their own variants; classes and arrays carry their full descriptor
/// (`Ljava/lang/String;`, `[I`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeId {
    /// `V`
    Void,
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `S`
    Short,
    /// `C`
    Char,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// Class or array descriptor.
    Reference(Arc<str>),
}

impl TypeId {
    /// `Ljava/lang/Object;`
    #[must_use]
    pub fn object() -> Self {
        TypeId::Reference(Arc::from("Ljava/lang/Object;"))
    }

    /// `Ljava/lang/String;`
    #[must_use]
    pub fn string() -> Self {
        TypeId::Reference(Arc::from("Ljava/lang/String;"))
    }

    /// `Ljava/lang/Throwable;`
    #[must_use]
    pub fn throwable() -> Self {
        TypeId::Reference(Arc::from("Ljava/lang/Throwable;"))
    }

    /// Class type from a binary name such as `java.lang.String` or `com/example/Foo`.
    #[must_use]
    pub fn class(binary_name: &str) -> Self {
        TypeId::Reference(Arc::from(format!("L{};", binary_name.replace('.', "/"))))
    }

    /// Array type with the given component type.
    #[must_use]
    pub fn array_of(component: &TypeId) -> Self {
        TypeId::Reference(Arc::from(format!("[{}", component.descriptor())))
    }

    /// Parses a single field type descriptor.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] if `descriptor` is not exactly one well-formed type.
    pub fn parse(descriptor: &str) -> Result<Self> {
        match parse_one(descriptor, 0) {
            Some((ty, end)) if end == descriptor.len() => Ok(ty),
            _ => Err(Error::Declaration {
                member: descriptor.to_string(),
                reason: "malformed type descriptor".to_string(),
            }),
        }
    }

    /// The descriptor string.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        match self {
            TypeId::Void => "V",
            TypeId::Boolean => "Z",
            TypeId::Byte => "B",
            TypeId::Short => "S",
            TypeId::Char => "C",
            TypeId::Int => "I",
            TypeId::Long => "J",
            TypeId::Float => "F",
            TypeId::Double => "D",
            TypeId::Reference(desc) => desc,
        }
    }

    /// Shorty character: the descriptor for primitives, `L` for every reference type.
    #[must_use]
    pub fn shorty(&self) -> char {
        match self {
            TypeId::Reference(_) => 'L',
            other => other.descriptor().chars().next().unwrap_or('V'),
        }
    }

    /// Register class of values of this type, `None` for `void`.
    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        match self {
            TypeId::Void => None,
            TypeId::Long => Some(Kind::Long),
            TypeId::Float => Some(Kind::Float),
            TypeId::Double => Some(Kind::Double),
            TypeId::Reference(_) => Some(Kind::Object),
            _ => Some(Kind::Int),
        }
    }

    /// Number of registers a value of this type occupies (0 for `void`).
    #[must_use]
    pub fn width(&self) -> u32 {
        self.kind().map_or(0, Kind::width)
    }

    /// Returns `true` for the eight primitive value types.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        !matches!(self, TypeId::Void | TypeId::Reference(_))
    }

    /// Returns `true` for class and array types.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, TypeId::Reference(_))
    }

    /// Returns `true` for array types.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, TypeId::Reference(desc) if desc.starts_with('['))
    }

    /// Component type of an array type.
    #[must_use]
    pub fn component(&self) -> Option<TypeId> {
        match self {
            TypeId::Reference(desc) if desc.starts_with('[') => TypeId::parse(&desc[1..]).ok(),
            _ => None,
        }
    }

    /// Dotted source-level name (`java.lang.String`, `int[]`).
    #[must_use]
    pub fn java_name(&self) -> String {
        match self {
            TypeId::Void => "void".into(),
            TypeId::Boolean => "boolean".into(),
            TypeId::Byte => "byte".into(),
            TypeId::Short => "short".into(),
            TypeId::Char => "char".into(),
            TypeId::Int => "int".into(),
            TypeId::Long => "long".into(),
            TypeId::Float => "float".into(),
            TypeId::Double => "double".into(),
            TypeId::Reference(desc) => match self.component() {
                Some(component) => format!("{}[]", component.java_name()),
                None => desc
                    .trim_start_matches('L')
                    .trim_end_matches(';')
                    .replace('/', "."),
            },
        }
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

/// Parses one type descriptor starting at byte `start`; returns it and the end offset.
pub(crate) fn parse_one(input: &str, start: usize) -> Option<(TypeId, usize)> {
    let bytes = input.as_bytes();
    let mut pos = start;
    while bytes.get(pos) == Some(&b'[') {
        pos += 1;
    }
    let dims = pos - start;
    let end = match bytes.get(pos)? {
        b'L' => {
            let close = input[pos..].find(';')? + pos;
            let name = &input[pos + 1..close];
            if name.is_empty() || name.contains(['.', '[', '(', ')']) {
                return None;
            }
            close + 1
        }
        b'V' if dims == 0 => pos + 1,
        b'Z' | b'B' | b'S' | b'C' | b'I' | b'J' | b'F' | b'D' => pos + 1,
        _ => return None,
    };
    if dims > 255 {
        return None;
    }
    let ty = match &input[start..end] {
        "V" => TypeId::Void,
        "Z" => TypeId::Boolean,
        "B" => TypeId::Byte,
        "S" => TypeId::Short,
        "C" => TypeId::Char,
        "I" => TypeId::Int,
        "J" => TypeId::Long,
        "F" => TypeId::Float,
        "D" => TypeId::Double,
        desc => TypeId::Reference(Arc::from(desc)),
    };
    Some((ty, end))
}

/// Return type and parameter types of a method.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Prototype {
    /// Return type.
    pub ret: TypeId,
    /// Parameter types, excluding any implicit receiver.
    pub params: Vec<TypeId>,
}

impl Prototype {
    /// Creates a prototype.
    #[must_use]
    pub fn new(ret: TypeId, params: Vec<TypeId>) -> Self {
        Prototype { ret, params }
    }

    /// Shorty descriptor: return shorty followed by the parameter shorties.
    #[must_use]
    pub fn shorty(&self) -> String {
        std::iter::once(self.ret.shorty())
            .chain(self.params.iter().map(TypeId::shorty))
            .collect()
    }

    /// Register words taken by the parameters.
    #[must_use]
    pub fn param_words(&self) -> u32 {
        self.params.iter().map(TypeId::width).sum()
    }

    /// Parses `(params)ret`.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] for malformed input.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let malformed = || Error::Declaration {
            member: descriptor.to_string(),
            reason: "malformed method descriptor".to_string(),
        };
        if !descriptor.starts_with('(') {
            return Err(malformed());
        }
        let mut pos = 1;
        let mut params = Vec::new();
        while descriptor.as_bytes().get(pos) != Some(&b')') {
            let (ty, end) = parse_one(descriptor, pos).ok_or_else(malformed)?;
            if ty == TypeId::Void {
                return Err(malformed());
            }
            params.push(ty);
            pos = end;
        }
        let ret = TypeId::parse(&descriptor[pos + 1..]).map_err(|_| malformed())?;
        Ok(Prototype { ret, params })
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            f.write_str(param.descriptor())?;
        }
        write!(f, "){}", self.ret)
    }
}

/// Reference to a field of some class.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FieldRef {
    /// Declaring class.
    pub owner: TypeId,
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: TypeId,
}

impl FieldRef {
    /// Creates a field reference.
    #[must_use]
    pub fn new(owner: TypeId, name: impl Into<String>, ty: TypeId) -> Self {
        FieldRef {
            owner,
            name: name.into(),
            ty,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.owner, self.name, self.ty)
    }
}

/// Reference to a method of some class.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MethodRef {
    /// Declaring class.
    pub owner: TypeId,
    /// Method name (`<init>` for constructors).
    pub name: String,
    /// Signature.
    pub proto: Prototype,
}

impl MethodRef {
    /// Creates a method reference.
    #[must_use]
    pub fn new(owner: TypeId, name: impl Into<String>, ret: TypeId, params: Vec<TypeId>) -> Self {
        MethodRef {
            owner,
            name: name.into(),
            proto: Prototype::new(ret, params),
        }
    }

    /// Returns `true` for `<init>`.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.owner, self.name, self.proto)
    }
}

bitflags! {
    /// Access flags of classes, fields and methods, with their container encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        /// Visible everywhere
        const PUBLIC = 0x1;
        /// Visible only to the defining class
        const PRIVATE = 0x2;
        /// Visible to the package and subclasses
        const PROTECTED = 0x4;
        /// Not bound to an instance
        const STATIC = 0x8;
        /// Not overridable / not subclassable / not assignable after construction
        const FINAL = 0x10;
        /// Holds the monitor while running
        const SYNCHRONIZED = 0x20;
        /// Accepts a trailing varargs array
        const VARARGS = 0x80;
        /// Implemented in native code
        const NATIVE = 0x100;
        /// Declared on (or is) an interface
        const INTERFACE = 0x200;
        /// No body
        const ABSTRACT = 0x400;
        /// Not present in source
        const SYNTHETIC = 0x1000;
        /// Instance or class initializer
        const CONSTRUCTOR = 0x10000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parse() {
        assert_eq!(TypeId::parse("I").unwrap(), TypeId::Int);
        assert_eq!(TypeId::parse("[[J").unwrap().descriptor(), "[[J");
        assert_eq!(TypeId::parse("Ljava/lang/String;").unwrap(), TypeId::string());
        assert!(TypeId::parse("[V").is_err());
        assert!(TypeId::parse("Ljava.lang.String;").is_err());
        assert!(TypeId::parse("II").is_err());
        assert!(TypeId::parse("L;").is_err());
    }

    #[test]
    fn test_type_properties() {
        assert_eq!(TypeId::Long.width(), 2);
        assert_eq!(TypeId::Void.width(), 0);
        assert_eq!(TypeId::Boolean.kind(), Some(Kind::Int));
        assert_eq!(TypeId::class("java.util.List").descriptor(), "Ljava/util/List;");
        assert_eq!(TypeId::array_of(&TypeId::object()).java_name(), "java.lang.Object[]");
        assert_eq!(TypeId::parse("[I").unwrap().component(), Some(TypeId::Int));
    }

    #[test]
    fn test_prototype_parse_and_shorty() {
        let proto = Prototype::parse("(IJLjava/lang/Object;[Z)D").unwrap();
        assert_eq!(proto.params.len(), 4);
        assert_eq!(proto.shorty(), "DIJLL");
        assert_eq!(proto.param_words(), 5);
        assert_eq!(proto.to_string(), "(IJLjava/lang/Object;[Z)D");
        assert!(Prototype::parse("(V)V").is_err());
        assert!(Prototype::parse("I)V").is_err());
        assert!(Prototype::parse("(I").is_err());
    }
}
