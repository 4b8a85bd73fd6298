//! Identity of a hookable executable member.

use std::fmt;

use crate::{
    types::{AccessFlags, Prototype, TypeId},
    utils::sha1_hex,
    Error, Result,
};

/// Upper bound on argument words for a single call, receiver included.
const MAX_ARG_WORDS: u32 = 255;

/// Name of a member: a regular method or a constructor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Named method.
    Method(String),
    /// Instance initializer (`<init>`).
    Constructor,
}

/// How the member receives its arguments.
///
/// The receiver of an instance member is an explicit tagged field rather than "the first
/// parameter", so parameter indices never shift depending on the call shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// No receiver.
    Static {
        /// Declared parameter types.
        params: Vec<TypeId>,
    },
    /// Receiver passed ahead of the declared parameters.
    Instance {
        /// Static type of the receiver.
        receiver: TypeId,
        /// Declared parameter types.
        params: Vec<TypeId>,
    },
}

impl CallShape {
    /// Declared parameter types, excluding the receiver.
    #[must_use]
    pub fn params(&self) -> &[TypeId] {
        match self {
            CallShape::Static { params } | CallShape::Instance { params, .. } => params,
        }
    }

    /// The receiver type of an instance call.
    #[must_use]
    pub fn receiver(&self) -> Option<&TypeId> {
        match self {
            CallShape::Static { .. } => None,
            CallShape::Instance { receiver, .. } => Some(receiver),
        }
    }

    /// Returns `true` for static members.
    #[must_use]
    pub fn is_static(&self) -> bool {
        matches!(self, CallShape::Static { .. })
    }
}

/// Immutable identity of a method or constructor that can be hooked.
///
/// # Examples
///
/// ```rust,ignore
/// use dexhook::prelude::*;
///
/// let member = MemberDescriptor::parse("Lcom/example/Foo;->bar(ILjava/lang/String;)Z")?;
/// assert!(!member.is_static());
/// assert_eq!(member.params().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberDescriptor {
    owner: TypeId,
    kind: MemberKind,
    shape: CallShape,
    ret: TypeId,
    exceptions: Vec<TypeId>,
    flags: AccessFlags,
}

impl MemberDescriptor {
    /// Describes a regular method.
    #[must_use]
    pub fn method(owner: TypeId, name: impl Into<String>, shape: CallShape, ret: TypeId) -> Self {
        let flags = if shape.is_static() {
            AccessFlags::PUBLIC | AccessFlags::STATIC
        } else {
            AccessFlags::PUBLIC
        };
        MemberDescriptor {
            owner,
            kind: MemberKind::Method(name.into()),
            shape,
            ret,
            exceptions: Vec::new(),
            flags,
        }
    }

    /// Describes a constructor of `owner`.
    #[must_use]
    pub fn constructor(owner: TypeId, params: Vec<TypeId>) -> Self {
        MemberDescriptor {
            shape: CallShape::Instance {
                receiver: owner.clone(),
                params,
            },
            owner,
            kind: MemberKind::Constructor,
            ret: TypeId::Void,
            exceptions: Vec::new(),
            flags: AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        }
    }

    /// Adds declared exception types.
    #[must_use]
    pub fn throws(mut self, exceptions: impl IntoIterator<Item = TypeId>) -> Self {
        self.exceptions.extend(exceptions);
        self
    }

    /// Replaces the access flags of the target.
    #[must_use]
    pub fn with_flags(mut self, flags: AccessFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Parses the canonical form produced by [`MemberDescriptor::canonical`]:
    /// `[static ]Lowner;->name(params)ret`.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] if the text is not a well-formed signature.
    pub fn parse(text: &str) -> Result<Self> {
        let declaration = |reason: &str| Error::Declaration {
            member: text.to_string(),
            reason: reason.to_string(),
        };
        let (is_static, rest) = match text.trim().strip_prefix("static ") {
            Some(rest) => (true, rest.trim_start()),
            None => (false, text.trim()),
        };
        let (owner, rest) = rest
            .split_once("->")
            .ok_or_else(|| declaration("missing '->'"))?;
        let owner = TypeId::parse(owner).map_err(|_| declaration("malformed owner type"))?;
        let open = rest.find('(').ok_or_else(|| declaration("missing parameter list"))?;
        let name = &rest[..open];
        let proto = Prototype::parse(&rest[open..])?;

        let member = if name == "<init>" {
            if is_static {
                return Err(declaration("constructors cannot be static"));
            }
            if proto.ret != TypeId::Void {
                return Err(declaration("constructors must return void"));
            }
            MemberDescriptor::constructor(owner, proto.params)
        } else {
            let shape = if is_static {
                CallShape::Static {
                    params: proto.params,
                }
            } else {
                CallShape::Instance {
                    receiver: owner.clone(),
                    params: proto.params,
                }
            };
            MemberDescriptor::method(owner, name, shape, proto.ret)
        };
        member.validate()?;
        Ok(member)
    }

    /// Declaring type.
    #[must_use]
    pub fn owner(&self) -> &TypeId {
        &self.owner
    }

    /// Method name or constructor marker.
    #[must_use]
    pub fn kind(&self) -> &MemberKind {
        &self.kind
    }

    /// The name as it appears in method references.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            MemberKind::Method(name) => name,
            MemberKind::Constructor => "<init>",
        }
    }

    /// Call shape (static or instance with receiver).
    #[must_use]
    pub fn shape(&self) -> &CallShape {
        &self.shape
    }

    /// Declared parameter types, excluding the receiver.
    #[must_use]
    pub fn params(&self) -> &[TypeId] {
        self.shape.params()
    }

    /// Declared return type.
    #[must_use]
    pub fn return_type(&self) -> &TypeId {
        &self.ret
    }

    /// Declared exception types.
    #[must_use]
    pub fn exceptions(&self) -> &[TypeId] {
        &self.exceptions
    }

    /// Access flags of the target.
    #[must_use]
    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    /// Returns `true` for static members.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.shape.is_static()
    }

    /// Returns `true` for constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.kind == MemberKind::Constructor
    }

    /// Canonical signature string; two descriptors denote the same runtime member exactly
    /// when their canonical strings are equal.
    #[must_use]
    pub fn canonical(&self) -> String {
        let prefix = if self.is_static() { "static " } else { "" };
        let proto = Prototype::new(self.ret.clone(), self.params().to_vec());
        format!("{prefix}{}->{}{proto}", self.owner, self.name())
    }

    /// Stable content hash of the canonical signature (lower-case SHA-1 hex).
    #[must_use]
    pub fn content_hash(&self) -> String {
        sha1_hex(self.canonical().as_bytes())
    }

    /// Parameter types of the generated trampoline methods: the receiver (erased to
    /// `Object`) followed by the declared parameters.
    #[must_use]
    pub fn trampoline_params(&self) -> Vec<TypeId> {
        let mut params = Vec::with_capacity(self.params().len() + 1);
        if !self.is_static() {
            params.push(TypeId::object());
        }
        params.extend(self.params().iter().cloned());
        params
    }

    /// Return type of the generated trampoline methods: primitives and `void` are kept,
    /// every reference type is erased to `Object`.
    #[must_use]
    pub fn trampoline_return(&self) -> TypeId {
        if self.ret.is_reference() {
            TypeId::object()
        } else {
            self.ret.clone()
        }
    }

    /// Argument words of a call to this member, receiver included.
    #[must_use]
    pub fn arg_words(&self) -> u32 {
        let receiver = u32::from(!self.is_static());
        receiver + self.params().iter().map(TypeId::width).sum::<u32>()
    }

    /// Checks that a trampoline can be generated for this member.
    ///
    /// # Errors
    /// Returns [`Error::Declaration`] for abstract members, instance members of interfaces,
    /// non-class owners, malformed receivers or parameter lists exceeding the call limit.
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: &str| {
            Err(Error::Declaration {
                member: self.canonical(),
                reason: reason.to_string(),
            })
        };
        if !self.owner.is_reference() || self.owner.is_array() {
            return reject("declaring type must be a class");
        }
        match &self.kind {
            MemberKind::Method(name) if name.is_empty() => return reject("empty method name"),
            MemberKind::Method(name) if name.starts_with('<') => {
                return reject("initializers are only hookable as constructors")
            }
            MemberKind::Method(name) if name.contains(['(', ')', ';', '/', '[']) => {
                return reject("method name contains descriptor characters")
            }
            _ => {}
        }
        if self.flags.contains(AccessFlags::ABSTRACT) {
            return reject("abstract members have no code to redirect");
        }
        if self.flags.contains(AccessFlags::INTERFACE) && !self.is_static() {
            return reject("instance members of interfaces cannot be hooked");
        }
        if let Some(receiver) = self.shape.receiver() {
            if !receiver.is_reference() {
                return reject("receiver must be a reference type");
            }
        }
        if self.is_constructor() && self.ret != TypeId::Void {
            return reject("constructors must return void");
        }
        if self.params().contains(&TypeId::Void) {
            return reject("parameters cannot be void");
        }
        if self.arg_words() > MAX_ARG_WORDS {
            return reject("too many argument words");
        }
        Ok(())
    }
}

impl fmt::Display for MemberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_parse_roundtrip() {
        let text = "static Lcom/example/Calc;->add(IJ)J";
        let member = MemberDescriptor::parse(text).unwrap();
        assert!(member.is_static());
        assert_eq!(member.params(), &[TypeId::Int, TypeId::Long]);
        assert_eq!(member.canonical(), text);
        assert_eq!(member.arg_words(), 3);
    }

    #[test]
    fn test_member_instance_trampoline_shape() {
        let member =
            MemberDescriptor::parse("Lcom/example/Foo;->name(Ljava/lang/String;)Ljava/util/List;")
                .unwrap();
        assert_eq!(
            member.shape().receiver(),
            Some(&TypeId::class("com.example.Foo"))
        );
        assert_eq!(
            member.trampoline_params(),
            vec![TypeId::object(), TypeId::string()]
        );
        assert_eq!(member.trampoline_return(), TypeId::object());
    }

    #[test]
    fn test_member_constructor() {
        let member = MemberDescriptor::parse("Lcom/example/Foo;-><init>(I)V").unwrap();
        assert!(member.is_constructor());
        assert_eq!(member.name(), "<init>");
        assert!(MemberDescriptor::parse("static Lcom/example/Foo;-><init>()V").is_err());
        assert!(MemberDescriptor::parse("Lcom/example/Foo;-><init>()I").is_err());
    }

    #[test]
    fn test_member_declaration_errors() {
        assert!(MemberDescriptor::parse("Lcom/example/Foo;bar()V").is_err());
        assert!(MemberDescriptor::parse("I->bar()V").is_err());
        assert!(MemberDescriptor::parse("Lcom/example/Foo;-><clinit>()V").is_err());

        let abstract_member = MemberDescriptor::method(
            TypeId::class("com.example.Foo"),
            "run",
            CallShape::Static { params: vec![] },
            TypeId::Void,
        )
        .with_flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT);
        assert!(matches!(
            abstract_member.validate(),
            Err(Error::Declaration { .. })
        ));

        let too_wide = MemberDescriptor::method(
            TypeId::class("com.example.Foo"),
            "wide",
            CallShape::Static {
                params: vec![TypeId::Long; 128],
            },
            TypeId::Void,
        );
        assert!(too_wide.validate().is_err());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = MemberDescriptor::parse("Lcom/example/Foo;->bar()V").unwrap();
        let b = MemberDescriptor::parse("  Lcom/example/Foo;->bar()V ").unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 40);
        let c = MemberDescriptor::parse("static Lcom/example/Foo;->bar()V").unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }
}
