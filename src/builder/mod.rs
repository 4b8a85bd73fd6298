//! Declarative construction of binary units.
//!
//! A [`UnitBuilder`] collects class declarations with their fields and methods. Method bodies
//! are written through the [`Code`] handle returned by [`UnitBuilder::declare_method`]. The
//! builder performs only declaration-level checks (duplicate members, members of undeclared
//! classes); lowering the recorded bodies and encoding the unit happens in
//! [`crate::codegen`].

mod code;

pub use code::{CatchClause, Code, Label, Local};
pub(crate) use code::{Item, StreamInsn};

use crate::{
    types::{AccessFlags, FieldRef, MethodRef, TypeId},
    Error, Result,
};

/// A field declared on a generated class.
#[derive(Clone, Debug)]
pub struct FieldDecl {
    /// Field identity.
    pub field: FieldRef,
    /// Access flags; `STATIC` decides whether it is a static or instance field.
    pub access: AccessFlags,
}

/// A method declared on a generated class.
#[derive(Debug)]
pub struct MethodDecl {
    /// Method identity.
    pub method: MethodRef,
    /// Access flags.
    pub access: AccessFlags,
    /// Body, absent for abstract and native methods.
    pub code: Option<Code>,
}

impl MethodDecl {
    /// Returns `true` if the method is dispatched virtually (not static, private or a
    /// constructor).
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        !self
            .access
            .intersects(AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR)
            && !self.method.is_constructor()
    }
}

/// A class declared in the unit.
#[derive(Debug)]
pub struct ClassDecl {
    /// Class type.
    pub ty: TypeId,
    /// Access flags.
    pub access: AccessFlags,
    /// Superclass; `None` only for `java.lang.Object` itself.
    pub superclass: Option<TypeId>,
    /// Implemented interfaces.
    pub interfaces: Vec<TypeId>,
    /// Source file attribute.
    pub source_file: Option<String>,
    /// Fields in declaration order.
    pub fields: Vec<FieldDecl>,
    /// Methods in declaration order.
    pub methods: Vec<MethodDecl>,
}

/// Collects the classes of one binary unit.
#[derive(Debug, Default)]
pub struct UnitBuilder {
    classes: Vec<ClassDecl>,
}

impl UnitBuilder {
    /// Creates an empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a class.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if `ty` is not a class type or is already declared.
    pub fn declare_class(
        &mut self,
        ty: TypeId,
        access: AccessFlags,
        superclass: Option<TypeId>,
    ) -> Result<&mut ClassDecl> {
        if !ty.is_reference() || ty.is_array() {
            return Err(declaration_misuse(&ty, "not a class type"));
        }
        if self.classes.iter().any(|c| c.ty == ty) {
            return Err(declaration_misuse(&ty, "class declared twice"));
        }
        self.classes.push(ClassDecl {
            ty,
            access,
            superclass,
            interfaces: Vec::new(),
            source_file: None,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        let last = self.classes.len() - 1;
        Ok(&mut self.classes[last])
    }

    /// Declares a field on an already declared class.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the owner is undeclared or the field exists.
    pub fn declare_field(&mut self, field: FieldRef, access: AccessFlags) -> Result<()> {
        let class = self.class_mut(&field.owner)?;
        if class
            .fields
            .iter()
            .any(|f| f.field.name == field.name && f.field.ty == field.ty)
        {
            return Err(declaration_misuse(&field, "field declared twice"));
        }
        class.fields.push(FieldDecl { field, access });
        Ok(())
    }

    /// Declares a method with a body and returns the body for writing.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the owner is undeclared, the method exists, or the
    /// flags declare it abstract or native.
    pub fn declare_method(&mut self, method: MethodRef, access: AccessFlags) -> Result<&mut Code> {
        if access.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE) {
            return Err(declaration_misuse(&method, "method with code cannot be abstract or native"));
        }
        let access = if method.is_constructor() {
            access | AccessFlags::CONSTRUCTOR
        } else {
            access
        };
        let is_static = access.contains(AccessFlags::STATIC);
        let decl = self.push_method(method.clone(), access, None)?;
        Ok(decl.code.get_or_insert_with(|| Code::new(method, is_static)))
    }

    /// Declares a method without a body.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the owner is undeclared, the method exists, or the
    /// flags are neither abstract nor native.
    pub fn declare_bodiless(&mut self, method: MethodRef, access: AccessFlags) -> Result<()> {
        if !access.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE) {
            return Err(declaration_misuse(&method, "method without code must be abstract or native"));
        }
        self.push_method(method, access, None).map(|_| ())
    }

    /// Looks up a declared class.
    #[must_use]
    pub fn class(&self, ty: &TypeId) -> Option<&ClassDecl> {
        self.classes.iter().find(|c| &c.ty == ty)
    }

    /// Declared classes, in declaration order.
    #[must_use]
    pub fn classes(&self) -> &[ClassDecl] {
        &self.classes
    }

    /// Consumes the builder.
    #[must_use]
    pub fn into_classes(self) -> Vec<ClassDecl> {
        self.classes
    }

    fn push_method(
        &mut self,
        method: MethodRef,
        access: AccessFlags,
        code: Option<Code>,
    ) -> Result<&mut MethodDecl> {
        let class = self.class_mut(&method.owner)?;
        if class
            .methods
            .iter()
            .any(|m| m.method.name == method.name && m.method.proto == method.proto)
        {
            return Err(declaration_misuse(&method, "method declared twice"));
        }
        class.methods.push(MethodDecl {
            method,
            access,
            code,
        });
        let last = class.methods.len() - 1;
        Ok(&mut class.methods[last])
    }

    fn class_mut(&mut self, ty: &TypeId) -> Result<&mut ClassDecl> {
        self.classes
            .iter_mut()
            .find(|c| &c.ty == ty)
            .ok_or_else(|| declaration_misuse(ty, "owner class not declared"))
    }
}

fn declaration_misuse(item: &impl std::fmt::Display, message: &str) -> Error {
    Error::Structural {
        method: item.to_string(),
        index: 0,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations_reject_duplicates() {
        let owner = TypeId::class("a/Gen");
        let mut unit = UnitBuilder::new();
        unit.declare_class(owner.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))
            .unwrap();
        assert!(unit
            .declare_class(owner.clone(), AccessFlags::PUBLIC, None)
            .is_err());
        assert!(unit.declare_class(TypeId::Int, AccessFlags::PUBLIC, None).is_err());

        let field = FieldRef::new(owner.clone(), "f", TypeId::Int);
        unit.declare_field(field.clone(), AccessFlags::STATIC).unwrap();
        assert!(unit.declare_field(field, AccessFlags::STATIC).is_err());

        let method = MethodRef::new(owner.clone(), "m", TypeId::Void, vec![]);
        unit.declare_method(method.clone(), AccessFlags::STATIC)
            .unwrap()
            .return_void()
            .unwrap();
        assert!(unit.declare_method(method, AccessFlags::STATIC).is_err());

        let stray = MethodRef::new(TypeId::class("a/Other"), "m", TypeId::Void, vec![]);
        assert!(unit.declare_method(stray, AccessFlags::STATIC).is_err());
    }

    #[test]
    fn test_bodiless_requires_abstract_or_native() {
        let owner = TypeId::class("a/Gen");
        let mut unit = UnitBuilder::new();
        unit.declare_class(owner.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))
            .unwrap();
        let m = MethodRef::new(owner, "n", TypeId::Void, vec![]);
        assert!(unit.declare_bodiless(m.clone(), AccessFlags::PUBLIC).is_err());
        unit.declare_bodiless(m, AccessFlags::PUBLIC | AccessFlags::NATIVE)
            .unwrap();
        assert!(unit.classes()[0].methods[0].code.is_none());
    }

    #[test]
    fn test_constructor_gets_constructor_flag() {
        let owner = TypeId::class("a/Gen");
        let mut unit = UnitBuilder::new();
        unit.declare_class(owner.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))
            .unwrap();
        let ctor = MethodRef::new(owner.clone(), "<init>", TypeId::Void, vec![]);
        unit.declare_method(ctor, AccessFlags::PUBLIC).unwrap();
        let decl = &unit.class(&owner).unwrap().methods[0];
        assert!(decl.access.contains(AccessFlags::CONSTRUCTOR));
        assert!(!decl.is_virtual());
    }
}
