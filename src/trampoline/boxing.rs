//! Primitive boxing through the `java.lang` wrapper classes.
//!
//! The hook body moves every argument and the result through `Object` slots, so primitives
//! are boxed with `Wrapper.valueOf(p)` on the way in and unboxed with `wrapper.pValue()` after
//! a `check-cast` on the way out.

use crate::{
    builder::{Code, Local},
    types::{MethodRef, TypeId},
    Result,
};

/// Wrapper class of a primitive type.
#[must_use]
pub fn box_type(primitive: &TypeId) -> Option<TypeId> {
    let name = match primitive {
        TypeId::Boolean => "java/lang/Boolean",
        TypeId::Byte => "java/lang/Byte",
        TypeId::Short => "java/lang/Short",
        TypeId::Char => "java/lang/Character",
        TypeId::Int => "java/lang/Integer",
        TypeId::Long => "java/lang/Long",
        TypeId::Float => "java/lang/Float",
        TypeId::Double => "java/lang/Double",
        TypeId::Void | TypeId::Reference(_) => return None,
    };
    Some(TypeId::class(name))
}

/// The primitive type wrapped by `boxed`, if it is one of the wrapper classes.
#[must_use]
pub fn unboxed_type(boxed: &TypeId) -> Option<TypeId> {
    [
        TypeId::Boolean,
        TypeId::Byte,
        TypeId::Short,
        TypeId::Char,
        TypeId::Int,
        TypeId::Long,
        TypeId::Float,
        TypeId::Double,
    ]
    .into_iter()
    .find(|p| box_type(p).as_ref() == Some(boxed))
}

/// `Wrapper.valueOf(p)`
#[must_use]
pub fn value_of(primitive: &TypeId) -> Option<MethodRef> {
    let boxed = box_type(primitive)?;
    Some(MethodRef::new(
        boxed.clone(),
        "valueOf",
        boxed,
        vec![primitive.clone()],
    ))
}

/// `wrapper.pValue()`
#[must_use]
pub fn unbox_method(primitive: &TypeId) -> Option<MethodRef> {
    let boxed = box_type(primitive)?;
    let name = format!("{}Value", primitive.java_name());
    Some(MethodRef::new(boxed, name, primitive.clone(), vec![]))
}

/// Stores `source` into the `Object` local `target`, boxing primitives.
///
/// # Errors
/// Propagates builder misuse.
pub fn emit_box(code: &mut Code, target: Local, source: Local, ty: &TypeId) -> Result<()> {
    match value_of(ty) {
        Some(method) => code.invoke_static(&method, Some(target), &[source])?,
        None => code.move_value(target, source)?,
    };
    Ok(())
}

/// Stores the `Object` in `source` into `target` of type `ty`: a cast for references, a cast
/// to the wrapper through `boxed` followed by the unboxing call for primitives.
///
/// `boxed` must be a local of the wrapper type when `ty` is primitive and is ignored
/// otherwise.
///
/// # Errors
/// Propagates builder misuse.
pub fn emit_unbox(
    code: &mut Code,
    target: Local,
    source: Local,
    boxed: Option<Local>,
    ty: &TypeId,
) -> Result<()> {
    match (unbox_method(ty), boxed) {
        (Some(method), Some(boxed)) => {
            code.cast(boxed, source)?;
            code.invoke_virtual(&method, Some(target), boxed, &[])?;
        }
        _ => {
            code.cast(target, source)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_table() {
        assert_eq!(box_type(&TypeId::Char), Some(TypeId::class("java/lang/Character")));
        assert_eq!(box_type(&TypeId::object()), None);
        assert_eq!(
            unboxed_type(&TypeId::class("java/lang/Long")),
            Some(TypeId::Long)
        );
        assert_eq!(
            value_of(&TypeId::Int).unwrap().to_string(),
            "Ljava/lang/Integer;->valueOf(I)Ljava/lang/Integer;"
        );
        assert_eq!(
            unbox_method(&TypeId::Boolean).unwrap().to_string(),
            "Ljava/lang/Boolean;->booleanValue()Z"
        );
    }
}
