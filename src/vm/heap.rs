//! Objects, arrays and strings owned by one interpreter.

use rustc_hash::FxHashMap;

use crate::{
    trampoline::boxing,
    types::{FieldRef, TypeId},
    vm::{ObjectId, Value},
    Error, Result,
};

/// Payload of a heap object.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectData {
    /// Plain instance; unset fields read as their type's default.
    Fields(FxHashMap<String, Value>),
    /// Array elements.
    Array(Vec<Value>),
    /// `java.lang.String`
    Str(String),
    /// `java.lang.Class` literal.
    Class(TypeId),
}

/// A heap object: its runtime class and payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    /// Runtime class.
    pub class: TypeId,
    /// Payload.
    pub data: ObjectData,
}

/// Default value of a field or array element of type `ty`.
#[must_use]
pub fn default_value(ty: &TypeId) -> Value {
    match ty {
        TypeId::Long => Value::Long(0),
        TypeId::Float => Value::Float(0.0),
        TypeId::Double => Value::Double(0.0),
        TypeId::Reference(_) | TypeId::Void => Value::Null,
        _ => Value::Int(0),
    }
}

/// Growable object store. Objects are never freed during a run.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
    interned: FxHashMap<String, ObjectId>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn push(&mut self, class: TypeId, data: ObjectData) -> ObjectId {
        self.objects.push(Object { class, data });
        ObjectId(self.objects.len() as u32 - 1)
    }

    /// Allocates an instance of `class` with every field at its default.
    pub fn alloc(&mut self, class: TypeId) -> ObjectId {
        self.push(class, ObjectData::Fields(FxHashMap::default()))
    }

    /// Allocates an array of type `ty` (an array descriptor) with `len` default elements.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `ty` is not an array type.
    pub fn new_array(&mut self, ty: TypeId, len: usize) -> Result<ObjectId> {
        let Some(component) = ty.component() else {
            return Err(Error::Execution(format!("{ty} is not an array type")));
        };
        let elements = vec![default_value(&component); len];
        Ok(self.push(ty, ObjectData::Array(elements)))
    }

    /// Allocates an array holding `elements`.
    pub fn new_array_of(&mut self, ty: TypeId, elements: Vec<Value>) -> ObjectId {
        self.push(ty, ObjectData::Array(elements))
    }

    /// Returns the interned string object for `value`.
    pub fn string(&mut self, value: &str) -> ObjectId {
        if let Some(&id) = self.interned.get(value) {
            return id;
        }
        let id = self.push(TypeId::string(), ObjectData::Str(value.to_string()));
        self.interned.insert(value.to_string(), id);
        id
    }

    /// Allocates a class literal.
    pub fn class_literal(&mut self, ty: TypeId) -> ObjectId {
        self.push(TypeId::class("java/lang/Class"), ObjectData::Class(ty))
    }

    /// Allocates a throwable of `class` carrying `message`.
    pub fn throwable(&mut self, class: TypeId, message: &str) -> ObjectId {
        let text = self.string(message);
        let id = self.alloc(class);
        if let Some(Object {
            data: ObjectData::Fields(fields),
            ..
        }) = self.objects.get_mut(id.0 as usize)
        {
            fields.insert("message".to_string(), Value::Ref(text));
        }
        id
    }

    /// The object behind `id`.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for a dangling handle.
    pub fn get(&self, id: ObjectId) -> Result<&Object> {
        self.objects
            .get(id.0 as usize)
            .ok_or_else(|| Error::Execution(format!("dangling object {}", id.0)))
    }

    fn get_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.objects
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::Execution(format!("dangling object {}", id.0)))
    }

    /// Runtime class of `id`.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for a dangling handle.
    pub fn class_of(&self, id: ObjectId) -> Result<&TypeId> {
        Ok(&self.get(id)?.class)
    }

    /// Reads an instance field.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `id` is not a plain instance.
    pub fn field(&self, id: ObjectId, field: &FieldRef) -> Result<Value> {
        self.named_field(id, &field.name, &field.ty)
    }

    /// Reads an instance field by name, defaulting to the zero value of `ty`.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `id` is not a plain instance.
    pub fn named_field(&self, id: ObjectId, name: &str, ty: &TypeId) -> Result<Value> {
        match &self.get(id)?.data {
            ObjectData::Fields(fields) => {
                Ok(fields.get(name).copied().unwrap_or_else(|| default_value(ty)))
            }
            _ => Err(Error::Execution(format!("object {} has no field {name}", id.0))),
        }
    }

    /// Writes an instance field.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `id` is not a plain instance.
    pub fn set_field(&mut self, id: ObjectId, name: &str, value: Value) -> Result<()> {
        match &mut self.get_mut(id)?.data {
            ObjectData::Fields(fields) => {
                fields.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(Error::Execution(format!("object {} has no field {name}", id.0))),
        }
    }

    /// Elements of an array.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `id` is not an array.
    pub fn array(&self, id: ObjectId) -> Result<&[Value]> {
        match &self.get(id)?.data {
            ObjectData::Array(elements) => Ok(elements),
            _ => Err(Error::Execution(format!("object {} is not an array", id.0))),
        }
    }

    /// Mutable elements of an array.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if `id` is not an array.
    pub fn array_mut(&mut self, id: ObjectId) -> Result<&mut Vec<Value>> {
        match &mut self.get_mut(id)?.data {
            ObjectData::Array(elements) => Ok(elements),
            _ => Err(Error::Execution(format!("object {} is not an array", id.0))),
        }
    }

    /// Contents of a string object.
    #[must_use]
    pub fn str(&self, id: ObjectId) -> Option<&str> {
        match &self.get(id).ok()?.data {
            ObjectData::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Message of a throwable created by [`Heap::throwable`] or a host.
    #[must_use]
    pub fn message(&self, id: ObjectId) -> Option<&str> {
        match self.named_field(id, "message", &TypeId::string()).ok()? {
            Value::Ref(text) => self.str(text),
            _ => None,
        }
    }

    /// Wraps the primitive `value` of type `ty` in its wrapper class. References pass through.
    pub fn box_value(&mut self, ty: &TypeId, value: Value) -> Value {
        match boxing::box_type(ty) {
            Some(wrapper) if !matches!(value, Value::Ref(_) | Value::Null) => {
                let id = self.alloc(wrapper);
                if let Some(Object {
                    data: ObjectData::Fields(fields),
                    ..
                }) = self.objects.get_mut(id.0 as usize)
                {
                    fields.insert("value".to_string(), value);
                }
                Value::Ref(id)
            }
            _ => value,
        }
    }

    /// Boxes a primitive using its own register class to pick the wrapper
    /// (`Int` becomes `Integer`).
    pub fn box_any(&mut self, value: Value) -> Value {
        let ty = match value {
            Value::Int(_) => TypeId::Int,
            Value::Long(_) => TypeId::Long,
            Value::Float(_) => TypeId::Float,
            Value::Double(_) => TypeId::Double,
            Value::Null | Value::Ref(_) => return value,
        };
        self.box_value(&ty, value)
    }

    /// The primitive inside a wrapper object, or the value itself if it is not one.
    #[must_use]
    pub fn unbox(&self, value: Value) -> Value {
        let Value::Ref(id) = value else {
            return value;
        };
        match self.get(id) {
            Ok(object) if boxing::unboxed_type(&object.class).is_some() => self
                .named_field(id, "value", &TypeId::Int)
                .unwrap_or(value),
            _ => value,
        }
    }
}
