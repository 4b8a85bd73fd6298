//! Reference interpreter for decoded units.
//!
//! [`Vm`] executes the code items of a [`Unit`] directly from their encoded instruction
//! arrays, the same bytes the container writer produced. Everything outside the unit (static
//! fields of other classes, calls to library methods, class hierarchy beyond the unit and
//! the small built-in `java.lang` core) is answered by a [`Host`].
//!
//! The interpreter exists to check the compiler, not to run applications:
//!
//! - the optimizer is tested differentially by executing the same body compiled with and
//!   without each pass
//! - the generated `hook` body is executed against [`bridge::BridgeHost`], a model of the
//!   hook bridge classes, and compared with [`crate::dispatch::invoke`]
//!
//! # Value Model
//!
//! Registers are untyped 32-bit words or object handles; wide values occupy a register pair
//! with the low word first. Values crossing a call boundary are typed [`Value`]s, read from
//! registers according to the callee's prototype. Constant zero doubles as `null`.
//!
//! # Built-ins
//!
//! The interpreter implements `Object.<init>`, the wrapper-class `valueOf` / `xValue`
//! methods, `Throwable` construction and `getMessage`, and raises
//! `NullPointerException`, `ClassCastException`, `ArithmeticException`,
//! `ArrayIndexOutOfBoundsException` and `NegativeArraySizeException` itself.

pub mod bridge;
mod heap;
mod interp;

pub use heap::{default_value, Heap, Object, ObjectData};

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    dex::{CodeItem, Unit},
    dispatch::Outcome,
    ir::InvokeKind,
    types::{AccessFlags, FieldRef, MethodRef, TypeId},
    Error, Result,
};

/// Handle of a heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// A typed value crossing a call or field boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Value {
    /// The null reference, also the result of `void` calls.
    #[default]
    Null,
    /// `int` and the narrower integral types.
    Int(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// Non-null reference.
    Ref(ObjectId),
}

impl Value {
    /// Registers occupied by the value.
    #[must_use]
    pub fn width(self) -> u32 {
        match self {
            Value::Long(_) | Value::Double(_) => 2,
            _ => 1,
        }
    }

    /// The value as an `int`, if it is one.
    #[must_use]
    pub fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced object, if non-null.
    #[must_use]
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// `true` → `1`, `false` → `0`.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        Value::Int(i32::from(value))
    }
}

/// The completion of an interpreted call: a value, or the thrown object.
pub type Completion = Outcome<Value, ObjectId>;

/// Everything outside the executing unit.
pub trait Host {
    /// Reads a static field not declared by the unit.
    ///
    /// # Errors
    /// [`Error::Execution`] if the field is unknown to the host.
    fn get_static(&mut self, heap: &mut Heap, field: &FieldRef) -> Result<Value>;

    /// Writes a static field not declared by the unit.
    ///
    /// # Errors
    /// [`Error::Execution`] if the field is unknown to the host.
    fn put_static(&mut self, heap: &mut Heap, field: &FieldRef, value: Value) -> Result<()>;

    /// Performs a call the unit and the built-ins do not implement. `args` start with the
    /// receiver for instance calls.
    ///
    /// # Errors
    /// [`Error::Execution`] if the method is unknown to the host.
    fn invoke(
        &mut self,
        heap: &mut Heap,
        kind: InvokeKind,
        method: &MethodRef,
        args: &[Value],
    ) -> Result<Completion>;

    /// Direct supertypes (superclass and interfaces) of a class the unit does not declare.
    fn supertypes(&self, _ty: &TypeId) -> Vec<TypeId> {
        Vec::new()
    }
}

/// A host that provides nothing; units must be self-contained.
#[derive(Clone, Copy, Debug, Default)]
pub struct Isolated;

impl Host for Isolated {
    fn get_static(&mut self, _heap: &mut Heap, field: &FieldRef) -> Result<Value> {
        Err(Error::Execution(format!("unresolved field {field}")))
    }

    fn put_static(&mut self, _heap: &mut Heap, field: &FieldRef, _value: Value) -> Result<()> {
        Err(Error::Execution(format!("unresolved field {field}")))
    }

    fn invoke(
        &mut self,
        _heap: &mut Heap,
        _kind: InvokeKind,
        method: &MethodRef,
        _args: &[Value],
    ) -> Result<Completion> {
        Err(Error::Execution(format!("unresolved method {method}")))
    }
}

/// Interpreter over one unit.
pub struct Vm<'u, H> {
    unit: &'u Unit,
    host: H,
    heap: Heap,
    methods: FxHashMap<MethodRef, (AccessFlags, Option<&'u CodeItem>)>,
    supertypes: FxHashMap<TypeId, Vec<TypeId>>,
    statics: FxHashMap<FieldRef, Value>,
    redirected: FxHashSet<MethodRef>,
    bodies: FxHashMap<MethodRef, Arc<interp::Body>>,
    max_depth: u32,
    max_steps: u64,
    depth: u32,
    steps: u64,
}

impl<'u, H: Host> Vm<'u, H> {
    /// Loads `unit`, resolving its methods and static fields.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if a class definition refers outside the pool.
    pub fn new(unit: &'u Unit, host: H) -> Result<Self> {
        let pool = &unit.pool;
        let lookup = |table: &'static str, index: u32| {
            Error::Execution(format!("{table} index {index} out of range"))
        };
        let ty = |index: u32| {
            pool.types()
                .get(index as usize)
                .cloned()
                .ok_or_else(|| lookup("type", index))
        };

        let mut methods = FxHashMap::default();
        let mut supertypes = FxHashMap::default();
        let mut statics = FxHashMap::default();
        for class in &unit.classes {
            let mut parents = Vec::new();
            if let Some(superclass) = class.superclass {
                parents.push(ty(superclass)?);
            }
            for &interface in &class.interfaces {
                parents.push(ty(interface)?);
            }
            supertypes.insert(ty(class.class)?, parents);

            for field in &class.static_fields {
                let field = pool
                    .fields()
                    .get(field.field as usize)
                    .ok_or_else(|| lookup("field", field.field))?;
                statics.insert(field.clone(), default_value(&field.ty));
            }
            for method in class.methods() {
                let reference = pool
                    .methods()
                    .get(method.method as usize)
                    .ok_or_else(|| lookup("method", method.method))?;
                methods.insert(reference.clone(), (method.access, method.code.as_ref()));
            }
        }

        Ok(Vm {
            unit,
            host,
            heap: Heap::new(),
            methods,
            supertypes,
            statics,
            redirected: FxHashSet::default(),
            bodies: FxHashMap::default(),
            max_depth: 64,
            max_steps: 1_000_000,
            depth: 0,
            steps: 0,
        })
    }

    /// Caps the instructions one top-level [`Vm::call`] may execute.
    #[must_use]
    pub fn with_step_limit(mut self, steps: u64) -> Self {
        self.max_steps = steps;
        self
    }

    /// Routes calls to `method` to the host even though the unit defines it, the way a
    /// runtime redirects a patched method.
    pub fn redirect(&mut self, method: MethodRef) {
        self.redirected.insert(method);
    }

    /// Calls `method` with `args` (receiver first for instance methods).
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for malformed code, unresolved references or exceeded
    /// limits. Exceptions thrown by the code are a normal [`Outcome::Thrown`].
    pub fn call(&mut self, method: &MethodRef, args: &[Value]) -> Result<Completion> {
        if self.depth == 0 {
            self.steps = 0;
        }
        let kind = match self.methods.get(method) {
            Some((access, _)) if !access.contains(AccessFlags::STATIC) => InvokeKind::Direct,
            _ => InvokeKind::Static,
        };
        self.invoke(kind, method, args)
    }

    /// Value of a static field declared by the unit.
    #[must_use]
    pub fn static_field(&self, field: &FieldRef) -> Option<Value> {
        self.statics.get(field).copied()
    }

    /// Overwrites a static field declared by the unit.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] if the unit does not declare `field`.
    pub fn set_static_field(&mut self, field: &FieldRef, value: Value) -> Result<()> {
        match self.statics.get_mut(field) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::Execution(format!("{field} is not declared by the unit"))),
        }
    }

    /// The heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, for preparing arguments.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The host.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host, for inspection between calls.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Splits the interpreter into its host and heap.
    pub fn into_parts(self) -> (H, Heap) {
        (self.host, self.heap)
    }
}
