//! Instruction stream of a single method body.
//!
//! [`Code`] records instructions over typed [`Local`]s in program order, interleaved with
//! [`Label`] marks. Nothing here knows about registers or basic blocks; the stream is turned
//! into a control-flow graph by [`crate::cfg::build`]. Every emitting method checks operand
//! kinds and arity up front and fails with [`Error::Structural`] on misuse, naming the method
//! and the stream position of the offending instruction.
//!
//! Emitters return `&mut Self` so bodies can be written as chains:
//!
//! ```rust,no_run
//! use dexhook::builder::UnitBuilder;
//! use dexhook::ir::{BinOp, Constant};
//! use dexhook::types::{AccessFlags, MethodRef, TypeId};
//!
//! # fn example() -> dexhook::Result<()> {
//! let owner = TypeId::class("com/example/Adder");
//! let mut unit = UnitBuilder::new();
//! unit.declare_class(owner.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))?;
//! let add = MethodRef::new(owner, "add", TypeId::Int, vec![TypeId::Int]);
//! let code = unit.declare_method(add, AccessFlags::PUBLIC | AccessFlags::STATIC)?;
//! let x = code.param(0)?;
//! let one = code.new_local(TypeId::Int)?;
//! code.load_constant(one, Constant::Int(1))?
//!     .binary(BinOp::Add, x, x, one)?
//!     .return_value(x)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::{
    ir::{BinOp, CmpOp, Cond, Constant, Insn, InvokeKind, Op, RegSpec, UnOp},
    types::{FieldRef, Kind, MethodRef, TypeId},
    Error, Result,
};

/// A typed local variable of one method body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Local {
    index: u32,
    kind: Kind,
}

impl Local {
    /// Position of the local within its method.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Register class of the local.
    #[must_use]
    pub const fn kind(self) -> Kind {
        self.kind
    }

    pub(crate) const fn spec(self) -> RegSpec {
        RegSpec::new(self.index, self.kind)
    }
}

/// A branch target or handler entry point within one method body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

/// An active exception handler: the caught type (`None` for catch-all) and its entry label.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CatchClause {
    /// Caught type.
    pub ty: Option<TypeId>,
    /// Handler entry.
    pub handler: Label,
}

/// An instruction as recorded in the stream.
#[derive(Clone, Debug)]
pub(crate) struct StreamInsn {
    pub insn: Insn,
    /// Branch target of `goto` / `if`.
    pub target: Option<Label>,
    /// Handlers active when the instruction was emitted.
    pub catches: Arc<[CatchClause]>,
}

#[derive(Clone, Debug)]
pub(crate) enum Item {
    Mark(Label),
    Insn(StreamInsn),
}

/// The body of one method under construction.
#[derive(Debug)]
pub struct Code {
    method: MethodRef,
    is_static: bool,
    locals: Vec<TypeId>,
    params: Vec<Local>,
    items: Vec<Item>,
    marked: Vec<bool>,
    active: Vec<CatchClause>,
    active_snapshot: Arc<[CatchClause]>,
    line: Option<u32>,
}

impl Code {
    /// Starts a body for `method`; parameter locals are defined on entry.
    #[must_use]
    pub fn new(method: MethodRef, is_static: bool) -> Self {
        let mut code = Code {
            method,
            is_static,
            locals: Vec::new(),
            params: Vec::new(),
            items: Vec::new(),
            marked: Vec::new(),
            active: Vec::new(),
            active_snapshot: Arc::from(Vec::new()),
            line: None,
        };
        let mut param_types = Vec::with_capacity(code.method.proto.params.len() + 1);
        if !is_static {
            param_types.push(code.method.owner.clone());
        }
        param_types.extend(code.method.proto.params.iter().cloned());

        let mut word = 0;
        for ty in param_types {
            let width = ty.width();
            let Some(local) = code.push_local(ty) else {
                continue;
            };
            code.params.push(local);
            code.push(
                Insn::new(Op::MoveParam { index: word }, Some(local.spec()), Vec::new()),
                None,
            );
            word += width;
        }
        code
    }

    /// The method this body implements.
    #[must_use]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Returns `true` if the method has no receiver.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Argument words, receiver included.
    #[must_use]
    pub fn param_words(&self) -> u32 {
        self.params.iter().map(|p| p.kind().width()).sum()
    }

    /// Number of locals declared so far, parameters included.
    #[must_use]
    pub fn local_count(&self) -> u32 {
        self.locals.len() as u32
    }

    /// Declared type of a local.
    #[must_use]
    pub fn local_type(&self, local: Local) -> Option<&TypeId> {
        self.locals.get(local.index as usize)
    }

    pub(crate) fn items(&self) -> &[Item] {
        &self.items
    }

    pub(crate) fn label_count(&self) -> usize {
        self.marked.len()
    }

    /// The receiver of an instance method.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for static methods.
    pub fn this(&self) -> Result<Local> {
        if self.is_static {
            return Err(self.misuse("static method has no receiver"));
        }
        Ok(self.params[0])
    }

    /// The `index`-th declared parameter (the receiver is not counted).
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the index is out of range.
    pub fn param(&self, index: usize) -> Result<Local> {
        let offset = usize::from(!self.is_static);
        self.params
            .get(index + offset)
            .copied()
            .ok_or_else(|| self.misuse(format!("no parameter {index}")))
    }

    /// Declares a fresh local of type `ty`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for `void`.
    pub fn new_local(&mut self, ty: TypeId) -> Result<Local> {
        self.push_local(ty)
            .ok_or_else(|| self.misuse("locals cannot be void"))
    }

    /// Creates an unmarked label.
    pub fn new_label(&mut self) -> Label {
        self.marked.push(false);
        Label(self.marked.len() as u32 - 1)
    }

    /// Places `label` at the current position.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the label is foreign or already marked.
    pub fn mark(&mut self, label: Label) -> Result<&mut Self> {
        let index = label.0 as usize;
        match self.marked.get(index) {
            Some(false) => {}
            Some(true) => return Err(self.misuse(format!("label {} already marked", label.0))),
            None => return Err(self.misuse(format!("unknown label {}", label.0))),
        }
        self.marked[index] = true;
        self.items.push(Item::Mark(label));
        Ok(self)
    }

    /// Routes exceptions of type `ty` (or all, for `None`) raised by subsequent
    /// instructions to `handler`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if a handler for the same type is already active.
    pub fn add_catch(&mut self, ty: Option<TypeId>, handler: Label) -> Result<&mut Self> {
        self.check_label(handler)?;
        if self.active.iter().any(|c| c.ty == ty) {
            return Err(self.misuse("catch clause already active for this type"));
        }
        self.active.push(CatchClause { ty, handler });
        self.active_snapshot = Arc::from(self.active.clone());
        Ok(self)
    }

    /// Deactivates the handler for `ty` and returns its label.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if no such handler is active.
    pub fn remove_catch(&mut self, ty: Option<&TypeId>) -> Result<Label> {
        let Some(pos) = self.active.iter().position(|c| c.ty.as_ref() == ty) else {
            return Err(self.misuse("no active catch clause for this type"));
        };
        let clause = self.active.remove(pos);
        self.active_snapshot = Arc::from(self.active.clone());
        Ok(clause.handler)
    }

    /// Sets the source line attached to subsequent instructions.
    pub fn set_line(&mut self, line: Option<u32>) -> &mut Self {
        self.line = line;
        self
    }

    /// `target = constant`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the constant does not fit the local.
    pub fn load_constant(&mut self, target: Local, value: Constant) -> Result<&mut Self> {
        self.check_kind(target, value.kind())?;
        self.emit(Op::Const(value), Some(target), &[])
    }

    /// `target = "value"`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless `target` is a reference.
    pub fn load_string(&mut self, target: Local, value: &str) -> Result<&mut Self> {
        self.check_kind(target, Kind::Object)?;
        self.emit(Op::ConstString(value.to_string()), Some(target), &[])
    }

    /// `target = ty.class`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless `target` is a reference.
    pub fn load_class(&mut self, target: Local, ty: TypeId) -> Result<&mut Self> {
        self.check_kind(target, Kind::Object)?;
        self.emit(Op::ConstClass(ty), Some(target), &[])
    }

    /// `target = source`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the kinds differ.
    pub fn move_value(&mut self, target: Local, source: Local) -> Result<&mut Self> {
        self.check_kind(source, target.kind)?;
        self.emit(Op::Move, Some(target), &[source])
    }

    /// `target = op source`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for references, mismatched kinds or `not` on floats.
    pub fn unary(&mut self, op: UnOp, target: Local, source: Local) -> Result<&mut Self> {
        self.check_kind(source, target.kind)?;
        match (op, target.kind) {
            (_, Kind::Object) | (UnOp::Not, Kind::Float | Kind::Double) => {
                return Err(self.misuse(format!("{op} does not apply to {}", target.kind)))
            }
            _ => {}
        }
        self.emit(Op::Unary(op), Some(target), &[source])
    }

    /// `target = a op b`; shift distances are ints.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for references, mismatched kinds or bitwise operators
    /// on floats.
    pub fn binary(&mut self, op: BinOp, target: Local, a: Local, b: Local) -> Result<&mut Self> {
        self.check_kind(a, target.kind)?;
        self.check_kind(b, if op.is_shift() { Kind::Int } else { target.kind })?;
        let invalid = match target.kind {
            Kind::Object => true,
            Kind::Float | Kind::Double => op.is_integral_only(),
            Kind::Int | Kind::Long => false,
        };
        if invalid {
            return Err(self.misuse(format!("{op} does not apply to {}", target.kind)));
        }
        self.emit(Op::Binary(op), Some(target), &[a, b])
    }

    /// Primitive conversion from `source` to the declared type of `target`, narrowing ints
    /// to `byte`, `short` or `char` where the target asks for it.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if either side is a reference.
    pub fn convert(&mut self, target: Local, source: Local) -> Result<&mut Self> {
        if target.kind == Kind::Object || source.kind == Kind::Object {
            return Err(self.misuse("convert applies to primitives; use cast for references"));
        }
        let target_ty = self.type_of(target)?.clone();
        let op = match target_ty {
            TypeId::Byte | TypeId::Short | TypeId::Char if source.kind == Kind::Int => {
                Op::Narrow(target_ty)
            }
            _ if source.kind == target.kind => Op::Move,
            _ => Op::Convert {
                from: source.kind,
                to: target.kind,
            },
        };
        self.emit(op, Some(target), &[source])
    }

    /// Reference cast of `source` to the declared type of `target`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless both locals are references.
    pub fn cast(&mut self, target: Local, source: Local) -> Result<&mut Self> {
        self.check_kind(target, Kind::Object)?;
        self.check_kind(source, Kind::Object)?;
        let ty = self.type_of(target)?.clone();
        self.emit(Op::CheckCast(ty), Some(target), &[source])
    }

    /// `target = source instanceof ty`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn instance_of(&mut self, target: Local, source: Local, ty: TypeId) -> Result<&mut Self> {
        self.check_kind(target, Kind::Int)?;
        self.check_kind(source, Kind::Object)?;
        self.emit(Op::InstanceOf(ty), Some(target), &[source])
    }

    /// Three-way comparison of two wide or floating values into an int.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn compare(&mut self, op: CmpOp, target: Local, a: Local, b: Local) -> Result<&mut Self> {
        self.check_kind(target, Kind::Int)?;
        self.check_kind(a, op.operand_kind())?;
        self.check_kind(b, op.operand_kind())?;
        self.emit(Op::Cmp(op), Some(target), &[a, b])
    }

    /// Branches to `label` if `a cond b`. References support only `==` and `!=`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched or unsupported kinds.
    pub fn branch(&mut self, cond: Cond, a: Local, b: Local, label: Label) -> Result<&mut Self> {
        self.check_kind(b, a.kind)?;
        self.check_condition(cond, a.kind)?;
        self.check_label(label)?;
        self.push_branch(Op::If(cond), &[a, b], label)
    }

    /// Branches to `label` if `a cond 0` (or `a cond null`).
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched or unsupported kinds.
    pub fn branch_zero(&mut self, cond: Cond, a: Local, label: Label) -> Result<&mut Self> {
        self.check_condition(cond, a.kind)?;
        self.check_label(label)?;
        self.push_branch(Op::IfZ(cond), &[a], label)
    }

    /// Unconditional branch.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for a foreign label.
    pub fn jump(&mut self, label: Label) -> Result<&mut Self> {
        self.check_label(label)?;
        self.push_branch(Op::Goto, &[], label)
    }

    /// Returns from a `void` method.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the method returns a value.
    pub fn return_void(&mut self) -> Result<&mut Self> {
        if self.method.proto.ret != TypeId::Void {
            return Err(self.misuse("non-void method must return a value"));
        }
        self.emit(Op::Return, None, &[])
    }

    /// Returns `value`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if the kind does not match the return type.
    pub fn return_value(&mut self, value: Local) -> Result<&mut Self> {
        match self.method.proto.ret.kind() {
            Some(kind) => self.check_kind(value, kind)?,
            None => return Err(self.misuse("void method cannot return a value")),
        }
        self.emit(Op::Return, None, &[value])
    }

    /// Throws `value`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless `value` is a reference.
    pub fn throw_value(&mut self, value: Local) -> Result<&mut Self> {
        self.check_kind(value, Kind::Object)?;
        self.emit(Op::Throw, None, &[value])
    }

    /// Receives the exception being handled; must open a handler block.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless `target` is a reference.
    pub fn move_exception(&mut self, target: Local) -> Result<&mut Self> {
        self.check_kind(target, Kind::Object)?;
        self.emit(Op::MoveException, Some(target), &[])
    }

    /// Allocates an instance of the constructor's class and runs the constructor on it.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if `ctor` is not a constructor or the arguments do not
    /// match it.
    pub fn new_instance(&mut self, target: Local, ctor: &MethodRef, args: &[Local]) -> Result<&mut Self> {
        if !ctor.is_constructor() {
            return Err(self.misuse(format!("{ctor} is not a constructor")));
        }
        self.check_kind(target, Kind::Object)?;
        self.check_args(ctor, args)?;
        self.emit(Op::NewInstance(ctor.owner.clone()), Some(target), &[])?;
        let mut sources = Vec::with_capacity(args.len() + 1);
        sources.push(target);
        sources.extend_from_slice(args);
        self.emit(Op::Invoke(InvokeKind::Direct, ctor.clone()), None, &sources)
    }

    /// Allocates an array of the declared (array) type of `target`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] unless `target` is an array and `length` an int.
    pub fn new_array(&mut self, target: Local, length: Local) -> Result<&mut Self> {
        let ty = self.type_of(target)?.clone();
        if !ty.is_array() {
            return Err(self.misuse(format!("{ty} is not an array type")));
        }
        self.check_kind(length, Kind::Int)?;
        self.emit(Op::NewArray(ty), Some(target), &[length])
    }

    /// `target = array.length`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn array_length(&mut self, target: Local, array: Local) -> Result<&mut Self> {
        self.check_kind(target, Kind::Int)?;
        self.check_kind(array, Kind::Object)?;
        self.emit(Op::ArrayLength, Some(target), &[array])
    }

    /// `target = array[index]`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] if `array` is not typed as an array or the element kind
    /// differs from `target`.
    pub fn aget(&mut self, target: Local, array: Local, index: Local) -> Result<&mut Self> {
        let element = self.element_type(array)?;
        self.check_kind(target, element.kind().unwrap_or(Kind::Object))?;
        self.check_kind(index, Kind::Int)?;
        self.emit(Op::AGet(element), Some(target), &[array, index])
    }

    /// `array[index] = value`
    ///
    /// # Errors
    /// Same as [`Code::aget`].
    pub fn aput(&mut self, array: Local, index: Local, value: Local) -> Result<&mut Self> {
        let element = self.element_type(array)?;
        self.check_kind(value, element.kind().unwrap_or(Kind::Object))?;
        self.check_kind(index, Kind::Int)?;
        self.emit(Op::APut(element), None, &[value, array, index])
    }

    /// `target = instance.field`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn iget(&mut self, field: &FieldRef, target: Local, instance: Local) -> Result<&mut Self> {
        self.check_field(field, target)?;
        self.check_kind(instance, Kind::Object)?;
        self.emit(Op::IGet(field.clone()), Some(target), &[instance])
    }

    /// `instance.field = value`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn iput(&mut self, field: &FieldRef, instance: Local, value: Local) -> Result<&mut Self> {
        self.check_field(field, value)?;
        self.check_kind(instance, Kind::Object)?;
        self.emit(Op::IPut(field.clone()), None, &[value, instance])
    }

    /// `target = Owner.field`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn sget(&mut self, field: &FieldRef, target: Local) -> Result<&mut Self> {
        self.check_field(field, target)?;
        self.emit(Op::SGet(field.clone()), Some(target), &[])
    }

    /// `Owner.field = value`
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for mismatched kinds.
    pub fn sput(&mut self, field: &FieldRef, value: Local) -> Result<&mut Self> {
        self.check_field(field, value)?;
        self.emit(Op::SPut(field.clone()), None, &[value])
    }

    /// Calls a static method, storing its result in `target` if given.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on arity or kind mismatch.
    pub fn invoke_static(&mut self, method: &MethodRef, target: Option<Local>, args: &[Local]) -> Result<&mut Self> {
        self.invoke(InvokeKind::Static, method, target, None, args)
    }

    /// Calls a virtual method on `instance`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on arity or kind mismatch.
    pub fn invoke_virtual(
        &mut self,
        method: &MethodRef,
        target: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<&mut Self> {
        self.invoke(InvokeKind::Virtual, method, target, Some(instance), args)
    }

    /// Calls a private method or constructor on `instance` without dispatch.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on arity or kind mismatch.
    pub fn invoke_direct(
        &mut self,
        method: &MethodRef,
        target: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<&mut Self> {
        self.invoke(InvokeKind::Direct, method, target, Some(instance), args)
    }

    /// Calls the superclass implementation of `method` on `instance`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on arity or kind mismatch.
    pub fn invoke_super(
        &mut self,
        method: &MethodRef,
        target: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<&mut Self> {
        self.invoke(InvokeKind::Super, method, target, Some(instance), args)
    }

    /// Calls an interface method on `instance`.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] on arity or kind mismatch.
    pub fn invoke_interface(
        &mut self,
        method: &MethodRef,
        target: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<&mut Self> {
        self.invoke(InvokeKind::Interface, method, target, Some(instance), args)
    }

    fn invoke(
        &mut self,
        kind: InvokeKind,
        method: &MethodRef,
        target: Option<Local>,
        instance: Option<Local>,
        args: &[Local],
    ) -> Result<&mut Self> {
        self.check_args(method, args)?;
        if let Some(instance) = instance {
            self.check_kind(instance, Kind::Object)?;
        }
        if let Some(target) = target {
            match method.proto.ret.kind() {
                Some(kind) => self.check_kind(target, kind)?,
                None => return Err(self.misuse(format!("{method} returns void"))),
            }
        }
        let mut sources = Vec::with_capacity(args.len() + 1);
        sources.extend(instance);
        sources.extend_from_slice(args);
        self.emit(Op::Invoke(kind, method.clone()), target, &sources)
    }

    fn push_local(&mut self, ty: TypeId) -> Option<Local> {
        let kind = ty.kind()?;
        self.locals.push(ty);
        Some(Local {
            index: self.locals.len() as u32 - 1,
            kind,
        })
    }

    fn push(&mut self, insn: Insn, target: Option<Label>) {
        self.items.push(Item::Insn(StreamInsn {
            insn: insn.at_line(self.line),
            target,
            catches: Arc::clone(&self.active_snapshot),
        }));
    }

    fn emit(&mut self, op: Op, result: Option<Local>, sources: &[Local]) -> Result<&mut Self> {
        for &local in result.iter().chain(sources) {
            self.check_local(local)?;
        }
        let insn = Insn::new(
            op,
            result.map(Local::spec),
            sources.iter().map(|l| l.spec()).collect(),
        );
        self.push(insn, None);
        Ok(self)
    }

    fn push_branch(&mut self, op: Op, sources: &[Local], label: Label) -> Result<&mut Self> {
        for &local in sources {
            self.check_local(local)?;
        }
        let insn = Insn::new(op, None, sources.iter().map(|l| l.spec()).collect());
        self.push(insn, Some(label));
        Ok(self)
    }

    fn check_local(&self, local: Local) -> Result<()> {
        match self.locals.get(local.index as usize).and_then(TypeId::kind) {
            Some(kind) if kind == local.kind => Ok(()),
            _ => Err(self.misuse(format!("local {} does not belong to this method", local.index))),
        }
    }

    fn check_kind(&self, local: Local, expected: Kind) -> Result<()> {
        self.check_local(local)?;
        if local.kind != expected {
            return Err(self.misuse(format!(
                "local {} is {}, expected {}",
                local.index, local.kind, expected
            )));
        }
        Ok(())
    }

    fn check_label(&self, label: Label) -> Result<()> {
        if (label.0 as usize) < self.marked.len() {
            Ok(())
        } else {
            Err(self.misuse(format!("unknown label {}", label.0)))
        }
    }

    fn check_condition(&self, cond: Cond, kind: Kind) -> Result<()> {
        match kind {
            Kind::Int => Ok(()),
            Kind::Object if matches!(cond, Cond::Eq | Cond::Ne) => Ok(()),
            _ => Err(self.misuse(format!("cannot branch on {cond} over {kind}"))),
        }
    }

    fn check_args(&self, method: &MethodRef, args: &[Local]) -> Result<()> {
        if args.len() != method.proto.params.len() {
            return Err(self.misuse(format!(
                "{method} takes {} arguments, got {}",
                method.proto.params.len(),
                args.len()
            )));
        }
        for (arg, ty) in args.iter().zip(&method.proto.params) {
            self.check_kind(*arg, ty.kind().unwrap_or(Kind::Object))?;
        }
        Ok(())
    }

    fn check_field(&self, field: &FieldRef, value: Local) -> Result<()> {
        match field.ty.kind() {
            Some(kind) => self.check_kind(value, kind),
            None => Err(self.misuse(format!("field {field} is void"))),
        }
    }

    fn type_of(&self, local: Local) -> Result<&TypeId> {
        self.check_local(local)?;
        Ok(&self.locals[local.index as usize])
    }

    fn element_type(&self, array: Local) -> Result<TypeId> {
        let ty = self.type_of(array)?;
        ty.component()
            .ok_or_else(|| self.misuse(format!("local {} of type {ty} is not an array", array.index)))
    }

    fn misuse(&self, message: impl Into<String>) -> Error {
        Error::Structural {
            method: self.method.to_string(),
            index: self.items.len(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(params: Vec<TypeId>, ret: TypeId) -> MethodRef {
        MethodRef::new(TypeId::class("a/B"), "m", ret, params)
    }

    #[test]
    fn test_params_are_defined_on_entry() {
        let code = Code::new(method(vec![TypeId::Long, TypeId::Int], TypeId::Void), false);
        assert_eq!(code.param_words(), 4);
        assert_eq!(code.this().unwrap().kind(), Kind::Object);
        assert_eq!(code.param(0).unwrap().kind(), Kind::Long);
        assert!(code.param(2).is_err());
        let words: Vec<u32> = code
            .items()
            .iter()
            .filter_map(|item| match item {
                Item::Insn(StreamInsn { insn, .. }) => match insn.op {
                    Op::MoveParam { index } => Some(index),
                    _ => None,
                },
                Item::Mark(_) => None,
            })
            .collect();
        assert_eq!(words, vec![0, 1, 3]);
    }

    #[test]
    fn test_kind_mismatch_is_structural() {
        let mut code = Code::new(method(vec![TypeId::Int], TypeId::Int), true);
        let x = code.param(0).unwrap();
        let obj = code.new_local(TypeId::object()).unwrap();
        let err = code.move_value(obj, x).unwrap_err();
        assert!(matches!(err, Error::Structural { index: 1, .. }));
        assert!(code.return_void().is_err());
        assert!(code.return_value(obj).is_err());
        assert!(code.return_value(x).is_ok());
    }

    #[test]
    fn test_invoke_arity_checked() {
        let mut code = Code::new(method(vec![], TypeId::Void), true);
        let callee = MethodRef::new(TypeId::class("a/C"), "f", TypeId::Int, vec![TypeId::Int]);
        let res = code.new_local(TypeId::Int).unwrap();
        assert!(code.invoke_static(&callee, Some(res), &[]).is_err());
        assert!(code.invoke_static(&callee, Some(res), &[res]).is_ok());
        let void_callee = MethodRef::new(TypeId::class("a/C"), "g", TypeId::Void, vec![]);
        assert!(code.invoke_static(&void_callee, Some(res), &[]).is_err());
    }

    #[test]
    fn test_foreign_local_rejected() {
        let mut a = Code::new(method(vec![], TypeId::Void), true);
        let mut b = Code::new(method(vec![], TypeId::Void), true);
        let wide = a.new_local(TypeId::Double).unwrap();
        let _ = b.new_local(TypeId::Int).unwrap();
        assert!(b.move_value(wide, wide).is_err());
    }

    #[test]
    fn test_labels_and_catches() {
        let mut code = Code::new(method(vec![], TypeId::Void), true);
        let handler = code.new_label();
        code.mark(handler).unwrap();
        assert!(code.mark(handler).is_err());
        assert!(code.mark(Label(9)).is_err());
        code.add_catch(None, handler).unwrap();
        assert!(code.add_catch(None, handler).is_err());
        assert_eq!(code.remove_catch(None).unwrap(), handler);
        assert!(code.remove_catch(None).is_err());
    }

    #[test]
    fn test_array_access_uses_element_kind() {
        let mut code = Code::new(method(vec![], TypeId::Void), true);
        let array = code.new_local(TypeId::array_of(&TypeId::object())).unwrap();
        let index = code.new_local(TypeId::Int).unwrap();
        let value = code.new_local(TypeId::object()).unwrap();
        assert!(code.aget(value, array, index).is_ok());
        assert!(code.aget(index, array, index).is_err());
        assert!(code.aget(value, value, index).is_err());
    }
}
