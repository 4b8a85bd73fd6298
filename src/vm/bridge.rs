//! A model of the hook bridge, for running generated trampolines.
//!
//! [`BridgeHost`] answers every host call a trampoline makes: it keeps the kill switch, hands
//! out callback snapshots from a [`CallbackChain`], implements the invocation record
//! (`MethodHookParam`) on the interpreter heap, and runs Rust callbacks when the generated
//! code calls `callBeforeHookedMethod` / `callAfterHookedMethod`. The `backup` method is
//! redirected to a closure standing in for the original implementation.
//!
//! Callbacks see arguments and results as unboxed [`Value`]s; the host re-boxes them by the
//! member's declared types when writing back. A callback failing with `Err(id)` makes the
//! bridge call throw `id`, which must be a throwable already on the heap.

use std::fmt;

use crate::{
    dispatch::{AfterContext, BeforeContext, CallbackChain, Outcome, Record, Registration},
    ir::InvokeKind,
    trampoline::{generator::Layout, HostBindings},
    types::{FieldRef, MemberDescriptor, MethodRef, TypeId},
    vm::{Completion, Heap, Host, ObjectId, Value, Vm},
    Error, Result,
};

const RESULT: &str = "result";
const THROWABLE: &str = "throwable";

/// The original implementation: receives the trampoline arguments (receiver first for
/// instance members) and completes the call.
pub type Original<'a> = Box<dyn FnMut(&mut Heap, &[Value]) -> Completion + 'a>;

/// Host model of the bridge classes for one hooked member.
pub struct BridgeHost<'a> {
    bindings: HostBindings,
    member: MemberDescriptor,
    layout: Layout,
    chain: CallbackChain<Value, ObjectId>,
    handles: Vec<Registration<Value, ObjectId>>,
    original: Original<'a>,
    disabled: bool,
    logged: Vec<ObjectId>,
    traced: usize,
    origin_errors: usize,
}

impl fmt::Debug for BridgeHost<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHost")
            .field("member", &self.member.canonical())
            .field("callbacks", &self.chain.len())
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl<'a> BridgeHost<'a> {
    /// Creates the bridge for the trampoline of `member` laid out as `layout`.
    pub fn new(
        bindings: HostBindings,
        member: MemberDescriptor,
        layout: Layout,
        chain: CallbackChain<Value, ObjectId>,
        original: Original<'a>,
    ) -> Self {
        BridgeHost {
            bindings,
            member,
            layout,
            chain,
            handles: Vec::new(),
            original,
            disabled: false,
            logged: Vec::new(),
            traced: 0,
            origin_errors: 0,
        }
    }

    /// Sets the process-wide kill switch read by `hook`.
    pub fn set_hooks_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    /// Throwables passed to the bridge's log method.
    #[must_use]
    pub fn logged(&self) -> &[ObjectId] {
        &self.logged
    }

    /// Number of traced `hook` entries.
    #[must_use]
    pub fn traced(&self) -> usize {
        self.traced
    }

    /// Number of times the unpatched `backup` body reported itself.
    #[must_use]
    pub fn origin_errors(&self) -> usize {
        self.origin_errors
    }

    /// The trampoline layout this bridge serves.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Runs `setup` with fresh reflection handles and a hook record, then redirects `backup`
    /// to the original implementation.
    ///
    /// # Errors
    /// Propagates interpreter failures; a `setup` that throws is an [`Error::Execution`].
    pub fn attach(vm: &mut Vm<'_, BridgeHost<'a>>) -> Result<()> {
        let layout = vm.host().layout.clone();
        let bindings = vm.host().bindings.clone();
        let heap = vm.heap_mut();
        let member = heap.alloc(bindings.member.clone());
        let backup = heap.alloc(bindings.backup_method.clone());
        let callbacks = heap.alloc(bindings.callbacks.ty.clone());
        let info = heap.alloc(bindings.hook_info.clone());
        heap.set_field(info, &bindings.callbacks.name, Value::Ref(callbacks))?;

        let args = [Value::Ref(member), Value::Ref(backup), Value::Ref(info)];
        if let Completion::Thrown(id) = vm.call(&layout.setup, &args)? {
            return Err(Error::Execution(format!("setup threw object {}", id.0)));
        }
        vm.redirect(layout.backup);
        Ok(())
    }

    fn record(&self, heap: &Heap, param: ObjectId) -> Result<Record<Value, ObjectId>> {
        let receiver = match heap.field(param, &self.bindings.param_this)? {
            Value::Null if self.member.is_static() => None,
            value => Some(value),
        };
        let args = match heap.field(param, &self.bindings.param_args)? {
            Value::Ref(array) => heap.array(array)?.iter().map(|v| heap.unbox(*v)).collect(),
            _ => Vec::new(),
        };
        let outcome = match heap.named_field(param, THROWABLE, &TypeId::throwable())? {
            Value::Ref(id) => Outcome::Thrown(id),
            _ => Outcome::Value(heap.unbox(heap.named_field(param, RESULT, &TypeId::object())?)),
        };
        let return_early = heap.field(param, &self.bindings.return_early)? != Value::Int(0);
        Ok(Record {
            receiver,
            args,
            outcome,
            return_early,
        })
    }

    fn write_args(&self, heap: &mut Heap, param: ObjectId, args: &[Value]) -> Result<()> {
        let Value::Ref(array) = heap.field(param, &self.bindings.param_args)? else {
            return Ok(());
        };
        let boxed: Vec<Value> = args
            .iter()
            .zip(self.member.params())
            .map(|(value, ty)| heap.box_value(ty, *value))
            .collect();
        let elements = heap.array_mut(array)?;
        for (slot, value) in elements.iter_mut().zip(boxed) {
            *slot = value;
        }
        Ok(())
    }

    fn write_outcome(
        &self,
        heap: &mut Heap,
        param: ObjectId,
        outcome: &Outcome<Value, ObjectId>,
    ) -> Result<()> {
        match outcome {
            Outcome::Value(value) => {
                let boxed = heap.box_value(self.member.return_type(), *value);
                heap.set_field(param, RESULT, boxed)?;
                heap.set_field(param, THROWABLE, Value::Null)
            }
            Outcome::Thrown(id) => {
                heap.set_field(param, RESULT, Value::Null)?;
                heap.set_field(param, THROWABLE, Value::Ref(*id))
            }
        }
    }

    fn run_callback(&mut self, heap: &mut Heap, args: &[Value], before: bool) -> Result<Completion> {
        let (Some(Value::Ref(handle)), Some(Value::Ref(param))) = (args.first(), args.get(1)) else {
            return Err(Error::Execution("callback dispatch without a record".to_string()));
        };
        let index = heap
            .named_field(*handle, "index", &TypeId::Int)?
            .as_int()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| Error::Execution("callback handle without an index".to_string()))?;
        let registration = self
            .handles
            .get(index)
            .ok_or_else(|| Error::Execution(format!("unknown callback handle {index}")))?;
        let callback = registration.callback().clone();

        let mut record = self.record(heap, *param)?;
        let result = if before {
            callback.before(&mut BeforeContext::new(&self.member, &mut record))
        } else {
            callback.after(&mut AfterContext::new(&self.member, &mut record))
        };
        if before {
            self.write_args(heap, *param, &record.args)?;
        }
        match result {
            Ok(()) => {
                self.write_outcome(heap, *param, &record.outcome)?;
                heap.set_field(*param, &self.bindings.return_early.name, Value::from_bool(record.return_early))?;
                Ok(Completion::Value(Value::Null))
            }
            Err(thrown) => Ok(Completion::Thrown(thrown)),
        }
    }

    fn snapshot(&mut self, heap: &mut Heap) -> Result<Value> {
        let snapshot = self.chain.snapshot();
        let mut elements = Vec::with_capacity(snapshot.len());
        for registration in snapshot.iter() {
            let handle = heap.alloc(self.bindings.callback.clone());
            let index = Value::Int(self.handles.len() as i32);
            heap.set_field(handle, "index", index)?;
            self.handles.push(registration.clone());
            elements.push(Value::Ref(handle));
        }
        Ok(Value::Ref(heap.new_array_of(HostBindings::object_array(), elements)))
    }

    fn record_call(&self, heap: &mut Heap, method: &MethodRef, args: &[Value]) -> Result<Option<Completion>> {
        let b = &self.bindings;
        let this = || match args.first() {
            Some(Value::Ref(id)) => Ok(*id),
            _ => Err(Error::Execution(format!("{method} without a receiver"))),
        };
        let done = Some(Completion::Value(Value::Null));
        let completion = if *method == b.param_init {
            done
        } else if *method == b.set_result {
            let param = this()?;
            heap.set_field(param, RESULT, args.get(1).copied().unwrap_or_default())?;
            heap.set_field(param, THROWABLE, Value::Null)?;
            heap.set_field(param, &b.return_early.name, Value::from_bool(true))?;
            done
        } else if *method == b.set_throwable {
            let param = this()?;
            heap.set_field(param, THROWABLE, args.get(1).copied().unwrap_or_default())?;
            heap.set_field(param, RESULT, Value::Null)?;
            heap.set_field(param, &b.return_early.name, Value::from_bool(true))?;
            done
        } else if *method == b.get_result {
            Some(Completion::Value(heap.named_field(this()?, RESULT, &TypeId::object())?))
        } else if *method == b.get_throwable {
            Some(Completion::Value(heap.named_field(this()?, THROWABLE, &TypeId::throwable())?))
        } else if *method == b.has_throwable {
            let value = heap.named_field(this()?, THROWABLE, &TypeId::throwable())?;
            Some(Completion::Value(Value::from_bool(value != Value::Null)))
        } else {
            None
        };
        Ok(completion)
    }

    fn call_original(&mut self, heap: &mut Heap, args: &[Value]) -> Completion {
        (self.original)(heap, args)
    }

    /// The reflective retry: unpacks `(member, backup, this, Object[])`, calls the original
    /// and boxes its result.
    fn call_origin(&mut self, heap: &mut Heap, args: &[Value]) -> Result<Completion> {
        let mut call = Vec::new();
        if !self.member.is_static() {
            call.push(args.get(2).copied().unwrap_or_default());
        }
        if let Some(Value::Ref(array)) = args.get(3) {
            call.extend(heap.array(*array)?.iter().map(|v| heap.unbox(*v)));
        }
        Ok(match self.call_original(heap, &call) {
            Completion::Value(value) => {
                Completion::Value(heap.box_value(self.member.return_type(), value))
            }
            thrown => thrown,
        })
    }
}

impl Host for BridgeHost<'_> {
    fn get_static(&mut self, _heap: &mut Heap, field: &FieldRef) -> Result<Value> {
        if *field == self.bindings.disable_hooks {
            Ok(Value::from_bool(self.disabled))
        } else {
            Err(Error::Execution(format!("unresolved field {field}")))
        }
    }

    fn put_static(&mut self, _heap: &mut Heap, field: &FieldRef, value: Value) -> Result<()> {
        if *field == self.bindings.disable_hooks {
            self.disabled = value != Value::Int(0);
            Ok(())
        } else {
            Err(Error::Execution(format!("unresolved field {field}")))
        }
    }

    fn invoke(
        &mut self,
        heap: &mut Heap,
        _kind: InvokeKind,
        method: &MethodRef,
        args: &[Value],
    ) -> Result<Completion> {
        if let Some(completion) = self.record_call(heap, method, args)? {
            return Ok(completion);
        }
        let b = &self.bindings;
        if *method == b.snapshot {
            Ok(Completion::Value(self.snapshot(heap)?))
        } else if *method == b.call_before {
            self.run_callback(heap, args, true)
        } else if *method == b.call_after {
            self.run_callback(heap, args, false)
        } else if *method == b.log_throwable {
            if let Some(Value::Ref(id)) = args.first() {
                self.logged.push(*id);
            }
            Ok(Completion::Value(Value::Null))
        } else if *method == b.trace {
            self.traced += 1;
            Ok(Completion::Value(Value::Null))
        } else if *method == b.origin_error {
            self.origin_errors += 1;
            Ok(Completion::Value(Value::Null))
        } else if b.ensure_backup.as_ref() == Some(method) {
            Ok(Completion::Value(Value::Null))
        } else if *method == b.call_origin {
            self.call_origin(heap, args)
        } else if *method == self.layout.backup {
            Ok(self.call_original(heap, args))
        } else {
            Err(Error::Execution(format!("unresolved method {method}")))
        }
    }

    fn supertypes(&self, ty: &TypeId) -> Vec<TypeId> {
        let b = &self.bindings;
        if *ty == b.backup_method {
            vec![b.member.clone()]
        } else {
            Vec::new()
        }
    }
}
