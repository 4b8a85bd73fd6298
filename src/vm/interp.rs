//! Instruction execution.

use std::{cmp::Ordering, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    dex::{
        insn::{decode_all, DalvInsn, Operand},
        opcode::Opcode,
        CodeItem,
    },
    ir::InvokeKind,
    trampoline::boxing,
    types::{FieldRef, MethodRef, TypeId},
    vm::{Completion, Host, ObjectId, Value, Vm},
    Error, Result,
};

/// A decoded instruction array with an address index.
#[derive(Debug)]
pub(crate) struct Body {
    insns: Vec<(u32, DalvInsn)>,
    index: FxHashMap<u32, usize>,
}

impl Body {
    fn decode(code: &CodeItem) -> Result<Body> {
        let insns = decode_all(&code.insns)?;
        let index = insns
            .iter()
            .enumerate()
            .map(|(i, (address, _))| (*address, i))
            .collect();
        Ok(Body { insns, index })
    }

    fn at(&self, address: u32) -> Result<usize> {
        self.index
            .get(&address)
            .copied()
            .ok_or_else(|| Error::Execution(format!("no instruction at {address:#06x}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Slot {
    Undef,
    Word(u32),
    Ref(ObjectId),
}

struct Frame {
    regs: Vec<Slot>,
    result: Option<Value>,
    exception: Option<ObjectId>,
}

impl Frame {
    fn slot(&self, r: u32) -> Result<Slot> {
        self.regs
            .get(r as usize)
            .copied()
            .ok_or_else(|| Error::Execution(format!("register v{r} out of range")))
    }

    fn set(&mut self, r: u32, slot: Slot) -> Result<()> {
        match self.regs.get_mut(r as usize) {
            Some(s) => {
                *s = slot;
                Ok(())
            }
            None => Err(Error::Execution(format!("register v{r} out of range"))),
        }
    }

    fn word(&self, r: u32) -> Result<u32> {
        match self.slot(r)? {
            Slot::Word(w) => Ok(w),
            other => Err(Error::Execution(format!("v{r} holds {other:?}, expected a word"))),
        }
    }

    fn int(&self, r: u32) -> Result<i32> {
        Ok(self.word(r)? as i32)
    }

    fn float(&self, r: u32) -> Result<f32> {
        Ok(f32::from_bits(self.word(r)?))
    }

    fn wide(&self, r: u32) -> Result<u64> {
        Ok(u64::from(self.word(r)?) | (u64::from(self.word(r + 1)?) << 32))
    }

    fn long(&self, r: u32) -> Result<i64> {
        Ok(self.wide(r)? as i64)
    }

    fn double(&self, r: u32) -> Result<f64> {
        Ok(f64::from_bits(self.wide(r)?))
    }

    fn reference(&self, r: u32) -> Result<Option<ObjectId>> {
        match self.slot(r)? {
            Slot::Ref(id) => Ok(Some(id)),
            Slot::Word(0) => Ok(None),
            other => Err(Error::Execution(format!(
                "v{r} holds {other:?}, expected a reference"
            ))),
        }
    }

    /// Equality key: ints by value, references by identity, `null` as zero.
    fn key(&self, r: u32) -> Result<i64> {
        match self.slot(r)? {
            Slot::Word(w) => Ok(i64::from(w as i32)),
            Slot::Ref(id) => Ok((1i64 << 40) + i64::from(id.0)),
            Slot::Undef => Err(Error::Execution(format!("v{r} is undefined"))),
        }
    }

    fn set_int(&mut self, r: u32, value: i32) -> Result<()> {
        self.set(r, Slot::Word(value as u32))
    }

    fn set_wide(&mut self, r: u32, bits: u64) -> Result<()> {
        self.set(r, Slot::Word(bits as u32))?;
        self.set(r + 1, Slot::Word((bits >> 32) as u32))
    }

    fn write(&mut self, r: u32, value: Value) -> Result<()> {
        match value {
            Value::Null => self.set(r, Slot::Word(0)),
            Value::Int(v) => self.set_int(r, v),
            Value::Float(v) => self.set(r, Slot::Word(v.to_bits())),
            Value::Long(v) => self.set_wide(r, v as u64),
            Value::Double(v) => self.set_wide(r, v.to_bits()),
            Value::Ref(id) => self.set(r, Slot::Ref(id)),
        }
    }

    fn read(&self, r: u32, ty: &TypeId) -> Result<Value> {
        Ok(match ty {
            TypeId::Long => Value::Long(self.long(r)?),
            TypeId::Double => Value::Double(self.double(r)?),
            TypeId::Float => Value::Float(self.float(r)?),
            TypeId::Reference(_) => self.reference(r)?.map_or(Value::Null, Value::Ref),
            TypeId::Void => Value::Null,
            _ => Value::Int(self.int(r)?),
        })
    }
}

enum Flow {
    Next,
    Jump(u32),
    Return(Value),
    Throw(ObjectId),
}

fn branch_target(address: u32, operand: Operand) -> Result<u32> {
    match operand {
        Operand::Branch(offset) => u32::try_from(i64::from(address) + i64::from(offset))
            .map_err(|_| Error::Execution(format!("branch before start at {address:#06x}"))),
        other => Err(Error::Execution(format!("expected a branch operand, got {other:?}"))),
    }
}

fn literal(insn: &DalvInsn) -> Result<i64> {
    match insn.operand {
        Operand::Literal(value) => Ok(value),
        other => Err(Error::Execution(format!("expected a literal, got {other:?}"))),
    }
}

fn index(insn: &DalvInsn) -> Result<usize> {
    match insn.operand {
        Operand::Index(value) => Ok(value as usize),
        other => Err(Error::Execution(format!("expected an index, got {other:?}"))),
    }
}

fn ordering_value(ordering: Option<Ordering>, nan: i32) -> i32 {
    match ordering {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}

fn builtin_superclass(ty: &TypeId) -> Option<TypeId> {
    let name = match ty.descriptor() {
        "Ljava/lang/Exception;" | "Ljava/lang/Error;" => "java/lang/Throwable",
        "Ljava/lang/RuntimeException;" => "java/lang/Exception",
        "Ljava/lang/NullPointerException;"
        | "Ljava/lang/ClassCastException;"
        | "Ljava/lang/ArithmeticException;"
        | "Ljava/lang/IllegalStateException;"
        | "Ljava/lang/IllegalArgumentException;"
        | "Ljava/lang/NegativeArraySizeException;"
        | "Ljava/lang/IndexOutOfBoundsException;" => "java/lang/RuntimeException",
        "Ljava/lang/ArrayIndexOutOfBoundsException;" => "java/lang/IndexOutOfBoundsException",
        "Ljava/lang/Integer;"
        | "Ljava/lang/Long;"
        | "Ljava/lang/Short;"
        | "Ljava/lang/Byte;"
        | "Ljava/lang/Float;"
        | "Ljava/lang/Double;" => "java/lang/Number",
        _ => return None,
    };
    Some(TypeId::class(name))
}

fn is_throwable_class(ty: &TypeId) -> bool {
    let mut current = Some(ty.clone());
    while let Some(ty) = current {
        if ty == TypeId::throwable() {
            return true;
        }
        current = builtin_superclass(&ty);
    }
    false
}

impl<'u, H: Host> Vm<'u, H> {
    fn type_at(&self, index: usize) -> Result<&'u TypeId> {
        let unit: &'u crate::dex::Unit = self.unit;
        unit.pool
            .types()
            .get(index)
            .ok_or_else(|| Error::Execution(format!("type index {index} out of range")))
    }

    fn field_at(&self, index: usize) -> Result<&'u FieldRef> {
        let unit: &'u crate::dex::Unit = self.unit;
        unit.pool
            .fields()
            .get(index)
            .ok_or_else(|| Error::Execution(format!("field index {index} out of range")))
    }

    fn method_at(&self, index: usize) -> Result<&'u MethodRef> {
        let unit: &'u crate::dex::Unit = self.unit;
        unit.pool
            .methods()
            .get(index)
            .ok_or_else(|| Error::Execution(format!("method index {index} out of range")))
    }

    fn string_at(&self, index: usize) -> Result<&'u str> {
        let unit: &'u crate::dex::Unit = self.unit;
        unit.pool
            .strings()
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Error::Execution(format!("string index {index} out of range")))
    }

    /// Returns `true` if a value of class `from` may be stored in a slot of type `to`.
    pub(crate) fn is_assignable(&self, from: &TypeId, to: &TypeId) -> bool {
        if from == to || *to == TypeId::object() {
            return true;
        }
        if let (Some(f), Some(t)) = (from.component(), to.component()) {
            return f.is_reference() && t.is_reference() && self.is_assignable(&f, &t);
        }
        let mut seen = FxHashSet::default();
        let mut pending = vec![from.clone()];
        while let Some(ty) = pending.pop() {
            if !seen.insert(ty.clone()) {
                continue;
            }
            let mut parents = self.supertypes.get(&ty).cloned().unwrap_or_default();
            parents.extend(builtin_superclass(&ty));
            parents.extend(self.host.supertypes(&ty));
            for parent in parents {
                if parent == *to {
                    return true;
                }
                pending.push(parent);
            }
        }
        false
    }

    fn raise(&mut self, class: &str, message: &str) -> Flow {
        Flow::Throw(self.heap.throwable(TypeId::class(class), message))
    }

    fn null_pointer(&mut self, what: &str) -> Flow {
        self.raise(
            "java/lang/NullPointerException",
            &format!("Attempt to {what} on a null object reference"),
        )
    }

    fn body(&mut self, method: &MethodRef, code: &CodeItem) -> Result<Arc<Body>> {
        if let Some(body) = self.bodies.get(method) {
            return Ok(Arc::clone(body));
        }
        let body = Arc::new(Body::decode(code)?);
        self.bodies.insert(method.clone(), Arc::clone(&body));
        Ok(body)
    }

    /// Dispatches a call to the unit, the built-ins or the host.
    pub(crate) fn invoke(
        &mut self,
        kind: InvokeKind,
        method: &MethodRef,
        args: &[Value],
    ) -> Result<Completion> {
        if kind != InvokeKind::Static && args.first().map_or(true, |a| *a == Value::Null) {
            if let Flow::Throw(id) = self.null_pointer(&format!("invoke {}", method.name)) {
                return Ok(Completion::Thrown(id));
            }
        }
        if !self.redirected.contains(method) {
            if let Some(&(_, Some(code))) = self.methods.get(method) {
                return self.execute(method, code, args);
            }
            if let Some(completion) = self.builtin(method, args)? {
                return Ok(completion);
            }
        }
        self.host.invoke(&mut self.heap, kind, method, args)
    }

    fn builtin(&mut self, method: &MethodRef, args: &[Value]) -> Result<Option<Completion>> {
        let owner = &method.owner;
        if method.is_constructor() && *owner == TypeId::object() {
            return Ok(Some(Completion::Value(Value::Null)));
        }
        if let Some(primitive) = boxing::unboxed_type(owner) {
            if boxing::value_of(&primitive).as_ref() == Some(method) {
                let value = args.first().copied().unwrap_or_default();
                let boxed = self.heap.box_value(&primitive, value);
                return Ok(Some(Completion::Value(boxed)));
            }
            if boxing::unbox_method(&primitive).as_ref() == Some(method) {
                let value = args.first().copied().unwrap_or_default();
                return Ok(Some(Completion::Value(self.heap.unbox(value))));
            }
        }
        if is_throwable_class(owner) {
            if method.is_constructor() {
                if let (Some(Value::Ref(this)), Some(message)) = (args.first(), args.get(1)) {
                    self.heap.set_field(*this, "message", *message)?;
                }
                return Ok(Some(Completion::Value(Value::Null)));
            }
            if method.name == "getMessage" && method.proto.params.is_empty() {
                if let Some(Value::Ref(this)) = args.first() {
                    let message = self
                        .heap
                        .named_field(*this, "message", &TypeId::string())?;
                    return Ok(Some(Completion::Value(message)));
                }
            }
        }
        Ok(None)
    }

    /// Runs one code item with `args` placed in the incoming argument registers.
    fn execute(&mut self, method: &MethodRef, code: &'u CodeItem, args: &[Value]) -> Result<Completion> {
        if self.depth >= self.max_depth {
            return Err(Error::Execution(format!("call depth exceeded in {method}")));
        }
        let body = self.body(method, code)?;
        let mut frame = Frame {
            regs: vec![Slot::Undef; usize::from(code.registers)],
            result: None,
            exception: None,
        };
        let mut reg = u32::from(code.registers) - u32::from(code.ins.min(code.registers));
        for value in args {
            frame.write(reg, *value)?;
            reg += value.width();
        }
        if reg != u32::from(code.registers) {
            return Err(Error::Execution(format!(
                "{method} expects {} argument words",
                code.ins
            )));
        }

        self.depth += 1;
        let result = self.run(method, code, &body, &mut frame);
        self.depth -= 1;
        result
    }

    fn run(
        &mut self,
        method: &MethodRef,
        code: &CodeItem,
        body: &Body,
        frame: &mut Frame,
    ) -> Result<Completion> {
        let mut pc = 0usize;
        loop {
            self.steps += 1;
            if self.steps > self.max_steps {
                return Err(Error::Execution(format!("step limit exceeded in {method}")));
            }
            let Some((address, insn)) = body.insns.get(pc) else {
                return Err(Error::Execution(format!("{method} runs off the end of its code")));
            };
            match self.step(method, frame, insn, *address)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = body.at(target)?,
                Flow::Return(value) => return Ok(Completion::Value(value)),
                Flow::Throw(exception) => match self.handler(code, *address, exception)? {
                    Some(target) => {
                        frame.exception = Some(exception);
                        pc = body.at(target)?;
                    }
                    None => return Ok(Completion::Thrown(exception)),
                },
            }
        }
    }

    fn handler(&self, code: &CodeItem, address: u32, exception: ObjectId) -> Result<Option<u32>> {
        let class = self.heap.class_of(exception)?;
        for item in &code.tries {
            if address < item.start || address >= item.start + u32::from(item.count) {
                continue;
            }
            let handler = code
                .handlers
                .get(item.handler)
                .ok_or_else(|| Error::Execution(format!("handler {} missing", item.handler)))?;
            for &(ty, target) in &handler.catches {
                if self.is_assignable(class, self.type_at(ty as usize)?) {
                    return Ok(Some(target));
                }
            }
            return Ok(handler.catch_all);
        }
        Ok(None)
    }

    fn get_static(&mut self, field: &FieldRef) -> Result<Value> {
        match self.statics.get(field) {
            Some(value) => Ok(*value),
            None => self.host.get_static(&mut self.heap, field),
        }
    }

    fn put_static(&mut self, field: &FieldRef, value: Value) -> Result<()> {
        match self.statics.get_mut(field) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => self.host.put_static(&mut self.heap, field, value),
        }
    }

    fn call_args(&self, frame: &Frame, insn: &DalvInsn, method: &MethodRef, is_static: bool) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(method.proto.params.len() + 1);
        let mut regs = insn.regs.iter().copied();
        let mut next = |width: u32| -> Result<u32> {
            let first = regs
                .next()
                .ok_or_else(|| Error::Execution(format!("too few argument words for {method}")))?;
            for _ in 1..width {
                regs.next();
            }
            Ok(first)
        };
        if !is_static {
            let r = next(1)?;
            args.push(frame.read(r, &TypeId::object())?);
        }
        for ty in &method.proto.params {
            let r = next(ty.width())?;
            args.push(frame.read(r, ty)?);
        }
        Ok(args)
    }

    fn step(&mut self, method: &MethodRef, frame: &mut Frame, insn: &DalvInsn, address: u32) -> Result<Flow> {
        use Opcode as O;
        let r = &insn.regs;
        let flow = match insn.opcode {
            O::Nop => Flow::Next,
            O::Move | O::MoveFrom16 | O::Move16 | O::MoveObject | O::MoveObjectFrom16 | O::MoveObject16 => {
                let slot = frame.slot(r[1])?;
                frame.set(r[0], slot)?;
                Flow::Next
            }
            O::MoveWide | O::MoveWideFrom16 | O::MoveWide16 => {
                let bits = frame.wide(r[1])?;
                frame.set_wide(r[0], bits)?;
                Flow::Next
            }
            O::MoveResult | O::MoveResultWide | O::MoveResultObject => {
                let value = frame
                    .result
                    .take()
                    .ok_or_else(|| Error::Execution("move-result without a result".to_string()))?;
                frame.write(r[0], value)?;
                Flow::Next
            }
            O::MoveException => {
                let exception = frame
                    .exception
                    .take()
                    .ok_or_else(|| Error::Execution("move-exception outside a handler".to_string()))?;
                frame.set(r[0], Slot::Ref(exception))?;
                Flow::Next
            }
            O::ReturnVoid => Flow::Return(Value::Null),
            O::Return | O::ReturnWide | O::ReturnObject => Flow::Return(frame.read(r[0], &method.proto.ret)?),
            O::Const4 | O::Const16 | O::Const | O::ConstHigh16 => {
                frame.set_int(r[0], literal(insn)? as i32)?;
                Flow::Next
            }
            O::ConstWide16 | O::ConstWide32 | O::ConstWide | O::ConstWideHigh16 => {
                frame.set_wide(r[0], literal(insn)? as u64)?;
                Flow::Next
            }
            O::ConstString | O::ConstStringJumbo => {
                let text = self.string_at(index(insn)?)?;
                let id = self.heap.string(text);
                frame.set(r[0], Slot::Ref(id))?;
                Flow::Next
            }
            O::ConstClass => {
                let ty = self.type_at(index(insn)?)?.clone();
                let id = self.heap.class_literal(ty);
                frame.set(r[0], Slot::Ref(id))?;
                Flow::Next
            }
            O::CheckCast => {
                let ty = self.type_at(index(insn)?)?;
                match frame.reference(r[0])? {
                    Some(id) => {
                        let class = self.heap.class_of(id)?.clone();
                        if self.is_assignable(&class, ty) {
                            Flow::Next
                        } else {
                            self.raise(
                                "java/lang/ClassCastException",
                                &format!("{} cannot be cast to {}", class.java_name(), ty.java_name()),
                            )
                        }
                    }
                    None => Flow::Next,
                }
            }
            O::InstanceOf => {
                let ty = self.type_at(index(insn)?)?;
                let result = match frame.reference(r[1])? {
                    Some(id) => self.is_assignable(self.heap.class_of(id)?, ty),
                    None => false,
                };
                frame.set_int(r[0], i32::from(result))?;
                Flow::Next
            }
            O::ArrayLength => match frame.reference(r[1])? {
                Some(id) => {
                    let len = self.heap.array(id)?.len();
                    frame.set_int(r[0], len as i32)?;
                    Flow::Next
                }
                None => self.null_pointer("get length of an array"),
            },
            O::NewInstance => {
                let ty = self.type_at(index(insn)?)?.clone();
                let id = self.heap.alloc(ty);
                frame.set(r[0], Slot::Ref(id))?;
                Flow::Next
            }
            O::NewArray => {
                let ty = self.type_at(index(insn)?)?.clone();
                let len = frame.int(r[1])?;
                if len < 0 {
                    self.raise("java/lang/NegativeArraySizeException", &len.to_string())
                } else {
                    let id = self.heap.new_array(ty, len as usize)?;
                    frame.set(r[0], Slot::Ref(id))?;
                    Flow::Next
                }
            }
            O::Throw => match frame.reference(r[0])? {
                Some(id) => Flow::Throw(id),
                None => self.null_pointer("throw"),
            },
            O::Goto | O::Goto16 | O::Goto32 => Flow::Jump(branch_target(address, insn.operand)?),
            O::CmplFloat | O::CmpgFloat => {
                let (a, b) = (frame.float(r[1])?, frame.float(r[2])?);
                let nan = if insn.opcode == O::CmplFloat { -1 } else { 1 };
                frame.set_int(r[0], ordering_value(a.partial_cmp(&b), nan))?;
                Flow::Next
            }
            O::CmplDouble | O::CmpgDouble => {
                let (a, b) = (frame.double(r[1])?, frame.double(r[2])?);
                let nan = if insn.opcode == O::CmplDouble { -1 } else { 1 };
                frame.set_int(r[0], ordering_value(a.partial_cmp(&b), nan))?;
                Flow::Next
            }
            O::CmpLong => {
                let (a, b) = (frame.long(r[1])?, frame.long(r[2])?);
                frame.set_int(r[0], ordering_value(Some(a.cmp(&b)), 0))?;
                Flow::Next
            }
            O::IfEq | O::IfNe | O::IfLt | O::IfGe | O::IfGt | O::IfLe => {
                let (a, b) = (frame.key(r[0])?, frame.key(r[1])?);
                self.conditional(insn, address, a, b)?
            }
            O::IfEqz | O::IfNez | O::IfLtz | O::IfGez | O::IfGtz | O::IfLez => {
                let a = frame.key(r[0])?;
                self.conditional(insn, address, a, 0)?
            }
            O::Aget | O::AgetWide | O::AgetObject | O::AgetBoolean | O::AgetByte | O::AgetChar | O::AgetShort => {
                let Some(array) = frame.reference(r[1])? else {
                    return Ok(self.null_pointer("read from null array"));
                };
                let i = frame.int(r[2])?;
                let elements = self.heap.array(array)?;
                match usize::try_from(i).ok().and_then(|i| elements.get(i)).copied() {
                    Some(value) => {
                        frame.write(r[0], value)?;
                        Flow::Next
                    }
                    None => {
                        let message = format!("length={}; index={i}", elements.len());
                        self.raise("java/lang/ArrayIndexOutOfBoundsException", &message)
                    }
                }
            }
            O::Aput | O::AputWide | O::AputObject | O::AputBoolean | O::AputByte | O::AputChar | O::AputShort => {
                let Some(array) = frame.reference(r[1])? else {
                    return Ok(self.null_pointer("write to null array"));
                };
                let i = frame.int(r[2])?;
                let component = self
                    .heap
                    .class_of(array)?
                    .component()
                    .ok_or_else(|| Error::Execution("aput on a non-array".to_string()))?;
                let value = match (frame.read(r[0], &component)?, &component) {
                    (Value::Int(v), TypeId::Byte) => Value::Int(i32::from(v as i8)),
                    (Value::Int(v), TypeId::Short) => Value::Int(i32::from(v as i16)),
                    (Value::Int(v), TypeId::Char) => Value::Int(i32::from(v as u16)),
                    (value, _) => value,
                };
                let elements = self.heap.array_mut(array)?;
                let len = elements.len();
                match usize::try_from(i).ok().and_then(|i| elements.get_mut(i)) {
                    Some(slot) => {
                        *slot = value;
                        Flow::Next
                    }
                    None => {
                        let message = format!("length={len}; index={i}");
                        self.raise("java/lang/ArrayIndexOutOfBoundsException", &message)
                    }
                }
            }
            O::Iget | O::IgetWide | O::IgetObject | O::IgetBoolean | O::IgetByte | O::IgetChar | O::IgetShort => {
                let field = self.field_at(index(insn)?)?;
                match frame.reference(r[1])? {
                    Some(object) => {
                        let value = self.heap.field(object, field)?;
                        frame.write(r[0], value)?;
                        Flow::Next
                    }
                    None => self.null_pointer(&format!("read field {}", field.name)),
                }
            }
            O::Iput | O::IputWide | O::IputObject | O::IputBoolean | O::IputByte | O::IputChar | O::IputShort => {
                let field = self.field_at(index(insn)?)?;
                match frame.reference(r[1])? {
                    Some(object) => {
                        let value = frame.read(r[0], &field.ty)?;
                        self.heap.set_field(object, &field.name, value)?;
                        Flow::Next
                    }
                    None => self.null_pointer(&format!("write field {}", field.name)),
                }
            }
            O::Sget | O::SgetWide | O::SgetObject | O::SgetBoolean | O::SgetByte | O::SgetChar | O::SgetShort => {
                let field = self.field_at(index(insn)?)?;
                let value = self.get_static(field)?;
                frame.write(r[0], value)?;
                Flow::Next
            }
            O::Sput | O::SputWide | O::SputObject | O::SputBoolean | O::SputByte | O::SputChar | O::SputShort => {
                let field = self.field_at(index(insn)?)?;
                let value = frame.read(r[0], &field.ty)?;
                self.put_static(field, value)?;
                Flow::Next
            }
            O::InvokeVirtual
            | O::InvokeSuper
            | O::InvokeDirect
            | O::InvokeStatic
            | O::InvokeInterface
            | O::InvokeVirtualRange
            | O::InvokeSuperRange
            | O::InvokeDirectRange
            | O::InvokeStaticRange
            | O::InvokeInterfaceRange => {
                let kind = match insn.opcode {
                    O::InvokeVirtual | O::InvokeVirtualRange => InvokeKind::Virtual,
                    O::InvokeSuper | O::InvokeSuperRange => InvokeKind::Super,
                    O::InvokeDirect | O::InvokeDirectRange => InvokeKind::Direct,
                    O::InvokeStatic | O::InvokeStaticRange => InvokeKind::Static,
                    _ => InvokeKind::Interface,
                };
                let callee = self.method_at(index(insn)?)?;
                let args = self.call_args(frame, insn, callee, kind == InvokeKind::Static)?;
                match self.invoke(kind, callee, &args)? {
                    Completion::Value(value) => {
                        frame.result = (callee.proto.ret != TypeId::Void).then_some(value);
                        Flow::Next
                    }
                    Completion::Thrown(exception) => Flow::Throw(exception),
                }
            }
            O::NegInt => {
                frame.set_int(r[0], frame.int(r[1])?.wrapping_neg())?;
                Flow::Next
            }
            O::NotInt => {
                frame.set_int(r[0], !frame.int(r[1])?)?;
                Flow::Next
            }
            O::NegLong => {
                frame.set_wide(r[0], frame.long(r[1])?.wrapping_neg() as u64)?;
                Flow::Next
            }
            O::NotLong => {
                frame.set_wide(r[0], !frame.wide(r[1])?)?;
                Flow::Next
            }
            O::NegFloat => {
                frame.write(r[0], Value::Float(-frame.float(r[1])?))?;
                Flow::Next
            }
            O::NegDouble => {
                frame.write(r[0], Value::Double(-frame.double(r[1])?))?;
                Flow::Next
            }
            O::IntToLong
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
            | O::IntToShort => {
                let value = convert(insn.opcode, frame, r[1])?;
                frame.write(r[0], value)?;
                Flow::Next
            }
            O::AddInt | O::SubInt | O::MulInt | O::DivInt | O::RemInt | O::AndInt | O::OrInt | O::XorInt
            | O::ShlInt | O::ShrInt | O::UshrInt => {
                let (a, b) = (frame.int(r[1])?, frame.int(r[2])?);
                match int_op(insn.opcode, a, b) {
                    Some(value) => {
                        frame.set_int(r[0], value)?;
                        Flow::Next
                    }
                    None => self.raise("java/lang/ArithmeticException", "divide by zero"),
                }
            }
            O::AddLong | O::SubLong | O::MulLong | O::DivLong | O::RemLong | O::AndLong | O::OrLong
            | O::XorLong | O::ShlLong | O::ShrLong | O::UshrLong => {
                let a = frame.long(r[1])?;
                let b = match insn.opcode {
                    O::ShlLong | O::ShrLong | O::UshrLong => i64::from(frame.int(r[2])?),
                    _ => frame.long(r[2])?,
                };
                match long_op(insn.opcode, a, b) {
                    Some(value) => {
                        frame.set_wide(r[0], value as u64)?;
                        Flow::Next
                    }
                    None => self.raise("java/lang/ArithmeticException", "divide by zero"),
                }
            }
            O::AddFloat | O::SubFloat | O::MulFloat | O::DivFloat | O::RemFloat => {
                let (a, b) = (frame.float(r[1])?, frame.float(r[2])?);
                let value = match insn.opcode {
                    O::AddFloat => a + b,
                    O::SubFloat => a - b,
                    O::MulFloat => a * b,
                    O::DivFloat => a / b,
                    _ => a % b,
                };
                frame.write(r[0], Value::Float(value))?;
                Flow::Next
            }
            O::AddDouble | O::SubDouble | O::MulDouble | O::DivDouble | O::RemDouble => {
                let (a, b) = (frame.double(r[1])?, frame.double(r[2])?);
                let value = match insn.opcode {
                    O::AddDouble => a + b,
                    O::SubDouble => a - b,
                    O::MulDouble => a * b,
                    O::DivDouble => a / b,
                    _ => a % b,
                };
                frame.write(r[0], Value::Double(value))?;
                Flow::Next
            }
        };
        Ok(flow)
    }

    fn conditional(&self, insn: &DalvInsn, address: u32, a: i64, b: i64) -> Result<Flow> {
        use Opcode as O;
        let taken = match insn.opcode {
            O::IfEq | O::IfEqz => a == b,
            O::IfNe | O::IfNez => a != b,
            O::IfLt | O::IfLtz => a < b,
            O::IfGe | O::IfGez => a >= b,
            O::IfGt | O::IfGtz => a > b,
            _ => a <= b,
        };
        Ok(if taken {
            Flow::Jump(branch_target(address, insn.operand)?)
        } else {
            Flow::Next
        })
    }
}

fn convert(opcode: Opcode, frame: &Frame, src: u32) -> Result<Value> {
    use Opcode as O;
    Ok(match opcode {
        O::IntToLong => Value::Long(i64::from(frame.int(src)?)),
        O::IntToFloat => Value::Float(frame.int(src)? as f32),
        O::IntToDouble => Value::Double(f64::from(frame.int(src)?)),
        O::LongToInt => Value::Int(frame.long(src)? as i32),
        O::LongToFloat => Value::Float(frame.long(src)? as f32),
        O::LongToDouble => Value::Double(frame.long(src)? as f64),
        O::FloatToInt => Value::Int(frame.float(src)? as i32),
        O::FloatToLong => Value::Long(frame.float(src)? as i64),
        O::FloatToDouble => Value::Double(f64::from(frame.float(src)?)),
        O::DoubleToInt => Value::Int(frame.double(src)? as i32),
        O::DoubleToLong => Value::Long(frame.double(src)? as i64),
        O::DoubleToFloat => Value::Float(frame.double(src)? as f32),
        O::IntToByte => Value::Int(i32::from(frame.int(src)? as i8)),
        O::IntToChar => Value::Int(i32::from(frame.int(src)? as u16)),
        _ => Value::Int(i32::from(frame.int(src)? as i16)),
    })
}

/// Integer arithmetic with Java semantics; `None` for division by zero.
fn int_op(opcode: Opcode, a: i32, b: i32) -> Option<i32> {
    use Opcode as O;
    Some(match opcode {
        O::AddInt => a.wrapping_add(b),
        O::SubInt => a.wrapping_sub(b),
        O::MulInt => a.wrapping_mul(b),
        O::DivInt => a.checked_div(b).or_else(|| (b == -1).then_some(a.wrapping_neg()))?,
        O::RemInt => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        O::AndInt => a & b,
        O::OrInt => a | b,
        O::XorInt => a ^ b,
        O::ShlInt => a.wrapping_shl(b as u32 & 0x1f),
        O::ShrInt => a.wrapping_shr(b as u32 & 0x1f),
        _ => ((a as u32) >> (b as u32 & 0x1f)) as i32,
    })
}

/// Long arithmetic with Java semantics; `None` for division by zero.
fn long_op(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    use Opcode as O;
    Some(match opcode {
        O::AddLong => a.wrapping_add(b),
        O::SubLong => a.wrapping_sub(b),
        O::MulLong => a.wrapping_mul(b),
        O::DivLong => a.checked_div(b).or_else(|| (b == -1).then_some(a.wrapping_neg()))?,
        O::RemLong => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        O::AndLong => a & b,
        O::OrLong => a | b,
        O::XorLong => a ^ b,
        O::ShlLong => a.wrapping_shl(b as u32 & 0x3f),
        O::ShrLong => a.wrapping_shr(b as u32 & 0x3f),
        _ => ((a as u64) >> (b as u32 & 0x3f)) as i64,
    })
}
