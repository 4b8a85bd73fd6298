//! Emission of the trampoline class for one member.
//!
//! Every trampoline class has the same shape:
//!
//! ```text
//! public class <prefix>_<sha1 of the canonical signature> {
//!     static AdditionalHookInfo additionalHookInfo;
//!     static Member method;
//!     static Method backupMethod;
//!
//!     static void setup(Member, Method, AdditionalHookInfo);
//!     static R    backup(P...);      // patched to become the original entry
//!     static R    hook(P...);        // the dispatch protocol
//!     static R    callBackup(P...);  // direct call into backup
//! }
//! ```
//!
//! `P` is the receiver (erased to `Object`) followed by the member's parameters and `R` is
//! its return type with references erased to `Object`. The bridge classes are taken from
//! [`HostBindings`].

use crate::{
    builder::{Code, Local, UnitBuilder},
    ir::{BinOp, Cond, Constant},
    trampoline::{boxing, HostBindings, TrampolineConfig},
    types::{AccessFlags, FieldRef, MemberDescriptor, MethodRef, TypeId},
    Result,
};

/// Names of everything a trampoline class declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// The generated class.
    pub class: TypeId,
    /// `static AdditionalHookInfo additionalHookInfo`
    pub hook_info: FieldRef,
    /// `static Member method`
    pub method: FieldRef,
    /// `static Method backupMethod`
    pub backup_method: FieldRef,
    /// `setup(Member, Method, AdditionalHookInfo)V`
    pub setup: MethodRef,
    /// The placeholder redirected to the original implementation.
    pub backup: MethodRef,
    /// The interception entry point.
    pub hook: MethodRef,
    /// Direct call into `backup`.
    pub call_backup: MethodRef,
}

impl Layout {
    /// Computes the layout of the trampoline for `member`.
    #[must_use]
    pub fn new(member: &MemberDescriptor, prefix: &str, bindings: &HostBindings) -> Self {
        let class = TypeId::class(&format!("{prefix}_{}", member.content_hash()));
        let params = member.trampoline_params();
        let ret = member.trampoline_return();
        let entry = |name: &str| MethodRef::new(class.clone(), name, ret.clone(), params.clone());

        Layout {
            hook_info: FieldRef::new(class.clone(), "additionalHookInfo", bindings.hook_info.clone()),
            method: FieldRef::new(class.clone(), "method", bindings.member.clone()),
            backup_method: FieldRef::new(class.clone(), "backupMethod", bindings.backup_method.clone()),
            setup: MethodRef::new(
                class.clone(),
                "setup",
                TypeId::Void,
                vec![
                    bindings.member.clone(),
                    bindings.backup_method.clone(),
                    bindings.hook_info.clone(),
                ],
            ),
            backup: entry("backup"),
            hook: entry("hook"),
            call_backup: entry("callBackup"),
            class,
        }
    }
}

/// Declares the trampoline class for `member` with all four methods.
///
/// # Errors
/// Returns [`crate::Error::Declaration`] if the member cannot be hooked and propagates builder
/// misuse as [`crate::Error::Structural`].
pub fn generate(member: &MemberDescriptor, config: &TrampolineConfig) -> Result<UnitBuilder> {
    member.validate()?;
    let bindings = &config.bindings;
    let layout = Layout::new(member, &config.class_prefix, bindings);

    let mut unit = UnitBuilder::new();
    unit.declare_class(layout.class.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))?;
    for field in [&layout.hook_info, &layout.method, &layout.backup_method] {
        unit.declare_field(field.clone(), AccessFlags::STATIC | AccessFlags::PUBLIC)?;
    }
    let access = AccessFlags::PUBLIC | AccessFlags::STATIC;

    emit_setup(unit.declare_method(layout.setup.clone(), access)?, &layout)?;
    let backup = unit.declare_method(layout.backup.clone(), access)?;
    if config.retry_backup {
        emit_retry_backup(backup, member, &layout, bindings)?;
    } else {
        emit_backup(backup, &layout, bindings)?;
    }
    emit_hook(
        unit.declare_method(layout.hook.clone(), access)?,
        member,
        &layout,
        bindings,
        config.trace_invocations,
    )?;
    emit_call_backup(unit.declare_method(layout.call_backup.clone(), access)?, &layout, bindings)?;
    Ok(unit)
}

fn zero_of(ty: &TypeId) -> Constant {
    match ty {
        TypeId::Long => Constant::Long(0),
        TypeId::Float => Constant::Float(0),
        TypeId::Double => Constant::Double(0),
        TypeId::Reference(_) => Constant::Null,
        _ => Constant::Int(0),
    }
}

fn return_default(code: &mut Code, ret: &TypeId) -> Result<()> {
    if *ret == TypeId::Void {
        code.return_void()?;
    } else {
        let value = code.new_local(ret.clone())?;
        code.load_constant(value, zero_of(ret))?;
        code.return_value(value)?;
    }
    Ok(())
}

fn return_local(code: &mut Code, value: Option<Local>) -> Result<()> {
    match value {
        Some(value) => code.return_value(value)?,
        None => code.return_void()?,
    };
    Ok(())
}

/// A local of `ty`, or `None` for `void`.
fn result_local(code: &mut Code, ty: &TypeId) -> Result<Option<Local>> {
    if *ty == TypeId::Void {
        Ok(None)
    } else {
        code.new_local(ty.clone()).map(Some)
    }
}

/// A wrapper-typed scratch local for unboxing into `ty`, if `ty` is primitive.
fn wrapper_local(code: &mut Code, ty: &TypeId) -> Result<Option<Local>> {
    boxing::box_type(ty).map(|wrapper| code.new_local(wrapper)).transpose()
}

fn all_params(code: &Code, count: usize) -> Result<Vec<Local>> {
    (0..count).map(|i| code.param(i)).collect()
}

fn emit_setup(code: &mut Code, layout: &Layout) -> Result<()> {
    let member = code.param(0)?;
    let backup = code.param(1)?;
    let info = code.param(2)?;
    code.sput(&layout.method, member)?
        .sput(&layout.backup_method, backup)?
        .sput(&layout.hook_info, info)?
        .return_void()?;
    Ok(())
}

/// The default placeholder: report that the unpatched body ran, then return a default.
fn emit_backup(code: &mut Code, layout: &Layout, bindings: &HostBindings) -> Result<()> {
    let ret = layout.backup.proto.ret.clone();
    let member = code.new_local(bindings.member.clone())?;
    let caught = code.new_local(TypeId::throwable())?;
    let handler = code.new_label();
    let done = code.new_label();

    code.add_catch(Some(TypeId::throwable()), handler)?;
    code.sget(&layout.method, member)?
        .invoke_static(&bindings.origin_error, None, &[member])?;
    code.remove_catch(Some(&TypeId::throwable()))?;
    code.jump(done)?;
    code.mark(handler)?.move_exception(caught)?;
    code.mark(done)?;
    return_default(code, &ret)
}

/// The retrying placeholder: calls the original reflectively through the host and returns
/// its result, or a default if that throws.
fn emit_retry_backup(
    code: &mut Code,
    member: &MemberDescriptor,
    layout: &Layout,
    bindings: &HostBindings,
) -> Result<()> {
    let ret = layout.backup.proto.ret.clone();
    let offset = usize::from(!member.is_static());
    let params = all_params(code, offset + member.params().len())?;

    let reflected = code.new_local(bindings.member.clone())?;
    let backup = code.new_local(bindings.backup_method.clone())?;
    let receiver = code.new_local(TypeId::object())?;
    let args = box_arguments(code, member, &params[offset..])?;
    let returned = code.new_local(TypeId::object())?;
    let result = result_local(code, &ret)?;
    let wrapper = wrapper_local(code, &ret)?;
    let caught = code.new_local(TypeId::throwable())?;
    let handler = code.new_label();

    if offset == 1 {
        code.move_value(receiver, params[0])?;
    } else {
        code.load_constant(receiver, Constant::Null)?;
    }
    code.add_catch(Some(TypeId::throwable()), handler)?;
    code.sget(&layout.method, reflected)?
        .sget(&layout.backup_method, backup)?
        .invoke_static(
            &bindings.call_origin,
            Some(returned),
            &[reflected, backup, receiver, args],
        )?;
    code.remove_catch(Some(&TypeId::throwable()))?;
    if let Some(result) = result {
        boxing::emit_unbox(code, result, returned, wrapper, &ret)?;
    }
    return_local(code, result)?;

    code.mark(handler)?.move_exception(caught)?;
    return_default(code, &ret)
}

/// Boxes `values` (typed by the member's parameters) into a fresh `Object[]`.
fn box_arguments(code: &mut Code, member: &MemberDescriptor, values: &[Local]) -> Result<Local> {
    let array = code.new_local(HostBindings::object_array())?;
    let length = code.new_local(TypeId::Int)?;
    let index = code.new_local(TypeId::Int)?;
    let boxed = code.new_local(TypeId::object())?;
    code.load_constant(length, Constant::Int(member.params().len() as i32))?
        .new_array(array, length)?;
    for (i, (value, ty)) in values.iter().zip(member.params()).enumerate() {
        boxing::emit_box(code, boxed, *value, ty)?;
        code.load_constant(index, Constant::Int(i as i32))?
            .aput(array, index, boxed)?;
    }
    Ok(array)
}

fn emit_call_backup(code: &mut Code, layout: &Layout, bindings: &HostBindings) -> Result<()> {
    let params = all_params(code, layout.call_backup.proto.params.len())?;
    let result = result_local(code, &layout.call_backup.proto.ret)?;
    if let Some(ensure) = &bindings.ensure_backup {
        let member = code.new_local(bindings.member.clone())?;
        let backup = code.new_local(bindings.backup_method.clone())?;
        code.sget(&layout.method, member)?
            .sget(&layout.backup_method, backup)?
            .invoke_static(ensure, None, &[member, backup])?;
    }
    code.invoke_static(&layout.backup, result, &params)?;
    return_local(code, result)
}

/// The interception protocol.
///
/// Callbacks come from one snapshot of the hook record's callback set. Before-callbacks run
/// forward until one sets `returnEarly`; a throwing before-callback is logged, leaves a null
/// result and suppresses the original call without stopping the loop. The original runs with
/// the live argument array unless suppressed. After-callbacks run over the whole snapshot in
/// reverse; a throwing after-callback is logged and the outcome it saw is restored.
fn emit_hook(
    code: &mut Code,
    member: &MemberDescriptor,
    layout: &Layout,
    bindings: &HostBindings,
    trace: bool,
) -> Result<()> {
    let ret = layout.hook.proto.ret.clone();
    let offset = usize::from(!member.is_static());
    let params = all_params(code, offset + member.params().len())?;
    let throwable = TypeId::throwable();

    let disabled = code.new_local(TypeId::Boolean)?;
    let info = code.new_local(bindings.hook_info.clone())?;
    let set = code.new_local(bindings.callbacks.ty.clone())?;
    let snapshot = code.new_local(HostBindings::object_array())?;
    let len = code.new_local(TypeId::Int)?;
    let reflected = code.new_local(bindings.member.clone())?;
    let param = code.new_local(bindings.param.clone())?;
    let receiver = code.new_local(TypeId::object())?;
    let index = code.new_local(TypeId::Int)?;
    let one = code.new_local(TypeId::Int)?;
    let zero = code.new_local(TypeId::Int)?;
    let skip = code.new_local(TypeId::Int)?;
    let early = code.new_local(TypeId::Boolean)?;
    let element = code.new_local(TypeId::object())?;
    let callback = code.new_local(bindings.callback.clone())?;
    let null = code.new_local(TypeId::object())?;
    let caught = code.new_local(throwable.clone())?;
    let boxed = code.new_local(TypeId::object())?;
    let last_result = code.new_local(TypeId::object())?;
    let last_throwable = code.new_local(throwable.clone())?;
    let has_throwable = code.new_local(TypeId::Boolean)?;
    let result = result_local(code, &ret)?;
    let result_wrapper = wrapper_local(code, &ret)?;

    let no_hook = code.new_label();
    let before_head = code.new_label();
    let before_catch = code.new_label();
    let before_check = code.new_label();
    let before_next = code.new_label();
    let before_done = code.new_label();
    let original_catch = code.new_label();
    let after_start = code.new_label();
    let after_head = code.new_label();
    let after_catch = code.new_label();
    let restore_result = code.new_label();
    let after_next = code.new_label();
    let after_done = code.new_label();
    let return_result = code.new_label();

    if trace {
        code.sget(&layout.method, reflected)?
            .invoke_static(&bindings.trace, None, &[reflected])?;
    }

    // DISABLED
    code.sget(&bindings.disable_hooks, disabled)?
        .branch_zero(Cond::Ne, disabled, no_hook)?
        .sget(&layout.hook_info, info)?
        .iget(&bindings.callbacks, set, info)?
        .invoke_virtual(&bindings.snapshot, Some(snapshot), set, &[])?
        .array_length(len, snapshot)?
        .branch_zero(Cond::Eq, len, no_hook)?;

    // The invocation record.
    code.new_instance(param, &bindings.param_init, &[])?
        .sget(&layout.method, reflected)?
        .iput(&bindings.param_method, param, reflected)?;
    if offset == 1 {
        code.move_value(receiver, params[0])?;
    } else {
        code.load_constant(receiver, Constant::Null)?;
    }
    code.iput(&bindings.param_this, param, receiver)?;
    let args = box_arguments(code, member, &params[offset..])?;
    code.iput(&bindings.param_args, param, args)?;

    // RUN_BEFORE
    code.load_constant(one, Constant::Int(1))?
        .load_constant(zero, Constant::Int(0))?
        .load_constant(skip, Constant::Int(0))?
        .load_constant(null, Constant::Null)?
        .load_constant(index, Constant::Int(0))?;
    code.mark(before_head)?
        .branch(Cond::Ge, index, len, before_done)?
        .aget(element, snapshot, index)?
        .cast(callback, element)?;
    code.add_catch(Some(throwable.clone()), before_catch)?;
    code.invoke_virtual(&bindings.call_before, None, callback, &[param])?;
    code.remove_catch(Some(&throwable))?;
    code.jump(before_check)?;

    code.mark(before_catch)?
        .move_exception(caught)?
        .invoke_static(&bindings.log_throwable, None, &[caught])?
        .invoke_virtual(&bindings.set_result, None, param, &[null])?
        .iput(&bindings.return_early, param, zero)?
        .move_value(skip, one)?
        .jump(before_next)?;

    code.mark(before_check)?
        .iget(&bindings.return_early, early, param)?
        .branch_zero(Cond::Ne, early, before_done)?;
    code.mark(before_next)?
        .binary(BinOp::Add, index, index, one)?
        .jump(before_head)?;

    // MAYBE_SKIP_ORIGINAL
    code.mark(before_done)?
        .iget(&bindings.return_early, early, param)?
        .branch_zero(Cond::Ne, early, after_start)?
        .branch_zero(Cond::Ne, skip, after_start)?;

    // RUN_ORIGINAL_OR_SKIP, with the live argument array.
    code.iget(&bindings.param_args, args, param)?;
    let mut call_args = Vec::with_capacity(params.len());
    if offset == 1 {
        call_args.push(params[0]);
    }
    for (i, ty) in member.params().iter().enumerate() {
        let value = code.new_local(ty.clone())?;
        let wrapper = wrapper_local(code, ty)?;
        code.load_constant(index, Constant::Int(i as i32))?
            .aget(element, args, index)?;
        boxing::emit_unbox(code, value, element, wrapper, ty)?;
        call_args.push(value);
    }
    code.add_catch(Some(throwable.clone()), original_catch)?;
    code.invoke_static(&layout.backup, result, &call_args)?;
    code.remove_catch(Some(&throwable))?;
    match result {
        Some(result) => boxing::emit_box(code, boxed, result, &ret)?,
        None => {
            code.move_value(boxed, null)?;
        }
    }
    code.invoke_virtual(&bindings.set_result, None, param, &[boxed])?
        .jump(after_start)?;
    code.mark(original_catch)?
        .move_exception(caught)?
        .invoke_virtual(&bindings.set_throwable, None, param, &[caught])?;

    // RUN_AFTER
    code.mark(after_start)?
        .binary(BinOp::Sub, index, len, one)?;
    code.mark(after_head)?
        .branch_zero(Cond::Lt, index, after_done)?
        .invoke_virtual(&bindings.get_result, Some(last_result), param, &[])?
        .invoke_virtual(&bindings.get_throwable, Some(last_throwable), param, &[])?
        .aget(element, snapshot, index)?
        .cast(callback, element)?;
    code.add_catch(Some(throwable.clone()), after_catch)?;
    code.invoke_virtual(&bindings.call_after, None, callback, &[param])?;
    code.remove_catch(Some(&throwable))?;
    code.jump(after_next)?;

    code.mark(after_catch)?
        .move_exception(caught)?
        .invoke_static(&bindings.log_throwable, None, &[caught])?
        .branch_zero(Cond::Eq, last_throwable, restore_result)?
        .invoke_virtual(&bindings.set_throwable, None, param, &[last_throwable])?
        .jump(after_next)?;
    code.mark(restore_result)?
        .invoke_virtual(&bindings.set_result, None, param, &[last_result])?;
    code.mark(after_next)?
        .binary(BinOp::Sub, index, index, one)?
        .jump(after_head)?;

    // RETURN_OR_THROW
    code.mark(after_done)?
        .invoke_virtual(&bindings.has_throwable, Some(has_throwable), param, &[])?
        .branch_zero(Cond::Eq, has_throwable, return_result)?
        .invoke_virtual(&bindings.get_throwable, Some(caught), param, &[])?
        .throw_value(caught)?;
    code.mark(return_result)?;
    if let Some(result) = result {
        code.invoke_virtual(&bindings.get_result, Some(boxed), param, &[])?;
        if ret.is_primitive() {
            // A null result for a primitive return yields the type's default.
            let unbox = code.new_label();
            code.branch_zero(Cond::Ne, boxed, unbox)?;
            return_default(code, &ret)?;
            code.mark(unbox)?;
        }
        boxing::emit_unbox(code, result, boxed, result_wrapper, &ret)?;
    }
    return_local(code, result)?;

    code.mark(no_hook)?
        .invoke_static(&layout.backup, result, &params)?;
    return_local(code, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::compile_unit, ssa::optimize::OptimizerConfig, types::CallShape,
    };

    fn sample() -> MemberDescriptor {
        MemberDescriptor::method(
            TypeId::class("com/example/Greeter"),
            "greet",
            CallShape::Instance {
                receiver: TypeId::class("com/example/Greeter"),
                params: vec![TypeId::string(), TypeId::Long],
            },
            TypeId::Int,
        )
    }

    #[test]
    fn test_layout_erases_receiver_and_reference_return() {
        let member = MemberDescriptor::parse("Lcom/example/Box;->get(I)Ljava/lang/String;").unwrap();
        let layout = Layout::new(&member, "DexHooker", &HostBindings::default());
        assert_eq!(
            layout.hook.proto.params,
            vec![TypeId::object(), TypeId::Int]
        );
        assert_eq!(layout.hook.proto.ret, TypeId::object());
        assert_eq!(
            layout.class.descriptor(),
            format!("LDexHooker_{};", member.content_hash())
        );
    }

    #[test]
    fn test_generated_class_compiles() {
        for retry_backup in [false, true] {
            let config = TrampolineConfig::default()
                .with_retry_backup(retry_backup)
                .with_trace_invocations(true);
            let unit = generate(&sample(), &config).unwrap();
            let compiled = compile_unit(unit, &OptimizerConfig::default()).unwrap();
            assert_eq!(compiled.classes.len(), 1);
            let class = &compiled.classes[0];
            assert_eq!(class.static_fields.len(), 3);
            assert_eq!(class.direct_methods.len(), 4);
            assert!(class.direct_methods.iter().all(|m| m.code.is_some()));
        }
    }

    #[test]
    fn test_static_void_member() {
        let member = MemberDescriptor::parse("static La/B;->tick()V").unwrap();
        let unit = generate(&member, &TrampolineConfig::default()).unwrap();
        let compiled = compile_unit(unit, &OptimizerConfig::disabled()).unwrap();
        let hook = compiled
            .classes[0]
            .direct_methods
            .iter()
            .find(|m| compiled.pool.methods()[m.method as usize].name == "hook")
            .unwrap();
        assert_eq!(hook.code.as_ref().unwrap().ins, 0);
    }

    #[test]
    fn test_abstract_member_rejected() {
        let member = sample().with_flags(AccessFlags::ABSTRACT);
        assert!(matches!(
            generate(&member, &TrampolineConfig::default()),
            Err(crate::Error::Declaration { .. })
        ));
    }
}
