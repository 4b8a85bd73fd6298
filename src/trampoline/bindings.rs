//! Descriptors of the host runtime classes a generated trampoline calls into.
//!
//! The generated `hook` body never links against a concrete framework; every class, field
//! and method it touches is named here. [`HostBindings::default`] describes the Xposed bridge
//! API as shipped by SandHook's compatibility layer.

use crate::types::{FieldRef, MethodRef, TypeId};

/// Host classes, fields and methods referenced by generated code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostBindings {
    /// `static boolean` kill switch; when set, `hook` calls the original directly.
    pub disable_hooks: FieldRef,
    /// Per-member hook record passed to `setup`.
    pub hook_info: TypeId,
    /// Callback collection field of [`HostBindings::hook_info`].
    pub callbacks: FieldRef,
    /// `Object[] getSnapshot()` on the callback collection.
    pub snapshot: MethodRef,
    /// Callback class; snapshot elements are cast to it.
    pub callback: TypeId,
    /// `void callBeforeHookedMethod(param)`
    pub call_before: MethodRef,
    /// `void callAfterHookedMethod(param)`
    pub call_after: MethodRef,
    /// The invocation record class.
    pub param: TypeId,
    /// No-argument constructor of [`HostBindings::param`].
    pub param_init: MethodRef,
    /// Record field holding the hooked member.
    pub param_method: FieldRef,
    /// Record field holding the receiver.
    pub param_this: FieldRef,
    /// Record field holding the boxed argument array.
    pub param_args: FieldRef,
    /// Record flag set when a callback supplied a result or throwable.
    pub return_early: FieldRef,
    /// `Object getResult()`
    pub get_result: MethodRef,
    /// `void setResult(Object)`; also sets the early-return flag.
    pub set_result: MethodRef,
    /// `Throwable getThrowable()`
    pub get_throwable: MethodRef,
    /// `void setThrowable(Throwable)`; also sets the early-return flag.
    pub set_throwable: MethodRef,
    /// `boolean hasThrowable()`
    pub has_throwable: MethodRef,
    /// `static void log(Throwable)`, used for absorbed callback failures.
    pub log_throwable: MethodRef,
    /// Reflected type of the hooked member.
    pub member: TypeId,
    /// Reflected type of the backup method handle.
    pub backup_method: TypeId,
    /// `static void trace(member)`, called at `hook` entry when tracing is enabled.
    pub trace: MethodRef,
    /// `static void report(member)`, called by the default `backup` body when it runs
    /// unpatched.
    pub origin_error: MethodRef,
    /// `static Object call(member, backup, this, Object[])`, the reflective retry used by the
    /// retrying `backup` body.
    pub call_origin: MethodRef,
    /// `static void ensure(member, backup)`, called by `callBackup` before it calls `backup`.
    pub ensure_backup: Option<MethodRef>,
}

impl HostBindings {
    /// The hook record type's `Object[]` argument array type.
    #[must_use]
    pub fn object_array() -> TypeId {
        TypeId::array_of(&TypeId::object())
    }
}

impl Default for HostBindings {
    fn default() -> Self {
        let bridge = TypeId::class("de/robv/android/xposed/XposedBridge");
        let hook_info = TypeId::class("de/robv/android/xposed/XposedBridge$AdditionalHookInfo");
        let callbacks = TypeId::class("de/robv/android/xposed/XposedBridge$CopyOnWriteSortedSet");
        let callback = TypeId::class("de/robv/android/xposed/XC_MethodHook");
        let param = TypeId::class("de/robv/android/xposed/XC_MethodHook$MethodHookParam");
        let member = TypeId::class("java/lang/reflect/Member");
        let backup_method = TypeId::class("java/lang/reflect/Method");
        let log = TypeId::class("com/swift/sandhook/xposedcompat/utils/DexLog");
        let error_catch = TypeId::class("com/swift/sandhook/xposedcompat/methodgen/ErrorCatch");
        let objects = Self::object_array();

        HostBindings {
            disable_hooks: FieldRef::new(bridge.clone(), "disableHooks", TypeId::Boolean),
            callbacks: FieldRef::new(hook_info.clone(), "callbacks", callbacks.clone()),
            hook_info,
            snapshot: MethodRef::new(callbacks, "getSnapshot", objects.clone(), vec![]),
            call_before: MethodRef::new(
                callback.clone(),
                "callBeforeHookedMethod",
                TypeId::Void,
                vec![param.clone()],
            ),
            call_after: MethodRef::new(
                callback.clone(),
                "callAfterHookedMethod",
                TypeId::Void,
                vec![param.clone()],
            ),
            callback,
            param_init: MethodRef::new(param.clone(), "<init>", TypeId::Void, vec![]),
            param_method: FieldRef::new(param.clone(), "method", member.clone()),
            param_this: FieldRef::new(param.clone(), "thisObject", TypeId::object()),
            param_args: FieldRef::new(param.clone(), "args", objects.clone()),
            return_early: FieldRef::new(param.clone(), "returnEarly", TypeId::Boolean),
            get_result: MethodRef::new(param.clone(), "getResult", TypeId::object(), vec![]),
            set_result: MethodRef::new(
                param.clone(),
                "setResult",
                TypeId::Void,
                vec![TypeId::object()],
            ),
            get_throwable: MethodRef::new(param.clone(), "getThrowable", TypeId::throwable(), vec![]),
            set_throwable: MethodRef::new(
                param.clone(),
                "setThrowable",
                TypeId::Void,
                vec![TypeId::throwable()],
            ),
            has_throwable: MethodRef::new(param.clone(), "hasThrowable", TypeId::Boolean, vec![]),
            param,
            log_throwable: MethodRef::new(bridge, "log", TypeId::Void, vec![TypeId::throwable()]),
            trace: MethodRef::new(
                log.clone(),
                "printMethodHookIn",
                TypeId::Void,
                vec![member.clone()],
            ),
            origin_error: MethodRef::new(
                log,
                "printCallOriginError",
                TypeId::Void,
                vec![member.clone()],
            ),
            call_origin: MethodRef::new(
                error_catch,
                "callOriginError",
                TypeId::object(),
                vec![member.clone(), backup_method.clone(), TypeId::object(), objects],
            ),
            ensure_backup: Some(MethodRef::new(
                TypeId::class("com/swift/sandhook/SandHook"),
                "ensureBackupMethod",
                TypeId::Void,
                vec![member.clone(), backup_method.clone()],
            )),
            member,
            backup_method,
        }
    }
}
