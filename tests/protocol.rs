//! Dispatch protocol integration tests.
//!
//! Every scenario runs twice:
//! 1. through [`dispatch::invoke`], the protocol over plain Rust values
//! 2. through the `hook` method of a synthesized trampoline, decoded from its encoded bytes and
//!    executed by the reference interpreter against the bridge host
//!
//! Both runs must produce the same callback trace, the same calls of the original and the
//! same final outcome. The trampoline runs once with the optimizer enabled and once with it
//! disabled, so the optimized `hook` is also checked against the unoptimized one.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use dexhook::{
    dex::DexFile,
    dispatch::{
        invoke, AfterContext, BeforeContext, Call, Callback, CallbackChain, KillSwitch, Outcome,
    },
    types::TypeId,
    vm::{bridge::BridgeHost, Completion, ObjectId, Value, Vm},
    MemberDescriptor, OptimizerConfig, TrampolineCompiler, TrampolineConfig,
};

type Log = Arc<Mutex<Vec<String>>>;

const MEMBER: &str = "static Lt/Calc;->bump(I)I";

/// Errors a scenario can raise, by role.
#[derive(Clone, Copy, Debug)]
struct Errors {
    callback: ObjectId,
    original: ObjectId,
}

impl Errors {
    fn describe(&self, outcome: &Outcome<Value, ObjectId>) -> String {
        match outcome {
            Outcome::Value(Value::Int(x)) => x.to_string(),
            Outcome::Value(Value::Null) => "null".to_string(),
            Outcome::Value(other) => format!("{other:?}"),
            Outcome::Thrown(id) if *id == self.callback => "callback error".to_string(),
            Outcome::Thrown(id) if *id == self.original => "original error".to_string(),
            Outcome::Thrown(id) => format!("unexpected error {}", id.0),
        }
    }

    /// The final outcome of an `int` member; a missing result reads as zero.
    fn result(&self, outcome: &Outcome<Value, ObjectId>) -> String {
        match outcome {
            Outcome::Value(Value::Null) => "0".to_string(),
            other => self.describe(other),
        }
    }
}

/// What one registered callback does.
#[derive(Clone, Copy, Debug, Default)]
struct Plan {
    name: &'static str,
    double_arg: bool,
    early: Option<i32>,
    throw_early: bool,
    fail_before: bool,
    set_after: Option<i32>,
    fail_after: bool,
}

fn plan(name: &'static str) -> Plan {
    Plan {
        name,
        ..Plan::default()
    }
}

struct Probe {
    plan: Plan,
    log: Log,
    errors: Errors,
}

impl Callback<Value, ObjectId> for Probe {
    fn before(&self, call: &mut BeforeContext<'_, Value, ObjectId>) -> Result<(), ObjectId> {
        self.log.lock().unwrap().push(format!(
            "before {} args={:?}",
            self.plan.name,
            call.args()
        ));
        if self.plan.double_arg {
            if let Some(Value::Int(x)) = call.args().first().copied() {
                call.args_mut()[0] = Value::Int(x * 2);
            }
        }
        if self.plan.fail_before {
            return Err(self.errors.callback);
        }
        if let Some(value) = self.plan.early {
            call.return_early(Value::Int(value));
        }
        if self.plan.throw_early {
            call.throw_early(self.errors.callback);
        }
        Ok(())
    }

    fn after(&self, call: &mut AfterContext<'_, Value, ObjectId>) -> Result<(), ObjectId> {
        self.log.lock().unwrap().push(format!(
            "after {} saw {}",
            self.plan.name,
            self.errors.describe(call.outcome())
        ));
        if let Some(value) = self.plan.set_after {
            call.set_result(Value::Int(value));
        }
        if self.plan.fail_after {
            return Err(self.errors.callback);
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Run {
    result: String,
    trace: Vec<String>,
}

fn register(chain: &CallbackChain<Value, ObjectId>, plans: &[Plan], log: &Log, errors: Errors) {
    for plan in plans {
        chain.add(Arc::new(Probe {
            plan: *plan,
            log: Arc::clone(log),
            errors,
        }));
    }
}

fn run_native(plans: &[Plan], original_throws: bool, disabled: bool, arg: i32) -> Run {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let errors = Errors {
        callback: ObjectId(1000),
        original: ObjectId(1001),
    };
    let log = Log::default();
    let chain = CallbackChain::new();
    register(&chain, plans, &log, errors);
    let switch = KillSwitch::new();
    if disabled {
        switch.disable_hooks();
    }

    let sink = Arc::clone(&log);
    let call = Call::new(&member, None, vec![Value::Int(arg)]);
    let outcome = invoke(&chain, &switch, call, |_, args| {
        sink.lock().unwrap().push(format!("original {args:?}"));
        if original_throws {
            Outcome::Thrown(errors.original)
        } else {
            Outcome::Value(Value::Int(args[0].as_int().unwrap() + 1))
        }
    });

    let trace = log.lock().unwrap().clone();
    Run {
        result: errors.result(&outcome),
        trace,
    }
}

fn run_trampoline(
    optimizer: OptimizerConfig,
    plans: &[Plan],
    original_throws: bool,
    disabled: bool,
    arg: i32,
) -> Run {
    let member = MemberDescriptor::parse(MEMBER).unwrap();
    let compiler =
        TrampolineCompiler::new(TrampolineConfig::default().with_optimizer(optimizer)).unwrap();
    let layout = compiler.layout(&member);
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
    let unit = compiler.synthesize(&member, &chain).unwrap();
    let decoded = DexFile::parse(unit.bytes()).unwrap().into_unit();

    let log = Log::default();
    let sink = Arc::clone(&log);
    let original_error = Arc::new(AtomicU32::new(u32::MAX));
    let thrown = Arc::clone(&original_error);
    let host = BridgeHost::new(
        compiler.config().bindings.clone(),
        member,
        layout.clone(),
        chain.clone(),
        Box::new(move |_heap, args| {
            sink.lock().unwrap().push(format!("original {args:?}"));
            if original_throws {
                Completion::Thrown(ObjectId(thrown.load(Ordering::SeqCst)))
            } else {
                Completion::Value(Value::Int(args[0].as_int().unwrap() + 1))
            }
        }),
    );
    let mut vm = Vm::new(&decoded, host).unwrap();

    let errors = Errors {
        callback: vm
            .heap_mut()
            .throwable(TypeId::class("java/lang/IllegalStateException"), "callback"),
        original: vm
            .heap_mut()
            .throwable(TypeId::class("java/lang/RuntimeException"), "original"),
    };
    original_error.store(errors.original.0, Ordering::SeqCst);
    register(&chain, plans, &log, errors);

    BridgeHost::attach(&mut vm).unwrap();
    vm.host_mut().set_hooks_disabled(disabled);
    let outcome = vm.call(&layout.hook, &[Value::Int(arg)]).unwrap();

    let trace = log.lock().unwrap().clone();
    Run {
        result: errors.result(&outcome),
        trace,
    }
}

/// Runs a scenario natively and through the optimized and unoptimized trampoline, checks they
/// agree and returns the shared run.
fn both(plans: &[Plan], original_throws: bool) -> Run {
    let native = run_native(plans, original_throws, false, 20);
    for optimizer in [OptimizerConfig::default(), OptimizerConfig::disabled()] {
        let trampoline = run_trampoline(optimizer, plans, original_throws, false, 20);
        assert_eq!(native, trampoline);
    }
    native
}

#[test]
fn test_callback_ordering() {
    let run = both(&[plan("a"), plan("b"), plan("c")], false);
    assert_eq!(run.result, "21");
    assert_eq!(
        run.trace,
        [
            "before a args=[Int(20)]",
            "before b args=[Int(20)]",
            "before c args=[Int(20)]",
            "original [Int(20)]",
            "after c saw 21",
            "after b saw 21",
            "after a saw 21",
        ]
    );
}

#[test]
fn test_argument_replacement_reaches_original() {
    let doubler = Plan {
        double_arg: true,
        ..plan("a")
    };
    let run = both(&[doubler, plan("b")], false);
    assert_eq!(run.result, "41");
    assert_eq!(run.trace[1], "before b args=[Int(40)]");
    assert_eq!(run.trace[2], "original [Int(40)]");
}

#[test]
fn test_early_return_skips_original_but_runs_every_after() {
    let early = Plan {
        early: Some(7),
        ..plan("b")
    };
    let run = both(&[plan("a"), early, plan("c")], false);
    assert_eq!(run.result, "7");
    assert_eq!(
        run.trace,
        [
            "before a args=[Int(20)]",
            "before b args=[Int(20)]",
            "after c saw 7",
            "after b saw 7",
            "after a saw 7",
        ]
    );
}

#[test]
fn test_early_throw_propagates() {
    let thrower = Plan {
        throw_early: true,
        ..plan("a")
    };
    let run = both(&[thrower, plan("b")], false);
    assert_eq!(run.result, "callback error");
    assert_eq!(
        run.trace,
        [
            "before a args=[Int(20)]",
            "after b saw callback error",
            "after a saw callback error",
        ]
    );
}

#[test]
fn test_failing_before_skips_original_and_continues() {
    let failing = Plan {
        fail_before: true,
        ..plan("a")
    };
    let run = both(&[failing, plan("b")], false);
    assert_eq!(run.result, "0");
    assert_eq!(
        run.trace,
        [
            "before a args=[Int(20)]",
            "before b args=[Int(20)]",
            "after b saw null",
            "after a saw null",
        ]
    );
}

#[test]
fn test_failing_after_keeps_previous_outcome() {
    let overriding = Plan {
        set_after: Some(50),
        ..plan("a")
    };
    let failing = Plan {
        set_after: Some(99),
        fail_after: true,
        ..plan("b")
    };
    let run = both(&[overriding, failing], false);
    assert_eq!(run.result, "50");
    assert_eq!(run.trace[3], "after b saw 21");
    assert_eq!(run.trace[4], "after a saw 21");
}

#[test]
fn test_original_exception_passes_through() {
    let run = both(&[plan("a")], true);
    assert_eq!(run.result, "original error");
    assert_eq!(run.trace[2], "after a saw original error");

    let recovering = Plan {
        set_after: Some(5),
        ..plan("a")
    };
    assert_eq!(both(&[recovering], true).result, "5");
}

#[test]
fn test_kill_switch_and_empty_chain_call_original_directly() {
    let native = run_native(&[plan("a")], false, true, 3);
    for optimizer in [OptimizerConfig::default(), OptimizerConfig::disabled()] {
        let trampoline = run_trampoline(optimizer, &[plan("a")], false, true, 3);
        assert_eq!(native, trampoline);
    }
    assert_eq!(native.result, "4");
    assert_eq!(native.trace, ["original [Int(3)]"]);

    let empty = both(&[], false);
    assert_eq!(empty.result, "21");
    assert_eq!(empty.trace, ["original [Int(20)]"]);
}

#[test]
fn test_instance_member_passes_receiver() {
    let member = MemberDescriptor::parse(
        "Lt/Greeter;->greet(Ljava/lang/String;)Ljava/lang/String;",
    )
    .unwrap();
    let compiler = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
    let layout = compiler.layout(&member);
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
    let unit = compiler.synthesize(&member, &chain).unwrap();
    let decoded = DexFile::parse(unit.bytes()).unwrap().into_unit();

    struct Witness(Arc<Mutex<Vec<(Option<Value>, Vec<Value>)>>>);

    impl Callback<Value, ObjectId> for Witness {
        fn before(&self, call: &mut BeforeContext<'_, Value, ObjectId>) -> Result<(), ObjectId> {
            self.0
                .lock()
                .unwrap()
                .push((call.receiver().copied(), call.args().to_vec()));
            Ok(())
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    chain.add(Arc::new(Witness(Arc::clone(&seen))));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let host = BridgeHost::new(
        compiler.config().bindings.clone(),
        member,
        layout.clone(),
        chain,
        Box::new(move |_heap, args| {
            sink.lock().unwrap().push(args.to_vec());
            Completion::Value(args[1])
        }),
    );
    let mut vm = Vm::new(&decoded, host).unwrap();
    BridgeHost::attach(&mut vm).unwrap();

    let receiver = vm.heap_mut().alloc(TypeId::class("t/Greeter"));
    let name = vm.heap_mut().string("ada");
    let outcome = vm
        .call(&layout.hook, &[Value::Ref(receiver), Value::Ref(name)])
        .unwrap();

    assert_eq!(outcome, Completion::Value(Value::Ref(name)));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(Some(Value::Ref(receiver)), vec![Value::Ref(name)])]
    );
    assert_eq!(
        *calls.lock().unwrap(),
        vec![vec![Value::Ref(receiver), Value::Ref(name)]]
    );
}
