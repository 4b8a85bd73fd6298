//! Differential tests of the SSA optimizer.
//!
//! Each program is compiled twice, with every pass enabled and with the optimizer disabled,
//! and both units are executed by the reference interpreter over the same inputs. The
//! optimized unit must compute the same results and raise the same exceptions.

use dexhook::{
    builder::{Code, UnitBuilder},
    codegen::compile_unit,
    dex::Unit,
    ir::{BinOp, CmpOp, Cond, Constant},
    types::{AccessFlags, MethodRef, TypeId},
    vm::{Completion, Isolated, Value, Vm},
    OptimizerConfig,
};

fn owner() -> TypeId {
    TypeId::class("t/Program")
}

/// Declares `owner` with one static method whose body is written by `body`.
fn program(method: &MethodRef, body: impl Fn(&mut Code)) -> UnitBuilder {
    let mut unit = UnitBuilder::new();
    unit.declare_class(owner(), AccessFlags::PUBLIC, Some(TypeId::object()))
        .unwrap();
    let code = unit
        .declare_method(method.clone(), AccessFlags::PUBLIC | AccessFlags::STATIC)
        .unwrap();
    body(code);
    unit
}

fn describe(vm: &Vm<'_, Isolated>, completion: Completion) -> String {
    match completion {
        Completion::Value(value) => format!("{value:?}"),
        Completion::Thrown(id) => format!("throws {}", vm.heap().class_of(id).unwrap()),
    }
}

fn execute(unit: &Unit, method: &MethodRef, args: &[Value]) -> String {
    let mut vm = Vm::new(unit, Isolated).unwrap();
    let completion = vm.call(method, args).unwrap();
    describe(&vm, completion)
}

fn code_units(unit: &Unit) -> usize {
    unit.classes
        .iter()
        .flat_map(|c| c.methods())
        .filter_map(|m| m.code.as_ref())
        .map(|c| c.insns.len())
        .sum()
}

/// Compiles `body` both ways and compares every input. Returns the code size of the
/// optimized and the unoptimized unit.
fn differential(method: &MethodRef, body: impl Fn(&mut Code), inputs: &[Vec<Value>]) -> (usize, usize) {
    let optimized = compile_unit(program(method, &body), &OptimizerConfig::default()).unwrap();
    let plain = compile_unit(program(method, &body), &OptimizerConfig::disabled()).unwrap();
    for args in inputs {
        assert_eq!(
            execute(&optimized, method, args),
            execute(&plain, method, args),
            "{method} diverges for {args:?}"
        );
    }
    (code_units(&optimized), code_units(&plain))
}

fn ints(values: &[i32]) -> Vec<Vec<Value>> {
    values.iter().map(|v| vec![Value::Int(*v)]).collect()
}

const SAMPLES: &[i32] = &[i32::MIN, -7, -1, 0, 1, 2, 5, 13, 100, i32::MAX];

#[test]
fn test_constant_branches_fold() {
    let method = MethodRef::new(owner(), "fold", TypeId::Int, vec![TypeId::Int]);
    let (optimized, plain) = differential(
        &method,
        |code| {
            let x = code.param(0).unwrap();
            let a = code.new_local(TypeId::Int).unwrap();
            let b = code.new_local(TypeId::Int).unwrap();
            let c = code.new_local(TypeId::Int).unwrap();
            let unused = code.new_local(TypeId::Int).unwrap();
            let small = code.new_label();
            code.load_constant(a, Constant::Int(2)).unwrap();
            code.load_constant(b, Constant::Int(3)).unwrap();
            code.binary(BinOp::Mul, c, a, b).unwrap();
            code.binary(BinOp::Sub, unused, c, x).unwrap();
            code.branch(Cond::Lt, c, b, small).unwrap();
            code.binary(BinOp::Add, c, c, x).unwrap();
            code.return_value(c).unwrap();
            code.mark(small).unwrap();
            code.binary(BinOp::Div, c, x, a).unwrap();
            code.return_value(c).unwrap();
        },
        &ints(SAMPLES),
    );
    assert!(optimized < plain, "{optimized} >= {plain}");
}

#[test]
fn test_loop_with_phis() {
    // Collatz step count.
    let method = MethodRef::new(owner(), "steps", TypeId::Int, vec![TypeId::Int]);
    let inputs: Vec<i32> = (1..=27).collect();
    differential(
        &method,
        |code| {
            let n = code.param(0).unwrap();
            let steps = code.new_local(TypeId::Int).unwrap();
            let one = code.new_local(TypeId::Int).unwrap();
            let two = code.new_local(TypeId::Int).unwrap();
            let three = code.new_local(TypeId::Int).unwrap();
            let parity = code.new_local(TypeId::Int).unwrap();
            let head = code.new_label();
            let odd = code.new_label();
            let next = code.new_label();
            let done = code.new_label();
            code.load_constant(steps, Constant::Int(0)).unwrap();
            code.load_constant(one, Constant::Int(1)).unwrap();
            code.load_constant(two, Constant::Int(2)).unwrap();
            code.load_constant(three, Constant::Int(3)).unwrap();
            code.mark(head).unwrap();
            code.branch(Cond::Le, n, one, done).unwrap();
            code.binary(BinOp::Rem, parity, n, two).unwrap();
            code.branch_zero(Cond::Ne, parity, odd).unwrap();
            code.binary(BinOp::Div, n, n, two).unwrap();
            code.jump(next).unwrap();
            code.mark(odd).unwrap();
            code.binary(BinOp::Mul, n, n, three).unwrap();
            code.binary(BinOp::Add, n, n, one).unwrap();
            code.mark(next).unwrap();
            code.binary(BinOp::Add, steps, steps, one).unwrap();
            code.jump(head).unwrap();
            code.mark(done).unwrap();
            code.return_value(steps).unwrap();
        },
        &ints(&inputs),
    );
}

#[test]
fn test_wide_values_and_comparisons() {
    let method = MethodRef::new(
        owner(),
        "mix",
        TypeId::Long,
        vec![TypeId::Long, TypeId::Int],
    );
    let inputs: Vec<Vec<Value>> = [(0, 0), (1, 1), (-5, 3), (i64::MAX, 63), (i64::MIN, -1), (42, 70)]
        .iter()
        .map(|(a, b)| vec![Value::Long(*a), Value::Int(*b)])
        .collect();
    differential(
        &method,
        |code| {
            let a = code.param(0).unwrap();
            let shift = code.param(1).unwrap();
            let wide = code.new_local(TypeId::Long).unwrap();
            let shifted = code.new_local(TypeId::Long).unwrap();
            let order = code.new_local(TypeId::Int).unwrap();
            let negative = code.new_label();
            code.convert(wide, shift).unwrap();
            code.binary(BinOp::Shl, shifted, a, shift).unwrap();
            code.binary(BinOp::Xor, shifted, shifted, wide).unwrap();
            code.compare(CmpOp::Long, order, shifted, a).unwrap();
            code.branch_zero(Cond::Lt, order, negative).unwrap();
            code.binary(BinOp::Ushr, shifted, shifted, shift).unwrap();
            code.return_value(shifted).unwrap();
            code.mark(negative).unwrap();
            code.binary(BinOp::Sub, shifted, a, wide).unwrap();
            code.return_value(shifted).unwrap();
        },
        &inputs,
    );
}

#[test]
fn test_copies_across_a_diamond() {
    let method = MethodRef::new(owner(), "pick", TypeId::Int, vec![TypeId::Int, TypeId::Int]);
    let inputs: Vec<Vec<Value>> = [(0, 9), (3, 4), (-2, -8), (7, 7)]
        .iter()
        .map(|(a, b)| vec![Value::Int(*a), Value::Int(*b)])
        .collect();
    differential(
        &method,
        |code| {
            let a = code.param(0).unwrap();
            let b = code.param(1).unwrap();
            let x = code.new_local(TypeId::Int).unwrap();
            let y = code.new_local(TypeId::Int).unwrap();
            let swap = code.new_label();
            let join = code.new_label();
            code.move_value(x, a).unwrap();
            code.move_value(y, b).unwrap();
            code.branch(Cond::Gt, x, y, swap).unwrap();
            code.jump(join).unwrap();
            code.mark(swap).unwrap();
            // Swap through a temporary: the classic parallel-copy hazard.
            let t = code.new_local(TypeId::Int).unwrap();
            code.move_value(t, x).unwrap();
            code.move_value(x, y).unwrap();
            code.move_value(y, t).unwrap();
            code.mark(join).unwrap();
            code.binary(BinOp::Sub, x, y, x).unwrap();
            code.return_value(x).unwrap();
        },
        &inputs,
    );
}

#[test]
fn test_exception_edges_survive_optimization() {
    let method = MethodRef::new(owner(), "safe", TypeId::Int, vec![TypeId::Int]);
    let arithmetic = TypeId::class("java/lang/ArithmeticException");
    differential(
        &method,
        |code| {
            let x = code.param(0).unwrap();
            let hundred = code.new_local(TypeId::Int).unwrap();
            let result = code.new_local(TypeId::Int).unwrap();
            let caught = code.new_local(TypeId::throwable()).unwrap();
            let handler = code.new_label();
            code.load_constant(hundred, Constant::Int(100)).unwrap();
            code.load_constant(result, Constant::Int(-1)).unwrap();
            code.add_catch(Some(arithmetic.clone()), handler).unwrap();
            code.binary(BinOp::Div, result, hundred, x).unwrap();
            code.remove_catch(Some(&arithmetic)).unwrap();
            code.return_value(result).unwrap();
            code.mark(handler).unwrap();
            code.move_exception(caught).unwrap();
            code.return_value(result).unwrap();
        },
        &ints(SAMPLES),
    );

    // Uncaught division by zero raises the same exception either way.
    let method = MethodRef::new(owner(), "unsafe", TypeId::Int, vec![TypeId::Int]);
    differential(
        &method,
        |code| {
            let x = code.param(0).unwrap();
            let one = code.new_local(TypeId::Int).unwrap();
            let zero = code.new_local(TypeId::Int).unwrap();
            code.load_constant(one, Constant::Int(1)).unwrap();
            code.load_constant(zero, Constant::Int(0)).unwrap();
            code.binary(BinOp::Rem, x, x, zero).unwrap();
            code.binary(BinOp::Add, x, x, one).unwrap();
            code.return_value(x).unwrap();
        },
        &ints(&[0, 5]),
    );
}
