//! The per-method pipeline and whole-unit compilation.
//!
//! [`compile_method`] takes one recorded body through every stage of the compiler:
//!
//! 1. [`cfg::build`] splits the builder stream into basic blocks
//! 2. [`ssa::build`] renames values and places phis
//! 3. [`optimize`] runs the enabled SSA passes
//! 4. [`regalloc::allocate`] maps values onto registers
//! 5. [`backend::lower`] eliminates phis and cleans up the block graph
//!
//! [`compile_unit`] runs that pipeline for every method of a [`UnitBuilder`] in parallel,
//! interns everything the bodies and declarations reference into one [`Pool`], orders the
//! classes so that each follows its superclass and interfaces, and assembles the code items.
//! Method order inside a class and the pool order are fixed by sorting, never by the order in
//! which parallel work finishes, so the result is deterministic.

use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::{
    backend,
    builder::{ClassDecl, Code, UnitBuilder},
    cfg,
    dex::{self, ClassDefinition, EncodedField, EncodedMethod, Pool, PoolBuilder, Unit},
    ir::RopMethod,
    regalloc,
    ssa::{self, optimize::optimize, optimize::OptimizerConfig},
    types::AccessFlags,
    Error, Result,
};

/// Compiles one method body down to allocated register code.
///
/// # Errors
/// Propagates builder misuse detected while forming blocks ([`Error::Structural`]) and
/// allocator invariant failures ([`Error::AllocationInvariant`]).
pub fn compile_method(code: &Code, config: &OptimizerConfig) -> Result<RopMethod> {
    let rop = cfg::build(code)?;
    let mut method = ssa::build(rop)?;
    if config.any_enabled() {
        optimize(&mut method, config)?;
    }
    let allocation = regalloc::allocate(&method)?;
    backend::lower(&method, &allocation)
}

/// Orders classes so that each comes after its superclass and interfaces when those are
/// declared in the same unit. Declaration order breaks ties.
fn hierarchy_order(classes: &[ClassDecl]) -> Result<Vec<usize>> {
    let index: FxHashMap<_, _> = classes.iter().enumerate().map(|(i, c)| (&c.ty, i)).collect();
    // 0 = unvisited, 1 = on the stack, 2 = placed
    let mut state = vec![0u8; classes.len()];
    let mut order = Vec::with_capacity(classes.len());

    fn visit(
        i: usize,
        classes: &[ClassDecl],
        index: &FxHashMap<&crate::types::TypeId, usize>,
        state: &mut [u8],
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match state[i] {
            2 => return Ok(()),
            1 => {
                return Err(Error::Declaration {
                    member: classes[i].ty.to_string(),
                    reason: "class hierarchy is cyclic".to_string(),
                })
            }
            _ => {}
        }
        state[i] = 1;
        let class = &classes[i];
        for parent in class.superclass.iter().chain(&class.interfaces) {
            if let Some(&p) = index.get(parent) {
                visit(p, classes, index, state, order)?;
            }
        }
        state[i] = 2;
        order.push(i);
        Ok(())
    }

    for i in 0..classes.len() {
        visit(i, classes, &index, &mut state, &mut order)?;
    }
    Ok(order)
}

fn intern(classes: &[ClassDecl], bodies: &[Option<RopMethod>]) -> Pool {
    let mut pool = PoolBuilder::new();
    let mut bodies = bodies.iter();
    for class in classes {
        pool.add_type(&class.ty);
        if let Some(superclass) = &class.superclass {
            pool.add_type(superclass);
        }
        for interface in &class.interfaces {
            pool.add_type(interface);
        }
        if let Some(source) = &class.source_file {
            pool.add_string(source);
        }
        for field in &class.fields {
            pool.add_field(&field.field);
        }
        for method in &class.methods {
            pool.add_method(&method.method);
            if let Some(Some(body)) = bodies.next() {
                pool.add_body(body);
            }
        }
    }
    pool.finish()
}

/// Compiles every method of `unit` and assembles the result into the container model.
///
/// # Errors
/// Returns the first error of any method, [`Error::Declaration`] for a cyclic class hierarchy
/// and [`Error::Encoding`] if the unit exceeds a container limit.
pub fn compile_unit(unit: UnitBuilder, config: &OptimizerConfig) -> Result<Unit> {
    let classes = unit.into_classes();
    let order = hierarchy_order(&classes)?;

    let methods: Vec<_> = classes.iter().flat_map(|c| &c.methods).collect();
    let bodies = methods
        .par_iter()
        .map(|decl| decl.code.as_ref().map(|code| compile_method(code, config)).transpose())
        .collect::<Result<Vec<_>>>()?;
    let pool = intern(&classes, &bodies);

    let code_items = methods
        .par_iter()
        .zip(&bodies)
        .map(|(decl, body)| {
            body.as_ref()
                .map(|rop| dex::assemble(rop, &decl.method.proto, &pool))
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?;

    // Code items in method declaration order, split back per class.
    let mut per_class = Vec::with_capacity(classes.len());
    let mut items = code_items.into_iter();
    for class in &classes {
        per_class.push(items.by_ref().take(class.methods.len()).collect::<Vec<_>>());
    }

    let mut definitions = Vec::with_capacity(classes.len());
    for &i in &order {
        let class = &classes[i];
        let mut definition = ClassDefinition {
            class: pool.type_id(&class.ty)?,
            access: class.access,
            superclass: class.superclass.as_ref().map(|s| pool.type_id(s)).transpose()?,
            interfaces: class
                .interfaces
                .iter()
                .map(|t| pool.type_id(t))
                .collect::<Result<_>>()?,
            source_file: class.source_file.as_ref().map(|s| pool.string(s)).transpose()?,
            static_fields: Vec::new(),
            instance_fields: Vec::new(),
            direct_methods: Vec::new(),
            virtual_methods: Vec::new(),
        };
        for field in &class.fields {
            let encoded = EncodedField {
                field: pool.field(&field.field)?,
                access: field.access,
            };
            if field.access.contains(AccessFlags::STATIC) {
                definition.static_fields.push(encoded);
            } else {
                definition.instance_fields.push(encoded);
            }
        }
        for (decl, code) in class.methods.iter().zip(std::mem::take(&mut per_class[i])) {
            let encoded = EncodedMethod {
                method: pool.method(&decl.method)?,
                access: decl.access,
                code,
            };
            if decl.is_virtual() {
                definition.virtual_methods.push(encoded);
            } else {
                definition.direct_methods.push(encoded);
            }
        }
        definition.static_fields.sort_by_key(|f| f.field);
        definition.instance_fields.sort_by_key(|f| f.field);
        definition.direct_methods.sort_by_key(|m| m.method);
        definition.virtual_methods.sort_by_key(|m| m.method);
        definitions.push(definition);
    }

    debug!(
        "compiled {} methods in {} classes ({} with code)",
        methods.len(),
        classes.len(),
        bodies.iter().filter(|b| b.is_some()).count()
    );
    Ok(Unit {
        pool,
        classes: definitions,
    })
}

/// Compiles and writes `unit` as a container.
///
/// # Errors
/// See [`compile_unit`] and [`dex::writer::write`].
pub fn encode(unit: UnitBuilder, config: &OptimizerConfig) -> Result<Vec<u8>> {
    dex::writer::write(&compile_unit(unit, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::DexFile,
        ir::BinOp,
        types::{FieldRef, MethodRef, TypeId},
    };

    fn sample() -> UnitBuilder {
        let base = TypeId::class("t/Base");
        let derived = TypeId::class("t/Derived");
        let mut unit = UnitBuilder::new();
        unit.declare_class(derived.clone(), AccessFlags::PUBLIC, Some(base.clone()))
            .unwrap();
        unit.declare_class(base.clone(), AccessFlags::PUBLIC, Some(TypeId::object()))
            .unwrap()
            .source_file = Some("Base.java".to_string());

        let counter = FieldRef::new(base.clone(), "counter", TypeId::Int);
        unit.declare_field(counter.clone(), AccessFlags::STATIC).unwrap();

        let twice = MethodRef::new(base.clone(), "twice", TypeId::Int, vec![TypeId::Int]);
        let code = unit
            .declare_method(twice, AccessFlags::PUBLIC | AccessFlags::STATIC)
            .unwrap();
        let x = code.param(0).unwrap();
        let y = code.new_local(TypeId::Int).unwrap();
        code.binary(BinOp::Add, y, x, x).unwrap();
        code.sput(&counter, y).unwrap();
        code.return_value(y).unwrap();

        let run = MethodRef::new(derived, "run", TypeId::Void, vec![]);
        unit.declare_method(run, AccessFlags::PUBLIC)
            .unwrap()
            .return_void()
            .unwrap();
        unit
    }

    #[test]
    fn test_superclass_first() {
        let unit = compile_unit(sample(), &OptimizerConfig::default()).unwrap();
        let names: Vec<_> = unit
            .classes
            .iter()
            .map(|c| unit.pool.types()[c.class as usize].to_string())
            .collect();
        assert_eq!(names, vec!["Lt/Base;", "Lt/Derived;"]);
        assert_eq!(unit.classes[0].static_fields.len(), 1);
        assert_eq!(unit.classes[0].direct_methods.len(), 1);
        assert_eq!(unit.classes[1].virtual_methods.len(), 1);
    }

    #[test]
    fn test_encode_round_trips_and_is_deterministic() {
        let first = encode(sample(), &OptimizerConfig::default()).unwrap();
        let second = encode(sample(), &OptimizerConfig::default()).unwrap();
        assert_eq!(first, second);

        let file = DexFile::parse(&first).unwrap();
        assert_eq!(
            file.unit(),
            &compile_unit(sample(), &OptimizerConfig::default()).unwrap()
        );
        assert!(file.find_method("Lt/Base;", "twice").is_some());
    }

    #[test]
    fn test_cyclic_hierarchy_rejected() {
        let a = TypeId::class("c/A");
        let b = TypeId::class("c/B");
        let mut unit = UnitBuilder::new();
        unit.declare_class(a.clone(), AccessFlags::PUBLIC, Some(b.clone()))
            .unwrap();
        unit.declare_class(b, AccessFlags::PUBLIC, Some(a)).unwrap();
        assert!(matches!(
            compile_unit(unit, &OptimizerConfig::disabled()),
            Err(Error::Declaration { .. })
        ));
    }
}
