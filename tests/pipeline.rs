//! End-to-end tests of trampoline synthesis.
//!
//! These tests drive the public entry points only: synthesize units, read them back with the
//! container reader, disassemble them and persist them through the unit cache.

use std::{fs, sync::Arc};

use dexhook::{
    codegen::{compile_unit, encode},
    dex::{disasm::render_unit, DexFile},
    dispatch::CallbackChain,
    trampoline::generator::generate,
    vm::{ObjectId, Value},
    Error, MemberDescriptor, OptimizerConfig, TrampolineCompiler, TrampolineConfig,
};

fn chain() -> CallbackChain<Value, ObjectId> {
    CallbackChain::new()
}

const MEMBERS: &[&str] = &[
    "Lcom/example/Greeter;->greet(Ljava/lang/String;)Ljava/lang/String;",
    "static Lcom/example/Calc;->add(IJ)J",
    "Lcom/example/Calc;->scale(FDZ)D",
    "static Lcom/example/Util;->touch()V",
    "Lcom/example/Arrays;->pick([IBSC)[Ljava/lang/Object;",
    "Lcom/example/Widget;-><init>(Landroid/content/Context;I)V",
];

#[test]
fn test_units_decode_and_define_the_trampoline() {
    let compiler = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
    for text in MEMBERS {
        let member = MemberDescriptor::parse(text).unwrap();
        let unit = compiler.synthesize(&member, &chain()).unwrap();
        let layout = compiler.layout(&member);
        assert_eq!(unit.class_name(), layout.class.descriptor());
        assert!(unit.class_name().starts_with("LDexHooker_"));

        let file = DexFile::parse(unit.bytes()).unwrap();
        for name in ["setup", "backup", "hook", "callBackup"] {
            let (method, encoded) = file
                .find_method(unit.class_name(), name)
                .unwrap_or_else(|| panic!("{text}: missing {name}"));
            assert!(encoded.code.is_some(), "{text}: {name} has no code");
            let arity = if name == "setup" { 3 } else { layout.hook.proto.params.len() };
            assert_eq!(method.proto.params.len(), arity, "{text}: {name}");
        }

        let listing = render_unit(file.unit()).unwrap();
        assert!(listing.contains(&layout.backup.to_string()), "{text}:\n{listing}");
    }
}

#[test]
fn test_encoding_is_deterministic_and_round_trips() {
    let config = TrampolineConfig::default();
    for text in MEMBERS {
        let member = MemberDescriptor::parse(text).unwrap();
        let compiled = compile_unit(generate(&member, &config).unwrap(), &config.optimizer).unwrap();
        let first = encode(generate(&member, &config).unwrap(), &config.optimizer).unwrap();
        let second = encode(generate(&member, &config).unwrap(), &config.optimizer).unwrap();
        assert_eq!(first, second, "{text}");
        assert_eq!(DexFile::parse(&first).unwrap().unit(), &compiled, "{text}");
    }
}

#[test]
fn test_unoptimized_units_define_the_same_methods() {
    // Behaviour of both variants is compared by executing `hook` in tests/protocol.rs.
    let optimized = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
    let plain = TrampolineCompiler::new(
        TrampolineConfig::default().with_optimizer(OptimizerConfig::disabled()),
    )
    .unwrap();
    for text in MEMBERS {
        let member = MemberDescriptor::parse(text).unwrap();
        let a = optimized.synthesize(&member, &chain()).unwrap();
        let b = plain.synthesize(&member, &chain()).unwrap();
        assert_eq!(a.class_name(), b.class_name(), "{text}");
        let class = a.class_name();
        let (a, b) = (DexFile::parse(a.bytes()).unwrap(), DexFile::parse(b.bytes()).unwrap());
        for name in ["setup", "backup", "hook", "callBackup"] {
            let (ma, ea) = a.find_method(class, name).unwrap();
            let (mb, eb) = b.find_method(class, name).unwrap();
            assert_eq!(ma, mb, "{text}: {name}");
            assert_eq!(ea.code.is_some(), eb.code.is_some(), "{text}: {name}");
        }
    }
}

#[test]
fn test_corrupted_units_are_rejected() {
    let compiler = TrampolineCompiler::new(TrampolineConfig::default()).unwrap();
    let member = MemberDescriptor::parse(MEMBERS[1]).unwrap();
    let unit = compiler.synthesize(&member, &chain()).unwrap();

    let mut bytes = unit.bytes().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(matches!(DexFile::parse(&bytes), Err(Error::Malformed { .. })));
    assert!(DexFile::parse(&unit.bytes()[..0x40]).is_err());
}

#[test]
fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrampolineConfig::default().with_cache_dir(dir.path());
    let member = MemberDescriptor::parse(MEMBERS[0]).unwrap();

    let first = TrampolineCompiler::new(config.clone()).unwrap();
    let built = first.synthesize(&member, &chain()).unwrap();
    assert!(!built.from_cache());
    let path = first.cache().path_for(&member).unwrap();
    assert!(path.is_file());
    assert_eq!(fs::read(&path).unwrap(), built.bytes());

    // A new process reuses the persisted unit.
    let second = TrampolineCompiler::new(config.clone()).unwrap();
    let reused = second.synthesize(&member, &chain()).unwrap();
    assert!(reused.from_cache());
    assert_eq!(reused.bytes(), built.bytes());

    // A damaged file is discarded and rebuilt.
    fs::write(&path, b"dex\n035\0garbage").unwrap();
    let third = TrampolineCompiler::new(config.clone()).unwrap();
    let rebuilt = third.synthesize(&member, &chain()).unwrap();
    assert!(!rebuilt.from_cache());
    assert_eq!(rebuilt.bytes(), built.bytes());
    assert_eq!(fs::read(&path).unwrap(), built.bytes());

    assert!(third.invalidate(&member));
    assert!(!path.exists());
}

#[test]
fn test_parallel_synthesis_of_many_members() {
    let compiler = Arc::new(TrampolineCompiler::new(TrampolineConfig::default()).unwrap());
    let members: Vec<_> = MEMBERS
        .iter()
        .map(|text| MemberDescriptor::parse(text).unwrap())
        .collect();

    let units: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .flat_map(|_| members.iter())
            .map(|member| {
                let compiler = Arc::clone(&compiler);
                s.spawn(move || compiler.synthesize(member, &chain()).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(compiler.cache().len(), MEMBERS.len());
    assert_eq!(
        units.iter().filter(|u| !u.from_cache()).count(),
        MEMBERS.len()
    );
    for unit in &units {
        let fresh = compiler.synthesize(unit.member(), &chain()).unwrap();
        assert_eq!(fresh.bytes(), unit.bytes());
    }
}
