use anyhow::{bail, Context};
use dexhook::{
    cfg, codegen::compile_method, ssa, ssa::optimize::optimize, trampoline::generator,
};

use crate::{
    app::{CompileOptions, Stage},
    commands::common::{parse_member, trampoline_config},
};

pub fn run(
    member: &str,
    stage: Stage,
    method: Option<&str>,
    opts: &CompileOptions,
) -> anyhow::Result<()> {
    let member = parse_member(member)?;
    let config = trampoline_config(opts);
    let unit = generator::generate(&member, &config)
        .with_context(|| format!("failed to generate a trampoline for {member}"))?;

    let mut shown = 0;
    for class in unit.into_classes() {
        for decl in &class.methods {
            if method.is_some_and(|name| decl.method.name != name) {
                continue;
            }
            let Some(code) = &decl.code else {
                continue;
            };
            let text = match stage {
                Stage::Cfg => cfg::build(code)?.to_string(),
                Stage::Ssa => {
                    let mut ssa = ssa::build(cfg::build(code)?)?;
                    optimize(&mut ssa, &config.optimizer)?;
                    ssa.to_string()
                }
                Stage::Rop => compile_method(code, &config.optimizer)?.to_string(),
            };
            if shown > 0 {
                println!();
            }
            println!("; {}", decl.method);
            print!("{text}");
            shown += 1;
        }
    }
    if shown == 0 {
        if let Some(name) = method {
            bail!("the trampoline of {member} has no method named {name}");
        }
    }
    Ok(())
}
