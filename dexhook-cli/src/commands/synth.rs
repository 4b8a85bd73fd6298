use std::path::Path;

use anyhow::Context;
use dexhook::{dex::DexFile, dispatch::CallbackChain, vm::ObjectId, vm::Value};
use serde::Serialize;

use crate::{
    app::{CompileOptions, GlobalOptions},
    commands::common::{compiler, parse_member},
    output::{print_field, print_output},
};

#[derive(Debug, Serialize)]
pub struct SynthReport {
    pub member: String,
    pub class: String,
    pub size: usize,
    pub checksum: String,
    pub signature: String,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

pub fn run(
    member: &str,
    output: Option<&Path>,
    opts: &CompileOptions,
    global: &GlobalOptions,
) -> anyhow::Result<()> {
    let member = parse_member(member)?;
    let compiler = compiler(opts)?;
    let chain: CallbackChain<Value, ObjectId> = CallbackChain::new();
    let unit = compiler
        .synthesize(&member, &chain)
        .with_context(|| format!("failed to synthesize a trampoline for {member}"))?;

    // Re-read the unit so the report shows what a loader would see.
    let file = DexFile::parse(unit.bytes()).context("synthesized unit does not parse")?;

    if let Some(path) = output {
        std::fs::write(path, unit.bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("wrote {} bytes to {}", unit.bytes().len(), path.display());
    }

    let report = SynthReport {
        member: member.canonical(),
        class: unit.class_name().to_string(),
        size: unit.bytes().len(),
        checksum: format!("{:08x}", file.checksum()),
        signature: file.signature().iter().map(|b| format!("{b:02x}")).collect(),
        from_cache: unit.from_cache(),
        output: output.map(|p| p.display().to_string()),
    };

    print_output(&report, global, |r| {
        print_field("Member:", &r.member, 10);
        print_field("Class:", &r.class, 10);
        print_field("Size:", format!("{} bytes", r.size), 10);
        print_field("Checksum:", &r.checksum, 10);
        print_field("SHA-1:", &r.signature, 10);
        print_field("Cached:", if r.from_cache { "yes" } else { "no" }, 10);
        if let Some(path) = &r.output {
            print_field("Output:", path, 10);
        }
    })
}
