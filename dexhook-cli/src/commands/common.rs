use std::path::Path;

use anyhow::Context;
use dexhook::{
    dex::DexFile, MemberDescriptor, OptimizerConfig, TrampolineCompiler, TrampolineConfig,
};

use crate::app::CompileOptions;

/// Parse a member signature given on the command line.
pub fn parse_member(text: &str) -> anyhow::Result<MemberDescriptor> {
    MemberDescriptor::parse(text).with_context(|| format!("invalid member signature: {text}"))
}

/// Translate the command-line compile options into a trampoline configuration.
pub fn trampoline_config(opts: &CompileOptions) -> TrampolineConfig {
    let optimizer = if opts.no_optimize {
        OptimizerConfig::disabled()
    } else {
        OptimizerConfig::default()
    };
    let mut config = TrampolineConfig::default()
        .with_class_prefix(opts.prefix.clone())
        .with_optimizer(optimizer)
        .with_retry_backup(opts.retry_backup)
        .with_trace_invocations(opts.trace);
    if let Some(dir) = &opts.cache_dir {
        config = config.with_cache_dir(dir.clone());
    }
    config
}

/// Build a compiler from the command-line compile options.
pub fn compiler(opts: &CompileOptions) -> anyhow::Result<TrampolineCompiler> {
    TrampolineCompiler::new(trampoline_config(opts)).context("invalid compiler configuration")
}

/// Read and parse a unit from disk.
pub fn load_unit(path: &Path) -> anyhow::Result<DexFile> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    DexFile::parse(&data).with_context(|| format!("failed to parse unit: {}", path.display()))
}
