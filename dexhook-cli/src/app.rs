use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// dexhook - compile method-hook trampolines into Dalvik executable units
#[derive(Debug, Parser)]
#[command(name = "dexhook", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Trampoline compilation settings shared by `synth` and `ir`.
#[derive(Debug, Args)]
pub struct CompileOptions {
    /// Name prefix of the generated class.
    #[arg(long, default_value = dexhook::trampoline::DEFAULT_CLASS_PREFIX)]
    pub prefix: String,

    /// Skip the SSA optimization passes.
    #[arg(long)]
    pub no_optimize: bool,

    /// Let the backup stub retry the original through reflection.
    #[arg(long)]
    pub retry_backup: bool,

    /// Report every invocation of the hook to the host.
    #[arg(long)]
    pub trace: bool,

    /// Persist generated units below this directory.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Compiler stage rendered by `ir`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    /// Basic blocks straight from the builder.
    Cfg,
    /// SSA form after the enabled optimization passes.
    Ssa,
    /// Register-allocated code with phis eliminated.
    Rop,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Synthesize the trampoline unit for a member.
    Synth {
        /// Member signature, e.g. `static Lcom/example/Calc;->add(IJ)J`.
        #[arg(value_name = "MEMBER")]
        member: String,

        /// Write the unit to this file.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        compile: CompileOptions,
    },

    /// Disassemble a Dalvik executable unit.
    Dump {
        /// Path to the unit.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Only show this class (descriptor, e.g. `Lcom/example/Calc;`).
        #[arg(short, long)]
        class: Option<String>,

        /// Only show methods with this name. Requires --class.
        #[arg(short, long, requires = "class")]
        method: Option<String>,
    },

    /// Print the intermediate form of a generated trampoline.
    Ir {
        /// Member signature, e.g. `Lcom/example/Calc;->run()V`.
        #[arg(value_name = "MEMBER")]
        member: String,

        /// Stage to print.
        #[arg(short, long, value_enum, default_value = "ssa")]
        stage: Stage,

        /// Only show this trampoline method (setup, backup, hook, callBackup).
        #[arg(short, long)]
        method: Option<String>,

        #[command(flatten)]
        compile: CompileOptions,
    },
}
