mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })?;

    let cli = Cli::parse();

    // dexhook info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("dexhook", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Synth {
            member,
            output,
            compile,
        } => commands::synth::run(member, output.as_deref(), compile, &cli.global),
        Command::Dump { path, class, method } => {
            commands::dump::run(path, class.as_deref(), method.as_deref(), &cli.global)
        }
        Command::Ir {
            member,
            stage,
            method,
            compile,
        } => commands::ir::run(member, *stage, method.as_deref(), compile),
    }
}
