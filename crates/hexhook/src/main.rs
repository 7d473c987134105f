//! hexhook - calling-convention instrumentation driver
//!
//! Usage:
//!   hexhook <program.json>                     Instrument and print the IR
//!   hexhook <program.json> -c cdecl            Assume cdecl for unknown callees
//!   hexhook <program.json> emit                Emit pseudo-source
//!   hexhook <program.json> report --json       Summarize the hooks placed

mod input;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use hexhook_analysis::{AnalysisConfig, Context, Convention, Hooks, ScheduleStats, Scheduler};
use hexhook_core::{Function, HookKind};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hexhook")]
#[command(about = "Calling-convention instrumentation for lifted programs", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the program description (JSON)
    program: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Convention assumed for callees without one
    #[arg(short, long)]
    convention: Option<String>,

    /// Assume the architecture's platform convention when -c is not given
    #[arg(long)]
    platform_default: bool,

    /// Also guess conventions for indirect calls
    #[arg(long)]
    guess_indirect: bool,

    /// Maximum instrumentation passes
    #[arg(short, long, default_value = "8")]
    iterations: usize,

    /// Compute dataflow on a single thread
    #[arg(long)]
    sequential: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrumented IR (default)
    Ir,
    /// Deinstrument and print pseudo-source
    Emit,
    /// Summarize instrumentation per function
    Report {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List the built-in conventions
    Conventions,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Some(Commands::Conventions) = cli.command {
        print_conventions();
        return Ok(());
    }

    let loaded = input::load(&cli.program)?;
    info!(
        "loaded {} ({}), {} blocks",
        loaded.module.name,
        loaded.module.architecture,
        loaded.program.blocks().count()
    );

    let mut ctx = Context::new();
    ctx.set_module(loaded.module);
    ctx.set_program(loaded.program);
    ctx.set_conventions(loaded.conventions.into_shared());
    ctx.set_signatures(loaded.signatures.into_shared());

    let mut config = AnalysisConfig::default()
        .with_max_iterations(cli.iterations)
        .with_parallel_dataflow(!cli.sequential)
        .with_architecture_default(cli.platform_default)
        .with_indirect_guessing(cli.guess_indirect);
    if let Some(name) = &cli.convention {
        if Convention::preset(name).is_none() {
            anyhow::bail!(
                "unknown convention {:?}; expected one of {}",
                name,
                Convention::preset_names().join(", ")
            );
        }
        config = config.with_default_convention(name.clone());
    }
    if let Some(Commands::Emit) = cli.command {
        config = config.for_emission();
    }

    let stats = Scheduler::new(config)
        .run(&mut ctx)
        .context("Instrumentation failed")?;

    match cli.command {
        None | Some(Commands::Ir) => print_ir(&ctx, &stats),
        Some(Commands::Emit) => match ctx.tree() {
            Some(tree) => print!("{}", tree),
            None => println!("No output"),
        },
        Some(Commands::Report { json }) => {
            let report = Report::build(&ctx, &stats);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
        }
        Some(Commands::Conventions) => {}
    }

    Ok(())
}

fn print_conventions() {
    println!("Built-in conventions");
    println!("{}", "=".repeat(50));
    for name in Convention::preset_names() {
        if let Some(conv) = Convention::preset(name) {
            println!(
                "  {:<12} {:<7} {} register args, {}",
                conv.name,
                conv.architecture.name(),
                conv.register_arguments.len(),
                if conv.is_callee_cleanup() {
                    "callee cleans"
                } else {
                    "caller cleans"
                }
            );
        }
    }
}

fn print_ir(ctx: &Context, stats: &ScheduleStats) {
    let Some(functions) = ctx.functions() else {
        return;
    };
    for function in functions.iter() {
        println!("{} @ {:#x}", function.name(), function.entry_address().unwrap_or(0));
        let multi_block = function.blocks().len() > 1;
        for block in function.blocks() {
            if multi_block {
                println!("  {}:", block.id);
            }
            for stmt in &block.statements {
                println!("    {}", stmt);
            }
        }
        println!();
    }
    println!(
        "{} passes{}, {} hooks attached, {} unresolved",
        stats.iterations,
        if stats.converged { "" } else { " (not converged)" },
        stats.instrument.attached,
        stats.instrument.unresolved
    );
}

#[derive(Serialize)]
struct FunctionReport {
    name: String,
    entry: Option<u64>,
    entry_hook: bool,
    call_hooks: usize,
    calls: usize,
    return_hooks: usize,
    returns: usize,
    synthetic_statements: usize,
}

#[derive(Serialize)]
struct Report {
    module: Option<String>,
    iterations: usize,
    converged: bool,
    hooks_cached: usize,
    hooks_active: usize,
    unresolved: usize,
    functions: Vec<FunctionReport>,
}

impl Report {
    fn build(ctx: &Context, stats: &ScheduleStats) -> Self {
        let hooks = ctx.hooks();
        let functions = ctx
            .functions()
            .map(|functions| {
                functions
                    .iter()
                    .map(|f| function_report(f, hooks))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            module: ctx.module().map(|m| m.name.clone()),
            iterations: stats.iterations,
            converged: stats.converged,
            hooks_cached: hooks.map_or(0, Hooks::cached_hook_count),
            hooks_active: hooks.map_or(0, Hooks::active_hook_count),
            unresolved: stats.instrument.unresolved,
            functions,
        }
    }

    fn print(&self) {
        println!("Instrumentation Report");
        println!("======================");
        if let Some(module) = &self.module {
            println!("Module:        {}", module);
        }
        println!(
            "Passes:        {}{}",
            self.iterations,
            if self.converged { "" } else { " (not converged)" }
        );
        println!("Hooks:         {} active, {} cached", self.hooks_active, self.hooks_cached);
        println!();
        println!(
            "{:<24} {:>6} {:>8} {:>8} {:>7}",
            "Function", "Entry", "Calls", "Returns", "Stmts"
        );
        println!("{}", "-".repeat(57));
        for f in &self.functions {
            println!(
                "{:<24} {:>6} {:>8} {:>8} {:>7}",
                f.name,
                if f.entry_hook { "yes" } else { "no" },
                format!("{}/{}", f.call_hooks, f.calls),
                format!("{}/{}", f.return_hooks, f.returns),
                f.synthetic_statements
            );
        }
    }
}

fn function_report(function: &Function, hooks: Option<&Hooks>) -> FunctionReport {
    let fid = function.id();
    let calls = function.statements().filter(|s| s.is_call()).count();
    let returns = function.statements().filter(|s| s.is_return()).count();
    let attached = hooks.map(|h| h.active_hooks(fid)).unwrap_or_default();
    let count = |kind: HookKind| attached.iter().filter(|id| id.kind == kind).count();
    FunctionReport {
        name: function.name().to_string(),
        entry: function.entry_address(),
        entry_hook: count(HookKind::Entry) > 0,
        call_hooks: count(HookKind::Call),
        calls,
        return_hooks: count(HookKind::Return),
        returns,
        synthetic_statements: function.synthetic_count(),
    }
}
