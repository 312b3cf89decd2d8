//! Flow Compiler CLI
//!
//! Checks, inspects, and runs Flow scripts against a small stub
//! runtime, for development outside an embedding host.

use clap::{Parser as ClapParser, Subcommand};
use flow_core::{DiagnosticReport, LiteralType, Value};
use flow_vm::{Runner, Runtime};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "flowc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flow compiler - check, inspect and run Flow scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and type-check a script
    Check {
        /// Input .flow source file
        input: PathBuf,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a script and dump the chosen stages
    Build {
        /// Input .flow source file
        input: PathBuf,

        /// Dump the typed AST
        #[arg(long)]
        dump_ast: bool,

        /// Dump the optimised IR
        #[arg(long)]
        dump_ir: bool,

        /// Dump the generated bytecode
        #[arg(long)]
        dump_tc: bool,

        /// Disable the optimiser
        #[arg(long)]
        no_optimise: bool,
    },

    /// Compile and execute one handler
    Run {
        /// Input .flow source file
        input: PathBuf,

        /// Entry handler name
        #[arg(short, long, default_value = "main")]
        entry: String,

        /// Disable the optimiser
        #[arg(long)]
        no_optimise: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Check { input, json } => check(&input, json),
        Commands::Build {
            input,
            dump_ast,
            dump_ir,
            dump_tc,
            no_optimise,
        } => build(&input, dump_ast, dump_ir, dump_tc, !no_optimise),
        Commands::Run {
            input,
            entry,
            no_optimise,
        } => run(&input, &entry, !no_optimise),
    };
    process::exit(code);
}

/// The builtins every script sees when run through the CLI: a logger,
/// a terminating `pass` handler and a `deny` handler.
fn stub_runtime() -> Runtime {
    let mut runtime = Runtime::new();
    runtime
        .register_function("log", LiteralType::Void)
        .param(LiteralType::String, "message")
        .bind(|params| {
            println!("{}", params.get_string(1));
        });
    runtime
        .register_function("env", LiteralType::String)
        .param(LiteralType::String, "name")
        .param_default("default", Value::String(String::new()))
        .bind(|params| {
            let value = std::env::var(params.get_string(1))
                .unwrap_or_else(|_| params.get_string(2).to_string());
            params.set_result(Value::String(value));
        });
    runtime.register_handler("pass").bind(|params| {
        params.set_handled(true);
    });
    runtime.register_handler("deny").bind(|params| {
        eprintln!("request denied");
        params.set_handled(true);
    });
    runtime
}

fn read_source(input: &PathBuf) -> Result<String, i32> {
    std::fs::read_to_string(input).map_err(|e| {
        eprintln!("flowc: cannot read {}: {}", input.display(), e);
        1
    })
}

fn print_report(report: &DiagnosticReport, json: bool) {
    if json {
        let diagnostics: Vec<_> = report.iter().collect();
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => eprintln!("flowc: cannot render diagnostics: {}", e),
        }
    } else {
        eprint!("{}", report);
    }
}

fn check(input: &PathBuf, json: bool) -> i32 {
    let Ok(source) = read_source(input) else {
        return 1;
    };
    let mut runtime = stub_runtime();
    let mut report = DiagnosticReport::new();
    let filename = input.display().to_string();

    let unit = flowc::parse(&source, &filename, &mut runtime, &mut report);
    print_report(&report, json);
    match unit {
        Some(_) => 0,
        None => 1,
    }
}

fn build(input: &PathBuf, dump_ast: bool, dump_ir: bool, dump_tc: bool, optimised: bool) -> i32 {
    let Ok(source) = read_source(input) else {
        return 1;
    };
    let mut runtime = stub_runtime();
    let mut report = DiagnosticReport::new();
    let filename = input.display().to_string();

    let result = (|| {
        let unit = flowc::parse(&source, &filename, &mut runtime, &mut report)?;
        if dump_ast {
            print!("{}", unit.to_text());
        }
        let mut ir = flowc::generate_ir(&unit, &runtime, &[], &mut report)?;
        if optimised {
            flowc::optimise(&mut ir);
        }
        if dump_ir {
            print!("{}", ir.to_text());
        }
        match flowc::codegen(&ir) {
            Ok(program) => Some(program),
            Err(e) => {
                eprintln!("flowc: {}", e);
                None
            }
        }
    })();

    print_report(&report, false);
    let Some(program) = result else {
        return 1;
    };
    if dump_tc {
        print!("{}", program.dump());
    }
    0
}

fn run(input: &PathBuf, entry: &str, optimised: bool) -> i32 {
    let Ok(source) = read_source(input) else {
        return 1;
    };
    let mut runtime = stub_runtime();
    let mut report = DiagnosticReport::new();
    let filename = input.display().to_string();

    let program = flowc::compile(
        &source,
        &filename,
        &mut runtime,
        &[entry.to_string()],
        optimised,
        &mut report,
    );
    print_report(&report, false);
    let Some(mut program) = program else {
        return 1;
    };

    if let Err(e) = program.link(&runtime) {
        eprintln!("flowc: link failed: {}", e);
        return 1;
    }

    let mut userdata = ();
    let mut runner = match Runner::new(&program, &runtime, entry, &mut userdata) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("flowc: {}", e);
            return 1;
        }
    };

    match runner.run() {
        Ok(handled) => {
            println!("{}", if handled { "handled" } else { "not handled" });
            0
        }
        Err(fault) => {
            eprintln!("flowc: vm fault: {}", fault);
            1
        }
    }
}
