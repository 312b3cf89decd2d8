//! Flow Compiler Library
//!
//! Compiles Flow source text into an executable [`flow_vm::Program`]:
//!
//! ```text
//! source --parse--> Unit --generate_ir--> IRProgram --optimise-->
//!   IRProgram --codegen--> Program --link--> runnable
//! ```
//!
//! The host supplies a [`flow_vm::Runtime`] with the native functions
//! and handlers scripts may call; the parser consults it for signature
//! checking, and `Program::link` resolves the references before
//! execution.

pub mod ast;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod parser;
pub mod passes;
pub mod sema;
pub mod tcg;

pub use ast::Unit;
pub use ir::IRProgram;
pub use irgen::generate_ir;
pub use parser::parse;
pub use passes::PassManager;
pub use tcg::{codegen, CodegenError};

use flow_core::{DiagnosticReport, Severity, SourceLocation};
use flow_vm::{Program, Runtime};

/// Runs the standard optimisation passes to a fixed point.
pub fn optimise(program: &mut IRProgram) {
    PassManager::standard().run(program);
}

/// The full pipeline: parse, lower, optionally optimise, and generate
/// bytecode. Diagnostics land in `report`; `None` means the source
/// did not compile.
pub fn compile(
    source: &str,
    filename: &str,
    runtime: &mut Runtime,
    exports: &[String],
    optimised: bool,
    report: &mut DiagnosticReport,
) -> Option<Program> {
    let unit = parser::parse(source, filename, runtime, report)?;
    let mut ir = irgen::generate_ir(&unit, runtime, exports, report)?;
    if optimised {
        optimise(&mut ir);
    }
    let program = match tcg::codegen(&ir) {
        Ok(program) => program,
        Err(e) => {
            report.report(
                Severity::LinkError,
                SourceLocation::at_start(filename),
                e.to_string(),
            );
            return None;
        }
    };

    // generated code must satisfy the static validity rules
    if let Err(e) = program.verify() {
        for message in e.messages {
            report.report(
                Severity::LinkError,
                SourceLocation::at_start(filename),
                message,
            );
        }
        return None;
    }

    Some(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::LiteralType;

    fn stub_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_handler("pass").bind(|params| {
            params.set_handled(true);
        });
        runtime
            .register_function("req.path", LiteralType::String)
            .bind(|_| {});
        runtime
    }

    #[test]
    fn test_compile_pipeline_produces_linkable_program() {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        let mut program = compile(
            "handler main { var x = 2; if x + 3 == 5 then pass; }",
            "test.flow",
            &mut runtime,
            &[],
            true,
            &mut report,
        )
        .unwrap_or_else(|| panic!("{}", report));

        program.link(&runtime).unwrap();
        assert!(program.find_handler("main").is_some());
    }

    #[test]
    fn test_compile_reports_parse_errors() {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        assert!(compile(
            "handler main { if then; }",
            "test.flow",
            &mut runtime,
            &[],
            true,
            &mut report,
        )
        .is_none());
        assert!(report.has_errors());
    }

    #[test]
    fn test_optimised_and_unoptimised_agree_on_shape() {
        let source = "handler main { if \"a\" + \"b\" == \"ab\" then pass; }";
        for optimised in [false, true] {
            let mut runtime = stub_runtime();
            let mut report = DiagnosticReport::new();
            let mut program = compile(
                source,
                "test.flow",
                &mut runtime,
                &[],
                optimised,
                &mut report,
            )
            .unwrap_or_else(|| panic!("{}", report));
            program.link(&runtime).unwrap();
            assert!(program.find_handler("main").is_some());
        }
    }
}
