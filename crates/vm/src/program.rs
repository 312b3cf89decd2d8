//! The immutable bytecode program.

use crate::instruction::{self, Instruction, Opcode};
use crate::matching::{MatchDef, Matcher};
use crate::pool::ConstantPool;
use crate::runtime::Runtime;
use flow_core::Signature;
use std::fmt;
use std::fmt::Write as _;
use tracing::debug;

/// One compiled handler: a name, the operand-stack size its code was
/// generated for, and a flat instruction vector.
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub stack_size: usize,
    pub code: Vec<Instruction>,
}

/// Raised by [`Program::link`] when referenced natives are missing or
/// a match table is corrupt. The program stays unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    pub messages: Vec<String>,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.messages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

impl std::error::Error for LinkError {}

/// The artifact produced by target-code generation: constant pool,
/// handlers, match tables, and the signatures of every native callable
/// referenced by index from the code.
#[derive(Debug)]
pub struct Program {
    pool: ConstantPool,
    handlers: Vec<Handler>,
    match_defs: Vec<MatchDef>,
    native_functions: Vec<Signature>,
    native_handlers: Vec<Signature>,
    modules: Vec<(String, Option<String>)>,

    // populated by link()
    matchers: Vec<Matcher>,
    linked_functions: Vec<usize>,
    linked_handlers: Vec<usize>,
    linked: bool,
}

impl Program {
    pub fn new(
        pool: ConstantPool,
        handlers: Vec<Handler>,
        match_defs: Vec<MatchDef>,
        native_functions: Vec<Signature>,
        native_handlers: Vec<Signature>,
        modules: Vec<(String, Option<String>)>,
    ) -> Self {
        Program {
            pool,
            handlers,
            match_defs,
            native_functions,
            native_handlers,
            modules,
            matchers: Vec::new(),
            linked_functions: Vec::new(),
            linked_handlers: Vec::new(),
            linked: false,
        }
    }

    /// Resolves every referenced native signature against `runtime`
    /// and builds the match tables. Must be called once before any
    /// Runner is created.
    pub fn link(&mut self, runtime: &Runtime) -> Result<(), LinkError> {
        let mut messages = Vec::new();

        self.linked_functions.clear();
        for sig in &self.native_functions {
            match runtime.index_of(sig, false) {
                Some(index) => self.linked_functions.push(index),
                None => messages.push(format!("unresolved native function: {}", sig)),
            }
        }

        self.linked_handlers.clear();
        for sig in &self.native_handlers {
            match runtime.index_of(sig, true) {
                Some(index) => self.linked_handlers.push(index),
                None => messages.push(format!("unresolved native handler: {}", sig)),
            }
        }

        self.matchers.clear();
        for (i, def) in self.match_defs.iter().enumerate() {
            match Matcher::build(def, &self.pool) {
                Some(matcher) => self.matchers.push(matcher),
                None => messages.push(format!("match table {} references a dangling label", i)),
            }
        }

        if !messages.is_empty() {
            return Err(LinkError { messages });
        }

        debug!(
            handlers = self.handlers.len(),
            functions = self.native_functions.len(),
            "program linked"
        );
        self.linked = true;
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn handler(&self, index: usize) -> Option<&Handler> {
        self.handlers.get(index)
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    pub fn match_def(&self, index: usize) -> Option<&MatchDef> {
        self.match_defs.get(index)
    }

    pub fn matcher(&self, index: usize) -> Option<&Matcher> {
        self.matchers.get(index)
    }

    pub fn native_function_signature(&self, index: usize) -> Option<&Signature> {
        self.native_functions.get(index)
    }

    pub fn native_handler_signature(&self, index: usize) -> Option<&Signature> {
        self.native_handlers.get(index)
    }

    /// Runtime callback index for native-function reference `index`.
    pub fn linked_function(&self, index: usize) -> Option<usize> {
        self.linked_functions.get(index).copied()
    }

    /// Runtime callback index for native-handler reference `index`.
    pub fn linked_handler(&self, index: usize) -> Option<usize> {
        self.linked_handlers.get(index).copied()
    }

    pub fn modules(&self) -> &[(String, Option<String>)] {
        &self.modules
    }

    /// Static validation of generated code: every operand must
    /// reference a valid constant-pool entry, a stack slot within the
    /// handler's declared stack size, a code PC within the handler, or
    /// a registered native/match table. Compilers run this on their
    /// output; hand-assembled programs may skip it and fault at
    /// runtime instead.
    pub fn verify(&self) -> Result<(), LinkError> {
        let mut messages = Vec::new();

        for (handler_index, handler) in self.handlers.iter().enumerate() {
            for (pc, &instr) in handler.code.iter().enumerate() {
                self.verify_instr(handler, handler_index, pc, instr, &mut messages);
            }
        }

        for (index, def) in self.match_defs.iter().enumerate() {
            let Some(handler) = self.handlers.get(def.handler_id) else {
                messages.push(format!(
                    "match table {} references missing handler {}",
                    index, def.handler_id
                ));
                continue;
            };
            if def.else_pc >= handler.code.len() {
                messages.push(format!(
                    "match table {} else target {} is outside handler '{}'",
                    index, def.else_pc, handler.name
                ));
            }
            for case in &def.cases {
                if case.pc >= handler.code.len() {
                    messages.push(format!(
                        "match table {} case target {} is outside handler '{}'",
                        index, case.pc, handler.name
                    ));
                }
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(LinkError { messages })
        }
    }

    fn verify_instr(
        &self,
        handler: &Handler,
        handler_index: usize,
        pc: usize,
        instr: Instruction,
        messages: &mut Vec<String>,
    ) {
        let mut bad = |what: String| {
            messages.push(format!(
                "handler #{} '{}' pc {}: {}",
                handler_index, handler.name, pc, what
            ));
        };

        let byte = instruction::opcode_byte(instr);
        let Some(op) = Opcode::from_u8(byte) else {
            bad(format!("unknown opcode 0x{:02x}", byte));
            return;
        };
        let a = instruction::operand_a(instr);
        let b = instruction::operand_b(instr);

        match op {
            Opcode::Jmp | Opcode::Jn | Opcode::Jz => {
                if a as usize >= handler.code.len() {
                    bad(format!("jump target {} out of code range", a));
                }
            }
            Opcode::Load | Opcode::Store => {
                if a as usize >= handler.stack_size {
                    bad(format!("slot {} outside stack size {}", a, handler.stack_size));
                }
            }
            Opcode::Mov => {
                if a as usize >= handler.stack_size || b as usize >= handler.stack_size {
                    bad(format!(
                        "slots {}/{} outside stack size {}",
                        a, b, handler.stack_size
                    ));
                }
            }
            Opcode::NLoad => {
                if self.pool.number(a).is_none() {
                    bad(format!("number constant {} missing", a));
                }
            }
            Opcode::SLoad => {
                if self.pool.string(a).is_none() {
                    bad(format!("string constant {} missing", a));
                }
            }
            Opcode::PLoad => {
                if self.pool.ipaddr(a).is_none() {
                    bad(format!("ipaddr constant {} missing", a));
                }
            }
            Opcode::CLoad => {
                if self.pool.cidr(a).is_none() {
                    bad(format!("cidr constant {} missing", a));
                }
            }
            Opcode::SRegMatch => {
                if self.pool.regexp(a).is_none() {
                    bad(format!("regexp constant {} missing", a));
                }
            }
            Opcode::ITLoad => {
                if self.pool.int_array(a).is_none() {
                    bad(format!("int array constant {} missing", a));
                }
            }
            Opcode::STLoad => {
                if self.pool.string_array(a).is_none() {
                    bad(format!("string array constant {} missing", a));
                }
            }
            Opcode::PTLoad => {
                if self.pool.ipaddr_array(a).is_none() {
                    bad(format!("ipaddr array constant {} missing", a));
                }
            }
            Opcode::CTLoad => {
                if self.pool.cidr_array(a).is_none() {
                    bad(format!("cidr array constant {} missing", a));
                }
            }
            Opcode::SMatchEq | Opcode::SMatchBeg | Opcode::SMatchEnd | Opcode::SMatchR => {
                if self.match_defs.get(a as usize).is_none() {
                    bad(format!("match table {} missing", a));
                }
            }
            Opcode::Call => {
                if self.native_functions.get(a as usize).is_none() {
                    bad(format!("native function reference {} missing", a));
                }
            }
            Opcode::Handler => {
                if self.native_handlers.get(a as usize).is_none() {
                    bad(format!("native handler reference {} missing", a));
                }
            }
            _ => {}
        }
    }

    /// Human-readable listing of every handler's code.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, handler) in self.handlers.iter().enumerate() {
            let _ = writeln!(
                out,
                "handler #{} {} (stack size {})",
                i, handler.name, handler.stack_size
            );
            for (pc, instr) in handler.code.iter().enumerate() {
                let _ = writeln!(out, "{}", instruction::disassemble(*instr, pc));
            }
            let _ = writeln!(out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{make_instr, Opcode};
    use flow_core::LiteralType;

    fn tiny_program() -> Program {
        let handler = Handler {
            name: "main".to_string(),
            stack_size: 2,
            code: vec![make_instr(Opcode::Exit, 0, 0, 0)],
        };
        Program::new(
            ConstantPool::new(),
            vec![handler],
            Vec::new(),
            vec![Signature::new(
                "log",
                LiteralType::Void,
                vec![LiteralType::String],
            )],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_link_fails_on_missing_native() {
        let mut program = tiny_program();
        let runtime = Runtime::new();
        let err = program.link(&runtime).unwrap_err();
        assert!(err.messages[0].contains("log(String): Void"));
        assert!(!program.is_linked());
    }

    #[test]
    fn test_link_resolves_natives() {
        let mut program = tiny_program();
        let mut runtime = Runtime::new();
        runtime
            .register_function("log", LiteralType::Void)
            .param(LiteralType::String, "message")
            .bind(|_| {});

        program.link(&runtime).unwrap();
        assert!(program.is_linked());
        assert_eq!(program.linked_function(0), Some(0));
    }

    #[test]
    fn test_find_handler() {
        let program = tiny_program();
        assert_eq!(program.find_handler("main"), Some(0));
        assert_eq!(program.find_handler("other"), None);
    }

    #[test]
    fn test_dump_contains_mnemonics() {
        let program = tiny_program();
        let dump = program.dump();
        assert!(dump.contains("handler #0 main"));
        assert!(dump.contains("EXIT"));
    }

    #[test]
    fn test_verify_accepts_tiny_program() {
        assert!(tiny_program().verify().is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_references() {
        let handler = Handler {
            name: "main".to_string(),
            stack_size: 1,
            code: vec![
                make_instr(Opcode::Jmp, 40, 0, 0),
                make_instr(Opcode::Store, 3, 0, 0),
                make_instr(Opcode::SLoad, 9, 0, 0),
                make_instr(Opcode::Exit, 0, 0, 0),
            ],
        };
        let program = Program::new(
            ConstantPool::new(),
            vec![handler],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let err = program.verify().unwrap_err();
        assert_eq!(err.messages.len(), 3);
        assert!(err.messages[0].contains("jump target 40"));
        assert!(err.messages[1].contains("slot 3"));
        assert!(err.messages[2].contains("string constant 9"));
    }

    #[test]
    fn test_verify_checks_match_tables() {
        let handler = Handler {
            name: "main".to_string(),
            stack_size: 1,
            code: vec![make_instr(Opcode::Exit, 0, 0, 0)],
        };
        let program = Program::new(
            ConstantPool::new(),
            vec![handler],
            vec![crate::matching::MatchDef {
                op: crate::matching::MatchClass::Same,
                handler_id: 0,
                cases: vec![crate::matching::MatchCaseDef { label: 0, pc: 12 }],
                else_pc: 0,
            }],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let err = program.verify().unwrap_err();
        assert!(err.messages[0].contains("case target 12"));
    }
}
