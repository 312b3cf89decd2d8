//! Lowers the AST into the SSA-style IR.
//!
//! One walk over each exported handler: literals intern into the
//! constant table, logical `and`/`or` lower to short-circuit diamonds
//! with a result slot, conditionals to three-block diamonds, `match`
//! to a match terminator with one block per case, and calls to user
//! handlers are inlined (recursion was rejected, so inlining
//! terminates).

use crate::ast::{
    BinaryOp, CalleeRef, Expr, HandlerId, ParamList, Stmt, UnaryOp, Unit, VarId,
};
use crate::ir::{
    BinaryIrOp, Block, BlockId, IRHandler, IRProgram, Instr, InstrId, InstrOp, IrConst,
    UnaryIrOp, ValueRef,
};
use flow_core::{DiagnosticReport, LiteralType, SourceLocation, Value};
use flow_vm::{MatchClass, Runtime};
use std::collections::HashMap;
use tracing::debug;

/// Generates IR for `unit`. Only handlers named in `exports` (all
/// handlers when empty) become entries. Returns `None` when errors
/// were reported.
pub fn generate_ir(
    unit: &Unit,
    runtime: &Runtime,
    exports: &[String],
    report: &mut DiagnosticReport,
) -> Option<IRProgram> {
    let initial_errors = report.error_count();
    let mut program = IRProgram::new();
    program.modules = unit.modules.clone();

    let entries: Vec<HandlerId> = unit
        .handlers
        .iter()
        .enumerate()
        .filter(|(_, h)| {
            h.body.is_some() && (exports.is_empty() || exports.iter().any(|e| e == &h.name))
        })
        .map(|(i, _)| i)
        .collect();

    for entry in entries {
        let mut generator = IRGenerator {
            unit,
            runtime,
            report: &mut *report,
            program: &mut program,
            handler: IRHandler::new(unit.handlers[entry].name.clone()),
            current_block: 0,
            vars: HashMap::new(),
            handler_stack: vec![entry],
        };
        generator.generate(entry);
        let handler = generator.handler;
        if let Err(message) = handler.verify() {
            report.type_error(
                unit.handlers[entry].location.clone(),
                format!("internal error: malformed IR: {}", message),
            );
        }
        program.handlers.push(handler);
    }

    if report.error_count() > initial_errors {
        None
    } else {
        debug!(handlers = program.handlers.len(), "generated IR");
        Some(program)
    }
}

struct IRGenerator<'a, 'r> {
    unit: &'a Unit,
    runtime: &'a Runtime,
    report: &'r mut DiagnosticReport,
    program: &'r mut IRProgram,
    handler: IRHandler,
    current_block: BlockId,
    /// Variable -> its alloca instruction.
    vars: HashMap<VarId, InstrId>,
    /// Inlining stack for recursion detection.
    handler_stack: Vec<HandlerId>,
}

impl<'a, 'r> IRGenerator<'a, 'r> {
    fn generate(&mut self, entry: HandlerId) {
        self.current_block = self.new_block("entry");

        // unit-scope variables are (re)initialised per handler run;
        // unused ones fall to the optimiser
        for &global in &self.unit.globals {
            self.lower_var_decl(global);
        }

        let body = self
            .unit
            .handlers
            .get(entry)
            .and_then(|h| h.body.as_ref());
        if let Some(body) = body {
            self.lower_stmt(body);
        }

        // epilogue: every open block returns "not handled"
        for block in 0..self.handler.blocks.len() {
            if self.handler.terminator_of(block).is_none() {
                let id = self.push_instr(InstrOp::Ret { handled: false }, LiteralType::Void, "");
                self.handler.blocks[block].instrs.push(id);
            }
        }
    }

    // ---- builder primitives ----

    fn new_block(&mut self, label: &str) -> BlockId {
        self.handler.blocks.push(Block {
            label: label.to_string(),
            instrs: Vec::new(),
        });
        self.handler.blocks.len() - 1
    }

    fn set_insert(&mut self, block: BlockId) {
        self.current_block = block;
    }

    fn push_instr(&mut self, op: InstrOp, ty: LiteralType, label: &str) -> InstrId {
        self.handler.instrs.push(Instr {
            op,
            ty,
            label: label.to_string(),
        });
        self.handler.instrs.len() - 1
    }

    fn emit(&mut self, op: InstrOp, ty: LiteralType, label: &str) -> InstrId {
        // appending past a terminator would be malformed; divert to a
        // dead block instead
        if self.handler.terminator_of(self.current_block).is_some() {
            let dead = self.new_block("unreachable");
            self.set_insert(dead);
        }
        let id = self.push_instr(op, ty, label);
        self.handler.blocks[self.current_block].instrs.push(id);
        id
    }

    fn get_const(&mut self, value: IrConst) -> ValueRef {
        ValueRef::Const(self.program.intern(value))
    }

    fn value_ty(&self, value: ValueRef) -> LiteralType {
        self.program.value_ty(&self.handler, value)
    }

    // ---- statements ----

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.lower_expr(expr);
            }
            Stmt::Compound { statements, .. } => {
                for s in statements {
                    self.lower_stmt(s);
                }
            }
            Stmt::VarDecl { var, .. } => {
                self.lower_var_decl(*var);
            }
            Stmt::Assign { var, value, .. } => {
                let Some(value) = self.lower_expr(value) else {
                    return;
                };
                let Some(&slot) = self.vars.get(var) else {
                    return;
                };
                self.emit(
                    InstrOp::Store {
                        target: ValueRef::Instr(slot),
                        value,
                    },
                    LiteralType::Void,
                    "assignment",
                );
            }
            Stmt::Cond {
                condition,
                then_branch,
                else_branch,
                ..
            } => self.lower_cond(condition, then_branch, else_branch.as_deref()),
            Stmt::Match {
                subject,
                op,
                cases,
                else_branch,
                location,
            } => self.lower_match(subject, *op, cases, else_branch.as_deref(), location),
        }
    }

    fn lower_var_decl(&mut self, var: VarId) {
        let decl = self.unit.variable(var);
        let name = decl.name.clone();
        let ty = decl.ty;
        let slot = self.emit(InstrOp::Alloca, ty, &name);
        self.vars.insert(var, slot);

        if let Some(value) = self.lower_expr(&self.unit.variable(var).initializer) {
            self.emit(
                InstrOp::Store {
                    target: ValueRef::Instr(slot),
                    value,
                },
                LiteralType::Void,
                &name,
            );
        }
    }

    fn lower_cond(&mut self, condition: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) {
        let Some(condition) = self.lower_expr(condition) else {
            return;
        };

        let true_block = self.new_block("trueBlock");
        let false_block = self.new_block("falseBlock");
        let cont_block = self.new_block("contBlock");

        self.emit(
            InstrOp::CondBr {
                condition,
                true_block,
                false_block,
            },
            LiteralType::Void,
            "",
        );

        self.set_insert(true_block);
        self.lower_stmt(then_branch);
        self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");

        self.set_insert(false_block);
        if let Some(else_branch) = else_branch {
            self.lower_stmt(else_branch);
        }
        self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");

        self.set_insert(cont_block);
    }

    fn lower_match(
        &mut self,
        subject: &Expr,
        op: MatchClass,
        cases: &[crate::ast::MatchCase],
        else_branch: Option<&Stmt>,
        location: &SourceLocation,
    ) {
        let Some(condition) = self.lower_expr(subject) else {
            return;
        };

        let cont_block = self.new_block("match.cont");

        // collect (label constant, body block) pairs up front; the
        // match terminator must land in the current block
        let mut lowered_cases = Vec::new();
        let mut body_blocks = Vec::new();
        for case in cases {
            let body_block = self.new_block("match.case");
            body_blocks.push(body_block);
            for label in &case.labels {
                match self.match_label_const(label, op) {
                    Some(constant) => lowered_cases.push((constant, body_block)),
                    None => {
                        self.report.type_error(
                            location.clone(),
                            "match case label must be a constant".to_string(),
                        );
                    }
                }
            }
        }

        let else_block = if else_branch.is_some() {
            self.new_block("match.else")
        } else {
            cont_block
        };

        self.emit(
            InstrOp::Match {
                class: op,
                condition,
                cases: lowered_cases,
                else_block,
            },
            LiteralType::Void,
            "",
        );

        for (case, &body_block) in cases.iter().zip(&body_blocks) {
            self.set_insert(body_block);
            self.lower_stmt(&case.body);
            self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");
        }

        if let Some(else_branch) = else_branch {
            self.set_insert(else_block);
            self.lower_stmt(else_branch);
            self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");
        }

        self.set_insert(cont_block);
    }

    fn match_label_const(&mut self, label: &Expr, op: MatchClass) -> Option<usize> {
        let Expr::Literal { value, .. } = label else {
            return None;
        };
        let constant = match (op, value) {
            (MatchClass::RegExp, Value::RegExp(re)) => IrConst::RegExp(re.clone()),
            (_, Value::String(s)) => IrConst::String(s.clone()),
            _ => return None,
        };
        Some(self.program.intern(constant))
    }

    // ---- expressions ----

    fn lower_expr(&mut self, expr: &Expr) -> Option<ValueRef> {
        match expr {
            Expr::Literal { value, .. } => self.lower_literal(value),
            Expr::Variable { id, ty, .. } => {
                let &slot = self.vars.get(id)?;
                Some(ValueRef::Instr(self.emit(
                    InstrOp::Load {
                        source: ValueRef::Instr(slot),
                    },
                    *ty,
                    &self.unit.variable(*id).name.clone(),
                )))
            }
            Expr::RegexGroup { index, .. } => {
                let index = self.get_const(IrConst::Number(*index));
                Some(ValueRef::Instr(self.emit(
                    InstrOp::RegexGroup { index },
                    LiteralType::String,
                    "capture",
                )))
            }
            Expr::Unary { op, operand, .. } => {
                let operand = self.lower_expr(operand)?;
                let (ir_op, ty) = match op {
                    UnaryOp::Neg => (UnaryIrOp::NNeg, LiteralType::Number),
                    UnaryOp::BitNot => (UnaryIrOp::NNot, LiteralType::Number),
                    UnaryOp::Not => (UnaryIrOp::BNot, LiteralType::Boolean),
                };
                Some(ValueRef::Instr(self.emit(
                    InstrOp::Unary { op: ir_op, operand },
                    ty,
                    "",
                )))
            }
            Expr::Cast {
                target, operand, ..
            } => {
                let source = self.lower_expr(operand)?;
                if self.value_ty(source) == *target {
                    return Some(source);
                }
                Some(ValueRef::Instr(self.emit(
                    InstrOp::Cast { source },
                    *target,
                    "",
                )))
            }
            Expr::Binary {
                op,
                lhs,
                rhs,
                ty,
                location,
            } => self.lower_binary(*op, lhs, rhs, *ty, location),
            Expr::Array {
                elements,
                ty,
                location,
            } => self.lower_array(elements, *ty, location),
            Expr::Call {
                callee,
                args,
                location,
                ..
            } => self.lower_call(*callee, args, location),
        }
    }

    fn lower_literal(&mut self, value: &Value) -> Option<ValueRef> {
        let constant = match value {
            Value::Bool(b) => IrConst::Boolean(*b),
            Value::Number(n) => IrConst::Number(*n),
            Value::String(s) => IrConst::String(s.clone()),
            Value::IPAddress(ip) => IrConst::IPAddress(*ip),
            Value::Cidr(c) => IrConst::Cidr(*c),
            Value::RegExp(re) => IrConst::RegExp(re.clone()),
            Value::IntArray(xs) => IrConst::IntArray(xs.clone()),
            Value::StringArray(xs) => IrConst::StringArray(xs.clone()),
            Value::IPAddrArray(xs) => IrConst::IPAddrArray(xs.clone()),
            Value::CidrArray(xs) => IrConst::CidrArray(xs.clone()),
        };
        Some(self.get_const(constant))
    }

    /// Short-circuit lowering for boolean `and`/`or`: a two-armed
    /// diamond storing into a result slot.
    fn lower_short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<ValueRef> {
        let name = if op == BinaryOp::And { "band" } else { "bor" };

        let result = self.emit(InstrOp::Alloca, LiteralType::Boolean, name);
        let lhs = self.lower_expr(lhs)?;

        let short_block = self.new_block(&format!("{}.short", name));
        let rhs_block = self.new_block(&format!("{}.rhs", name));
        let cont_block = self.new_block(&format!("{}.cont", name));

        // `or` short-circuits when the lhs is true, `and` when it is
        // false
        let (true_block, false_block) = if op == BinaryOp::Or {
            (short_block, rhs_block)
        } else {
            (rhs_block, short_block)
        };
        self.emit(
            InstrOp::CondBr {
                condition: lhs,
                true_block,
                false_block,
            },
            LiteralType::Void,
            "",
        );

        self.set_insert(short_block);
        self.emit(
            InstrOp::Store {
                target: ValueRef::Instr(result),
                value: lhs,
            },
            LiteralType::Void,
            name,
        );
        self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");

        self.set_insert(rhs_block);
        let rhs = self.lower_expr(rhs)?;
        self.emit(
            InstrOp::Store {
                target: ValueRef::Instr(result),
                value: rhs,
            },
            LiteralType::Void,
            name,
        );
        self.emit(InstrOp::Br { target: cont_block }, LiteralType::Void, "");

        self.set_insert(cont_block);
        Some(ValueRef::Instr(self.emit(
            InstrOp::Load {
                source: ValueRef::Instr(result),
            },
            LiteralType::Boolean,
            name,
        )))
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs_expr: &Expr,
        rhs_expr: &Expr,
        ty: LiteralType,
        location: &SourceLocation,
    ) -> Option<ValueRef> {
        use LiteralType as T;

        let operand_ty = lhs_expr.ty();

        if matches!(op, BinaryOp::And | BinaryOp::Or) && operand_ty == T::Boolean {
            return self.lower_short_circuit(op, lhs_expr, rhs_expr);
        }

        // `in` loads the haystack first so the needle sits on top
        if op == BinaryOp::In && operand_ty == T::String {
            let needle = self.lower_expr(lhs_expr)?;
            let haystack = self.lower_expr(rhs_expr)?;
            return Some(ValueRef::Instr(self.emit(
                InstrOp::Binary {
                    op: BinaryIrOp::SContains,
                    lhs: haystack,
                    rhs: needle,
                },
                T::Boolean,
                "",
            )));
        }

        let lhs = self.lower_expr(lhs_expr)?;
        let rhs = self.lower_expr(rhs_expr)?;

        // the operator table keys on (operator, operand type)
        let ir_op = match (op, operand_ty) {
            (BinaryOp::And, T::Number) => BinaryIrOp::NAnd,
            (BinaryOp::Or, T::Number) => BinaryIrOp::NOr,
            (BinaryOp::Xor, T::Number) => BinaryIrOp::NXor,
            (BinaryOp::Xor, T::Boolean) => BinaryIrOp::BXor,
            (BinaryOp::Add, T::Number) => BinaryIrOp::NAdd,
            (BinaryOp::Sub, T::Number) => BinaryIrOp::NSub,
            (BinaryOp::Mul, T::Number) => BinaryIrOp::NMul,
            (BinaryOp::Div, T::Number) => BinaryIrOp::NDiv,
            (BinaryOp::Rem, T::Number) => BinaryIrOp::NRem,
            (BinaryOp::Shl, T::Number) => BinaryIrOp::NShl,
            (BinaryOp::Shr, T::Number) => BinaryIrOp::NShr,
            (BinaryOp::Pow, T::Number) => BinaryIrOp::NPow,
            (BinaryOp::Equal, T::Number | T::Boolean) => BinaryIrOp::NCmpEq,
            (BinaryOp::NotEqual, T::Number | T::Boolean) => BinaryIrOp::NCmpNe,
            (BinaryOp::Less, T::Number) => BinaryIrOp::NCmpLt,
            (BinaryOp::LessOrEqual, T::Number) => BinaryIrOp::NCmpLe,
            (BinaryOp::Greater, T::Number) => BinaryIrOp::NCmpGt,
            (BinaryOp::GreaterOrEqual, T::Number) => BinaryIrOp::NCmpGe,
            (BinaryOp::Add, T::String) => BinaryIrOp::SAdd,
            (BinaryOp::Equal, T::String) => BinaryIrOp::SCmpEq,
            (BinaryOp::NotEqual, T::String) => BinaryIrOp::SCmpNe,
            (BinaryOp::Less, T::String) => BinaryIrOp::SCmpLt,
            (BinaryOp::LessOrEqual, T::String) => BinaryIrOp::SCmpLe,
            (BinaryOp::Greater, T::String) => BinaryIrOp::SCmpGt,
            (BinaryOp::GreaterOrEqual, T::String) => BinaryIrOp::SCmpGe,
            (BinaryOp::PrefixMatch, T::String) => BinaryIrOp::SCmpBeg,
            (BinaryOp::SuffixMatch, T::String) => BinaryIrOp::SCmpEnd,
            (BinaryOp::RegexMatch, T::String) => {
                if !matches!(rhs, ValueRef::Const(c) if matches!(self.program.constant(c), IrConst::RegExp(_)))
                {
                    self.report.type_error(
                        location.clone(),
                        "the right-hand side of '=~' must be a regex literal".to_string(),
                    );
                    return None;
                }
                BinaryIrOp::SRegMatch
            }
            (BinaryOp::Equal, T::IPAddress) => BinaryIrOp::PCmpEq,
            (BinaryOp::NotEqual, T::IPAddress) => BinaryIrOp::PCmpNe,
            (BinaryOp::In, T::IPAddress) => BinaryIrOp::PInCidr,
            _ => {
                self.report.type_error(
                    location.clone(),
                    format!(
                        "binary operation '{}' is not implemented for {}",
                        op.describe(),
                        operand_ty
                    ),
                );
                return None;
            }
        };

        Some(ValueRef::Instr(self.emit(
            InstrOp::Binary { op: ir_op, lhs, rhs },
            ty,
            "",
        )))
    }

    fn lower_array(
        &mut self,
        elements: &[Expr],
        ty: LiteralType,
        location: &SourceLocation,
    ) -> Option<ValueRef> {
        if !elements.iter().all(Expr::is_constant) {
            self.report.type_error(
                location.clone(),
                "Variable array elements not allowed.".to_string(),
            );
            return None;
        }

        let constant = match ty {
            LiteralType::IntArray => {
                let mut xs = Vec::with_capacity(elements.len());
                for e in elements {
                    if let Expr::Literal {
                        value: Value::Number(n),
                        ..
                    } = e
                    {
                        xs.push(*n);
                    }
                }
                IrConst::IntArray(xs)
            }
            LiteralType::StringArray => {
                let mut xs = Vec::with_capacity(elements.len());
                for e in elements {
                    if let Expr::Literal {
                        value: Value::String(s),
                        ..
                    } = e
                    {
                        xs.push(s.clone());
                    }
                }
                IrConst::StringArray(xs)
            }
            LiteralType::IPAddrArray => {
                let mut xs = Vec::with_capacity(elements.len());
                for e in elements {
                    if let Expr::Literal {
                        value: Value::IPAddress(ip),
                        ..
                    } = e
                    {
                        xs.push(*ip);
                    }
                }
                IrConst::IPAddrArray(xs)
            }
            LiteralType::CidrArray => {
                let mut xs = Vec::with_capacity(elements.len());
                for e in elements {
                    if let Expr::Literal {
                        value: Value::Cidr(c),
                        ..
                    } = e
                    {
                        xs.push(*c);
                    }
                }
                IrConst::CidrArray(xs)
            }
            _ => {
                self.report.type_error(
                    location.clone(),
                    format!("array type {} is not supported", ty),
                );
                return None;
            }
        };

        Some(self.get_const(constant))
    }

    fn lower_call(
        &mut self,
        callee: CalleeRef,
        args: &ParamList,
        location: &SourceLocation,
    ) -> Option<ValueRef> {
        let ParamList::Positional(arg_exprs) = args else {
            // semantic analysis rewrites named lists; reaching here
            // means the call never matched
            return None;
        };

        let mut lowered = Vec::with_capacity(arg_exprs.len());
        for arg in arg_exprs {
            lowered.push(self.lower_expr(arg)?);
        }

        match callee {
            CalleeRef::BuiltinFunction(id) => {
                let signature = self.runtime.callback(id)?.signature().clone();
                let ty = signature.return_type();
                let callee = self.program.make_native_function(&signature);
                Some(ValueRef::Instr(self.emit(
                    InstrOp::Call {
                        callee,
                        args: lowered,
                    },
                    ty,
                    signature.name(),
                )))
            }
            CalleeRef::BuiltinHandler(id) => {
                let signature = self.runtime.callback(id)?.signature().clone();
                let callee = self.program.make_native_handler(&signature);
                self.emit(
                    InstrOp::HandlerCall {
                        callee,
                        args: lowered,
                    },
                    LiteralType::Void,
                    signature.name(),
                );
                None
            }
            CalleeRef::Handler(id) => {
                if self.handler_stack.contains(&id) {
                    self.report.type_error(
                        location.clone(),
                        format!(
                            "recursive call to handler '{}'",
                            self.unit.handlers[id].name
                        ),
                    );
                    return None;
                }
                self.handler_stack.push(id);
                if let Some(body) = self.unit.handlers[id].body.as_ref() {
                    self.lower_stmt(body);
                }
                self.handler_stack.pop();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn stub_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_handler("pass").bind(|params| {
            params.set_handled(true);
        });
        runtime
            .register_function("req.path", LiteralType::String)
            .bind(|_| {});
        runtime
            .register_function("log", LiteralType::Void)
            .param(LiteralType::String, "message")
            .bind(|_| {});
        runtime
    }

    fn lower(source: &str) -> IRProgram {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        let unit = parser::parse(source, "test.flow", &mut runtime, &mut report)
            .unwrap_or_else(|| panic!("parse failed:\n{}", report));
        generate_ir(&unit, &runtime, &[], &mut report)
            .unwrap_or_else(|| panic!("irgen failed:\n{}", report))
    }

    fn lower_err(source: &str) -> DiagnosticReport {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        let unit = parser::parse(source, "test.flow", &mut runtime, &mut report)
            .unwrap_or_else(|| panic!("parse failed:\n{}", report));
        assert!(
            generate_ir(&unit, &runtime, &[], &mut report).is_none(),
            "expected irgen failure"
        );
        report
    }

    #[test]
    fn test_simple_handler_shape() {
        let program = lower("handler main { var x = 2; if x == 2 then pass; }");
        assert_eq!(program.handlers.len(), 1);
        let handler = &program.handlers[0];
        handler.verify().unwrap();
        // entry + diamond (then/else/cont)
        assert!(handler.blocks.len() >= 4);
        assert!(program
            .native_handlers
            .iter()
            .any(|s| s.name() == "pass"));
    }

    #[test]
    fn test_exports_filter() {
        let source = "handler a { pass; }\nhandler b { pass; }";
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        let unit = parser::parse(source, "t.flow", &mut runtime, &mut report).unwrap();
        let program =
            generate_ir(&unit, &runtime, &["b".to_string()], &mut report).unwrap();
        assert_eq!(program.handlers.len(), 1);
        assert_eq!(program.handlers[0].name, "b");
    }

    #[test]
    fn test_short_circuit_or_creates_diamond() {
        let program = lower("handler main { if true or false then pass; }");
        let handler = &program.handlers[0];
        handler.verify().unwrap();
        let labels: Vec<&str> = handler.blocks.iter().map(|b| b.label.as_str()).collect();
        assert!(labels.contains(&"bor.short"));
        assert!(labels.contains(&"bor.rhs"));
        assert!(labels.contains(&"bor.cont"));
    }

    #[test]
    fn test_match_lowering() {
        let program = lower(
            r#"
handler a { pass; }
handler main {
  match req.path =^ {
    on "/x" a;
    else    pass;
  }
}
"#,
        );
        let main = program.handlers.iter().find(|h| h.name == "main").unwrap();
        main.verify().unwrap();
        let has_match = main
            .instrs
            .iter()
            .any(|i| matches!(i.op, InstrOp::Match { class: MatchClass::Head, .. }));
        assert!(has_match);
    }

    #[test]
    fn test_user_handler_inlining() {
        let program = lower("handler helper { log(\"hi\"); }\nhandler main { helper; pass; }");
        let main = program.handlers.iter().find(|h| h.name == "main").unwrap();
        // helper's native call is inlined into main
        let call_count = main
            .instrs
            .iter()
            .filter(|i| matches!(i.op, InstrOp::Call { .. }))
            .count();
        assert_eq!(call_count, 1);
    }

    #[test]
    fn test_recursion_is_rejected() {
        let report = lower_err("handler a { b; }\nhandler b { a; }");
        assert!(report.to_string().contains("recursive call"));
    }

    #[test]
    fn test_variable_array_elements_rejected() {
        let report =
            lower_err("handler main { var x = 1; var xs = [x, 2]; pass; }");
        assert!(report
            .to_string()
            .contains("Variable array elements not allowed."));
    }

    #[test]
    fn test_constant_array_interned() {
        let program = lower("handler main { var xs = [1, 2, 3]; pass; }");
        assert!(program
            .constants
            .iter()
            .any(|c| matches!(c, IrConst::IntArray(xs) if xs == &vec![1, 2, 3])));
    }

    #[test]
    fn test_regex_match_requires_literal() {
        let program = lower(
            r#"handler main { if req.path =~ /^\/a/ then pass; }"#,
        );
        let handler = &program.handlers[0];
        assert!(handler
            .instrs
            .iter()
            .any(|i| matches!(i.op, InstrOp::Binary { op: BinaryIrOp::SRegMatch, .. })));
    }

    #[test]
    fn test_globals_lowered_into_handler() {
        let program = lower("var port = 8080;\nhandler main { if port == 8080 then pass; }");
        let handler = &program.handlers[0];
        let alloca_labels: Vec<&str> = handler
            .instrs
            .iter()
            .filter(|i| matches!(i.op, InstrOp::Alloca))
            .map(|i| i.label.as_str())
            .collect();
        assert!(alloca_labels.contains(&"port"));
    }
}
