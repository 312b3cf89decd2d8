//! Recursive-descent parser with inline semantic analysis.
//!
//! Names are resolved against the scope stack (then the runtime's
//! builtins) while parsing, expression result types are computed
//! bottom-up, and every call site is matched against its callee's
//! signature via [`sema::try_match`]. Syntax errors re-synchronise on
//! `;` or `}` and parsing continues; any error leaves the unit
//! unusable for IR generation.

use crate::ast::{
    BinaryOp, CalleeRef, Expr, HandlerDecl, Lookup, MatchCase, ParamList, Stmt, SymbolRef,
    UnaryOp, Unit, VarDecl, VarId,
};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::sema::{self, ScopeStack};
use flow_core::{DiagnosticReport, LiteralType, RegExp, SourceLocation, Value};
use flow_vm::{MatchClass, Runtime};
use tracing::debug;

/// Parses one source unit. Errors (and warnings) are reported into
/// `report`; `None` is returned when the unit is unusable.
pub fn parse(
    source: &str,
    filename: &str,
    runtime: &mut Runtime,
    report: &mut DiagnosticReport,
) -> Option<Unit> {
    let tokens = tokenize(source, filename, report);
    let mut parser = Parser {
        tokens,
        pos: 0,
        unit: Unit::new(filename),
        scopes: ScopeStack::new(),
        runtime,
    };
    parser.parse_unit(report);

    if report.has_errors() {
        None
    } else {
        debug!(
            handlers = parser.unit.handlers.len(),
            globals = parser.unit.globals.len(),
            "parsed unit"
        );
        Some(parser.unit)
    }
}

struct Parser<'r> {
    tokens: Vec<Token>,
    pos: usize,
    unit: Unit,
    scopes: ScopeStack,
    runtime: &'r mut Runtime,
}

impl<'r> Parser<'r> {
    // ---- token helpers ----

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn location(&self) -> SourceLocation {
        self.current().location.clone()
    }

    fn previous_location(&self) -> SourceLocation {
        self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)]
            .location
            .clone()
    }

    fn at_end(&self) -> bool {
        matches!(self.kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !self.at_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(
        &mut self,
        kind: &TokenKind,
        context: &str,
        report: &mut DiagnosticReport,
    ) -> bool {
        if self.eat(kind) {
            return true;
        }
        report.syntax_error(
            self.location(),
            format!(
                "expected {} {}, got {}",
                kind.describe(),
                context,
                self.kind().describe()
            ),
        );
        false
    }

    /// Error recovery: skip to just past the next `;`, or stop before
    /// `}` / end of file.
    fn recover(&mut self) {
        while !self.at_end() {
            match self.kind() {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- unit level ----

    fn parse_unit(&mut self, report: &mut DiagnosticReport) {
        while !self.at_end() {
            match self.kind().clone() {
                TokenKind::Import => self.parse_import(report),
                TokenKind::Var => {
                    if let Some(var) = self.parse_var_decl(report) {
                        self.unit.globals.push(var);
                    }
                }
                TokenKind::Handler => self.parse_handler(report),
                _ => {
                    report.syntax_error(
                        self.location(),
                        format!(
                            "expected 'import', 'var' or 'handler' at unit scope, got {}",
                            self.kind().describe()
                        ),
                    );
                    self.recover();
                    // a stray '}' at unit scope would stall recovery
                    if self.check(&TokenKind::RBrace) {
                        self.advance();
                    }
                }
            }
        }

        // forward-declared handlers must have been implemented by now
        for handler in &self.unit.handlers {
            if handler.body.is_none() {
                report.type_error(
                    handler.location.clone(),
                    format!(
                        "handler '{}' is called but never implemented",
                        handler.name
                    ),
                );
            }
        }
    }

    fn parse_import(&mut self, report: &mut DiagnosticReport) {
        let location = self.location();
        self.advance(); // import

        let name = match self.kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                report.syntax_error(
                    self.location(),
                    format!("expected module name after 'import', got {}", other.describe()),
                );
                self.recover();
                return;
            }
        };

        let mut path = None;
        if self.eat(&TokenKind::From) {
            match self.kind().clone() {
                TokenKind::String(p) => {
                    self.advance();
                    path = Some(p);
                }
                other => {
                    report.syntax_error(
                        self.location(),
                        format!("expected path string after 'from', got {}", other.describe()),
                    );
                    self.recover();
                    return;
                }
            }
        }
        self.expect(&TokenKind::Semicolon, "after import statement", report);

        if !self.runtime.import(&name, path.as_deref()) {
            report.link_error(location, format!("failed to import module '{}'", name));
            return;
        }
        self.unit.modules.push((name, path));
    }

    fn parse_handler(&mut self, report: &mut DiagnosticReport) {
        let location = self.location();
        self.advance(); // handler

        let name = match self.kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                report.syntax_error(
                    self.location(),
                    format!("expected handler name, got {}", other.describe()),
                );
                self.recover();
                return;
            }
        };

        if self.runtime.contains(&name) {
            report.type_error(
                location.clone(),
                format!("handler '{}' shadows a runtime builtin", name),
            );
        }

        // resolve forward declarations; reject redefinition
        let id = match self.unit.find_handler(&name) {
            Some(id) => {
                if self.unit.handlers[id].body.is_some() {
                    report.type_error(
                        location.clone(),
                        format!("duplicate handler '{}'", name),
                    );
                }
                id
            }
            None => {
                self.unit.handlers.push(HandlerDecl {
                    name: name.clone(),
                    location: location.clone(),
                    body: None,
                });
                self.unit.handlers.len() - 1
            }
        };
        self.unit.handlers[id].location = location;
        self.scopes.declare(&name, SymbolRef::Handler(id));

        if !self.expect(&TokenKind::LBrace, "to open the handler body", report) {
            self.recover();
            return;
        }

        self.scopes.enter();
        let mut statements = Vec::new();
        let body_location = self.location();
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            match self.parse_stmt(report) {
                Some(stmt) => statements.push(stmt),
                None => self.recover(),
            }
        }
        self.scopes.leave();
        self.expect(&TokenKind::RBrace, "to close the handler body", report);

        self.unit.handlers[id].body = Some(Stmt::Compound {
            statements,
            location: body_location,
        });
    }

    fn parse_var_decl(&mut self, report: &mut DiagnosticReport) -> Option<VarId> {
        let location = self.location();
        self.advance(); // var

        let name = match self.kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                report.syntax_error(
                    self.location(),
                    format!("expected variable name after 'var', got {}", other.describe()),
                );
                return None;
            }
        };

        if !self.expect(&TokenKind::Assign, "after the variable name", report) {
            return None;
        }
        let initializer = self.parse_expr(report)?;
        self.expect(&TokenKind::Semicolon, "after the variable initializer", report);

        if self
            .scopes
            .lookup(&name, Lookup::SelfOnly)
            .is_some()
        {
            report.type_error(
                location.clone(),
                format!("redefinition of variable '{}'", name),
            );
        }

        let ty = initializer.ty();
        let id = self.unit.variables.len();
        self.unit.variables.push(VarDecl {
            name: name.clone(),
            location,
            initializer,
            ty,
        });
        self.scopes.declare(&name, SymbolRef::Variable(id));
        Some(id)
    }

    // ---- statements ----

    fn parse_stmt(&mut self, report: &mut DiagnosticReport) -> Option<Stmt> {
        match self.kind().clone() {
            TokenKind::Var => {
                let location = self.location();
                let var = self.parse_var_decl(report)?;
                Some(Stmt::VarDecl { var, location })
            }
            TokenKind::If => self.parse_if(report),
            TokenKind::Match => self.parse_match(report),
            TokenKind::LBrace => self.parse_block(report),
            TokenKind::Ident(name) => self.parse_ident_stmt(&name, report),
            TokenKind::Semicolon => {
                // stray semicolon: empty statement
                let location = self.location();
                self.advance();
                Some(Stmt::Compound {
                    statements: Vec::new(),
                    location,
                })
            }
            other => {
                report.syntax_error(
                    self.location(),
                    format!("expected a statement, got {}", other.describe()),
                );
                None
            }
        }
    }

    fn parse_block(&mut self, report: &mut DiagnosticReport) -> Option<Stmt> {
        let location = self.location();
        self.advance(); // {
        self.scopes.enter();
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            match self.parse_stmt(report) {
                Some(stmt) => statements.push(stmt),
                None => self.recover(),
            }
        }
        self.scopes.leave();
        self.expect(&TokenKind::RBrace, "to close the block", report);
        Some(Stmt::Compound {
            statements,
            location,
        })
    }

    fn parse_if(&mut self, report: &mut DiagnosticReport) -> Option<Stmt> {
        let location = self.location();
        self.advance(); // if

        let condition = self.parse_expr(report)?;
        if condition.ty() != LiteralType::Boolean {
            report.type_error(
                condition.location().clone(),
                format!("if condition must be Boolean, got {}", condition.ty()),
            );
        }

        self.expect(&TokenKind::Then, "after the if condition", report);
        let then_branch = Box::new(self.parse_stmt(report)?);
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.parse_stmt(report)?))
        } else {
            None
        };

        Some(Stmt::Cond {
            condition,
            then_branch,
            else_branch,
            location,
        })
    }

    fn parse_match(&mut self, report: &mut DiagnosticReport) -> Option<Stmt> {
        let location = self.location();
        self.advance(); // match

        // the subject is parsed above the comparison level so the
        // match operator (e.g. `=^`) is left for this statement
        let subject = self.parse_add(report)?;
        if subject.ty() != LiteralType::String {
            report.type_error(
                subject.location().clone(),
                format!("match subject must be String, got {}", subject.ty()),
            );
        }

        let op = match self.kind() {
            TokenKind::Eq => {
                self.advance();
                MatchClass::Same
            }
            TokenKind::PrefixMatch => {
                self.advance();
                MatchClass::Head
            }
            TokenKind::SuffixMatch => {
                self.advance();
                MatchClass::Tail
            }
            TokenKind::RegexMatch => {
                self.advance();
                MatchClass::RegExp
            }
            _ => MatchClass::Same,
        };

        self.expect(&TokenKind::LBrace, "to open the match body", report);

        let mut cases = Vec::new();
        let mut else_branch = None;
        while !self.check(&TokenKind::RBrace) && !self.at_end() {
            if self.eat(&TokenKind::Else) {
                if else_branch.is_some() {
                    report.syntax_error(
                        self.location(),
                        "duplicate 'else' in match statement".to_string(),
                    );
                }
                else_branch = Some(Box::new(self.parse_stmt(report)?));
                continue;
            }

            if !self.expect(&TokenKind::On, "to start a match case", report) {
                self.recover();
                continue;
            }

            let mut labels = Vec::new();
            loop {
                let label = self.parse_expr(report)?;
                self.check_match_label(op, &label, report);
                labels.push(label);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            let body = self.parse_stmt(report)?;
            cases.push(MatchCase { labels, body });
        }
        self.expect(&TokenKind::RBrace, "to close the match body", report);

        if cases.is_empty() {
            report.syntax_error(
                location.clone(),
                "match statement requires at least one 'on' case".to_string(),
            );
        }

        Some(Stmt::Match {
            subject,
            op,
            cases,
            else_branch,
            location,
        })
    }

    fn check_match_label(&self, op: MatchClass, label: &Expr, report: &mut DiagnosticReport) {
        let expected = match op {
            MatchClass::RegExp => LiteralType::RegExp,
            _ => LiteralType::String,
        };
        if !label.is_constant() || label.ty() != expected {
            report.type_error(
                label.location().clone(),
                format!("match case label must be a constant {}", expected),
            );
        }
    }

    /// Statement starting with an identifier: assignment or call.
    fn parse_ident_stmt(&mut self, name: &str, report: &mut DiagnosticReport) -> Option<Stmt> {
        let location = self.location();
        self.advance(); // identifier

        if self.eat(&TokenKind::Assign) {
            let value = self.parse_expr(report)?;
            self.expect(&TokenKind::Semicolon, "after the assignment", report);

            let Some(SymbolRef::Variable(id)) =
                self.scopes.lookup(name, Lookup::SelfAndOuter)
            else {
                report.type_error(
                    location.clone(),
                    format!("assignment to unknown variable '{}'", name),
                );
                return None;
            };
            let var_ty = self.unit.variable(id).ty;
            if value.ty() != var_ty {
                report.type_error(
                    location.clone(),
                    format!(
                        "cannot assign {} to variable '{}' of type {}",
                        value.ty(),
                        name,
                        var_ty
                    ),
                );
            }
            return Some(Stmt::Assign {
                var: id,
                value,
                location,
            });
        }

        // call statement, with or without an argument list
        let args = if self.check(&TokenKind::LParen) {
            self.parse_arg_list(report)?
        } else {
            ParamList::Positional(Vec::new())
        };
        self.expect(&TokenKind::Semicolon, "after the call", report);

        let expr = self.make_call(name, args, location.clone(), true, report)?;
        Some(Stmt::Expr { expr, location })
    }

    /// Builds a call expression for `name`, resolving the callee and
    /// matching the signature. Handler calls (user or native) yield no
    /// value and are only legal in statement context.
    fn make_call(
        &mut self,
        name: &str,
        mut args: ParamList,
        location: SourceLocation,
        stmt_context: bool,
        report: &mut DiagnosticReport,
    ) -> Option<Expr> {
        let resolved = self
            .scopes
            .lookup(name, Lookup::SelfAndOuter)
            .or_else(|| self.resolve_builtin(name));

        match resolved {
            Some(SymbolRef::Variable(_)) => {
                report.type_error(
                    location,
                    format!("'{}' is a variable and cannot be called", name),
                );
                None
            }
            Some(SymbolRef::Handler(id)) => {
                if !stmt_context {
                    report.type_error(
                        location.clone(),
                        format!("handler '{}' cannot be called in an expression", name),
                    );
                    return None;
                }
                if !args.is_empty() {
                    report.type_error(
                        location.clone(),
                        format!("handler '{}' takes no arguments", name),
                    );
                }
                Some(Expr::Call {
                    callee: CalleeRef::Handler(id),
                    args: ParamList::Positional(Vec::new()),
                    ty: LiteralType::Boolean,
                    location,
                })
            }
            Some(SymbolRef::BuiltinFunction(id)) => {
                let callback = self.runtime.callback(id)?;
                let ty = callback.signature().return_type();
                if let Err(message) = sema::try_match(callback, &mut args, &location) {
                    report.type_error(location.clone(), message);
                    return None;
                }
                Some(Expr::Call {
                    callee: CalleeRef::BuiltinFunction(id),
                    args,
                    ty,
                    location,
                })
            }
            Some(SymbolRef::BuiltinHandler(id)) => {
                if !stmt_context {
                    report.type_error(
                        location.clone(),
                        format!("handler '{}' cannot be called in an expression", name),
                    );
                    return None;
                }
                let callback = self.runtime.callback(id)?;
                if let Err(message) = sema::try_match(callback, &mut args, &location) {
                    report.type_error(location.clone(), message);
                    return None;
                }
                Some(Expr::Call {
                    callee: CalleeRef::BuiltinHandler(id),
                    args,
                    ty: LiteralType::Boolean,
                    location,
                })
            }
            None => {
                // forward reference to a handler implemented later in
                // the unit
                if args.is_empty() && stmt_context {
                    let id = self.unit.handlers.len();
                    self.unit.handlers.push(HandlerDecl {
                        name: name.to_string(),
                        location: location.clone(),
                        body: None,
                    });
                    self.scopes.declare(name, SymbolRef::Handler(id));
                    Some(Expr::Call {
                        callee: CalleeRef::Handler(id),
                        args: ParamList::Positional(Vec::new()),
                        ty: LiteralType::Boolean,
                        location,
                    })
                } else {
                    report.type_error(
                        location,
                        format!("call to unknown callable '{}'", name),
                    );
                    None
                }
            }
        }
    }

    fn resolve_builtin(&self, name: &str) -> Option<SymbolRef> {
        let callback = self.runtime.find(name)?;
        let index = self
            .runtime
            .callbacks()
            .iter()
            .position(|c| c.name() == name)?;
        if callback.is_handler() {
            Some(SymbolRef::BuiltinHandler(index))
        } else {
            Some(SymbolRef::BuiltinFunction(index))
        }
    }

    fn parse_arg_list(&mut self, report: &mut DiagnosticReport) -> Option<ParamList> {
        self.advance(); // (
        if self.eat(&TokenKind::RParen) {
            return Some(ParamList::Positional(Vec::new()));
        }

        let mut positional = Vec::new();
        let mut named: Vec<(String, Expr)> = Vec::new();
        loop {
            // a named argument is Name '=' Expr
            let mut arg_name = None;
            if let TokenKind::Ident(name) = self.kind().clone() {
                if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Assign) {
                    self.advance();
                    self.advance();
                    arg_name = Some(name);
                }
            }
            let value = self.parse_expr(report)?;

            match arg_name {
                Some(name) => named.push((name, value)),
                None => positional.push(value),
            }

            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "to close the argument list", report);

        match (positional.is_empty(), named.is_empty()) {
            (true, false) => Some(ParamList::Named(named)),
            (_, true) => Some(ParamList::Positional(positional)),
            (false, false) => {
                report.syntax_error(
                    self.previous_location(),
                    "cannot mix positional and named arguments".to_string(),
                );
                None
            }
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        self.parse_or(report)
    }

    fn parse_or(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_and(report)?;
        while self.check(&TokenKind::Or) {
            self.advance();
            let rhs = self.parse_and(report)?;
            lhs = self.make_binary(BinaryOp::Or, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_and(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_not(report)?;
        loop {
            let op = match self.kind() {
                TokenKind::And => BinaryOp::And,
                TokenKind::Xor => BinaryOp::Xor,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_not(report)?;
            lhs = self.make_binary(op, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_not(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        if self.check(&TokenKind::Not) {
            let location = self.location();
            self.advance();
            let operand = self.parse_not(report)?;
            if let Err(message) = sema::unary_check(UnaryOp::Not, operand.ty()) {
                report.type_error(location.clone(), message);
            }
            return Some(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                location,
            });
        }
        self.parse_cmp(report)
    }

    fn parse_cmp(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_add(report)?;
        loop {
            let op = match self.kind() {
                TokenKind::Eq => BinaryOp::Equal,
                TokenKind::Ne => BinaryOp::NotEqual,
                TokenKind::Lt => BinaryOp::Less,
                TokenKind::Le => BinaryOp::LessOrEqual,
                TokenKind::Gt => BinaryOp::Greater,
                TokenKind::Ge => BinaryOp::GreaterOrEqual,
                TokenKind::RegexMatch => BinaryOp::RegexMatch,
                TokenKind::PrefixMatch => BinaryOp::PrefixMatch,
                TokenKind::SuffixMatch => BinaryOp::SuffixMatch,
                TokenKind::In => BinaryOp::In,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_add(report)?;
            lhs = self.make_binary(op, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_add(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_mul(report)?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul(report)?;
            lhs = self.make_binary(op, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_mul(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_shift(report)?;
        loop {
            let op = match self.kind() {
                TokenKind::Mul => BinaryOp::Mul,
                TokenKind::Div => BinaryOp::Div,
                TokenKind::Rem => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_shift(report)?;
            lhs = self.make_binary(op, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_shift(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let mut lhs = self.parse_pow(report)?;
        loop {
            let op = match self.kind() {
                TokenKind::Shl => BinaryOp::Shl,
                TokenKind::Shr => BinaryOp::Shr,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_pow(report)?;
            lhs = self.make_binary(op, lhs, rhs, report);
        }
        Some(lhs)
    }

    fn parse_pow(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let lhs = self.parse_unary(report)?;
        if self.check(&TokenKind::Pow) {
            self.advance();
            // right associative
            let rhs = self.parse_pow(report)?;
            return Some(self.make_binary(BinaryOp::Pow, lhs, rhs, report));
        }
        Some(lhs)
    }

    fn parse_unary(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let op = match self.kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::BitNot => Some(UnaryOp::BitNot),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let location = self.location();
            self.advance();
            let operand = self.parse_unary(report)?;
            if let Err(message) = sema::unary_check(op, operand.ty()) {
                report.type_error(location.clone(), message);
            }
            return Some(Expr::Unary {
                op,
                operand: Box::new(operand),
                location,
            });
        }
        self.parse_primary(report)
    }

    fn parse_primary(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let location = self.location();
        match self.kind().clone() {
            TokenKind::Number(value) => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::Number(value),
                    location,
                })
            }
            TokenKind::True => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::Bool(true),
                    location,
                })
            }
            TokenKind::False => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::Bool(false),
                    location,
                })
            }
            TokenKind::String(value) => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::String(value),
                    location,
                })
            }
            TokenKind::IpAddr(ip) => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::IPAddress(ip),
                    location,
                })
            }
            TokenKind::Cidr(cidr) => {
                self.advance();
                Some(Expr::Literal {
                    value: Value::Cidr(cidr),
                    location,
                })
            }
            TokenKind::RegExp(pattern) => {
                self.advance();
                match RegExp::new(&pattern) {
                    Ok(re) => Some(Expr::Literal {
                        value: Value::RegExp(re),
                        location,
                    }),
                    Err(e) => {
                        report.type_error(
                            location,
                            format!("invalid regular expression: {}", e),
                        );
                        None
                    }
                }
            }
            TokenKind::CaptureRef(index) => {
                self.advance();
                Some(Expr::RegexGroup { index, location })
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr(report)?;
                self.expect(&TokenKind::RParen, "to close the expression", report);
                Some(expr)
            }
            TokenKind::LBracket => self.parse_array(report),
            TokenKind::Ident(name) => {
                self.advance();
                // function call with parens
                if self.check(&TokenKind::LParen) {
                    let args = self.parse_arg_list(report)?;
                    return self.make_call(&name, args, location, false, report);
                }
                // variable reference
                if let Some(SymbolRef::Variable(id)) =
                    self.scopes.lookup(&name, Lookup::SelfAndOuter)
                {
                    let ty = self.unit.variable(id).ty;
                    return Some(Expr::Variable { id, ty, location });
                }
                // nullary builtin function (e.g. req.path)
                if let Some(symbol) = self.resolve_builtin(&name) {
                    if let SymbolRef::BuiltinFunction(_) = symbol {
                        return self.make_call(
                            &name,
                            ParamList::Positional(Vec::new()),
                            location,
                            false,
                            report,
                        );
                    }
                }
                report.type_error(
                    location,
                    format!("unknown identifier '{}'", name),
                );
                None
            }
            other => {
                report.syntax_error(
                    location,
                    format!("expected an expression, got {}", other.describe()),
                );
                None
            }
        }
    }

    fn parse_array(&mut self, report: &mut DiagnosticReport) -> Option<Expr> {
        let location = self.location();
        self.advance(); // [

        let mut elements = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expr(report)?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RBracket, "to close the array literal", report);

        let Some(first) = elements.first() else {
            report.type_error(
                location,
                "cannot infer the element type of an empty array".to_string(),
            );
            return None;
        };
        let element_ty = first.ty();
        let Some(ty) = element_ty.array_of() else {
            report.type_error(
                location,
                format!("arrays of {} are not supported", element_ty),
            );
            return None;
        };
        for element in &elements[1..] {
            if element.ty() != element_ty {
                report.type_error(
                    element.location().clone(),
                    format!(
                        "array element type {} does not match {}",
                        element.ty(),
                        element_ty
                    ),
                );
            }
        }

        Some(Expr::Array {
            elements,
            ty,
            location,
        })
    }

    fn make_binary(
        &mut self,
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
        report: &mut DiagnosticReport,
    ) -> Expr {
        let location = lhs.location().merge(rhs.location());
        match sema::binary_result(op, lhs.ty(), rhs.ty()) {
            Ok(typed) => {
                let lhs = apply_cast(lhs, typed.cast_lhs);
                let rhs = apply_cast(rhs, typed.cast_rhs);
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    ty: typed.result,
                    location,
                }
            }
            Err(message) => {
                report.type_error(location.clone(), message);
                // keep a typed node so one mistake does not cascade
                let ty = lhs.ty();
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    ty,
                    location,
                }
            }
        }
    }
}

fn apply_cast(expr: Expr, target: Option<LiteralType>) -> Expr {
    match target {
        Some(target) if target != expr.ty() => {
            let location = expr.location().clone();
            Expr::Cast {
                target,
                operand: Box::new(expr),
                location,
            }
        }
        _ => expr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            .register_handler("show_user")
            .param(LiteralType::String, "id")
            .bind(|_| {});
        runtime
    }

    fn parse_ok(source: &str) -> Unit {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        match parse(source, "test.flow", &mut runtime, &mut report) {
            Some(unit) => unit,
            None => panic!("parse failed:\n{}", report),
        }
    }

    fn parse_err(source: &str) -> DiagnosticReport {
        let mut runtime = stub_runtime();
        let mut report = DiagnosticReport::new();
        let unit = parse(source, "test.flow", &mut runtime, &mut report);
        assert!(unit.is_none(), "expected a parse failure");
        report
    }

    #[test]
    fn test_parse_minimal_handler() {
        let unit = parse_ok("handler main { pass; }");
        assert_eq!(unit.handlers.len(), 1);
        assert_eq!(unit.handlers[0].name, "main");
        assert!(unit.handlers[0].body.is_some());
    }

    #[test]
    fn test_parse_var_and_if() {
        let unit = parse_ok(
            "handler main {\n  var x = 2;\n  var y = 3;\n  if x + y == 5 then pass;\n}\n",
        );
        assert_eq!(unit.variables.len(), 2);
        assert_eq!(unit.variables[0].ty, LiteralType::Number);

        let Some(Stmt::Compound { statements, .. }) = &unit.handlers[0].body else {
            panic!("expected compound body");
        };
        assert!(matches!(statements[2], Stmt::Cond { .. }));
    }

    #[test]
    fn test_precedence_mul_before_add() {
        let unit = parse_ok("var x = 1 + 2 * 3;\nhandler main { pass; }");
        let Expr::Binary { op, rhs, .. } = &unit.variables[0].initializer else {
            panic!("expected binary initializer");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.as_ref(),
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_pow_is_right_associative() {
        let unit = parse_ok("var x = 2 ** 3 ** 2;\nhandler main { pass; }");
        let Expr::Binary { op, rhs, .. } = &unit.variables[0].initializer else {
            panic!("expected binary initializer");
        };
        assert_eq!(*op, BinaryOp::Pow);
        assert!(matches!(
            rhs.as_ref(),
            Expr::Binary {
                op: BinaryOp::Pow,
                ..
            }
        ));
    }

    #[test]
    fn test_string_plus_number_gets_cast() {
        let unit = parse_ok("var x = \"port: \" + 8080;\nhandler main { pass; }");
        assert_eq!(unit.variables[0].ty, LiteralType::String);
        let Expr::Binary { rhs, .. } = &unit.variables[0].initializer else {
            panic!("expected binary initializer");
        };
        assert!(matches!(
            rhs.as_ref(),
            Expr::Cast {
                target: LiteralType::String,
                ..
            }
        ));
    }

    #[test]
    fn test_match_with_operator_and_else() {
        let unit = parse_ok(
            r#"
handler a_handler { pass; }
handler main {
  match req.path =^ {
    on "/a" a_handler;
    else    pass;
  }
}
"#,
        );
        let main = unit.find_handler("main").unwrap();
        let Some(Stmt::Compound { statements, .. }) = &unit.handlers[main].body else {
            panic!();
        };
        let Stmt::Match { op, cases, else_branch, .. } = &statements[0] else {
            panic!("expected match");
        };
        assert_eq!(*op, MatchClass::Head);
        assert_eq!(cases.len(), 1);
        assert!(else_branch.is_some());
    }

    #[test]
    fn test_forward_handler_reference() {
        let unit = parse_ok(
            "handler main { helper; }\nhandler helper { pass; }",
        );
        assert_eq!(unit.handlers.len(), 2);
        assert!(unit.handlers.iter().all(|h| h.body.is_some()));
    }

    #[test]
    fn test_unimplemented_forward_reference_fails() {
        let report = parse_err("handler main { helper; }");
        let message = report.to_string();
        assert!(message.contains("never implemented"), "{}", message);
    }

    #[test]
    fn test_duplicate_handler_fails() {
        let report = parse_err("handler a { pass; }\nhandler a { pass; }");
        assert!(report.to_string().contains("duplicate handler"));
    }

    #[test]
    fn test_regex_capture_reference() {
        let unit = parse_ok(
            r#"handler main { if req.path =~ /^\/user\/(\d+)$/ then show_user($1); }"#,
        );
        assert_eq!(unit.handlers.len(), 1);
    }

    #[test]
    fn test_call_type_mismatch_reports() {
        let report = parse_err("handler main { log(42); }");
        assert!(report.to_string().contains("Type mismatch"));
    }

    #[test]
    fn test_named_arguments() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("listen", LiteralType::Void)
            .param(LiteralType::String, "address")
            .param_default("port", Value::Number(80))
            .bind(|_| {});
        runtime.register_handler("pass").bind(|_| {});

        let mut report = DiagnosticReport::new();
        let unit = parse(
            "handler main { listen(port = 8080, address = \"0.0.0.0\"); pass; }",
            "test.flow",
            &mut runtime,
            &mut report,
        )
        .unwrap_or_else(|| panic!("{}", report));

        let Some(Stmt::Compound { statements, .. }) = &unit.handlers[0].body else {
            panic!();
        };
        let Stmt::Expr { expr: Expr::Call { args, .. }, .. } = &statements[0] else {
            panic!("expected call");
        };
        let ParamList::Positional(args) = args else {
            panic!("expected rewritten positional args");
        };
        assert_eq!(args[0].ty(), LiteralType::String);
        assert_eq!(args[1].ty(), LiteralType::Number);
    }

    #[test]
    fn test_recovery_continues_after_error() {
        let report = parse_err("handler main { log(; pass; }\nhandler other { unknown(1); }");
        // both errors surface despite the first one
        assert!(report.error_count() >= 2);
    }

    #[test]
    fn test_assignment_type_check() {
        let report = parse_err("handler main { var x = 1; x = \"s\"; pass; }");
        assert!(report.to_string().contains("cannot assign"));
    }

    #[test]
    fn test_import_statement() {
        let mut runtime = Runtime::new();
        runtime.register_handler("pass").bind(|_| {});
        runtime.set_import_hook(Box::new(|name, _| {
            if name == "mod" {
                Some(Vec::new())
            } else {
                None
            }
        }));

        let mut report = DiagnosticReport::new();
        let unit = parse(
            "import mod;\nhandler main { pass; }",
            "test.flow",
            &mut runtime,
            &mut report,
        )
        .unwrap_or_else(|| panic!("{}", report));
        assert_eq!(unit.modules, vec![("mod".to_string(), None)]);

        let mut report = DiagnosticReport::new();
        assert!(parse(
            "import missing;\nhandler main { pass; }",
            "test.flow",
            &mut runtime,
            &mut report,
        )
        .is_none());
        assert!(report.to_string().contains("failed to import"));
    }

    #[test]
    fn test_ip_and_cidr_expressions() {
        let unit = parse_ok(
            "var net = 10.0.0.0/8;\nvar ip = 10.1.2.3;\nvar inside = ip in net;\nhandler main { pass; }",
        );
        assert_eq!(unit.variables[0].ty, LiteralType::Cidr);
        assert_eq!(unit.variables[1].ty, LiteralType::IPAddress);
        assert_eq!(unit.variables[2].ty, LiteralType::Boolean);
    }

    #[test]
    fn test_array_literals() {
        let unit = parse_ok("var xs = [1, 2, 3];\nhandler main { pass; }");
        assert_eq!(unit.variables[0].ty, LiteralType::IntArray);

        let report = parse_err("var xs = [1, \"two\"];\nhandler main { pass; }");
        assert!(report.to_string().contains("does not match"));
    }
}
