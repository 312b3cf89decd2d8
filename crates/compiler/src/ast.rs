//! Abstract syntax tree for Flow.
//!
//! Symbols live in index arenas owned by the [`Unit`]: variables and
//! handlers are referenced by `VarId`/`HandlerId` rather than by
//! back-pointers, and built-in callables are referenced by their index
//! in the host runtime.

use flow_core::{LiteralType, SourceLocation, Value};
use flow_vm::MatchClass;

pub type VarId = usize;
pub type HandlerId = usize;
/// Index of a native callback in the host runtime.
pub type BuiltinId = usize;

/// The top-level symbol: owns every declaration of one source unit.
#[derive(Debug)]
pub struct Unit {
    pub name: String,
    /// (module, optional path) pairs from `import` statements.
    pub modules: Vec<(String, Option<String>)>,
    /// Arena of every variable in the unit, including handler locals.
    pub variables: Vec<VarDecl>,
    /// Unit-scope variables, in declaration order.
    pub globals: Vec<VarId>,
    pub handlers: Vec<HandlerDecl>,
}

impl Unit {
    pub fn new(name: impl Into<String>) -> Self {
        Unit {
            name: name.into(),
            modules: Vec::new(),
            variables: Vec::new(),
            globals: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn find_handler(&self, name: &str) -> Option<HandlerId> {
        self.handlers.iter().position(|h| h.name == name)
    }

    pub fn variable(&self, id: VarId) -> &VarDecl {
        &self.variables[id]
    }
}

#[derive(Debug)]
pub struct VarDecl {
    pub name: String,
    pub location: SourceLocation,
    pub initializer: Expr,
    /// Filled by semantic analysis from the initializer.
    pub ty: LiteralType,
}

#[derive(Debug)]
pub struct HandlerDecl {
    pub name: String,
    pub location: SourceLocation,
    /// None while only forward-referenced; a unit with such handlers
    /// left at the end fails analysis.
    pub body: Option<Stmt>,
}

/// Scope lookup strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    SelfOnly,
    Outer,
    SelfAndOuter,
    All,
}

/// What a name resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRef {
    Variable(VarId),
    Handler(HandlerId),
    BuiltinFunction(BuiltinId),
    BuiltinHandler(BuiltinId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-` on Number
    Neg,
    /// `not` on Boolean
    Not,
    /// `~` on Number
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `and`: logical on Boolean (short-circuit), bitwise on Number
    And,
    /// `or`: logical on Boolean (short-circuit), bitwise on Number
    Or,
    /// `xor`: logical on Boolean, bitwise on Number
    Xor,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    /// `=^`
    PrefixMatch,
    /// `=$`
    SuffixMatch,
    /// `=~`
    RegexMatch,
    /// `in`: substring or CIDR membership
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Pow,
}

impl BinaryOp {
    pub fn describe(self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::PrefixMatch => "=^",
            BinaryOp::SuffixMatch => "=$",
            BinaryOp::RegexMatch => "=~",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Pow => "**",
        }
    }
}

/// Which callable a call site references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeRef {
    Handler(HandlerId),
    BuiltinFunction(BuiltinId),
    BuiltinHandler(BuiltinId),
}

/// Arguments as written: positional or named. Semantic analysis
/// rewrites named lists into positional order aligned with the callee
/// signature.
#[derive(Debug)]
pub enum ParamList {
    Positional(Vec<Expr>),
    Named(Vec<(String, Expr)>),
}

impl ParamList {
    pub fn len(&self) -> usize {
        match self {
            ParamList::Positional(v) => v.len(),
            ParamList::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum Expr {
    Literal {
        value: Value,
        location: SourceLocation,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        location: SourceLocation,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        /// Result type, filled by semantic analysis.
        ty: LiteralType,
        location: SourceLocation,
    },
    /// Implicit conversion inserted by semantic analysis.
    Cast {
        target: LiteralType,
        operand: Box<Expr>,
        location: SourceLocation,
    },
    Array {
        elements: Vec<Expr>,
        ty: LiteralType,
        location: SourceLocation,
    },
    Call {
        callee: CalleeRef,
        args: ParamList,
        ty: LiteralType,
        location: SourceLocation,
    },
    Variable {
        id: VarId,
        ty: LiteralType,
        location: SourceLocation,
    },
    /// `$N`: capture group N of the latest regex match, as a fresh
    /// String.
    RegexGroup {
        index: i64,
        location: SourceLocation,
    },
}

impl Expr {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Expr::Literal { location, .. }
            | Expr::Unary { location, .. }
            | Expr::Binary { location, .. }
            | Expr::Cast { location, .. }
            | Expr::Array { location, .. }
            | Expr::Call { location, .. }
            | Expr::Variable { location, .. }
            | Expr::RegexGroup { location, .. } => location,
        }
    }

    /// The expression's result type. Valid after semantic analysis.
    pub fn ty(&self) -> LiteralType {
        match self {
            Expr::Literal { value, .. } => value.ty(),
            Expr::Unary { op, .. } => match op {
                UnaryOp::Neg | UnaryOp::BitNot => LiteralType::Number,
                UnaryOp::Not => LiteralType::Boolean,
            },
            Expr::Binary { ty, .. } => *ty,
            Expr::Cast { target, .. } => *target,
            Expr::Array { ty, .. } => *ty,
            Expr::Call { ty, .. } => *ty,
            Expr::Variable { ty, .. } => *ty,
            Expr::RegexGroup { .. } => LiteralType::String,
        }
    }

    /// Whether this is a literal (or array of literals), usable as a
    /// constant.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal { .. } => true,
            Expr::Array { elements, .. } => elements.iter().all(Expr::is_constant),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct MatchCase {
    pub labels: Vec<Expr>,
    pub body: Stmt,
}

#[derive(Debug)]
pub enum Stmt {
    /// An expression evaluated for effect: handler or function call.
    Expr {
        expr: Expr,
        location: SourceLocation,
    },
    Compound {
        statements: Vec<Stmt>,
        location: SourceLocation,
    },
    /// Declaration point of a local; the initializer lives in the
    /// unit's variable arena.
    VarDecl {
        var: VarId,
        location: SourceLocation,
    },
    Assign {
        var: VarId,
        value: Expr,
        location: SourceLocation,
    },
    Cond {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        location: SourceLocation,
    },
    Match {
        subject: Expr,
        op: MatchClass,
        cases: Vec<MatchCase>,
        else_branch: Option<Box<Stmt>>,
        location: SourceLocation,
    },
}

impl Stmt {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Stmt::Expr { location, .. }
            | Stmt::Compound { location, .. }
            | Stmt::VarDecl { location, .. }
            | Stmt::Assign { location, .. }
            | Stmt::Cond { location, .. }
            | Stmt::Match { location, .. } => location,
        }
    }
}

// {{{ AST dump

impl Unit {
    /// Indented textual dump of the unit, for `flowc build
    /// --dump-ast`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("unit {}\n", self.name));
        for (name, path) in &self.modules {
            match path {
                Some(path) => out.push_str(&format!("  import {} from {:?}\n", name, path)),
                None => out.push_str(&format!("  import {}\n", name)),
            }
        }
        for &global in &self.globals {
            let var = self.variable(global);
            out.push_str(&format!("  var {}: {} =\n", var.name, var.ty));
            self.dump_expr(&var.initializer, 2, &mut out);
        }
        for handler in &self.handlers {
            out.push_str(&format!("  handler {}\n", handler.name));
            if let Some(body) = &handler.body {
                self.dump_stmt(body, 2, &mut out);
            }
        }
        out
    }

    fn dump_stmt(&self, stmt: &Stmt, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match stmt {
            Stmt::Expr { expr, .. } => {
                out.push_str(&format!("{}expr\n", pad));
                self.dump_expr(expr, depth + 1, out);
            }
            Stmt::Compound { statements, .. } => {
                out.push_str(&format!("{}block ({} statements)\n", pad, statements.len()));
                for s in statements {
                    self.dump_stmt(s, depth + 1, out);
                }
            }
            Stmt::VarDecl { var, .. } => {
                let decl = self.variable(*var);
                out.push_str(&format!("{}var {}: {} =\n", pad, decl.name, decl.ty));
                self.dump_expr(&decl.initializer, depth + 1, out);
            }
            Stmt::Assign { var, value, .. } => {
                out.push_str(&format!("{}assign {} =\n", pad, self.variable(*var).name));
                self.dump_expr(value, depth + 1, out);
            }
            Stmt::Cond {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                out.push_str(&format!("{}if\n", pad));
                self.dump_expr(condition, depth + 1, out);
                out.push_str(&format!("{}then\n", pad));
                self.dump_stmt(then_branch, depth + 1, out);
                if let Some(else_branch) = else_branch {
                    out.push_str(&format!("{}else\n", pad));
                    self.dump_stmt(else_branch, depth + 1, out);
                }
            }
            Stmt::Match {
                subject,
                op,
                cases,
                else_branch,
                ..
            } => {
                out.push_str(&format!("{}match {:?}\n", pad, op));
                self.dump_expr(subject, depth + 1, out);
                for case in cases {
                    out.push_str(&format!("{}on\n", pad));
                    for label in &case.labels {
                        self.dump_expr(label, depth + 1, out);
                    }
                    self.dump_stmt(&case.body, depth + 1, out);
                }
                if let Some(else_branch) = else_branch {
                    out.push_str(&format!("{}else\n", pad));
                    self.dump_stmt(else_branch, depth + 1, out);
                }
            }
        }
    }

    fn dump_expr(&self, expr: &Expr, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match expr {
            Expr::Literal { value, .. } => {
                out.push_str(&format!("{}literal {}\n", pad, value));
            }
            Expr::Unary { op, operand, .. } => {
                out.push_str(&format!("{}unary {:?}\n", pad, op));
                self.dump_expr(operand, depth + 1, out);
            }
            Expr::Binary { op, lhs, rhs, ty, .. } => {
                out.push_str(&format!("{}binary '{}': {}\n", pad, op.describe(), ty));
                self.dump_expr(lhs, depth + 1, out);
                self.dump_expr(rhs, depth + 1, out);
            }
            Expr::Cast {
                target, operand, ..
            } => {
                out.push_str(&format!("{}cast to {}\n", pad, target));
                self.dump_expr(operand, depth + 1, out);
            }
            Expr::Array { elements, ty, .. } => {
                out.push_str(&format!("{}array {}\n", pad, ty));
                for element in elements {
                    self.dump_expr(element, depth + 1, out);
                }
            }
            Expr::Call {
                callee, args, ty, ..
            } => {
                let target = match callee {
                    CalleeRef::Handler(id) => format!("handler {}", self.handlers[*id].name),
                    CalleeRef::BuiltinFunction(id) => format!("function #{}", id),
                    CalleeRef::BuiltinHandler(id) => format!("native handler #{}", id),
                };
                out.push_str(&format!("{}call {}: {}\n", pad, target, ty));
                match args {
                    ParamList::Positional(args) => {
                        for arg in args {
                            self.dump_expr(arg, depth + 1, out);
                        }
                    }
                    ParamList::Named(args) => {
                        for (name, arg) in args {
                            out.push_str(&format!("{}  {} =\n", pad, name));
                            self.dump_expr(arg, depth + 2, out);
                        }
                    }
                }
            }
            Expr::Variable { id, ty, .. } => {
                out.push_str(&format!(
                    "{}variable {}: {}\n",
                    pad,
                    self.variable(*id).name,
                    ty
                ));
            }
            Expr::RegexGroup { index, .. } => {
                out.push_str(&format!("{}capture ${}\n", pad, index));
            }
        }
    }
}

// }}}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::SourcePosition;

    fn loc() -> SourceLocation {
        SourceLocation::new(
            "t.flow",
            SourcePosition::default(),
            SourcePosition::default(),
        )
    }

    #[test]
    fn test_expr_types() {
        let lit = Expr::Literal {
            value: Value::Number(1),
            location: loc(),
        };
        assert_eq!(lit.ty(), LiteralType::Number);

        let neg = Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(lit),
            location: loc(),
        };
        assert_eq!(neg.ty(), LiteralType::Number);

        let not = Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(Expr::Literal {
                value: Value::Bool(true),
                location: loc(),
            }),
            location: loc(),
        };
        assert_eq!(not.ty(), LiteralType::Boolean);
    }

    #[test]
    fn test_constant_arrays() {
        let arr = Expr::Array {
            elements: vec![
                Expr::Literal {
                    value: Value::Number(1),
                    location: loc(),
                },
                Expr::Literal {
                    value: Value::Number(2),
                    location: loc(),
                },
            ],
            ty: LiteralType::IntArray,
            location: loc(),
        };
        assert!(arr.is_constant());

        let mixed = Expr::Array {
            elements: vec![Expr::Variable {
                id: 0,
                ty: LiteralType::Number,
                location: loc(),
            }],
            ty: LiteralType::IntArray,
            location: loc(),
        };
        assert!(!mixed.is_constant());
    }

    #[test]
    fn test_unit_handler_lookup() {
        let mut unit = Unit::new("t.flow");
        unit.handlers.push(HandlerDecl {
            name: "main".into(),
            location: loc(),
            body: None,
        });
        assert_eq!(unit.find_handler("main"), Some(0));
        assert_eq!(unit.find_handler("other"), None);
    }

    #[test]
    fn test_dump_renders_nested_structure() {
        let mut unit = Unit::new("t.flow");
        unit.variables.push(VarDecl {
            name: "x".into(),
            location: loc(),
            initializer: Expr::Literal {
                value: Value::Number(1),
                location: loc(),
            },
            ty: LiteralType::Number,
        });
        unit.handlers.push(HandlerDecl {
            name: "main".into(),
            location: loc(),
            body: Some(Stmt::Cond {
                condition: Expr::Variable {
                    id: 0,
                    ty: LiteralType::Number,
                    location: loc(),
                },
                then_branch: Box::new(Stmt::Compound {
                    statements: Vec::new(),
                    location: loc(),
                }),
                else_branch: None,
                location: loc(),
            }),
        });

        let text = unit.to_text();
        assert!(text.contains("handler main"));
        assert!(text.contains("if"));
        assert!(text.contains("variable x: Number"));
    }
}
