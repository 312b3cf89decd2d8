//! Semantic analysis helpers: scope lookup, expression typing, and
//! callable signature matching.
//!
//! Signature matching (`try_match`) rewrites the argument list a call
//! site was written with into positional order aligned with the callee
//! signature, completing omitted parameters from the native's declared
//! defaults.

use crate::ast::{BinaryOp, Expr, Lookup, ParamList, SymbolRef, UnaryOp};
use flow_core::{LiteralType, SourceLocation, Value};
use flow_vm::NativeCallback;

/// A stack of lexical scopes mapping names to symbols.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Vec<(String, SymbolRef)>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Vec::new()],
        }
    }

    pub fn enter(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn leave(&mut self) {
        self.scopes.pop();
    }

    pub fn declare(&mut self, name: &str, symbol: SymbolRef) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), symbol));
        }
    }

    pub fn lookup(&self, name: &str, method: Lookup) -> Option<SymbolRef> {
        let find_in = |scope: &Vec<(String, SymbolRef)>| {
            scope
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, s)| *s)
        };

        match method {
            Lookup::SelfOnly => self.scopes.last().and_then(find_in),
            Lookup::Outer => self
                .scopes
                .iter()
                .rev()
                .skip(1)
                .find_map(|scope| find_in(scope)),
            Lookup::SelfAndOuter | Lookup::All => self
                .scopes
                .iter()
                .rev()
                .find_map(|scope| find_in(scope)),
        }
    }
}

/// The outcome of typing a binary expression: the result type and any
/// implicit conversions the operands need.
#[derive(Debug, PartialEq, Eq)]
pub struct TypedBinary {
    pub result: LiteralType,
    pub cast_lhs: Option<LiteralType>,
    pub cast_rhs: Option<LiteralType>,
}

impl TypedBinary {
    fn plain(result: LiteralType) -> Self {
        TypedBinary {
            result,
            cast_lhs: None,
            cast_rhs: None,
        }
    }
}

fn castable_to_string(ty: LiteralType) -> bool {
    matches!(
        ty,
        LiteralType::Number | LiteralType::IPAddress | LiteralType::Cidr | LiteralType::RegExp
    )
}

/// Computes the result type of `lhs op rhs`, inserting implicit
/// string conversions where the cast table has an edge.
pub fn binary_result(
    op: BinaryOp,
    lhs: LiteralType,
    rhs: LiteralType,
) -> Result<TypedBinary, String> {
    use LiteralType::*;

    let fail = || {
        Err(format!(
            "operator '{}' is not defined for {} and {}",
            op.describe(),
            lhs,
            rhs
        ))
    };

    match op {
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => match (lhs, rhs) {
            (Boolean, Boolean) => Ok(TypedBinary::plain(Boolean)),
            (Number, Number) => Ok(TypedBinary::plain(Number)),
            _ => fail(),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Number, Number) => Ok(TypedBinary::plain(Number)),
            (String, String) => Ok(TypedBinary::plain(String)),
            (String, r) if castable_to_string(r) => Ok(TypedBinary {
                result: String,
                cast_lhs: None,
                cast_rhs: Some(String),
            }),
            (l, String) if castable_to_string(l) => Ok(TypedBinary {
                result: String,
                cast_lhs: Some(String),
                cast_rhs: None,
            }),
            _ => fail(),
        },
        BinaryOp::Sub
        | BinaryOp::Mul
        | BinaryOp::Div
        | BinaryOp::Rem
        | BinaryOp::Shl
        | BinaryOp::Shr
        | BinaryOp::Pow => match (lhs, rhs) {
            (Number, Number) => Ok(TypedBinary::plain(Number)),
            _ => fail(),
        },
        BinaryOp::Equal | BinaryOp::NotEqual => match (lhs, rhs) {
            (Number, Number) | (String, String) | (IPAddress, IPAddress)
            | (Boolean, Boolean) => Ok(TypedBinary::plain(Boolean)),
            (String, r) if castable_to_string(r) => Ok(TypedBinary {
                result: Boolean,
                cast_lhs: None,
                cast_rhs: Some(String),
            }),
            (l, String) if castable_to_string(l) => Ok(TypedBinary {
                result: Boolean,
                cast_lhs: Some(String),
                cast_rhs: None,
            }),
            _ => fail(),
        },
        BinaryOp::Less | BinaryOp::LessOrEqual | BinaryOp::Greater | BinaryOp::GreaterOrEqual => {
            match (lhs, rhs) {
                (Number, Number) | (String, String) => Ok(TypedBinary::plain(Boolean)),
                _ => fail(),
            }
        }
        BinaryOp::PrefixMatch | BinaryOp::SuffixMatch => match (lhs, rhs) {
            (String, String) => Ok(TypedBinary::plain(Boolean)),
            _ => fail(),
        },
        BinaryOp::RegexMatch => match (lhs, rhs) {
            (String, RegExp) => Ok(TypedBinary::plain(Boolean)),
            _ => fail(),
        },
        BinaryOp::In => match (lhs, rhs) {
            (String, String) => Ok(TypedBinary::plain(Boolean)),
            (IPAddress, Cidr) => Ok(TypedBinary::plain(Boolean)),
            _ => fail(),
        },
    }
}

/// Checks a unary operator against its operand type.
pub fn unary_check(op: UnaryOp, operand: LiteralType) -> Result<(), String> {
    let ok = match op {
        UnaryOp::Neg | UnaryOp::BitNot => operand == LiteralType::Number,
        UnaryOp::Not => operand == LiteralType::Boolean,
    };
    if ok {
        Ok(())
    } else {
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
            UnaryOp::BitNot => "~",
        };
        Err(format!(
            "unary operator '{}' is not defined for {}",
            symbol, operand
        ))
    }
}

fn literal_from_default(value: &Value, location: &SourceLocation) -> Expr {
    Expr::Literal {
        value: value.clone(),
        location: location.clone(),
    }
}

/// Matches a call site's arguments against a native callable,
/// rewriting `params` into a positional list that satisfies the
/// signature exactly. Errors use the wording a host sees in its
/// diagnostics.
pub fn try_match(
    callback: &NativeCallback,
    params: &mut ParamList,
    location: &SourceLocation,
) -> Result<(), String> {
    let signature = callback.signature();
    let arg_types = signature.args();

    if params.is_empty() && arg_types.is_empty() {
        return Ok(());
    }

    match params {
        ParamList::Named(named) => {
            if !callback.params_named() {
                return Err(format!(
                    "Callee \"{}\" invoked with named parameters, but no names provided by runtime.",
                    signature.name()
                ));
            }

            // complete omitted parameters from defaults
            for i in 0..arg_types.len() {
                let name = callback.param_name(i).unwrap_or_default().to_string();
                if named.iter().any(|(n, _)| *n == name) {
                    continue;
                }
                match callback.default_param(i) {
                    Some(default) => {
                        named.push((name, literal_from_default(default, location)));
                    }
                    None => {
                        return Err(format!(
                            "Callee \"{}\" invoked without required named parameter \"{}\".",
                            signature.name(),
                            name
                        ));
                    }
                }
            }

            // reorder into signature order, collecting superfluous names
            let mut taken: Vec<Option<Expr>> = Vec::with_capacity(arg_types.len());
            taken.resize_with(arg_types.len(), || None);
            let mut superfluous = Vec::new();
            for (name, expr) in named.drain(..) {
                match (0..arg_types.len())
                    .find(|&i| callback.param_name(i) == Some(name.as_str()))
                {
                    Some(i) if taken[i].is_none() => taken[i] = Some(expr),
                    _ => superfluous.push(name),
                }
            }

            if !superfluous.is_empty() {
                let list = superfluous
                    .iter()
                    .map(|n| format!("\"{}\"", n))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(format!(
                    "Superfluous arguments passed to callee \"{}\": {}.",
                    signature.name(),
                    list
                ));
            }

            let mut positional = Vec::with_capacity(arg_types.len());
            for (i, slot) in taken.into_iter().enumerate() {
                match slot {
                    Some(expr) => positional.push(expr),
                    None => {
                        return Err(format!(
                            "Callee \"{}\" invoked without required named parameter \"{}\".",
                            signature.name(),
                            callback.param_name(i).unwrap_or_default()
                        ));
                    }
                }
            }

            for (i, expr) in positional.iter().enumerate() {
                if expr.ty() != arg_types[i] {
                    return Err(format!(
                        "Type mismatch in positional parameter {}, callee {}.",
                        i + 1,
                        signature
                    ));
                }
            }

            *params = ParamList::Positional(positional);
            Ok(())
        }
        ParamList::Positional(positional) => {
            if positional.len() > arg_types.len() {
                return Err(format!("Superfluous parameters to callee {}.", signature));
            }

            for (i, expr) in positional.iter().enumerate() {
                if expr.ty() != arg_types[i] {
                    return Err(format!(
                        "Type mismatch in positional parameter {}, callee {}.",
                        i + 1,
                        signature
                    ));
                }
            }

            for i in positional.len()..arg_types.len() {
                match callback.default_param(i) {
                    Some(default) => positional.push(literal_from_default(default, location)),
                    None => {
                        return Err(format!(
                            "No default value provided for positional parameter {}, callee {}.",
                            i + 1,
                            signature
                        ));
                    }
                }
            }

            Ok(())
        }
    }
}
