//! `match` statement support: the serialized `MatchDef` tables emitted
//! by the code generator and the matchers built from them at link time.

use crate::pool::ConstantPool;
use crate::runner::RegexContext;
use std::collections::HashMap;

/// Which comparison a `match` statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClass {
    /// Equality on the subject.
    Same,
    /// Subject begins with the case label.
    Head,
    /// Subject ends with the case label.
    Tail,
    /// Subject matches the case label regex.
    RegExp,
}

/// One case: a constant-pool label index and the target program
/// counter of the case body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCaseDef {
    /// String-pool index for `Same`/`Head`/`Tail`, regexp-pool index
    /// for `RegExp`.
    pub label: u16,
    pub pc: usize,
}

/// The serialized description of one `match` statement.
#[derive(Debug, Clone)]
pub struct MatchDef {
    pub op: MatchClass,
    pub handler_id: usize,
    pub cases: Vec<MatchCaseDef>,
    pub else_pc: usize,
}

/// Executable form of a [`MatchDef`], built once per program link.
///
/// Cases are ordered; the first matching case wins. `Same` uses a hash
/// map (first occurrence of a duplicate label wins), the other classes
/// probe cases in order.
#[derive(Debug)]
pub enum Matcher {
    Same {
        map: HashMap<String, usize>,
        else_pc: usize,
    },
    Head {
        cases: Vec<(String, usize)>,
        else_pc: usize,
    },
    Tail {
        cases: Vec<(String, usize)>,
        else_pc: usize,
    },
    RegExp {
        /// (regexp pool index, target pc)
        cases: Vec<(u16, usize)>,
        else_pc: usize,
    },
}

impl Matcher {
    /// Builds the matcher, resolving label indices against the pool.
    /// Returns `None` if a label index is dangling, which indicates a
    /// corrupt program.
    pub fn build(def: &MatchDef, pool: &ConstantPool) -> Option<Matcher> {
        match def.op {
            MatchClass::Same => {
                let mut map = HashMap::with_capacity(def.cases.len());
                for case in &def.cases {
                    let label = pool.string(case.label)?.to_string();
                    map.entry(label).or_insert(case.pc);
                }
                Some(Matcher::Same {
                    map,
                    else_pc: def.else_pc,
                })
            }
            MatchClass::Head | MatchClass::Tail => {
                let mut cases = Vec::with_capacity(def.cases.len());
                for case in &def.cases {
                    cases.push((pool.string(case.label)?.to_string(), case.pc));
                }
                if def.op == MatchClass::Head {
                    Some(Matcher::Head {
                        cases,
                        else_pc: def.else_pc,
                    })
                } else {
                    Some(Matcher::Tail {
                        cases,
                        else_pc: def.else_pc,
                    })
                }
            }
            MatchClass::RegExp => {
                let mut cases = Vec::with_capacity(def.cases.len());
                for case in &def.cases {
                    pool.regexp(case.label)?;
                    cases.push((case.label, case.pc));
                }
                Some(Matcher::RegExp {
                    cases,
                    else_pc: def.else_pc,
                })
            }
        }
    }

    /// Evaluates the subject and returns the program counter to jump
    /// to. A `RegExp` match populates the caller's regex context with
    /// the winning case's capture groups.
    pub fn evaluate(
        &self,
        subject: &str,
        pool: &ConstantPool,
        regex_ctx: &mut RegexContext,
    ) -> usize {
        match self {
            Matcher::Same { map, else_pc } => map.get(subject).copied().unwrap_or(*else_pc),
            Matcher::Head { cases, else_pc } => cases
                .iter()
                .find(|(label, _)| subject.starts_with(label.as_str()))
                .map(|(_, pc)| *pc)
                .unwrap_or(*else_pc),
            Matcher::Tail { cases, else_pc } => cases
                .iter()
                .find(|(label, _)| subject.ends_with(label.as_str()))
                .map(|(_, pc)| *pc)
                .unwrap_or(*else_pc),
            Matcher::RegExp { cases, else_pc } => {
                for (index, pc) in cases {
                    // build() verified every index, so the lookup holds
                    let Some(re) = pool.regexp(*index) else {
                        continue;
                    };
                    if let Some(caps) = re.regex().captures(subject) {
                        regex_ctx.set_from_captures(&caps);
                        return *pc;
                    }
                }
                *else_pc
            }
        }
    }
}
