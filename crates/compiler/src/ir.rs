//! SSA-style intermediate representation.
//!
//! An [`IRProgram`] owns a typed constant table and one [`IRHandler`]
//! per generated handler. Handlers own basic blocks; blocks hold
//! ordered instruction ids into the handler's instruction arena;
//! instructions reference their operands as [`ValueRef`]s (constant or
//! earlier instruction). The last instruction of every block is a
//! terminator.

use flow_core::{Cidr, LiteralType, RegExp, Signature};
use flow_vm::MatchClass;
use std::fmt::Write as _;
use std::net::IpAddr;

pub type BlockId = usize;
pub type InstrId = usize;
pub type ConstId = usize;

/// A typed constant owned by the program.
#[derive(Debug, Clone, PartialEq)]
pub enum IrConst {
    Number(i64),
    Boolean(bool),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    IntArray(Vec<i64>),
    StringArray(Vec<String>),
    IPAddrArray(Vec<IpAddr>),
    CidrArray(Vec<Cidr>),
}

impl IrConst {
    pub fn ty(&self) -> LiteralType {
        match self {
            IrConst::Number(_) => LiteralType::Number,
            IrConst::Boolean(_) => LiteralType::Boolean,
            IrConst::String(_) => LiteralType::String,
            IrConst::IPAddress(_) => LiteralType::IPAddress,
            IrConst::Cidr(_) => LiteralType::Cidr,
            IrConst::RegExp(_) => LiteralType::RegExp,
            IrConst::IntArray(_) => LiteralType::IntArray,
            IrConst::StringArray(_) => LiteralType::StringArray,
            IrConst::IPAddrArray(_) => LiteralType::IPAddrArray,
            IrConst::CidrArray(_) => LiteralType::CidrArray,
        }
    }
}

/// An operand: a program constant or the result of an earlier
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    Const(ConstId),
    Instr(InstrId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryIrOp {
    NNeg,
    NNot,
    BNot,
    SLen,
    SIsEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryIrOp {
    NAdd,
    NSub,
    NMul,
    NDiv,
    NRem,
    NShl,
    NShr,
    NPow,
    NAnd,
    NOr,
    NXor,
    NCmpEq,
    NCmpNe,
    NCmpLe,
    NCmpGe,
    NCmpLt,
    NCmpGt,
    BAnd,
    BOr,
    BXor,
    SAdd,
    SCmpEq,
    SCmpNe,
    SCmpLe,
    SCmpGe,
    SCmpLt,
    SCmpGt,
    SCmpBeg,
    SCmpEnd,
    SContains,
    /// rhs must be a constant regexp
    SRegMatch,
    PCmpEq,
    PCmpNe,
    PInCidr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrOp {
    /// One stack slot.
    Alloca,
    Load {
        source: ValueRef,
    },
    Store {
        target: ValueRef,
        value: ValueRef,
    },
    Unary {
        op: UnaryIrOp,
        operand: ValueRef,
    },
    Binary {
        op: BinaryIrOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    /// Conversion to the instruction's result type.
    Cast {
        source: ValueRef,
    },
    SSubStr {
        string: ValueRef,
        offset: ValueRef,
        count: ValueRef,
    },
    /// Capture group of the latest regex match.
    RegexGroup {
        index: ValueRef,
    },
    /// Native function call; callee indexes the program's
    /// native-function table.
    Call {
        callee: usize,
        args: Vec<ValueRef>,
    },
    /// Native handler invocation.
    HandlerCall {
        callee: usize,
        args: Vec<ValueRef>,
    },
    Phi {
        inputs: Vec<(ValueRef, BlockId)>,
    },

    // terminators
    Br {
        target: BlockId,
    },
    CondBr {
        condition: ValueRef,
        true_block: BlockId,
        false_block: BlockId,
    },
    Ret {
        handled: bool,
    },
    Match {
        class: MatchClass,
        condition: ValueRef,
        cases: Vec<(ConstId, BlockId)>,
        else_block: BlockId,
    },
}

impl InstrOp {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstrOp::Br { .. } | InstrOp::CondBr { .. } | InstrOp::Ret { .. } | InstrOp::Match { .. }
        )
    }

    /// Whether removing this instruction could change behaviour even
    /// if its result is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            InstrOp::Store { .. }
                | InstrOp::Call { .. }
                | InstrOp::HandlerCall { .. }
                | InstrOp::RegexGroup { .. }
        ) || self.is_terminator()
    }

    pub fn operands(&self) -> Vec<ValueRef> {
        match self {
            InstrOp::Alloca | InstrOp::Ret { .. } | InstrOp::Br { .. } => Vec::new(),
            InstrOp::Load { source } => vec![*source],
            InstrOp::Store { target, value } => vec![*target, *value],
            InstrOp::Unary { operand, .. } => vec![*operand],
            InstrOp::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstrOp::Cast { source } => vec![*source],
            InstrOp::SSubStr {
                string,
                offset,
                count,
            } => vec![*string, *offset, *count],
            InstrOp::RegexGroup { index } => vec![*index],
            InstrOp::Call { args, .. } | InstrOp::HandlerCall { args, .. } => args.clone(),
            InstrOp::Phi { inputs } => inputs.iter().map(|(v, _)| *v).collect(),
            InstrOp::CondBr { condition, .. } => vec![*condition],
            InstrOp::Match { condition, .. } => vec![*condition],
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueRef)) {
        match self {
            InstrOp::Alloca | InstrOp::Ret { .. } | InstrOp::Br { .. } => {}
            InstrOp::Load { source } => f(source),
            InstrOp::Store { target, value } => {
                f(target);
                f(value);
            }
            InstrOp::Unary { operand, .. } => f(operand),
            InstrOp::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstrOp::Cast { source } => f(source),
            InstrOp::SSubStr {
                string,
                offset,
                count,
            } => {
                f(string);
                f(offset);
                f(count);
            }
            InstrOp::RegexGroup { index } => f(index),
            InstrOp::Call { args, .. } | InstrOp::HandlerCall { args, .. } => {
                for arg in args {
                    f(arg);
                }
            }
            InstrOp::Phi { inputs } => {
                for (v, _) in inputs {
                    f(v);
                }
            }
            InstrOp::CondBr { condition, .. } => f(condition),
            InstrOp::Match { condition, .. } => f(condition),
        }
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstrOp::Br { target } => vec![*target],
            InstrOp::CondBr {
                true_block,
                false_block,
                ..
            } => vec![*true_block, *false_block],
            InstrOp::Match {
                cases, else_block, ..
            } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*else_block);
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            InstrOp::Br { target } => f(target),
            InstrOp::CondBr {
                true_block,
                false_block,
                ..
            } => {
                f(true_block);
                f(false_block);
            }
            InstrOp::Match {
                cases, else_block, ..
            } => {
                for (_, block) in cases {
                    f(block);
                }
                f(else_block);
            }
            InstrOp::Phi { inputs } => {
                for (_, block) in inputs {
                    f(block);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub op: InstrOp,
    /// Result type; `Void` for terminators and effect-only
    /// instructions.
    pub ty: LiteralType,
    /// Debug label carried into dumps.
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub label: String,
    pub instrs: Vec<InstrId>,
}

#[derive(Debug)]
pub struct IRHandler {
    pub name: String,
    /// blocks[0] is the entry block.
    pub blocks: Vec<Block>,
    /// Instruction arena; blocks reference into it.
    pub instrs: Vec<Instr>,
}

impl IRHandler {
    pub fn new(name: impl Into<String>) -> Self {
        IRHandler {
            name: name.into(),
            blocks: Vec::new(),
            instrs: Vec::new(),
        }
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    pub fn terminator_of(&self, block: BlockId) -> Option<InstrId> {
        let last = *self.blocks[block].instrs.last()?;
        if self.instrs[last].op.is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator_of(block) {
            Some(t) => self.instrs[t].op.successors(),
            None => Vec::new(),
        }
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in 0..self.blocks.len() {
            for succ in self.successors(block) {
                if !preds[succ].contains(&block) {
                    preds[succ].push(block);
                }
            }
        }
        preds
    }

    /// Checks the structural invariants: every block ends in exactly
    /// one terminator, terminators appear only at block ends, and all
    /// referenced blocks exist.
    pub fn verify(&self) -> Result<(), String> {
        for (id, block) in self.blocks.iter().enumerate() {
            let Some(&last) = block.instrs.last() else {
                return Err(format!("block {} ({}) is empty", id, block.label));
            };
            if !self.instrs[last].op.is_terminator() {
                return Err(format!(
                    "block {} ({}) does not end in a terminator",
                    id, block.label
                ));
            }
            for &instr in &block.instrs[..block.instrs.len() - 1] {
                if self.instrs[instr].op.is_terminator() {
                    return Err(format!(
                        "block {} ({}) has a terminator before its end",
                        id, block.label
                    ));
                }
            }
            for succ in self.instrs[last].op.successors() {
                if succ >= self.blocks.len() {
                    return Err(format!(
                        "block {} ({}) branches to missing block {}",
                        id, block.label, succ
                    ));
                }
            }
        }
        Ok(())
    }

    /// Drops every block whose `keep` flag is false, remapping branch
    /// targets. The entry block must be kept.
    pub fn retain_blocks(&mut self, keep: &[bool]) {
        debug_assert!(keep.first().copied().unwrap_or(false));
        let mut remap = vec![usize::MAX; self.blocks.len()];
        let mut next = 0;
        for (old, &k) in keep.iter().enumerate() {
            if k {
                remap[old] = next;
                next += 1;
            }
        }

        let mut index = 0;
        self.blocks.retain(|_| {
            let kept = keep[index];
            index += 1;
            kept
        });

        for instr in &mut self.instrs {
            // orphaned arena entries may point at blocks dropped by an
            // earlier pass; they stay orphaned
            instr.op.for_each_successor_mut(|block| {
                *block = remap.get(*block).copied().unwrap_or(usize::MAX);
            });
        }
    }
}

#[derive(Debug, Default)]
pub struct IRProgram {
    pub constants: Vec<IrConst>,
    pub handlers: Vec<IRHandler>,
    pub native_functions: Vec<Signature>,
    pub native_handlers: Vec<Signature>,
    pub modules: Vec<(String, Option<String>)>,
}

impl IRProgram {
    pub fn new() -> Self {
        IRProgram::default()
    }

    pub fn intern(&mut self, value: IrConst) -> ConstId {
        if let Some(i) = self.constants.iter().position(|c| *c == value) {
            return i;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn constant(&self, id: ConstId) -> &IrConst {
        &self.constants[id]
    }

    pub fn value_ty(&self, handler: &IRHandler, value: ValueRef) -> LiteralType {
        match value {
            ValueRef::Const(c) => self.constants[c].ty(),
            ValueRef::Instr(i) => handler.instrs[i].ty,
        }
    }

    /// Registers a native function signature, returning its index.
    pub fn make_native_function(&mut self, signature: &Signature) -> usize {
        if let Some(i) = self.native_functions.iter().position(|s| s == signature) {
            return i;
        }
        self.native_functions.push(signature.clone());
        self.native_functions.len() - 1
    }

    pub fn make_native_handler(&mut self, signature: &Signature) -> usize {
        if let Some(i) = self.native_handlers.iter().position(|s| s == signature) {
            return i;
        }
        self.native_handlers.push(signature.clone());
        self.native_handlers.len() - 1
    }

    /// Textual listing for debugging and `flowc build --dump-ir`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for handler in &self.handlers {
            let _ = writeln!(out, "handler {}:", handler.name);
            for (block_id, block) in handler.blocks.iter().enumerate() {
                let _ = writeln!(out, "  %b{}: ; {}", block_id, block.label);
                for &instr_id in &block.instrs {
                    let instr = &handler.instrs[instr_id];
                    let _ = writeln!(
                        out,
                        "    %{} = {} ; {}",
                        instr_id,
                        self.render_op(&instr.op),
                        instr.ty
                    );
                }
            }
            let _ = writeln!(out);
        }
        out
    }

    fn render_value(&self, value: ValueRef) -> String {
        match value {
            ValueRef::Instr(i) => format!("%{}", i),
            ValueRef::Const(c) => match &self.constants[c] {
                IrConst::Number(n) => format!("{}", n),
                IrConst::Boolean(b) => format!("{}", b),
                IrConst::String(s) => format!("{:?}", s),
                IrConst::IPAddress(ip) => format!("{}", ip),
                IrConst::Cidr(cidr) => format!("{}", cidr),
                IrConst::RegExp(re) => format!("{}", re),
                other => format!("const #{} ({})", c, other.ty()),
            },
        }
    }

    fn render_op(&self, op: &InstrOp) -> String {
        match op {
            InstrOp::Alloca => "alloca".to_string(),
            InstrOp::Load { source } => format!("load {}", self.render_value(*source)),
            InstrOp::Store { target, value } => format!(
                "store {} <- {}",
                self.render_value(*target),
                self.render_value(*value)
            ),
            InstrOp::Unary { op, operand } => {
                format!("{:?} {}", op, self.render_value(*operand))
            }
            InstrOp::Binary { op, lhs, rhs } => format!(
                "{:?} {}, {}",
                op,
                self.render_value(*lhs),
                self.render_value(*rhs)
            ),
            InstrOp::Cast { source } => format!("cast {}", self.render_value(*source)),
            InstrOp::SSubStr {
                string,
                offset,
                count,
            } => format!(
                "substr {}, {}, {}",
                self.render_value(*string),
                self.render_value(*offset),
                self.render_value(*count)
            ),
            InstrOp::RegexGroup { index } => {
                format!("regexgroup {}", self.render_value(*index))
            }
            InstrOp::Call { callee, args } => format!(
                "call @{} ({})",
                self.native_functions
                    .get(*callee)
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| format!("#{}", callee)),
                args.iter()
                    .map(|a| self.render_value(*a))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            InstrOp::HandlerCall { callee, args } => format!(
                "invoke @{} ({})",
                self.native_handlers
                    .get(*callee)
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| format!("#{}", callee)),
                args.iter()
                    .map(|a| self.render_value(*a))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            InstrOp::Phi { inputs } => format!(
                "phi {}",
                inputs
                    .iter()
                    .map(|(v, b)| format!("[{}, %b{}]", self.render_value(*v), b))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            InstrOp::Br { target } => format!("br %b{}", target),
            InstrOp::CondBr {
                condition,
                true_block,
                false_block,
            } => format!(
                "condbr {}, %b{}, %b{}",
                self.render_value(*condition),
                true_block,
                false_block
            ),
            InstrOp::Ret { handled } => format!("ret {}", handled),
            InstrOp::Match {
                class,
                condition,
                cases,
                else_block,
            } => format!(
                "match.{:?} {} [{}] else %b{}",
                class,
                self.render_value(*condition),
                cases
                    .iter()
                    .map(|(c, b)| format!("{} -> %b{}", self.render_value(ValueRef::Const(*c)), b))
                    .collect::<Vec<_>>()
                    .join(", "),
                else_block
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_with_diamond() -> IRHandler {
        let mut h = IRHandler::new("t");
        h.blocks = vec![
            Block {
                label: "entry".into(),
                instrs: vec![0],
            },
            Block {
                label: "then".into(),
                instrs: vec![1],
            },
            Block {
                label: "else".into(),
                instrs: vec![2],
            },
            Block {
                label: "cont".into(),
                instrs: vec![3],
            },
        ];
        h.instrs = vec![
            Instr {
                op: InstrOp::CondBr {
                    condition: ValueRef::Const(0),
                    true_block: 1,
                    false_block: 2,
                },
                ty: LiteralType::Void,
                label: String::new(),
            },
            Instr {
                op: InstrOp::Br { target: 3 },
                ty: LiteralType::Void,
                label: String::new(),
            },
            Instr {
                op: InstrOp::Br { target: 3 },
                ty: LiteralType::Void,
                label: String::new(),
            },
            Instr {
                op: InstrOp::Ret { handled: false },
                ty: LiteralType::Void,
                label: String::new(),
            },
        ];
        h
    }

    #[test]
    fn test_successors_and_predecessors() {
        let h = handler_with_diamond();
        assert_eq!(h.successors(0), vec![1, 2]);
        assert_eq!(h.successors(1), vec![3]);
        let preds = h.predecessors();
        assert_eq!(preds[3], vec![1, 2]);
        assert!(preds[0].is_empty());
    }

    #[test]
    fn test_verify_accepts_well_formed() {
        let h = handler_with_diamond();
        assert!(h.verify().is_ok());
    }

    #[test]
    fn test_verify_rejects_missing_terminator() {
        let mut h = handler_with_diamond();
        h.blocks[1].instrs.clear();
        h.instrs.push(Instr {
            op: InstrOp::Alloca,
            ty: LiteralType::Number,
            label: String::new(),
        });
        h.blocks[1].instrs.push(h.instrs.len() - 1);
        let err = h.verify().unwrap_err();
        assert!(err.contains("does not end in a terminator"));
    }

    #[test]
    fn test_retain_blocks_remaps_targets() {
        let mut h = handler_with_diamond();
        // drop the unreachable-looking "else" block (2) after
        // redirecting the condbr
        h.instrs[0].op = InstrOp::CondBr {
            condition: ValueRef::Const(0),
            true_block: 1,
            false_block: 1,
        };
        h.retain_blocks(&[true, true, false, true]);
        assert_eq!(h.blocks.len(), 3);
        // old block 3 is now block 2
        assert_eq!(h.successors(1), vec![2]);
    }

    #[test]
    fn test_constant_interning() {
        let mut program = IRProgram::new();
        let a = program.intern(IrConst::Number(42));
        let b = program.intern(IrConst::Number(42));
        let c = program.intern(IrConst::String("42".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_native_tables_deduplicate() {
        let mut program = IRProgram::new();
        let sig = Signature::new("log", LiteralType::Void, vec![LiteralType::String]);
        assert_eq!(program.make_native_function(&sig), 0);
        assert_eq!(program.make_native_function(&sig), 0);
        assert_eq!(program.native_functions.len(), 1);
    }
}
