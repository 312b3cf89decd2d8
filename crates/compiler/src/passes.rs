//! IR optimisation passes.
//!
//! The [`PassManager`] runs its pass list over every handler until a
//! fixed point. Passes preserve block termination, dominance of
//! operands, and operand types.

use crate::ir::{IRHandler, IRProgram, InstrId, InstrOp, IrConst, UnaryIrOp, ValueRef};
use crate::ir::BinaryIrOp;
use tracing::{debug, trace};

pub trait HandlerPass {
    fn name(&self) -> &'static str;
    /// Runs once over one handler; returns whether anything changed.
    fn run(&self, constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool;
}

pub struct PassManager {
    passes: Vec<Box<dyn HandlerPass>>,
}

impl PassManager {
    pub fn new() -> Self {
        PassManager { passes: Vec::new() }
    }

    /// The standard pass sequence.
    pub fn standard() -> Self {
        let mut pm = PassManager::new();
        pm.register(Box::new(EmptyBlockElimination));
        pm.register(Box::new(UnusedBlockPass));
        pm.register(Box::new(MergeBlockPass));
        pm.register(Box::new(InstructionElimination));
        pm
    }

    pub fn register(&mut self, pass: Box<dyn HandlerPass>) {
        self.passes.push(pass);
    }

    /// Runs all passes on every handler until a fixed point (bounded
    /// against oscillating passes).
    pub fn run(&self, program: &mut IRProgram) {
        let constants = &mut program.constants;
        for handler in &mut program.handlers {
            let mut rounds = 0;
            loop {
                let mut changed = false;
                for pass in &self.passes {
                    if pass.run(constants, handler) {
                        trace!(pass = pass.name(), handler = %handler.name, "pass changed IR");
                        changed = true;
                    }
                }
                rounds += 1;
                if !changed || rounds >= 100 {
                    break;
                }
            }
            debug!(handler = %handler.name, rounds, "optimised");
        }
    }
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager::standard()
    }
}

/// Removes blocks whose only instruction is an unconditional branch,
/// rewriting every predecessor to jump straight to the target.
pub struct EmptyBlockElimination;

impl HandlerPass for EmptyBlockElimination {
    fn name(&self) -> &'static str {
        "EmptyBlockElimination"
    }

    fn run(&self, _constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool {
        for block in 1..handler.blocks.len() {
            if handler.blocks[block].instrs.len() != 1 {
                continue;
            }
            let instr = handler.blocks[block].instrs[0];
            let InstrOp::Br { target } = handler.instrs[instr].op else {
                continue;
            };
            if target == block {
                continue;
            }

            for i in &mut handler.instrs {
                i.op.for_each_successor_mut(|succ| {
                    if *succ == block {
                        *succ = target;
                    }
                });
            }

            let mut keep = vec![true; handler.blocks.len()];
            keep[block] = false;
            handler.retain_blocks(&keep);
            return true;
        }
        false
    }
}

/// Removes blocks not reachable from the entry block.
pub struct UnusedBlockPass;

impl HandlerPass for UnusedBlockPass {
    fn name(&self) -> &'static str {
        "UnusedBlockPass"
    }

    fn run(&self, _constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool {
        if handler.blocks.is_empty() {
            return false;
        }
        let mut reachable = vec![false; handler.blocks.len()];
        let mut stack = vec![0usize];
        while let Some(block) = stack.pop() {
            if reachable[block] {
                continue;
            }
            reachable[block] = true;
            for succ in handler.successors(block) {
                stack.push(succ);
            }
        }

        if reachable.iter().all(|&r| r) {
            return false;
        }
        handler.retain_blocks(&reachable);
        true
    }
}

/// Merges a block into its single successor when that successor has
/// exactly one predecessor.
pub struct MergeBlockPass;

impl HandlerPass for MergeBlockPass {
    fn name(&self) -> &'static str {
        "MergeBlockPass"
    }

    fn run(&self, _constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool {
        let preds = handler.predecessors();
        for block in 0..handler.blocks.len() {
            let Some(terminator) = handler.terminator_of(block) else {
                continue;
            };
            let InstrOp::Br { target } = handler.instrs[terminator].op else {
                continue;
            };
            if target == 0 || target == block || preds[target] != vec![block] {
                continue;
            }

            // drop the branch, splice the successor's instructions in
            handler.blocks[block].instrs.pop();
            let spliced = std::mem::take(&mut handler.blocks[target].instrs);
            handler.blocks[block].instrs.extend(spliced);

            let mut keep = vec![true; handler.blocks.len()];
            keep[target] = false;
            handler.retain_blocks(&keep);
            return true;
        }
        false
    }
}

/// Constant-folds arithmetic and comparisons and removes dead values.
/// Calls (and stores to slots that are still read) survive; a store
/// into a slot nothing loads is dead.
pub struct InstructionElimination;

impl HandlerPass for InstructionElimination {
    fn name(&self) -> &'static str {
        "InstructionElimination"
    }

    fn run(&self, constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool {
        fold_constants(constants, handler) | eliminate_dead_values(handler)
    }
}

fn intern(constants: &mut Vec<IrConst>, value: IrConst) -> usize {
    if let Some(i) = constants.iter().position(|c| *c == value) {
        return i;
    }
    constants.push(value);
    constants.len() - 1
}

fn fold_constants(constants: &mut Vec<IrConst>, handler: &mut IRHandler) -> bool {
    for block in 0..handler.blocks.len() {
        for index in 0..handler.blocks[block].instrs.len() {
            let instr_id = handler.blocks[block].instrs[index];
            let folded = match &handler.instrs[instr_id].op {
                InstrOp::Binary { op, lhs, rhs } => {
                    let (ValueRef::Const(a), ValueRef::Const(b)) = (*lhs, *rhs) else {
                        continue;
                    };
                    fold_binary(*op, &constants[a], &constants[b])
                }
                InstrOp::Unary { op, operand } => {
                    let ValueRef::Const(a) = *operand else {
                        continue;
                    };
                    fold_unary(*op, &constants[a])
                }
                _ => None,
            };
            let Some(folded) = folded else {
                continue;
            };

            let constant = ValueRef::Const(intern(constants, folded));
            for other in &mut handler.instrs {
                other.op.for_each_operand_mut(|operand| {
                    if *operand == ValueRef::Instr(instr_id) {
                        *operand = constant;
                    }
                });
            }
            // indices shift after removal; fold the rest next round
            handler.blocks[block].instrs.remove(index);
            return true;
        }
    }
    false
}

fn fold_binary(op: BinaryIrOp, lhs: &IrConst, rhs: &IrConst) -> Option<IrConst> {
    use BinaryIrOp::*;
    match (lhs, rhs) {
        (IrConst::Number(a), IrConst::Number(b)) => {
            let (a, b) = (*a, *b);
            let number = |n: i64| Some(IrConst::Number(n));
            let boolean = |v: bool| Some(IrConst::Boolean(v));
            match op {
                NAdd => number(a.wrapping_add(b)),
                NSub => number(a.wrapping_sub(b)),
                NMul => number(a.wrapping_mul(b)),
                NDiv if b != 0 => number(a.wrapping_div(b)),
                NRem if b != 0 => number(a.wrapping_rem(b)),
                NShl => number(a.wrapping_shl(b as u32)),
                NShr => number(a.wrapping_shr(b as u32)),
                NAnd => number(a & b),
                NOr => number(a | b),
                NXor => number(a ^ b),
                NCmpEq => boolean(a == b),
                NCmpNe => boolean(a != b),
                NCmpLe => boolean(a <= b),
                NCmpGe => boolean(a >= b),
                NCmpLt => boolean(a < b),
                NCmpGt => boolean(a > b),
                _ => None,
            }
        }
        (IrConst::Boolean(a), IrConst::Boolean(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BAnd => Some(IrConst::Boolean(a && b)),
                BOr => Some(IrConst::Boolean(a || b)),
                BXor => Some(IrConst::Boolean(a ^ b)),
                NCmpEq => Some(IrConst::Boolean(a == b)),
                NCmpNe => Some(IrConst::Boolean(a != b)),
                _ => None,
            }
        }
        (IrConst::String(a), IrConst::String(b)) => match op {
            SAdd => Some(IrConst::String(format!("{}{}", a, b))),
            SCmpEq => Some(IrConst::Boolean(a == b)),
            SCmpNe => Some(IrConst::Boolean(a != b)),
            SCmpLe => Some(IrConst::Boolean(a <= b)),
            SCmpGe => Some(IrConst::Boolean(a >= b)),
            SCmpLt => Some(IrConst::Boolean(a < b)),
            SCmpGt => Some(IrConst::Boolean(a > b)),
            SCmpBeg => Some(IrConst::Boolean(a.starts_with(b.as_str()))),
            SCmpEnd => Some(IrConst::Boolean(a.ends_with(b.as_str()))),
            SContains => Some(IrConst::Boolean(a.contains(b.as_str()))),
            _ => None,
        },
        _ => None,
    }
}

fn fold_unary(op: UnaryIrOp, operand: &IrConst) -> Option<IrConst> {
    match (op, operand) {
        (UnaryIrOp::NNeg, IrConst::Number(n)) => Some(IrConst::Number(n.wrapping_neg())),
        (UnaryIrOp::NNot, IrConst::Number(n)) => Some(IrConst::Number(!n)),
        (UnaryIrOp::BNot, IrConst::Boolean(b)) => Some(IrConst::Boolean(!b)),
        (UnaryIrOp::SLen, IrConst::String(s)) => Some(IrConst::Number(s.len() as i64)),
        (UnaryIrOp::SIsEmpty, IrConst::String(s)) => Some(IrConst::Boolean(s.is_empty())),
        _ => None,
    }
}

fn eliminate_dead_values(handler: &mut IRHandler) -> bool {
    let live: Vec<InstrId> = handler
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter().copied())
        .collect();

    // use counts over the live instructions only
    let mut uses = vec![0usize; handler.instrs.len()];
    let mut loaded = vec![false; handler.instrs.len()];
    for &id in &live {
        for operand in handler.instrs[id].op.operands() {
            if let ValueRef::Instr(used) = operand {
                uses[used] += 1;
            }
        }
        if let InstrOp::Load {
            source: ValueRef::Instr(slot),
        } = handler.instrs[id].op
        {
            loaded[slot] = true;
        }
    }

    let mut dead = Vec::new();
    for &id in &live {
        let instr = &handler.instrs[id];
        if instr.op.is_terminator() {
            continue;
        }
        match &instr.op {
            // a store into a slot nothing reads is dead
            InstrOp::Store {
                target: ValueRef::Instr(slot),
                ..
            } if !loaded[*slot] => dead.push(id),
            op if !op.has_side_effects() && uses[id] == 0 => dead.push(id),
            _ => {}
        }
    }

    if dead.is_empty() {
        return false;
    }
    for block in &mut handler.blocks {
        block.instrs.retain(|id| !dead.contains(id));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Block;
    use crate::ir::Instr;
    use flow_core::LiteralType;

    fn instr(op: InstrOp, ty: LiteralType) -> Instr {
        Instr {
            op,
            ty,
            label: String::new(),
        }
    }

    /// entry -> trampoline -> exit, where trampoline is only a branch.
    fn handler_with_trampoline() -> IRHandler {
        let mut h = IRHandler::new("t");
        h.instrs = vec![
            instr(InstrOp::Br { target: 1 }, LiteralType::Void),
            instr(InstrOp::Br { target: 2 }, LiteralType::Void),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![
            Block {
                label: "entry".into(),
                instrs: vec![0],
            },
            Block {
                label: "trampoline".into(),
                instrs: vec![1],
            },
            Block {
                label: "exit".into(),
                instrs: vec![2],
            },
        ];
        h
    }

    #[test]
    fn test_empty_block_elimination_redirects() {
        let mut h = handler_with_trampoline();
        let mut constants = Vec::new();
        assert!(EmptyBlockElimination.run(&mut constants, &mut h));
        h.verify().unwrap();
        // entry now branches straight to exit
        assert_eq!(h.successors(0), vec![1]);
        assert_eq!(h.blocks.len(), 2);
    }

    #[test]
    fn test_unused_block_pass_drops_unreachable() {
        let mut h = handler_with_trampoline();
        // orphan block
        h.instrs
            .push(instr(InstrOp::Ret { handled: true }, LiteralType::Void));
        h.blocks.push(Block {
            label: "orphan".into(),
            instrs: vec![3],
        });

        let mut constants = Vec::new();
        assert!(UnusedBlockPass.run(&mut constants, &mut h));
        assert_eq!(h.blocks.len(), 3);
        assert!(!UnusedBlockPass.run(&mut constants, &mut h));
    }

    #[test]
    fn test_merge_block_pass() {
        let mut h = handler_with_trampoline();
        let mut constants = Vec::new();
        // merging entry+trampoline, then the result with exit
        assert!(MergeBlockPass.run(&mut constants, &mut h));
        assert!(MergeBlockPass.run(&mut constants, &mut h));
        assert!(!MergeBlockPass.run(&mut constants, &mut h));
        h.verify().unwrap();
        assert_eq!(h.blocks.len(), 1);
        // the surviving block ends in the original return
        let last = *h.blocks[0].instrs.last().unwrap();
        assert!(matches!(h.instrs[last].op, InstrOp::Ret { handled: false }));
    }

    #[test]
    fn test_constant_folding_replaces_uses() {
        let mut constants = vec![IrConst::Number(2), IrConst::Number(3)];
        let mut h = IRHandler::new("t");
        h.instrs = vec![
            instr(
                InstrOp::Binary {
                    op: BinaryIrOp::NAdd,
                    lhs: ValueRef::Const(0),
                    rhs: ValueRef::Const(1),
                },
                LiteralType::Number,
            ),
            instr(InstrOp::Alloca, LiteralType::Number),
            instr(
                InstrOp::Store {
                    target: ValueRef::Instr(1),
                    value: ValueRef::Instr(0),
                },
                LiteralType::Void,
            ),
            instr(
                InstrOp::Load {
                    source: ValueRef::Instr(1),
                },
                LiteralType::Number,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2, 3, 4],
        }];

        assert!(InstructionElimination.run(&mut constants, &mut h));
        // the add is gone and the store now references the folded 5
        assert!(constants.contains(&IrConst::Number(5)));
        let store = h
            .instrs
            .iter()
            .find_map(|i| match &i.op {
                InstrOp::Store { value, .. } => Some(*value),
                _ => None,
            })
            .unwrap();
        assert!(matches!(store, ValueRef::Const(c) if constants[c] == IrConst::Number(5)));
    }

    #[test]
    fn test_dead_store_elimination() {
        let mut constants = vec![IrConst::Number(7)];
        let mut h = IRHandler::new("t");
        h.instrs = vec![
            instr(InstrOp::Alloca, LiteralType::Number),
            instr(
                InstrOp::Store {
                    target: ValueRef::Instr(0),
                    value: ValueRef::Const(0),
                },
                LiteralType::Void,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2],
        }];

        // nothing ever loads the slot: store dies, then the alloca
        assert!(InstructionElimination.run(&mut constants, &mut h));
        assert!(InstructionElimination.run(&mut constants, &mut h));
        assert_eq!(h.blocks[0].instrs.len(), 1);
    }

    #[test]
    fn test_calls_are_not_eliminated() {
        let mut constants = Vec::new();
        let mut h = IRHandler::new("t");
        h.instrs = vec![
            instr(
                InstrOp::Call {
                    callee: 0,
                    args: Vec::new(),
                },
                LiteralType::Number,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1],
        }];

        assert!(!InstructionElimination.run(&mut constants, &mut h));
        assert_eq!(h.blocks[0].instrs.len(), 2);
    }

    #[test]
    fn test_fixed_point_is_idempotent() {
        let mut program = IRProgram::new();
        program.constants = vec![IrConst::Number(2), IrConst::Number(3)];
        let mut h = handler_with_trampoline();
        h.instrs.push(instr(
            InstrOp::Binary {
                op: BinaryIrOp::NMul,
                lhs: ValueRef::Const(0),
                rhs: ValueRef::Const(1),
            },
            LiteralType::Number,
        ));
        h.blocks[0].instrs.insert(0, 3);
        program.handlers.push(h);

        let pm = PassManager::standard();
        pm.run(&mut program);
        let once = program.handlers[0].blocks.clone();

        pm.run(&mut program);
        let twice = program.handlers[0].blocks.clone();

        assert_eq!(
            once.iter().map(|b| &b.instrs).collect::<Vec<_>>(),
            twice.iter().map(|b| &b.instrs).collect::<Vec<_>>()
        );
        program.handlers[0].verify().unwrap();
    }
}
