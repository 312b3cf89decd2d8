//! Target-code generation: linearises the IR into stack-machine
//! bytecode.
//!
//! Allocas and used SSA results are assigned fixed stack slots,
//! reserved by one `ALLOCA` at handler entry; operands are duplicated
//! to the top with `LOAD` (constants with their type-specific load
//! opcodes), results stored back with `STORE`. Branches to the block
//! emitted next fall through. Jump and match-case targets are patched
//! after every block's starting PC is known.

use crate::ir::{
    BinaryIrOp, BlockId, IRHandler, IRProgram, InstrId, InstrOp, IrConst, UnaryIrOp, ValueRef,
};
use flow_core::LiteralType;
use flow_vm::instruction::{make_instr, Instruction, Opcode};
use flow_vm::pool::PoolError;
use flow_vm::{ConstantPool, Handler, MatchCaseDef, MatchClass, MatchDef, Program};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

#[derive(Debug)]
pub enum CodegenError {
    Pool(PoolError),
    IllegalCast {
        from: LiteralType,
        to: LiteralType,
    },
    /// Phi nodes must have been rewritten before code generation.
    PhiNotLowered,
    HandlerTooLarge(String),
    TooManySlots(String),
    Internal(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Pool(e) => write!(f, "{}", e),
            CodegenError::IllegalCast { from, to } => {
                write!(f, "illegal cast from {} to {}", from, to)
            }
            CodegenError::PhiNotLowered => {
                write!(f, "phi nodes must be eliminated before code generation")
            }
            CodegenError::HandlerTooLarge(name) => {
                write!(f, "handler '{}' exceeds the addressable code size", name)
            }
            CodegenError::TooManySlots(name) => {
                write!(f, "handler '{}' exceeds the addressable stack slots", name)
            }
            CodegenError::Internal(message) => write!(f, "internal codegen error: {}", message),
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<PoolError> for CodegenError {
    fn from(e: PoolError) -> Self {
        CodegenError::Pool(e)
    }
}

/// Generates the executable [`Program`] for an IR program.
pub fn codegen(ir: &IRProgram) -> Result<Program, CodegenError> {
    let mut pool = ConstantPool::new();
    let mut match_defs = Vec::new();
    let mut handlers = Vec::new();

    for (handler_id, handler) in ir.handlers.iter().enumerate() {
        let mut generator = HandlerCodegen::new(ir, handler, handler_id);
        let compiled = generator.generate(&mut pool, &mut match_defs)?;
        debug!(
            handler = %handler.name,
            instructions = compiled.code.len(),
            stack = compiled.stack_size,
            "generated bytecode"
        );
        handlers.push(compiled);
    }

    Ok(Program::new(
        pool,
        handlers,
        match_defs,
        ir.native_functions.clone(),
        ir.native_handlers.clone(),
        ir.modules.clone(),
    ))
}

struct CondFixup {
    pc: usize,
    opcode: Opcode,
    target: BlockId,
}

struct MatchFixup {
    def_index: usize,
    case_blocks: Vec<BlockId>,
    else_block: BlockId,
}

struct HandlerCodegen<'a> {
    ir: &'a IRProgram,
    handler: &'a IRHandler,
    handler_id: usize,

    code: Vec<Instruction>,
    slots: HashMap<InstrId, u16>,
    slot_count: u16,
    depth: i64,
    max_depth: i64,
    block_pcs: Vec<usize>,
    cond_fixups: Vec<CondFixup>,
    jump_fixups: Vec<(usize, BlockId)>,
    match_fixups: Vec<MatchFixup>,
}

impl<'a> HandlerCodegen<'a> {
    fn new(ir: &'a IRProgram, handler: &'a IRHandler, handler_id: usize) -> Self {
        HandlerCodegen {
            ir,
            handler,
            handler_id,
            code: Vec::new(),
            slots: HashMap::new(),
            slot_count: 0,
            depth: 0,
            max_depth: 0,
            block_pcs: Vec::new(),
            cond_fixups: Vec::new(),
            jump_fixups: Vec::new(),
            match_fixups: Vec::new(),
        }
    }

    fn generate(
        &mut self,
        pool: &mut ConstantPool,
        match_defs: &mut Vec<MatchDef>,
    ) -> Result<Handler, CodegenError> {
        self.assign_slots()?;

        if self.slot_count > 0 {
            self.emit(Opcode::Alloca, self.slot_count, 0, 0);
        }
        self.depth = 0;
        self.max_depth = 0;

        for block_id in 0..self.handler.blocks.len() {
            self.block_pcs.push(self.code.len());
            self.depth = 0;
            let instr_ids = self.handler.blocks[block_id].instrs.clone();
            for instr_id in instr_ids {
                self.emit_instr(instr_id, block_id, pool, match_defs)?;
            }
        }

        self.resolve_fixups(match_defs)?;

        let stack_size = usize::from(self.slot_count) + self.max_depth.max(0) as usize;
        Ok(Handler {
            name: self.handler.name.clone(),
            stack_size,
            code: std::mem::take(&mut self.code),
        })
    }

    /// Allocas and every used non-void result get a fixed stack slot.
    fn assign_slots(&mut self) -> Result<(), CodegenError> {
        let mut uses: HashMap<InstrId, usize> = HashMap::new();
        for block in &self.handler.blocks {
            for &id in &block.instrs {
                for operand in self.handler.instrs[id].op.operands() {
                    if let ValueRef::Instr(used) = operand {
                        *uses.entry(used).or_default() += 1;
                    }
                }
            }
        }

        for block in &self.handler.blocks {
            for &id in &block.instrs {
                let instr = &self.handler.instrs[id];
                let needs_slot = match instr.op {
                    InstrOp::Alloca => true,
                    _ => {
                        !instr.op.is_terminator()
                            && instr.ty != LiteralType::Void
                            && uses.get(&id).copied().unwrap_or(0) > 0
                    }
                };
                if needs_slot {
                    if self.slot_count == u16::MAX {
                        return Err(CodegenError::TooManySlots(self.handler.name.clone()));
                    }
                    self.slots.insert(id, self.slot_count);
                    self.slot_count += 1;
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, op: Opcode, a: u16, b: u16, c: u16) -> usize {
        self.code.push(make_instr(op, a, b, c));
        self.code.len() - 1
    }

    fn bump(&mut self, delta: i64) {
        self.depth += delta;
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Pushes an operand onto the evaluation stack.
    fn emit_load(&mut self, value: ValueRef, pool: &mut ConstantPool) -> Result<(), CodegenError> {
        match value {
            ValueRef::Instr(id) => {
                let slot = *self.slots.get(&id).ok_or_else(|| {
                    CodegenError::Internal(format!("value %{} has no stack slot", id))
                })?;
                self.emit(Opcode::Load, slot, 0, 0);
            }
            ValueRef::Const(c) => match self.ir.constant(c) {
                IrConst::Number(n) => {
                    if i16::try_from(*n).is_ok() {
                        self.emit(Opcode::ILoad, *n as i16 as u16, 0, 0);
                    } else {
                        let index = pool.make_number(*n)?;
                        self.emit(Opcode::NLoad, index, 0, 0);
                    }
                }
                IrConst::Boolean(b) => {
                    self.emit(Opcode::ILoad, u16::from(*b), 0, 0);
                }
                IrConst::String(s) => {
                    let index = pool.make_string(s)?;
                    self.emit(Opcode::SLoad, index, 0, 0);
                }
                IrConst::IPAddress(ip) => {
                    let index = pool.make_ipaddr(*ip)?;
                    self.emit(Opcode::PLoad, index, 0, 0);
                }
                IrConst::Cidr(cidr) => {
                    let index = pool.make_cidr(*cidr)?;
                    self.emit(Opcode::CLoad, index, 0, 0);
                }
                // a regexp reference is its pool index
                IrConst::RegExp(re) => {
                    let index = pool.make_regexp(re.clone())?;
                    self.emit(Opcode::ILoad, index, 0, 0);
                }
                IrConst::IntArray(xs) => {
                    let index = pool.make_int_array(xs.clone())?;
                    self.emit(Opcode::ITLoad, index, 0, 0);
                }
                IrConst::StringArray(xs) => {
                    let index = pool.make_string_array(xs.clone())?;
                    self.emit(Opcode::STLoad, index, 0, 0);
                }
                IrConst::IPAddrArray(xs) => {
                    let index = pool.make_ipaddr_array(xs.clone())?;
                    self.emit(Opcode::PTLoad, index, 0, 0);
                }
                IrConst::CidrArray(xs) => {
                    let index = pool.make_cidr_array(xs.clone())?;
                    self.emit(Opcode::CTLoad, index, 0, 0);
                }
            },
        }
        self.bump(1);
        Ok(())
    }

    /// Stores a freshly computed result into its slot, or drops it if
    /// nothing uses it.
    fn store_result(&mut self, id: InstrId) {
        if let Some(&slot) = self.slots.get(&id) {
            self.emit(Opcode::Store, slot, 0, 0);
        } else {
            self.emit(Opcode::Discard, 1, 0, 0);
        }
        self.bump(-1);
    }

    fn next_block_is(&self, current: BlockId, target: BlockId) -> bool {
        target == current + 1
    }

    fn emit_instr(
        &mut self,
        id: InstrId,
        block: BlockId,
        pool: &mut ConstantPool,
        match_defs: &mut Vec<MatchDef>,
    ) -> Result<(), CodegenError> {
        let instr = &self.handler.instrs[id];
        match &instr.op {
            InstrOp::Alloca => {}

            InstrOp::Load { source } => {
                self.emit_load(*source, pool)?;
                self.store_result(id);
            }

            InstrOp::Store { target, value } => {
                self.emit_load(*value, pool)?;
                let ValueRef::Instr(slot_instr) = target else {
                    return Err(CodegenError::Internal(
                        "store target must be an alloca".to_string(),
                    ));
                };
                let slot = *self.slots.get(slot_instr).ok_or_else(|| {
                    CodegenError::Internal(format!("store target %{} has no slot", slot_instr))
                })?;
                self.emit(Opcode::Store, slot, 0, 0);
                self.bump(-1);
            }

            InstrOp::Unary { op, operand } => {
                self.emit_load(*operand, pool)?;
                let opcode = match op {
                    UnaryIrOp::NNeg => Opcode::NNeg,
                    UnaryIrOp::NNot => Opcode::NNot,
                    UnaryIrOp::BNot => Opcode::BNot,
                    UnaryIrOp::SLen => Opcode::SLen,
                    UnaryIrOp::SIsEmpty => Opcode::SIsEmpty,
                };
                self.emit(opcode, 0, 0, 0);
                self.store_result(id);
            }

            InstrOp::Binary { op, lhs, rhs } => {
                if *op == BinaryIrOp::SRegMatch {
                    let ValueRef::Const(c) = rhs else {
                        return Err(CodegenError::Internal(
                            "regex match requires a constant pattern".to_string(),
                        ));
                    };
                    let IrConst::RegExp(re) = self.ir.constant(*c) else {
                        return Err(CodegenError::Internal(
                            "regex match requires a regexp constant".to_string(),
                        ));
                    };
                    let index = pool.make_regexp(re.clone())?;
                    self.emit_load(*lhs, pool)?;
                    self.emit(Opcode::SRegMatch, index, 0, 0);
                    self.store_result(id);
                    return Ok(());
                }

                self.emit_load(*lhs, pool)?;
                self.emit_load(*rhs, pool)?;
                self.emit(binary_opcode(*op), 0, 0, 0);
                self.bump(-1);
                self.store_result(id);
            }

            InstrOp::Cast { source } => {
                let from = self.ir.value_ty(self.handler, *source);
                let to = instr.ty;
                self.emit_load(*source, pool)?;
                if from != to {
                    let opcode = cast_opcode(from, to)
                        .ok_or(CodegenError::IllegalCast { from, to })?;
                    self.emit(opcode, 0, 0, 0);
                }
                self.store_result(id);
            }

            InstrOp::SSubStr {
                string,
                offset,
                count,
            } => {
                self.emit_load(*string, pool)?;
                self.emit_load(*offset, pool)?;
                self.emit_load(*count, pool)?;
                self.emit(Opcode::SSubStr, 0, 0, 0);
                self.bump(-2);
                self.store_result(id);
            }

            InstrOp::RegexGroup { index } => {
                self.emit_load(*index, pool)?;
                self.emit(Opcode::SRegGroup, 0, 0, 0);
                self.store_result(id);
            }

            InstrOp::Call { callee, args } => {
                for arg in args {
                    self.emit_load(*arg, pool)?;
                }
                self.emit(Opcode::Call, *callee as u16, args.len() as u16, 0);
                self.bump(-(args.len() as i64));
                let returns_value = self
                    .ir
                    .native_functions
                    .get(*callee)
                    .map(|s| s.return_type() != LiteralType::Void)
                    .unwrap_or(false);
                if returns_value {
                    self.bump(1);
                    self.store_result(id);
                }
            }

            InstrOp::HandlerCall { callee, args } => {
                for arg in args {
                    self.emit_load(*arg, pool)?;
                }
                self.emit(Opcode::Handler, *callee as u16, args.len() as u16, 0);
                self.bump(-(args.len() as i64));
            }

            InstrOp::Phi { .. } => return Err(CodegenError::PhiNotLowered),

            InstrOp::Br { target } => {
                // fallthrough optimisation
                if !self.next_block_is(block, *target) {
                    let pc = self.emit(Opcode::Jmp, 0, 0, 0);
                    self.jump_fixups.push((pc, *target));
                }
            }

            InstrOp::CondBr {
                condition,
                true_block,
                false_block,
            } => {
                self.emit_load(*condition, pool)?;
                self.bump(-1);
                if self.next_block_is(block, *true_block) {
                    let pc = self.emit(Opcode::Jz, 0, 0, 0);
                    self.cond_fixups.push(CondFixup {
                        pc,
                        opcode: Opcode::Jz,
                        target: *false_block,
                    });
                } else if self.next_block_is(block, *false_block) {
                    let pc = self.emit(Opcode::Jn, 0, 0, 0);
                    self.cond_fixups.push(CondFixup {
                        pc,
                        opcode: Opcode::Jn,
                        target: *true_block,
                    });
                } else {
                    let pc = self.emit(Opcode::Jn, 0, 0, 0);
                    self.cond_fixups.push(CondFixup {
                        pc,
                        opcode: Opcode::Jn,
                        target: *true_block,
                    });
                    let pc = self.emit(Opcode::Jmp, 0, 0, 0);
                    self.jump_fixups.push((pc, *false_block));
                }
            }

            InstrOp::Ret { handled } => {
                self.emit(Opcode::Exit, u16::from(*handled), 0, 0);
            }

            InstrOp::Match {
                class,
                condition,
                cases,
                else_block,
            } => {
                let mut def = MatchDef {
                    op: *class,
                    handler_id: self.handler_id,
                    cases: Vec::with_capacity(cases.len()),
                    else_pc: 0,
                };
                let mut case_blocks = Vec::with_capacity(cases.len());
                for (label, target) in cases {
                    let index = match self.ir.constant(*label) {
                        IrConst::String(s) => pool.make_string(s)?,
                        IrConst::RegExp(re) => pool.make_regexp(re.clone())?,
                        other => {
                            return Err(CodegenError::Internal(format!(
                                "unsupported match label type {}",
                                other.ty()
                            )));
                        }
                    };
                    def.cases.push(MatchCaseDef {
                        label: index,
                        pc: 0,
                    });
                    case_blocks.push(*target);
                }

                let def_index = match_defs.len();
                match_defs.push(def);
                self.match_fixups.push(MatchFixup {
                    def_index,
                    case_blocks,
                    else_block: *else_block,
                });

                self.emit_load(*condition, pool)?;
                let opcode = match class {
                    MatchClass::Same => Opcode::SMatchEq,
                    MatchClass::Head => Opcode::SMatchBeg,
                    MatchClass::Tail => Opcode::SMatchEnd,
                    MatchClass::RegExp => Opcode::SMatchR,
                };
                self.emit(opcode, def_index as u16, 0, 0);
                self.bump(-1);
            }
        }
        Ok(())
    }

    fn block_pc(&self, block: BlockId) -> Result<u16, CodegenError> {
        let pc = self
            .block_pcs
            .get(block)
            .copied()
            .ok_or_else(|| CodegenError::Internal(format!("missing block {}", block)))?;
        u16::try_from(pc).map_err(|_| CodegenError::HandlerTooLarge(self.handler.name.clone()))
    }

    fn resolve_fixups(&mut self, match_defs: &mut Vec<MatchDef>) -> Result<(), CodegenError> {
        for fixup in std::mem::take(&mut self.cond_fixups) {
            let pc = self.block_pc(fixup.target)?;
            self.code[fixup.pc] = make_instr(fixup.opcode, pc, 0, 0);
        }
        for (at, target) in std::mem::take(&mut self.jump_fixups) {
            let pc = self.block_pc(target)?;
            self.code[at] = make_instr(Opcode::Jmp, pc, 0, 0);
        }
        for fixup in std::mem::take(&mut self.match_fixups) {
            let else_pc = self.block_pc(fixup.else_block)?;
            let def = &mut match_defs[fixup.def_index];
            def.else_pc = usize::from(else_pc);
            for (case, block) in fixup.case_blocks.iter().enumerate() {
                def.cases[case].pc = usize::from(self.block_pc(*block)?);
            }
        }
        Ok(())
    }
}

fn binary_opcode(op: BinaryIrOp) -> Opcode {
    match op {
        BinaryIrOp::NAdd => Opcode::NAdd,
        BinaryIrOp::NSub => Opcode::NSub,
        BinaryIrOp::NMul => Opcode::NMul,
        BinaryIrOp::NDiv => Opcode::NDiv,
        BinaryIrOp::NRem => Opcode::NRem,
        BinaryIrOp::NShl => Opcode::NShl,
        BinaryIrOp::NShr => Opcode::NShr,
        BinaryIrOp::NPow => Opcode::NPow,
        BinaryIrOp::NAnd => Opcode::NAnd,
        BinaryIrOp::NOr => Opcode::NOr,
        BinaryIrOp::NXor => Opcode::NXor,
        BinaryIrOp::NCmpEq => Opcode::NCmpEq,
        BinaryIrOp::NCmpNe => Opcode::NCmpNe,
        BinaryIrOp::NCmpLe => Opcode::NCmpLe,
        BinaryIrOp::NCmpGe => Opcode::NCmpGe,
        BinaryIrOp::NCmpLt => Opcode::NCmpLt,
        BinaryIrOp::NCmpGt => Opcode::NCmpGt,
        BinaryIrOp::BAnd => Opcode::BAnd,
        BinaryIrOp::BOr => Opcode::BOr,
        BinaryIrOp::BXor => Opcode::BXor,
        BinaryIrOp::SAdd => Opcode::SAdd,
        BinaryIrOp::SCmpEq => Opcode::SCmpEq,
        BinaryIrOp::SCmpNe => Opcode::SCmpNe,
        BinaryIrOp::SCmpLe => Opcode::SCmpLe,
        BinaryIrOp::SCmpGe => Opcode::SCmpGe,
        BinaryIrOp::SCmpLt => Opcode::SCmpLt,
        BinaryIrOp::SCmpGt => Opcode::SCmpGt,
        BinaryIrOp::SCmpBeg => Opcode::SCmpBeg,
        BinaryIrOp::SCmpEnd => Opcode::SCmpEnd,
        BinaryIrOp::SContains => Opcode::SContains,
        BinaryIrOp::PCmpEq => Opcode::PCmpEq,
        BinaryIrOp::PCmpNe => Opcode::PCmpNe,
        BinaryIrOp::PInCidr => Opcode::PInCidr,
        // handled separately; mapping kept total for safety
        BinaryIrOp::SRegMatch => Opcode::SRegMatch,
    }
}

/// The (source, target) cast table. Same-type casts are plain loads
/// and never reach this table.
fn cast_opcode(from: LiteralType, to: LiteralType) -> Option<Opcode> {
    use LiteralType::*;
    match (from, to) {
        (Number, String) => Some(Opcode::N2S),
        (IPAddress, String) => Some(Opcode::P2S),
        (Cidr, String) => Some(Opcode::C2S),
        (RegExp, String) => Some(Opcode::R2S),
        (String, Number) => Some(Opcode::S2N),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Instr};
    use flow_core::Signature;
    use flow_vm::instruction::{self, opcode_byte};

    fn instr(op: InstrOp, ty: LiteralType) -> Instr {
        Instr {
            op,
            ty,
            label: String::new(),
        }
    }

    fn opcodes_of(handler: &Handler) -> Vec<Opcode> {
        handler
            .code
            .iter()
            .map(|&i| Opcode::from_u8(opcode_byte(i)).unwrap())
            .collect()
    }

    #[test]
    fn test_straightline_arithmetic() {
        let mut ir = IRProgram::new();
        let two = ir.intern(IrConst::Number(2));
        let three = ir.intern(IrConst::Number(3));

        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::Binary {
                    op: BinaryIrOp::NAdd,
                    lhs: ValueRef::Const(two),
                    rhs: ValueRef::Const(three),
                },
                LiteralType::Number,
            ),
            instr(
                InstrOp::Binary {
                    op: BinaryIrOp::NCmpEq,
                    lhs: ValueRef::Instr(0),
                    rhs: ValueRef::Const(two),
                },
                LiteralType::Boolean,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2],
        }];
        ir.handlers.push(h);

        let program = codegen(&ir).unwrap();
        let handler = &program.handlers()[0];
        let ops = opcodes_of(handler);
        // slot for %0, its add, reload, compare, discard, exit
        assert_eq!(ops[0], Opcode::Alloca);
        assert!(ops.contains(&Opcode::NAdd));
        assert!(ops.contains(&Opcode::NCmpEq));
        assert_eq!(*ops.last().unwrap(), Opcode::Exit);
        assert!(handler.stack_size >= 2);
    }

    #[test]
    fn test_fallthrough_branch_elided() {
        let mut ir = IRProgram::new();
        let t = ir.intern(IrConst::Boolean(true));

        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::CondBr {
                    condition: ValueRef::Const(t),
                    true_block: 1,
                    false_block: 2,
                },
                LiteralType::Void,
            ),
            instr(InstrOp::Br { target: 2 }, LiteralType::Void),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
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
                label: "cont".into(),
                instrs: vec![2],
            },
        ];
        ir.handlers.push(h);

        let program = codegen(&ir).unwrap();
        let ops = opcodes_of(&program.handlers()[0]);
        // true block falls through: JZ to the false side, no JMP for
        // the then->cont branch either (also fallthrough)
        assert_eq!(ops, vec![Opcode::ILoad, Opcode::Jz, Opcode::Exit]);

        // the JZ target is the cont block's pc
        let jz = program.handlers()[0].code[1];
        assert_eq!(instruction::operand_a(jz), 2);
    }

    #[test]
    fn test_call_emits_args_and_stores_result() {
        let mut ir = IRProgram::new();
        let n = ir.intern(IrConst::Number(21));
        let callee = ir.make_native_function(&Signature::new(
            "double",
            LiteralType::Number,
            vec![LiteralType::Number],
        ));

        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::Call {
                    callee,
                    args: vec![ValueRef::Const(n)],
                },
                LiteralType::Number,
            ),
            instr(
                InstrOp::Binary {
                    op: BinaryIrOp::NCmpEq,
                    lhs: ValueRef::Instr(0),
                    rhs: ValueRef::Const(n),
                },
                LiteralType::Boolean,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2],
        }];
        ir.handlers.push(h);

        let program = codegen(&ir).unwrap();
        let handler = &program.handlers()[0];
        let ops = opcodes_of(handler);
        let call_at = ops.iter().position(|&o| o == Opcode::Call).unwrap();
        assert_eq!(ops[call_at - 1], Opcode::ILoad);
        assert_eq!(ops[call_at + 1], Opcode::Store);
        let call = handler.code[call_at];
        assert_eq!(instruction::operand_a(call), 0);
        assert_eq!(instruction::operand_b(call), 1);
    }

    #[test]
    fn test_match_def_fixups() {
        let mut ir = IRProgram::new();
        let subject = ir.intern(IrConst::String("/b/x".into()));
        let la = ir.intern(IrConst::String("/a".into()));
        let lb = ir.intern(IrConst::String("/b".into()));

        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::Match {
                    class: MatchClass::Head,
                    condition: ValueRef::Const(subject),
                    cases: vec![(la, 1), (lb, 2)],
                    else_block: 3,
                },
                LiteralType::Void,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
            instr(InstrOp::Ret { handled: true }, LiteralType::Void),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![
            Block {
                label: "entry".into(),
                instrs: vec![0],
            },
            Block {
                label: "case.a".into(),
                instrs: vec![1],
            },
            Block {
                label: "case.b".into(),
                instrs: vec![2],
            },
            Block {
                label: "else".into(),
                instrs: vec![3],
            },
        ];
        ir.handlers.push(h);

        let program = codegen(&ir).unwrap();
        let def = program.match_def(0).unwrap();
        assert_eq!(def.op, MatchClass::Head);
        assert_eq!(def.cases.len(), 2);
        // blocks: entry is [SLOAD, SMATCHBEG] so cases start at pc 2
        assert_eq!(def.cases[0].pc, 2);
        assert_eq!(def.cases[1].pc, 3);
        assert_eq!(def.else_pc, 4);
    }

    #[test]
    fn test_illegal_cast_is_rejected() {
        let mut ir = IRProgram::new();
        let b = ir.intern(IrConst::Boolean(true));

        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::Cast {
                    source: ValueRef::Const(b),
                },
                LiteralType::Cidr,
            ),
            instr(
                InstrOp::Load {
                    source: ValueRef::Instr(0),
                },
                LiteralType::Cidr,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2],
        }];
        ir.handlers.push(h);

        assert!(matches!(
            codegen(&ir),
            Err(CodegenError::IllegalCast { .. })
        ));
    }

    #[test]
    fn test_phi_is_rejected() {
        let mut ir = IRProgram::new();
        let mut h = IRHandler::new("main");
        h.instrs = vec![
            instr(
                InstrOp::Phi { inputs: Vec::new() },
                LiteralType::Number,
            ),
            instr(
                InstrOp::Load {
                    source: ValueRef::Instr(0),
                },
                LiteralType::Number,
            ),
            instr(InstrOp::Ret { handled: false }, LiteralType::Void),
        ];
        h.blocks = vec![Block {
            label: "entry".into(),
            instrs: vec![0, 1, 2],
        }];
        ir.handlers.push(h);

        assert!(matches!(codegen(&ir), Err(CodegenError::PhiNotLowered)));
    }

    #[test]
    fn test_cast_table() {
        use LiteralType::*;
        assert_eq!(cast_opcode(Number, String), Some(Opcode::N2S));
        assert_eq!(cast_opcode(IPAddress, String), Some(Opcode::P2S));
        assert_eq!(cast_opcode(Cidr, String), Some(Opcode::C2S));
        assert_eq!(cast_opcode(RegExp, String), Some(Opcode::R2S));
        assert_eq!(cast_opcode(String, Number), Some(Opcode::S2N));
        assert_eq!(cast_opcode(Boolean, Cidr), None);
    }
}
