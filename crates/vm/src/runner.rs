//! The virtual machine: one `Runner` executes one handler invocation.
//!
//! The machine is a stack machine with a constant pool and a program
//! counter. Dispatch is a `match` over the opcode. Strings (and the
//! occasional IP/CIDR) created during execution live in per-Runner
//! garbage lists and die with the Runner; constants always resolve
//! into the program's pool.

use crate::instruction::{self, Opcode};
use crate::params::Params;
use crate::program::{Handler, Program};
use crate::runtime::Runtime;
use crate::slot;
use flow_core::{Cidr, LiteralType, RegExp, Value};
use std::any::Any;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, trace};

/// Execution state of a Runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Inactive,
    Running,
    Suspended,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Inactive => "Inactive",
            RunnerState::Running => "Running",
            RunnerState::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}

/// Fatal execution faults. A faulted Runner refuses further use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    StackOverflow,
    StackUnderflow,
    SlotOutOfBounds(usize),
    PcOutOfBounds(usize),
    UnknownOpcode(u8),
    DivideByZero,
    ConstantPoolIndex(&'static str, usize),
    RegexGroupIndex(i64),
    MatchTableIndex(usize),
    NativeReference(usize),
    NotLinked,
    UnknownHandler(String),
    IllegalState(&'static str),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackOverflow => write!(f, "operand stack overflow"),
            VmError::StackUnderflow => write!(f, "operand stack underflow"),
            VmError::SlotOutOfBounds(i) => write!(f, "stack slot {} out of bounds", i),
            VmError::PcOutOfBounds(pc) => write!(f, "program counter {} out of bounds", pc),
            VmError::UnknownOpcode(b) => write!(f, "unknown opcode 0x{:02x}", b),
            VmError::DivideByZero => write!(f, "division by zero"),
            VmError::ConstantPoolIndex(kind, i) => {
                write!(f, "{} constant index {} out of range", kind, i)
            }
            VmError::RegexGroupIndex(i) => write!(f, "regex capture group {} out of range", i),
            VmError::MatchTableIndex(i) => write!(f, "match table {} out of range", i),
            VmError::NativeReference(i) => write!(f, "native callback reference {} unresolved", i),
            VmError::NotLinked => write!(f, "program is not linked"),
            VmError::UnknownHandler(name) => write!(f, "unknown handler \"{}\"", name),
            VmError::IllegalState(what) => write!(f, "illegal runner state: {}", what),
        }
    }
}

impl std::error::Error for VmError {}

/// Capture groups of the most recent regex match, stored owned so they
/// survive the subject leaving the stack.
#[derive(Debug, Default)]
pub struct RegexContext {
    groups: Vec<Option<String>>,
}

impl RegexContext {
    pub fn set_from_captures(&mut self, caps: &regex::Captures) {
        self.groups.clear();
        for i in 0..caps.len() {
            self.groups.push(caps.get(i).map(|m| m.as_str().to_string()));
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

enum Flow {
    Next,
    Return(bool),
    Suspend,
}

/// One handler invocation: operand stack, program counter, regex
/// context, and string garbage.
pub struct Runner<'p> {
    program: &'p Program,
    runtime: &'p Runtime,
    handler_id: usize,
    userdata: &'p mut dyn Any,

    pc: usize,
    stack: Vec<u64>,
    max_stack: usize,
    state: RunnerState,
    faulted: bool,
    /// Set while suspended in a CALL with a non-void result slot.
    pending_result: bool,

    regex_ctx: RegexContext,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
}

fn resolve_str_parts<'x>(
    strings: &'x [String],
    program: &'x Program,
    raw: u64,
) -> Result<&'x str, VmError> {
    let index = slot::ref_index(raw);
    if slot::is_garbage_ref(raw) {
        strings
            .get(index)
            .map(|s| s.as_str())
            .ok_or(VmError::ConstantPoolIndex("garbage string", index))
    } else {
        program
            .pool()
            .string(index as u16)
            .ok_or(VmError::ConstantPoolIndex("string", index))
    }
}

impl<'p> Runner<'p> {
    /// Creates a Runner for one handler of a linked program.
    pub fn new(
        program: &'p Program,
        runtime: &'p Runtime,
        handler: &str,
        userdata: &'p mut dyn Any,
    ) -> Result<Self, VmError> {
        if !program.is_linked() {
            return Err(VmError::NotLinked);
        }
        let handler_id = program
            .find_handler(handler)
            .ok_or_else(|| VmError::UnknownHandler(handler.to_string()))?;
        let max_stack = program
            .handler(handler_id)
            .map(|h| h.stack_size)
            .unwrap_or(0);

        Ok(Runner {
            program,
            runtime,
            handler_id,
            userdata,
            pc: 0,
            stack: Vec::with_capacity(max_stack),
            max_stack,
            state: RunnerState::Inactive,
            faulted: false,
            pending_result: false,
            regex_ctx: RegexContext::default(),
            strings: Vec::new(),
            ipaddrs: Vec::new(),
            cidrs: Vec::new(),
        })
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Current instruction offset into the handler's code.
    pub fn instruction_offset(&self) -> usize {
        self.pc
    }

    pub fn regex_context(&self) -> &RegexContext {
        &self.regex_ctx
    }

    pub fn userdata(&mut self) -> &mut dyn Any {
        self.userdata
    }

    /// Runs the handler from the start. Returns true when a native
    /// handler reported handled, false when the handler ran to
    /// completion unhandled or suspended itself.
    pub fn run(&mut self) -> Result<bool, VmError> {
        if self.faulted {
            return Err(VmError::IllegalState("runner has faulted"));
        }
        if self.state != RunnerState::Inactive {
            return Err(VmError::IllegalState("run() requires an inactive runner"));
        }
        let handler = self.handler()?;
        debug!(handler = %handler.name, "running handler");
        self.execute()
    }

    /// Continues a suspended Runner at the saved program counter.
    pub fn resume(&mut self) -> Result<bool, VmError> {
        if self.faulted {
            return Err(VmError::IllegalState("runner has faulted"));
        }
        if self.state != RunnerState::Suspended {
            return Err(VmError::IllegalState("resume() requires a suspended runner"));
        }
        self.pending_result = false;
        debug!(pc = self.pc, "resuming handler");
        self.execute()
    }

    /// Called from inside a native callback to suspend after it
    /// returns.
    pub fn suspend(&mut self) {
        if self.state == RunnerState::Running {
            self.state = RunnerState::Suspended;
        }
    }

    /// Restarts at instruction 0, keeping stack and garbage.
    pub fn rewind(&mut self) {
        self.pc = 0;
    }

    /// Injects the result of a suspended native-function call into its
    /// reserved stack slot. Valid only while suspended in a `CALL`
    /// whose callee returns a value.
    pub fn set_result(&mut self, value: Value) -> Result<(), VmError> {
        if self.state != RunnerState::Suspended || !self.pending_result {
            return Err(VmError::IllegalState("no pending call result"));
        }
        let encoded = match value {
            Value::Bool(b) => slot::from_bool(b),
            Value::Number(n) => slot::from_number(n),
            Value::String(s) => self.alloc_string(s),
            Value::IPAddress(ip) => self.alloc_ipaddr(ip),
            Value::Cidr(c) => self.alloc_cidr(c),
            _ => return Err(VmError::IllegalState("unsupported call result type")),
        };
        match self.stack.last_mut() {
            Some(top) => {
                *top = encoded;
                Ok(())
            }
            None => Err(VmError::StackUnderflow),
        }
    }

    // ---- value allocation (garbage lists) ----

    pub fn alloc_string(&mut self, value: String) -> u64 {
        self.strings.push(value);
        slot::garbage_ref(self.strings.len() - 1)
    }

    pub fn alloc_ipaddr(&mut self, value: IpAddr) -> u64 {
        self.ipaddrs.push(value);
        slot::garbage_ref(self.ipaddrs.len() - 1)
    }

    pub fn alloc_cidr(&mut self, value: Cidr) -> u64 {
        self.cidrs.push(value);
        slot::garbage_ref(self.cidrs.len() - 1)
    }

    // ---- slot resolution ----

    pub fn resolve_str(&self, raw: u64) -> Result<&str, VmError> {
        resolve_str_parts(&self.strings, self.program, raw)
    }

    pub fn resolve_ipaddr(&self, raw: u64) -> Result<IpAddr, VmError> {
        let index = slot::ref_index(raw);
        if slot::is_garbage_ref(raw) {
            self.ipaddrs
                .get(index)
                .copied()
                .ok_or(VmError::ConstantPoolIndex("garbage ipaddr", index))
        } else {
            self.program
                .pool()
                .ipaddr(index as u16)
                .copied()
                .ok_or(VmError::ConstantPoolIndex("ipaddr", index))
        }
    }

    pub fn resolve_cidr(&self, raw: u64) -> Result<Cidr, VmError> {
        let index = slot::ref_index(raw);
        if slot::is_garbage_ref(raw) {
            self.cidrs
                .get(index)
                .copied()
                .ok_or(VmError::ConstantPoolIndex("garbage cidr", index))
        } else {
            self.program
                .pool()
                .cidr(index as u16)
                .copied()
                .ok_or(VmError::ConstantPoolIndex("cidr", index))
        }
    }

    pub fn resolve_regexp(&self, raw: u64) -> Option<&RegExp> {
        if slot::is_garbage_ref(raw) {
            return None;
        }
        self.program.pool().regexp(slot::ref_index(raw) as u16)
    }

    // ---- stack primitives ----

    fn push(&mut self, value: u64) -> Result<(), VmError> {
        if self.stack.len() >= self.max_stack {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn npop(&mut self) -> Result<i64, VmError> {
        Ok(slot::number(self.pop()?))
    }

    fn npush(&mut self, value: i64) -> Result<(), VmError> {
        self.push(slot::from_number(value))
    }

    fn bpush(&mut self, value: bool) -> Result<(), VmError> {
        self.push(slot::from_bool(value))
    }

    fn handler(&self) -> Result<&'p Handler, VmError> {
        self.program
            .handler(self.handler_id)
            .ok_or(VmError::UnknownHandler(String::new()))
    }

    // ---- the dispatch loop ----

    fn execute(&mut self) -> Result<bool, VmError> {
        self.state = RunnerState::Running;
        match self.dispatch_loop() {
            Ok(handled) => Ok(handled),
            Err(fault) => {
                self.faulted = true;
                self.state = RunnerState::Inactive;
                debug!(%fault, pc = self.pc, "handler faulted");
                Err(fault)
            }
        }
    }

    fn dispatch_loop(&mut self) -> Result<bool, VmError> {
        let program = self.program;
        let handler = self.handler()?;

        loop {
            let instr = *handler
                .code
                .get(self.pc)
                .ok_or(VmError::PcOutOfBounds(self.pc))?;
            let op = Opcode::from_u8(instruction::opcode_byte(instr))
                .ok_or_else(|| VmError::UnknownOpcode(instruction::opcode_byte(instr)))?;
            trace!("{}", instruction::disassemble(instr, self.pc));
            self.pc += 1;

            let a = instruction::operand_a(instr);
            let b = instruction::operand_b(instr);

            match self.step(program, op, instr, a, b)? {
                Flow::Next => {}
                Flow::Return(handled) => return Ok(handled),
                Flow::Suspend => return Ok(false),
            }
        }
    }

    fn step(
        &mut self,
        program: &'p Program,
        op: Opcode,
        instr: u64,
        a: u16,
        b: u16,
    ) -> Result<Flow, VmError> {
        match op {
            Opcode::Nop => {}

            // ---- control ----
            Opcode::Exit => {
                self.state = RunnerState::Inactive;
                return Ok(Flow::Return(a != 0));
            }
            Opcode::Jmp => {
                self.pc = a as usize;
            }
            Opcode::Jn => {
                if self.npop()? != 0 {
                    self.pc = a as usize;
                }
            }
            Opcode::Jz => {
                if self.npop()? == 0 {
                    self.pc = a as usize;
                }
            }

            // ---- stack management ----
            Opcode::Alloca => {
                for _ in 0..a {
                    self.push(0)?;
                }
            }
            Opcode::Discard => {
                let n = a as usize;
                if self.stack.len() < n {
                    return Err(VmError::StackUnderflow);
                }
                let keep = self.stack.len() - n;
                self.stack.truncate(keep);
            }
            Opcode::Load => {
                let value = *self
                    .stack
                    .get(a as usize)
                    .ok_or(VmError::SlotOutOfBounds(a as usize))?;
                self.push(value)?;
            }
            Opcode::Store => {
                let value = self.pop()?;
                let slot = self
                    .stack
                    .get_mut(a as usize)
                    .ok_or(VmError::SlotOutOfBounds(a as usize))?;
                *slot = value;
            }
            Opcode::Mov => {
                let value = *self
                    .stack
                    .get(b as usize)
                    .ok_or(VmError::SlotOutOfBounds(b as usize))?;
                let slot = self
                    .stack
                    .get_mut(a as usize)
                    .ok_or(VmError::SlotOutOfBounds(a as usize))?;
                *slot = value;
            }

            // ---- constant loads ----
            Opcode::ILoad => {
                self.npush(instruction::operand_a_signed(instr))?;
            }
            Opcode::NLoad => {
                let value = program
                    .pool()
                    .number(a)
                    .ok_or(VmError::ConstantPoolIndex("number", a as usize))?;
                self.npush(value)?;
            }
            Opcode::SLoad => {
                program
                    .pool()
                    .string(a)
                    .ok_or(VmError::ConstantPoolIndex("string", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }
            Opcode::PLoad => {
                program
                    .pool()
                    .ipaddr(a)
                    .ok_or(VmError::ConstantPoolIndex("ipaddr", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }
            Opcode::CLoad => {
                program
                    .pool()
                    .cidr(a)
                    .ok_or(VmError::ConstantPoolIndex("cidr", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }

            // ---- numeric ----
            Opcode::NNeg => {
                let v = self.npop()?;
                self.npush(v.wrapping_neg())?;
            }
            Opcode::NNot => {
                let v = self.npop()?;
                self.npush(!v)?;
            }
            Opcode::NAdd => self.binary_num(|x, y| x.wrapping_add(y))?,
            Opcode::NSub => self.binary_num(|x, y| x.wrapping_sub(y))?,
            Opcode::NMul => self.binary_num(|x, y| x.wrapping_mul(y))?,
            Opcode::NDiv => {
                let y = self.npop()?;
                let x = self.npop()?;
                if y == 0 {
                    return Err(VmError::DivideByZero);
                }
                self.npush(x.wrapping_div(y))?;
            }
            Opcode::NRem => {
                let y = self.npop()?;
                let x = self.npop()?;
                if y == 0 {
                    return Err(VmError::DivideByZero);
                }
                self.npush(x.wrapping_rem(y))?;
            }
            Opcode::NShl => self.binary_num(|x, y| x.wrapping_shl(y as u32))?,
            Opcode::NShr => self.binary_num(|x, y| x.wrapping_shr(y as u32))?,
            Opcode::NPow => self.binary_num(ipow)?,
            Opcode::NAnd => self.binary_num(|x, y| x & y)?,
            Opcode::NOr => self.binary_num(|x, y| x | y)?,
            Opcode::NXor => self.binary_num(|x, y| x ^ y)?,
            Opcode::NCmpZ => {
                let v = self.npop()?;
                self.bpush(v == 0)?;
            }
            Opcode::NCmpEq => self.binary_cmp(|x, y| x == y)?,
            Opcode::NCmpNe => self.binary_cmp(|x, y| x != y)?,
            Opcode::NCmpLe => self.binary_cmp(|x, y| x <= y)?,
            Opcode::NCmpGe => self.binary_cmp(|x, y| x >= y)?,
            Opcode::NCmpLt => self.binary_cmp(|x, y| x < y)?,
            Opcode::NCmpGt => self.binary_cmp(|x, y| x > y)?,

            // ---- boolean ----
            Opcode::BNot => {
                let v = self.npop()?;
                self.bpush(v == 0)?;
            }
            Opcode::BAnd => {
                let y = self.npop()?;
                let x = self.npop()?;
                self.bpush(x != 0 && y != 0)?;
            }
            Opcode::BOr => {
                let y = self.npop()?;
                let x = self.npop()?;
                self.bpush(x != 0 || y != 0)?;
            }
            Opcode::BXor => {
                let y = self.npop()?;
                let x = self.npop()?;
                self.bpush((x != 0) ^ (y != 0))?;
            }

            // ---- string ----
            Opcode::SAdd => {
                let rb = self.pop()?;
                let ra = self.pop()?;
                let joined = {
                    let sa = resolve_str_parts(&self.strings, program, ra)?;
                    let sb = resolve_str_parts(&self.strings, program, rb)?;
                    let mut joined = String::with_capacity(sa.len() + sb.len());
                    joined.push_str(sa);
                    joined.push_str(sb);
                    joined
                };
                let r = self.alloc_string(joined);
                self.push(r)?;
            }
            Opcode::SSubStr => {
                let count = self.npop()?;
                let offset = self.npop()?;
                let rs = self.pop()?;
                let sub = {
                    let s = resolve_str_parts(&self.strings, program, rs)?.as_bytes();
                    let offset = offset.clamp(0, s.len() as i64) as usize;
                    let count = count.max(0) as usize;
                    let end = offset.saturating_add(count).min(s.len());
                    String::from_utf8_lossy(&s[offset..end]).into_owned()
                };
                let r = self.alloc_string(sub);
                self.push(r)?;
            }
            Opcode::SCmpEq => self.binary_str(program, |x, y| x == y)?,
            Opcode::SCmpNe => self.binary_str(program, |x, y| x != y)?,
            Opcode::SCmpLe => self.binary_str(program, |x, y| x <= y)?,
            Opcode::SCmpGe => self.binary_str(program, |x, y| x >= y)?,
            Opcode::SCmpLt => self.binary_str(program, |x, y| x < y)?,
            Opcode::SCmpGt => self.binary_str(program, |x, y| x > y)?,
            Opcode::SCmpBeg => self.binary_str(program, |x, y| x.starts_with(y))?,
            Opcode::SCmpEnd => self.binary_str(program, |x, y| x.ends_with(y))?,
            Opcode::SContains => self.binary_str(program, |x, y| x.contains(y))?,
            Opcode::SLen => {
                let r = self.pop()?;
                let len = resolve_str_parts(&self.strings, program, r)?.len();
                self.npush(len as i64)?;
            }
            Opcode::SIsEmpty => {
                let r = self.pop()?;
                let empty = resolve_str_parts(&self.strings, program, r)?.is_empty();
                self.bpush(empty)?;
            }
            Opcode::SMatchEq | Opcode::SMatchBeg | Opcode::SMatchEnd | Opcode::SMatchR => {
                let r = self.pop()?;
                let matcher = program
                    .matcher(a as usize)
                    .ok_or(VmError::MatchTableIndex(a as usize))?;
                let subject = resolve_str_parts(&self.strings, program, r)?;
                self.pc = matcher.evaluate(subject, program.pool(), &mut self.regex_ctx);
            }

            // ---- ipaddr / cidr ----
            Opcode::PCmpEq => {
                let rb = self.pop()?;
                let ra = self.pop()?;
                let eq = self.resolve_ipaddr(ra)? == self.resolve_ipaddr(rb)?;
                self.bpush(eq)?;
            }
            Opcode::PCmpNe => {
                let rb = self.pop()?;
                let ra = self.pop()?;
                let ne = self.resolve_ipaddr(ra)? != self.resolve_ipaddr(rb)?;
                self.bpush(ne)?;
            }
            Opcode::PInCidr => {
                let rc = self.pop()?;
                let rp = self.pop()?;
                let cidr = self.resolve_cidr(rc)?;
                let ip = self.resolve_ipaddr(rp)?;
                self.bpush(cidr.contains(&ip))?;
            }

            // ---- regex ----
            Opcode::SRegMatch => {
                let r = self.pop()?;
                let re = program
                    .pool()
                    .regexp(a)
                    .ok_or(VmError::ConstantPoolIndex("regexp", a as usize))?;
                let matched = {
                    let subject = resolve_str_parts(&self.strings, program, r)?;
                    match re.regex().captures(subject) {
                        Some(caps) => {
                            self.regex_ctx.set_from_captures(&caps);
                            true
                        }
                        None => false,
                    }
                };
                self.bpush(matched)?;
            }
            Opcode::SRegGroup => {
                let n = self.npop()?;
                if n < 0 {
                    return Err(VmError::RegexGroupIndex(n));
                }
                let text = self
                    .regex_ctx
                    .group(n as usize)
                    .ok_or(VmError::RegexGroupIndex(n))?
                    .to_string();
                let r = self.alloc_string(text);
                self.push(r)?;
            }

            // ---- conversions ----
            Opcode::N2S => {
                let v = self.npop()?;
                let r = self.alloc_string(v.to_string());
                self.push(r)?;
            }
            Opcode::P2S => {
                let rp = self.pop()?;
                let ip = self.resolve_ipaddr(rp)?;
                let r = self.alloc_string(ip.to_string());
                self.push(r)?;
            }
            Opcode::C2S => {
                let rc = self.pop()?;
                let cidr = self.resolve_cidr(rc)?;
                let r = self.alloc_string(cidr.to_string());
                self.push(r)?;
            }
            Opcode::R2S => {
                let rr = self.pop()?;
                let pattern = self
                    .resolve_regexp(rr)
                    .map(|re| re.pattern().to_string())
                    .unwrap_or_default();
                let r = self.alloc_string(pattern);
                self.push(r)?;
            }
            Opcode::S2N => {
                let rs = self.pop()?;
                let value = parse_number(resolve_str_parts(&self.strings, program, rs)?);
                self.npush(value)?;
            }

            // ---- arrays ----
            Opcode::ITLoad => {
                program
                    .pool()
                    .int_array(a)
                    .ok_or(VmError::ConstantPoolIndex("int array", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }
            Opcode::STLoad => {
                program
                    .pool()
                    .string_array(a)
                    .ok_or(VmError::ConstantPoolIndex("string array", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }
            Opcode::PTLoad => {
                program
                    .pool()
                    .ipaddr_array(a)
                    .ok_or(VmError::ConstantPoolIndex("ipaddr array", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }
            Opcode::CTLoad => {
                program
                    .pool()
                    .cidr_array(a)
                    .ok_or(VmError::ConstantPoolIndex("cidr array", a as usize))?;
                self.push(slot::pool_ref(a))?;
            }

            // ---- invokation ----
            Opcode::Call => {
                let callback_index = program
                    .linked_function(a as usize)
                    .ok_or(VmError::NativeReference(a as usize))?;
                let callback = self
                    .runtime
                    .callback(callback_index)
                    .ok_or(VmError::NativeReference(callback_index))?;

                let argc = b as usize;
                let mut argv = vec![0u64; argc + 1];
                for i in (1..=argc).rev() {
                    argv[i] = self.pop()?;
                }

                let mut params = Params::new(&mut argv, self);
                callback.invoke(&mut params);

                let returns_value = callback.signature().return_type() != LiteralType::Void;
                if returns_value {
                    self.push(argv[0])?;
                }
                if self.state == RunnerState::Suspended {
                    self.pending_result = returns_value;
                    debug!("vm suspended in function call");
                    return Ok(Flow::Suspend);
                }
            }
            Opcode::Handler => {
                let callback_index = program
                    .linked_handler(a as usize)
                    .ok_or(VmError::NativeReference(a as usize))?;
                let callback = self
                    .runtime
                    .callback(callback_index)
                    .ok_or(VmError::NativeReference(callback_index))?;

                let argc = b as usize;
                let mut argv = vec![0u64; argc + 1];
                for i in (1..=argc).rev() {
                    argv[i] = self.pop()?;
                }

                let mut params = Params::new(&mut argv, self);
                callback.invoke(&mut params);

                if self.state == RunnerState::Suspended {
                    debug!("vm suspended in handler call");
                    return Ok(Flow::Suspend);
                }
                if argv[0] != 0 {
                    self.state = RunnerState::Inactive;
                    return Ok(Flow::Return(true));
                }
            }
        }

        Ok(Flow::Next)
    }

    fn binary_num(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), VmError> {
        let y = self.npop()?;
        let x = self.npop()?;
        self.npush(f(x, y))
    }

    fn binary_cmp(&mut self, f: impl Fn(i64, i64) -> bool) -> Result<(), VmError> {
        let y = self.npop()?;
        let x = self.npop()?;
        self.bpush(f(x, y))
    }

    fn binary_str(
        &mut self,
        program: &'p Program,
        f: impl Fn(&str, &str) -> bool,
    ) -> Result<(), VmError> {
        let rb = self.pop()?;
        let ra = self.pop()?;
        let result = {
            let sa = resolve_str_parts(&self.strings, program, ra)?;
            let sb = resolve_str_parts(&self.strings, program, rb)?;
            f(sa, sb)
        };
        self.bpush(result)
    }
}

impl fmt::Debug for Runner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}@{}}}", self.state, self.pc)
    }
}

/// Integer power with twos-complement wrap; negative exponents yield 0
/// except for the |base| == 1 cases.
fn ipow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 => {
                if exp % 2 == 0 {
                    1
                } else {
                    -1
                }
            }
            _ => 0,
        };
    }
    base.wrapping_pow(exp.min(u32::MAX as i64) as u32)
}

/// Leading-digits parse with optional sign; non-numeric input yields 0
/// and overflow wraps.
fn parse_number(s: &str) -> i64 {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let mut value: i64 = 0;
    let mut any = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        any = true;
        value = value
            .wrapping_mul(10)
            .wrapping_add(i64::from(bytes[i] - b'0'));
        i += 1;
    }
    if !any {
        return 0;
    }
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}
