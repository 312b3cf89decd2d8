//! The argument view a native callback receives.
//!
//! Slot 0 is the return value (the handled flag for native handlers);
//! slots 1..=N are the arguments in positional order. Getters take the
//! argument number, so `get_string(1)` is the first argument.

use crate::runner::Runner;
use crate::slot;
use flow_core::{Cidr, RegExp, Value};
use std::any::Any;
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

pub struct Params<'a, 'p> {
    argv: &'a mut [u64],
    runner: &'a mut Runner<'p>,
}

impl<'a, 'p> Params<'a, 'p> {
    pub(crate) fn new(argv: &'a mut [u64], runner: &'a mut Runner<'p>) -> Self {
        Params { argv, runner }
    }

    /// Number of arguments (excluding the return slot).
    pub fn count(&self) -> usize {
        self.argv.len().saturating_sub(1)
    }

    pub fn get_bool(&self, index: usize) -> bool {
        self.raw(index) != 0
    }

    pub fn get_int(&self, index: usize) -> i64 {
        slot::number(self.raw(index))
    }

    pub fn get_string(&self, index: usize) -> &str {
        self.runner.resolve_str(self.raw(index)).unwrap_or("")
    }

    pub fn get_ipaddr(&self, index: usize) -> IpAddr {
        self.runner
            .resolve_ipaddr(self.raw(index))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn get_cidr(&self, index: usize) -> Cidr {
        self.runner
            .resolve_cidr(self.raw(index))
            .unwrap_or_default()
    }

    pub fn get_regexp(&self, index: usize) -> Option<&RegExp> {
        self.runner.resolve_regexp(self.raw(index))
    }

    pub fn get_int_array(&self, index: usize) -> &[i64] {
        self.pool_array(index, |pool, i| pool.int_array(i))
    }

    pub fn get_string_array(&self, index: usize) -> &[String] {
        self.pool_array(index, |pool, i| pool.string_array(i))
    }

    pub fn get_ipaddr_array(&self, index: usize) -> &[IpAddr] {
        self.pool_array(index, |pool, i| pool.ipaddr_array(i))
    }

    pub fn get_cidr_array(&self, index: usize) -> &[Cidr] {
        self.pool_array(index, |pool, i| pool.cidr_array(i))
    }

    fn pool_array<T>(
        &self,
        index: usize,
        get: impl Fn(&'p crate::pool::ConstantPool, u16) -> Option<&'p [T]>,
    ) -> &'p [T] {
        let raw = self.raw(index);
        if slot::is_garbage_ref(raw) {
            return &[];
        }
        get(self.runner.program().pool(), slot::ref_index(raw) as u16).unwrap_or(&[])
    }

    fn raw(&self, index: usize) -> u64 {
        self.argv.get(index).copied().unwrap_or(0)
    }

    /// Writes the return value into slot 0. Array and regexp results
    /// are not supported by the calling convention.
    pub fn set_result(&mut self, value: Value) {
        let encoded = match value {
            Value::Bool(b) => slot::from_bool(b),
            Value::Number(n) => slot::from_number(n),
            Value::String(s) => self.runner.alloc_string(s),
            Value::IPAddress(ip) => self.runner.alloc_ipaddr(ip),
            Value::Cidr(c) => self.runner.alloc_cidr(c),
            other => {
                warn!(ty = %other.ty(), "unsupported native result type ignored");
                return;
            }
        };
        if let Some(ret) = self.argv.first_mut() {
            *ret = encoded;
        }
    }

    /// Sets the handled flag (native handlers only).
    pub fn set_handled(&mut self, handled: bool) {
        if let Some(ret) = self.argv.first_mut() {
            *ret = slot::from_bool(handled);
        }
    }

    /// Suspends the executing Runner; shorthand for
    /// `params.runner().suspend()`.
    pub fn suspend(&mut self) {
        self.runner.suspend();
    }

    /// Capture group `index` of the latest regex match. Group 0 is the
    /// whole match; the context stays valid until the next regex
    /// opcode fires.
    pub fn regex_group(&self, index: usize) -> Option<&str> {
        self.runner.regex_context().group(index)
    }

    /// The host context this Runner was created with.
    pub fn userdata(&mut self) -> &mut dyn Any {
        self.runner.userdata()
    }

    pub fn runner(&mut self) -> &mut Runner<'p> {
        self.runner
    }
}
