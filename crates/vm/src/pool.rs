//! The program's constant pool.
//!
//! One vector per constant kind, addressed by 16-bit indices. Interning
//! deduplicates equal constants so repeated literals share an entry.

use flow_core::{Cidr, RegExp};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Raised when a pool vector outgrows its 16-bit index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolError {
    pub kind: &'static str,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "constant pool overflow for {} constants", self.kind)
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Default)]
pub struct ConstantPool {
    numbers: Vec<i64>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexps: Vec<RegExp>,
    int_arrays: Vec<Vec<i64>>,
    string_arrays: Vec<Vec<String>>,
    ipaddr_arrays: Vec<Vec<IpAddr>>,
    cidr_arrays: Vec<Vec<Cidr>>,

    string_index: HashMap<String, u16>,
    number_index: HashMap<i64, u16>,
}

fn intern<T: PartialEq>(vec: &mut Vec<T>, value: T, kind: &'static str) -> Result<u16, PoolError> {
    if let Some(i) = vec.iter().position(|v| *v == value) {
        return Ok(i as u16);
    }
    if vec.len() > u16::MAX as usize {
        return Err(PoolError { kind });
    }
    vec.push(value);
    Ok((vec.len() - 1) as u16)
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool::default()
    }

    pub fn make_number(&mut self, value: i64) -> Result<u16, PoolError> {
        if let Some(&i) = self.number_index.get(&value) {
            return Ok(i);
        }
        if self.numbers.len() > u16::MAX as usize {
            return Err(PoolError { kind: "number" });
        }
        self.numbers.push(value);
        let index = (self.numbers.len() - 1) as u16;
        self.number_index.insert(value, index);
        Ok(index)
    }

    pub fn make_string(&mut self, value: &str) -> Result<u16, PoolError> {
        if let Some(&i) = self.string_index.get(value) {
            return Ok(i);
        }
        if self.strings.len() > u16::MAX as usize {
            return Err(PoolError { kind: "string" });
        }
        self.strings.push(value.to_string());
        let index = (self.strings.len() - 1) as u16;
        self.string_index.insert(value.to_string(), index);
        Ok(index)
    }

    pub fn make_ipaddr(&mut self, value: IpAddr) -> Result<u16, PoolError> {
        intern(&mut self.ipaddrs, value, "ipaddr")
    }

    pub fn make_cidr(&mut self, value: Cidr) -> Result<u16, PoolError> {
        intern(&mut self.cidrs, value, "cidr")
    }

    pub fn make_regexp(&mut self, value: RegExp) -> Result<u16, PoolError> {
        intern(&mut self.regexps, value, "regexp")
    }

    pub fn make_int_array(&mut self, value: Vec<i64>) -> Result<u16, PoolError> {
        intern(&mut self.int_arrays, value, "int array")
    }

    pub fn make_string_array(&mut self, value: Vec<String>) -> Result<u16, PoolError> {
        intern(&mut self.string_arrays, value, "string array")
    }

    pub fn make_ipaddr_array(&mut self, value: Vec<IpAddr>) -> Result<u16, PoolError> {
        intern(&mut self.ipaddr_arrays, value, "ipaddr array")
    }

    pub fn make_cidr_array(&mut self, value: Vec<Cidr>) -> Result<u16, PoolError> {
        intern(&mut self.cidr_arrays, value, "cidr array")
    }

    pub fn number(&self, index: u16) -> Option<i64> {
        self.numbers.get(index as usize).copied()
    }

    pub fn string(&self, index: u16) -> Option<&str> {
        self.strings.get(index as usize).map(|s| s.as_str())
    }

    pub fn ipaddr(&self, index: u16) -> Option<&IpAddr> {
        self.ipaddrs.get(index as usize)
    }

    pub fn cidr(&self, index: u16) -> Option<&Cidr> {
        self.cidrs.get(index as usize)
    }

    pub fn regexp(&self, index: u16) -> Option<&RegExp> {
        self.regexps.get(index as usize)
    }

    pub fn int_array(&self, index: u16) -> Option<&[i64]> {
        self.int_arrays.get(index as usize).map(|v| v.as_slice())
    }

    pub fn string_array(&self, index: u16) -> Option<&[String]> {
        self.string_arrays.get(index as usize).map(|v| v.as_slice())
    }

    pub fn ipaddr_array(&self, index: u16) -> Option<&[IpAddr]> {
        self.ipaddr_arrays.get(index as usize).map(|v| v.as_slice())
    }

    pub fn cidr_array(&self, index: u16) -> Option<&[Cidr]> {
        self.cidr_arrays.get(index as usize).map(|v| v.as_slice())
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.make_string("foo").unwrap();
        let b = pool.make_string("bar").unwrap();
        let c = pool.make_string("foo").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.string(a), Some("foo"));
        assert_eq!(pool.string(b), Some("bar"));
    }

    #[test]
    fn test_number_interning() {
        let mut pool = ConstantPool::new();
        let a = pool.make_number(1 << 40).unwrap();
        let b = pool.make_number(1 << 40).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.number(a), Some(1 << 40));
    }

    #[test]
    fn test_out_of_range_lookup_is_none() {
        let pool = ConstantPool::new();
        assert_eq!(pool.string(0), None);
        assert_eq!(pool.number(9), None);
    }

    #[test]
    fn test_array_pools() {
        let mut pool = ConstantPool::new();
        let a = pool.make_int_array(vec![1, 2, 3]).unwrap();
        let b = pool.make_int_array(vec![1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.int_array(a), Some(&[1i64, 2, 3][..]));

        let s = pool
            .make_string_array(vec!["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(pool.string_array(s).unwrap().len(), 2);
    }
}
