//! The Flow value universe: type tags, constant values, signatures.

use crate::cidr::Cidr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

/// Tag for every literal type Flow knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralType {
    Void,
    Boolean,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    Handler,
    IntArray,
    StringArray,
    IPAddrArray,
    CidrArray,
}

impl LiteralType {
    /// The element type of an array type, if this is one.
    pub fn element_type(self) -> Option<LiteralType> {
        match self {
            LiteralType::IntArray => Some(LiteralType::Number),
            LiteralType::StringArray => Some(LiteralType::String),
            LiteralType::IPAddrArray => Some(LiteralType::IPAddress),
            LiteralType::CidrArray => Some(LiteralType::Cidr),
            _ => None,
        }
    }

    /// The array type whose elements have this type, if one exists.
    pub fn array_of(self) -> Option<LiteralType> {
        match self {
            LiteralType::Number => Some(LiteralType::IntArray),
            LiteralType::String => Some(LiteralType::StringArray),
            LiteralType::IPAddress => Some(LiteralType::IPAddrArray),
            LiteralType::Cidr => Some(LiteralType::CidrArray),
            _ => None,
        }
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LiteralType::Void => "Void",
            LiteralType::Boolean => "Boolean",
            LiteralType::Number => "Number",
            LiteralType::String => "String",
            LiteralType::IPAddress => "IPAddress",
            LiteralType::Cidr => "Cidr",
            LiteralType::RegExp => "RegExp",
            LiteralType::Handler => "Handler",
            LiteralType::IntArray => "IntArray",
            LiteralType::StringArray => "StringArray",
            LiteralType::IPAddrArray => "IPAddrArray",
            LiteralType::CidrArray => "CidrArray",
        };
        f.write_str(s)
    }
}

/// A compiled regular expression plus its source pattern.
///
/// Equality and hashing go by the source pattern; the compiled matcher
/// is shared so constant-pool clones stay cheap.
#[derive(Debug, Clone)]
pub struct RegExp {
    pattern: String,
    compiled: Arc<regex::Regex>,
}

impl RegExp {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RegExp {
            pattern: pattern.to_string(),
            compiled: Arc::new(regex::Regex::new(pattern)?),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn regex(&self) -> &regex::Regex {
        &self.compiled
    }

    pub fn is_match(&self, subject: &str) -> bool {
        self.compiled.is_match(subject)
    }
}

impl PartialEq for RegExp {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for RegExp {}

impl Hash for RegExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl fmt::Display for RegExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.pattern)
    }
}

/// A constant value of any literal type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(i64),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    IntArray(Vec<i64>),
    StringArray(Vec<String>),
    IPAddrArray(Vec<IpAddr>),
    CidrArray(Vec<Cidr>),
}

impl Value {
    pub fn ty(&self) -> LiteralType {
        match self {
            Value::Bool(_) => LiteralType::Boolean,
            Value::Number(_) => LiteralType::Number,
            Value::String(_) => LiteralType::String,
            Value::IPAddress(_) => LiteralType::IPAddress,
            Value::Cidr(_) => LiteralType::Cidr,
            Value::RegExp(_) => LiteralType::RegExp,
            Value::IntArray(_) => LiteralType::IntArray,
            Value::StringArray(_) => LiteralType::StringArray,
            Value::IPAddrArray(_) => LiteralType::IPAddrArray,
            Value::CidrArray(_) => LiteralType::CidrArray,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::IPAddress(ip) => write!(f, "{}", ip),
            Value::Cidr(c) => write!(f, "{}", c),
            Value::RegExp(re) => write!(f, "{}", re),
            Value::IntArray(xs) => write!(f, "{:?}", xs),
            Value::StringArray(xs) => write!(f, "{:?}", xs),
            Value::IPAddrArray(xs) => {
                let strs: Vec<String> = xs.iter().map(|x| x.to_string()).collect();
                write!(f, "{:?}", strs)
            }
            Value::CidrArray(xs) => {
                let strs: Vec<String> = xs.iter().map(|x| x.to_string()).collect();
                write!(f, "{:?}", strs)
            }
        }
    }
}

/// A callable's signature: name, return type, and ordered argument
/// types. Two signatures are equal iff all three parts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    name: String,
    return_type: LiteralType,
    args: Vec<LiteralType>,
}

impl Signature {
    pub fn new(
        name: impl Into<String>,
        return_type: LiteralType,
        args: Vec<LiteralType>,
    ) -> Self {
        Signature {
            name: name.into(),
            return_type,
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> LiteralType {
        self.return_type
    }

    pub fn args(&self) -> &[LiteralType] {
        &self.args
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, "): {}", self.return_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_equality_is_three_way() {
        let a = Signature::new("log", LiteralType::Void, vec![LiteralType::String]);
        let b = Signature::new("log", LiteralType::Void, vec![LiteralType::String]);
        assert_eq!(a, b);

        let different_name = Signature::new("warn", LiteralType::Void, vec![LiteralType::String]);
        let different_ret = Signature::new("log", LiteralType::Boolean, vec![LiteralType::String]);
        let different_args = Signature::new("log", LiteralType::Void, vec![LiteralType::Number]);
        assert_ne!(a, different_name);
        assert_ne!(a, different_ret);
        assert_ne!(a, different_args);
    }

    #[test]
    fn test_signature_display() {
        let sig = Signature::new(
            "tcp_balance",
            LiteralType::Boolean,
            vec![LiteralType::String, LiteralType::Number],
        );
        assert_eq!(sig.to_string(), "tcp_balance(String, Number): Boolean");
    }

    #[test]
    fn test_regexp_equality_by_pattern() {
        let a = RegExp::new(r"^/user/(\d+)$").unwrap();
        let b = RegExp::new(r"^/user/(\d+)$").unwrap();
        let c = RegExp::new(r"^/group/(\d+)$").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_value_type_tags() {
        assert_eq!(Value::Number(7).ty(), LiteralType::Number);
        assert_eq!(Value::String("x".into()).ty(), LiteralType::String);
        assert_eq!(Value::IntArray(vec![1, 2]).ty(), LiteralType::IntArray);
    }

    #[test]
    fn test_array_element_types() {
        assert_eq!(
            LiteralType::StringArray.element_type(),
            Some(LiteralType::String)
        );
        assert_eq!(LiteralType::Number.array_of(), Some(LiteralType::IntArray));
        assert_eq!(LiteralType::Boolean.array_of(), None);
    }
}
