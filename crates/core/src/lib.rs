//! Core types shared by the Flow compiler and virtual machine.
//!
//! This crate holds the pieces every other layer depends on: source
//! locations and diagnostics, the literal type tags, the constant value
//! universe, and callable signatures.

pub mod cidr;
pub mod diagnostics;
pub mod types;

pub use cidr::Cidr;
pub use diagnostics::{Diagnostic, DiagnosticReport, Severity, SourceLocation, SourcePosition};
pub use types::{LiteralType, RegExp, Signature, Value};
