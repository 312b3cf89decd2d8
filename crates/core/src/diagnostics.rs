//! Source locations and diagnostic reporting.
//!
//! Every phase of the toolchain reports problems through a
//! [`DiagnosticReport`]; a non-zero error count makes the driver abort
//! before the next phase runs.

use serde::Serialize;
use std::fmt;

/// A position inside a source file. Lines and columns are 1-indexed,
/// the byte offset is 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl SourcePosition {
    pub fn new(line: u32, column: u32, offset: u32) -> Self {
        SourcePosition {
            line,
            column,
            offset,
        }
    }
}

impl Default for SourcePosition {
    fn default() -> Self {
        SourcePosition {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A span of source text, from `begin` up to and including `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub filename: String,
    pub begin: SourcePosition,
    pub end: SourcePosition,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, begin: SourcePosition, end: SourcePosition) -> Self {
        SourceLocation {
            filename: filename.into(),
            begin,
            end,
        }
    }

    /// A zero-width location at the start of a file.
    pub fn at_start(filename: impl Into<String>) -> Self {
        SourceLocation {
            filename: filename.into(),
            begin: SourcePosition::default(),
            end: SourcePosition::default(),
        }
    }

    /// The union of two locations: covers from the lower begin to the
    /// higher end.
    pub fn merge(&self, other: &SourceLocation) -> SourceLocation {
        SourceLocation {
            filename: self.filename.clone(),
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{}:{}", self.filename, self.begin)
        } else {
            write!(f, "{}:{}-{}", self.filename, self.begin, self.end)
        }
    }
}

/// Diagnostic severity. Everything except `Warning` counts as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    TokenError,
    SyntaxError,
    TypeError,
    Warning,
    LinkError,
}

impl Severity {
    pub fn is_error(self) -> bool {
        !matches!(self, Severity::Warning)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::TokenError => "token error",
            Severity::SyntaxError => "syntax error",
            Severity::TypeError => "type error",
            Severity::Warning => "warning",
            Severity::LinkError => "link error",
        };
        f.write_str(s)
    }
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub location: SourceLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}: {}",
            self.location, self.severity, self.message
        )
    }
}

/// Sink that collects diagnostics across a compilation phase.
#[derive(Debug, Default)]
pub struct DiagnosticReport {
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        DiagnosticReport::default()
    }

    pub fn report(&mut self, severity: Severity, location: SourceLocation, message: String) {
        if severity.is_error() {
            self.error_count += 1;
        }
        self.diagnostics.push(Diagnostic {
            severity,
            location,
            message,
        });
    }

    pub fn token_error(&mut self, location: SourceLocation, message: String) {
        self.report(Severity::TokenError, location, message);
    }

    pub fn syntax_error(&mut self, location: SourceLocation, message: String) {
        self.report(Severity::SyntaxError, location, message);
    }

    pub fn type_error(&mut self, location: SourceLocation, message: String) {
        self.report(Severity::TypeError, location, message);
    }

    pub fn link_error(&mut self, location: SourceLocation, message: String) {
        self.report(Severity::LinkError, location, message);
    }

    pub fn warning(&mut self, location: SourceLocation, message: String) {
        self.report(Severity::Warning, location, message);
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.diagnostics {
            writeln!(f, "{}", d)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32, column: u32, offset: u32) -> SourcePosition {
        SourcePosition::new(line, column, offset)
    }

    #[test]
    fn test_merge_covers_both_spans() {
        let a = SourceLocation::new("f.flow", pos(1, 5, 4), pos(1, 9, 8));
        let b = SourceLocation::new("f.flow", pos(2, 1, 12), pos(2, 4, 15));

        let merged = a.merge(&b);
        assert_eq!(merged.begin, pos(1, 5, 4));
        assert_eq!(merged.end, pos(2, 4, 15));

        // merge is symmetric in coverage
        let merged = b.merge(&a);
        assert_eq!(merged.begin, pos(1, 5, 4));
        assert_eq!(merged.end, pos(2, 4, 15));
    }

    #[test]
    fn test_error_counting_ignores_warnings() {
        let mut report = DiagnosticReport::new();
        let loc = SourceLocation::at_start("f.flow");

        report.warning(loc.clone(), "unused variable".into());
        assert!(!report.has_errors());

        report.type_error(loc.clone(), "type mismatch".into());
        report.syntax_error(loc, "unexpected token".into());
        assert_eq!(report.error_count(), 2);
    }

    #[test]
    fn test_display_includes_location_and_severity() {
        let loc = SourceLocation::new("conf.flow", pos(3, 7, 30), pos(3, 7, 30));
        let d = Diagnostic {
            severity: Severity::SyntaxError,
            location: loc,
            message: "expected ';'".into(),
        };
        assert_eq!(d.to_string(), "conf.flow:3:7: syntax error: expected ';'");
    }
}
