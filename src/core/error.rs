// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Error types, diagnostics, and reporting for the assembler core.

use std::fmt;

/// Categories of core errors.
///
/// The set is disjoint: every failure surfaced by the core carries exactly
/// one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorKind {
    /// Passed through from parser collaborators.
    Syntax,
    MalformedExpression,
    UndefinedSymbol,
    SymbolRedefinition,
    DivisionByZero,
    /// Advisory only; never raised as a hard error.
    Overflow,
    UnresolvableSpan,
    SectionOverflow,
    UnknownDirective,
    DirectiveArgError,
    Io,
    InternalConsistency,
}

/// A core error with a kind and message.
#[derive(Debug, Clone)]
pub struct CoreError {
    kind: CoreErrorKind,
    message: String,
    line: Option<u32>,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn with_line(kind: CoreErrorKind, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            line: Some(line),
        }
    }

    /// Attach a source line if none is recorded yet.
    pub fn or_line(mut self, line: u32) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    pub fn kind(&self) -> CoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CoreError {}

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A diagnostic message with source location.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub(crate) line: u32,
    pub(crate) severity: Severity,
    pub(crate) error: CoreError,
}

impl Diagnostic {
    pub fn new(line: u32, severity: Severity, error: CoreError) -> Self {
        Self {
            line,
            severity,
            error,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn kind(&self) -> CoreErrorKind {
        self.error.kind()
    }

    pub fn message(&self) -> &str {
        self.error.message()
    }

    pub fn format(&self) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        format!("{}: {} - {}", self.line, sev, self.error.message())
    }
}

/// Accumulates warnings and hard errors across a whole assembly run.
///
/// Warnings never abort. Hard errors accumulate through parse and finalize;
/// callers check `has_errors` before entering the emit phase.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, err: CoreError) {
        let line = err.line().unwrap_or(0);
        self.diagnostics
            .push(Diagnostic::new(line, Severity::Error, err));
    }

    pub fn warning(&mut self, err: CoreError) {
        let line = err.line().unwrap_or(0);
        self.diagnostics
            .push(Diagnostic::new(line, Severity::Warning, err));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_format_includes_line_and_severity() {
        let err = CoreError::new(CoreErrorKind::UndefinedSymbol, "undefined symbol `foo`");
        let diag = Diagnostic::new(12, Severity::Error, err);
        assert_eq!(diag.format(), "12: ERROR - undefined symbol `foo`");
    }

    #[test]
    fn sink_separates_errors_from_warnings() {
        let mut sink = DiagnosticSink::new();
        sink.warning(CoreError::with_line(
            CoreErrorKind::Overflow,
            "value does not fit in 8 bits",
            3,
        ));
        assert!(!sink.has_errors());
        sink.error(CoreError::with_line(
            CoreErrorKind::DivisionByZero,
            "division by zero",
            7,
        ));
        assert!(sink.has_errors());
        assert_eq!(sink.error_count(), 1);
        assert_eq!(sink.warning_count(), 1);
    }

    #[test]
    fn or_line_keeps_existing_line() {
        let err =
            CoreError::with_line(CoreErrorKind::Io, "unreadable", 4).or_line(9);
        assert_eq!(err.line(), Some(4));
        let err = CoreError::new(CoreErrorKind::Io, "unreadable").or_line(9);
        assert_eq!(err.line(), Some(9));
    }
}
