// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic type used by every generation pass.
// Generation is per loop, so a diagnostic is located by loop name and,
// where it concerns one argument, by the argument's 0-based position.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// `INC`/`RW` indirect argument whose dimension is only known at run time.
    pub const E0001: DiagCode = DiagCode("E0001");
    /// Staged SoA argument whose dimension is only known at run time.
    pub const E0002: DiagCode = DiagCode("E0002");
    /// More optional arguments than bits in the flag word.
    pub const E0003: DiagCode = DiagCode("E0003");
    /// Malformed descriptor or dimension expression.
    pub const E0004: DiagCode = DiagCode("E0004");
    /// SoA formal parameter used in the body but never declared.
    pub const E0005: DiagCode = DiagCode("E0005");
    /// Parameter reference span outside the body text or overlapping another.
    pub const E0006: DiagCode = DiagCode("E0006");
    /// Access mode not allowed for the argument kind or data type.
    pub const E0007: DiagCode = DiagCode("E0007");
    /// Body formal parameter count differs from the loop's argument count.
    pub const E0008: DiagCode = DiagCode("E0008");
    /// Loop name generated twice in one session.
    pub const E0009: DiagCode = DiagCode("E0009");
    /// Fixed dimension of zero.
    pub const E0010: DiagCode = DiagCode("E0010");
    /// Loop with an empty name or no arguments.
    pub const E0011: DiagCode = DiagCode("E0011");
    /// Requested artefact needs a kernel body and none was supplied.
    pub const E0012: DiagCode = DiagCode("E0012");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A generator diagnostic emitted by any pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// Loop being generated when the diagnostic was raised.
    pub loop_name: String,
    /// 0-based argument position, when the diagnostic concerns one argument.
    pub arg: Option<usize>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, argument, or hint.
    pub fn new(level: DiagLevel, loop_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            loop_name: loop_name.into(),
            arg: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Shorthand for an error-level diagnostic carrying a code.
    pub fn error(code: DiagCode, loop_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, loop_name, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the 0-based index of the offending argument.
    pub fn with_arg(mut self, arg: usize) -> Self {
        self.arg = Some(arg);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        match &self.code {
            Some(code) => write!(f, "{}[{}]: ", level, code)?,
            None => write!(f, "{}: ", level)?,
        }
        write!(f, "loop '{}'", self.loop_name)?;
        if let Some(arg) = self.arg {
            // Users number arguments from 1, matching the generated `opArg<n>` names.
            write!(f, ", argument {}", arg + 1)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}
