//! The result of compiling a template or a helper source file.

use std::fmt::Display;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use crate::script::ast::{Library, Program};
use crate::script::Pos;
use crate::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: &'static str, pos: Pos, message: impl Into<String>)
               -> Self {
        Diagnostic { severity, code, message: message.into(), line: pos.line, column: pos.column }
    }

    pub fn error(code: &'static str, pos: Pos, message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Error, code, pos, message)
    }

    pub fn warning(code: &'static str, pos: Pos, message: impl Into<String>) -> Self {
        Diagnostic::new(Severity::Warning, code, pos, message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{severity} {}: {} (line {}, column {})",
               self.code, self.message, self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub enum Runnable {
    Page(Arc<Program>),
    Library(Arc<Library>),
}

/// Immutable once built. `runnable` is present iff `success`.
#[derive(Debug)]
pub struct CompiledUnit {
    pub name: String,
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub runnable: Option<Runnable>,
    pub compiled_at: SystemTime,
}

impl CompiledUnit {
    pub fn succeeded(name: String, diagnostics: Vec<Diagnostic>, runnable: Runnable) -> Self {
        CompiledUnit {
            name,
            success: true,
            diagnostics,
            runnable: Some(runnable),
            compiled_at: SystemTime::now(),
        }
    }

    pub fn failed(name: String, diagnostics: Vec<Diagnostic>) -> Self {
        CompiledUnit {
            name,
            success: false,
            diagnostics,
            runnable: None,
            compiled_at: SystemTime::now(),
        }
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        match &self.runnable {
            Some(Runnable::Page(p)) => Some(p),
            _ => None
        }
    }

    pub fn library(&self) -> Option<&Arc<Library>> {
        match &self.runnable {
            Some(Runnable::Library(l)) => Some(l),
            _ => None
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// Give up this reference to the unit. Renders still running it
    /// hold their own references; the program is freed when the last
    /// of them finishes, not necessarily now.
    pub fn unload(self: Arc<Self>) {
        let name = self.name.clone();
        match Arc::try_unwrap(self) {
            Ok(unit) => drop(unit),
            Err(still_used) => {
                info!("unit {name:?} still in use ({} references), freed later",
                      Arc::strong_count(&still_used) - 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_diagnostic_display() {
        let d = Diagnostic::error("AH0101", Pos::new(3, 7), "unknown name `x`");
        assert_eq!(d.to_string(), "error AH0101: unknown name `x` (line 3, column 7)");
        assert_eq!(serde_json::to_string(&Diagnostic::warning("AH0201", Pos::START, "m")).unwrap(),
                   r#"{"severity":"warning","code":"AH0201","message":"m","line":1,"column":1}"#);
    }

    #[test]
    fn t_unload() {
        let unit = Arc::new(CompiledUnit::failed("x".into(), vec![]));
        let held = unit.clone();
        unit.unload();
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(!held.success);
        assert!(held.program().is_none());
    }
}
