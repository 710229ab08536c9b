//! The plain HTML pages sent when a page can't be compiled or fails
//! while running.

use std::fmt::Write;

use crate::random_util::randomidstring;
use crate::script::builtins::html_escape;
use crate::warn;
use super::layout::RenderError;
use super::unit::Diagnostic;

pub fn compile_error_report(path: &str, diagnostics: &[Diagnostic]) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "<meta charset=\"utf-8\">");
    let _ = writeln!(s, "Failed to compile <b>{}</b>", html_escape(path, false));
    let _ = writeln!(s, "<br>");
    for d in diagnostics {
        let _ = writeln!(s, "{}<br>", html_escape(&d.to_string(), false));
    }
    s
}

/// `errorid` is also in the log line for the failure.
pub fn runtime_error_report(path: &str, detail: &str, errorid: &str) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "<meta charset=\"utf-8\">");
    let _ = writeln!(s, "Exception while executing <b>{}</b>", html_escape(path, false));
    let _ = writeln!(s, "<br>");
    let _ = writeln!(s, "{}", html_escape(detail, false));
    let _ = writeln!(s, "<br>(error id {errorid})");
    s
}

/// The report for `err`, logging runtime failures.
pub fn error_report(err: &RenderError) -> String {
    match err {
        RenderError::Compile { path, diagnostics } => compile_error_report(path, diagnostics),
        RenderError::Runtime { path, .. } | RenderError::RecursionLimitExceeded { path } => {
            let errorid = randomidstring().unwrap_or_else(|_| "-".into());
            warn!("error {errorid}: {err}");
            runtime_error_report(path, &err.to_string(), &errorid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::interp::RuntimeFault;
    use crate::script::Pos;

    #[test]
    fn t_reports() {
        let d = Diagnostic::error("AH0101", Pos::new(2, 5), "unknown name `x<y`");
        let s = compile_error_report("/a<b>.ahtml", &[d]);
        assert!(s.starts_with("<meta charset=\"utf-8\">\nFailed to compile <b>/a&lt;b&gt;.ahtml</b>"));
        assert!(s.contains("error AH0101: unknown name `x&lt;y` (line 2, column 5)<br>"));

        let err = RenderError::Runtime {
            path: "/p.ahtml".into(),
            fault: RuntimeFault::script(Pos::new(1, 3), "boom"),
        };
        let s = error_report(&err);
        assert!(s.contains("Exception while executing <b>/p.ahtml</b>"));
        assert!(s.contains("boom (line 1, column 3)"));
        assert!(s.contains("(error id "));
    }
}
