//! Rendering a page and the chain of layouts it declares.

use std::sync::Arc;

use crate::script::ast::LibrarySet;
use crate::script::interp::{run_program, RenderContext, RuntimeFault, DEFAULT_MAX_STEPS};
use crate::script::value::Value;
use super::pagestate::PageState;
use super::unit::{CompiledUnit, Diagnostic};

/// How many layouts may follow the first page.
pub const MAX_LAYOUT_RECURSIONS: usize = 16;

pub const DEFAULT_OUTPUT_LIMIT: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    /// Bytes, for the page output and for each section.
    pub output_limit: usize,
    /// For the whole request, layouts included.
    pub max_steps: u64,
}

impl Default for RenderLimits {
    fn default() -> Self {
        RenderLimits { output_limit: DEFAULT_OUTPUT_LIMIT, max_steps: DEFAULT_MAX_STEPS }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to compile {path}")]
    Compile { path: String, diagnostics: Vec<Diagnostic> },
    #[error("error while executing {path}: {fault}")]
    Runtime { path: String, fault: RuntimeFault },
    #[error("too many layout recursions (more than {}) at {path}", MAX_LAYOUT_RECURSIONS)]
    RecursionLimitExceeded { path: String },
}

impl RenderError {
    /// The page or layout that failed.
    pub fn path(&self) -> &str {
        match self {
            RenderError::Compile { path, .. }
            | RenderError::Runtime { path, .. }
            | RenderError::RecursionLimitExceeded { path } => path,
        }
    }
}

#[derive(Debug)]
pub struct RenderedPage {
    pub body: Vec<u8>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub mime: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Number of layouts applied.
    pub layouts: usize,
    pub steps: u64,
}

/// Resolve `layout` as declared by the page at `current`; both are
/// site paths. A leading `/` is relative to the site root, anything
/// else to the directory of `current`.
pub fn resolve_layout_path(current: &str, layout: &str) -> Result<String, RuntimeFault> {
    let bad = |reason: &str| RuntimeFault::BadLayoutPath {
        path: layout.into(),
        reason: reason.into(),
    };
    if layout.is_empty() {
        return Err(bad("empty path"))
    }
    if layout.contains('\0') {
        return Err(bad("contains a NUL byte"))
    }
    let mut segments: Vec<&str> = Vec::new();
    if !layout.starts_with('/') {
        segments.extend(current.split('/').filter(|s| !s.is_empty()));
        segments.pop();
    }
    for segment in layout.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                if segments.pop().is_none() {
                    return Err(bad("leaves the site root"))
                }
            }
            _ => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(bad("names the site root"))
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Run the page at site path `initial`, then each layout it (or the
/// previous layout) declares, all against one `PageState`. Sections
/// captured by a page stay available to its layouts. `resolve` maps
/// a site path to its compiled unit.
///
/// On failure the partial output is dropped.
pub fn render_with_layout<R>(initial: &str,
                             mut resolve: R,
                             request: Value,
                             site: Value,
                             libraries: Arc<LibrarySet>,
                             limits: RenderLimits) -> Result<RenderedPage, RenderError>
where R: FnMut(&str) -> Arc<CompiledUnit>
{
    let mut page = PageState::new(limits.output_limit);
    let mut ctx = RenderContext::new(&mut page, request, site, libraries, limits.max_steps);
    let mut path = initial.to_owned();
    let mut recursions = 0;
    loop {
        // `title` is kept across iterations: the title a page sets
        // reaches the layouts wrapping it
        ctx.page.layout = None;
        ctx.page.section(None);

        let unit = resolve(&path);
        let program = match unit.program() {
            Some(program) => program.clone(),
            None => return Err(RenderError::Compile {
                path,
                diagnostics: unit.diagnostics.clone(),
            }),
        };
        if let Err(fault) = run_program(&program, &mut ctx) {
            return Err(RenderError::Runtime { path, fault })
        }

        let layout = match ctx.page.layout.take() {
            Some(layout) => layout,
            None => break,
        };
        recursions += 1;
        if recursions > MAX_LAYOUT_RECURSIONS {
            return Err(RenderError::RecursionLimitExceeded { path })
        }
        ctx.page.clear();
        path = match resolve_layout_path(&path, &layout) {
            Ok(p) => p,
            Err(fault) => return Err(RenderError::Runtime { path, fault }),
        };
    }
    ctx.page.section(None);
    let steps = ctx.steps_used();
    drop(ctx);
    Ok(RenderedPage {
        title: page.title.take(),
        status: page.status,
        mime: page.mime.take(),
        headers: std::mem::take(&mut page.headers),
        body: page.into_output(),
        layouts: recursions,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::template::compiler::compile_page;

    fn render(pages: &[(&str, String)], initial: &str, limits: RenderLimits)
              -> Result<RenderedPage, RenderError> {
        let pages: HashMap<String, String> =
            pages.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let libraries = LibrarySet::default();
        render_with_layout(
            initial,
            |path| Arc::new(match pages.get(path) {
                Some(t) => compile_page(path, t.as_bytes(), &libraries),
                None => CompiledUnit::failed(path.into(), vec![]),
            }),
            Value::Null, Value::Null, Arc::new(LibrarySet::default()), limits)
    }

    #[test]
    fn t_layout_path() {
        assert_eq!(resolve_layout_path("/a/b.ahtml", "/l.ahtml").unwrap(), "/l.ahtml");
        assert_eq!(resolve_layout_path("/a/b.ahtml", "l.ahtml").unwrap(), "/a/l.ahtml");
        assert_eq!(resolve_layout_path("/a/b.ahtml", "../x/./l.ahtml").unwrap(), "/x/l.ahtml");
        assert!(resolve_layout_path("/b.ahtml", "../l.ahtml").is_err());
        assert!(resolve_layout_path("/b.ahtml", "").is_err());
        assert!(resolve_layout_path("/b.ahtml", "/").is_err());
    }

    #[test]
    fn t_sections_through_layouts() -> Result<(), RenderError> {
        let out = render(&[
            ("/blog/post.ahtml",
             "<!layout \"frame.ahtml\"><!title \"Post\">\
              <!section \"body\">Hello<!/section><!section \"side\">S<!/section>".into()),
            ("/blog/frame.ahtml",
             "<!layout \"/main.ahtml\">\
              <!section \"framed\"><div><!writesection \"body\"></div><!/section>".into()),
            ("/main.ahtml",
             "<title><!Write(Title)!></title><!writesection \"framed\"><!writesection \"framed\">\
              |<!writesection \"side\">".into()),
        ], "/blog/post.ahtml", RenderLimits::default())?;
        assert_eq!(String::from_utf8_lossy(&out.body),
                   "<title>Post</title><div>Hello</div><div>Hello</div>|S");
        assert_eq!(out.title.as_deref(), Some("Post"));
        assert_eq!(out.layouts, 2);
        Ok(())
    }

    fn chain(n: usize) -> Vec<(String, String)> {
        (0..=n).map(|i| {
            let t = if i < n {
                format!("<!layout \"/l{}.ahtml\">{i},", i + 1)
            } else {
                "end".into()
            };
            (format!("/l{i}.ahtml"), t)
        }).collect()
    }

    #[test]
    fn t_recursion_limit() {
        let pages = chain(MAX_LAYOUT_RECURSIONS);
        let pages: Vec<(&str, String)> = pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let out = render(&pages, "/l0.ahtml", RenderLimits::default()).unwrap();
        assert_eq!(out.layouts, 16);
        assert!(out.body.ends_with(b"15,end"));

        let pages = chain(MAX_LAYOUT_RECURSIONS + 1);
        let pages: Vec<(&str, String)> = pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        match render(&pages, "/l0.ahtml", RenderLimits::default()) {
            Err(RenderError::RecursionLimitExceeded { path }) => assert_eq!(path, "/l16.ahtml"),
            r => panic!("{r:?}")
        }

        let own = [("/self.ahtml", "<!layout \"self.ahtml\">x".to_string())];
        assert!(matches!(render(&own, "/self.ahtml", RenderLimits::default()),
                         Err(RenderError::RecursionLimitExceeded { .. })));
    }

    #[test]
    fn t_failures() {
        let pages = [
            ("/p.ahtml", "<!layout \"/broken.ahtml\">".to_string()),
            ("/broken.ahtml", "<!Write(nope)!>".into()),
            ("/fault.ahtml", "a<!fail(\"boom\")!>".into()),
            ("/escape.ahtml", "<!layout \"../x\">".into()),
        ];
        match render(&pages, "/p.ahtml", RenderLimits::default()) {
            Err(RenderError::Compile { path, diagnostics }) => {
                assert_eq!(path, "/broken.ahtml");
                assert_eq!(diagnostics[0].code, "AH0101");
            }
            r => panic!("{r:?}")
        }
        match render(&pages, "/fault.ahtml", RenderLimits::default()) {
            Err(RenderError::Runtime { fault, .. }) => assert!(!fault.is_resource_exhaustion()),
            r => panic!("{r:?}")
        }
        match render(&pages, "/escape.ahtml", RenderLimits::default()) {
            Err(RenderError::Runtime { fault: RuntimeFault::BadLayoutPath { .. }, path }) =>
                assert_eq!(path, "/escape.ahtml"),
            r => panic!("{r:?}")
        }
    }

    #[test]
    fn t_output_ceiling() {
        let limits = RenderLimits { output_limit: 100, max_steps: 1_000_000 };
        let pages = [("/big.ahtml",
                      "<! while (true) { Write(\"0123456789\"); } !>".to_string())];
        match render(&pages, "/big.ahtml", limits) {
            Err(RenderError::Runtime { fault, .. }) => {
                assert!(fault.is_resource_exhaustion());
                assert!(matches!(fault, RuntimeFault::OutputLimit { limit: 100, .. }));
            }
            r => panic!("{r:?}")
        }
        let pages = [("/ok.ahtml", "x".repeat(100))];
        assert_eq!(render(&pages, "/ok.ahtml", limits).unwrap().body.len(), 100);
    }
}
