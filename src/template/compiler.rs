//! Compiling pages and helper source files into `CompiledUnit`s.
//!
//! Compiling never touches anything but its inputs: a failure is a
//! unit with `success == false` and its diagnostics.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::script::ast::{ClassDecl, Library, LibrarySet, Name, Program};
use crate::script::link::{link_library, link_page};
use crate::script::parser::parse_declarations;
use crate::script::Pos;
use super::codegen::{generate, GeneratedPage};
use super::segment::{advance_pos, segment};
use super::unit::{CompiledUnit, Diagnostic, Runnable};

fn class_map(classes: Vec<ClassDecl>) -> BTreeMap<Name, Arc<ClassDecl>> {
    let mut map = BTreeMap::new();
    for class in classes {
        // duplicates were already reported by the linker
        map.entry(class.name.clone()).or_insert_with(|| Arc::new(class));
    }
    map
}

/// Segment and generate; the first half of page compilation, also
/// used to show the generated source.
pub fn generate_page(name: &str, template: &[u8]) -> Result<GeneratedPage, Diagnostic> {
    let segments = segment(template)
        .map_err(|e| Diagnostic::error(e.code, e.pos, e.message))?;
    Ok(generate(segments, name, advance_pos(Pos::START, template)))
}

/// Compile a template. `libraries` are the helper libraries the page
/// may call into.
pub fn compile_page(name: &str, template: &[u8], libraries: &LibrarySet) -> CompiledUnit {
    let page = match generate_page(name, template) {
        Ok(page) => page,
        Err(d) => return CompiledUnit::failed(name.into(), vec![d]),
    };
    let mut diagnostics: Vec<Diagnostic> = page.duplicate_imports.iter()
        .map(|i| Diagnostic::warning("AH0202", i.pos,
                                     format!("module `{}` is imported more than once", i.name)))
        .collect();
    let mut classes = page.classes();
    let mut body = match page.body_block() {
        Ok(body) => body,
        Err(e) => {
            diagnostics.push(Diagnostic::error("AH0002", e.pos, e.message));
            return CompiledUnit::failed(name.into(), diagnostics)
        }
    };
    diagnostics.extend(link_page(&page.imports, &mut classes, &mut body, libraries));
    finish(name, diagnostics, || Runnable::Page(Arc::new(Program {
        name: name.into(),
        classes: class_map(classes),
        body,
    })))
}

/// Compile a helper source file: class declarations only, no render
/// body and no template syntax.
pub fn compile_source_file(path: &Path, source: &str, libraries: &LibrarySet) -> CompiledUnit {
    let name = path.to_string_lossy().into_owned();
    let mut classes = match parse_declarations(source, Pos::START) {
        Ok(classes) => classes,
        Err(e) => return CompiledUnit::failed(
            name, vec![Diagnostic::error("AH0002", e.pos, e.message)]),
    };
    // a library replacing itself links against its own new classes,
    // not the old version of them
    let others = libraries.without_library(path);
    let diagnostics = link_library(&mut classes, &others);
    finish(&name, diagnostics, || Runnable::Library(Arc::new(Library {
        path: path.to_owned(),
        classes: class_map(classes),
    })))
}

/// A unit for a file that could not be read.
pub fn unreadable(name: &str, error: &std::io::Error) -> CompiledUnit {
    CompiledUnit::failed(name.into(), vec![
        Diagnostic::error("AH0004", Pos::START, format!("can't read source: {error}"))])
}

fn finish(name: &str, diagnostics: Vec<Diagnostic>, runnable: impl FnOnce() -> Runnable)
          -> CompiledUnit {
    if diagnostics.iter().any(|d| d.is_error()) {
        CompiledUnit::failed(name.into(), diagnostics)
    } else {
        CompiledUnit::succeeded(name.into(), diagnostics, runnable())
    }
}
