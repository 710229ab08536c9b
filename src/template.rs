//! The template engine: pages written as HTML with `<! … >`
//! directives, compiled on first use into page-script programs and
//! kept compiled until their file changes.
//!
//! `segment` splits a template into text and directives, `codegen`
//! turns those into a page, `compiler` links it into a
//! `CompiledUnit`, `cache` keeps units per path and `layout` runs a
//! page and its layouts. `Engine` ties them together with the helper
//! libraries and the filesystem watcher.

pub mod cache;
pub mod codegen;
pub mod compiler;
pub mod layout;
pub mod pagestate;
pub mod processor;
pub mod report;
pub mod segment;
pub mod unit;
pub mod watch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use notify::RecommendedWatcher;
use serde::Serialize;

use crate::miniarcswap::MiniArcSwap;
use crate::script::ast::LibrarySet;
use crate::script::value::Value;
use crate::time_util::unixtime;
use crate::{info, warn};
use cache::{CacheStatus, Compile, Refreshed, UnitCache};
use compiler::{compile_page, compile_source_file, unreadable};
use layout::{render_with_layout, RenderError, RenderLimits, RenderedPage};
use unit::{CompiledUnit, Diagnostic};
use watch::{watch_tree, Change};

/// Engine settings, from `ahtml.cfg`.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub limits: RenderLimits,
    /// Check page files for changes on every request.
    pub revalidate: bool,
    /// Helper source files.
    pub libraries: Vec<PathBuf>,
}

/// Compiles page files against the libraries current at the time.
pub struct PageCompiler {
    libraries: Arc<MiniArcSwap<LibrarySet>>,
}

impl Compile for PageCompiler {
    fn compile(&self, path: &Path) -> CompiledUnit {
        let name = path.to_string_lossy();
        match std::fs::read(path) {
            Ok(template) => compile_page(&name, &template, &self.libraries.get()),
            Err(e) => unreadable(&name, &e),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub revalidate: bool,
    pub compilations: u64,
    pub pages: Vec<CacheStatus>,
    pub libraries: Vec<CacheStatus>,
}

/// The file for site path `site_path` (starting with `/`) under
/// `site_root`.
pub fn site_file(site_root: &Path, site_path: &str) -> PathBuf {
    site_root.join(site_path.trim_start_matches('/'))
}

pub struct Engine {
    pages: UnitCache<PageCompiler>,
    libraries: Arc<MiniArcSwap<LibrarySet>>,
    /// The last compile of each configured library; also serializes
    /// library updates.
    library_units: Mutex<HashMap<PathBuf, Arc<CompiledUnit>>>,
    limits: RenderLimits,
    watched: Mutex<Vec<(PathBuf, RecommendedWatcher)>>,
}

impl Engine {
    /// Compiles the configured libraries right away; failures are
    /// logged and leave the library out.
    pub fn new(settings: &EngineSettings) -> Arc<Engine> {
        let libraries = Arc::new(MiniArcSwap::new(Arc::new(LibrarySet::default())));
        let engine = Engine {
            pages: UnitCache::new(PageCompiler { libraries: libraries.clone() }),
            libraries,
            library_units: Mutex::new(HashMap::new()),
            limits: settings.limits,
            watched: Mutex::new(Vec::new()),
        };
        engine.pages.set_revalidate(settings.revalidate);
        for path in &settings.libraries {
            engine.load_library(path);
        }
        Arc::new(engine)
    }

    pub fn limits(&self) -> RenderLimits {
        self.limits
    }

    pub fn libraries(&self) -> Arc<LibrarySet> {
        self.libraries.get()
    }

    /// The unit for the page file at `path`.
    pub fn page(&self, path: &Path) -> Arc<CompiledUnit> {
        self.pages.get_or_compile(path)
    }

    fn is_library(&self, path: &Path) -> bool {
        self.library_units.lock().expect("never poisoned").contains_key(path)
    }

    /// (Re)compile the library at `path`. A failed compile keeps the
    /// previous version of the library in effect. Pages that failed to
    /// compile are compiled again against the new library set.
    pub fn load_library(&self, path: &Path) -> Arc<CompiledUnit> {
        let mut units = self.library_units.lock().expect("never poisoned");
        let unit = Arc::new(match std::fs::read_to_string(path) {
            Ok(source) => compile_source_file(path, &source, &self.libraries.get()),
            Err(e) => unreadable(&path.to_string_lossy(), &e),
        });
        match unit.library() {
            Some(library) => {
                self.libraries.set(Arc::new(self.libraries.get().with_library(library.clone())));
                info!("loaded library {:?}", path);
                if let Some(old) = units.insert(path.to_owned(), unit.clone()) {
                    old.unload();
                }
                self.pages.retire_failed();
            }
            None => {
                warn!("library {:?} failed to compile: {}", path,
                      itertools::join(unit.errors(), "; "));
                let keep_old = units.get(path).map_or(false, |old| old.success);
                if keep_old {
                    warn!("keeping the previous version of {:?}", path);
                } else {
                    units.insert(path.to_owned(), unit.clone());
                }
            }
        }
        unit
    }

    /// Take the library at `path` out of effect; it stays known so
    /// that it is picked up again when the file comes back.
    pub fn remove_library(&self, path: &Path) {
        let mut units = self.library_units.lock().expect("never poisoned");
        self.libraries.set(Arc::new(self.libraries.get().without_library(path)));
        let gone = unreadable(&path.to_string_lossy(),
                              &std::io::Error::from(std::io::ErrorKind::NotFound));
        if let Some(old) = units.insert(path.to_owned(), Arc::new(gone)) {
            old.unload();
        }
        self.pages.retire_failed();
        info!("removed library {:?}", path);
    }

    /// React to a file change under a watched tree.
    pub fn on_change(&self, change: Change) {
        match change {
            Change::Changed(path) => {
                if self.is_library(&path) {
                    self.load_library(&path);
                } else if self.pages.refresh(&path) == Refreshed::Rejected {
                    warn!("recompiling {:?} failed, still serving the previous version", path);
                }
            }
            Change::Removed(path) => {
                if self.is_library(&path) {
                    self.remove_library(&path);
                } else {
                    self.pages.retire(&path);
                }
            }
        }
    }

    /// Watch the tree at `root` for changes to pages and libraries.
    /// Trees already covered by a watched one are not watched twice.
    /// Without a watcher, page files are checked on every request
    /// instead.
    pub fn watch(self: &Arc<Self>, root: &Path) -> Result<()> {
        let mut watched = self.watched.lock().expect("never poisoned");
        if watched.iter().any(|(r, _)| root.starts_with(r)) {
            return Ok(())
        }
        let engine: Weak<Engine> = Arc::downgrade(self);
        match watch_tree(root, move |change| {
            if let Some(engine) = engine.upgrade() {
                engine.on_change(change);
            }
        }) {
            Ok(watcher) => {
                info!("watching {:?}", root);
                // dropping their watchers ends the watches below root
                watched.retain(|(r, _)| !r.starts_with(root));
                watched.push((root.to_owned(), watcher));
                Ok(())
            }
            Err(e) => {
                warn!("{e:#}; checking files on each request instead");
                self.pages.set_revalidate(true);
                Err(e)
            }
        }
    }

    /// Render the page at `site_path` of the site at `site_root`.
    pub fn render(&self,
                  site_root: &Path,
                  site_path: &str,
                  request: Value,
                  site: Value) -> Result<RenderedPage, RenderError> {
        render_with_layout(site_path,
                           |p| self.pages.get_or_compile(&site_file(site_root, p)),
                           request,
                           site,
                           self.libraries.get(),
                           self.limits)
    }

    pub fn status(&self) -> EngineStatus {
        let units = self.library_units.lock().expect("never poisoned");
        let mut libraries: Vec<CacheStatus> = units.iter().map(|(path, unit)| CacheStatus {
            path: path.to_string_lossy().into_owned(),
            success: unit.success,
            compiled_at: unixtime(unit.compiled_at),
            diagnostics: unit.diagnostics.clone(),
            rejected: None,
        }).collect();
        libraries.sort_by(|a, b| a.path.cmp(&b.path));
        EngineStatus {
            revalidate: self.pages.revalidates(),
            compilations: self.pages.compilations(),
            pages: self.pages.status(),
            libraries,
        }
    }

    /// Errors of the libraries that are not in effect.
    pub fn library_errors(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let units = self.library_units.lock().expect("never poisoned");
        units.iter().filter(|(_, u)| !u.success)
            .map(|(p, u)| (p.clone(), u.diagnostics.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random_util::randomidstring;

    fn tempdir() -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("arbiter-engine-{}", randomidstring()?));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn body(page: &RenderedPage) -> String {
        String::from_utf8_lossy(&page.body).into_owned()
    }

    #[test]
    fn t_render_with_library() -> Result<()> {
        let dir = tempdir()?;
        let lib = dir.join("helpers.src");
        std::fs::write(&lib, "class Greet { fn hi(n) { return \"hi \" + n; } }")?;
        std::fs::create_dir_all(dir.join("site/sub"))?;
        std::fs::write(dir.join("site/sub/index.ahtml"),
                       "<!layout \"/frame.ahtml\"><!section \"main\"><!Write(Greet.hi(\"you\"))!><!/section>")?;
        std::fs::write(dir.join("site/frame.ahtml"), "[<!writesection \"main\">]")?;

        let engine = Engine::new(&EngineSettings {
            libraries: vec![lib.clone()],
            ..Default::default()
        });
        let root = dir.join("site");
        let page = engine.render(&root, "/sub/index.ahtml", Value::Null, Value::Null)?;
        assert_eq!(body(&page), "[hi you]");

        // a broken library keeps the working one
        std::fs::write(&lib, "class Greet { fn hi(n) { return ")?;
        assert!(!engine.load_library(&lib).success);
        let page = engine.render(&root, "/sub/index.ahtml", Value::Null, Value::Null)?;
        assert_eq!(body(&page), "[hi you]");
        assert!(engine.status().libraries[0].success);

        std::fs::write(&lib, "class Greet { fn hi(n) { return \"hello \" + n; } }")?;
        engine.on_change(Change::Changed(lib.clone()));
        let page = engine.render(&root, "/sub/index.ahtml", Value::Null, Value::Null)?;
        assert_eq!(body(&page), "[hello you]");

        engine.on_change(Change::Removed(lib.clone()));
        assert!(engine.libraries().class("Greet").is_none());
        assert!(matches!(engine.render(&root, "/sub/index.ahtml", Value::Null, Value::Null),
                         Err(RenderError::Runtime { .. })));
        assert_eq!(engine.library_errors().len(), 1);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn t_page_recovers_with_library() -> Result<()> {
        let dir = tempdir()?;
        let lib = dir.join("h.src");
        std::fs::write(&lib, "class G { fn hi() { return ")?;
        std::fs::write(dir.join("p.ahtml"), "<!Write(G.hi())!>")?;
        let engine = Engine::new(&EngineSettings {
            libraries: vec![lib.clone()],
            ..Default::default()
        });
        assert!(matches!(engine.render(&dir, "/p.ahtml", Value::Null, Value::Null),
                         Err(RenderError::Compile { .. })));

        std::fs::write(&lib, "class G { fn hi() { return \"hi\"; } }")?;
        engine.on_change(Change::Changed(lib.clone()));
        assert_eq!(body(&engine.render(&dir, "/p.ahtml", Value::Null, Value::Null)?), "hi");

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn render_until(engine: &Engine, dir: &Path, expected: &str) -> Result<String> {
        let mut seen = String::new();
        for _ in 0..100 {
            seen = body(&engine.render(dir, "/p.ahtml", Value::Null, Value::Null)?);
            if seen == expected {
                break
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        Ok(seen)
    }

    #[test]
    fn t_watch_recompiles() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.join("p.ahtml");
        std::fs::write(&file, "one")?;
        let engine = Engine::new(&EngineSettings::default());
        engine.watch(&dir)?;
        // only the watcher can make changes visible now
        assert!(!engine.status().revalidate);
        assert_eq!(body(&engine.render(&dir, "/p.ahtml", Value::Null, Value::Null)?), "one");

        std::fs::write(&file, "<!Write(\"two\")!>")?;
        assert_eq!(render_until(&engine, &dir, "two")?, "two");
        assert!(engine.status().pages[0].success);

        std::fs::remove_file(&file)?;
        let mut retired = false;
        for _ in 0..100 {
            if engine.status().pages.is_empty() {
                retired = true;
                break
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(retired);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn t_watch_nested_roots() -> Result<()> {
        let dir = tempdir()?;
        let sub = dir.join("sub");
        std::fs::create_dir_all(&sub)?;
        let engine = Engine::new(&EngineSettings::default());
        let watched = || -> Vec<PathBuf> {
            engine.watched.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
        };
        engine.watch(&sub)?;
        assert_eq!(watched(), vec![sub.clone()]);
        engine.watch(&dir)?;
        assert_eq!(watched(), vec![dir.clone()]);
        engine.watch(&sub)?;
        assert_eq!(watched(), vec![dir.clone()]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn t_page_changes() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.join("p.ahtml");
        std::fs::write(&file, "one")?;
        let engine = Engine::new(&EngineSettings::default());
        assert_eq!(body(&engine.render(&dir, "/p.ahtml", Value::Null, Value::Null)?), "one");

        std::fs::write(&file, "<!Write(nope)!>")?;
        engine.on_change(Change::Changed(file.clone()));
        assert_eq!(body(&engine.render(&dir, "/p.ahtml", Value::Null, Value::Null)?), "one");

        std::fs::write(&file, "two")?;
        engine.on_change(Change::Changed(file.clone()));
        assert_eq!(body(&engine.render(&dir, "/p.ahtml", Value::Null, Value::Null)?), "two");

        std::fs::remove_file(&file)?;
        engine.on_change(Change::Removed(file.clone()));
        assert!(engine.status().pages.is_empty());
        match engine.render(&dir, "/p.ahtml", Value::Null, Value::Null) {
            Err(RenderError::Compile { diagnostics, .. }) =>
                assert_eq!(diagnostics[0].code, "AH0004"),
            r => panic!("{r:?}")
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
