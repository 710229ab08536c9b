//! Path-keyed cache of compiled units.
//!
//! Lookups of published units only take a read lock. Compiling
//! happens under a lock for the path, so that at most one compilation
//! per path is in flight; callers racing for the same path wait and
//! then find the unit the winner published.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::cmpfilemeta::{CmpFileMeta, GetCmpFileMeta};
use crate::time_util::unixtime;
use crate::{info, warn};
use super::unit::{CompiledUnit, Diagnostic};

/// Turns the file at a path into a unit. Failures are units too.
pub trait Compile: Send + Sync {
    fn compile(&self, path: &Path) -> CompiledUnit;
}

impl<F> Compile for F
where F: Fn(&Path) -> CompiledUnit + Send + Sync
{
    fn compile(&self, path: &Path) -> CompiledUnit {
        self(path)
    }
}

struct CacheEntry {
    unit: Arc<CompiledUnit>,
    /// The file as it was right before `unit` was compiled.
    meta: Option<CmpFileMeta>,
    /// The last failed recompile that did not replace `unit`.
    rejected: Option<Arc<CompiledUnit>>,
}

/// What `refresh` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refreshed {
    /// Nothing cached for the path; nothing compiled.
    NotCached,
    Replaced,
    /// The recompile failed and the working unit stays published.
    Rejected,
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub path: String,
    pub success: bool,
    pub compiled_at: i64,
    pub diagnostics: Vec<Diagnostic>,
    pub rejected: Option<Vec<Diagnostic>>,
}

pub struct UnitCache<C: Compile> {
    compiler: C,
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    /// Per-path compile locks, present while someone holds them.
    inflight: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// Check file metadata on every lookup.
    revalidate: AtomicBool,
    compilations: AtomicU64,
}

fn file_meta(path: &Path) -> Option<CmpFileMeta> {
    path.cmpfilemeta().ok()
}

impl<C: Compile> UnitCache<C> {
    pub fn new(compiler: C) -> Self {
        UnitCache {
            compiler,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            revalidate: AtomicBool::new(false),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn set_revalidate(&self, on: bool) {
        self.revalidate.store(on, Ordering::SeqCst);
    }

    pub fn revalidates(&self) -> bool {
        self.revalidate.load(Ordering::SeqCst)
    }

    /// Number of compilations done so far.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("never poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The published unit for `path`, if any.
    pub fn get(&self, path: &Path) -> Option<Arc<CompiledUnit>> {
        self.entries.read().expect("never poisoned").get(path).map(|e| e.unit.clone())
    }

    fn with_path_lock<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut inflight = self.inflight.lock().expect("never poisoned");
            inflight.entry(path.to_owned()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().expect("never poisoned");
            f()
        };
        let mut inflight = self.inflight.lock().expect("never poisoned");
        // the map's reference plus ours
        if Arc::strong_count(&lock) == 2 {
            inflight.remove(path);
        }
        result
    }

    fn compile(&self, path: &Path) -> (CompiledUnit, Option<CmpFileMeta>) {
        let meta = file_meta(path);
        self.compilations.fetch_add(1, Ordering::SeqCst);
        let unit = self.compiler.compile(path);
        if !unit.success {
            warn!("compiling {:?} failed: {}", path,
                  itertools::join(unit.errors(), "; "));
        }
        (unit, meta)
    }

    /// Whether the file behind a published entry was changed since it
    /// was compiled.
    fn is_stale(&self, path: &Path) -> bool {
        let entries = self.entries.read().expect("never poisoned");
        match entries.get(path) {
            Some(entry) => entry.meta != file_meta(path),
            None => false,
        }
    }

    /// The unit for `path`, compiling and publishing it if there is
    /// none. A failed compile is published too.
    pub fn get_or_compile(&self, path: &Path) -> Arc<CompiledUnit> {
        if self.revalidates() && self.is_stale(path) {
            if file_meta(path).is_none() {
                self.retire(path);
            } else {
                self.refresh(path);
            }
        }
        if let Some(unit) = self.get(path) {
            return unit
        }
        self.with_path_lock(path, || {
            // someone else may have won the race
            if let Some(unit) = self.get(path) {
                return unit
            }
            let (unit, meta) = self.compile(path);
            let unit = Arc::new(unit);
            self.entries.write().expect("never poisoned").insert(
                path.to_owned(),
                CacheEntry { unit: unit.clone(), meta, rejected: None });
            unit
        })
    }

    /// Recompile a cached `path` after its file changed. A successful
    /// unit replaces the published one. A failed one never replaces a
    /// successful unit; it replaces a failed one.
    pub fn refresh(&self, path: &Path) -> Refreshed {
        if self.get(path).is_none() {
            return Refreshed::NotCached
        }
        self.with_path_lock(path, || {
            let (unit, meta) = self.compile(path);
            let unit = Arc::new(unit);
            let mut entries = self.entries.write().expect("never poisoned");
            let entry = match entries.get_mut(path) {
                Some(entry) => entry,
                // retired meanwhile
                None => return Refreshed::NotCached,
            };
            if !unit.success && entry.unit.success {
                warn!("keeping the previous version of {:?}", path);
                entry.rejected = Some(unit);
                entry.meta = meta;
                return Refreshed::Rejected
            }
            let old = std::mem::replace(
                entry, CacheEntry { unit, meta, rejected: None });
            drop(entries);
            info!("recompiled {:?}", path);
            old.unit.unload();
            Refreshed::Replaced
        })
    }

    /// Forget the entry for `path`. Returns whether there was one.
    pub fn retire(&self, path: &Path) -> bool {
        let old = self.entries.write().expect("never poisoned").remove(path);
        match old {
            Some(entry) => {
                info!("retired {:?}", path);
                entry.unit.unload();
                true
            }
            None => false,
        }
    }

    /// Forget all entries whose unit failed to compile, so that they
    /// are compiled again on the next lookup. Returns how many there
    /// were.
    pub fn retire_failed(&self) -> usize {
        let failed: Vec<(PathBuf, CacheEntry)> = {
            let mut entries = self.entries.write().expect("never poisoned");
            let paths: Vec<PathBuf> = entries.iter()
                .filter(|(_, entry)| !entry.unit.success)
                .map(|(path, _)| path.clone())
                .collect();
            paths.into_iter()
                .filter_map(|path| entries.remove(&path).map(|entry| (path, entry)))
                .collect()
        };
        let count = failed.len();
        for (path, entry) in failed {
            info!("retired failed {:?}", path);
            entry.unit.unload();
        }
        count
    }

    /// Entries sorted by path, for the debug view.
    pub fn status(&self) -> Vec<CacheStatus> {
        let entries = self.entries.read().expect("never poisoned");
        let mut status: Vec<CacheStatus> = entries.iter().map(|(path, entry)| CacheStatus {
            path: path.to_string_lossy().into_owned(),
            success: entry.unit.success,
            compiled_at: unixtime(entry.unit.compiled_at),
            diagnostics: entry.unit.diagnostics.clone(),
            rejected: entry.rejected.as_ref().map(|u| u.diagnostics.clone()),
        }).collect();
        status.sort_by(|a, b| a.path.cmp(&b.path));
        status
    }
}
