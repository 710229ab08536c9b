//! Filesystem notifications for template and library sources.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// What an event means for each path it names. A path that is gone
/// by the time we look is a removal whatever the event said (renames
/// away arrive as modifications).
pub fn classify(event: &Event) -> Vec<Change> {
    let removal = match event.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Remove(_) => true,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other => false,
    };
    event.paths.iter().filter_map(|path| {
        if removal || !path.exists() {
            Some(Change::Removed(path.clone()))
        } else if path.is_dir() {
            None
        } else {
            Some(Change::Changed(path.clone()))
        }
    }).collect()
}

/// Watch `root` recursively, calling `on_change` from the notifier's
/// thread. The watch ends when the returned watcher is dropped.
pub fn watch_tree<F>(root: &Path, on_change: F) -> Result<RecommendedWatcher>
where F: Fn(Change) + Send + 'static
{
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in classify(&event) {
                on_change(change);
            }
        }
        Err(e) => warn!("filesystem watcher: {e}"),
    }).map_err(|e| anyhow!("can't start filesystem watcher: {e}"))?;
    watcher.watch(root, RecursiveMode::Recursive)
        .with_context(|| anyhow!("watching {:?}", root))?;
    Ok(watcher)
}
