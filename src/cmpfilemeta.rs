//! File metadata that can be used as key to verify (with good chance,
//! given good faith actors) if a file has changed on disk. Compiled
//! pages are kept together with the metadata of their source.

use std::{fs::{FileType, Metadata}, os::unix::prelude::MetadataExt, path::Path, time::SystemTime};

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other  // device files, sockets, pipes
}

impl From<FileType> for FileKind {
    fn from(t: FileType) -> Self {
        if t.is_symlink() {
            FileKind::Symlink
        } else if t.is_dir() {
            FileKind::Dir
        } else if t.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmpFileMeta {
    pub kind: FileKind,
    pub modified_time: SystemTime,
    pub ino: u64,
    pub len: u64, // size
}

pub trait GetCmpFileMeta {
    fn cmpfilemeta(&self) -> Result<CmpFileMeta>;
}

impl GetCmpFileMeta for Metadata {
    fn cmpfilemeta(&self) -> Result<CmpFileMeta> {
        Ok(CmpFileMeta {
            kind: self.file_type().into(),
            modified_time: self.modified()?,
            ino: self.ino(),
            len: self.len()
        })
    }
}

impl GetCmpFileMeta for Path {
    /// Follows symlinks.
    fn cmpfilemeta(&self) -> Result<CmpFileMeta> {
        std::fs::metadata(self)
            .with_context(|| anyhow!("stat {:?}", self))?
            .cmpfilemeta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random_util::randomidstring;

    #[test]
    fn t_changes() -> Result<()> {
        let path = std::env::temp_dir().join(format!("cmpfilemeta-{}", randomidstring()?));
        std::fs::write(&path, "a")?;
        let m1 = path.cmpfilemeta()?;
        assert_eq!(m1.kind, FileKind::File);
        assert_eq!(path.cmpfilemeta()?, m1);
        std::fs::write(&path, "ab")?;
        assert_ne!(path.cmpfilemeta()?, m1);
        std::fs::remove_file(&path)?;
        assert!(path.cmpfilemeta().is_err());
        assert_eq!(std::env::temp_dir().cmpfilemeta()?.kind, FileKind::Dir);
        Ok(())
    }
}
