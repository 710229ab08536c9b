use std::env::VarError;
use std::ffi::OsStr;
use std::fs::create_dir_all;
use std::path::PathBuf;

use anyhow::{Result, Context, anyhow, bail};

pub fn osstr_to_str(s: &OsStr) -> Result<&str> {
    match s.to_str() {
        Some(s2) => Ok(s2),
        None => bail!("can't properly decode to string {:?}",
                      s.to_string_lossy())
    }
}

pub fn program_name() -> Result<String> {
    let path = std::env::args_os().next().ok_or_else(
            || anyhow!("missing program executable path in args_os"))?;
    let pb = PathBuf::from(path);
    let fname = pb.file_name().ok_or_else(|| anyhow!("cannot get file name from path {:?}",
                                                     pb.to_string_lossy()))?;
    Ok(osstr_to_str(fname).with_context(
        || anyhow!("cannot decode file name {:?}",
                   fname.to_string_lossy()))?
       .to_string())
}

/// `$HOME/log/<program name>`, created if missing.
pub fn log_basedir() -> Result<PathBuf> {
    let logbasedir = PathBuf::from(
        std::env::var("HOME").with_context(|| anyhow!("can't get HOME env var"))?)
        .join("log")
        .join(program_name()?);
    create_dir_all(&logbasedir).with_context(
        || anyhow!("can't create log base directory {:?}",
                   logbasedir))?;
    Ok(logbasedir)
}

/// Get an env var as a String; decoding failures are reported as
/// errors.
pub fn getenv(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(s) => Ok(Some(s)),
        Err(e) => match e {
            VarError::NotPresent => Ok(None),
            VarError::NotUnicode(_) => bail!("{name:?} env var is not unicode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_getenv() -> Result<()> {
        assert_eq!(getenv("ARBITER_SURELY_UNSET_VARIABLE")?, None);
        assert!(getenv("PATH")?.is_some());
        Ok(())
    }
}
