use std::io::BufWriter;
use std::{path::PathBuf, fs::File};

use anyhow::{Result, Context, anyhow};

/// Open `path` for appending, creating it (and its parent directory)
/// if missing.
pub fn open_log_output<P>(
    path: P
) -> Result<Box<BufWriter<File>>>
where PathBuf: From<P>
{
    let mut outp = File::options();
    outp.write(true).append(true).create(true);
    let pathb = PathBuf::from(path);
    if let Some(parent) = pathb.parent() {
        let _ignore = std::fs::create_dir_all(parent);
    }
    Ok(Box::new(BufWriter::new(outp.open(&pathb).with_context(
        || anyhow!("opening log for output: {:?}", pathb.to_string_lossy()))?)))
}
