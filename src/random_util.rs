use std::fmt::Write;

use anyhow::{anyhow, Result};

/// A 12 character (6 entropy bytes) long hex string useful to tag
/// e.g. error messages for identification.
pub fn randomidstring() -> Result<String> {
    let mut buf = [0u8; 6];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("getrandom: {e}"))?;
    let mut s = String::new();
    for byte in buf {
        let _ = write!(&mut s, "{:02X}", byte);
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_randomidstring() -> Result<()> {
        let a = randomidstring()?;
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, randomidstring()?);
        Ok(())
    }
}
