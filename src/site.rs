//! Sites (virtual hosts) and the addresses they are bound to.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use kstring::KString;
use strum_macros::{EnumString, IntoStaticStr};

use crate::script::value::{map_value, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// `scheme://host:port` a site answers to. A `*` host matches any
/// host name on that scheme and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub scheme: Scheme,
    /// Lowercased; `None` for `*`.
    pub host: Option<KString>,
    pub port: u16,
}

/// Split `host[:port]`, also for `[v6addr]:port`.
pub fn split_host_port(s: &str) -> Result<(&str, Option<u16>)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| anyhow!("missing `]` in {s:?}"))?;
        let port = rest[end + 1..].strip_prefix(':');
        (&s[..end + 2], port)
    } else {
        match s.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (s, None),
        }
    };
    let port = match port {
        Some(p) => Some(p.parse().with_context(|| anyhow!("bad port in {s:?}"))?),
        None => None,
    };
    Ok((host, port))
}

impl FromStr for Binding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s.split_once("://")
            .ok_or_else(|| anyhow!("binding {s:?} is missing a scheme"))?;
        let scheme = Scheme::from_str(&scheme.to_lowercase())
            .map_err(|_| anyhow!("binding {s:?}: unknown scheme {scheme:?}"))?;
        let authority = rest.trim_end_matches('/');
        if authority.contains('/') {
            bail!("binding {s:?} must not have a path")
        }
        let (host, port) = split_host_port(authority)
            .with_context(|| anyhow!("binding {s:?}"))?;
        if host.is_empty() {
            bail!("binding {s:?} is missing a host")
        }
        Ok(Binding {
            scheme,
            host: if host == "*" { None } else { Some(KString::from_string(host.to_lowercase())) },
            port: port.unwrap_or_else(|| scheme.default_port()),
        })
    }
}

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(),
               self.host.as_deref().unwrap_or("*"), self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Site {
    pub name: KString,
    /// Directory the site's files are served from.
    pub root: PathBuf,
    pub bindings: Vec<Binding>,
    /// Tried in order when a directory is requested.
    pub default_docs: Vec<String>,
    pub parameters: BTreeMap<KString, String>,
    /// Processor handling every request to this site.
    pub processor: Option<KString>,
    /// Base path of the `.crt` and `.key` PEM files for https.
    pub tls: Option<PathBuf>,
}

impl Site {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    /// What pages see as `Site`.
    pub fn to_value(&self) -> Value {
        map_value([
            ("name", Value::from(self.name.as_str())),
            ("root", Value::from(self.root.to_string_lossy().into_owned())),
            ("parameters", map_value(
                self.parameters.iter().map(|(k, v)| (k.as_str(), Value::from(v.as_str()))))),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_binding() -> Result<()> {
        let b: Binding = "https://Example.COM".parse()?;
        assert_eq!(b, Binding { scheme: Scheme::Https, host: Some("example.com".into()), port: 443 });
        let b: Binding = "http://*:8080/".parse()?;
        assert_eq!(b.host, None);
        assert_eq!(b.port, 8080);
        assert_eq!(b.to_string(), "http://*:8080");
        let b: Binding = "http://[::1]:81".parse()?;
        assert_eq!(b.host.as_deref(), Some("[::1]"));
        assert_eq!(b.port, 81);
        assert!("example.com".parse::<Binding>().is_err());
        assert!("ftp://example.com".parse::<Binding>().is_err());
        assert!("http://example.com:x".parse::<Binding>().is_err());
        assert!("http://example.com/a".parse::<Binding>().is_err());
        Ok(())
    }

    #[test]
    fn t_split_host_port() -> Result<()> {
        assert_eq!(split_host_port("a.b:12")?, ("a.b", Some(12)));
        assert_eq!(split_host_port("a.b")?, ("a.b", None));
        assert_eq!(split_host_port("[::1]")?, ("[::1]", None));
        Ok(())
    }
}
