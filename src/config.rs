//! Reading the configuration directory.
//!
//! The server reads `arbiter.cfg`, `mime.cfg` and `sites.cfg` (in
//! this order) and then `ahtml.cfg`, if present, for the template
//! engine. Each file is a sequence of statements, each starting with
//! an identifier naming the statement:
//!
//! ```text
//! listen "*"
//! logdir "/var/log/arbiter"
//! errors "err"
//! mime ".html" "text/html"
//! process ".ahtml" "ahtmlproc"
//! site "example" {
//!     path "/srv/example"
//!     listen "http://example.com:80"
//!     default { "index.ahtml" "index.html" }
//!     parameter "proxy_destination" "127.0.0.1:8000"
//! }
//! ```
//!
//! and in `ahtml.cfg`:
//!
//! ```text
//! library "lib/helpers.src"
//! output_limit 33554432
//! max_steps 10000000
//! revalidate off
//! ```
//!
//! Relative paths are taken relative to the configuration directory.

pub mod tokenstream;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use kstring::KString;
use lazy_static::lazy_static;

use crate::site::{Binding, Site};
use crate::template::EngineSettings;
use crate::warn;
use tokenstream::TokenStream;

pub const CONFIG_FILES: &[&str] = &["arbiter.cfg", "mime.cfg", "sites.cfg"];
pub const ENGINE_CONFIG_FILE: &str = "ahtml.cfg";

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Directory the configuration was read from.
    pub root: PathBuf,
    /// Addresses to listen on; the ports come from the site bindings.
    pub listen: Vec<IpAddr>,
    /// Extension (with the dot) to MIME type; `.*` is the fallback.
    pub mime: HashMap<KString, KString>,
    /// Extension to processor name.
    pub process: HashMap<KString, KString>,
    /// In order of appearance.
    pub sites: Vec<Site>,
    pub logdir: Option<PathBuf>,
    /// Directory with `<code>.html` error pages.
    pub errors: Option<PathBuf>,
    pub engine: EngineSettings,
}

type Statement = fn(&mut TokenStream, &mut Config) -> Result<()>;

lazy_static! {
    static ref STATEMENTS: HashMap<&'static str, Statement> = {
        let mut m: HashMap<&'static str, Statement> = HashMap::new();
        m.insert("listen", read_listen);
        m.insert("mime", read_mime);
        m.insert("process", read_process);
        m.insert("site", read_site);
        m.insert("logdir", read_logdir);
        m.insert("errors", read_errors);
        m
    };

    static ref ENGINE_STATEMENTS: HashMap<&'static str, Statement> = {
        let mut m: HashMap<&'static str, Statement> = HashMap::new();
        m.insert("library", read_library);
        m.insert("output_limit", read_output_limit);
        m.insert("max_steps", read_max_steps);
        m.insert("revalidate", read_revalidate);
        m
    };
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Config { root: root.into(), ..Default::default() }
    }

    /// `path` if absolute, else relative to the configuration
    /// directory.
    pub fn path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Read all configuration files in `root`.
    pub fn load(root: &Path) -> Result<Config> {
        let mut config = Config::new(root);
        for file in CONFIG_FILES {
            config.read_file(&root.join(file), &STATEMENTS)?;
        }
        let engine_file = root.join(ENGINE_CONFIG_FILE);
        if engine_file.exists() {
            config.read_file(&engine_file, &ENGINE_STATEMENTS)?;
        }
        Ok(config)
    }

    /// Only the engine settings from `root`, defaults if there is no
    /// `ahtml.cfg`; for the offline commands.
    pub fn load_engine(root: &Path) -> Result<Config> {
        let mut config = Config::new(root);
        let engine_file = root.join(ENGINE_CONFIG_FILE);
        if engine_file.exists() {
            config.read_file(&engine_file, &ENGINE_STATEMENTS)?;
        }
        Ok(config)
    }

    fn read_file(&mut self,
                 path: &Path,
                 statements: &HashMap<&'static str, Statement>) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| anyhow!("reading config file {:?}", path))?;
        self.read_str(&path.to_string_lossy(), &text, statements)
    }

    pub fn read_str(&mut self,
                    source: &str,
                    text: &str,
                    statements: &HashMap<&'static str, Statement>) -> Result<()> {
        let mut stream = TokenStream::tokenize(source, text)?;
        while let Some(token) = stream.peek().cloned() {
            let id = stream.accept_identifier()
                .ok_or_else(|| stream.unexpected("a statement"))?;
            match statements.get(id.as_str()) {
                Some(read) => read(&mut stream, self)?,
                None => bail!("{source}: unknown statement {id:?} at line {}", token.line),
            }
        }
        Ok(())
    }

    pub fn read_main_str(&mut self, source: &str, text: &str) -> Result<()> {
        self.read_str(source, text, &STATEMENTS)
    }

    pub fn read_engine_str(&mut self, source: &str, text: &str) -> Result<()> {
        self.read_str(source, text, &ENGINE_STATEMENTS)
    }

    /// Check references between statements.
    pub fn check(&self, processors: &[&str]) -> Result<()> {
        for (ext, name) in &self.process {
            if !processors.contains(&name.as_str()) {
                bail!("process {ext:?}: unknown processor {name:?}")
            }
        }
        for site in &self.sites {
            if let Some(name) = &site.processor {
                if !processors.contains(&name.as_str()) {
                    bail!("site {:?}: unknown processor {name:?}", site.name)
                }
            }
            if site.bindings.is_empty() {
                warn!("site {:?} has no `listen` binding and is unreachable", site.name);
            }
        }
        Ok(())
    }
}

fn read_listen(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let address = stream.expect_string()?;
    let addr = if address == "*" {
        IpAddr::from([0, 0, 0, 0])
    } else {
        address.parse().with_context(
            || anyhow!("{}: invalid listen address {address:?}", stream.source()))?
    };
    config.listen.push(addr);
    Ok(())
}

fn read_mime(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let ext = stream.expect_string()?;
    let mime = stream.expect_string()?;
    config.mime.insert(KString::from_string(ext), KString::from_string(mime));
    Ok(())
}

fn read_process(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let ext = stream.expect_string()?;
    let processor = stream.expect_string()?;
    config.process.insert(KString::from_string(ext), KString::from_string(processor));
    Ok(())
}

fn read_logdir(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let dir = stream.expect_string()?;
    config.logdir = Some(config.path(&dir));
    Ok(())
}

fn read_errors(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let dir = stream.expect_string()?;
    config.errors = Some(config.path(&dir));
    Ok(())
}

fn read_site(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let mut site = Site {
        name: KString::from_string(stream.expect_string()?),
        ..Default::default()
    };
    let mut have_path = false;
    stream.expect_operator("{")?;
    while !stream.accept_operator("}") {
        let key = stream.expect_identifier()?;
        match key.as_str() {
            "path" => {
                site.root = config.path(&stream.expect_string()?);
                have_path = true;
            }
            "listen" => {
                let s = stream.expect_string()?;
                let binding: Binding = s.parse()
                    .with_context(|| anyhow!("{}: site {:?}", stream.source(), site.name))?;
                site.bindings.push(binding);
            }
            "process" => site.processor = Some(KString::from_string(stream.expect_string()?)),
            "parameter" => {
                let key = stream.expect_string()?;
                let value = stream.expect_string()?;
                site.parameters.insert(KString::from_string(key), value);
            }
            "default" => site.default_docs.extend(stream.expect_strings()?),
            "tls" => site.tls = Some(config.path(&stream.expect_string()?)),
            "rewrite" => {
                let rewriter = stream.expect_string()?;
                warn!("{}: site {:?}: ignoring unknown rewriter {rewriter:?}",
                      stream.source(), site.name);
            }
            _ => bail!("{}: site {:?}: unknown setting {key:?}", stream.source(), site.name),
        }
    }
    if !have_path {
        bail!("{}: site {:?} is missing `path`", stream.source(), site.name)
    }
    if let Some(i) = config.sites.iter().position(|s| s.name == site.name) {
        warn!("{}: site {:?} defined again, replacing the earlier one",
              stream.source(), site.name);
        config.sites[i] = site;
    } else {
        config.sites.push(site);
    }
    Ok(())
}

fn read_library(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    for path in stream.expect_strings()? {
        let path = config.path(&path);
        config.engine.libraries.push(path);
    }
    Ok(())
}

fn read_output_limit(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    let n = stream.expect_number()?;
    config.engine.limits.output_limit = usize::try_from(n)
        .with_context(|| anyhow!("{}: output_limit {n} too large", stream.source()))?;
    Ok(())
}

fn read_max_steps(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    config.engine.limits.max_steps = stream.expect_number()?;
    Ok(())
}

fn read_revalidate(stream: &mut TokenStream, config: &mut Config) -> Result<()> {
    config.engine.revalidate = match stream.expect_identifier()?.as_str() {
        "on" => true,
        "off" => false,
        v => bail!("{}: revalidate: expected `on` or `off`, got {v:?}", stream.source()),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random_util::randomidstring;
    use crate::site::Scheme;

    #[test]
    fn t_main_statements() -> Result<()> {
        let mut config = Config::new("/etc/arbiter");
        config.read_main_str("arbiter.cfg", "listen \"*\"\nlisten \"127.0.0.1\"\n\
                                              logdir \"/var/log/arbiter\" errors \"err\"")?;
        config.read_main_str("mime.cfg", "mime \".html\" \"text/html\" # html\n\
                                           mime \".*\" \"application/octet-stream\"\n\
                                           process \".ahtml\" \"ahtmlproc\"")?;
        config.read_main_str("sites.cfg", r#"
            site "main" {
                path "www"
                listen "http://Example.com"
                listen "https://example.com:8443"
                default { "index.ahtml" "index.html" }
                default "home.html"
                parameter "k" "v"
                rewrite "x"
                tls "tls/example"
            }
            site "proxy" { path "/srv/p" listen "http://*:8080" process "proxyproc" }
        "#)?;
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.logdir.as_deref(), Some(Path::new("/var/log/arbiter")));
        assert_eq!(config.errors.as_deref(), Some(Path::new("/etc/arbiter/err")));
        assert_eq!(config.mime.get(".html").map(|s| s.as_str()), Some("text/html"));
        assert_eq!(config.process.get(".ahtml").map(|s| s.as_str()), Some("ahtmlproc"));
        let main = &config.sites[0];
        assert_eq!(main.root, Path::new("/etc/arbiter/www"));
        assert_eq!(main.bindings[0].host.as_deref(), Some("example.com"));
        assert_eq!(main.bindings[1].scheme, Scheme::Https);
        assert_eq!(main.default_docs, vec!["index.ahtml", "index.html", "home.html"]);
        assert_eq!(main.parameter("k"), Some("v"));
        assert_eq!(main.tls.as_deref(), Some(Path::new("/etc/arbiter/tls/example")));
        assert_eq!(config.sites[1].processor.as_deref(), Some("proxyproc"));
        config.check(&["ahtmlproc", "proxyproc"])?;
        assert!(config.check(&["ahtmlproc"]).is_err());
        Ok(())
    }

    #[test]
    fn t_errors() {
        let mut config = Config::new("/c");
        let e = config.read_main_str("x.cfg", "listen \"*\"\nbogus 1").unwrap_err();
        assert_eq!(e.to_string(), "x.cfg: unknown statement \"bogus\" at line 2");
        let e = config.read_main_str("x.cfg", "\"listen\"").unwrap_err();
        assert_eq!(e.to_string(),
                   "x.cfg: unexpected String \"listen\" token at line 1, expected a statement");
        assert!(config.read_main_str("x.cfg", "site \"a\" { listen \"http://a\" }").is_err());
        assert!(config.read_main_str("x.cfg", "site \"a\" { path \"p\" color \"red\" }").is_err());
        assert!(config.read_main_str("x.cfg", "listen \"not an ip\"").is_err());
        assert!(config.read_main_str("x.cfg", "mime \".html\"").is_err());
        assert!(config.read_engine_str("ahtml.cfg", "revalidate maybe").is_err());
    }

    #[test]
    fn t_engine_statements() -> Result<()> {
        let mut config = Config::new("/c");
        config.read_engine_str("ahtml.cfg", "library \"a.src\" library { \"/b.src\" }\n\
                                             output_limit 1024 max_steps 500 revalidate on")?;
        assert_eq!(config.engine.libraries,
                   vec![PathBuf::from("/c/a.src"), PathBuf::from("/b.src")]);
        assert_eq!(config.engine.limits.output_limit, 1024);
        assert_eq!(config.engine.limits.max_steps, 500);
        assert!(config.engine.revalidate);
        Ok(())
    }

    #[test]
    fn t_load() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("arbiter-config-{}", randomidstring()?));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("arbiter.cfg"), "listen \"*\"")?;
        std::fs::write(dir.join("mime.cfg"), "mime \".txt\" \"text/plain\"")?;
        assert!(Config::load(&dir).is_err());
        std::fs::write(dir.join("sites.cfg"), "site \"s\" { path \".\" }")?;
        let config = Config::load(&dir)?;
        assert_eq!(config.sites.len(), 1);
        assert!(config.engine.libraries.is_empty());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
