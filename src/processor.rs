//! Processors turn a request for a site path into a response, instead
//! of the file being sent as is.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use kstring::KString;

use crate::arequest::ARequest;
use crate::aresponse::AResponse;
use crate::proxy::ProxyProcessor;
use crate::site::Site;
use crate::template::processor::AhtmlProcessor;
use crate::template::Engine;

pub trait Processor: Send + Sync {
    /// `site_path` is the canonical path within the site, starting
    /// with `/`. Err is turned into an error page by the caller.
    fn process(&self,
               request: &ARequest,
               site: &Site,
               site_path: &str) -> Result<AResponse>;
}

/// The processors available to `process` statements, by name.
pub struct Processors {
    processors: BTreeMap<KString, Arc<dyn Processor>>,
}

impl Processors {
    pub fn new(engine: Arc<Engine>) -> Processors {
        let mut processors = Processors { processors: BTreeMap::new() };
        processors.add("ahtmlproc", Arc::new(AhtmlProcessor::new(engine)));
        processors.add("proxyproc", Arc::new(ProxyProcessor));
        processors
    }

    pub fn add(&mut self, name: &str, processor: Arc<dyn Processor>) {
        self.processors.insert(KString::from_ref(name), processor);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.processors.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::EngineSettings;

    #[test]
    fn t_registry() {
        let processors = Processors::new(Engine::new(&EngineSettings::default()));
        assert_eq!(processors.names(), vec!["ahtmlproc", "proxyproc"]);
        assert!(processors.get("ahtmlproc").is_some());
        assert!(processors.get("cgiproc").is_none());
    }
}
