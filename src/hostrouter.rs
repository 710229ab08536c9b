//! Route according to the scheme, domain and port

use std::{sync::{Arc, Mutex}, collections::HashMap};

use kstring::KString;

use crate::{apachelog::Logs,
            site::{Binding, Scheme, Site},
            warn};

/// A site together with its logs.
pub struct HostRouter {
    pub site: Arc<Site>,
    pub logs: Arc<Mutex<Logs>>,
}

/// Routes for all bindings of all sites
pub struct HostsRouter {
    /// Hostnames are stored in lowercased form.
    pub routers: HashMap<Binding, Arc<HostRouter>>,
    /// Logs for requests that match no site.
    pub logs: Arc<Mutex<Logs>>,
}

impl HostsRouter {
    pub fn new(logs: Arc<Mutex<Logs>>) -> HostsRouter {
        HostsRouter {
            routers: Default::default(),
            logs
        }
    }

    /// A router for `sites`, with the logs `open_logs` gives for a
    /// site name; requests matching no site are logged as
    /// `default`.
    pub fn from_sites<F>(sites: &[Site], mut open_logs: F) -> anyhow::Result<HostsRouter>
    where F: FnMut(&str) -> anyhow::Result<Arc<Mutex<Logs>>>
    {
        let mut hosts = HostsRouter::new(open_logs("default")?);
        for site in sites {
            hosts.add(Arc::new(HostRouter {
                site: Arc::new(site.clone()),
                logs: open_logs(&site.name)?,
            }));
        }
        Ok(hosts)
    }

    /// Register `hostrouter` for each binding of its site.
    pub fn add(&mut self,
               hostrouter: Arc<HostRouter>
    ) -> &mut Self {
        for binding in &hostrouter.site.bindings {
            if let Some(old) = self.routers.insert(binding.clone(), hostrouter.clone()) {
                warn!("duplicate binding {binding} for sites {:?} and {:?}, \
                       the former is dropped",
                      old.site.name, hostrouter.site.name);
            }
        }
        self
    }

    /// The site for `host` (already lowercased), trying the exact
    /// host name first and then a `*` binding.
    pub fn find(&self, scheme: Scheme, host: &str, port: u16) -> Option<&Arc<HostRouter>> {
        let mut binding = Binding {
            scheme,
            host: Some(KString::from_ref(host)),
            port,
        };
        if let Some(router) = self.routers.get(&binding) {
            return Some(router)
        }
        binding.host = None;
        self.routers.get(&binding)
    }

    /// All bindings, for setting up the listeners.
    pub fn bindings(&self) -> impl Iterator<Item = (&Binding, &Arc<HostRouter>)> {
        self.routers.iter()
    }
}
