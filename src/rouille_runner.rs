use std::collections::BTreeMap;
use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::{sync::Arc, thread};

use anyhow::{anyhow, bail, Context, Result};
use rouille::{Server, Request, Response};
use scoped_thread_pool::Pool;

use crate::arequest::ARequest;
use crate::config::Config;
use crate::handler::Handler;
use crate::http_response_status_codes::HttpResponseStatusCode;
use crate::in_threadpool::in_threadpool;
use crate::site::Scheme;
use crate::webutils::errorpage_from_status;
use crate::{info, warn};


/// Make a handler for Rouille's `start_server` procedure.
pub fn server_handler(
    listen_addr: String,
    listen_port: u16,
    handler: Arc<Handler>,
    threadpool: Arc<Pool>,
) -> impl for<'r> Fn(&'r Request) -> Response
{
    move |request: &Request| -> Response {
        let aresponse = in_threadpool(threadpool.clone(), || {
            match ARequest::new(request, &listen_addr, listen_port) {
                Ok(arequest) => handler.respond(&arequest),
                Err(e) => {
                    info!("bad request: {e:#}");
                    handler.error_response(HttpResponseStatusCode::BadRequest400)
                }
            }
        });
        match aresponse {
            Ok(aresponse) => aresponse.response,
            Err(e) => {
                warn!("worker pool: {e:#}");
                errorpage_from_status(HttpResponseStatusCode::InternalServerError500)
            }
        }
    }
}


/// PEM encoded certificate chain and private key.
#[derive(Clone)]
pub struct Tlskeys {
    pub crt: Vec<u8>,
    pub key: Vec<u8>,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(base.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

impl Tlskeys {
    /// Read `<base>.crt` and `<base>.key`.
    pub fn read(base: &Path) -> Result<Tlskeys> {
        let read = |suffix| {
            let path = with_suffix(base, suffix);
            std::fs::read(&path).with_context(|| anyhow!("reading {:?}", path))
        };
        Ok(Tlskeys {
            crt: read(".crt")?,
            key: read(".key")?,
        })
    }
}

/// An address to run a server on.
pub struct Listener {
    pub addr: SocketAddr,
    pub tlskeys: Option<Tlskeys>,
}

/// One listener per listen address and port any site is bound to.
/// All bindings on a port must have the same scheme; an https port
/// gets the keys of the first site on it that has `tls` configured.
pub fn listeners(config: &Config) -> Result<Vec<Listener>> {
    let mut ports: BTreeMap<u16, (Scheme, Option<&Path>)> = BTreeMap::new();
    for site in &config.sites {
        for binding in &site.bindings {
            let entry = ports.entry(binding.port).or_insert((binding.scheme, None));
            if entry.0 != binding.scheme {
                bail!("port {} is bound both as http and as https (site {:?})",
                      binding.port, site.name)
            }
            if entry.1.is_none() && binding.scheme == Scheme::Https {
                entry.1 = site.tls.as_deref();
            }
        }
    }

    let addrs: Vec<IpAddr> = if config.listen.is_empty() {
        vec![IpAddr::from([0, 0, 0, 0])]
    } else {
        config.listen.clone()
    };
    let mut listeners = Vec::new();
    for (port, (scheme, tls)) in ports {
        let tlskeys = match (scheme, tls) {
            (Scheme::Http, _) => None,
            (Scheme::Https, Some(base)) => Some(Tlskeys::read(base)?),
            (Scheme::Https, None) => {
                warn!("no site bound to https port {port} has `tls` configured, \
                       not listening on it");
                continue
            }
        };
        for addr in &addrs {
            listeners.push(Listener {
                addr: SocketAddr::new(*addr, port),
                tlskeys: tlskeys.clone(),
            });
        }
    }
    Ok(listeners)
}


pub struct RouilleRunner {
    workerthreadpool: Arc<Pool>,
}

/// Page scripts run on the workers; enough for the interpreter's
/// nesting and call depth limits in unoptimized builds.
const WORKER_STACK_SIZE: usize = 64 << 20;

impl RouilleRunner {
    pub fn new() -> Self {
        // The worker thread pool is kept separate from rouille's
        // connection threads, sized for the CPU intensive part.
        let workerthreadpool_size = 8 * thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workerthreadpool = {
            let cfg = scoped_thread_pool::ThreadConfig::new()
                .prefix("arbiter_worker")
                .stack_size(WORKER_STACK_SIZE);
            Arc::new(scoped_thread_pool::Pool::with_thread_config(
                workerthreadpool_size, cfg))
        };
        RouilleRunner {
            workerthreadpool,
        }
    }

    /// Run a rouille server in a new thread, and using the shared
    /// worker thread pool. The thread only ends if the server could
    /// not be started.
    pub fn run_server(
        &self,
        listener: Listener,
        handler: Arc<Handler>,
    ) -> Result<JoinHandle<Result<()>>, std::io::Error>
    {
        let Listener { addr, tlskeys } = listener;
        let thread_name = format!("server {addr}");
        thread::Builder::new().name(thread_name).spawn({
            let workerthreadpool = self.workerthreadpool.clone();
            move || {
                let handler = server_handler(
                    addr.to_string(),
                    addr.port(),
                    handler,
                    workerthreadpool,
                );
                let server = if let Some(Tlskeys { crt, key }) = tlskeys {
                    Server::new_ssl(addr, handler, crt, key)
                } else {
                    Server::new(addr, handler)
                }.map_err(|e| anyhow!("starting server on {addr}: {e}"))?;
                info!("listening on {addr}");
                server.run();
                Ok(())
            }
        })
    }
}

impl Default for RouilleRunner {
    fn default() -> Self {
        Self::new()
    }
}
