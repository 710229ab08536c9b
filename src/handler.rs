use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::borrow::Cow;

use anyhow::{Result, Context, anyhow, bail};
use httpdate::{fmt_http_date, parse_http_date};
use kstring::KString;
use rouille::{Response, ResponseBody};

use crate::apachelog::{log_combined, Logs};
use crate::arequest::ARequest;
use crate::aresponse::AResponse;
use crate::config::Config;
use crate::hostrouter::HostsRouter;
use crate::http_request_method::{HttpRequestMethod, HttpRequestMethodGroup};
use crate::http_response_status_codes::HttpResponseStatusCode;
use crate::processor::Processors;
use crate::script::builtins::html_escape;
use crate::site::Site;
use crate::template::{site_file, Engine};
use crate::webutils::{errorpage_from_error, errorpage_from_status};
use crate::{info, warn};

/// Path answered with the engine's cache state, on every site.
pub const DEBUG_CACHE_PATH: &str = "/.debug/cache";

/// Placeholder in `500.html` replaced with the error.
pub const EXCEPTION_DATA: &str = "<?exception_data?>";

/// Files with longer names are never given to a processor.
pub const MAX_PROCESSED_NAME_LEN: usize = 32;

// Can't just check `mtime > modsince` since that's ~always true
// because mtime has a nsec value, where modsince has 0 there.
// If just wanting to know if the file is *newer* than snapshot time:
fn file_is_newer_than_snapshot_time(mtime: SystemTime, modsince: SystemTime) -> bool {
    match mtime.duration_since(modsince) {
        Err(_e) => {
            // file is older than snapshot time; client is cheating,
            // or file has been restored to an older version; in any
            // case, it is not newer, so say no
            false
        }
        Ok(secsnewer) => {
            // Make sure it is at least a second newer, due to the
            // rounding issue. Otherwise it would report a fake newer.
            secsnewer >= Duration::from_secs(1)
        }
    }
}

macro_rules! cow {
    ($a:expr, $b:expr) => {
        (Cow::from($a), Cow::from($b))
    }
}

/// Drop `.` and empty segments and apply `..`; None if `..` leaves
/// the root.
fn canonicalize_path<'s>(path: &[&'s str]) -> Option<Vec<&'s str>> {
    let mut out = Vec::new();
    for &segment in path {
        match segment {
            "." => (),
            ".." =>
                if out.pop().is_none() {
                    return None
                },
            // multiple slashes to one
            "" => (),
            _ => out.push(segment)
        }
    }
    Some(out)
}

/// `.ext` of a file name, lowercased.
fn extension(file_name: &str) -> Option<String> {
    file_name.rfind('.').map(|i| file_name[i..].to_lowercase())
}

/// Send the file at `path` with caching headers, or 304 if the
/// client's copy is current.
fn serve_file(
    request: &ARequest,
    path: &Path,
    mimetype: &str,
) -> Result<AResponse> {
    let fh = File::open(path).with_context(
        || anyhow!("can't open file for reading: {:?}", path))?;
    let metadata = fh.metadata()?;
    let mtime: SystemTime = metadata.modified()?;
    // mtime in the future: treat as brand new
    let age: Duration = mtime.elapsed().unwrap_or(Duration::ZERO);
    let age_seconds = age.as_secs();
    let age_allowed = age_seconds + age_seconds / 10;
    let expires = mtime.checked_add(Duration::from_secs(age_allowed)).ok_or_else(
        || anyhow!("time overflow??"))?;
    let mtime_seconds = mtime.duration_since(UNIX_EPOCH)?.as_secs();
    let etag_quoted = format!("{:?}", mtime_seconds.to_string());

    let headers = vec![
        cow!("Content-Type", mimetype.to_owned()),
        cow!("Last-Modified", fmt_http_date(mtime)),
        // https://developer.mozilla.org/en-US/docs/Web/HTTP/Caching
        cow!("Cache-Control", format!("max-age={}", age_allowed)),
        cow!("Expires", fmt_http_date(expires)),
        cow!("ETag", etag_quoted.clone()),
    ];
    let not_modified = if let Some(modsince_str) = request.header("If-Modified-Since") {
        match parse_http_date(modsince_str) {
            Ok(modsince) => !file_is_newer_than_snapshot_time(mtime, modsince),
            Err(_) => {
                info!("ignoring invalid If-Modified-Since {modsince_str:?}");
                false
            }
        }
    } else if let Some(nonematch_str) = request.header("If-None-Match") {
        nonematch_str == etag_quoted
    } else {
        false
    };
    if not_modified {
        Ok(Response {
            status_code: HttpResponseStatusCode::NotModified304.code(),
            // Still send these, the client learns the file might be
            // *older* than what it saw
            headers,
            data: ResponseBody::empty(),
            upgrade: None,
        }.into())
    } else {
        Ok(Response {
            status_code: HttpResponseStatusCode::OK200.code(),
            headers,
            data: ResponseBody::from_reader_and_size(fh, usize::try_from(metadata.len())?),
            upgrade: None,
        }.into())
    }
}


/// Answers requests for all sites: picks the site, then a processor
/// or a static file.
pub struct Handler {
    hosts: Arc<HostsRouter>,
    /// Extension to MIME type, `.*` as fallback.
    mime: HashMap<KString, KString>,
    /// Extension to processor name.
    process: HashMap<KString, KString>,
    processors: Processors,
    /// Directory with `<code>.html` pages.
    errors: Option<PathBuf>,
    engine: Arc<Engine>,
}

impl Handler {
    /// Fails if `config` names processors not in `processors`.
    pub fn new(
        config: &Config,
        hosts: Arc<HostsRouter>,
        processors: Processors,
        engine: Arc<Engine>,
    ) -> Result<Handler> {
        config.check(&processors.names())?;
        Ok(Handler {
            hosts,
            mime: config.mime.clone(),
            process: config.process.clone(),
            processors,
            errors: config.errors.clone(),
            engine,
        })
    }

    /// Handle `request` with logging; every response allows any
    /// origin, and HEAD responses lose their body.
    pub fn respond(&self, request: &ARequest) -> AResponse {
        let mut response = log_combined(
            request,
            || self.handle(request),
            |err| self.exception_page(err));
        response.set_header("Access-Control-Allow-Origin", "*");
        if request.method() == HttpRequestMethod::HEAD {
            response.strip_body();
        }
        response
    }

    fn handle(&self, request: &ARequest) -> (Arc<Mutex<Logs>>, Result<AResponse>) {
        if request.path() == DEBUG_CACHE_PATH {
            return (self.hosts.logs.clone(), self.debug_cache())
        }
        let (host, port) = match request.host_and_port() {
            Ok(hp) => hp,
            Err(e) => {
                info!("{e:#}");
                return (self.hosts.logs.clone(),
                        Ok(self.error_response(HttpResponseStatusCode::BadRequest400)))
            }
        };
        match self.hosts.find(request.scheme(), &host, port) {
            Some(router) => (router.logs.clone(), self.handle_site(request, &router.site)),
            None => (self.hosts.logs.clone(),
                     Ok(self.error_response(HttpResponseStatusCode::NotFound404))),
        }
    }

    fn debug_cache(&self) -> Result<AResponse> {
        let json = serde_json::to_string_pretty(&self.engine.status())?;
        Ok(AResponse::from_bytes(HttpResponseStatusCode::OK200.code(),
                                 "application/json",
                                 json.into_bytes()))
    }

    fn handle_site(&self, request: &ARequest, site: &Site) -> Result<AResponse> {
        let segments: Vec<&str> = request.path().split('/').collect();
        let site_path = match canonicalize_path(&segments) {
            Some(canonpath) => format!("/{}", canonpath.join("/")),
            None => return Ok(self.error_response(HttpResponseStatusCode::Forbidden403)),
        };
        if let Some(name) = &site.processor {
            return self.run_processor(name, request, site, &site_path)
        }
        match request.method().group() {
            HttpRequestMethodGroup::Simple => (),
            HttpRequestMethodGroup::Document | HttpRequestMethodGroup::Special => {
                info!("method {:?} not implemented", request.method_str());
                return Ok(self.error_response(HttpResponseStatusCode::NotImplemented501))
            }
        }

        let full_path = site_file(&site.root, &site_path);
        let metadata = match full_path.metadata() {
            Ok(m) => m,
            Err(e) =>
                match e.kind() {
                    ErrorKind::NotFound =>
                        return Ok(self.error_response(HttpResponseStatusCode::NotFound404)),
                    _ => return Err(e).with_context(
                        || anyhow!("can't stat {:?}", full_path))
                }
        };
        if metadata.is_dir() {
            for doc in &site.default_docs {
                let doc_path = format!("{}/{doc}", site_path.trim_end_matches('/'));
                let doc_file = site_file(&site.root, &doc_path);
                if doc_file.is_file() {
                    return self.handle_file(request, site, &doc_path, &doc_file)
                }
            }
            Ok(self.error_response(HttpResponseStatusCode::NotFound404))
        } else if metadata.is_file() {
            self.handle_file(request, site, &site_path, &full_path)
        } else {
            warn!("neither file nor dir: device file or fifo or socket? {:?}", full_path);
            Ok(self.error_response(HttpResponseStatusCode::Forbidden403))
        }
    }

    fn handle_file(&self,
                   request: &ARequest,
                   site: &Site,
                   site_path: &str,
                   path: &Path) -> Result<AResponse> {
        let file_name = path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = extension(&file_name);
        if file_name.len() < MAX_PROCESSED_NAME_LEN {
            if let Some(name) = ext.as_deref().and_then(|e| self.process.get(e)) {
                return self.run_processor(name, request, site, site_path)
            }
        }
        let mime = ext.as_deref().and_then(|e| self.mime.get(e))
            .or_else(|| self.mime.get(".*"));
        match mime {
            Some(mime) => {
                if request.method().is_post() {
                    return Ok(self.error_response(HttpResponseStatusCode::MethodNotAllowed405))
                }
                serve_file(request, path, mime)
            }
            None => Ok(self.error_response(HttpResponseStatusCode::Forbidden403)),
        }
    }

    fn run_processor(&self,
                     name: &str,
                     request: &ARequest,
                     site: &Site,
                     site_path: &str) -> Result<AResponse> {
        let processor = match self.processors.get(name) {
            Some(p) => p,
            None => bail!("unknown processor {name:?}"),
        };
        processor.process(request, site, site_path).with_context(
            || anyhow!("processor {name:?} on {site_path:?} of site {:?}", site.name))
    }

    fn error_file(&self, status: HttpResponseStatusCode) -> Option<String> {
        let dir = self.errors.as_ref()?;
        let path = dir.join(format!("{}.html", status.code()));
        match std::fs::read_to_string(&path) {
            Ok(s) => Some(s),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("reading error page {:?}: {e}", path);
                }
                None
            }
        }
    }

    /// The page for `status`, from the `errors` directory if it has
    /// one.
    pub fn error_response(&self, status: HttpResponseStatusCode) -> AResponse {
        match self.error_file(status) {
            Some(page) => AResponse::from_bytes(status.code(), "text/html", page.into_bytes()),
            None => errorpage_from_status(status).into(),
        }
    }

    /// The 500 page for `err`.
    pub fn exception_page(&self, err: &anyhow::Error) -> AResponse {
        let status = HttpResponseStatusCode::InternalServerError500;
        match self.error_file(status) {
            Some(page) => {
                let detail = html_escape(&format!("{err:#}"), false);
                AResponse::from_bytes(status.code(), "text/html",
                                      page.replace(EXCEPTION_DATA, &detail).into_bytes())
            }
            None => errorpage_from_error(err).into(),
        }
    }
}
