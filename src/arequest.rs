use std::{net::{SocketAddr, IpAddr}, time::SystemTime, collections::BTreeMap};

use anyhow::{Result, anyhow, Context};
use kstring::KString;
use rouille::{Request, HeadersIter};

use crate::http_request_method::HttpRequestMethod;
use crate::script::value::{map_value, Value};
use crate::site::{split_host_port, Scheme};
use crate::url_encoding::{query_pairs, url_decode};

pub struct ARequest<'r> {
    // Fallback for host(): what this server listens on
    listen_addr: &'r str,
    listen_port: u16,
    /// Percent-decoded, without the query string.
    path: String,
    now: SystemTime,
    method: HttpRequestMethod,
    request: &'r Request,
}

impl<'r> ARequest<'r> {
    pub fn new(request: &'r Request, listen_addr: &'r str, listen_port: u16) -> Result<Self> {
        let raw_path = request.raw_url().split('?').next().unwrap_or("");
        let path = url_decode(raw_path)
            .with_context(|| anyhow!("request path {raw_path:?}"))?;
        let method = HttpRequestMethod::parse(request.method())?;
        Ok(ARequest {
            listen_addr,
            listen_port,
            path,
            now: SystemTime::now(),
            method,
            request,
        })
    }

    /// Like the request part in Apache style Combined Log Format
    pub fn request_line(&self) -> String {
        // Request does not appear to keep the request line as sent;
        // thus have to reconstruct it, bummer.
        format!("{} {}",
                self.request.method(),
                self.request.raw_url())
    }
    /// `foo` part in `?foo`
    pub fn query_string(&self) -> &str {
        self.request.raw_query_string()
    }
    pub fn user_agent(&self) -> Option<&str> {
        self.request.header("user-agent")
    }
    pub fn client_ip(&self) -> IpAddr {
        self.request.remote_addr().ip()
    }
    pub fn is_secure(&self) -> bool {
        self.request.is_secure()
    }
    pub fn scheme(&self) -> Scheme {
        if self.is_secure() { Scheme::Https } else { Scheme::Http }
    }
    pub fn method_str(&self) -> &str { self.request.method() }
    pub fn method(&self) -> HttpRequestMethod { self.method }
    pub fn host(&self) -> Option<&str> { self.request.header("host") }
    pub fn host_or_listen_addr(&self) -> &str {
        self.request.header("host").unwrap_or(self.listen_addr)
    }
    /// Lowercased host name and port the request was sent to; the
    /// port defaults to the one it came in on.
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        let (host, port) = split_host_port(self.host_or_listen_addr())?;
        Ok((host.to_lowercase(), port.unwrap_or(self.listen_port)))
    }
    pub fn client_addr(&self) -> &SocketAddr { self.request.remote_addr() }
    pub fn path(&self) -> &str { &self.path }
    pub fn now(&self) -> &SystemTime { &self.now }
    pub fn referer(&self) -> Option<&str> {
        self.header("referer")
    }

    pub fn header(&self, key: &str) -> Option<&str> { self.request.header(key) }
    pub fn headers(&self) -> HeadersIter { self.request.headers() }

    pub fn request(&self) -> &Request { self.request }

    /// What pages see as `Request`. Header names are lowercased; an
    /// undecodable query string gives no parameters.
    pub fn to_value(&self) -> Value {
        let (host, port) = self.host_and_port()
            .unwrap_or_else(|_| (String::new(), self.listen_port));
        let params = query_pairs(self.query_string()).unwrap_or_default();
        let headers: BTreeMap<KString, Value> = self.headers()
            .map(|(k, v)| (KString::from_string(k.to_lowercase()), Value::from(v)))
            .collect();
        map_value([
            ("method", Value::from(self.method_str())),
            ("path", Value::from(self.path())),
            ("query", Value::from(self.query_string())),
            ("scheme", Value::from(self.scheme().as_str())),
            ("host", Value::from(host)),
            ("port", Value::from(i64::from(port))),
            ("remote_addr", Value::from(self.client_ip().to_string())),
            ("headers", Value::from(headers)),
            ("params", map_value(
                params.iter().map(|(k, v)| (k.as_str(), Value::from(v.as_str()))))),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_arequest() -> Result<()> {
        let request = Request::fake_http(
            "GET", "/a%20b/c.ahtml?x=1&y=two%21",
            vec![("Host".into(), "Example.com:8080".into())], vec![]);
        let r = ARequest::new(&request, "0.0.0.0:80", 80)?;
        assert_eq!(r.path(), "/a b/c.ahtml");
        assert_eq!(r.host_and_port()?, ("example.com".into(), 8080));
        assert_eq!(r.scheme(), Scheme::Http);
        let v = r.to_value();
        assert_eq!(v.field("path").unwrap().to_text(), "/a b/c.ahtml");
        assert_eq!(v.field("params").unwrap().field("y").unwrap().to_text(), "two!");
        assert_eq!(v.field("port").unwrap().as_int(), Some(8080));
        assert_eq!(v.field("headers").unwrap().field("host").unwrap().to_text(),
                   "Example.com:8080");

        let request = Request::fake_http("GET", "/", vec![], vec![]);
        let r = ARequest::new(&request, "127.0.0.1:81", 81)?;
        assert_eq!(r.host_and_port()?, ("127.0.0.1".into(), 81));

        let request = Request::fake_http("BREW", "/", vec![], vec![]);
        assert!(ARequest::new(&request, "127.0.0.1:81", 81).is_err());
        Ok(())
    }
}
