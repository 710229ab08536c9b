//! Forward requests to another HTTP server.

use anyhow::{anyhow, Context, Result};
use rouille::proxy::{full_proxy, ProxyConfig};

use crate::arequest::ARequest;
use crate::aresponse::AResponse;
use crate::processor::Processor;
use crate::site::Site;

/// Site parameter holding the `host:port` to forward to.
pub const PROXY_DESTINATION: &str = "proxy_destination";

pub struct ProxyProcessor;

impl Processor for ProxyProcessor {
    fn process(&self,
               request: &ARequest,
               site: &Site,
               _site_path: &str) -> Result<AResponse> {
        let dest = site.parameter(PROXY_DESTINATION).ok_or_else(
            || anyhow!("site {:?} has no {PROXY_DESTINATION:?} parameter", site.name))?;
        let response = full_proxy(request.request(), ProxyConfig {
            addr: dest,
            replace_host: None,
        }).with_context(|| anyhow!("proxying {:?} to {dest:?}", request.request_line()))?;
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouille::Request;

    #[test]
    fn t_missing_destination() -> Result<()> {
        let request = Request::fake_http("GET", "/", vec![], vec![]);
        let request = ARequest::new(&request, "127.0.0.1:80", 80)?;
        let site = Site { name: "p".into(), ..Default::default() };
        let err = ProxyProcessor.process(&request, &site, "/").err().ok_or_else(
            || anyhow!("expected an error"))?;
        assert!(err.to_string().contains("proxy_destination"));
        Ok(())
    }
}
