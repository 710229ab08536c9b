//! The `ahtmlproc` processor: render a page through the engine.

use std::sync::Arc;

use anyhow::Result;

use crate::arequest::ARequest;
use crate::aresponse::AResponse;
use crate::http_response_status_codes::HttpResponseStatusCode;
use crate::processor::Processor;
use crate::site::Site;
use super::report::error_report;
use super::Engine;

pub struct AhtmlProcessor {
    engine: Arc<Engine>,
}

impl AhtmlProcessor {
    pub fn new(engine: Arc<Engine>) -> Self {
        AhtmlProcessor { engine }
    }
}

impl Processor for AhtmlProcessor {
    /// Compile and runtime errors are answered with a 500 report
    /// page, not an Err.
    fn process(&self,
               request: &ARequest,
               site: &Site,
               site_path: &str) -> Result<AResponse> {
        match self.engine.render(&site.root, site_path, request.to_value(), site.to_value()) {
            Ok(page) => {
                let mut response = AResponse::from_bytes(
                    page.status.unwrap_or(200),
                    page.mime.as_deref().unwrap_or("text/html; charset=utf-8"),
                    page.body);
                for (key, value) in &page.headers {
                    response.set_header(key, value);
                }
                Ok(response)
            }
            Err(e) => Ok(AResponse::from_bytes(
                HttpResponseStatusCode::InternalServerError500.code(),
                "text/html",
                error_report(&e).into_bytes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouille::Request;
    use crate::random_util::randomidstring;
    use crate::template::EngineSettings;

    #[test]
    fn t_process() -> Result<()> {
        let root = std::env::temp_dir().join(format!("arbiter-proc-{}", randomidstring()?));
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join("hello.ahtml"),
                       "<!Write(Request.params.name)!> at <!Write(Site.name)!>")?;
        std::fs::write(root.join("broken.ahtml"), "<!Write(!>")?;

        let processor = AhtmlProcessor::new(Engine::new(&EngineSettings::default()));
        let site = Site { name: "demo".into(), root: root.clone(), ..Default::default() };

        let request = Request::fake_http("GET", "/hello.ahtml?name=Ann", vec![], vec![]);
        let request = ARequest::new(&request, "127.0.0.1:80", 80)?;
        let response = processor.process(&request, &site, "/hello.ahtml")?;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(response.into_body()?, b"Ann at demo");

        let response = processor.process(&request, &site, "/broken.ahtml")?;
        assert_eq!(response.status_code(), 500);
        let body = String::from_utf8(response.into_body()?)?;
        assert!(body.contains("Failed to compile"), "{body}");

        std::fs::remove_dir_all(&root)?;
        Ok(())
    }
}
