use std::borrow::Cow;

use rouille::{Response, ResponseBody};

use crate::http_response_status_codes::HttpResponseStatusCode;

/// What a handler or processor answers with.
pub struct AResponse {
    pub response: Response,
}

impl From<Response> for AResponse {
    fn from(response: Response) -> Self {
        Self { response }
    }
}

impl AResponse {
    /// A response with `body` and only a Content-Type header.
    pub fn from_bytes(status_code: u16, mime: &str, body: Vec<u8>) -> AResponse {
        Response {
            status_code,
            headers: vec![(Cow::from("Content-Type"), Cow::from(mime.to_owned()))],
            data: ResponseBody::from_data(body),
            upgrade: None,
        }.into()
    }

    pub fn html(status: HttpResponseStatusCode, body: String) -> AResponse {
        AResponse::from_bytes(status.code(), "text/html; charset=utf-8", body.into_bytes())
    }

    /// Set header `key`, replacing any earlier value.
    pub fn set_header(&mut self, key: &str, value: &str) {
        let headers = &mut self.response.headers;
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        headers.push((Cow::from(key.to_owned()), Cow::from(value.to_owned())));
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.response.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_ref())
    }

    pub fn status_code(&self) -> u16 {
        self.response.status_code
    }

    /// Drop the body, e.g. for HEAD requests.
    pub fn strip_body(&mut self) {
        self.response.data = ResponseBody::empty();
    }

    /// Read out the body, leaving it empty; for tests and the offline
    /// renderer.
    pub fn take_body(&mut self) -> std::io::Result<Vec<u8>> {
        use std::io::Read;
        let data = std::mem::replace(&mut self.response.data, ResponseBody::empty());
        let (mut reader, _) = data.into_reader_and_size();
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        Ok(body)
    }

    pub fn into_body(mut self) -> std::io::Result<Vec<u8>> {
        self.take_body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_headers_and_body() -> std::io::Result<()> {
        let mut r = AResponse::html(HttpResponseStatusCode::NotFound404, "<p>x</p>".into());
        assert_eq!(r.status_code(), 404);
        assert_eq!(r.header("content-type"), Some("text/html; charset=utf-8"));
        r.set_header("content-type", "text/plain");
        assert_eq!(r.response.headers.len(), 1);
        assert_eq!(r.header("Content-Type"), Some("text/plain"));
        assert_eq!(r.into_body()?, b"<p>x</p>");
        Ok(())
    }
}
