use std::borrow::Cow;
use rouille::{Response, ResponseBody};

use crate::http_response_status_codes::HttpResponseStatusCode;
use crate::script::builtins::html_escape;


/// The built-in page for `status`, used when the `errors` directory
/// has none.
pub fn errorpage_from_status(status: HttpResponseStatusCode) -> Response {
    let title = status.title();
    let explanation = html_escape(status.desc(), false);
    let resp = format!("<html><head><title>{title}</title></head><body><h1>{title}</h1>\
                        <p>{explanation}</p></body></html>\n");
    Response {
        status_code: status.code(),
        headers: vec![(Cow::from("Content-type"), Cow::from("text/html"))],
        data: ResponseBody::from_string(resp),
        upgrade: None,
    }
}

/// Like `errorpage_from_status` for a 500, with the error shown in
/// the page.
pub fn errorpage_from_error(err: &anyhow::Error) -> Response {
    let status = HttpResponseStatusCode::InternalServerError500;
    let title = status.title();
    let detail = html_escape(&format!("{err:#}"), false);
    let resp = format!("<html><head><title>{title}</title></head><body><h1>{title}</h1>\
                        <pre>{detail}</pre></body></html>\n");
    Response {
        status_code: status.code(),
        headers: vec![(Cow::from("Content-type"), Cow::from("text/html"))],
        data: ResponseBody::from_string(resp),
        upgrade: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aresponse::AResponse;

    #[test]
    fn t_errorpages() -> anyhow::Result<()> {
        let r = AResponse::from(errorpage_from_status(HttpResponseStatusCode::NotFound404));
        assert_eq!(r.status_code(), 404);
        let body = String::from_utf8(r.into_body()?)?;
        assert!(body.contains("<h1>Not Found</h1>"), "{body}");

        let r = AResponse::from(errorpage_from_error(&anyhow::anyhow!("a < b")));
        assert_eq!(r.status_code(), 500);
        assert!(String::from_utf8(r.into_body()?)?.contains("<pre>a &lt; b</pre>"));
        Ok(())
    }
}
