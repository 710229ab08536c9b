//! The HTTP response status codes the server sends itself.

// https://developer.mozilla.org/en-US/docs/Web/HTTP/Status

macro_rules! status_codes {
    { $( $name:ident = $code:literal, $title:literal, $desc:literal; )* } => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum HttpResponseStatusCode {
            $( $name, )*
        }

        impl HttpResponseStatusCode {
            pub fn code(self) -> u16 {
                match self {
                    $( Self::$name => $code, )*
                }
            }

            pub fn title(self) -> &'static str {
                match self {
                    $( Self::$name => $title, )*
                }
            }

            pub fn desc(self) -> &'static str {
                match self {
                    $( Self::$name => $desc, )*
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$name), )*
                    _ => None
                }
            }
        }
    }
}

status_codes! {
    OK200 = 200, "OK", "The request succeeded.";
    MovedPermanently301 = 301, "Moved Permanently",
        "The URL of the requested resource has been changed permanently.";
    Found302 = 302, "Found",
        "The URI of requested resource has been changed temporarily.";
    SeeOther303 = 303, "See Other",
        "The requested resource is to be fetched with a GET request at another URI.";
    NotModified304 = 304, "Not Modified",
        "The response has not been modified since the version the client has cached.";
    TemporaryRedirect307 = 307, "Temporary Redirect",
        "The requested resource is temporarily at another URI, to be requested \
         with the same method.";
    PermanentRedirect308 = 308, "Permanent Redirect",
        "The requested resource is now permanently at another URI, to be requested \
         with the same method.";
    BadRequest400 = 400, "Bad Request",
        "The server cannot process the request due to a client error.";
    Forbidden403 = 403, "Forbidden",
        "You do not have access rights to the requested content.";
    NotFound404 = 404, "Not Found",
        "The server cannot find the requested resource.";
    MethodNotAllowed405 = 405, "Method Not Allowed",
        "The request method is not supported for the requested resource.";
    InternalServerError500 = 500, "Internal Server Error",
        "The server has encountered a situation it does not know how to handle.";
    NotImplemented501 = 501, "Not Implemented",
        "The request method is not supported by the server.";
    BadGateway502 = 502, "Bad Gateway",
        "The server got an invalid response from the upstream server.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_codes() {
        assert_eq!(HttpResponseStatusCode::NotFound404.code(), 404);
        assert_eq!(HttpResponseStatusCode::from_code(403),
                   Some(HttpResponseStatusCode::Forbidden403));
        assert_eq!(HttpResponseStatusCode::from_code(418), None);
        assert_eq!(HttpResponseStatusCode::NotImplemented501.title(), "Not Implemented");
    }
}
