//! Pattern matching help for HTTP request methods.

// https://developer.mozilla.org/en-US/docs/Web/HTTP/Methods

use std::str::FromStr;

use anyhow::{Result, anyhow};
use strum_macros::{EnumString, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
pub enum HttpRequestMethod {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

/// What the server does with a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRequestMethodGroup {
    /// Pages and files are served for these.
    Simple,
    /// Changing documents; only site processors may handle these.
    Document,
    /// Connection level; only site processors may handle these.
    Special,
}

impl HttpRequestMethod {
    /// Method names are case sensitive.
    pub fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).map_err(|_| anyhow!("invalid http request method {s:?}"))
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn is_post(self) -> bool {
        self == Self::POST
    }

    pub fn group(self) -> HttpRequestMethodGroup {
        match self {
            Self::GET | Self::HEAD | Self::POST =>
                HttpRequestMethodGroup::Simple,
            Self::PUT | Self::PATCH | Self::DELETE =>
                HttpRequestMethodGroup::Document,
            Self::OPTIONS | Self::CONNECT | Self::TRACE =>
                HttpRequestMethodGroup::Special,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_parse_and_group() -> Result<()> {
        assert_eq!(HttpRequestMethod::parse("HEAD")?, HttpRequestMethod::HEAD);
        assert_eq!(HttpRequestMethod::parse("PATCH")?.as_str(), "PATCH");
        assert!(HttpRequestMethod::parse("get").is_err());
        assert!(HttpRequestMethod::parse("BREW").is_err());
        assert_eq!(HttpRequestMethod::POST.group(), HttpRequestMethodGroup::Simple);
        assert_eq!(HttpRequestMethod::DELETE.group(), HttpRequestMethodGroup::Document);
        assert_eq!(HttpRequestMethod::OPTIONS.group(), HttpRequestMethodGroup::Special);
        assert!(HttpRequestMethod::POST.is_post() && !HttpRequestMethod::GET.is_post());
        Ok(())
    }
}
