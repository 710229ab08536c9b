use pct_str::{PctString, URIReserved, InvalidPctString, PctStr};

pub fn url_encode(s: &str) -> String {
    let p = PctString::encode(s.chars(), URIReserved);
    p.to_string()
}

// Own the message: InvalidPctString borrows the input, which would
// then have to outlive any anyhow::Error made from it.

#[derive(Debug, thiserror::Error)]
#[error("url decoding error: {0}")]
pub struct UrlDecodingError(Box<String>);

impl From<InvalidPctString<&str>> for UrlDecodingError {
    fn from(e: InvalidPctString<&str>) -> Self {
        Self(Box::new(format!("{}", e)))
    }
}

pub fn url_decode(s: &str) -> Result<String, UrlDecodingError> {
    let p = PctStr::new(s)?;
    Ok(p.decode())
}

/// Decode a query string (`a=1&b=x%20y`) into its pairs, in order.
/// `+` stands for a space; a key without `=` gets an empty value.
pub fn query_pairs(query: &str) -> Result<Vec<(String, String)>, UrlDecodingError> {
    query.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            Ok((url_decode(&k.replace('+', " "))?, url_decode(&v.replace('+', " "))?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_decode() {
        assert_eq!(url_decode("/a%20b/c").unwrap(), "/a b/c");
        assert!(url_decode("/a%2").is_err());
        assert_eq!(query_pairs("a=1&b=x%20y+z&&c").unwrap(),
                   vec![("a".into(), "1".into()),
                        ("b".into(), "x y z".into()),
                        ("c".into(), "".into())]);
        assert!(query_pairs("a=%zz").is_err());
    }
}
