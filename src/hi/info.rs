use crate::error::{FastcgiError, Result};

use std::collections::HashMap;
use std::fmt;

use url::form_urlencoded;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Unknown,
}

impl Method {
    fn parse(value: &[u8]) -> Method {
        match value {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Unknown => "<unknown>",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CGI facts about a request, parsed once its params are complete.
#[derive(Clone, Debug, Default)]
pub struct RequestInfo {
    pub scheme: Scheme,
    pub method: Method,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    query_terms: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

fn lossy(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

impl RequestInfo {
    /// Builds the info from a param lookup (first match wins).
    pub fn fill<'p, F>(lookup: F) -> RequestInfo
        where F: Fn(&str) -> Option<&'p [u8]>
    {
        let mut info = RequestInfo::default();

        match lookup("REQUEST_SCHEME") {
            Some(b"https") => info.scheme = Scheme::Https,
            Some(b"http") | None => (),
            Some(other) => debug!("unrecognized REQUEST_SCHEME {:?}", lossy(other)),
        }
        if let Some(method) = lookup("REQUEST_METHOD") {
            info.method = Method::parse(method);
        }
        info.script_name = lookup("SCRIPT_NAME").map(lossy);
        info.path_info = lookup("PATH_INFO").map(lossy);
        info.content_type = lookup("CONTENT_TYPE").map(lossy);
        info.content_length = lookup("CONTENT_LENGTH")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse().ok());

        if let Some(query) = lookup("QUERY_STRING") {
            for (name, value) in form_urlencoded::parse(query) {
                if name.is_empty() {
                    continue;
                }
                info.query_terms.insert(name.into_owned(), value.into_owned());
            }
        }

        if let Some(cookie) = lookup("HTTP_COOKIE") {
            for pair in String::from_utf8_lossy(cookie).split(';') {
                let (name, value) = match pair.split_once('=') {
                    Some((name, value)) => (name.trim(), value.trim()),
                    None => (pair.trim(), ""),
                };
                if !name.is_empty() {
                    info.cookies.insert(name.to_owned(), value.to_owned());
                }
            }
        }

        info
    }

    pub fn method_str(&self) -> &'static str {
        self.method.as_str()
    }

    pub fn query_term(&self, name: &str) -> Option<&str> {
        self.query_terms.get(name).map(String::as_str)
    }

    fn non_empty_term(&self, name: &str) -> Result<&str> {
        match self.query_term(name).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(FastcgiError::QueryTermNull),
        }
    }

    /// Parses a query term as an integer in `radix`. A `0x` prefix is accepted for radix 16.
    pub fn query_term_int(&self, name: &str, radix: u32) -> Result<i64> {
        if !(2..=36).contains(&radix) {
            return Err(FastcgiError::QueryTermInvalid);
        }
        let mut value = self.non_empty_term(name)?;
        if radix == 16 {
            value = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
        }
        i64::from_str_radix(value, radix).map_err(|_| FastcgiError::QueryTermInvalid)
    }

    pub fn query_term_float(&self, name: &str) -> Result<f64> {
        self.non_empty_term(name)?
            .parse()
            .map_err(|_| FastcgiError::QueryTermInvalid)
    }

    pub fn query_terms(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query_terms.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_from(params: &[(&'static str, &'static str)]) -> RequestInfo {
        RequestInfo::fill(|name| {
            params.iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_bytes())
        })
    }

    #[test]
    fn defaults_without_params() {
        let info = info_from(&[]);
        assert_eq!(Scheme::Http, info.scheme);
        assert_eq!(Method::Get, info.method);
        assert!(info.script_name.is_none());
        assert!(info.content_length.is_none());
    }

    #[test]
    fn parses_cgi_params() {
        let info = info_from(&[
            ("REQUEST_SCHEME", "https"),
            ("REQUEST_METHOD", "PATCH"),
            ("SCRIPT_NAME", "/app"),
            ("PATH_INFO", "/users/7"),
            ("CONTENT_TYPE", "application/json"),
            ("CONTENT_LENGTH", "42"),
        ]);
        assert_eq!(Scheme::Https, info.scheme);
        assert_eq!("PATCH", info.method_str());
        assert_eq!(Some("/app"), info.script_name.as_deref());
        assert_eq!(Some("/users/7"), info.path_info.as_deref());
        assert_eq!(Some("application/json"), info.content_type.as_deref());
        assert_eq!(Some(42), info.content_length);

        assert_eq!(Method::Unknown, info_from(&[("REQUEST_METHOD", "BREW")]).method);
        assert_eq!("<unknown>", Method::Unknown.as_str());
    }

    #[test]
    fn query_terms_are_decoded() {
        let info = info_from(&[("QUERY_STRING", "a=1&b=hello%20world&c=x+y&=skip&a=2&flag")]);
        assert_eq!(Some("2"), info.query_term("a"));
        assert_eq!(Some("hello world"), info.query_term("b"));
        assert_eq!(Some("x y"), info.query_term("c"));
        assert_eq!(Some(""), info.query_term("flag"));
        assert_eq!(None, info.query_term(""));
        assert_eq!(4, info.query_terms().count());
    }

    #[test]
    fn numeric_query_terms() {
        let info = info_from(&[("QUERY_STRING", "n=-17&h=0xff&f=2.5&bad=abc&empty=")]);
        assert_eq!(-17, info.query_term_int("n", 10).unwrap());
        assert_eq!(255, info.query_term_int("h", 16).unwrap());
        assert_eq!(2.5, info.query_term_float("f").unwrap());

        assert!(matches!(info.query_term_int("missing", 10), Err(FastcgiError::QueryTermNull)));
        assert!(matches!(info.query_term_int("empty", 10), Err(FastcgiError::QueryTermNull)));
        assert!(matches!(info.query_term_int("bad", 10), Err(FastcgiError::QueryTermInvalid)));
        assert!(matches!(info.query_term_float("bad"), Err(FastcgiError::QueryTermInvalid)));
    }

    #[test]
    fn bad_radix_and_repeated_prefix_are_invalid() {
        let info = info_from(&[("QUERY_STRING", "n=10&h=0x0x1f&u=0X1F")]);
        for radix in [0, 1, 37] {
            assert!(matches!(info.query_term_int("n", radix), Err(FastcgiError::QueryTermInvalid)));
        }
        assert_eq!(2, info.query_term_int("n", 2).unwrap());
        assert_eq!(36, info.query_term_int("n", 36).unwrap());
        assert!(matches!(info.query_term_int("h", 16), Err(FastcgiError::QueryTermInvalid)));
        assert_eq!(31, info.query_term_int("u", 16).unwrap());
    }

    #[test]
    fn cookies() {
        let info = info_from(&[("HTTP_COOKIE", "session=abc123; theme=dark;lang = en; ;bare")]);
        assert_eq!(Some("abc123"), info.cookie("session"));
        assert_eq!(Some("dark"), info.cookie("theme"));
        assert_eq!(Some("en"), info.cookie("lang"));
        assert_eq!(Some(""), info.cookie("bare"));
        assert_eq!(None, info.cookie("missing"));
    }
}
