//! Request and response descriptors exchanged with the injected transport.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// Case-insensitive header map. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.inner.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Immutable description of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: Headers::new(), body: None }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path of the URL without query string or fragment; groups rate-limit state.
    ///
    /// Works for absolute URLs and for bare paths such as `/v1/x?page=2`.
    pub fn endpoint_key(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => {
                let end = self.url.find(&['?', '#'][..]).unwrap_or(self.url.len());
                let path = &self.url[..end];
                if path.is_empty() {
                    "/".to_string()
                } else {
                    path.to_string()
                }
            }
        }
    }

    /// Host of an absolute URL, if any.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url).ok().and_then(|u| u.host_str().map(str::to_string))
    }
}

/// A completed HTTP exchange, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Headers::new(), body: Vec::new() }
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// `Retry-After` expressed in whole seconds. HTTP-date and malformed values yield `None`.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers.get("retry-after").and_then(parse_retry_after)
    }
}

pub(crate) fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(|secs| Duration::from_millis(secs.saturating_mul(1000)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_strips_query_from_absolute_urls() {
        let req = Request::get("https://api.vendor.test/v1/chat?model=x&page=2");
        assert_eq!(req.endpoint_key(), "/v1/chat");
        assert_eq!(req.host().as_deref(), Some("api.vendor.test"));
    }

    #[test]
    fn endpoint_key_handles_bare_paths() {
        assert_eq!(Request::get("/v1/x?y=1").endpoint_key(), "/v1/x");
        assert_eq!(Request::get("/v1/x#frag").endpoint_key(), "/v1/x");
        assert_eq!(Request::get("?only=query").endpoint_key(), "/");
        assert!(Request::get("/v1/x").host().is_none());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let resp = Response::new(429).header("Retry-After", "2");
        assert_eq!(resp.headers.get("retry-after"), Some("2"));
        assert_eq!(resp.headers.get("RETRY-AFTER"), Some("2"));
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn non_numeric_retry_after_is_ignored() {
        let resp = Response::new(429).header("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(resp.retry_after(), None);
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("-1"), None);
    }
}
