use std::collections::BTreeMap;
use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

/// Query parameters that never take part in a cache key.
const TRANSIENT_PARAMS: &[&str] = &["refresh"];

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_json(url: Url, body: Vec<u8>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        request.body = Some(body);
        request
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// True when the query string carries `name=true`.
    pub fn query_flag(&self, name: &str) -> bool {
        self.url
            .query_pairs()
            .any(|(k, v)| k == name && v.eq_ignore_ascii_case("true"))
    }
}

/// Canonical request identity: method plus normalized path and query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !TRANSIENT_PARAMS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();

        let mut key = format!("{} {}", method.as_str(), url.path());
        if !pairs.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push('?');
            key.push_str(&query);
        }
        Self(key)
    }

    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response snapshot as stored in the cache and handed back to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Stand-in for a request that never produced a response.
    pub fn network_error() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
