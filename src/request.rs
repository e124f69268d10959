use reqwest::header::{HeaderMap, HeaderName, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};

use crate::{BackOff, ObsError, Result};

/// Query parameter value: one string or a repeated key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Multiple(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl<S: Into<String>> From<Vec<S>> for ParamValue {
    fn from(values: Vec<S>) -> Self {
        Self::Multiple(values.into_iter().map(Into::into).collect())
    }
}

/// Raw request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub(crate) fn to_body(&self) -> reqwest::Body {
        match self {
            Self::Bytes(bytes) => reqwest::Body::from(bytes.clone()),
            Self::Text(text) => reqwest::Body::from(text.clone()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// One logical API call.
///
/// ```
/// use obs_http::{ApiRequest, Method};
///
/// let request = ApiRequest::new(Method::POST, "/source/home:me/emacs")
///     .param("cmd", "branch")
///     .param("add_repositories", "1");
/// assert_eq!(request.route(), "/source/home:me/emacs");
/// ```
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) route: String,
    pub(crate) params: Vec<(String, ParamValue)>,
    pub(crate) payload: Option<Payload>,
    pub(crate) headers: HeaderMap,
    pub(crate) backoff: Option<BackOff>,
}

impl ApiRequest {
    /// Creates a request for `route`, relative to the API URL.
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            params: Vec::new(),
            payload: None,
            headers: HeaderMap::new(),
            backoff: None,
        }
    }

    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::GET, route)
    }

    /// Adds a query parameter; list values repeat the key.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Sets the request body.
    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Overrides a default header for this request only.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ObsError::InvalidRequest(format!("header name {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| ObsError::InvalidRequest(format!("header {name}: {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replaces the client's default backoff for this request.
    pub fn backoff(mut self, backoff: BackOff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Query pairs with list values expanded into repeated keys.
    pub(crate) fn query_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::with_capacity(self.params.len());
        for (key, value) in &self.params {
            match value {
                ParamValue::Single(value) => pairs.push((key.as_str(), value.as_str())),
                ParamValue::Multiple(values) => {
                    pairs.extend(values.iter().map(|value| (key.as_str(), value.as_str())));
                }
            }
        }
        pairs
    }
}

/// A response as returned by the build service.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First value of header `name`, if it is valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Every `WWW-Authenticate` value, in order.
    pub fn www_authenticate(&self) -> Vec<&str> {
        self.headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }
}
