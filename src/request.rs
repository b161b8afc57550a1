use std::any::Any;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Mime type for JSON requests and responses
pub const TYPE_JSON: &str = "text/json";
/// Mime type for XML requests and responses
pub const TYPE_XML: &str = "text/xml";
/// Mime type for HTML
pub const TYPE_HTML: &str = "text/html";
/// Mime type for CSV
pub const TYPE_CSV: &str = "text/csv";
/// Mime type for plain text
pub const TYPE_TEXT: &str = "text/plain";
/// Mime type for javascript
pub const TYPE_JAVASCRIPT: &str = "text/javascript";

/// Whether a configured mime type asks for JSON parsing of the response
pub fn is_json_type(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case(TYPE_JSON) || essence.eq_ignore_ascii_case("application/json")
}

/// Invocation context for promise callbacks
///
/// Handlers can downcast it back to the caller's own type.
pub type Context = Arc<dyn Any + Send + Sync>;

/// An XML document as delivered by the native request
///
/// Parsing is left to the caller; this only carries the raw markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XmlDocument(String);

impl XmlDocument {
    /// Wrap raw XML markup
    pub fn new(markup: impl Into<String>) -> Self {
        Self(markup.into())
    }

    /// Get the raw markup
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw markup
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// String body
    Text(String),
    /// Structured document body
    Document(XmlDocument),
}

impl Body {
    /// Get the body as a string slice
    pub fn as_str(&self) -> &str {
        match self {
            Body::Text(text) => text,
            Body::Document(document) => document.as_str(),
        }
    }

    /// Length of the body in bytes
    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    /// Check if the body is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume into the body string
    pub fn into_string(self) -> String {
        match self {
            Body::Text(text) => text,
            Body::Document(document) => document.into_string(),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<XmlDocument> for Body {
    fn from(document: XmlDocument) -> Self {
        Body::Document(document)
    }
}

/// Query string or form params
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// Already escaped query string, sent as is
    Raw(String),
    /// Key-value pairs, escaped on serialization in insertion order
    Map(Map<String, Value>),
}

impl Params {
    /// Serialize into a query string
    ///
    /// Each key and value is percent-escaped and the pairs are joined with `&`.
    pub fn serialize(&self) -> String {
        match self {
            Params::Raw(query) => query.clone(),
            Params::Map(map) => map
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(&param_value(value))
                    )
                })
                .collect::<Vec<_>>()
                .join("&"),
        }
    }

    /// Check if there is nothing to serialize
    pub fn is_empty(&self) -> bool {
        match self {
            Params::Raw(query) => query.is_empty(),
            Params::Map(map) => map.is_empty(),
        }
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(param_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

impl From<&str> for Params {
    fn from(query: &str) -> Self {
        Params::Raw(query.to_string())
    }
}

impl From<String> for Params {
    fn from(query: String) -> Self {
        Params::Raw(query)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Map(map)
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Params::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Append a serialized query to a URL
pub fn append_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        url.to_string()
    } else if !url.contains('?') {
        format!("{}?{}", url, query)
    } else if url.ends_with('?') || url.ends_with('&') {
        format!("{}{}", url, query)
    } else {
        format!("{}&{}", url, query)
    }
}

/// Recursively merge `source` into `destination`
///
/// Objects merge key by key, arrays are concatenated, anything else in
/// `source` overwrites what is in `destination`.
pub fn deep_merge(destination: &mut Value, source: &Value) {
    match source {
        Value::Object(entries) => {
            if !destination.is_object() {
                *destination = Value::Object(Map::new());
            }
            if let Value::Object(target) = destination {
                for (key, value) in entries {
                    deep_merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        Value::Array(items) => {
            if !destination.is_array() {
                *destination = Value::Array(Vec::new());
            }
            if let Value::Array(target) = destination {
                target.extend(items.iter().cloned());
            }
        }
        other => *destination = other.clone(),
    }
}

/// Effective options of a transport
#[derive(Clone)]
pub struct TransportOptions {
    /// Whether the native request runs asynchronously
    pub asynchronous: bool,
    /// Request body
    pub body: Option<Body>,
    /// Invocation context for promise callbacks
    pub context: Option<Context>,
    /// Raw request headers
    pub headers: HeaderMap,
    /// HTTP method
    pub method: Method,
    /// Query string or post params
    pub params: Option<Params>,
    /// Password for HTTP authentication
    pub password: Option<String>,
    /// Mime type of the request, also drives response parsing
    pub mime_type: String,
    /// Target URL
    pub url: Option<String>,
    /// Username for HTTP authentication
    pub username: Option<String>,
}

impl TransportOptions {
    /// Fresh options: `defaults` deep-merged with `overrides`
    pub fn merged(defaults: &TransportOptions, overrides: &RequestOptions) -> Self {
        let mut options = defaults.clone();
        options.merge(overrides);
        options
    }

    /// Deep-merge `overrides` into these options in place
    pub fn merge(&mut self, overrides: &RequestOptions) {
        if let Some(asynchronous) = overrides.asynchronous {
            self.asynchronous = asynchronous;
        }
        if let Some(body) = &overrides.body {
            self.body = Some(body.clone());
        }
        if let Some(context) = &overrides.context {
            self.context = Some(Arc::clone(context));
        }
        for (name, value) in overrides.headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        if let Some(method) = &overrides.method {
            self.method = method.clone();
        }
        if let Some(params) = &overrides.params {
            self.params = Some(match (self.params.take(), params) {
                (Some(Params::Map(existing)), Params::Map(incoming)) => {
                    let mut merged = Value::Object(existing);
                    deep_merge(&mut merged, &Value::Object(incoming.clone()));
                    match merged {
                        Value::Object(map) => Params::Map(map),
                        _ => params.clone(),
                    }
                }
                _ => params.clone(),
            });
        }
        if let Some(password) = &overrides.password {
            self.password = Some(password.clone());
        }
        if let Some(mime_type) = &overrides.mime_type {
            self.mime_type = mime_type.clone();
        }
        if let Some(url) = &overrides.url {
            self.url = Some(url.clone());
        }
        if let Some(username) = &overrides.username {
            self.username = Some(username.clone());
        }
    }

    /// Check if the response should be parsed as JSON
    pub fn expects_json(&self) -> bool {
        is_json_type(&self.mime_type)
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );

        Self {
            asynchronous: true,
            body: None,
            context: None,
            headers,
            method: Method::POST,
            params: None,
            password: None,
            mime_type: TYPE_JSON.to_string(),
            url: None,
            username: None,
        }
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("asynchronous", &self.asynchronous)
            .field("body", &self.body)
            .field("context", &self.context.is_some())
            .field("headers", &self.headers)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("mime_type", &self.mime_type)
            .field("url", &self.url)
            .field("username", &self.username)
            .finish()
    }
}

/// Caller-supplied option overrides
///
/// Anything left unset keeps the value from the defaults it is merged onto.
///
/// # Examples
///
/// ```rust
/// use xhrpool::RequestOptions;
///
/// let options = RequestOptions::new()
///     .url("https://example.com/api/items")
///     .param("page", 2)
///     .header("Accept", "text/json")
///     .unwrap();
/// ```
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub asynchronous: Option<bool>,
    pub body: Option<Body>,
    pub context: Option<Context>,
    pub headers: HeaderMap,
    pub method: Option<Method>,
    pub params: Option<Params>,
    pub password: Option<String>,
    pub mime_type: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
}

impl RequestOptions {
    /// Create empty overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set whether the native request runs asynchronously
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = Some(asynchronous);
        self
    }

    /// Set the request body
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the callback invocation context
    pub fn context<T>(mut self, context: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.context = Some(Arc::new(context));
        self
    }

    /// Set a header
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| Error::invalid_request(format!("Invalid header name: {}", e)))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::invalid_request(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replace the params
    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Add one key-value param
    ///
    /// Turns raw string params into a map, dropping the raw string.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = match self.params.take() {
            Some(Params::Map(map)) => map,
            _ => Map::new(),
        };
        map.insert(key.into(), value.into());
        self.params = Some(Params::Map(map));
        self
    }

    /// Set the request mime type
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set HTTP authentication credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("asynchronous", &self.asynchronous)
            .field("body", &self.body)
            .field("context", &self.context.is_some())
            .field("headers", &self.headers)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("mime_type", &self.mime_type)
            .field("url", &self.url)
            .field("username", &self.username)
            .finish()
    }
}
