use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::http::body::{Body, Framing};
use crate::http::parser::ParseError;
use crate::http::{find_header, has_token};

/// HTTP request methods.
///
/// The relay forwards any method untouched; the well-known ones get their
/// own variant and anything else that is a valid token is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    CONNECT,
    TRACE,
    /// Any other method token, e.g. `PROPFIND`
    Extension(String),
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method names are case-sensitive. Unknown names are accepted as
    /// [`Method::Extension`] as long as they are valid HTTP tokens.
    ///
    /// # Example
    ///
    /// ```
    /// # use teeproxy::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("PROPFIND"), Some(Method::Extension("PROPFIND".into())));
    /// assert_eq!(Method::from_str("BAD METHOD"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        let method = match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "CONNECT" => Method::CONNECT,
            "TRACE" => Method::TRACE,
            _ if is_token(s) => Method::Extension(s.to_string()),
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::Extension(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// The request line and headers of an HTTP request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target as sent by the client (e.g. "/search?q=rust")
    pub path: String,
    /// HTTP version (e.g. "HTTP/1.1")
    pub version: String,
    /// Request headers as key-value pairs
    pub headers: HashMap<String, String>,
}

/// Builder for constructing request heads.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: HashMap::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<RequestHead, &'static str> {
        Ok(RequestHead {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
        })
    }
}

impl RequestHead {
    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// The Host header, or an empty string when the client sent none.
    pub fn host(&self) -> &str {
        self.header("Host").unwrap_or("")
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// An explicit `Connection` token wins. Otherwise HTTP/1.1 defaults to
    /// keep-alive and HTTP/1.0 to close.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if has_token(v, "close") => false,
            Some(v) if has_token(v, "keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }

    /// True when the client waits for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        self.version != "HTTP/1.0"
            && self
                .header("Expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Works out how the request body is delimited.
    pub fn body_framing(&self) -> Result<Framing, ParseError> {
        if let Some(te) = self.header("Transfer-Encoding") {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            return if last.eq_ignore_ascii_case("chunked") {
                Ok(Framing::Chunked)
            } else {
                Err(ParseError::UnsupportedTransferEncoding)
            };
        }

        match self.header("Content-Length") {
            None => Ok(Framing::Empty),
            Some(v) => match v.trim().parse::<u64>() {
                Ok(0) => Ok(Framing::Empty),
                Ok(n) => Ok(Framing::Length(n)),
                Err(_) => Err(ParseError::InvalidContentLength),
            },
        }
    }
}

/// A request accepted from a caller, with its body still unread.
///
/// The body can only be consumed once. Everything else is read-only to the
/// relay.
pub struct InboundRequest<B> {
    pub head: RequestHead,
    pub body: Body<B>,
    pub remote_addr: Option<SocketAddr>,
}

impl<B> InboundRequest<B> {
    pub fn new(head: RequestHead, body: Body<B>) -> Self {
        Self {
            head,
            body,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn host(&self) -> &str {
        self.head.host()
    }

    /// The declared body length, if the body is length-delimited.
    pub fn content_length(&self) -> Option<u64> {
        match self.body.framing() {
            Framing::Empty => Some(0),
            Framing::Length(n) => Some(n),
            Framing::Chunked | Framing::UntilEof => None,
        }
    }

    /// True when the caller asked for the connection to be closed.
    pub fn close(&self) -> bool {
        !self.head.keep_alive()
    }
}

/// The per-backend copy of an inbound request.
///
/// Owns its body outright; nothing is shared with the sibling copy.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    /// Value sent as the `Host` header.
    pub host: String,
    pub body: Bytes,
    /// Always set: one request per backend connection.
    pub close: bool,
}

impl ForwardRequest {
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }
}
