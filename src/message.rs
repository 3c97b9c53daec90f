//! HTTP message value produced by the codec stage.
//!
//! The pipeline treats messages as mostly opaque: a request line, a header
//! multimap, a body, and a fault slot that carries a parse-time error
//! through the chain without losing ordering.

use bytes::Bytes;
use std::net::SocketAddr;

use crate::Error;

/// Header multimap: case-insensitive names, insertion order preserved,
/// all values retained for multi-valued headers.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a value, keeping any existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values for `name` with a single one; last write wins.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    /// Removes all values for `name`, returning whether any were present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when any value of `name`, split on commas, contains `token`
    /// (case-insensitive, surrounding whitespace ignored).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    pub fn new(method: &str, target: &str, version: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// A parsed request flowing through the chain.
#[derive(Debug)]
pub struct HttpMessage {
    pub request_line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
    /// Parse-time error smuggled through to application code.
    pub fault: Option<Error>,
    /// Sender address, stamped by the message property stamper.
    pub sender: Option<SocketAddr>,
}

impl HttpMessage {
    pub fn new(request_line: RequestLine) -> Self {
        Self {
            request_line,
            headers: Headers::new(),
            body: Bytes::new(),
            fault: None,
            sender: None,
        }
    }

    /// A placeholder message carrying only a fault.
    pub fn faulty(fault: Error) -> Self {
        let mut msg = Self::new(RequestLine::new("", "", ""));
        msg.fault = Some(fault);
        msg
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// Effective target of the request: the CONNECT authority, the host of
    /// an absolute URL, or the `Host` header. Ports default to 443 for
    /// CONNECT and 80 otherwise.
    pub fn target_host_port(&self) -> Option<(String, u16)> {
        if self.request_line.is_connect() {
            return split_host_port(&self.request_line.target, 443);
        }
        if let Some(rest) = self
            .request_line
            .target
            .strip_prefix("http://")
            .or_else(|| self.request_line.target.strip_prefix("https://"))
        {
            let default_port = if self.request_line.target.starts_with("https://") {
                443
            } else {
                80
            };
            let authority = rest.split(['/', '?']).next().unwrap_or(rest);
            return split_host_port(authority, default_port);
        }
        self.headers
            .get("Host")
            .and_then(|host| split_host_port(host, 80))
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal, possibly with a port.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive_first_value() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn test_headers_preserve_insertion_order_and_multi_values() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("X-Custom", "1");
        headers.add("Accept", "application/json");
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Accept", "X-Custom", "Accept"]);
        let accepts: Vec<_> = headers.get_all("accept").collect();
        assert_eq!(accepts, vec!["text/html", "application/json"]);
    }

    #[test]
    fn test_headers_set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("Accept", "application/json");
        headers.set("Accept", "*/*");
        let accepts: Vec<_> = headers.get_all("Accept").collect();
        assert_eq!(accepts, vec!["*/*"]);
    }

    #[test]
    fn test_contains_token() {
        let mut headers = Headers::new();
        headers.add("Connection", "Upgrade, HTTP2-Settings");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("Connection", "http2-settings"));
        assert!(!headers.contains_token("Connection", "close"));
    }

    #[test]
    fn test_target_from_connect_authority() {
        let msg = HttpMessage::new(RequestLine::new("CONNECT", "example.org:8443", "HTTP/1.1"));
        assert_eq!(
            msg.target_host_port(),
            Some(("example.org".to_string(), 8443))
        );
    }

    #[test]
    fn test_target_connect_default_port() {
        let msg = HttpMessage::new(RequestLine::new("CONNECT", "example.org", "HTTP/1.1"));
        assert_eq!(msg.target_host_port(), Some(("example.org".to_string(), 443)));
    }

    #[test]
    fn test_target_from_absolute_url() {
        let msg = HttpMessage::new(RequestLine::new(
            "GET",
            "http://example.org:8080/path?q=1",
            "HTTP/1.1",
        ));
        assert_eq!(
            msg.target_host_port(),
            Some(("example.org".to_string(), 8080))
        );
    }

    #[test]
    fn test_target_from_host_header() {
        let mut msg = HttpMessage::new(RequestLine::new("GET", "/", "HTTP/1.1"));
        msg.headers.add("Host", "127.0.0.1:8080");
        assert_eq!(msg.target_host_port(), Some(("127.0.0.1".to_string(), 8080)));
    }

    #[test]
    fn test_target_ipv6_authority() {
        let msg = HttpMessage::new(RequestLine::new("CONNECT", "[::1]:8443", "HTTP/1.1"));
        assert_eq!(msg.target_host_port(), Some(("::1".to_string(), 8443)));
    }
}
