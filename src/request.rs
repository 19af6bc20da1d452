//! Minimal HTTP/1.1 request head: just enough to inspect an upgrade
//! request, rewrite its metadata and forward it verbatim upstream.

use crate::error::ProxyError;

/// A parsed request line plus headers. The Host value lives outside the
/// header list so the forwarded request can carry a rewritten Host
/// without duplicate headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parses a complete request head (terminated by the blank line).
    pub fn parse(buf: &[u8]) -> Result<RequestHead, ProxyError> {
        let mut storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut storage);
        let status = parsed
            .parse(buf)
            .map_err(|e| ProxyError::Handshake(format!("malformed request: {e}")))?;
        if status.is_partial() {
            return Err(ProxyError::Handshake("incomplete request head".into()));
        }

        let method = parsed
            .method
            .ok_or_else(|| ProxyError::Handshake("request has no method".into()))?
            .to_string();
        let uri = parsed
            .path
            .ok_or_else(|| ProxyError::Handshake("request has no path".into()))?
            .to_string();

        let mut host = String::new();
        let mut headers = Vec::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value).into_owned();
            if header.name.eq_ignore_ascii_case("host") {
                host = value;
            } else {
                headers.push((header.name.to_string(), value));
            }
        }

        Ok(RequestHead {
            method,
            uri,
            host,
            headers,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets a header with overwrite semantics: an existing value with
    /// the same key is replaced in place, never appended to.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// True when the request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"))
            && self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Serializes the head for the upstream leg, Host first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.uri).into_bytes();
        out.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        for (key, value) in &self.headers {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}
