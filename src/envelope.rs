//! Request/response envelopes exchanged over the broker (§3, §4.1).
//!
//! Field shapes mirror the original capture format: headers are an
//! *ordered* list of byte-string pairs (never a map — duplicate header
//! names and their relative order both matter), and every field that can
//! legitimately carry non-UTF-8 bytes is a [`ByteString`].

use serde::{Deserialize, Serialize};

use crate::codec::{ByteString, WireEnvelope};
use crate::constants::{TAG_HEADER_NAME, TAG_HEADER_VALUE, TENANT_HEADER};

pub type HeaderList = Vec<(ByteString, ByteString)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

/// A captured client request, as it goes out over the wire to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub http_version: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub method: ByteString,
    pub path: ByteString,
    pub authority: ByteString,
    pub headers: HeaderList,
    pub content: ByteString,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
}

impl WireEnvelope for RequestEnvelope {}

impl RequestEnvelope {
    /// Removes the tenant header before the request leaves this process;
    /// the header identifies the tenant to us, not to the origin.
    pub fn strip_tenant_header(&mut self) {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case_str(TENANT_HEADER));
    }

    /// Returns the tenant header's value, if present and well-formed.
    pub fn tenant_header_value(&self) -> Option<&ByteString> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case_str(TENANT_HEADER))
            .map(|(_, v)| v)
    }

    /// Tags the request with an identifying header for origins that want
    /// to distinguish our traffic, per the original proxy's convention.
    pub fn add_tag_header(&mut self) {
        self.headers.push((
            ByteString::from_static(TAG_HEADER_NAME),
            ByteString::from_static(TAG_HEADER_VALUE),
        ));
    }
}

/// The origin's response, as relayed back from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub http_version: String,
    pub status_code: u16,
    pub reason: ByteString,
    pub headers: HeaderList,
    pub content: ByteString,
    pub trailers: Option<HeaderList>,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
}

impl WireEnvelope for ResponseEnvelope {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope {
            http_version: "HTTP/1.1".into(),
            host: "example.com".into(),
            port: 443,
            scheme: Scheme::Https,
            method: ByteString::from_static("GET"),
            path: ByteString::from_static("/"),
            authority: ByteString::from_static("example.com:443"),
            headers: vec![(
                ByteString::from_static(TENANT_HEADER),
                ByteString::from_static("11111111-1111-1111-1111-111111111111"),
            )],
            content: ByteString(vec![]),
            timestamp_start: 0.0,
            timestamp_end: 0.0,
        }
    }

    #[test]
    fn round_trips_through_wire_form() {
        let req = sample_request();
        let wire = req.to_wire_form().unwrap();
        let back = RequestEnvelope::from_wire_form(&wire).unwrap();
        assert_eq!(back.host, req.host);
        assert_eq!(back.headers, req.headers);
    }

    #[test]
    fn strip_tenant_header_removes_only_that_header() {
        let mut req = sample_request();
        req.headers
            .push((ByteString::from_static("accept"), ByteString::from_static("*/*")));
        req.strip_tenant_header();
        assert_eq!(req.headers.len(), 1);
        assert!(req.tenant_header_value().is_none());
    }

    #[test]
    fn tag_header_is_appended_not_replacing_existing() {
        let mut req = sample_request();
        req.add_tag_header();
        assert!(
            req.headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case_str(TAG_HEADER_NAME)
                    && v.eq_ignore_ascii_case_str(TAG_HEADER_VALUE))
        );
    }
}
