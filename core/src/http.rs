//! HTTP types for the host-does-IO seam.
//!
//! # Design
//! Requests and responses are plain data. The operation layer builds an
//! `HttpRequest`, a [`Transport`](crate::transport::Transport) executes it,
//! and the operation layer interprets the `HttpResponse`. Keeping the
//! boundary in data makes recorders observers and replay a transport
//! implementation rather than a special mode.
//!
//! All fields are owned so values can be captured by recorders without
//! lifetime concerns.

use serde::{Deserialize, Serialize};

/// CIM-specific header names from DSP0200.
pub const HDR_CIM_OPERATION: &str = "CIMOperation";
pub const HDR_CIM_METHOD: &str = "CIMMethod";
pub const HDR_CIM_OBJECT: &str = "CIMObject";
/// Server processing time in microseconds, when the server reports it.
pub const HDR_SERVER_RESPONSE_TIME: &str = "WBEMServerResponseTime";

/// A WBEM operation request described as plain data. Always a POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Whether a transport may retry this request once after a connection
    /// reset. Reads and enumeration traffic are; writes and method
    /// invocations are not.
    pub idempotent: bool,
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The header set DSP0200 requires on an operation request. `cim_object`
/// is the target namespace or object path, encoded per DSP0200 appendix C.
pub fn operation_headers(method: &str, cim_object: &str, body_len: usize) -> Vec<(String, String)> {
    vec![
        (
            "Content-Type".to_string(),
            "application/xml; charset=\"utf-8\"".to_string(),
        ),
        ("Content-Length".to_string(), body_len.to_string()),
        (HDR_CIM_OPERATION.to_string(), "MethodCall".to_string()),
        (HDR_CIM_METHOD.to_string(), method.to_string()),
        (HDR_CIM_OBJECT.to_string(), percent_encode(cim_object)),
    ]
}

/// Percent-encode a CIMObject header value. Path-structural characters
/// stay literal; everything else outside the unreserved set is escaped as
/// UTF-8 octets.
pub fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(byte as char),
            b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b'/' | b':' | b'=' | b',' => out.push(byte as char),
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}
