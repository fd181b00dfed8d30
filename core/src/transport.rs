//! HTTP execution behind the `Transport` seam.
//!
//! # Design
//! The operation layer never touches a socket; it hands a fully formed
//! [`HttpRequest`] to a `Transport` and gets an [`HttpResponse`] (or a
//! taxonomized error) back. `UreqTransport` is the real executor; the
//! replay transport in [`crate::recorder`] is the other implementation.
//!
//! Authentication is Basic, sent preemptively when credentials are
//! configured. A 401 carrying a `Digest` challenge gets a single retry
//! with an RFC 7616 digest response (SHA-256 family); any further 401 is
//! final. The same credentials are never re-offered to a Basic challenge.
//!
//! A connection reset during send is retried exactly once, and only for
//! requests marked idempotent.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::WbemError;
use crate::http::{HttpRequest, HttpResponse};

/// Executes one HTTP round trip. Implementations must not mutate the
/// request.
pub trait Transport {
    fn execute(&mut self, request: &HttpRequest) -> Result<HttpResponse, WbemError>;
}

/// Configuration for the real HTTP executor.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Option<Duration>,
    pub verify_tls: bool,
    pub credentials: Option<(String, String)>,
}

/// `Transport` implementation over a blocking ureq agent.
pub struct UreqTransport {
    agent: ureq::Agent,
    credentials: Option<(String, String)>,
}

impl UreqTransport {
    pub fn new(config: &TransportConfig) -> Self {
        let mut builder = ureq::Agent::config_builder().http_status_as_error(false);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout_global(Some(timeout));
        }
        if !config.verify_tls {
            builder = builder.tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            );
        }
        Self {
            agent: builder.build().new_agent(),
            credentials: config.credentials.clone(),
        }
    }

    fn send(
        &self,
        request: &HttpRequest,
        authorization: Option<&str>,
    ) -> Result<HttpResponse, SendError> {
        let mut post = self.agent.post(&request.url);
        for (key, value) in &request.headers {
            // ureq derives Content-Length from the body; forwarding ours
            // too would duplicate the header
            if key.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            post = post.header(key.as_str(), value.as_str());
        }
        if let Some(auth) = authorization {
            post = post.header("Authorization", auth);
        }
        let mut response = post.send(request.body.as_bytes()).map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(classify)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn basic_authorization(&self) -> Option<String> {
        let (user, password) = self.credentials.as_ref()?;
        let token = BASE64.encode(format!("{user}:{password}"));
        Some(format!("Basic {token}"))
    }
}

impl Transport for UreqTransport {
    fn execute(&mut self, request: &HttpRequest) -> Result<HttpResponse, WbemError> {
        let auth = self.basic_authorization();
        let mut response = match self.send(request, auth.as_deref()) {
            Ok(r) => r,
            Err(SendError::Reset(_)) if request.idempotent => {
                warn!(url = %request.url, "connection reset, retrying once");
                self.send(request, auth.as_deref()).map_err(SendError::raise)?
            }
            Err(e) => return Err(e.raise()),
        };

        if response.status == 401 {
            let challenge = response.header("WWW-Authenticate").map(str::to_string);
            match (&self.credentials, challenge) {
                (Some((user, password)), Some(ch)) if ch.trim_start().starts_with("Digest") => {
                    debug!("Basic rejected, answering Digest challenge");
                    let authorization =
                        digest_authorization(&ch, user, password, &request.url)?;
                    response = self
                        .send(request, Some(&authorization))
                        .map_err(SendError::raise)?;
                    if response.status == 401 {
                        return Err(WbemError::Auth(
                            "server rejected digest credentials".to_string(),
                        ));
                    }
                }
                _ => {
                    return Err(WbemError::Auth(
                        "server rejected credentials (HTTP 401)".to_string(),
                    ));
                }
            }
        }
        Ok(response)
    }
}

enum SendError {
    Reset(String),
    Fatal(WbemError),
}

impl SendError {
    fn raise(self) -> WbemError {
        match self {
            SendError::Reset(msg) => WbemError::Connection(msg),
            SendError::Fatal(e) => e,
        }
    }
}

fn classify(error: ureq::Error) -> SendError {
    match error {
        ureq::Error::Timeout(_) => {
            SendError::Fatal(WbemError::Timeout("HTTP round trip".to_string()))
        }
        ureq::Error::Io(io_err) => match io_err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SendError::Reset(io_err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                SendError::Fatal(WbemError::Timeout(io_err.to_string()))
            }
            _ => SendError::Fatal(WbemError::Connection(io_err.to_string())),
        },
        other => SendError::Fatal(WbemError::Connection(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Digest authentication (RFC 7616)
// ---------------------------------------------------------------------------

fn digest_authorization(
    challenge: &str,
    user: &str,
    password: &str,
    url: &str,
) -> Result<String, WbemError> {
    let params = parse_challenge(challenge);
    let realm = params
        .iter()
        .find(|(k, _)| k == "realm")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| WbemError::Auth("digest challenge lacks realm".to_string()))?;
    let nonce = params
        .iter()
        .find(|(k, _)| k == "nonce")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| WbemError::Auth("digest challenge lacks nonce".to_string()))?;
    let algorithm = params
        .iter()
        .find(|(k, _)| k == "algorithm")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "MD5".to_string());
    if !algorithm.eq_ignore_ascii_case("SHA-256") {
        return Err(WbemError::Auth(format!(
            "digest algorithm {algorithm:?} not supported (SHA-256 only)"
        )));
    }
    let opaque = params
        .iter()
        .find(|(k, _)| k == "opaque")
        .map(|(_, v)| v.clone());

    let uri = request_uri(url);
    let cnonce = {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seed = format!("{nonce}:{nanos}");
        hex(&Sha256::digest(seed.as_bytes()))[..16].to_string()
    };
    let nc = "00000001";

    let ha1 = hex(&Sha256::digest(format!("{user}:{realm}:{password}").as_bytes()));
    let ha2 = hex(&Sha256::digest(format!("POST:{uri}").as_bytes()));
    let response = hex(&Sha256::digest(
        format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}").as_bytes(),
    ));

    let mut header = format!(
        "Digest username=\"{user}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", \
         qop=auth, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\", algorithm=SHA-256"
    );
    if let Some(opaque) = opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    Ok(header)
}

/// Split a `Digest k=v, k="v"` challenge into key/value pairs.
fn parse_challenge(challenge: &str) -> Vec<(String, String)> {
    let body = challenge
        .trim_start()
        .strip_prefix("Digest")
        .unwrap_or(challenge);
    let mut params = Vec::new();
    let mut rest = body.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest.get(end..).unwrap_or("");
        }
        rest = rest.trim_start_matches(',').trim_start();
        params.push((key, value));
    }
    params
}

/// The request-uri for the digest hash: path and beyond, scheme and
/// authority stripped.
fn request_uri(url: &str) -> String {
    let after_scheme = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match after_scheme.find('/') {
        Some(i) => after_scheme[i..].to_string(),
        None => "/".to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
