//! Error types for the WBEM client.
//!
//! # Design
//! `Cim` gets a dedicated variant because callers frequently distinguish
//! "the server processed the request and rejected it" (a CIM status code)
//! from transport-level failures. Everything the client can raise is one of
//! these variants; nothing is swallowed or downgraded. Local precondition
//! violations surface as `Model` before any bytes go on the wire.

use std::fmt;

use crate::model::CimInstance;

/// A server-reported CIM status, carried by an `<ERROR>` element.
///
/// `instances` holds any nested `<INSTANCE>` error detail the server chose
/// to attach (typically `CIM_Error` instances).
#[derive(Debug, Clone, PartialEq)]
pub struct CimError {
    pub code: u32,
    pub description: String,
    pub instances: Vec<CimInstance>,
}

impl CimError {
    pub fn new(code: u32, description: &str) -> Self {
        Self {
            code,
            description: description.to_string(),
            instances: Vec::new(),
        }
    }

    /// The DMTF mnemonic for this status code, or `"CIM_ERR_UNKNOWN"` for
    /// codes outside the table in DSP0200.
    pub fn status_code_name(&self) -> &'static str {
        match self.code {
            1 => "CIM_ERR_FAILED",
            2 => "CIM_ERR_ACCESS_DENIED",
            3 => "CIM_ERR_INVALID_NAMESPACE",
            4 => "CIM_ERR_INVALID_PARAMETER",
            5 => "CIM_ERR_INVALID_CLASS",
            6 => "CIM_ERR_NOT_FOUND",
            7 => "CIM_ERR_NOT_SUPPORTED",
            8 => "CIM_ERR_CLASS_HAS_CHILDREN",
            9 => "CIM_ERR_CLASS_HAS_INSTANCES",
            10 => "CIM_ERR_INVALID_SUPERCLASS",
            11 => "CIM_ERR_ALREADY_EXISTS",
            12 => "CIM_ERR_NO_SUCH_PROPERTY",
            13 => "CIM_ERR_TYPE_MISMATCH",
            14 => "CIM_ERR_QUERY_LANGUAGE_NOT_SUPPORTED",
            15 => "CIM_ERR_INVALID_QUERY",
            16 => "CIM_ERR_METHOD_NOT_AVAILABLE",
            17 => "CIM_ERR_METHOD_NOT_FOUND",
            20 => "CIM_ERR_NAMESPACE_NOT_EMPTY",
            21 => "CIM_ERR_INVALID_ENUMERATION_CONTEXT",
            22 => "CIM_ERR_INVALID_OPERATION_TIMEOUT",
            23 => "CIM_ERR_PULL_HAS_BEEN_ABANDONED",
            24 => "CIM_ERR_PULL_CANNOT_BE_ABANDONED",
            25 => "CIM_ERR_FILTERED_ENUMERATION_NOT_SUPPORTED",
            26 => "CIM_ERR_CONTINUATION_ON_ERROR_NOT_SUPPORTED",
            27 => "CIM_ERR_SERVER_LIMITS_EXCEEDED",
            28 => "CIM_ERR_SERVER_IS_SHUTTING_DOWN",
            _ => "CIM_ERR_UNKNOWN",
        }
    }
}

impl fmt::Display for CimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.status_code_name(),
            self.code,
            self.description
        )
    }
}

/// Errors raised by `WbemConnection` operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WbemError {
    /// The server processed the request and returned a CIM status code.
    Cim(CimError),

    /// The connection could not be established, was dropped, or the reply
    /// was not a CIM-XML method response.
    Connection(String),

    /// The server rejected the supplied credentials (HTTP 401) and no
    /// further credential is available.
    Auth(String),

    /// The configured timeout elapsed before the response was received.
    Timeout(String),

    /// The server returned a non-200 HTTP status other than 401.
    Http { status: u16, reason: String },

    /// The response body was not well-formed CIM-XML, or violated the
    /// element/attribute contracts of DSP0201.
    Parse {
        message: String,
        line: u32,
        column: u32,
    },

    /// The response carried a `DTDVERSION` this client does not speak.
    Version(String),

    /// A local precondition was violated; no request was sent.
    Model(String),
}

impl WbemError {
    pub(crate) fn parse_at(message: String, line: u32, column: u32) -> Self {
        WbemError::Parse {
            message,
            line,
            column,
        }
    }

    pub(crate) fn model(message: impl Into<String>) -> Self {
        WbemError::Model(message.into())
    }
}

impl fmt::Display for WbemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WbemError::Cim(e) => write!(f, "server error: {e}"),
            WbemError::Connection(msg) => write!(f, "connection failed: {msg}"),
            WbemError::Auth(msg) => write!(f, "authentication failed: {msg}"),
            WbemError::Timeout(msg) => write!(f, "operation timed out: {msg}"),
            WbemError::Http { status, reason } => {
                write!(f, "HTTP {status}: {reason}")
            }
            WbemError::Parse {
                message,
                line,
                column,
            } => write!(f, "malformed response at {line}:{column}: {message}"),
            WbemError::Version(msg) => write!(f, "unsupported protocol version: {msg}"),
            WbemError::Model(msg) => write!(f, "invalid operation input: {msg}"),
        }
    }
}

impl std::error::Error for WbemError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_match_dmtf_table() {
        let cases = [
            (1, "CIM_ERR_FAILED"),
            (2, "CIM_ERR_ACCESS_DENIED"),
            (3, "CIM_ERR_INVALID_NAMESPACE"),
            (4, "CIM_ERR_INVALID_PARAMETER"),
            (5, "CIM_ERR_INVALID_CLASS"),
            (6, "CIM_ERR_NOT_FOUND"),
            (7, "CIM_ERR_NOT_SUPPORTED"),
            (28, "CIM_ERR_SERVER_IS_SHUTTING_DOWN"),
        ];
        for (code, name) in cases {
            assert_eq!(CimError::new(code, "x").status_code_name(), name);
        }
    }

    #[test]
    fn unassigned_codes_report_unknown() {
        assert_eq!(CimError::new(18, "x").status_code_name(), "CIM_ERR_UNKNOWN");
        assert_eq!(CimError::new(99, "x").status_code_name(), "CIM_ERR_UNKNOWN");
    }

    #[test]
    fn display_includes_mnemonic_and_code() {
        let err = WbemError::Cim(CimError::new(2, "no access"));
        let text = err.to_string();
        assert!(text.contains("CIM_ERR_ACCESS_DENIED"));
        assert!(text.contains("(2)"));
        assert!(text.contains("no access"));
    }
}
