//! Unified request error model and mapping helpers.
//! This module provides the error kinds surfaced at the HTTP boundary along
//! with mappers to HTTP status codes and RESTCONF error-tag / error body
//! framing (RFC 8040 "ietf-restconf:errors").

use serde_json::json;
use std::fmt::{Display, Formatter};

/// Error kinds surfaced at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request body could not be parsed.
    MalformedBody,
    /// A parameter or value in the request is invalid.
    InvalidValue,
    /// The schema forbids reading or writing the addressed node.
    AccessDenied,
    /// The path does not resolve to a schema node or stored data.
    NotFound,
    /// The method (or a list-key update) is not supported on this node.
    NotSupported,
    /// Unknown request or response media type.
    UnsupportedMedia,
    /// Concurrent create conflict (compare-and-swap failed).
    DataExists,
    /// A conditional request header precondition failed.
    PreconditionFailed,
    /// A scripted operation reported failure.
    OperationFailed,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::MalformedBody => 400,
            ErrorKind::InvalidValue => 400,
            ErrorKind::OperationFailed => 400,
            ErrorKind::AccessDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::NotSupported => 405,
            ErrorKind::DataExists => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::UnsupportedMedia => 415,
            ErrorKind::Internal => 500,
        }
    }

    /// RESTCONF error-tag for this kind.
    pub fn error_tag(self) -> &'static str {
        match self {
            ErrorKind::MalformedBody | ErrorKind::UnsupportedMedia => "malformed-message",
            ErrorKind::InvalidValue | ErrorKind::NotFound => "invalid-value",
            ErrorKind::AccessDenied => "access-denied",
            ErrorKind::NotSupported => "operation-not-supported",
            ErrorKind::DataExists => "data-exists",
            ErrorKind::PreconditionFailed | ErrorKind::OperationFailed | ErrorKind::Internal => {
                "operation-failed"
            }
        }
    }

    /// RESTCONF error-type: protocol for authorisation failures, application
    /// for everything else.
    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::AccessDenied => "protocol",
            _ => "application",
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            ErrorKind::MalformedBody => "malformed request syntax",
            ErrorKind::InvalidValue => "Invalid input parameter",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::NotFound => "uri path not found",
            ErrorKind::NotSupported => "requested operation is not supported",
            ErrorKind::UnsupportedMedia => "unsupported media type",
            ErrorKind::DataExists => "object already exists",
            ErrorKind::PreconditionFailed => "object modified",
            ErrorKind::OperationFailed => "operation failed",
            ErrorKind::Internal => "internal error",
        }
    }
}

/// Error carried through the request pipeline. Wraps a kind plus an optional
/// handler-supplied message (RPC handlers may return their own text).
#[derive(Debug, Clone)]
pub struct RestError {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

impl RestError {
    pub fn new(kind: ErrorKind) -> Self {
        RestError { kind, message: None }
    }

    pub fn with_message<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        RestError { kind, message: Some(message.into()) }
    }

    pub fn malformed() -> Self { Self::new(ErrorKind::MalformedBody) }
    pub fn invalid() -> Self { Self::new(ErrorKind::InvalidValue) }
    pub fn access_denied() -> Self { Self::new(ErrorKind::AccessDenied) }
    pub fn not_found() -> Self { Self::new(ErrorKind::NotFound) }
    pub fn not_supported() -> Self { Self::new(ErrorKind::NotSupported) }
    pub fn data_exists() -> Self { Self::new(ErrorKind::DataExists) }
    pub fn precondition_failed() -> Self { Self::new(ErrorKind::PreconditionFailed) }
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::with_message(ErrorKind::Internal, message)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.kind.default_message())
    }

    /// Serialised RESTCONF error body:
    /// `{"ietf-restconf:errors":{"error":[{error-type, error-tag, error-message}]}}`
    pub fn restconf_body(&self) -> serde_json::Value {
        json!({
            "ietf-restconf:errors": {
                "error": [{
                    "error-type": self.kind.error_type(),
                    "error-tag": self.kind.error_tag(),
                    "error-message": self.message(),
                }]
            }
        })
    }
}

impl Display for RestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.error_tag(), self.message())
    }
}

impl std::error::Error for RestError {}

pub type RestResult<T> = Result<T, RestError>;
